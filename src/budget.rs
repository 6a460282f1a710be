//! Kernel file-descriptor budget.
//!
//! The OS descriptor limit is probed once at startup by dup'ing stdin
//! until failure; everything this layer opens afterwards must fit under
//! `max_safe_fds`, with eviction as the only relief valve.

use std::os::fd::{AsFd, AsRawFd, OwnedFd};

use tracing::{debug, warn};

use crate::error::{FdError, FdResult};

/// Descriptors left free for code that opens files without consulting this
/// layer (dynamic loader, `system(3)`, and so on).
pub(crate) const NUM_RESERVED_FDS: usize = 10;

/// If fewer than this many usable descriptors remain after reserving the
/// slop, refuse to run.
pub(crate) const FD_MINFREE: usize = 10;

/// Conservative ceiling used until [`FdBudget::set_max_safe_fds`] probes
/// the real one.
const DEFAULT_MAX_SAFE_FDS: usize = 32;

#[derive(Debug)]
pub(crate) struct FdBudget {
    max_safe_fds: usize,
}

impl Default for FdBudget {
    fn default() -> Self {
        Self {
            max_safe_fds: DEFAULT_MAX_SAFE_FDS,
        }
    }
}

/// Count how many descriptors the system will let us open, and estimate
/// how many are already open. Stops probing after `max_to_probe`
/// successes; the released probes leave descriptor usage unchanged.
fn count_usable_fds(max_to_probe: usize) -> (usize, usize) {
    let stdin = std::io::stdin();
    let mut probes: Vec<OwnedFd> = Vec::new();
    let mut highest = 0;

    while probes.len() < max_to_probe {
        match stdin.as_fd().try_clone_to_owned() {
            Ok(fd) => {
                highest = highest.max(fd.as_raw_fd());
                probes.push(fd);
            }
            Err(e) => {
                let errno = e.raw_os_error();
                if errno != Some(libc::EMFILE) && errno != Some(libc::ENFILE) {
                    warn!(successes = probes.len(), error = %e, "dup(0) failed unexpectedly");
                }
                break;
            }
        }
    }

    let usable = probes.len();
    // The limit is highest+1 (0 is a legal descriptor), so whatever of
    // that range we could not dup into must already be open.
    let already_open = (highest as usize + 1).saturating_sub(usable);
    (usable, already_open)
}

impl FdBudget {
    /// Descriptors this layer may hold open at once (VFDs plus allocated
    /// descs together).
    pub fn max_safe_fds(&self) -> usize {
        self.max_safe_fds
    }

    /// Probe the OS and settle `max_safe_fds` for the life of the process.
    ///
    /// Fails when the environment leaves too few descriptors to operate;
    /// callers should treat that as fatal at startup.
    pub fn set_max_safe_fds(&mut self, max_files_per_process: usize) -> FdResult<()> {
        let (usable, already_open) = count_usable_fds(max_files_per_process);

        let allowed = usable
            .min(max_files_per_process.saturating_sub(already_open))
            .saturating_sub(NUM_RESERVED_FDS);

        if allowed < FD_MINFREE {
            return Err(FdError::InsufficientFileHandles {
                usable: allowed + NUM_RESERVED_FDS,
                need: FD_MINFREE + NUM_RESERVED_FDS,
            });
        }

        self.max_safe_fds = allowed;
        debug!(
            max_safe_fds = self.max_safe_fds,
            usable, already_open, "settled descriptor budget"
        );
        Ok(())
    }

    /// Pin the budget to an explicit value instead of probing.
    ///
    /// Meant for tests and embedded callers that manage the real limit
    /// themselves, so the [`FD_MINFREE`] startup floor does not apply;
    /// normal startup goes through
    /// [`set_max_safe_fds`](Self::set_max_safe_fds).
    pub fn pin_max_safe_fds(&mut self, limit: usize) -> FdResult<()> {
        if limit == 0 {
            return Err(FdError::InsufficientFileHandles {
                usable: 0,
                need: 1,
            });
        }
        self.max_safe_fds = limit;
        Ok(())
    }
}
