//! Table of allocated descriptors: scoped streams and directory iterators.
//!
//! These are the "everything else" descriptors — short-lived streams and
//! directory scans that still have to count against the kernel descriptor
//! budget and still have to be released at transaction boundaries. The
//! table is deliberately tiny; anything open for a meaningful length of
//! time belongs in the VFD cache instead.

use std::ffi::OsString;

use dfs_client::DfsFileStatus;
use tracing::warn;

use crate::manager::SubXactId;

/// Hard cap on simultaneously allocated descriptors.
pub(crate) const MAX_ALLOCATED_DESCS: usize = 32;

/// Handle to an allocated stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub(crate) u64);

/// Handle to an allocated directory iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirId(pub(crate) u64);

pub(crate) enum DescKind {
    Stream(std::fs::File),
    LocalDir(std::fs::ReadDir),
    RemoteDir {
        /// Eagerly fetched listing; iteration never revisits the backend.
        listing: Vec<DfsFileStatus>,
        cursor: usize,
    },
}

pub(crate) struct AllocatedDesc {
    pub id: u64,
    pub kind: DescKind,
    pub create_subid: SubXactId,
}

pub(crate) struct DescTable {
    descs: Vec<AllocatedDesc>,
    next_id: u64,
    /// Index of the remote dir most recently iterated. Repeat `read_dir`
    /// calls on the same handle hit this without scanning; it is validated
    /// on use, so compaction may leave it stale.
    recent_remote: usize,
}

impl DescTable {
    pub fn new() -> Self {
        Self {
            descs: Vec::new(),
            next_id: 1,
            recent_remote: usize::MAX,
        }
    }

    pub fn len(&self) -> usize {
        self.descs.len()
    }

    /// Whether another descriptor may be allocated under `max_safe_fds`.
    /// One descriptor is always held back so VFD traffic cannot be starved
    /// into an eviction loop.
    pub fn has_room(&self, max_safe_fds: usize) -> bool {
        self.descs.len() < MAX_ALLOCATED_DESCS && self.descs.len() + 1 < max_safe_fds
    }

    pub fn push(&mut self, kind: DescKind, create_subid: SubXactId) -> u64 {
        debug_assert!(self.descs.len() < MAX_ALLOCATED_DESCS);
        let id = self.next_id;
        self.next_id += 1;
        self.descs.push(AllocatedDesc {
            id,
            kind,
            create_subid,
        });
        id
    }

    pub fn stream_mut(&mut self, id: StreamId) -> Option<&mut std::fs::File> {
        self.descs.iter_mut().find(|d| d.id == id.0).and_then(|d| match &mut d.kind {
            DescKind::Stream(file) => Some(file),
            _ => None,
        })
    }

    fn position(&self, id: u64) -> Option<usize> {
        self.descs.iter().position(|d| d.id == id)
    }

    /// Advance a directory iterator and yield the next entry name.
    ///
    /// Local iterators stream from the OS; remote iterators walk the
    /// materialized listing, synthesizing the final path component of each
    /// entry. `path` is only used for error reporting.
    pub fn read_dir(&mut self, id: DirId, path: &str) -> std::io::Result<Option<OsString>> {
        // Fast path: the same remote dir as last time.
        let index = match self.descs.get(self.recent_remote) {
            Some(d) if d.id == id.0 => self.recent_remote,
            _ => match self.position(id.0) {
                Some(i) => i,
                None => {
                    warn!(path, "read_dir on unknown directory handle; programming bug");
                    debug_assert!(false, "read_dir on unknown directory handle");
                    return Err(std::io::Error::from_raw_os_error(libc::EBADF));
                }
            },
        };

        match &mut self.descs[index].kind {
            DescKind::Stream(_) => {
                warn!(path, "read_dir on a stream handle; programming bug");
                debug_assert!(false, "read_dir on a stream handle");
                Err(std::io::Error::from_raw_os_error(libc::EBADF))
            }
            DescKind::LocalDir(read_dir) => match read_dir.next() {
                None => Ok(None),
                Some(Ok(entry)) => Ok(Some(entry.file_name())),
                Some(Err(e)) => Err(e),
            },
            DescKind::RemoteDir { listing, cursor } => {
                self.recent_remote = index;
                let Some(status) = listing.get(*cursor) else {
                    return Ok(None);
                };
                *cursor += 1;
                let name = status
                    .path
                    .rsplit('/')
                    .next()
                    .unwrap_or(status.path.as_str());
                Ok(Some(OsString::from(name)))
            }
        }
    }

    /// Release a descriptor, compacting the table by swapping in the tail.
    /// Returns `false` when the id was not present.
    pub fn free(&mut self, id: u64) -> bool {
        let Some(index) = self.position(id) else {
            return false;
        };
        // Stream and local dir handles close on drop; remote listings are
        // plain memory.
        self.descs.swap_remove(index);
        true
    }

    /// Subtransaction bookkeeping at a subtransaction boundary: on commit
    /// entries move to the parent scope, on abort they are released.
    pub fn at_eosubxact(&mut self, is_commit: bool, my_subid: SubXactId, parent_subid: SubXactId) {
        let mut i = 0;
        while i < self.descs.len() {
            if self.descs[i].create_subid == my_subid {
                if is_commit {
                    self.descs[i].create_subid = parent_subid;
                } else {
                    // Swap-removal pulls a fresh entry into `i`; recheck it.
                    self.descs.swap_remove(i);
                    continue;
                }
            }
            i += 1;
        }
    }

    /// Release everything, regardless of scope.
    pub fn free_all(&mut self) {
        self.descs.clear();
        self.recent_remote = usize::MAX;
    }
}
