//! Open-flag and per-slot state bitsets.

use bitflags::bitflags;

bitflags! {
    /// `open(2)` flags carried by a virtual file descriptor.
    ///
    /// The access mode occupies the low two bits and is not a proper
    /// bitfield; use [`OpenFlags::access_mode`] rather than `contains` to
    /// inspect it.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        // Access modes (mutually exclusive)
        const RDONLY = libc::O_RDONLY;
        const WRONLY = libc::O_WRONLY;
        const RDWR = libc::O_RDWR;

        // Creation/status flags
        const APPEND = libc::O_APPEND;
        const TRUNC = libc::O_TRUNC;
        const CREAT = libc::O_CREAT;
        const EXCL = libc::O_EXCL;

        // Behavior flags
        const NONBLOCK = libc::O_NONBLOCK;
        const SYNC = libc::O_SYNC;
        const DSYNC = libc::O_DSYNC;
        const NOFOLLOW = libc::O_NOFOLLOW;
        const CLOEXEC = libc::O_CLOEXEC;
    }
}

impl OpenFlags {
    /// The two-bit access mode: `O_RDONLY`, `O_WRONLY` or `O_RDWR`.
    pub fn access_mode(self) -> i32 {
        self.bits() & libc::O_ACCMODE
    }

    /// Whether the flags select write access. Mirrors the `O_WRONLY` test
    /// the remote backend keys its append/replica behavior on.
    pub fn is_write(self) -> bool {
        self.access_mode() == libc::O_WRONLY
    }

    /// Flags safe for transparently re-opening a local file: creation-time
    /// bits must not fire again.
    pub fn sanitize_local(self) -> Self {
        self - (Self::CREAT | Self::TRUNC | Self::EXCL)
    }

    /// Flags safe for re-opening a remote file.
    ///
    /// `O_APPEND` is forced *after* the creation bits are stripped: remote
    /// re-opens always append to the existing file, which makes remote
    /// slots unusable for non-appending writes. The re-open protocol
    /// depends on this (it verifies `tell == seek_pos` on write handles).
    pub fn sanitize_remote(self) -> Self {
        self.sanitize_local() | Self::APPEND
    }
}

bitflags! {
    /// Lifecycle state of one VFD slot.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub(crate) struct VfdState: u16 {
        /// Unlink the underlying path when the slot is closed.
        const TEMPORARY = 1 << 0;
        /// Close the slot when the transaction that created it ends.
        const CLOSE_AT_EOXACT = 1 << 1;
    }
}
