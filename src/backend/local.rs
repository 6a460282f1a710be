//! Local POSIX back-end.

use std::fs::{File, OpenOptions};
use std::io::{Read as _, Seek as _, SeekFrom, Write as _};
use std::os::fd::IntoRawFd as _;
use std::os::unix::fs::OpenOptionsExt as _;
use std::path::Path;

use tracing::warn;

use crate::config::SyncMethod;
use crate::flags::OpenFlags;

/// Translate `open(2)`-style flags into `OpenOptions`.
///
/// The access mode is decoded from the low bits; remaining behavior flags
/// are passed through verbatim.
fn open_options(flags: OpenFlags, mode: u32) -> OpenOptions {
    let mut opts = OpenOptions::new();

    let (read, write) = match flags.access_mode() {
        libc::O_WRONLY => (false, true),
        libc::O_RDWR => (true, true),
        _ => (true, false),
    };
    let append = flags.contains(OpenFlags::APPEND);

    opts.read(read)
        .write(write && !append)
        .append(append)
        .truncate(flags.contains(OpenFlags::TRUNC))
        .create(flags.contains(OpenFlags::CREAT))
        .create_new(flags.contains(OpenFlags::CREAT | OpenFlags::EXCL))
        .mode(mode)
        .custom_flags(
            (flags
                - (OpenFlags::APPEND
                    | OpenFlags::TRUNC
                    | OpenFlags::CREAT
                    | OpenFlags::EXCL))
                .bits()
                & !libc::O_ACCMODE,
        );

    opts
}

/// Open a local file. The caller is responsible for descriptor-budget
/// enforcement and any evict-and-retry policy.
pub(crate) fn open(path: &Path, flags: OpenFlags, mode: u32) -> std::io::Result<File> {
    open_options(flags, mode).open(path)
}

/// Whether an open failure means the process or system descriptor table is
/// full, i.e. eviction might help.
pub(crate) fn is_fd_exhaustion(e: &std::io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

/// `read(2)` at the kernel cursor. Retries `EINTR` when the caller opts
/// in.
pub(crate) fn read(file: &mut File, buf: &mut [u8], retry_intr: bool) -> std::io::Result<usize> {
    loop {
        match file.read(buf) {
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted && retry_intr => {}
            other => return other,
        }
    }
}

/// `write(2)` at the kernel cursor. Retries `EINTR` unconditionally; a
/// short count with no reported error is promoted to `ENOSPC`, since the
/// kernel's only silent reason to stop early is a full disk.
pub(crate) fn write(file: &mut File, buf: &[u8]) -> std::io::Result<usize> {
    loop {
        match file.write(buf) {
            Ok(n) if n != buf.len() => {
                return Err(std::io::Error::from_raw_os_error(libc::ENOSPC));
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            other => return other,
        }
    }
}

/// `lseek64` with any whence. Returns the resulting position.
pub(crate) fn seek(file: &mut File, pos: SeekFrom) -> std::io::Result<i64> {
    file.seek(pos).map(|p| p as i64)
}

/// The kernel cursor position.
pub(crate) fn tell(file: &mut File) -> std::io::Result<i64> {
    seek(file, SeekFrom::Current(0))
}

/// `ftruncate` to `len` bytes.
pub(crate) fn truncate(file: &File, len: u64) -> std::io::Result<()> {
    file.set_len(len)
}

/// Flush to stable storage per the configured method. A no-op when fsync
/// is disabled.
pub(crate) fn sync(file: &File, method: SyncMethod, enable_fsync: bool) -> std::io::Result<()> {
    if !enable_fsync {
        return Ok(());
    }
    match method {
        SyncMethod::Fsync => file.sync_all(),
        SyncMethod::Fdatasync => file.sync_data(),
        SyncMethod::FsyncWritethrough => {
            #[cfg(target_os = "macos")]
            {
                use std::os::fd::AsRawFd as _;
                nix::fcntl::fcntl(file.as_raw_fd(), nix::fcntl::FcntlArg::F_FULLFSYNC)
                    .map(|_| ())
                    .map_err(std::io::Error::from)
            }
            #[cfg(not(target_os = "macos"))]
            {
                file.sync_all()
            }
        }
    }
}

/// Close a descriptor, retrying `EINTR`. An interrupted close that is not
/// retried would make a later unlink of the file fail.
pub(crate) fn close_reporting(file: File) -> std::io::Result<()> {
    let fd = file.into_raw_fd();
    loop {
        match nix::unistd::close(fd) {
            Err(nix::errno::Errno::EINTR) => {}
            Err(e) => return Err(e.into()),
            Ok(()) => return Ok(()),
        }
    }
}

/// [`close_reporting`] for paths where a close failure can only be logged.
pub(crate) fn close(file: File) {
    if let Err(e) = close_reporting(file) {
        warn!(error = %e, "close failed");
    }
}
