//! Error type shared by all backend implementations.

use thiserror::Error;

/// Errors surfaced by a distributed file system backend.
#[derive(Debug, Error)]
pub enum DfsError {
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("file or directory already exists: {0}")]
    AlreadyExists(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("operation not supported by handle: {0}")]
    Unsupported(&'static str),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl DfsError {
    /// Map onto the closest `errno` value, for callers that publish a
    /// POSIX-flavored error surface.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Unreachable(_) => libc::EHOSTUNREACH,
            Self::NotFound(_) => libc::ENOENT,
            Self::AlreadyExists(_) => libc::EEXIST,
            Self::PermissionDenied(_) => libc::EACCES,
            Self::Unsupported(_) => libc::EOPNOTSUPP,
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}
