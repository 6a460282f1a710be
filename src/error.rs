//! Error surface of the VFD layer.

use dfs_client::DfsError;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type FdResult<T> = Result<T, FdError>;

/// Errors returned by VFD operations.
///
/// Invalid handles (out-of-range indices, indices naming a free slot) are
/// programmer errors rather than members of this enum; they trip a
/// `debug_assert!` and surface as `Backend(EBADF)` in release builds.
#[derive(Debug, Error)]
pub enum FdError {
    /// The startup probe left fewer usable descriptors than the layer
    /// needs to run at all.
    #[error("insufficient file handles available: system allows {usable}, need at least {need}")]
    InsufficientFileHandles { usable: usize, need: usize },

    /// No OS descriptor could be acquired even after LRU eviction.
    #[error("out of file handles: {0}")]
    BudgetExhausted(#[source] std::io::Error),

    /// A remote URI failed to parse.
    #[error("invalid path \"{path}\": {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// An error propagated from the local back-end.
    #[error("i/o error: {0}")]
    Backend(#[from] std::io::Error),

    /// An error propagated from the remote back-end.
    #[error("remote backend error: {0}")]
    Remote(#[from] DfsError),

    /// A virtually-open slot could not be physically re-opened.
    #[error("could not reopen file \"{path}\": {source}")]
    Reopen {
        path: String,
        #[source]
        source: Box<FdError>,
    },

    /// After a re-open or truncate-and-reopen, the backend position did
    /// not match the slot's logical position; the file was modified
    /// out-of-band.
    #[error("file \"{path}\" length {actual} does not match logical position {expected}")]
    PositionMismatch {
        path: String,
        expected: i64,
        actual: i64,
    },
}

impl FdError {
    /// The closest `errno` value, for callers that speak POSIX result
    /// codes.
    pub fn errno(&self) -> i32 {
        match self {
            Self::InsufficientFileHandles { .. } | Self::BudgetExhausted(_) => libc::EMFILE,
            Self::InvalidPath { .. } => libc::EINVAL,
            Self::Backend(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Self::Remote(e) => e.errno(),
            Self::Reopen { source, .. } => source.errno(),
            Self::PositionMismatch { .. } => libc::EIO,
        }
    }
}

pub(crate) fn errno_error(errno: i32) -> FdError {
    FdError::Backend(std::io::Error::from_raw_os_error(errno))
}
