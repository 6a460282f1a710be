//! Traits for pluggable distributed file system backends.

use std::rc::Rc;

use crate::error::DfsError;

/// Metadata for a single remote file or directory, as returned by
/// [`DfsConnection::stat`] and [`DfsConnection::list_directory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfsFileStatus {
    /// Absolute path of the entry on the remote file system.
    pub path: String,
    /// Length in bytes. Zero for directories.
    pub len: u64,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

/// Factory for remote file system connections.
///
/// Implementations are expected to be cheap to call repeatedly with the same
/// endpoint; the caller caches connections itself and treats each returned
/// connection as living for the rest of the process.
pub trait DfsConnector {
    /// Establish a connection to `host:port` speaking `protocol`.
    fn connect(
        &self,
        protocol: &str,
        host: &str,
        port: u16,
    ) -> Result<Rc<dyn DfsConnection>, DfsError>;
}

/// A live connection to one remote file system endpoint.
///
/// Path arguments are native remote paths (no scheme, host or options), as
/// produced by the caller's URI parsing.
pub trait DfsConnection {
    /// Open a file.
    ///
    /// `flags` carries `open(2)`-style bits; the backend honors the access
    /// mode, `O_APPEND` and `O_CREAT` and may ignore the rest. A zero
    /// `buffer_size`, `replication` or `block_size` selects the backend
    /// default. Writes through the returned handle are append-only.
    fn open(
        &self,
        path: &str,
        flags: i32,
        buffer_size: u32,
        replication: u16,
        block_size: u64,
    ) -> Result<Box<dyn DfsFile>, DfsError>;

    /// Remove a file, or a directory tree when `recursive` is set.
    fn delete(&self, path: &str, recursive: bool) -> Result<(), DfsError>;

    /// Create a directory, including missing parents.
    fn mkdir(&self, path: &str) -> Result<(), DfsError>;

    /// Set permission bits on an existing path.
    fn chmod(&self, path: &str, mode: u32) -> Result<(), DfsError>;

    /// Cut a file down to `len` bytes. The file must not be open through
    /// this connection when called.
    fn truncate(&self, path: &str, len: u64) -> Result<(), DfsError>;

    /// List the immediate children of a directory.
    fn list_directory(&self, path: &str) -> Result<Vec<DfsFileStatus>, DfsError>;

    /// Fetch metadata for one path.
    fn stat(&self, path: &str) -> Result<DfsFileStatus, DfsError>;
}

/// An open remote file handle.
///
/// Handles keep their own cursor. Dropping a handle releases it
/// best-effort; callers that care about close errors call [`DfsFile::close`]
/// first.
pub trait DfsFile {
    /// Read up to `buf.len()` bytes at the cursor, advancing it.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DfsError>;

    /// Append `buf` to the file, advancing the cursor. Only valid on
    /// handles opened for writing.
    fn write(&mut self, buf: &[u8]) -> Result<usize, DfsError>;

    /// Reposition the cursor. Only valid on handles opened for reading.
    fn seek(&mut self, pos: u64) -> Result<(), DfsError>;

    /// Current cursor position. For write handles this equals the current
    /// file length.
    fn tell(&self) -> Result<u64, DfsError>;

    /// Make previously written data visible to other readers. No
    /// durability guarantee is implied.
    fn sync(&mut self) -> Result<(), DfsError>;

    /// Release the handle, reporting any backend error.
    fn close(&mut self) -> Result<(), DfsError>;
}
