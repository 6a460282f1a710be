//! Virtual file descriptor layer.
//!
//! A process that manages a database ends up wanting far more open files
//! than the kernel will give it. This crate multiplexes an unbounded
//! number of logical file handles over a bounded number of kernel
//! descriptors: every handle is a [`File`] index into a slot arena, and
//! the slots that currently hold a real descriptor form an LRU ring.
//! When the budget runs out, the least recently used descriptor is closed
//! behind its handle's back; the next operation transparently reopens the
//! file and restores its position.
//!
//! A slot is *virtually open* from open to close, and *physically open*
//! only while it holds a kernel descriptor or a remote handle. Two
//! back-ends sit behind the same handle type: the host POSIX file system,
//! and a remote distributed file system reached through pooled
//! [`dfs_client`] connections (remote writes are append-only, and remote
//! handles cost no kernel descriptor, so they stay out of the LRU ring).
//!
//! Temporary files tie into the surrounding transaction machinery: they
//! can be unlinked on close, closed at the end of the subtransaction that
//! created them, and are swept at startup if an earlier process left
//! orphans behind.
//!
//! All state lives in one process-lifetime [`FileAccess`] context; the
//! layer is single-threaded and fully synchronous.

mod backend;
mod budget;
mod cache;
mod config;
mod desc;
mod error;
mod flags;
mod manager;
mod path;
mod pool;
mod temp;

pub use cache::File;
pub use config::{ConfigError, FdConfig, SyncMethod};
pub use desc::{DirId, StreamId};
pub use error::{FdError, FdResult};
pub use flags::OpenFlags;
pub use manager::{FileAccess, SubXactId};
