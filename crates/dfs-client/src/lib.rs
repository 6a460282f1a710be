//! Client interface for pluggable distributed file system backends.
//!
//! This crate defines only the traits and types the VFD layer consumes; it
//! ships no transport. A concrete backend (HDFS, an object gateway, an
//! in-memory fake for tests) implements [`DfsConnector`], [`DfsConnection`]
//! and [`DfsFile`] and is injected at startup.

mod client;
mod error;

pub use client::{DfsConnection, DfsConnector, DfsFile, DfsFileStatus};
pub use error::DfsError;
