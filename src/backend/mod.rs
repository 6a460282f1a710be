//! Storage back-ends.
//!
//! Two implementations of the open/read/write/seek/close/sync/truncate
//! contract: the host POSIX file system and a remote distributed file
//! system reached through `dfs-client`. The façade picks one per handle at
//! open time and never mixes them afterwards.

pub(crate) mod local;
pub(crate) mod remote;
