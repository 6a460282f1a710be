//! Remote back-end over `dfs-client`.

use std::rc::Rc;

use dfs_client::{DfsConnection, DfsFile};
use tracing::warn;

use crate::error::{FdError, FdResult};
use crate::flags::OpenFlags;
use crate::path;
use crate::pool::DfsPool;

/// A physically-open remote file: the handle plus the pooled connection it
/// was opened through. Dropped on eviction; the slot's protocol string and
/// saved flags are enough to reopen later.
pub(crate) struct RemoteHandle {
    pub conn: Rc<dyn DfsConnection>,
    pub file: Box<dyn DfsFile>,
}

/// Open a remote file by its full URI.
///
/// The replication factor from the path options is forwarded only for a
/// create-for-write open; append opens and reads take the backend default.
/// A create additionally syncs the new file and applies `mode`, so a
/// freshly created file is visible with the right permissions before the
/// first write.
pub(crate) fn open(
    pool: &mut DfsPool,
    uri: &str,
    flags: OpenFlags,
    mode: u32,
) -> FdResult<RemoteHandle> {
    let remote = path::parse_remote(uri)?;
    let conn = pool.get(&remote)?;
    let unix_path = path::to_unix_path(uri)?;

    let replication = if flags.is_write() && !flags.contains(OpenFlags::APPEND) {
        remote.replica
    } else {
        0
    };

    let mut file = conn
        .open(unix_path, flags.bits(), 0, replication, 0)
        .map_err(|e| {
            warn!(path = uri, error = %e, "cannot open remote file");
            FdError::from(e)
        })?;

    if flags.contains(OpenFlags::CREAT) {
        let settle = file
            .sync()
            .map_err(|e| {
                warn!(path = uri, error = %e, "cannot sync newly created remote file");
                e
            })
            .and_then(|()| {
                conn.chmod(unix_path, mode).map_err(|e| {
                    warn!(path = uri, mode, error = %e, "cannot set mode on remote file");
                    e
                })
            });
        if let Err(e) = settle {
            let _ = file.close();
            return Err(e.into());
        }
    }

    Ok(RemoteHandle { conn, file })
}

/// Size of a remote file, for `SEEK_END` arithmetic. Goes through the
/// pool so it works whether or not the file is physically open.
pub(crate) fn size(pool: &mut DfsPool, uri: &str) -> FdResult<i64> {
    let remote = path::parse_remote(uri)?;
    let conn = pool.get(&remote)?;
    let unix_path = path::to_unix_path(uri)?;
    let status = conn.stat(unix_path).map_err(FdError::from)?;
    Ok(status.len as i64)
}
