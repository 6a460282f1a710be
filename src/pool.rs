//! Remote connection pool.
//!
//! One live connection per `(protocol, host, port)` endpoint, created
//! lazily and kept for the rest of the process. The VFD layer never closes
//! pooled connections; remote handles borrow them by reference count.

use std::rc::Rc;

use dfs_client::{DfsConnection, DfsConnector, DfsError};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::error::{FdError, FdResult};
use crate::path::RemotePath;

pub(crate) struct DfsPool {
    connector: Box<dyn DfsConnector>,
    connections: FxHashMap<String, Rc<dyn DfsConnection>>,
}

impl DfsPool {
    pub fn new(connector: Box<dyn DfsConnector>) -> Self {
        Self {
            connector,
            connections: FxHashMap::default(),
        }
    }

    /// Fetch the pooled connection for `remote`, dialing it on first use.
    /// Failed dials are not cached; the next caller retries.
    pub fn get(&mut self, remote: &RemotePath<'_>) -> FdResult<Rc<dyn DfsConnection>> {
        let endpoint = remote.endpoint();
        if let Some(conn) = self.connections.get(&endpoint) {
            return Ok(Rc::clone(conn));
        }

        debug!(protocol = remote.protocol, %endpoint, "connecting to remote filesystem");
        let conn = self
            .connector
            .connect(remote.protocol, remote.host, remote.port)
            .map_err(|e| {
                warn!(%endpoint, error = %e, "failed to connect to remote filesystem");
                FdError::from(e)
            })?;
        self.connections.insert(endpoint, Rc::clone(&conn));
        Ok(conn)
    }
}

/// Connector used when no remote backend is wired in: every dial fails.
pub(crate) struct NoRemote;

impl DfsConnector for NoRemote {
    fn connect(
        &self,
        _protocol: &str,
        host: &str,
        port: u16,
    ) -> Result<Rc<dyn DfsConnection>, DfsError> {
        Err(DfsError::Unreachable(format!("{host}:{port}")))
    }
}
