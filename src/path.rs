//! Path router: classifies paths as local or remote and picks them apart.
//!
//! Remote paths follow `<protocol>://[{replica=N}]<host>:<port>/<path>`.
//! Anything prefixed `local://`, or containing no scheme separator at all,
//! is local.

use crate::error::{FdError, FdResult};

/// Scheme separator between protocol and endpoint.
const SCHEME_SEP: &str = "://";

/// Prefix that forces local classification.
const LOCAL_PREFIX: &str = "local://";

/// Replication factor used when a remote path carries no `replica` option.
pub(crate) const DEFAULT_REPLICA: u16 = 3;

/// The pieces of a well-formed remote path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RemotePath<'a> {
    pub protocol: &'a str,
    pub host: &'a str,
    pub port: u16,
    /// Replication factor requested via `{replica=N}`, or the default.
    pub replica: u16,
}

impl RemotePath<'_> {
    /// Pool key for the endpoint this path names.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Returns true when `path` names the local file system.
pub(crate) fn is_local(path: &str) -> bool {
    path.starts_with(LOCAL_PREFIX) || !path.contains(SCHEME_SEP)
}

/// The form of a local path the OS understands: a bare path, or the
/// remainder of a `local://` URI.
pub(crate) fn native_local(path: &str) -> &str {
    path.strip_prefix(LOCAL_PREFIX).unwrap_or(path)
}

fn invalid(path: &str, reason: &'static str) -> FdError {
    FdError::InvalidPath {
        path: path.to_owned(),
        reason,
    }
}

/// Parse a remote path into protocol, options and endpoint.
pub(crate) fn parse_remote(path: &str) -> FdResult<RemotePath<'_>> {
    let (protocol, rest) = path
        .split_once(SCHEME_SEP)
        .ok_or_else(|| invalid(path, "no filesystem protocol found"))?;
    if protocol.is_empty() {
        return Err(invalid(path, "empty filesystem protocol"));
    }

    // Skip an options block, remembering any replica= it carries.
    let mut replica = DEFAULT_REPLICA;
    let rest = if let Some(options) = rest.strip_prefix('{') {
        let (body, tail) = options
            .split_once('}')
            .ok_or_else(|| invalid(path, "unterminated options block"))?;
        if let Some(value) = body.strip_prefix("replica=") {
            replica = value
                .parse()
                .map_err(|_| invalid(path, "bad replica option"))?;
        }
        tail
    } else {
        rest
    };

    let authority = rest.split('/').next().unwrap_or(rest);
    let (host, port) = authority
        .split_once(':')
        .ok_or_else(|| invalid(path, "cannot find port"))?;
    if host.is_empty() {
        return Err(invalid(path, "empty host"));
    }
    let port: u32 = port.parse().map_err(|_| invalid(path, "cannot find port"))?;
    if !(1..65536).contains(&port) {
        return Err(invalid(path, "port out of range"));
    }

    Ok(RemotePath {
        protocol,
        host,
        port: port as u16,
        replica,
    })
}

/// Convert a remote path to the backend's native form: the substring from
/// the first `/` after the `host:port` segment.
pub(crate) fn to_unix_path(path: &str) -> FdResult<&str> {
    let (_, rest) = path
        .split_once(SCHEME_SEP)
        .ok_or_else(|| invalid(path, "no filesystem protocol found"))?;
    let start = rest
        .find('/')
        .ok_or_else(|| invalid(path, "cannot convert path into unix format"))?;
    Ok(&rest[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_paths_are_local() {
        assert!(is_local("base/1234/pgsql_tmp/f"));
        assert!(is_local("/absolute/path"));
        assert!(is_local("local:///var/data/f"));
        assert!(!is_local("hdfs://h:9000/f"));
    }

    #[test]
    fn native_local_strips_scheme() {
        assert_eq!(native_local("local:///var/data/f"), "/var/data/f");
        assert_eq!(native_local("relative/p"), "relative/p");
    }

    #[test]
    fn parses_plain_remote_path() {
        let r = parse_remote("hdfs://namenode:9000/user/gp/seg0").unwrap();
        assert_eq!(r.protocol, "hdfs");
        assert_eq!(r.host, "namenode");
        assert_eq!(r.port, 9000);
        assert_eq!(r.replica, DEFAULT_REPLICA);
        assert_eq!(r.endpoint(), "namenode:9000");
    }

    #[test]
    fn parses_replica_option() {
        let r = parse_remote("hdfs://{replica=2}h:9000/f").unwrap();
        assert_eq!(r.replica, 2);
        assert_eq!(r.host, "h");
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(parse_remote("hdfs://h/f").is_err());
        assert!(parse_remote("hdfs://h:0/f").is_err());
        assert!(parse_remote("hdfs://h:70000/f").is_err());
        assert!(parse_remote("hdfs://h:port/f").is_err());
        assert!(parse_remote("hdfs://{replica=2h:9000/f").is_err());
        assert!(parse_remote("://h:9000/f").is_err());
    }

    #[test]
    fn unix_path_is_suffix_after_authority() {
        assert_eq!(to_unix_path("hdfs://h:9000/user/f").unwrap(), "/user/f");
        assert_eq!(to_unix_path("hdfs://{replica=2}h:9000/f").unwrap(), "/f");
        assert!(to_unix_path("hdfs://h:9000").is_err());
    }
}
