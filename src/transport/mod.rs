//! Transport boundary.
//!
//! These traits describe what the monitor needs from an OVSDB connection:
//! a cached schema, a monitor call that returns the initial snapshot, and a
//! callback object that receives every subsequent change batch. Two
//! implementations ship with the crate: [`jsonrpc`] talks RFC 7047 JSON-RPC
//! over TCP or a Unix socket, [`memory`] is an in-process fake for tests and
//! embedding.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::TransportError;
use crate::monitor::MonitorRequest;
use crate::row::TableUpdates;
use crate::schema::DatabaseSchema;

/// JSON-RPC socket transport.
pub mod jsonrpc;
/// In-memory transport.
pub mod memory;

pub use jsonrpc::JsonRpcConnector;
pub use memory::{InMemoryConnector, InMemoryServer};

/// Receives asynchronous notifications from a session.
///
/// Only `on_update` and `on_disconnected` carry information the monitor
/// acts on; the remaining callbacks default to no-ops.
pub trait UpdateHandler: Send + Sync {
    /// A change batch for the monitor identified by `context`.
    fn on_update(&self, context: &serde_json::Value, updates: TableUpdates);

    /// The session was lost.
    fn on_disconnected(&self) {}

    #[allow(missing_docs)]
    fn on_locked(&self, _ids: &[serde_json::Value]) {}

    #[allow(missing_docs)]
    fn on_stolen(&self, _ids: &[serde_json::Value]) {}

    #[allow(missing_docs)]
    fn on_echo(&self, _args: &[serde_json::Value]) {}
}

/// A live connection to an OVSDB server.
pub trait Session: Send + Sync {
    /// The schema the server advertised for `database`, cached at connect time.
    fn schema(&self, database: &str) -> Option<&DatabaseSchema>;

    /// Register the recipient of asynchronous notifications, replacing any previous one.
    fn register(&self, handler: Arc<dyn UpdateHandler>);

    /// Issue a monitor request and return the initial snapshot.
    fn monitor(
        &self,
        database: &str,
        context: serde_json::Value,
        requests: &BTreeMap<String, MonitorRequest>,
    ) -> Result<TableUpdates, TransportError>;

    /// Close the session. Idempotent.
    fn disconnect(&self);
}

/// Opens sessions.
pub trait Connector: Send + Sync {
    /// Establish a session with the server at `endpoint`.
    fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Session>, TransportError>;
}

/// Where the OVSDB server listens, in OVS remote syntax.
///
/// ```
/// use vrswatch::transport::Endpoint;
///
/// let tcp: Endpoint = "tcp:127.0.0.1:6640".parse().unwrap();
/// assert_eq!(tcp, Endpoint::tcp("127.0.0.1", 6640));
///
/// let unix: Endpoint = "unix:/var/run/openvswitch/db.sock".parse().unwrap();
/// assert_eq!(unix.to_string(), "unix:/var/run/openvswitch/db.sock");
/// ```
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl Endpoint {
    /// `tcp:HOST:PORT`.
    #[must_use]
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// `unix:PATH`.
    #[must_use]
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix(path.into())
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::tcp("127.0.0.1", 6640)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } if host.contains(':') => write!(f, "tcp:[{host}]:{port}"),
            Self::Tcp { host, port } => write!(f, "tcp:{host}:{port}"),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Failure parsing an [`Endpoint`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid endpoint '{input}': {reason}")]
pub struct EndpointParseError {
    input: String,
    reason: &'static str,
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| EndpointParseError {
            input: s.to_string(),
            reason,
        };

        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(err("missing socket path"));
            }
            return Ok(Self::unix(path));
        }

        let rest = s.strip_prefix("tcp:").ok_or_else(|| err("expected 'tcp:' or 'unix:' prefix"))?;
        let (host, port) = rest.rsplit_once(':').ok_or_else(|| err("expected HOST:PORT"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(err("missing host"));
        }
        let port = port.parse::<u16>().map_err(|_| err("invalid port"))?;
        Ok(Self::tcp(host, port))
    }
}

impl TryFrom<String> for Endpoint {
    type Error = EndpointParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(value: Endpoint) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse_tcp() {
        let ep: Endpoint = "tcp:localhost:6640".parse().unwrap();
        assert_eq!(ep, Endpoint::tcp("localhost", 6640));
    }

    #[test]
    fn test_endpoint_parse_ipv6() {
        let ep: Endpoint = "tcp:[::1]:6640".parse().unwrap();
        assert_eq!(ep, Endpoint::tcp("::1", 6640));
        assert_eq!(ep.to_string(), "tcp:[::1]:6640");
    }

    #[test]
    fn test_endpoint_parse_errors() {
        assert!("localhost:6640".parse::<Endpoint>().is_err());
        assert!("tcp:localhost".parse::<Endpoint>().is_err());
        assert!("tcp:localhost:notaport".parse::<Endpoint>().is_err());
        assert!("unix:".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_endpoint_serde_as_string() {
        let ep = Endpoint::unix("/tmp/db.sock");
        let encoded = serde_json::to_string(&ep).unwrap();
        assert_eq!(encoded, "\"unix:/tmp/db.sock\"");
        let decoded: Endpoint = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, ep);
    }
}
