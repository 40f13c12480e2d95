//! Watch configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{WatchError, WatchResult};
use crate::monitor::ColumnNames;
use crate::transport::Endpoint;

/// Settings for a [`ConnectionManager`](crate::ConnectionManager).
///
/// Every field has a default, so a JSON file only needs the keys it changes:
///
/// ```
/// use vrswatch::WatchConfig;
///
/// let cfg = WatchConfig::from_json_str(r#"{"endpoint": "unix:/var/run/openvswitch/db.sock"}"#).unwrap();
/// assert_eq!(cfg.table, "Nuage_Port_Table");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Server to connect to.
    pub endpoint: Endpoint,
    /// Database holding the port table.
    pub database: String,
    /// Table watched by `wait_for_row_resolution`.
    pub table: String,
    /// Column names read from each port row.
    pub columns: ColumnNames,
    /// Fixed delay between connection attempts.
    pub retry_interval_ms: u64,
    /// Deadline for a single JSON-RPC request.
    pub rpc_timeout_ms: u64,
    /// Max queued batches between the transport and the dispatcher.
    pub inbound_capacity: usize,
    /// Per-subscriber stream buffer capacity.
    pub subscriber_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            database: "Open_vSwitch".to_string(),
            table: "Nuage_Port_Table".to_string(),
            columns: ColumnNames::default(),
            retry_interval_ms: 5_000,
            rpc_timeout_ms: 10_000,
            inbound_capacity: 1024,
            subscriber_capacity: 256,
        }
    }
}

impl WatchConfig {
    /// Parse a JSON document and validate it.
    pub fn from_json_str(input: &str) -> WatchResult<Self> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| WatchError::InvalidConfig {
            reason: e.to_string(),
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read and validate a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> WatchResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| WatchError::InvalidConfig {
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        Self::from_json_str(&raw)
    }

    /// Reject empty names and zero intervals or capacities.
    ///
    /// # Errors
    /// `InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> WatchResult<()> {
        let invalid = |reason: &str| {
            Err(WatchError::InvalidConfig {
                reason: reason.to_string(),
            })
        };

        if self.database.is_empty() {
            return invalid("database must not be empty");
        }
        if self.table.is_empty() {
            return invalid("table must not be empty");
        }
        let c = &self.columns;
        if [&c.name, &c.address, &c.gateway, &c.mask].iter().any(|n| n.is_empty()) {
            return invalid("column names must not be empty");
        }
        if self.retry_interval_ms == 0 {
            return invalid("retry_interval_ms must be > 0");
        }
        if self.rpc_timeout_ms == 0 {
            return invalid("rpc_timeout_ms must be > 0");
        }
        if self.inbound_capacity == 0 || self.subscriber_capacity == 0 {
            return invalid("channel capacities must be > 0");
        }
        Ok(())
    }

    /// Delay between reconnect attempts.
    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Deadline for a single RPC round trip.
    #[must_use]
    pub const fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_vrs_deployment() {
        let cfg = WatchConfig::default();
        assert_eq!(cfg.endpoint.to_string(), "tcp:127.0.0.1:6640");
        assert_eq!(cfg.database, "Open_vSwitch");
        assert_eq!(cfg.retry_interval(), Duration::from_secs(5));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let cfg = WatchConfig::from_json_str(r#"{"retry_interval_ms": 250, "columns": {"address": "ipv4"}}"#).unwrap();
        assert_eq!(cfg.retry_interval_ms, 250);
        assert_eq!(cfg.columns.address, "ipv4");
        assert_eq!(cfg.columns.gateway, "gateway");
        assert_eq!(cfg.table, "Nuage_Port_Table");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = WatchConfig::from_json_str(r#"{"retry_interval_ms": 0}"#).unwrap_err();
        assert!(matches!(err, WatchError::InvalidConfig { .. }));

        let err = WatchConfig::from_json_str(r#"{"endpoint": "ftp:x"}"#).unwrap_err();
        assert!(matches!(err, WatchError::InvalidConfig { .. }));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"endpoint": "unix:/tmp/db.sock", "table": "Ports"}}"#).unwrap();

        let cfg = WatchConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.endpoint, Endpoint::unix("/tmp/db.sock"));
        assert_eq!(cfg.table, "Ports");
    }
}
