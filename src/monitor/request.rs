//! Monitor request construction.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Which kinds of changes a monitor reports.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorSelect {
    pub initial: bool,
    pub insert: bool,
    pub delete: bool,
    pub modify: bool,
}

/// A `<monitor-request>` for one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorRequest {
    /// Table the request is keyed under; not part of the wire body.
    #[serde(skip)]
    pub table: String,
    /// Columns to report, sorted.
    pub columns: Vec<String>,
    /// Change kinds to report.
    pub select: MonitorSelect,
}

/// Build the monitor request for `table`: initial snapshot plus every later change.
///
/// Inserts and deletes are requested alongside modifications so the row
/// cache serving later subscribers tracks rows created or removed after the
/// monitor starts.
#[must_use]
pub fn build_request(table: &str, columns: &BTreeSet<String>) -> MonitorRequest {
    MonitorRequest {
        table: table.to_string(),
        columns: columns.iter().cloned().collect(),
        select: MonitorSelect {
            initial: true,
            insert: true,
            delete: true,
            modify: true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_request_selects_every_change() {
        let columns: BTreeSet<String> = ["name", "ip_addr"].iter().map(|s| (*s).to_string()).collect();
        let req = build_request("Nuage_Port_Table", &columns);

        assert_eq!(req.table, "Nuage_Port_Table");
        assert_eq!(req.columns, vec!["ip_addr".to_string(), "name".to_string()]);
        assert!(req.select.initial);
        assert!(req.select.modify);
        assert!(req.select.insert);
        assert!(req.select.delete);
    }

    #[test]
    fn test_request_wire_shape() {
        let columns: BTreeSet<String> = std::iter::once("name".to_string()).collect();
        let encoded = serde_json::to_value(build_request("T", &columns)).unwrap();
        assert_eq!(
            encoded,
            json!({
                "columns": ["name"],
                "select": {"initial": true, "insert": true, "delete": true, "modify": true}
            })
        );
    }
}
