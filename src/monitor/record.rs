//! Typed projection of port rows and the resolution predicate.

use serde::{Deserialize, Serialize};

use crate::datum::Datum;
use crate::error::DecodeError;
use crate::row::Row;

/// Names of the columns the projector reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnNames {
    /// Row name column, matched against the watch target.
    pub name: String,
    /// IP address column.
    pub address: String,
    /// Default gateway column.
    pub gateway: String,
    /// Subnet mask column.
    pub mask: String,
}

impl Default for ColumnNames {
    fn default() -> Self {
        Self {
            name: "name".to_string(),
            address: "ip_addr".to_string(),
            gateway: "gateway".to_string(),
            mask: "subnet_mask".to_string(),
        }
    }
}

/// Network parameters assigned to a port. Empty string means unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolutionRecord {
    /// IP address assigned to the port.
    pub address: String,
    /// Default gateway.
    pub gateway: String,
    /// Subnet mask.
    pub mask: String,
    /// Name of the row the values were read from.
    pub row_name: String,
}

impl ResolutionRecord {
    /// Address, gateway and mask are all set.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.address.is_empty() && !self.gateway.is_empty() && !self.mask.is_empty()
    }

    /// Complete, and owned by the row named `target`.
    #[must_use]
    pub fn is_resolved_for(&self, target: &str) -> bool {
        self.is_complete() && self.row_name == target
    }
}

/// Project a field bag onto a [`ResolutionRecord`].
///
/// Missing columns default to the empty string. A column holding something
/// other than a string (or a zero/one element set of string) is a
/// [`DecodeError`].
pub fn project(row: &Row, columns: &ColumnNames) -> Result<ResolutionRecord, DecodeError> {
    Ok(ResolutionRecord {
        address: decode_string(row, &columns.address)?,
        gateway: decode_string(row, &columns.gateway)?,
        mask: decode_string(row, &columns.mask)?,
        row_name: decode_string(row, &columns.name)?,
    })
}

/// The completeness predicate.
#[must_use]
pub fn is_resolved(record: &ResolutionRecord, target: &str) -> bool {
    record.is_resolved_for(target)
}

fn decode_string(row: &Row, column: &str) -> Result<String, DecodeError> {
    let Some(value) = row.get(column) else {
        return Ok(String::new());
    };

    match value {
        Datum::String(s) => Ok(s.clone()),
        Datum::Set(items) => match items.as_slice() {
            [] => Ok(String::new()),
            [Datum::String(s)] => Ok(s.clone()),
            [other] => Err(unexpected(column, other)),
            _ => Err(unexpected(column, value)),
        },
        other => Err(unexpected(column, other)),
    }
}

fn unexpected(column: &str, found: &Datum) -> DecodeError {
    DecodeError::UnexpectedType {
        column: column.to_string(),
        expected: "string",
        found: found.type_name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved_row() -> Row {
        Row::new()
            .with("name", "p1")
            .with("ip_addr", "10.0.0.5")
            .with("gateway", "10.0.0.1")
            .with("subnet_mask", "255.255.255.0")
    }

    #[test]
    fn test_project_full_row() {
        let record = project(&resolved_row(), &ColumnNames::default()).unwrap();
        assert_eq!(
            record,
            ResolutionRecord {
                address: "10.0.0.5".to_string(),
                gateway: "10.0.0.1".to_string(),
                mask: "255.255.255.0".to_string(),
                row_name: "p1".to_string(),
            }
        );
        assert!(is_resolved(&record, "p1"));
        assert!(!is_resolved(&record, "p2"));
    }

    #[test]
    fn test_project_missing_columns_default_empty() {
        let record = project(&Row::new().with("name", "p1"), &ColumnNames::default()).unwrap();
        assert_eq!(record.row_name, "p1");
        assert!(record.address.is_empty());
        assert!(!record.is_complete());
    }

    #[test]
    fn test_project_optional_set_encoding() {
        let row = resolved_row()
            .with("gateway", Datum::Set(vec![Datum::from("10.0.0.254")]))
            .with("subnet_mask", Datum::empty_set());
        let record = project(&row, &ColumnNames::default()).unwrap();
        assert_eq!(record.gateway, "10.0.0.254");
        assert!(record.mask.is_empty());
    }

    #[test]
    fn test_project_wrong_type_is_decode_error() {
        let row = resolved_row().with("ip_addr", 42i64);
        let err = project(&row, &ColumnNames::default()).unwrap_err();
        assert_eq!(
            err,
            DecodeError::UnexpectedType {
                column: "ip_addr".to_string(),
                expected: "string",
                found: "integer",
            }
        );
    }

    #[test]
    fn test_project_custom_column_names() {
        let columns = ColumnNames {
            address: "ipv4".to_string(),
            ..ColumnNames::default()
        };
        let row = resolved_row().with("ipv4", "192.168.1.2");
        assert_eq!(project(&row, &columns).unwrap().address, "192.168.1.2");
    }

    #[test]
    fn test_resolution_requires_all_fields() {
        let mut record = project(&resolved_row(), &ColumnNames::default()).unwrap();
        record.mask.clear();
        assert!(!record.is_resolved_for("p1"));
    }
}
