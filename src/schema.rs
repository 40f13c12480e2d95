//! Server-advertised database schema and column resolution.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{WatchError, WatchResult};
use crate::transport::Session;

/// A `<database-schema>` as returned by `get_schema`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSchema {
    /// Database name, e.g. `Open_vSwitch`.
    pub name: String,
    /// Schema version string.
    #[serde(default)]
    pub version: String,
    /// Tables by name.
    #[serde(default)]
    pub tables: BTreeMap<String, TableSchema>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    #[serde(default)]
    pub columns: BTreeMap<String, ColumnSchema>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// The column `<type>`, kept as raw JSON.
    #[serde(rename = "type")]
    pub column_type: serde_json::Value,
    #[serde(default)]
    pub ephemeral: bool,
}

impl ColumnSchema {
    /// A plain string column.
    #[must_use]
    pub fn string() -> Self {
        Self {
            column_type: serde_json::Value::String("string".to_string()),
            ephemeral: false,
        }
    }
}

impl DatabaseSchema {
    /// An empty schema named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: String::new(),
            tables: BTreeMap::new(),
        }
    }

    /// Builder-style: add a table whose columns are all strings.
    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>, columns: &[&str]) -> Self {
        let columns = columns
            .iter()
            .map(|c| ((*c).to_string(), ColumnSchema::string()))
            .collect();
        self.tables.insert(table.into(), TableSchema { columns });
        self
    }

    /// Column names of `table`, if the table exists.
    pub fn columns(&self, table: &str) -> Option<BTreeSet<String>> {
        self.tables
            .get(table)
            .map(|t| t.columns.keys().cloned().collect())
    }
}

/// Look up the columns of `table` in the schema the session advertised for `database`.
///
/// # Errors
/// `SchemaMissing` when the database or the table is unknown to the server.
pub fn resolve_columns(session: &dyn Session, database: &str, table: &str) -> WatchResult<BTreeSet<String>> {
    session
        .schema(database)
        .and_then(|schema| schema.columns(table))
        .ok_or_else(|| WatchError::SchemaMissing {
            database: database.to_string(),
            table: table.to_string(),
        })
}
