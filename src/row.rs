//! Row data and change batches.
//!
//! A [`TableUpdates`] batch is the unit the transport delivers: for every
//! affected table, a list of [`RowUpdate`]s keyed by row UUID, each with an
//! optional previous and an optional new field bag.

use std::collections::BTreeMap;

use serde_json::json;
use uuid::Uuid;

use crate::datum::Datum;
use crate::error::DecodeError;

/// Identifier of a row (the OVSDB `_uuid`).
pub type RowId = Uuid;

/// A field bag: column name to dynamically typed value.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    fields: BTreeMap<String, Datum>,
}

#[allow(missing_docs)]
impl Row {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Datum>) -> Self {
        self.fields.insert(column.into(), value.into());
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: Datum) -> Option<Datum> {
        self.fields.insert(column.into(), value)
    }

    pub fn get(&self, column: &str) -> Option<&Datum> {
        self.fields.get(column)
    }

    pub fn remove(&mut self, column: &str) -> Option<Datum> {
        self.fields.remove(column)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Datum)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Overwrite this row's columns with every column present in `other`.
    pub fn merge(&mut self, other: &Row) {
        for (k, v) in &other.fields {
            self.fields.insert(k.clone(), v.clone());
        }
    }

    /// Copy of this row restricted to `columns`.
    #[must_use]
    pub fn project<'a>(&self, columns: impl IntoIterator<Item = &'a str>) -> Row {
        columns
            .into_iter()
            .filter_map(|c| self.fields.get(c).map(|v| (c.to_string(), v.clone())))
            .collect()
    }

    /// Decode a `<row>` JSON object.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, DecodeError> {
        let obj = value
            .as_object()
            .ok_or_else(|| DecodeError::malformed("row must be a JSON object"))?;
        let mut row = Row::new();
        for (column, raw) in obj {
            row.fields.insert(column.clone(), Datum::from_json(raw)?);
        }
        Ok(row)
    }

    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let obj: serde_json::Map<String, serde_json::Value> =
            self.fields.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
        serde_json::Value::Object(obj)
    }
}

impl FromIterator<(String, Datum)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, Datum)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// One raw row change: previous and new field bags.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowUpdate {
    pub old: Option<Row>,
    pub new: Option<Row>,
}

#[allow(missing_docs)]
impl RowUpdate {
    /// A row that became visible (snapshot or insert).
    #[must_use]
    pub fn added(new: Row) -> Self {
        Self {
            old: None,
            new: Some(new),
        }
    }

    /// A modification: `old` holds the changed columns' previous values.
    #[must_use]
    pub fn modified(old: Row, new: Row) -> Self {
        Self {
            old: Some(old),
            new: Some(new),
        }
    }

    #[must_use]
    pub fn deleted(old: Row) -> Self {
        Self {
            old: Some(old),
            new: None,
        }
    }

    /// True when the previous value is present and non-empty.
    pub fn has_old(&self) -> bool {
        self.old.as_ref().is_some_and(|r| !r.is_empty())
    }

    /// True when the new value is present and non-empty.
    pub fn has_new(&self) -> bool {
        self.new.as_ref().is_some_and(|r| !r.is_empty())
    }

    fn from_json(value: &serde_json::Value) -> Result<Self, DecodeError> {
        let obj = value
            .as_object()
            .ok_or_else(|| DecodeError::malformed("row-update must be a JSON object"))?;
        let old = obj.get("old").map(Row::from_json).transpose()?;
        let new = obj.get("new").map(Row::from_json).transpose()?;
        Ok(Self { old, new })
    }

    fn to_json(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        if let Some(old) = &self.old {
            obj.insert("old".to_string(), old.to_json());
        }
        if let Some(new) = &self.new {
            obj.insert("new".to_string(), new.to_json());
        }
        serde_json::Value::Object(obj)
    }
}

/// Changes to the rows of a single table, in delivery order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableUpdate {
    rows: Vec<(RowId, RowUpdate)>,
}

#[allow(missing_docs)]
impl TableUpdate {
    pub fn push(&mut self, row_id: RowId, update: RowUpdate) {
        self.rows.push((row_id, update));
    }

    pub fn rows(&self) -> impl Iterator<Item = (RowId, &RowUpdate)> {
        self.rows.iter().map(|(id, u)| (*id, u))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A change batch: zero or more row changes across one or more tables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableUpdates {
    tables: BTreeMap<String, TableUpdate>,
}

#[allow(missing_docs)]
impl TableUpdates {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a row change for `table`.
    pub fn push(&mut self, table: impl Into<String>, row_id: RowId, update: RowUpdate) {
        self.tables.entry(table.into()).or_default().push(row_id, update);
    }

    /// Builder-style [`TableUpdates::push`].
    #[must_use]
    pub fn with(mut self, table: impl Into<String>, row_id: RowId, update: RowUpdate) -> Self {
        self.push(table, row_id, update);
        self
    }

    /// Make sure `table` is present, even with no rows.
    pub fn ensure_table(&mut self, table: &str) {
        self.tables.entry(table.to_string()).or_default();
    }

    pub fn table(&self, table: &str) -> Option<&TableUpdate> {
        self.tables.get(table)
    }

    pub fn contains_table(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    pub fn tables(&self) -> impl Iterator<Item = (&str, &TableUpdate)> {
        self.tables.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Iterate `(table, row_id, update)` over the whole batch.
    pub fn rows(&self) -> impl Iterator<Item = (&str, RowId, &RowUpdate)> {
        self.tables
            .iter()
            .flat_map(|(t, u)| u.rows().map(move |(id, r)| (t.as_str(), id, r)))
    }

    pub fn row_count(&self) -> usize {
        self.tables.values().map(TableUpdate::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }

    /// Copy of this batch containing only `table`.
    #[must_use]
    pub fn only(&self, table: &str) -> TableUpdates {
        let mut out = TableUpdates::new();
        if let Some(update) = self.tables.get(table) {
            out.tables.insert(table.to_string(), update.clone());
        }
        out
    }

    /// Split the batch into the part for `table` and the remainder.
    #[must_use]
    pub fn split_off(mut self, table: &str) -> (Option<TableUpdate>, TableUpdates) {
        let taken = self.tables.remove(table);
        (taken, self)
    }

    pub(crate) fn insert_table(&mut self, table: String, update: TableUpdate) {
        self.tables.insert(table, update);
    }

    /// Decode a `<table-updates>` JSON object.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, DecodeError> {
        let obj = value
            .as_object()
            .ok_or_else(|| DecodeError::malformed("table-updates must be a JSON object"))?;

        let mut out = TableUpdates::new();
        for (table, rows) in obj {
            let rows = rows
                .as_object()
                .ok_or_else(|| DecodeError::malformed(format!("table-update for '{table}' must be an object")))?;
            out.ensure_table(table);
            for (id, raw) in rows {
                let row_id = Uuid::parse_str(id)
                    .map_err(|e| DecodeError::malformed(format!("invalid row uuid '{id}': {e}")))?;
                out.push(table.clone(), row_id, RowUpdate::from_json(raw)?);
            }
        }
        Ok(out)
    }

    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        for (table, update) in &self.tables {
            let rows: serde_json::Map<String, serde_json::Value> = update
                .rows()
                .map(|(id, u)| (id.to_string(), u.to_json()))
                .collect();
            obj.insert(table.clone(), serde_json::Value::Object(rows));
        }
        json!(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_merge_overwrites_present_columns_only() {
        let mut row = Row::new().with("name", "p1").with("ip_addr", "10.0.0.5");
        row.merge(&Row::new().with("gateway", "10.0.0.1").with("ip_addr", "10.0.0.6"));

        assert_eq!(row.get("name"), Some(&Datum::from("p1")));
        assert_eq!(row.get("ip_addr"), Some(&Datum::from("10.0.0.6")));
        assert_eq!(row.get("gateway"), Some(&Datum::from("10.0.0.1")));
        assert_eq!(row.len(), 3);
    }

    #[test]
    fn test_row_update_presence() {
        let added = RowUpdate::added(Row::new().with("name", "p1"));
        assert!(added.has_new());
        assert!(!added.has_old());

        let empty_old = RowUpdate::modified(Row::new(), Row::new().with("name", "p1"));
        assert!(!empty_old.has_old());

        let deleted = RowUpdate::deleted(Row::new().with("name", "p1"));
        assert!(deleted.has_old());
        assert!(!deleted.has_new());
    }

    #[test]
    fn test_table_updates_from_json() {
        let id = Uuid::new_v4();
        let raw = json!({
            "Nuage_Port_Table": {
                id.to_string(): {
                    "old": {"ip_addr": ""},
                    "new": {"name": "p1", "ip_addr": "10.0.0.5", "vrf_id": 3}
                }
            },
            "Empty_Table": {}
        });

        let updates = TableUpdates::from_json(&raw).unwrap();
        assert_eq!(updates.row_count(), 1);
        assert!(updates.contains_table("Empty_Table"));

        let (table, row_id, update) = updates.rows().next().unwrap();
        assert_eq!(table, "Nuage_Port_Table");
        assert_eq!(row_id, id);
        assert!(update.has_old());
        let new = update.new.as_ref().unwrap();
        assert_eq!(new.get("vrf_id"), Some(&Datum::Integer(3)));
    }

    #[test]
    fn test_table_updates_from_json_rejects_bad_uuid() {
        let raw = json!({"T": {"not-a-uuid": {"new": {}}}});
        assert!(TableUpdates::from_json(&raw).is_err());
    }

    #[test]
    fn test_only_and_split_off() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let batch = TableUpdates::new()
            .with("A", a, RowUpdate::added(Row::new().with("name", "a")))
            .with("B", b, RowUpdate::added(Row::new().with("name", "b")));

        let only_a = batch.only("A");
        assert_eq!(only_a.row_count(), 1);
        assert!(!only_a.contains_table("B"));

        let (taken, rest) = batch.split_off("B");
        assert_eq!(taken.unwrap().len(), 1);
        assert_eq!(rest.table_names().collect::<Vec<_>>(), vec!["A"]);
    }

    #[test]
    fn test_table_updates_json_shape() {
        let id = Uuid::new_v4();
        let batch = TableUpdates::new().with("T", id, RowUpdate::added(Row::new().with("name", "x")));
        let encoded = batch.to_json();
        assert_eq!(encoded["T"][id.to_string()]["new"]["name"], json!("x"));
        assert!(encoded["T"][id.to_string()].get("old").is_none());
    }
}
