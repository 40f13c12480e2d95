//! Row event classification.
//!
//! Picks the row change a watcher cares about out of a batch. Only the
//! first match in iteration order is returned; a watcher follows a single
//! row.

use crate::row::{Row, RowId, RowUpdate, TableUpdates};

/// How a change is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Row newly visible: `new` present, `old` absent.
    Addition,
    /// Row modified: both `old` and `new` present.
    Update,
}

/// The row a watcher follows.
///
/// The name is fixed for the life of the watch. The row id is learned the
/// first time the named row is seen, so later sparse diffs that do not carry
/// the name column still match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowTarget {
    name: String,
    row_id: Option<RowId>,
}

impl RowTarget {
    /// Follow the row whose name column equals `name`.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            row_id: None,
        }
    }

    /// The row name being followed.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The row id, once the named row has been seen.
    pub const fn row_id(&self) -> Option<RowId> {
        self.row_id
    }

    /// Pin the target to `row_id`.
    pub fn remember(&mut self, row_id: RowId) {
        self.row_id = Some(row_id);
    }

    /// Drop the pinned row id; only the name matches afterwards.
    pub fn forget(&mut self) {
        self.row_id = None;
    }

    fn matches(&self, row_id: RowId, row: &Row, name_column: &str) -> bool {
        if self.row_id == Some(row_id) {
            return true;
        }
        row.get(name_column).and_then(|d| d.as_str()) == Some(self.name.as_str())
    }
}

/// A row change selected by [`RowClassifier::classify`].
#[derive(Debug, Clone, Copy)]
pub struct ClassifiedRow<'a> {
    /// Table the row belongs to.
    pub table: &'a str,
    /// The row's `_uuid`.
    pub row_id: RowId,
    /// The change's `new` field bag.
    pub row: &'a Row,
}

/// Classifies raw row changes by kind and target.
#[derive(Debug, Clone)]
pub struct RowClassifier {
    name_column: String,
}

impl RowClassifier {
    /// Classifier matching targets against `name_column`.
    #[must_use]
    pub fn new(name_column: impl Into<String>) -> Self {
        Self {
            name_column: name_column.into(),
        }
    }

    /// First row in `batch` of the given `kind`, restricted to `target` if given.
    ///
    /// The returned row is the change's `new` field bag.
    pub fn classify<'a>(
        &self,
        batch: &'a TableUpdates,
        kind: ChangeKind,
        target: Option<&RowTarget>,
    ) -> Option<ClassifiedRow<'a>> {
        batch.rows().find_map(|(table, row_id, update)| {
            let new = select(update, kind)?;
            if let Some(target) = target {
                if !target.matches(row_id, new, &self.name_column) {
                    return None;
                }
            }
            Some(ClassifiedRow { table, row_id, row: new })
        })
    }

    /// True if `batch` removes the row `target` is following.
    pub fn is_deleted(&self, batch: &TableUpdates, target: &RowTarget) -> bool {
        batch.rows().any(|(_, row_id, update)| {
            if update.has_new() {
                return false;
            }
            match &update.old {
                Some(old) => target.matches(row_id, old, &self.name_column),
                None => target.row_id() == Some(row_id),
            }
        })
    }
}

fn select(update: &RowUpdate, kind: ChangeKind) -> Option<&Row> {
    let keep = match kind {
        ChangeKind::Addition => update.has_new() && !update.has_old(),
        ChangeKind::Update => update.has_new() && update.has_old(),
    };
    if keep {
        update.new.as_ref()
    } else {
        None
    }
}
