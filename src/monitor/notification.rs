//! Notification and subscription identifier types.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::row::TableUpdates;

/// Unique identifier for a change-stream subscription.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new random subscription id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a batch is a full snapshot or an incremental diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Reply to a monitor request (first subscribe or after reconnect).
    Snapshot,
    /// An `update` pushed by the server.
    Update,
}

/// One batch as delivered to subscribers.
#[derive(Debug, Clone)]
pub struct Notification {
    /// Snapshot or incremental update.
    pub kind: NotificationKind,
    /// When the batch reached the client.
    pub received_at: DateTime<Utc>,
    /// The batch, shared between subscribers.
    pub updates: Arc<TableUpdates>,
}

impl Notification {
    /// Wrap a monitor reply.
    #[must_use]
    pub fn snapshot(updates: TableUpdates) -> Self {
        Self::new(NotificationKind::Snapshot, updates)
    }

    /// Wrap a pushed `update`.
    #[must_use]
    pub fn update(updates: TableUpdates) -> Self {
        Self::new(NotificationKind::Update, updates)
    }

    fn new(kind: NotificationKind, updates: TableUpdates) -> Self {
        Self {
            kind,
            received_at: Utc::now(),
            updates: Arc::new(updates),
        }
    }

    /// Same notification narrowed to `table`.
    #[must_use]
    pub fn only(&self, table: &str) -> Self {
        Self {
            kind: self.kind,
            received_at: self.received_at,
            updates: Arc::new(self.updates.only(table)),
        }
    }

    #[allow(missing_docs)]
    pub const fn is_snapshot(&self) -> bool {
        matches!(self.kind, NotificationKind::Snapshot)
    }
}
