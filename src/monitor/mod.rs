//! Monitor pipeline: from raw table-update batches to resolved port records.
//!
//! The transport's update handler feeds a single dispatcher worker. The
//! dispatcher keeps a row cache and fans each batch out to private,
//! table-filtered [`ChangeStream`]s. Each call to
//! `wait_for_row_resolution` owns one watcher thread that classifies,
//! projects and filters its stream until the target row is resolved.

/// Row change classification.
pub mod classifier;
pub(crate) mod dispatcher;
/// Batch and subscription identifier types.
pub mod notification;
/// Port record projection and resolution predicate.
pub mod record;
/// Monitor request construction.
pub mod request;
/// Subscriber stream handle.
pub mod stream;
/// Per-call watcher task.
pub mod watcher;

pub use classifier::{ChangeKind, ClassifiedRow, RowClassifier, RowTarget};
pub use notification::{Notification, NotificationKind, SubscriptionId};
pub use record::{is_resolved, project, ColumnNames, ResolutionRecord};
pub use request::{build_request, MonitorRequest, MonitorSelect};
pub use stream::ChangeStream;
pub use watcher::{ResolutionWatch, WatchState};
