//! Per-call watcher task and the caller's handle on it.
//!
//! A watch moves from `Waiting` to `Satisfied` exactly once. Snapshot
//! batches replace what the watcher knows about its row; update batches
//! are merged into it, since the server reports sparse column diffs.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::{WatchError, WatchResult};
use crate::row::Row;

use super::classifier::{ChangeKind, ClassifiedRow, RowClassifier, RowTarget};
use super::notification::{Notification, NotificationKind};
use super::record::{is_resolved, project, ColumnNames, ResolutionRecord};
use super::stream::ChangeStream;

/// Lifecycle of a single watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// No resolved record seen yet.
    Waiting,
    /// The record was emitted; terminal.
    Satisfied,
}

/// Classify, project and filter state for one target row.
#[derive(Debug)]
pub(crate) struct WatcherTask {
    target: RowTarget,
    known: Row,
    classifier: RowClassifier,
    columns: ColumnNames,
    state: WatchState,
}

impl WatcherTask {
    pub(crate) fn new(target: &str, columns: ColumnNames) -> Self {
        Self {
            target: RowTarget::named(target),
            known: Row::new(),
            classifier: RowClassifier::new(columns.name.clone()),
            columns,
            state: WatchState::Waiting,
        }
    }

    #[cfg(test)]
    const fn state(&self) -> WatchState {
        self.state
    }

    /// Feed one batch; returns the record on the transition to `Satisfied`.
    pub(crate) fn observe(&mut self, notification: &Notification) -> Option<ResolutionRecord> {
        if self.state == WatchState::Satisfied {
            return None;
        }

        let Some((kind, hit)) = self.classify(notification) else {
            self.forget_if_gone(notification);
            return None;
        };
        let row_id = hit.row_id;
        let mut candidate = match kind {
            ChangeKind::Addition => Row::new(),
            ChangeKind::Update => self.known.clone(),
        };
        candidate.merge(hit.row);

        let record = match project(&candidate, &self.columns) {
            Ok(record) => record,
            Err(err) => {
                warn!(target_row = %self.target.name(), %row_id, error = %err, "skipping undecodable row change");
                return None;
            }
        };

        self.target.remember(row_id);
        self.known = candidate;

        if is_resolved(&record, self.target.name()) {
            self.state = WatchState::Satisfied;
            Some(record)
        } else {
            debug!(target_row = %self.target.name(), ?record, "row not resolved yet");
            None
        }
    }

    /// Snapshots carry additions only; update batches carry modifications
    /// and rows inserted after the monitor started.
    fn classify<'a>(&self, notification: &'a Notification) -> Option<(ChangeKind, ClassifiedRow<'a>)> {
        let updates = &notification.updates;
        let target = Some(&self.target);
        match notification.kind {
            NotificationKind::Snapshot => self
                .classifier
                .classify(updates, ChangeKind::Addition, target)
                .map(|hit| (ChangeKind::Addition, hit)),
            NotificationKind::Update => self
                .classifier
                .classify(updates, ChangeKind::Update, target)
                .map(|hit| (ChangeKind::Update, hit))
                .or_else(|| {
                    self.classifier
                        .classify(updates, ChangeKind::Addition, target)
                        .map(|hit| (ChangeKind::Addition, hit))
                }),
        }
    }

    fn forget_if_gone(&mut self, notification: &Notification) {
        let gone = if notification.is_snapshot() {
            // A snapshot lists every row; absence means the row no longer exists.
            self.target.row_id().is_some()
        } else {
            self.classifier.is_deleted(&notification.updates, &self.target)
        };
        if gone {
            debug!(target_row = %self.target.name(), "target row removed");
            self.target.forget();
            self.known = Row::new();
        }
    }

    /// Run the task on its own thread, consuming `stream` until satisfied, cancelled or disconnected.
    pub(crate) fn spawn(
        mut self,
        stream: ChangeStream,
        result_tx: Sender<ResolutionRecord>,
        cancel: CancelToken,
    ) -> WatchResult<JoinHandle<()>> {
        thread::Builder::new()
            .name("vrswatch-watch".to_string())
            .spawn(move || {
                self.run(&stream, &result_tx, &cancel);
                stream.unsubscribe();
            })
            .map_err(|e| WatchError::internal(format!("failed to spawn watcher: {e}")))
    }

    fn run(&mut self, stream: &ChangeStream, result_tx: &Sender<ResolutionRecord>, cancel: &CancelToken) {
        loop {
            select! {
                recv(stream.receiver()) -> msg => match msg {
                    Ok(notification) => {
                        if let Some(record) = self.observe(&notification) {
                            info!(target_row = %self.target.name(), address = %record.address, "row resolved");
                            let _ = result_tx.try_send(record);
                            return;
                        }
                    }
                    Err(_) => {
                        debug!(target_row = %self.target.name(), "change stream closed");
                        return;
                    }
                },
                recv(cancel.receiver()) -> _ => {
                    debug!(target_row = %self.target.name(), "watch cancelled");
                    return;
                }
            }
        }
    }
}

/// Caller handle for one `wait_for_row_resolution` call.
///
/// Yields at most one [`ResolutionRecord`]. Dropping the handle cancels the
/// background watcher.
#[derive(Debug)]
pub struct ResolutionWatch {
    target: String,
    rx: Receiver<ResolutionRecord>,
    cancel: CancelToken,
    join: Option<JoinHandle<()>>,
}

impl ResolutionWatch {
    /// A watch already satisfied by the current snapshot.
    pub(crate) fn satisfied(target: &str, record: ResolutionRecord) -> Self {
        let (tx, rx) = bounded(1);
        let _ = tx.send(record);
        Self {
            target: target.to_string(),
            rx,
            cancel: CancelToken::new(),
            join: None,
        }
    }

    pub(crate) fn pending(
        target: &str,
        rx: Receiver<ResolutionRecord>,
        cancel: CancelToken,
        join: JoinHandle<()>,
    ) -> Self {
        Self {
            target: target.to_string(),
            rx,
            cancel,
            join: Some(join),
        }
    }

    /// The row name this watch waits for.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The single-slot result channel.
    #[must_use]
    pub fn receiver(&self) -> &Receiver<ResolutionRecord> {
        &self.rx
    }

    /// Block until the row resolves.
    pub fn recv(&self) -> WatchResult<ResolutionRecord> {
        self.rx.recv().map_err(|_| self.closed_error())
    }

    /// Block until the row resolves or `timeout` elapses.
    pub fn recv_timeout(&self, timeout: Duration) -> WatchResult<ResolutionRecord> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => WatchError::Timeout {
                duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            },
            RecvTimeoutError::Disconnected => self.closed_error(),
        })
    }

    /// The record, if it has been emitted and not yet taken.
    pub fn try_recv(&self) -> WatchResult<Option<ResolutionRecord>> {
        match self.rx.try_recv() {
            Ok(record) => Ok(Some(record)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(self.closed_error()),
        }
    }

    /// Stop the background watcher. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// True while a background watcher thread is still running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.join.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn closed_error(&self) -> WatchError {
        if self.cancel.is_cancelled() {
            WatchError::Cancelled
        } else {
            WatchError::disconnected(format!("watch:{}", self.target))
        }
    }
}

impl Drop for ResolutionWatch {
    fn drop(&mut self) {
        self.cancel.cancel();
        // Detach; the watcher observes the cancellation on its next select.
        drop(self.join.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{RowUpdate, TableUpdates};
    use uuid::Uuid;

    const T: &str = "Nuage_Port_Table";

    fn full_port(name: &str) -> Row {
        Row::new()
            .with("name", name)
            .with("ip_addr", "10.0.0.5")
            .with("gateway", "10.0.0.1")
            .with("subnet_mask", "255.255.255.0")
    }

    #[test]
    fn test_snapshot_resolves_immediately() {
        let mut task = WatcherTask::new("p1", ColumnNames::default());
        let snapshot = TableUpdates::new().with(T, Uuid::new_v4(), RowUpdate::added(full_port("p1")));

        let record = task.observe(&Notification::snapshot(snapshot)).unwrap();
        assert_eq!(record.row_name, "p1");
        assert_eq!(task.state(), WatchState::Satisfied);
    }

    #[test]
    fn test_sparse_updates_accumulate() {
        let id = Uuid::new_v4();
        let mut task = WatcherTask::new("p1", ColumnNames::default());

        let first = TableUpdates::new().with(
            T,
            id,
            RowUpdate::modified(Row::new().with("ip_addr", ""), Row::new().with("name", "p1").with("ip_addr", "10.0.0.5")),
        );
        assert!(task.observe(&Notification::update(first)).is_none());
        assert_eq!(task.state(), WatchState::Waiting);

        let second = TableUpdates::new().with(
            T,
            id,
            RowUpdate::modified(
                Row::new().with("gateway", "").with("subnet_mask", ""),
                Row::new().with("gateway", "10.0.0.1").with("subnet_mask", "255.255.255.0"),
            ),
        );
        let record = task.observe(&Notification::update(second)).unwrap();
        assert_eq!(record.address, "10.0.0.5");
        assert_eq!(record.mask, "255.255.255.0");
    }

    #[test]
    fn test_decode_error_skips_event_without_poisoning_state() {
        let id = Uuid::new_v4();
        let mut task = WatcherTask::new("p1", ColumnNames::default());

        let bad = TableUpdates::new().with(
            T,
            id,
            RowUpdate::modified(Row::new().with("ip_addr", ""), full_port("p1").with("ip_addr", 7i64)),
        );
        assert!(task.observe(&Notification::update(bad)).is_none());

        let good = TableUpdates::new().with(
            T,
            id,
            RowUpdate::modified(Row::new().with("ip_addr", ""), full_port("p1")),
        );
        assert!(task.observe(&Notification::update(good)).is_some());
    }

    #[test]
    fn test_emits_once() {
        let mut task = WatcherTask::new("p1", ColumnNames::default());
        let snapshot = TableUpdates::new().with(T, Uuid::new_v4(), RowUpdate::added(full_port("p1")));
        let n = Notification::snapshot(snapshot);
        assert!(task.observe(&n).is_some());
        assert!(task.observe(&n).is_none());
    }

    #[test]
    fn test_deleted_row_resets_knowledge() {
        let id = Uuid::new_v4();
        let mut task = WatcherTask::new("p1", ColumnNames::default());

        let partial = Row::new().with("name", "p1").with("ip_addr", "10.0.0.5");
        let snapshot = TableUpdates::new().with(T, id, RowUpdate::added(partial.clone()));
        assert!(task.observe(&Notification::snapshot(snapshot)).is_none());

        let delete = TableUpdates::new().with(T, id, RowUpdate::deleted(partial));
        assert!(task.observe(&Notification::update(delete)).is_none());

        let sparse = TableUpdates::new().with(
            T,
            id,
            RowUpdate::modified(
                Row::new().with("gateway", ""),
                Row::new().with("gateway", "10.0.0.1").with("subnet_mask", "255.255.255.0"),
            ),
        );
        assert!(task.observe(&Notification::update(sparse)).is_none());
    }

    #[test]
    fn test_insert_in_update_batch_resolves() {
        let mut task = WatcherTask::new("p1", ColumnNames::default());
        assert!(task.observe(&Notification::snapshot(TableUpdates::new())).is_none());

        let insert = TableUpdates::new().with(T, Uuid::new_v4(), RowUpdate::added(full_port("p1")));
        let record = task.observe(&Notification::update(insert)).unwrap();
        assert_eq!(record.address, "10.0.0.5");
    }

    #[test]
    fn test_recreated_row_starts_from_scratch() {
        let old_id = Uuid::new_v4();
        let mut task = WatcherTask::new("p1", ColumnNames::default());

        let partial = Row::new().with("name", "p1").with("ip_addr", "10.0.0.5").with("gateway", "10.0.0.1");
        let snapshot = TableUpdates::new().with(T, old_id, RowUpdate::added(partial.clone()));
        assert!(task.observe(&Notification::snapshot(snapshot)).is_none());

        let recreate = TableUpdates::new()
            .with(T, old_id, RowUpdate::deleted(partial))
            .with(T, Uuid::new_v4(), RowUpdate::added(Row::new().with("name", "p1").with("subnet_mask", "255.255.255.0")));
        assert!(task.observe(&Notification::update(recreate)).is_none());
        assert_eq!(task.state(), WatchState::Waiting);
    }

    #[test]
    fn test_satisfied_watch_handle() {
        let record = ResolutionRecord {
            row_name: "p1".to_string(),
            ..ResolutionRecord::default()
        };
        let watch = ResolutionWatch::satisfied("p1", record.clone());
        assert!(!watch.is_active());
        assert_eq!(watch.try_recv().unwrap(), Some(record));
        assert!(watch.try_recv().is_err());
    }
}
