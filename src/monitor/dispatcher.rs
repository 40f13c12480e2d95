//! Change dispatcher worker.
//!
//! This module owns the single consumer of the transport's inbound channel.
//! Every batch is applied to a row cache and fanned out to each registered
//! subscriber whose table it touches, so concurrent watchers on one session
//! all observe every batch. Registration travels on the same channel as the
//! batches, which makes the snapshot a new subscriber receives consistent
//! with the first batch it will see on its stream.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use tracing::{debug, trace};

use crate::cancel::CancelToken;
use crate::error::{WatchError, WatchResult};
use crate::row::{Row, RowId, RowUpdate, TableUpdates};

use super::notification::{Notification, SubscriptionId};
use super::stream::ChangeStream;

#[derive(Debug)]
pub(crate) enum DispatchMsg {
    Notify(Notification),
    /// A monitor request for `table` is in flight; hold its updates until the snapshot lands.
    AwaitSnapshot {
        table: String,
    },
    AbandonSnapshot {
        table: String,
    },
    Register {
        subscription_id: SubscriptionId,
        table: String,
        stream_tx: Sender<Notification>,
        reply: Sender<TableUpdates>,
    },
    Unregister {
        subscription_id: SubscriptionId,
    },
}

#[derive(Debug)]
struct Subscriber {
    table: String,
    tx: Sender<Notification>,
}

/// Owns the dispatch worker thread.
#[derive(Debug)]
pub(crate) struct Dispatcher {
    tx: Sender<DispatchMsg>,
    subscriber_capacity: usize,
    shutdown: CancelToken,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub(crate) fn spawn(inbound_capacity: usize, subscriber_capacity: usize) -> WatchResult<Self> {
        let (tx, rx) = bounded::<DispatchMsg>(inbound_capacity.max(1));
        let shutdown = CancelToken::new();

        let worker_shutdown = shutdown.clone();
        let join = thread::Builder::new()
            .name("vrswatch-dispatch".to_string())
            .spawn(move || DispatchState::default().run(&rx, &worker_shutdown))
            .map_err(|e| WatchError::internal(format!("failed to spawn dispatch worker: {e}")))?;

        Ok(Self {
            tx,
            subscriber_capacity: subscriber_capacity.max(1),
            shutdown,
            join: Mutex::new(Some(join)),
        })
    }

    /// Sender the transport handler pushes batches into.
    pub(crate) fn sender(&self) -> Sender<DispatchMsg> {
        self.tx.clone()
    }

    pub(crate) fn notify(&self, notification: Notification) -> WatchResult<()> {
        self.send(DispatchMsg::Notify(notification))
    }

    pub(crate) fn await_snapshot(&self, table: &str) -> WatchResult<()> {
        self.send(DispatchMsg::AwaitSnapshot {
            table: table.to_string(),
        })
    }

    pub(crate) fn abandon_snapshot(&self, table: &str) {
        let _ = self.send(DispatchMsg::AbandonSnapshot {
            table: table.to_string(),
        });
    }

    /// Register a subscriber for `table`; returns its stream and the cached rows of the table.
    pub(crate) fn register(&self, table: &str) -> WatchResult<(ChangeStream, TableUpdates)> {
        let subscription_id = SubscriptionId::new();
        let (stream_tx, stream_rx) = bounded::<Notification>(self.subscriber_capacity);
        let (reply_tx, reply_rx) = bounded::<TableUpdates>(1);

        let stream = ChangeStream::new(subscription_id, table.to_string(), stream_rx, self.tx.clone());

        self.send(DispatchMsg::Register {
            subscription_id,
            table: table.to_string(),
            stream_tx,
            reply: reply_tx,
        })?;

        let snapshot = reply_rx
            .recv()
            .map_err(|_| WatchError::disconnected("dispatch_control"))?;

        Ok((stream, snapshot))
    }

    /// Stop the worker; every stream becomes disconnected.
    pub(crate) fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn send(&self, msg: DispatchMsg) -> WatchResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(WatchError::disconnected("dispatch"));
        }
        self.tx.send(msg).map_err(|_| WatchError::disconnected("dispatch"))
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Ok(mut guard) = self.join.lock() {
            // Detach; the worker exits on its next select once shutdown fires.
            drop(guard.take());
        }
    }
}

#[derive(Debug, Default)]
struct DispatchState {
    subs: HashMap<SubscriptionId, Subscriber>,
    cache: HashMap<String, BTreeMap<RowId, Row>>,
    pending: HashMap<String, Vec<Notification>>,
}

impl DispatchState {
    fn run(mut self, rx: &Receiver<DispatchMsg>, shutdown: &CancelToken) {
        loop {
            let msg = select! {
                recv(rx) -> msg => match msg {
                    Ok(msg) => msg,
                    Err(_) => break,
                },
                recv(shutdown.receiver()) -> _ => break,
            };

            if !self.handle(msg, shutdown) {
                break;
            }
        }
        debug!(subscribers = self.subs.len(), "dispatch worker stopped");
    }

    /// Returns false once shutdown interrupted a delivery.
    fn handle(&mut self, msg: DispatchMsg, shutdown: &CancelToken) -> bool {
        match msg {
            DispatchMsg::Notify(notification) if notification.is_snapshot() => {
                self.on_snapshot(&notification, shutdown)
            }
            DispatchMsg::Notify(notification) => self.on_update(&notification, shutdown),
            DispatchMsg::AwaitSnapshot { table } => {
                self.pending.entry(table).or_default();
                true
            }
            DispatchMsg::AbandonSnapshot { table } => {
                let held = self.pending.remove(&table).unwrap_or_default();
                held.iter().all(|n| self.deliver(n, shutdown))
            }
            DispatchMsg::Register {
                subscription_id,
                table,
                stream_tx,
                reply,
            } => {
                let _ = reply.send(self.snapshot_of(&table));
                debug!(%subscription_id, %table, "subscriber registered");
                self.subs.insert(subscription_id, Subscriber { table, tx: stream_tx });
                true
            }
            DispatchMsg::Unregister { subscription_id } => {
                if self.subs.remove(&subscription_id).is_some() {
                    debug!(%subscription_id, "subscriber unregistered");
                }
                true
            }
        }
    }

    fn on_snapshot(&mut self, notification: &Notification, shutdown: &CancelToken) -> bool {
        if !self.deliver(notification, shutdown) {
            return false;
        }
        let tables: Vec<String> = notification.updates.table_names().map(str::to_string).collect();
        for table in tables {
            let held = self.pending.remove(&table).unwrap_or_default();
            if !held.iter().all(|n| self.deliver(n, shutdown)) {
                return false;
            }
        }
        true
    }

    fn on_update(&mut self, notification: &Notification, shutdown: &CancelToken) -> bool {
        if !notification.updates.table_names().any(|t| self.pending.contains_key(t)) {
            return self.deliver(notification, shutdown);
        }

        let mut rest = TableUpdates::new();
        for (table, update) in notification.updates.tables() {
            match self.pending.get_mut(table) {
                Some(held) => held.push(notification.only(table)),
                None => rest.insert_table(table.to_string(), update.clone()),
            }
        }
        if rest.table_names().next().is_none() {
            return true;
        }

        let rest = Notification {
            kind: notification.kind,
            received_at: notification.received_at,
            updates: Arc::new(rest),
        };
        self.deliver(&rest, shutdown)
    }

    fn deliver(&mut self, notification: &Notification, shutdown: &CancelToken) -> bool {
        self.apply(notification);

        let mut narrowed: HashMap<&str, Notification> = HashMap::new();
        let mut dead = Vec::new();

        for (id, sub) in &self.subs {
            if !notification.updates.contains_table(&sub.table) {
                continue;
            }
            let out = narrowed
                .entry(sub.table.as_str())
                .or_insert_with(|| notification.only(&sub.table))
                .clone();

            // Blocking send: a slow subscriber throttles the transport instead of losing batches.
            select! {
                send(sub.tx, out) -> res => {
                    if res.is_err() {
                        dead.push(*id);
                    }
                }
                recv(shutdown.receiver()) -> _ => return false,
            }
        }
        drop(narrowed);

        for id in dead {
            self.subs.remove(&id);
            trace!(subscription_id = %id, "dropped closed subscriber");
        }
        true
    }

    fn apply(&mut self, notification: &Notification) {
        let snapshot = notification.is_snapshot();
        for (table, update) in notification.updates.tables() {
            let rows = self.cache.entry(table.to_string()).or_default();
            if snapshot {
                rows.clear();
            }
            for (row_id, change) in update.rows() {
                match &change.new {
                    Some(new) if snapshot => {
                        rows.insert(row_id, new.clone());
                    }
                    Some(new) => rows.entry(row_id).or_default().merge(new),
                    None => {
                        rows.remove(&row_id);
                    }
                }
            }
        }
    }

    fn snapshot_of(&self, table: &str) -> TableUpdates {
        let mut out = TableUpdates::new();
        out.ensure_table(table);
        if let Some(rows) = self.cache.get(table) {
            for (row_id, row) in rows {
                out.push(table, *row_id, RowUpdate::added(row.clone()));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    const T: &str = "Nuage_Port_Table";

    #[test]
    fn test_register_returns_cached_rows() {
        let dispatcher = Dispatcher::spawn(16, 16).unwrap();
        let id = Uuid::new_v4();
        let snapshot = TableUpdates::new().with(T, id, RowUpdate::added(Row::new().with("name", "p1")));
        dispatcher.notify(Notification::snapshot(snapshot)).unwrap();

        let (_stream, cached) = dispatcher.register(T).unwrap();
        assert_eq!(cached.row_count(), 1);
        assert_eq!(cached.rows().next().unwrap().1, id);
    }

    #[test]
    fn test_update_merges_into_cache() {
        let dispatcher = Dispatcher::spawn(16, 16).unwrap();
        let id = Uuid::new_v4();
        dispatcher
            .notify(Notification::snapshot(
                TableUpdates::new().with(T, id, RowUpdate::added(Row::new().with("name", "p1"))),
            ))
            .unwrap();
        dispatcher
            .notify(Notification::update(TableUpdates::new().with(
                T,
                id,
                RowUpdate::modified(Row::new().with("ip_addr", ""), Row::new().with("ip_addr", "10.0.0.5")),
            )))
            .unwrap();

        let (_stream, cached) = dispatcher.register(T).unwrap();
        let (_, _, update) = cached.rows().next().unwrap();
        let row = update.new.as_ref().unwrap();
        assert_eq!(row.get("name").and_then(|d| d.as_str()), Some("p1"));
        assert_eq!(row.get("ip_addr").and_then(|d| d.as_str()), Some("10.0.0.5"));
    }

    #[test]
    fn test_fan_out_to_every_subscriber_of_table() {
        let dispatcher = Dispatcher::spawn(16, 16).unwrap();
        let (a, _) = dispatcher.register(T).unwrap();
        let (b, _) = dispatcher.register(T).unwrap();
        let (other, _) = dispatcher.register("Other").unwrap();

        let batch = TableUpdates::new().with(
            T,
            Uuid::new_v4(),
            RowUpdate::modified(Row::new().with("x", "0"), Row::new().with("x", "1")),
        );
        dispatcher.notify(Notification::update(batch)).unwrap();

        let timeout = Duration::from_secs(2);
        assert_eq!(a.recv_timeout(timeout).unwrap().updates.row_count(), 1);
        assert_eq!(b.recv_timeout(timeout).unwrap().updates.row_count(), 1);
        assert!(other.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_updates_held_until_snapshot() {
        let dispatcher = Dispatcher::spawn(16, 16).unwrap();
        let (stream, _) = dispatcher.register(T).unwrap();
        let id = Uuid::new_v4();

        dispatcher.await_snapshot(T).unwrap();
        dispatcher
            .notify(Notification::update(TableUpdates::new().with(
                T,
                id,
                RowUpdate::modified(Row::new().with("gateway", ""), Row::new().with("gateway", "10.0.0.1")),
            )))
            .unwrap();
        dispatcher
            .notify(Notification::snapshot(
                TableUpdates::new().with(T, id, RowUpdate::added(Row::new().with("name", "p1"))),
            ))
            .unwrap();

        let timeout = Duration::from_secs(2);
        assert!(stream.recv_timeout(timeout).unwrap().is_snapshot());
        assert!(!stream.recv_timeout(timeout).unwrap().is_snapshot());
    }

    #[test]
    fn test_shutdown_disconnects_streams() {
        let dispatcher = Dispatcher::spawn(16, 16).unwrap();
        let (stream, _) = dispatcher.register(T).unwrap();
        dispatcher.shutdown();
        assert!(stream.recv_timeout(Duration::from_secs(2)).is_err());
        assert!(dispatcher.register(T).is_err());
    }
}
