//! In-memory transport backend.
//!
//! [`InMemoryServer`] holds schemas and rows and behaves like an
//! `ovsdb-server` towards its sessions: monitors get an initial snapshot and
//! later changes are pushed to the registered [`UpdateHandler`], narrowed to
//! the monitored columns and filtered by the monitor's select flags. It is
//! intended for embedded usage and tests; connection loss and refusal can be
//! injected.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::datum::Datum;
use crate::error::TransportError;
use crate::monitor::MonitorRequest;
use crate::row::{Row, RowId, RowUpdate, TableUpdates};
use crate::schema::DatabaseSchema;

use super::{Connector, Endpoint, Session, UpdateHandler};

fn lock<'a, T>(m: &'a Mutex<T>, context: &'static str) -> Result<MutexGuard<'a, T>, TransportError> {
    m.lock().map_err(|_| TransportError::Protocol {
        message: format!("poisoned lock: {context}"),
    })
}

/// A scriptable OVSDB server living in the current process.
#[derive(Debug, Clone)]
pub struct InMemoryServer {
    inner: Arc<ServerInner>,
}

#[derive(Debug)]
struct ServerInner {
    schemas: BTreeMap<String, DatabaseSchema>,
    /// Serializes row mutation and delivery against new monitors.
    feed: Mutex<()>,
    state: Mutex<ServerState>,
    next_session: AtomicU64,
}

#[derive(Debug, Default)]
struct ServerState {
    rows: HashMap<String, BTreeMap<RowId, Row>>,
    sessions: Vec<Arc<SessionShared>>,
    refuse: usize,
    connects: usize,
    monitors_issued: usize,
}

struct SessionShared {
    id: u64,
    closed: AtomicBool,
    handler: Mutex<Option<Arc<dyn UpdateHandler>>>,
    monitors: Mutex<Vec<ActiveMonitor>>,
}

impl std::fmt::Debug for SessionShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionShared")
            .field("id", &self.id)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
struct ActiveMonitor {
    context: serde_json::Value,
    requests: BTreeMap<String, MonitorRequest>,
}

/// A change as the server stores it, before per-monitor narrowing.
enum Change {
    Insert(Row),
    Modify { before: Row, after: Row },
    Delete(Row),
}

type Delivery = (Arc<dyn UpdateHandler>, serde_json::Value, TableUpdates);

impl InMemoryServer {
    /// A server advertising `schemas`, with every table empty.
    #[must_use]
    pub fn new(schemas: impl IntoIterator<Item = DatabaseSchema>) -> Self {
        let schemas = schemas.into_iter().map(|s| (s.name.clone(), s)).collect();
        Self {
            inner: Arc::new(ServerInner {
                schemas,
                feed: Mutex::new(()),
                state: Mutex::new(ServerState::default()),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// A connector whose sessions talk to this server. The endpoint is ignored.
    #[must_use]
    pub fn connector(&self) -> InMemoryConnector {
        InMemoryConnector {
            server: self.clone(),
        }
    }

    /// Insert a row. Monitors only hear about it if they selected inserts.
    pub fn insert_row(&self, table: &str, row_id: RowId, row: Row) -> Result<(), TransportError> {
        self.mutate(table, row_id, |slot| {
            let change = Change::Insert(row.clone());
            *slot = Some(row);
            Ok(change)
        })
    }

    /// Apply `changes` to an existing row and notify monitors of the modification.
    pub fn update_row(&self, table: &str, row_id: RowId, changes: Row) -> Result<(), TransportError> {
        self.mutate(table, row_id, |slot| {
            let current = slot.as_mut().ok_or_else(|| TransportError::Rpc {
                method: "transact".to_string(),
                message: format!("no row {row_id} in table {table}"),
            })?;
            let before = current.clone();
            current.merge(&changes);
            Ok(Change::Modify {
                before,
                after: current.clone(),
            })
        })
    }

    /// Remove a row. Monitors only hear about it if they selected deletes.
    pub fn delete_row(&self, table: &str, row_id: RowId) -> Result<(), TransportError> {
        self.mutate(table, row_id, |slot| {
            slot.take().map(Change::Delete).ok_or_else(|| TransportError::Rpc {
                method: "transact".to_string(),
                message: format!("no row {row_id} in table {table}"),
            })
        })
    }

    /// Push a raw batch to every monitor covering its tables, verbatim.
    ///
    /// The batch is also applied to the stored rows, so later snapshots
    /// agree with it. This is how tests produce sparse diffs.
    pub fn publish(&self, batch: &TableUpdates) -> Result<(), TransportError> {
        let _feed = lock(&self.inner.feed, "feed")?;
        let sessions = {
            let mut state = lock(&self.inner.state, "state")?;
            for (table, row_id, update) in batch.rows() {
                let rows = state.rows.entry(table.to_string()).or_default();
                match &update.new {
                    Some(new) => rows.entry(row_id).or_default().merge(new),
                    None => {
                        rows.remove(&row_id);
                    }
                }
            }
            state.sessions.clone()
        };

        let mut deliveries: Vec<Delivery> = Vec::new();
        for session in sessions {
            let Some(handler) = session.handler()? else { continue };
            for monitor in lock(&session.monitors, "monitors")?.iter() {
                let mut out = TableUpdates::new();
                for table in monitor.requests.keys() {
                    if let Some(update) = batch.table(table) {
                        for (row_id, change) in update.rows() {
                            out.push(table.clone(), row_id, change.clone());
                        }
                    }
                }
                if !out.is_empty() {
                    deliveries.push((Arc::clone(&handler), monitor.context.clone(), out));
                }
            }
        }
        deliver(deliveries);
        Ok(())
    }

    /// Close every session as if the server went away.
    pub fn drop_connections(&self) -> Result<(), TransportError> {
        let dropped = {
            let mut state = lock(&self.inner.state, "state")?;
            std::mem::take(&mut state.sessions)
        };
        for session in dropped {
            let handler = session.handler()?;
            session.closed.store(true, Ordering::Release);
            if let Some(handler) = handler {
                debug!(session = session.id, "dropping in-memory session");
                handler.on_disconnected();
            }
        }
        Ok(())
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_connections(&self, count: usize) -> Result<(), TransportError> {
        lock(&self.inner.state, "state")?.refuse = count;
        Ok(())
    }

    /// Successful connections since the server was created.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().map(|s| s.connects).unwrap_or_default()
    }

    /// Sessions currently open.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.inner.state.lock().map(|s| s.sessions.len()).unwrap_or_default()
    }

    /// Successful monitor requests since the server was created.
    #[must_use]
    pub fn monitors_issued(&self) -> usize {
        self.inner.state.lock().map(|s| s.monitors_issued).unwrap_or_default()
    }

    fn mutate(
        &self,
        table: &str,
        row_id: RowId,
        apply: impl FnOnce(&mut Option<Row>) -> Result<Change, TransportError>,
    ) -> Result<(), TransportError> {
        let _feed = lock(&self.inner.feed, "feed")?;
        let (change, sessions) = {
            let mut state = lock(&self.inner.state, "state")?;
            let rows = state.rows.entry(table.to_string()).or_default();
            let mut slot = rows.remove(&row_id);
            let result = apply(&mut slot);
            if let Some(row) = slot {
                rows.insert(row_id, row);
            }
            (result?, state.sessions.clone())
        };

        let mut deliveries: Vec<Delivery> = Vec::new();
        for session in sessions {
            let Some(handler) = session.handler()? else { continue };
            for monitor in lock(&session.monitors, "monitors")?.iter() {
                let Some(request) = monitor.requests.get(table) else { continue };
                if let Some(update) = narrow(&change, request) {
                    let batch = TableUpdates::new().with(table, row_id, update);
                    deliveries.push((Arc::clone(&handler), monitor.context.clone(), batch));
                }
            }
        }
        deliver(deliveries);
        Ok(())
    }

    fn open_session(&self) -> Result<Arc<SessionShared>, TransportError> {
        let mut state = lock(&self.inner.state, "state")?;
        if state.refuse > 0 {
            state.refuse -= 1;
            return Err(TransportError::ConnectionFailed {
                message: "connection refused".to_string(),
            });
        }
        let shared = Arc::new(SessionShared {
            id: self.inner.next_session.fetch_add(1, Ordering::Relaxed),
            closed: AtomicBool::new(false),
            handler: Mutex::new(None),
            monitors: Mutex::new(Vec::new()),
        });
        state.connects += 1;
        state.sessions.push(Arc::clone(&shared));
        Ok(shared)
    }

    fn close_session(&self, id: u64) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.sessions.retain(|s| s.id != id);
        }
    }
}

impl SessionShared {
    fn handler(&self) -> Result<Option<Arc<dyn UpdateHandler>>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        Ok(lock(&self.handler, "handler")?.clone())
    }
}

fn deliver(deliveries: Vec<Delivery>) {
    for (handler, context, batch) in deliveries {
        handler.on_update(&context, batch);
    }
}

/// Narrow a stored change to what `request` selected and watches.
fn narrow(change: &Change, request: &MonitorRequest) -> Option<RowUpdate> {
    let columns = request.columns.iter().map(String::as_str);
    match change {
        Change::Insert(row) if request.select.insert => Some(RowUpdate::added(row.project(columns))),
        Change::Delete(row) if request.select.delete => Some(RowUpdate::deleted(row.project(columns))),
        Change::Modify { before, after } if request.select.modify => {
            let after = after.project(columns);
            // Columns absent before the change read as unset.
            let old: Row = after
                .iter()
                .filter(|(column, value)| before.get(column) != Some(*value))
                .map(|(column, _)| {
                    let previous = before.get(column).cloned().unwrap_or_else(Datum::empty_set);
                    (column.to_string(), previous)
                })
                .collect();
            if old.is_empty() {
                return None;
            }
            Some(RowUpdate::modified(old, after))
        }
        _ => None,
    }
}

/// Opens [`InMemorySession`]s on an [`InMemoryServer`].
#[derive(Debug, Clone)]
pub struct InMemoryConnector {
    server: InMemoryServer,
}

impl Connector for InMemoryConnector {
    fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Session>, TransportError> {
        let shared = self.server.open_session()?;
        debug!(session = shared.id, %endpoint, "in-memory session opened");
        Ok(Box::new(InMemorySession {
            server: self.server.clone(),
            shared,
        }))
    }
}

/// One client session on an [`InMemoryServer`].
#[derive(Debug)]
pub struct InMemorySession {
    server: InMemoryServer,
    shared: Arc<SessionShared>,
}

impl Session for InMemorySession {
    fn schema(&self, database: &str) -> Option<&DatabaseSchema> {
        self.server.inner.schemas.get(database)
    }

    fn register(&self, handler: Arc<dyn UpdateHandler>) {
        if let Ok(mut slot) = self.shared.handler.lock() {
            *slot = Some(handler);
        }
    }

    fn monitor(
        &self,
        database: &str,
        context: serde_json::Value,
        requests: &BTreeMap<String, MonitorRequest>,
    ) -> Result<TableUpdates, TransportError> {
        let rpc_err = |message: String| TransportError::Rpc {
            method: "monitor".to_string(),
            message,
        };

        if self.shared.closed.load(Ordering::Acquire) {
            return Err(TransportError::Disconnected);
        }
        let schema = self
            .schema(database)
            .ok_or_else(|| rpc_err(format!("unknown database {database}")))?;
        if let Some(table) = requests.keys().find(|t| !schema.tables.contains_key(*t)) {
            return Err(rpc_err(format!("no table named {table}")));
        }

        let _feed = lock(&self.server.inner.feed, "feed")?;
        let mut monitors = lock(&self.shared.monitors, "monitors")?;
        if monitors.iter().any(|m| m.context == context) {
            return Err(rpc_err("duplicate monitor ID".to_string()));
        }

        let mut state = lock(&self.server.inner.state, "state")?;
        let mut snapshot = TableUpdates::new();
        for (table, request) in requests {
            if !request.select.initial {
                continue;
            }
            let Some(rows) = state.rows.get(table) else { continue };
            for (row_id, row) in rows {
                let projected = row.project(request.columns.iter().map(String::as_str));
                snapshot.push(table.clone(), *row_id, RowUpdate::added(projected));
            }
        }
        state.monitors_issued += 1;

        monitors.push(ActiveMonitor {
            context,
            requests: requests.clone(),
        });
        Ok(snapshot)
    }

    fn disconnect(&self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            self.server.close_session(self.shared.id);
        }
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::build_request;
    use crate::schema::resolve_columns;
    use crossbeam_channel::{unbounded, Sender};
    use serde_json::json;
    use uuid::Uuid;

    const DB: &str = "Open_vSwitch";
    const T: &str = "Nuage_Port_Table";

    struct Capture(Sender<(serde_json::Value, TableUpdates)>);

    impl UpdateHandler for Capture {
        fn on_update(&self, context: &serde_json::Value, updates: TableUpdates) {
            let _ = self.0.send((context.clone(), updates));
        }
    }

    fn server() -> InMemoryServer {
        InMemoryServer::new([DatabaseSchema::new(DB).with_table(T, &["name", "ip_addr", "gateway", "subnet_mask"])])
    }

    fn monitor_all(session: &dyn Session) -> TableUpdates {
        let columns = resolve_columns(session, DB, T).unwrap();
        let requests = BTreeMap::from([(T.to_string(), build_request(T, &columns))]);
        session.monitor(DB, json!(T), &requests).unwrap()
    }

    #[test]
    fn test_resolve_columns_against_session() {
        let server = server();
        let session = server.connector().connect(&Endpoint::default()).unwrap();

        assert_eq!(resolve_columns(session.as_ref(), DB, T).unwrap().len(), 4);
        let err = resolve_columns(session.as_ref(), DB, "Missing").unwrap_err();
        assert!(err.is_schema_missing());
        assert!(resolve_columns(session.as_ref(), "Other_DB", T).unwrap_err().is_schema_missing());
    }

    #[test]
    fn test_snapshot_then_modify_notification() {
        let server = server();
        let id = Uuid::new_v4();
        server.insert_row(T, id, Row::new().with("name", "p1")).unwrap();

        let session = server.connector().connect(&Endpoint::default()).unwrap();
        let (tx, rx) = unbounded();
        session.register(Arc::new(Capture(tx)));

        let snapshot = monitor_all(session.as_ref());
        assert_eq!(snapshot.row_count(), 1);

        server.update_row(T, id, Row::new().with("ip_addr", "10.0.0.5")).unwrap();
        let (context, batch) = rx.try_recv().unwrap();
        assert_eq!(context, json!(T));

        let (_, _, update) = batch.rows().next().unwrap();
        assert!(update.old.as_ref().unwrap().get("ip_addr").unwrap().is_empty_set());
        assert!(update.old.as_ref().unwrap().get("name").is_none());
        assert_eq!(update.new.as_ref().unwrap().get("name").and_then(|d| d.as_str()), Some("p1"));
    }

    #[test]
    fn test_insert_and_delete_reported() {
        let server = server();
        let session = server.connector().connect(&Endpoint::default()).unwrap();
        let (tx, rx) = unbounded();
        session.register(Arc::new(Capture(tx)));
        monitor_all(session.as_ref());

        let id = Uuid::new_v4();
        server.insert_row(T, id, Row::new().with("name", "p1")).unwrap();
        server.delete_row(T, id).unwrap();

        let (_, inserted) = rx.try_recv().unwrap();
        let (_, _, update) = inserted.rows().next().unwrap();
        assert!(update.old.is_none());
        assert_eq!(update.new.as_ref().unwrap().get("name").and_then(|d| d.as_str()), Some("p1"));

        let (_, deleted) = rx.try_recv().unwrap();
        let (_, row_id, update) = deleted.rows().next().unwrap();
        assert_eq!(row_id, id);
        assert!(update.new.is_none());
    }

    #[test]
    fn test_unselected_insert_and_delete_are_silent() {
        let server = server();
        let session = server.connector().connect(&Endpoint::default()).unwrap();
        let (tx, rx) = unbounded();
        session.register(Arc::new(Capture(tx)));

        let columns = resolve_columns(session.as_ref(), DB, T).unwrap();
        let mut request = build_request(T, &columns);
        request.select.insert = false;
        request.select.delete = false;
        session
            .monitor(DB, json!(T), &BTreeMap::from([(T.to_string(), request)]))
            .unwrap();

        let id = Uuid::new_v4();
        server.insert_row(T, id, Row::new().with("name", "p1")).unwrap();
        server.delete_row(T, id).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_duplicate_monitor_id_rejected() {
        let server = server();
        let session = server.connector().connect(&Endpoint::default()).unwrap();
        monitor_all(session.as_ref());

        let columns = resolve_columns(session.as_ref(), DB, T).unwrap();
        let requests = BTreeMap::from([(T.to_string(), build_request(T, &columns))]);
        let err = session.monitor(DB, json!(T), &requests).unwrap_err();
        assert!(matches!(err, TransportError::Rpc { .. }));
        assert_eq!(server.monitors_issued(), 1);
    }

    #[test]
    fn test_drop_connections_notifies_and_refusal() {
        struct Flag(Sender<()>);
        impl UpdateHandler for Flag {
            fn on_update(&self, _: &serde_json::Value, _: TableUpdates) {}
            fn on_disconnected(&self) {
                let _ = self.0.send(());
            }
        }

        let server = server();
        let session = server.connector().connect(&Endpoint::default()).unwrap();
        let (tx, rx) = unbounded();
        session.register(Arc::new(Flag(tx)));

        server.drop_connections().unwrap();
        assert!(rx.try_recv().is_ok());
        assert_eq!(server.active_sessions(), 0);

        server.refuse_connections(1).unwrap();
        assert!(server.connector().connect(&Endpoint::default()).is_err());
        assert!(server.connector().connect(&Endpoint::default()).is_ok());
        assert_eq!(server.connection_count(), 2);
    }

    #[test]
    fn test_publish_forwards_sparse_batch() {
        let server = server();
        let id = Uuid::new_v4();
        server.insert_row(T, id, Row::new().with("name", "p1")).unwrap();

        let session = server.connector().connect(&Endpoint::default()).unwrap();
        let (tx, rx) = unbounded();
        session.register(Arc::new(Capture(tx)));
        monitor_all(session.as_ref());

        let sparse = TableUpdates::new().with(
            T,
            id,
            RowUpdate::modified(Row::new().with("gateway", ""), Row::new().with("gateway", "10.0.0.1")),
        );
        server.publish(&sparse).unwrap();
        let (_, batch) = rx.try_recv().unwrap();
        assert_eq!(batch, sparse);

        // The stored row absorbed the diff.
        let second = server.connector().connect(&Endpoint::default()).unwrap();
        let snapshot = monitor_all(second.as_ref());
        let (_, _, update) = snapshot.rows().next().unwrap();
        assert_eq!(update.new.as_ref().unwrap().get("gateway").and_then(|d| d.as_str()), Some("10.0.0.1"));
    }
}
