//! Connection management.
//!
//! [`ConnectionManager`] owns the transport session, the dispatcher worker
//! and a reconnect supervisor. Each table is monitored at most once per
//! session; every caller gets a private stream fed by the dispatcher.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use serde_json::json;
use tracing::{debug, info, trace, warn};

use crate::cancel::CancelToken;
use crate::config::WatchConfig;
use crate::error::{WatchError, WatchResult};
use crate::monitor::dispatcher::{DispatchMsg, Dispatcher};
use crate::monitor::watcher::WatcherTask;
use crate::monitor::{build_request, ChangeStream, MonitorRequest, Notification, ResolutionWatch};
use crate::row::TableUpdates;
use crate::schema::resolve_columns;
use crate::transport::{Connector, Session, UpdateHandler};

/// Result of [`ConnectionManager::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    /// Rows of the table at registration time.
    pub initial: TableUpdates,
    /// Every later batch touching the table, in transport order.
    pub stream: ChangeStream,
}

/// Owns one session to one server.
///
/// Dropping the manager stops reconnection, closes the session and ends
/// every stream and watch created from it.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    connector: Arc<dyn Connector>,
    config: WatchConfig,
    state: Mutex<SessionState>,
    generation: AtomicU64,
    dispatcher: Dispatcher,
    lost_tx: Sender<u64>,
    shutdown: CancelToken,
}

#[derive(Default)]
struct SessionState {
    session: Option<Box<dyn Session>>,
    monitored: BTreeMap<String, MonitorRequest>,
}

/// The handler registered on each session; stale generations are ignored.
struct SessionHandler {
    generation: u64,
    dispatch_tx: Sender<DispatchMsg>,
    lost_tx: Sender<u64>,
    shutdown: CancelToken,
}

impl UpdateHandler for SessionHandler {
    fn on_update(&self, context: &serde_json::Value, updates: TableUpdates) {
        trace!(generation = self.generation, %context, rows = updates.row_count(), "update received");
        let msg = DispatchMsg::Notify(Notification::update(updates));
        // Blocks while the dispatcher is saturated.
        select! {
            send(self.dispatch_tx, msg) -> _ => {}
            recv(self.shutdown.receiver()) -> _ => {}
        }
    }

    fn on_disconnected(&self) {
        let _ = self.lost_tx.try_send(self.generation);
    }

    fn on_echo(&self, args: &[serde_json::Value]) {
        trace!(generation = self.generation, ?args, "echo");
    }
}

impl ConnectionManager {
    /// Connect once; fails fast if the server is unreachable.
    pub fn connect(connector: Arc<dyn Connector>, config: WatchConfig) -> WatchResult<Self> {
        config.validate()?;
        let session = connector.connect(&config.endpoint)?;
        info!(endpoint = %config.endpoint, "connected");
        Self::start(connector, config, session)
    }

    /// Connect, retrying at the configured fixed interval until success or `cancel` fires.
    pub fn connect_with_retry(
        connector: Arc<dyn Connector>,
        config: WatchConfig,
        cancel: &CancelToken,
    ) -> WatchResult<Self> {
        config.validate()?;
        let mut attempt: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(WatchError::Cancelled);
            }
            attempt += 1;
            match connector.connect(&config.endpoint) {
                Ok(session) => {
                    info!(endpoint = %config.endpoint, attempt, "connected");
                    return Self::start(connector, config, session);
                }
                Err(e) => {
                    warn!(
                        endpoint = %config.endpoint,
                        attempt,
                        error = %e,
                        "connection attempt failed, retrying in {:?}",
                        config.retry_interval()
                    );
                }
            }
            if cancel.wait_timeout(config.retry_interval()) {
                return Err(WatchError::Cancelled);
            }
        }
    }

    fn start(connector: Arc<dyn Connector>, config: WatchConfig, session: Box<dyn Session>) -> WatchResult<Self> {
        let dispatcher = Dispatcher::spawn(config.inbound_capacity, config.subscriber_capacity)?;
        let (lost_tx, lost_rx) = unbounded::<u64>();

        let shared = Arc::new(Shared {
            connector,
            config,
            state: Mutex::new(SessionState::default()),
            generation: AtomicU64::new(0),
            dispatcher,
            lost_tx,
            shutdown: CancelToken::new(),
        });
        shared.install(&mut *shared.lock_state()?, session);

        let worker = Arc::clone(&shared);
        let supervisor = thread::Builder::new()
            .name("vrswatch-reconnect".to_string())
            .spawn(move || worker.supervise(&lost_rx))
            .map_err(|e| WatchError::internal(format!("failed to spawn reconnect supervisor: {e}")))?;

        Ok(Self {
            shared,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    /// The configuration this manager was created with.
    #[must_use]
    pub fn config(&self) -> &WatchConfig {
        &self.shared.config
    }

    /// True while a session is established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().map(|s| s.session.is_some()).unwrap_or(false)
    }

    /// Tables with an active monitor on the current session.
    #[must_use]
    pub fn monitored_tables(&self) -> Vec<String> {
        self.shared
            .state
            .lock()
            .map(|s| s.monitored.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Monitor `table` (once per session) and open a private stream on it.
    ///
    /// # Errors
    /// `SchemaMissing` if the server does not know the table, `Subscription`
    /// if the monitor request is rejected, `Disconnected` while reconnecting.
    pub fn subscribe(&self, table: &str) -> WatchResult<Subscription> {
        if table.is_empty() {
            return Err(WatchError::InvalidArgument {
                reason: "table must not be empty".to_string(),
            });
        }
        self.shared.ensure_monitored(table)?;
        let (stream, initial) = self.shared.dispatcher.register(table)?;
        debug!(%table, subscription_id = %stream.subscription_id(), rows = initial.row_count(), "subscribed");
        Ok(Subscription { initial, stream })
    }

    /// Wait for the port row named `target` to have address, gateway and mask set.
    ///
    /// If the current rows already satisfy the predicate the returned watch
    /// holds the record and no background thread is started.
    pub fn wait_for_row_resolution(&self, target: &str) -> WatchResult<ResolutionWatch> {
        if target.is_empty() {
            return Err(WatchError::InvalidArgument {
                reason: "target row name must not be empty".to_string(),
            });
        }

        let Subscription { initial, stream } = self.subscribe(&self.shared.config.table)?;
        let mut task = WatcherTask::new(target, self.shared.config.columns.clone());

        if let Some(record) = task.observe(&Notification::snapshot(initial)) {
            info!(target_row = %target, address = %record.address, "row already resolved");
            return Ok(ResolutionWatch::satisfied(target, record));
        }

        let (result_tx, result_rx) = bounded(1);
        let cancel = CancelToken::new();
        let join = task.spawn(stream, result_tx, cancel.clone())?;
        debug!(target_row = %target, "watching for resolution");
        Ok(ResolutionWatch::pending(target, result_rx, cancel, join))
    }

    /// Stop reconnecting, close the session and end all streams. Idempotent.
    pub fn disconnect(&self) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        self.shared.shutdown.cancel();
        if let Ok(mut state) = self.shared.state.lock() {
            if let Some(session) = state.session.take() {
                session.disconnect();
            }
        }
        self.shared.dispatcher.shutdown();
        info!(endpoint = %self.shared.config.endpoint, "disconnected");
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.shared.config.endpoint)
            .field("generation", &self.shared.generation.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect();
        if let Ok(mut guard) = self.supervisor.lock() {
            // Detach; the supervisor exits once it observes shutdown.
            drop(guard.take());
        }
    }
}

impl Shared {
    fn lock_state(&self) -> WatchResult<MutexGuard<'_, SessionState>> {
        self.state
            .lock()
            .map_err(|_| WatchError::internal("poisoned lock: session state"))
    }

    /// Make `session` current under a new generation.
    fn install(&self, state: &mut SessionState, session: Box<dyn Session>) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        session.register(Arc::new(SessionHandler {
            generation,
            dispatch_tx: self.dispatcher.sender(),
            lost_tx: self.lost_tx.clone(),
            shutdown: self.shutdown.clone(),
        }));
        state.session = Some(session);
    }

    fn ensure_monitored(&self, table: &str) -> WatchResult<()> {
        let mut state = self.lock_state()?;
        if state.monitored.contains_key(table) {
            return Ok(());
        }
        let session = state
            .session
            .as_deref()
            .ok_or_else(|| WatchError::disconnected("session"))?;
        let request = self.issue_monitor(session, table)?;
        state.monitored.insert(table.to_string(), request);
        info!(%table, "monitor established");
        Ok(())
    }

    /// Issue the monitor for `table` and push its reply to the dispatcher as a snapshot.
    ///
    /// Callers hold the session lock, so requests never interleave.
    fn issue_monitor(&self, session: &dyn Session, table: &str) -> WatchResult<MonitorRequest> {
        let database = &self.config.database;
        let columns = resolve_columns(session, database, table)?;
        let request = build_request(table, &columns);
        let requests = BTreeMap::from([(table.to_string(), request.clone())]);

        self.dispatcher.await_snapshot(table)?;
        match session.monitor(database, json!(table), &requests) {
            Ok(mut snapshot) => {
                snapshot.ensure_table(table);
                self.dispatcher.notify(Notification::snapshot(snapshot))?;
                Ok(request)
            }
            Err(e) => {
                self.dispatcher.abandon_snapshot(table);
                Err(WatchError::Subscription {
                    table: table.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    fn supervise(&self, lost_rx: &Receiver<u64>) {
        loop {
            select! {
                recv(lost_rx) -> msg => {
                    let Ok(generation) = msg else { return };
                    if generation != self.generation.load(Ordering::Acquire) {
                        trace!(generation, "ignoring loss of stale session");
                        continue;
                    }
                    warn!(endpoint = %self.config.endpoint, generation, "session lost");
                    self.reconnect();
                }
                recv(self.shutdown.receiver()) -> _ => return,
            }
        }
    }

    fn reconnect(&self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(session) = state.session.take() {
                session.disconnect();
            }
        }

        let interval = self.config.retry_interval();
        let mut attempt: u64 = 0;
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            attempt += 1;
            match self.connector.connect(&self.config.endpoint) {
                Ok(session) => match self.resume(session) {
                    Ok(()) => {
                        info!(endpoint = %self.config.endpoint, attempt, "reconnected");
                        return;
                    }
                    Err(e) => warn!(attempt, error = %e, "failed to restore monitors, retrying in {:?}", interval),
                },
                Err(e) => warn!(
                    endpoint = %self.config.endpoint,
                    attempt,
                    error = %e,
                    "reconnect failed, retrying in {:?}",
                    interval
                ),
            }
            if self.shutdown.wait_timeout(interval) {
                return;
            }
        }
    }

    /// Install a fresh session and re-issue every monitor it had before.
    fn resume(&self, session: Box<dyn Session>) -> WatchResult<()> {
        let mut state = self.lock_state()?;
        if self.shutdown.is_cancelled() {
            session.disconnect();
            return Ok(());
        }
        self.install(&mut state, session);

        let tables: Vec<String> = state.monitored.keys().cloned().collect();
        for table in tables {
            let result = match state.session.as_deref() {
                Some(session) => self.issue_monitor(session, &table),
                None => Err(WatchError::disconnected("session")),
            };
            match result {
                Ok(request) => {
                    state.monitored.insert(table, request);
                }
                Err(e) => {
                    if let Some(session) = state.session.take() {
                        session.disconnect();
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}
