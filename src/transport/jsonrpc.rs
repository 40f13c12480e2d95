//! OVSDB JSON-RPC transport (RFC 7047 subset).
//!
//! One reader thread per session decodes the inbound JSON value stream.
//! Replies are routed to the waiting caller by request id; `update`,
//! `locked` and `stolen` notifications go to the registered handler and
//! `echo` requests are answered in place.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use serde_json::{json, Value};
use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::monitor::MonitorRequest;
use crate::row::TableUpdates;
use crate::schema::DatabaseSchema;

use super::{Connector, Endpoint, Session, UpdateHandler};

/// Opens JSON-RPC sessions over TCP or Unix domain sockets.
#[derive(Debug, Clone)]
pub struct JsonRpcConnector {
    rpc_timeout: Duration,
}

impl JsonRpcConnector {
    /// `rpc_timeout` bounds connecting and every request.
    #[must_use]
    pub const fn new(rpc_timeout: Duration) -> Self {
        Self { rpc_timeout }
    }
}

impl Default for JsonRpcConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl Connector for JsonRpcConnector {
    fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Session>, TransportError> {
        let stream = Stream::connect(endpoint, self.rpc_timeout)?;
        let session = JsonRpcSession::start(stream, endpoint.to_string(), self.rpc_timeout)?;
        Ok(Box::new(session))
    }
}

#[derive(Debug)]
enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Stream {
    fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<Self, TransportError> {
        let failed = |message: String| TransportError::ConnectionFailed { message };
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let mut last_err = None;
                for addr in (host.as_str(), *port).to_socket_addrs()? {
                    match TcpStream::connect_timeout(&addr, timeout) {
                        Ok(stream) => {
                            stream.set_nodelay(true)?;
                            return Ok(Self::Tcp(stream));
                        }
                        Err(e) => last_err = Some(e),
                    }
                }
                Err(failed(match last_err {
                    Some(e) => format!("{endpoint}: {e}"),
                    None => format!("{endpoint}: no addresses resolved"),
                }))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => UnixStream::connect(path)
                .map(Self::Unix)
                .map_err(|e| failed(format!("{endpoint}: {e}"))),
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(failed(format!("{endpoint}: unix sockets are not supported"))),
        }
    }

    fn try_clone(&self) -> io::Result<Self> {
        match self {
            Self::Tcp(s) => s.try_clone().map(Self::Tcp),
            #[cfg(unix)]
            Self::Unix(s) => s.try_clone().map(Self::Unix),
        }
    }

    fn shutdown(&self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.shutdown(Shutdown::Both),
            #[cfg(unix)]
            Self::Unix(s) => s.shutdown(Shutdown::Both),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Self::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Self::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Self::Unix(s) => s.flush(),
        }
    }
}

type Reply = Result<Value, TransportError>;

/// A live JSON-RPC session.
#[derive(Debug)]
pub struct JsonRpcSession {
    inner: Arc<SessionInner>,
    schemas: BTreeMap<String, DatabaseSchema>,
}

struct SessionInner {
    peer: String,
    writer: Mutex<Stream>,
    pending: Mutex<HashMap<u64, (String, Sender<Reply>)>>,
    next_id: AtomicU64,
    handler: Mutex<Option<Arc<dyn UpdateHandler>>>,
    /// Set by `disconnect`; suppresses `on_disconnected`.
    closing: AtomicBool,
    closed: AtomicBool,
    rpc_timeout: Duration,
}

impl std::fmt::Debug for SessionInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionInner")
            .field("peer", &self.peer)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

fn lock<'a, T>(m: &'a Mutex<T>, context: &'static str) -> Result<MutexGuard<'a, T>, TransportError> {
    m.lock().map_err(|_| TransportError::Protocol {
        message: format!("poisoned lock: {context}"),
    })
}

impl JsonRpcSession {
    /// Start the reader thread on `stream` and fetch every advertised schema.
    fn start(stream: Stream, peer: String, rpc_timeout: Duration) -> Result<Self, TransportError> {
        let read_half = stream.try_clone()?;
        let inner = Arc::new(SessionInner {
            peer,
            writer: Mutex::new(stream),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            handler: Mutex::new(None),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            rpc_timeout,
        });

        let reader = Arc::clone(&inner);
        thread::Builder::new()
            .name("vrswatch-jsonrpc".to_string())
            .spawn(move || reader.read_loop(read_half))?;

        let mut session = Self {
            inner,
            schemas: BTreeMap::new(),
        };
        session.schemas = session.fetch_schemas()?;
        debug!(peer = %session.inner.peer, databases = session.schemas.len(), "json-rpc session ready");
        Ok(session)
    }

    fn fetch_schemas(&self) -> Result<BTreeMap<String, DatabaseSchema>, TransportError> {
        let dbs: Vec<String> = serde_json::from_value(self.inner.call("list_dbs", json!([]))?).map_err(|e| {
            TransportError::Protocol {
                message: format!("list_dbs: {e}"),
            }
        })?;

        let mut schemas = BTreeMap::new();
        for db in dbs {
            let raw = self.inner.call("get_schema", json!([db]))?;
            let schema: DatabaseSchema = serde_json::from_value(raw).map_err(|e| TransportError::Protocol {
                message: format!("get_schema {db}: {e}"),
            })?;
            schemas.insert(db, schema);
        }
        Ok(schemas)
    }
}

impl Session for JsonRpcSession {
    fn schema(&self, database: &str) -> Option<&DatabaseSchema> {
        self.schemas.get(database)
    }

    fn register(&self, handler: Arc<dyn UpdateHandler>) {
        if let Ok(mut slot) = self.inner.handler.lock() {
            *slot = Some(handler);
        }
    }

    fn monitor(
        &self,
        database: &str,
        context: Value,
        requests: &BTreeMap<String, MonitorRequest>,
    ) -> Result<TableUpdates, TransportError> {
        let requests = serde_json::to_value(requests).map_err(|e| TransportError::Protocol {
            message: format!("encode monitor request: {e}"),
        })?;
        let reply = self.inner.call("monitor", json!([database, context, requests]))?;
        TableUpdates::from_json(&reply).map_err(|e| TransportError::Protocol {
            message: format!("monitor reply: {e}"),
        })
    }

    fn disconnect(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(writer) = self.inner.writer.lock() {
            let _ = writer.shutdown();
        }
        debug!(peer = %self.inner.peer, "json-rpc session closed");
    }
}

impl Drop for JsonRpcSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl SessionInner {
    fn call(&self, method: &str, params: Value) -> Reply {
        if self.closed.load(Ordering::Acquire) || self.closing.load(Ordering::Acquire) {
            return Err(TransportError::Disconnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded::<Reply>(1);
        lock(&self.pending, "pending")?.insert(id, (method.to_string(), tx));

        trace!(peer = %self.peer, id, method, "request");
        if let Err(e) = self.send(&json!({"method": method, "params": params, "id": id})) {
            self.forget(id);
            return Err(e);
        }

        match rx.recv_timeout(self.rpc_timeout) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => {
                self.forget(id);
                Err(TransportError::Timeout {
                    method: method.to_string(),
                    duration_ms: self.rpc_timeout.as_millis().min(u128::from(u64::MAX)) as u64,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
        }
    }

    fn forget(&self, id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
    }

    fn send(&self, msg: &Value) -> Result<(), TransportError> {
        let mut writer = lock(&self.writer, "writer")?;
        serde_json::to_writer(&mut *writer, msg).map_err(|e| TransportError::Io(e.into()))?;
        writer.flush()?;
        Ok(())
    }

    fn handler(&self) -> Option<Arc<dyn UpdateHandler>> {
        self.handler.lock().ok().and_then(|h| h.clone())
    }

    fn read_loop(&self, stream: Stream) {
        let messages = serde_json::Deserializer::from_reader(BufReader::new(stream)).into_iter::<Value>();
        for msg in messages {
            match msg {
                Ok(msg) => self.route(msg),
                Err(e) => {
                    if !e.is_eof() && !self.closing.load(Ordering::Acquire) {
                        warn!(peer = %self.peer, error = %e, "json-rpc stream error");
                    }
                    break;
                }
            }
        }
        self.on_closed();
    }

    fn on_closed(&self) {
        self.closed.store(true, Ordering::Release);
        if let Ok(mut pending) = self.pending.lock() {
            for (_, (_, tx)) in pending.drain() {
                let _ = tx.try_send(Err(TransportError::Disconnected));
            }
        }
        if self.closing.load(Ordering::Acquire) {
            return;
        }
        warn!(peer = %self.peer, "json-rpc connection lost");
        if let Some(handler) = self.handler() {
            handler.on_disconnected();
        }
    }

    fn route(&self, msg: Value) {
        match msg.get("method").and_then(Value::as_str) {
            Some(method) => self.on_request(method, &msg),
            None => self.on_response(&msg),
        }
    }

    fn on_request(&self, method: &str, msg: &Value) {
        let params = msg.get("params").and_then(Value::as_array).cloned().unwrap_or_default();
        let id = msg.get("id").cloned().unwrap_or(Value::Null);

        match method {
            "echo" => {
                if let Err(e) = self.send(&json!({"result": params, "error": null, "id": id})) {
                    debug!(peer = %self.peer, error = %e, "failed to answer echo");
                }
                if let Some(handler) = self.handler() {
                    handler.on_echo(&params);
                }
            }
            "update" => {
                let [context, updates] = params.as_slice() else {
                    warn!(peer = %self.peer, "update notification with {} params", params.len());
                    return;
                };
                match TableUpdates::from_json(updates) {
                    Ok(batch) => match self.handler() {
                        Some(handler) => handler.on_update(context, batch),
                        None => trace!(peer = %self.peer, "update dropped, no handler"),
                    },
                    Err(e) => warn!(peer = %self.peer, error = %e, "skipping undecodable update"),
                }
            }
            "locked" => {
                if let Some(handler) = self.handler() {
                    handler.on_locked(&params);
                }
            }
            "stolen" => {
                if let Some(handler) = self.handler() {
                    handler.on_stolen(&params);
                }
            }
            other => {
                debug!(peer = %self.peer, method = other, "unsupported server request");
                if !id.is_null() {
                    let _ = self.send(&json!({"result": null, "error": "unknown method", "id": id}));
                }
            }
        }
    }

    fn on_response(&self, msg: &Value) {
        let Some(id) = msg.get("id").and_then(Value::as_u64) else {
            debug!(peer = %self.peer, "response without numeric id");
            return;
        };
        let Some((method, tx)) = self.pending.lock().ok().and_then(|mut p| p.remove(&id)) else {
            debug!(peer = %self.peer, id, "response for unknown or expired request");
            return;
        };

        let reply = match msg.get("error") {
            Some(err) if !err.is_null() => Err(TransportError::Rpc {
                method,
                message: error_message(err),
            }),
            _ => Ok(msg.get("result").cloned().unwrap_or(Value::Null)),
        };
        let _ = tx.try_send(reply);
    }
}

fn error_message(err: &Value) -> String {
    match err {
        Value::String(s) => s.clone(),
        Value::Object(obj) => {
            let kind = obj.get("error").and_then(Value::as_str).unwrap_or("error");
            match obj.get("details").and_then(Value::as_str) {
                Some(details) => format!("{kind}: {details}"),
                None => kind.to_string(),
            }
        }
        other => other.to_string(),
    }
}
