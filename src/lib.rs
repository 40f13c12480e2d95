//! # vrswatch - wait for OVSDB port rows to resolve
//!
//! vrswatch monitors a table of an OVSDB server (the `Nuage_Port_Table` of a
//! virtual routing switch by default) and tells a caller, exactly once, when
//! a named port row has been given an address, gateway and mask.
//!
//! ## Core Concepts
//!
//! - **Session**: a transport connection exposing the server schema and
//!   pushing change batches to a registered handler
//! - **ConnectionManager**: owns the session, monitors each table once and
//!   reconnects with a fixed backoff
//! - **ChangeStream**: a private, table-filtered view of every batch
//! - **ResolutionWatch**: the single-use result of a resolution wait
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use vrswatch::transport::JsonRpcConnector;
//! use vrswatch::{ConnectionManager, WatchConfig};
//!
//! # fn main() -> vrswatch::WatchResult<()> {
//! let config = WatchConfig::default();
//! let connector = Arc::new(JsonRpcConnector::new(config.rpc_timeout()));
//! let manager = ConnectionManager::connect(connector, config)?;
//!
//! let watch = manager.wait_for_row_resolution("vm1-port0")?;
//! let record = watch.recv_timeout(Duration::from_secs(60))?;
//! println!("{} via {} / {}", record.address, record.gateway, record.mask);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Wire data
pub mod datum;
pub mod row;
pub mod schema;

// Plumbing
pub mod cancel;
pub mod config;
pub mod connection;
pub mod error;
pub mod monitor;
pub mod transport;

pub use cancel::CancelToken;
pub use config::WatchConfig;
pub use connection::{ConnectionManager, Subscription};
pub use datum::Datum;
pub use error::{DecodeError, TransportError, WatchError, WatchResult};
pub use monitor::{
    ChangeKind, ChangeStream, ColumnNames, Notification, NotificationKind, ResolutionRecord, ResolutionWatch,
    RowClassifier, RowTarget,
};
pub use row::{Row, RowId, RowUpdate, TableUpdates};
pub use schema::{resolve_columns, DatabaseSchema};
pub use transport::{Connector, Endpoint, Session, UpdateHandler};
