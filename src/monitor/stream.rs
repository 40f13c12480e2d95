//! Per-subscriber change streams.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::error::{WatchError, WatchResult};

use super::dispatcher::DispatchMsg;
use super::notification::{Notification, SubscriptionId};

/// A private, table-filtered stream of change batches.
///
/// Dropping this stream attempts best-effort unregistration.
#[derive(Debug)]
pub struct ChangeStream {
    subscription_id: SubscriptionId,
    table: String,
    rx: Receiver<Notification>,
    dispatch_tx: Sender<DispatchMsg>,
    unregistered: AtomicBool,
}

impl ChangeStream {
    pub(crate) fn new(
        subscription_id: SubscriptionId,
        table: String,
        rx: Receiver<Notification>,
        dispatch_tx: Sender<DispatchMsg>,
    ) -> Self {
        Self {
            subscription_id,
            table,
            rx,
            dispatch_tx,
            unregistered: AtomicBool::new(false),
        }
    }

    /// The subscription id backing this stream.
    #[must_use]
    pub const fn subscription_id(&self) -> SubscriptionId {
        self.subscription_id
    }

    /// The table this stream is filtered to.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    pub(crate) fn receiver(&self) -> &Receiver<Notification> {
        &self.rx
    }

    /// Best-effort explicit unregistration. Non-blocking and idempotent.
    pub fn unsubscribe(&self) {
        if self.unregistered.swap(true, Ordering::AcqRel) {
            return;
        }

        let _ = self.dispatch_tx.try_send(DispatchMsg::Unregister {
            subscription_id: self.subscription_id,
        });
    }

    /// Receive the next batch (blocking).
    pub fn recv(&self) -> WatchResult<Notification> {
        self.rx.recv().map_err(|_| WatchError::disconnected("change_stream"))
    }

    /// Receive the next batch with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> WatchResult<Notification> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => WatchError::Timeout {
                duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            },
            RecvTimeoutError::Disconnected => WatchError::disconnected("change_stream"),
        })
    }

    /// Receive a batch if one is queued.
    pub fn try_recv(&self) -> WatchResult<Option<Notification>> {
        match self.rx.try_recv() {
            Ok(n) => Ok(Some(n)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(WatchError::disconnected("change_stream")),
        }
    }
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        // Best-effort: do not block on shutdown.
        self.unsubscribe();
    }
}
