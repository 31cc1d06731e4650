use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, trace, warn};

use tidepool_proto::{OutboundSignal, PeerId, SignalingMessage};

use super::{RelayBackend, SignalingTransport, TransportError};

/// Signaling over a polled relay log.
///
/// Inbound: one pump task fetches everything past the cursor on every tick.
/// Outbound: one writer task appends in submission order, so an offer always
/// lands before the candidates that follow it.
pub struct PollingTransport {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn RelayBackend>,
    room: String,
    local: PeerId,
    local_name: String,
    poll_interval: Duration,
    cursor: AtomicU64,
    closed: AtomicBool,
    subscribed: AtomicBool,
    outbound: Mutex<Option<mpsc::UnboundedSender<SignalingMessage>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PollingTransport {
    pub fn new(
        backend: Arc<dyn RelayBackend>,
        room: impl Into<String>,
        local: PeerId,
        local_name: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                room: room.into(),
                local,
                local_name: local_name.into(),
                poll_interval,
                cursor: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                subscribed: AtomicBool::new(false),
                outbound: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Highest relay id seen so far.
    pub fn cursor(&self) -> u64 {
        self.inner.cursor.load(Ordering::Acquire)
    }

    fn writer(&self) -> Option<mpsc::UnboundedSender<SignalingMessage>> {
        let mut guard = self.inner.outbound.lock();
        if let Some(tx) = guard.as_ref() {
            return Some(tx.clone());
        }
        let runtime = match Handle::try_current() {
            Ok(handle) => handle,
            Err(err) => {
                warn!(target = "tidepool::transport", error = %err, "publish outside a runtime; dropping");
                return None;
            }
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let task = runtime.spawn(run_writer(Arc::clone(&self.inner), rx));
        self.inner.tasks.lock().push(task);
        *guard = Some(tx.clone());
        Some(tx)
    }
}

impl SignalingTransport for PollingTransport {
    fn publish(&self, signal: OutboundSignal) {
        if self.is_closed() {
            trace!(target = "tidepool::transport", kind = %signal.payload.kind(), "publish after close ignored");
            return;
        }
        let message = signal.stamp(&self.inner.local, &self.inner.local_name);
        if let Some(tx) = self.writer() {
            let _ = tx.send(message);
        }
    }

    fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<SignalingMessage>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.inner.subscribed.swap(true, Ordering::AcqRel) {
            return Err(TransportError::AlreadySubscribed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_pump(Arc::clone(&self.inner), tx));
        self.inner.tasks.lock().push(task);
        debug!(
            target = "tidepool::transport",
            room = %self.inner.room,
            peer = %self.inner.local,
            interval_ms = self.inner.poll_interval.as_millis() as u64,
            "signaling pump started"
        );
        Ok(rx)
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.outbound.lock().take();
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        debug!(target = "tidepool::transport", room = %self.inner.room, "transport closed");
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl Drop for PollingTransport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_pump(inner: Arc<Inner>, tx: mpsc::UnboundedSender<SignalingMessage>) {
    let mut ticker = interval(inner.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if inner.closed.load(Ordering::Acquire) {
            break;
        }
        let after = inner.cursor.load(Ordering::Acquire);
        let batch = match inner.backend.fetch(&inner.room, after, &inner.local).await {
            Ok(batch) => batch,
            Err(err) => {
                warn!(target = "tidepool::transport", error = %err, after, "poll failed; retrying next tick");
                continue;
            }
        };
        for wire in batch {
            if inner.closed.load(Ordering::Acquire) {
                return;
            }
            if let Some(id) = wire.id {
                inner.cursor.fetch_max(id, Ordering::AcqRel);
            }
            if wire.from == inner.local {
                continue;
            }
            let id = wire.id;
            match SignalingMessage::try_from(wire) {
                Ok(message) => {
                    if tx.send(message).is_err() {
                        debug!(target = "tidepool::transport", "subscriber gone; stopping pump");
                        return;
                    }
                }
                Err(err) => {
                    debug!(target = "tidepool::transport", ?id, error = %err, "skipping unreadable signal");
                }
            }
        }
    }
}

async fn run_writer(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<SignalingMessage>) {
    while let Some(message) = rx.recv().await {
        if inner.closed.load(Ordering::Acquire) {
            break;
        }
        let kind = message.kind();
        match inner.backend.append(&inner.room, &message).await {
            Ok(id) => trace!(target = "tidepool::transport", %kind, id, "signal sent"),
            Err(err) => {
                warn!(target = "tidepool::transport", %kind, error = %err, "send failed; dropping signal")
            }
        }
    }
}
