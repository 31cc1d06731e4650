use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::mpsc;

use tidepool_proto::{OutboundSignal, ProtocolError, SignalPayload, SignalingMessage};

pub mod polling;
pub mod relay;

pub use polling::PollingTransport;
pub use relay::{HttpRelayBackend, MemoryRelay, RelayBackend, normalize_relay_url};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport already has a subscriber")]
    AlreadySubscribed,
    #[error("transport closed")]
    Closed,
    #[error("relay unreachable")]
    Offline,
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),
    #[error("relay request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected relay status {0}")]
    HttpStatus(StatusCode),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Room-scoped signaling: fire-and-forget publish plus exactly one
/// subscriber receiving relay-delivered messages in arrival order.
pub trait SignalingTransport: Send + Sync {
    /// Stamp the local identity onto `signal` and queue it for the relay.
    /// Failures are logged by the transport, never returned.
    fn publish(&self, signal: OutboundSignal);

    /// Start delivery. A second call is rejected.
    fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<SignalingMessage>, TransportError>;

    /// Stop polling and sending. Safe to repeat.
    fn close(&self);

    fn is_closed(&self) -> bool;

    fn broadcast(&self, payload: SignalPayload) {
        self.publish(OutboundSignal::broadcast(payload));
    }
}
