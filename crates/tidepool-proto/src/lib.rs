//! Shared wire definitions for tidepool peers and the signaling relay.
//! Kept in a dedicated crate so the relay service can speak the protocol
//! without pulling in the peer-connection runtime.

mod envelope;
mod ids;
mod relay_log;
mod signal;

pub use envelope::ChannelEnvelope;
pub use ids::PeerId;
pub use relay_log::{DEFAULT_RETENTION, RelayLog, RoomLogs};
pub use signal::{
    IceCandidate, OutboundSignal, SdpKind, SessionDescription, SignalKind, SignalPayload,
    SignalingMessage, WireSignal,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown signal type `{0}`")]
    UnknownSignal(String),
    #[error("{0} signal is missing its data payload")]
    MissingData(SignalKind),
    #[error("malformed {kind} payload: {source}")]
    MalformedData {
        kind: SignalKind,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown envelope type `{0}`")]
    UnknownEnvelope(String),
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
