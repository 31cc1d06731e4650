//! Peer-connection primitive.
//!
//! Negotiation is written against [`PeerConnector`] / [`PeerLink`] only.
//! `rtc` backs them with the `webrtc` crate; `loopback` wires links together
//! in-process for tests and the CLI demo mode.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use tidepool_proto::{IceCandidate, PeerId, SessionDescription};

use crate::media::{LocalTrack, TrackKind};

pub mod loopback;
pub mod rtc;

/// Mirror of the primitive's signaling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    /// States after which the link is never used again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LinkState::Disconnected | LinkState::Failed | LinkState::Closed
        )
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LinkState::New => "new",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
            LinkState::Failed => "failed",
            LinkState::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

pub enum LinkEvent {
    IceCandidate(IceCandidate),
    StateChanged(LinkState),
    TrackReceived(RemoteTrack),
    ChannelReceived(Arc<dyn ChannelLink>),
    ChannelOpen,
    ChannelMessage(String),
    ChannelClosed,
}

impl fmt::Debug for LinkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkEvent::IceCandidate(candidate) => {
                f.debug_tuple("IceCandidate").field(candidate).finish()
            }
            LinkEvent::StateChanged(state) => f.debug_tuple("StateChanged").field(state).finish(),
            LinkEvent::TrackReceived(track) => f.debug_tuple("TrackReceived").field(track).finish(),
            LinkEvent::ChannelReceived(channel) => f
                .debug_tuple("ChannelReceived")
                .field(&channel.label())
                .finish(),
            LinkEvent::ChannelOpen => f.write_str("ChannelOpen"),
            LinkEvent::ChannelMessage(text) => {
                f.debug_tuple("ChannelMessage").field(&text.len()).finish()
            }
            LinkEvent::ChannelClosed => f.write_str("ChannelClosed"),
        }
    }
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("invalid negotiation state: {0}")]
    InvalidState(String),
    #[error("link closed")]
    Closed,
    #[error("peer connection error: {0}")]
    Backend(String),
}

impl From<webrtc::Error> for LinkError {
    fn from(err: webrtc::Error) -> Self {
        LinkError::Backend(err.to_string())
    }
}

/// Reliable ordered channel riding on a link.
#[async_trait]
pub trait ChannelLink: Send + Sync {
    fn label(&self) -> String;
    fn is_open(&self) -> bool;
    async fn send_text(&self, text: String) -> Result<(), LinkError>;
    async fn close(&self);
}

#[async_trait]
pub trait PeerLink: Send + Sync {
    fn negotiation_state(&self) -> NegotiationState;
    fn connection_state(&self) -> LinkState;
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), LinkError>;
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn ChannelLink>, LinkError>;
    async fn create_offer(&self) -> Result<SessionDescription, LinkError>;
    async fn create_answer(&self) -> Result<SessionDescription, LinkError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), LinkError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), LinkError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError>;
    async fn close(&self);
}

/// A fresh link plus the stream of everything it reports.
pub struct LinkHandle {
    pub link: Arc<dyn PeerLink>,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, remote: &PeerId) -> Result<LinkHandle, LinkError>;
}
