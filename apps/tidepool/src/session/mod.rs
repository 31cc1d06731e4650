//! Room session: one task that owns the orchestrator and serialises relay
//! signals, link events, user commands and the discovery ticker.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use tidepool_proto::{PeerId, ProtocolError, SignalPayload};

use crate::chat::{self, ChatMessage, FileTransferRecord, Inbound};
use crate::media::{LocalMedia, MediaDevices, MediaStatus, TrackKind, acquire_with_fallback};
use crate::orchestrator::{InboundFrame, Orchestrator, OrchestratorParts};
use crate::peer::PeerConnector;
use crate::registry::{PeerRegistry, PeerSnapshot};
use crate::transport::{PollingTransport, RelayBackend, SignalingTransport, TransportError};

pub mod lifecycle;

pub use lifecycle::{Lifecycle, LifecyclePhase};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_CHANNEL_LABEL: &str = "tidepool";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub id: PeerId,
    pub name: String,
}

impl LocalIdentity {
    pub fn new(id: PeerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// Fresh id for this process.
    pub fn generate(name: impl Into<String>) -> Self {
        Self::new(PeerId::generate(), name)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub poll_interval: Duration,
    pub discovery_interval: Duration,
    pub ice_servers: Vec<String>,
    pub channel_label: String,
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            discovery_interval: DEFAULT_DISCOVERY_INTERVAL,
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            event_capacity: 256,
        }
    }
}

impl SessionConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    pub fn with_ice_servers(mut self, servers: Vec<String>) -> Self {
        self.ice_servers = servers;
        self
    }

    pub fn with_channel_label(mut self, label: impl Into<String>) -> Self {
        self.channel_label = label.into();
        self
    }
}

/// The capabilities a session is built from.
#[derive(Clone)]
pub struct SessionBackends {
    pub relay: Arc<dyn RelayBackend>,
    pub connector: Arc<dyn PeerConnector>,
    pub media: Arc<dyn MediaDevices>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    MediaReady(MediaStatus),
    MediaChanged(MediaStatus),
    Chat(ChatMessage),
    FileOffered(FileTransferRecord),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error("no local {0} track")]
    NoTrack(TrackKind),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

enum Command {
    SendChat {
        content: String,
        reply: oneshot::Sender<Result<ChatMessage, SessionError>>,
    },
    OfferFile {
        name: String,
        size: u64,
        reply: oneshot::Sender<Result<FileTransferRecord, SessionError>>,
    },
    SetEnabled {
        kind: TrackKind,
        enabled: bool,
        reply: oneshot::Sender<Result<MediaStatus, SessionError>>,
    },
}

pub struct NetworkSession {
    identity: LocalIdentity,
    room: String,
    lifecycle: Lifecycle,
    registry: Arc<PeerRegistry>,
    events: broadcast::Sender<SessionEvent>,
    commands: mpsc::UnboundedSender<Command>,
    media_status: Arc<Mutex<Option<MediaStatus>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkSession {
    /// Join `room` and start working in the background. Must be called from
    /// within a Tokio runtime.
    pub fn start(
        room: impl Into<String>,
        identity: LocalIdentity,
        config: SessionConfig,
        backends: SessionBackends,
    ) -> Self {
        let room = room.into();
        let lifecycle = Lifecycle::new();
        let registry = Arc::new(PeerRegistry::new());
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let media_status = Arc::new(Mutex::new(None));
        let transport = Arc::new(PollingTransport::new(
            Arc::clone(&backends.relay),
            room.clone(),
            identity.id.clone(),
            identity.name.clone(),
            config.poll_interval,
        ));

        lifecycle.start();
        info!(target = "tidepool::session", room = %room, peer = %identity.id, name = %identity.name, "joining room");

        let task = SessionTask {
            identity: identity.clone(),
            config,
            lifecycle: lifecycle.clone(),
            registry: Arc::clone(&registry),
            transport,
            connector: backends.connector,
            media: backends.media,
            events: events.clone(),
            commands: commands_rx,
            media_status: Arc::clone(&media_status),
        };
        let handle = tokio::spawn(task.run());

        Self {
            identity,
            room,
            lifecycle,
            registry,
            events,
            commands: commands_tx,
            media_status,
            task: Mutex::new(Some(handle)),
        }
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.lifecycle.phase()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_peers(&self) -> broadcast::Receiver<PeerSnapshot> {
        self.registry.subscribe()
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        self.registry.snapshot()
    }

    /// `None` until local media has been settled.
    pub fn media_status(&self) -> Option<MediaStatus> {
        *self.media_status.lock()
    }

    pub async fn send_chat(&self, content: impl Into<String>) -> Result<ChatMessage, SessionError> {
        let content = content.into();
        self.request(|reply| Command::SendChat { content, reply }).await
    }

    pub async fn offer_file(
        &self,
        name: impl Into<String>,
        size: u64,
    ) -> Result<FileTransferRecord, SessionError> {
        let name = name.into();
        self.request(|reply| Command::OfferFile { name, size, reply })
            .await
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<MediaStatus, SessionError> {
        self.request(|reply| Command::SetEnabled {
            kind: TrackKind::Video,
            enabled,
            reply,
        })
        .await
    }

    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<MediaStatus, SessionError> {
        self.request(|reply| Command::SetEnabled {
            kind: TrackKind::Audio,
            enabled,
            reply,
        })
        .await
    }

    /// Leave the room and wait for teardown. Safe to repeat.
    pub async fn close(&self) {
        if self.lifecycle.close() {
            info!(target = "tidepool::session", room = %self.room, "leaving room");
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(target = "tidepool::session", error = %err, "session task ended abnormally");
            }
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, SessionError>>) -> Command,
    ) -> Result<T, SessionError> {
        if !self.lifecycle.is_running() {
            return Err(SessionError::Closed);
        }
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| SessionError::Closed)?;
        response.await.map_err(|_| SessionError::Closed)?
    }
}

impl Drop for NetworkSession {
    fn drop(&mut self) {
        self.lifecycle.close();
    }
}

struct SessionTask {
    identity: LocalIdentity,
    config: SessionConfig,
    lifecycle: Lifecycle,
    registry: Arc<PeerRegistry>,
    transport: Arc<PollingTransport>,
    connector: Arc<dyn PeerConnector>,
    media: Arc<dyn MediaDevices>,
    events: broadcast::Sender<SessionEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    media_status: Arc<Mutex<Option<MediaStatus>>>,
}

impl SessionTask {
    async fn run(mut self) {
        let media = tokio::select! {
            media = acquire_with_fallback(self.media.as_ref()) => Some(media),
            _ = self.lifecycle.closed() => None,
        };
        match media {
            Some(media) if self.lifecycle.is_running() => {
                let mut orchestrator = None;
                self.serve(&media, &mut orchestrator).await;
                self.teardown(Some(&media), orchestrator).await;
            }
            Some(media) => {
                debug!(target = "tidepool::session", "media settled after close; discarding");
                self.teardown(Some(&media), None).await;
            }
            None => self.teardown(None, None).await,
        }
    }

    async fn serve(&mut self, media: &LocalMedia, slot: &mut Option<Orchestrator>) {
        let status = media.status();
        *self.media_status.lock() = Some(status);
        self.emit(SessionEvent::MediaReady(status));

        let mut signals = match self.transport.subscribe() {
            Ok(signals) => signals,
            Err(err) => {
                warn!(target = "tidepool::session", error = %err, "cannot subscribe to signaling");
                return;
            }
        };
        let (link_tx, mut link_rx) = mpsc::unbounded_channel();
        let orchestrator = slot.insert(Orchestrator::new(OrchestratorParts {
            local: self.identity.id.clone(),
            registry: Arc::clone(&self.registry),
            connector: Arc::clone(&self.connector),
            transport: self.transport.clone(),
            lifecycle: self.lifecycle.clone(),
            stream: Arc::clone(&media.stream),
            channel_label: self.config.channel_label.clone(),
            link_events: link_tx,
        }));

        let mut discovery = interval(self.config.discovery_interval);
        discovery.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.lifecycle.closed() => break,
                Some(command) = self.commands.recv() => {
                    self.handle_command(command, media).await;
                }
                Some(message) = signals.recv() => {
                    orchestrator.handle_signal(message).await;
                }
                Some(event) = link_rx.recv() => {
                    if let Some(frame) = orchestrator.handle_link_event(event).await {
                        self.deliver(frame);
                    }
                }
                _ = discovery.tick() => {
                    self.transport.broadcast(SignalPayload::PeerDiscovery);
                }
            }
        }
    }

    async fn handle_command(&self, command: Command, media: &LocalMedia) {
        match command {
            Command::SendChat { content, reply } => {
                let result = chat::send_text(&self.registry, &self.identity, content)
                    .await
                    .map_err(SessionError::from);
                if let Ok(message) = &result {
                    self.emit(SessionEvent::Chat(message.clone()));
                }
                let _ = reply.send(result);
            }
            Command::OfferFile { name, size, reply } => {
                let result = chat::offer_file(&self.registry, &self.identity, name, size)
                    .await
                    .map_err(SessionError::from);
                if let Ok(record) = &result {
                    self.emit(SessionEvent::FileOffered(record.clone()));
                }
                let _ = reply.send(result);
            }
            Command::SetEnabled {
                kind,
                enabled,
                reply,
            } => {
                let result = if media.stream.set_enabled(kind, enabled) {
                    let status = media.status();
                    *self.media_status.lock() = Some(status);
                    self.emit(SessionEvent::MediaChanged(status));
                    debug!(target = "tidepool::session", %kind, enabled, "local track toggled");
                    Ok(status)
                } else {
                    Err(SessionError::NoTrack(kind))
                };
                let _ = reply.send(result);
            }
        }
    }

    fn deliver(&self, frame: InboundFrame) {
        match chat::receive(&frame) {
            Ok(Inbound::Chat(message)) => self.emit(SessionEvent::Chat(message)),
            Ok(Inbound::File(record)) => self.emit(SessionEvent::FileOffered(record)),
            Err(err) => {
                debug!(target = "tidepool::session", peer = %frame.from, error = %err, "dropping channel frame");
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        if self.lifecycle.is_running() {
            let _ = self.events.send(event);
        }
    }

    async fn teardown(&mut self, media: Option<&LocalMedia>, orchestrator: Option<Orchestrator>) {
        self.transport.close();
        if let Some(mut orchestrator) = orchestrator {
            orchestrator.shutdown();
        }
        self.registry.shutdown().await;
        if let Some(media) = media {
            media.stream.stop();
        }
        self.commands.close();
        debug!(target = "tidepool::session", peer = %self.identity.id, "session torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaMode, StaticMediaDevices};
    use crate::peer::loopback::LoopbackNetwork;
    use crate::transport::MemoryRelay;
    use tokio::time::timeout;

    fn backends(relay: &MemoryRelay, network: &LoopbackNetwork, id: &PeerId, camera: bool) -> SessionBackends {
        SessionBackends {
            relay: Arc::new(relay.clone()),
            connector: Arc::new(network.connector(id.clone())),
            media: Arc::new(StaticMediaDevices::new(camera, true)),
        }
    }

    fn fast() -> SessionConfig {
        SessionConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_discovery_interval(Duration::from_millis(50))
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = SessionConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.discovery_interval, Duration::from_secs(3));
        assert_eq!(config.ice_servers, vec![DEFAULT_STUN_SERVER.to_string()]);
    }

    #[tokio::test]
    async fn discovery_is_broadcast_right_away() {
        let relay = MemoryRelay::new();
        let network = LoopbackNetwork::new();
        let identity = LocalIdentity::new(PeerId::from("peer-1"), "solo");
        let session = NetworkSession::start(
            "lobby",
            identity.clone(),
            SessionConfig::default(),
            backends(&relay, &network, &identity.id, true),
        );
        timeout(Duration::from_secs(2), async {
            while relay.log("lobby").is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("discovery published");
        session.close().await;
    }

    #[tokio::test]
    async fn toggles_report_missing_tracks() {
        let relay = MemoryRelay::new();
        let network = LoopbackNetwork::new();
        let identity = LocalIdentity::new(PeerId::from("peer-1"), "solo");
        let session = NetworkSession::start(
            "lobby",
            identity.clone(),
            fast(),
            backends(&relay, &network, &identity.id, false),
        );
        let status = session.set_audio_enabled(false).await.expect("audio toggle");
        assert_eq!(status.mode, MediaMode::AudioOnly);
        assert!(!status.audio_enabled);
        assert!(matches!(
            session.set_video_enabled(true).await,
            Err(SessionError::NoTrack(TrackKind::Video))
        ));
        session.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_final() {
        let relay = MemoryRelay::new();
        let network = LoopbackNetwork::new();
        let identity = LocalIdentity::new(PeerId::from("peer-1"), "solo");
        let session = NetworkSession::start(
            "lobby",
            identity.clone(),
            fast(),
            backends(&relay, &network, &identity.id, true),
        );
        let mut events = session.subscribe();
        session.close().await;
        session.close().await;
        assert_eq!(session.phase(), LifecyclePhase::Closed);
        assert!(matches!(session.send_chat("late").await, Err(SessionError::Closed)));

        let settled = relay.log("lobby").len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(relay.log("lobby").len(), settled);
        while let Ok(event) = events.try_recv() {
            assert!(matches!(event, SessionEvent::MediaReady(_)));
        }
    }
}
