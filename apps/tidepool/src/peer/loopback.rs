//! In-process peer links.
//!
//! Links created through connectors of one [`LoopbackNetwork`] find each other
//! through the endpoint number embedded in their session descriptions, so two
//! sessions sharing a network negotiate exactly as they would over the
//! `webrtc` backend, minus the wire.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use tidepool_proto::{IceCandidate, PeerId, SdpKind, SessionDescription};

use super::{
    ChannelLink, LinkError, LinkEvent, LinkHandle, LinkState, NegotiationState, PeerConnector,
    PeerLink, RemoteTrack,
};
use crate::media::LocalTrack;

const SDP_PREFIX: &str = "loopback:";
const BASE_PORT: u64 = 40_000;

#[derive(Default)]
struct NetworkInner {
    next_endpoint: AtomicU64,
    endpoints: Mutex<HashMap<u64, Arc<LoopbackLink>>>,
    latest: Mutex<HashMap<(PeerId, PeerId), Arc<LoopbackLink>>>,
}

/// Shared switchboard. Cheap to clone.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self, local: PeerId) -> LoopbackConnector {
        LoopbackConnector {
            network: self.clone(),
            local,
        }
    }

    /// Most recent link `local` opened towards `remote`.
    pub fn link(&self, local: &PeerId, remote: &PeerId) -> Option<Arc<LoopbackLink>> {
        self.inner
            .latest
            .lock()
            .get(&(local.clone(), remote.clone()))
            .cloned()
    }

    /// Drive the named link into `Failed`, as a dropped path would.
    pub fn fail_link(&self, local: &PeerId, remote: &PeerId) -> bool {
        match self.link(local, remote) {
            Some(link) => {
                link.transition(LinkState::Failed);
                true
            }
            None => false,
        }
    }

    pub fn link_count(&self) -> usize {
        self.inner.endpoints.lock().len()
    }

    fn register(&self, link: Arc<LoopbackLink>) {
        self.inner
            .endpoints
            .lock()
            .insert(link.endpoint, Arc::clone(&link));
        self.inner
            .latest
            .lock()
            .insert((link.local.clone(), link.remote.clone()), link);
    }

    fn endpoint(&self, endpoint: u64) -> Option<Arc<LoopbackLink>> {
        self.inner.endpoints.lock().get(&endpoint).cloned()
    }

    fn forget(&self, endpoint: u64) {
        self.inner.endpoints.lock().remove(&endpoint);
    }
}

pub struct LoopbackConnector {
    network: LoopbackNetwork,
    local: PeerId,
}

#[async_trait]
impl PeerConnector for LoopbackConnector {
    async fn connect(&self, remote: &PeerId) -> Result<LinkHandle, LinkError> {
        let endpoint = self.network.inner.next_endpoint.fetch_add(1, Ordering::Relaxed) + 1;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let link = Arc::new(LoopbackLink {
            endpoint,
            local: self.local.clone(),
            remote: remote.clone(),
            network: self.network.clone(),
            events: events_tx,
            state: Mutex::new(LinkInner {
                negotiation: NegotiationState::Stable,
                connection: LinkState::New,
                remote_endpoint: None,
                local_set: false,
            }),
            tracks: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
        });
        self.network.register(Arc::clone(&link));
        trace!(target = "tidepool::peer::loopback", endpoint, local = %self.local, remote = %remote, "link created");
        Ok(LinkHandle {
            link,
            events: events_rx,
        })
    }
}

struct LinkInner {
    negotiation: NegotiationState,
    connection: LinkState,
    remote_endpoint: Option<u64>,
    local_set: bool,
}

pub struct LoopbackLink {
    endpoint: u64,
    local: PeerId,
    remote: PeerId,
    network: LoopbackNetwork,
    events: mpsc::UnboundedSender<LinkEvent>,
    state: Mutex<LinkInner>,
    tracks: Mutex<Vec<Arc<LocalTrack>>>,
    channels: Mutex<Vec<Arc<LoopbackChannel>>>,
    applied: Mutex<Vec<IceCandidate>>,
}

impl LoopbackLink {
    /// Remote candidates accepted so far, in order.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.applied.lock().clone()
    }

    pub fn attached_tracks(&self) -> usize {
        self.tracks.lock().len()
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    fn transition(&self, next: LinkState) {
        {
            let mut guard = self.state.lock();
            if guard.connection == next || guard.connection == LinkState::Closed {
                return;
            }
            guard.connection = next;
        }
        self.emit(LinkEvent::StateChanged(next));
    }

    fn description(&self, kind: SdpKind) -> SessionDescription {
        SessionDescription {
            kind,
            sdp: format!("{SDP_PREFIX}{}", self.endpoint),
        }
    }

    fn host_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
                self.endpoint,
                BASE_PORT + self.endpoint
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    fn ensure_open(&self) -> Result<(), LinkError> {
        if self.state.lock().negotiation == NegotiationState::Closed {
            return Err(LinkError::Closed);
        }
        Ok(())
    }

    /// Offerer side, once the answer is in: both ends go live.
    fn pair_with(self: &Arc<Self>, answerer: &Arc<LoopbackLink>) {
        self.transition(LinkState::Connected);
        answerer.transition(LinkState::Connected);

        for track in answerer.tracks.lock().iter() {
            self.emit(LinkEvent::TrackReceived(RemoteTrack {
                id: track.id().to_string(),
                kind: track.kind(),
            }));
        }
        for track in self.tracks.lock().iter() {
            answerer.emit(LinkEvent::TrackReceived(RemoteTrack {
                id: track.id().to_string(),
                kind: track.kind(),
            }));
        }

        let offered: Vec<Arc<LoopbackChannel>> = self.channels.lock().clone();
        for channel in offered {
            let mirror = Arc::new(LoopbackChannel::new(
                channel.label.clone(),
                answerer.events.clone(),
            ));
            *mirror.peer.lock() = Some(Arc::clone(&channel));
            *channel.peer.lock() = Some(Arc::clone(&mirror));
            mirror.open.store(true, Ordering::Release);
            channel.open.store(true, Ordering::Release);
            answerer.channels.lock().push(Arc::clone(&mirror));
            answerer.emit(LinkEvent::ChannelReceived(mirror));
            answerer.emit(LinkEvent::ChannelOpen);
            self.emit(LinkEvent::ChannelOpen);
        }
        debug!(
            target = "tidepool::peer::loopback",
            offerer = %self.local,
            answerer = %answerer.local,
            "loopback link established"
        );
    }
}

fn parse_endpoint(desc: &SessionDescription) -> Result<u64, LinkError> {
    desc.sdp
        .strip_prefix(SDP_PREFIX)
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| LinkError::Backend(format!("unrecognised description `{}`", desc.sdp)))
}

#[async_trait]
impl PeerLink for LoopbackLink {
    fn negotiation_state(&self) -> NegotiationState {
        self.state.lock().negotiation
    }

    fn connection_state(&self) -> LinkState {
        self.state.lock().connection
    }

    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), LinkError> {
        self.ensure_open()?;
        self.tracks.lock().push(track);
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn ChannelLink>, LinkError> {
        self.ensure_open()?;
        let channel = Arc::new(LoopbackChannel::new(label.to_string(), self.events.clone()));
        self.channels.lock().push(Arc::clone(&channel));
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription, LinkError> {
        self.ensure_open()?;
        Ok(self.description(SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, LinkError> {
        let state = self.negotiation_state();
        if state != NegotiationState::HaveRemoteOffer {
            return Err(LinkError::InvalidState(format!(
                "create_answer in {state:?}"
            )));
        }
        Ok(self.description(SdpKind::Answer))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), LinkError> {
        {
            let mut guard = self.state.lock();
            guard.negotiation = match (desc.kind, guard.negotiation) {
                (SdpKind::Offer, NegotiationState::Stable) => NegotiationState::HaveLocalOffer,
                (SdpKind::Answer, NegotiationState::HaveRemoteOffer) => NegotiationState::Stable,
                (kind, state) => {
                    return Err(LinkError::InvalidState(format!(
                        "local {kind:?} in {state:?}"
                    )));
                }
            };
            guard.local_set = true;
        }
        self.emit(LinkEvent::IceCandidate(self.host_candidate()));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), LinkError> {
        let remote_endpoint = parse_endpoint(&desc)?;
        let completes_offer = {
            let mut guard = self.state.lock();
            let next = match (desc.kind, guard.negotiation) {
                (SdpKind::Offer, NegotiationState::Stable | NegotiationState::HaveLocalOffer) => {
                    NegotiationState::HaveRemoteOffer
                }
                (SdpKind::Answer, NegotiationState::HaveLocalOffer) => NegotiationState::Stable,
                (kind, state) => {
                    return Err(LinkError::InvalidState(format!(
                        "remote {kind:?} in {state:?}"
                    )));
                }
            };
            guard.negotiation = next;
            guard.remote_endpoint = Some(remote_endpoint);
            desc.kind == SdpKind::Answer
        };
        self.transition(LinkState::Connecting);

        if completes_offer {
            let answerer = self.network.endpoint(remote_endpoint).ok_or_else(|| {
                LinkError::Backend(format!("endpoint {remote_endpoint} is gone"))
            })?;
            let this = self
                .network
                .endpoint(self.endpoint)
                .ok_or(LinkError::Closed)?;
            this.pair_with(&answerer);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
        let guard = self.state.lock();
        if guard.negotiation == NegotiationState::Closed {
            return Err(LinkError::Closed);
        }
        if guard.remote_endpoint.is_none() {
            return Err(LinkError::InvalidState(
                "candidate before remote description".into(),
            ));
        }
        drop(guard);
        self.applied.lock().push(candidate);
        Ok(())
    }

    async fn close(&self) {
        let remote_endpoint = {
            let mut guard = self.state.lock();
            if guard.negotiation == NegotiationState::Closed {
                return;
            }
            guard.negotiation = NegotiationState::Closed;
            guard.connection = LinkState::Closed;
            guard.remote_endpoint
        };
        self.emit(LinkEvent::StateChanged(LinkState::Closed));
        let channels: Vec<Arc<LoopbackChannel>> = self.channels.lock().drain(..).collect();
        for channel in &channels {
            channel.open.store(false, Ordering::Release);
        }
        self.network.forget(self.endpoint);

        if let Some(remote) = remote_endpoint.and_then(|ep| self.network.endpoint(ep)) {
            let paired = remote.state.lock().remote_endpoint == Some(self.endpoint);
            if paired {
                for channel in remote.channels.lock().iter() {
                    channel.open.store(false, Ordering::Release);
                }
                remote.emit(LinkEvent::ChannelClosed);
                remote.transition(LinkState::Disconnected);
            }
        }
    }
}

pub struct LoopbackChannel {
    label: String,
    open: AtomicBool,
    events: mpsc::UnboundedSender<LinkEvent>,
    peer: Mutex<Option<Arc<LoopbackChannel>>>,
    sent: Mutex<Vec<String>>,
}

impl LoopbackChannel {
    fn new(label: String, events: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            label,
            open: AtomicBool::new(false),
            events,
            peer: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl ChannelLink for LoopbackChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn send_text(&self, text: String) -> Result<(), LinkError> {
        if !self.is_open() {
            return Err(LinkError::Closed);
        }
        let peer = self.peer.lock().clone().ok_or(LinkError::Closed)?;
        self.sent.lock().push(text.clone());
        peer.events
            .send(LinkEvent::ChannelMessage(text))
            .map_err(|_| LinkError::Closed)
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let peer = self.peer.lock().take();
            if let Some(peer) = peer {
                peer.open.store(false, Ordering::Release);
                let _ = peer.events.send(LinkEvent::ChannelClosed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackKind;

    async fn next_matching<F>(rx: &mut mpsc::UnboundedReceiver<LinkEvent>, mut pred: F) -> LinkEvent
    where
        F: FnMut(&LinkEvent) -> bool,
    {
        loop {
            let event = rx.try_recv().expect("event queued");
            if pred(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn offer_answer_connects_both_sides() {
        let network = LoopbackNetwork::new();
        let a = PeerId::from("peer-a");
        let b = PeerId::from("peer-b");
        let mut left = network.connector(b.clone()).connect(&a).await.expect("left");
        let mut right = network.connector(a.clone()).connect(&b).await.expect("right");

        left.link
            .add_track(Arc::new(LocalTrack::new(TrackKind::Audio)))
            .await
            .expect("track");
        let channel = left.link.create_data_channel("chat").await.expect("channel");
        let offer = left.link.create_offer().await.expect("offer");
        left.link.set_local_description(offer.clone()).await.expect("local offer");
        assert_eq!(left.link.negotiation_state(), NegotiationState::HaveLocalOffer);

        right.link.set_remote_description(offer).await.expect("remote offer");
        let answer = right.link.create_answer().await.expect("answer");
        right.link.set_local_description(answer.clone()).await.expect("local answer");
        left.link.set_remote_description(answer).await.expect("remote answer");

        assert_eq!(left.link.connection_state(), LinkState::Connected);
        assert_eq!(right.link.connection_state(), LinkState::Connected);
        assert!(channel.is_open());

        next_matching(&mut right.events, |e| matches!(e, LinkEvent::TrackReceived(t) if t.kind == TrackKind::Audio)).await;
        let received = match next_matching(&mut right.events, |e| matches!(e, LinkEvent::ChannelReceived(_))).await {
            LinkEvent::ChannelReceived(channel) => channel,
            _ => unreachable!(),
        };
        received.send_text("pong".into()).await.expect("send");
        next_matching(&mut left.events, |e| matches!(e, LinkEvent::ChannelMessage(text) if text == "pong")).await;
    }

    #[tokio::test]
    async fn candidate_requires_remote_description() {
        let network = LoopbackNetwork::new();
        let handle = network
            .connector(PeerId::from("a"))
            .connect(&PeerId::from("b"))
            .await
            .expect("link");
        let candidate = IceCandidate {
            candidate: "candidate:1".into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        };
        assert!(matches!(
            handle.link.add_ice_candidate(candidate).await,
            Err(LinkError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn answer_in_stable_is_rejected() {
        let network = LoopbackNetwork::new();
        let handle = network
            .connector(PeerId::from("a"))
            .connect(&PeerId::from("b"))
            .await
            .expect("link");
        let err = handle
            .link
            .set_remote_description(SessionDescription::answer("loopback:9"))
            .await
            .expect_err("stale answer");
        assert!(matches!(err, LinkError::InvalidState(_)));
    }

    #[tokio::test]
    async fn fail_link_reports_failed_state() {
        let network = LoopbackNetwork::new();
        let a = PeerId::from("a");
        let b = PeerId::from("b");
        let mut handle = network.connector(a.clone()).connect(&b).await.expect("link");
        assert!(network.fail_link(&a, &b));
        let event = handle.events.try_recv().expect("state event");
        assert!(matches!(event, LinkEvent::StateChanged(LinkState::Failed)));
    }
}
