//! Offer/answer negotiation with every remote peer in the room.
//!
//! The orchestrator is owned by the session task and handles one signal or
//! link event at a time. Links report through per-peer forwarders that tag
//! each event with the link's generation, so events from a link that has
//! since been torn down are recognised and dropped.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use tidepool_proto::{
    IceCandidate, OutboundSignal, PeerId, SessionDescription, SignalPayload, SignalingMessage,
};

use crate::media::LocalStream;
use crate::peer::{
    LinkError, LinkEvent, LinkHandle, LinkState, NegotiationState, PeerConnector, PeerLink,
};
use crate::registry::{Peer, PeerRegistry};
use crate::session::lifecycle::Lifecycle;
use crate::transport::SignalingTransport;

/// Early candidates kept per peer while no remote description is applied.
pub const MAX_EARLY_CANDIDATES: usize = 32;

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("session is no longer running")]
    Cancelled,
    #[error("negotiation with {peer} failed: {source}")]
    Link {
        peer: PeerId,
        #[source]
        source: LinkError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    PendingOffer,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalAnswer,
    Connected,
}

impl NegotiationPhase {
    fn has_remote_description(self) -> bool {
        matches!(
            self,
            NegotiationPhase::HaveRemoteOffer
                | NegotiationPhase::HaveLocalAnswer
                | NegotiationPhase::Connected
        )
    }
}

/// The side with the strictly greater id sends the offer.
pub fn should_initiate(local: &PeerId, remote: &PeerId) -> bool {
    local > remote
}

#[derive(Debug)]
pub struct TaggedLinkEvent {
    pub peer: PeerId,
    pub generation: u64,
    pub event: LinkEvent,
}

/// Text that arrived on a peer's data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub from: PeerId,
    pub from_name: String,
    pub text: String,
}

pub struct Orchestrator {
    local: PeerId,
    registry: Arc<PeerRegistry>,
    connector: Arc<dyn PeerConnector>,
    transport: Arc<dyn SignalingTransport>,
    lifecycle: Lifecycle,
    stream: Arc<LocalStream>,
    channel_label: String,
    link_events: mpsc::UnboundedSender<TaggedLinkEvent>,
    pending: HashSet<PeerId>,
    phases: HashMap<PeerId, NegotiationPhase>,
    early_candidates: HashMap<PeerId, VecDeque<IceCandidate>>,
    /// Peers removed since their last offer or discovery. Their late
    /// candidates belong to a dead link.
    departed: HashSet<PeerId>,
    forwarders: HashMap<PeerId, JoinHandle<()>>,
    next_generation: u64,
}

pub struct OrchestratorParts {
    pub local: PeerId,
    pub registry: Arc<PeerRegistry>,
    pub connector: Arc<dyn PeerConnector>,
    pub transport: Arc<dyn SignalingTransport>,
    pub lifecycle: Lifecycle,
    pub stream: Arc<LocalStream>,
    pub channel_label: String,
    pub link_events: mpsc::UnboundedSender<TaggedLinkEvent>,
}

impl Orchestrator {
    pub fn new(parts: OrchestratorParts) -> Self {
        Self {
            local: parts.local,
            registry: parts.registry,
            connector: parts.connector,
            transport: parts.transport,
            lifecycle: parts.lifecycle,
            stream: parts.stream,
            channel_label: parts.channel_label,
            link_events: parts.link_events,
            pending: HashSet::new(),
            phases: HashMap::new(),
            early_candidates: HashMap::new(),
            departed: HashSet::new(),
            forwarders: HashMap::new(),
            next_generation: 0,
        }
    }

    pub fn is_pending(&self, peer: &PeerId) -> bool {
        self.pending.contains(peer)
    }

    pub fn phase(&self, peer: &PeerId) -> Option<NegotiationPhase> {
        self.phases.get(peer).copied()
    }

    pub fn buffered_candidates(&self, peer: &PeerId) -> usize {
        self.early_candidates.get(peer).map_or(0, VecDeque::len)
    }

    /// Route one relay message. Errors are logged here and never escape.
    pub async fn handle_signal(&mut self, message: SignalingMessage) {
        if !self.lifecycle.is_running() || message.from == self.local {
            return;
        }
        if !message.is_visible_to(&self.local) {
            return;
        }
        let from = message.from;
        let kind = message.payload.kind();
        let result = match message.payload {
            SignalPayload::PeerDiscovery => self.on_discovery(from.clone(), message.from_name).await,
            SignalPayload::Offer(desc) => self.on_offer(from.clone(), message.from_name, desc).await,
            SignalPayload::Answer(desc) => self.on_answer(from.clone(), desc).await,
            SignalPayload::IceCandidate(candidate) => self.on_candidate(from.clone(), candidate).await,
        };
        match result {
            Ok(()) => {}
            Err(NegotiationError::Cancelled) => {
                trace!(target = "tidepool::orchestrator", peer = %from, %kind, "discarded after close");
            }
            Err(err) => {
                warn!(target = "tidepool::orchestrator", peer = %from, %kind, error = %err, "signal dropped");
            }
        }
    }

    async fn on_discovery(&mut self, from: PeerId, name: String) -> Result<(), NegotiationError> {
        if self.pending.contains(&from) || self.registry.contains(&from) {
            trace!(target = "tidepool::orchestrator", peer = %from, "already known");
            return Ok(());
        }
        if !should_initiate(&self.local, &from) {
            debug!(target = "tidepool::orchestrator", peer = %from, "waiting for remote offer");
            return Ok(());
        }
        info!(target = "tidepool::orchestrator", peer = %from, name = %name, "discovered peer; offering");
        self.departed.remove(&from);
        self.pending.insert(from.clone());
        self.phases.insert(from.clone(), NegotiationPhase::PendingOffer);
        let outcome = self.send_offer(&from, name).await;
        if let Err(NegotiationError::Link { .. }) = &outcome {
            self.drop_peer(&from).await;
        }
        outcome
    }

    async fn send_offer(&mut self, to: &PeerId, name: String) -> Result<(), NegotiationError> {
        let link = self.open_link(to, name, true).await?;
        let offer = link.create_offer().await.map_err(link_error(to))?;
        self.ensure_running()?;
        link.set_local_description(offer.clone())
            .await
            .map_err(link_error(to))?;
        self.ensure_running()?;
        self.phases.insert(to.clone(), NegotiationPhase::HaveLocalOffer);
        self.transport
            .publish(OutboundSignal::to(to.clone(), SignalPayload::Offer(offer)));
        Ok(())
    }

    async fn on_offer(
        &mut self,
        from: PeerId,
        name: String,
        offer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.departed.remove(&from);
        let existing = self.registry.get(&from).and_then(|peer| peer.link);
        let created = existing.is_none();
        let link = match existing {
            Some(link) => link,
            None => self.open_link(&from, name.clone(), false).await?,
        };

        let phase = self.phases.get(&from).copied();
        let acceptable = match link.negotiation_state() {
            NegotiationState::HaveLocalOffer => true,
            NegotiationState::Stable => !matches!(
                phase,
                Some(NegotiationPhase::HaveLocalAnswer | NegotiationPhase::Connected)
            ),
            _ => false,
        };
        if !acceptable {
            debug!(
                target = "tidepool::orchestrator",
                peer = %from,
                state = ?link.negotiation_state(),
                ?phase,
                "ignoring offer"
            );
            return Ok(());
        }

        let outcome = self.answer_offer(&from, &link, offer).await;
        if let Err(NegotiationError::Link { .. }) = &outcome {
            if created {
                self.drop_peer(&from).await;
            }
        } else if outcome.is_ok() && !name.is_empty() {
            self.registry.update(&from, |peer| peer.name = name);
        }
        outcome
    }

    async fn answer_offer(
        &mut self,
        from: &PeerId,
        link: &Arc<dyn PeerLink>,
        offer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        link.set_remote_description(offer)
            .await
            .map_err(link_error(from))?;
        self.ensure_running()?;
        self.phases.insert(from.clone(), NegotiationPhase::HaveRemoteOffer);
        self.pending.remove(from);
        self.replay_candidates(from, link).await;

        let answer = link.create_answer().await.map_err(link_error(from))?;
        self.ensure_running()?;
        link.set_local_description(answer.clone())
            .await
            .map_err(link_error(from))?;
        self.ensure_running()?;
        self.phases.insert(from.clone(), NegotiationPhase::HaveLocalAnswer);
        self.transport
            .publish(OutboundSignal::to(from.clone(), SignalPayload::Answer(answer)));
        debug!(target = "tidepool::orchestrator", peer = %from, "answer sent");
        Ok(())
    }

    async fn on_answer(
        &mut self,
        from: PeerId,
        answer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let Some(link) = self.registry.get(&from).and_then(|peer| peer.link) else {
            debug!(target = "tidepool::orchestrator", peer = %from, "answer for unknown peer ignored");
            return Ok(());
        };
        if link.negotiation_state() != NegotiationState::HaveLocalOffer {
            debug!(
                target = "tidepool::orchestrator",
                peer = %from,
                state = ?link.negotiation_state(),
                "stale answer ignored"
            );
            return Ok(());
        }
        link.set_remote_description(answer)
            .await
            .map_err(link_error(&from))?;
        self.ensure_running()?;
        self.pending.remove(&from);
        self.phases.insert(from.clone(), NegotiationPhase::Connected);
        self.replay_candidates(&from, &link).await;
        info!(target = "tidepool::orchestrator", peer = %from, "answer applied");
        Ok(())
    }

    async fn on_candidate(
        &mut self,
        from: PeerId,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        if self.departed.contains(&from) {
            trace!(target = "tidepool::orchestrator", peer = %from, "candidate for a removed link dropped");
            return Ok(());
        }
        let ready = self
            .phases
            .get(&from)
            .is_some_and(|phase| phase.has_remote_description());
        let link = self.registry.get(&from).and_then(|peer| peer.link);
        match link {
            Some(link) if ready => link
                .add_ice_candidate(candidate)
                .await
                .map_err(link_error(&from)),
            _ => {
                let buffer = self.early_candidates.entry(from.clone()).or_default();
                if buffer.len() >= MAX_EARLY_CANDIDATES {
                    debug!(target = "tidepool::orchestrator", peer = %from, "early candidate buffer full; dropping");
                } else {
                    buffer.push_back(candidate);
                    trace!(target = "tidepool::orchestrator", peer = %from, buffered = buffer.len(), "candidate buffered");
                }
                Ok(())
            }
        }
    }

    async fn replay_candidates(&mut self, peer: &PeerId, link: &Arc<dyn PeerLink>) {
        let Some(buffered) = self.early_candidates.remove(peer) else {
            return;
        };
        debug!(target = "tidepool::orchestrator", peer = %peer, count = buffered.len(), "replaying early candidates");
        for candidate in buffered {
            if let Err(err) = link.add_ice_candidate(candidate).await {
                warn!(target = "tidepool::orchestrator", peer = %peer, error = %err, "buffered candidate rejected");
            }
        }
    }

    /// Create a link towards `peer`, attach local tracks (and, as offerer,
    /// the data channel), and register it.
    async fn open_link(
        &mut self,
        peer: &PeerId,
        name: String,
        offerer: bool,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError> {
        let LinkHandle { link, events } = self
            .connector
            .connect(peer)
            .await
            .map_err(link_error(peer))?;
        if !self.lifecycle.is_running() {
            link.close().await;
            return Err(NegotiationError::Cancelled);
        }

        let setup = async {
            for track in self.stream.tracks() {
                link.add_track(Arc::clone(track)).await?;
            }
            if offerer {
                link.create_data_channel(&self.channel_label).await.map(Some)
            } else {
                Ok(None)
            }
        };
        let channel = match setup.await {
            Ok(channel) => channel,
            Err(err) => {
                link.close().await;
                return Err(NegotiationError::Link {
                    peer: peer.clone(),
                    source: err,
                });
            }
        };
        if !self.lifecycle.is_running() {
            if let Some(channel) = &channel {
                channel.close().await;
            }
            link.close().await;
            return Err(NegotiationError::Cancelled);
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let mut entry = Peer::new(peer.clone(), name);
        entry.link = Some(Arc::clone(&link));
        entry.channel = channel;
        entry.state = LinkState::Connecting;
        entry.generation = generation;
        self.registry.upsert(entry);
        self.spawn_forwarder(peer.clone(), generation, events);
        Ok(link)
    }

    fn spawn_forwarder(
        &mut self,
        peer: PeerId,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        let inbox = self.link_events.clone();
        let tag = peer.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let tagged = TaggedLinkEvent {
                    peer: tag.clone(),
                    generation,
                    event,
                };
                if inbox.send(tagged).is_err() {
                    break;
                }
            }
        });
        if let Some(previous) = self.forwarders.insert(peer, task) {
            previous.abort();
        }
    }

    /// Apply one link event. Channel text is handed back to the caller.
    pub async fn handle_link_event(&mut self, tagged: TaggedLinkEvent) -> Option<InboundFrame> {
        if !self.lifecycle.is_running() {
            return None;
        }
        let TaggedLinkEvent {
            peer: id,
            generation,
            event,
        } = tagged;
        let peer = self.registry.get(&id)?;
        if peer.generation != generation {
            trace!(
                target = "tidepool::orchestrator",
                peer = %id,
                generation,
                current = peer.generation,
                "event from replaced link ignored"
            );
            return None;
        }
        match event {
            LinkEvent::IceCandidate(candidate) => {
                self.transport.publish(OutboundSignal::to(
                    id,
                    SignalPayload::IceCandidate(candidate),
                ));
            }
            LinkEvent::StateChanged(state) => {
                debug!(target = "tidepool::orchestrator", peer = %id, %state, "link state");
                self.registry.update(&id, |peer| peer.state = state);
                if state == LinkState::Connected {
                    self.pending.remove(&id);
                    self.phases.insert(id.clone(), NegotiationPhase::Connected);
                } else if state.is_terminal() {
                    info!(target = "tidepool::orchestrator", peer = %id, %state, "link ended; removing peer");
                    self.drop_peer(&id).await;
                }
            }
            LinkEvent::TrackReceived(track) => {
                debug!(target = "tidepool::orchestrator", peer = %id, kind = %track.kind, "remote track");
                self.registry
                    .update(&id, |peer| peer.remote_tracks.push(track));
            }
            LinkEvent::ChannelReceived(channel) => {
                debug!(target = "tidepool::orchestrator", peer = %id, label = %channel.label(), "remote channel");
                self.registry.update(&id, |peer| peer.channel = Some(channel));
            }
            LinkEvent::ChannelOpen | LinkEvent::ChannelClosed => {
                self.registry.update(&id, |_| ());
            }
            LinkEvent::ChannelMessage(text) => {
                return Some(InboundFrame {
                    from: id,
                    from_name: peer.name,
                    text,
                });
            }
        }
        None
    }

    /// Forget everything about `peer` and close its handles.
    pub async fn drop_peer(&mut self, peer: &PeerId) {
        self.pending.remove(peer);
        self.phases.remove(peer);
        self.early_candidates.remove(peer);
        self.departed.insert(peer.clone());
        if let Some(task) = self.forwarders.remove(peer) {
            task.abort();
        }
        self.registry.remove(peer).await;
    }

    /// Stop all forwarders. Handles are closed by the registry.
    pub fn shutdown(&mut self) {
        for (_, task) in self.forwarders.drain() {
            task.abort();
        }
        self.pending.clear();
        self.phases.clear();
        self.early_candidates.clear();
        self.departed.clear();
    }

    fn ensure_running(&self) -> Result<(), NegotiationError> {
        if self.lifecycle.is_running() {
            Ok(())
        } else {
            Err(NegotiationError::Cancelled)
        }
    }
}

fn link_error(peer: &PeerId) -> impl FnOnce(LinkError) -> NegotiationError + '_ {
    move |source| NegotiationError::Link {
        peer: peer.clone(),
        source,
    }
}
