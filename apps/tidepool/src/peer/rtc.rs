use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use tidepool_proto::{IceCandidate, PeerId, SdpKind, SessionDescription};

use super::{
    ChannelLink, LinkError, LinkEvent, LinkHandle, LinkState, NegotiationState, PeerConnector,
    PeerLink, RemoteTrack,
};
use crate::media::{LocalTrack, TrackKind};

/// Opens real peer connections through the `webrtc` crate.
pub struct RtcConnector {
    api: API,
    ice_servers: Vec<String>,
}

impl RtcConnector {
    pub fn new(ice_servers: Vec<String>) -> Result<Self, LinkError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, ice_servers })
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(&self, remote: &PeerId) -> Result<LinkHandle, LinkError> {
        let pc = Arc::new(self.api.new_peer_connection(self.configuration()).await?);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        install_handlers(&pc, remote, events_tx.clone());
        debug!(target = "tidepool::peer::rtc", remote = %remote, "peer connection created");
        Ok(LinkHandle {
            link: Arc::new(RtcLink {
                pc,
                events: events_tx,
            }),
            events: events_rx,
        })
    }
}

fn install_handlers(
    pc: &Arc<RTCPeerConnection>,
    remote: &PeerId,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let ice_events = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = ice_events.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = events.send(LinkEvent::IceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(err) => {
                    warn!(target = "tidepool::peer::rtc", error = %err, "failed to serialize local candidate");
                }
            }
        })
    }));

    let state_events = events.clone();
    let state_remote = remote.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let events = state_events.clone();
        let remote = state_remote.clone();
        Box::pin(async move {
            trace!(target = "tidepool::peer::rtc", remote = %remote, ?state, "connection state");
            if let Some(mapped) = map_connection_state(state) {
                let _ = events.send(LinkEvent::StateChanged(mapped));
            }
        })
    }));

    let track_events = events.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let events = track_events.clone();
        Box::pin(async move {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                RTPCodecType::Video => TrackKind::Video,
                _ => return,
            };
            let _ = events.send(LinkEvent::TrackReceived(RemoteTrack {
                id: track.id(),
                kind,
            }));
        })
    }));

    let channel_events = events;
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let events = channel_events.clone();
        Box::pin(async move {
            debug!(target = "tidepool::peer::rtc", label = dc.label(), "data channel received");
            let channel = RtcChannel::wire(dc, events.clone());
            let _ = events.send(LinkEvent::ChannelReceived(channel));
        })
    }));
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<LinkState> {
    match state {
        RTCPeerConnectionState::New => Some(LinkState::New),
        RTCPeerConnectionState::Connecting => Some(LinkState::Connecting),
        RTCPeerConnectionState::Connected => Some(LinkState::Connected),
        RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
        RTCPeerConnectionState::Failed => Some(LinkState::Failed),
        RTCPeerConnectionState::Closed => Some(LinkState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn map_signaling_state(state: RTCSignalingState) -> NegotiationState {
    match state {
        RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
            NegotiationState::HaveLocalOffer
        }
        RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
            NegotiationState::HaveRemoteOffer
        }
        RTCSignalingState::Closed => NegotiationState::Closed,
        _ => NegotiationState::Stable,
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, LinkError> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
    };
    Ok(parsed)
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, LinkError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(LinkError::InvalidState(format!("unexpected sdp type {other}"))),
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48_000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90_000,
            ..Default::default()
        },
    }
}

pub struct RtcLink {
    pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

#[async_trait]
impl PeerLink for RtcLink {
    fn negotiation_state(&self) -> NegotiationState {
        map_signaling_state(self.pc.signaling_state())
    }

    fn connection_state(&self) -> LinkState {
        map_connection_state(self.pc.connection_state()).unwrap_or(LinkState::New)
    }

    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), LinkError> {
        let sample = Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind()),
            track.id().to_string(),
            "tidepool".to_owned(),
        ));
        self.pc
            .add_track(sample as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn ChannelLink>, LinkError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self.pc.create_data_channel(label, Some(init)).await?;
        Ok(RtcChannel::wire(dc, self.events.clone()))
    }

    async fn create_offer(&self) -> Result<SessionDescription, LinkError> {
        from_rtc(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, LinkError> {
        from_rtc(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), LinkError> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), LinkError> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            debug!(target = "tidepool::peer::rtc", error = %err, "close failed");
        }
    }
}

pub struct RtcChannel {
    dc: Arc<RTCDataChannel>,
}

impl RtcChannel {
    fn wire(dc: Arc<RTCDataChannel>, events: mpsc::UnboundedSender<LinkEvent>) -> Arc<Self> {
        let open_events = events.clone();
        dc.on_open(Box::new(move || {
            let events = open_events.clone();
            Box::pin(async move {
                let _ = events.send(LinkEvent::ChannelOpen);
            })
        }));

        let close_events = events.clone();
        dc.on_close(Box::new(move || {
            let events = close_events.clone();
            Box::pin(async move {
                let _ = events.send(LinkEvent::ChannelClosed);
            })
        }));

        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let events = events.clone();
            Box::pin(async move {
                if !msg.is_string {
                    trace!(target = "tidepool::peer::rtc", bytes = msg.data.len(), "ignoring binary frame");
                    return;
                }
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => {
                        let _ = events.send(LinkEvent::ChannelMessage(text));
                    }
                    Err(err) => {
                        warn!(target = "tidepool::peer::rtc", error = %err, "dropping non-utf8 text frame");
                    }
                }
            })
        }));

        Arc::new(Self { dc })
    }
}

#[async_trait]
impl ChannelLink for RtcChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<(), LinkError> {
        self.dc.send_text(text).await?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(err) = self.dc.close().await {
            debug!(target = "tidepool::peer::rtc", error = %err, "channel close failed");
        }
    }
}
