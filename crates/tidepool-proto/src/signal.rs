use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{PeerId, ProtocolError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    PeerDiscovery,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
            SignalKind::PeerDiscovery => "peer-discovery",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "offer" => Some(SignalKind::Offer),
            "answer" => Some(SignalKind::Answer),
            "ice-candidate" => Some(SignalKind::IceCandidate),
            "peer-discovery" => Some(SignalKind::PeerDiscovery),
            _ => None,
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description in the shape browsers exchange (`{type, sdp}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    PeerDiscovery,
}

impl SignalPayload {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalPayload::Offer(_) => SignalKind::Offer,
            SignalPayload::Answer(_) => SignalKind::Answer,
            SignalPayload::IceCandidate(_) => SignalKind::IceCandidate,
            SignalPayload::PeerDiscovery => SignalKind::PeerDiscovery,
        }
    }

    fn to_data(&self) -> Option<Value> {
        match self {
            SignalPayload::Offer(desc) | SignalPayload::Answer(desc) => {
                serde_json::to_value(desc).ok()
            }
            SignalPayload::IceCandidate(candidate) => serde_json::to_value(candidate).ok(),
            SignalPayload::PeerDiscovery => None,
        }
    }

    fn from_data(kind: SignalKind, data: Option<Value>) -> Result<Self, ProtocolError> {
        let malformed = |source| ProtocolError::MalformedData { kind, source };
        match kind {
            SignalKind::PeerDiscovery => Ok(SignalPayload::PeerDiscovery),
            SignalKind::Offer | SignalKind::Answer => {
                let data = data.ok_or(ProtocolError::MissingData(kind))?;
                let desc: SessionDescription = serde_json::from_value(data).map_err(malformed)?;
                Ok(if kind == SignalKind::Offer {
                    SignalPayload::Offer(desc)
                } else {
                    SignalPayload::Answer(desc)
                })
            }
            SignalKind::IceCandidate => {
                let data = data.ok_or(ProtocolError::MissingData(kind))?;
                let candidate = serde_json::from_value(data).map_err(malformed)?;
                Ok(SignalPayload::IceCandidate(candidate))
            }
        }
    }
}

/// A signal before the transport stamps the sender identity onto it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundSignal {
    pub to: Option<PeerId>,
    pub payload: SignalPayload,
}

impl OutboundSignal {
    pub fn to(peer: PeerId, payload: SignalPayload) -> Self {
        Self {
            to: Some(peer),
            payload,
        }
    }

    pub fn broadcast(payload: SignalPayload) -> Self {
        Self { to: None, payload }
    }

    pub fn stamp(self, from: &PeerId, from_name: &str) -> SignalingMessage {
        SignalingMessage {
            id: None,
            from: from.clone(),
            from_name: from_name.to_string(),
            to: self.to,
            payload: self.payload,
        }
    }
}

/// Typed signaling message. `id` is assigned by the relay and absent on
/// messages that have not been appended yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireSignal", into = "WireSignal")]
pub struct SignalingMessage {
    pub id: Option<u64>,
    pub from: PeerId,
    pub from_name: String,
    pub to: Option<PeerId>,
    pub payload: SignalPayload,
}

impl SignalingMessage {
    pub fn kind(&self) -> SignalKind {
        self.payload.kind()
    }

    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }

    /// Broadcasts and messages addressed to `peer` are visible to it.
    pub fn is_visible_to(&self, peer: &PeerId) -> bool {
        match &self.to {
            None => true,
            Some(to) => to == peer,
        }
    }
}

/// JSON shape on the relay: `{id?, type, from, fromName, to?, data?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireSignal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(rename = "type")]
    pub kind: String,
    pub from: PeerId,
    #[serde(default)]
    pub from_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl TryFrom<WireSignal> for SignalingMessage {
    type Error = ProtocolError;

    fn try_from(wire: WireSignal) -> Result<Self, Self::Error> {
        let kind =
            SignalKind::parse(&wire.kind).ok_or(ProtocolError::UnknownSignal(wire.kind))?;
        let payload = SignalPayload::from_data(kind, wire.data)?;
        Ok(Self {
            id: wire.id,
            from: wire.from,
            from_name: wire.from_name,
            to: wire.to,
            payload,
        })
    }
}

impl From<SignalingMessage> for WireSignal {
    fn from(message: SignalingMessage) -> Self {
        Self {
            id: message.id,
            kind: message.kind().as_str().to_string(),
            data: message.payload.to_data(),
            from: message.from,
            from_name: message.from_name,
            to: message.to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_browser_shaped_offer() {
        let raw = json!({
            "id": 7,
            "type": "offer",
            "from": "peer-200",
            "fromName": "bob",
            "to": "peer-100",
            "data": { "type": "offer", "sdp": "v=0" }
        });
        let message: SignalingMessage = serde_json::from_value(raw).expect("parse");
        assert_eq!(message.id, Some(7));
        assert_eq!(message.from_name, "bob");
        assert_eq!(message.to, Some(PeerId::from("peer-100")));
        assert_eq!(
            message.payload,
            SignalPayload::Offer(SessionDescription::offer("v=0"))
        );
    }

    #[test]
    fn discovery_serializes_without_data_or_recipient() {
        let message = OutboundSignal::broadcast(SignalPayload::PeerDiscovery)
            .stamp(&PeerId::from("peer-1"), "alice");
        let value = serde_json::to_value(&message).expect("serialize");
        assert_eq!(
            value,
            json!({ "type": "peer-discovery", "from": "peer-1", "fromName": "alice" })
        );
    }

    #[test]
    fn candidate_uses_browser_field_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.2 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let value = serde_json::to_value(&candidate).expect("serialize");
        assert_eq!(value["sdpMLineIndex"], json!(0));
        assert_eq!(value["sdpMid"], json!("0"));
    }

    #[test]
    fn rejects_unknown_signal_type() {
        let raw = json!({ "type": "renegotiate", "from": "peer-1" });
        let err = serde_json::from_value::<SignalingMessage>(raw).expect_err("unknown tag");
        assert!(err.to_string().contains("renegotiate"));
    }

    #[test]
    fn rejects_offer_without_description() {
        let wire = WireSignal {
            id: Some(1),
            kind: "offer".into(),
            from: PeerId::from("peer-1"),
            from_name: String::new(),
            to: None,
            data: None,
        };
        assert!(matches!(
            SignalingMessage::try_from(wire),
            Err(ProtocolError::MissingData(SignalKind::Offer))
        ));
    }

    #[test]
    fn visibility_covers_broadcast_and_direct() {
        let me = PeerId::from("peer-1");
        let broadcast =
            OutboundSignal::broadcast(SignalPayload::PeerDiscovery).stamp(&PeerId::from("x"), "");
        let direct = OutboundSignal::to(PeerId::from("peer-2"), SignalPayload::PeerDiscovery)
            .stamp(&PeerId::from("x"), "");
        assert!(broadcast.is_visible_to(&me));
        assert!(!direct.is_visible_to(&me));
    }
}
