use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

use tidepool_proto::{ChannelEnvelope, PeerId, ProtocolError};

use crate::orchestrator::InboundFrame;
use crate::registry::PeerRegistry;
use crate::session::LocalIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub peer_id: PeerId,
    pub peer_name: String,
    pub content: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub kind: ChatKind,
}

/// Metadata for an offered file. No bytes move; progress stays at 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferRecord {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub progress: u8,
    pub peer_id: PeerId,
    pub peer_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Chat(ChatMessage),
    File(FileTransferRecord),
}

pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Turn one channel frame into a chat message or file record.
pub fn receive(frame: &InboundFrame) -> Result<Inbound, ProtocolError> {
    let inbound = match ChannelEnvelope::decode(&frame.text)? {
        ChannelEnvelope::Text { content, timestamp } => Inbound::Chat(ChatMessage {
            id: Uuid::new_v4().to_string(),
            peer_id: frame.from.clone(),
            peer_name: frame.from_name.clone(),
            content,
            timestamp,
            kind: ChatKind::Text,
        }),
        ChannelEnvelope::FileMeta { id, name, size } => Inbound::File(FileTransferRecord {
            id,
            name,
            size,
            progress: 0,
            peer_id: frame.from.clone(),
            peer_name: frame.from_name.clone(),
        }),
    };
    Ok(inbound)
}

/// Send `content` to every open channel. Returns the single local copy.
pub async fn send_text(
    registry: &PeerRegistry,
    identity: &LocalIdentity,
    content: impl Into<String>,
) -> Result<ChatMessage, ProtocolError> {
    let content = content.into();
    let timestamp = now_millis();
    let envelope = ChannelEnvelope::Text {
        content: content.clone(),
        timestamp,
    };
    fan_out(registry, &envelope).await?;
    Ok(ChatMessage {
        id: Uuid::new_v4().to_string(),
        peer_id: identity.id.clone(),
        peer_name: identity.name.clone(),
        content,
        timestamp,
        kind: ChatKind::Text,
    })
}

pub async fn offer_file(
    registry: &PeerRegistry,
    identity: &LocalIdentity,
    name: impl Into<String>,
    size: u64,
) -> Result<FileTransferRecord, ProtocolError> {
    let record = FileTransferRecord {
        id: Uuid::new_v4().to_string(),
        name: name.into(),
        size,
        progress: 0,
        peer_id: identity.id.clone(),
        peer_name: identity.name.clone(),
    };
    let envelope = ChannelEnvelope::FileMeta {
        id: record.id.clone(),
        name: record.name.clone(),
        size,
    };
    fan_out(registry, &envelope).await?;
    Ok(record)
}

async fn fan_out(registry: &PeerRegistry, envelope: &ChannelEnvelope) -> Result<usize, ProtocolError> {
    let frame = envelope.encode()?;
    let mut delivered = 0;
    for (peer, channel) in registry.open_channels() {
        match channel.send_text(frame.clone()).await {
            Ok(()) => delivered += 1,
            Err(err) => {
                warn!(target = "tidepool::chat", peer = %peer, error = %err, "channel send failed");
            }
        }
    }
    debug!(target = "tidepool::chat", delivered, "envelope fanned out");
    Ok(delivered)
}
