use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProtocolError;

const KNOWN_TAGS: [&str; 2] = ["text", "file-meta"];

/// Message carried over a peer's reliable data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChannelEnvelope {
    Text {
        content: String,
        timestamp: i64,
    },
    FileMeta {
        id: String,
        name: String,
        size: u64,
    },
}

impl ChannelEnvelope {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode one channel frame, distinguishing an unknown tag from a known
    /// tag with a bad body.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(frame)?;
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::MalformedEnvelope("missing `type`".into()))?;
        if !KNOWN_TAGS.contains(&tag) {
            return Err(ProtocolError::UnknownEnvelope(tag.to_string()));
        }
        serde_json::from_value(value).map_err(|err| ProtocolError::MalformedEnvelope(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_envelope_matches_wire_shape() {
        let envelope = ChannelEnvelope::Text {
            content: "hi".into(),
            timestamp: 1_700_000_000_000,
        };
        let encoded = envelope.encode().expect("encode");
        assert_eq!(
            encoded,
            r#"{"type":"text","content":"hi","timestamp":1700000000000}"#
        );
    }

    #[test]
    fn decodes_file_meta() {
        let decoded =
            ChannelEnvelope::decode(r#"{"type":"file-meta","id":"f1","name":"notes.txt","size":42}"#)
                .expect("decode");
        assert_eq!(
            decoded,
            ChannelEnvelope::FileMeta {
                id: "f1".into(),
                name: "notes.txt".into(),
                size: 42,
            }
        );
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = ChannelEnvelope::decode(r#"{"type":"file-chunk","data":"AAAA"}"#)
            .expect_err("unknown");
        assert!(matches!(err, ProtocolError::UnknownEnvelope(tag) if tag == "file-chunk"));
    }

    #[test]
    fn known_tag_with_bad_body_is_malformed() {
        let err = ChannelEnvelope::decode(r#"{"type":"text","content":5}"#).expect_err("bad body");
        assert!(matches!(err, ProtocolError::MalformedEnvelope(_)));
    }
}
