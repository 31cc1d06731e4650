use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::trace;
use url::Url;

use tidepool_proto::{PeerId, RelayLog, RoomLogs, SignalingMessage, WireSignal};

use super::TransportError;

/// Access to the room's append-only signaling log.
#[async_trait]
pub trait RelayBackend: Send + Sync {
    /// Messages with id greater than `after` visible to `recipient`, in id
    /// order. Entries are returned raw so one bad message cannot poison a
    /// batch.
    async fn fetch(
        &self,
        room: &str,
        after: u64,
        recipient: &PeerId,
    ) -> Result<Vec<WireSignal>, TransportError>;

    /// Append one message and return the id the relay assigned.
    async fn append(&self, room: &str, message: &SignalingMessage) -> Result<u64, TransportError>;
}

/// Prefix a scheme when the caller gave a bare host, then parse.
pub fn normalize_relay_url(raw: &str) -> Result<Url, TransportError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(TransportError::InvalidUrl(
            "relay url cannot be empty".into(),
        ));
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("{}{trimmed}", infer_scheme(trimmed))
    };
    let url = Url::parse(&candidate).map_err(|err| TransportError::InvalidUrl(err.to_string()))?;
    if url.cannot_be_a_base() {
        return Err(TransportError::InvalidUrl(format!(
            "{candidate} cannot carry a path"
        )));
    }
    Ok(url)
}

fn infer_scheme(base: &str) -> &'static str {
    let host_part = base
        .split(['/', ':'])
        .next()
        .unwrap_or(base)
        .trim_start_matches('[');
    let host = host_part.to_ascii_lowercase();
    let private_172 = host
        .strip_prefix("172.")
        .and_then(|rest| rest.split('.').next())
        .and_then(|octet| octet.parse::<u8>().ok())
        .is_some_and(|octet| (16..32).contains(&octet));
    if host.starts_with("localhost")
        || host == "0.0.0.0"
        || host.starts_with("127.")
        || base.starts_with("[::1]")
        || host.starts_with("10.")
        || host.starts_with("192.168.")
        || private_172
    {
        "http://"
    } else {
        "https://"
    }
}

#[derive(Debug, Deserialize)]
struct AppendResponse {
    id: u64,
}

/// Relay reached over HTTP (`tidepool-relay`).
pub struct HttpRelayBackend {
    client: reqwest::Client,
    base: Url,
}

impl HttpRelayBackend {
    pub fn new(base: Url) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .no_proxy()
            .build()?;
        Ok(Self { client, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn signals_url(&self, room: &str) -> Result<Url, TransportError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| TransportError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(["rooms", room, "signals"]);
        Ok(url)
    }
}

#[async_trait]
impl RelayBackend for HttpRelayBackend {
    async fn fetch(
        &self,
        room: &str,
        after: u64,
        recipient: &PeerId,
    ) -> Result<Vec<WireSignal>, TransportError> {
        let endpoint = self.signals_url(room)?;
        let response = self
            .client
            .get(endpoint)
            .query(&[("after", after.to_string()), ("recipient", recipient.to_string())])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::HttpStatus(response.status()));
        }
        Ok(response.json::<Vec<WireSignal>>().await?)
    }

    async fn append(&self, room: &str, message: &SignalingMessage) -> Result<u64, TransportError> {
        let endpoint = self.signals_url(room)?;
        let response = self.client.post(endpoint).json(message).send().await?;
        if !response.status().is_success() {
            return Err(TransportError::HttpStatus(response.status()));
        }
        let payload = response.json::<AppendResponse>().await?;
        trace!(target = "tidepool::transport::relay", room, id = payload.id, "appended");
        Ok(payload.id)
    }
}

/// In-process relay. Clones share the same rooms, so several sessions in one
/// process can signal each other through it.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    rooms: Arc<RoomLogs>,
    offline: Arc<AtomicBool>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self, room: &str) -> Arc<RelayLog> {
        self.rooms.room(room)
    }

    /// While offline every call fails with [`TransportError::Offline`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    fn check_online(&self) -> Result<(), TransportError> {
        if self.offline.load(Ordering::Acquire) {
            return Err(TransportError::Offline);
        }
        Ok(())
    }
}

#[async_trait]
impl RelayBackend for MemoryRelay {
    async fn fetch(
        &self,
        room: &str,
        after: u64,
        recipient: &PeerId,
    ) -> Result<Vec<WireSignal>, TransportError> {
        self.check_online()?;
        Ok(self
            .rooms
            .room(room)
            .since(after, recipient)
            .into_iter()
            .map(WireSignal::from)
            .collect())
    }

    async fn append(&self, room: &str, message: &SignalingMessage) -> Result<u64, TransportError> {
        self.check_online()?;
        Ok(self.rooms.room(room).append(message.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidepool_proto::{OutboundSignal, SignalPayload};

    #[test]
    fn infers_scheme_for_private_hosts() {
        assert_eq!(
            normalize_relay_url("localhost:8080").expect("url").as_str(),
            "http://localhost:8080/"
        );
        assert_eq!(
            normalize_relay_url("192.168.1.4:9000").expect("url").scheme(),
            "http"
        );
        assert_eq!(normalize_relay_url("172.20.0.2").expect("url").scheme(), "http");
        assert_eq!(normalize_relay_url("172.40.0.2").expect("url").scheme(), "https");
        assert_eq!(
            normalize_relay_url("relay.example.com").expect("url").scheme(),
            "https"
        );
        assert_eq!(
            normalize_relay_url("http://relay.example.com").expect("url").scheme(),
            "http"
        );
        assert!(normalize_relay_url("  ").is_err());
    }

    #[test]
    fn signals_url_escapes_room() {
        let backend =
            HttpRelayBackend::new(Url::parse("http://127.0.0.1:7000/relay/").expect("url"))
                .expect("backend");
        let url = backend.signals_url("game night").expect("signals url");
        assert_eq!(url.as_str(), "http://127.0.0.1:7000/relay/rooms/game%20night/signals");
    }

    #[tokio::test]
    async fn memory_relay_honours_offline_switch() {
        let relay = MemoryRelay::new();
        let me = PeerId::from("peer-1");
        let message = OutboundSignal::broadcast(SignalPayload::PeerDiscovery).stamp(&me, "me");
        assert_eq!(relay.append("lobby", &message).await.expect("append"), 1);

        relay.set_offline(true);
        assert!(matches!(
            relay.fetch("lobby", 0, &me).await,
            Err(TransportError::Offline)
        ));
        relay.set_offline(false);
        let batch = relay.fetch("lobby", 0, &me).await.expect("fetch");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].kind, "peer-discovery");
    }
}
