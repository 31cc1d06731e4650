//! Owned table of remote peers.
//!
//! Every mutation publishes a fresh [`PeerSnapshot`] on a broadcast channel;
//! observers never see the live table.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use tidepool_proto::PeerId;

use crate::media::TrackKind;
use crate::peer::{ChannelLink, LinkState, PeerLink, RemoteTrack};

const SNAPSHOT_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct Peer {
    pub id: PeerId,
    pub name: String,
    pub link: Option<Arc<dyn PeerLink>>,
    pub channel: Option<Arc<dyn ChannelLink>>,
    pub remote_tracks: Vec<RemoteTrack>,
    pub state: LinkState,
    pub generation: u64,
}

impl Peer {
    pub fn new(id: PeerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            link: None,
            channel: None,
            remote_tracks: Vec::new(),
            state: LinkState::New,
            generation: 0,
        }
    }

    pub fn channel_open(&self) -> bool {
        self.channel.as_ref().is_some_and(|channel| channel.is_open())
    }

    pub fn view(&self) -> PeerView {
        PeerView {
            id: self.id.clone(),
            name: self.name.clone(),
            state: self.state,
            channel_open: self.channel_open(),
            remote_media: self.remote_tracks.iter().map(|track| track.kind).collect(),
        }
    }

    async fn close_handles(&self) {
        if let Some(channel) = &self.channel {
            channel.close().await;
        }
        if let Some(link) = &self.link {
            link.close().await;
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("has_link", &self.link.is_some())
            .field("channel_open", &self.channel_open())
            .finish()
    }
}

/// Immutable copy of one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerView {
    pub id: PeerId,
    pub name: String,
    pub state: LinkState,
    pub channel_open: bool,
    pub remote_media: Vec<TrackKind>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub revision: u64,
    pub peers: Vec<PeerView>,
}

impl PeerSnapshot {
    pub fn get(&self, id: &PeerId) -> Option<&PeerView> {
        self.peers.iter().find(|peer| &peer.id == id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

pub struct PeerRegistry {
    peers: RwLock<BTreeMap<PeerId, Peer>>,
    revision: AtomicU64,
    closed: AtomicBool,
    updates: broadcast::Sender<PeerSnapshot>,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerRegistry {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(SNAPSHOT_CAPACITY);
        Self {
            peers: RwLock::new(BTreeMap::new()),
            revision: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            updates,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerSnapshot> {
        self.updates.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Insert or replace the entry for `peer.id`, returning the old one.
    /// The caller owns closing any handles the old entry held.
    pub fn upsert(&self, peer: Peer) -> Option<Peer> {
        if self.is_closed() {
            return None;
        }
        let previous = self.peers.write().insert(peer.id.clone(), peer);
        self.notify();
        previous
    }

    /// Mutate an entry in place. Returns `None` (and emits nothing) when the
    /// id is absent.
    pub fn update<R>(&self, id: &PeerId, f: impl FnOnce(&mut Peer) -> R) -> Option<R> {
        if self.is_closed() {
            return None;
        }
        let result = {
            let mut guard = self.peers.write();
            let peer = guard.get_mut(id)?;
            f(peer)
        };
        self.notify();
        Some(result)
    }

    pub fn get(&self, id: &PeerId) -> Option<Peer> {
        self.peers.read().get(id).cloned()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.read().contains_key(id)
    }

    pub fn all(&self) -> Vec<Peer> {
        self.peers.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Channels currently open, for fan-out.
    pub fn open_channels(&self) -> Vec<(PeerId, Arc<dyn ChannelLink>)> {
        self.peers
            .read()
            .values()
            .filter_map(|peer| match &peer.channel {
                Some(channel) if channel.is_open() => Some((peer.id.clone(), Arc::clone(channel))),
                _ => None,
            })
            .collect()
    }

    /// Close the entry's channel and link, then drop it. Removing an absent
    /// id is a silent no-op.
    pub async fn remove(&self, id: &PeerId) -> bool {
        if self.is_closed() {
            return false;
        }
        let removed = { self.peers.write().remove(id) };
        let Some(peer) = removed else {
            return false;
        };
        peer.close_handles().await;
        debug!(target = "tidepool::registry", peer = %id, "peer removed");
        self.notify();
        true
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            revision: self.revision.load(Ordering::Acquire),
            peers: self.peers.read().values().map(Peer::view).collect(),
        }
    }

    /// Close every handle without notifying anyone. Later mutations are
    /// ignored.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<Peer> = {
            let mut guard = self.peers.write();
            std::mem::take(&mut *guard).into_values().collect()
        };
        for peer in &drained {
            peer.close_handles().await;
        }
        debug!(target = "tidepool::registry", closed = drained.len(), "registry shut down");
    }

    fn notify(&self) {
        self.revision.fetch_add(1, Ordering::AcqRel);
        let snapshot = self.snapshot();
        trace!(
            target = "tidepool::registry",
            revision = snapshot.revision,
            peers = snapshot.len(),
            "snapshot published"
        );
        let _ = self.updates.send(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerConnector;
    use crate::peer::loopback::LoopbackNetwork;

    #[tokio::test]
    async fn mutations_publish_snapshots() {
        let registry = PeerRegistry::new();
        let mut updates = registry.subscribe();

        registry.upsert(Peer::new(PeerId::from("peer-2"), "bob"));
        let first = updates.recv().await.expect("snapshot");
        assert_eq!(first.revision, 1);
        assert_eq!(first.peers[0].name, "bob");

        registry.update(&PeerId::from("peer-2"), |peer| peer.state = LinkState::Connected);
        let second = updates.recv().await.expect("snapshot");
        assert_eq!(second.get(&PeerId::from("peer-2")).map(|p| p.state), Some(LinkState::Connected));
        // earlier snapshots are unaffected
        assert_eq!(first.peers[0].state, LinkState::New);
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_closes_link() {
        let network = LoopbackNetwork::new();
        let remote = PeerId::from("peer-2");
        let handle = network
            .connector(PeerId::from("peer-1"))
            .connect(&remote)
            .await
            .expect("link");
        let registry = PeerRegistry::new();
        let mut peer = Peer::new(remote.clone(), "bob");
        peer.link = Some(Arc::clone(&handle.link));
        registry.upsert(peer);
        let mut updates = registry.subscribe();

        assert!(registry.remove(&remote).await);
        assert_eq!(handle.link.connection_state(), LinkState::Closed);
        assert!(updates.recv().await.expect("snapshot").is_empty());

        assert!(!registry.remove(&remote).await);
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn shutdown_is_silent_and_final() {
        let registry = PeerRegistry::new();
        registry.upsert(Peer::new(PeerId::from("peer-2"), "bob"));
        let mut updates = registry.subscribe();

        registry.shutdown().await;
        assert!(registry.is_empty());
        registry.upsert(Peer::new(PeerId::from("peer-3"), "carol"));
        assert!(registry.is_empty());
        assert!(updates.try_recv().is_err());
    }
}
