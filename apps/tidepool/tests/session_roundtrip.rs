use std::sync::Arc;
use std::time::Duration;

use tidepool_core::chat::ChatKind;
use tidepool_core::media::{MediaMode, StaticMediaDevices};
use tidepool_core::peer::LinkState;
use tidepool_core::peer::loopback::LoopbackNetwork;
use tidepool_core::proto::{PeerId, SignalKind};
use tidepool_core::registry::PeerSnapshot;
use tidepool_core::session::{
    LocalIdentity, NetworkSession, SessionBackends, SessionConfig, SessionEvent,
};
use tidepool_core::transport::MemoryRelay;
use tokio::sync::broadcast;
use tokio::time::timeout;

const ROOM: &str = "lan-party";
const WAIT: Duration = Duration::from_secs(5);

struct Room {
    relay: MemoryRelay,
    network: LoopbackNetwork,
}

impl Room {
    fn new() -> Self {
        Self {
            relay: MemoryRelay::new(),
            network: LoopbackNetwork::new(),
        }
    }

    fn join(&self, id: &str, name: &str, camera: bool) -> NetworkSession {
        let identity = LocalIdentity::new(PeerId::from(id), name);
        let backends = SessionBackends {
            relay: Arc::new(self.relay.clone()),
            connector: Arc::new(self.network.connector(identity.id.clone())),
            media: Arc::new(StaticMediaDevices::new(camera, true)),
        };
        let config = SessionConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_discovery_interval(Duration::from_millis(100));
        NetworkSession::start(ROOM, identity, config, backends)
    }
}

async fn wait_for_peers<F>(session: &NetworkSession, mut ready: F) -> PeerSnapshot
where
    F: FnMut(&PeerSnapshot) -> bool,
{
    let mut updates = session.subscribe_peers();
    timeout(WAIT, async {
        loop {
            let snapshot = session.snapshot();
            if ready(&snapshot) {
                return snapshot;
            }
            match updates.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return session.snapshot(),
            }
        }
    })
    .await
    .expect("peer snapshot condition reached in time")
}

fn connected_to(id: &str) -> impl FnMut(&PeerSnapshot) -> bool + '_ {
    move |snapshot| {
        snapshot
            .get(&PeerId::from(id))
            .is_some_and(|peer| peer.state == LinkState::Connected && peer.channel_open)
    }
}

#[tokio::test]
async fn greater_id_offers_and_chat_reaches_the_other_side() {
    let room = Room::new();
    let alice = room.join("peer-100", "alice", true);
    let bob = room.join("peer-200", "bob", true);
    let mut bob_events = bob.subscribe();
    let mut alice_events = alice.subscribe();

    wait_for_peers(&alice, connected_to("peer-200")).await;
    wait_for_peers(&bob, connected_to("peer-100")).await;

    // read the log as both peers so offers in either direction show up
    let log = room.relay.log(ROOM);
    let mut offers: Vec<(u64, PeerId)> = ["peer-100", "peer-200"]
        .into_iter()
        .flat_map(|id| log.since(0, &PeerId::from(id)))
        .filter(|message| message.kind() == SignalKind::Offer)
        .filter_map(|message| message.id.map(|id| (id, message.from)))
        .collect();
    offers.sort();
    offers.dedup();
    let senders: Vec<PeerId> = offers.into_iter().map(|(_, from)| from).collect();
    assert_eq!(senders, vec![PeerId::from("peer-200")]);

    let local = alice.send_chat("hi").await.expect("send chat");
    assert_eq!(local.peer_id, PeerId::from("peer-100"));

    let received = timeout(WAIT, async {
        loop {
            if let Ok(SessionEvent::Chat(message)) = bob_events.recv().await {
                return message;
            }
        }
    })
    .await
    .expect("chat delivered");
    assert_eq!(received.peer_id, PeerId::from("peer-100"));
    assert_eq!(received.peer_name, "alice");
    assert_eq!(received.content, "hi");
    assert_eq!(received.kind, ChatKind::Text);

    // exactly one local echo on the sender's side
    let mut echoes = 0;
    while let Ok(event) = alice_events.try_recv() {
        if matches!(event, SessionEvent::Chat(ref message) if message.content == "hi") {
            echoes += 1;
        }
    }
    assert_eq!(echoes, 1);

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn file_offers_surface_as_records() {
    let room = Room::new();
    let alice = room.join("peer-100", "alice", true);
    let bob = room.join("peer-200", "bob", true);
    let mut alice_events = alice.subscribe();
    wait_for_peers(&bob, connected_to("peer-100")).await;

    bob.offer_file("slides.pdf", 2048).await.expect("offer file");
    let record = timeout(WAIT, async {
        loop {
            if let Ok(SessionEvent::FileOffered(record)) = alice_events.recv().await {
                return record;
            }
        }
    })
    .await
    .expect("file offer delivered");
    assert_eq!(record.peer_id, PeerId::from("peer-200"));
    assert_eq!(record.name, "slides.pdf");
    assert_eq!(record.progress, 0);

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn missing_camera_degrades_to_audio_only() {
    let room = Room::new();
    let alice = room.join("peer-100", "alice", false);
    let status = timeout(WAIT, async {
        loop {
            if let Some(status) = alice.media_status() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("media settled");
    assert_eq!(status.mode, MediaMode::AudioOnly);
    assert!(!status.video_enabled);
    assert!(status.audio_enabled);
    alice.close().await;
}

#[tokio::test]
async fn departure_removes_the_peer_and_teardown_is_silent() {
    let room = Room::new();
    let alice = room.join("peer-100", "alice", true);
    let bob = room.join("peer-200", "bob", true);
    wait_for_peers(&bob, connected_to("peer-100")).await;
    wait_for_peers(&alice, connected_to("peer-200")).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut alice_events = alice.subscribe();
    let mut alice_peers = alice.subscribe_peers();
    alice.close().await;

    let remaining = wait_for_peers(&bob, |snapshot| snapshot.is_empty()).await;
    assert!(remaining.is_empty());

    let sent_by_alice = || {
        room.relay
            .log(ROOM)
            .since(0, &PeerId::from("peer-100"))
            .iter()
            .filter(|message| message.from == PeerId::from("peer-100"))
            .count()
    };
    let before = sent_by_alice();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sent_by_alice(), before);

    assert!(alice_events.try_recv().is_err());
    assert!(alice_peers.try_recv().is_err());

    bob.close().await;
}

#[tokio::test]
async fn close_during_startup_leaves_nothing_behind() {
    let room = Room::new();
    let alice = room.join("peer-100", "alice", true);
    alice.close().await;
    alice.close().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(alice.snapshot().is_empty());
    assert_eq!(room.network.link_count(), 0);
}
