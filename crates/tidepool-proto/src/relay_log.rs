use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::{PeerId, SignalingMessage};

/// Entries kept per room before the oldest are discarded.
pub const DEFAULT_RETENTION: usize = 4096;

/// Append-only signaling log for one room. Ids start at 1 and only grow,
/// so a reader cursor of 0 sits below every entry.
#[derive(Debug)]
pub struct RelayLog {
    inner: RwLock<LogInner>,
    retention: usize,
}

#[derive(Debug)]
struct LogInner {
    last_id: u64,
    entries: VecDeque<SignalingMessage>,
}

impl RelayLog {
    pub fn new(retention: usize) -> Self {
        Self {
            inner: RwLock::new(LogInner {
                last_id: 0,
                entries: VecDeque::new(),
            }),
            retention: retention.max(1),
        }
    }

    /// Assign the next id and store the message. Any id the caller set is
    /// overwritten.
    pub fn append(&self, mut message: SignalingMessage) -> u64 {
        let mut guard = self.inner.write();
        guard.last_id += 1;
        let id = guard.last_id;
        message.id = Some(id);
        guard.entries.push_back(message);
        while guard.entries.len() > self.retention {
            guard.entries.pop_front();
        }
        id
    }

    /// Messages with `id > after` that `recipient` may see, ascending by id.
    pub fn since(&self, after: u64, recipient: &PeerId) -> Vec<SignalingMessage> {
        let guard = self.inner.read();
        guard
            .entries
            .iter()
            .filter(|entry| entry.id.is_some_and(|id| id > after))
            .filter(|entry| entry.is_visible_to(recipient))
            .cloned()
            .collect()
    }

    pub fn last_id(&self) -> u64 {
        self.inner.read().last_id
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }
}

impl Default for RelayLog {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

/// Room name -> log, created on first touch.
#[derive(Debug)]
pub struct RoomLogs {
    rooms: RwLock<HashMap<String, Arc<RelayLog>>>,
    retention: usize,
}

impl RoomLogs {
    pub fn new(retention: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            retention,
        }
    }

    pub fn room(&self, room: &str) -> Arc<RelayLog> {
        if let Some(log) = self.rooms.read().get(room) {
            return Arc::clone(log);
        }
        let mut guard = self.rooms.write();
        Arc::clone(
            guard
                .entry(room.to_string())
                .or_insert_with(|| Arc::new(RelayLog::new(self.retention))),
        )
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }
}

impl Default for RoomLogs {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OutboundSignal, SignalPayload};

    fn discovery(from: &str) -> SignalingMessage {
        OutboundSignal::broadcast(SignalPayload::PeerDiscovery).stamp(&PeerId::from(from), from)
    }

    fn direct(from: &str, to: &str) -> SignalingMessage {
        OutboundSignal::to(PeerId::from(to), SignalPayload::PeerDiscovery)
            .stamp(&PeerId::from(from), from)
    }

    #[test]
    fn assigns_increasing_ids_from_one() {
        let log = RelayLog::default();
        assert_eq!(log.append(discovery("a")), 1);
        assert_eq!(log.append(discovery("b")), 2);
        assert_eq!(log.last_id(), 2);
    }

    #[test]
    fn filters_by_cursor_and_recipient() {
        let log = RelayLog::default();
        log.append(discovery("a"));
        log.append(direct("a", "b"));
        log.append(direct("a", "c"));
        log.append(discovery("c"));

        let for_b: Vec<u64> = log
            .since(0, &PeerId::from("b"))
            .into_iter()
            .filter_map(|m| m.id)
            .collect();
        assert_eq!(for_b, vec![1, 2, 4]);

        let after_two: Vec<u64> = log
            .since(2, &PeerId::from("b"))
            .into_iter()
            .filter_map(|m| m.id)
            .collect();
        assert_eq!(after_two, vec![4]);
    }

    #[test]
    fn retention_drops_oldest_but_keeps_ids() {
        let log = RelayLog::new(2);
        for name in ["a", "b", "c"] {
            log.append(discovery(name));
        }
        assert_eq!(log.len(), 2);
        let ids: Vec<u64> = log
            .since(0, &PeerId::from("z"))
            .into_iter()
            .filter_map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn rooms_are_isolated() {
        let rooms = RoomLogs::default();
        rooms.room("lobby").append(discovery("a"));
        assert_eq!(rooms.room("lobby").len(), 1);
        assert!(rooms.room("kitchen").is_empty());
        assert_eq!(rooms.room_count(), 2);
    }
}
