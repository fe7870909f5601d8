//! Per-room fan-out with backpressure, and the registry of live rooms.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers. Each
//! connection gets an independent receiver that buffers up to `capacity`
//! frames; a connection that falls further behind lags and loses frames
//! (its next sync handshake after reconnecting repairs the document).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{info, warn};
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::protocol::{ClientId, ProtocolError, SyncMessage};
use crate::relay::{Delivery, RelayRoom};

/// An encoded message and the connection it came from.
#[derive(Debug)]
pub struct Frame {
    pub origin: ClientId,
    pub bytes: Vec<u8>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub receivers: usize,
}

/// Lock-free counters on the send path.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// A broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Frame>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` frames are buffered per receiver before it starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            stats: AtomicBroadcastStats::default(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Frame>> {
        self.sender.subscribe()
    }

    /// Encode and send `msg` to every receiver, the origin's included.
    /// Receivers skip frames they originated.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let frame = Frame {
            origin: msg.client_id,
            bytes: msg.encode()?,
        };
        Ok(self.broadcast_frame(Arc::new(frame)))
    }

    /// Send a pre-encoded frame. Returns the number of receivers.
    pub fn broadcast_frame(&self, frame: Arc<Frame>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a lagging receiver lost.
    pub fn record_lag(&self, skipped: u64) {
        self.stats.messages_dropped.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            receivers: self.sender.receiver_count(),
        }
    }
}

/// A live room: relay state plus its fan-out group.
pub struct RoomChannel {
    relay: Mutex<RelayRoom>,
    group: BroadcastGroup,
}

impl RoomChannel {
    fn new(key: &str, capacity: usize) -> Self {
        Self {
            relay: Mutex::new(RelayRoom::new(key)),
            group: BroadcastGroup::new(capacity),
        }
    }

    pub fn group(&self) -> &BroadcastGroup {
        &self.group
    }

    pub async fn member_count(&self) -> usize {
        self.relay.lock().await.member_count()
    }

    pub async fn members(&self) -> Vec<ClientId> {
        self.relay.lock().await.members()
    }

    /// Run `msg` through the relay. Broadcasts go out before the relay lock
    /// is released, so every receiver sees them in relay order. Replies for
    /// the sender are returned.
    pub async fn dispatch(&self, from: ClientId, msg: &SyncMessage) -> Vec<SyncMessage> {
        let mut relay = self.relay.lock().await;
        let deliveries = relay.handle(from, msg);
        self.deliver(deliveries)
    }

    fn deliver(&self, deliveries: impl IntoIterator<Item = Delivery>) -> Vec<SyncMessage> {
        let mut replies = Vec::new();
        for delivery in deliveries {
            match delivery {
                Delivery::Reply(msg) => replies.push(msg),
                Delivery::Broadcast(msg) => {
                    if let Err(e) = self.group.broadcast(&msg) {
                        warn!("Failed to broadcast {:?}: {e}", msg.msg_type);
                    }
                }
            }
        }
        replies
    }
}

/// Why a join was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinRefusal {
    RoomFull { max_peers: usize },
}

impl std::fmt::Display for JoinRefusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RoomFull { max_peers } => write!(f, "room is full ({max_peers} peers)"),
        }
    }
}

/// A successful join: the room, a receiver for its broadcasts, and the
/// greeting to send to the joiner first.
pub struct Joined {
    pub channel: Arc<RoomChannel>,
    pub receiver: broadcast::Receiver<Arc<Frame>>,
    pub greeting: Vec<SyncMessage>,
}

/// Room manager: maps room keys to live rooms.
///
/// Rooms are created by the first join and dropped with their last member.
/// Nothing is persisted.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<RoomChannel>>>,
    capacity: usize,
    max_peers: usize,
}

impl RoomManager {
    pub fn new(capacity: usize, max_peers: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
            max_peers,
        }
    }

    /// Admit `client_id` into the room `key`, creating the room if needed.
    ///
    /// Holds the registry lock for the whole join so a concurrent last
    /// leave cannot drop the room under the joiner.
    pub async fn join(&self, key: &str, client_id: ClientId) -> Result<Joined, JoinRefusal> {
        let mut rooms = self.rooms.write().await;
        let channel = rooms
            .entry(key.to_string())
            .or_insert_with(|| {
                info!("Room {key} created");
                Arc::new(RoomChannel::new(key, self.capacity))
            })
            .clone();

        let mut relay = channel.relay.lock().await;
        if relay.member_count() >= self.max_peers {
            if relay.is_empty() {
                rooms.remove(key);
            }
            return Err(JoinRefusal::RoomFull {
                max_peers: self.max_peers,
            });
        }

        let receiver = channel.group.subscribe();
        let greeting = relay.join(client_id);
        drop(relay);

        Ok(Joined {
            channel,
            receiver,
            greeting,
        })
    }

    /// Remove `client_id` from `key`, announce it, and drop the room if empty.
    /// Returns `true` if the room was dropped.
    pub async fn leave(&self, key: &str, client_id: ClientId) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(channel) = rooms.get(key).cloned() else {
            return false;
        };

        let mut relay = channel.relay.lock().await;
        let announcement = relay.leave(client_id);
        channel.deliver(announcement);

        if relay.is_empty() {
            drop(relay);
            rooms.remove(key);
            info!("Room {key} removed (empty)");
            return true;
        }
        false
    }

    pub async fn get(&self, key: &str) -> Option<Arc<RoomChannel>> {
        self.rooms.read().await.get(key).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn room_keys(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;

    #[tokio::test]
    async fn test_broadcast_fan_out() {
        let group = BroadcastGroup::new(16);
        let mut rx1 = group.subscribe();
        let mut rx2 = group.subscribe();

        let msg = SyncMessage::update(1, "r", 1, vec![1, 2, 3]);
        assert_eq!(group.broadcast(&msg).unwrap(), 2);

        for rx in [&mut rx1, &mut rx2] {
            let frame = rx.recv().await.unwrap();
            assert_eq!(frame.origin, 1);
            assert_eq!(SyncMessage::decode(&frame.bytes).unwrap(), msg);
        }
        assert_eq!(group.stats().messages_sent, 1);
        assert_eq!(group.stats().receivers, 2);
    }

    #[tokio::test]
    async fn test_broadcast_without_receivers() {
        let group = BroadcastGroup::new(4);
        assert_eq!(group.broadcast(&SyncMessage::ping(1)).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.subscribe();
        for i in 0..5 {
            group.broadcast(&SyncMessage::update(1, "r", i, vec![])).unwrap();
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => group.record_lag(n),
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(group.stats().messages_dropped, 3);
    }

    #[tokio::test]
    async fn test_manager_join_and_leave() {
        let manager = RoomManager::new(16, 4);
        let a = manager.join("lobby-ABC", 1).await.unwrap();
        let mut b = manager.join("lobby-ABC", 2).await.unwrap();
        assert_eq!(manager.room_count().await, 1);
        assert_eq!(a.channel.members().await, vec![1, 2]);
        assert_eq!(b.greeting[0].msg_type, MessageType::Welcome);

        assert!(!manager.leave("lobby-ABC", 1).await);
        let frame = b.receiver.recv().await.unwrap();
        let left = SyncMessage::decode(&frame.bytes).unwrap();
        assert_eq!(left.msg_type, MessageType::PeerLeft);
        assert_eq!(left.client_id, 1);

        assert!(manager.leave("lobby-ABC", 2).await);
        assert_eq!(manager.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_manager_enforces_capacity() {
        let manager = RoomManager::new(16, 2);
        manager.join("r", 1).await.unwrap();
        manager.join("r", 2).await.unwrap();

        let refused = manager.join("r", 3).await.err();
        assert_eq!(refused, Some(JoinRefusal::RoomFull { max_peers: 2 }));

        // Other rooms are unaffected.
        assert!(manager.join("other", 3).await.is_ok());
    }

    #[tokio::test]
    async fn test_dispatch_broadcasts_and_replies() {
        let manager = RoomManager::new(16, 4);
        let a = manager.join("r", 1).await.unwrap();
        let mut b = manager.join("r", 2).await.unwrap();

        let replies = a.channel.dispatch(1, &SyncMessage::ping(1)).await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].msg_type, MessageType::Pong);

        let mut doc = crate::doc::SharedDoc::new();
        let bytes = doc.insert_text(0, "hi").unwrap().update;
        let replies = a.channel.dispatch(1, &SyncMessage::update(1, "r", 1, bytes)).await;
        assert!(replies.is_empty());

        let frame = b.receiver.recv().await.unwrap();
        assert_eq!(frame.origin, 1);
    }
}
