//! In-memory relay for deterministic multi-client tests.
//!
//! Runs a `RelayRoom` and any number of `Room` replicas in one thread.
//! Frames move only when the test says so (`step`, `pump`), and a
//! partitioned replica has its incoming broadcasts held until `heal`.

#![allow(dead_code)]

use std::collections::BTreeMap;

use coderoom_collab::client::{ConnectionState, TransportEvent};
use coderoom_collab::protocol::{ClientId, SyncMessage};
use coderoom_collab::relay::{Delivery, RelayRoom};
use coderoom_collab::room::{Room, RoomEvent, RoomOptions};

pub const KEY: &str = "lobby-ABC";

struct Peer {
    room: Room,
    online: bool,
    partitioned: bool,
    held: Vec<SyncMessage>,
}

pub struct Loopback {
    relay: RelayRoom,
    peers: BTreeMap<ClientId, Peer>,
    next_id: ClientId,
}

impl Loopback {
    pub fn new() -> Self {
        Self {
            relay: RelayRoom::new(KEY),
            peers: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Admit a new replica and hand it the relay greeting. Nothing else moves.
    pub fn join(&mut self, options: RoomOptions) -> ClientId {
        let id = self.next_id;
        self.next_id += 1;
        self.peers.insert(
            id,
            Peer {
                room: Room::new(KEY, options),
                online: false,
                partitioned: false,
                held: Vec::new(),
            },
        );
        self.reconnect(id);
        id
    }

    /// Join and run every frame to completion.
    pub fn connect(&mut self, options: RoomOptions) -> ClientId {
        let id = self.join(options);
        self.pump();
        id
    }

    /// Close a replica's connection. The relay announces it left.
    pub fn drop_connection(&mut self, id: ClientId) {
        let peer = self.peer_mut(id);
        peer.online = false;
        peer.held.clear();
        peer.room.handle(TransportEvent::Status(ConnectionState::Disconnected));
        if let Some(delivery) = self.relay.leave(id) {
            self.deliver(id, delivery);
        }
    }

    /// Reconnect a dropped replica under its old id.
    pub fn reconnect(&mut self, id: ClientId) {
        let greeting = self.relay.join(id);
        let peer = self.peer_mut(id);
        peer.online = true;
        peer.room.handle(TransportEvent::Status(ConnectionState::Connected));
        for msg in greeting {
            peer.room.handle(TransportEvent::Message(msg));
        }
    }

    /// Drop the connection and forget the replica.
    pub fn leave(&mut self, id: ClientId) -> Room {
        self.drop_connection(id);
        let peer = self.peers.remove(&id).expect("unknown peer");
        peer.room
    }

    pub fn partition(&mut self, id: ClientId) {
        self.peer_mut(id).partitioned = true;
    }

    /// Deliver everything held for `id`, in order.
    pub fn heal(&mut self, id: ClientId) {
        let peer = self.peer_mut(id);
        peer.partitioned = false;
        for msg in std::mem::take(&mut peer.held) {
            peer.room.handle(TransportEvent::Message(msg));
        }
    }

    /// Send what `id` has queued right now through the relay.
    /// Returns whether anything was sent.
    pub fn step(&mut self, id: ClientId) -> bool {
        let peer = self.peer_mut(id);
        if !peer.online {
            return false;
        }
        let outbox = peer.room.take_outbox();
        let sent = !outbox.is_empty();
        for msg in outbox {
            for delivery in self.relay.handle(id, &msg) {
                self.deliver(id, delivery);
            }
        }
        sent
    }

    /// Step every replica until nothing moves.
    pub fn pump(&mut self) {
        loop {
            let ids: Vec<ClientId> = self.peers.keys().copied().collect();
            let mut moved = false;
            for id in ids {
                moved |= self.step(id);
            }
            if !moved {
                break;
            }
        }
    }

    fn deliver(&mut self, from: ClientId, delivery: Delivery) {
        match delivery {
            Delivery::Reply(msg) => {
                self.peer_mut(from).room.handle(TransportEvent::Message(msg));
            }
            Delivery::Broadcast(msg) => {
                for (id, peer) in self.peers.iter_mut() {
                    if *id == msg.client_id || !peer.online {
                        continue;
                    }
                    if peer.partitioned {
                        peer.held.push(msg.clone());
                    } else {
                        peer.room.handle(TransportEvent::Message(msg.clone()));
                    }
                }
            }
        }
    }

    fn peer_mut(&mut self, id: ClientId) -> &mut Peer {
        self.peers.get_mut(&id).expect("unknown peer")
    }

    pub fn room(&self, id: ClientId) -> &Room {
        &self.peers.get(&id).expect("unknown peer").room
    }

    /// Mutate a replica. Call `pump` to deliver the result.
    pub fn room_mut(&mut self, id: ClientId) -> &mut Room {
        &mut self.peer_mut(id).room
    }

    pub fn events(&mut self, id: ClientId) -> Vec<RoomEvent> {
        self.peer_mut(id).room.take_events()
    }

    pub fn relay(&self) -> &RelayRoom {
        &self.relay
    }

    pub fn ids(&self) -> Vec<ClientId> {
        self.peers.keys().copied().collect()
    }
}

pub fn participant(name: &str) -> RoomOptions {
    RoomOptions::default().with_profile(coderoom_collab::UserProfile::new(name, "hsl(0, 100%, 50%)"))
}
