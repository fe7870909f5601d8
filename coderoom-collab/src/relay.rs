//! Per-room relay logic, free of any I/O.
//!
//! The relay holds an in-memory replica of the room document so it can
//! answer a joiner's state vector, and the latest presence of every
//! connection so joiners see who is already there. It has no business
//! logic: host election, seeding and execution all happen in clients.

use std::collections::BTreeMap;

use log::{debug, trace, warn};

use crate::doc::SharedDoc;
use crate::presence::AwarenessUpdate;
use crate::protocol::{ClientId, MessageType, SyncMessage, RELAY_ID};

/// Where a relay output goes.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Back to the sending connection only
    Reply(SyncMessage),
    /// To every other connection in the room (`client_id` is the origin)
    Broadcast(SyncMessage),
}

/// Relay state for one room key.
pub struct RelayRoom {
    key: String,
    doc: SharedDoc,
    members: BTreeMap<ClientId, Option<AwarenessUpdate>>,
}

impl RelayRoom {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            doc: SharedDoc::new(),
            members: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, client_id: ClientId) -> bool {
        self.members.contains_key(&client_id)
    }

    pub fn members(&self) -> Vec<ClientId> {
        self.members.keys().copied().collect()
    }

    /// The relay's replica of the room document.
    pub fn doc(&self) -> &SharedDoc {
        &self.doc
    }

    /// Admit a connection. Returns the greeting for the joiner:
    /// `Welcome`, the relay's `SyncStep1`, then the cached presence of
    /// everyone already in the room.
    pub fn join(&mut self, client_id: ClientId) -> Vec<SyncMessage> {
        self.members.insert(client_id, None);

        let mut greeting = vec![
            SyncMessage::welcome(client_id, &self.key),
            SyncMessage::sync_step1(RELAY_ID, &self.key, self.doc.state_vector()),
        ];
        for (id, awareness) in &self.members {
            let Some(update) = awareness else { continue };
            if *id == client_id {
                continue;
            }
            match SyncMessage::awareness(*id, &self.key, update) {
                Ok(msg) => greeting.push(msg),
                Err(e) => warn!("Dropping cached presence of {id}: {e}"),
            }
        }

        debug!("Client {client_id} joined {} ({} members)", self.key, self.members.len());
        greeting
    }

    /// Remove a connection. Announces `PeerLeft` if it was a member.
    pub fn leave(&mut self, client_id: ClientId) -> Option<Delivery> {
        self.members.remove(&client_id)?;
        debug!("Client {client_id} left {} ({} members)", self.key, self.members.len());
        Some(Delivery::Broadcast(SyncMessage::peer_left(client_id, &self.key)))
    }

    /// Process one message from the member `from`.
    pub fn handle(&mut self, from: ClientId, msg: &SyncMessage) -> Vec<Delivery> {
        if !self.contains(from) {
            warn!("Ignoring {:?} from non-member {from} in {}", msg.msg_type, self.key);
            return Vec::new();
        }

        match msg.msg_type {
            MessageType::SyncStep1 => match self.doc.diff_since(&msg.payload) {
                Ok(diff) => vec![Delivery::Reply(SyncMessage::sync_step2(RELAY_ID, &self.key, diff))],
                Err(e) => {
                    warn!("Bad state vector from {from} in {}: {e}", self.key);
                    Vec::new()
                }
            },

            // A client's step 2 holds what the relay lacked; peers lack it too.
            MessageType::SyncStep2 | MessageType::Update => {
                if let Err(e) = self.doc.apply_update(&msg.payload) {
                    warn!("Dropping bad update from {from} in {}: {e}", self.key);
                    return Vec::new();
                }
                trace!("Relaying {} byte update from {from}", msg.payload.len());
                vec![Delivery::Broadcast(SyncMessage::update(
                    from,
                    &self.key,
                    msg.clock,
                    msg.payload.clone(),
                ))]
            }

            MessageType::Awareness => self.handle_awareness(from, msg),

            MessageType::Ping => vec![Delivery::Reply(SyncMessage::pong(RELAY_ID))],

            MessageType::Pong => Vec::new(),

            other => {
                debug!("Ignoring {other:?} from {from} in {}", self.key);
                Vec::new()
            }
        }
    }

    fn handle_awareness(&mut self, from: ClientId, msg: &SyncMessage) -> Vec<Delivery> {
        let update = match msg.awareness_update() {
            Ok(update) => update,
            Err(e) => {
                warn!("Bad presence from {from} in {}: {e}", self.key);
                return Vec::new();
            }
        };

        // Presence is single-writer: a connection may only speak for itself.
        if update.client_id != from {
            warn!(
                "Client {from} tried to publish presence for {} in {}",
                update.client_id, self.key
            );
            return Vec::new();
        }

        let outgoing = match SyncMessage::awareness(from, &self.key, &update) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Cannot re-encode presence of {from}: {e}");
                return Vec::new();
            }
        };

        let cached = self.members.entry(from).or_insert(None);
        let newer = cached.as_ref().map_or(true, |known| update.clock >= known.clock);
        if !newer {
            return Vec::new();
        }
        *cached = (!update.is_removal()).then_some(update);

        vec![Delivery::Broadcast(outgoing)]
    }
}
