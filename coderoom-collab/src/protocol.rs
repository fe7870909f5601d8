//! Binary protocol for room synchronization over the relay.
//!
//! Wire format (bincode-encoded, one message per binary WebSocket frame):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ client_id │ room     │ clock    │ payload  │
//! │ 1 byte   │ varint    │ string   │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Payloads are opaque to the relay except for `Join` (resume request),
//! `Awareness` (to enforce single-writer presence) and `Rejected` (reason).

use serde::{Deserialize, Serialize};

use crate::presence::AwarenessUpdate;

/// Transport-assigned identifier, unique per live connection.
pub type ClientId = u64;

/// Sender id used by messages that originate at the relay itself.
pub const RELAY_ID: ClientId = 0;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client asks to enter a room, optionally resuming a previous id
    Join = 1,
    /// Relay assigns the transport client id
    Welcome = 2,
    /// Yrs state vector for the sync handshake
    SyncStep1 = 3,
    /// Yrs state diff answering a `SyncStep1`
    SyncStep2 = 4,
    /// Incremental CRDT update
    Update = 5,
    /// Presence state update
    Awareness = 6,
    /// A connection in the room closed
    PeerLeft = 7,
    /// Join refused (room full, malformed join)
    Rejected = 8,
    /// Heartbeat ping
    Ping = 9,
    /// Heartbeat pong
    Pong = 10,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Originating client (`RELAY_ID` for relay-originated messages)
    pub client_id: ClientId,
    /// Room key, e.g. `lobby-ABC`
    pub room: String,
    /// Lamport clock of the sender, for causal ordering per origin
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, client_id: ClientId, room: &str, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            client_id,
            room: room.to_string(),
            clock,
            payload,
        }
    }

    /// Create a join request. `resume` asks the relay to reuse an id
    /// this client held on a previous connection.
    pub fn join(room: &str, resume: Option<ClientId>) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(resume, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::new(MessageType::Join, RELAY_ID, room, 0, payload))
    }

    /// Create the relay's welcome, carrying the assigned id in `client_id`.
    pub fn welcome(client_id: ClientId, room: &str) -> Self {
        Self::new(MessageType::Welcome, client_id, room, 0, Vec::new())
    }

    /// Create a sync step 1 (state vector).
    pub fn sync_step1(client_id: ClientId, room: &str, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, client_id, room, 0, state_vector)
    }

    /// Create a sync step 2 (state diff).
    pub fn sync_step2(client_id: ClientId, room: &str, state_diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, client_id, room, 0, state_diff)
    }

    /// Create an incremental update message.
    pub fn update(client_id: ClientId, room: &str, clock: u64, yrs_update: Vec<u8>) -> Self {
        Self::new(MessageType::Update, client_id, room, clock, yrs_update)
    }

    /// Create a presence update message.
    pub fn awareness(client_id: ClientId, room: &str, update: &AwarenessUpdate) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(update, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::new(MessageType::Awareness, client_id, room, update.clock, payload))
    }

    /// Create a peer left notification.
    pub fn peer_left(client_id: ClientId, room: &str) -> Self {
        Self::new(MessageType::PeerLeft, client_id, room, 0, Vec::new())
    }

    /// Create a join rejection.
    pub fn rejected(room: &str, reason: &str) -> Self {
        Self::new(MessageType::Rejected, RELAY_ID, room, 0, reason.as_bytes().to_vec())
    }

    /// Create a ping message.
    pub fn ping(client_id: ClientId) -> Self {
        Self::new(MessageType::Ping, client_id, "", 0, Vec::new())
    }

    /// Create a pong message.
    pub fn pong(client_id: ClientId) -> Self {
        Self::new(MessageType::Pong, client_id, "", 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the resume request of a `Join`.
    pub fn resume_id(&self) -> Result<Option<ClientId>, ProtocolError> {
        if self.msg_type != MessageType::Join {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (resume, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(resume)
    }

    /// Parse the presence payload of an `Awareness` message.
    pub fn awareness_update(&self) -> Result<AwarenessUpdate, ProtocolError> {
        if self.msg_type != MessageType::Awareness {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (update, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(update)
    }

    /// Reason text of a `Rejected` message.
    pub fn reason(&self) -> Result<String, ProtocolError> {
        if self.msg_type != MessageType::Rejected {
            return Err(ProtocolError::InvalidMessageType);
        }
        Ok(String::from_utf8_lossy(&self.payload).into_owned())
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    InvalidMessageType,
    ConnectionClosed,
    AlreadyConnected,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::AlreadyConnected => write!(f, "Client is already connected"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_roundtrip() {
        let payload = vec![1, 2, 3, 4, 5];
        let msg = SyncMessage::update(7, "lobby-ABC", 42, payload.clone());
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Update);
        assert_eq!(decoded.client_id, 7);
        assert_eq!(decoded.room, "lobby-ABC");
        assert_eq!(decoded.clock, 42);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_join_carries_resume_id() {
        let fresh = SyncMessage::join("lobby-ABC", None).unwrap();
        let resumed = SyncMessage::join("lobby-ABC", Some(12)).unwrap();

        let fresh = SyncMessage::decode(&fresh.encode().unwrap()).unwrap();
        let resumed = SyncMessage::decode(&resumed.encode().unwrap()).unwrap();

        assert_eq!(fresh.resume_id().unwrap(), None);
        assert_eq!(resumed.resume_id().unwrap(), Some(12));
        assert_eq!(resumed.client_id, RELAY_ID);
    }

    #[test]
    fn test_awareness_payload() {
        let update = AwarenessUpdate::new(3, 5, Some(r#"{"user":{"name":"Ada"}}"#.to_string()));
        let msg = SyncMessage::awareness(3, "lobby-ABC", &update).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Awareness);
        assert_eq!(decoded.clock, 5);
        assert_eq!(decoded.awareness_update().unwrap(), update);
    }

    #[test]
    fn test_rejected_reason() {
        let msg = SyncMessage::rejected("lobby-ABC", "room is full");
        assert_eq!(msg.reason().unwrap(), "room is full");
    }

    #[test]
    fn test_invalid_message_type_error() {
        let msg = SyncMessage::ping(1);
        assert_eq!(msg.awareness_update(), Err(ProtocolError::InvalidMessageType));
        assert_eq!(msg.resume_id(), Err(ProtocolError::InvalidMessageType));
        assert!(msg.reason().is_err());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(matches!(
            SyncMessage::decode(&garbage),
            Err(ProtocolError::Deserialization(_))
        ));
    }

    #[test]
    fn test_update_size_efficient() {
        let msg = SyncMessage::update(3, "lobby-ABC", 1, vec![0u8; 50]);
        let encoded = msg.encode().unwrap();
        assert!(
            encoded.len() < 100,
            "Encoded size {} too large for 50-byte update",
            encoded.len()
        );
    }
}
