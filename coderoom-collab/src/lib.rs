//! # coderoom-collab: Shared coding rooms over a CRDT relay
//!
//! Every participant holds a full replica of the room document. A thin
//! relay forwards updates and presence between the replicas of a room and
//! keeps a replica of its own so late joiners can catch up.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ CollabSession│ ◄─────────────────► │ SyncServer   │
//! │  SyncClient  │    Binary Proto     │  RoomManager │
//! └──────┬───────┘                     └──────┬───────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌──────────────┐                     ┌──────────────┐
//! │ Room         │                     │ RelayRoom    │
//! │  SharedDoc   │                     │  SharedDoc   │
//! │  Awareness   │                     │  presence    │
//! │  SeedGuard   │                     └──────┬───────┘
//! └──────────────┘                            │
//!                                     ┌───────┴───────┐
//!                                     │ BroadcastGroup│
//!                                     │ (fan-out)     │
//!                                     └───────────────┘
//! ```
//!
//! The room document holds the `code` text and three last-writer-wins
//! maps: `lobbyState`, `executionState` and `executionResults`. Presence
//! (name, colour, ready flag) travels separately and disappears with the
//! connection.
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`doc`]: The room document and its change detection
//! - [`presence`]: Awareness states and user profiles
//! - [`lobby`]: Problem selection, game start, host election
//! - [`bootstrap`]: One-shot starter template seeding
//! - [`execution`]: Shared run/submit state and results
//! - [`backend`]: HTTP client for the execution service
//! - [`room`]: Client replica state machine
//! - [`client`]: WebSocket transport with reconnect
//! - [`session`]: Room plus transport
//! - [`relay`], [`broadcast`], [`server`]: The relay

pub mod protocol;
pub mod doc;
pub mod presence;
pub mod profile;
pub mod lobby;
pub mod bootstrap;
pub mod execution;
pub mod backend;
pub mod config;
pub mod room;
pub mod client;
pub mod session;
pub mod relay;
pub mod broadcast;
pub mod server;

// Re-exports for convenience
pub use protocol::{ClientId, MessageType, ProtocolError, SyncMessage, RELAY_ID};
pub use doc::{DocChange, DocError, LocalUpdate, SharedDoc, SharedMap};
pub use presence::{Awareness, AwarenessUpdate, User, UserProfile};
pub use profile::{ProfileError, ProfileStore};
pub use lobby::{Difficulty, LobbyState, ProblemExample, ProblemRef};
pub use bootstrap::{seed_leader, SeedDecision, SeedGuard};
pub use execution::{
    ExecutionResults, ExecutionResultsPatch, ExecutionState, ExecutionStatePatch, RunResult,
    RunStatus, SubmitResult, SubmitStatus, TestCaseResult,
};
pub use backend::{ApiClient, ApiError, ExecutionBackend, RunRequest, SubmitRequest};
pub use config::CollabConfig;
pub use room::{Room, RoomEvent, RoomOptions};
pub use client::{ConnectionState, SyncClient, TransportEvent};
pub use session::{CollabSession, SessionError};
pub use relay::{Delivery, RelayRoom};
pub use broadcast::{BroadcastGroup, BroadcastStats, JoinRefusal, RoomManager};
pub use server::{ServerConfig, ServerStats, SyncServer};
