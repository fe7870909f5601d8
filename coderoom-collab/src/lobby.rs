//! Lobby state and host election.
//!
//! The lobby lives in the `lobbyState` map: which problem is selected,
//! whether the session has started, and who the host is.
//!
//! Host election is first-claim-wins. After its first sync a participating
//! replica reads `hostId` and, only if absent, writes its own client id.
//! Concurrent claims resolve through the map's last-writer-wins rule, so
//! every replica converges on one value. A present `hostId` is never
//! overwritten and never cleared, even when that client disconnects.

use std::collections::BTreeSet;

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::doc::{DocError, LocalUpdate, SharedDoc, SharedMap};
use crate::protocol::ClientId;

pub const SELECTED_PROBLEM: &str = "selectedProblem";
pub const IS_GAME_STARTED: &str = "isGameStarted";
pub const HOST_ID: &str = "hostId";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemExample {
    pub input: String,
    pub output: String,
}

/// Reference to a problem. Only `id` is required, so `{ "id": "2" }` is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<Difficulty>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<ProblemExample>,
}

impl ProblemRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            difficulty: None,
            topics: Vec::new(),
            tags: Vec::new(),
            examples: Vec::new(),
        }
    }
}

/// Snapshot of the lobby map with defaults for absent fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LobbyState {
    pub selected_problem: Option<ProblemRef>,
    pub is_game_started: bool,
    pub host_id: Option<ClientId>,
}

impl LobbyState {
    pub fn is_host(&self, local_id: Option<ClientId>) -> bool {
        matches!((self.host_id, local_id), (Some(host), Some(local)) if host == local)
    }

    /// Whether the elected host is still in `roster`. `None` while no host is elected.
    pub fn host_connected(&self, roster: &BTreeSet<ClientId>) -> Option<bool> {
        self.host_id.map(|host| roster.contains(&host))
    }
}

impl SharedDoc {
    /// Read the lobby map. Values of the wrong shape read as their default.
    pub fn lobby_state(&self) -> LobbyState {
        let fields = self.fields(SharedMap::Lobby);

        let selected_problem = match fields.get(SELECTED_PROBLEM) {
            None | Some(Value::Null) => None,
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| warn!("Ignoring malformed {SELECTED_PROBLEM}: {e}"))
                .ok(),
        };

        let is_game_started = match fields.get(IS_GAME_STARTED) {
            None | Some(Value::Null) => false,
            Some(Value::Bool(started)) => *started,
            Some(other) => {
                warn!("Ignoring malformed {IS_GAME_STARTED}: {other}");
                false
            }
        };

        let host_id = match fields.get(HOST_ID) {
            None | Some(Value::Null) => None,
            Some(value) => {
                let id = value.as_u64();
                if id.is_none() {
                    warn!("Ignoring malformed {HOST_ID}: {value}");
                }
                id
            }
        };

        LobbyState {
            selected_problem,
            is_game_started,
            host_id,
        }
    }

    pub fn select_problem(&mut self, problem: &ProblemRef) -> Result<LocalUpdate, DocError> {
        let value = serde_json::to_value(problem)?;
        Ok(self.set_field(SharedMap::Lobby, SELECTED_PROBLEM, value))
    }

    /// Mark the session as started. Hosts call this by convention only.
    pub fn start_game(&mut self) -> LocalUpdate {
        self.set_field(SharedMap::Lobby, IS_GAME_STARTED, json!(true))
    }

    /// Write `local_id` as host if no host is recorded yet.
    pub fn claim_host_if_vacant(&mut self, local_id: ClientId) -> Option<LocalUpdate> {
        if self.lobby_state().host_id.is_some() {
            return None;
        }
        Some(self.set_field(SharedMap::Lobby, HOST_ID, json!(local_id)))
    }
}
