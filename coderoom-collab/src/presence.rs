//! Presence (awareness) for everyone connected to a room.
//!
//! Each client owns one JSON object and is its only writer. Identity nests
//! under `user`:
//!
//! ```text
//! { "user": { "name": "Ada", "color": "hsl(210, 100%, 50%)", "isReady": false } }
//! ```
//!
//! Presence is not part of the shared document. It lives exactly as long as
//! the owning connection: the relay announces `PeerLeft` when a connection
//! closes, and a replica that loses its own transport forgets every peer.
//!
//! Updates carry a per-client clock. A replica ignores anything not newer
//! than what it already holds, so reordered or duplicated updates never
//! resurrect an old state.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::protocol::ClientId;

/// Key under which all peer-visible identity is published.
pub const USER_FIELD: &str = "user";

// ───────────────────────────────────────────────────────────────────
// Wire payload
// ───────────────────────────────────────────────────────────────────

/// One client's presence state at a given clock.
///
/// `state` is JSON text; `None` removes the client's presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub client_id: ClientId,
    pub clock: u64,
    pub state: Option<String>,
}

impl AwarenessUpdate {
    pub fn new(client_id: ClientId, clock: u64, state: Option<String>) -> Self {
        Self {
            client_id,
            clock,
            state,
        }
    }

    /// An update that withdraws the client's presence.
    pub fn removal(client_id: ClientId, clock: u64) -> Self {
        Self::new(client_id, clock, None)
    }

    pub fn is_removal(&self) -> bool {
        self.state.is_none()
    }

    /// Parse the state as JSON. `None` for removals and malformed states.
    pub fn parse_state(&self) -> Option<Value> {
        let text = self.state.as_deref()?;
        match serde_json::from_str(text) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Malformed presence state from client {}: {}", self.client_id, e);
                None
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Identity
// ───────────────────────────────────────────────────────────────────

/// The identity a client publishes under `user`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub name: String,
    pub color: String,
    #[serde(default)]
    pub is_ready: bool,
}

impl UserProfile {
    pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: color.into(),
            is_ready: false,
        }
    }

    /// A fresh identity: `User-<0..1000>` with a random fully saturated hue.
    pub fn random() -> Self {
        Self::from_uuid(Uuid::new_v4())
    }

    /// Derive name and color from a UUID, so the same UUID gives the same identity.
    pub fn from_uuid(id: Uuid) -> Self {
        let bits = id.as_u128();
        let hue = bits % 360;
        let number = (bits >> 64) % 1000;
        Self::new(format!("User-{number}"), format!("hsl({hue}, 100%, 50%)"))
    }
}

/// A presence entry as shown in a user list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: ClientId,
    pub name: String,
    pub color: String,
    pub is_ready: bool,
}

impl User {
    fn from_state(id: ClientId, state: &Value) -> Option<Self> {
        let user = state.get(USER_FIELD)?;
        let name = user
            .get("name")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("User {id}"));
        let color = user
            .get("color")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let is_ready = user.get("isReady").and_then(Value::as_bool).unwrap_or(false);

        Some(Self {
            id,
            name,
            color,
            is_ready,
        })
    }
}

/// Which remote clients a presence event touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl PresenceChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Awareness
// ───────────────────────────────────────────────────────────────────

/// Local presence plus the latest known state of every remote client.
pub struct Awareness {
    local_id: Option<ClientId>,
    clock: u64,
    local_state: Map<String, Value>,
    states: BTreeMap<ClientId, Value>,
    clocks: HashMap<ClientId, u64>,
}

impl Awareness {
    /// An awareness with an empty local state.
    pub fn new() -> Self {
        Self {
            local_id: None,
            clock: 0,
            local_state: Map::new(),
            states: BTreeMap::new(),
            clocks: HashMap::new(),
        }
    }

    /// An awareness whose local state starts as `{ user: profile }`.
    pub fn with_user(profile: &UserProfile) -> Self {
        let mut awareness = Self::new();
        if let Ok(user) = serde_json::to_value(profile) {
            awareness.local_state.insert(USER_FIELD.to_string(), user);
        }
        awareness
    }

    pub fn local_id(&self) -> Option<ClientId> {
        self.local_id
    }

    /// Adopt the id the transport assigned to this connection.
    pub fn set_local_id(&mut self, id: ClientId) {
        self.local_id = Some(id);
        // A stale entry under our own id would shadow the local state.
        self.states.remove(&id);
        self.clocks.remove(&id);
    }

    pub fn local_state(&self) -> &Map<String, Value> {
        &self.local_state
    }

    /// The local `user` field, if it is a well-formed profile.
    pub fn local_user(&self) -> Option<UserProfile> {
        let user = self.local_state.get(USER_FIELD)?;
        serde_json::from_value(user.clone()).ok()
    }

    /// Set one top-level field of the local state.
    ///
    /// Returns the update to publish, or `None` while no id is assigned
    /// (the state is still kept and goes out with the next `local_update`).
    pub fn set_local_state_field(&mut self, key: &str, value: Value) -> Option<AwarenessUpdate> {
        self.local_state.insert(key.to_string(), value);
        self.clock += 1;
        self.current_update()
    }

    /// The full local state at a fresh clock, for (re)publishing.
    pub fn local_update(&mut self) -> Option<AwarenessUpdate> {
        self.clock += 1;
        self.current_update()
    }

    fn current_update(&self) -> Option<AwarenessUpdate> {
        let id = self.local_id?;
        let state = Value::Object(self.local_state.clone()).to_string();
        Some(AwarenessUpdate::new(id, self.clock, Some(state)))
    }

    /// Integrate a remote update.
    pub fn apply(&mut self, update: &AwarenessUpdate) -> PresenceChange {
        let mut change = PresenceChange::default();
        let id = update.client_id;

        if Some(id) == self.local_id {
            return change;
        }

        let accepted = match self.clocks.get(&id) {
            None => true,
            Some(&known) => update.clock > known || (update.clock == known && update.is_removal()),
        };
        if !accepted {
            return change;
        }

        if update.is_removal() {
            self.clocks.insert(id, update.clock);
            if self.states.remove(&id).is_some() {
                change.removed.push(id);
            }
            return change;
        }

        let Some(state) = update.parse_state() else {
            return change;
        };
        self.clocks.insert(id, update.clock);
        match self.states.insert(id, state.clone()) {
            None => change.added.push(id),
            Some(previous) if previous != state => change.updated.push(id),
            Some(_) => {}
        }
        change
    }

    /// Forget a client whose connection closed.
    ///
    /// Its last clock stays behind as a tombstone: only a strictly newer
    /// state, which a resumed connection publishes, brings it back.
    pub fn remove(&mut self, id: ClientId) -> PresenceChange {
        let mut change = PresenceChange::default();
        self.clocks.entry(id).or_insert(0);
        if self.states.remove(&id).is_some() {
            change.removed.push(id);
        }
        change
    }

    /// Forget every remote client (local transport lost).
    ///
    /// Clocks go too: the next connection starts with the relay's cached
    /// presence, which carries the clocks we already hold.
    pub fn clear_remote(&mut self) -> PresenceChange {
        self.clocks.clear();
        let removed = std::mem::take(&mut self.states).into_keys().collect();
        PresenceChange {
            removed,
            ..PresenceChange::default()
        }
    }

    /// Raw state of a remote client.
    pub fn state(&self, id: ClientId) -> Option<&Value> {
        self.states.get(&id)
    }

    /// Every known client that publishes a `user`, local included, sorted by id.
    pub fn users(&self) -> Vec<User> {
        let local = self
            .local_id
            .map(|id| (id, Value::Object(self.local_state.clone())));

        let mut users: Vec<User> = self
            .states
            .iter()
            .map(|(id, state)| (*id, state.clone()))
            .chain(local)
            .filter_map(|(id, state)| User::from_state(id, &state))
            .collect();
        users.sort_by_key(|user| user.id);
        users
    }

    /// Ids of every client currently present, local included.
    pub fn roster(&self) -> BTreeSet<ClientId> {
        self.states.keys().copied().chain(self.local_id).collect()
    }

    /// Number of remote clients with a known state.
    pub fn peer_count(&self) -> usize {
        self.states.len()
    }
}

impl Default for Awareness {
    fn default() -> Self {
        Self::new()
    }
}
