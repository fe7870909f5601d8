//! Client-side replica of one room.
//!
//! `Room` combines the shared document, presence, host election and
//! template seeding into a single-threaded state machine. It is fed
//! [`TransportEvent`]s and produces outgoing [`SyncMessage`]s plus
//! [`RoomEvent`]s for the UI. It never does I/O itself, so the same room
//! runs over a live relay ([`CollabSession`](crate::session::CollabSession))
//! or an in-memory one in tests.
//!
//! Handshake per connection:
//!
//! ```text
//! relay                         room
//!   │── Welcome(id) ──────────────►│ adopt id, publish presence
//!   │◄───────────── SyncStep1(sv) ─│
//!   │── SyncStep1(relay sv) ──────►│
//!   │◄─────────── SyncStep2(diff) ─│
//!   │── SyncStep2(diff) ──────────►│ sync(true): claim host, seed template
//! ```

use std::collections::{BTreeSet, VecDeque};

use log::{debug, info, warn};

use crate::backend::{RunRequest, SubmitRequest};
use crate::bootstrap::{SeedDecision, SeedGuard};
use crate::client::{ConnectionState, TransportEvent};
use crate::doc::{DocChange, DocError, LocalUpdate, SharedDoc, SharedMap};
use crate::execution::{
    ExecutionResults, ExecutionResultsPatch, ExecutionState, ExecutionStatePatch, RunResult,
    SubmitResult,
};
use crate::lobby::{LobbyState, ProblemRef};
use crate::presence::{Awareness, AwarenessUpdate, PresenceChange, User, UserProfile, USER_FIELD};
use crate::protocol::{ClientId, MessageType, SyncMessage};

/// How a replica takes part in its room.
#[derive(Debug, Clone)]
pub struct RoomOptions {
    /// Publish presence and claim host. `false` gives a read-only observer.
    pub participate: bool,
    pub profile: UserProfile,
    /// Code to seed into an empty buffer, if known up front
    pub starter_template: Option<String>,
    /// Problem to run against when the lobby has none selected
    pub problem_id: Option<String>,
}

impl Default for RoomOptions {
    fn default() -> Self {
        Self {
            participate: true,
            profile: UserProfile::random(),
            starter_template: None,
            problem_id: None,
        }
    }
}

impl RoomOptions {
    pub fn observer() -> Self {
        Self {
            participate: false,
            ..Self::default()
        }
    }

    pub fn with_profile(mut self, profile: UserProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.starter_template = Some(template.into());
        self
    }

    pub fn with_problem(mut self, problem_id: impl Into<String>) -> Self {
        self.problem_id = Some(problem_id.into());
        self
    }
}

/// Notifications for whoever renders the room.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    Status(ConnectionState),
    Synced(bool),
    ConnectionError(String),
    UsersChanged(Vec<User>),
    LobbyChanged(LobbyState),
    CodeChanged(String),
    ExecutionStateChanged(ExecutionState),
    ExecutionResultsChanged(ExecutionResults),
}

pub struct Room {
    key: String,
    doc: SharedDoc,
    awareness: Awareness,
    seed: SeedGuard,
    participate: bool,
    problem_id: Option<String>,
    client_id: Option<ClientId>,
    connected: bool,
    synced: bool,
    closed: bool,
    /// Lamport clock stamped on outgoing updates
    clock: u64,
    outbox: VecDeque<SyncMessage>,
    events: VecDeque<RoomEvent>,
}

impl Room {
    pub fn new(key: impl Into<String>, options: RoomOptions) -> Self {
        let awareness = if options.participate {
            Awareness::with_user(&options.profile)
        } else {
            Awareness::new()
        };

        Self {
            key: key.into(),
            doc: SharedDoc::new(),
            awareness,
            seed: SeedGuard::new(options.starter_template),
            participate: options.participate,
            problem_id: options.problem_id,
            client_id: None,
            connected: false,
            synced: false,
            closed: false,
            clock: 0,
            outbox: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    // ── Queries ──────────────────────────────────────────────────

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn doc(&self) -> &SharedDoc {
        &self.doc
    }

    pub fn text(&self) -> &str {
        self.doc.text()
    }

    pub fn lobby_state(&self) -> LobbyState {
        self.doc.lobby_state()
    }

    pub fn execution_state(&self) -> ExecutionState {
        self.doc.execution_state()
    }

    pub fn execution_results(&self) -> ExecutionResults {
        self.doc.execution_results()
    }

    pub fn users(&self) -> Vec<User> {
        self.awareness.users()
    }

    /// Ids of every connected client this replica knows of, itself included.
    pub fn roster(&self) -> BTreeSet<ClientId> {
        self.awareness.roster()
    }

    pub fn is_host(&self) -> bool {
        self.lobby_state().is_host(self.client_id)
    }

    /// Whether the elected host is still present. `None` before election.
    pub fn host_connected(&self) -> Option<bool> {
        self.lobby_state().host_connected(&self.roster())
    }

    /// The problem run and submit go against.
    pub fn problem_id(&self) -> Option<String> {
        self.problem_id
            .clone()
            .or_else(|| self.lobby_state().selected_problem.map(|p| p.id))
    }

    pub fn local_profile(&self) -> Option<UserProfile> {
        self.awareness.local_user()
    }

    // ── Plumbing ─────────────────────────────────────────────────

    /// Messages for the relay, in order.
    pub fn take_outbox(&mut self) -> Vec<SyncMessage> {
        self.outbox.drain(..).collect()
    }

    pub fn next_event(&mut self) -> Option<RoomEvent> {
        self.events.pop_front()
    }

    pub fn take_events(&mut self) -> Vec<RoomEvent> {
        self.events.drain(..).collect()
    }

    /// Stop reacting to anything. Later transport events and results are ignored.
    pub fn close(&mut self) {
        self.closed = true;
        self.outbox.clear();
        self.events.clear();
    }

    /// Feed one transport event.
    pub fn handle(&mut self, event: TransportEvent) {
        if self.closed {
            return;
        }
        match event {
            TransportEvent::Status(state) => {
                self.events.push_back(RoomEvent::Status(state));
                match state {
                    ConnectionState::Connected => self.connected = true,
                    ConnectionState::Disconnected => self.on_disconnected(),
                    ConnectionState::Connecting | ConnectionState::Reconnecting => {}
                }
            }
            TransportEvent::ConnectionError(e) => {
                self.events.push_back(RoomEvent::ConnectionError(e));
            }
            TransportEvent::Message(msg) => self.on_message(msg),
        }
    }

    fn on_disconnected(&mut self) {
        self.connected = false;
        if self.synced {
            self.synced = false;
            self.events.push_back(RoomEvent::Synced(false));
        }
        // Peers are only visible while we are connected.
        let change = self.awareness.clear_remote();
        self.presence_changed(&change);
    }

    fn on_message(&mut self, msg: SyncMessage) {
        match msg.msg_type {
            MessageType::Welcome => self.on_welcome(msg.client_id),

            MessageType::SyncStep1 => {
                let Some(id) = self.client_id else { return };
                match self.doc.diff_since(&msg.payload) {
                    Ok(diff) => self.outbox.push_back(SyncMessage::sync_step2(id, &self.key, diff)),
                    Err(e) => warn!("Bad state vector from relay in {}: {e}", self.key),
                }
            }

            MessageType::SyncStep2 => {
                self.apply_remote(&msg.payload);
                if !self.synced {
                    self.synced = true;
                    self.events.push_back(RoomEvent::Synced(true));
                    self.on_synced();
                }
            }

            MessageType::Update => {
                self.clock = self.clock.max(msg.clock);
                self.apply_remote(&msg.payload);
            }

            MessageType::Awareness => match msg.awareness_update() {
                Ok(update) => {
                    let change = self.awareness.apply(&update);
                    self.presence_changed(&change);
                }
                Err(e) => warn!("Bad presence message in {}: {e}", self.key),
            },

            MessageType::PeerLeft => {
                let change = self.awareness.remove(msg.client_id);
                self.presence_changed(&change);
            }

            MessageType::Rejected => {
                let reason = msg.reason().unwrap_or_default();
                self.events.push_back(RoomEvent::ConnectionError(reason));
            }

            MessageType::Join | MessageType::Ping | MessageType::Pong => {}
        }
    }

    fn on_welcome(&mut self, id: ClientId) {
        if self.client_id.is_some_and(|previous| previous != id) {
            info!("Rejoined {} as client {id} (was {:?})", self.key, self.client_id);
        }
        self.client_id = Some(id);
        self.awareness.set_local_id(id);

        if self.participate {
            let update = self.awareness.local_update();
            self.publish_presence(update);
            self.events.push_back(RoomEvent::UsersChanged(self.awareness.users()));
        }

        self.outbox
            .push_back(SyncMessage::sync_step1(id, &self.key, self.doc.state_vector()));
    }

    /// Runs on every `sync(true)`; each step is safe to repeat.
    fn on_synced(&mut self) {
        if !self.participate {
            return;
        }
        let Some(id) = self.client_id else { return };

        if let Some(local) = self.doc.claim_host_if_vacant(id) {
            info!("Client {id} claimed host of {}", self.key);
            self.publish(local);
        }
        self.evaluate_seed();
    }

    fn evaluate_seed(&mut self) {
        if !self.participate || !self.synced {
            return;
        }
        let Some(id) = self.client_id else { return };
        let roster = self.awareness.roster();

        match self.seed.evaluate(&mut self.doc, id, &roster) {
            Ok(SeedDecision::Inserted(local)) => self.publish(local),
            Ok(decision) => debug!("Seed check in {}: {decision:?}", self.key),
            Err(e) => warn!("Seeding {} failed: {e}", self.key),
        }
    }

    fn apply_remote(&mut self, payload: &[u8]) {
        match self.doc.apply_update(payload) {
            Ok(changes) => self.dispatch(&changes),
            Err(e) => warn!("Dropping bad update in {}: {e}", self.key),
        }
    }

    fn presence_changed(&mut self, change: &PresenceChange) {
        if change.is_empty() {
            return;
        }
        self.events.push_back(RoomEvent::UsersChanged(self.awareness.users()));
        // A departed peer may have been the would-be seeder.
        if !change.removed.is_empty() {
            self.evaluate_seed();
        }
    }

    fn dispatch(&mut self, changes: &[DocChange]) {
        for change in changes {
            let event = match change {
                DocChange::Text => RoomEvent::CodeChanged(self.doc.text().to_string()),
                DocChange::Map { map: SharedMap::Lobby, .. } => RoomEvent::LobbyChanged(self.doc.lobby_state()),
                DocChange::Map { map: SharedMap::ExecutionState, .. } => {
                    RoomEvent::ExecutionStateChanged(self.doc.execution_state())
                }
                DocChange::Map { map: SharedMap::ExecutionResults, .. } => {
                    RoomEvent::ExecutionResultsChanged(self.doc.execution_results())
                }
            };
            self.events.push_back(event);
        }
    }

    /// Notify local observers and queue the update for peers.
    fn publish(&mut self, local: LocalUpdate) {
        self.dispatch(&local.changes);
        let Some(id) = self.client_id.filter(|_| self.connected) else {
            // Reaches the relay through the next sync handshake.
            return;
        };
        self.clock += 1;
        self.outbox
            .push_back(SyncMessage::update(id, &self.key, self.clock, local.update));
    }

    fn publish_presence(&mut self, update: Option<AwarenessUpdate>) {
        let Some(update) = update else { return };
        if !self.connected {
            return;
        }
        match SyncMessage::awareness(update.client_id, &self.key, &update) {
            Ok(msg) => self.outbox.push_back(msg),
            Err(e) => warn!("Cannot encode presence: {e}"),
        }
    }

    // ── Presence ─────────────────────────────────────────────────

    fn set_user(&mut self, profile: &UserProfile) {
        if !self.participate || self.closed {
            return;
        }
        let Ok(value) = serde_json::to_value(profile) else { return };
        let update = self.awareness.set_local_state_field(USER_FIELD, value);
        self.publish_presence(update);
        self.events.push_back(RoomEvent::UsersChanged(self.awareness.users()));
    }

    pub fn update_name(&mut self, name: impl Into<String>) {
        if let Some(mut profile) = self.awareness.local_user() {
            profile.name = name.into();
            self.set_user(&profile);
        }
    }

    pub fn toggle_ready(&mut self) {
        if let Some(mut profile) = self.awareness.local_user() {
            profile.is_ready = !profile.is_ready;
            self.set_user(&profile);
        }
    }

    // ── Lobby ────────────────────────────────────────────────────

    pub fn select_problem(&mut self, problem: &ProblemRef) -> Result<(), DocError> {
        if self.closed {
            return Ok(());
        }
        let local = self.doc.select_problem(problem)?;
        self.publish(local);
        Ok(())
    }

    pub fn start_game(&mut self) {
        if self.closed {
            return;
        }
        let local = self.doc.start_game();
        self.publish(local);
    }

    // ── Code ─────────────────────────────────────────────────────

    pub fn insert_code(&mut self, offset: u32, chunk: &str) -> Result<(), DocError> {
        if self.closed {
            return Ok(());
        }
        let local = self.doc.insert_text(offset, chunk)?;
        self.publish(local);
        Ok(())
    }

    pub fn delete_code(&mut self, offset: u32, len: u32) -> Result<(), DocError> {
        if self.closed {
            return Ok(());
        }
        let local = self.doc.delete_text(offset, len)?;
        self.publish(local);
        Ok(())
    }

    /// Supply the starter template, seeding right away if already synced.
    pub fn set_starter_template(&mut self, template: impl Into<String>) {
        if self.closed {
            return;
        }
        self.seed.set_template(template);
        self.evaluate_seed();
    }

    // ── Execution ────────────────────────────────────────────────

    pub fn set_execution_state(&mut self, patch: ExecutionStatePatch) {
        if self.closed {
            return;
        }
        let local = self.doc.set_execution_state(patch);
        self.publish(local);
    }

    pub fn set_execution_results(&mut self, patch: ExecutionResultsPatch) -> Result<(), DocError> {
        if self.closed {
            return Ok(());
        }
        let local = self.doc.set_execution_results(patch)?;
        self.publish(local);
        Ok(())
    }

    pub fn select_test_case(&mut self, index: u32) {
        self.set_execution_state(ExecutionStatePatch::selected_test_case(index));
    }

    /// Start a run: mark it in progress for everyone and clear the last
    /// submission. `None` when there is no problem or no code.
    pub fn begin_run(&mut self) -> Result<Option<RunRequest>, DocError> {
        let Some((problem_id, code)) = self.runnable() else {
            return Ok(None);
        };
        let test_case_index = self.execution_state().selected_test_case;

        self.set_execution_state(ExecutionStatePatch::running(true).with_show_results(true));
        self.set_execution_results(ExecutionResultsPatch::submit(None))?;

        Ok(Some(RunRequest {
            problem_id,
            code,
            test_case_index,
        }))
    }

    pub fn finish_run(&mut self, result: RunResult) -> Result<(), DocError> {
        self.set_execution_results(ExecutionResultsPatch::run(Some(result)))?;
        self.set_execution_state(ExecutionStatePatch::running(false));
        Ok(())
    }

    pub fn begin_submit(&mut self) -> Result<Option<SubmitRequest>, DocError> {
        let Some((problem_id, code)) = self.runnable() else {
            return Ok(None);
        };

        self.set_execution_state(ExecutionStatePatch::submitting(true).with_show_results(true));
        self.set_execution_results(ExecutionResultsPatch::run(None))?;

        Ok(Some(SubmitRequest { problem_id, code }))
    }

    pub fn finish_submit(&mut self, result: SubmitResult) -> Result<(), DocError> {
        self.set_execution_results(ExecutionResultsPatch::submit(Some(result)))?;
        self.set_execution_state(ExecutionStatePatch::submitting(false));
        Ok(())
    }

    fn runnable(&self) -> Option<(String, String)> {
        if self.closed {
            return None;
        }
        let problem_id = self.problem_id()?;
        let code = self.doc.text();
        if code.is_empty() {
            return None;
        }
        Some((problem_id, code.to_string()))
    }

    /// Hide the results panel for everyone.
    pub fn hide_results(&mut self) {
        self.set_execution_state(ExecutionStatePatch {
            show_results: Some(false),
            ..ExecutionStatePatch::default()
        });
    }

    /// Reset the room's execution state to its defaults.
    pub fn reset_execution(&mut self) -> Result<(), DocError> {
        if self.closed {
            return Ok(());
        }
        self.set_execution_state(ExecutionStatePatch {
            is_running: Some(false),
            is_submitting: Some(false),
            show_results: Some(false),
            selected_test_case: Some(0),
        });
        self.set_execution_results(ExecutionResultsPatch {
            run_result: Some(None),
            submit_result: Some(None),
        })
    }
}
