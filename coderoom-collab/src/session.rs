//! A room replica wired to a live relay.
//!
//! `CollabSession` owns a [`SyncClient`] and a [`Room`]. Pulling events
//! with [`next_event`](CollabSession::next_event) drives both: transport
//! events are fed into the room and whatever the room wants sent goes
//! back out through the client.

use std::future::Future;

use log::{debug, warn};
use tokio::sync::mpsc;

use crate::backend::{ApiClient, ApiError, ExecutionBackend};
use crate::client::{SyncClient, TransportEvent};
use crate::config::CollabConfig;
use crate::doc::DocError;
use crate::execution::{RunResult, SubmitResult};
use crate::lobby::ProblemRef;
use crate::profile::ProfileStore;
use crate::protocol::ProtocolError;
use crate::room::{Room, RoomEvent, RoomOptions};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Transport error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Doc(#[from] DocError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("No problem selected")]
    NoProblemSelected,
}

pub struct CollabSession {
    room: Room,
    client: SyncClient,
    transport_rx: mpsc::Receiver<TransportEvent>,
    profile_store: Option<ProfileStore>,
}

impl CollabSession {
    /// Join room `key` on the relay from `config`.
    pub async fn connect(
        config: CollabConfig,
        key: impl Into<String>,
        options: RoomOptions,
    ) -> Result<Self, SessionError> {
        let key = key.into();
        let mut client = SyncClient::new(config, key.clone());
        let transport_rx = client.take_event_rx().ok_or(ProtocolError::ConnectionClosed)?;
        client.connect().await?;

        Ok(Self {
            room: Room::new(key, options),
            client,
            transport_rx,
            profile_store: None,
        })
    }

    /// Remember the local name in `store` whenever it changes.
    pub fn with_profile_store(mut self, store: ProfileStore) -> Self {
        self.profile_store = Some(store);
        self
    }

    pub fn room(&self) -> &Room {
        &self.room
    }

    /// Next room event, waiting on the transport if none is pending.
    /// `None` once the session is closed.
    pub async fn next_event(&mut self) -> Option<RoomEvent> {
        loop {
            if let Some(event) = self.room.next_event() {
                return Some(event);
            }
            if self.room.is_closed() {
                return None;
            }
            let transport = self.transport_rx.recv().await?;
            self.room.handle(transport);
            self.flush();
        }
    }

    /// Mutate the room and send what it produced.
    pub fn with_room<R>(&mut self, f: impl FnOnce(&mut Room) -> R) -> R {
        let out = f(&mut self.room);
        self.flush();
        out
    }

    /// Await `work` while still feeding transport events into the room, so
    /// the connection never stalls behind a slow call.
    async fn drive<F: Future>(&mut self, work: F) -> F::Output {
        tokio::pin!(work);
        loop {
            tokio::select! {
                output = &mut work => return output,
                Some(transport) = self.transport_rx.recv() => {
                    self.room.handle(transport);
                    self.flush();
                }
            }
        }
    }

    fn flush(&mut self) {
        for msg in self.room.take_outbox() {
            if let Err(e) = self.client.send(msg) {
                debug!("Dropping outgoing message for {}: {e}", self.room.key());
            }
        }
    }

    pub fn update_name(&mut self, name: impl Into<String>) {
        self.with_room(|room| room.update_name(name));

        let Some(store) = &self.profile_store else { return };
        let Some(profile) = self.room.local_profile() else { return };
        if let Err(e) = store.save(&profile) {
            warn!("Could not save profile {}: {}", store.path().display(), e);
        }
    }

    pub fn toggle_ready(&mut self) {
        self.with_room(Room::toggle_ready);
    }

    pub fn select_problem(&mut self, problem: &ProblemRef) -> Result<(), SessionError> {
        Ok(self.with_room(|room| room.select_problem(problem))?)
    }

    pub fn start_game(&mut self) {
        self.with_room(Room::start_game);
    }

    pub fn insert_code(&mut self, offset: u32, chunk: &str) -> Result<(), SessionError> {
        Ok(self.with_room(|room| room.insert_code(offset, chunk))?)
    }

    pub fn delete_code(&mut self, offset: u32, len: u32) -> Result<(), SessionError> {
        Ok(self.with_room(|room| room.delete_code(offset, len))?)
    }

    pub fn select_test_case(&mut self, index: u32) {
        self.with_room(|room| room.select_test_case(index));
    }

    pub fn set_starter_template(&mut self, template: impl Into<String>) {
        self.with_room(|room| room.set_starter_template(template));
    }

    /// Fetch the starter code of the current problem and seed it if this
    /// replica is the one to do so.
    pub async fn load_template(&mut self, api: &ApiClient) -> Result<(), SessionError> {
        let problem_id = self.room.problem_id().ok_or(SessionError::NoProblemSelected)?;
        let template = api.fetch_template(&problem_id).await?;
        self.set_starter_template(template);
        Ok(())
    }

    /// Run the shared code on the selected test case. Everyone in the room
    /// sees the run start and its result. `None` if there is nothing to run.
    pub async fn run_code(&mut self, backend: &dyn ExecutionBackend) -> Result<Option<RunResult>, SessionError> {
        let Some(request) = self.with_room(Room::begin_run)? else {
            return Ok(None);
        };
        let result = self.drive(backend.run(&request)).await;
        self.with_room(|room| room.finish_run(result.clone()))?;
        Ok(Some(result))
    }

    pub async fn submit_code(
        &mut self,
        backend: &dyn ExecutionBackend,
    ) -> Result<Option<SubmitResult>, SessionError> {
        let Some(request) = self.with_room(Room::begin_submit)? else {
            return Ok(None);
        };
        let result = self.drive(backend.submit(&request)).await;
        self.with_room(|room| room.finish_submit(result.clone()))?;
        Ok(Some(result))
    }

    /// Leave the room. Nothing is delivered afterwards.
    pub async fn close(&mut self) {
        self.room.close();
        self.client.disconnect().await;
    }
}
