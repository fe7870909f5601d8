//! WebSocket transport client.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, automatic reconnect)
//! - Join handshake, resuming the previous client id after a drop
//! - Heartbeat replies
//!
//! The client moves `SyncMessage`s and nothing else; document and presence
//! semantics live in [`Room`](crate::room::Room). Messages sent while
//! disconnected are dropped: the state-vector handshake after reconnecting
//! re-sends whatever the relay missed.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::config::CollabConfig;
use crate::protocol::{ClientId, MessageType, ProtocolError, SyncMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Status(ConnectionState),
    Message(SyncMessage),
    ConnectionError(String),
}

/// How one connection attempt ended.
enum SessionEnd {
    /// The socket closed or failed; reconnect if configured.
    Dropped,
    /// `disconnect` was called or the client was dropped.
    Shutdown,
}

/// Everything the connection task owns.
struct Connection {
    url: String,
    room: String,
    config: CollabConfig,
    state: Arc<RwLock<ConnectionState>>,
    event_tx: mpsc::Sender<TransportEvent>,
    outgoing_rx: mpsc::UnboundedReceiver<SyncMessage>,
    shutdown_rx: watch::Receiver<bool>,
    /// Id from the last `Welcome`, requested again on rejoin
    client_id: Option<ClientId>,
}

/// The transport client for one room.
pub struct SyncClient {
    config: CollabConfig,
    room: String,
    state: Arc<RwLock<ConnectionState>>,
    event_tx: mpsc::Sender<TransportEvent>,
    event_rx: Option<mpsc::Receiver<TransportEvent>>,
    outgoing_tx: Option<mpsc::UnboundedSender<SyncMessage>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl SyncClient {
    pub fn new(config: CollabConfig, room: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        Self {
            config,
            room: room.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            event_tx,
            event_rx: Some(event_rx),
            outgoing_tx: None,
            shutdown_tx: None,
            task: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.event_rx.take()
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Start the connection task. Failures are reported as events and,
    /// with `auto_reconnect`, retried after `reconnect_delay`.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        if self.is_running() {
            return Err(ProtocolError::AlreadyConnected);
        }

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.state.write().await = ConnectionState::Connecting;

        let connection = Connection {
            url: self.config.websocket_url.clone(),
            room: self.room.clone(),
            config: self.config.clone(),
            state: self.state.clone(),
            event_tx: self.event_tx.clone(),
            outgoing_rx,
            shutdown_rx,
            client_id: None,
        };

        self.outgoing_tx = Some(outgoing_tx);
        self.shutdown_tx = Some(shutdown_tx);
        self.task = Some(tokio::spawn(connection.run()));
        Ok(())
    }

    /// Queue a message for the relay.
    pub fn send(&self, msg: SyncMessage) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(msg).map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Close the connection and stop reconnecting.
    pub async fn disconnect(&mut self) {
        if let Some(shutdown) = self.shutdown_tx.take() {
            let _ = shutdown.send(true);
        }
        self.outgoing_tx = None;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Connection task for {} ended abnormally: {e}", self.room);
            }
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown_tx.take() {
            let _ = shutdown.send(true);
        }
    }
}

impl Connection {
    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    async fn emit(&self, event: TransportEvent) {
        let _ = self.event_tx.send(event).await;
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    async fn run(mut self) {
        loop {
            if self.shutdown_requested() {
                break;
            }

            match tokio_tungstenite::connect_async(self.url.as_str()).await {
                Ok((ws_stream, _)) => {
                    // Anything queued while offline is stale.
                    while self.outgoing_rx.try_recv().is_ok() {}

                    self.set_state(ConnectionState::Connected).await;
                    self.emit(TransportEvent::Status(ConnectionState::Connected)).await;
                    info!("Connected to {} for room {}", self.url, self.room);

                    let end = self.run_session(ws_stream).await;

                    self.set_state(ConnectionState::Disconnected).await;
                    self.emit(TransportEvent::Status(ConnectionState::Disconnected)).await;
                    info!("Disconnected from room {}", self.room);

                    if let SessionEnd::Shutdown = end {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Connecting to {} failed: {e}", self.url);
                    self.emit(TransportEvent::ConnectionError(e.to_string())).await;
                }
            }

            if !self.config.auto_reconnect || !self.wait_before_retry().await {
                break;
            }
            self.set_state(ConnectionState::Reconnecting).await;
        }

        self.set_state(ConnectionState::Disconnected).await;
    }

    /// Sleep the reconnect delay, dropping outgoing messages.
    /// Returns `false` if the client shut down meanwhile.
    async fn wait_before_retry(&mut self) -> bool {
        let sleep = tokio::time::sleep(self.config.reconnect_delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        return false;
                    }
                }
                msg = self.outgoing_rx.recv() => {
                    match msg {
                        Some(msg) => debug!("Dropping {:?} while offline", msg.msg_type),
                        None => return false,
                    }
                }
            }
        }
    }

    async fn run_session(
        &mut self,
        ws_stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> SessionEnd {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let join = match SyncMessage::join(&self.room, self.client_id).and_then(|m| m.encode()) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.emit(TransportEvent::ConnectionError(e.to_string())).await;
                return SessionEnd::Dropped;
            }
        };
        if let Err(e) = ws_sender.send(Message::Binary(join.into())).await {
            self.emit(TransportEvent::ConnectionError(e.to_string())).await;
            return SessionEnd::Dropped;
        }

        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        let _ = ws_sender.send(Message::Close(None)).await;
                        return SessionEnd::Shutdown;
                    }
                }

                outgoing = self.outgoing_rx.recv() => {
                    let Some(msg) = outgoing else {
                        let _ = ws_sender.send(Message::Close(None)).await;
                        return SessionEnd::Shutdown;
                    };
                    let bytes = match msg.encode() {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            warn!("Dropping unencodable {:?}: {e}", msg.msg_type);
                            continue;
                        }
                    };
                    if let Err(e) = ws_sender.send(Message::Binary(bytes.into())).await {
                        self.emit(TransportEvent::ConnectionError(e.to_string())).await;
                        return SessionEnd::Dropped;
                    }
                }

                frame = ws_receiver.next() => {
                    match frame {
                        Some(Ok(Message::Binary(data))) => {
                            let msg = match SyncMessage::decode(&data) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    warn!("Failed to decode relay message: {e}");
                                    continue;
                                }
                            };
                            match msg.msg_type {
                                MessageType::Ping => {
                                    let pong = SyncMessage::pong(self.client_id.unwrap_or_default());
                                    if let Ok(bytes) = pong.encode() {
                                        let _ = ws_sender.send(Message::Binary(bytes.into())).await;
                                    }
                                    continue;
                                }
                                MessageType::Pong => continue,
                                MessageType::Welcome => {
                                    debug!("Assigned client id {} in {}", msg.client_id, self.room);
                                    self.client_id = Some(msg.client_id);
                                }
                                MessageType::Rejected => {
                                    let reason = msg.reason().unwrap_or_default();
                                    warn!("Relay rejected join to {}: {reason}", self.room);
                                    self.emit(TransportEvent::ConnectionError(reason)).await;
                                    return SessionEnd::Dropped;
                                }
                                _ => {}
                            }
                            if self.event_tx.send(TransportEvent::Message(msg)).await.is_err() {
                                return SessionEnd::Shutdown;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return SessionEnd::Dropped,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("WebSocket error in {}: {e}", self.room);
                            self.emit(TransportEvent::ConnectionError(e.to_string())).await;
                            return SessionEnd::Dropped;
                        }
                    }
                }
            }
        }
    }
}
