//! WebSocket relay server with room-based routing.
//!
//! ```text
//! Client A ──┐                     ┌── RelayRoom (yrs replica + presence cache)
//!             ├── Room "lobby-ABC" ─┤
//! Client B ──┘                     └── BroadcastGroup ──► A, B (minus origin)
//! ```
//!
//! Each connection sends `Join` first. The server assigns a client id from
//! a global counter (or honours a resume request for an id it issued
//! before that is no longer connected), admits the connection to the room,
//! and from then on pumps frames between the socket and the room.
//!
//! Rooms live only as long as they have members; nothing is persisted.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{Joined, RoomManager};
use crate::protocol::{ClientId, MessageType, SyncMessage, RELAY_ID};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum connections per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Heartbeat interval in seconds; a connection silent for three
    /// intervals is closed
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:1234".to_string(),
            max_peers_per_room: 16,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_joins: u64,
    /// Connections closed because they fell behind the room broadcast
    pub lagged_disconnects: u64,
    pub active_rooms: usize,
}

/// Hands out transport client ids.
#[derive(Debug)]
struct IdAllocator {
    next: ClientId,
    active: HashSet<ClientId>,
}

impl IdAllocator {
    fn new() -> Self {
        Self {
            next: RELAY_ID + 1,
            active: HashSet::new(),
        }
    }

    /// Reuse `resume` if this allocator issued it and it is free,
    /// otherwise issue a fresh id.
    fn allocate(&mut self, resume: Option<ClientId>) -> ClientId {
        let id = match resume {
            Some(id) if id != RELAY_ID && id < self.next && !self.active.contains(&id) => id,
            _ => {
                let id = self.next;
                self.next += 1;
                id
            }
        };
        self.active.insert(id);
        id
    }

    fn release(&mut self, id: ClientId) {
        self.active.remove(&id);
    }
}

type WsStream = WebSocketStream<TcpStream>;
type WsSink = SplitSink<WsStream, Message>;
type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Shared server state handed to each connection task.
struct Shared {
    config: ServerConfig,
    rooms: RoomManager,
    ids: Mutex<IdAllocator>,
    stats: RwLock<ServerStats>,
}

/// The relay server.
pub struct SyncServer {
    shared: Arc<Shared>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let rooms = RoomManager::new(config.broadcast_capacity, config.max_peers_per_room);
        Self {
            shared: Arc::new(Shared {
                config,
                rooms,
                ids: Mutex::new(IdAllocator::new()),
                stats: RwLock::new(ServerStats::default()),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.shared.stats.read().await.clone();
        stats.active_rooms = self.shared.rooms.room_count().await;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn room_manager(&self) -> &RoomManager {
        &self.shared.rooms
    }
}

async fn send(ws: &mut WsSink, msg: &SyncMessage) -> Result<(), BoxError> {
    ws.send(Message::Binary(msg.encode()?.into())).await?;
    Ok(())
}

/// Read frames until a binary message decodes, skipping control frames.
async fn next_sync_message(
    ws_receiver: &mut SplitStream<WsStream>,
    addr: SocketAddr,
) -> Option<SyncMessage> {
    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(Message::Binary(data)) => match SyncMessage::decode(&data) {
                Ok(msg) => return Some(msg),
                Err(e) => log::warn!("Failed to decode message from {addr}: {e}"),
            },
            Ok(Message::Close(_)) => return None,
            Ok(_) => {}
            Err(e) => {
                log::debug!("WebSocket error from {addr} before join: {e}");
                return None;
            }
        }
    }
    None
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, shared: Arc<Shared>) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;

    {
        let mut s = shared.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let result = serve_connection(ws_stream, addr, &shared).await;

    shared.stats.write().await.active_connections -= 1;
    result
}

async fn serve_connection(ws_stream: WsStream, addr: SocketAddr, shared: &Shared) -> Result<(), BoxError> {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let heartbeat = shared.config.heartbeat_interval();

    // The first protocol message must be a join.
    let join = match timeout(heartbeat, next_sync_message(&mut ws_receiver, addr)).await {
        Ok(Some(msg)) if msg.msg_type == MessageType::Join => msg,
        Ok(Some(msg)) => {
            send(&mut ws_sender, &SyncMessage::rejected(&msg.room, "expected join")).await?;
            return Ok(());
        }
        Ok(None) => return Ok(()),
        Err(_) => {
            log::debug!("No join from {addr} within {heartbeat:?}");
            return Ok(());
        }
    };

    let resume = match join.resume_id() {
        Ok(resume) => resume,
        Err(e) => {
            send(&mut ws_sender, &SyncMessage::rejected(&join.room, "malformed join")).await?;
            return Err(e.into());
        }
    };

    let client_id = shared.ids.lock().await.allocate(resume);
    let room_key = join.room.clone();

    let joined = match shared.rooms.join(&room_key, client_id).await {
        Ok(joined) => joined,
        Err(refusal) => {
            shared.ids.lock().await.release(client_id);
            shared.stats.write().await.rejected_joins += 1;
            log::info!("Rejected {addr} from {room_key}: {refusal}");
            send(&mut ws_sender, &SyncMessage::rejected(&room_key, &refusal.to_string())).await?;
            return Ok(());
        }
    };
    log::info!("Client {client_id} ({addr}) joined {room_key}");

    let outcome = pump(&mut ws_sender, &mut ws_receiver, joined, client_id, addr, shared).await;

    shared.rooms.leave(&room_key, client_id).await;
    shared.ids.lock().await.release(client_id);
    log::info!("Client {client_id} left {room_key}");
    outcome
}

/// Move frames between one joined connection and its room until either side closes.
async fn pump(
    ws_sender: &mut WsSink,
    ws_receiver: &mut SplitStream<WsStream>,
    joined: Joined,
    client_id: ClientId,
    addr: SocketAddr,
    shared: &Shared,
) -> Result<(), BoxError> {
    let Joined {
        channel,
        mut receiver,
        greeting,
    } = joined;

    for msg in &greeting {
        send(ws_sender, msg).await?;
    }

    let heartbeat = shared.config.heartbeat_interval();
    let mut ticker = interval(heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            frame = ws_receiver.next() => {
                match frame {
                    Some(Ok(Message::Binary(data))) => {
                        last_seen = Instant::now();
                        {
                            let mut s = shared.stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += data.len() as u64;
                        }
                        match SyncMessage::decode(&data) {
                            Ok(msg) => {
                                for reply in channel.dispatch(client_id, &msg).await {
                                    send(ws_sender, &reply).await?;
                                }
                            }
                            Err(e) => log::warn!("Failed to decode message from {addr}: {e}"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_seen = Instant::now();
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::debug!("Connection closed from {addr}");
                        return Ok(());
                    }
                    Some(Ok(_)) => {
                        last_seen = Instant::now();
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        return Ok(());
                    }
                }
            }

            frame = receiver.recv() => {
                match frame {
                    Ok(frame) => {
                        // Don't echo back to the origin.
                        if frame.origin == client_id {
                            continue;
                        }
                        ws_sender.send(Message::Binary(frame.bytes.clone().into())).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // The skipped frames are gone. Closing makes the client
                        // rejoin and redo the state-vector handshake.
                        log::warn!("Client {client_id} lagged by {n} messages, closing");
                        channel.group().record_lag(n);
                        shared.stats.write().await.lagged_disconnects += 1;
                        let _ = ws_sender.send(Message::Close(None)).await;
                        return Ok(());
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }

            _ = ticker.tick() => {
                if last_seen.elapsed() > heartbeat * 3 {
                    log::info!("Client {client_id} ({addr}) timed out");
                    return Ok(());
                }
                send(ws_sender, &SyncMessage::ping(RELAY_ID)).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:1234");
        assert_eq!(config.max_peers_per_room, 16);
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.heartbeat_interval_secs, 30);
    }

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.allocate(None), 1);
        assert_eq!(ids.allocate(None), 2);
        assert_eq!(ids.allocate(None), 3);
    }

    #[test]
    fn test_resume_free_issued_id() {
        let mut ids = IdAllocator::new();
        let first = ids.allocate(None);
        ids.allocate(None);
        ids.release(first);

        assert_eq!(ids.allocate(Some(first)), first);
    }

    #[test]
    fn test_resume_refused_when_active_or_unissued() {
        let mut ids = IdAllocator::new();
        let first = ids.allocate(None);

        // Still connected.
        assert_eq!(ids.allocate(Some(first)), 2);
        // Never issued.
        assert_eq!(ids.allocate(Some(50)), 3);
        // Reserved for the relay.
        assert_eq!(ids.allocate(Some(RELAY_ID)), 4);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.active_rooms, 0);
        assert_eq!(server.bind_addr(), "127.0.0.1:1234");
    }
}
