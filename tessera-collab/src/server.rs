//! WebSocket relay with per-project rooms.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (project) ── Yrs Doc ── BroadcastGroup
//! Client B ──┘          │
//!                       ├── awareness cache (latest record per client)
//!                       └── CanvasStore (RocksDB, `documents` CF)
//! ```
//!
//! Each room keeps the authoritative CRDT state so late joiners can sync
//! without any other client online. When the last peer leaves, the state
//! is written to the store and the room is dropped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{ReadTxn, StateVector, Transact, Update};

use crate::auth::{AllowAll, Authenticator};
use crate::broadcast::{BroadcastGroup, RelayPeer};
use crate::presence::AwarenessMessage;
use crate::protocol::{MessageType, SyncMessage};
use crate::storage::CanvasStore;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Interval between relay pings
    pub heartbeat_interval: Duration,
    /// Connections silent for this many intervals are dropped
    pub heartbeat_misses: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_misses: 3,
        }
    }
}

impl ServerConfig {
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            max_peers_per_room: 16,
            broadcast_capacity: 64,
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_misses: 3,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_joins: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub persisted_documents: u64,
}

/// Project room: authoritative doc, fan-out and presence cache.
struct RelayRoom {
    doc: yrs::Doc,
    broadcast: Arc<BroadcastGroup>,
    /// Latest encoded awareness message per client, replayed to newcomers.
    awareness: HashMap<Uuid, Arc<Vec<u8>>>,
}

impl RelayRoom {
    fn new(broadcast_capacity: usize) -> Self {
        Self {
            doc: yrs::Doc::new(),
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
            awareness: HashMap::new(),
        }
    }

    fn apply_update(&self, bytes: &[u8]) -> bool {
        let update = match Update::decode_v1(bytes) {
            Ok(update) => update,
            Err(e) => {
                log::warn!("Dropping undecodable update: {e}");
                return false;
            }
        };
        let mut txn = self.doc.transact_mut();
        match txn.apply_update(update) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Failed to apply update: {e}");
                false
            }
        }
    }

    fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    fn diff_since(&self, remote_sv: &[u8]) -> Option<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_sv).ok()?;
        Some(self.doc.transact().encode_diff_v1(&sv))
    }

    fn encode_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }
}

type Rooms = Arc<RwLock<HashMap<String, RelayRoom>>>;

/// Everything a connection task needs; cloned per connection.
#[derive(Clone)]
struct RelayContext {
    config: ServerConfig,
    rooms: Rooms,
    stats: Arc<RwLock<ServerStats>>,
    store: Option<Arc<CanvasStore>>,
    auth: Arc<dyn Authenticator>,
}

/// The relay server.
pub struct SyncServer {
    ctx: RelayContext,
}

impl SyncServer {
    /// In-memory relay that admits everyone.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            ctx: RelayContext {
                config,
                rooms: Arc::new(RwLock::new(HashMap::new())),
                stats: Arc::new(RwLock::new(ServerStats::default())),
                store: None,
                auth: Arc::new(AllowAll),
            },
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Persist room state to `store` when rooms close.
    pub fn with_store(mut self, store: Arc<CanvasStore>) -> Self {
        self.ctx.store = Some(store);
        self
    }

    pub fn with_authenticator(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.ctx.auth = auth;
        self
    }

    /// Load every persisted project into a room so peers find it ready.
    pub async fn recover(&self) -> Result<usize, BoxError> {
        let store = match &self.ctx.store {
            Some(s) => s,
            None => return Ok(0),
        };

        let projects = store.list_documents()?;
        let mut recovered = 0;
        let mut rooms = self.ctx.rooms.write().await;

        for project in &projects {
            if rooms.contains_key(project) {
                continue;
            }
            match store.load_document_state(project) {
                Ok(Some(state)) => {
                    let room = RelayRoom::new(self.ctx.config.broadcast_capacity);
                    if room.apply_update(&state) {
                        rooms.insert(project.clone(), room);
                        recovered += 1;
                        log::info!("Recovered project {project} from storage");
                    }
                }
                Ok(None) => {}
                Err(e) => log::error!("Failed to load project {project}: {e}"),
            }
        }

        let active = rooms.len();
        drop(rooms);
        self.ctx.stats.write().await.active_rooms = active;

        log::info!("Recovery complete: {recovered}/{} projects restored", projects.len());
        Ok(recovered)
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.ctx.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        let recovered = self.recover().await?;
        if recovered > 0 {
            log::info!("Recovered {recovered} projects from persistent storage");
        }
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, ctx).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.ctx.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.ctx.config.bind_addr
    }

    pub fn store(&self) -> Option<&Arc<CanvasStore>> {
        self.ctx.store.as_ref()
    }

    pub async fn room_count(&self) -> usize {
        self.ctx.rooms.read().await.len()
    }

    pub async fn peer_count(&self, project_id: &str) -> usize {
        let broadcast = {
            let rooms = self.ctx.rooms.read().await;
            rooms.get(project_id).map(|r| r.broadcast.clone())
        };
        match broadcast {
            Some(b) => b.peer_count().await,
            None => 0,
        }
    }
}

/// Identity of an admitted connection.
struct Admitted {
    connection_id: Uuid,
    client_id: Uuid,
    project_id: String,
    broadcast: Arc<BroadcastGroup>,
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: RelayContext,
) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("WebSocket connection established from {addr}");

    {
        let mut s = shared.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let mut admitted: Option<Admitted> = None;
    let mut broadcast_rx: Option<broadcast::Receiver<Arc<Vec<u8>>>> = None;
    let mut heartbeat = tokio::time::interval(shared.config.heartbeat_interval);
    heartbeat.tick().await;
    let mut last_seen = Instant::now();
    let silence_limit = shared.config.heartbeat_interval * shared.config.heartbeat_misses;

    let result: Result<(), BoxError> = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            last_seen = Instant::now();
                            let bytes: Vec<u8> = data.into();
                            let sync_msg = match SyncMessage::decode(&bytes) {
                                Ok(m) => m,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };
                            {
                                let mut s = shared.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            if let Some(entry) = &admitted {
                                if let Some(reply) = handle_message(&shared, entry, sync_msg).await? {
                                    ws_sender.send(Message::Binary(reply.into())).await?;
                                }
                                continue;
                            }
                            if sync_msg.msg_type != MessageType::Join {
                                log::debug!("Ignoring {:?} from {addr} before join", sync_msg.msg_type);
                                continue;
                            }
                            match admit(&shared, &sync_msg).await {
                                Ok((entry, rx, replies)) => {
                                    for reply in replies {
                                        ws_sender.send(Message::Binary(reply.to_vec().into())).await?;
                                    }
                                    admitted = Some(entry);
                                    broadcast_rx = Some(rx);
                                }
                                Err(reason) => {
                                    shared.stats.write().await.rejected_joins += 1;
                                    let reject = SyncMessage::auth_rejected(&sync_msg.room, &reason);
                                    ws_sender.send(Message::Binary(reject.encode()?.into())).await?;
                                    let _ = ws_sender.close().await;
                                    return Ok(());
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            return Ok(());
                        }
                        Some(Ok(Message::Ping(data))) => {
                            last_seen = Instant::now();
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            return Ok(());
                        }
                        Some(Ok(_)) => {
                            last_seen = Instant::now();
                        }
                    }
                }

                msg = async {
                    match broadcast_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match msg {
                        Ok(data) => {
                            if let (Ok(sync_msg), Some(entry)) = (SyncMessage::decode(&data), &admitted) {
                                if sync_msg.client_id == entry.client_id {
                                    continue;
                                }
                            }
                            ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            // Skipped updates are recovered by a fresh handshake.
                            log::warn!("Connection {addr} lagged by {n} messages; forcing resync");
                            if let Some(entry) = &admitted {
                                entry.broadcast.record_dropped(n);
                            }
                            return Ok(());
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }

                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > silence_limit {
                        log::info!("Dropping silent connection from {addr}");
                        return Ok(());
                    }
                    let client_id = admitted.as_ref().map(|a| a.client_id).unwrap_or_else(Uuid::nil);
                    ws_sender.send(Message::Binary(SyncMessage::ping(client_id).encode()?.into())).await?;
                }
            }
        }
    }
    .await;

    if let Some(entry) = admitted {
        depart(&shared, entry).await;
    }
    shared.stats.write().await.active_connections -= 1;
    result
}

/// Authenticate a join and wire the connection into its room.
///
/// Returns the frames to send back: the relay's state vector followed by
/// the cached presence of everyone already in the room.
async fn admit(
    shared: &RelayContext,
    msg: &SyncMessage,
) -> Result<(Admitted, broadcast::Receiver<Arc<Vec<u8>>>, Vec<Arc<Vec<u8>>>), String> {
    let request = msg.join_request().map_err(|e| e.to_string())?;
    if msg.room.is_empty() {
        return Err("missing project id".into());
    }
    shared
        .auth
        .authenticate(&request.identity, &request.token, &msg.room)
        .map_err(|e| {
            log::warn!("Rejected {} for {}: {e}", request.identity.id, msg.room);
            e.to_string()
        })?;

    let mut rooms = shared.rooms.write().await;
    if !rooms.contains_key(&msg.room) {
        let room = RelayRoom::new(shared.config.broadcast_capacity);
        if let Some(store) = &shared.store {
            match store.load_document_state(&msg.room) {
                Ok(Some(state)) => {
                    room.apply_update(&state);
                    log::info!("Loaded persisted state for project {}", msg.room);
                }
                Ok(None) => {}
                Err(e) => log::error!("Failed to load project {}: {e}", msg.room),
            }
        }
        rooms.insert(msg.room.clone(), room);
    }
    let room_count = rooms.len();
    let Some(room) = rooms.get(&msg.room) else {
        return Err("room unavailable".into());
    };

    if room.broadcast.peer_count().await >= shared.config.max_peers_per_room {
        return Err(format!("project {} is full", msg.room));
    }

    let peer = RelayPeer::new(msg.client_id, request.identity.clone());
    let connection_id = peer.connection_id;
    let rx = room.broadcast.add_peer(peer).await;

    let mut replies = Vec::with_capacity(1 + room.awareness.len());
    let step1 = SyncMessage::sync_step1(Uuid::nil(), &msg.room, room.state_vector())
        .encode()
        .map_err(|e| e.to_string())?;
    replies.push(Arc::new(step1));
    replies.extend(
        room.awareness
            .iter()
            .filter(|(id, _)| **id != msg.client_id)
            .map(|(_, bytes)| bytes.clone()),
    );

    let entry = Admitted {
        connection_id,
        client_id: msg.client_id,
        project_id: msg.room.clone(),
        broadcast: room.broadcast.clone(),
    };
    drop(rooms);

    shared.stats.write().await.active_rooms = room_count;
    log::info!(
        "{} ({}) joined project {}",
        request.identity.display_name,
        msg.client_id,
        msg.room
    );
    Ok((entry, rx, replies))
}

/// Handle one message from an admitted connection. Returns a direct reply.
async fn handle_message(
    shared: &RelayContext,
    entry: &Admitted,
    msg: SyncMessage,
) -> Result<Option<Vec<u8>>, BoxError> {
    match msg.msg_type {
        MessageType::SyncStep1 => {
            let diff = {
                let rooms = shared.rooms.read().await;
                rooms.get(&entry.project_id).and_then(|r| r.diff_since(&msg.payload))
            };
            match diff {
                Some(diff) => Ok(Some(
                    SyncMessage::sync_step2(Uuid::nil(), &entry.project_id, diff).encode()?,
                )),
                None => {
                    log::warn!("Bad state vector from {}", entry.client_id);
                    Ok(None)
                }
            }
        }

        MessageType::SyncStep2 | MessageType::Update => {
            let applied = {
                let rooms = shared.rooms.read().await;
                rooms
                    .get(&entry.project_id)
                    .map(|r| r.apply_update(&msg.payload))
                    .unwrap_or(false)
            };
            if applied {
                // Peers only ever see incremental updates.
                let forward = SyncMessage::update(msg.client_id, &entry.project_id, msg.clock, msg.payload);
                entry.broadcast.broadcast(&forward)?;
            }
            Ok(None)
        }

        MessageType::Awareness => {
            match msg.awareness_message() {
                Ok(AwarenessMessage::Update(state)) if state.client_id == entry.client_id => {
                    log::trace!("Presence update from {} in {}", state.user_name, entry.project_id);
                    let encoded = Arc::new(msg.encode()?);
                    {
                        let mut rooms = shared.rooms.write().await;
                        if let Some(room) = rooms.get_mut(&entry.project_id) {
                            room.awareness.insert(entry.client_id, encoded.clone());
                        }
                    }
                    entry.broadcast.broadcast_raw(encoded);
                }
                Ok(AwarenessMessage::Remove { client_id }) if client_id == entry.client_id => {
                    {
                        let mut rooms = shared.rooms.write().await;
                        if let Some(room) = rooms.get_mut(&entry.project_id) {
                            room.awareness.remove(&client_id);
                        }
                    }
                    entry.broadcast.broadcast(&msg)?;
                }
                Ok(_) => log::warn!("Ignoring presence for another client from {}", entry.client_id),
                Err(e) => log::warn!("Bad awareness payload from {}: {e}", entry.client_id),
            }
            Ok(None)
        }

        MessageType::Ping => Ok(Some(SyncMessage::pong(Uuid::nil()).encode()?)),
        MessageType::Pong => Ok(None),

        MessageType::Join | MessageType::AuthRejected => {
            log::debug!("Unexpected {:?} from {}", msg.msg_type, entry.client_id);
            Ok(None)
        }
    }
}

/// Remove a connection from its room; persist and close the room if empty.
async fn depart(shared: &RelayContext, entry: Admitted) {
    entry.broadcast.remove_peer(&entry.connection_id).await;

    let mut rooms = shared.rooms.write().await;
    let Some(room) = rooms.get_mut(&entry.project_id) else {
        return;
    };

    // A newer connection of the same client keeps its presence.
    if !entry.broadcast.has_peer(&entry.client_id).await {
        room.awareness.remove(&entry.client_id);
        let leave = AwarenessMessage::Remove {
            client_id: entry.client_id,
        };
        match SyncMessage::awareness(entry.client_id, &entry.project_id, 0, &leave) {
            Ok(msg) => {
                let _ = entry.broadcast.broadcast(&msg);
            }
            Err(e) => log::error!("Failed to encode leave for {}: {e}", entry.client_id),
        }
    }

    if entry.broadcast.peer_count().await > 0 {
        return;
    }

    let mut persisted = false;
    if let Some(store) = &shared.store {
        match store.save_document_state(&entry.project_id, &room.encode_state()) {
            Ok(_) => {
                persisted = true;
                log::info!("Persisted project {} (room closing)", entry.project_id);
            }
            Err(e) => log::error!("Failed to persist project {}: {e}", entry.project_id),
        }
    }
    rooms.remove(&entry.project_id);
    let active = rooms.len();
    drop(rooms);
    log::info!("Room {} removed (empty)", entry.project_id);

    let mut s = shared.stats.write().await;
    s.active_rooms = active;
    if persisted {
        s.persisted_documents += 1;
    }
}
