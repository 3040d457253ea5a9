//! One client's live session on one project.
//!
//! A `CollabSession` owns the replicated document, the presence channel,
//! the transport task handle and the snapshot subscription. Everything that
//! touches the document runs on the caller's task: transport events and
//! snapshot notifications are pulled one at a time through
//! [`CollabSession::next`], so no two merges for one document overlap.
//!
//! ```text
//!   TransportHandle ──events──┐
//!                             ├──► next() ──► CanvasDocument / AwarenessChannel
//!   SnapshotStore ──changes───┘                 │
//!                                               └──► Reconciler ──► SessionEvent
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tessera_core::collab::{CanvasDocument, DocumentChange, ObserverId, SeedOutcome};
use tessera_core::{CanvasGraph, Edge, Node};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::client::{ConnectionState, TransportConfig, TransportEvent, TransportHandle};
use crate::error::SyncError;
use crate::presence::{
    color_for_user, AwarenessChannel, AwarenessMessage, Collaborator, ListenerId, PresenceState, Vec2,
    DEFAULT_IDLE_TIMEOUT, DEFAULT_STALE_AFTER,
};
use crate::protocol::{JoinRequest, MessageType, SyncMessage, UserIdentity};
use crate::reconcile::{Decision, ReconcileState, Reconciler, Signature, SnapshotWriter, DEFAULT_SUPPRESSION_WINDOW};
use crate::storage::{CanvasSnapshot, SnapshotChange, SnapshotStore, StoreError};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub transport: TransportConfig,
    /// How long a just-saved signature counts as our own echo (default: 1s)
    pub suppression_window: Duration,
    /// Cursors older than this are hidden (default: 5s)
    pub stale_after: Duration,
    /// Peers silent for this long are dropped (default: 30s)
    pub idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            suppression_window: DEFAULT_SUPPRESSION_WINDOW,
            stale_after: DEFAULT_STALE_AFTER,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl SessionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            transport: TransportConfig::new(url),
            ..Self::default()
        }
    }

    pub fn for_testing(url: impl Into<String>) -> Self {
        Self {
            transport: TransportConfig::for_testing(url),
            ..Self::default()
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────────

/// Tracks which project each client currently has open.
///
/// A client holds at most one session; registering again fails until the
/// previous session is torn down and its [`RegistryLease`] dropped.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    active: Arc<Mutex<HashMap<Uuid, String>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, client_id: Uuid, project_id: &str) -> Result<RegistryLease, SyncError> {
        let mut active = lock(&self.active);
        if let Some(existing) = active.get(&client_id) {
            return Err(SyncError::SessionActive {
                client_id,
                project_id: existing.clone(),
            });
        }
        active.insert(client_id, project_id.to_string());
        log::debug!("Registered session {client_id} on {project_id}");
        Ok(RegistryLease {
            active: self.active.clone(),
            client_id,
            project_id: project_id.to_string(),
        })
    }

    pub fn project_of(&self, client_id: &Uuid) -> Option<String> {
        lock(&self.active).get(client_id).cloned()
    }

    pub fn is_active(&self, client_id: &Uuid) -> bool {
        lock(&self.active).contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.active).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.active).is_empty()
    }
}

/// Registry entry held by a live session; released on drop.
#[derive(Debug)]
pub struct RegistryLease {
    active: Arc<Mutex<HashMap<Uuid, String>>>,
    client_id: Uuid,
    project_id: String,
}

impl RegistryLease {
    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }
}

impl Drop for RegistryLease {
    fn drop(&mut self) {
        let mut active = lock(&self.active);
        if active.get(&self.client_id) == Some(&self.project_id) {
            active.remove(&self.client_id);
            log::debug!("Released session {} on {}", self.client_id, self.project_id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ───────────────────────────────────────────────────────────────────
// Session
// ───────────────────────────────────────────────────────────────────

/// What a session reports to the canvas layer.
#[derive(Debug)]
pub enum SessionEvent {
    StatusChanged(ConnectionState),
    /// A peer's edit was merged.
    DocumentChanged(DocumentChange),
    PresenceChanged(Vec<Collaborator>),
    /// The relay refused the credential. Call `reauthenticate` to retry.
    AuthenticationFailed(SyncError),
    /// A remote save arrived over unsaved local edits.
    RemoteChangesAvailable,
    /// A remote snapshot replaced the local graph.
    RemoteApplied(CanvasSnapshot),
}

/// Everything needed to open a session.
pub struct SessionOptions {
    pub project_id: String,
    pub client_id: Uuid,
    pub identity: UserIdentity,
    pub token: String,
    /// Graph loaded from the durable snapshot, used to seed an empty document.
    pub initial: CanvasGraph,
    pub store: Arc<dyn SnapshotStore>,
    pub config: SessionConfig,
}

impl SessionOptions {
    pub fn new(
        project_id: impl Into<String>,
        identity: UserIdentity,
        token: impl Into<String>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            client_id: Uuid::new_v4(),
            identity,
            token: token.into(),
            initial: CanvasGraph::default(),
            store,
            config: SessionConfig::default(),
        }
    }

    pub fn with_client_id(mut self, client_id: Uuid) -> Self {
        self.client_id = client_id;
        self
    }

    pub fn with_initial(mut self, initial: CanvasGraph) -> Self {
        self.initial = initial;
        self
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }
}

/// Read the durable snapshot for `project_id`.
pub async fn load_snapshot(store: &dyn SnapshotStore, project_id: &str) -> Result<Option<CanvasSnapshot>, SyncError> {
    store.read(project_id).await.map_err(SyncError::SnapshotRead)
}

enum Inbound {
    Transport(Option<TransportEvent>),
    Snapshot(Result<SnapshotChange, broadcast::error::RecvError>),
    PresenceTick,
}

pub struct CollabSession {
    project_id: String,
    client_id: Uuid,
    identity: UserIdentity,
    config: SessionConfig,

    document: CanvasDocument,
    awareness: AwarenessChannel,
    transport: Option<TransportHandle>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,

    store: Arc<dyn SnapshotStore>,
    notifications: Option<broadcast::Receiver<SnapshotChange>>,
    writer: SnapshotWriter,
    reconciler: Reconciler,

    /// Seed for the first sync; taken once.
    initial: Option<CanvasGraph>,
    dirty: bool,
    status: ConnectionState,
    clock: u64,
    presence_tick: tokio::time::Interval,
    queued: VecDeque<SessionEvent>,
    lease: Option<RegistryLease>,
    closed: bool,
}

impl std::fmt::Debug for CollabSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollabSession")
            .field("project_id", &self.project_id)
            .field("client_id", &self.client_id)
            .field("status", &self.status)
            .field("dirty", &self.dirty)
            .field("closed", &self.closed)
            .finish()
    }
}

impl CollabSession {
    /// Register the session and start connecting. Must run inside a tokio runtime.
    pub fn open(registry: &SessionRegistry, options: SessionOptions) -> Result<Self, SyncError> {
        let SessionOptions {
            project_id,
            client_id,
            identity,
            token,
            initial,
            store,
            config,
        } = options;

        let lease = registry.register(client_id, &project_id)?;

        let join = JoinRequest {
            identity: identity.clone(),
            token,
        };
        let (transport, events) =
            TransportHandle::spawn(config.transport.clone(), client_id, project_id.clone(), join);
        let notifications = store.subscribe(&project_id);

        let writer = SnapshotWriter::new(store.clone(), project_id.clone(), identity.id.clone());
        let mut reconciler = Reconciler::new(identity.id.clone(), config.suppression_window);
        if !initial.is_empty() {
            match Signature::of_graph(&initial) {
                Ok(signature) => reconciler.observe_signature(signature),
                Err(e) => log::warn!("Cannot sign initial graph for {project_id}: {e}"),
            }
        }

        let period = (config.idle_timeout / 2).max(Duration::from_millis(10));
        let mut presence_tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        presence_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        log::info!("Opening session {client_id} on project {project_id} as {}", identity.id);

        Ok(Self {
            project_id,
            client_id,
            identity,
            config,
            document: CanvasDocument::new(),
            awareness: AwarenessChannel::new(client_id),
            transport: Some(transport),
            events: Some(events),
            store,
            notifications: Some(notifications),
            writer,
            reconciler,
            initial: Some(initial),
            dirty: false,
            status: ConnectionState::Disconnected,
            clock: 0,
            presence_tick,
            queued: VecDeque::new(),
            lease: Some(lease),
            closed: false,
        })
    }

    /// Like [`open`](Self::open), seeding from the durable snapshot when no
    /// initial graph was supplied.
    pub async fn load(registry: &SessionRegistry, mut options: SessionOptions) -> Result<Self, SyncError> {
        if options.initial.is_empty() {
            if let Some(snapshot) = load_snapshot(options.store.as_ref(), &options.project_id).await? {
                options.initial = snapshot.graph();
            }
        }
        Self::open(registry, options)
    }

    // ─── Event loop ───────────────────────────────────────────────────

    /// Wait for and process the next transport event or snapshot change.
    ///
    /// Returns `None` once the session is torn down.
    pub async fn next(&mut self) -> Option<SessionEvent> {
        loop {
            if let Some(event) = self.queued.pop_front() {
                return Some(event);
            }
            if self.closed {
                return None;
            }

            let inbound = tokio::select! {
                event = recv_transport(&mut self.events) => Inbound::Transport(event),
                change = recv_change(&mut self.notifications) => Inbound::Snapshot(change),
                _ = self.presence_tick.tick() => Inbound::PresenceTick,
            };

            match inbound {
                Inbound::Transport(Some(event)) => self.handle_transport(event),
                Inbound::Transport(None) => {
                    log::debug!("Transport for {} ended", self.client_id);
                    self.events = None;
                    self.teardown();
                }
                Inbound::Snapshot(Ok(change)) => self.handle_change(change),
                Inbound::Snapshot(Err(broadcast::error::RecvError::Lagged(n))) => {
                    log::warn!("Missed {n} snapshot notifications for {}; resubscribing", self.project_id);
                    self.resubscribe();
                }
                Inbound::Snapshot(Err(broadcast::error::RecvError::Closed)) => {
                    log::warn!("Snapshot notifications for {} closed; resubscribing", self.project_id);
                    self.resubscribe();
                }
                Inbound::PresenceTick => self.refresh_presence(),
            }
        }
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::StateChanged(state) => {
                self.status = state;
                self.queued.push_back(SessionEvent::StatusChanged(state));
                match state {
                    ConnectionState::Connected => self.start_handshake(),
                    ConnectionState::Synced => self.on_synced(),
                    ConnectionState::Disconnected | ConnectionState::AuthFailed => {
                        if self.awareness.clear_remote() {
                            self.queued.push_back(SessionEvent::PresenceChanged(self.collaborators()));
                        }
                    }
                    ConnectionState::Connecting => {}
                }
            }
            TransportEvent::AuthRejected(reason) => {
                log::warn!("Session {} rejected by relay: {reason}", self.client_id);
                self.queued
                    .push_back(SessionEvent::AuthenticationFailed(SyncError::Authentication(reason)));
            }
            TransportEvent::Message(msg) => self.handle_message(msg),
        }
    }

    fn start_handshake(&mut self) {
        let step1 = SyncMessage::sync_step1(self.client_id, &self.project_id, self.document.state_vector());
        self.send(&step1);
        if let Some(local) = self.awareness.local_message() {
            self.send_awareness(&local);
        }
    }

    fn on_synced(&mut self) {
        if let Some(initial) = self.initial.take() {
            match self.document.seed_if_empty(&initial) {
                Ok(SeedOutcome::Seeded(update)) => {
                    log::info!("Seeded project {} from its snapshot", self.project_id);
                    self.broadcast_update(update);
                }
                Ok(SeedOutcome::AlreadyPopulated) => {
                    log::debug!("Project {} already populated; not seeding", self.project_id);
                }
                Ok(SeedOutcome::NothingToSeed) => {}
                Err(e) => log::error!("Seeding project {} failed: {e}", self.project_id),
            }
        }
        self.document.publish();
        self.queued.push_back(SessionEvent::DocumentChanged(DocumentChange {
            nodes_changed: true,
            edges_changed: true,
        }));
    }

    fn handle_message(&mut self, msg: SyncMessage) {
        match msg.msg_type {
            MessageType::SyncStep1 => match self.document.diff_since(&msg.payload) {
                Ok(diff) => {
                    let step2 = SyncMessage::sync_step2(self.client_id, &self.project_id, diff);
                    self.send(&step2);
                }
                Err(e) => log::warn!("Bad state vector from relay: {e}"),
            },
            MessageType::SyncStep2 | MessageType::Update => match self.document.apply_remote_update(&msg.payload) {
                Ok(change) if change.any() => self.queued.push_back(SessionEvent::DocumentChanged(change)),
                Ok(_) => {}
                Err(e) => log::warn!("Dropping update from {}: {e}", msg.client_id),
            },
            MessageType::Awareness => match msg.awareness_message() {
                Ok(awareness) => {
                    if self.awareness.handle_message(&awareness) {
                        self.queued.push_back(SessionEvent::PresenceChanged(self.collaborators()));
                    }
                }
                Err(e) => log::warn!("Bad awareness payload from {}: {e}", msg.client_id),
            },
            other => log::trace!("Ignoring {other:?} on session {}", self.client_id),
        }
    }

    fn handle_change(&mut self, change: SnapshotChange) {
        match self.reconciler.on_notification(&change, self.dirty, Instant::now()) {
            Decision::AutoApply(snapshot) => self.settle(snapshot),
            Decision::PendingUserDecision => self.queued.push_back(SessionEvent::RemoteChangesAvailable),
            Decision::IgnoredOwnEcho | Decision::IgnoredDuplicate | Decision::Unreadable | Decision::Deferred => {}
        }
    }

    /// Install `snapshot`, then any change that arrived while it was applying.
    fn settle(&mut self, snapshot: CanvasSnapshot) {
        let mut next = Some(snapshot);
        while let Some(snapshot) = next.take() {
            let installed = self.install(&snapshot);
            let deferred = self.reconciler.finish_apply();
            match installed {
                Ok(()) => self.queued.push_back(SessionEvent::RemoteApplied(snapshot)),
                Err(e) => log::error!("Failed to apply remote snapshot for {}: {e}", self.project_id),
            }
            if let Some(change) = deferred {
                match self.reconciler.on_notification(&change, self.dirty, Instant::now()) {
                    Decision::AutoApply(snapshot) => next = Some(snapshot),
                    Decision::PendingUserDecision => self.queued.push_back(SessionEvent::RemoteChangesAvailable),
                    _ => {}
                }
            }
        }
    }

    fn install(&mut self, snapshot: &CanvasSnapshot) -> Result<(), SyncError> {
        if let Some(update) = self.document.replace_graph(&snapshot.graph())? {
            self.broadcast_update(update);
        }
        self.dirty = false;
        log::info!(
            "Applied snapshot from {} to project {}",
            snapshot.last_modified_by,
            self.project_id
        );
        Ok(())
    }

    fn resubscribe(&mut self) {
        self.notifications = Some(self.store.subscribe(&self.project_id));
        if let Some(transport) = &self.transport {
            if let Err(e) = transport.reconnect() {
                log::debug!("Reconnect after subscription loss failed: {e}");
            }
        }
    }

    /// Re-announce presence so peers don't prune us, and prune silent peers.
    fn refresh_presence(&mut self) {
        if let Some(local) = self.awareness.local_state().cloned() {
            if self.status.is_connected() {
                match self.awareness.set_local_state(
                    &local.user_id,
                    &local.user_name,
                    &local.color,
                    local.cursor,
                    Some(local.selection),
                ) {
                    Ok(msg) => self.send_awareness(&msg),
                    Err(e) => log::warn!("Failed to renew presence: {e}"),
                }
            }
        }

        let pruned = self.awareness.prune_idle(Instant::now(), self.config.idle_timeout);
        if !pruned.is_empty() {
            log::debug!("Pruned {} idle collaborators", pruned.len());
            self.queued.push_back(SessionEvent::PresenceChanged(self.collaborators()));
        }
    }

    // ─── Outbound ─────────────────────────────────────────────────────

    fn send(&self, msg: &SyncMessage) {
        if let Some(transport) = &self.transport {
            if let Err(e) = transport.send(msg) {
                log::debug!("Dropping {:?} for {}: {e}", msg.msg_type, self.project_id);
            }
        }
    }

    fn broadcast_update(&mut self, update: Vec<u8>) {
        self.clock += 1;
        let msg = SyncMessage::update(self.client_id, &self.project_id, self.clock, update);
        self.send(&msg);
    }

    fn send_awareness(&self, awareness: &AwarenessMessage) {
        match SyncMessage::awareness(self.client_id, &self.project_id, self.clock, awareness) {
            Ok(msg) => self.send(&msg),
            Err(e) => log::warn!("Failed to encode presence: {e}"),
        }
    }

    fn ensure_open(&self) -> Result<(), SyncError> {
        if self.closed {
            Err(SyncError::SessionClosed)
        } else {
            Ok(())
        }
    }

    // ─── Document ─────────────────────────────────────────────────────

    pub fn replace_nodes(&mut self, nodes: &[Node]) -> Result<(), SyncError> {
        self.ensure_open()?;
        if let Some(update) = self.document.replace_nodes(nodes)? {
            self.dirty = true;
            self.broadcast_update(update);
        }
        Ok(())
    }

    pub fn replace_edges(&mut self, edges: &[Edge]) -> Result<(), SyncError> {
        self.ensure_open()?;
        if let Some(update) = self.document.replace_edges(edges)? {
            self.dirty = true;
            self.broadcast_update(update);
        }
        Ok(())
    }

    pub fn replace_graph(&mut self, graph: &CanvasGraph) -> Result<(), SyncError> {
        self.ensure_open()?;
        if let Some(update) = self.document.replace_graph(graph)? {
            self.dirty = true;
            self.broadcast_update(update);
        }
        Ok(())
    }

    pub fn nodes(&self) -> &[Node] {
        self.document.nodes()
    }

    pub fn edges(&self) -> &[Edge] {
        self.document.edges()
    }

    pub fn graph(&self) -> CanvasGraph {
        self.document.graph()
    }

    pub fn observe_nodes<F>(&mut self, callback: F) -> ObserverId
    where
        F: Fn(&[Node]) + Send + Sync + 'static,
    {
        self.document.observe_nodes(callback)
    }

    pub fn observe_edges<F>(&mut self, callback: F) -> ObserverId
    where
        F: Fn(&[Edge]) + Send + Sync + 'static,
    {
        self.document.observe_edges(callback)
    }

    pub fn unobserve(&mut self, id: ObserverId) -> bool {
        self.document.unobserve(id)
    }

    pub fn observer_count(&self) -> usize {
        self.document.observer_count()
    }

    // ─── Persistence ──────────────────────────────────────────────────

    /// Write the current graph as the project's snapshot.
    ///
    /// A failed write leaves the document and the dirty flag untouched.
    pub async fn save(&mut self) -> Result<CanvasSnapshot, SyncError> {
        self.ensure_open()?;
        let graph = self.document.graph();
        let signature = Signature::of_graph(&graph)
            .map_err(|e| SyncError::SnapshotWrite(StoreError::SerializationError(e.to_string())))?;
        let snapshot = self.writer.write(&graph).await.map_err(SyncError::SnapshotWrite)?;
        self.reconciler.record_save(signature, Instant::now());
        self.dirty = false;
        Ok(snapshot)
    }

    /// Discard local edits and adopt the pending remote snapshot.
    ///
    /// Returns `None` when nothing is pending.
    pub fn apply_remote(&mut self) -> Result<Option<CanvasSnapshot>, SyncError> {
        self.ensure_open()?;
        let Some(snapshot) = self.reconciler.apply() else {
            return Ok(None);
        };
        let installed = self.install(&snapshot);
        let deferred = self.reconciler.finish_apply();
        installed?;
        if let Some(change) = deferred {
            self.handle_change(change);
        }
        Ok(Some(snapshot))
    }

    /// Keep local edits; the remote snapshot stays available to `apply_remote`.
    pub fn dismiss_remote(&mut self) {
        self.reconciler.dismiss();
    }

    pub fn has_remote_changes(&self) -> bool {
        self.reconciler.has_remote_changes()
    }

    pub fn pending_remote(&self) -> Option<&CanvasSnapshot> {
        self.reconciler.pending_snapshot()
    }

    pub fn reconcile_state(&self) -> ReconcileState {
        self.reconciler.state()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Override the unsaved-edits flag, e.g. after the canvas layer saved by other means.
    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    // ─── Presence ─────────────────────────────────────────────────────

    /// Replace this client's presence record and broadcast it.
    pub fn set_presence(&mut self, cursor: Option<Vec2>, selection: Option<Vec<String>>) -> Result<(), SyncError> {
        self.ensure_open()?;
        let color = color_for_user(&self.identity.id);
        let msg = self.awareness.set_local_state(
            &self.identity.id,
            &self.identity.display_name,
            color,
            cursor,
            selection,
        )?;
        self.send_awareness(&msg);
        Ok(())
    }

    pub fn local_presence(&self) -> Option<&PresenceState> {
        self.awareness.local_state()
    }

    /// Other clients in the project, stale cursors hidden.
    pub fn collaborators(&self) -> Vec<Collaborator> {
        self.awareness.collaborators(Instant::now(), self.config.stale_after)
    }

    pub fn on_presence_change<F>(&mut self, callback: F) -> ListenerId
    where
        F: Fn(&HashMap<Uuid, PresenceState>) + Send + Sync + 'static,
    {
        self.awareness.on_change(callback)
    }

    pub fn off_presence_change(&mut self, id: ListenerId) -> bool {
        self.awareness.off_change(id)
    }

    // ─── Connection ───────────────────────────────────────────────────

    pub fn status(&self) -> ConnectionState {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    pub fn is_synced(&self) -> bool {
        self.status.is_synced()
    }

    /// Retry with a fresh credential after an authentication failure.
    pub fn reauthenticate(&mut self, token: impl Into<String>) -> Result<(), SyncError> {
        self.ensure_open()?;
        match &self.transport {
            Some(transport) => Ok(transport.reauthenticate(token)?),
            None => Err(SyncError::SessionClosed),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Leave the project. Safe to call more than once.
    ///
    /// Unregisters every observer and listener, says goodbye to peers, stops
    /// the transport, drops the snapshot subscription and frees the registry
    /// entry. Nothing fires after this returns.
    pub fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.document.clear_observers();
        self.awareness.clear_listeners();

        if let Some(transport) = self.transport.take() {
            let leave = self.awareness.leave_message();
            self.send_with(&transport, &leave);
            transport.shutdown();
        }
        self.events = None;
        self.notifications = None;
        self.queued.clear();
        self.document = CanvasDocument::new();
        self.status = ConnectionState::Disconnected;
        self.lease = None;

        log::info!("Session {} left project {}", self.client_id, self.project_id);
    }

    fn send_with(&self, transport: &TransportHandle, awareness: &AwarenessMessage) {
        match SyncMessage::awareness(self.client_id, &self.project_id, self.clock, awareness)
            .and_then(|msg| transport.send(&msg))
        {
            Ok(()) => {}
            Err(e) => log::debug!("Leave message for {} not sent: {e}", self.project_id),
        }
    }
}

impl Drop for CollabSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn recv_transport(rx: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>) -> Option<TransportEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_change(
    rx: &mut Option<broadcast::Receiver<SnapshotChange>>,
) -> Result<SnapshotChange, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemorySnapshotStore;

    // Nothing listens here; the transport keeps retrying in the background.
    const DEAD_RELAY: &str = "ws://127.0.0.1:9";

    fn ada() -> UserIdentity {
        UserIdentity::new("ada", "Ada", "ada@example.com")
    }

    fn grace() -> UserIdentity {
        UserIdentity::new("grace", "Grace", "grace@example.com")
    }

    fn graph(ids: &[&str]) -> CanvasGraph {
        CanvasGraph::new(
            ids.iter().map(|id| Node::new(*id, "text", 0.0, 0.0)).collect(),
            Vec::new(),
        )
    }

    fn options(store: Arc<MemorySnapshotStore>, identity: UserIdentity) -> SessionOptions {
        SessionOptions::new("p1", identity, "token", store).with_config(SessionConfig::for_testing(DEAD_RELAY))
    }

    async fn drain_until<F>(session: &mut CollabSession, mut pred: F) -> bool
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            match tokio::time::timeout_at(deadline, session.next()).await {
                Ok(Some(event)) if pred(&event) => return true,
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => return false,
            }
        }
    }

    #[test]
    fn test_registry_rejects_second_session() {
        let registry = SessionRegistry::new();
        let client = Uuid::new_v4();

        let lease = registry.register(client, "p1").unwrap();
        assert!(registry.is_active(&client));
        assert_eq!(registry.project_of(&client).as_deref(), Some("p1"));

        let err = registry.register(client, "p2").unwrap_err();
        assert!(matches!(err, SyncError::SessionActive { ref project_id, .. } if project_id == "p1"));

        drop(lease);
        assert!(registry.is_empty());
        assert!(registry.register(client, "p2").is_ok());
    }

    #[tokio::test]
    async fn test_local_edits_mark_dirty_and_notify_observers() {
        let store = Arc::new(MemorySnapshotStore::new());
        let registry = SessionRegistry::new();
        let mut session = CollabSession::open(&registry, options(store, ada())).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        session.observe_nodes(move |nodes| {
            sink.lock().unwrap().push(nodes.len());
        });

        session.replace_nodes(&graph(&["a", "b"]).nodes).unwrap();
        assert!(session.is_dirty());
        assert_eq!(*seen.lock().unwrap(), vec![2]);

        // Unchanged content is not a new edit.
        session.set_dirty(false);
        session.replace_nodes(&graph(&["b", "a"]).nodes).unwrap();
        assert!(!session.is_dirty());
    }

    #[tokio::test]
    async fn test_non_finite_node_is_refused() {
        let store = Arc::new(MemorySnapshotStore::new());
        let registry = SessionRegistry::new();
        let mut session = CollabSession::open(&registry, options(store, ada())).unwrap();

        let bad = vec![Node::new("n1", "text", f64::NAN, 0.0)];
        assert!(matches!(session.replace_nodes(&bad), Err(SyncError::Document(_))));
        assert!(!session.is_dirty());
        assert!(session.nodes().is_empty());
    }

    #[tokio::test]
    async fn test_save_suppresses_own_echo() {
        let store = Arc::new(MemorySnapshotStore::new());
        let registry = SessionRegistry::new();
        let mut session = CollabSession::open(&registry, options(store.clone(), ada())).unwrap();

        session.replace_nodes(&graph(&["a"]).nodes).unwrap();
        let saved = session.save().await.unwrap();
        assert_eq!(saved.last_modified_by, "ada");
        assert!(!session.is_dirty());

        let raised = drain_until(&mut session, |e| {
            matches!(e, SessionEvent::RemoteChangesAvailable | SessionEvent::RemoteApplied(_))
        })
        .await;
        assert!(!raised);
        assert!(!session.has_remote_changes());
        assert_eq!(session.nodes().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_save_leaves_document_untouched() {
        let store = Arc::new(MemorySnapshotStore::new());
        let registry = SessionRegistry::new();
        let mut session = CollabSession::open(&registry, options(store.clone(), ada())).unwrap();

        session.replace_nodes(&graph(&["a"]).nodes).unwrap();
        store.set_available(false);

        let err = session.save().await.unwrap_err();
        assert!(matches!(err, SyncError::SnapshotWrite(_)));
        assert!(session.is_dirty());
        assert_eq!(session.nodes()[0].id, "a");
    }

    #[tokio::test]
    async fn test_remote_save_auto_applies_when_clean() {
        let store = Arc::new(MemorySnapshotStore::new());
        let registry = SessionRegistry::new();
        let mut session = CollabSession::open(&registry, options(store.clone(), ada())).unwrap();

        let remote = CanvasSnapshot::new("p1", &graph(&["x", "y"]), "grace");
        store.write(remote).await.unwrap();

        assert!(drain_until(&mut session, |e| matches!(e, SessionEvent::RemoteApplied(_))).await);
        assert!(!session.has_remote_changes());
        assert_eq!(session.graph(), graph(&["x", "y"]));
        assert!(!session.is_dirty());
    }

    #[tokio::test]
    async fn test_remote_save_over_dirty_edits_waits_for_user() {
        let store = Arc::new(MemorySnapshotStore::new());
        let registry = SessionRegistry::new();
        let mut session = CollabSession::open(&registry, options(store.clone(), ada())).unwrap();

        session.replace_nodes(&graph(&["mine"]).nodes).unwrap();
        let remote = CanvasSnapshot::new("p1", &graph(&["theirs"]), "grace");
        store.write(remote).await.unwrap();

        assert!(drain_until(&mut session, |e| matches!(e, SessionEvent::RemoteChangesAvailable)).await);
        assert!(session.has_remote_changes());
        assert_eq!(session.nodes()[0].id, "mine");

        session.dismiss_remote();
        assert!(!session.has_remote_changes());
        assert!(session.pending_remote().is_some());
        assert_eq!(session.nodes()[0].id, "mine");

        let applied = session.apply_remote().unwrap().unwrap();
        assert_eq!(applied.last_modified_by, "grace");
        assert_eq!(session.nodes()[0].id, "theirs");
        assert!(!session.is_dirty());
        assert!(session.apply_remote().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_closed_feed_is_resubscribed() {
        let store = Arc::new(MemorySnapshotStore::new());
        let registry = SessionRegistry::new();
        let mut session = CollabSession::open(&registry, options(store.clone(), ada())).unwrap();

        assert!(store.feed().close("p1"));
        // Let the session observe the closed subscription.
        let _ = drain_until(&mut session, |_| false).await;

        let remote = CanvasSnapshot::new("p1", &graph(&["after"]), "grace");
        store.write(remote).await.unwrap();
        assert!(drain_until(&mut session, |e| matches!(e, SessionEvent::RemoteApplied(_))).await);
        assert_eq!(session.nodes()[0].id, "after");
    }

    #[tokio::test]
    async fn test_lagged_feed_is_resubscribed() {
        let store = Arc::new(MemorySnapshotStore::new());
        let registry = SessionRegistry::new();
        let mut session = CollabSession::open(&registry, options(store.clone(), ada())).unwrap();

        // Overrun the default feed buffer before the session reads anything.
        for i in 0..100 {
            let id = format!("burst{i}");
            store
                .write(CanvasSnapshot::new("p1", &graph(&[id.as_str()]), "grace"))
                .await
                .unwrap();
        }
        // The backlog is skipped; nothing from the burst is applied.
        assert!(!drain_until(&mut session, |e| matches!(e, SessionEvent::RemoteApplied(_))).await);

        store
            .write(CanvasSnapshot::new("p1", &graph(&["latest"]), "grace"))
            .await
            .unwrap();
        assert!(drain_until(&mut session, |e| matches!(e, SessionEvent::RemoteApplied(_))).await);
        assert_eq!(session.nodes()[0].id, "latest");
    }

    #[tokio::test]
    async fn test_save_drops_held_back_remote() {
        let store = Arc::new(MemorySnapshotStore::new());
        let registry = SessionRegistry::new();
        let mut session = CollabSession::open(&registry, options(store.clone(), ada())).unwrap();

        session.replace_nodes(&graph(&["mine"]).nodes).unwrap();
        store
            .write(CanvasSnapshot::new("p1", &graph(&["older"]), "grace"))
            .await
            .unwrap();
        assert!(drain_until(&mut session, |e| matches!(e, SessionEvent::RemoteChangesAvailable)).await);

        session.save().await.unwrap();
        assert!(!session.has_remote_changes());
        assert!(session.pending_remote().is_none());
        assert_eq!(session.reconcile_state(), ReconcileState::Idle);
        assert!(session.apply_remote().unwrap().is_none());
        assert_eq!(session.nodes()[0].id, "mine");
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let store = Arc::new(MemorySnapshotStore::new());
        let registry = SessionRegistry::new();
        let mut session = CollabSession::open(&registry, options(store, grace())).unwrap();
        let client = session.client_id();

        let fired = Arc::new(Mutex::new(0));
        let counter = fired.clone();
        session.observe_nodes(move |_| *counter.lock().unwrap() += 1);
        session.on_presence_change(|_| {});

        session.teardown();
        session.teardown();

        assert!(session.is_closed());
        assert_eq!(session.observer_count(), 0);
        assert!(!registry.is_active(&client));
        assert!(session.next().await.is_none());
        assert!(matches!(
            session.replace_nodes(&graph(&["a"]).nodes),
            Err(SyncError::SessionClosed)
        ));
        assert_eq!(*fired.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_load_seeds_initial_from_snapshot() {
        let store = Arc::new(MemorySnapshotStore::new());
        store
            .write(CanvasSnapshot::new("p1", &graph(&["a"]), "ada"))
            .await
            .unwrap();

        let registry = SessionRegistry::new();
        let session = CollabSession::load(&registry, options(store.clone(), ada())).await.unwrap();
        assert_eq!(session.initial.as_ref().map(|g| g.nodes.len()), Some(1));

        let loaded = load_snapshot(store.as_ref(), "missing").await.unwrap();
        assert!(loaded.is_none());
    }
}
