//! Snapshot writing and classification of incoming snapshot changes.
//!
//! ```text
//!            notification
//!                 │
//!   modified_by == self? ──yes──► IgnoredOwnEcho
//!                 │ no
//!   matches expected echo (in window)? ──yes──► IgnoredOwnEcho
//!                 │ no
//!   signature == last seen? ──yes──► IgnoredDuplicate
//!                 │ no
//!         local edits unsaved?
//!          │ no           │ yes
//!      AutoApply    PendingUserDecision ──apply()/dismiss()──► Idle
//! ```

use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera_core::{normalize, CanvasGraph, Edge, Node};

use crate::storage::{CanvasSnapshot, SnapshotChange, SnapshotStore, StoreError};

/// Default window during which a just-saved signature counts as our echo.
pub const DEFAULT_SUPPRESSION_WINDOW: Duration = Duration::from_secs(1);

/// SHA-256 of the canonical JSON of id-sorted nodes and edges.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature([u8; 32]);

impl Signature {
    pub fn compute(nodes: &[Node], edges: &[Edge]) -> Result<Self, serde_json::Error> {
        let canonical = (normalize(nodes), normalize(edges));
        // serde_json maps are key-sorted, so equal graphs give equal bytes.
        let bytes = serde_json::to_vec(&canonical)?;
        let digest = Sha256::digest(&bytes);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Ok(Signature(out))
    }

    pub fn of_graph(graph: &CanvasGraph) -> Result<Self, serde_json::Error> {
        Self::compute(&graph.nodes, &graph.edges)
    }

    pub fn of_snapshot(snapshot: &CanvasSnapshot) -> Result<Self, serde_json::Error> {
        Self::compute(&snapshot.nodes, &snapshot.edges)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", &self.to_hex()[..12])
    }
}

// ───────────────────────────────────────────────────────────────────
// Writer
// ───────────────────────────────────────────────────────────────────

/// Writes the session's graph as the project's durable snapshot.
pub struct SnapshotWriter {
    store: Arc<dyn SnapshotStore>,
    project_id: String,
    user_id: String,
}

impl SnapshotWriter {
    pub fn new(store: Arc<dyn SnapshotStore>, project_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            store,
            project_id: project_id.into(),
            user_id: user_id.into(),
        }
    }

    /// Persist `graph`, attributed to this writer's user.
    pub async fn write(&self, graph: &CanvasGraph) -> Result<CanvasSnapshot, StoreError> {
        let snapshot = CanvasSnapshot::new(self.project_id.clone(), graph, self.user_id.clone());
        self.store.write(snapshot.clone()).await?;
        log::debug!(
            "Saved snapshot for {} ({} nodes, {} edges)",
            self.project_id,
            snapshot.nodes.len(),
            snapshot.edges.len()
        );
        Ok(snapshot)
    }

    /// Durable snapshot used to seed a new session.
    pub async fn load(&self) -> Result<Option<CanvasSnapshot>, StoreError> {
        self.store.read(&self.project_id).await
    }
}

// ───────────────────────────────────────────────────────────────────
// Reconciler
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileState {
    Idle,
    /// A remote snapshot is being installed; new notifications wait.
    Applying,
    /// Remote changes arrived over unsaved local edits.
    PendingUserDecision,
}

/// What to do with one snapshot-change notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    IgnoredOwnEcho,
    IgnoredDuplicate,
    /// The snapshot could not be signed; it is skipped.
    Unreadable,
    /// Arrived during an apply; re-evaluated by `finish_apply`.
    Deferred,
    /// Install this snapshot, then call `finish_apply`.
    AutoApply(CanvasSnapshot),
    /// Raise the "remote changes available" indicator.
    PendingUserDecision,
}

pub struct Reconciler {
    self_user_id: String,
    window: Duration,
    last_seen: Option<Signature>,
    expected_echo: Option<(Signature, Instant)>,
    state: ReconcileState,
    pending: Option<CanvasSnapshot>,
    has_remote_changes: bool,
    deferred: Option<SnapshotChange>,
}

impl Reconciler {
    pub fn new(self_user_id: impl Into<String>, window: Duration) -> Self {
        Self {
            self_user_id: self_user_id.into(),
            window,
            last_seen: None,
            expected_echo: None,
            state: ReconcileState::Idle,
            pending: None,
            has_remote_changes: false,
            deferred: None,
        }
    }

    /// Remember a signature already reflected in the local graph.
    pub fn observe_signature(&mut self, signature: Signature) {
        self.last_seen = Some(signature);
    }

    /// Called after a successful save.
    ///
    /// The save overwrote any held-back remote snapshot, so that payload is
    /// dropped and a pending decision resolves to the local graph.
    pub fn record_save(&mut self, signature: Signature, now: Instant) {
        self.expected_echo = Some((signature, now));
        self.last_seen = Some(signature);
        if self.pending.take().is_some() {
            log::debug!("Save superseded a held-back remote snapshot");
        }
        self.has_remote_changes = false;
        if self.state == ReconcileState::PendingUserDecision {
            self.state = ReconcileState::Idle;
        }
    }

    pub fn on_notification(&mut self, change: &SnapshotChange, dirty: bool, now: Instant) -> Decision {
        if self.state == ReconcileState::Applying {
            log::debug!("Deferring snapshot change from {} during apply", change.modified_by);
            self.deferred = Some(change.clone());
            return Decision::Deferred;
        }

        if change.modified_by == self.self_user_id {
            return Decision::IgnoredOwnEcho;
        }

        let signature = match Signature::of_snapshot(&change.new_snapshot) {
            Ok(signature) => signature,
            Err(e) => {
                log::warn!("Cannot sign snapshot from {}: {e}", change.modified_by);
                return Decision::Unreadable;
            }
        };
        if let Some((expected, at)) = self.expected_echo {
            if expected == signature && now.saturating_duration_since(at) <= self.window {
                log::debug!("Snapshot change {signature:?} matches our last save");
                return Decision::IgnoredOwnEcho;
            }
        }

        match self.last_seen {
            Some(seen) if seen == signature => return Decision::IgnoredDuplicate,
            Some(_) => {}
            None => log::info!(
                "No prior signature for {}; treating change as remote",
                change.project_id
            ),
        }
        self.last_seen = Some(signature);

        if dirty {
            log::info!(
                "Remote changes from {} held back: local edits unsaved",
                change.modified_by
            );
            self.pending = Some(change.new_snapshot.clone());
            self.has_remote_changes = true;
            self.state = ReconcileState::PendingUserDecision;
            Decision::PendingUserDecision
        } else {
            // The newer snapshot supersedes anything held back or dismissed.
            self.pending = None;
            self.has_remote_changes = false;
            self.state = ReconcileState::Applying;
            Decision::AutoApply(change.new_snapshot.clone())
        }
    }

    /// User chose to discard local edits. Returns the snapshot to install,
    /// or `None` if nothing is pending or an apply is already running.
    pub fn apply(&mut self) -> Option<CanvasSnapshot> {
        if self.state == ReconcileState::Applying {
            return None;
        }
        let snapshot = self.pending.take()?;
        self.has_remote_changes = false;
        self.state = ReconcileState::Applying;
        Some(snapshot)
    }

    /// End the in-flight apply. Returns a notification that arrived meanwhile.
    pub fn finish_apply(&mut self) -> Option<SnapshotChange> {
        if self.state == ReconcileState::Applying {
            self.state = ReconcileState::Idle;
        }
        self.deferred.take()
    }

    /// Hide the indicator; the payload stays available for a later `apply()`.
    pub fn dismiss(&mut self) {
        self.has_remote_changes = false;
        if self.state == ReconcileState::PendingUserDecision {
            self.state = ReconcileState::Idle;
        }
    }

    pub fn has_remote_changes(&self) -> bool {
        self.has_remote_changes
    }

    pub fn pending_snapshot(&self) -> Option<&CanvasSnapshot> {
        self.pending.as_ref()
    }

    pub fn state(&self) -> ReconcileState {
        self.state
    }
}
