//! Presence channel: who is in the project, where their cursor is and
//! what they have selected.
//!
//! ```text
//! local cursor/selection change
//!       │
//!       ▼
//! AwarenessChannel::set_local_state()   (whole-record replace)
//!       │
//!       ▼
//! AwarenessMessage::Update { … }  ──► relay ──► peers
//!       │
//!       ▼
//! AwarenessChannel::handle_message()   (drop own + out-of-order records)
//!       │
//!       ▼
//! on_change listeners  /  collaborators()
//! ```
//!
//! Presence is ephemeral. Nothing here is persisted.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::protocol::{decode_payload, encode_payload, ProtocolError};

/// Collaborator colours, indexed by a hash of the user id.
pub const PALETTE: [&str; 12] = [
    "#e6194b", "#3cb44b", "#4363d8", "#f58231", "#911eb4", "#42d4f4", "#f032e6", "#469990",
    "#9a6324", "#800000", "#808000", "#000075",
];

/// Cursors older than this are hidden from collaborator lists.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(5);

/// Peers silent for this long are dropped by `prune_idle`.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Deterministic palette colour for a user.
///
/// FNV-1a over the user id, so every client agrees on the colour without
/// coordinating.
pub fn color_for_user(user_id: &str) -> &'static str {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in user_id.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    PALETTE[(hash as usize) % PALETTE.len()]
}

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// 2D position in canvas (world) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// One connection's presence record. Replaced wholesale on every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    pub client_id: Uuid,
    pub user_id: String,
    pub user_name: String,
    pub color: String,
    pub cursor: Option<Vec2>,
    /// Selected node ids, sorted and unique.
    pub selection: Vec<String>,
    /// Sender-local counter; higher wins.
    pub clock: u64,
}

impl PresenceState {
    pub fn validate(&self) -> Result<(), PresenceError> {
        if self.user_id.is_empty() {
            return Err(PresenceError::EmptyUserId);
        }
        if let Some(cursor) = self.cursor {
            if !cursor.is_finite() {
                return Err(PresenceError::InvalidCursor);
            }
        }
        if !PALETTE.contains(&self.color.as_str()) {
            return Err(PresenceError::UnknownColor(self.color.clone()));
        }
        Ok(())
    }
}

/// Presence validation errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PresenceError {
    #[error("presence record has an empty user id")]
    EmptyUserId,
    #[error("cursor coordinates must be finite")]
    InvalidCursor,
    #[error("colour {0} is not in the collaborator palette")]
    UnknownColor(String),
}

/// Awareness message types sent over the wire.
///
/// Serialized inside `SyncMessage` payloads of type `Awareness`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AwarenessMessage {
    /// Full replacement of a client's record.
    Update(PresenceState),
    /// Client disconnected or left the project.
    Remove { client_id: Uuid },
}

impl AwarenessMessage {
    /// Encode to binary (bincode).
    #[inline(always)]
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_payload(self)
    }

    /// Decode from binary.
    #[inline(always)]
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_payload(bytes)
    }

    pub fn client_id(&self) -> Uuid {
        match self {
            AwarenessMessage::Update(state) => state.client_id,
            AwarenessMessage::Remove { client_id } => *client_id,
        }
    }
}

/// Entry in the active-collaborators list handed to the UI.
#[derive(Debug, Clone, PartialEq)]
pub struct Collaborator {
    pub client_id: Uuid,
    pub user_name: String,
    pub color: String,
    /// `None` when the peer has no cursor or its record went stale.
    pub cursor: Option<Vec2>,
    pub selection: Vec<String>,
}

// ───────────────────────────────────────────────────────────────────
// Remote peer tracking
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct RemotePresence {
    state: PresenceState,
    last_update: Instant,
}

/// Handle returned by `on_change`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type PresenceListener = Box<dyn Fn(&HashMap<Uuid, PresenceState>) + Send + Sync>;

/// Presence for one project session: the local record plus every remote peer.
pub struct AwarenessChannel {
    local_client_id: Uuid,
    local: Option<PresenceState>,
    peers: HashMap<Uuid, RemotePresence>,
    /// Monotonic clock stamped on outgoing records.
    clock: u64,
    listeners: Vec<(ListenerId, PresenceListener)>,
    next_listener: u64,
}

impl AwarenessChannel {
    pub fn new(local_client_id: Uuid) -> Self {
        Self {
            local_client_id,
            local: None,
            peers: HashMap::new(),
            clock: 0,
            listeners: Vec::new(),
            next_listener: 0,
        }
    }

    pub fn local_client_id(&self) -> Uuid {
        self.local_client_id
    }

    pub fn local_state(&self) -> Option<&PresenceState> {
        self.local.as_ref()
    }

    /// Replace the local record and return the message to broadcast.
    ///
    /// Fields left out (`None` cursor, `None` selection) are cleared, not kept.
    pub fn set_local_state(
        &mut self,
        user_id: &str,
        user_name: &str,
        color: &str,
        cursor: Option<Vec2>,
        selection: Option<Vec<String>>,
    ) -> Result<AwarenessMessage, PresenceError> {
        let mut selection = selection.unwrap_or_default();
        selection.sort();
        selection.dedup();

        let state = PresenceState {
            client_id: self.local_client_id,
            user_id: user_id.to_string(),
            user_name: user_name.to_string(),
            color: color.to_string(),
            cursor,
            selection,
            clock: self.clock + 1,
        };
        state.validate()?;

        self.clock = state.clock;
        self.local = Some(state.clone());
        Ok(AwarenessMessage::Update(state))
    }

    /// Re-announce the current local record (after a reconnect).
    pub fn local_message(&self) -> Option<AwarenessMessage> {
        self.local.clone().map(AwarenessMessage::Update)
    }

    /// Message telling peers this client is gone.
    pub fn leave_message(&self) -> AwarenessMessage {
        AwarenessMessage::Remove {
            client_id: self.local_client_id,
        }
    }

    /// Handle an incoming awareness message from the network.
    ///
    /// Returns `true` if the set of remote states changed.
    pub fn handle_message(&mut self, msg: &AwarenessMessage) -> bool {
        if msg.client_id() == self.local_client_id {
            return false;
        }

        let changed = match msg {
            AwarenessMessage::Update(state) => self.apply_update(state),
            AwarenessMessage::Remove { client_id } => self.peers.remove(client_id).is_some(),
        };
        if changed {
            self.notify();
        }
        changed
    }

    fn apply_update(&mut self, state: &PresenceState) -> bool {
        if let Err(e) = state.validate() {
            log::warn!("Dropping invalid presence from {}: {e}", state.client_id);
            return false;
        }
        if let Some(existing) = self.peers.get_mut(&state.client_id) {
            if state.clock <= existing.state.clock {
                log::trace!(
                    "Stale presence from {} (clock {} <= {})",
                    state.client_id,
                    state.clock,
                    existing.state.clock
                );
                return false;
            }
            existing.state = state.clone();
            existing.last_update = Instant::now();
        } else {
            self.peers.insert(
                state.client_id,
                RemotePresence {
                    state: state.clone(),
                    last_update: Instant::now(),
                },
            );
        }
        true
    }

    /// Drop a peer's record. Returns `true` if it was present.
    pub fn remove(&mut self, client_id: Uuid) -> bool {
        let removed = self.peers.remove(&client_id).is_some();
        if removed {
            self.notify();
        }
        removed
    }

    /// Drop every remote record, e.g. when the connection is lost.
    pub fn clear_remote(&mut self) -> bool {
        if self.peers.is_empty() {
            return false;
        }
        self.peers.clear();
        self.notify();
        true
    }

    /// Remove peers not heard from within `timeout`; returns who was removed.
    pub fn prune_idle(&mut self, now: Instant, timeout: Duration) -> Vec<Uuid> {
        let idle: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_update) > timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &idle {
            self.peers.remove(id);
        }
        if !idle.is_empty() {
            self.notify();
        }
        idle
    }

    /// All other clients' states, keyed by client id.
    pub fn states(&self) -> HashMap<Uuid, PresenceState> {
        self.peers
            .iter()
            .map(|(id, p)| (*id, p.state.clone()))
            .collect()
    }

    /// Active collaborators sorted by name; cursors older than `stale_after`
    /// are suppressed.
    pub fn collaborators(&self, now: Instant, stale_after: Duration) -> Vec<Collaborator> {
        let mut list: Vec<Collaborator> = self
            .peers
            .values()
            .map(|p| {
                let stale = now.saturating_duration_since(p.last_update) > stale_after;
                Collaborator {
                    client_id: p.state.client_id,
                    user_name: p.state.user_name.clone(),
                    color: p.state.color.clone(),
                    cursor: if stale { None } else { p.state.cursor },
                    selection: p.state.selection.clone(),
                }
            })
            .collect();
        list.sort_by(|a, b| {
            a.user_name
                .cmp(&b.user_name)
                .then_with(|| a.client_id.cmp(&b.client_id))
        });
        list
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    // ─── Listeners ────────────────────────────────────────────────────

    pub fn on_change<F>(&mut self, callback: F) -> ListenerId
    where
        F: Fn(&HashMap<Uuid, PresenceState>) + Send + Sync + 'static,
    {
        self.next_listener += 1;
        let id = ListenerId(self.next_listener);
        self.listeners.push((id, Box::new(callback)));
        id
    }

    pub fn off_change(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        before != self.listeners.len()
    }

    pub fn clear_listeners(&mut self) {
        self.listeners.clear();
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn notify(&self) {
        if self.listeners.is_empty() {
            return;
        }
        let states = self.states();
        for (_, listener) in &self.listeners {
            listener(&states);
        }
    }
}
