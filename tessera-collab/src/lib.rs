//! # tessera-collab — Live synchronization for Tessera canvases
//!
//! Connects each client's replicated canvas to a relay, shares presence,
//! and reconciles the live session with the project's durable snapshot.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐     WebSocket      ┌─────────────┐
//! │ CollabSession │ ◄────────────────► │ SyncServer  │
//! │ (per client)  │    Binary Proto    │ (relay)     │
//! └──────┬────────┘                    └──────┬──────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌───────────────┐                    ┌─────────────┐
//! │CanvasDocument │                    │ Yrs Doc     │
//! │ + Awareness   │                    │ per project │
//! └──────┬────────┘                    └──────┬──────┘
//!        │ save / notify                      │ room closes
//!        ▼                                    ▼
//! ┌───────────────┐                    ┌─────────────┐
//! │ SnapshotStore │◄───── Reconciler   │ CanvasStore │
//! └───────────────┘                    └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded `SyncMessage`)
//! - [`presence`] — Cursors, selections and colours of other clients
//! - [`client`] — Reconnecting WebSocket transport
//! - [`storage`] — Durable snapshots and change notifications
//! - [`reconcile`] — Snapshot writer and remote-change classification
//! - [`session`] — Per-client session and registry
//! - [`broadcast`], [`server`], [`auth`] — The relay

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod reconcile;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use auth::{AllowAll, AuthError, Authenticator, StaticTokens};
pub use broadcast::{BroadcastGroup, BroadcastStats, RelayPeer};
pub use client::{Backoff, ConnectionState, TransportConfig, TransportEvent, TransportHandle};
pub use error::SyncError;
pub use presence::{
    color_for_user, AwarenessChannel, AwarenessMessage, Collaborator, PresenceError, PresenceState, Vec2,
};
pub use protocol::{JoinRequest, MessageType, ProtocolError, SyncMessage, UserIdentity};
pub use reconcile::{Decision, ReconcileState, Reconciler, Signature, SnapshotWriter};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{
    load_snapshot, CollabSession, RegistryLease, SessionConfig, SessionEvent, SessionOptions, SessionRegistry,
};
pub use storage::{
    CanvasSnapshot, CanvasStore, ChangeFeed, MemorySnapshotStore, SnapshotChange, SnapshotStore, StoreConfig,
    StoreError,
};
