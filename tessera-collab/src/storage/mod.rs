//! Durable canvas snapshots and the change feed sessions subscribe to.
//!
//! ```text
//! ┌──────────────┐  write()   ┌─────────────────┐  publish  ┌────────────┐
//! │SnapshotWriter│ ─────────► │ SnapshotStore   │ ────────► │ ChangeFeed │
//! └──────────────┘            │ (RocksDB / mem) │           └─────┬──────┘
//!                             └─────────────────┘                 │ per project
//!                                                                 ▼
//!                                                           Reconciler
//! ```
//!
//! Column families of the RocksDB store:
//! - `snapshots` — latest `CanvasSnapshot` per project (JSON, LZ4)
//! - `documents` — relay-side CRDT state per project (LZ4)

pub mod feed;
pub mod memory;
pub mod rocks;

pub use feed::ChangeFeed;
pub use memory::MemorySnapshotStore;
pub use rocks::{CanvasStore, StoreConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use tessera_core::{CanvasGraph, Edge, Node};
use tokio::sync::broadcast;

/// Durable per-project record written on explicit save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasSnapshot {
    pub project_id: String,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub last_modified_by: String,
    /// Milliseconds since the Unix epoch.
    pub last_modified_at: u64,
}

impl CanvasSnapshot {
    pub fn new(project_id: impl Into<String>, graph: &CanvasGraph, modified_by: impl Into<String>) -> Self {
        let graph = graph.normalized();
        Self {
            project_id: project_id.into(),
            nodes: graph.nodes,
            edges: graph.edges,
            last_modified_by: modified_by.into(),
            last_modified_at: now_millis(),
        }
    }

    pub fn graph(&self) -> CanvasGraph {
        CanvasGraph::new(self.nodes.clone(), self.edges.clone())
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(self).map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::DeserializationError(e.to_string()))
    }
}

/// Notification published after every successful snapshot write.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotChange {
    pub project_id: String,
    pub new_snapshot: CanvasSnapshot,
    pub previous_snapshot: Option<CanvasSnapshot>,
    pub modified_by: String,
    pub modified_at: u64,
}

impl SnapshotChange {
    pub fn new(new_snapshot: CanvasSnapshot, previous_snapshot: Option<CanvasSnapshot>) -> Self {
        Self {
            project_id: new_snapshot.project_id.clone(),
            modified_by: new_snapshot.last_modified_by.clone(),
            modified_at: new_snapshot.last_modified_at,
            new_snapshot,
            previous_snapshot,
        }
    }
}

/// Shared snapshot storage. Writes are last-writer-wins.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persist `snapshot` and publish the resulting change.
    async fn write(&self, snapshot: CanvasSnapshot) -> Result<SnapshotChange, StoreError>;

    /// Latest snapshot for a project, if any was ever written.
    async fn read(&self, project_id: &str) -> Result<Option<CanvasSnapshot>, StoreError>;

    /// Change notifications for one project.
    fn subscribe(&self, project_id: &str) -> broadcast::Receiver<SnapshotChange>;
}

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Compression error: {0}")]
    CompressionError(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
