use tessera_core::collab::CollabError;
use uuid::Uuid;

use crate::presence::PresenceError;
use crate::protocol::ProtocolError;
use crate::storage::StoreError;

/// Errors surfaced by a collaboration session.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Authentication rejected: {0}")]
    Authentication(String),
    #[error("Snapshot write failed: {0}")]
    SnapshotWrite(#[source] StoreError),
    #[error("Snapshot read failed: {0}")]
    SnapshotRead(#[source] StoreError),
    #[error(transparent)]
    Document(#[from] CollabError),
    #[error(transparent)]
    Presence(#[from] PresenceError),
    #[error("Protocol error: {0}")]
    Protocol(ProtocolError),
    #[error("Client {client_id} already has an active session for project {project_id}")]
    SessionActive { client_id: Uuid, project_id: String },
    #[error("Session has been torn down")]
    SessionClosed,
}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::ConnectionClosed => SyncError::Connection(e.to_string()),
            other => SyncError::Protocol(other),
        }
    }
}
