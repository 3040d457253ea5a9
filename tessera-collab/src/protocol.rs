//! Binary protocol spoken between sessions and the relay.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ client_id │ room     │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ varint+n │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Document payloads are Yrs v1 updates / state vectors and are never
//! inspected by this layer. Awareness and join payloads are bincode records.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::presence::AwarenessMessage;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// First message on a connection: identity + credential
    Join = 1,
    /// Yrs state vector (sync handshake, step 1)
    SyncStep1 = 2,
    /// Yrs state diff answering a step 1
    SyncStep2 = 3,
    /// Incremental CRDT update
    Update = 4,
    /// Presence record or removal
    Awareness = 5,
    /// Join refused; the connection is closed right after
    AuthRejected = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
}

/// User identity supplied by the authentication component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserIdentity {
    pub id: String,
    pub display_name: String,
    pub email: String,
}

impl UserIdentity {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            email: email.into(),
        }
    }
}

/// Payload of a `Join` message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinRequest {
    pub identity: UserIdentity,
    /// Bearer credential
    pub token: String,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Sending connection (nil for relay-originated messages)
    pub client_id: Uuid,
    /// Project the message belongs to
    pub room: String,
    /// Sender's Lamport clock
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, client_id: Uuid, room: &str, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            client_id,
            room: room.to_string(),
            clock,
            payload,
        }
    }

    /// Create a join request.
    pub fn join(client_id: Uuid, room: &str, request: &JoinRequest) -> Result<Self, ProtocolError> {
        let payload = encode_payload(request)?;
        Ok(Self::new(MessageType::Join, client_id, room, 0, payload))
    }

    /// Create a sync step 1 (state vector).
    pub fn sync_step1(client_id: Uuid, room: &str, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, client_id, room, 0, state_vector)
    }

    /// Create a sync step 2 (state diff).
    pub fn sync_step2(client_id: Uuid, room: &str, diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, client_id, room, 0, diff)
    }

    /// Create an incremental update message.
    pub fn update(client_id: Uuid, room: &str, clock: u64, update: Vec<u8>) -> Self {
        Self::new(MessageType::Update, client_id, room, clock, update)
    }

    /// Create an awareness message.
    pub fn awareness(
        client_id: Uuid,
        room: &str,
        clock: u64,
        message: &AwarenessMessage,
    ) -> Result<Self, ProtocolError> {
        let payload = encode_payload(message)?;
        Ok(Self::new(MessageType::Awareness, client_id, room, clock, payload))
    }

    /// Create a join rejection carrying a human-readable reason.
    pub fn auth_rejected(room: &str, reason: &str) -> Self {
        Self::new(
            MessageType::AuthRejected,
            Uuid::nil(),
            room,
            0,
            reason.as_bytes().to_vec(),
        )
    }

    /// Create a ping message.
    pub fn ping(client_id: Uuid) -> Self {
        Self::new(MessageType::Ping, client_id, "", 0, Vec::new())
    }

    /// Create a pong message.
    pub fn pong(client_id: Uuid) -> Self {
        Self::new(MessageType::Pong, client_id, "", 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse a join payload.
    pub fn join_request(&self) -> Result<JoinRequest, ProtocolError> {
        if self.msg_type != MessageType::Join {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }

    /// Parse an awareness payload.
    pub fn awareness_message(&self) -> Result<AwarenessMessage, ProtocolError> {
        if self.msg_type != MessageType::Awareness {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }

    /// Reason attached to an `AuthRejected` message.
    pub fn rejection_reason(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

pub(crate) fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

pub(crate) fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid message type")]
    InvalidMessageType,
    #[error("Connection closed")]
    ConnectionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::{PresenceState, Vec2};

    #[test]
    fn test_update_roundtrip() {
        let client = Uuid::new_v4();
        let payload = vec![1, 2, 3, 4, 5];

        let msg = SyncMessage::update(client, "p1", 42, payload.clone());
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Update);
        assert_eq!(decoded.client_id, client);
        assert_eq!(decoded.room, "p1");
        assert_eq!(decoded.clock, 42);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_join_carries_identity_and_token() {
        let request = JoinRequest {
            identity: UserIdentity::new("u1", "Ada", "ada@example.com"),
            token: "secret".into(),
        };
        let msg = SyncMessage::join(Uuid::new_v4(), "p1", &request).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Join);
        assert_eq!(decoded.join_request().unwrap(), request);
    }

    #[test]
    fn test_awareness_payload() {
        let client = Uuid::new_v4();
        let state = PresenceState {
            client_id: client,
            user_id: "u1".into(),
            user_name: "Ada".into(),
            color: "#e6194b".into(),
            cursor: Some(Vec2::new(100.5, 200.25)),
            selection: vec!["n1".into()],
            clock: 3,
        };
        let msg =
            SyncMessage::awareness(client, "p1", 7, &AwarenessMessage::Update(state.clone())).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(
            decoded.awareness_message().unwrap(),
            AwarenessMessage::Update(state)
        );
    }

    #[test]
    fn test_rejection_reason() {
        let msg = SyncMessage::auth_rejected("p1", "token expired");
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.msg_type, MessageType::AuthRejected);
        assert_eq!(decoded.client_id, Uuid::nil());
        assert_eq!(decoded.rejection_reason(), "token expired");
    }

    #[test]
    fn test_invalid_message_type_error() {
        let msg = SyncMessage::ping(Uuid::new_v4());
        assert!(msg.awareness_message().is_err());
        assert!(msg.join_request().is_err());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(SyncMessage::decode(&garbage).is_err());
    }

    #[test]
    fn test_update_size_efficient() {
        let msg = SyncMessage::update(Uuid::new_v4(), "project-1", 1, vec![0u8; 50]);
        let encoded = msg.encode().unwrap();
        assert!(
            encoded.len() < 120,
            "Encoded size {} too large for 50-byte update",
            encoded.len()
        );
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Join as u8, 1);
        assert_eq!(MessageType::SyncStep1 as u8, 2);
        assert_eq!(MessageType::SyncStep2 as u8, 3);
        assert_eq!(MessageType::Update as u8, 4);
        assert_eq!(MessageType::Awareness as u8, 5);
        assert_eq!(MessageType::AuthRejected as u8, 6);
        assert_eq!(MessageType::Ping as u8, 7);
        assert_eq!(MessageType::Pong as u8, 8);
    }
}
