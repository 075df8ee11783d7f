//! Binary wire protocol for session coordination.
//!
//! Wire format (bincode-encoded `Frame`):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬─────────────┐
//! │ msg_type │ sender    │ clock    │ payload  │ signature   │
//! │ 1 byte   │ len + str │ varint   │ len + N  │ opt + len+N │
//! └──────────┴───────────┴──────────┴──────────┴─────────────┘
//! ```
//!
//! Event data and state blobs are opaque JSON mappings, so they ride as
//! JSON bytes inside `payload`. Everything else is bincode.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::EventKind;
use crate::merge::StateSnapshot;
use crate::session::SessionId;

/// Message types for the coordination protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Typed real-time event (selection, navigation, edit, presence)
    Event = 1,
    /// Full state snapshot for targeted sync
    StateSync = 2,
    /// Session joined notification
    Join = 3,
    /// Session left notification
    Leave = 4,
    /// Heartbeat ping
    Ping = 5,
    /// Heartbeat pong
    Pong = 6,
}

/// An event as handed to peers: `{kind, data, sender_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub kind: EventKind,
    pub data: Value,
    pub sender_id: SessionId,
}

impl EventEnvelope {
    pub fn new(kind: EventKind, data: Value, sender_id: SessionId) -> Self {
        Self { kind, data, sender_id }
    }
}

/// Identity announced in a Join frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinInfo {
    pub display_name: String,
    pub public_key: Vec<u8>,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub msg_type: MessageType,
    pub sender: SessionId,
    /// Sender wall clock in milliseconds
    pub clock: u64,
    pub payload: Vec<u8>,
    /// Signature over the frame encoded with this field set to `None`
    pub signature: Option<Vec<u8>>,
}

impl Frame {
    fn unsigned(msg_type: MessageType, sender: SessionId, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            sender,
            clock,
            payload,
            signature: None,
        }
    }

    /// Create an event frame.
    pub fn event(envelope: &EventEnvelope, clock: u64) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(envelope)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self::unsigned(MessageType::Event, envelope.sender_id.clone(), clock, payload))
    }

    /// Create a state sync frame carrying a full snapshot.
    pub fn state_sync(snapshot: &StateSnapshot) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(snapshot)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self::unsigned(
            MessageType::StateSync,
            snapshot.origin.clone(),
            snapshot.clock,
            payload,
        ))
    }

    /// Create a join notification.
    pub fn join(sender: SessionId, clock: u64, info: &JoinInfo) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self::unsigned(MessageType::Join, sender, clock, payload))
    }

    /// Create a leave notification.
    pub fn leave(sender: SessionId, clock: u64) -> Self {
        Self::unsigned(MessageType::Leave, sender, clock, Vec::new())
    }

    pub fn ping(sender: SessionId) -> Self {
        Self::unsigned(MessageType::Ping, sender, 0, Vec::new())
    }

    pub fn pong(sender: SessionId) -> Self {
        Self::unsigned(MessageType::Pong, sender, 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }

    /// Bytes covered by the signature.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.signature.is_none() {
            return self.encode();
        }
        let mut unsigned = self.clone();
        unsigned.signature = None;
        unsigned.encode()
    }

    /// Parse the event payload.
    pub fn event_envelope(&self) -> Result<EventEnvelope, ProtocolError> {
        if self.msg_type != MessageType::Event {
            return Err(ProtocolError::InvalidMessageType);
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// Parse the state sync payload.
    pub fn state_snapshot(&self) -> Result<StateSnapshot, ProtocolError> {
        if self.msg_type != MessageType::StateSync {
            return Err(ProtocolError::InvalidMessageType);
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// Parse the join payload.
    pub fn join_info(&self) -> Result<JoinInfo, ProtocolError> {
        if self.msg_type != MessageType::Join {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (info, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(info)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_frame_roundtrip() {
        let envelope = EventEnvelope::new(
            EventKind::Selection,
            json!({"index": 3}),
            SessionId::from("s1"),
        );
        let frame = Frame::event(&envelope, 42).unwrap();
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Event);
        assert_eq!(decoded.sender, SessionId::from("s1"));
        assert_eq!(decoded.clock, 42);
        assert_eq!(decoded.event_envelope().unwrap(), envelope);
    }

    #[test]
    fn test_event_payload_is_plain_json() {
        let envelope = EventEnvelope::new(
            EventKind::Selection,
            json!({"index": 3}),
            SessionId::from("s1"),
        );
        let frame = Frame::event(&envelope, 1).unwrap();
        let value: Value = serde_json::from_slice(&frame.payload).unwrap();

        assert_eq!(
            value,
            json!({"kind": "selection", "data": {"index": 3}, "sender_id": "s1"})
        );
    }

    #[test]
    fn test_state_sync_roundtrip() {
        let mut fields = serde_json::Map::new();
        fields.insert("view".into(), json!("grid"));
        let snapshot = StateSnapshot::new(SessionId::from("s1"), 99, fields);

        let frame = Frame::state_sync(&snapshot).unwrap();
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::StateSync);
        assert_eq!(decoded.clock, 99);
        assert_eq!(decoded.state_snapshot().unwrap(), snapshot);
    }

    #[test]
    fn test_join_roundtrip() {
        let info = JoinInfo {
            display_name: "Alice".into(),
            public_key: vec![7; 32],
        };
        let frame = Frame::join(SessionId::from("s1"), 5, &info).unwrap();
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();

        assert_eq!(decoded.join_info().unwrap(), info);
    }

    #[test]
    fn test_wrong_payload_accessor() {
        let frame = Frame::ping(SessionId::from("s1"));
        assert_eq!(frame.event_envelope(), Err(ProtocolError::InvalidMessageType));
        assert_eq!(frame.state_snapshot(), Err(ProtocolError::InvalidMessageType));
        assert_eq!(frame.join_info(), Err(ProtocolError::InvalidMessageType));
    }

    #[test]
    fn test_signing_bytes_ignore_signature() {
        let mut frame = Frame::leave(SessionId::from("s1"), 3);
        let unsigned = frame.signing_bytes().unwrap();

        frame.signature = Some(vec![1, 2, 3]);
        assert_eq!(frame.signing_bytes().unwrap(), unsigned);
        assert_ne!(frame.encode().unwrap(), unsigned);
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(Frame::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Event as u8, 1);
        assert_eq!(MessageType::StateSync as u8, 2);
        assert_eq!(MessageType::Join as u8, 3);
        assert_eq!(MessageType::Leave as u8, 4);
        assert_eq!(MessageType::Ping as u8, 5);
        assert_eq!(MessageType::Pong as u8, 6);
    }

    #[test]
    fn test_event_frame_fits_budget() {
        let envelope = EventEnvelope::new(
            EventKind::Navigation,
            json!({"item": 12, "path": ["root", "shelf"]}),
            SessionId::generate(),
        );
        let encoded = Frame::event(&envelope, 1).unwrap().encode().unwrap();
        assert!(encoded.len() < 256, "Encoded size {} too large", encoded.len());
    }
}
