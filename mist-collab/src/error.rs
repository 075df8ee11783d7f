use thiserror::Error;

use crate::events::UnknownEventKind;
use crate::protocol::{MessageType, ProtocolError};
use crate::session::SessionId;

#[derive(Error, Debug)]
pub enum CollabError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    UnknownEventKind(#[from] UnknownEventKind),
    #[error("Signature check failed for {msg_type:?} frame from {sender}")]
    Signature { sender: SessionId, msg_type: MessageType },
    #[error("Unsigned {msg_type:?} frame from {sender}")]
    MissingSignature { sender: SessionId, msg_type: MessageType },
    #[error("Session {sender} is already bound to a different key")]
    KeyRebind { sender: SessionId },
}
