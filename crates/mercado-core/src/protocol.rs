//! JSON frames exchanged over the chat socket.
//!
//! Every frame is `{"event": <name>, "data": <payload>}`.

use serde::{Deserialize, Serialize};

use crate::messages::{ChatMessage, IncomingMessage};
use crate::normalize::NormalizedMessages;

/// Server → client frames.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Full history, sent once right after connect.
    Messages(NormalizedMessages),
    /// A persisted post, fanned out to every connection.
    Message(ChatMessage),
    /// Failure scoped to the receiving connection.
    Error(ErrorPayload),
}

/// Client → server frames.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    Message(IncomingMessage),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    StoreUnavailable,
    InvalidPayload,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
}

impl ServerEvent {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            kind,
            message: message.into(),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Messages(_) => "messages",
            Self::Message(_) => "message",
            Self::Error(_) => "error",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ClientEvent {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
