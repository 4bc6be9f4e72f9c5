use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::ids::MessageId;

/// A persisted chat post. Immutable once the store returns it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub author: String,
    pub text: String,
    /// Server-assigned, `DD/MM/YYYY HH:mm:ss`.
    pub timestamp: String,
}

/// Client payload of an inbound `message` event.
///
/// Only `author` and `text` are read; any timestamp the client sends is
/// dropped during deserialization.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub author: String,
    pub text: String,
}

/// A message stamped by the server and ready to be saved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub author: String,
    pub text: String,
    pub timestamp: String,
}

impl NewMessage {
    pub fn new(author: impl Into<String>, text: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            text: text.into(),
            timestamp: timestamp.into(),
        }
    }

    pub fn stamp(incoming: IncomingMessage, clock: &dyn Clock) -> Self {
        Self {
            author: incoming.author,
            text: incoming.text,
            timestamp: clock.timestamp(),
        }
    }

    pub fn into_stored(self, id: MessageId) -> ChatMessage {
        ChatMessage {
            id,
            author: self.author,
            text: self.text,
            timestamp: self.timestamp,
        }
    }
}
