use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::MessageId;
use crate::messages::ChatMessage;

/// History snapshot keyed by message id.
///
/// `ids` keeps store order (oldest first); `entities` holds each message
/// once so clients can merge live broadcasts that overlap the snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedMessages {
    pub ids: Vec<MessageId>,
    pub entities: BTreeMap<MessageId, ChatMessage>,
}

impl NormalizedMessages {
    /// Repeated ids keep their first occurrence.
    pub fn from_messages(messages: impl IntoIterator<Item = ChatMessage>) -> Self {
        let mut out = Self::default();
        for message in messages {
            if out.entities.contains_key(&message.id) {
                continue;
            }
            out.ids.push(message.id.clone());
            out.entities.insert(message.id.clone(), message);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Messages in `ids` order.
    pub fn ordered(&self) -> impl Iterator<Item = &ChatMessage> {
        self.ids.iter().filter_map(|id| self.entities.get(id))
    }
}

impl FromIterator<ChatMessage> for NormalizedMessages {
    fn from_iter<I: IntoIterator<Item = ChatMessage>>(iter: I) -> Self {
        Self::from_messages(iter)
    }
}
