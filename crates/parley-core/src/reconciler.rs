//! Ordered, duplicate-free message store for the active channel.
//!
//! The store keeps messages sorted by creation time, newest first. Views that
//! want chronological order iterate from the tail. Order among messages with
//! equal timestamps is unspecified.

use parley_protocol::{Message, MessageId};
use tracing::trace;

/// Outcome of [`MessageStore::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    /// The id was new; the message was added.
    Added,
    /// A message with the same id existed and was replaced.
    Replaced,
    /// An identical message was already present.
    Unchanged,
}

/// The reconciled message collection of one channel activation.
///
/// Invariants, upheld by every operation:
/// - no two elements share an id;
/// - elements are sorted by `created_at` descending.
#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    messages: Vec<Message>,
}

impl MessageStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a message, or replace the message with the same id.
    ///
    /// Inserting a message that is already present is a no-op, which makes
    /// duplicate delivery harmless.
    pub fn insert(&mut self, message: Message) -> Inserted {
        if let Some(pos) = self.position(&message.id) {
            if self.messages[pos] == message {
                trace!(id = %message.id, "Duplicate insert ignored");
                return Inserted::Unchanged;
            }
            if self.messages[pos].created_at == message.created_at {
                self.messages[pos] = message;
            } else {
                self.messages.remove(pos);
                self.insert_sorted(message);
            }
            return Inserted::Replaced;
        }

        self.insert_sorted(message);
        Inserted::Added
    }

    /// Binary insertion equivalent to append-then-sort-descending.
    fn insert_sorted(&mut self, message: Message) {
        let at = self
            .messages
            .partition_point(|m| m.created_at >= message.created_at);
        self.messages.insert(at, message);
    }

    /// Replace the message with the same id in place.
    ///
    /// The position is kept: updates do not change creation time. Returns
    /// `false` and leaves the store untouched when the id is unknown.
    pub fn update(&mut self, message: Message) -> bool {
        match self.position(&message.id) {
            Some(pos) => {
                self.messages[pos] = message;
                true
            }
            None => {
                trace!(id = %message.id, "Update for unknown message ignored");
                false
            }
        }
    }

    /// Remove the message with the given id, returning it if present.
    pub fn delete(&mut self, id: &str) -> Option<Message> {
        let pos = self.position(id)?;
        Some(self.messages.remove(pos))
    }

    /// Seed the store from a history page, merging with anything already
    /// present. Returns how many messages were added.
    pub fn extend<I: IntoIterator<Item = Message>>(&mut self, messages: I) -> usize {
        messages
            .into_iter()
            .filter(|m| self.insert(m.clone()) == Inserted::Added)
            .count()
    }

    /// Drop every message.
    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Copy of the current ordered collection.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    /// Borrow the current ordered collection.
    #[must_use]
    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }

    /// Iterate newest first.
    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    /// Look up a message by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Whether a message with this id is present.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    /// Ids in store order.
    #[must_use]
    pub fn ids(&self) -> Vec<MessageId> {
        self.messages.iter().map(|m| m.id.clone()).collect()
    }

    /// Number of messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }
}

impl<'a> IntoIterator for &'a MessageStore {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}
