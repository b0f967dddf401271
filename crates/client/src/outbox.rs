// Offline queue for chat messages composed while disconnected.
//
// Entries are replayed in their original order after reconnect, each with
// its correlation id so the echo replaces the provisional entry.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub correlation_id: String,
    pub channel: String,
    pub text: String,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct OfflineQueue {
    entries: VecDeque<QueuedMessage>,
}

impl OfflineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: QueuedMessage) {
        self.entries.push_back(message);
    }

    /// Take every queued message, oldest first.
    pub fn drain(&mut self) -> Vec<QueuedMessage> {
        self.entries.drain(..).collect()
    }

    /// Put messages that could not be transmitted back at the head of the
    /// queue, keeping their relative order.
    pub fn restore(&mut self, unsent: Vec<QueuedMessage>) {
        for message in unsent.into_iter().rev() {
            if !self.contains(&message.correlation_id) {
                self.entries.push_front(message);
            }
        }
    }

    pub fn remove(&mut self, correlation_id: &str) -> Option<QueuedMessage> {
        let index = self.entries.iter().position(|m| m.correlation_id == correlation_id)?;
        self.entries.remove(index)
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.entries.iter().any(|m| m.correlation_id == correlation_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
