// Bounded per-channel message logs.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use huddle_common::types::{ChatMessage, Identity, Reaction};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::CollabError;

pub const SEARCH_RESULT_LIMIT: usize = 50;

/// Outcome of toggling a reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionToggle {
    Added,
    Removed,
}

/// Message history of one channel, capped at `capacity` entries with the
/// oldest evicted first.
#[derive(Debug)]
pub struct ChannelLog {
    name: String,
    messages: VecDeque<ChatMessage>,
    capacity: usize,
    last_activity: DateTime<Utc>,
    appended_total: u64,
}

impl ChannelLog {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            messages: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            last_activity: Utc::now(),
            appended_total: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a message authored by `author`, assigning a fresh server id.
    pub fn append(
        &mut self,
        author: &Identity,
        text: String,
        correlation_id: Option<String>,
        mentions: Vec<String>,
    ) -> ChatMessage {
        let now = Utc::now();
        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            channel: self.name.clone(),
            author_id: author.id.clone(),
            author_name: author.display_name.clone(),
            text,
            created_at: now,
            client_correlation_id: correlation_id,
            mentions,
            reactions: Vec::new(),
        };

        while self.messages.len() >= self.capacity {
            self.messages.pop_front();
        }
        self.messages.push_back(message.clone());
        self.last_activity = now;
        self.appended_total += 1;
        message
    }

    /// The most recent `limit` messages, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<ChatMessage> {
        let skip = self.messages.len().saturating_sub(limit);
        self.messages.iter().skip(skip).cloned().collect()
    }

    /// Case-insensitive substring search over text and author name,
    /// newest first.
    pub fn search(&self, query: &str) -> Vec<ChatMessage> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        self.messages
            .iter()
            .rev()
            .filter(|message| {
                message.text.to_lowercase().contains(&needle)
                    || message.author_name.to_lowercase().contains(&needle)
            })
            .take(SEARCH_RESULT_LIMIT)
            .cloned()
            .collect()
    }

    /// Toggle `(emoji, identity)` on a retained message and return the
    /// resulting reaction list.
    pub fn toggle_reaction(
        &mut self,
        message_id: &str,
        emoji: &str,
        identity: &Identity,
    ) -> Result<(ReactionToggle, Vec<Reaction>), CollabError> {
        let Some(message) = self.messages.iter_mut().find(|message| message.id == message_id)
        else {
            return Err(CollabError::MessageNotFound {
                channel: self.name.clone(),
                message_id: message_id.to_string(),
            });
        };

        let existing = message
            .reactions
            .iter()
            .position(|reaction| reaction.emoji == emoji && reaction.identity_id == identity.id);
        let toggle = match existing {
            Some(index) => {
                message.reactions.remove(index);
                ReactionToggle::Removed
            }
            None => {
                message.reactions.push(Reaction {
                    emoji: emoji.to_string(),
                    identity_id: identity.id.clone(),
                    display_name: identity.display_name.clone(),
                    created_at: Utc::now(),
                });
                ReactionToggle::Added
            }
        };
        self.last_activity = Utc::now();
        Ok((toggle, message.reactions.clone()))
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    pub fn appended_total(&self) -> u64 {
        self.appended_total
    }
}

pub type SharedChannelLog = Arc<Mutex<ChannelLog>>;

/// The fixed set of channel logs created at startup.
#[derive(Debug)]
pub struct ChannelStore {
    logs: HashMap<String, SharedChannelLog>,
}

impl ChannelStore {
    pub fn new(channels: &[String], capacity: usize) -> Self {
        let logs = channels
            .iter()
            .map(|name| {
                let log = ChannelLog::new(name.clone(), capacity);
                (name.clone(), Arc::new(Mutex::new(log)))
            })
            .collect();
        Self { logs }
    }

    pub fn log(&self, channel: &str) -> Result<SharedChannelLog, CollabError> {
        self.logs
            .get(channel)
            .cloned()
            .ok_or_else(|| CollabError::UnknownChannel(channel.to_string()))
    }
}
