// Durable per-device message history.
//
// The session only talks to the `MessageCache` trait; platform builds plug
// in their own storage. `MemoryMessageCache` backs tests and headless use.

use std::collections::HashMap;

use huddle_common::types::ChatMessage;

/// Maximum number of results returned by [`MessageCache::search`].
pub const SEARCH_LIMIT: usize = 50;

pub trait MessageCache: Send {
    /// Insert a message, replacing any stored message with the same id.
    fn upsert(&mut self, message: ChatMessage);

    /// Drop a message. Unknown ids are ignored.
    fn remove(&mut self, channel: &str, id: &str);

    /// All cached messages of a channel, oldest first.
    fn messages(&self, channel: &str) -> Vec<ChatMessage>;

    /// Case-insensitive match on text or author name, newest first, at most
    /// [`SEARCH_LIMIT`] results.
    fn search(&self, channel: &str, query: &str) -> Vec<ChatMessage> {
        let needle = query.to_lowercase();
        let mut hits: Vec<ChatMessage> = self
            .messages(channel)
            .into_iter()
            .filter(|message| {
                message.text.to_lowercase().contains(&needle)
                    || message.author_name.to_lowercase().contains(&needle)
            })
            .collect();
        hits.reverse();
        hits.truncate(SEARCH_LIMIT);
        hits
    }
}

#[derive(Debug, Default)]
pub struct MemoryMessageCache {
    channels: HashMap<String, Vec<ChatMessage>>,
}

impl MemoryMessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.channels.values().map(Vec::len).sum()
    }
}

impl MessageCache for MemoryMessageCache {
    fn upsert(&mut self, message: ChatMessage) {
        let entries = self.channels.entry(message.channel.clone()).or_default();
        match entries.iter_mut().find(|existing| existing.id == message.id) {
            Some(existing) => *existing = message,
            None => entries.push(message),
        }
    }

    fn remove(&mut self, channel: &str, id: &str) {
        if let Some(entries) = self.channels.get_mut(channel) {
            entries.retain(|message| message.id != id);
        }
    }

    fn messages(&self, channel: &str) -> Vec<ChatMessage> {
        let mut messages = self.channels.get(channel).cloned().unwrap_or_default();
        messages.sort_by_key(|message| message.created_at);
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn message(id: &str, author: &str, text: &str, offset_secs: i64) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            channel: "general".to_string(),
            author_id: author.to_lowercase(),
            author_name: author.to_string(),
            text: text.to_string(),
            created_at: Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
                + Duration::seconds(offset_secs),
            client_correlation_id: None,
            mentions: Vec::new(),
            reactions: Vec::new(),
        }
    }

    #[test]
    fn messages_are_returned_oldest_first() {
        let mut cache = MemoryMessageCache::new();
        cache.upsert(message("m2", "Bob", "second", 10));
        cache.upsert(message("m1", "Alice", "first", 0));

        let ids: Vec<String> = cache.messages("general").into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
        assert!(cache.messages("random").is_empty());
    }

    #[test]
    fn upsert_replaces_by_id_and_remove_drops() {
        let mut cache = MemoryMessageCache::new();
        cache.upsert(message("m1", "Alice", "draft", 0));
        cache.upsert(message("m1", "Alice", "final", 0));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.messages("general")[0].text, "final");

        cache.remove("general", "m1");
        cache.remove("general", "missing");
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn search_matches_text_or_author_newest_first() {
        let mut cache = MemoryMessageCache::new();
        cache.upsert(message("m1", "Alice", "Deploy went fine", 0));
        cache.upsert(message("m2", "Bob", "lunch?", 5));
        cache.upsert(message("m3", "Deployer", "ok", 10));

        let ids: Vec<String> =
            cache.search("general", "DEPLOY").into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["m3", "m1"]);
    }

    #[test]
    fn search_is_capped() {
        let mut cache = MemoryMessageCache::new();
        for i in 0..80 {
            cache.upsert(message(&format!("m{i}"), "Alice", "standup notes", i));
        }

        let hits = cache.search("general", "standup");
        assert_eq!(hits.len(), SEARCH_LIMIT);
        assert_eq!(hits[0].id, "m79");
    }
}
