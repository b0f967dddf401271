// Client-side view of one channel with optimistic message reconciliation.
//
// Outgoing messages are shown immediately as provisional entries whose id is
// the client correlation id. Inbound server copies are matched in order:
//   1. same server id already present      -> discard
//   2. correlation id of a provisional     -> replace in place
//   3. own provisional, same text, < 5 s   -> replace in place (heuristic)
//   4. anything else                       -> append
// Tier 3 can pick the wrong entry when identical text is sent twice within
// the tolerance. It is counted and logged so its frequency stays visible.

use chrono::{DateTime, TimeDelta, Utc};
use huddle_common::types::{ChatMessage, Reaction};
use tracing::info;

/// Maximum timestamp distance for the text fallback match.
pub const RECONCILE_TOLERANCE: TimeDelta = TimeDelta::seconds(5);

/// A provisional message carries its own correlation id as its id until the
/// server copy replaces it.
pub fn is_provisional(message: &ChatMessage) -> bool {
    message.client_correlation_id.as_deref() == Some(message.id.as_str())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub message: ChatMessage,
    pub delivered: bool,
}

impl Entry {
    fn from_message(message: ChatMessage) -> Self {
        let delivered = !is_provisional(&message);
        Self { message, delivered }
    }
}

/// How an inbound message was merged into the timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    Duplicate,
    /// Replaced the provisional entry `replaced` via its correlation id.
    Confirmed { index: usize, replaced: String },
    /// Replaced the provisional entry `replaced` via the text fallback.
    Matched { index: usize, replaced: String },
    Appended { index: usize },
}

impl Reconciled {
    /// Id of the provisional entry that was superseded, if any.
    pub fn replaced(&self) -> Option<&str> {
        match self {
            Self::Confirmed { replaced, .. } | Self::Matched { replaced, .. } => Some(replaced),
            Self::Duplicate | Self::Appended { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Timeline {
    local_identity: String,
    entries: Vec<Entry>,
    tolerance: TimeDelta,
    heuristic_matches: u64,
}

impl Timeline {
    pub fn new(local_identity: impl Into<String>) -> Self {
        Self {
            local_identity: local_identity.into(),
            entries: Vec::new(),
            tolerance: RECONCILE_TOLERANCE,
            heuristic_matches: 0,
        }
    }

    /// Build a timeline from server history merged with locally cached
    /// messages.
    ///
    /// Messages are deduplicated by id (server copy wins) and ordered by
    /// creation time. Cached provisional entries survive unless a server
    /// message already carries their correlation id.
    pub fn from_history(
        local_identity: impl Into<String>,
        server: Vec<ChatMessage>,
        cached: Vec<ChatMessage>,
    ) -> Self {
        let mut merged: Vec<ChatMessage> = Vec::with_capacity(server.len() + cached.len());
        for message in server.into_iter().chain(cached) {
            if merged.iter().any(|existing| existing.id == message.id) {
                continue;
            }
            merged.push(message);
        }

        let confirmed: Vec<String> = merged
            .iter()
            .filter(|message| !is_provisional(message))
            .filter_map(|message| message.client_correlation_id.clone())
            .collect();
        merged.retain(|message| !is_provisional(message) || !confirmed.contains(&message.id));
        merged.sort_by_key(|message| message.created_at);

        let mut timeline = Self::new(local_identity);
        timeline.entries = merged.into_iter().map(Entry::from_message).collect();
        timeline
    }

    pub fn with_tolerance(mut self, tolerance: TimeDelta) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.entries.iter().map(|entry| &entry.message)
    }

    /// Provisional entries still waiting for their server copy.
    pub fn pending(&self) -> impl Iterator<Item = &ChatMessage> {
        self.entries.iter().filter(|entry| !entry.delivered).map(|entry| &entry.message)
    }

    pub fn heuristic_matches(&self) -> u64 {
        self.heuristic_matches
    }

    pub fn push_provisional(&mut self, message: ChatMessage) {
        self.entries.push(Entry { message, delivered: false });
    }

    pub fn apply_inbound(&mut self, message: ChatMessage) -> Reconciled {
        if self.entries.iter().any(|entry| entry.message.id == message.id) {
            return Reconciled::Duplicate;
        }

        if let Some(correlation_id) = message.client_correlation_id.as_deref() {
            if let Some(index) = self
                .entries
                .iter()
                .position(|entry| !entry.delivered && entry.message.id == correlation_id)
            {
                let replaced = self.replace(index, message);
                return Reconciled::Confirmed { index, replaced };
            }
        }

        if let Some(index) = self.fallback_match(&message) {
            self.heuristic_matches += 1;
            info!(
                channel = %message.channel,
                message_id = %message.id,
                provisional_id = %self.entries[index].message.id,
                heuristic_matches = self.heuristic_matches,
                "reconciled message by text and timestamp fallback"
            );
            let replaced = self.replace(index, message);
            return Reconciled::Matched { index, replaced };
        }

        self.entries.push(Entry { message, delivered: true });
        Reconciled::Appended { index: self.entries.len() - 1 }
    }

    /// Replace the reaction set of a message. Returns false when the message
    /// is not in view.
    pub fn update_reactions(&mut self, message_id: &str, reactions: Vec<Reaction>) -> bool {
        match self.entries.iter_mut().find(|entry| entry.message.id == message_id) {
            Some(entry) => {
                entry.message.reactions = reactions;
                true
            }
            None => false,
        }
    }

    fn fallback_match(&self, inbound: &ChatMessage) -> Option<usize> {
        if inbound.author_id != self.local_identity {
            return None;
        }
        self.entries.iter().rposition(|entry| {
            !entry.delivered
                && entry.message.author_id == self.local_identity
                && entry.message.text == inbound.text
                && within(entry.message.created_at, inbound.created_at, self.tolerance)
        })
    }

    fn replace(&mut self, index: usize, message: ChatMessage) -> String {
        let previous = std::mem::replace(&mut self.entries[index], Entry { message, delivered: true });
        previous.message.id
    }
}

fn within(a: DateTime<Utc>, b: DateTime<Utc>, tolerance: TimeDelta) -> bool {
    (a - b).abs() < tolerance
}
