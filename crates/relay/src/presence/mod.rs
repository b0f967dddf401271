// Presence and membership for channels and collaborative rooms.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use huddle_common::types::{Identity, MemberInfo, Participant, PresenceData};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use crate::error::CollabError;
use crate::hub::ConnectionId;

/// One identity present in a channel or room.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub identity_id: String,
    pub display_name: String,
    pub connection_id: ConnectionId,
    pub joined_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub cursor: Option<Value>,
    pub selection: Option<Value>,
    pub is_active: bool,
}

impl Member {
    pub fn info(&self) -> MemberInfo {
        MemberInfo {
            identity_id: self.identity_id.clone(),
            display_name: self.display_name.clone(),
            joined_at: self.joined_at,
            last_seen: self.last_seen,
        }
    }

    pub fn participant(&self) -> Participant {
        Participant {
            identity_id: self.identity_id.clone(),
            display_name: self.display_name.clone(),
            connection_id: self.connection_id,
            cursor: self.cursor.clone(),
            selection: self.selection.clone(),
            last_activity_at: self.last_seen,
            is_active: self.is_active,
        }
    }
}

/// Member set of a single channel or room, keyed by identity id.
#[derive(Debug, Default)]
pub struct GroupPresence {
    members: BTreeMap<String, Member>,
}

impl GroupPresence {
    /// Upsert membership. Returns `true` when the identity was not present
    /// before. A rejoin keeps `joined_at` and moves the member to the new
    /// connection.
    pub fn join(&mut self, identity: &Identity, connection_id: ConnectionId) -> bool {
        let now = Utc::now();
        match self.members.get_mut(&identity.id) {
            Some(existing) => {
                existing.display_name = identity.display_name.clone();
                existing.connection_id = connection_id;
                existing.last_seen = now;
                existing.is_active = true;
                false
            }
            None => {
                self.members.insert(
                    identity.id.clone(),
                    Member {
                        identity_id: identity.id.clone(),
                        display_name: identity.display_name.clone(),
                        connection_id,
                        joined_at: now,
                        last_seen: now,
                        cursor: None,
                        selection: None,
                        is_active: true,
                    },
                );
                true
            }
        }
    }

    /// Remove an identity; absent identities are a no-op.
    pub fn leave(&mut self, identity_id: &str) -> Option<Member> {
        self.members.remove(identity_id)
    }

    /// Remove every member bound to `connection_id`. Members that have
    /// since moved to another connection are left alone.
    pub fn remove_connection(&mut self, connection_id: ConnectionId) -> Vec<Member> {
        let departing: Vec<String> = self
            .members
            .values()
            .filter(|member| member.connection_id == connection_id)
            .map(|member| member.identity_id.clone())
            .collect();

        departing.iter().filter_map(|identity_id| self.members.remove(identity_id)).collect()
    }

    pub fn member(&self, identity_id: &str) -> Option<&Member> {
        self.members.get(identity_id)
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn member_infos(&self) -> Vec<MemberInfo> {
        self.members.values().map(Member::info).collect()
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.members.values().map(Member::participant).collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn touch(&mut self, identity_id: &str) {
        if let Some(member) = self.members.get_mut(identity_id) {
            member.last_seen = Utc::now();
        }
    }

    /// Apply the fields present in `data`. Returns `false` for non-members.
    pub fn update_presence(&mut self, identity_id: &str, data: &PresenceData) -> bool {
        let Some(member) = self.members.get_mut(identity_id) else {
            return false;
        };
        if let Some(cursor) = data.cursor.as_ref() {
            member.cursor = Some(cursor.clone());
        }
        if let Some(selection) = data.selection.as_ref() {
            member.selection = Some(selection.clone());
        }
        if let Some(is_active) = data.is_active {
            member.is_active = is_active;
        }
        member.last_seen = Utc::now();
        true
    }

    pub fn set_active(&mut self, identity_id: &str, is_active: bool) -> bool {
        let Some(member) = self.members.get_mut(identity_id) else {
            return false;
        };
        member.is_active = is_active;
        member.last_seen = Utc::now();
        true
    }
}

pub type SharedPresence = Arc<Mutex<GroupPresence>>;

/// Registry of every channel and room member set. Channels are fixed at
/// construction; rooms appear on first join.
#[derive(Debug)]
pub struct PresenceRegistry {
    channel_names: Vec<String>,
    channels: HashMap<String, SharedPresence>,
    rooms: RwLock<HashMap<String, SharedPresence>>,
}

impl PresenceRegistry {
    pub fn new(channels: &[String]) -> Self {
        let map = channels
            .iter()
            .map(|name| (name.clone(), Arc::new(Mutex::new(GroupPresence::default()))))
            .collect();
        Self { channel_names: channels.to_vec(), channels: map, rooms: RwLock::default() }
    }

    pub fn channel_names(&self) -> &[String] {
        &self.channel_names
    }

    pub fn channel(&self, name: &str) -> Result<SharedPresence, CollabError> {
        self.channels
            .get(name)
            .cloned()
            .ok_or_else(|| CollabError::UnknownChannel(name.to_string()))
    }

    pub async fn open_room(&self, room_id: &str) -> SharedPresence {
        if let Some(existing) = self.rooms.read().await.get(room_id) {
            return Arc::clone(existing);
        }
        let mut guard = self.rooms.write().await;
        Arc::clone(guard.entry(room_id.to_string()).or_default())
    }

    pub async fn room(&self, room_id: &str) -> Option<SharedPresence> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// `(identity_id, display_name)` of every member of every channel,
    /// deduplicated by identity. Locks one channel at a time.
    pub async fn known_channel_members(&self) -> Vec<(String, String)> {
        let mut seen: BTreeMap<String, String> = BTreeMap::new();
        for name in &self.channel_names {
            let Some(group) = self.channels.get(name) else {
                continue;
            };
            let guard = group.lock().await;
            for member in guard.members() {
                seen.entry(member.identity_id.clone())
                    .or_insert_with(|| member.display_name.clone());
            }
        }
        seen.into_iter().collect()
    }

    /// Number of members per channel, for activity summaries.
    pub async fn channel_member_count(&self, name: &str) -> Result<usize, CollabError> {
        let group = self.channel(name)?;
        let count = group.lock().await.len();
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn registry() -> PresenceRegistry {
        PresenceRegistry::new(&["general".to_string(), "random".to_string()])
    }

    #[tokio::test]
    async fn unknown_channel_is_rejected() {
        let error = registry().channel("lobby").expect_err("lobby was never created");
        assert_eq!(error, CollabError::UnknownChannel("lobby".to_string()));
    }

    #[tokio::test]
    async fn join_is_an_upsert_and_leave_is_idempotent() {
        let registry = registry();
        let general = registry.channel("general").expect("general exists");
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        let mut group = general.lock().await;
        assert!(group.join(&Identity::new("alice", "Alice"), first));
        let joined_at = group.member("alice").expect("alice joined").joined_at;
        assert!(!group.join(&Identity::new("alice", "Alice L"), second));

        let member = group.member("alice").expect("alice still joined");
        assert_eq!(member.joined_at, joined_at);
        assert_eq!(member.display_name, "Alice L");
        assert_eq!(member.connection_id, second);
        assert_eq!(group.len(), 1);

        assert!(group.leave("alice").is_some());
        assert!(group.leave("alice").is_none());
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn remove_connection_spares_members_that_moved() {
        let mut group = GroupPresence::default();
        let old = Uuid::new_v4();
        let new = Uuid::new_v4();
        group.join(&Identity::new("alice", "Alice"), old);
        group.join(&Identity::new("bob", "Bob"), old);
        group.join(&Identity::new("alice", "Alice"), new);

        let removed = group.remove_connection(old);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].identity_id, "bob");
        assert!(group.member("alice").is_some());
    }

    #[tokio::test]
    async fn presence_updates_only_touch_supplied_fields() {
        let mut group = GroupPresence::default();
        group.join(&Identity::new("alice", "Alice"), Uuid::new_v4());

        let data = PresenceData { cursor: Some(json!({ "x": 4 })), ..PresenceData::default() };
        assert!(group.update_presence("alice", &data));
        let data = PresenceData { is_active: Some(false), ..PresenceData::default() };
        assert!(group.update_presence("alice", &data));
        assert!(!group.update_presence("nobody", &data));

        let participant = group.participants().pop().expect("one participant");
        assert_eq!(participant.cursor, Some(json!({ "x": 4 })));
        assert!(!participant.is_active);
    }

    #[tokio::test]
    async fn known_members_span_channels_once() {
        let registry = registry();
        let conn = Uuid::new_v4();
        for channel in ["general", "random"] {
            let group = registry.channel(channel).expect("channel exists");
            group.lock().await.join(&Identity::new("alice", "Alice"), conn);
        }
        registry
            .channel("random")
            .expect("random exists")
            .lock()
            .await
            .join(&Identity::new("bob", "Bob T"), conn);

        let known = registry.known_channel_members().await;
        assert_eq!(
            known,
            vec![
                ("alice".to_string(), "Alice".to_string()),
                ("bob".to_string(), "Bob T".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn rooms_are_created_lazily() {
        let registry = registry();
        assert!(registry.room("planning").await.is_none());
        let opened = registry.open_room("planning").await;
        let again = registry.open_room("planning").await;
        assert!(Arc::ptr_eq(&opened, &again));
        assert!(registry.room("planning").await.is_some());
    }
}
