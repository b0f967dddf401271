// Local mirror of a collaborative room.

use std::collections::{BTreeMap, BTreeSet};

use huddle_common::protocol::ServerEvent;
use huddle_common::types::{EditLockInfo, Operation, Participant};
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RoomView {
    room_id: String,
    document: Value,
    last_seq: u64,
    recent: Vec<Operation>,
    participants: Vec<Participant>,
    locks: BTreeMap<String, EditLockInfo>,
    held: BTreeSet<String>,
    denied: BTreeMap<String, Option<String>>,
}

impl RoomView {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            document: Value::Object(Default::default()),
            last_seq: 0,
            recent: Vec::new(),
            participants: Vec::new(),
            locks: BTreeMap::new(),
            held: BTreeSet::new(),
            denied: BTreeMap::new(),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Operations seen since joining, oldest first.
    pub fn operations(&self) -> &[Operation] {
        &self.recent
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn locks(&self) -> &BTreeMap<String, EditLockInfo> {
        &self.locks
    }

    /// Fields this session currently holds a lock on.
    pub fn holds(&self, field: &str) -> bool {
        self.held.contains(field)
    }

    /// Display name of the holder that beat the last request for `field`.
    pub fn denied_by(&self, field: &str) -> Option<&str> {
        self.denied.get(field).and_then(|holder| holder.as_deref())
    }

    pub(crate) fn release_local(&mut self, field: &str) {
        self.held.remove(field);
    }

    /// Fold a room-scoped server event into the mirror. Events for other
    /// rooms are ignored.
    pub fn apply(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::CollaborativeStateSync {
                room_id,
                shared_document,
                operation_history,
                participants,
                edit_locks,
            } if *room_id == self.room_id => {
                self.document = shared_document.clone();
                self.last_seq = operation_history.last().map(|op| op.seq).unwrap_or(0);
                self.recent = operation_history.clone();
                self.participants = participants.clone();
                self.locks = edit_locks.clone();
            }
            ServerEvent::OperationApplied { room_id, operation, shared_document }
                if *room_id == self.room_id =>
            {
                if self.last_seq != 0 && operation.seq != self.last_seq + 1 {
                    warn!(
                        room_id = %self.room_id,
                        expected = self.last_seq + 1,
                        received = operation.seq,
                        "operation sequence gap"
                    );
                }
                self.document = shared_document.clone();
                self.last_seq = self.last_seq.max(operation.seq);
                self.recent.push(operation.clone());
            }
            ServerEvent::EditLockResponse {
                room_id, success, field, current_holder, ..
            } if *room_id == self.room_id => {
                if *success {
                    self.held.insert(field.clone());
                    self.denied.remove(field);
                } else {
                    debug!(room_id = %self.room_id, field = %field, "edit lock denied");
                    self.denied.insert(field.clone(), current_holder.clone());
                }
            }
            ServerEvent::FieldLocked { room_id, field, identity_id, display_name }
                if *room_id == self.room_id =>
            {
                self.locks.insert(
                    field.clone(),
                    EditLockInfo {
                        identity_id: identity_id.clone(),
                        display_name: display_name.clone(),
                        acquired_at: chrono::Utc::now(),
                    },
                );
            }
            ServerEvent::FieldUnlocked { room_id, field, .. } if *room_id == self.room_id => {
                self.locks.remove(field);
                self.denied.remove(field);
            }
            ServerEvent::ParticipantJoined { room_id, participant } if *room_id == self.room_id => {
                self.participants.retain(|p| p.identity_id != participant.identity_id);
                self.participants.push(participant.clone());
            }
            ServerEvent::ParticipantLeft { room_id, identity_id, .. }
                if *room_id == self.room_id =>
            {
                self.participants.retain(|p| p.identity_id != *identity_id);
            }
            ServerEvent::ParticipantsUpdated { room_id, participants }
                if *room_id == self.room_id =>
            {
                self.participants = participants.clone();
            }
            ServerEvent::PresenceUpdated { room_id, identity_id, presence_data, timestamp }
                if *room_id == self.room_id =>
            {
                if let Some(participant) =
                    self.participants.iter_mut().find(|p| p.identity_id == *identity_id)
                {
                    if presence_data.cursor.is_some() {
                        participant.cursor = presence_data.cursor.clone();
                    }
                    if presence_data.selection.is_some() {
                        participant.selection = presence_data.selection.clone();
                    }
                    if let Some(active) = presence_data.is_active {
                        participant.is_active = active;
                    }
                    participant.last_activity_at = *timestamp;
                }
            }
            ServerEvent::UserActivityUpdated { room_id, identity_id, is_active, timestamp }
                if *room_id == self.room_id =>
            {
                if let Some(participant) =
                    self.participants.iter_mut().find(|p| p.identity_id == *identity_id)
                {
                    participant.is_active = *is_active;
                    participant.last_activity_at = *timestamp;
                }
            }
            _ => {}
        }
    }
}
