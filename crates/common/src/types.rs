// Core domain types shared by the relay and its clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A participant identity as supplied by the client.
///
/// The relay does not authenticate identities; `id` is opaque and
/// `display_name` is untrusted display text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    pub display_name: String,
}

impl Identity {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self { id: id.into(), display_name: display_name.into() }
    }
}

/// An emoji reaction attached to a chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub emoji: String,
    pub identity_id: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

/// A chat message as stored in a channel log and sent over the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Server-assigned id. Provisional client entries carry their
    /// correlation id here until the server copy replaces them.
    pub id: String,
    pub channel: String,
    pub author_id: String,
    pub author_name: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_correlation_id: Option<String>,
    /// Raw `@token` mentions found in `text`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reactions: Vec<Reaction>,
}

/// Channel membership entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    pub identity_id: String,
    pub display_name: String,
    pub joined_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// A participant of a collaborative room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub identity_id: String,
    pub display_name: String,
    pub connection_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Value>,
    pub last_activity_at: DateTime<Utc>,
    pub is_active: bool,
}

/// Presence fields a participant may update (cursor, selection, activity).
///
/// Absent fields leave the stored value untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

/// The mutation carried by a collaborative operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum OperationKind {
    /// Set `value` at a dotted `path`, creating intermediate objects.
    SetValue { path: String, value: Value },
    /// Merge `updates` into the task record, stamping modification metadata.
    UpdateTask { task_id: String, updates: Value },
    /// Insert (or overwrite) a task record.
    AddTask { task_id: String, task: Value },
    /// Remove a task record.
    DeleteTask { task_id: String },
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetValue { .. } => "SET_VALUE",
            Self::UpdateTask { .. } => "UPDATE_TASK",
            Self::AddTask { .. } => "ADD_TASK",
            Self::DeleteTask { .. } => "DELETE_TASK",
        }
    }
}

/// An operation as submitted by a client, before sequencing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationRequest {
    #[serde(flatten)]
    pub kind: OperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<String>,
}

/// A server-sequenced operation applied to a room's shared document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Room-scoped sequence number, strictly increasing and gap-free.
    pub seq: u64,
    #[serde(flatten)]
    pub kind: OperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Current holder of a field edit lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EditLockInfo {
    pub identity_id: String,
    pub display_name: String,
    pub acquired_at: DateTime<Utc>,
}

/// Per-channel activity summary used for unread indicators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelActivity {
    pub last_activity: DateTime<Utc>,
    pub message_count: usize,
    pub user_count: usize,
}
