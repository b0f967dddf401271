// Named events exchanged over the huddle.v1 WebSocket protocol.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::{
    ChatMessage, EditLockInfo, MemberInfo, Operation, OperationRequest, Participant, PresenceData,
    Reaction,
};

/// Events a client may send to the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    /// Bind an identity to the connection without joining a channel.
    UserJoin { identity_id: String, display_name: String },

    JoinChannel { channel: String, identity_id: String, display_name: String },

    LeaveChannel { channel: String, identity_id: String },

    SendMessage {
        channel: String,
        identity_id: String,
        display_name: String,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
    },

    TypingStart { channel: String, identity_id: String, display_name: String },

    TypingStop { channel: String, identity_id: String, display_name: String },

    /// Toggle `(emoji, identity_id)` on a message.
    AddReaction {
        message_id: String,
        channel: String,
        emoji: String,
        identity_id: String,
        display_name: String,
    },

    GetChannelActivity {},

    SearchMessages { channel: String, query: String },

    JoinCollaborativeRoom { room_id: String, identity_id: String, display_name: String },

    LeaveCollaborativeRoom { room_id: String, identity_id: String },

    CollaborativeOperation { room_id: String, operation: OperationRequest },

    RequestEditLock {
        room_id: String,
        #[serde(alias = "field")]
        field_key: String,
        identity_id: String,
    },

    ReleaseEditLock {
        room_id: String,
        #[serde(alias = "field")]
        field_key: String,
        identity_id: String,
    },

    UpdatePresence { room_id: String, identity_id: String, presence_data: PresenceData },

    UserActivityChange { room_id: String, identity_id: String, is_active: bool },

    /// Liveness probe. `client_timestamp` is milliseconds since the epoch.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_timestamp: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        platform: Option<String>,
    },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::UserJoin { .. } => "user_join",
            Self::JoinChannel { .. } => "join_channel",
            Self::LeaveChannel { .. } => "leave_channel",
            Self::SendMessage { .. } => "send_message",
            Self::TypingStart { .. } => "typing_start",
            Self::TypingStop { .. } => "typing_stop",
            Self::AddReaction { .. } => "add_reaction",
            Self::GetChannelActivity {} => "get_channel_activity",
            Self::SearchMessages { .. } => "search_messages",
            Self::JoinCollaborativeRoom { .. } => "join_collaborative_room",
            Self::LeaveCollaborativeRoom { .. } => "leave_collaborative_room",
            Self::CollaborativeOperation { .. } => "collaborative_operation",
            Self::RequestEditLock { .. } => "request_edit_lock",
            Self::ReleaseEditLock { .. } => "release_edit_lock",
            Self::UpdatePresence { .. } => "update_presence",
            Self::UserActivityChange { .. } => "user_activity_change",
            Self::Ping { .. } => "ping",
        }
    }
}

/// Events the relay sends to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    ConnectionConfirmed { connection_id: Uuid, timestamp: DateTime<Utc>, protocol_version: String },

    ChannelsList(Vec<String>),

    /// Snapshot for a channel the connection just joined.
    ChannelJoined {
        channel: String,
        messages: Vec<ChatMessage>,
        members: Vec<MemberInfo>,
        member_count: usize,
    },

    NewMessage(ChatMessage),

    MentionNotification { message: ChatMessage, channel: String, timestamp: DateTime<Utc> },

    UserJoinedChannel {
        channel: String,
        identity_id: String,
        display_name: String,
        timestamp: DateTime<Utc>,
    },

    UserLeftChannel {
        channel: String,
        identity_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        timestamp: DateTime<Utc>,
    },

    ChannelUsersUpdated { channel: String, members: Vec<MemberInfo>, member_count: usize },

    UserTyping { channel: String, identity_id: String, display_name: String, is_typing: bool },

    MessageReactionUpdated { message_id: String, channel: String, reactions: Vec<Reaction> },

    ChannelActivity(BTreeMap<String, crate::types::ChannelActivity>),

    SearchResults { channel: String, query: String, messages: Vec<ChatMessage> },

    /// Snapshot for a room the connection just joined.
    CollaborativeStateSync {
        room_id: String,
        shared_document: Value,
        operation_history: Vec<Operation>,
        participants: Vec<Participant>,
        edit_locks: BTreeMap<String, EditLockInfo>,
    },

    OperationApplied { room_id: String, operation: Operation, shared_document: Value },

    EditLockResponse {
        room_id: String,
        success: bool,
        field: String,
        /// Display name of the holder when the request lost.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_holder: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_holder_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    FieldLocked { room_id: String, field: String, identity_id: String, display_name: String },

    FieldUnlocked { room_id: String, field: String, identity_id: String },

    ParticipantJoined { room_id: String, participant: Participant },

    ParticipantLeft {
        room_id: String,
        identity_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },

    ParticipantsUpdated { room_id: String, participants: Vec<Participant> },

    PresenceUpdated {
        room_id: String,
        identity_id: String,
        presence_data: PresenceData,
        timestamp: DateTime<Utc>,
    },

    UserActivityUpdated {
        room_id: String,
        identity_id: String,
        is_active: bool,
        timestamp: DateTime<Utc>,
    },

    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_timestamp: Option<i64>,
        server_timestamp: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        platform: Option<String>,
    },

    ClientsCount { count: usize },

    /// A recoverable failure scoped to the requesting connection.
    Error {
        code: String,
        message: String,
        retryable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectionConfirmed { .. } => "connection_confirmed",
            Self::ChannelsList(_) => "channels_list",
            Self::ChannelJoined { .. } => "channel_joined",
            Self::NewMessage(_) => "new_message",
            Self::MentionNotification { .. } => "mention_notification",
            Self::UserJoinedChannel { .. } => "user_joined_channel",
            Self::UserLeftChannel { .. } => "user_left_channel",
            Self::ChannelUsersUpdated { .. } => "channel_users_updated",
            Self::UserTyping { .. } => "user_typing",
            Self::MessageReactionUpdated { .. } => "message_reaction_updated",
            Self::ChannelActivity(_) => "channel_activity",
            Self::SearchResults { .. } => "search_results",
            Self::CollaborativeStateSync { .. } => "collaborative_state_sync",
            Self::OperationApplied { .. } => "operation_applied",
            Self::EditLockResponse { .. } => "edit_lock_response",
            Self::FieldLocked { .. } => "field_locked",
            Self::FieldUnlocked { .. } => "field_unlocked",
            Self::ParticipantJoined { .. } => "participant_joined",
            Self::ParticipantLeft { .. } => "participant_left",
            Self::ParticipantsUpdated { .. } => "participants_updated",
            Self::PresenceUpdated { .. } => "presence_updated",
            Self::UserActivityUpdated { .. } => "user_activity_updated",
            Self::Pong { .. } => "pong",
            Self::ClientsCount { .. } => "clients_count",
            Self::Error { .. } => "error",
        }
    }
}
