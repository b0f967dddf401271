// Chat session state machine.
//
// Owns everything a client needs to render chat and collaborative rooms:
// the reconciled channel timeline, unread counters, mention inbox, typing
// set, member list, room mirrors and connection state. It performs no I/O.
// Outgoing frames are buffered and drained by the driver, which feeds
// inbound events back through `handle_event`.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use chrono::Utc;
use huddle_common::protocol::{ClientEvent, ServerEvent};
use huddle_common::types::{
    ChannelActivity, ChatMessage, Identity, MemberInfo, OperationKind, OperationRequest,
    PresenceData,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::MessageCache;
use crate::error::ClientError;
use crate::liveness::{LivenessTracker, PongOutcome};
use crate::outbox::{OfflineQueue, QueuedMessage};
use crate::reconcile::{Reconciled, Timeline};
use crate::room::RoomView;

// ── Reconnection ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the attempt following `failures` consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exp = failures.min(7);
        self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Retries exhausted. Outgoing chat messages keep queueing.
    GaveUp,
}

// ── Session ─────────────────────────────────────────────────────────

pub struct ChatSession<C: MessageCache> {
    identity: Identity,
    platform: Option<String>,
    current_channel: String,
    channels: Vec<String>,
    timeline: Timeline,
    cache: C,
    outbox: OfflineQueue,
    outbound: VecDeque<ClientEvent>,
    unread: BTreeMap<String, usize>,
    mentions: Vec<ChatMessage>,
    typing: BTreeSet<String>,
    members: Vec<MemberInfo>,
    online_count: usize,
    activity: BTreeMap<String, ChannelActivity>,
    search_results: Vec<ChatMessage>,
    rooms: BTreeMap<String, RoomView>,
    liveness: LivenessTracker,
    last_ping_timestamp: i64,
    last_error: Option<(String, String)>,
    connection_id: Option<Uuid>,
    state: ConnectionState,
    policy: ReconnectPolicy,
    consecutive_failures: u32,
}

impl<C: MessageCache> ChatSession<C> {
    pub fn new(identity: Identity, channel: impl Into<String>, cache: C) -> Self {
        let channel = channel.into();
        let timeline = Timeline::from_history(identity.id.clone(), Vec::new(), cache.messages(&channel));
        Self {
            identity,
            platform: None,
            current_channel: channel,
            channels: Vec::new(),
            timeline,
            cache,
            outbox: OfflineQueue::new(),
            outbound: VecDeque::new(),
            unread: BTreeMap::new(),
            mentions: Vec::new(),
            typing: BTreeSet::new(),
            members: Vec::new(),
            online_count: 0,
            activity: BTreeMap::new(),
            search_results: Vec::new(),
            rooms: BTreeMap::new(),
            liveness: LivenessTracker::default(),
            last_ping_timestamp: 0,
            last_error: None,
            connection_id: None,
            state: ConnectionState::Disconnected,
            policy: ReconnectPolicy::default(),
            consecutive_failures: 0,
        }
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn with_liveness(mut self, liveness: LivenessTracker) -> Self {
        self.liveness = liveness;
        self
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn connection_id(&self) -> Option<Uuid> {
        self.connection_id
    }

    pub fn current_channel(&self) -> &str {
        &self.current_channel
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    pub fn queued(&self) -> &OfflineQueue {
        &self.outbox
    }

    pub fn unread(&self, channel: &str) -> usize {
        self.unread.get(channel).copied().unwrap_or(0)
    }

    pub fn mentions(&self) -> &[ChatMessage] {
        &self.mentions
    }

    pub fn clear_mentions(&mut self) {
        self.mentions.clear();
    }

    /// Identity ids currently typing in the active channel.
    pub fn typing(&self) -> &BTreeSet<String> {
        &self.typing
    }

    pub fn members(&self) -> &[MemberInfo] {
        &self.members
    }

    pub fn online_count(&self) -> usize {
        self.online_count
    }

    pub fn channel_activity(&self) -> &BTreeMap<String, ChannelActivity> {
        &self.activity
    }

    pub fn search_results(&self) -> &[ChatMessage] {
        &self.search_results
    }

    pub fn room(&self, room_id: &str) -> Option<&RoomView> {
        self.rooms.get(room_id)
    }

    pub fn liveness(&self) -> &LivenessTracker {
        &self.liveness
    }

    /// Code and message of the most recent relay error event.
    pub fn last_error(&self) -> Option<(&str, &str)> {
        self.last_error.as_ref().map(|(code, message)| (code.as_str(), message.as_str()))
    }

    // ── Connection lifecycle ────────────────────────────────────────

    pub fn connecting(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    /// The socket is open. Re-announce the identity, rejoin the active
    /// channel and rooms, then replay the offline queue in order.
    pub fn on_connected(&mut self) {
        self.state = ConnectionState::Connected;
        self.consecutive_failures = 0;

        self.outbound.push_back(ClientEvent::UserJoin {
            identity_id: self.identity.id.clone(),
            display_name: self.identity.display_name.clone(),
        });
        self.outbound.push_back(self.join_event(&self.current_channel));
        for room_id in self.rooms.keys() {
            self.outbound.push_back(ClientEvent::JoinCollaborativeRoom {
                room_id: room_id.clone(),
                identity_id: self.identity.id.clone(),
                display_name: self.identity.display_name.clone(),
            });
        }

        let queued = self.outbox.drain();
        if !queued.is_empty() {
            info!(count = queued.len(), "replaying offline messages");
        }
        for message in queued {
            self.outbound.push_back(self.send_event(message));
        }
    }

    /// An established connection dropped.
    pub fn on_connection_lost(&mut self) {
        if self.state == ConnectionState::Connected || self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Disconnected;
        }
        self.connection_id = None;
        self.typing.clear();
        self.liveness.reset();
        self.restore_unsent();
    }

    /// A connection attempt failed. Returns the delay before the next
    /// attempt, or `None` once retries are exhausted.
    pub fn on_connect_failed(&mut self) -> Option<Duration> {
        self.consecutive_failures += 1;
        self.restore_unsent();
        if self.consecutive_failures >= self.policy.max_attempts {
            warn!(attempts = self.consecutive_failures, "giving up on relay connection");
            self.state = ConnectionState::GaveUp;
            return None;
        }
        self.state = ConnectionState::Disconnected;
        Some(self.reconnect_delay())
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.policy.delay_for(self.consecutive_failures)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Leave the `GaveUp` state so the driver tries again from scratch.
    pub fn resume(&mut self) {
        if self.state == ConnectionState::GaveUp {
            self.state = ConnectionState::Disconnected;
        }
        self.consecutive_failures = 0;
    }

    /// Frames ready for transmission, in order.
    pub fn drain_outbound(&mut self) -> Vec<ClientEvent> {
        self.outbound.drain(..).collect()
    }

    /// Hand back frames the driver could not write. Chat messages go back
    /// to the offline queue; everything else is dropped because it is
    /// either re-sent on connect or not queueable.
    pub fn return_unsent(&mut self, unsent: Vec<ClientEvent>) {
        let messages = unsent.into_iter().filter_map(queued_message).collect();
        self.outbox.restore(messages);
    }

    fn restore_unsent(&mut self) {
        let unsent: Vec<ClientEvent> = self.outbound.drain(..).collect();
        self.return_unsent(unsent);
    }

    // ── Chat actions ────────────────────────────────────────────────

    /// Send a chat message optimistically. The provisional entry appears in
    /// the timeline and cache immediately. Returns the correlation id.
    pub fn send_message(&mut self, text: &str) -> String {
        let correlation_id = format!("local-{}", Uuid::new_v4());
        let now = Utc::now();
        let provisional = ChatMessage {
            id: correlation_id.clone(),
            channel: self.current_channel.clone(),
            author_id: self.identity.id.clone(),
            author_name: self.identity.display_name.clone(),
            text: text.to_string(),
            created_at: now,
            client_correlation_id: Some(correlation_id.clone()),
            mentions: Vec::new(),
            reactions: Vec::new(),
        };
        self.timeline.push_provisional(provisional.clone());
        self.cache.upsert(provisional);

        let queued = QueuedMessage {
            correlation_id: correlation_id.clone(),
            channel: self.current_channel.clone(),
            text: text.to_string(),
            queued_at: now,
        };
        if self.is_connected() {
            self.outbound.push_back(self.send_event(queued));
        } else {
            debug!(correlation_id = %correlation_id, "queued message while offline");
            self.outbox.push(queued);
        }
        correlation_id
    }

    /// Make `channel` the active channel: leave the old one, clear the
    /// unread counter, show cached history and join the new one.
    pub fn switch_channel(&mut self, channel: &str) {
        if channel == self.current_channel {
            return;
        }
        if self.is_connected() {
            self.outbound.push_back(ClientEvent::LeaveChannel {
                channel: self.current_channel.clone(),
                identity_id: self.identity.id.clone(),
            });
        }

        self.current_channel = channel.to_string();
        self.unread.insert(channel.to_string(), 0);
        self.timeline =
            Timeline::from_history(self.identity.id.clone(), Vec::new(), self.cache.messages(channel));
        self.typing.clear();
        self.members.clear();

        if self.is_connected() {
            self.outbound.push_back(self.join_event(channel));
        }
    }

    pub fn start_typing(&mut self) -> Result<(), ClientError> {
        let event = ClientEvent::TypingStart {
            channel: self.current_channel.clone(),
            identity_id: self.identity.id.clone(),
            display_name: self.identity.display_name.clone(),
        };
        self.emit(event)
    }

    pub fn stop_typing(&mut self) -> Result<(), ClientError> {
        let event = ClientEvent::TypingStop {
            channel: self.current_channel.clone(),
            identity_id: self.identity.id.clone(),
            display_name: self.identity.display_name.clone(),
        };
        self.emit(event)
    }

    pub fn toggle_reaction(&mut self, message_id: &str, emoji: &str) -> Result<(), ClientError> {
        let event = ClientEvent::AddReaction {
            message_id: message_id.to_string(),
            channel: self.current_channel.clone(),
            emoji: emoji.to_string(),
            identity_id: self.identity.id.clone(),
            display_name: self.identity.display_name.clone(),
        };
        self.emit(event)
    }

    pub fn request_channel_activity(&mut self) -> Result<(), ClientError> {
        self.emit(ClientEvent::GetChannelActivity {})
    }

    pub fn search_remote(&mut self, query: &str) -> Result<(), ClientError> {
        let event = ClientEvent::SearchMessages {
            channel: self.current_channel.clone(),
            query: query.to_string(),
        };
        self.emit(event)
    }

    /// Search the local cache of the active channel.
    pub fn search_local(&self, query: &str) -> Vec<ChatMessage> {
        self.cache.search(&self.current_channel, query)
    }

    /// Send an application-level ping. Returns the client timestamp used.
    pub fn ping(&mut self) -> Result<i64, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::Disconnected);
        }
        let timestamp = Utc::now().timestamp_millis().max(self.last_ping_timestamp + 1);
        self.last_ping_timestamp = timestamp;
        self.liveness.record_ping(timestamp, Instant::now());
        self.outbound.push_back(ClientEvent::Ping {
            client_timestamp: Some(timestamp),
            platform: self.platform.clone(),
        });
        Ok(timestamp)
    }

    // ── Room actions ────────────────────────────────────────────────

    pub fn join_room(&mut self, room_id: &str) -> Result<(), ClientError> {
        let event = ClientEvent::JoinCollaborativeRoom {
            room_id: room_id.to_string(),
            identity_id: self.identity.id.clone(),
            display_name: self.identity.display_name.clone(),
        };
        self.emit(event)?;
        self.rooms.entry(room_id.to_string()).or_insert_with(|| RoomView::new(room_id));
        Ok(())
    }

    pub fn leave_room(&mut self, room_id: &str) -> Result<(), ClientError> {
        let event = ClientEvent::LeaveCollaborativeRoom {
            room_id: room_id.to_string(),
            identity_id: self.identity.id.clone(),
        };
        self.emit(event)?;
        self.rooms.remove(room_id);
        Ok(())
    }

    pub fn submit_operation(&mut self, room_id: &str, kind: OperationKind) -> Result<(), ClientError> {
        let event = ClientEvent::CollaborativeOperation {
            room_id: room_id.to_string(),
            operation: OperationRequest { kind, identity_id: Some(self.identity.id.clone()) },
        };
        self.emit(event)
    }

    pub fn request_edit_lock(&mut self, room_id: &str, field: &str) -> Result<(), ClientError> {
        let event = ClientEvent::RequestEditLock {
            room_id: room_id.to_string(),
            field_key: field.to_string(),
            identity_id: self.identity.id.clone(),
        };
        self.emit(event)
    }

    pub fn release_edit_lock(&mut self, room_id: &str, field: &str) -> Result<(), ClientError> {
        let event = ClientEvent::ReleaseEditLock {
            room_id: room_id.to_string(),
            field_key: field.to_string(),
            identity_id: self.identity.id.clone(),
        };
        self.emit(event)?;
        if let Some(room) = self.rooms.get_mut(room_id) {
            room.release_local(field);
        }
        Ok(())
    }

    pub fn update_presence(&mut self, room_id: &str, presence: PresenceData) -> Result<(), ClientError> {
        let event = ClientEvent::UpdatePresence {
            room_id: room_id.to_string(),
            identity_id: self.identity.id.clone(),
            presence_data: presence,
        };
        self.emit(event)
    }

    pub fn set_active(&mut self, room_id: &str, is_active: bool) -> Result<(), ClientError> {
        let event = ClientEvent::UserActivityChange {
            room_id: room_id.to_string(),
            identity_id: self.identity.id.clone(),
            is_active,
        };
        self.emit(event)
    }

    // ── Inbound ─────────────────────────────────────────────────────

    pub fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::ConnectionConfirmed { connection_id, protocol_version, .. } => {
                debug!(%connection_id, %protocol_version, "relay confirmed connection");
                self.connection_id = Some(connection_id);
            }
            ServerEvent::ChannelsList(channels) => self.channels = channels,
            ServerEvent::ChannelJoined { channel, messages, members, .. } => {
                self.on_channel_joined(channel, messages, members);
            }
            ServerEvent::NewMessage(message) => self.on_new_message(message),
            ServerEvent::MentionNotification { message, channel, .. } => {
                if channel != self.current_channel {
                    *self.unread.entry(channel).or_insert(0) += 1;
                }
                self.mentions.push(message);
            }
            ServerEvent::UserJoinedChannel { channel, identity_id, display_name, timestamp } => {
                if channel == self.current_channel
                    && !self.members.iter().any(|m| m.identity_id == identity_id)
                {
                    self.members.push(MemberInfo {
                        identity_id,
                        display_name,
                        joined_at: timestamp,
                        last_seen: timestamp,
                    });
                }
            }
            ServerEvent::UserLeftChannel { channel, identity_id, .. } => {
                if channel == self.current_channel {
                    self.members.retain(|m| m.identity_id != identity_id);
                    self.typing.remove(&identity_id);
                }
            }
            ServerEvent::ChannelUsersUpdated { channel, members, .. } => {
                if channel == self.current_channel {
                    self.members = members;
                }
            }
            ServerEvent::UserTyping { channel, identity_id, is_typing, .. } => {
                if channel == self.current_channel {
                    if is_typing {
                        self.typing.insert(identity_id);
                    } else {
                        self.typing.remove(&identity_id);
                    }
                }
            }
            ServerEvent::MessageReactionUpdated { message_id, channel, reactions } => {
                if channel == self.current_channel {
                    self.timeline.update_reactions(&message_id, reactions.clone());
                }
                if let Some(mut cached) =
                    self.cache.messages(&channel).into_iter().find(|m| m.id == message_id)
                {
                    cached.reactions = reactions;
                    self.cache.upsert(cached);
                }
            }
            ServerEvent::ChannelActivity(activity) => self.activity = activity,
            ServerEvent::SearchResults { messages, .. } => self.search_results = messages,
            ServerEvent::Pong { client_timestamp, .. } => {
                if let PongOutcome::Late = self.liveness.record_pong(client_timestamp, Instant::now()) {
                    debug!(late_pongs = self.liveness.late_pongs(), "tolerated late pong");
                }
            }
            ServerEvent::ClientsCount { count } => self.online_count = count,
            ServerEvent::Error { code, message, channel, room_id, .. } => {
                warn!(code = %code, channel = ?channel, room_id = ?room_id, "relay reported error: {message}");
                self.last_error = Some((code, message));
            }
            room_event => {
                if let Some(room) = room_scope(&room_event).and_then(|id| self.rooms.get_mut(id)) {
                    room.apply(&room_event);
                }
            }
        }
    }

    fn on_channel_joined(&mut self, channel: String, messages: Vec<ChatMessage>, members: Vec<MemberInfo>) {
        if channel != self.current_channel {
            for message in messages {
                self.cache.upsert(message);
            }
            return;
        }

        let cached = self.cache.messages(&channel);
        let timeline = Timeline::from_history(self.identity.id.clone(), messages, cached.clone());

        for stale in cached.iter().filter(|m| !timeline.messages().any(|kept| kept.id == m.id)) {
            self.cache.remove(&channel, &stale.id);
        }
        for entry in timeline.entries().iter().filter(|entry| entry.delivered) {
            self.cache.upsert(entry.message.clone());
        }

        self.timeline = timeline;
        self.members = members;
    }

    fn on_new_message(&mut self, message: ChatMessage) {
        if message.channel != self.current_channel {
            if message.author_id == self.identity.id {
                // Replayed from the queue after switching away.
                if let Some(correlation_id) = message.client_correlation_id.as_deref() {
                    self.cache.remove(&message.channel, correlation_id);
                    self.outbox.remove(correlation_id);
                }
            } else {
                *self.unread.entry(message.channel.clone()).or_insert(0) += 1;
            }
            self.cache.upsert(message);
            return;
        }

        let channel = message.channel.clone();
        let outcome = self.timeline.apply_inbound(message.clone());
        if let Some(replaced) = outcome.replaced() {
            self.cache.remove(&channel, replaced);
            self.outbox.remove(replaced);
        }
        if outcome != Reconciled::Duplicate {
            self.cache.upsert(message);
        }
    }

    fn emit(&mut self, event: ClientEvent) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::Disconnected);
        }
        self.outbound.push_back(event);
        Ok(())
    }

    fn join_event(&self, channel: &str) -> ClientEvent {
        ClientEvent::JoinChannel {
            channel: channel.to_string(),
            identity_id: self.identity.id.clone(),
            display_name: self.identity.display_name.clone(),
        }
    }

    fn send_event(&self, message: QueuedMessage) -> ClientEvent {
        ClientEvent::SendMessage {
            channel: message.channel,
            identity_id: self.identity.id.clone(),
            display_name: self.identity.display_name.clone(),
            text: message.text,
            correlation_id: Some(message.correlation_id),
        }
    }
}

fn queued_message(event: ClientEvent) -> Option<QueuedMessage> {
    match event {
        ClientEvent::SendMessage { channel, text, correlation_id: Some(correlation_id), .. } => {
            Some(QueuedMessage { correlation_id, channel, text, queued_at: Utc::now() })
        }
        _ => None,
    }
}

fn room_scope(event: &ServerEvent) -> Option<&str> {
    match event {
        ServerEvent::CollaborativeStateSync { room_id, .. }
        | ServerEvent::OperationApplied { room_id, .. }
        | ServerEvent::EditLockResponse { room_id, .. }
        | ServerEvent::FieldLocked { room_id, .. }
        | ServerEvent::FieldUnlocked { room_id, .. }
        | ServerEvent::ParticipantJoined { room_id, .. }
        | ServerEvent::ParticipantLeft { room_id, .. }
        | ServerEvent::ParticipantsUpdated { room_id, .. }
        | ServerEvent::PresenceUpdated { room_id, .. }
        | ServerEvent::UserActivityUpdated { room_id, .. } => Some(room_id),
        _ => None,
    }
}
