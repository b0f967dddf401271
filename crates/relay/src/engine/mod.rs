// RelayEngine: the registry object that owns every piece of relay state and
// routes inbound events to the chat and collaboration handlers.

mod chat;
mod collab;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use huddle_common::mention::{MentionMatcher, SubstringMatcher};
use huddle_common::protocol::{self, ClientEvent, FrameError, ServerEvent, PROTOCOL_VERSION};
use huddle_common::types::{ChannelActivity, ChatMessage, Identity};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::chat::ChannelStore;
use crate::collab::RoomEngine;
use crate::config::EngineSettings;
use crate::error::{CollabError, ErrorCode};
use crate::hub::{ConnectionHub, ConnectionId, GroupKey};
use crate::metrics;
use crate::presence::PresenceRegistry;

/// Process-wide relay state, constructed once at startup and shared with
/// the transport through an `Arc`.
pub struct RelayEngine {
    hub: ConnectionHub,
    presence: PresenceRegistry,
    channels: ChannelStore,
    rooms: RoomEngine,
    matcher: Arc<dyn MentionMatcher>,
    settings: EngineSettings,
    started_at: DateTime<Utc>,
}

impl RelayEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            hub: ConnectionHub::default(),
            presence: PresenceRegistry::new(&settings.channels),
            channels: ChannelStore::new(&settings.channels, settings.channel_capacity),
            rooms: RoomEngine::new(settings.operation_log_capacity, settings.max_document_bytes),
            matcher: Arc::new(SubstringMatcher),
            settings,
            started_at: Utc::now(),
        }
    }

    /// Replace the mention resolution strategy.
    pub fn with_matcher(mut self, matcher: Arc<dyn MentionMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn channel_names(&self) -> &[String] {
        self.presence.channel_names()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub async fn connection_count(&self) -> usize {
        self.hub.connection_count().await
    }

    /// Register a new connection. The connection is greeted with
    /// `connection_confirmed` and `channels_list`, and every connection is
    /// told the new online count.
    pub async fn connect(&self, outbound: mpsc::UnboundedSender<ServerEvent>) -> ConnectionId {
        let connection_id = self.hub.register(outbound).await;
        self.hub
            .emit_to(
                connection_id,
                ServerEvent::ConnectionConfirmed {
                    connection_id,
                    timestamp: Utc::now(),
                    protocol_version: PROTOCOL_VERSION.to_string(),
                },
            )
            .await;
        self.hub
            .emit_to(connection_id, ServerEvent::ChannelsList(self.channel_names().to_vec()))
            .await;

        let count = self.broadcast_clients_count().await;
        info!(connection_id = %connection_id, connections = count, "connection registered");
        connection_id
    }

    /// Tear down a connection: leave every channel and room it joined,
    /// release its edit locks and announce the departures. Runs at most once
    /// per connection; later calls are no-ops.
    pub async fn disconnect(&self, connection_id: ConnectionId) {
        let Some(departure) = self.hub.unregister(connection_id).await else {
            return;
        };

        for group in &departure.groups {
            match group {
                GroupKey::Channel(channel) => self.drop_channel_connection(connection_id, channel).await,
                GroupKey::Room(room_id) => self.drop_room_connection(connection_id, room_id).await,
            }
        }

        let count = self.broadcast_clients_count().await;
        info!(
            connection_id = %connection_id,
            identity_id = departure.identity.as_ref().map(|identity| identity.id.as_str()),
            groups = departure.groups.len(),
            connected_for_secs = (Utc::now() - departure.connected_at).num_seconds(),
            connections = count,
            "connection closed"
        );
    }

    /// Decode and dispatch one text frame.
    ///
    /// Unknown events are ignored. A known event with an unusable payload is
    /// answered with an `INVALID_EVENT` error; the connection stays open
    /// either way.
    pub async fn dispatch_frame(&self, connection_id: ConnectionId, text: &str) {
        match protocol::decode_client_frame(text) {
            Ok(event) => self.dispatch(connection_id, event).await,
            Err(FrameError::UnknownEvent(event)) => {
                metrics::record_ws_event("unknown", true);
                warn!(connection_id = %connection_id, event = %event, "no handler for event");
            }
            Err(FrameError::InvalidPayload { event, reason }) => {
                metrics::record_ws_event(&event, true);
                warn!(connection_id = %connection_id, event = %event, reason = %reason, "dropping event with invalid payload");
                self.hub
                    .emit_to(
                        connection_id,
                        ServerEvent::Error {
                            code: ErrorCode::InvalidEvent.as_str().to_string(),
                            message: format!("invalid payload for `{event}`: {reason}"),
                            retryable: false,
                            channel: None,
                            room_id: None,
                        },
                    )
                    .await;
            }
            Err(error @ FrameError::Malformed(_)) => {
                metrics::record_ws_event("malformed", true);
                warn!(connection_id = %connection_id, error = %error, "dropping malformed frame");
            }
        }
    }

    /// Route a decoded event to its handler. Handler failures are reported
    /// to the calling connection only.
    pub async fn dispatch(&self, connection_id: ConnectionId, event: ClientEvent) {
        let name = event.name();
        let (channel, room_id) = event_scope(&event);

        let result = match event {
            ClientEvent::UserJoin { identity_id, display_name } => {
                self.user_join(connection_id, Identity::new(identity_id, display_name)).await
            }
            ClientEvent::JoinChannel { channel, identity_id, display_name } => {
                self.join_channel(connection_id, channel, Identity::new(identity_id, display_name))
                    .await
            }
            ClientEvent::LeaveChannel { channel, identity_id } => {
                self.leave_channel(connection_id, channel, identity_id).await
            }
            ClientEvent::SendMessage { channel, identity_id, display_name, text, correlation_id } => {
                self.send_message(
                    connection_id,
                    channel,
                    Identity::new(identity_id, display_name),
                    text,
                    correlation_id,
                )
                .await
            }
            ClientEvent::TypingStart { channel, identity_id, display_name } => {
                self.typing(connection_id, channel, Identity::new(identity_id, display_name), true)
                    .await
            }
            ClientEvent::TypingStop { channel, identity_id, display_name } => {
                self.typing(connection_id, channel, Identity::new(identity_id, display_name), false)
                    .await
            }
            ClientEvent::AddReaction { message_id, channel, emoji, identity_id, display_name } => {
                self.add_reaction(channel, message_id, emoji, Identity::new(identity_id, display_name))
                    .await
            }
            ClientEvent::GetChannelActivity {} => self.send_channel_activity(connection_id).await,
            ClientEvent::SearchMessages { channel, query } => {
                self.search_messages(connection_id, channel, query).await
            }
            ClientEvent::JoinCollaborativeRoom { room_id, identity_id, display_name } => {
                self.join_room(connection_id, room_id, Identity::new(identity_id, display_name))
                    .await
            }
            ClientEvent::LeaveCollaborativeRoom { room_id, identity_id } => {
                self.leave_room(connection_id, room_id, identity_id).await
            }
            ClientEvent::CollaborativeOperation { room_id, operation } => {
                self.apply_operation(connection_id, room_id, operation).await
            }
            ClientEvent::RequestEditLock { room_id, field_key, identity_id } => {
                self.request_edit_lock(connection_id, room_id, field_key, identity_id).await
            }
            ClientEvent::ReleaseEditLock { room_id, field_key, identity_id } => {
                self.release_edit_lock(connection_id, room_id, field_key, identity_id).await
            }
            ClientEvent::UpdatePresence { room_id, identity_id, presence_data } => {
                self.update_presence(connection_id, room_id, identity_id, presence_data).await
            }
            ClientEvent::UserActivityChange { room_id, identity_id, is_active } => {
                self.user_activity_change(connection_id, room_id, identity_id, is_active).await
            }
            ClientEvent::Ping { client_timestamp, platform } => {
                self.hub
                    .emit_to(
                        connection_id,
                        ServerEvent::Pong {
                            client_timestamp,
                            server_timestamp: Utc::now().timestamp_millis(),
                            platform,
                        },
                    )
                    .await;
                Ok(())
            }
        };

        match result {
            Ok(()) => metrics::record_ws_event(name, false),
            Err(error) => {
                metrics::record_ws_event(name, true);
                debug!(
                    connection_id = %connection_id,
                    event = name,
                    code = error.code().as_str(),
                    error = %error,
                    "event rejected"
                );
                self.hub
                    .emit_to(connection_id, error.to_event(channel.as_deref(), room_id.as_deref()))
                    .await;
            }
        }
    }

    /// `channel -> {lastActivity, messageCount, userCount}` for every
    /// configured channel.
    pub async fn channel_activity(&self) -> Result<BTreeMap<String, ChannelActivity>, CollabError> {
        let mut activity = BTreeMap::new();
        for name in self.channel_names() {
            let log = self.channels.log(name)?;
            let (last_activity, message_count) = {
                let log = log.lock().await;
                (log.last_activity(), log.len())
            };
            let user_count = self.presence.channel_member_count(name).await?;
            activity.insert(
                name.clone(),
                ChannelActivity { last_activity, message_count, user_count },
            );
        }
        Ok(activity)
    }

    /// The most recent `limit` messages of a channel, oldest first.
    pub async fn recent_messages(
        &self,
        channel: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, CollabError> {
        let log = self.channels.log(channel)?;
        let messages = log.lock().await.recent(limit);
        Ok(messages)
    }

    async fn broadcast_clients_count(&self) -> usize {
        let count = self.hub.connection_count().await;
        metrics::set_active_connections(count);
        self.hub.emit_to_all(ServerEvent::ClientsCount { count }).await;
        count
    }
}

/// Channel or room an event refers to, used to scope error replies.
fn event_scope(event: &ClientEvent) -> (Option<String>, Option<String>) {
    match event {
        ClientEvent::JoinChannel { channel, .. }
        | ClientEvent::LeaveChannel { channel, .. }
        | ClientEvent::SendMessage { channel, .. }
        | ClientEvent::TypingStart { channel, .. }
        | ClientEvent::TypingStop { channel, .. }
        | ClientEvent::AddReaction { channel, .. }
        | ClientEvent::SearchMessages { channel, .. } => (Some(channel.clone()), None),
        ClientEvent::JoinCollaborativeRoom { room_id, .. }
        | ClientEvent::LeaveCollaborativeRoom { room_id, .. }
        | ClientEvent::CollaborativeOperation { room_id, .. }
        | ClientEvent::RequestEditLock { room_id, .. }
        | ClientEvent::ReleaseEditLock { room_id, .. }
        | ClientEvent::UpdatePresence { room_id, .. }
        | ClientEvent::UserActivityChange { room_id, .. } => (None, Some(room_id.clone())),
        ClientEvent::UserJoin { .. } | ClientEvent::GetChannelActivity {} | ClientEvent::Ping { .. } => {
            (None, None)
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub(crate) struct Peer {
        pub(crate) id: ConnectionId,
        pub(crate) rx: mpsc::UnboundedReceiver<ServerEvent>,
    }

    impl Peer {
        /// Everything queued for this peer so far.
        pub(crate) fn drain(&mut self) -> Vec<ServerEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.rx.try_recv() {
                events.push(event);
            }
            events
        }

        pub(crate) fn names(&mut self) -> Vec<&'static str> {
            self.drain().iter().map(ServerEvent::name).collect()
        }
    }

    pub(crate) fn engine() -> RelayEngine {
        RelayEngine::new(EngineSettings::default())
    }

    /// Connect and discard the greeting events.
    pub(crate) async fn connect(engine: &RelayEngine) -> Peer {
        let (sender, rx) = mpsc::unbounded_channel();
        let id = engine.connect(sender).await;
        let mut peer = Peer { id, rx };
        peer.drain();
        peer
    }
}
