use chrono::Utc;
use huddle_common::mention::{extract_mentions, resolve_mentions};
use huddle_common::protocol::ServerEvent;
use huddle_common::types::Identity;
use tracing::{debug, info};

use super::RelayEngine;
use crate::error::CollabError;
use crate::hub::{ConnectionId, GroupKey};
use crate::metrics;

impl RelayEngine {
    pub(super) async fn user_join(
        &self,
        connection_id: ConnectionId,
        identity: Identity,
    ) -> Result<(), CollabError> {
        validate_identity(&identity)?;
        debug!(connection_id = %connection_id, identity_id = %identity.id, "identity bound");
        self.hub.bind_identity(connection_id, identity).await;
        self.hub
            .emit_to(connection_id, ServerEvent::ChannelsList(self.channel_names().to_vec()))
            .await;
        Ok(())
    }

    pub(super) async fn join_channel(
        &self,
        connection_id: ConnectionId,
        channel: String,
        identity: Identity,
    ) -> Result<(), CollabError> {
        validate_identity(&identity)?;
        let group = self.presence.channel(&channel)?;
        let log = self.channels.log(&channel)?;
        self.hub.bind_identity(connection_id, identity.clone()).await;

        let key = GroupKey::Channel(channel.clone());
        let mut members = group.lock().await;
        let is_new = members.join(&identity, connection_id);

        // Joining the fan-out group under the log lock puts every message
        // either in the history below or in a later `new_message`, never both.
        let log = log.lock().await;
        self.hub.join_group(connection_id, key.clone()).await;
        let messages = log.recent(self.settings.join_history);
        let member_infos = members.member_infos();
        self.hub
            .emit_to(
                connection_id,
                ServerEvent::ChannelJoined {
                    channel: channel.clone(),
                    messages,
                    members: member_infos.clone(),
                    member_count: member_infos.len(),
                },
            )
            .await;
        drop(log);

        if is_new {
            self.hub
                .emit_to_group_except(
                    &key,
                    connection_id,
                    ServerEvent::UserJoinedChannel {
                        channel: channel.clone(),
                        identity_id: identity.id.clone(),
                        display_name: identity.display_name.clone(),
                        timestamp: Utc::now(),
                    },
                )
                .await;
        }
        self.hub
            .emit_to_group(
                &key,
                ServerEvent::ChannelUsersUpdated {
                    channel: channel.clone(),
                    member_count: member_infos.len(),
                    members: member_infos,
                },
            )
            .await;

        info!(channel = %channel, identity_id = %identity.id, members = members.len(), "joined channel");
        Ok(())
    }

    /// Leaving is idempotent: an absent member only drops the connection
    /// from the channel's fan-out group.
    pub(super) async fn leave_channel(
        &self,
        connection_id: ConnectionId,
        channel: String,
        identity_id: String,
    ) -> Result<(), CollabError> {
        let group = self.presence.channel(&channel)?;
        let key = GroupKey::Channel(channel.clone());

        let mut members = group.lock().await;
        let departed = members.leave(&identity_id);
        self.hub.leave_group(connection_id, &key).await;

        let Some(member) = departed else {
            return Ok(());
        };
        self.hub
            .emit_to_group(
                &key,
                ServerEvent::UserLeftChannel {
                    channel: channel.clone(),
                    identity_id: member.identity_id,
                    display_name: Some(member.display_name),
                    timestamp: Utc::now(),
                },
            )
            .await;
        self.hub
            .emit_to_group(
                &key,
                ServerEvent::ChannelUsersUpdated {
                    channel: channel.clone(),
                    members: members.member_infos(),
                    member_count: members.len(),
                },
            )
            .await;

        info!(channel = %channel, identity_id = %identity_id, "left channel");
        Ok(())
    }

    /// Append a message, broadcast it to the channel and notify every
    /// mentioned identity wherever it is connected.
    pub(super) async fn send_message(
        &self,
        connection_id: ConnectionId,
        channel: String,
        identity: Identity,
        text: String,
        correlation_id: Option<String>,
    ) -> Result<(), CollabError> {
        validate_identity(&identity)?;
        if text.trim().is_empty() {
            return Err(CollabError::Validation("message text must not be empty".to_string()));
        }
        let log = self.channels.log(&channel)?;
        self.hub.bind_identity(connection_id, identity.clone()).await;

        // Resolved before the channel log is locked; resolution locks each
        // channel's member set in turn.
        let tokens = extract_mentions(&text);
        let mentioned = if tokens.is_empty() {
            Vec::new()
        } else {
            let known = self.presence.known_channel_members().await;
            resolve_mentions(
                &tokens,
                known.iter().map(|(id, name)| (id.as_str(), name.as_str())),
                self.matcher.as_ref(),
            )
        };

        let key = GroupKey::Channel(channel.clone());
        let mut log = log.lock().await;
        let message = log.append(&identity, text, correlation_id, tokens);
        metrics::increment_messages_appended();
        let delivered = self.hub.emit_to_group(&key, ServerEvent::NewMessage(message.clone())).await;

        let mut notified = 0;
        for identity_id in &mentioned {
            let notification = ServerEvent::MentionNotification {
                message: message.clone(),
                channel: channel.clone(),
                timestamp: Utc::now(),
            };
            if self.hub.emit_to_identity(identity_id, notification).await {
                notified += 1;
            }
        }
        metrics::add_mention_notifications(notified);

        debug!(
            channel = %channel,
            message_id = %message.id,
            identity_id = %identity.id,
            delivered,
            mentioned = mentioned.len(),
            notified,
            "message appended"
        );
        Ok(())
    }

    pub(super) async fn typing(
        &self,
        connection_id: ConnectionId,
        channel: String,
        identity: Identity,
        is_typing: bool,
    ) -> Result<(), CollabError> {
        self.presence.channel(&channel)?;
        let key = GroupKey::Channel(channel.clone());
        self.hub
            .emit_to_group_except(
                &key,
                connection_id,
                ServerEvent::UserTyping {
                    channel,
                    identity_id: identity.id,
                    display_name: identity.display_name,
                    is_typing,
                },
            )
            .await;
        Ok(())
    }

    pub(super) async fn add_reaction(
        &self,
        channel: String,
        message_id: String,
        emoji: String,
        identity: Identity,
    ) -> Result<(), CollabError> {
        validate_identity(&identity)?;
        if emoji.is_empty() {
            return Err(CollabError::Validation("emoji must not be empty".to_string()));
        }
        let log = self.channels.log(&channel)?;
        let mut log = log.lock().await;
        let (toggle, reactions) = log.toggle_reaction(&message_id, &emoji, &identity)?;

        self.hub
            .emit_to_group(
                &GroupKey::Channel(channel.clone()),
                ServerEvent::MessageReactionUpdated {
                    message_id: message_id.clone(),
                    channel: channel.clone(),
                    reactions,
                },
            )
            .await;
        debug!(channel = %channel, message_id = %message_id, emoji = %emoji, ?toggle, "reaction toggled");
        Ok(())
    }

    pub(super) async fn send_channel_activity(
        &self,
        connection_id: ConnectionId,
    ) -> Result<(), CollabError> {
        let activity = self.channel_activity().await?;
        self.hub.emit_to(connection_id, ServerEvent::ChannelActivity(activity)).await;
        Ok(())
    }

    pub(super) async fn search_messages(
        &self,
        connection_id: ConnectionId,
        channel: String,
        query: String,
    ) -> Result<(), CollabError> {
        let log = self.channels.log(&channel)?;
        let messages = log.lock().await.search(&query);
        self.hub
            .emit_to(connection_id, ServerEvent::SearchResults { channel, query, messages })
            .await;
        Ok(())
    }

    /// Remove every member bound to a closed connection from `channel` and
    /// announce each departure.
    pub(super) async fn drop_channel_connection(&self, connection_id: ConnectionId, channel: &str) {
        let Ok(group) = self.presence.channel(channel) else {
            return;
        };
        let key = GroupKey::Channel(channel.to_string());

        let mut members = group.lock().await;
        let departed = members.remove_connection(connection_id);
        if departed.is_empty() {
            return;
        }
        for member in departed {
            self.hub
                .emit_to_group(
                    &key,
                    ServerEvent::UserLeftChannel {
                        channel: channel.to_string(),
                        identity_id: member.identity_id,
                        display_name: Some(member.display_name),
                        timestamp: Utc::now(),
                    },
                )
                .await;
        }
        self.hub
            .emit_to_group(
                &key,
                ServerEvent::ChannelUsersUpdated {
                    channel: channel.to_string(),
                    members: members.member_infos(),
                    member_count: members.len(),
                },
            )
            .await;
    }
}

fn validate_identity(identity: &Identity) -> Result<(), CollabError> {
    if identity.id.trim().is_empty() {
        return Err(CollabError::Validation("identityId must not be empty".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use huddle_common::protocol::{ClientEvent, ServerEvent};

    use super::super::test_support::{connect, engine, Peer};
    use super::super::RelayEngine;

    async fn join(engine: &RelayEngine, peer: &Peer, channel: &str, id: &str, name: &str) {
        engine
            .dispatch(
                peer.id,
                ClientEvent::JoinChannel {
                    channel: channel.to_string(),
                    identity_id: id.to_string(),
                    display_name: name.to_string(),
                },
            )
            .await;
    }

    async fn say(engine: &RelayEngine, peer: &Peer, channel: &str, id: &str, text: &str) {
        engine
            .dispatch(
                peer.id,
                ClientEvent::SendMessage {
                    channel: channel.to_string(),
                    identity_id: id.to_string(),
                    display_name: id.to_uppercase(),
                    text: text.to_string(),
                    correlation_id: Some(format!("corr-{text}")),
                },
            )
            .await;
    }

    #[tokio::test]
    async fn joining_unknown_channel_is_reported_to_caller_only() {
        let engine = engine();
        let mut peer = connect(&engine).await;
        join(&engine, &peer, "lobby", "a", "A").await;

        match peer.drain().as_slice() {
            [ServerEvent::Error { code, channel, .. }] => {
                assert_eq!(code, "UNKNOWN_CHANNEL");
                assert_eq!(channel.as_deref(), Some("lobby"));
            }
            other => panic!("expected one error event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn join_returns_snapshot_and_notifies_others() {
        let engine = engine();
        let mut alice = connect(&engine).await;
        let mut bob = connect(&engine).await;
        alice.drain();

        join(&engine, &alice, "general", "alice", "Alice").await;
        say(&engine, &alice, "general", "alice", "first").await;
        alice.drain();

        join(&engine, &bob, "general", "bob", "Bob").await;
        match bob.drain().as_slice() {
            [ServerEvent::ChannelJoined { messages, member_count, .. }, ServerEvent::ChannelUsersUpdated { .. }] =>
            {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].text, "first");
                assert_eq!(*member_count, 2);
            }
            other => panic!("unexpected join events: {other:?}"),
        }
        assert_eq!(alice.names(), vec!["user_joined_channel", "channel_users_updated"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn joiner_sees_a_concurrent_message_exactly_once() {
        for _ in 0..20 {
            let engine = std::sync::Arc::new(engine());
            let alice = connect(&engine).await;
            let mut bob = connect(&engine).await;
            join(&engine, &alice, "general", "alice", "Alice").await;

            let sender = std::sync::Arc::clone(&engine);
            let alice_id = alice.id;
            let send = tokio::spawn(async move {
                sender
                    .dispatch(
                        alice_id,
                        ClientEvent::SendMessage {
                            channel: "general".to_string(),
                            identity_id: "alice".to_string(),
                            display_name: "Alice".to_string(),
                            text: "racing".to_string(),
                            correlation_id: None,
                        },
                    )
                    .await;
            });
            join(&engine, &bob, "general", "bob", "Bob").await;
            send.await.expect("send task should finish");

            let seen = bob
                .drain()
                .into_iter()
                .map(|event| match event {
                    ServerEvent::ChannelJoined { messages, .. } => messages.len(),
                    ServerEvent::NewMessage(_) => 1,
                    _ => 0,
                })
                .sum::<usize>();
            assert_eq!(seen, 1);
        }
    }

    #[tokio::test]
    async fn message_echo_carries_correlation_id() {
        let engine = engine();
        let mut alice = connect(&engine).await;
        join(&engine, &alice, "general", "alice", "Alice").await;
        alice.drain();

        say(&engine, &alice, "general", "alice", "hello").await;
        match alice.drain().as_slice() {
            [ServerEvent::NewMessage(message)] => {
                assert_eq!(message.client_correlation_id.as_deref(), Some("corr-hello"));
                assert!(!message.id.is_empty());
            }
            other => panic!("expected new_message, got {other:?}"),
        }

        let recent = engine.recent_messages("general", 50).await.expect("general exists");
        assert_eq!(recent.len(), 1);
    }

    #[tokio::test]
    async fn mentions_reach_members_of_other_channels() {
        let engine = engine();
        let mut alice = connect(&engine).await;
        let mut bob = connect(&engine).await;
        let mut carol = connect(&engine).await;
        join(&engine, &alice, "general", "alice", "Alice").await;
        join(&engine, &bob, "random", "bob", "Bob T").await;
        join(&engine, &carol, "general", "carol", "Carol").await;
        for peer in [&mut alice, &mut bob, &mut carol] {
            peer.drain();
        }

        say(&engine, &carol, "general", "carol", "hello @Al and @bob").await;

        assert_eq!(alice.names(), vec!["new_message", "mention_notification"]);
        match bob.drain().as_slice() {
            [ServerEvent::MentionNotification { message, channel, .. }] => {
                assert_eq!(channel, "general");
                assert_eq!(message.mentions, vec!["Al".to_string(), "bob".to_string()]);
            }
            other => panic!("expected only a mention for bob, got {other:?}"),
        }
        assert_eq!(carol.names(), vec!["new_message"]);
    }

    #[tokio::test]
    async fn typing_is_relayed_to_others_only() {
        let engine = engine();
        let mut alice = connect(&engine).await;
        let mut bob = connect(&engine).await;
        join(&engine, &alice, "general", "alice", "Alice").await;
        join(&engine, &bob, "general", "bob", "Bob").await;
        alice.drain();
        bob.drain();

        engine
            .dispatch(
                alice.id,
                ClientEvent::TypingStart {
                    channel: "general".to_string(),
                    identity_id: "alice".to_string(),
                    display_name: "Alice".to_string(),
                },
            )
            .await;

        assert!(alice.drain().is_empty());
        match bob.drain().as_slice() {
            [ServerEvent::UserTyping { is_typing, identity_id, .. }] => {
                assert!(*is_typing);
                assert_eq!(identity_id, "alice");
            }
            other => panic!("expected user_typing, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reactions_toggle_and_missing_messages_are_reported() {
        let engine = engine();
        let mut alice = connect(&engine).await;
        join(&engine, &alice, "general", "alice", "Alice").await;
        say(&engine, &alice, "general", "alice", "ship it").await;
        let message_id = engine.recent_messages("general", 1).await.expect("general exists")[0]
            .id
            .clone();
        alice.drain();

        let react = |message_id: String| ClientEvent::AddReaction {
            message_id,
            channel: "general".to_string(),
            emoji: "👍".to_string(),
            identity_id: "alice".to_string(),
            display_name: "Alice".to_string(),
        };

        engine.dispatch(alice.id, react(message_id.clone())).await;
        engine.dispatch(alice.id, react(message_id.clone())).await;
        let counts: Vec<usize> = alice
            .drain()
            .into_iter()
            .map(|event| match event {
                ServerEvent::MessageReactionUpdated { reactions, .. } => reactions.len(),
                other => panic!("expected reaction update, got {other:?}"),
            })
            .collect();
        assert_eq!(counts, vec![1, 0]);

        engine.dispatch(alice.id, react("missing".to_string())).await;
        match alice.drain().as_slice() {
            [ServerEvent::Error { code, .. }] => assert_eq!(code, "MESSAGE_NOT_FOUND"),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn leave_is_idempotent() {
        let engine = engine();
        let mut alice = connect(&engine).await;
        let mut bob = connect(&engine).await;
        join(&engine, &alice, "general", "alice", "Alice").await;
        join(&engine, &bob, "general", "bob", "Bob").await;
        alice.drain();
        bob.drain();

        let leave = ClientEvent::LeaveChannel {
            channel: "general".to_string(),
            identity_id: "bob".to_string(),
        };
        engine.dispatch(bob.id, leave.clone()).await;
        engine.dispatch(bob.id, leave).await;

        assert_eq!(alice.names(), vec!["user_left_channel", "channel_users_updated"]);
        assert!(bob.drain().is_empty());
    }

    #[tokio::test]
    async fn search_returns_newest_first() {
        let engine = engine();
        let mut alice = connect(&engine).await;
        join(&engine, &alice, "general", "alice", "Alice").await;
        say(&engine, &alice, "general", "alice", "deploy one").await;
        say(&engine, &alice, "general", "alice", "lunch").await;
        say(&engine, &alice, "general", "alice", "Deploy two").await;
        alice.drain();

        engine
            .dispatch(
                alice.id,
                ClientEvent::SearchMessages {
                    channel: "general".to_string(),
                    query: "deploy".to_string(),
                },
            )
            .await;
        match alice.drain().as_slice() {
            [ServerEvent::SearchResults { messages, .. }] => {
                let texts: Vec<&str> = messages.iter().map(|m| m.text.as_str()).collect();
                assert_eq!(texts, vec!["Deploy two", "deploy one"]);
            }
            other => panic!("expected search results, got {other:?}"),
        }
    }
}
