mod support;

use futures_util::{SinkExt, StreamExt};
use huddle_common::protocol::{ClientEvent, ServerEvent};
use std::time::Duration;
use support::{connect, join_channel, recv_event, recv_until, send, send_raw, spawn_relay};
use tokio_tungstenite::tungstenite::Message;

#[tokio::test]
async fn greeting_confirms_connection_and_lists_channels() {
    let relay = spawn_relay().await;
    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", relay.addr))
        .await
        .expect("websocket should connect");

    match recv_event(&mut socket).await {
        ServerEvent::ConnectionConfirmed { protocol_version, .. } => {
            assert_eq!(protocol_version, "huddle.v1");
        }
        other => panic!("expected connection_confirmed, got {other:?}"),
    }
    match recv_event(&mut socket).await {
        ServerEvent::ChannelsList(channels) => {
            assert_eq!(channels, vec!["general", "development", "random"]);
        }
        other => panic!("expected channels_list, got {other:?}"),
    }
    assert_eq!(recv_event(&mut socket).await, ServerEvent::ClientsCount { count: 1 });
}

#[tokio::test]
async fn message_is_echoed_to_sender_and_delivered_to_members() {
    let relay = spawn_relay().await;
    let mut alice = connect(relay.addr).await;
    let mut bob = connect(relay.addr).await;

    send(&mut alice, &join_channel("general", "alice", "Alice")).await;
    recv_until(&mut alice, "channel_joined").await;
    send(&mut bob, &join_channel("general", "bob", "Bob")).await;
    recv_until(&mut bob, "channel_joined").await;

    send(
        &mut alice,
        &ClientEvent::SendMessage {
            channel: "general".to_string(),
            identity_id: "alice".to_string(),
            display_name: "Alice".to_string(),
            text: "standup in 5".to_string(),
            correlation_id: Some("c1".to_string()),
        },
    )
    .await;

    let ServerEvent::NewMessage(echo) = recv_until(&mut alice, "new_message").await else {
        unreachable!("recv_until only returns the requested event");
    };
    let ServerEvent::NewMessage(delivered) = recv_until(&mut bob, "new_message").await else {
        unreachable!("recv_until only returns the requested event");
    };
    assert_eq!(echo.client_correlation_id.as_deref(), Some("c1"));
    assert_eq!(echo.id, delivered.id);
    assert_eq!(delivered.author_name, "Alice");

    let history = relay.engine.recent_messages("general", 50).await.expect("general exists");
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn mention_notification_crosses_channels() {
    let relay = spawn_relay().await;
    let mut carol = connect(relay.addr).await;
    let mut bob = connect(relay.addr).await;

    send(&mut bob, &join_channel("random", "bob", "Bob T")).await;
    recv_until(&mut bob, "channel_joined").await;
    send(&mut carol, &join_channel("general", "carol", "Carol")).await;
    recv_until(&mut carol, "channel_joined").await;

    send(
        &mut carol,
        &ClientEvent::SendMessage {
            channel: "general".to_string(),
            identity_id: "carol".to_string(),
            display_name: "Carol".to_string(),
            text: "ping @bob".to_string(),
            correlation_id: None,
        },
    )
    .await;

    match recv_until(&mut bob, "mention_notification").await {
        ServerEvent::MentionNotification { message, channel, .. } => {
            assert_eq!(channel, "general");
            assert_eq!(message.text, "ping @bob");
        }
        other => panic!("expected mention_notification, got {other:?}"),
    }
}

#[tokio::test]
async fn bad_frames_do_not_close_the_connection() {
    let relay = spawn_relay().await;
    let mut socket = connect(relay.addr).await;
    recv_until(&mut socket, "clients_count").await;

    send_raw(&mut socket, "{not json").await;
    send_raw(&mut socket, r#"{"event":"self_destruct","data":{}}"#).await;
    send_raw(&mut socket, r#"{"event":"send_message","data":{"channel":"general"}}"#).await;
    match recv_event(&mut socket).await {
        ServerEvent::Error { code, .. } => assert_eq!(code, "INVALID_EVENT"),
        other => panic!("expected error, got {other:?}"),
    }

    send(&mut socket, &ClientEvent::Ping { client_timestamp: Some(42), platform: None }).await;
    match recv_event(&mut socket).await {
        ServerEvent::Pong { client_timestamp, server_timestamp, .. } => {
            assert_eq!(client_timestamp, Some(42));
            assert!(server_timestamp > 0);
        }
        other => panic!("expected pong, got {other:?}"),
    }
}

#[tokio::test]
async fn oversized_frame_ends_the_connection() {
    let relay = spawn_relay().await;
    let mut socket = connect(relay.addr).await;

    let oversized = format!(
        r#"{{"event":"ping","data":{{"platform":"{}"}}}}"#,
        "x".repeat(huddle_relay::ws::MAX_FRAME_BYTES)
    );
    let _ = socket.send(Message::Text(oversized.into())).await;

    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match socket.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return true,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .expect("relay should close an oversized connection promptly");
    assert!(ended);
}

#[tokio::test]
async fn leaving_member_is_announced_on_disconnect() {
    let relay = spawn_relay().await;
    let mut alice = connect(relay.addr).await;
    let mut bob = connect(relay.addr).await;

    send(&mut alice, &join_channel("general", "alice", "Alice")).await;
    recv_until(&mut alice, "channel_joined").await;
    send(&mut bob, &join_channel("general", "bob", "Bob")).await;
    recv_until(&mut alice, "user_joined_channel").await;

    bob.close(None).await.expect("close should send");

    match recv_until(&mut alice, "user_left_channel").await {
        ServerEvent::UserLeftChannel { identity_id, display_name, .. } => {
            assert_eq!(identity_id, "bob");
            assert_eq!(display_name.as_deref(), Some("Bob"));
        }
        other => panic!("expected user_left_channel, got {other:?}"),
    }
    match recv_until(&mut alice, "channel_users_updated").await {
        ServerEvent::ChannelUsersUpdated { member_count, .. } => assert_eq!(member_count, 1),
        other => panic!("expected channel_users_updated, got {other:?}"),
    }
}
