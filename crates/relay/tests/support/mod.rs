// Shared helpers for end-to-end WebSocket tests against a live relay.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use huddle_common::protocol::{decode_server_frame, encode, ClientEvent, ServerEvent};
use huddle_relay::{build_router, config::EngineSettings, engine::RelayEngine};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestRelay {
    pub addr: SocketAddr,
    pub engine: Arc<RelayEngine>,
}

pub async fn spawn_relay() -> TestRelay {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("test listener should bind");
    let addr = listener.local_addr().expect("listener should have an address");
    let engine = Arc::new(RelayEngine::new(EngineSettings::default()));
    let router = build_router(Arc::clone(&engine), None);
    tokio::spawn(async move {
        let _ = huddle_relay::serve(listener, router, std::future::pending()).await;
    });
    TestRelay { addr, engine }
}

/// Open a socket and consume the greeting up to `channels_list`.
pub async fn connect(addr: SocketAddr) -> Socket {
    let (mut socket, _) =
        connect_async(format!("ws://{addr}/ws")).await.expect("websocket should connect");
    recv_until(&mut socket, "channels_list").await;
    socket
}

pub async fn send(socket: &mut Socket, event: &ClientEvent) {
    let frame = encode(event).expect("client event should encode");
    socket.send(Message::Text(frame.into())).await.expect("frame should send");
}

pub async fn send_raw(socket: &mut Socket, frame: &str) {
    socket.send(Message::Text(frame.to_string().into())).await.expect("frame should send");
}

pub async fn recv_event(socket: &mut Socket) -> ServerEvent {
    loop {
        let message = tokio::time::timeout(RECV_TIMEOUT, socket.next())
            .await
            .expect("timed out waiting for a server event")
            .expect("socket closed while waiting for a server event")
            .expect("websocket read should succeed");
        if let Message::Text(text) = message {
            return decode_server_frame(text.as_str()).expect("server frame should decode");
        }
    }
}

/// Skip events until one named `name` arrives.
pub async fn recv_until(socket: &mut Socket, name: &str) -> ServerEvent {
    loop {
        let event = recv_event(socket).await;
        if event.name() == name {
            return event;
        }
    }
}

pub fn join_channel(channel: &str, identity_id: &str, display_name: &str) -> ClientEvent {
    ClientEvent::JoinChannel {
        channel: channel.to_string(),
        identity_id: identity_id.to_string(),
        display_name: display_name.to_string(),
    }
}

pub fn join_room(room_id: &str, identity_id: &str, display_name: &str) -> ClientEvent {
    ClientEvent::JoinCollaborativeRoom {
        room_id: room_id.to_string(),
        identity_id: identity_id.to_string(),
        display_name: display_name.to_string(),
    }
}
