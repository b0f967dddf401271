// WebSocket transport: one task per connection pumping frames between the
// socket and the relay engine.

mod protocol;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use huddle_common::protocol::ServerEvent;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

use crate::engine::RelayEngine;
use crate::error::{request_id_from_headers_or_generate, with_request_id_scope};
use crate::hub::ConnectionId;
use protocol::{close_frame_too_large, is_frame_size_violation, send_event};

pub const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
pub const MAX_FRAME_BYTES: usize = 262_144;

pub fn router(engine: Arc<RelayEngine>) -> Router {
    Router::new().route("/ws", get(ws_upgrade)).with_state(engine)
}

async fn ws_upgrade(
    State(engine): State<Arc<RelayEngine>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let request_id = request_id_from_headers_or_generate(&headers);
    ws.max_frame_size(MAX_FRAME_BYTES).max_message_size(MAX_FRAME_BYTES).on_upgrade(
        move |socket| async move {
            with_request_id_scope(request_id, handle_socket(engine, socket)).await;
        },
    )
}

async fn handle_socket(engine: Arc<RelayEngine>, mut socket: WebSocket) {
    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<ServerEvent>();
    let connection_id = engine.connect(outbound_sender).await;
    let span = info_span!("relay.connection", connection_id = %connection_id);

    async {
        pump(&engine, connection_id, &mut socket, &mut outbound_receiver).await;
        engine.disconnect(connection_id).await;
    }
    .instrument(span)
    .await;
}

/// Run until the peer goes away, the heartbeat lapses or a write fails.
async fn pump(
    engine: &RelayEngine,
    connection_id: ConnectionId,
    socket: &mut WebSocket,
    outbound_receiver: &mut mpsc::UnboundedReceiver<ServerEvent>,
) {
    // The server pings every HEARTBEAT_INTERVAL_MS; a ping still
    // unanswered after HEARTBEAT_TIMEOUT_MS ends the connection.
    let mut heartbeat_interval = tokio::time::interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    heartbeat_interval.reset();
    let heartbeat_timeout = Duration::from_millis(HEARTBEAT_TIMEOUT_MS);
    let mut ping_sent_at: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                match ping_sent_at {
                    Some(sent_at) if sent_at.elapsed() > heartbeat_timeout => {
                        warn!("heartbeat timeout, disconnecting");
                        break;
                    }
                    Some(_) => {}
                    None => {
                        if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                            break;
                        }
                        ping_sent_at = Some(Instant::now());
                    }
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                let Some(event) = maybe_outbound else {
                    break;
                };
                if send_event(socket, &event).await.is_err() {
                    break;
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        if raw_message.len() > MAX_FRAME_BYTES {
                            close_frame_too_large(socket).await;
                            break;
                        }
                        engine.dispatch_frame(connection_id, raw_message.as_str()).await;
                    }
                    Ok(Message::Binary(_)) => {
                        warn!("ignoring binary frame");
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        // Unsolicited or late pongs just clear the pending ping.
                        ping_sent_at = None;
                    }
                    Ok(Message::Close(_)) => break,
                    Err(error) => {
                        if is_frame_size_violation(&error) {
                            close_frame_too_large(socket).await;
                        } else {
                            debug!(error = %error, "websocket receive failed");
                        }
                        break;
                    }
                }
            }
        }
    }
}
