use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use huddle_common::protocol::{self, ServerEvent};
use tracing::error;

use super::MAX_FRAME_BYTES;

/// Encode and send one server event. An event that cannot be encoded is
/// logged and skipped; only a failed socket write is an error.
pub async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), ()> {
    let encoded = match protocol::encode(event) {
        Ok(encoded) => encoded,
        Err(encode_error) => {
            error!(error = %encode_error, event = event.name(), "failed to encode server event");
            return Ok(());
        }
    };
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

pub fn frame_size_exceeded_reason() -> String {
    format!("websocket frame exceeds maximum size of {MAX_FRAME_BYTES} bytes")
}

pub fn is_frame_size_violation(error: &axum::Error) -> bool {
    is_size_message(&error.to_string())
}

pub async fn close_frame_too_large(socket: &mut WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::SIZE,
            reason: frame_size_exceeded_reason().into(),
        })))
        .await;
}

fn is_size_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}
