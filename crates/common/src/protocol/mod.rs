// Frame codec for the huddle.v1 WebSocket protocol.
//
// Every frame is a JSON object `{"event": <name>, "data": <payload>}`.

pub mod events;

pub use events::{ClientEvent, ServerEvent};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const PROTOCOL_VERSION: &str = "huddle.v1";

/// Event names the relay handles. Anything else decodes to
/// [`FrameError::UnknownEvent`].
pub const CLIENT_EVENT_NAMES: &[&str] = &[
    "user_join",
    "join_channel",
    "leave_channel",
    "send_message",
    "typing_start",
    "typing_stop",
    "add_reaction",
    "get_channel_activity",
    "search_messages",
    "join_collaborative_room",
    "leave_collaborative_room",
    "collaborative_operation",
    "request_edit_lock",
    "release_edit_lock",
    "update_presence",
    "user_activity_change",
    "ping",
];

pub const SERVER_EVENT_NAMES: &[&str] = &[
    "connection_confirmed",
    "channels_list",
    "channel_joined",
    "new_message",
    "mention_notification",
    "user_joined_channel",
    "user_left_channel",
    "channel_users_updated",
    "user_typing",
    "message_reaction_updated",
    "channel_activity",
    "search_results",
    "collaborative_state_sync",
    "operation_applied",
    "edit_lock_response",
    "field_locked",
    "field_unlocked",
    "participant_joined",
    "participant_left",
    "participants_updated",
    "presence_updated",
    "user_activity_updated",
    "pong",
    "clients_count",
    "error",
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown event `{0}`")]
    UnknownEvent(String),
    #[error("invalid payload for `{event}`: {reason}")]
    InvalidPayload { event: String, reason: String },
}

impl FrameError {
    /// The event name involved, when the envelope itself parsed.
    pub fn event(&self) -> Option<&str> {
        match self {
            Self::Malformed(_) => None,
            Self::UnknownEvent(event) | Self::InvalidPayload { event, .. } => Some(event),
        }
    }
}

#[derive(Deserialize)]
struct RawEnvelope {
    event: String,
    #[serde(default)]
    data: Value,
}

/// Decode an inbound client frame.
pub fn decode_client_frame(text: &str) -> Result<ClientEvent, FrameError> {
    decode_frame(text, CLIENT_EVENT_NAMES)
}

/// Decode a frame sent by the relay.
pub fn decode_server_frame(text: &str) -> Result<ServerEvent, FrameError> {
    decode_frame(text, SERVER_EVENT_NAMES)
}

/// Serialize an event into a text frame.
pub fn encode<T: Serialize>(event: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

fn decode_frame<T: DeserializeOwned>(text: &str, known: &[&str]) -> Result<T, FrameError> {
    let envelope: RawEnvelope =
        serde_json::from_str(text).map_err(|err| FrameError::Malformed(err.to_string()))?;

    if !known.contains(&envelope.event.as_str()) {
        return Err(FrameError::UnknownEvent(envelope.event));
    }

    let data = match envelope.data {
        Value::Null => Value::Object(Map::new()),
        other => other,
    };

    serde_json::from_value(json!({ "event": envelope.event, "data": data })).map_err(|err| {
        FrameError::InvalidPayload { event: envelope.event.clone(), reason: err.to_string() }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_data_is_treated_as_empty_object() {
        let event = decode_client_frame(r#"{"event":"get_channel_activity"}"#)
            .expect("frame without data should decode");
        assert_eq!(event, ClientEvent::GetChannelActivity {});

        let ping = decode_client_frame(r#"{"event":"ping","data":null}"#)
            .expect("ping with null data should decode");
        assert_eq!(ping, ClientEvent::Ping { client_timestamp: None, platform: None });
    }

    #[test]
    fn distinguishes_malformed_unknown_and_invalid() {
        assert!(matches!(decode_client_frame("not json"), Err(FrameError::Malformed(_))));
        assert!(matches!(decode_client_frame(r#"{"data":{}}"#), Err(FrameError::Malformed(_))));

        let unknown = decode_client_frame(r#"{"event":"teleport","data":{}}"#)
            .expect_err("unknown event should fail");
        assert_eq!(unknown, FrameError::UnknownEvent("teleport".to_string()));
        assert_eq!(unknown.event(), Some("teleport"));

        let invalid = decode_client_frame(r#"{"event":"join_channel","data":{"channel":7}}"#)
            .expect_err("bad payload should fail");
        assert!(matches!(invalid, FrameError::InvalidPayload { ref event, .. } if event == "join_channel"));
    }

    #[test]
    fn edit_lock_request_accepts_field_alias() {
        let event = decode_client_frame(
            r#"{"event":"request_edit_lock","data":{"roomId":"r1","field":"task_7_title","identityId":"a"}}"#,
        )
        .expect("field alias should decode");
        assert_eq!(
            event,
            ClientEvent::RequestEditLock {
                room_id: "r1".to_string(),
                field_key: "task_7_title".to_string(),
                identity_id: "a".to_string(),
            }
        );
    }

    #[test]
    fn name_table_matches_variant_names() {
        let events = [
            ClientEvent::GetChannelActivity {},
            ClientEvent::Ping { client_timestamp: Some(1), platform: None },
            ClientEvent::LeaveChannel { channel: "general".into(), identity_id: "a".into() },
        ];
        for event in events {
            assert!(CLIENT_EVENT_NAMES.contains(&event.name()));
            let frame = encode(&event).expect("client event should encode");
            let value: Value = serde_json::from_str(&frame).expect("frame should be json");
            assert_eq!(value["event"], event.name());
        }

        let clients = ServerEvent::ClientsCount { count: 2 };
        assert!(SERVER_EVENT_NAMES.contains(&clients.name()));
    }
}
