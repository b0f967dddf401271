use std::future::Future;

use axum::{
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use huddle_common::protocol::ServerEvent;
use serde_json::{json, Value};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    UnknownChannel,
    RoomNotFound,
    MessageNotFound,
    LockConflict,
    NotParticipant,
    InvalidOperation,
    DocumentTooLarge,
    ValidationFailed,
    InvalidEvent,
    NotFound,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UnknownChannel => "UNKNOWN_CHANNEL",
            Self::RoomNotFound => "ROOM_NOT_FOUND",
            Self::MessageNotFound => "MESSAGE_NOT_FOUND",
            Self::LockConflict => "LOCK_CONFLICT",
            Self::NotParticipant => "NOT_PARTICIPANT",
            Self::InvalidOperation => "INVALID_OPERATION",
            Self::DocumentTooLarge => "DOCUMENT_TOO_LARGE",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::InvalidEvent => "INVALID_EVENT",
            Self::NotFound => "NOT_FOUND",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::UnknownChannel => StatusCode::NOT_FOUND,
            Self::RoomNotFound => StatusCode::NOT_FOUND,
            Self::MessageNotFound => StatusCode::NOT_FOUND,
            Self::LockConflict => StatusCode::CONFLICT,
            Self::NotParticipant => StatusCode::FORBIDDEN,
            Self::InvalidOperation => StatusCode::UNPROCESSABLE_ENTITY,
            Self::DocumentTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::ValidationFailed => StatusCode::BAD_REQUEST,
            Self::InvalidEvent => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub const fn retryable(self) -> bool {
        matches!(self, Self::LockConflict | Self::InternalError)
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::UnknownChannel => "channel does not exist",
            Self::RoomNotFound => "collaborative room has not been opened",
            Self::MessageNotFound => "message is not in the channel's recent history",
            Self::LockConflict => "field is locked by another participant",
            Self::NotParticipant => "identity has not joined the room on this connection",
            Self::InvalidOperation => "operation cannot be applied to the shared document",
            Self::DocumentTooLarge => "shared document would exceed its size limit",
            Self::ValidationFailed => "request validation failed",
            Self::InvalidEvent => "event payload is invalid",
            Self::NotFound => "requested resource not found",
            Self::InternalError => "internal server error",
        }
    }
}

/// Recoverable failures of chat and collaboration operations.
///
/// Every variant is scoped to the calling connection and never affects
/// another channel or room.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollabError {
    #[error("unknown channel `{0}`")]
    UnknownChannel(String),
    #[error("room `{0}` not found")]
    RoomNotFound(String),
    #[error("message `{message_id}` not found in channel `{channel}`")]
    MessageNotFound { channel: String, message_id: String },
    #[error("field `{field}` is locked by {holder_name}")]
    LockConflict { field: String, holder_id: String, holder_name: String },
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("document would grow to {size} bytes, limit is {limit}")]
    DocumentTooLarge { size: usize, limit: usize },
    #[error("{0}")]
    Validation(String),
}

impl CollabError {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownChannel(_) => ErrorCode::UnknownChannel,
            Self::RoomNotFound(_) => ErrorCode::RoomNotFound,
            Self::MessageNotFound { .. } => ErrorCode::MessageNotFound,
            Self::LockConflict { .. } => ErrorCode::LockConflict,
            Self::InvalidOperation(_) => ErrorCode::InvalidOperation,
            Self::DocumentTooLarge { .. } => ErrorCode::DocumentTooLarge,
            Self::Validation(_) => ErrorCode::ValidationFailed,
        }
    }

    /// Render as an `error` event for the calling connection.
    pub fn to_event(&self, channel: Option<&str>, room_id: Option<&str>) -> ServerEvent {
        let code = self.code();
        ServerEvent::Error {
            code: code.as_str().to_string(),
            message: self.to_string(),
            retryable: code.retryable(),
            channel: channel.map(ToOwned::to_owned),
            room_id: room_id.map(ToOwned::to_owned),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayError {
    code: ErrorCode,
    message: String,
    details: Value,
    request_id: Option<String>,
}

impl RelayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: json!({}), request_id: None }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn from_status(status: StatusCode, message: impl Into<String>) -> Self {
        Self::new(default_code_for_status(status), message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

impl From<CollabError> for RelayError {
    fn from(error: CollabError) -> Self {
        let details = match &error {
            CollabError::UnknownChannel(channel) => json!({ "channel": channel }),
            CollabError::RoomNotFound(room_id) => json!({ "room_id": room_id }),
            _ => json!({}),
        };
        Self::new(error.code(), error.to_string()).with_details(details)
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let request_id = self.request_id.or_else(current_request_id);

        let mut response = (
            self.code.status(),
            Json(json!({
                "error": {
                    "code": self.code.as_str(),
                    "message": self.message,
                    "retryable": self.code.retryable(),
                    "request_id": request_id.clone(),
                    "details": self.details,
                }
            })),
        )
            .into_response();

        if let Some(request_id) = request_id {
            attach_request_id_header(&mut response, &request_id);
        }

        response
    }
}

pub fn default_code_for_status(status: StatusCode) -> ErrorCode {
    match status {
        StatusCode::BAD_REQUEST => ErrorCode::ValidationFailed,
        StatusCode::NOT_FOUND => ErrorCode::NotFound,
        StatusCode::CONFLICT => ErrorCode::LockConflict,
        StatusCode::UNPROCESSABLE_ENTITY => ErrorCode::InvalidOperation,
        StatusCode::PAYLOAD_TOO_LARGE => ErrorCode::DocumentTooLarge,
        _ => ErrorCode::InternalError,
    }
}

pub async fn with_request_id_scope<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(header) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }
}
