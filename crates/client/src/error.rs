use thiserror::Error;

/// Failures surfaced to the application by the client session and driver.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The action cannot be queued and the session is not connected.
    #[error("not connected to the relay")]
    Disconnected,

    #[error("websocket transport failed: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid relay url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
}
