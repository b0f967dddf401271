// Read-only HTTP endpoints served next to the WebSocket route.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use huddle_common::types::ChatMessage;
use serde::{Deserialize, Serialize};

use crate::engine::RelayEngine;
use crate::error::RelayError;
use crate::metrics;

pub const HTTP_HISTORY_LIMIT: usize = 50;
const DEFAULT_HISTORY_CHANNEL: &str = "general";

pub fn router(engine: Arc<RelayEngine>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/channels", get(list_channels))
        .route("/messages", get(list_messages))
        .route("/metrics", get(render_metrics))
        .with_state(engine)
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub connections: usize,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSummary {
    pub name: String,
    pub user_count: usize,
    pub last_activity: DateTime<Utc>,
    pub message_count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChannelsResponse {
    pub channels: Vec<ChannelSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    channel: Option<String>,
}

async fn health(State(engine): State<Arc<RelayEngine>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: Utc::now(),
        connections: engine.connection_count().await,
        started_at: engine.started_at(),
    })
}

async fn list_channels(
    State(engine): State<Arc<RelayEngine>>,
) -> Result<Json<ChannelsResponse>, RelayError> {
    let mut activity = engine.channel_activity().await?;
    let channels = engine
        .channel_names()
        .iter()
        .filter_map(|name| {
            activity.remove(name).map(|entry| ChannelSummary {
                name: name.clone(),
                user_count: entry.user_count,
                last_activity: entry.last_activity,
                message_count: entry.message_count,
            })
        })
        .collect();
    Ok(Json(ChannelsResponse { channels }))
}

async fn list_messages(
    State(engine): State<Arc<RelayEngine>>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<MessagesResponse>, RelayError> {
    let channel = query
        .channel
        .filter(|channel| !channel.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HISTORY_CHANNEL.to_string());
    let messages = engine.recent_messages(&channel, HTTP_HISTORY_LIMIT).await?;
    Ok(Json(MessagesResponse { messages }))
}

async fn render_metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::global_metrics().render_prometheus(),
    )
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use huddle_common::protocol::ClientEvent;
    use serde_json::Value;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use super::*;
    use crate::config::EngineSettings;

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).expect("request should build"))
            .await
            .expect("request should return a response");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body should be readable");
        (status, serde_json::from_slice(&body).expect("body should be json"))
    }

    #[tokio::test]
    async fn health_reports_connection_count() {
        let engine = Arc::new(RelayEngine::new(EngineSettings::default()));
        let (sender, _rx) = mpsc::unbounded_channel();
        engine.connect(sender).await;

        let (status, body) = get_json(router(engine), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 1);
    }

    #[tokio::test]
    async fn messages_default_to_general_and_reject_unknown_channels() {
        let engine = Arc::new(RelayEngine::new(EngineSettings::default()));
        let (sender, _rx) = mpsc::unbounded_channel();
        let connection_id = engine.connect(sender).await;
        engine
            .dispatch(
                connection_id,
                ClientEvent::SendMessage {
                    channel: "general".to_string(),
                    identity_id: "alice".to_string(),
                    display_name: "Alice".to_string(),
                    text: "hello".to_string(),
                    correlation_id: None,
                },
            )
            .await;

        let (status, body) = get_json(router(Arc::clone(&engine)), "/messages").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["messages"][0]["text"], "hello");
        assert_eq!(body["messages"][0]["authorName"], "Alice");

        let (status, body) = get_json(router(engine), "/messages?channel=lobby").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "UNKNOWN_CHANNEL");
        assert_eq!(body["error"]["details"]["channel"], "lobby");
    }

    #[tokio::test]
    async fn channels_are_listed_in_configured_order() {
        let engine = Arc::new(RelayEngine::new(EngineSettings::default()));
        let (status, body) = get_json(router(engine), "/channels").await;

        assert_eq!(status, StatusCode::OK);
        let names: Vec<&str> = body["channels"]
            .as_array()
            .expect("channels should be an array")
            .iter()
            .filter_map(|channel| channel["name"].as_str())
            .collect();
        assert_eq!(names, vec!["general", "development", "random"]);
        assert_eq!(body["channels"][0]["messageCount"], 0);
    }

    #[tokio::test]
    async fn metrics_are_exposed_as_prometheus_text() {
        let engine = Arc::new(RelayEngine::new(EngineSettings::default()));
        let response = router(engine)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).expect("request should build"))
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body should be readable");
        let text = String::from_utf8(body.to_vec()).expect("metrics should be utf-8");
        assert!(text.contains("relay_active_connections"));
    }
}
