// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. CORS origins are read here and handed to cors.rs.

use std::net::SocketAddr;

pub const DEFAULT_CHANNELS: &[&str] = &["general", "development", "random"];

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Log filter directive (e.g. `info`, `huddle_relay=debug`).
    pub log_filter: String,
    /// Emit JSON log lines instead of human-readable text.
    pub log_json: bool,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    pub engine: EngineSettings,
}

/// Limits and fixed topology used by the relay engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Channels created at startup. Unknown channels are rejected.
    pub channels: Vec<String>,
    /// Messages retained per channel.
    pub channel_capacity: usize,
    /// Messages included in `channel_joined`.
    pub join_history: usize,
    /// Operations retained per room.
    pub operation_log_capacity: usize,
    /// Operations included in `collaborative_state_sync`.
    pub state_sync_history: usize,
    /// Serialized size limit of a room's shared document.
    pub max_document_bytes: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            channels: DEFAULT_CHANNELS.iter().map(|name| name.to_string()).collect(),
            channel_capacity: 100,
            join_history: 50,
            operation_log_capacity: 100,
            state_sync_history: 20,
            max_document_bytes: 1024 * 1024,
        }
    }
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `HUDDLE_RELAY_HOST` | `0.0.0.0` |
    /// | `HUDDLE_RELAY_PORT` | `3001` |
    /// | `HUDDLE_RELAY_LOG_FILTER` | `info` |
    /// | `HUDDLE_RELAY_LOG_FORMAT` | `text` |
    /// | `HUDDLE_RELAY_CHANNELS` | `general,development,random` |
    /// | `HUDDLE_RELAY_CHANNEL_CAPACITY` | `100` |
    /// | `HUDDLE_RELAY_JOIN_HISTORY` | `50` |
    /// | `HUDDLE_RELAY_OPERATION_LOG_CAPACITY` | `100` |
    /// | `HUDDLE_RELAY_STATE_SYNC_HISTORY` | `20` |
    /// | `HUDDLE_RELAY_MAX_DOCUMENT_BYTES` | `1048576` |
    /// | `HUDDLE_RELAY_CORS_ORIGINS` | *(none, cors.rs uses dev defaults)* |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("HUDDLE_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 =
            env("HUDDLE_RELAY_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(3001);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let log_filter = env("HUDDLE_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_json = env("HUDDLE_RELAY_LOG_FORMAT")
            .map(|format| format.trim().eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let cors_origins = env("HUDDLE_RELAY_CORS_ORIGINS").ok();

        let defaults = EngineSettings::default();
        let positive = |key: &str, fallback: usize| {
            env(key)
                .ok()
                .and_then(|v| v.trim().parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(fallback)
        };

        let engine = EngineSettings {
            channels: env("HUDDLE_RELAY_CHANNELS")
                .ok()
                .map(|raw| parse_channels(&raw))
                .filter(|channels| !channels.is_empty())
                .unwrap_or_else(|| defaults.channels.clone()),
            channel_capacity: positive("HUDDLE_RELAY_CHANNEL_CAPACITY", defaults.channel_capacity),
            join_history: positive("HUDDLE_RELAY_JOIN_HISTORY", defaults.join_history),
            operation_log_capacity: positive(
                "HUDDLE_RELAY_OPERATION_LOG_CAPACITY",
                defaults.operation_log_capacity,
            ),
            state_sync_history: positive(
                "HUDDLE_RELAY_STATE_SYNC_HISTORY",
                defaults.state_sync_history,
            ),
            max_document_bytes: positive(
                "HUDDLE_RELAY_MAX_DOCUMENT_BYTES",
                defaults.max_document_bytes,
            ),
        };

        Self { listen_addr, log_filter, log_json, cors_origins, engine }
    }
}

/// Split a comma-separated channel list, dropping blanks and duplicates
/// while keeping first-seen order.
fn parse_channels(raw: &str) -> Vec<String> {
    let mut channels: Vec<String> = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|name| !name.is_empty()) {
        if !channels.iter().any(|existing| existing == name) {
            channels.push(name.to_string());
        }
    }
    channels
}
