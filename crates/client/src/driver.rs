// WebSocket driver connecting a `ChatSession` to a relay.
//
// One task owns the socket. Application code mutates the session through a
// `SessionHandle`; the driver flushes buffered frames, feeds inbound events
// back into the session and reconnects with the session's backoff policy.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use huddle_common::protocol::{decode_server_frame, encode};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;

use crate::cache::MessageCache;
use crate::error::ClientError;
use crate::session::{ChatSession, ConnectionState};

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    url: Url,
    pub ping_interval: Duration,
}

impl ClientConfig {
    /// Validate a relay WebSocket url. Plain `ws` is only accepted for
    /// loopback hosts.
    pub fn new(url: &str) -> Result<Self, ClientError> {
        let parsed = Url::parse(url)
            .map_err(|error| ClientError::InvalidUrl { url: url.to_string(), reason: error.to_string() })?;
        match parsed.scheme() {
            "wss" => {}
            "ws" if is_loopback_host(parsed.host_str()) => {}
            _ => {
                return Err(ClientError::InvalidUrl {
                    url: url.to_string(),
                    reason: "relay url must use wss (ws is allowed only for localhost)".to_string(),
                })
            }
        }
        Ok(Self { url: parsed, ping_interval: DEFAULT_PING_INTERVAL })
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok_and(|addr| addr.is_loopback())
}

// ── Handle ──────────────────────────────────────────────────────────

struct Shared<C: MessageCache> {
    session: Mutex<ChatSession<C>>,
    flush: Notify,
    retry: Notify,
    revision: watch::Sender<u64>,
    shutdown: watch::Sender<bool>,
}

impl<C: MessageCache> Shared<C> {
    fn bump(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }
}

/// Cloneable access to a running session.
pub struct SessionHandle<C: MessageCache> {
    shared: Arc<Shared<C>>,
}

impl<C: MessageCache> Clone for SessionHandle<C> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<C: MessageCache> SessionHandle<C> {
    pub async fn read<R>(&self, f: impl FnOnce(&ChatSession<C>) -> R) -> R {
        let session = self.shared.session.lock().await;
        f(&session)
    }

    /// Mutate the session and wake the driver to flush any new frames.
    pub async fn update<R>(&self, f: impl FnOnce(&mut ChatSession<C>) -> R) -> R {
        let result = {
            let mut session = self.shared.session.lock().await;
            f(&mut session)
        };
        self.shared.flush.notify_one();
        self.shared.bump();
        result
    }

    pub async fn send_message(&self, text: &str) -> String {
        self.update(|session| session.send_message(text)).await
    }

    pub async fn switch_channel(&self, channel: &str) {
        self.update(|session| session.switch_channel(channel)).await
    }

    pub async fn state(&self) -> ConnectionState {
        self.read(|session| session.state()).await
    }

    /// Wait until `predicate` holds for the session.
    pub async fn wait_until(&self, mut predicate: impl FnMut(&ChatSession<C>) -> bool) {
        let mut changes = self.shared.revision.subscribe();
        loop {
            if self.read(&mut predicate).await {
                return;
            }
            if changes.changed().await.is_err() {
                return;
            }
        }
    }

    /// Leave the given-up state and try connecting again.
    pub async fn reconnect(&self) {
        self.update(|session| session.resume()).await;
        self.shared.retry.notify_one();
    }

    pub fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
    }
}

// ── Driver ──────────────────────────────────────────────────────────

/// Start the driver task for `session`.
pub fn spawn<C>(config: ClientConfig, session: ChatSession<C>) -> (SessionHandle<C>, JoinHandle<()>)
where
    C: MessageCache + 'static,
{
    let (revision, _) = watch::channel(0);
    let (shutdown, _) = watch::channel(false);
    let shared = Arc::new(Shared {
        session: Mutex::new(session),
        flush: Notify::new(),
        retry: Notify::new(),
        revision,
        shutdown,
    });
    let handle = SessionHandle { shared: Arc::clone(&shared) };
    let span = info_span!("client.driver", url = %config.url);
    let task = tokio::spawn(run(config, shared).instrument(span));
    (handle, task)
}

async fn run<C: MessageCache>(config: ClientConfig, shared: Arc<Shared<C>>) {
    let mut shutdown = shared.shutdown.subscribe();

    loop {
        if *shutdown.borrow() {
            break;
        }

        shared.session.lock().await.connecting();
        shared.bump();

        let attempt = tokio::select! {
            result = connect_async(config.url.as_str()) => result,
            _ = shutdown.changed() => break,
        };

        let delay = match attempt {
            Ok((socket, _)) => {
                info!("connected to relay");
                shared.session.lock().await.on_connected();
                shared.bump();

                let reason = pump(&config, &shared, socket, &mut shutdown).await;
                let mut session = shared.session.lock().await;
                session.on_connection_lost();
                let delay = session.reconnect_delay();
                drop(session);
                shared.bump();
                info!(reason = %reason, "relay connection closed");
                Some(delay)
            }
            Err(error) => {
                let mut session = shared.session.lock().await;
                let delay = session.on_connect_failed();
                let attempts = session.consecutive_failures();
                drop(session);
                shared.bump();
                warn!(error = %error, attempts, retry_in = ?delay, "relay connection failed");
                delay
            }
        };

        if *shutdown.borrow() {
            break;
        }

        match delay {
            Some(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shared.retry.notified() => {}
                    _ = shutdown.changed() => break,
                }
            }
            None => {
                tokio::select! {
                    _ = shared.retry.notified() => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }

    let mut session = shared.session.lock().await;
    session.on_connection_lost();
    drop(session);
    shared.bump();
    debug!("client driver stopped");
}

type Socket = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Pump one established connection until it ends. Returns the reason.
async fn pump<C: MessageCache>(
    config: &ClientConfig,
    shared: &Shared<C>,
    socket: Socket,
    shutdown: &mut watch::Receiver<bool>,
) -> String {
    let (mut sink, mut stream) = socket.split();
    let mut ping = tokio::time::interval_at(Instant::now() + config.ping_interval, config.ping_interval);

    loop {
        let frames = shared.session.lock().await.drain_outbound();
        let mut frames = frames.into_iter();
        while let Some(event) = frames.next() {
            let text = match encode(&event) {
                Ok(text) => text,
                Err(error) => {
                    warn!(event = event.name(), error = %error, "dropping frame that failed to encode");
                    continue;
                }
            };
            if let Err(error) = sink.send(Message::Text(text.into())).await {
                let mut unsent = vec![event];
                unsent.extend(frames);
                shared.session.lock().await.return_unsent(unsent);
                return format!("send failed: {error}");
            }
        }

        tokio::select! {
            _ = shared.flush.notified() => {}
            _ = ping.tick() => {
                let mut session = shared.session.lock().await;
                if session.liveness().is_overdue(Instant::now()) {
                    return "pong timeout".to_string();
                }
                if let Err(error) = session.ping() {
                    debug!(error = %error, "skipped ping");
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match decode_server_frame(text.as_str()) {
                    Ok(event) => {
                        shared.session.lock().await.handle_event(event);
                        shared.bump();
                    }
                    Err(error) => warn!(error = %error, "dropping undecodable relay frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    return format!("closed by relay: {frame:?}");
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => return format!("read failed: {error}"),
                None => return "stream ended".to_string(),
            },
            _ = shutdown.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                return "shutdown".to_string();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_secure_and_loopback_urls() {
        assert!(ClientConfig::new("wss://relay.example.com/ws").is_ok());
        assert!(ClientConfig::new("ws://localhost:3001/ws").is_ok());
        assert!(ClientConfig::new("ws://127.0.0.1:3001/ws").is_ok());
        assert!(ClientConfig::new("ws://[::1]:3001/ws").is_ok());
    }

    #[test]
    fn rejects_plain_ws_to_remote_hosts_and_garbage() {
        let error = ClientConfig::new("ws://relay.example.com/ws").expect_err("remote ws should fail");
        assert!(error.to_string().contains("must use wss"));
        assert!(matches!(ClientConfig::new("not a url"), Err(ClientError::InvalidUrl { .. })));
        assert!(matches!(ClientConfig::new("https://relay.example.com"), Err(ClientError::InvalidUrl { .. })));
    }
}
