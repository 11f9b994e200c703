//! The push subsystem: authenticates, holds the SSE connection, and turns
//! frames into status changes and notifications for the sync manager.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use url::Url;

use super::notifications::{
    parse_message, ControlType, IncomingMessage, Notification, StreamingError,
};
use super::sse::SseParser;
use crate::api::{SplitApi, Token};
use crate::sync::backoff::Backoff;
use crate::tasks::Shutdown;
use crate::telemetry::TelemetryRuntime;
use crate::{Error, Result};

/// Force a reconnect when no frame (not even a keepalive) arrives for this
/// long.
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(70);
/// Refresh the streaming token this long before it expires.
pub const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(600);

const RECONNECT_BACKOFF_BASE: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// What the push subsystem tells the sync manager.
#[derive(Debug)]
pub enum PushMessage {
    /// Streaming is up and delivering. Stop aggressive polling, catch up
    /// once.
    Up,
    /// Streaming is degraded (reconnecting, paused, or publishers are
    /// gone). Resume polling.
    Down,
    /// Streaming is off for the rest of the session.
    Disabled,
    Notification(Notification),
}

enum ConnectionEnd {
    Retry,
    NonRetryable,
    TokenRefresh,
    Shutdown,
}

/// Tracks per-channel publisher counts from occupancy metadata. Streaming
/// only counts as up while somebody is publishing.
struct OccupancyTracker {
    publishers: HashMap<String, i64>,
}

impl OccupancyTracker {
    fn new() -> OccupancyTracker {
        // Assume a healthy connection until proven wrong.
        OccupancyTracker {
            publishers: HashMap::from([
                ("control_pri".to_owned(), 2),
                ("control_sec".to_owned(), 2),
            ]),
        }
    }

    fn update(&mut self, channel: &str, publishers: i64) {
        // The occupancy prefix is part of the channel name on the wire.
        let name = channel.rsplit(']').next().unwrap_or(channel);
        self.publishers.insert(name.to_owned(), publishers);
    }

    fn any_publishers(&self) -> bool {
        self.publishers.values().any(|count| *count > 0)
    }
}

pub struct PushManager {
    api: Arc<SplitApi>,
    /// Dedicated client without a read timeout; idle streams are healthy as
    /// long as keepalives arrive.
    sse_client: reqwest::Client,
    streaming_url: String,
    tx: mpsc::Sender<PushMessage>,
    telemetry: Arc<TelemetryRuntime>,
}

impl PushManager {
    pub fn new(
        api: Arc<SplitApi>,
        streaming_url: String,
        connect_timeout: Duration,
        tx: mpsc::Sender<PushMessage>,
        telemetry: Arc<TelemetryRuntime>,
    ) -> Result<PushManager> {
        let sse_client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(PushManager {
            api,
            sse_client,
            streaming_url,
            tx,
            telemetry,
        })
    }

    /// Drive the streaming session until shutdown or a non-retryable
    /// condition. Each reconnect backs off exponentially with jitter.
    pub async fn run(self, mut shutdown: Shutdown) {
        let mut backoff = Backoff::new(RECONNECT_BACKOFF_BASE, RECONNECT_BACKOFF_MAX);

        loop {
            if shutdown.is_signalled() {
                return;
            }

            match self.session(&mut shutdown, &mut backoff).await {
                ConnectionEnd::Shutdown => return,
                ConnectionEnd::NonRetryable => {
                    log::info!(target: "splitio", "streaming disabled for this session, relying on polling");
                    let _ = self.tx.send(PushMessage::Disabled).await;
                    return;
                }
                ConnectionEnd::TokenRefresh => {
                    self.telemetry.record_token_refresh();
                    // Reconnect immediately with a fresh token.
                    backoff.reset();
                }
                ConnectionEnd::Retry => {
                    let _ = self.tx.send(PushMessage::Down).await;
                    let wait = backoff.next();
                    log::debug!(target: "splitio", "streaming retry in {wait:?}");
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = shutdown.signalled() => return,
                    }
                }
            }
        }
    }

    /// One authenticate-connect-read cycle.
    async fn session(&self, shutdown: &mut Shutdown, backoff: &mut Backoff) -> ConnectionEnd {
        let token = match self.api.authenticate().await {
            Ok(token) if token.push_enabled => token,
            Ok(_) => return ConnectionEnd::NonRetryable,
            Err(Error::PushAuthFailed) | Err(Error::Unauthorized) => {
                return ConnectionEnd::NonRetryable
            }
            Err(err) => {
                log::warn!(target: "splitio", "streaming auth failed: {err}");
                return ConnectionEnd::Retry;
            }
        };

        let url = match self.stream_url(&token) {
            Ok(url) => url,
            Err(_) => return ConnectionEnd::NonRetryable,
        };

        let response = match self
            .sse_client
            .get(url)
            .header("Accept", "text/event-stream")
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                log::warn!(target: "splitio", "streaming connect rejected: {}", response.status());
                return ConnectionEnd::Retry;
            }
            Err(err) => {
                log::warn!(target: "splitio", "streaming connect error: {err}");
                return ConnectionEnd::Retry;
            }
        };

        log::debug!(target: "splitio", "streaming connection established");
        backoff.reset();
        let _ = self.tx.send(PushMessage::Up).await;

        let refresh_in = token_refresh_in(&token);
        let refresh_deadline = tokio::time::Instant::now() + refresh_in;

        let mut stream = response.bytes_stream();
        let mut parser = SseParser::new();
        let mut occupancy = OccupancyTracker::new();
        let mut occupancy_up = true;

        loop {
            tokio::select! {
                chunk = tokio::time::timeout(KEEPALIVE_TIMEOUT, stream.next()) => {
                    let chunk = match chunk {
                        Err(_) => {
                            log::warn!(target: "splitio", "no streaming frame within keep-alive window, reconnecting");
                            return ConnectionEnd::Retry;
                        }
                        Ok(None) => {
                            log::debug!(target: "splitio", "streaming connection closed by the server");
                            return ConnectionEnd::Retry;
                        }
                        Ok(Some(Err(err))) => {
                            log::warn!(target: "splitio", "streaming read error: {err}");
                            return ConnectionEnd::Retry;
                        }
                        Ok(Some(Ok(bytes))) => bytes,
                    };

                    for event in parser.feed(&String::from_utf8_lossy(&chunk)) {
                        match self.handle_event(&event.event, &event.data, &mut occupancy, &mut occupancy_up).await {
                            Some(end) => return end,
                            None => {}
                        }
                    }
                }
                _ = tokio::time::sleep_until(refresh_deadline) => {
                    log::debug!(target: "splitio", "streaming token close to expiry, refreshing");
                    return ConnectionEnd::TokenRefresh;
                }
                _ = shutdown.signalled() => return ConnectionEnd::Shutdown,
            }
        }
    }

    async fn handle_event(
        &self,
        event: &Option<String>,
        data: &str,
        occupancy: &mut OccupancyTracker,
        occupancy_up: &mut bool,
    ) -> Option<ConnectionEnd> {
        match event.as_deref() {
            Some("message") | None => {
                let message = match parse_message(data) {
                    Ok(message) => message,
                    Err(err) => {
                        log::warn!(target: "splitio", "unparseable streaming message: {err}");
                        return None;
                    }
                };
                self.telemetry.record_streaming_event();
                match message {
                    IncomingMessage::Notification(notification) => {
                        let _ = self.tx.send(PushMessage::Notification(notification)).await;
                    }
                    IncomingMessage::Control(ControlType::StreamingDisabled) => {
                        return Some(ConnectionEnd::NonRetryable);
                    }
                    IncomingMessage::Control(ControlType::StreamingPaused) => {
                        let _ = self.tx.send(PushMessage::Down).await;
                    }
                    IncomingMessage::Control(
                        ControlType::StreamingResumed | ControlType::StreamingEnabled,
                    ) => {
                        if *occupancy_up {
                            let _ = self.tx.send(PushMessage::Up).await;
                        }
                    }
                    IncomingMessage::Occupancy { channel, publishers } => {
                        occupancy.update(&channel, publishers);
                        let now_up = occupancy.any_publishers();
                        if now_up != *occupancy_up {
                            *occupancy_up = now_up;
                            let message = if now_up { PushMessage::Up } else { PushMessage::Down };
                            let _ = self.tx.send(message).await;
                        }
                    }
                }
                None
            }
            Some("error") => {
                match StreamingError::parse(data) {
                    Ok(error) if error.is_retryable() => {
                        log::warn!(target: "splitio", "retryable streaming error {}: {}", error.code, error.message);
                        Some(ConnectionEnd::Retry)
                    }
                    Ok(error) => {
                        log::warn!(target: "splitio", "non-retryable streaming error {}: {}", error.code, error.message);
                        Some(ConnectionEnd::NonRetryable)
                    }
                    Err(_) => Some(ConnectionEnd::Retry),
                }
            }
            _ => None,
        }
    }

    fn stream_url(&self, token: &Token) -> Result<Url> {
        let channels = format_channels(&token.channels).join(",");
        Url::parse_with_params(
            &self.streaming_url,
            &[
                ("v", "1.1"),
                ("accessToken", token.token.as_str()),
                ("channels", channels.as_str()),
            ],
        )
        .map_err(Error::InvalidBaseUrl)
    }
}

/// Control channels subscribe with occupancy metadata so publisher counts
/// are pushed to us.
fn format_channels(channels: &[String]) -> Vec<String> {
    channels
        .iter()
        .map(|channel| {
            if channel.starts_with("control_") {
                format!("[?occupancy=metrics.publishers]{channel}")
            } else {
                channel.clone()
            }
        })
        .collect()
}

fn token_refresh_in(token: &Token) -> Duration {
    let now = chrono::Utc::now().timestamp();
    let refresh_at = token.exp - TOKEN_REFRESH_MARGIN.as_secs() as i64;
    Duration::from_secs((refresh_at - now).max(0) as u64)
}
