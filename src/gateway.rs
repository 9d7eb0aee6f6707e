//! Gateway (WebSocket) transport for the Discord API.
//!
//! This module owns the WebSocket connection lifecycle:
//!   - connect → receive HELLO → send IDENTIFY (or RESUME)
//!   - background heartbeat task
//!   - sequence number + session_id tracking
//!   - reconnect + RESUME on disconnect, bounded backoff
//!   - gateway send rate limiting (120 events / 60s)
//!
//! The client consumes a stream of [`GatewayEvent`] values through a
//! [`GatewayHandle`] and never touches `tokio_tungstenite` directly. The
//! [`Connector`] trait is the seam where tests substitute a scripted feed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::{GatewayIntents, DEFAULT_GATEWAY_URL};
use crate::error::GatewayError;
use crate::events::GatewayEvent;
use crate::types::GatewayPayload;

/// Discord allows at most 120 gateway sends per 60 seconds.
const SEND_BUDGET_MAX: u32 = 120;
const SEND_BUDGET_WINDOW: Duration = Duration::from_secs(60);

const MAX_RECONNECT_ATTEMPTS: u32 = 8;
const HELLO_TIMEOUT: Duration = Duration::from_secs(30);
const EVENT_BUFFER: usize = 256;

// ---------------------------------------------------------------------------
// Gateway send rate limiter
// ---------------------------------------------------------------------------

/// Sliding-window rate limiter for outbound gateway messages.
struct SendRateLimiter {
    timestamps: Vec<Instant>,
    budget: u32,
    window: Duration,
}

impl SendRateLimiter {
    fn new(budget: u32, window: Duration) -> Self {
        Self {
            timestamps: Vec::with_capacity(budget as usize),
            budget,
            window,
        }
    }

    /// How long the caller should wait before sending, or `None` if it can
    /// send now. Does not record the send.
    fn delay(&self) -> Option<Duration> {
        let now = Instant::now();
        let in_window: Vec<Instant> = self
            .timestamps
            .iter()
            .copied()
            .filter(|&t| now.duration_since(t) < self.window)
            .collect();

        if (in_window.len() as u32) < self.budget {
            return None;
        }

        let oldest = in_window.into_iter().min()?;
        let expires_at = oldest + self.window;
        (expires_at > now).then(|| expires_at - now)
    }

    /// Record a send at the current instant and prune old entries.
    fn record(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.timestamps
            .retain(|&t| now.duration_since(t) < window);
        self.timestamps.push(now);
    }
}

// ---------------------------------------------------------------------------
// Configuration / handle
// ---------------------------------------------------------------------------

/// Options for connecting to the Discord gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub token: String,
    pub intents: GatewayIntents,
    /// Initial gateway URL; resume URLs from READY take over afterwards.
    pub url: String,
}

impl GatewayConfig {
    pub fn new(token: impl Into<String>, intents: GatewayIntents) -> Self {
        Self {
            token: token.into(),
            intents,
            url: DEFAULT_GATEWAY_URL.to_string(),
        }
    }
}

/// A running gateway connection.
///
/// `events` closes when the driver stops; `driver` then yields why.
pub struct GatewayHandle {
    pub events: mpsc::Receiver<GatewayEvent>,
    pub driver: JoinHandle<Result<(), GatewayError>>,
}

/// Opens gateway connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: GatewayConfig) -> Result<GatewayHandle, GatewayError>;
}

/// The real WebSocket connector.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, config: GatewayConfig) -> Result<GatewayHandle, GatewayError> {
        let (event_tx, event_rx) = mpsc::channel::<GatewayEvent>(EVENT_BUFFER);
        let driver = tokio::spawn(gateway_driver(config, event_tx));
        Ok(GatewayHandle {
            events: event_rx,
            driver,
        })
    }
}

// ---------------------------------------------------------------------------
// Internal session state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct SessionState {
    session_id: Option<String>,
    resume_gateway_url: Option<String>,
    sequence: Option<u64>,
}

impl SessionState {
    fn resume_payload(&self, token: &str) -> Option<serde_json::Value> {
        let session_id = self.session_id.as_ref()?;
        let seq = self.sequence?;
        Some(json!({
            "op": 6,
            "d": { "token": token, "session_id": session_id, "seq": seq }
        }))
    }
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug)]
enum DisconnectReason {
    ShouldResume,
    ShouldReidentify,
    Fatal(GatewayError),
    EventChannelClosed,
}

// ---------------------------------------------------------------------------
// The driver loop (runs in a spawned task)
// ---------------------------------------------------------------------------

async fn gateway_driver(
    config: GatewayConfig,
    event_tx: mpsc::Sender<GatewayEvent>,
) -> Result<(), GatewayError> {
    let session = Arc::new(Mutex::new(SessionState::default()));
    let mut reconnect_attempts: u32 = 0;

    loop {
        if reconnect_attempts > 0 {
            if reconnect_attempts > MAX_RECONNECT_ATTEMPTS {
                error!("exceeded max reconnect attempts, giving up");
                return Err(GatewayError::ReconnectExhausted(MAX_RECONNECT_ATTEMPTS));
            }
            let backoff = backoff_delay(reconnect_attempts);
            warn!(
                delay_ms = backoff.as_millis() as u64,
                attempt = reconnect_attempts,
                "backing off before reconnect"
            );
            tokio::time::sleep(backoff).await;
        }

        let url = {
            let s = session.lock().await;
            with_query_params(s.resume_gateway_url.as_deref().unwrap_or(&config.url))
        };

        info!(url = %url, "connecting to Discord gateway");

        let ws_stream = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                error!(error = %e, "failed to connect to gateway");
                reconnect_attempts += 1;
                continue;
            }
        };

        let (ws_write, mut ws_read) = ws_stream.split();
        let ws_write = Arc::new(Mutex::new(ws_write));
        let rate_limiter = Arc::new(Mutex::new(SendRateLimiter::new(
            SEND_BUDGET_MAX,
            SEND_BUDGET_WINDOW,
        )));

        // 1. HELLO
        let heartbeat_interval = match read_hello(&mut ws_read).await {
            Ok(interval) => interval,
            Err(e) => {
                error!(error = %e, "failed to read HELLO from gateway");
                reconnect_attempts += 1;
                continue;
            }
        };
        debug!(interval_ms = heartbeat_interval, "received HELLO");

        // 2. IDENTIFY or RESUME
        let opening = {
            let s = session.lock().await;
            s.resume_payload(&config.token)
        };
        let (opening, kind) = match opening {
            Some(resume) => (resume, "RESUME"),
            None => (identify_payload(&config), "IDENTIFY"),
        };
        if let Err(e) = rate_limited_send(&ws_write, &rate_limiter, &opening).await {
            error!(error = %e, kind, "failed to send opening payload");
            reconnect_attempts += 1;
            continue;
        }
        info!(kind, "sent opening payload");

        // 3. Heartbeat
        let heartbeat = tokio::spawn(heartbeat_loop(
            heartbeat_interval,
            Arc::clone(&ws_write),
            Arc::clone(&session),
            Arc::clone(&rate_limiter),
        ));

        // 4. Read until the connection ends
        let reason = read_loop(&mut ws_read, &ws_write, &rate_limiter, &event_tx, &session).await;

        // 5. Cleanup
        heartbeat.abort();
        {
            let mut w = ws_write.lock().await;
            let _ = w.send(WsMessage::Close(None)).await;
        }

        match reason {
            DisconnectReason::ShouldResume => {
                info!("will attempt RESUME");
                reconnect_attempts = 1;
            }
            DisconnectReason::ShouldReidentify => {
                info!("session invalidated, will re-IDENTIFY");
                let mut s = session.lock().await;
                s.session_id = None;
                s.sequence = None;
                reconnect_attempts = 1;
            }
            DisconnectReason::Fatal(e) => {
                error!(error = %e, "fatal gateway error, shutting down");
                return Err(e);
            }
            DisconnectReason::EventChannelClosed => {
                info!("event channel closed, shutting down gateway driver");
                return Ok(());
            }
        }
    }
}

async fn heartbeat_loop(
    interval_ms: u64,
    ws_write: Arc<Mutex<WsSink>>,
    session: Arc<Mutex<SessionState>>,
    rate_limiter: Arc<Mutex<SendRateLimiter>>,
) {
    // First beat after `interval * jitter`, jitter ∈ [0, 1).
    let jitter = rand::random::<f64>();
    tokio::time::sleep(Duration::from_millis((interval_ms as f64 * jitter) as u64)).await;

    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
    loop {
        interval.tick().await;
        let seq = session.lock().await.sequence;
        if let Err(e) = rate_limited_send(&ws_write, &rate_limiter, &json!({"op": 1, "d": seq})).await {
            warn!(error = %e, "heartbeat send failed, stopping heartbeat task");
            return;
        }
        debug!(?seq, "sent heartbeat");
    }
}

async fn read_loop(
    ws_read: &mut WsStream,
    ws_write: &Arc<Mutex<WsSink>>,
    rate_limiter: &Arc<Mutex<SendRateLimiter>>,
    event_tx: &mpsc::Sender<GatewayEvent>,
    session: &Arc<Mutex<SessionState>>,
) -> DisconnectReason {
    loop {
        let msg = match ws_read.next().await {
            Some(Ok(m)) => m,
            Some(Err(e)) => {
                warn!(error = %e, "WebSocket read error");
                return DisconnectReason::ShouldResume;
            }
            None => {
                info!("WebSocket stream ended");
                return DisconnectReason::ShouldResume;
            }
        };

        let text = match msg {
            WsMessage::Text(text) => text,
            WsMessage::Close(frame) => {
                let code = frame.as_ref().map(|f| u16::from(f.code));
                warn!(close_code = ?code, "WebSocket closed by server");
                return code.map(close_disposition).unwrap_or(DisconnectReason::ShouldResume);
            }
            // Ping/Pong/Binary: ignore.
            _ => continue,
        };

        let payload: GatewayPayload = match serde_json::from_str(&text) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to parse gateway payload");
                continue;
            }
        };

        if let Some(s) = payload.s {
            session.lock().await.sequence = Some(s);
        }

        let event = GatewayEvent::from_payload(payload);

        match &event {
            GatewayEvent::Ready(ready) => {
                let mut sess = session.lock().await;
                sess.session_id = Some(ready.session_id.clone());
                sess.resume_gateway_url = Some(ready.resume_gateway_url.clone());
                info!(session_id = %ready.session_id, "gateway READY");
            }
            GatewayEvent::HeartbeatRequest => {
                let seq = session.lock().await.sequence;
                if let Err(e) = rate_limited_send(ws_write, rate_limiter, &json!({"op": 1, "d": seq})).await {
                    warn!(error = %e, "failed to send requested heartbeat");
                }
                continue;
            }
            GatewayEvent::HeartbeatAck => {
                debug!("heartbeat acknowledged");
                continue;
            }
            GatewayEvent::Reconnect => {
                info!("gateway requested reconnect (op 7)");
                return DisconnectReason::ShouldResume;
            }
            GatewayEvent::InvalidSession(resumable) => {
                warn!(resumable, "session invalidated (op 9)");
                tokio::time::sleep(Duration::from_secs(if *resumable { 2 } else { 3 })).await;
                return if *resumable {
                    DisconnectReason::ShouldResume
                } else {
                    DisconnectReason::ShouldReidentify
                };
            }
            _ => {}
        }

        if event_tx.send(event).await.is_err() {
            info!("event channel closed by consumer");
            return DisconnectReason::EventChannelClosed;
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a server close code to what the driver should do next.
fn close_disposition(code: u16) -> DisconnectReason {
    let fatal = |reason| DisconnectReason::Fatal(GatewayError::Fatal { code, reason });
    match code {
        4004 => DisconnectReason::Fatal(GatewayError::Authentication),
        4010 => fatal("invalid shard"),
        4011 => fatal("sharding required"),
        4012 => fatal("invalid API version"),
        4013 => fatal("invalid intents"),
        4014 => fatal("disallowed intents"),
        // Invalid seq or session timed out.
        4007 | 4009 => DisconnectReason::ShouldReidentify,
        _ => DisconnectReason::ShouldResume,
    }
}

fn identify_payload(config: &GatewayConfig) -> serde_json::Value {
    json!({
        "op": 2,
        "d": {
            "token": config.token,
            "properties": {
                "os": std::env::consts::OS,
                "browser": "masterminds-bot",
                "device": "masterminds-bot"
            },
            "intents": config.intents.bits(),
        }
    })
}

/// Append `v=10&encoding=json` unless the URL already pins a version.
fn with_query_params(url: &str) -> String {
    if url.contains("v=10") {
        url.to_string()
    } else if url.contains('?') {
        format!("{}&v=10&encoding=json", url)
    } else {
        format!("{}?v=10&encoding=json", url)
    }
}

async fn read_hello(stream: &mut WsStream) -> Result<u64, GatewayError> {
    let msg = tokio::time::timeout(HELLO_TIMEOUT, stream.next())
        .await
        .map_err(|_| GatewayError::Handshake("timed out waiting for HELLO".into()))?
        .ok_or_else(|| GatewayError::Handshake("stream ended before HELLO".into()))?
        .map_err(|e| GatewayError::Handshake(format!("WS error reading HELLO: {}", e)))?;

    let WsMessage::Text(text) = msg else {
        return Err(GatewayError::Handshake(format!(
            "expected text message for HELLO, got {:?}",
            msg
        )));
    };

    parse_hello(&text)
}

fn parse_hello(text: &str) -> Result<u64, GatewayError> {
    let payload: GatewayPayload = serde_json::from_str(text)
        .map_err(|e| GatewayError::Handshake(format!("failed to parse HELLO: {}", e)))?;

    if payload.op != 10 {
        return Err(GatewayError::Handshake(format!(
            "expected op 10 (HELLO), got op {}",
            payload.op
        )));
    }

    payload
        .d
        .as_ref()
        .and_then(|d| d.get("heartbeat_interval"))
        .and_then(|v| v.as_u64())
        .ok_or_else(|| GatewayError::Handshake("HELLO missing heartbeat_interval".into()))
}

/// Send a JSON payload on the WebSocket, respecting the send rate limiter.
async fn rate_limited_send(
    ws_write: &Arc<Mutex<WsSink>>,
    rate_limiter: &Arc<Mutex<SendRateLimiter>>,
    payload: &serde_json::Value,
) -> Result<(), GatewayError> {
    loop {
        let delay = rate_limiter.lock().await.delay();
        match delay {
            Some(d) => {
                debug!(delay_ms = d.as_millis() as u64, "gateway send rate-limited, waiting");
                tokio::time::sleep(d).await;
            }
            None => break,
        }
    }
    rate_limiter.lock().await.record();

    let text = payload.to_string();
    let mut w = ws_write.lock().await;
    w.send(WsMessage::text(text))
        .await
        .map_err(|e| GatewayError::Connect(format!("WS send error: {}", e)))
}

/// Exponential backoff with jitter, capped at 60 s.
fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = 1000u64 * 2u64.saturating_pow(attempt.min(6));
    let jitter = (rand::random::<f64>() * 0.5 + 0.75) * base_ms as f64;
    Duration::from_millis(jitter.min(60_000.0) as u64)
}
