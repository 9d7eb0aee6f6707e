//! HTTP client for the Discord REST API.
//!
//! All outbound REST calls go through [`DiscordHttpClient`] so that auth
//! headers, rate-limit back-off and error handling live in one place. The
//! rest of the crate talks to the [`DiscordApi`] trait, which is what tests
//! replace with a recording mock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_lock::Mutex;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use tracing::{debug, warn};

use crate::config::DEFAULT_API_BASE;
use crate::error::HttpError;
use crate::session::Session;
use crate::types::*;

const MAX_RATE_LIMIT_RETRIES: u32 = 5;
const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);
const DEFAULT_RESET: Duration = Duration::from_secs(1);
/// Characters of an unparseable body kept in the error message.
const BODY_EXCERPT_CHARS: usize = 200;

// ---------------------------------------------------------------------------
// API seam
// ---------------------------------------------------------------------------

/// The REST calls the bot makes.
#[async_trait]
pub trait DiscordApi: Send + Sync {
    /// `GET /users/@me`. A 401 here means the token is bad.
    async fn current_user(&self) -> Result<User, HttpError>;

    /// `GET /oauth2/applications/@me`.
    async fn current_application(&self) -> Result<Application, HttpError>;

    /// `PUT /applications/{app}/commands`: replace the global command set.
    async fn bulk_overwrite_global_commands(
        &self,
        application_id: &str,
        commands: &[ApplicationCommand],
    ) -> Result<Vec<ApplicationCommand>, HttpError>;

    /// `PUT /applications/{app}/guilds/{guild}/commands`.
    async fn bulk_overwrite_guild_commands(
        &self,
        application_id: &str,
        guild_id: &str,
        commands: &[ApplicationCommand],
    ) -> Result<Vec<ApplicationCommand>, HttpError>;

    /// `POST /interactions/{id}/{token}/callback`.
    async fn create_interaction_response(
        &self,
        interaction_id: &str,
        interaction_token: &str,
        response: &InteractionResponse,
    ) -> Result<(), HttpError>;

    /// `POST /channels/{id}/messages`.
    async fn create_message(
        &self,
        channel_id: &str,
        message: &CreateMessage,
    ) -> Result<Message, HttpError>;
}

// ---------------------------------------------------------------------------
// Rate-limit tracker (per-bucket)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct BucketState {
    remaining: u32,
    resets_at: Instant,
}

#[derive(Debug, Default)]
struct RateLimiter {
    /// Route-key → bucket id mapping.
    route_buckets: HashMap<String, String>,
    /// Bucket id → state.
    buckets: HashMap<String, BucketState>,
    /// No requests may be sent until this instant.
    global_until: Option<Instant>,
}

impl RateLimiter {
    /// How long to wait before sending on `route_key`, if at all.
    fn delay_for(&self, route_key: &str) -> Option<Duration> {
        let now = Instant::now();
        if let Some(until) = self.global_until {
            if until > now {
                return Some(until - now);
            }
        }

        let bucket_id = self.route_buckets.get(route_key)?;
        let state = self.buckets.get(bucket_id)?;
        if state.remaining == 0 && state.resets_at > now {
            return Some(state.resets_at - now);
        }
        None
    }

    fn update(&mut self, route_key: &str, info: &RateLimitInfo) {
        let reset_in = reset_duration(info.reset_after);

        if info.is_global {
            self.global_until = Some(Instant::now() + reset_in);
        }

        if let Some(ref bucket) = info.bucket {
            self.route_buckets
                .insert(route_key.to_string(), bucket.clone());
            self.buckets.insert(
                bucket.clone(),
                BucketState {
                    remaining: info.remaining.unwrap_or(1),
                    resets_at: Instant::now() + reset_in,
                },
            );
        }
    }
}

/// Seconds from a reset header as a wait, capped; junk means one second.
fn reset_duration(secs: Option<f64>) -> Duration {
    secs.and_then(|s| Duration::try_from_secs_f64(s.max(0.0)).ok())
        .map_or(DEFAULT_RESET, |d| d.min(MAX_RATE_LIMIT_WAIT))
}

fn parse_rate_limit_headers(headers: &HeaderMap) -> RateLimitInfo {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    RateLimitInfo {
        remaining: header("x-ratelimit-remaining").and_then(|s| s.parse().ok()),
        reset_after: header("x-ratelimit-reset-after")
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|secs| secs.is_finite()),
        bucket: header("x-ratelimit-bucket").map(str::to_string),
        is_global: header("x-ratelimit-global") == Some("true"),
    }
}

// ---------------------------------------------------------------------------
// DiscordHttpClient
// ---------------------------------------------------------------------------

/// Rate-limit aware REST client over the shared [`Session`].
///
/// Cheap to clone (internals are behind `Arc`).
#[derive(Clone)]
pub struct DiscordHttpClient {
    session: Session,
    token: Arc<str>,
    base_url: Arc<str>,
    limiter: Arc<Mutex<RateLimiter>>,
}

impl DiscordHttpClient {
    pub fn new(session: Session, token: impl AsRef<str>) -> Self {
        Self::with_base_url(session, token, DEFAULT_API_BASE)
    }

    /// Point the client at another API root (tests, proxies).
    pub fn with_base_url(
        session: Session,
        token: impl AsRef<str>,
        base_url: impl AsRef<str>,
    ) -> Self {
        Self {
            session,
            token: Arc::from(token.as_ref()),
            base_url: Arc::from(base_url.as_ref().trim_end_matches('/')),
            limiter: Arc::new(Mutex::new(RateLimiter::default())),
        }
    }

    /// Send a request to `{base}/{path}` and return the raw body.
    ///
    /// `route_key` groups requests for rate-limit bucketing, e.g.
    /// `PUT /applications/{id}/commands`.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        route_key: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Vec<u8>, HttpError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));

        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            let delay = self.limiter.lock().await.delay_for(route_key);
            if let Some(delay) = delay {
                let delay = delay.min(MAX_RATE_LIMIT_WAIT);
                debug!(
                    route = route_key,
                    delay_ms = delay.as_millis() as u64,
                    "rate-limit pre-emptive backoff"
                );
                tokio::time::sleep(delay).await;
            }

            let mut req = self
                .session
                .http()?
                .request(method.clone(), &url)
                .header("authorization", format!("Bot {}", self.token));
            if let Some(json) = body {
                req = req.json(json);
            }

            let resp = req.send().await?;
            let status = resp.status();
            let rl_info = parse_rate_limit_headers(resp.headers());
            self.limiter.lock().await.update(route_key, &rl_info);

            if status == StatusCode::TOO_MANY_REQUESTS && attempt < MAX_RATE_LIMIT_RETRIES {
                let retry_after = rl_info.reset_after.unwrap_or(1.0);
                warn!(
                    route = route_key,
                    attempt,
                    retry_after_s = retry_after,
                    global = rl_info.is_global,
                    "rate-limited by Discord, backing off"
                );
                tokio::time::sleep(reset_duration(rl_info.reset_after)).await;
                continue;
            }

            let bytes = resp.bytes().await?;
            if status.is_success() {
                return Ok(bytes.to_vec());
            }
            return Err(HttpError::Api {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
                route: route_key.to_string(),
            });
        }

        Err(HttpError::Api {
            status: StatusCode::TOO_MANY_REQUESTS.as_u16(),
            body: "rate-limited after max retries".to_string(),
            route: route_key.to_string(),
        })
    }

    /// Like [`request`](Self::request) but deserialises the body as JSON.
    pub async fn request_json<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        route_key: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<T, HttpError> {
        let bytes = self.request(method, path, route_key, body).await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            let raw = String::from_utf8_lossy(&bytes);
            HttpError::Serde(format!("{}: {}", e, excerpt(&raw)))
        })
    }
}

/// The first few characters of `raw`, cut on a char boundary.
fn excerpt(raw: &str) -> &str {
    raw.char_indices()
        .nth(BODY_EXCERPT_CHARS)
        .map_or(raw, |(i, _)| &raw[..i])
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, HttpError> {
    serde_json::to_value(value).map_err(|e| HttpError::Serde(e.to_string()))
}

#[async_trait]
impl DiscordApi for DiscordHttpClient {
    async fn current_user(&self) -> Result<User, HttpError> {
        self.request_json(Method::GET, "users/@me", "GET /users/@me", None)
            .await
    }

    async fn current_application(&self) -> Result<Application, HttpError> {
        self.request_json(
            Method::GET,
            "oauth2/applications/@me",
            "GET /oauth2/applications/@me",
            None,
        )
        .await
    }

    async fn bulk_overwrite_global_commands(
        &self,
        application_id: &str,
        commands: &[ApplicationCommand],
    ) -> Result<Vec<ApplicationCommand>, HttpError> {
        let path = format!("applications/{}/commands", application_id);
        let route_key = format!("PUT /applications/{}/commands", application_id);
        let body = to_json(&commands)?;
        self.request_json(Method::PUT, &path, &route_key, Some(&body))
            .await
    }

    async fn bulk_overwrite_guild_commands(
        &self,
        application_id: &str,
        guild_id: &str,
        commands: &[ApplicationCommand],
    ) -> Result<Vec<ApplicationCommand>, HttpError> {
        let path = format!(
            "applications/{}/guilds/{}/commands",
            application_id, guild_id
        );
        let route_key = format!(
            "PUT /applications/{}/guilds/{}/commands",
            application_id, guild_id
        );
        let body = to_json(&commands)?;
        self.request_json(Method::PUT, &path, &route_key, Some(&body))
            .await
    }

    async fn create_interaction_response(
        &self,
        interaction_id: &str,
        interaction_token: &str,
        response: &InteractionResponse,
    ) -> Result<(), HttpError> {
        let path = format!(
            "interactions/{}/{}/callback",
            interaction_id, interaction_token
        );
        let body = to_json(response)?;
        // 204 No Content on success.
        self.request(
            Method::POST,
            &path,
            "POST /interactions/callback",
            Some(&body),
        )
        .await?;
        Ok(())
    }

    async fn create_message(
        &self,
        channel_id: &str,
        message: &CreateMessage,
    ) -> Result<Message, HttpError> {
        let path = format!("channels/{}/messages", channel_id);
        let route_key = format!("POST /channels/{}/messages", channel_id);
        let body = to_json(message)?;
        self.request_json(Method::POST, &path, &route_key, Some(&body))
            .await
    }
}

impl std::fmt::Debug for DiscordHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordHttpClient")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .finish()
    }
}
