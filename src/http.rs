//! Transport-abstracted, bucket-locked HTTP client for the Discord REST API.
//!
//! All outbound HTTP calls go through [`DiscordHttpClient::send`] so that
//! auth headers, rate-limit handling, and error mapping live in one place.
//! The network itself sits behind the [`Transport`] trait; swapping HTTP
//! backends (or stubbing them in tests) only requires a new implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::bucket::{ApiRoute, BucketGuard, BucketRegistry};
use crate::config::ClientConfig;
use crate::types::*;

pub use reqwest::Method;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";
const USER_AGENT: &str = concat!(
    "DiscordBot (https://github.com/discord-interactions-rs, ",
    env!("CARGO_PKG_VERSION"),
    ")"
);

/// A 429 is retried at most this many times before surfacing.
pub const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Upper bound on any server-requested wait, bucket hold or 429 backoff.
pub const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Transport boundary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct TransportResponse {
    pub status: u16,
    /// Header names are lower-cased.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn is_json(&self) -> bool {
        self.header("content-type")
            .is_some_and(|ct| ct.trim_start().starts_with("application/json"))
    }
}

/// Connection-level failure: nothing usable came back from the remote.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("HTTP transport error: {0}")]
pub struct TransportError(pub String);

/// Performs one HTTP exchange. No retries, no rate limiting: that is the
/// pipeline's job.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

/// The production transport, backed by a pooled `reqwest::Client`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = self.client.request(request.method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| TransportError(e.to_string()))?;

        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = resp
            .bytes()
            .await
            .map_err(|e| TransportError(e.to_string()))?
            .to_vec();

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

// ---------------------------------------------------------------------------
// Parse rate-limit headers
// ---------------------------------------------------------------------------

fn parse_rate_limit_headers(resp: &TransportResponse) -> RateLimitInfo {
    let remaining = resp
        .header("x-ratelimit-remaining")
        .and_then(|s| s.trim().parse::<u32>().ok());

    let reset_at = resp
        .header("x-ratelimit-reset")
        .and_then(|s| s.trim().parse::<f64>().ok());

    let reset_after = resp
        .header("x-ratelimit-reset-after")
        .and_then(|s| s.trim().parse::<f64>().ok());

    let bucket = resp.header("x-ratelimit-bucket").map(str::to_string);

    let is_global = resp
        .header("x-ratelimit-global")
        .map(|s| s == "true")
        .unwrap_or(false);

    RateLimitInfo {
        remaining,
        reset_at,
        reset_after,
        bucket,
        is_global,
    }
}

/// How long a bucket must stay closed after this response, if at all.
///
/// Absent headers count as "calls remaining" so a server that omits them
/// never wedges a bucket.
fn bucket_hold(info: &RateLimitInfo) -> Option<Duration> {
    if info.remaining.unwrap_or(1) > 0 {
        return None;
    }
    let secs = match (info.reset_at, info.reset_after) {
        (Some(reset_at), _) => {
            let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
            reset_at - now
        }
        (None, Some(after)) => after,
        (None, None) => return None,
    };
    capped_wait(secs)
}

/// Server-supplied seconds as a wait. NaN and non-positive values mean no
/// wait; anything past [`MAX_RATE_LIMIT_WAIT`] is capped.
fn capped_wait(secs: f64) -> Option<Duration> {
    if secs.is_nan() || secs <= 0.0 {
        return None;
    }
    Some(Duration::try_from_secs_f64(secs).map_or(MAX_RATE_LIMIT_WAIT, |d| d.min(MAX_RATE_LIMIT_WAIT)))
}

fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// Non-success status from Discord. `body` holds the decoded diagnostic
    /// JSON when the server sent any.
    #[error("Discord API error {status} on {route}")]
    Api {
        status: u16,
        route: String,
        body: Option<Value>,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("serialisation error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("expected a JSON body from {route}")]
    EmptyBody { route: String },
    #[error("rate-limited on {route} after {attempts} attempts")]
    RateLimited { route: String, attempts: u32 },
    #[error("HTTP client has been shut down")]
    Shutdown,
}

impl HttpError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// What came back from one successful call.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub status: u16,
    pub rate_limit: RateLimitInfo,
    /// Decoded JSON body; `None` for non-JSON (e.g. `204 No Content`).
    pub body: Option<Value>,
    route: String,
}

impl RequestOutcome {
    pub fn json<T: DeserializeOwned>(self) -> Result<T, HttpError> {
        let body = self.body.ok_or(HttpError::EmptyBody { route: self.route })?;
        Ok(serde_json::from_value(body)?)
    }
}

// ---------------------------------------------------------------------------
// DiscordHttpClient
// ---------------------------------------------------------------------------

/// A bucket-locked HTTP client for the Discord REST API.
///
/// Cheap to clone (internals are behind `Arc`). Clones share the transport,
/// the bucket registry, and the shutdown state.
#[derive(Clone)]
pub struct DiscordHttpClient {
    base_url: Arc<str>,
    token: Option<Arc<str>>,
    transport: Arc<dyn Transport>,
    buckets: Arc<BucketRegistry>,
    shutdown: CancellationToken,
}

impl DiscordHttpClient {
    /// Create a client with the given bot token, the default reqwest
    /// transport, and the process-wide bucket registry.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            base_url: Arc::from(DEFAULT_API_BASE),
            token: Some(Arc::from(token.into())),
            transport: Arc::new(ReqwestTransport::default()),
            buckets: BucketRegistry::global(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.token.clone()).with_base_url(config.api_base.clone())
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        self.base_url = Arc::from(base_url.trim_end_matches('/'));
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    /// Use a private registry instead of the process-wide one.
    pub fn with_registry(mut self, buckets: Arc<BucketRegistry>) -> Self {
        self.buckets = buckets;
        self
    }

    pub fn registry(&self) -> &Arc<BucketRegistry> {
        &self.buckets
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Stop accepting calls and release every bucket held for a rate-limit
    /// window, so nothing stays queued behind this client.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            debug!("shutting down HTTP client");
        }
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // ------------------------------------------------------------------
    // Internal helper: build a transport request with auth + user-agent
    // ------------------------------------------------------------------

    fn build_request(&self, method: Method, url: &str, body: Option<Vec<u8>>) -> TransportRequest {
        let mut headers = vec![("user-agent".to_string(), USER_AGENT.to_string())];
        if let Some(token) = &self.token {
            headers.push(("authorization".to_string(), format!("Bot {}", token)));
        }
        if body.is_some() {
            headers.push(("content-type".to_string(), "application/json".to_string()));
        }
        TransportRequest {
            method,
            url: url.to_string(),
            headers,
            body,
        }
    }

    /// Release `guard` now, or after the bucket's window resets when the
    /// response said no calls remain. The guard moves into a timer task so
    /// queued callers wait out the window while this caller returns.
    fn release(&self, guard: BucketGuard, route: &ApiRoute, info: &RateLimitInfo) {
        let Some(hold) = bucket_hold(info) else {
            drop(guard);
            return;
        };
        debug!(
            route = %route,
            delay_ms = hold.as_millis() as u64,
            "bucket exhausted, deferring release"
        );
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(hold) => {}
                _ = shutdown.cancelled() => {}
            }
            drop(guard);
        });
    }

    // ------------------------------------------------------------------
    // Low-level: the single request method everything funnels through
    // ------------------------------------------------------------------

    /// Send `method` to `route`, holding the route's bucket lock for the
    /// duration of the call and, when the bucket is exhausted, until its
    /// window resets.
    pub async fn send(
        &self,
        method: Method,
        route: &ApiRoute,
        body: Option<&Value>,
    ) -> Result<RequestOutcome, HttpError> {
        if self.is_shutdown() {
            return Err(HttpError::Shutdown);
        }

        let key = route.bucket();
        let payload = body.map(serde_json::to_vec).transpose()?;
        let url = format!("{}/{}", self.base_url, route.path().trim_start_matches('/'));

        let guard = tokio::select! {
            guard = self.buckets.acquire(&key) => guard,
            _ = self.shutdown.cancelled() => return Err(HttpError::Shutdown),
        };

        let mut attempts = 0;
        loop {
            attempts += 1;
            let req = self.build_request(method.clone(), &url, payload.clone());
            let resp = self.transport.execute(req).await?;
            let status = resp.status;
            let rate_limit = parse_rate_limit_headers(&resp);

            if !resp.is_json() {
                drop(guard);
                debug!(
                    route = %route,
                    status,
                    content_type = resp.header("content-type").unwrap_or(""),
                    "non-JSON response"
                );
                if !is_success(status) {
                    return Err(HttpError::Api {
                        status,
                        route: route.to_string(),
                        body: None,
                    });
                }
                return Ok(RequestOutcome {
                    status,
                    rate_limit,
                    body: None,
                    route: route.to_string(),
                });
            }

            let decoded: Value = serde_json::from_slice(&resp.body)?;

            if status == 429 {
                let retry_after = decoded
                    .get("retry_after")
                    .and_then(Value::as_f64)
                    .or(rate_limit.reset_after)
                    .filter(|secs| !secs.is_nan())
                    .unwrap_or(1.0);
                warn!(
                    route = %route,
                    attempt = attempts,
                    retry_after_s = retry_after,
                    global = rate_limit.is_global,
                    "rate-limited by Discord, backing off"
                );
                if attempts > MAX_RATE_LIMIT_RETRIES {
                    return Err(HttpError::RateLimited {
                        route: route.to_string(),
                        attempts,
                    });
                }
                let wait = capped_wait(retry_after).unwrap_or(Duration::ZERO);
                let cancelled = tokio::select! {
                    _ = tokio::time::sleep(wait) => false,
                    _ = self.shutdown.cancelled() => true,
                };
                if cancelled {
                    return Err(HttpError::Shutdown);
                }
                continue;
            }

            if !is_success(status) {
                error!(route = %route, status, body = %decoded, "Discord API error");
                self.release(guard, route, &rate_limit);
                return Err(HttpError::Api {
                    status,
                    route: route.to_string(),
                    body: Some(decoded),
                });
            }

            self.release(guard, route, &rate_limit);
            return Ok(RequestOutcome {
                status,
                rate_limit,
                body: Some(decoded),
                route: route.to_string(),
            });
        }
    }

    // ------------------------------------------------------------------
    // Convenience: Gateway
    // ------------------------------------------------------------------

    /// Connection descriptor for the gateway: URL, shard count, and the
    /// session-start budget.
    pub async fn get_gateway_bot(&self) -> Result<GatewayBotInfo, HttpError> {
        self.send(Method::GET, &ApiRoute::new("/gateway/bot"), None)
            .await?
            .json()
    }

    // ------------------------------------------------------------------
    // Convenience: Interactions
    // ------------------------------------------------------------------

    /// Answer an interaction received over the gateway.
    pub async fn create_interaction_response(
        &self,
        interaction_id: &str,
        interaction_token: &str,
        response: &InteractionResponse,
    ) -> Result<(), HttpError> {
        let route = ApiRoute::new("/interactions/{interaction_id}/{interaction_token}/callback")
            .param("interaction_id", interaction_id)
            .param("interaction_token", interaction_token);
        let body = serde_json::to_value(response)?;
        // Discord returns 204 No Content on success.
        self.send(Method::POST, &route, Some(&body)).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Convenience: Slash command registration
    // ------------------------------------------------------------------

    pub async fn create_global_command(
        &self,
        application_id: &str,
        command: &ApplicationCommand,
    ) -> Result<RequestOutcome, HttpError> {
        let route = ApiRoute::new("/applications/{application_id}/commands")
            .param("application_id", application_id);
        let body = serde_json::to_value(command)?;
        self.send(Method::POST, &route, Some(&body)).await
    }

    pub async fn create_guild_command(
        &self,
        application_id: &str,
        guild_id: &str,
        command: &ApplicationCommand,
    ) -> Result<RequestOutcome, HttpError> {
        let route = ApiRoute::new("/applications/{application_id}/guilds/{guild_id}/commands")
            .param("application_id", application_id)
            .param("guild_id", guild_id);
        let body = serde_json::to_value(command)?;
        self.send(Method::POST, &route, Some(&body)).await
    }

    // ------------------------------------------------------------------
    // Convenience: Members
    // ------------------------------------------------------------------

    pub async fn get_guild_member(&self, guild_id: &str, user_id: &str) -> Result<Member, HttpError> {
        let route = ApiRoute::new("/guilds/{guild_id}/members/{user_id}")
            .param("guild_id", guild_id)
            .param("user_id", user_id);
        self.send(Method::GET, &route, None).await?.json()
    }

    pub async fn get_user(&self, user_id: &str) -> Result<User, HttpError> {
        let route = ApiRoute::new("/users/{user_id}").param("user_id", user_id);
        self.send(Method::GET, &route, None).await?.json()
    }
}

impl std::fmt::Debug for DiscordHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordHttpClient")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
