//! Inbound interaction webhooks.
//!
//! [`WebhookClient::handle`] is framework-agnostic: it takes the two signature
//! headers and the raw body and produces a status plus optional JSON body.
//! [`WebhookClient::router`] adapts it to axum (feature `webhook-server`).

use std::fmt;
use std::sync::Arc;

use ring::signature::{UnparsedPublicKey, ED25519};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::config::ClientConfig;
use crate::dispatch::{failure_response, Dispatcher};
use crate::types::*;

pub const SIGNATURE_HEADER: &str = "X-Signature-Ed25519";
pub const TIMESTAMP_HEADER: &str = "X-Signature-Timestamp";

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("DISCORD_PUBLIC_KEY is required for webhook mode")]
    MissingPublicKey,
    #[error("public key is not valid hex: {0}")]
    InvalidPublicKey(#[from] hex::FromHexError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("webhook server failed: {0}")]
    Serve(#[source] std::io::Error),
}

// ---------------------------------------------------------------------------
// Signature verification
// ---------------------------------------------------------------------------

/// Pass/fail check of a request signature over `timestamp ++ body`.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, timestamp: &str, body: &[u8], signature: &[u8]) -> bool;
}

impl<F> SignatureVerifier for F
where
    F: Fn(&str, &[u8], &[u8]) -> bool + Send + Sync,
{
    fn verify(&self, timestamp: &str, body: &[u8], signature: &[u8]) -> bool {
        self(timestamp, body, signature)
    }
}

/// Verifies against the application's Ed25519 public key.
#[derive(Clone)]
pub struct Ed25519Verifier {
    public_key: Vec<u8>,
}

impl Ed25519Verifier {
    pub fn from_hex(public_key: &str) -> Result<Self, hex::FromHexError> {
        Ok(Self {
            public_key: hex::decode(public_key.trim())?,
        })
    }
}

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, timestamp: &str, body: &[u8], signature: &[u8]) -> bool {
        let mut message = Vec::with_capacity(timestamp.len() + body.len());
        message.extend_from_slice(timestamp.as_bytes());
        message.extend_from_slice(body);
        UnparsedPublicKey::new(&ED25519, &self.public_key)
            .verify(&message, signature)
            .is_ok()
    }
}

impl fmt::Debug for Ed25519Verifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519Verifier")
            .field("public_key", &hex::encode(&self.public_key))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Request / reply
// ---------------------------------------------------------------------------

/// What the webhook needs from an inbound HTTP request.
#[derive(Debug, Clone, Copy)]
pub struct InboundRequest<'a> {
    pub timestamp: Option<&'a str>,
    pub signature: Option<&'a str>,
    pub body: &'a [u8],
}

impl<'a> InboundRequest<'a> {
    pub fn new(body: &'a [u8]) -> Self {
        Self {
            timestamp: None,
            signature: None,
            body,
        }
    }

    pub fn timestamp(mut self, timestamp: &'a str) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn signature(mut self, signature: &'a str) -> Self {
        self.signature = Some(signature);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookReply {
    pub status: u16,
    pub body: Option<Value>,
}

impl WebhookReply {
    /// Rejection with no body, whatever went wrong.
    pub fn unauthorized() -> Self {
        Self {
            status: 401,
            body: None,
        }
    }

    pub fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(body) => Self {
                status: 200,
                body: Some(body),
            },
            Err(e) => {
                error!(error = %e, "failed to encode webhook reply");
                Self {
                    status: 500,
                    body: None,
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct WebhookClient {
    dispatcher: Dispatcher,
    verifier: Arc<dyn SignatureVerifier>,
    endpoint: String,
}

impl WebhookClient {
    pub fn new(dispatcher: Dispatcher, verifier: impl SignatureVerifier + 'static) -> Self {
        Self {
            dispatcher,
            verifier: Arc::new(verifier),
            endpoint: "/interactions".to_string(),
        }
    }

    /// A client verifying against `config.public_key` and serving at
    /// `config.interaction_endpoint`.
    pub fn from_config(config: &ClientConfig, dispatcher: Dispatcher) -> Result<Self, WebhookError> {
        let key = config.public_key.as_deref().ok_or(WebhookError::MissingPublicKey)?;
        let mut client = Self::new(dispatcher, Ed25519Verifier::from_hex(key)?);
        client.endpoint = config.interaction_endpoint.clone();
        Ok(client)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Authenticate, decode, and answer one webhook delivery.
    ///
    /// Anything unauthenticated or undecodable is a bodiless 401. Once the
    /// request is authentic the reply is always 200: unknown commands get the
    /// fallback, failed dispatches a short failure notice.
    pub async fn handle(&self, request: InboundRequest<'_>) -> WebhookReply {
        let (Some(timestamp), Some(signature)) = (request.timestamp, request.signature) else {
            debug!("webhook request without signature headers");
            return WebhookReply::unauthorized();
        };
        let Ok(signature) = hex::decode(signature) else {
            debug!("webhook signature is not hex");
            return WebhookReply::unauthorized();
        };
        if !self.verifier.verify(timestamp, request.body, &signature) {
            warn!("webhook signature verification failed");
            return WebhookReply::unauthorized();
        }

        let payload: Value = match serde_json::from_slice(request.body) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "webhook body is not JSON");
                return WebhookReply::unauthorized();
            }
        };
        if payload.get("type").and_then(Value::as_u64) == Some(InteractionType::Ping as u64) {
            debug!("answering ping");
            return WebhookReply::json(&InteractionResponse::pong());
        }

        let interaction: Interaction = match serde_json::from_value(payload) {
            Ok(i) => i,
            Err(e) => {
                warn!(error = %e, "failed to decode interaction");
                return WebhookReply::unauthorized();
            }
        };

        let command = interaction.command_name().unwrap_or("").to_string();
        let response = match self.dispatcher.dispatch(interaction).await {
            Ok(outcome) => outcome.into_response(),
            Err(e) => {
                warn!(command = %command, error = %e, "dispatch failed");
                failure_response(&command)
            }
        };
        WebhookReply::json(&response.into_callback())
    }
}

impl fmt::Debug for WebhookClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookClient")
            .field("dispatcher", &self.dispatcher)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// axum adapter
// ---------------------------------------------------------------------------

#[cfg(feature = "webhook-server")]
mod server {
    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::post;
    use axum::{Json, Router};
    use tokio::net::TcpListener;
    use tracing::info;

    use super::*;

    async fn interactions(State(client): State<WebhookClient>, headers: HeaderMap, body: Bytes) -> Response {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
        let request = InboundRequest {
            timestamp: header(TIMESTAMP_HEADER),
            signature: header(SIGNATURE_HEADER),
            body: &body,
        };
        let reply = client.handle(request).await;
        let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        match reply.body {
            Some(body) => (status, Json(body)).into_response(),
            None => status.into_response(),
        }
    }

    impl WebhookClient {
        /// An axum router serving POST on the configured endpoint.
        pub fn router(&self) -> Router {
            Router::new()
                .route(&self.endpoint, post(interactions))
                .with_state(self.clone())
        }

        /// Listen on `0.0.0.0:{port}` until the server stops.
        pub async fn serve(&self, port: u16) -> Result<(), WebhookError> {
            let addr = format!("0.0.0.0:{}", port);
            let listener = TcpListener::bind(&addr)
                .await
                .map_err(|source| WebhookError::Bind { addr: addr.clone(), source })?;
            info!(addr = %addr, endpoint = %self.endpoint, "serving interaction webhooks");
            axum::serve(listener, self.router()).await.map_err(WebhookError::Serve)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
