//! Gateway (WebSocket) session for receiving interactions.
//!
//! This module owns one connection's lifecycle:
//!   - receive HELLO → send IDENTIFY
//!   - heartbeat on a deadline derived from the HELLO interval
//!   - sequence number tracking
//!   - demultiplexing frames into interactions and control opcodes
//!
//! All waiting goes through [`GatewayConnection::receive`], a single receive
//! with a deadline, so the session's suspension points are exactly the
//! receive and send calls. The rest of the crate never touches
//! `tokio_tungstenite` directly.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::Intents;
use crate::events::{opcode, GatewayEvent};
use crate::http::HttpError;
use crate::types::*;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// How long to wait for HELLO after the socket opens.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Query appended to the URL from `GET /gateway/bot`.
const GATEWAY_QUERY: &str = "v=10&encoding=json";

// ---------------------------------------------------------------------------
// Errors & state
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway bootstrap request failed: {0}")]
    Http(#[from] HttpError),
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("expected handshake opcode {}, got {got}", opcode::HELLO)]
    ProtocolViolation { got: u8 },
    #[error("handshake carried no heartbeat interval")]
    MalformedHello,
    #[error("connection closed before handshake")]
    ClosedDuringHandshake,
    #[error("timed out waiting for handshake")]
    HandshakeTimeout,
    #[error("gateway connection error: {0}")]
    Connection(String),
    #[error("failed to decode gateway frame: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Lifecycle of one gateway session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    /// Fetching the connection descriptor and opening the socket.
    Connecting,
    /// Waiting for HELLO.
    Handshaking,
    /// HELLO received, IDENTIFY not yet sent.
    Identifying,
    Active,
    Closed,
}

// ---------------------------------------------------------------------------
// Connection boundary
// ---------------------------------------------------------------------------

/// Outcome of one [`GatewayConnection::receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Text(String),
    /// Close frame (with its code, if any) or end of stream.
    Closed(Option<u16>),
    /// Nothing arrived before the deadline.
    TimedOut,
}

/// A full-duplex frame connection.
#[async_trait]
pub trait GatewayConnection: Send {
    /// Wait for the next text or close frame until `deadline`. Control and
    /// binary frames are skipped.
    async fn receive(&mut self, deadline: Instant) -> Result<Received, GatewayError>;

    async fn send(&mut self, text: String) -> Result<(), GatewayError>;

    async fn close(&mut self) -> Result<(), GatewayError>;
}

/// `tokio_tungstenite` implementation of [`GatewayConnection`].
pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsConnection {
    pub async fn connect(url: &str) -> Result<Self, GatewayError> {
        let (stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| GatewayError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        info!(url, "WebSocket connected");
        Ok(Self { stream })
    }
}

#[async_trait]
impl GatewayConnection for WsConnection {
    async fn receive(&mut self, deadline: Instant) -> Result<Received, GatewayError> {
        loop {
            let Ok(next) = tokio::time::timeout_at(deadline, self.stream.next()).await else {
                return Ok(Received::TimedOut);
            };
            match next {
                None => return Ok(Received::Closed(None)),
                Some(Err(e)) => return Err(GatewayError::Connection(e.to_string())),
                Some(Ok(Message::Text(text))) => return Ok(Received::Text(text.as_str().to_owned())),
                Some(Ok(Message::Close(frame))) => {
                    return Ok(Received::Closed(frame.map(|f| u16::from(f.code))));
                }
                // Ping/Pong/Binary are not ours to handle.
                Some(Ok(_)) => {}
            }
        }
    }

    async fn send(&mut self, text: String) -> Result<(), GatewayError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| GatewayError::Connection(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), GatewayError> {
        self.stream
            .close(None)
            .await
            .map_err(|e| GatewayError::Connection(e.to_string()))
    }
}

/// Socket URL for a `GET /gateway/bot` descriptor URL.
pub fn gateway_url(base: &str) -> String {
    if base.contains("v=") {
        base.to_string()
    } else if base.contains('?') {
        format!("{}&{}", base, GATEWAY_QUERY)
    } else {
        format!("{}/?{}", base.trim_end_matches('/'), GATEWAY_QUERY)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One handshaken connection.
pub struct Session<C> {
    conn: C,
    state: SessionState,
    heartbeat_interval: Duration,
    sequence: Option<u64>,
    last_heartbeat: Instant,
}

impl<C: GatewayConnection> Session<C> {
    /// Wait for HELLO on a freshly opened connection. Any other first frame
    /// is a [`GatewayError::ProtocolViolation`].
    pub async fn handshake(mut conn: C) -> Result<Self, GatewayError> {
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        let text = match conn.receive(deadline).await? {
            Received::Text(text) => text,
            Received::Closed(code) => {
                warn!(close_code = ?code, "connection closed during handshake");
                return Err(GatewayError::ClosedDuringHandshake);
            }
            Received::TimedOut => return Err(GatewayError::HandshakeTimeout),
        };

        let payload: GatewayPayload = serde_json::from_str(&text)?;
        if payload.op != opcode::HELLO {
            return Err(GatewayError::ProtocolViolation { got: payload.op });
        }
        let heartbeat_interval = match GatewayEvent::from_payload(payload) {
            GatewayEvent::Hello { heartbeat_interval } if heartbeat_interval > 0 => heartbeat_interval,
            _ => return Err(GatewayError::MalformedHello),
        };
        info!(interval_ms = heartbeat_interval, "received HELLO");

        Ok(Self {
            conn,
            state: SessionState::Identifying,
            heartbeat_interval: Duration::from_millis(heartbeat_interval),
            sequence: None,
            last_heartbeat: Instant::now(),
        })
    }

    /// Send IDENTIFY and become [`SessionState::Active`]. The first heartbeat
    /// is due one interval from now.
    pub async fn identify(&mut self, token: &str, intents: Intents) -> Result<(), GatewayError> {
        let identify = json!({
            "op": opcode::IDENTIFY,
            "d": {
                "token": token,
                "intents": intents.bits(),
                "properties": {
                    "os": std::env::consts::OS,
                    "browser": env!("CARGO_PKG_NAME"),
                    "device": env!("CARGO_PKG_NAME"),
                },
            }
        });
        self.conn.send(identify.to_string()).await?;
        info!(intents = intents.bits(), "sent IDENTIFY");
        self.state = SessionState::Active;
        self.last_heartbeat = Instant::now();
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Sequence number of the last dispatch received.
    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    /// Receive until the next interaction, heartbeating whenever the
    /// deadline passes. Returns `None` once the session has closed.
    pub async fn next_interaction(&mut self) -> Result<Option<Interaction>, GatewayError> {
        loop {
            if self.state == SessionState::Closed {
                return Ok(None);
            }
            let deadline = self.last_heartbeat + self.heartbeat_interval;
            let received = match self.conn.receive(deadline).await {
                Ok(received) => received,
                Err(e) => {
                    self.state = SessionState::Closed;
                    return Err(e);
                }
            };

            let text = match received {
                Received::TimedOut => {
                    self.heartbeat().await?;
                    continue;
                }
                Received::Closed(code) => {
                    info!(close_code = ?code, "gateway connection closed");
                    self.state = SessionState::Closed;
                    return Ok(None);
                }
                Received::Text(text) => text,
            };

            let payload: GatewayPayload = match serde_json::from_str(&text) {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "failed to parse gateway payload");
                    continue;
                }
            };
            if let Some(s) = payload.s {
                self.sequence = Some(s);
            }

            match GatewayEvent::from_payload(payload) {
                GatewayEvent::InteractionCreate(interaction) => return Ok(Some(interaction)),
                GatewayEvent::HeartbeatRequest => {
                    self.heartbeat().await?;
                    debug!("sent requested heartbeat");
                }
                GatewayEvent::HeartbeatAck => debug!("heartbeat acknowledged"),
                GatewayEvent::Reconnect => {
                    info!("gateway requested reconnect (op 7)");
                    self.close().await;
                    return Ok(None);
                }
                GatewayEvent::InvalidSession(resumable) => {
                    warn!(resumable, "session invalidated (op 9)");
                    self.close().await;
                    return Ok(None);
                }
                GatewayEvent::Dispatch { event_name } => debug!(event = %event_name, "ignoring event"),
                GatewayEvent::Hello { .. } => debug!("ignoring HELLO on an active session"),
                GatewayEvent::Unknown { op, event_name } => {
                    debug!(op, event = ?event_name, "ignoring unknown gateway frame")
                }
            }
        }
    }

    async fn heartbeat(&mut self) -> Result<(), GatewayError> {
        let heartbeat = json!({"op": opcode::HEARTBEAT, "d": self.sequence});
        self.conn.send(heartbeat.to_string()).await?;
        self.last_heartbeat = Instant::now();
        debug!(seq = ?self.sequence, "sent heartbeat");
        Ok(())
    }

    /// Close the connection. Idempotent; close errors are only logged.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        if let Err(e) = self.conn.close().await {
            debug!(error = %e, "error while closing gateway connection");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
