//! Test doubles shared by the unit tests: a recording HTTP transport and a
//! scripted gateway connection.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::{Duration, Instant};

use crate::gateway::{GatewayConnection, GatewayError, Received};
use crate::http::{Method, Transport, TransportError, TransportRequest, TransportResponse};
use crate::types::Interaction;

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

type Respond = dyn Fn(&TransportRequest) -> Result<TransportResponse, TransportError> + Send + Sync;

/// One request seen by a [`StubTransport`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// When the request reached the transport.
    pub at: Instant,
}

impl RecordedCall {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json_body(&self) -> Option<Value> {
        self.body.as_ref().map(|b| serde_json::from_slice(b).unwrap())
    }
}

/// Answers every request with a closure and records what it saw.
pub struct StubTransport {
    respond: Box<Respond>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl StubTransport {
    pub fn new<F>(respond: F) -> Arc<Self>
    where
        F: Fn(&TransportRequest) -> Result<TransportResponse, TransportError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            respond: Box::new(respond),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        self.calls.lock().unwrap().push(RecordedCall {
            method: request.method.clone(),
            url: request.url.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
            at: Instant::now(),
        });
        (self.respond)(&request)
    }
}

pub fn json_response(status: u16, body: Value) -> Result<TransportResponse, TransportError> {
    Ok(TransportResponse {
        status,
        body: serde_json::to_vec(&body).unwrap(),
        ..Default::default()
    }
    .with_header("content-type", "application/json"))
}

/// A command interaction named `name` in guild `1`, with `options` as its
/// option list.
pub fn interaction(name: &str, options: Value) -> Interaction {
    serde_json::from_value(serde_json::json!({
        "id": "1",
        "application_id": "2",
        "type": 2,
        "token": "token",
        "channel_id": "3",
        "data": {"id": "4", "name": name, "options": options},
        "member": {"user": {"id": "10", "username": "invoker"}, "roles": []}
    }))
    .unwrap()
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Script {
    frames: VecDeque<(Option<Instant>, Received)>,
    sent: Vec<String>,
    closed: bool,
}

/// Plays back a fixed list of frames. Clones share the script, so a test
/// can keep one to inspect what the session sent.
///
/// `Received::TimedOut` entries wait out the caller's deadline. Frames
/// pushed with [`push_after`](Self::push_after) arrive at their instant, or
/// time out if the deadline comes first. An exhausted script reads as a
/// close.
#[derive(Clone, Default)]
pub struct ScriptedConnection {
    script: Arc<Mutex<Script>>,
}

impl ScriptedConnection {
    pub fn new(frames: impl IntoIterator<Item = Received>) -> Self {
        let conn = Self::default();
        conn.script
            .lock()
            .unwrap()
            .frames
            .extend(frames.into_iter().map(|f| (None, f)));
        conn
    }

    pub fn push_after(&self, delay: Duration, frame: Received) {
        let at = Instant::now() + delay;
        self.script.lock().unwrap().frames.push_back((Some(at), frame));
    }

    pub fn sent(&self) -> Vec<String> {
        self.script.lock().unwrap().sent.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.script.lock().unwrap().closed
    }
}

#[async_trait]
impl GatewayConnection for ScriptedConnection {
    async fn receive(&mut self, deadline: Instant) -> Result<Received, GatewayError> {
        let front = self.script.lock().unwrap().frames.front().cloned();
        match front {
            None => Ok(Received::Closed(None)),
            Some((_, Received::TimedOut)) => {
                self.script.lock().unwrap().frames.pop_front();
                tokio::time::sleep_until(deadline).await;
                Ok(Received::TimedOut)
            }
            Some((Some(at), _)) if at > deadline => {
                tokio::time::sleep_until(deadline).await;
                Ok(Received::TimedOut)
            }
            Some((at, frame)) => {
                if let Some(at) = at {
                    tokio::time::sleep_until(at).await;
                }
                self.script.lock().unwrap().frames.pop_front();
                Ok(frame)
            }
        }
    }

    async fn send(&mut self, text: String) -> Result<(), GatewayError> {
        self.script.lock().unwrap().sent.push(text);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), GatewayError> {
        self.script.lock().unwrap().closed = true;
        Ok(())
    }
}
