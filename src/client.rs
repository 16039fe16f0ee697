//! The gateway client: bootstraps a session, feeds interactions to the
//! dispatcher, and posts each response back through the REST pipeline.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ClientConfig;
use crate::dispatch::{failure_response, Dispatcher};
use crate::gateway::{gateway_url, GatewayConnection, GatewayError, Session, SessionState, WsConnection};
use crate::http::DiscordHttpClient;
use crate::router::Router;
use crate::types::*;

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

/// Stops a running [`GatewayClient`] from another task.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }
}

// ---------------------------------------------------------------------------
// GatewayClient
// ---------------------------------------------------------------------------

pub struct GatewayClient {
    config: ClientConfig,
    http: DiscordHttpClient,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
    state: watch::Sender<SessionState>,
}

impl GatewayClient {
    /// A client whose dispatcher resolves members through its own HTTP
    /// client.
    pub fn new(config: ClientConfig, router: Router) -> Self {
        let http = DiscordHttpClient::from_config(&config);
        let dispatcher = Dispatcher::new(Arc::new(router)).with_member_lookup(Arc::new(http.clone()));
        Self {
            config,
            http,
            dispatcher,
            shutdown: CancellationToken::new(),
            state: watch::Sender::new(SessionState::Disconnected),
        }
    }

    /// Replace the REST pipeline (and the member lookup that uses it).
    pub fn with_http(mut self, http: DiscordHttpClient) -> Self {
        self.dispatcher = self.dispatcher.with_member_lookup(Arc::new(http.clone()));
        self.http = http;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn http(&self) -> &DiscordHttpClient {
        &self.http
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            token: self.shutdown.clone(),
        }
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    /// Look up the gateway, connect, and process interactions until the
    /// connection closes or shutdown is requested. The REST pipeline is shut
    /// down on the way out, whatever the outcome.
    pub async fn run(&self) -> Result<(), GatewayError> {
        let result = self.connect_and_drive().await;
        if let Err(e) = &result {
            error!(error = %e, "gateway client stopped");
        }
        self.http.shutdown();
        self.set_state(SessionState::Closed);
        result
    }

    async fn connect_and_drive(&self) -> Result<(), GatewayError> {
        self.set_state(SessionState::Connecting);
        let info = self.http.get_gateway_bot().await?;
        let url = gateway_url(&info.url);
        info!(
            url = %url,
            shards = info.shards,
            sessions_remaining = info.session_start_limit.remaining,
            "connecting to Discord gateway"
        );
        let conn = WsConnection::connect(&url).await?;
        self.drive(conn).await
    }

    /// Run a session over an already-open connection.
    pub async fn drive<C: GatewayConnection>(&self, conn: C) -> Result<(), GatewayError> {
        self.set_state(SessionState::Handshaking);
        let handshake = tokio::select! {
            session = Session::handshake(conn) => Some(session),
            _ = self.shutdown.cancelled() => None,
        };
        let Some(session) = handshake else {
            info!("shutdown requested during handshake");
            self.set_state(SessionState::Closed);
            return Ok(());
        };
        let mut session = session?;
        self.set_state(session.state());
        session.identify(&self.config.token, self.config.intents).await?;
        self.set_state(session.state());

        loop {
            let next = tokio::select! {
                next = session.next_interaction() => Some(next),
                _ = self.shutdown.cancelled() => None,
            };
            let Some(next) = next else {
                info!("shutdown requested, closing gateway session");
                session.close().await;
                break;
            };
            match next {
                Ok(Some(interaction)) => {
                    let handled = tokio::select! {
                        _ = self.handle(interaction) => true,
                        _ = self.shutdown.cancelled() => false,
                    };
                    if !handled {
                        info!("shutdown requested, abandoning in-flight interaction");
                        session.close().await;
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    self.set_state(session.state());
                    return Err(e);
                }
            }
        }
        self.set_state(session.state());
        Ok(())
    }

    /// Dispatch one interaction and post its response. Nothing here can end
    /// the session: failures are logged.
    async fn handle(&self, interaction: Interaction) {
        let id = interaction.id.clone();
        let token = interaction.token.clone();
        let command = interaction.command_name().unwrap_or("").to_string();

        let response = match self.dispatcher.dispatch(interaction).await {
            Ok(outcome) => outcome.into_response(),
            Err(e) => {
                warn!(command = %command, interaction_id = %id, error = %e, "dispatch failed");
                failure_response(&command)
            }
        };
        if let Err(e) = self
            .http
            .create_interaction_response(&id, &token, &response.into_callback())
            .await
        {
            error!(command = %command, interaction_id = %id, error = %e, "failed to send interaction response");
        }
    }
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("config", &self.config)
            .field("http", &self.http)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Command registration
// ---------------------------------------------------------------------------

/// Counts from [`register_commands`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistrationReport {
    pub registered: usize,
    pub failed: usize,
}

/// Register every handler of `router` with Discord: globally when the
/// handler is global, and in each of its guilds. A failed registration is
/// logged and counted; the rest still go out.
pub async fn register_commands(
    http: &DiscordHttpClient,
    application_id: &str,
    router: &Router,
) -> RegistrationReport {
    let mut report = RegistrationReport::default();
    for handler in router.handlers() {
        let command = handler.to_command();
        if handler.is_global() {
            match http.create_global_command(application_id, &command).await {
                Ok(_) => report.registered += 1,
                Err(e) => {
                    error!(command = %command.name, error = %e, "failed to register global command");
                    report.failed += 1;
                }
            }
        }
        for guild_id in handler.guilds() {
            match http.create_guild_command(application_id, guild_id, &command).await {
                Ok(_) => report.registered += 1,
                Err(e) => {
                    error!(command = %command.name, guild_id = %guild_id, error = %e, "failed to register guild command");
                    report.failed += 1;
                }
            }
        }
    }
    info!(registered = report.registered, failed = report.failed, "registered commands");
    report
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::BucketRegistry;
    use crate::dispatch::Arguments;
    use crate::gateway::Received;
    use crate::http::{Method, TransportResponse};
    use crate::router::{ArgSpec, HandlerDef};
    use crate::testing::{json_response, ScriptedConnection, StubTransport};
    use serde_json::json;
    use std::time::Duration;

    fn no_content() -> Result<TransportResponse, crate::http::TransportError> {
        Ok(TransportResponse {
            status: 204,
            ..Default::default()
        })
    }

    fn test_client(router: Router, stub: &Arc<StubTransport>) -> GatewayClient {
        let http = DiscordHttpClient::new("secret")
            .with_base_url("https://api.test/v10")
            .with_transport(stub.clone())
            .with_registry(Arc::new(BucketRegistry::new()));
        GatewayClient::new(ClientConfig::new("secret", "app"), router).with_http(http)
    }

    fn hello() -> Received {
        Received::Text(json!({"op": 10, "d": {"heartbeat_interval": 1000}}).to_string())
    }

    fn interaction_create(name: &str, options: serde_json::Value) -> Received {
        Received::Text(
            json!({
                "op": 0, "s": 1, "t": "INTERACTION_CREATE",
                "d": {
                    "id": 1, "application_id": 2, "type": 2, "token": "itoken",
                    "data": {"id": 3, "name": name, "options": options}
                }
            })
            .to_string(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn interaction_round_trip() {
        let mut router = Router::new();
        router
            .register(HandlerDef::new("test", "Test"), |_, _| async { "> ok" })
            .unwrap();
        let stub = StubTransport::new(|_| no_content());
        let client = test_client(router, &stub);

        let conn = ScriptedConnection::new([hello(), interaction_create("test", json!([])), Received::Closed(None)]);
        let remote = conn.clone();
        client.drive(conn).await.unwrap();

        let identify: serde_json::Value = serde_json::from_str(&remote.sent()[0]).unwrap();
        assert_eq!(identify["op"], 2);
        assert_eq!(identify["d"]["token"], "secret");

        let calls = stub.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].method, Method::POST);
        assert_eq!(calls[0].url, "https://api.test/v10/interactions/1/itoken/callback");
        assert_eq!(
            calls[0].json_body(),
            Some(json!({
                "type": 4,
                "data": {"tts": false, "content": "> ok", "embeds": [], "allowed_mentions": {"parse": []}}
            }))
        );
        assert_eq!(client.state(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_command_and_failed_dispatch_keep_the_loop_alive() {
        let mut router = Router::new();
        router
            .register(
                HandlerDef::new("count", "").arg(ArgSpec::integer("n")),
                |_, args: Arguments| async move { args.integer("n").unwrap_or_default() },
            )
            .unwrap();
        let stub = StubTransport::new(|_| no_content());
        let client = test_client(router, &stub);

        let conn = ScriptedConnection::new([
            hello(),
            interaction_create("missing", json!([])),
            interaction_create("count", json!([{"name": "n", "type": 4, "value": "x"}])),
            interaction_create("count", json!([{"name": "n", "type": 4, "value": 7}])),
            Received::Closed(None),
        ]);
        client.drive(conn).await.unwrap();

        let contents: Vec<_> = stub
            .calls()
            .iter()
            .map(|c| c.json_body().unwrap()["data"]["content"].clone())
            .collect();
        assert_eq!(
            contents,
            vec![
                json!("> Command missing is not supported"),
                json!("> Command count failed"),
                json!("7"),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn callback_failure_is_not_fatal() {
        let mut router = Router::new();
        router.register(HandlerDef::new("test", ""), |_, _| async { "x" }).unwrap();
        let stub = StubTransport::new(|_| json_response(404, json!({"message": "Unknown interaction"})));
        let client = test_client(router, &stub);

        let conn = ScriptedConnection::new([
            hello(),
            interaction_create("test", json!([])),
            interaction_create("test", json!([])),
            Received::Closed(None),
        ]);
        client.drive(conn).await.unwrap();
        assert_eq!(stub.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_violation_is_fatal() {
        let stub = StubTransport::new(|_| no_content());
        let client = test_client(Router::new(), &stub);
        let conn = ScriptedConnection::new([Received::Text(json!({"op": 0, "t": "READY"}).to_string())]);

        let err = client.drive(conn).await.unwrap_err();
        assert!(matches!(err, GatewayError::ProtocolViolation { got: 0 }));
    }

    #[tokio::test(start_paused = true)]
    async fn run_shuts_down_pipeline_when_bootstrap_fails() {
        let stub = StubTransport::new(|_| json_response(401, json!({"message": "401: Unauthorized"})));
        let client = test_client(Router::new(), &stub);

        let err = client.run().await.unwrap_err();
        assert!(matches!(err, GatewayError::Http(_)));
        assert!(client.http().is_shutdown());
        assert_eq!(client.state(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_handle_stops_the_session() {
        let stub = StubTransport::new(|_| no_content());
        let client = Arc::new(test_client(Router::new(), &stub));
        let conn = ScriptedConnection::new([hello()]);
        let remote = conn.clone();
        // Keep the session waiting on a frame far in the future.
        remote.push_after(Duration::from_secs(3600), Received::Closed(None));

        let handle = client.shutdown_handle();
        let task = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.drive(conn).await }
        });
        tokio::time::sleep(Duration::from_millis(2500)).await;
        handle.shutdown();
        task.await.unwrap().unwrap();

        assert!(handle.is_shutdown());
        assert!(remote.is_closed());
        // Heartbeats kept flowing while idle.
        assert!(remote.sent().len() >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_the_handshake() {
        let stub = StubTransport::new(|_| no_content());
        let client = Arc::new(test_client(Router::new(), &stub));
        let conn = ScriptedConnection::default();
        conn.push_after(Duration::from_secs(3600), hello());

        let handle = client.shutdown_handle();
        let start = tokio::time::Instant::now();
        let task = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.drive(conn).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.shutdown();
        task.await.unwrap().unwrap();

        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(client.state(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_a_slow_handler() {
        let mut router = Router::new();
        router
            .register(HandlerDef::new("slow", ""), |_, _| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                "late"
            })
            .unwrap();
        let stub = StubTransport::new(|_| no_content());
        let client = Arc::new(test_client(router, &stub));
        let conn = ScriptedConnection::new([hello(), interaction_create("slow", json!([]))]);
        let remote = conn.clone();
        remote.push_after(Duration::from_secs(7200), Received::Closed(None));

        let handle = client.shutdown_handle();
        let start = tokio::time::Instant::now();
        let task = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.drive(conn).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.shutdown();
        task.await.unwrap().unwrap();

        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(remote.is_closed());
        assert!(stub.calls().is_empty());
        assert_eq!(client.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn register_commands_counts_failures() {
        let mut router = Router::new();
        router
            .register(HandlerDef::new("global", "g"), |_, _| async { "" })
            .unwrap();
        router
            .register(
                HandlerDef::new("local", "l").global(false).guild("10").guild("20"),
                |_, _| async { "" },
            )
            .unwrap();
        let stub = StubTransport::new(|req| {
            if req.url.contains("/guilds/20/") {
                json_response(403, json!({"code": 50001}))
            } else {
                json_response(201, json!({"id": "1"}))
            }
        });
        let http = DiscordHttpClient::new("secret")
            .with_base_url("https://api.test/v10")
            .with_transport(stub.clone())
            .with_registry(Arc::new(BucketRegistry::new()));

        let report = register_commands(&http, "app", &router).await;
        assert_eq!(report, RegistrationReport { registered: 2, failed: 1 });

        let mut urls: Vec<_> = stub.calls().into_iter().map(|c| c.url).collect();
        urls.sort();
        assert_eq!(
            urls,
            vec![
                "https://api.test/v10/applications/app/commands",
                "https://api.test/v10/applications/app/guilds/10/commands",
                "https://api.test/v10/applications/app/guilds/20/commands",
            ]
        );
    }
}
