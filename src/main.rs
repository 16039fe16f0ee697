//! Demo bot: a couple of slash commands served over the gateway (default) or
//! as an interactions webhook (`INTERACTIONS_MODE=webhook`).

use std::sync::Arc;

use discord_interactions::types::*;
use discord_interactions::{
    register_commands, ArgSpec, Arguments, ClientConfig, DiscordHttpClient, Dispatcher, GatewayClient,
    HandlerDef, RegistrationError, Router, WebhookClient,
};
use tracing::{error, info};

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn commands() -> Result<Router, RegistrationError> {
    let mut router = Router::new();

    router.register(HandlerDef::new("ping", "Check that the bot is alive"), |_, _| async {
        "> pong"
    })?;

    router.register(
        HandlerDef::new("echo", "Repeat a message back")
            .arg(ArgSpec::string("text").describe("What to repeat"))
            .arg(ArgSpec::integer("times").describe("How many times").optional())
            .arg(ArgSpec::boolean("embed").describe("Send as an embed").optional()),
        |interaction: Interaction, args: Arguments| async move {
            let text = args.str("text").unwrap_or_default();
            let times = args.integer("times").unwrap_or(1).clamp(1, 5) as usize;
            let body = vec![text; times].join("\n");
            if args.boolean("embed").unwrap_or(false) {
                let author = interaction.author().map(User::tag).unwrap_or_default();
                Response::embed(Embed::new("Echo").description(body).color_rgb(88, 101, 242).footer(author))
            } else {
                Response::text(body)
            }
        },
    )?;

    router.register(
        HandlerDef::new("whois", "Show who someone is").arg(ArgSpec::user("who").describe("The member")),
        |_, args: Arguments| async move {
            match args.member("who") {
                Some(member) => format!("{} is {}", member.mention(), member.display_name()),
                None => "> nobody".to_string(),
            }
        },
    )?;

    Ok(router)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    // Initialise tracing (respects RUST_LOG env, defaults to info).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match ClientConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    let router = match commands() {
        Ok(router) => router,
        Err(e) => {
            error!(error = %e, "failed to build command router");
            std::process::exit(1);
        }
    };

    let http = DiscordHttpClient::from_config(&config);
    register_commands(&http, &config.application_id, &router).await;

    let mode = std::env::var("INTERACTIONS_MODE").unwrap_or_else(|_| "gateway".to_string());
    let result = match mode.as_str() {
        "webhook" => run_webhook(&config, router, http).await,
        "gateway" => run_gateway(config, router, http).await,
        other => Err(format!("unknown INTERACTIONS_MODE {other:?} (expected gateway or webhook)")),
    };
    if let Err(e) = result {
        error!(error = %e, "bot stopped");
        std::process::exit(1);
    }
}

async fn run_gateway(config: ClientConfig, router: Router, http: DiscordHttpClient) -> Result<(), String> {
    let client = GatewayClient::new(config, router).with_http(http);
    let shutdown = client.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            shutdown.shutdown();
        }
    });
    client.run().await.map_err(|e| e.to_string())
}

async fn run_webhook(config: &ClientConfig, router: Router, http: DiscordHttpClient) -> Result<(), String> {
    let dispatcher = Dispatcher::new(Arc::new(router)).with_member_lookup(Arc::new(http));
    let client = WebhookClient::from_config(config, dispatcher).map_err(|e| e.to_string())?;
    client.serve(config.port).await.map_err(|e| e.to_string())
}
