use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

use agent_link::{AgentManager, ChannelSink, FanoutSink};

mod chatwoot;
mod config;
mod handlers;
mod metrics;
mod mock_agent;
mod relay;
mod signature;
mod webhook;

#[cfg(test)]
mod test_helpers;

use crate::chatwoot::ChatwootClient;
use crate::config::{ChatwootConfig, FileConfig, InboxRouting};
use crate::metrics::{BridgeMetrics, CountingSink};
use crate::signature::SignatureVerifier;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "bridge")]
#[command(about = "Relays Chatwoot conversations to AI agents over WebSocket")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (missing file means defaults plus BRIDGE_* env vars)
    #[arg(long, global = true, default_value = "bridge.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge server (default)
    Serve(ServeArgs),

    /// Run a mock agent for local testing
    MockAgent(mock_agent::MockAgentArgs),

    /// Print the effective configuration with secrets masked
    Config,
}

#[derive(Parser, Default)]
struct ServeArgs {
    /// Override `server.port`
    #[arg(short, long)]
    port: Option<u16>,

    /// Override `server.host`
    #[arg(short = 'b', long)]
    host: Option<String>,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub agents: Arc<AgentManager>,
    pub chatwoot: Arc<ChatwootClient>,
    /// Inbox → agent routes plus the fallback reply
    pub routing: Arc<InboxRouting>,
    pub verifier: Arc<SignatureVerifier>,
    /// Bridge metrics for observability
    pub metrics: Arc<BridgeMetrics>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match cli.command {
        None => run_server(ServeArgs::default(), &cli.config).await,
        Some(Commands::Serve(args)) => run_server(args, &cli.config).await,
        Some(Commands::MockAgent(args)) => mock_agent::run(args).await,
        Some(Commands::Config) => print_config(&cli.config),
    }
}

fn init_tracing(debug: bool) {
    let default_directive = if debug {
        "bridge=debug,agent_link=debug,tower_http=debug,info"
    } else {
        "bridge=info,agent_link=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    config::load_config(path)
        .extract()
        .with_context(|| format!("failed to load config from {}", path.display()))
}

fn print_config(path: &Path) -> Result<()> {
    let fc = load_file_config(path)?;
    let shown = toml::to_string_pretty(&config::redacted(&fc)).context("failed to render config")?;
    println!("{shown}");
    Ok(())
}

async fn run_server(args: ServeArgs, config_path: &Path) -> Result<()> {
    let mut fc = load_file_config(config_path)?;
    if let Some(port) = args.port {
        fc.server.port = port;
    }
    if let Some(host) = args.host {
        fc.server.host = host;
    }

    info!("Starting Chatwoot bridge");

    let routing = Arc::new(InboxRouting::from_file(&fc.inboxes, &fc.responses));
    if routing.is_empty() {
        warn!("no inboxes configured; every webhook will be ignored");
    }

    let chatwoot = Arc::new(ChatwootClient::new(&ChatwootConfig::from_file(&fc.chatwoot))?);
    if chatwoot.health_check().await {
        info!("Chatwoot API reachable at {}", fc.chatwoot.base_url);
    } else {
        warn!(
            "Chatwoot API at {} is not reachable; continuing anyway",
            fc.chatwoot.base_url
        );
    }

    let verifier = Arc::new(SignatureVerifier::new(
        fc.chatwoot.webhook_secret.clone(),
        fc.chatwoot.enforce_signatures,
        Duration::from_secs(fc.chatwoot.signature_tolerance_secs),
    ));
    if !verifier.is_active() {
        warn!("webhook signature verification is disabled");
    }

    let metrics = Arc::new(BridgeMetrics::new());

    // Unsolicited agent messages: counted, then relayed to Chatwoot in order.
    let (channel_sink, unsolicited_rx) = ChannelSink::new();
    let sink = FanoutSink::new()
        .with(Arc::new(CountingSink(metrics.clone())))
        .with(Arc::new(channel_sink));
    let relay_shutdown = CancellationToken::new();
    let relay_task = relay::spawn(
        unsolicited_rx,
        chatwoot.clone(),
        metrics.clone(),
        routing.fallback_message().to_string(),
        relay_shutdown.clone(),
    );

    let agents = Arc::new(AgentManager::new(fc.agents.link_config(), Arc::new(sink)));
    let static_agents = routing.static_agents();
    info!(
        inboxes = routing.len(),
        agents = static_agents.len(),
        "agent routes loaded"
    );
    agents.start(&static_agents);

    let app_state = AppState {
        agents: agents.clone(),
        chatwoot,
        routing,
        verifier,
        metrics,
    };

    let app = handlers::router()
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    let addr: SocketAddr = format!("{}:{}", fc.server.host, fc.server.port)
        .parse()
        .context("invalid server address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Bridge listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    agents.shutdown().await;
    relay_shutdown.cancel();
    let _ = relay_task.await;
    info!("Bridge stopped");
    Ok(())
}
