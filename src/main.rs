#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # pwa-chat-relay
//!
//! Per-user WebSocket chat relay. Accepts browser connections on `/ws`,
//! replays buffered history on reconnect, streams an injected agent's
//! reply back to every connected tab, and falls back to push notification
//! when nobody is listening live.
//!
//! ## Subcommands
//!
//! - `pwa-chat-relay serve` (default) — run the WebSocket server

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use pwa_chat_relay::agent::{AgentRuntime, DeliverInfo, InboundContext};
use pwa_chat_relay::history::HistoryStore;
use pwa_chat_relay::push::{PushSink, ReqwestPushTransport};
use pwa_chat_relay::state::{AppState, UserStates};
use pwa_chat_relay::ws;
use pwa_chat_relay::Config;

/// Per-user WebSocket chat relay.
#[derive(Parser)]
#[command(name = "pwa-chat-relay", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the WebSocket server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

/// Stand-in used when no real agent runtime has been injected. Spec §9
/// calls for "an initializer that fails loudly if called before injection"
/// — this is that failure mode made concrete: every dispatch immediately
/// reports an error rather than silently hanging, since the host process
/// wiring a real runtime in is out of scope here (spec §1).
struct UnconfiguredAgent;

#[async_trait::async_trait]
impl AgentRuntime for UnconfiguredAgent {
    async fn record_session_metadata(&self, _ctx: &InboundContext) {}

    async fn dispatch(
        &self,
        _ctx: InboundContext,
        _deliver: Box<dyn FnMut(String, DeliverInfo) + Send>,
        mut on_error: Box<dyn FnMut(String) + Send>,
    ) {
        on_error("no AgentRuntime has been injected into this process".to_string());
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => run_server(None).await,
    }
}

async fn run_server(config_path: Option<&str>) {
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    if !config.channels.pwa_chat.enabled {
        info!("pwa-chat relay disabled via config, exiting");
        return;
    }

    info!("pwa-chat-relay v{} starting", env!("CARGO_PKG_VERSION"));

    let history_dir = format!("{}/pwa-chat-history", config.storage.data_dir);
    let push_dir = format!("{}/pwa-chat-push", config.storage.data_dir);

    let history = Arc::new(HistoryStore::new(history_dir));
    let push = Arc::new(PushSink::load(push_dir, Arc::new(ReqwestPushTransport::new())).await);
    let agent: Arc<dyn AgentRuntime> = Arc::new(UnconfiguredAgent);

    let state = AppState {
        config: Arc::new(config.clone()),
        user_states: UserStates::new(),
        history,
        push,
        agent,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/ws", get(ws::ws_upgrade))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let bind_addr = config.bind_addr();
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(source) => {
            error!("failed to bind {bind_addr}: {source}");
            std::process::exit(1);
        }
    };

    info!("listening on {bind_addr}");

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("received SIGINT");
        }
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .expect("server error");

    info!("goodbye");
}
