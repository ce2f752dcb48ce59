#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # burrow
//!
//! Self-hosted reverse HTTP tunnel with a programmable request-interception
//! pipeline.
//!
//! Two processes share one binary:
//!
//! - `burrow relay` — public side. Accepts agent channels at
//!   `/tunnel?clientId=<id>` and proxies every other request to the agent
//!   named by the first label of the request host.
//! - `burrow agent` — developer side. Connects outbound to the relay,
//!   re-issues each proxied request against a local service, and runs every
//!   request through mock → chaos → route → forward interception stages.
//!
//! ## Agent admin API (local)
//!
//! | Method     | Path                          | Description                   |
//! |------------|-------------------------------|-------------------------------|
//! | GET        | `/api/health`                 | Liveness + tunnel stats       |
//! | GET/POST   | `/api/rules/mocks`            | List / create mock rules      |
//! | PUT/DELETE | `/api/rules/mocks/{id}`       | Replace / delete a mock rule  |
//! | GET/POST   | `/api/rules/chaos`            | List / create chaos rules     |
//! | PUT/DELETE | `/api/rules/chaos/{id}`       | Replace / delete a chaos rule |
//! | POST       | `/api/rules/chaos/{id}/toggle`| Flip a chaos rule's enabled   |
//! | GET/POST   | `/api/rules/routes`           | List / create routing rules   |
//! | PUT/DELETE | `/api/rules/routes/{id}`      | Replace / delete a route rule |
//! | GET/DELETE | `/api/log`                    | Read / clear the request log  |
//!
//! ## Relay API
//!
//! | Method | Path          | Description                      |
//! |--------|---------------|----------------------------------|
//! | GET    | `/tunnel`     | Agent WebSocket registration     |
//! | GET    | `/api/agents` | List connected agents            |
//! | any    | `/*`          | Proxy to the agent named by host |

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use burrow::config::Config;
use burrow::routes;
use burrow::state::AgentState;
use burrow::tunnel::{client, relay};

/// Self-hosted reverse HTTP tunnel with request interception.
#[derive(Parser)]
#[command(name = "burrow", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the public relay.
    Relay {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run the developer-side agent.
    Agent {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        Commands::Relay { config } => run_relay(config.as_deref()).await,
        Commands::Agent { config } => run_agent(config.as_deref()).await,
    }
}

fn init_tracing(config: &Config) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}

async fn run_relay(config_path: Option<&str>) {
    let config = Config::load(config_path);
    init_tracing(&config);

    info!("burrow relay v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.relay.listen);

    let relay_state = relay::RelayState::new(config.relay.request_timeout_secs);
    let app = relay::relay_router(relay_state).layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.relay.listen)
        .await
        .expect("Failed to bind");
    info!("Relay ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    info!("Goodbye");
}

async fn run_agent(config_path: Option<&str>) {
    let config = Config::load(config_path);
    init_tracing(&config);

    info!("burrow agent v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Agent id: {}", config.agent.id);
    info!("Relay: {}", config.agent.relay_url);
    info!("Default local target: http://localhost:{}", config.agent.local_port);

    let state = AgentState::new(config);
    let tunnel_task = client::spawn(state.clone());

    let app = routes::admin_router(state.clone());
    let listener = TcpListener::bind(&state.config.agent.admin_listen)
        .await
        .expect("Failed to bind admin listener");
    info!("Admin API on {}", state.config.agent.admin_listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // Cancels any in-flight pipeline work at its next suspension point.
    info!("Shutting down...");
    tunnel_task.abort();
    info!("Goodbye");
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
