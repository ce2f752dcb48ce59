//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `BURROW_LISTEN`, `BURROW_AGENT_ID`,
//!    `BURROW_RELAY_URL`, `BURROW_LOCAL_PORT`
//! 2. **Config file**: path via `--config <path>`, or `burrow.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [relay]
//! listen = "0.0.0.0:8080"
//! request_timeout_secs = 30        # public-side deadline before a 504
//!
//! [agent]
//! id = "dev"                       # first host label on the public side
//! relay_url = "ws://localhost:8080/tunnel"
//! local_port = 9002                # default forward target port
//! admin_listen = "127.0.0.1:4040"  # rule CRUD + request log REST surface
//! reconnect_delay_secs = 3
//! heartbeat_interval_secs = 5
//! keepalive_interval_secs = 15
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Settings for `burrow relay`.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Socket address the public front binds (default `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Seconds a public request waits for the agent before a 504 (default 30).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Settings for `burrow agent`.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Agent id, matched against the first dot-separated label of the public
    /// request host. Override with `BURROW_AGENT_ID`.
    #[serde(default = "default_agent_id")]
    pub id: String,
    /// Relay channel URL (the `clientId` query parameter is appended).
    /// Override with `BURROW_RELAY_URL`.
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    /// Port of the local service requests forward to when no routing rule
    /// matches. Override with `BURROW_LOCAL_PORT`.
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    /// Socket address of the local admin REST surface (default `127.0.0.1:4040`).
    #[serde(default = "default_admin_listen")]
    pub admin_listen: String,
    /// Seconds between reconnect attempts after the channel drops (default 3).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Seconds between heartbeat frames (default 5).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Seconds between WebSocket keep-alive pings (default 15).
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_agent_id() -> String {
    "dev".to_string()
}
fn default_relay_url() -> String {
    "ws://localhost:8080/tunnel".to_string()
}
fn default_local_port() -> u16 {
    9002
}
fn default_admin_listen() -> String {
    "127.0.0.1:4040".to_string()
}
fn default_reconnect_delay() -> u64 {
    3
}
fn default_heartbeat_interval() -> u64 {
    5
}
fn default_keepalive_interval() -> u64 {
    15
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: default_agent_id(),
            relay_url: default_relay_url(),
            local_port: default_local_port(),
            admin_listen: default_admin_listen(),
            reconnect_delay_secs: default_reconnect_delay(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            keepalive_interval_secs: default_keepalive_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `burrow.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("burrow.toml").exists() {
            let content =
                std::fs::read_to_string("burrow.toml").expect("Failed to read burrow.toml");
            toml::from_str(&content).expect("Failed to parse burrow.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("BURROW_LISTEN") {
            config.relay.listen = listen;
        }
        if let Ok(id) = std::env::var("BURROW_AGENT_ID") {
            config.agent.id = id;
        }
        if let Ok(url) = std::env::var("BURROW_RELAY_URL") {
            config.agent.relay_url = url;
        }
        if let Ok(port) = std::env::var("BURROW_LOCAL_PORT") {
            if let Ok(port) = port.parse() {
                config.agent.local_port = port;
            }
        }

        config
    }
}
