//! Shared agent state passed to the pipeline, the transport client, and every
//! admin REST handler via Axum's `State` extractor.

use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::request_log::RequestLog;
use crate::rules::RuleStore;

/// Shared application state for the burrow agent.
#[derive(Clone)]
pub struct AgentState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the agent started (for uptime calculation).
    pub start_time: Instant,
    /// Mock, chaos, and routing rule collections.
    pub rules: Arc<RuleStore>,
    /// Ring buffer of completed requests.
    pub request_log: Arc<RequestLog>,
    /// Tunnel connection stats, updated by the transport client.
    pub tunnel_stats: Arc<TunnelStats>,
    /// Outbound HTTP client used by the forwarder stage.
    pub http: reqwest::Client,
}

impl AgentState {
    pub fn new(config: Config) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            rules: Arc::new(RuleStore::new()),
            request_log: Arc::new(RequestLog::default()),
            tunnel_stats: Arc::new(TunnelStats::new()),
            http,
        }
    }
}

/// Tunnel connection statistics, atomics for lock-free hot-path updates.
pub struct TunnelStats {
    /// Whether the channel to the relay is currently open.
    pub connected: AtomicBool,
    /// Number of reconnect attempts since startup.
    pub reconnects: AtomicU64,
    /// Requests dispatched through the pipeline since startup.
    pub requests_served: AtomicU64,
}

impl TunnelStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            reconnects: AtomicU64::new(0),
            requests_served: AtomicU64::new(0),
        }
    }
}

impl Default for TunnelStats {
    fn default() -> Self {
        Self::new()
    }
}
