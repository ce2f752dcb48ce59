//! `GET /api/health`: agent liveness and tunnel stats.

use std::sync::atomic::Ordering;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AgentState;

pub async fn health(State(state): State<AgentState>) -> Json<Value> {
    let stats = &state.tunnel_stats;
    Json(json!({
        "status": "ok",
        "agent_id": state.config.agent.id,
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "tunnel": {
            "connected": stats.connected.load(Ordering::Relaxed),
            "reconnects": stats.reconnects.load(Ordering::Relaxed),
            "requests_served": stats.requests_served.load(Ordering::Relaxed),
        },
        "rules": {
            "mocks": state.rules.mocks().await.len(),
            "chaos": state.rules.chaos().await.len(),
            "routes": state.rules.routes().await.len(),
        },
        "log_entries": state.request_log.len().await,
    }))
}
