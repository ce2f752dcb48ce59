//! Request log endpoints.
//!
//! - `GET /api/log?limit=N`: newest-first entries (default 50, max 200)
//! - `DELETE /api/log`: clear all entries

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::request_log::LOG_CAPACITY;
use crate::state::AgentState;

#[derive(Deserialize)]
pub struct LogQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

pub async fn recent(
    State(state): State<AgentState>,
    Query(query): Query<LogQuery>,
) -> Json<Value> {
    let limit = query.limit.min(LOG_CAPACITY);
    let entries = state.request_log.recent(limit).await;
    Json(json!({ "entries": entries }))
}

pub async fn clear(State(state): State<AgentState>) -> StatusCode {
    state.request_log.clear().await;
    StatusCode::NO_CONTENT
}
