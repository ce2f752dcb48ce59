//! Rule CRUD endpoints.
//!
//! Each collection gets the same verbs: list, create, replace by id, delete
//! by id. Chaos rules additionally support an atomic enabled-flag toggle.
//! Replacing or deleting a missing id returns `404` with
//! `{"code":"RULE_NOT_FOUND"}`; invalid payloads return `400` with
//! `{"code":"INVALID_RULE"}`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};

use crate::rules::{ChaosRule, MockRule, RoutingRule};
use crate::state::AgentState;

type RuleError = (StatusCode, Json<Value>);

fn invalid(reason: &str) -> RuleError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": reason, "code": "INVALID_RULE"})),
    )
}

fn not_found(id: &str) -> RuleError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("No rule with id '{id}'"), "code": "RULE_NOT_FOUND"})),
    )
}

fn validate_status(status: u16) -> Result<(), RuleError> {
    if (100..=599).contains(&status) {
        Ok(())
    } else {
        Err(invalid("status code must be in 100..=599"))
    }
}

fn validate_mock(rule: &MockRule) -> Result<(), RuleError> {
    if rule.path_pattern.is_empty() {
        return Err(invalid("path_pattern must not be empty"));
    }
    validate_status(rule.status_code)
}

fn validate_chaos(rule: &ChaosRule) -> Result<(), RuleError> {
    if rule.path_pattern.is_empty() {
        return Err(invalid("path_pattern must not be empty"));
    }
    if !(0.0..=1.0).contains(&rule.error_rate) {
        return Err(invalid("error_rate must be in [0, 1]"));
    }
    validate_status(rule.error_status_code)
}

fn validate_route(rule: &RoutingRule) -> Result<(), RuleError> {
    if rule.path_pattern.is_empty() {
        return Err(invalid("path_pattern must not be empty"));
    }
    if rule.target_base_url.is_empty() {
        return Err(invalid("target_base_url must not be empty"));
    }
    Ok(())
}

// ─── Mock rules ──────────────────────────────────────────────────────────────

pub async fn list_mocks(State(state): State<AgentState>) -> Json<Vec<MockRule>> {
    Json(state.rules.mocks().await)
}

pub async fn create_mock(
    State(state): State<AgentState>,
    Json(rule): Json<MockRule>,
) -> Result<Json<MockRule>, RuleError> {
    validate_mock(&rule)?;
    state.rules.add_mock(rule.clone()).await;
    Ok(Json(rule))
}

pub async fn update_mock(
    State(state): State<AgentState>,
    Path(id): Path<String>,
    Json(rule): Json<MockRule>,
) -> Result<Json<MockRule>, RuleError> {
    validate_mock(&rule)?;
    if state.rules.replace_mock(&id, rule.clone()).await {
        Ok(Json(MockRule { id, ..rule }))
    } else {
        Err(not_found(&id))
    }
}

pub async fn delete_mock(
    State(state): State<AgentState>,
    Path(id): Path<String>,
) -> Result<StatusCode, RuleError> {
    if state.rules.remove_mock(&id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(&id))
    }
}

// ─── Chaos rules ─────────────────────────────────────────────────────────────

pub async fn list_chaos(State(state): State<AgentState>) -> Json<Vec<ChaosRule>> {
    Json(state.rules.chaos().await)
}

pub async fn create_chaos(
    State(state): State<AgentState>,
    Json(rule): Json<ChaosRule>,
) -> Result<Json<ChaosRule>, RuleError> {
    validate_chaos(&rule)?;
    state.rules.add_chaos(rule.clone()).await;
    Ok(Json(rule))
}

pub async fn update_chaos(
    State(state): State<AgentState>,
    Path(id): Path<String>,
    Json(rule): Json<ChaosRule>,
) -> Result<Json<ChaosRule>, RuleError> {
    validate_chaos(&rule)?;
    if state.rules.replace_chaos(&id, rule.clone()).await {
        Ok(Json(ChaosRule { id, ..rule }))
    } else {
        Err(not_found(&id))
    }
}

pub async fn delete_chaos(
    State(state): State<AgentState>,
    Path(id): Path<String>,
) -> Result<StatusCode, RuleError> {
    if state.rules.remove_chaos(&id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(&id))
    }
}

/// `POST /api/rules/chaos/{id}/toggle`: flip the enabled flag.
pub async fn toggle_chaos(
    State(state): State<AgentState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, RuleError> {
    match state.rules.toggle_chaos(&id).await {
        Some(enabled) => Ok(Json(json!({"id": id, "enabled": enabled}))),
        None => Err(not_found(&id)),
    }
}

// ─── Routing rules ───────────────────────────────────────────────────────────

pub async fn list_routes(State(state): State<AgentState>) -> Json<Vec<RoutingRule>> {
    Json(state.rules.routes().await)
}

pub async fn create_route(
    State(state): State<AgentState>,
    Json(rule): Json<RoutingRule>,
) -> Result<Json<RoutingRule>, RuleError> {
    validate_route(&rule)?;
    state.rules.add_route(rule.clone()).await;
    Ok(Json(rule))
}

pub async fn update_route(
    State(state): State<AgentState>,
    Path(id): Path<String>,
    Json(rule): Json<RoutingRule>,
) -> Result<Json<RoutingRule>, RuleError> {
    validate_route(&rule)?;
    if state.rules.replace_route(&id, rule.clone()).await {
        Ok(Json(RoutingRule { id, ..rule }))
    } else {
        Err(not_found(&id))
    }
}

pub async fn delete_route(
    State(state): State<AgentState>,
    Path(id): Path<String>,
) -> Result<StatusCode, RuleError> {
    if state.rules.remove_route(&id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(&id))
    }
}
