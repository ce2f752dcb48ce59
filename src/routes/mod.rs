//! Admin REST surface served by the agent.
//!
//! This is the surface external tooling uses to edit rule collections and
//! read the request log at runtime. It binds a local address and carries no
//! authentication; do not expose it publicly.

use axum::routing::{get, post, put};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AgentState;

pub mod health;
pub mod log;
pub mod rules;

/// Build the admin router.
pub fn admin_router(state: AgentState) -> Router {
    Router::new()
        .route("/api/health", get(health::health))
        .route(
            "/api/rules/mocks",
            get(rules::list_mocks).post(rules::create_mock),
        )
        .route(
            "/api/rules/mocks/{id}",
            put(rules::update_mock).delete(rules::delete_mock),
        )
        .route(
            "/api/rules/chaos",
            get(rules::list_chaos).post(rules::create_chaos),
        )
        .route(
            "/api/rules/chaos/{id}",
            put(rules::update_chaos).delete(rules::delete_chaos),
        )
        .route("/api/rules/chaos/{id}/toggle", post(rules::toggle_chaos))
        .route(
            "/api/rules/routes",
            get(rules::list_routes).post(rules::create_route),
        )
        .route(
            "/api/rules/routes/{id}",
            put(rules::update_route).delete(rules::delete_route),
        )
        .route("/api/log", get(log::recent).delete(log::clear))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
