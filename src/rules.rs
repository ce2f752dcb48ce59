//! Interception rule records and the concurrent in-memory rule store.
//!
//! Three independent collections (mock, chaos, routing) are edited at runtime
//! by the admin REST surface and read by the request pipeline. Pipeline stages
//! take a cloned snapshot of a collection at stage entry, so a mutation is
//! visible to the next request but never to one already in flight.

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::matcher::path_matches;

fn new_rule_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_error_status() -> u16 {
    503
}

/// Canned-response rule. A matching request is answered directly without
/// touching the local service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockRule {
    #[serde(default = "new_rule_id")]
    pub id: String,
    pub name: String,
    pub path_pattern: String,
    /// HTTP method filter; `None` matches any method.
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub status_code: u16,
    pub content_type: String,
    pub response_body: String,
}

/// Latency and/or probabilistic error injection rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChaosRule {
    #[serde(default = "new_rule_id")]
    pub id: String,
    pub name: String,
    pub path_pattern: String,
    /// HTTP method filter; `None` matches any method.
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Base injected latency in milliseconds (0 = none).
    #[serde(default)]
    pub latency_ms: u64,
    /// Uniform jitter applied as `latency_ms ± jitter_ms`, clamped at zero.
    #[serde(default)]
    pub jitter_ms: u64,
    /// Probability in `[0, 1]` that a matching request fails synthetically.
    #[serde(default)]
    pub error_rate: f64,
    #[serde(default = "default_error_status")]
    pub error_status_code: u16,
    #[serde(default)]
    pub error_body: String,
}

/// Target override rule. Lower `priority` wins; ties resolve by insertion
/// order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    #[serde(default = "new_rule_id")]
    pub id: String,
    pub name: String,
    pub path_pattern: String,
    /// Base URL the matched request is re-issued against (path is appended).
    pub target_base_url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
}

fn method_matches(filter: Option<&str>, method: &str) -> bool {
    filter.is_none_or(|m| m.eq_ignore_ascii_case(method))
}

impl MockRule {
    /// Whether this rule applies to the given request line.
    pub fn matches(&self, method: &str, path: &str) -> bool {
        method_matches(self.method.as_deref(), method) && path_matches(&self.path_pattern, path)
    }
}

impl ChaosRule {
    pub fn matches(&self, method: &str, path: &str) -> bool {
        method_matches(self.method.as_deref(), method) && path_matches(&self.path_pattern, path)
    }
}

impl RoutingRule {
    pub fn matches(&self, path: &str) -> bool {
        path_matches(&self.path_pattern, path)
    }
}

/// In-memory store for all three rule collections.
///
/// Reads return cloned snapshots; writes replace whole rules, so concurrent
/// readers never observe a partially updated rule.
#[derive(Default)]
pub struct RuleStore {
    mocks: RwLock<Vec<MockRule>>,
    chaos: RwLock<Vec<ChaosRule>>,
    routes: RwLock<Vec<RoutingRule>>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ─── Mock rules ──────────────────────────────────────────────────────────

    /// Snapshot of all mock rules in insertion order.
    pub async fn mocks(&self) -> Vec<MockRule> {
        self.mocks.read().await.clone()
    }

    pub async fn add_mock(&self, rule: MockRule) {
        self.mocks.write().await.push(rule);
    }

    /// Replace the rule with `id`. Returns `false` if no such rule exists.
    pub async fn replace_mock(&self, id: &str, mut rule: MockRule) -> bool {
        let mut mocks = self.mocks.write().await;
        match mocks.iter_mut().find(|r| r.id == id) {
            Some(slot) => {
                rule.id = id.to_string();
                *slot = rule;
                true
            }
            None => false,
        }
    }

    /// Delete the rule with `id`. Returns `false` if no such rule exists.
    pub async fn remove_mock(&self, id: &str) -> bool {
        let mut mocks = self.mocks.write().await;
        let before = mocks.len();
        mocks.retain(|r| r.id != id);
        mocks.len() < before
    }

    // ─── Chaos rules ─────────────────────────────────────────────────────────

    pub async fn chaos(&self) -> Vec<ChaosRule> {
        self.chaos.read().await.clone()
    }

    pub async fn add_chaos(&self, rule: ChaosRule) {
        self.chaos.write().await.push(rule);
    }

    pub async fn replace_chaos(&self, id: &str, mut rule: ChaosRule) -> bool {
        let mut chaos = self.chaos.write().await;
        match chaos.iter_mut().find(|r| r.id == id) {
            Some(slot) => {
                rule.id = id.to_string();
                *slot = rule;
                true
            }
            None => false,
        }
    }

    pub async fn remove_chaos(&self, id: &str) -> bool {
        let mut chaos = self.chaos.write().await;
        let before = chaos.len();
        chaos.retain(|r| r.id != id);
        chaos.len() < before
    }

    /// Flip a chaos rule's `enabled` flag atomically. Returns the new state,
    /// or `None` if no such rule exists.
    pub async fn toggle_chaos(&self, id: &str) -> Option<bool> {
        let mut chaos = self.chaos.write().await;
        let rule = chaos.iter_mut().find(|r| r.id == id)?;
        rule.enabled = !rule.enabled;
        Some(rule.enabled)
    }

    // ─── Routing rules ───────────────────────────────────────────────────────

    pub async fn routes(&self) -> Vec<RoutingRule> {
        self.routes.read().await.clone()
    }

    pub async fn add_route(&self, rule: RoutingRule) {
        self.routes.write().await.push(rule);
    }

    pub async fn replace_route(&self, id: &str, mut rule: RoutingRule) -> bool {
        let mut routes = self.routes.write().await;
        match routes.iter_mut().find(|r| r.id == id) {
            Some(slot) => {
                rule.id = id.to_string();
                *slot = rule;
                true
            }
            None => false,
        }
    }

    pub async fn remove_route(&self, id: &str) -> bool {
        let mut routes = self.routes.write().await;
        let before = routes.len();
        routes.retain(|r| r.id != id);
        routes.len() < before
    }
}
