//! Routing stage: resolve the forward target for the request.

use tracing::debug;

use super::TunnelContext;
use crate::state::AgentState;

/// Resolve `ctx.target_url` from the routing rules.
///
/// Rules are considered in ascending priority order; the first enabled rule
/// whose pattern matches the path wins, with the rule's base URL (trailing
/// slash stripped) prepended to the request path. Without a match the target
/// is the configured local port. This stage never short-circuits.
pub async fn apply(state: &AgentState, ctx: &mut TunnelContext) {
    let mut rules = state.rules.routes().await;
    rules.sort_by_key(|r| r.priority);

    let target = match rules
        .iter()
        .find(|r| r.enabled && r.matches(&ctx.path))
    {
        Some(rule) => {
            debug!(rule = %rule.name, target = %rule.target_base_url, "Routing rule matched");
            format!("{}{}", rule.target_base_url.trim_end_matches('/'), ctx.path)
        }
        None => format!("http://localhost:{}{}", state.config.agent.local_port, ctx.path),
    };

    ctx.target_url = Some(target);
}
