//! Mock stage: answer matching requests from a canned-response rule.

use tracing::debug;

use super::TunnelContext;
use crate::state::AgentState;

/// Apply the first enabled mock rule matching the request, if any.
///
/// On a hit the rule's status, content type, and body become the response and
/// the rest of the pipeline is skipped. The local service is never contacted.
pub async fn apply(state: &AgentState, ctx: &mut TunnelContext) {
    let rules = state.rules.mocks().await;
    let Some(rule) = rules
        .iter()
        .find(|r| r.enabled && r.matches(&ctx.method, &ctx.path))
    else {
        return;
    };

    ctx.status = rule.status_code;
    ctx.content_type = rule.content_type.clone();
    ctx.set_body_bytes(rule.response_body.clone().into_bytes());
    ctx.applied_mock_rule = Some(rule.name.clone());
    ctx.is_handled = true;
    debug!(rule = %rule.name, path = %ctx.path, "Mock rule answered request");
}
