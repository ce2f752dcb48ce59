//! Chaos stage: latency injection and probabilistic synthetic errors.

use std::time::Duration;

use rand::Rng;
use tracing::debug;

use super::TunnelContext;
use crate::state::AgentState;

/// Apply the first enabled chaos rule matching the request, if any.
///
/// A matching rule first sleeps for the jittered latency, then draws against
/// `error_rate`; only a failed draw short-circuits the pipeline.
pub async fn apply(state: &AgentState, ctx: &mut TunnelContext) {
    let rules = state.rules.chaos().await;
    let Some(rule) = rules
        .iter()
        .find(|r| r.enabled && r.matches(&ctx.method, &ctx.path))
    else {
        return;
    };

    ctx.applied_chaos_rule = Some(rule.name.clone());

    if rule.latency_ms > 0 {
        let delay = jittered_delay(rule.latency_ms, rule.jitter_ms);
        let delay_ms = delay.as_millis() as u64;
        debug!(rule = %rule.name, delay_ms, "Injecting latency");
        tokio::time::sleep(delay).await;
    }

    if rule.error_rate > 0.0 && rand::rng().random::<f64>() < rule.error_rate {
        ctx.status = rule.error_status_code;
        ctx.content_type = "text/plain".to_string();
        ctx.set_body_bytes(rule.error_body.clone().into_bytes());
        ctx.is_handled = true;
        debug!(rule = %rule.name, status = rule.error_status_code, "Injecting error");
    }
}

/// Uniform draw from `latency ± jitter`, clamped at zero.
fn jittered_delay(latency_ms: u64, jitter_ms: u64) -> Duration {
    if jitter_ms == 0 {
        return Duration::from_millis(latency_ms);
    }
    #[allow(clippy::cast_possible_wrap)]
    let jitter = rand::rng().random_range(-(jitter_ms as i64)..=jitter_ms as i64);
    Duration::from_millis(latency_ms.saturating_add_signed(jitter))
}
