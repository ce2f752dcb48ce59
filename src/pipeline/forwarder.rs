//! Forward stage: re-issue the request against the resolved local target.

use futures::{StreamExt, TryStreamExt};
use http::header::{HeaderMap, CONTENT_TYPE};
use tracing::{debug, warn};

use super::{BodyError, TunnelContext};
use crate::state::AgentState;

/// Hop-by-hop headers never forwarded to the local service. `Proxy-*`
/// prefixed headers are dropped as well.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "te",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.contains(&name) || name.starts_with("proxy-")
}

/// Issue the outbound HTTP request and populate the response side of `ctx`.
///
/// Response headers are read eagerly; the body is left as a stream for the
/// transport to chunk. A connection failure becomes a synthesized 502 rather
/// than an error, so it travels the normal frame path back to the relay.
pub async fn apply(state: &AgentState, ctx: &mut TunnelContext) {
    let Some(url) = ctx.target_url.clone() else {
        // Router always runs first; an absent target means a wiring bug.
        synthesize_bad_gateway(ctx, "no forward target resolved");
        return;
    };

    let method = reqwest::Method::from_bytes(ctx.method.as_bytes())
        .unwrap_or(reqwest::Method::GET);

    let mut headers = HeaderMap::new();
    for (name, value) in &ctx.request_headers {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let mut request = state.http.request(method, &url).headers(headers);
    if let Some(body) = ctx.request_body.clone() {
        request = request.body(body);
    }

    match request.send().await {
        Ok(response) => {
            ctx.status = response.status().as_u16();
            ctx.content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("application/octet-stream")
                .to_string();

            let mut response_headers = HeaderMap::new();
            for (name, value) in response.headers() {
                if name == CONTENT_TYPE {
                    continue;
                }
                response_headers.append(name.clone(), value.clone());
            }
            ctx.response_headers = response_headers;
            ctx.response_body = Some(
                response
                    .bytes_stream()
                    .map_err(|e| Box::new(e) as BodyError)
                    .boxed(),
            );
            debug!(url = %url, status = ctx.status, "Forwarded to local service");
        }
        Err(e) => {
            warn!(url = %url, error = %e, "Local service unreachable");
            synthesize_bad_gateway(ctx, &e.to_string());
        }
    }
}

fn synthesize_bad_gateway(ctx: &mut TunnelContext, reason: &str) {
    ctx.status = 502;
    ctx.content_type = "text/plain".to_string();
    ctx.response_headers = HeaderMap::new();
    ctx.set_body_bytes(format!("Bad Gateway: {reason}").into_bytes());
}
