//! Per-request interception pipeline.
//!
//! Every assembled tunnel request runs through four stages in fixed order:
//!
//! 1. [`mock`] — answer from a canned-response rule
//! 2. [`chaos`] — inject latency and/or a synthetic error
//! 3. [`router`] — resolve the forward target URL
//! 4. [`forwarder`] — re-issue the request against the local service
//!
//! A stage short-circuits the rest by setting [`TunnelContext::is_handled`];
//! the driver checks the flag before entering each subsequent stage. Each
//! stage snapshots its rule collection on entry, so rule edits apply to the
//! next request, never one mid-flight.

use std::collections::HashMap;
use std::time::Instant;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use uuid::Uuid;

use crate::request_log::{self, RequestLogEntry};
use crate::state::AgentState;
use crate::tunnel::frame::RequestMeta;

pub mod chaos;
pub mod forwarder;
pub mod mock;
pub mod router;

/// Boxed error for response body streams (reqwest errors and the like).
pub type BodyError = Box<dyn std::error::Error + Send + Sync>;

/// Streaming response body produced by a stage.
pub type ResponseBodyStream = BoxStream<'static, Result<Bytes, BodyError>>;

/// Mutable per-request record threaded through the pipeline stages.
pub struct TunnelContext {
    pub request_id: Uuid,
    pub method: String,
    /// Path plus query string.
    pub path: String,
    pub request_headers: HeaderMap,
    /// Fully buffered request body, if the request had one.
    pub request_body: Option<Bytes>,
    /// Forward target resolved by the router stage; `None` when a mock or
    /// chaos rule answered before routing.
    pub target_url: Option<String>,
    pub status: u16,
    pub content_type: String,
    pub response_body: Option<ResponseBodyStream>,
    /// Response headers, excluding `Content-Type` (carried separately).
    pub response_headers: HeaderMap,
    /// Set by a stage that produced the response itself; later stages are
    /// skipped.
    pub is_handled: bool,
    pub started_at: Instant,
    pub applied_mock_rule: Option<String>,
    pub applied_chaos_rule: Option<String>,
}

impl TunnelContext {
    pub fn new(request_id: Uuid, meta: &RequestMeta, body: Option<Bytes>) -> Self {
        Self {
            request_id,
            method: meta.method.clone(),
            path: meta.path.clone(),
            request_headers: header_map_from_flat(&meta.headers),
            request_body: body,
            target_url: None,
            status: 200,
            content_type: "application/octet-stream".to_string(),
            response_body: None,
            response_headers: HeaderMap::new(),
            is_handled: false,
            started_at: Instant::now(),
            applied_mock_rule: None,
            applied_chaos_rule: None,
        }
    }

    /// Replace the response body with a fixed byte string.
    pub fn set_body_bytes(&mut self, bytes: impl Into<Bytes>) {
        let bytes = bytes.into();
        self.response_body = Some(futures::stream::once(async move { Ok(bytes) }).boxed());
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    /// Snapshot this context as a request log entry.
    pub fn to_log_entry(&self) -> RequestLogEntry {
        let body = self.request_body.as_deref().unwrap_or(&[]);
        RequestLogEntry {
            request_id: self.request_id.to_string(),
            timestamp_ms: request_log::now_ms(),
            method: self.method.clone(),
            path: self.path.clone(),
            status: self.status,
            duration_ms: self.elapsed_ms(),
            applied_mock_rule: self.applied_mock_rule.clone(),
            applied_chaos_rule: self.applied_chaos_rule.clone(),
            target_url: self.target_url.clone(),
            request_headers: flatten_headers(&self.request_headers),
            body_preview: request_log::body_preview(body),
            request_content_length: body.len() as u64,
            response_headers: flatten_headers(&self.response_headers),
        }
    }
}

/// Run the four stages against `ctx`, honoring short-circuits.
pub async fn run(state: &AgentState, ctx: &mut TunnelContext) {
    mock::apply(state, ctx).await;
    if !ctx.is_handled {
        chaos::apply(state, ctx).await;
    }
    if !ctx.is_handled {
        router::apply(state, ctx).await;
    }
    if !ctx.is_handled {
        forwarder::apply(state, ctx).await;
    }
}

// ─── Header map conversions ──────────────────────────────────────────────────

/// Build a case-insensitive header map from flattened string pairs, skipping
/// pairs that are not valid HTTP header names or values.
pub fn header_map_from_flat(flat: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in flat {
        let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) else {
            continue;
        };
        map.insert(name, value);
    }
    map
}

/// Flatten a header map to single string values, comma-joining repeats.
pub fn flatten_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut flat = HashMap::new();
    for name in headers.keys() {
        let joined = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");
        flat.insert(name.as_str().to_string(), joined);
    }
    flat
}

/// Expand a header map into name → ordered value list, preserving the order
/// of repeated headers such as `Set-Cookie`.
pub fn headers_to_multi_map(headers: &HeaderMap) -> HashMap<String, Vec<String>> {
    let mut multi: HashMap<String, Vec<String>> = HashMap::new();
    for name in headers.keys() {
        let values = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok().map(ToString::to_string))
            .collect();
        multi.insert(name.as_str().to_string(), values);
    }
    multi
}
