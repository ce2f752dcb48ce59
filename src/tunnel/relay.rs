//! Tunnel relay: accepts agent channels and proxies public HTTP requests.
//!
//! The relay:
//! 1. Listens for agent WebSocket connections at `/tunnel?clientId=<id>`
//! 2. Serves every other public request by host: the first dot-separated
//!    label of the `Host` header selects the agent
//! 3. Frames each public request over the agent's channel and streams the
//!    demultiplexed response back to the caller

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{Query, Request, State, WebSocketUpgrade},
    http::{
        header::{CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING},
        HeaderName, HeaderValue, StatusCode,
    },
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::frame::{self, Frame, RequestMeta, ResponseHead};
use super::{BODY_CHUNK_SIZE, MAX_QUEUED_CHUNKS};

/// Served for hosts that do not address an agent (numeric-leading first
/// label, or `localhost`).
const LANDING_HTML: &str = "<!DOCTYPE html>\n<html>\n<head><title>burrow</title></head>\n<body>\n<h1>burrow relay</h1>\n<p>This relay forwards requests to a connected agent selected by the first\nlabel of the request host, e.g. <code>myagent.example.com</code>.</p>\n</body>\n</html>\n";

/// State shared across all relay handlers.
#[derive(Clone)]
pub struct RelayState {
    /// Connected agents keyed by agent id.
    pub agents: Arc<RwLock<HashMap<String, ConnectedAgent>>>,
    /// Seconds a public request waits for its response header before a 504.
    pub request_timeout_secs: u64,
}

/// Pending public requests awaiting a response header, keyed by request id.
pub type PendingMap = Arc<Mutex<HashMap<Uuid, oneshot::Sender<AgentResponse>>>>;

/// Open response body queues keyed by request id, fed by the demux loop.
pub type BodyQueueMap = Arc<Mutex<HashMap<Uuid, mpsc::Sender<Bytes>>>>;

/// An agent connected to the relay via its outbound WebSocket.
pub struct ConnectedAgent {
    pub agent_id: String,
    /// Distinguishes this channel from a later one that takes over the id.
    conn_id: Uuid,
    /// Encoded frames queued for the agent; a single writer task drains this
    /// to the WebSocket sink, serializing all sends on the channel.
    pub frame_tx: mpsc::Sender<Vec<u8>>,
    pub pending: PendingMap,
    pub body_queues: BodyQueueMap,
    /// Instant of the last heartbeat frame from the agent.
    pub last_heartbeat: Arc<Mutex<Instant>>,
    /// When this channel was registered.
    pub connected_since: Instant,
}

/// Fulfilled pending request: the response header plus the chunk queue the
/// body will arrive on.
pub struct AgentResponse {
    pub head: ResponseHead,
    pub body: mpsc::Receiver<Bytes>,
}

impl RelayState {
    pub fn new(request_timeout_secs: u64) -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            request_timeout_secs,
        }
    }
}

/// Drop an agent's in-flight request state. Dropping the pending oneshots
/// resolves their public requests immediately; dropping the queue senders
/// ends any response streams mid-flight.
async fn drain_agent(agent: &ConnectedAgent) {
    let pending_count = {
        let mut pending = agent.pending.lock().await;
        let n = pending.len();
        pending.clear();
        n
    };
    let stream_count = {
        let mut queues = agent.body_queues.lock().await;
        let n = queues.len();
        queues.clear();
        n
    };
    if pending_count > 0 || stream_count > 0 {
        info!(
            agent_id = %agent.agent_id,
            pending = pending_count,
            streams = stream_count,
            "Drained in-flight requests"
        );
    }
}

/// Build the relay router: the channel endpoint, the agent listing, and the
/// catch-all public proxy.
pub fn relay_router(state: RelayState) -> Router {
    Router::new()
        .route("/tunnel", get(tunnel_upgrade))
        .route("/api/agents", get(list_agents))
        .fallback(proxy_request)
        .with_state(state)
}

// ─── Agent channel ───────────────────────────────────────────────────────────

/// Query params for the agent channel upgrade.
#[derive(Deserialize)]
struct TunnelQuery {
    #[serde(default, rename = "clientId")]
    client_id: String,
}

/// `GET /tunnel?clientId=<agent-id>`: agent WebSocket registration.
async fn tunnel_upgrade(
    State(state): State<RelayState>,
    Query(query): Query<TunnelQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if query.client_id.is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing clientId").into_response();
    }

    let agent_id = query.client_id;
    info!(agent_id = %agent_id, "Agent connecting...");

    ws.on_upgrade(move |socket| {
        let span = info_span!("tunnel_agent", agent_id = %agent_id);
        handle_agent_channel(socket, state, agent_id).instrument(span)
    })
}

/// Pump one agent channel: register it, forward queued frames to the sink,
/// and demultiplex incoming frames until the socket closes.
async fn handle_agent_channel(
    socket: axum::extract::ws::WebSocket,
    state: RelayState,
    agent_id: String,
) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (frame_tx, mut frame_rx) = mpsc::channel::<Vec<u8>>(MAX_QUEUED_CHUNKS);
    let conn_id = Uuid::new_v4();

    let agent = ConnectedAgent {
        agent_id: agent_id.clone(),
        conn_id,
        frame_tx,
        pending: Arc::new(Mutex::new(HashMap::new())),
        body_queues: Arc::new(Mutex::new(HashMap::new())),
        last_heartbeat: Arc::new(Mutex::new(Instant::now())),
        connected_since: Instant::now(),
    };
    let pending = agent.pending.clone();
    let body_queues = agent.body_queues.clone();
    let heartbeat = agent.last_heartbeat.clone();

    // Last writer wins on a duplicate agent id: the displaced channel's
    // waiters are drained so they fail fast instead of riding out the
    // deadline.
    {
        let mut agents = state.agents.write().await;
        if let Some(old) = agents.insert(agent_id.clone(), agent) {
            warn!(agent_id = %agent_id, "Agent re-registered, displacing previous channel");
            drain_agent(&old).await;
        }
    }
    info!(agent_id = %agent_id, "Agent registered");

    // Single writer: every frame for this channel funnels through frame_rx.
    let send_task = tokio::spawn(async move {
        while let Some(data) = frame_rx.recv().await {
            if ws_sink
                .send(axum::extract::ws::Message::Binary(data.into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            axum::extract::ws::Message::Binary(data) => match frame::decode(&data) {
                Ok(Some(f)) => dispatch_agent_frame(&agent_id, f, &pending, &body_queues, &heartbeat).await,
                Ok(None) => {} // unknown frame type, dropped for forward compat
                Err(e) => {
                    warn!(agent_id = %agent_id, error = %e, "Malformed frame from agent, skipping");
                }
            },
            axum::extract::ws::Message::Close(_) => break,
            _ => {}
        }
    }

    // Remove the registry entry unless a newer channel already owns the id.
    {
        let mut agents = state.agents.write().await;
        if agents
            .get(&agent_id)
            .is_some_and(|a| a.conn_id == conn_id)
        {
            if let Some(agent) = agents.remove(&agent_id) {
                drain_agent(&agent).await;
            }
        }
    }
    info!(agent_id = %agent_id, "Agent disconnected");
    send_task.abort();
}

/// Route one decoded frame from the agent to its pending request or body
/// queue.
async fn dispatch_agent_frame(
    agent_id: &str,
    frame: Frame,
    pending: &PendingMap,
    body_queues: &BodyQueueMap,
    heartbeat: &Arc<Mutex<Instant>>,
) {
    match frame {
        Frame::Heartbeat => {
            *heartbeat.lock().await = Instant::now();
        }
        Frame::ResponseHeader { id, head } => {
            let waiter = pending.lock().await.remove(&id);
            let Some(waiter) = waiter else {
                debug!(request_id = %id, "Response header for unknown request (deadline passed?)");
                return;
            };
            let (chunk_tx, chunk_rx) = mpsc::channel::<Bytes>(MAX_QUEUED_CHUNKS);
            body_queues.lock().await.insert(id, chunk_tx);
            if waiter.send(AgentResponse { head, body: chunk_rx }).is_err() {
                // Public side gave up (client disconnect); tear the queue down.
                body_queues.lock().await.remove(&id);
            }
        }
        Frame::ResponseBodyChunk { id, data } => {
            // Clone the sender out of the lock, then await capacity. A full
            // queue back-pressures this read loop; bytes are never dropped.
            let tx = body_queues.lock().await.get(&id).cloned();
            if let Some(tx) = tx {
                if tx.send(data).await.is_err() {
                    body_queues.lock().await.remove(&id);
                }
            }
        }
        Frame::ResponseEof { id } => {
            // Dropping the sender closes the public-side stream.
            body_queues.lock().await.remove(&id);
        }
        Frame::RequestHeader { .. } | Frame::RequestBodyChunk { .. } | Frame::RequestEof { .. } => {
            warn!(agent_id = %agent_id, "Request-direction frame from agent, skipping");
        }
    }
}

/// `GET /api/agents`: list connected agents.
async fn list_agents(State(state): State<RelayState>) -> Json<Value> {
    let now = Instant::now();
    let agents = state.agents.read().await;
    let mut list: Vec<Value> = Vec::with_capacity(agents.len());

    for a in agents.values() {
        let last_hb = *a.last_heartbeat.lock().await;
        #[allow(clippy::cast_possible_truncation)]
        list.push(json!({
            "agent_id": a.agent_id,
            "connected_since_ms": now.duration_since(a.connected_since).as_millis() as u64,
            "last_heartbeat_ago_ms": now.duration_since(last_hb).as_millis() as u64,
            "pending_requests_count": a.pending.lock().await.len(),
        }));
    }

    Json(json!({ "agents": list }))
}

// ─── Public proxy ────────────────────────────────────────────────────────────

/// First dot-separated label of the request host, with any port stripped.
fn host_label(request: &Request) -> &str {
    request
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.split(':').next())
        .and_then(|h| h.split('.').next())
        .unwrap_or("")
}

/// Catch-all handler: forward the public request to the agent addressed by
/// the request host and stream its response back.
async fn proxy_request(State(state): State<RelayState>, request: Request) -> Response {
    let label = host_label(&request);
    if label.is_empty()
        || label == "localhost"
        || label.starts_with(|c: char| c.is_ascii_digit())
    {
        return Html(LANDING_HTML).into_response();
    }
    let agent_id = label.to_string();

    let (frame_tx, pending, body_queues) = {
        let agents = state.agents.read().await;
        match agents.get(&agent_id) {
            Some(a) => (a.frame_tx.clone(), a.pending.clone(), a.body_queues.clone()),
            None => return (StatusCode::NOT_FOUND, "tunnel offline").into_response(),
        }
    };

    let request_id = Uuid::new_v4();
    let meta = request_meta(&request);
    debug!(
        agent_id = %agent_id,
        request_id = %request_id,
        method = %meta.method,
        path = %meta.path,
        "Proxying public request"
    );

    let (resp_tx, resp_rx) = oneshot::channel();
    pending.lock().await.insert(request_id, resp_tx);

    if frame_tx
        .send(frame::encode_request_header(request_id, &meta))
        .await
        .is_err()
    {
        pending.lock().await.remove(&request_id);
        return (StatusCode::NOT_FOUND, "tunnel offline").into_response();
    }

    // Body chunks, then the EOF that triggers dispatch on the agent. A send
    // failure here means the channel died mid-request; the drain on
    // disconnect resolves the pending entry and the await below returns 504.
    if meta.has_body {
        let mut body_stream = request.into_body().into_data_stream();
        'body: while let Some(chunk) = body_stream.next().await {
            let Ok(chunk) = chunk else { break };
            for piece in chunk.chunks(BODY_CHUNK_SIZE) {
                if frame_tx
                    .send(frame::encode_request_body_chunk(request_id, piece))
                    .await
                    .is_err()
                {
                    break 'body;
                }
            }
        }
    }
    let _ = frame_tx.send(frame::encode_request_eof(request_id)).await;

    let deadline = Duration::from_secs(state.request_timeout_secs);
    match tokio::time::timeout(deadline, resp_rx).await {
        Ok(Ok(AgentResponse { head, body })) => stream_response(&head, body),
        Ok(Err(_)) => {
            // Channel drained: the agent disconnected before responding.
            (StatusCode::GATEWAY_TIMEOUT, "tunnel closed before response").into_response()
        }
        Err(_) => {
            pending.lock().await.remove(&request_id);
            body_queues.lock().await.remove(&request_id);
            warn!(agent_id = %agent_id, request_id = %request_id, "Agent response deadline expired");
            (StatusCode::GATEWAY_TIMEOUT, "upstream agent timed out").into_response()
        }
    }
}

/// Serialize the request line and headers for the 0x10 frame. `Host` and
/// `Transfer-Encoding` describe this hop and are not forwarded.
fn request_meta(request: &Request) -> RequestMeta {
    let mut headers = HashMap::new();
    for name in request.headers().keys() {
        if name == HOST || name == TRANSFER_ENCODING {
            continue;
        }
        let joined = request
            .headers()
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");
        headers.insert(name.as_str().to_string(), joined);
    }

    let has_body = request
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .is_some_and(|n| n > 0)
        || request.headers().contains_key(TRANSFER_ENCODING);

    RequestMeta {
        method: request.method().as_str().to_string(),
        path: request
            .uri()
            .path_and_query()
            .map_or_else(|| "/".to_string(), ToString::to_string),
        headers,
        has_body,
    }
}

/// Build the public response from a response header frame and its chunk
/// queue. `Content-Type` is carried separately and `Transfer-Encoding`
/// described the prior hop, so both are skipped when copying headers.
fn stream_response(head: &ResponseHead, body: mpsc::Receiver<Bytes>) -> Response {
    let status = StatusCode::from_u16(head.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);

    let content_type = HeaderValue::from_str(&head.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    builder = builder.header(CONTENT_TYPE, content_type);

    for (name, values) in &head.headers {
        if name.eq_ignore_ascii_case("content-type") || name.eq_ignore_ascii_case("transfer-encoding")
        {
            continue;
        }
        let Ok(name) = HeaderName::try_from(name.as_str()) else {
            continue;
        };
        for value in values {
            let Ok(value) = HeaderValue::try_from(value.as_str()) else {
                continue;
            };
            builder = builder.header(name.clone(), value);
        }
    }

    let stream = ReceiverStream::new(body).map(Ok::<_, Infallible>);
    match builder.body(Body::from_stream(stream)) {
        Ok(response) => response,
        Err(_) => (StatusCode::BAD_GATEWAY, "invalid upstream response").into_response(),
    }
}
