//! Tunnel client: outbound WebSocket from the agent to the relay.
//!
//! Spawned on agent startup. Maintains a persistent channel to the relay
//! with fixed-delay reconnect and a heartbeat task, assembles incoming
//! request frames into whole requests, and dispatches each one onto its own
//! task so a slow local call never blocks the read loop.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::frame::{self, Frame, RequestMeta, ResponseHead};
use super::BODY_CHUNK_SIZE;
use crate::pipeline::{self, TunnelContext};
use crate::state::AgentState;

/// Type alias for the WS sink to reduce verbosity. The mutex serializes all
/// sends on the channel: heartbeats and concurrent response writers.
type WsSink = Arc<
    Mutex<
        futures_util::stream::SplitSink<
            tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
            tokio_tungstenite::tungstenite::Message,
        >,
    >,
>;

/// Spawn the tunnel client task. Returns a `JoinHandle` that runs until
/// aborted.
pub fn spawn(state: AgentState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(client_loop(state))
}

/// Main loop: connect, pump until the channel drops, wait, reconnect.
async fn client_loop(state: AgentState) {
    let delay = Duration::from_secs(state.config.agent.reconnect_delay_secs);
    loop {
        info!(url = %state.config.agent.relay_url, "Tunnel: connecting to relay");
        match connect_and_pump(&state).await {
            Ok(()) => info!("Tunnel: connection closed, reconnecting..."),
            Err(e) => warn!(
                "Tunnel: connection error: {e}, reconnecting in {}s",
                delay.as_secs()
            ),
        }
        state.tunnel_stats.connected.store(false, Ordering::Relaxed);
        state.tunnel_stats.reconnects.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(delay).await;
    }
}

/// A single connection attempt: connect, pump frames until disconnect.
async fn connect_and_pump(
    state: &AgentState,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let url = format!(
        "{}?clientId={}",
        state.config.agent.relay_url, state.config.agent.id
    );

    let (ws_stream, _response) = tokio_tungstenite::connect_async(&url).await?;
    let (ws_sink, mut ws_stream) = ws_stream.split();
    let ws_sink: WsSink = Arc::new(Mutex::new(ws_sink));

    state.tunnel_stats.connected.store(true, Ordering::Relaxed);
    info!(agent_id = %state.config.agent.id, "Tunnel: connected to relay");

    // Heartbeat task; a WS protocol ping rides along at the keep-alive
    // interval. Any send error ends the task and the supervisor reconnects.
    let heartbeat_sink = ws_sink.clone();
    let heartbeat_interval = Duration::from_secs(state.config.agent.heartbeat_interval_secs);
    let keepalive_every = (state.config.agent.keepalive_interval_secs
        / state.config.agent.heartbeat_interval_secs.max(1))
    .max(1);
    let heartbeat_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(heartbeat_interval);
        let mut ticks: u64 = 0;
        loop {
            interval.tick().await;
            ticks += 1;
            let mut sink = heartbeat_sink.lock().await;
            if sink
                .send(tokio_tungstenite::tungstenite::Message::Binary(
                    frame::encode_heartbeat().into(),
                ))
                .await
                .is_err()
            {
                break;
            }
            if ticks % keepalive_every == 0
                && sink
                    .send(tokio_tungstenite::tungstenite::Message::Ping(Bytes::new()))
                    .await
                    .is_err()
            {
                break;
            }
        }
    });

    // Requests being assembled from header/body frames, keyed by request id.
    // Only this loop touches the map.
    let mut inflight: HashMap<Uuid, IncomingRequest> = HashMap::new();

    let result = loop {
        let Some(msg) = ws_stream.next().await else {
            break Ok(());
        };
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => break Err(e.into()),
        };
        match msg {
            tokio_tungstenite::tungstenite::Message::Binary(data) => {
                match frame::decode(&data) {
                    Ok(Some(f)) => handle_frame(state, &ws_sink, &mut inflight, f),
                    Ok(None) => {} // unknown frame type, dropped for forward compat
                    Err(e) => warn!(error = %e, "Tunnel: malformed frame from relay, skipping"),
                }
            }
            tokio_tungstenite::tungstenite::Message::Close(_) => break Ok(()),
            _ => {}
        }
    };

    heartbeat_task.abort();
    result
}

/// A request mid-assembly: created by its header frame, grown by body
/// chunks, dispatched on EOF.
struct IncomingRequest {
    meta: RequestMeta,
    body: Option<Vec<u8>>,
}

fn handle_frame(
    state: &AgentState,
    ws_sink: &WsSink,
    inflight: &mut HashMap<Uuid, IncomingRequest>,
    frame: Frame,
) {
    match frame {
        Frame::RequestHeader { id, meta } => {
            let body = meta.has_body.then(Vec::new);
            inflight.insert(id, IncomingRequest { meta, body });
        }
        Frame::RequestBodyChunk { id, data } => {
            // Chunks for an unknown id (or one that declared no body) are
            // dropped silently.
            if let Some(request) = inflight.get_mut(&id) {
                if let Some(buf) = request.body.as_mut() {
                    buf.extend_from_slice(&data);
                }
            }
        }
        Frame::RequestEof { id } => {
            if let Some(request) = inflight.remove(&id) {
                let state = state.clone();
                let sink = ws_sink.clone();
                tokio::spawn(handle_request(state, sink, id, request));
            }
        }
        Frame::Heartbeat => {}
        Frame::ResponseHeader { .. }
        | Frame::ResponseBodyChunk { .. }
        | Frame::ResponseEof { .. } => {
            debug!("Tunnel: response-direction frame from relay, skipping");
        }
    }
}

/// Run one assembled request through the pipeline and stream the response
/// back as header, body chunk, and EOF frames.
async fn handle_request(state: AgentState, ws_sink: WsSink, id: Uuid, request: IncomingRequest) {
    let IncomingRequest { meta, body } = request;
    let mut ctx = TunnelContext::new(id, &meta, body.map(Bytes::from));

    pipeline::run(&state, &mut ctx).await;
    state
        .tunnel_stats
        .requests_served
        .fetch_add(1, Ordering::Relaxed);

    let head = ResponseHead {
        status: ctx.status,
        content_type: ctx.content_type.clone(),
        headers: pipeline::headers_to_multi_map(&ctx.response_headers),
    };

    if send_frame(&ws_sink, frame::encode_response_header(id, &head)).await {
        if let Some(mut body) = ctx.response_body.take() {
            'body: while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!(request_id = %id, error = %e, "Response body stream failed");
                        break;
                    }
                };
                for piece in chunk.chunks(BODY_CHUNK_SIZE) {
                    if !send_frame(&ws_sink, frame::encode_response_body_chunk(id, piece)).await {
                        break 'body;
                    }
                }
            }
        }
        let _ = send_frame(&ws_sink, frame::encode_response_eof(id)).await;
    }

    state.request_log.push(ctx.to_log_entry()).await;
    debug!(
        request_id = %id,
        status = ctx.status,
        duration_ms = ctx.elapsed_ms(),
        "Request served"
    );
}

/// Send one encoded frame through the shared sink. Returns `false` if the
/// channel is gone (the supervisor will reconnect; the relay's deadline
/// answers the public request).
async fn send_frame(ws_sink: &WsSink, data: Vec<u8>) -> bool {
    let mut sink = ws_sink.lock().await;
    sink.send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
        .await
        .is_ok()
}
