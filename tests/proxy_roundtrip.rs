//! End-to-end tunnel tests: a relay, an agent, and local services on
//! ephemeral ports, exercised through the public HTTP front.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;

use burrow::config::Config;
use burrow::rules::{ChaosRule, MockRule, RoutingRule};
use burrow::state::AgentState;
use burrow::tunnel::client;
use burrow::tunnel::relay::{relay_router, RelayState};

async fn spawn_relay(timeout_secs: u64) -> (SocketAddr, RelayState) {
    let state = RelayState::new(timeout_secs);
    let app = relay_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

async fn spawn_service(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Start an agent pointed at the relay and wait until it registers.
async fn start_agent(
    relay_addr: SocketAddr,
    relay_state: &RelayState,
    agent_id: &str,
    local_port: u16,
) -> AgentState {
    let mut config = Config::default();
    config.agent.id = agent_id.to_string();
    config.agent.relay_url = format!("ws://{relay_addr}/tunnel");
    config.agent.local_port = local_port;

    let state = AgentState::new(config);
    client::spawn(state.clone());

    let deadline = Instant::now() + Duration::from_secs(5);
    while !relay_state.agents.read().await.contains_key(agent_id) {
        assert!(Instant::now() < deadline, "agent never registered");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    state
}

fn public_url(relay_addr: SocketAddr, path: &str) -> String {
    format!("http://{relay_addr}{path}")
}

#[tokio::test]
async fn mock_rule_short_circuits_without_a_local_service() {
    let (relay_addr, relay_state) = spawn_relay(30).await;
    // Port 9 is closed; a forward attempt would 502, not 200.
    let agent = start_agent(relay_addr, &relay_state, "mockapp", 9).await;

    agent
        .rules
        .add_mock(MockRule {
            id: "m1".to_string(),
            name: "users-mock".to_string(),
            path_pattern: "/api/users".to_string(),
            method: Some("GET".to_string()),
            enabled: true,
            status_code: 200,
            content_type: "application/json".to_string(),
            response_body: "[]".to_string(),
        })
        .await;

    let client = reqwest::Client::new();
    let resp = client
        .get(public_url(relay_addr, "/api/users"))
        .header("host", "mockapp.test")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "application/json"
    );
    assert_eq!(resp.text().await.unwrap(), "[]");

    // The log entry lands just after the response finishes streaming.
    let deadline = Instant::now() + Duration::from_secs(2);
    while agent.request_log.is_empty().await {
        assert!(Instant::now() < deadline, "no log entry recorded");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let entries = agent.request_log.recent(10).await;
    assert_eq!(entries[0].applied_mock_rule.as_deref(), Some("users-mock"));
    assert_eq!(entries[0].status, 200);
    assert_eq!(entries[0].target_url, None);
}

#[tokio::test]
async fn routing_rule_overrides_the_default_target() {
    let (relay_addr, relay_state) = spawn_relay(30).await;

    let svc_one = spawn_service(Router::new().fallback(|| async { "one" })).await;
    let svc_two = spawn_service(Router::new().fallback(|| async { "two" })).await;

    let agent = start_agent(relay_addr, &relay_state, "routed", svc_two.port()).await;
    agent
        .rules
        .add_route(RoutingRule {
            id: "r1".to_string(),
            name: "api-to-one".to_string(),
            path_pattern: "/api/*".to_string(),
            target_base_url: format!("http://127.0.0.1:{}", svc_one.port()),
            enabled: true,
            priority: 0,
        })
        .await;

    let client = reqwest::Client::new();
    let routed = client
        .get(public_url(relay_addr, "/api/v1/ping"))
        .header("host", "routed.test")
        .send()
        .await
        .unwrap();
    assert_eq!(routed.text().await.unwrap(), "one");

    let defaulted = client
        .get(public_url(relay_addr, "/health"))
        .header("host", "routed.test")
        .send()
        .await
        .unwrap();
    assert_eq!(defaulted.text().await.unwrap(), "two");
}

#[tokio::test]
async fn chaos_error_rate_one_never_reaches_the_local_service() {
    let (relay_addr, relay_state) = spawn_relay(30).await;

    let hits = Arc::new(AtomicUsize::new(0));
    let svc_hits = hits.clone();
    let svc = spawn_service(
        Router::new()
            .route(
                "/flaky",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    "should not be reached"
                }),
            )
            .with_state(svc_hits),
    )
    .await;

    let agent = start_agent(relay_addr, &relay_state, "flakyapp", svc.port()).await;
    agent
        .rules
        .add_chaos(ChaosRule {
            id: "c1".to_string(),
            name: "always-fail".to_string(),
            path_pattern: "/flaky".to_string(),
            method: None,
            enabled: true,
            latency_ms: 0,
            jitter_ms: 0,
            error_rate: 1.0,
            error_status_code: 503,
            error_body: "nope".to_string(),
        })
        .await;

    let client = reqwest::Client::new();
    for _ in 0..10 {
        let resp = client
            .get(public_url(relay_addr, "/flaky"))
            .header("host", "flakyapp.test")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 503);
        assert_eq!(resp.text().await.unwrap(), "nope");
    }
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn chaos_latency_delays_the_public_response() {
    let (relay_addr, relay_state) = spawn_relay(30).await;
    let svc = spawn_service(Router::new().route("/slow", get(|| async { "ok" }))).await;
    let agent = start_agent(relay_addr, &relay_state, "slowapp", svc.port()).await;

    agent
        .rules
        .add_chaos(ChaosRule {
            id: "c1".to_string(),
            name: "slow".to_string(),
            path_pattern: "/slow".to_string(),
            method: None,
            enabled: true,
            latency_ms: 200,
            jitter_ms: 0,
            error_rate: 0.0,
            error_status_code: 503,
            error_body: String::new(),
        })
        .await;

    let client = reqwest::Client::new();
    let start = Instant::now();
    let resp = client
        .get(public_url(relay_addr, "/slow"))
        .header("host", "slowapp.test")
        .send()
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "ok");
    assert!(elapsed >= Duration::from_millis(200), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(2000), "elapsed {elapsed:?}");
}

#[tokio::test]
async fn large_bodies_roundtrip_through_chunked_frames() {
    let (relay_addr, relay_state) = spawn_relay(30).await;

    // Echoes the request body back.
    let svc = spawn_service(Router::new().route(
        "/echo",
        post(|body: Bytes| async move { body }),
    ))
    .await;
    start_agent(relay_addr, &relay_state, "echoapp", svc.port()).await;

    // Several times the 16 KiB chunk size, in both directions.
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

    let client = reqwest::Client::new();
    let resp = client
        .post(public_url(relay_addr, "/echo"))
        .header("host", "echoapp.test")
        .body(payload.clone())
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let echoed = resp.bytes().await.unwrap();
    assert_eq!(&echoed[..], &payload[..]);
}

#[tokio::test]
async fn multi_valued_response_headers_are_preserved() {
    let (relay_addr, relay_state) = spawn_relay(30).await;

    let svc = spawn_service(Router::new().route(
        "/cookies",
        get(|| async {
            Response::builder()
                .header("set-cookie", "a=1")
                .header("set-cookie", "b=2")
                .header("x-upstream", "yes")
                .body(axum::body::Body::from("done"))
                .unwrap()
        }),
    ))
    .await;
    start_agent(relay_addr, &relay_state, "cookieapp", svc.port()).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(public_url(relay_addr, "/cookies"))
        .header("host", "cookieapp.test")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let cookies: Vec<_> = resp
        .headers()
        .get_all("set-cookie")
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect();
    assert_eq!(cookies, vec!["a=1", "b=2"]);
    assert_eq!(resp.headers().get("x-upstream").unwrap(), "yes");
    assert_eq!(resp.text().await.unwrap(), "done");
}

#[tokio::test]
async fn unknown_agent_gets_404() {
    let (relay_addr, _relay_state) = spawn_relay(30).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(public_url(relay_addr, "/anything"))
        .header("host", "nosuch.test")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 404);
    assert_eq!(resp.text().await.unwrap(), "tunnel offline");
}

#[tokio::test]
async fn numeric_host_gets_the_landing_page() {
    let (relay_addr, _relay_state) = spawn_relay(30).await;

    // No Host override: reqwest sends the socket address, which is
    // numeric-leading.
    let resp = reqwest::get(public_url(relay_addr, "/")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.text().await.unwrap().contains("burrow relay"));
}

#[tokio::test]
async fn slow_local_service_times_out_with_504_and_cleanup() {
    let (relay_addr, relay_state) = spawn_relay(1).await;

    let svc = spawn_service(Router::new().route(
        "/sleepy",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            "too late"
        }),
    ))
    .await;
    start_agent(relay_addr, &relay_state, "sleepyapp", svc.port()).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(public_url(relay_addr, "/sleepy"))
        .header("host", "sleepyapp.test")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 504);

    // The pending entry is removed on expiry.
    let agents = relay_state.agents.read().await;
    let agent = agents.get("sleepyapp").unwrap();
    assert!(agent.pending.lock().await.is_empty());
    assert!(agent.body_queues.lock().await.is_empty());
}

#[tokio::test]
async fn unreachable_local_service_yields_502_through_the_tunnel() {
    let (relay_addr, relay_state) = spawn_relay(30).await;
    start_agent(relay_addr, &relay_state, "deadapp", 9).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(public_url(relay_addr, "/whatever"))
        .header("host", "deadapp.test")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 502);
    assert!(resp
        .text()
        .await
        .unwrap()
        .starts_with("Bad Gateway: "));
}

#[tokio::test]
async fn agent_listing_reports_connected_agents() {
    let (relay_addr, relay_state) = spawn_relay(30).await;
    start_agent(relay_addr, &relay_state, "listed", 9).await;

    let resp = reqwest::get(public_url(relay_addr, "/api/agents"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    let agents = body["agents"].as_array().unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0]["agent_id"], "listed");
}

#[tokio::test]
async fn missing_client_id_is_rejected_with_400() {
    let (relay_addr, _relay_state) = spawn_relay(30).await;

    let err = tokio_tungstenite::connect_async(format!("ws://{relay_addr}/tunnel"))
        .await
        .unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 400);
        }
        other => panic!("expected HTTP 400 rejection, got {other:?}"),
    }
}
