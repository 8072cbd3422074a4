//! HTTP surface tests: a real listener driven with reqwest and
//! tokio-tungstenite, plus router-level checks through `oneshot`.

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use speedtest_server::coordinator::SessionTicket;
use speedtest_server::latency::LatencyResult;
use speedtest_server::registry::RegistryLimits;
use speedtest_server::server::{self, ProbeFrame};
use speedtest_server::session::Outcome;
use speedtest_server::{
    Phase, ResultRecord, ServerConfig, SessionCoordinator, Status, ThroughputResult,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

/// Short timings so a whole session runs in a couple of seconds
fn fast_config() -> ServerConfig {
    let mut config = ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..ServerConfig::default()
    };
    config.latency.count = 5;
    config.latency.interval = Duration::from_millis(10);
    config.throughput.duration = Duration::from_secs(1);
    config.throughput.warmup = Duration::from_millis(200);
    config.throughput.window = Duration::from_millis(100);
    config.payload.pool_size = 256 * 1024;
    config.payload.chunk_size = 16 * 1024;
    config.payload.seed = Some(3);
    config.session_timeout = Duration::from_secs(20);
    config
}

struct TestServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl TestServer {
    async fn start(config: ServerConfig) -> Result<Self> {
        let listener = server::bind_listener(config.bind_address()?)?;
        let addr = listener.local_addr()?;
        let coordinator = SessionCoordinator::new(config)?;
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server::serve_with_listener(
            listener,
            coordinator,
            shutdown.clone(),
        ));
        Ok(Self {
            addr,
            shutdown,
            handle,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        self.handle.await?
    }
}

async fn open_session(http: &reqwest::Client, server: &TestServer) -> Result<SessionTicket> {
    let response = http.post(server.url("/sessions")).send().await?;
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);
    Ok(response.json().await?)
}

/// Send a phase request, retrying while the previous phase is still
/// settling on the server
async fn send_phase_request(
    build: impl Fn() -> reqwest::RequestBuilder,
) -> Result<reqwest::Response> {
    for _ in 0..50 {
        let response = build().send().await?;
        if response.status() != reqwest::StatusCode::CONFLICT {
            return Ok(response);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    anyhow::bail!("previous phase never settled")
}

/// 40 chunks of 16 KiB, one every 20ms
fn upload_body() -> reqwest::Body {
    let chunks = futures::stream::unfold(0u32, |sent| async move {
        if sent >= 40 {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        Some((
            Ok::<_, std::io::Error>(Bytes::from(vec![0x5Au8; 16 * 1024])),
            sent + 1,
        ))
    });
    reqwest::Body::wrap_stream(chunks)
}

/// Play the client side of the latency exchange and return the final result
async fn run_latency_client(
    server: &TestServer,
    ticket: &SessionTicket,
) -> Result<LatencyResult> {
    let url = format!("ws://{}/sessions/{}/latency", server.addr, ticket.session_id);
    let (mut socket, _) = tokio_tungstenite::connect_async(url.as_str()).await?;

    while let Some(message) = socket.next().await {
        match message? {
            Message::Text(text) => match serde_json::from_str::<ProbeFrame>(&text)? {
                ProbeFrame::Probe { seq } => {
                    let echo = serde_json::to_string(&ProbeFrame::Echo { seq })?;
                    socket.send(Message::Text(echo)).await?;
                }
                ProbeFrame::Result { result } => return Ok(result),
                ProbeFrame::Echo { .. } => {}
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
    anyhow::bail!("latency socket closed without a result")
}

async fn fetch_record(
    http: &reqwest::Client,
    server: &TestServer,
    path: &str,
) -> Result<ResultRecord> {
    let response = http.get(server.url(path)).send().await?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    Ok(response.json().await?)
}

/// A client walking the whole session over HTTP gets a complete record.
#[tokio::test]
async fn test_full_session_over_http() -> Result<()> {
    let server = TestServer::start(fast_config()).await?;
    let http = reqwest::Client::new();
    let ticket = open_session(&http, &server).await?;
    let id = ticket.session_id;

    let latency = run_latency_client(&server, &ticket).await?;
    assert_eq!(latency.probes_sent, 5);
    assert_eq!(latency.sample_count, 5);
    assert!(latency.ping_ms().is_some());

    let download_url = server.url(&format!("/sessions/{}/download", id));
    let download = send_phase_request(|| http.get(&download_url)).await?;
    assert_eq!(download.status(), reqwest::StatusCode::OK);
    assert_eq!(
        download.headers()["content-type"],
        "application/octet-stream"
    );
    let mut body = download.bytes_stream();
    let mut downloaded = 0u64;
    while let Some(chunk) = body.next().await {
        downloaded += chunk?.len() as u64;
    }
    assert!(downloaded > 0);

    // The download result lands on the session once the job settles
    let result_path = format!("/sessions/{}/result", id);
    let mut record = fetch_record(&http, &server, &result_path).await?;
    for _ in 0..50 {
        if record.download.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        record = fetch_record(&http, &server, &result_path).await?;
    }
    let download = record.download.context("download result missing")?;
    assert!(download.bytes_transferred > 0);

    let upload_url = server.url(&format!("/sessions/{}/upload", id));
    let upload = send_phase_request(|| http.put(&upload_url).body(upload_body())).await?;
    assert_eq!(upload.status(), reqwest::StatusCode::OK);
    let upload: ThroughputResult = upload.json().await?;
    assert!(upload.bytes_transferred > 0);
    assert!(upload.bytes_transferred <= 40 * 16 * 1024);
    assert!(upload.bits_per_second.is_some());

    let record = fetch_record(&http, &server, &result_path).await?;
    assert_eq!(record.phase, Phase::Done);
    assert_eq!(record.outcome, Some(Outcome::Completed));
    assert!(record.ping_ms.is_some());
    assert!(record.download_bps.is_some());
    assert!(record.upload_bps.is_some());
    assert_eq!(record.transitions.len(), 4);

    server.stop().await
}

/// A full server answers 503 with a retry hint and a Capacity body.
#[tokio::test]
async fn test_capacity_rejection() -> Result<()> {
    let mut config = fast_config();
    config.limits = RegistryLimits {
        max_sessions: 1,
        max_per_client: 1,
    };
    let server = TestServer::start(config).await?;
    let http = reqwest::Client::new();

    open_session(&http, &server).await?;
    let rejected = http.post(server.url("/sessions")).send().await?;

    assert_eq!(rejected.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    assert!(rejected.headers().contains_key("retry-after"));
    let body: serde_json::Value = rejected.json().await?;
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error"], "Capacity");

    server.stop().await
}

/// Out-of-order phases are refused without touching the session, and a
/// cancelled session stays retrievable.
#[tokio::test]
async fn test_phase_order_and_cancel() -> Result<()> {
    let server = TestServer::start(fast_config()).await?;
    let http = reqwest::Client::new();
    let ticket = open_session(&http, &server).await?;
    let id = ticket.session_id;

    let early = http
        .get(server.url(&format!("/sessions/{}/download", id)))
        .send()
        .await?;
    assert_eq!(early.status(), reqwest::StatusCode::CONFLICT);
    let body: serde_json::Value = early.json().await?;
    assert_eq!(body["error"], "PhaseOrder");

    let cancelled = http
        .delete(server.url(&format!("/sessions/{}", id)))
        .send()
        .await?;
    assert_eq!(cancelled.status(), reqwest::StatusCode::OK);
    let record: ResultRecord = cancelled.json().await?;
    assert_eq!(record.phase, Phase::Failed);
    assert_eq!(record.status, Status::Failed);

    let record = fetch_record(&http, &server, &format!("/sessions/{}/result", id)).await?;
    assert_eq!(record.session_id, id);

    server.stop().await
}

/// Unknown sessions are 404 on every session route.
#[tokio::test]
async fn test_unknown_session_is_not_found() -> Result<()> {
    let server = TestServer::start(fast_config()).await?;
    let http = reqwest::Client::new();
    let id = uuid::Uuid::new_v4();

    for path in [
        format!("/sessions/{}/result", id),
        format!("/sessions/{}/download", id),
    ] {
        let response = http.get(server.url(&path)).send().await?;
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND, "{}", path);
    }
    let response = http
        .delete(server.url(&format!("/sessions/{}", id)))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    server.stop().await
}

fn mock_router(coordinator: SessionCoordinator) -> axum::Router {
    let peer = SocketAddr::from(([192, 0, 2, 1], 40000));
    server::router(coordinator).layer(MockConnectInfo(peer))
}

#[tokio::test]
async fn test_router_health_reports_occupancy() -> Result<()> {
    let coordinator = SessionCoordinator::new(fast_config())?;
    coordinator.open_session(speedtest_server::session::ClientId::new("192.0.2.1"))?;

    let response = mock_router(coordinator)
        .oneshot(Request::get("/health").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    let health: serde_json::Value = serde_json::from_slice(&bytes)?;
    assert_eq!(health["status"], "success");
    assert_eq!(health["sessions"]["active"], 1);
    assert_eq!(health["version"], speedtest_server::VERSION);
    Ok(())
}

#[tokio::test]
async fn test_router_open_session_uses_peer_address() -> Result<()> {
    let coordinator = SessionCoordinator::new(fast_config())?;
    let router = mock_router(coordinator.clone());

    let response = router
        .oneshot(Request::post("/sessions").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    let ticket: SessionTicket = serde_json::from_slice(&bytes)?;
    assert_eq!(ticket.status, Status::Success);
    let record = coordinator.result(ticket.session_id)?;
    assert_eq!(record.client.as_str(), "192.0.2.1");
    Ok(())
}

#[tokio::test]
async fn test_router_stats_and_bad_session_id() -> Result<()> {
    let coordinator = SessionCoordinator::new(fast_config())?;

    let response = mock_router(coordinator.clone())
        .oneshot(Request::get("/stats").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    let stats: serde_json::Value = serde_json::from_slice(&bytes)?;
    assert_eq!(stats["status"], "success");
    assert_eq!(stats["sessions"]["opened"], 0);
    assert!(stats["pingMs"].is_null());

    let response = mock_router(coordinator)
        .oneshot(Request::get("/sessions/not-a-uuid/result").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}
