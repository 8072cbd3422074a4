//! End-to-end measurement scenarios driven through the coordinator with a
//! paused clock, so every window and probe deadline is exact.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use speedtest_server::error::{ErrorKind, Result as PhaseResult};
use speedtest_server::latency::ProbeTransport;
use speedtest_server::session::{ClientId, Outcome, SessionId};
use speedtest_server::{Phase, ServerConfig, SessionCoordinator, Status};
use std::convert::Infallible;
use std::time::Duration;

/// Echoes every probe after `delay`, except `slow_seq` which takes `slow_delay`
struct SyntheticClient {
    delay: Duration,
    slow_seq: Option<u32>,
    slow_delay: Duration,
}

impl SyntheticClient {
    fn steady(delay: Duration) -> Self {
        Self {
            delay,
            slow_seq: None,
            slow_delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl ProbeTransport for SyntheticClient {
    async fn round_trip(&mut self, seq: u32) -> PhaseResult<()> {
        let delay = if self.slow_seq == Some(seq) {
            self.slow_delay
        } else {
            self.delay
        };
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

fn config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.payload.seed = Some(7);
    config.payload.pool_size = 1024 * 1024;
    config
}

fn client() -> ClientId {
    ClientId::new("198.51.100.23")
}

/// Wait until the phase that was just driven has been settled
async fn wait_idle(coordinator: &SessionCoordinator, id: SessionId) {
    for _ in 0..1000 {
        match coordinator.registry().get(id) {
            Ok(session) if session.is_busy() => {
                tokio::time::sleep(Duration::from_millis(1)).await
            }
            _ => return,
        }
    }
    panic!("session {} never became idle", id);
}

/// Pull the download body like a client on a constrained link would:
/// one chunk per 10ms, for at most `limit`.
async fn consume_download(
    coordinator: &SessionCoordinator,
    id: SessionId,
    limit: Option<Duration>,
) -> Result<u64> {
    let mut stream = coordinator.start_download(id)?;
    let started = tokio::time::Instant::now();
    let mut received = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        received += chunk.len() as u64;
        if limit.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(received)
}

/// 10,000 bytes every 10ms, offset by 5ms from the window grid, for 10s:
/// exactly 10 MB at 8,000,000 bits/sec.
fn synthetic_upload() -> impl futures::Stream<Item = Result<Bytes, Infallible>> + Send + Unpin {
    let stream = futures::stream::unfold(0u32, |sent| async move {
        if sent >= 1000 {
            return None;
        }
        let gap = if sent == 0 { 5 } else { 10 };
        tokio::time::sleep(Duration::from_millis(gap)).await;
        Some((Ok(Bytes::from(vec![0xA5u8; 10_000])), sent + 1))
    });
    Box::pin(stream)
}

#[tokio::test(start_paused = true)]
async fn test_slow_probe_degrades_latency_but_keeps_samples() -> Result<()> {
    let coordinator = SessionCoordinator::new(config())?;
    let ticket = coordinator.open_session(client())?;

    // Probe #7 answers after 3s, past the 2s per-probe deadline
    let transport = SyntheticClient {
        delay: Duration::from_millis(4),
        slow_seq: Some(6),
        slow_delay: Duration::from_secs(3),
    };
    let result = coordinator
        .measure_latency(ticket.session_id, transport)
        .await?;

    assert_eq!(result.probes_sent, 20);
    assert_eq!(result.sample_count, 19);
    assert_eq!(result.timed_out, 1);
    assert!(result.degraded);
    assert_eq!(result.status, Status::Success);
    let ping = result.ping_ms().expect("ping measured");
    assert!((ping - 4.0).abs() < 1e-9);

    // The session carries on to the next phase
    let record = coordinator.result(ticket.session_id)?;
    assert_eq!(record.sample_count, 19);
    assert!(!record.is_finished());
    assert_eq!(coordinator.registry().occupancy().active, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_full_session_reports_exact_upload_rate() -> Result<()> {
    let coordinator = SessionCoordinator::new(config())?;
    let ticket = coordinator.open_session(client())?;
    let id = ticket.session_id;

    coordinator
        .measure_latency(id, SyntheticClient::steady(Duration::from_millis(6)))
        .await?;

    let downloaded = consume_download(&coordinator, id, None).await?;
    assert!(downloaded > 0);
    wait_idle(&coordinator, id).await;
    let download = coordinator
        .result(id)?
        .download
        .expect("download result recorded");
    assert_eq!(download.status, Status::Success);

    let upload = coordinator.run_upload(id, synthetic_upload()).await?;
    assert_eq!(upload.status, Status::Success);
    assert_eq!(upload.bytes_transferred, 10_000_000);
    let bps = upload.bits_per_second.expect("upload estimate") as f64;
    assert!(
        (bps - 8_000_000.0).abs() <= 8_000_000.0 * 0.05,
        "upload estimate {} is not within 5% of 8 Mbit/s",
        bps
    );

    let record = coordinator.result(id)?;
    assert_eq!(record.status, Status::Success);
    assert_eq!(record.phase, Phase::Done);
    assert_eq!(record.outcome, Some(Outcome::Completed));
    let ping = record.ping_ms.expect("ping measured");
    assert!((ping - 6.0).abs() < 1e-9);
    assert_eq!(coordinator.registry().occupancy().active, 0);
    assert_eq!(coordinator.stats().sessions.completed, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_dropped_download_keeps_partial_result() -> Result<()> {
    let coordinator = SessionCoordinator::new(config())?;
    let ticket = coordinator.open_session(client())?;
    let id = ticket.session_id;

    coordinator
        .measure_latency(id, SyntheticClient::steady(Duration::from_millis(5)))
        .await?;
    // Disconnect 3s in, after warm-up
    consume_download(&coordinator, id, Some(Duration::from_secs(3))).await?;
    wait_idle(&coordinator, id).await;

    let record = coordinator.result(id)?;
    let download = record.download.clone().expect("download result recorded");
    assert_eq!(download.status, Status::Partial);
    assert_eq!(download.error, Some(ErrorKind::ClientCancelled));
    assert!(download.bits_per_second.is_some());

    assert_eq!(record.phase, Phase::Failed);
    assert_eq!(record.status, Status::Partial);
    assert!(matches!(
        record.outcome,
        Some(Outcome::Failed {
            reason: ErrorKind::ClientCancelled,
            ..
        })
    ));
    assert_eq!(coordinator.registry().occupancy().active, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_session_deadline_cuts_upload_short() -> Result<()> {
    let mut config = config();
    config.session_timeout = Duration::from_secs(15);
    let coordinator = SessionCoordinator::new(config)?;
    let id = coordinator.open_session(client())?.session_id;

    coordinator
        .measure_latency(id, SyntheticClient::steady(Duration::from_millis(5)))
        .await?;
    consume_download(&coordinator, id, None).await?;
    wait_idle(&coordinator, id).await;

    // About 4s of the session remain for a 10s upload
    let upload = coordinator.run_upload(id, synthetic_upload()).await?;
    assert_eq!(upload.status, Status::Partial);
    assert_eq!(upload.error, Some(ErrorKind::Timeout));
    assert!(upload.duration_ms < 10_000.0);

    let record = coordinator.result(id)?;
    assert_eq!(record.outcome, Some(Outcome::TimedOut));
    assert_eq!(record.status, Status::Partial);
    assert_eq!(coordinator.registry().occupancy().active, 0);
    Ok(())
}
