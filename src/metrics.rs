use crate::results::{ResultRecord, Status};
use crate::session::Outcome;
use anyhow::Result;
use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Percentile summary of one distribution, in the unit it was recorded in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionSummary {
    pub samples: u64,
    pub min: f64,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
}

/// HDR histogram over non-negative values with a fixed scale
///
/// Values are multiplied by `scale` and stored as integers, so the scale
/// picks the resolution: 1000 stores milliseconds as microseconds.
pub struct Distribution {
    histogram: Histogram<u64>,
    scale: f64,
}

impl Distribution {
    /// Create a new distribution
    pub fn new(scale: f64) -> Result<Self> {
        // 3 significant figures, grows as larger values arrive
        let histogram = Histogram::<u64>::new(3)?;
        Ok(Self { histogram, scale })
    }

    /// Record a value
    pub fn record(&mut self, value: f64) -> Result<()> {
        let scaled = (value * self.scale).round().max(1.0) as u64;
        self.histogram.record(scaled)?;
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.histogram.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histogram.is_empty()
    }

    /// Current summary, `None` until something was recorded
    pub fn summary(&self) -> Option<DistributionSummary> {
        if self.histogram.is_empty() {
            return None;
        }
        let unscale = |v: u64| v as f64 / self.scale;
        Some(DistributionSummary {
            samples: self.histogram.len(),
            min: unscale(self.histogram.min()),
            mean: self.histogram.mean() / self.scale,
            p50: unscale(self.histogram.value_at_percentile(50.0)),
            p95: unscale(self.histogram.value_at_percentile(95.0)),
            p99: unscale(self.histogram.value_at_percentile(99.0)),
            max: unscale(self.histogram.max()),
        })
    }
}

/// Finished sessions per outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCounts {
    pub opened: u64,
    pub rejected: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub failed: u64,
    pub success: u64,
    pub partial: u64,
}

/// Snapshot served by `/stats`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    pub status: Status,
    pub sessions: SessionCounts,
    pub ping_ms: Option<DistributionSummary>,
    pub jitter_ms: Option<DistributionSummary>,
    pub download_bps: Option<DistributionSummary>,
    pub upload_bps: Option<DistributionSummary>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct Counters {
    opened: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    timed_out: AtomicU64,
    failed: AtomicU64,
    success: AtomicU64,
    partial: AtomicU64,
}

/// Server-wide aggregates over every finished session
pub struct ServerMetrics {
    counters: Counters,
    ping: Mutex<Distribution>,
    jitter: Mutex<Distribution>,
    download: Mutex<Distribution>,
    upload: Mutex<Distribution>,
}

impl ServerMetrics {
    pub fn new() -> Result<Self> {
        Ok(Self {
            counters: Counters::default(),
            // milliseconds at microsecond resolution
            ping: Mutex::new(Distribution::new(1000.0)?),
            jitter: Mutex::new(Distribution::new(1000.0)?),
            // bits per second at kbit/s resolution
            download: Mutex::new(Distribution::new(0.001)?),
            upload: Mutex::new(Distribution::new(0.001)?),
        })
    }

    pub fn session_opened(&self) {
        self.counters.opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_rejected(&self) {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold a finalized session into the aggregates
    pub fn record_session(&self, record: &ResultRecord) {
        let counter = match record.outcome {
            Some(Outcome::Completed) => &self.counters.completed,
            Some(Outcome::TimedOut) => &self.counters.timed_out,
            Some(Outcome::Failed { .. }) | None => &self.counters.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        match record.status {
            Status::Success => self.counters.success.fetch_add(1, Ordering::Relaxed),
            Status::Partial => self.counters.partial.fetch_add(1, Ordering::Relaxed),
            Status::Failed => 0,
        };

        let values = [
            (&self.ping, record.ping_ms),
            (&self.jitter, record.jitter_ms),
            (&self.download, record.download_bps.map(|v| v as f64)),
            (&self.upload, record.upload_bps.map(|v| v as f64)),
        ];
        for (distribution, value) in values {
            if let Some(value) = value {
                if let Err(e) = distribution.lock().record(value) {
                    warn!("Failed to record {} in server statistics: {}", value, e);
                }
            }
        }
    }

    pub fn snapshot(&self) -> ServerStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ServerStats {
            status: Status::Success,
            sessions: SessionCounts {
                opened: load(&self.counters.opened),
                rejected: load(&self.counters.rejected),
                completed: load(&self.counters.completed),
                timed_out: load(&self.counters.timed_out),
                failed: load(&self.counters.failed),
                success: load(&self.counters.success),
                partial: load(&self.counters.partial),
            },
            ping_ms: self.ping.lock().summary(),
            jitter_ms: self.jitter.lock().summary(),
            download_bps: self.download.lock().summary(),
            upload_bps: self.upload.lock().summary(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::ServerIdentity;
    use crate::session::{ClientId, Session};
    use std::time::Duration;

    #[test]
    fn test_distribution_summary() {
        let mut distribution = Distribution::new(1000.0).unwrap();
        assert!(distribution.summary().is_none());

        for ms in [10.0, 20.0, 30.0, 40.0] {
            distribution.record(ms).unwrap();
        }
        let summary = distribution.summary().unwrap();

        assert_eq!(summary.samples, 4);
        assert!((summary.min - 10.0).abs() < 0.05);
        assert!((summary.max - 40.0).abs() < 0.05);
        assert!((summary.mean - 25.0).abs() < 0.05);
        assert!(summary.p50 >= 19.9 && summary.p50 <= 20.1);
    }

    #[test]
    fn test_rate_distribution_keeps_three_digits() {
        let mut distribution = Distribution::new(0.001).unwrap();
        distribution.record(94_500_000.0).unwrap();
        let summary = distribution.summary().unwrap();
        assert!((summary.p50 - 94_500_000.0).abs() / 94_500_000.0 < 0.001);
    }

    #[tokio::test]
    async fn test_record_session_counts_outcomes() {
        let metrics = ServerMetrics::new().unwrap();
        let identity = ServerIdentity::default();

        let session = Session::new(ClientId::new("a"), Duration::from_secs(30));
        metrics.session_opened();
        session.expire();
        metrics.record_session(&ResultRecord::from_session(&session, &identity));
        metrics.session_rejected();

        let stats = metrics.snapshot();
        assert_eq!(stats.status, Status::Success);
        assert_eq!(stats.sessions.opened, 1);
        assert_eq!(stats.sessions.rejected, 1);
        assert_eq!(stats.sessions.timed_out, 1);
        assert_eq!(stats.sessions.completed, 0);
        assert!(stats.ping_ms.is_none());
    }
}
