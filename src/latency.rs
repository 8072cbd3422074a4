//! # Latency Measurement
//!
//! Round-trip latency is measured with a fixed number of small probes sent
//! over an already-open connection. Each probe has its own deadline; probes
//! that miss it are counted as timed out rather than aborting the phase.
//!
//! ## Statistics
//!
//! The answer to probe 0 is excluded from the statistics when any other probe
//! answered, because it tends to carry connection warm-up cost. If probe 0
//! timed out nothing else is dropped. From the remaining samples the prober
//! reports:
//!
//! - **min / max**: extremes in milliseconds
//! - **median**: the reported ping
//! - **p95**: linear-interpolated 95th percentile
//! - **jitter**: mean absolute difference between consecutive samples
//!
//! ## Transport Abstraction
//!
//! The prober never touches a socket directly. It drives any
//! [`ProbeTransport`], which makes it testable with scripted transports and
//! keeps the WebSocket framing in the server module.

use crate::error::{ErrorKind, Result};
use crate::results::Status;
use crate::session::PhaseContext;
use crate::utils;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::debug;

/// A connection that can bounce probes off the client
#[async_trait]
pub trait ProbeTransport: Send {
    /// Send probe `seq` and wait for its echo.
    ///
    /// Echoes carrying any other sequence number belong to probes that
    /// already timed out and must be skipped. An error means the connection
    /// is unusable.
    async fn round_trip(&mut self, seq: u32) -> Result<()>;

    /// Hand the final result to the client once probing is over
    async fn finish(&mut self, _result: &LatencyResult) -> Result<()> {
        Ok(())
    }
}

/// Tuning for the latency phase
#[derive(Debug, Clone)]
pub struct LatencyConfig {
    /// Number of probes to send
    pub count: usize,
    /// Spacing between probe starts
    pub interval: Duration,
    /// Deadline for each probe
    pub probe_timeout: Duration,
    /// Share of timed-out probes above which the result is partial
    pub failure_tolerance: f64,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            count: crate::defaults::PROBE_COUNT,
            interval: crate::defaults::PROBE_INTERVAL,
            probe_timeout: crate::defaults::PROBE_TIMEOUT,
            failure_tolerance: crate::defaults::PROBE_FAILURE_TOLERANCE,
        }
    }
}

/// One answered probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySample {
    pub seq: u32,
    pub rtt: Duration,
}

/// Summary statistics over the valid samples, all in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    pub min_ms: f64,
    pub median_ms: f64,
    pub p95_ms: f64,
    pub max_ms: f64,
    pub jitter_ms: f64,
}

impl LatencyStats {
    /// Reduce samples, given in the order they were taken.
    ///
    /// Returns `None` when there is nothing to reduce.
    pub fn from_samples(samples: &[LatencySample]) -> Option<Self> {
        let warm = samples.iter().any(|s| s.seq != 0);
        let rtts: Vec<f64> = samples
            .iter()
            .filter(|s| !warm || s.seq != 0)
            .map(|s| s.rtt.as_secs_f64() * 1000.0)
            .collect();
        if rtts.is_empty() {
            return None;
        }

        let (_mean, min, max, _std_dev) = utils::calculate_stats(&rtts);
        let percentiles = utils::calculate_percentiles(&rtts, &[50.0, 95.0]);

        Some(Self {
            min_ms: min,
            median_ms: percentiles[0].1,
            p95_ms: percentiles[1].1,
            max_ms: max,
            jitter_ms: utils::mean_successive_difference(&rtts),
        })
    }
}

/// Outcome of the latency phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyResult {
    pub status: Status,
    /// Some probes timed out or probing stopped early
    pub degraded: bool,
    pub error: Option<ErrorKind>,
    pub probes_sent: usize,
    /// Number of probes that came back in time
    pub sample_count: usize,
    pub timed_out: usize,
    pub stats: Option<LatencyStats>,
}

impl LatencyResult {
    /// The reported ping, i.e. the median round trip
    pub fn ping_ms(&self) -> Option<f64> {
        self.stats.as_ref().map(|s| s.median_ms)
    }

    pub fn jitter_ms(&self) -> Option<f64> {
        self.stats.as_ref().map(|s| s.jitter_ms)
    }
}

/// Runs the probe sequence for one session
#[derive(Debug, Clone)]
pub struct LatencyProber {
    config: LatencyConfig,
}

impl LatencyProber {
    pub fn new(config: LatencyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LatencyConfig {
        &self.config
    }

    /// Send the configured number of probes through `transport`.
    ///
    /// Never fails: timeouts, cancellation and transport errors are reported
    /// in the result's `status` and `error` fields.
    pub async fn probe<T>(&self, transport: &mut T, ctx: &PhaseContext) -> LatencyResult
    where
        T: ProbeTransport + ?Sized,
    {
        let mut samples = Vec::with_capacity(self.config.count);
        let mut probes_sent = 0;
        let mut timed_out = 0;
        let mut stopped: Option<ErrorKind> = None;

        for seq in 0..self.config.count as u32 {
            let started = Instant::now();
            if started >= ctx.deadline {
                stopped = Some(ErrorKind::Timeout);
                break;
            }
            let probe_deadline = (started + self.config.probe_timeout).min(ctx.deadline);
            probes_sent += 1;

            let answered = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    stopped = Some(ErrorKind::ClientCancelled);
                    break;
                }
                answered = timeout_at(probe_deadline, transport.round_trip(seq)) => answered,
            };

            match answered {
                Ok(Ok(())) => samples.push(LatencySample {
                    seq,
                    rtt: started.elapsed(),
                }),
                Ok(Err(e)) => {
                    debug!(session = %ctx.session_id, "Probe {} failed: {}", seq, e);
                    stopped = Some(e.kind());
                    break;
                }
                Err(_) => {
                    debug!(session = %ctx.session_id, "Probe {} timed out", seq);
                    timed_out += 1;
                }
            }

            if (seq as usize) + 1 < self.config.count {
                let next = (started + self.config.interval).min(ctx.deadline);
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => {
                        stopped = Some(ErrorKind::ClientCancelled);
                        break;
                    }
                    _ = sleep_until(next) => {}
                }
            }
        }

        self.summarize(&samples, probes_sent, timed_out, stopped)
    }

    fn summarize(
        &self,
        samples: &[LatencySample],
        probes_sent: usize,
        timed_out: usize,
        stopped: Option<ErrorKind>,
    ) -> LatencyResult {
        let stats = LatencyStats::from_samples(samples);
        let failure_rate = if probes_sent == 0 {
            0.0
        } else {
            timed_out as f64 / probes_sent as f64
        };

        let (status, error) = match (&stats, stopped) {
            (None, stopped) => (Status::Failed, stopped.or(Some(ErrorKind::Timeout))),
            (Some(_), Some(kind)) => (Status::Partial, Some(kind)),
            (Some(_), None) if failure_rate > self.config.failure_tolerance => {
                (Status::Partial, Some(ErrorKind::Timeout))
            }
            (Some(_), None) => (Status::Success, None),
        };

        LatencyResult {
            status,
            degraded: timed_out > 0 || stopped.is_some(),
            error,
            probes_sent,
            sample_count: samples.len(),
            timed_out,
            stats,
        }
    }
}
