//! # Throughput Estimation
//!
//! Bandwidth is measured by sampling a shared byte counter at the end of
//! fixed-width windows while a transfer runs. Windows that start inside the
//! warm-up period are recorded but excluded from the estimate, so TCP slow
//! start and buffer filling do not drag the figure down. The estimate is the
//! median of the per-window rates, which keeps a single burst or hiccup from
//! dominating.
//!
//! The transfer side (download stream or upload sink) only increments a
//! [`TransferCounter`]; the estimator owns all timing.

use crate::error::ErrorKind;
use crate::results::Status;
use crate::session::PhaseContext;
use crate::utils;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// Which way payload bytes flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Server to client
    Download,
    /// Client to server
    Upload,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Download => write!(f, "download"),
            Direction::Upload => write!(f, "upload"),
        }
    }
}

/// Byte counter shared between a transfer and its estimator
///
/// Clones share the same counter. `close` marks the transfer as finished
/// from the transfer side, e.g. when an upload body ends.
#[derive(Debug, Clone, Default)]
pub struct TransferCounter {
    bytes: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl TransferCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Tuning for a throughput phase
#[derive(Debug, Clone)]
pub struct ThroughputConfig {
    /// Planned length of the transfer
    pub duration: Duration,
    /// Leading part of the transfer excluded from the estimate
    pub warmup: Duration,
    /// Width of one sampling window
    pub window: Duration,
    /// Consecutive empty windows tolerated before the transfer counts as stalled
    pub max_idle_windows: usize,
}

impl Default for ThroughputConfig {
    fn default() -> Self {
        Self {
            duration: crate::defaults::TRANSFER_DURATION,
            warmup: crate::defaults::WARMUP,
            window: crate::defaults::WINDOW,
            max_idle_windows: crate::defaults::MAX_IDLE_WINDOWS,
        }
    }
}

/// Bytes observed during one sampling window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSample {
    pub index: usize,
    /// Offset of the window start from the start of the measurement
    pub start: Duration,
    /// Actual width of the window, which may differ from the configured one
    pub elapsed: Duration,
    pub bytes: u64,
}

impl WindowSample {
    pub fn bits_per_second(&self) -> Option<f64> {
        let secs = self.elapsed.as_secs_f64();
        (secs > 0.0).then(|| self.bytes as f64 * 8.0 / secs)
    }
}

/// Outcome of a throughput phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThroughputResult {
    pub direction: Direction,
    pub status: Status,
    pub error: Option<ErrorKind>,
    pub bits_per_second: Option<u64>,
    pub bytes_transferred: u64,
    pub duration_ms: f64,
    pub windows_total: usize,
    /// Windows that went into the estimate
    pub windows_used: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    /// The planned duration elapsed
    Completed,
    /// The transfer side closed the counter
    Exhausted,
    /// The session deadline cut the transfer short
    Deadline,
    Cancelled,
    Stalled(usize),
}

struct WindowRecorder {
    start: Instant,
    baseline: u64,
    last_total: u64,
    last_at: Instant,
    idle: usize,
    windows: Vec<WindowSample>,
}

impl WindowRecorder {
    fn new(start: Instant, baseline: u64) -> Self {
        Self {
            start,
            baseline,
            last_total: baseline,
            last_at: start,
            idle: 0,
            windows: Vec::new(),
        }
    }

    fn record(&mut self, now: Instant, total: u64) -> WindowSample {
        let sample = WindowSample {
            index: self.windows.len(),
            start: self.last_at.duration_since(self.start),
            elapsed: now.duration_since(self.last_at),
            bytes: total.saturating_sub(self.last_total),
        };
        if sample.bytes == 0 {
            self.idle += 1;
        } else {
            self.idle = 0;
        }
        self.last_total = total;
        self.last_at = now;
        self.windows.push(sample);
        sample
    }
}

/// Turns a running transfer into a bandwidth figure
#[derive(Debug, Clone)]
pub struct ThroughputEstimator {
    config: ThroughputConfig,
}

impl ThroughputEstimator {
    pub fn new(config: ThroughputConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ThroughputConfig {
        &self.config
    }

    /// Sample `counter` until the transfer ends, and estimate its rate.
    ///
    /// The measurement stops at the first of: the planned duration, the
    /// session deadline, cancellation, the counter being closed, or too many
    /// consecutive empty windows. It never fails; how it ended is reported in
    /// the result's `status` and `error`.
    pub async fn measure(
        &self,
        direction: Direction,
        counter: &TransferCounter,
        ctx: &PhaseContext,
    ) -> ThroughputResult {
        let start = Instant::now();
        let planned_end = start + self.config.duration;
        let end = planned_end.min(ctx.deadline);
        let mut recorder = WindowRecorder::new(start, counter.total());

        let mut ticker = interval_at(start + self.config.window, self.config.window);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            let now = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => break StopReason::Cancelled,
                tick = ticker.tick() => tick.min(end),
                _ = sleep_until(end) => end,
            };

            let window = recorder.record(now, counter.total());
            trace!(
                session = %ctx.session_id,
                "{} window {}: {} bytes in {:?}",
                direction,
                window.index,
                window.bytes,
                window.elapsed
            );

            if counter.is_closed() {
                break StopReason::Exhausted;
            }
            if recorder.idle > self.config.max_idle_windows {
                break StopReason::Stalled(recorder.idle);
            }
            if now >= end {
                if end < planned_end {
                    break StopReason::Deadline;
                }
                break StopReason::Completed;
            }
        };

        let result = self.summarize(direction, &recorder, reason);
        debug!(
            session = %ctx.session_id,
            "{} finished ({:?}): {} in {} windows, estimate {}",
            direction,
            reason,
            utils::format_bytes(result.bytes_transferred),
            result.windows_total,
            result
                .bits_per_second
                .map(|bps| utils::format_bitrate(bps as f64))
                .unwrap_or_else(|| "n/a".to_string())
        );
        result
    }

    fn summarize(
        &self,
        direction: Direction,
        recorder: &WindowRecorder,
        reason: StopReason,
    ) -> ThroughputResult {
        let windows = &recorder.windows;
        let steady: Vec<f64> = windows
            .iter()
            .filter(|w| w.start >= self.config.warmup)
            .filter_map(WindowSample::bits_per_second)
            .collect();
        let (rates, warm) = if steady.is_empty() {
            let all: Vec<f64> = windows
                .iter()
                .filter_map(WindowSample::bits_per_second)
                .collect();
            (all, false)
        } else {
            (steady, true)
        };
        let estimate = utils::median(&rates).map(|bps| bps.round() as u64);

        let (status, error) = match reason {
            StopReason::Cancelled => (Status::Partial, Some(ErrorKind::ClientCancelled)),
            StopReason::Stalled(_) => (Status::Failed, Some(ErrorKind::StalledTransfer)),
            _ if estimate.is_none() => (
                Status::Failed,
                (reason == StopReason::Deadline).then_some(ErrorKind::Timeout),
            ),
            StopReason::Deadline => (Status::Partial, Some(ErrorKind::Timeout)),
            StopReason::Completed | StopReason::Exhausted if warm => (Status::Success, None),
            StopReason::Completed | StopReason::Exhausted => (Status::Partial, None),
        };

        ThroughputResult {
            direction,
            status,
            error,
            bits_per_second: estimate,
            bytes_transferred: recorder.last_total.saturating_sub(recorder.baseline),
            duration_ms: recorder.last_at.duration_since(recorder.start).as_secs_f64() * 1000.0,
            windows_total: windows.len(),
            windows_used: rates.len(),
        }
    }
}
