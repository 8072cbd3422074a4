//! # Speedtest Server Library
//!
//! A network speed-test measurement service implemented in Rust. The server
//! measures real round-trip latency and real throughput by exchanging timed
//! payloads with its clients, under concurrent multi-client load, with a
//! bounded amount of resources per test session.
//!
//! ## Measurement Phases
//!
//! Every client runs one *session*, which walks through a fixed sequence of
//! phases:
//!
//! - **Latency**: small request/response probes over a WebSocket, reduced to
//!   median, p95 and jitter
//! - **Download**: a timed server→client payload stream sampled in fixed windows
//! - **Upload**: a timed client→server payload stream sampled the same way
//!
//! ## Architecture Overview
//!
//! - `registry`: session slots with global and per-client caps
//! - `payload`: pseudo-random payload generation and the upload sink
//! - `latency`: the latency prober and its statistics
//! - `throughput`: windowed bandwidth estimation
//! - `coordinator`: the per-session state machine tying the phases together
//! - `worker`: the bounded worker pool every phase runs on
//! - `server`: the HTTP/WebSocket surface
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use speedtest_server::{server, ServerConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServerConfig::default();
//!     server::serve(config, CancellationToken::new()).await
//! }
//! ```

/// Command-line interface
///
/// Argument parsing with clap. Every timing constant of the measurement
/// engine is exposed as a flag so deployments can tune them.
pub mod cli;

/// Validated runtime configuration built from the command line.
pub mod config;

/// Session lifecycle orchestration
///
/// The `SessionCoordinator` owns the phase state machine
/// (`Init → Latency → Download → Upload → Done`), deadlines, cancellation,
/// and assembly of the final result record.
pub mod coordinator;

pub mod error;

pub mod latency;

/// Logging setup: a colorized console formatter and an optional log file.
pub mod logging;

/// Server-wide aggregate statistics
///
/// HDR histograms of every finished session's ping and throughput, exposed
/// through `/stats`.
pub mod metrics;

pub mod payload;

pub mod registry;

/// Result records, the archive of finished sessions and the NDJSON results log.
pub mod results;

/// HTTP and WebSocket surface built on axum.
pub mod server;

pub mod session;

pub mod throughput;

pub mod utils;

pub mod worker;

pub use config::ServerConfig;
pub use coordinator::SessionCoordinator;
pub use error::{ErrorKind, SpeedTestError};
pub use latency::{LatencyProber, LatencyResult, ProbeTransport};
pub use registry::SessionRegistry;
pub use results::{ResultRecord, Status};
pub use session::{Phase, Session, SessionId};
pub use throughput::{Direction, ThroughputEstimator, ThroughputResult};

/// The current version of the speedtest server
///
/// Reported by `/health` and embedded in every result record.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
///
/// None of these are protocol contracts. They are reasonable starting points
/// and every one of them can be overridden from the command line.
pub mod defaults {
    use std::time::Duration;

    /// Default bind address
    pub const HOST: &str = "0.0.0.0";

    /// Default HTTP port
    pub const PORT: u16 = 8080;

    /// Maximum number of concurrently active sessions
    ///
    /// Also the size of the worker pool, so every admitted session can have
    /// one phase running at any time.
    pub const MAX_SESSIONS: usize = 64;

    /// Maximum number of concurrently active sessions for a single client
    ///
    /// Keeps one client from monopolizing the server's capacity.
    pub const MAX_SESSIONS_PER_CLIENT: usize = 2;

    /// Total lifetime of a session regardless of phase
    pub const SESSION_TIMEOUT: Duration = Duration::from_secs(30);

    /// Number of latency probes per session
    pub const PROBE_COUNT: usize = 20;

    /// Spacing between the starts of consecutive latency probes
    pub const PROBE_INTERVAL: Duration = Duration::from_millis(50);

    /// Deadline for a single latency probe
    pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

    /// Share of timed-out probes above which the latency result is partial
    pub const PROBE_FAILURE_TOLERANCE: f64 = 0.20;

    /// Duration of each throughput measurement
    pub const TRANSFER_DURATION: Duration = Duration::from_secs(10);

    /// Initial part of a throughput measurement that is excluded from the
    /// estimate (TCP slow start, buffer fill)
    pub const WARMUP: Duration = Duration::from_secs(2);

    /// Width of one throughput sampling window
    pub const WINDOW: Duration = Duration::from_millis(200);

    /// Consecutive zero-byte windows tolerated before a transfer is stalled
    pub const MAX_IDLE_WINDOWS: usize = 3;

    /// Size of one download chunk handed to the HTTP layer
    pub const CHUNK_SIZE: usize = 64 * 1024;

    /// Size of the pre-generated pseudo-random payload pool
    ///
    /// Larger than the history window of common HTTP compressors so a
    /// compressing middlebox cannot inflate the measured rate.
    pub const PAYLOAD_POOL_SIZE: usize = 4 * 1024 * 1024;

    /// Depth of the worker pool's job queue
    pub const QUEUE_DEPTH: usize = 128;

    /// How long finished results stay retrievable
    pub const RESULT_RETENTION: Duration = Duration::from_secs(300);

    /// Maximum number of finished results kept in memory
    pub const RESULT_CAPACITY: usize = 1024;

    /// Period of the expired-session reaper
    pub const REAP_INTERVAL: Duration = Duration::from_secs(1);

    /// Extra time a running phase may take past the session deadline before
    /// the reaper force-fails it
    pub const OVERRUN_GRACE: Duration = Duration::from_secs(5);

    /// Server name reported in result records when none is configured
    pub const SERVER_NAME: &str = "speedtest-server";
}
