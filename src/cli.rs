use crate::defaults;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Speedtest Server - measures latency, download and upload throughput for HTTP clients
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Address to bind the HTTP listener to
    #[clap(long, default_value = defaults::HOST, help_heading = "Server Options")]
    pub host: String,

    /// Port to listen on (0 picks a free port)
    #[clap(short = 'p', long, default_value_t = defaults::PORT, help_heading = "Server Options")]
    pub port: u16,

    /// Number of runtime worker threads (defaults to the CPU count)
    #[clap(long, help_heading = "Server Options")]
    pub workers: Option<usize>,

    /// Maximum number of measurement jobs waiting for a worker
    #[clap(long, default_value_t = defaults::QUEUE_DEPTH, help_heading = "Server Options")]
    pub queue_depth: usize,

    /// Server name reported in result records
    #[clap(long, default_value = defaults::SERVER_NAME, help_heading = "Server Options")]
    pub server_name: String,

    /// Maximum number of concurrently active sessions
    #[clap(long, default_value_t = defaults::MAX_SESSIONS, help_heading = "Session Limits")]
    pub max_sessions: usize,

    /// Maximum number of concurrently active sessions per client address
    #[clap(long, default_value_t = defaults::MAX_SESSIONS_PER_CLIENT, help_heading = "Session Limits")]
    pub max_sessions_per_client: usize,

    /// Total lifetime of a session (e.g. 30s, 1m)
    #[clap(long, value_parser = parse_duration, default_value = "30s", help_heading = "Session Limits")]
    pub session_timeout: Duration,

    /// How long a running phase may overrun the session deadline before it is failed
    #[clap(long, value_parser = parse_duration, default_value = "5s", help_heading = "Session Limits")]
    pub overrun_grace: Duration,

    /// Number of latency probes per session
    #[clap(long, default_value_t = defaults::PROBE_COUNT, help_heading = "Latency")]
    pub probe_count: usize,

    /// Spacing between latency probes
    #[clap(long, value_parser = parse_duration, default_value = "50ms", help_heading = "Latency")]
    pub probe_interval: Duration,

    /// Deadline for a single latency probe
    #[clap(long, value_parser = parse_duration, default_value = "2s", help_heading = "Latency")]
    pub probe_timeout: Duration,

    /// Share of timed-out probes (0.0-1.0) above which the latency result is partial
    #[clap(long, default_value_t = defaults::PROBE_FAILURE_TOLERANCE, help_heading = "Latency")]
    pub probe_failure_tolerance: f64,

    /// Duration of each throughput measurement
    #[clap(short = 'd', long, value_parser = parse_duration, default_value = "10s", help_heading = "Throughput")]
    pub duration: Duration,

    /// Leading part of a transfer excluded from the estimate
    #[clap(long, value_parser = parse_duration, default_value = "2s", help_heading = "Throughput")]
    pub warmup: Duration,

    /// Width of one throughput sampling window
    #[clap(long, value_parser = parse_duration, default_value = "200ms", help_heading = "Throughput")]
    pub window: Duration,

    /// Consecutive empty windows tolerated before a transfer counts as stalled
    #[clap(long, default_value_t = defaults::MAX_IDLE_WINDOWS, help_heading = "Throughput")]
    pub max_idle_windows: usize,

    /// Size of one download chunk in bytes
    #[clap(long, default_value_t = defaults::CHUNK_SIZE, help_heading = "Throughput")]
    pub chunk_size: usize,

    /// Size of the pre-generated payload pool in bytes
    #[clap(long, default_value_t = defaults::PAYLOAD_POOL_SIZE, help_heading = "Throughput")]
    pub payload_pool_size: usize,

    /// Seed for the payload generator (random when omitted)
    #[clap(long, help_heading = "Throughput")]
    pub seed: Option<u64>,

    /// How long finished results stay retrievable
    #[clap(long, value_parser = parse_duration, default_value = "5m", help_heading = "Results")]
    pub result_retention: Duration,

    /// Maximum number of finished results kept in memory
    #[clap(long, default_value_t = defaults::RESULT_CAPACITY, help_heading = "Results")]
    pub result_capacity: usize,

    /// Period of the expired-session sweep
    #[clap(long, value_parser = parse_duration, default_value = "1s", help_heading = "Results")]
    pub reap_interval: Duration,

    /// Append every finished result to this file as one JSON line
    #[clap(long, help_heading = "Results")]
    pub results_log: Option<PathBuf>,

    /// Verbose output (-v debug, -vv trace)
    #[clap(short = 'v', long, action = clap::ArgAction::Count, help_heading = "Logging")]
    pub verbose: u8,

    /// Only log warnings and errors
    #[clap(short = 'q', long, default_value_t = false, conflicts_with = "verbose", help_heading = "Logging")]
    pub quiet: bool,

    /// Also write logs to this file
    #[clap(long, help_heading = "Logging")]
    pub log_file: Option<PathBuf>,
}

impl Default for Args {
    /// The configuration clap produces when no flags are given
    fn default() -> Self {
        Self::parse_from([env!("CARGO_PKG_NAME")])
    }
}

/// Parse duration from string (e.g., "500ms", "10s", "1.5m", "1h")
///
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s")
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Duration must be a non-negative number: {}", s));
    }

    let secs = match unit {
        "ms" => num / 1000.0,
        "s" => num,
        "m" => num * 60.0,
        "h" => num * 3600.0,
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Duration::try_from_secs_f64(secs).map_err(|e| format!("Invalid duration {}: {}", s, e))
}
