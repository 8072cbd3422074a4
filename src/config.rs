use crate::cli::Args;
use crate::latency::LatencyConfig;
use crate::registry::RegistryLimits;
use crate::throughput::ThroughputConfig;
use crate::{defaults, utils};
use anyhow::Result;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

/// Payload pool settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadConfig {
    pub pool_size: usize,
    pub chunk_size: usize,
    /// Fixed seed for reproducible payloads
    pub seed: Option<u64>,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            pool_size: defaults::PAYLOAD_POOL_SIZE,
            chunk_size: defaults::CHUNK_SIZE,
            seed: None,
        }
    }
}

/// Validated server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Runtime worker threads
    pub runtime_threads: usize,
    pub queue_depth: usize,
    pub server_name: String,
    pub limits: RegistryLimits,
    pub session_timeout: Duration,
    pub overrun_grace: Duration,
    pub latency: LatencyConfig,
    pub throughput: ThroughputConfig,
    pub payload: PayloadConfig,
    pub result_retention: Duration,
    pub result_capacity: usize,
    pub reap_interval: Duration,
    pub results_log: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: defaults::HOST.to_string(),
            port: defaults::PORT,
            runtime_threads: utils::get_cpu_cores(),
            queue_depth: defaults::QUEUE_DEPTH,
            server_name: defaults::SERVER_NAME.to_string(),
            limits: RegistryLimits::default(),
            session_timeout: defaults::SESSION_TIMEOUT,
            overrun_grace: defaults::OVERRUN_GRACE,
            latency: LatencyConfig::default(),
            throughput: ThroughputConfig::default(),
            payload: PayloadConfig::default(),
            result_retention: defaults::RESULT_RETENTION,
            result_capacity: defaults::RESULT_CAPACITY,
            reap_interval: defaults::REAP_INTERVAL,
            results_log: None,
        }
    }
}

impl ServerConfig {
    /// Build a configuration from command-line arguments and validate it
    pub fn from_args(args: &Args) -> Result<Self> {
        let config = Self {
            host: args.host.clone(),
            port: args.port,
            runtime_threads: args.workers.unwrap_or_else(utils::get_cpu_cores),
            queue_depth: args.queue_depth,
            server_name: args.server_name.clone(),
            limits: RegistryLimits {
                max_sessions: args.max_sessions,
                max_per_client: args.max_sessions_per_client,
            },
            session_timeout: args.session_timeout,
            overrun_grace: args.overrun_grace,
            latency: LatencyConfig {
                count: args.probe_count,
                interval: args.probe_interval,
                probe_timeout: args.probe_timeout,
                failure_tolerance: args.probe_failure_tolerance,
            },
            throughput: ThroughputConfig {
                duration: args.duration,
                warmup: args.warmup,
                window: args.window,
                max_idle_windows: args.max_idle_windows,
            },
            payload: PayloadConfig {
                pool_size: args.payload_pool_size,
                chunk_size: args.chunk_size,
                seed: args.seed,
            },
            result_retention: args.result_retention,
            result_capacity: args.result_capacity,
            reap_interval: args.reap_interval,
            results_log: args.results_log.clone(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the server cannot run with
    pub fn validate(&self) -> Result<()> {
        utils::validate_port(self.port)?;

        if self.runtime_threads == 0 {
            anyhow::bail!("Worker thread count must be at least 1");
        }
        if self.queue_depth == 0 {
            anyhow::bail!("Queue depth must be at least 1");
        }
        if self.limits.max_sessions == 0 {
            anyhow::bail!("Maximum sessions must be at least 1");
        }
        if self.limits.max_per_client == 0 || self.limits.max_per_client > self.limits.max_sessions
        {
            anyhow::bail!(
                "Per-client session cap {} must be between 1 and the global cap {}",
                self.limits.max_per_client,
                self.limits.max_sessions
            );
        }

        utils::validate_non_zero("Session timeout", self.session_timeout)?;
        utils::validate_non_zero("Reap interval", self.reap_interval)?;

        if self.latency.count < 2 {
            anyhow::bail!(
                "Probe count {} is too low (at least 2 probes are needed)",
                self.latency.count
            );
        }
        utils::validate_non_zero("Probe timeout", self.latency.probe_timeout)?;
        if !(0.0..=1.0).contains(&self.latency.failure_tolerance) {
            anyhow::bail!(
                "Probe failure tolerance {} must be between 0.0 and 1.0",
                self.latency.failure_tolerance
            );
        }

        utils::validate_non_zero("Window", self.throughput.window)?;
        if self.throughput.window > self.throughput.duration {
            anyhow::bail!(
                "Window {:?} is longer than the transfer duration {:?}",
                self.throughput.window,
                self.throughput.duration
            );
        }
        if self.throughput.warmup >= self.throughput.duration {
            anyhow::bail!(
                "Warm-up {:?} must be shorter than the transfer duration {:?}",
                self.throughput.warmup,
                self.throughput.duration
            );
        }

        utils::validate_chunk_size(self.payload.chunk_size, self.payload.pool_size)?;
        Ok(())
    }

    /// Resolve the configured host and port to a socket address
    pub fn bind_address(&self) -> Result<SocketAddr> {
        let target = format!("{}:{}", self.host, self.port);
        target
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| anyhow::anyhow!("Could not resolve bind address {}", target))
    }
}
