//! # Speedtest Server - Main Entry Point
//!
//! Starts the speed-test service:
//! 1. **Parse arguments**: every tunable of the measurement engine is a flag
//! 2. **Initialize logging**: colorized console output, optional log file
//! 3. **Build the configuration**: validated before anything is bound
//! 4. **Build the runtime**: multi-threaded, sized by `--workers`
//! 5. **Serve**: until SIGINT or SIGTERM, then shut down gracefully

use anyhow::{Context, Result};
use clap::Parser;
use speedtest_server::{cli::Args, logging, server, ServerConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

fn main() -> Result<()> {
    let args = Args::parse();

    // The guard flushes the log file on drop; keep it until exit.
    let _log_guard = logging::init_logging(args.verbose, args.quiet, args.log_file.as_deref())?;

    let config = ServerConfig::from_args(&args)?;
    info!(
        "Starting speedtest server {} with {} runtime threads",
        speedtest_server::VERSION,
        config.runtime_threads
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.runtime_threads)
        .enable_all()
        .build()
        .context("Failed to build the tokio runtime")?;

    let result = runtime.block_on(async {
        let shutdown = CancellationToken::new();
        tokio::spawn(forward_signals(shutdown.clone()));
        server::serve(config, shutdown).await
    });

    match &result {
        Ok(()) => info!("Speedtest server stopped"),
        Err(e) => error!("Speedtest server failed: {:#}", e),
    }
    result
}

/// Cancel `shutdown` on the first SIGINT or SIGTERM
async fn forward_signals(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
    shutdown.cancel();
}
