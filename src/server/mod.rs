//! HTTP and WebSocket surface.
//!
//! | Method   | Path                      | Handler                  |
//! |----------|---------------------------|--------------------------|
//! | `POST`   | `/sessions`               | admit a session          |
//! | `DELETE` | `/sessions/{id}`          | cancel a session         |
//! | `GET`    | `/sessions/{id}/latency`  | WebSocket probe exchange |
//! | `GET`    | `/sessions/{id}/download` | payload stream           |
//! | `PUT`    | `/sessions/{id}/upload`   | upload sink              |
//! | `GET`    | `/sessions/{id}/result`   | live or archived record  |
//! | `GET`    | `/health`                 | liveness and occupancy   |
//! | `GET`    | `/stats`                  | server-wide aggregates   |

pub mod handlers;
pub mod ws;

use crate::config::ServerConfig;
use crate::coordinator::SessionCoordinator;
use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post, put};
use axum::Router;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use handlers::ApiError;
pub use ws::{ProbeFrame, WsProbeTransport};

const LISTEN_BACKLOG: i32 = 1024;

/// Build the application router around `coordinator`
pub fn router(coordinator: SessionCoordinator) -> Router {
    Router::new()
        .route("/sessions", post(handlers::open_session))
        .route("/sessions/{id}", axum::routing::delete(handlers::cancel))
        .route("/sessions/{id}/latency", get(handlers::latency))
        .route("/sessions/{id}/download", get(handlers::download))
        .route(
            "/sessions/{id}/upload",
            put(handlers::upload).layer(DefaultBodyLimit::disable()),
        )
        .route("/sessions/{id}/result", get(handlers::result))
        .route("/health", get(handlers::health))
        .route("/stats", get(handlers::stats))
        .layer(TraceLayer::new_for_http())
        .with_state(coordinator)
}

/// Bind a listening socket with `TCP_NODELAY` set, so accepted connections
/// inherit it and small probe frames go out immediately
pub fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nodelay(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    let listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(listener)?)
}

/// Bind the configured address and serve until `shutdown` is cancelled
pub async fn serve(config: ServerConfig, shutdown: CancellationToken) -> Result<()> {
    let addr = config.bind_address()?;
    let listener = bind_listener(addr).with_context(|| format!("Failed to bind {}", addr))?;
    let coordinator = SessionCoordinator::new(config)?;
    serve_with_listener(listener, coordinator, shutdown).await
}

/// Serve on an already bound listener.
///
/// On shutdown the server stops accepting, cancels every active session so
/// open transfers end, then drains the worker pool.
pub async fn serve_with_listener(
    listener: TcpListener,
    coordinator: SessionCoordinator,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("Listening on {}", listener.local_addr()?);
    let reaper = coordinator.spawn_reaper(shutdown.child_token());

    let signal = {
        let coordinator = coordinator.clone();
        let shutdown = shutdown.clone();
        async move {
            shutdown.cancelled().await;
            info!("Shutdown requested, cancelling active sessions");
            coordinator.cancel_all();
        }
    };

    let served = axum::serve(
        listener,
        router(coordinator.clone()).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(signal)
    .await
    .context("HTTP server failed");

    shutdown.cancel();
    if let Err(e) = reaper.await {
        tracing::warn!("Reaper task ended abnormally: {}", e);
    }
    coordinator.shutdown().await;
    served
}
