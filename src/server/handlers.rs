//! Request handlers.
//!
//! Each handler is a thin adapter: it extracts the session id and peer
//! address, calls into the [`SessionCoordinator`], and maps errors onto
//! HTTP statuses through [`ApiError`].

use super::ws::WsProbeTransport;
use crate::coordinator::{HealthReport, SessionCoordinator, SessionTicket};
use crate::error::{ErrorKind, SpeedTestError};
use crate::metrics::ServerStats;
use crate::results::{ResultRecord, Status};
use crate::session::{ClientId, SessionId};
use crate::throughput::ThroughputResult;
use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::net::SocketAddr;
use tracing::{debug, warn};

/// Seconds a rejected client is asked to wait before retrying
const RETRY_AFTER_SECS: &str = "5";

/// A [`SpeedTestError`] rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub SpeedTestError);

#[derive(Serialize)]
struct ErrorBody {
    status: Status,
    error: ErrorKind,
    message: String,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self.0.kind() {
            ErrorKind::Capacity => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Timeout => StatusCode::REQUEST_TIMEOUT,
            ErrorKind::PhaseOrder => StatusCode::CONFLICT,
            ErrorKind::ClientCancelled => StatusCode::BAD_REQUEST,
            ErrorKind::StalledTransfer => StatusCode::BAD_GATEWAY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<SpeedTestError> for ApiError {
    fn from(err: SpeedTestError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!("Request failed with {}: {}", status, self.0);
        } else {
            debug!("Request rejected with {}: {}", status, self.0);
        }

        let body = ErrorBody {
            status: Status::Failed,
            error: self.0.kind(),
            message: self.0.to_string(),
        };
        let mut response = (status, Json(body)).into_response();
        if self.0.is_retryable() {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from_static(RETRY_AFTER_SECS),
            );
        }
        response
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// POST /sessions
pub async fn open_session(
    State(coordinator): State<SessionCoordinator>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> ApiResult<(StatusCode, Json<SessionTicket>)> {
    let ticket = coordinator.open_session(ClientId::from(peer.ip()))?;
    Ok((StatusCode::CREATED, Json(ticket)))
}

// GET /sessions/{id}/latency
pub async fn latency(
    State(coordinator): State<SessionCoordinator>,
    Path(id): Path<SessionId>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let phase = coordinator.begin_latency(id)?;

    let on_failure = coordinator.clone();
    let abandoned = phase.clone();
    let response = ws
        .on_failed_upgrade(move |e| {
            on_failure.abandon_latency(abandoned, &format!("WebSocket upgrade failed: {}", e));
        })
        .on_upgrade(move |socket| async move {
            let transport = WsProbeTransport::new(socket);
            if let Err(e) = coordinator.run_latency(phase, transport).await {
                warn!(session = %id, "Latency phase could not run: {}", e);
            }
        });
    Ok(response)
}

// GET /sessions/{id}/download
pub async fn download(
    State(coordinator): State<SessionCoordinator>,
    Path(id): Path<SessionId>,
) -> ApiResult<Response> {
    let stream = coordinator.start_download(id)?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

// PUT /sessions/{id}/upload
pub async fn upload(
    State(coordinator): State<SessionCoordinator>,
    Path(id): Path<SessionId>,
    body: Body,
) -> ApiResult<Json<ThroughputResult>> {
    let result = coordinator.run_upload(id, body.into_data_stream()).await?;
    Ok(Json(result))
}

// GET /sessions/{id}/result
pub async fn result(
    State(coordinator): State<SessionCoordinator>,
    Path(id): Path<SessionId>,
) -> ApiResult<Json<ResultRecord>> {
    Ok(Json(coordinator.result(id)?))
}

// DELETE /sessions/{id}
pub async fn cancel(
    State(coordinator): State<SessionCoordinator>,
    Path(id): Path<SessionId>,
) -> ApiResult<Json<ResultRecord>> {
    Ok(Json(coordinator.cancel(id)?))
}

pub async fn health(State(coordinator): State<SessionCoordinator>) -> Json<HealthReport> {
    Json(coordinator.health())
}

pub async fn stats(State(coordinator): State<SessionCoordinator>) -> Json<ServerStats> {
    Json(coordinator.stats())
}
