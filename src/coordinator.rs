//! # Session Coordinator
//!
//! Drives each session through `Init → Latency → Download → Upload → Done`.
//! The coordinator admits sessions through the registry, runs every phase as
//! a job on the worker pool, decides after each phase whether the session
//! continues, and finalizes it exactly once: the result record is archived,
//! logged, folded into the server statistics, and the registry slot is
//! released.
//!
//! ## Continuation Policy
//!
//! | Phase ended with        | Session                                  |
//! |-------------------------|------------------------------------------|
//! | no error                | continues (`Upload` completes it)        |
//! | `Timeout`, time left    | continues with a degraded measurement    |
//! | `Timeout`, deadline hit | ends as `Done` / `TimedOut`              |
//! | anything else           | ends as `Failed`, partial data kept      |
//!
//! A background reaper ends sessions that sit idle past their deadline and
//! force-fails phases that overrun it by more than the configured grace.

use crate::config::ServerConfig;
use crate::error::{ErrorKind, Result, SpeedTestError};
use crate::latency::{LatencyProber, LatencyResult, ProbeTransport};
use crate::metrics::{ServerMetrics, ServerStats};
use crate::payload::{self, DownloadStream, PayloadGenerator, SeededByteSource};
use crate::registry::{Occupancy, SessionRegistry};
use crate::results::{ResultArchive, ResultRecord, ResultsLog, ServerIdentity, Status};
use crate::session::{ClientId, Phase, PhaseContext, Session, SessionId};
use crate::throughput::{Direction, ThroughputEstimator, ThroughputResult, TransferCounter};
use crate::worker::{PoolStats, WorkerPool};
use anyhow::Context;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Returned to the client when a session is admitted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTicket {
    pub status: Status,
    pub session_id: SessionId,
    pub deadline: DateTime<Utc>,
}

/// Liveness report served by `/health`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: Status,
    pub version: String,
    pub server: ServerIdentity,
    pub uptime_seconds: f64,
    pub sessions: Occupancy,
    pub workers: PoolStats,
    pub archived_results: usize,
    pub timestamp: DateTime<Utc>,
}

/// An accepted latency phase waiting for its transport
///
/// Created before the WebSocket upgrade completes, so ordering errors can
/// still be reported as plain HTTP responses.
#[derive(Debug, Clone)]
pub struct LatencyPhase {
    session: Arc<Session>,
    ctx: PhaseContext,
}

impl LatencyPhase {
    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }
}

/// Aborts the wrapped task when dropped
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Owns the lifecycle of every session on this server
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SessionCoordinator {
    config: Arc<ServerConfig>,
    registry: Arc<SessionRegistry>,
    archive: Arc<ResultArchive>,
    payload: Arc<PayloadGenerator>,
    pool: Arc<WorkerPool>,
    metrics: Arc<ServerMetrics>,
    results_log: Option<Arc<ResultsLog>>,
    identity: Arc<ServerIdentity>,
    prober: LatencyProber,
    estimator: ThroughputEstimator,
    started: Instant,
}

impl SessionCoordinator {
    /// Build the coordinator and start its worker pool.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: ServerConfig) -> anyhow::Result<Self> {
        let mut source = match config.payload.seed {
            Some(seed) => SeededByteSource::new(seed),
            None => SeededByteSource::from_entropy(),
        };
        let payload = PayloadGenerator::new(
            &mut source,
            config.payload.pool_size,
            config.payload.chunk_size,
        );

        let results_log = match &config.results_log {
            Some(path) => Some(Arc::new(
                ResultsLog::open(path)
                    .with_context(|| format!("Failed to open results log {:?}", path))?,
            )),
            None => None,
        };

        let identity = ServerIdentity::new(config.server_name.clone());
        info!(
            "Server {} ({}) ready: {} session slots, payload pool {}",
            identity.name,
            identity.server_id,
            config.limits.max_sessions,
            crate::utils::format_bytes(payload.pool_size() as u64)
        );

        Ok(Self {
            registry: Arc::new(SessionRegistry::new(config.limits)),
            archive: Arc::new(ResultArchive::new(
                config.result_retention,
                config.result_capacity,
            )),
            payload: Arc::new(payload),
            pool: Arc::new(WorkerPool::new(
                config.limits.max_sessions,
                config.queue_depth,
            )),
            metrics: Arc::new(ServerMetrics::new()?),
            results_log,
            identity: Arc::new(identity),
            prober: LatencyProber::new(config.latency.clone()),
            estimator: ThroughputEstimator::new(config.throughput.clone()),
            started: Instant::now(),
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    /// Admit a new session for `client`
    pub fn open_session(&self, client: ClientId) -> Result<SessionTicket> {
        match self.registry.open(client, self.config.session_timeout) {
            Ok(session) => {
                self.metrics.session_opened();
                info!(
                    session = %session.id(),
                    "Opened session for {}",
                    session.client()
                );
                Ok(SessionTicket {
                    status: Status::Success,
                    session_id: session.id(),
                    deadline: session.deadline_utc(),
                })
            }
            Err(e) => {
                self.metrics.session_rejected();
                Err(e)
            }
        }
    }

    fn begin(&self, id: SessionId, phase: Phase) -> Result<(Arc<Session>, PhaseContext)> {
        let session = self.registry.get(id)?;
        match session.begin(phase) {
            Ok(ctx) => {
                debug!(
                    session = %id,
                    "Starting {} phase with {} left",
                    phase,
                    crate::utils::format_duration(ctx.remaining())
                );
                Ok((session, ctx))
            }
            Err(SpeedTestError::SessionExpired(id)) => {
                if session.expire() {
                    info!(session = %id, "Session expired before the {} phase", phase);
                    self.finalize(&session);
                }
                Err(SpeedTestError::SessionExpired(id))
            }
            Err(e) => Err(e),
        }
    }

    /// Accept the latency phase of session `id`
    pub fn begin_latency(&self, id: SessionId) -> Result<LatencyPhase> {
        let (session, ctx) = self.begin(id, Phase::Latency)?;
        Ok(LatencyPhase { session, ctx })
    }

    /// Run an accepted latency phase over `transport`
    pub async fn run_latency<T>(&self, phase: LatencyPhase, transport: T) -> Result<LatencyResult>
    where
        T: ProbeTransport + 'static,
    {
        let LatencyPhase { session, ctx } = phase;
        let prober = self.prober.clone();
        let coordinator = self.clone();
        let job_session = Arc::clone(&session);

        let outcome = self
            .pool
            .run(async move {
                let mut transport = transport;
                let result = prober.probe(&mut transport, &ctx).await;
                if let Err(e) = transport.finish(&result).await {
                    debug!(session = %ctx.session_id, "Could not deliver latency result: {}", e);
                }
                if result.degraded {
                    warn!(
                        session = %ctx.session_id,
                        "Latency degraded: {} of {} probes timed out",
                        result.timed_out,
                        result.probes_sent
                    );
                }
                job_session.record_latency(result.clone());
                coordinator.settle(&job_session, Phase::Latency, result.error);
                result
            })
            .await;

        outcome.map_err(|e| {
            self.abort(&session, &e);
            e
        })
    }

    /// Accept and run the latency phase in one step
    pub async fn measure_latency<T>(&self, id: SessionId, transport: T) -> Result<LatencyResult>
    where
        T: ProbeTransport + 'static,
    {
        let phase = self.begin_latency(id)?;
        self.run_latency(phase, transport).await
    }

    /// Give up on an accepted latency phase whose transport never came up
    pub fn abandon_latency(&self, phase: LatencyPhase, reason: &str) {
        let LatencyPhase { session, .. } = phase;
        if session.fail(ErrorKind::ClientCancelled, reason) {
            warn!(session = %session.id(), "Latency phase abandoned: {}", reason);
            self.finalize(&session);
        }
    }

    /// Start the download phase of session `id`.
    ///
    /// The returned stream is the response body. It ends when the
    /// measurement is over; dropping it early cancels the phase.
    pub fn start_download(&self, id: SessionId) -> Result<DownloadStream> {
        let (session, ctx) = self.begin(id, Phase::Download)?;
        let counter = TransferCounter::new();
        let stop = CancellationToken::new();
        let body = self
            .payload
            .download_stream(counter.clone(), stop.clone(), ctx.cancel.clone());

        let estimator = self.estimator.clone();
        let coordinator = self.clone();
        let job_session = Arc::clone(&session);
        let submitted = self.pool.submit(async move {
            let result = estimator.measure(Direction::Download, &counter, &ctx).await;
            stop.cancel();
            job_session.record_throughput(result.clone());
            coordinator.settle(&job_session, Phase::Download, result.error);
            result
        });

        match submitted {
            Ok(done) => {
                let coordinator = self.clone();
                tokio::spawn(async move {
                    if done.await.is_err() {
                        let err = SpeedTestError::Internal("download job did not complete".into());
                        coordinator.abort(&session, &err);
                    }
                });
                Ok(body)
            }
            Err(e) => {
                self.abort(&session, &e);
                Err(e)
            }
        }
    }

    /// Run the upload phase of session `id`, consuming `body`.
    ///
    /// Resolves once the measurement is over.
    pub async fn run_upload<S, E>(&self, id: SessionId, body: S) -> Result<ThroughputResult>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Send + Unpin + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let (session, ctx) = self.begin(id, Phase::Upload)?;
        let counter = TransferCounter::new();

        let sink_counter = counter.clone();
        let disconnect = ctx.cancel.clone();
        let session_id = session.id();
        let sink = AbortOnDrop(tokio::spawn(async move {
            match payload::sink(body, &sink_counter).await {
                Ok(bytes) => {
                    debug!(session = %session_id, "Upload body ended after {} bytes", bytes)
                }
                Err(e) => {
                    debug!(session = %session_id, "Upload body failed: {}", e);
                    disconnect.cancel();
                }
            }
        }));

        let estimator = self.estimator.clone();
        let coordinator = self.clone();
        let job_session = Arc::clone(&session);
        let outcome = self
            .pool
            .run(async move {
                let result = estimator.measure(Direction::Upload, &counter, &ctx).await;
                drop(sink);
                job_session.record_throughput(result.clone());
                coordinator.settle(&job_session, Phase::Upload, result.error);
                result
            })
            .await;

        outcome.map_err(|e| {
            self.abort(&session, &e);
            e
        })
    }

    /// Current record of session `id`: live while it runs, archived after
    pub fn result(&self, id: SessionId) -> Result<ResultRecord> {
        if let Ok(session) = self.registry.get(id) {
            return Ok(ResultRecord::from_session(&session, &self.identity));
        }
        self.archive.get(id).ok_or(SpeedTestError::NotFound(id))
    }

    /// Cancel session `id` on the client's request.
    ///
    /// A running phase stops at its next cancellation point and fails the
    /// session from there; an idle session fails immediately.
    pub fn cancel(&self, id: SessionId) -> Result<ResultRecord> {
        let session = match self.registry.get(id) {
            Ok(session) => session,
            Err(e) => return self.archive.get(id).ok_or(e),
        };

        session.cancel_token().cancel();
        if !session.is_busy() && session.fail(ErrorKind::ClientCancelled, "cancelled by the client")
        {
            info!(session = %id, "Session cancelled by the client");
            self.finalize(&session);
        }
        Ok(ResultRecord::from_session(&session, &self.identity))
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: Status::Success,
            version: crate::VERSION.to_string(),
            server: (*self.identity).clone(),
            uptime_seconds: self.started.elapsed().as_secs_f64(),
            sessions: self.registry.occupancy(),
            workers: self.pool.stats(),
            archived_results: self.archive.len(),
            timestamp: Utc::now(),
        }
    }

    pub fn stats(&self) -> ServerStats {
        self.metrics.snapshot()
    }

    /// One sweep over sessions past their deadline; returns how many ended
    pub fn reap(&self) -> usize {
        let now = Instant::now();
        let mut ended = 0;

        for session in self.registry.expired(now) {
            if session.is_finished() {
                self.registry.close(session.id());
                continue;
            }
            if !session.is_busy() {
                if session.expire() {
                    info!(session = %session.id(), "Session timed out");
                    self.finalize(&session);
                    ended += 1;
                }
                continue;
            }
            if now >= session.deadline() + self.config.overrun_grace {
                session.cancel_token().cancel();
                let snapshot = session.snapshot();
                error!(
                    session = %session.id(),
                    phase = %snapshot.phase,
                    transitions = ?snapshot.transitions,
                    "Phase overran the session deadline"
                );
                if session.fail(ErrorKind::Internal, "phase overran the session deadline") {
                    self.finalize(&session);
                    ended += 1;
                }
            }
        }

        let pruned = self.archive.prune(now);
        if pruned > 0 {
            debug!("Pruned {} archived results", pruned);
        }
        ended
    }

    /// Run `reap` every reap interval until `shutdown` is cancelled
    pub fn spawn_reaper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let coordinator = self.clone();
        let period = self.config.reap_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        coordinator.reap();
                    }
                }
            }
            debug!("Reaper stopped");
        })
    }

    /// Signal every active session's running phase to stop
    pub fn cancel_all(&self) {
        for session in self.registry.sessions() {
            session.cancel_token().cancel();
        }
    }

    /// Cancel every active session and drain the worker pool
    pub async fn shutdown(&self) {
        self.cancel_all();
        self.pool.shutdown().await;
        info!("Coordinator stopped");
    }

    /// Decide what happens to a session after one of its phases ended
    fn settle(&self, session: &Session, phase: Phase, error: Option<ErrorKind>) {
        // A cancel that landed after the measurement loop exited still counts
        let error = match error {
            None | Some(ErrorKind::Timeout)
                if session.cancel_token().is_cancelled()
                    && !session.is_expired_at(Instant::now()) =>
            {
                Some(ErrorKind::ClientCancelled)
            }
            other => other,
        };
        match error {
            None => self.advance(session, phase),
            Some(ErrorKind::Timeout) if session.is_expired_at(Instant::now()) => {
                if session.expire() {
                    info!(session = %session.id(), "Session deadline reached during {}", phase);
                    self.finalize(session);
                }
            }
            Some(ErrorKind::Timeout) => {
                warn!(session = %session.id(), "{} phase degraded by timeouts", phase);
                self.advance(session, phase);
            }
            Some(kind) => {
                if session.fail(kind, format!("{} phase ended with {}", phase, kind)) {
                    warn!(session = %session.id(), "Session failed in {}: {}", phase, kind);
                    self.finalize(session);
                }
            }
        }
    }

    fn advance(&self, session: &Session, phase: Phase) {
        if phase != Phase::Upload {
            session.end_phase();
            return;
        }
        match session.complete() {
            Ok(true) => self.finalize(session),
            Ok(false) => {}
            Err(e) => {
                let snapshot = session.snapshot();
                error!(
                    session = %session.id(),
                    transitions = ?snapshot.transitions,
                    "Invariant violation while completing session: {}",
                    e
                );
                if session.fail(ErrorKind::Internal, e.to_string()) {
                    self.finalize(session);
                }
            }
        }
    }

    /// Fail a session whose phase job could not run or did not finish
    fn abort(&self, session: &Session, err: &SpeedTestError) {
        if session.is_finished() {
            return;
        }
        session.cancel_token().cancel();
        let snapshot = session.snapshot();
        error!(
            session = %session.id(),
            phase = %snapshot.phase,
            transitions = ?snapshot.transitions,
            "Phase job failed: {}",
            err
        );
        if session.fail(err.kind(), err.to_string()) {
            self.finalize(session);
        }
    }

    /// Publish a terminal session's record and release its slot
    fn finalize(&self, session: &Session) {
        let record = ResultRecord::from_session(session, &self.identity);
        self.metrics.record_session(&record);
        if let Some(log) = &self.results_log {
            if let Err(e) = log.append(&record) {
                warn!("Failed to append to results log {:?}: {}", log.path(), e);
            }
        }
        let status = record.status;
        self.archive.insert(record);
        self.registry.close(session.id());
        info!(
            session = %session.id(),
            "Session finished in {} with status {}",
            session.phase(),
            status
        );
    }
}
