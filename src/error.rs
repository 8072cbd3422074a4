//! Error types for the speedtest server.

use crate::session::{Phase, SessionId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which capacity limit rejected a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityLimit {
    /// The server-wide session cap
    Global(usize),
    /// The cap on sessions for a single client
    PerClient(usize),
    /// The worker pool's job queue is full
    WorkerQueue(usize),
}

impl std::fmt::Display for CapacityLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapacityLimit::Global(limit) => {
                write!(f, "maximum of {} concurrent sessions reached", limit)
            }
            CapacityLimit::PerClient(limit) => {
                write!(f, "maximum of {} concurrent sessions per client reached", limit)
            }
            CapacityLimit::WorkerQueue(depth) => {
                write!(f, "worker queue is full ({} pending jobs)", depth)
            }
        }
    }
}

/// Errors that can occur while running speed-test sessions
#[derive(Error, Debug)]
pub enum SpeedTestError {
    /// Registry or worker pool is full
    #[error("Capacity exhausted: {0}")]
    Capacity(CapacityLimit),

    /// Unknown session id
    #[error("Session {0} not found")]
    NotFound(SessionId),

    /// The session deadline elapsed before the requested phase could start
    #[error("Session {0} has expired")]
    SessionExpired(SessionId),

    /// The client disconnected or cancelled the session
    #[error("Measurement cancelled by the client")]
    ClientCancelled,

    /// A phase was requested out of sequence
    #[error("Phase {requested} cannot follow {current}")]
    PhaseOrder { current: Phase, requested: Phase },

    /// A phase was requested while another one is still running
    #[error("Phase {0} is still running")]
    PhaseBusy(Phase),

    /// The client-facing transport failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invariant violation or worker failure
    #[error("Internal error: {0}")]
    Internal(String),
}

/// The error taxonomy as seen by API clients
///
/// `StalledTransfer` is only reported in-band on a throughput result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Capacity,
    NotFound,
    Timeout,
    StalledTransfer,
    ClientCancelled,
    PhaseOrder,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Capacity => "Capacity",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::StalledTransfer => "StalledTransfer",
            ErrorKind::ClientCancelled => "ClientCancelled",
            ErrorKind::PhaseOrder => "PhaseOrder",
            ErrorKind::Internal => "Internal",
        };
        f.write_str(name)
    }
}

impl SpeedTestError {
    /// Classify this error for API responses and session outcomes
    pub fn kind(&self) -> ErrorKind {
        match self {
            SpeedTestError::Capacity(_) => ErrorKind::Capacity,
            SpeedTestError::NotFound(_) => ErrorKind::NotFound,
            SpeedTestError::SessionExpired(_) => ErrorKind::Timeout,
            SpeedTestError::ClientCancelled | SpeedTestError::Transport(_) => {
                ErrorKind::ClientCancelled
            }
            SpeedTestError::PhaseOrder { .. } | SpeedTestError::PhaseBusy(_) => {
                ErrorKind::PhaseOrder
            }
            SpeedTestError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a client can reasonably retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(self, SpeedTestError::Capacity(_))
    }
}

/// Result type for speedtest operations
pub type Result<T> = std::result::Result<T, SpeedTestError>;
