use crate::latency::LatencyResult;
use crate::session::{ClientId, Outcome, Phase, PhaseTransition, Session, SessionId};
use crate::throughput::ThroughputResult;
use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// How complete a measurement is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Partial,
    Failed,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Success => write!(f, "success"),
            Status::Partial => write!(f, "partial"),
            Status::Failed => write!(f, "failed"),
        }
    }
}

/// Identifies the server instance that produced a result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerIdentity {
    pub server_id: Uuid,
    pub name: String,
    pub version: String,
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
}

impl ServerIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            server_id: Uuid::new_v4(),
            name: name.into(),
            version: crate::VERSION.to_string(),
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: crate::utils::get_cpu_cores(),
        }
    }
}

impl Default for ServerIdentity {
    fn default() -> Self {
        Self::new(crate::defaults::SERVER_NAME)
    }
}

/// Aggregated result of a session, as returned to clients
///
/// The top-level `pingMs`, `jitterMs`, `downloadBps` and `uploadBps` fields
/// are the headline numbers; the per-phase details sit next to them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub session_id: SessionId,
    pub client: ClientId,
    pub status: Status,
    pub phase: Phase,
    /// `None` while the session is still running
    pub outcome: Option<Outcome>,
    pub ping_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub download_bps: Option<u64>,
    pub upload_bps: Option<u64>,
    pub sample_count: usize,
    pub latency: Option<LatencyResult>,
    pub download: Option<ThroughputResult>,
    pub upload: Option<ThroughputResult>,
    pub transitions: Vec<PhaseTransition>,
    pub server: ServerIdentity,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

impl ResultRecord {
    /// Build a record from the session's current state
    pub fn from_session(session: &Session, server: &ServerIdentity) -> Self {
        let snapshot = session.snapshot();
        let measurements = snapshot.measurements;

        let ping_ms = measurements.latency.as_ref().and_then(LatencyResult::ping_ms);
        let jitter_ms = measurements
            .latency
            .as_ref()
            .and_then(LatencyResult::jitter_ms);
        let download_bps = measurements
            .download
            .as_ref()
            .and_then(|r| r.bits_per_second);
        let upload_bps = measurements.upload.as_ref().and_then(|r| r.bits_per_second);

        let any_value =
            ping_ms.is_some() || download_bps.is_some() || upload_bps.is_some();
        let all_clean = measurements
            .latency
            .as_ref()
            .is_some_and(|r| r.status == Status::Success)
            && [&measurements.download, &measurements.upload]
                .iter()
                .all(|r| r.as_ref().is_some_and(|r| r.status == Status::Success));

        let status = match &snapshot.outcome {
            Some(Outcome::Completed) if all_clean => Status::Success,
            _ if any_value => Status::Partial,
            Some(_) => Status::Failed,
            None => Status::Partial,
        };

        Self {
            session_id: session.id(),
            client: session.client().clone(),
            status,
            phase: snapshot.phase,
            outcome: snapshot.outcome,
            ping_ms,
            jitter_ms,
            download_bps,
            upload_bps,
            sample_count: measurements
                .latency
                .as_ref()
                .map(|r| r.sample_count)
                .unwrap_or(0),
            latency: measurements.latency,
            download: measurements.download,
            upload: measurements.upload,
            transitions: snapshot.transitions,
            server: server.clone(),
            created_at: session.created_at(),
            deadline: session.deadline_utc(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }
}

/// Finished results kept around for late `/result` requests
///
/// Bounded both by age and by count; the oldest entries go first.
pub struct ResultArchive {
    retention: Duration,
    capacity: usize,
    inner: Mutex<ArchiveInner>,
}

#[derive(Default)]
struct ArchiveInner {
    order: VecDeque<(Instant, SessionId)>,
    records: HashMap<SessionId, ResultRecord>,
}

impl ResultArchive {
    pub fn new(retention: Duration, capacity: usize) -> Self {
        Self {
            retention,
            capacity: capacity.max(1),
            inner: Mutex::new(ArchiveInner::default()),
        }
    }

    pub fn insert(&self, record: ResultRecord) {
        let mut inner = self.inner.lock();
        while inner.records.len() >= self.capacity {
            match inner.order.pop_front() {
                Some((_, oldest)) => {
                    inner.records.remove(&oldest);
                }
                None => break,
            }
        }
        inner.order.push_back((Instant::now(), record.session_id));
        inner.records.insert(record.session_id, record);
    }

    pub fn get(&self, id: SessionId) -> Option<ResultRecord> {
        self.inner.lock().records.get(&id).cloned()
    }

    /// Drop records older than the retention period; returns how many went
    pub fn prune(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock();
        let mut removed = 0;
        while let Some(&(stored, id)) = inner.order.front() {
            if now.saturating_duration_since(stored) < self.retention {
                break;
            }
            inner.order.pop_front();
            inner.records.remove(&id);
            removed += 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Append-only log of finished results, one JSON object per line
pub struct ResultsLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl ResultsLog {
    /// Open (or create) the log file for appending
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        debug!("Streaming results to: {:?}", path);
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one record as a single line
    pub fn append(&self, record: &ResultRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let mut file = self.file.lock();
        writeln!(file, "{}", json)?;
        file.flush()?;
        Ok(())
    }
}
