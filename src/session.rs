//! Session state for one client's speed-test run.
//!
//! A [`Session`] is created by the registry and mutated only by the
//! coordinator. Its phase moves forward along
//! `Init → Latency → Download → Upload → Done`, or jumps to a terminal phase
//! (`Failed`, or `Done` with a `TimedOut` outcome) from anywhere. A terminal
//! session never changes again.

use crate::error::{ErrorKind, Result, SpeedTestError};
use crate::latency::LatencyResult;
use crate::throughput::{Direction, ThroughputResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Opaque unique session token
pub type SessionId = Uuid;

/// Identifies the client a session belongs to (its address)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<IpAddr> for ClientId {
    fn from(addr: IpAddr) -> Self {
        Self(addr.to_string())
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Measurement phases of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Init,
    Latency,
    Download,
    Upload,
    Done,
    Failed,
}

impl Phase {
    /// The phase that follows this one on the normal path
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Init => Some(Phase::Latency),
            Phase::Latency => Some(Phase::Download),
            Phase::Download => Some(Phase::Upload),
            Phase::Upload => Some(Phase::Done),
            Phase::Done | Phase::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Init => "Init",
            Phase::Latency => "Latency",
            Phase::Download => "Download",
            Phase::Upload => "Upload",
            Phase::Done => "Done",
            Phase::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// One recorded phase change, kept for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseTransition {
    pub from: Phase,
    pub to: Phase,
    pub at: DateTime<Utc>,
    /// Milliseconds since the session was created
    pub elapsed_ms: f64,
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Outcome {
    Completed,
    TimedOut,
    Failed { reason: ErrorKind, detail: String },
}

/// Aggregated results of the phases that ran so far
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurements {
    pub latency: Option<LatencyResult>,
    pub download: Option<ThroughputResult>,
    pub upload: Option<ThroughputResult>,
}

/// Bounds handed to a running phase: when it must stop, and how it learns
/// that the client went away.
#[derive(Debug, Clone)]
pub struct PhaseContext {
    pub session_id: SessionId,
    pub phase: Phase,
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

impl PhaseContext {
    pub fn new(
        session_id: SessionId,
        phase: Phase,
        deadline: Instant,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            phase,
            deadline,
            cancel,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Point-in-time copy of a session's mutable state
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub phase: Phase,
    pub busy: bool,
    pub transitions: Vec<PhaseTransition>,
    pub measurements: Measurements,
    pub outcome: Option<Outcome>,
}

#[derive(Debug)]
struct SessionState {
    phase: Phase,
    busy: bool,
    transitions: Vec<PhaseTransition>,
    measurements: Measurements,
    outcome: Option<Outcome>,
}

impl SessionState {
    fn transition(&mut self, to: Phase, started: Instant) {
        self.transitions.push(PhaseTransition {
            from: self.phase,
            to,
            at: Utc::now(),
            elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
        });
        self.phase = to;
    }

    fn terminate(&mut self, to: Phase, outcome: Outcome, started: Instant) -> bool {
        if self.phase.is_terminal() {
            return false;
        }
        self.transition(to, started);
        self.busy = false;
        self.outcome = Some(outcome);
        true
    }
}

/// One client's end-to-end speed test run
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    client: ClientId,
    created_at: DateTime<Utc>,
    started: Instant,
    deadline: Instant,
    deadline_utc: DateTime<Utc>,
    cancel: CancellationToken,
    state: Mutex<SessionState>,
}

impl Session {
    /// Create a session whose lifetime is bounded by `timeout`
    pub fn new(client: ClientId, timeout: Duration) -> Self {
        let started = Instant::now();
        let created_at = Utc::now();
        let deadline_utc = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|d| created_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            id: Uuid::new_v4(),
            client,
            created_at,
            started,
            deadline: started + timeout,
            deadline_utc,
            cancel: CancellationToken::new(),
            state: Mutex::new(SessionState {
                phase: Phase::Init,
                busy: false,
                transitions: Vec::new(),
                measurements: Measurements::default(),
                outcome: None,
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn client(&self) -> &ClientId {
        &self.client
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn deadline_utc(&self) -> DateTime<Utc> {
        self.deadline_utc
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    /// Whether a phase is currently running
    pub fn is_busy(&self) -> bool {
        self.state.lock().busy
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().phase.is_terminal()
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Token cancelled when the whole session is cancelled
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock();
        SessionSnapshot {
            phase: state.phase,
            busy: state.busy,
            transitions: state.transitions.clone(),
            measurements: state.measurements.clone(),
            outcome: state.outcome.clone(),
        }
    }

    /// Start `phase`, which must be the immediate successor of the current one.
    ///
    /// The returned context carries a child of the session's cancellation
    /// token, so cancelling it ends only this phase.
    pub(crate) fn begin(&self, phase: Phase) -> Result<PhaseContext> {
        let mut state = self.state.lock();

        if state.busy {
            return Err(SpeedTestError::PhaseBusy(state.phase));
        }
        if state.phase.is_terminal() || state.phase.next() != Some(phase) || phase == Phase::Done
        {
            return Err(SpeedTestError::PhaseOrder {
                current: state.phase,
                requested: phase,
            });
        }
        if Instant::now() >= self.deadline {
            return Err(SpeedTestError::SessionExpired(self.id));
        }

        state.transition(phase, self.started);
        state.busy = true;

        Ok(PhaseContext::new(
            self.id,
            phase,
            self.deadline,
            self.cancel.child_token(),
        ))
    }

    /// Mark the running phase as finished without leaving it
    pub(crate) fn end_phase(&self) {
        self.state.lock().busy = false;
    }

    pub(crate) fn record_latency(&self, result: LatencyResult) {
        self.state.lock().measurements.latency = Some(result);
    }

    pub(crate) fn record_throughput(&self, result: ThroughputResult) {
        let mut state = self.state.lock();
        match result.direction {
            Direction::Download => state.measurements.download = Some(result),
            Direction::Upload => state.measurements.upload = Some(result),
        }
    }

    /// Finish the normal path: `Upload → Done`.
    ///
    /// Returns `Ok(false)` when the session already reached a terminal phase.
    pub(crate) fn complete(&self) -> Result<bool> {
        let mut state = self.state.lock();
        if state.phase.is_terminal() {
            return Ok(false);
        }
        if state.phase != Phase::Upload {
            return Err(SpeedTestError::PhaseOrder {
                current: state.phase,
                requested: Phase::Done,
            });
        }
        Ok(state.terminate(Phase::Done, Outcome::Completed, self.started))
    }

    /// End the session early because its deadline elapsed
    pub(crate) fn expire(&self) -> bool {
        self.state
            .lock()
            .terminate(Phase::Done, Outcome::TimedOut, self.started)
    }

    /// Move the session to `Failed`. Returns `false` if it had already ended.
    pub(crate) fn fail(&self, reason: ErrorKind, detail: impl Into<String>) -> bool {
        let outcome = Outcome::Failed {
            reason,
            detail: detail.into(),
        };
        self.state
            .lock()
            .terminate(Phase::Failed, outcome, self.started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn session() -> Session {
        Session::new(ClientId::new("127.0.0.1"), Duration::from_secs(30))
    }

    fn run_normal_path(session: &Session) {
        for phase in [Phase::Latency, Phase::Download, Phase::Upload] {
            session.begin(phase).unwrap();
            session.end_phase();
        }
    }

    #[test]
    fn test_phase_successors() {
        assert_eq!(Phase::Init.next(), Some(Phase::Latency));
        assert_eq!(Phase::Upload.next(), Some(Phase::Done));
        assert_eq!(Phase::Done.next(), None);
        assert!(Phase::Failed.is_terminal());
        assert!(!Phase::Download.is_terminal());
    }

    #[tokio::test]
    async fn test_full_lifecycle_records_each_transition() {
        let session = session();
        run_normal_path(&session);
        assert!(session.complete().unwrap());

        let snapshot = session.snapshot();
        let path: Vec<(Phase, Phase)> = snapshot
            .transitions
            .iter()
            .map(|t| (t.from, t.to))
            .collect();
        assert_eq!(
            path,
            vec![
                (Phase::Init, Phase::Latency),
                (Phase::Latency, Phase::Download),
                (Phase::Download, Phase::Upload),
                (Phase::Upload, Phase::Done),
            ]
        );
        assert_eq!(snapshot.outcome, Some(Outcome::Completed));
    }

    #[tokio::test]
    async fn test_out_of_order_phase_is_rejected() {
        let session = session();
        let err = session.begin(Phase::Upload).unwrap_err();
        assert!(matches!(
            err,
            SpeedTestError::PhaseOrder {
                current: Phase::Init,
                requested: Phase::Upload
            }
        ));
        assert_eq!(session.phase(), Phase::Init);
        assert!(session.snapshot().transitions.is_empty());
    }

    #[tokio::test]
    async fn test_overlapping_phases_are_rejected() {
        let session = session();
        session.begin(Phase::Latency).unwrap();
        let err = session.begin(Phase::Download).unwrap_err();
        assert!(matches!(err, SpeedTestError::PhaseBusy(Phase::Latency)));
    }

    #[tokio::test]
    async fn test_terminal_session_never_changes() {
        let session = session();
        session.begin(Phase::Latency).unwrap();
        assert!(session.fail(ErrorKind::ClientCancelled, "gone"));
        assert!(!session.expire());
        assert!(!session.fail(ErrorKind::Internal, "again"));
        assert!(!session.complete().unwrap());
        assert!(session.begin(Phase::Download).is_err());
        assert_eq!(session.phase(), Phase::Failed);
        assert!(!session.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_session_refuses_new_phases() {
        let session = Session::new(ClientId::new("10.0.0.1"), Duration::from_secs(1));
        tokio::time::advance(Duration::from_millis(1500)).await;
        let err = session.begin(Phase::Latency).unwrap_err();
        assert!(matches!(err, SpeedTestError::SessionExpired(_)));
        assert!(session.expire());
        assert_eq!(session.snapshot().outcome, Some(Outcome::TimedOut));
        assert_eq!(session.phase(), Phase::Done);
    }

    #[tokio::test]
    async fn test_phase_context_is_child_of_session_token() {
        let session = session();
        let ctx = session.begin(Phase::Latency).unwrap();
        assert!(!ctx.cancel.is_cancelled());
        session.cancel_token().cancel();
        assert!(ctx.cancel.is_cancelled());
    }

    #[derive(Debug, Clone)]
    enum Event {
        Begin(Phase),
        End,
        Complete,
        Expire,
        Fail,
    }

    fn any_phase() -> impl Strategy<Value = Phase> {
        prop_oneof![
            Just(Phase::Init),
            Just(Phase::Latency),
            Just(Phase::Download),
            Just(Phase::Upload),
            Just(Phase::Done),
            Just(Phase::Failed),
        ]
    }

    fn any_event() -> impl Strategy<Value = Event> {
        prop_oneof![
            4 => any_phase().prop_map(Event::Begin),
            3 => Just(Event::End),
            1 => Just(Event::Complete),
            1 => Just(Event::Expire),
            1 => Just(Event::Fail),
        ]
    }

    fn apply(session: &Session, event: &Event) {
        match event {
            Event::Begin(phase) => {
                let _ = session.begin(*phase);
            }
            Event::End => session.end_phase(),
            Event::Complete => {
                let _ = session.complete();
            }
            Event::Expire => {
                session.expire();
            }
            Event::Fail => {
                session.fail(ErrorKind::Internal, "injected");
            }
        }
    }

    proptest! {
        #[test]
        fn prop_transitions_follow_the_phase_order(events in prop::collection::vec(any_event(), 0..40)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
            let _guard = rt.enter();
            let session = session();
            for event in &events {
                apply(&session, event);
            }

            let transitions = session.snapshot().transitions;
            let mut current = Phase::Init;
            for (i, t) in transitions.iter().enumerate() {
                prop_assert_eq!(t.from, current);
                if t.to.is_terminal() {
                    prop_assert_eq!(i, transitions.len() - 1);
                } else {
                    prop_assert_eq!(Some(t.to), current.next());
                }
                current = t.to;
            }
            prop_assert_eq!(session.phase(), current);
        }

        #[test]
        fn prop_valid_lifecycles_walk_the_full_path(steps in 0usize..=3, finish in 0u8..3) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
            let _guard = rt.enter();
            let session = session();
            let path = [Phase::Latency, Phase::Download, Phase::Upload];
            for phase in &path[..steps] {
                session.begin(*phase).unwrap();
                session.end_phase();
            }
            match (steps, finish) {
                (3, 0) => prop_assert!(session.complete().unwrap()),
                (_, 1) => prop_assert!(session.expire()),
                _ => prop_assert!(session.fail(ErrorKind::ClientCancelled, "cancelled")),
            }

            let targets: Vec<Phase> = session.snapshot().transitions.iter().map(|t| t.to).collect();
            prop_assert_eq!(&targets[..steps], &path[..steps]);
            prop_assert_eq!(targets.len(), steps + 1);
            prop_assert!(targets[steps].is_terminal());
        }
    }
}
