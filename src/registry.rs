//! # Session Registry
//!
//! Tracks every active session and enforces the capacity caps. Admission
//! checks and slot bookkeeping happen under one lock, so concurrent opens
//! can never push the server past `max_sessions` or a client past
//! `max_per_client`.

use crate::error::{CapacityLimit, Result, SpeedTestError};
use crate::session::{ClientId, Session, SessionId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Admission caps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryLimits {
    pub max_sessions: usize,
    pub max_per_client: usize,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            max_sessions: crate::defaults::MAX_SESSIONS,
            max_per_client: crate::defaults::MAX_SESSIONS_PER_CLIENT,
        }
    }
}

/// Slot usage at one point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Occupancy {
    pub active: usize,
    pub capacity: usize,
    pub clients: usize,
}

#[derive(Default)]
struct Slots {
    sessions: HashMap<SessionId, Arc<Session>>,
    per_client: HashMap<ClientId, usize>,
}

pub struct SessionRegistry {
    limits: RegistryLimits,
    slots: Mutex<Slots>,
}

impl SessionRegistry {
    pub fn new(limits: RegistryLimits) -> Self {
        Self {
            limits,
            slots: Mutex::new(Slots::default()),
        }
    }

    pub fn limits(&self) -> RegistryLimits {
        self.limits
    }

    /// Admit a new session for `client`, or fail with `Capacity`
    pub fn open(&self, client: ClientId, timeout: Duration) -> Result<Arc<Session>> {
        let mut slots = self.slots.lock();

        if slots.sessions.len() >= self.limits.max_sessions {
            debug!("Rejecting session for {}: server full", client);
            return Err(SpeedTestError::Capacity(CapacityLimit::Global(
                self.limits.max_sessions,
            )));
        }
        let held = slots.per_client.get(&client).copied().unwrap_or(0);
        if held >= self.limits.max_per_client {
            debug!("Rejecting session for {}: {} already active", client, held);
            return Err(SpeedTestError::Capacity(CapacityLimit::PerClient(
                self.limits.max_per_client,
            )));
        }

        let session = Arc::new(Session::new(client.clone(), timeout));
        slots.sessions.insert(session.id(), Arc::clone(&session));
        *slots.per_client.entry(client).or_insert(0) += 1;
        Ok(session)
    }

    /// Release a session's slot. Closing an unknown id is a no-op.
    pub fn close(&self, id: SessionId) -> bool {
        let mut slots = self.slots.lock();
        let Some(session) = slots.sessions.remove(&id) else {
            return false;
        };

        let client = session.client();
        match slots.per_client.get_mut(client) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                slots.per_client.remove(client);
            }
            None => warn!("Session {} had no slot for client {}", id, client),
        }
        true
    }

    pub fn get(&self, id: SessionId) -> Result<Arc<Session>> {
        self.slots
            .lock()
            .sessions
            .get(&id)
            .cloned()
            .ok_or(SpeedTestError::NotFound(id))
    }

    pub fn occupancy(&self) -> Occupancy {
        let slots = self.slots.lock();
        Occupancy {
            active: slots.sessions.len(),
            capacity: self.limits.max_sessions,
            clients: slots.per_client.len(),
        }
    }

    pub fn active_for(&self, client: &ClientId) -> usize {
        self.slots
            .lock()
            .per_client
            .get(client)
            .copied()
            .unwrap_or(0)
    }

    /// Every active session
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.slots.lock().sessions.values().cloned().collect()
    }

    /// Sessions whose deadline is at or before `now`
    pub fn expired(&self, now: Instant) -> Vec<Arc<Session>> {
        self.slots
            .lock()
            .sessions
            .values()
            .filter(|s| s.is_expired_at(now))
            .cloned()
            .collect()
    }
}
