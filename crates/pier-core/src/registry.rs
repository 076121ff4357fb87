use std::{sync::Arc, time::Duration};

use dashmap::{mapref::entry::Entry, DashMap};
use metrics::{counter, gauge};
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, info};

use crate::{
    clock::{Clock, SystemClock},
    error::{SignalError, SignalResult},
    ids::{generate_session_id, is_well_formed},
    notifier::{Notifier, Slot, WaitError},
    session::{Payload, Peer, Session, SessionSnapshot, SessionState},
};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Per-wait timeout for the offer, answer and done slots. Generous enough
    /// for a human to scan a QR code between steps.
    pub rendezvous_timeout: Duration,
    /// Per-wait timeout for steady-state candidate polling.
    pub candidate_timeout: Duration,
    /// Absolute lifetime of a session, counted from creation.
    pub session_lifetime: Duration,
    pub reap_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            rendezvous_timeout: Duration::from_secs(60),
            candidate_timeout: Duration::from_secs(10),
            session_lifetime: Duration::from_secs(120),
            reap_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Completed,
    Expired,
    Disconnected,
}

impl CloseReason {
    pub fn label(self) -> &'static str {
        match self {
            CloseReason::Completed => "completed",
            CloseReason::Expired => "expired",
            CloseReason::Disconnected => "disconnected",
        }
    }

    fn terminal_state(self) -> SessionState {
        match self {
            CloseReason::Completed => SessionState::Completed,
            CloseReason::Expired | CloseReason::Disconnected => SessionState::Expired,
        }
    }
}

/// Owner of every live handshake session.
///
/// Cheap to clone; all clones share the same table. Operations resolve the
/// session by id each time and never hold a map guard across an await.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    sessions: DashMap<String, Arc<Session>>,
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RegistryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: DashMap::new(),
                config,
                clock,
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    fn now(&self) -> Instant {
        self.inner.clock.now()
    }

    /// Creates a session holding the caller's offer and returns its id.
    pub fn create_session(&self, offer: Payload) -> String {
        let now = self.now();
        loop {
            let session_id = generate_session_id();
            match self.inner.sessions.entry(session_id.clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(entry) => {
                    entry.insert(Arc::new(Session::new(session_id.clone(), offer, now)));
                    counter!("pier_sessions_created_total", 1);
                    gauge!("pier_sessions_active", self.inner.sessions.len() as f64);
                    info!(session_id = %session_id, "session created");
                    return session_id;
                }
            }
        }
    }

    pub fn join_session(&self, session_id: &str) -> SignalResult<String> {
        let session = self.resolve(session_id)?;
        match session.join() {
            Ok(callee_id) => {
                info!(session_id = %session_id, "callee joined session");
                Ok(callee_id)
            }
            Err(err) => {
                if matches!(err, SignalError::Conflict(_)) {
                    counter!("pier_joins_rejected_total", 1);
                    debug!(session_id = %session_id, "rejected second join");
                }
                Err(err)
            }
        }
    }

    pub fn post_answer(&self, session_id: &str, callee_id: &str, answer: Payload) -> SignalResult<()> {
        let session = self.resolve(session_id)?;
        session.answer(callee_id, answer)?;
        info!(session_id = %session_id, "answer posted");
        Ok(())
    }

    pub fn post_candidate(&self, session_id: &str, peer: &Peer, candidate: Payload) -> SignalResult<()> {
        let session = self.resolve(session_id)?;
        session.add_candidate(peer, candidate)?;
        debug!(session_id = %session_id, from = peer.role(), "ice candidate queued");
        Ok(())
    }

    pub fn mark_done(&self, session_id: &str, callee_id: &str) -> SignalResult<()> {
        let session = self.resolve(session_id)?;
        session.complete(callee_id)?;
        info!(session_id = %session_id, "callee reported data channel open");
        Ok(())
    }

    /// Callee side: reads the caller's offer (consume-once).
    pub async fn await_offer(&self, session_id: &str, callee_id: &str) -> SignalResult<Payload> {
        let session = self.resolve(session_id)?;
        session.authorize(&Peer::callee(callee_id))?;
        let timeout = self.inner.config.rendezvous_timeout;
        self.wait_slot(&session, &session.mailbox().offer, timeout, "offer")
            .await
    }

    /// Caller side: reads the callee's answer (consume-once).
    pub async fn await_answer(&self, session_id: &str) -> SignalResult<Payload> {
        let session = self.resolve(session_id)?;
        session.authorize(&Peer::Caller)?;
        let timeout = self.inner.config.rendezvous_timeout;
        self.wait_slot(&session, &session.mailbox().answer, timeout, "answer")
            .await
    }

    /// Drains the candidates addressed to `peer`.
    pub async fn await_candidates(&self, session_id: &str, peer: &Peer) -> SignalResult<Vec<Payload>> {
        let session = self.resolve(session_id)?;
        session.authorize(peer)?;
        let timeout = self.inner.config.candidate_timeout;
        let label = match peer {
            Peer::Caller => "callee_candidates",
            Peer::Callee(_) => "caller_candidates",
        };
        self.wait_slot(&session, session.mailbox().incoming(peer), timeout, label)
            .await
    }

    /// Caller side: waits for the callee's completion signal and removes the
    /// session once it is observed.
    pub async fn await_done(&self, session_id: &str) -> SignalResult<()> {
        let session = self.resolve(session_id)?;
        session.authorize_done()?;
        let timeout = self.inner.config.rendezvous_timeout;
        self.wait_slot(&session, &session.mailbox().done, timeout, "done")
            .await?;
        self.remove(&session, CloseReason::Completed);
        Ok(())
    }

    /// Tears a session down on behalf of a transport, e.g. on connection loss.
    pub fn close_session(&self, session_id: &str, reason: CloseReason) -> SignalResult<()> {
        let session = self.resolve(session_id)?;
        if self.remove(&session, reason) {
            Ok(())
        } else {
            Err(SignalError::NotFound)
        }
    }

    /// Closes the session unless the callee already reported completion.
    /// Decided under the session lock, so a racing `done` either lands first
    /// and spares the session or is rejected. Returns whether it was closed.
    pub fn close_unless_completed(&self, session_id: &str, reason: CloseReason) -> SignalResult<bool> {
        let session = self.resolve(session_id)?;
        if !session.teardown_unfinished(reason.terminal_state()) {
            return Ok(false);
        }
        self.forget(&session, reason);
        Ok(true)
    }

    pub fn status(&self, session_id: &str) -> SignalResult<SessionSnapshot> {
        let session = self.resolve(session_id)?;
        if session.is_removed() {
            return Err(SignalError::NotFound);
        }
        Ok(session.snapshot(self.now()))
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let now = self.now();
        let sessions: Vec<Arc<Session>> = self
            .inner
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        sessions
            .iter()
            .filter(|session| !session.is_removed())
            .map(|session| session.snapshot(now))
            .collect()
    }

    /// Removes every session that outlived its absolute lifetime.
    pub fn reap(&self) -> usize {
        let now = self.now();
        let lifetime = self.inner.config.session_lifetime;
        let expired: Vec<Arc<Session>> = self
            .inner
            .sessions
            .iter()
            .filter(|entry| entry.value().is_expired(now, lifetime))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        expired
            .iter()
            .filter(|session| self.remove(session, CloseReason::Expired))
            .count()
    }

    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let registry = self.clone();
        let period = self.inner.config.reap_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let reaped = registry.reap();
                if reaped > 0 {
                    debug!(reaped, remaining = registry.len(), "reaped expired sessions");
                }
            }
        })
    }

    fn resolve(&self, session_id: &str) -> SignalResult<Arc<Session>> {
        if !is_well_formed(session_id) {
            return Err(SignalError::NotFound);
        }
        let session = self
            .inner
            .sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(SignalError::NotFound)?;

        if session.is_expired(self.now(), self.inner.config.session_lifetime) {
            self.remove(&session, CloseReason::Expired);
            return Err(SignalError::NotFound);
        }
        Ok(session)
    }

    async fn wait_slot<S: Slot>(
        &self,
        session: &Arc<Session>,
        slot: &Notifier<S>,
        timeout: Duration,
        label: &'static str,
    ) -> SignalResult<S::Output> {
        // Never wait past the session's own deadline.
        let remaining = self
            .inner
            .config
            .session_lifetime
            .saturating_sub(session.age(self.now()));
        match slot.wait(timeout.min(remaining)).await {
            Ok(output) => Ok(output),
            Err(WaitError::Closed) => Err(SignalError::ClosedDuringWait),
            Err(WaitError::TimedOut) => {
                if session.is_expired(self.now(), self.inner.config.session_lifetime) {
                    self.remove(session, CloseReason::Expired);
                    return Err(SignalError::NotFound);
                }
                counter!("pier_wait_timeouts_total", 1, "slot" => label);
                Err(SignalError::Timeout)
            }
        }
    }

    /// Tears the session down and drops it from the table. Only the first
    /// caller for a given session returns `true`.
    fn remove(&self, session: &Arc<Session>, reason: CloseReason) -> bool {
        if !session.teardown(reason.terminal_state()) {
            return false;
        }
        self.forget(session, reason);
        true
    }

    fn forget(&self, session: &Arc<Session>, reason: CloseReason) {
        self.inner
            .sessions
            .remove_if(session.id(), |_, current| Arc::ptr_eq(current, session));
        counter!("pier_sessions_closed_total", 1, "reason" => reason.label());
        gauge!("pier_sessions_active", self.inner.sessions.len() as f64);
        info!(session_id = %session.id(), reason = reason.label(), "session closed");
    }
}
