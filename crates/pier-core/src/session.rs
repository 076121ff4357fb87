use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

use crate::{
    error::{SignalError, SignalResult},
    ids::generate_callee_id,
    notifier::{ListNotifier, ValueNotifier},
};

/// Opaque negotiation payload (session description or ICE candidate).
pub type Payload = serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Joined,
    Answered,
    Completed,
    Expired,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Expired)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Joined => "joined",
            SessionState::Answered => "answered",
            SessionState::Completed => "completed",
            SessionState::Expired => "expired",
        }
    }
}

/// Which end of the handshake an operation acts for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Peer {
    Caller,
    Callee(String),
}

impl Peer {
    pub fn callee(id: impl Into<String>) -> Self {
        Peer::Callee(id.into())
    }

    pub fn role(&self) -> &'static str {
        match self {
            Peer::Caller => "caller",
            Peer::Callee(_) => "callee",
        }
    }
}

/// One notifier per negotiation slot.
#[derive(Debug, Default)]
pub struct Mailbox {
    pub offer: ValueNotifier<Payload>,
    pub answer: ValueNotifier<Payload>,
    pub caller_candidates: ListNotifier<Payload>,
    pub callee_candidates: ListNotifier<Payload>,
    pub done: ValueNotifier<()>,
}

impl Mailbox {
    /// Candidates sent by `peer`.
    pub fn outgoing(&self, peer: &Peer) -> &ListNotifier<Payload> {
        match peer {
            Peer::Caller => &self.caller_candidates,
            Peer::Callee(_) => &self.callee_candidates,
        }
    }

    /// Candidates addressed to `peer`.
    pub fn incoming(&self, peer: &Peer) -> &ListNotifier<Payload> {
        match peer {
            Peer::Caller => &self.callee_candidates,
            Peer::Callee(_) => &self.caller_candidates,
        }
    }

    fn close_negotiation(&self) {
        self.offer.close();
        self.answer.close();
        self.caller_candidates.close();
        self.callee_candidates.close();
    }

    fn close_all(&self) {
        self.close_negotiation();
        self.done.close();
    }
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    callee_id: Option<String>,
    removed: bool,
}

/// State for a single caller/callee handshake.
///
/// Every mutation takes the session lock, and mailbox deposits happen while
/// it is held, so teardown never observes a half-applied operation.
#[derive(Debug)]
pub struct Session {
    id: String,
    created_at: Instant,
    created_at_utc: DateTime<Utc>,
    mailbox: Mailbox,
    inner: Mutex<SessionInner>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingSlots {
    pub offer: bool,
    pub answer: bool,
    pub caller_candidates: bool,
    pub callee_candidates: bool,
    pub done: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub age_ms: u64,
    pub callee_joined: bool,
    pub pending: PendingSlots,
}

impl Session {
    pub fn new(id: String, offer: Payload, now: Instant) -> Self {
        let mailbox = Mailbox::default();
        // A fresh notifier cannot be closed yet.
        let _ = mailbox.offer.deposit(offer);
        Self {
            id,
            created_at: now,
            created_at_utc: Utc::now(),
            mailbox,
            inner: Mutex::new(SessionInner {
                state: SessionState::Created,
                callee_id: None,
                removed: false,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn is_removed(&self) -> bool {
        self.inner.lock().removed
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    pub fn is_expired(&self, now: Instant, lifetime: Duration) -> bool {
        self.age(now) >= lifetime
    }

    /// Assigns the callee identity. Only the first caller of `join` wins.
    pub fn join(&self) -> SignalResult<String> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;
        if inner.callee_id.is_some() {
            return Err(SignalError::conflict("session already joined"));
        }
        let callee_id = generate_callee_id();
        inner.callee_id = Some(callee_id.clone());
        inner.state = SessionState::Joined;
        Ok(callee_id)
    }

    pub fn answer(&self, callee_id: &str, answer: Payload) -> SignalResult<()> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;
        inner.ensure_callee(callee_id)?;
        if inner.state != SessionState::Joined {
            return Err(SignalError::conflict("answer already posted"));
        }
        self.mailbox
            .answer
            .deposit(answer)
            .map_err(|_| SignalError::NotFound)?;
        inner.state = SessionState::Answered;
        Ok(())
    }

    pub fn add_candidate(&self, peer: &Peer, candidate: Payload) -> SignalResult<()> {
        let inner = self.inner.lock();
        inner.ensure_open()?;
        inner.ensure_peer(peer)?;
        if inner.state == SessionState::Created {
            return Err(SignalError::NotJoined);
        }
        self.mailbox
            .outgoing(peer)
            .deposit(candidate)
            .map_err(|_| SignalError::NotFound)
    }

    /// Records that the callee's data channel is open. Outstanding
    /// negotiation waits are released; only the `done` slot stays readable.
    pub fn complete(&self, callee_id: &str) -> SignalResult<()> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;
        inner.ensure_callee(callee_id)?;
        self.mailbox
            .done
            .deposit(())
            .map_err(|_| SignalError::NotFound)?;
        inner.state = SessionState::Completed;
        self.mailbox.close_negotiation();
        Ok(())
    }

    /// Checks that `peer` may read from this session right now.
    pub fn authorize(&self, peer: &Peer) -> SignalResult<()> {
        let inner = self.inner.lock();
        inner.ensure_open()?;
        inner.ensure_peer(peer)
    }

    /// Checks that the `done` slot can still be awaited.
    pub fn authorize_done(&self) -> SignalResult<()> {
        let inner = self.inner.lock();
        if inner.removed {
            return Err(SignalError::NotFound);
        }
        Ok(())
    }

    /// Moves the session into a terminal state and releases every waiter.
    /// Returns `false` if another path already tore it down.
    pub fn teardown(&self, terminal: SessionState) -> bool {
        debug_assert!(terminal.is_terminal());
        let mut inner = self.inner.lock();
        if inner.removed {
            return false;
        }
        self.release(&mut inner, terminal);
        true
    }

    /// Like [`teardown`](Self::teardown), but leaves a completed session
    /// alone so its `done` can still be collected.
    pub fn teardown_unfinished(&self, terminal: SessionState) -> bool {
        debug_assert!(terminal.is_terminal());
        let mut inner = self.inner.lock();
        if inner.removed || inner.state == SessionState::Completed {
            return false;
        }
        self.release(&mut inner, terminal);
        true
    }

    fn release(&self, inner: &mut SessionInner, terminal: SessionState) {
        inner.removed = true;
        if inner.state != SessionState::Completed {
            inner.state = terminal;
        }
        self.mailbox.close_all();
    }

    pub fn snapshot(&self, now: Instant) -> SessionSnapshot {
        let inner = self.inner.lock();
        SessionSnapshot {
            session_id: self.id.clone(),
            state: inner.state,
            created_at: self.created_at_utc,
            age_ms: self.age(now).as_millis() as u64,
            callee_joined: inner.callee_id.is_some(),
            pending: PendingSlots {
                offer: self.mailbox.offer.pending(),
                answer: self.mailbox.answer.pending(),
                caller_candidates: self.mailbox.caller_candidates.pending(),
                callee_candidates: self.mailbox.callee_candidates.pending(),
                done: self.mailbox.done.pending(),
            },
        }
    }
}

impl SessionInner {
    /// Terminal sessions look absent to everything except `awaitDone`.
    fn ensure_open(&self) -> SignalResult<()> {
        if self.removed || self.state.is_terminal() {
            return Err(SignalError::NotFound);
        }
        Ok(())
    }

    fn ensure_callee(&self, callee_id: &str) -> SignalResult<()> {
        match self.callee_id.as_deref() {
            Some(assigned) if assigned == callee_id => Ok(()),
            _ => Err(SignalError::conflict("callee id does not match this session")),
        }
    }

    fn ensure_peer(&self, peer: &Peer) -> SignalResult<()> {
        match peer {
            Peer::Caller => Ok(()),
            Peer::Callee(callee_id) => self.ensure_callee(callee_id),
        }
    }
}
