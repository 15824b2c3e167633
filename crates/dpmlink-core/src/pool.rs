// ── Session pool ──
//
// Two idle sets (plain sessions for reads/subscriptions, settings-enabled
// sessions for writes) plus a global cap on pooled sessions open at once.
// Checked-out sessions are wrapped in `PooledSession`; dropping one without
// releasing it discards the session and frees its slot, so a cancelled
// operation can never leak capacity or return a half-used session.
//
// The idle sets are the only shared state. They sit behind a std mutex that
// is never held across an await; waiters for capacity park on a `Notify`.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dpmlink_api::{Connect, CredentialProvider, Session, authenticate};
use strum::Display;
use tokio::sync::Notify;
use tokio::time::{Instant, timeout_at};

use crate::config::ClientConfig;
use crate::error::CoreError;

/// Which idle set a session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum SessionKind {
    /// Unauthenticated; reads and subscriptions.
    Plain,
    /// Settings-enabled; writes.
    Write,
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Pooled sessions open, idle or checked out.
    pub open: usize,
    pub idle_plain: usize,
    pub idle_write: usize,
    pub max_open: usize,
}

// ── Shared state ────────────────────────────────────────────────────

struct IdleSession {
    session: Session,
    /// Release order; breaks ties between equal timestamps.
    seq: u64,
}

impl IdleSession {
    fn age_key(&self) -> (Instant, u64) {
        (self.session.last_used(), self.seq)
    }
}

#[derive(Default)]
struct PoolState {
    /// Oldest at the front.
    plain: VecDeque<IdleSession>,
    write: VecDeque<IdleSession>,
    open: usize,
    seq: u64,
    closed: bool,
}

impl PoolState {
    fn idle(&mut self, kind: SessionKind) -> &mut VecDeque<IdleSession> {
        match kind {
            SessionKind::Plain => &mut self.plain,
            SessionKind::Write => &mut self.write,
        }
    }

    /// Remove the least recently used idle session across both sets.
    fn take_global_lru(&mut self) -> Option<Session> {
        let kind = match (self.plain.front(), self.write.front()) {
            (Some(p), Some(w)) if w.age_key() < p.age_key() => SessionKind::Write,
            (Some(_), _) => SessionKind::Plain,
            (None, Some(_)) => SessionKind::Write,
            (None, None) => return None,
        };
        self.idle(kind).pop_front().map(|idle| idle.session)
    }
}

enum Checkout {
    Reuse(Session),
    /// A slot was reserved; `evicted` must be closed by the caller.
    Create { evicted: Option<Session> },
    Wait,
}

struct PoolInner {
    state: Mutex<PoolState>,
    changed: Notify,
    connector: Arc<dyn Connect>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    plain_capacity: usize,
    write_capacity: usize,
    max_open: usize,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn capacity(&self, kind: SessionKind) -> usize {
        match kind {
            SessionKind::Plain => self.plain_capacity,
            SessionKind::Write => self.write_capacity,
        }
    }

    fn checkout(&self, kind: SessionKind) -> Result<Checkout, CoreError> {
        let mut state = self.lock();
        if state.closed {
            return Err(CoreError::Closed);
        }
        if let Some(idle) = state.idle(kind).pop_back() {
            return Ok(Checkout::Reuse(idle.session));
        }
        if state.open < self.max_open {
            state.open += 1;
            return Ok(Checkout::Create { evicted: None });
        }
        // At the cap: trade the globally least recently used idle session
        // for a new one. The slot count is unchanged.
        Ok(match state.take_global_lru() {
            Some(evicted) => Checkout::Create {
                evicted: Some(evicted),
            },
            None => Checkout::Wait,
        })
    }

    /// Return a session; hand back whatever must now be closed.
    fn check_in(&self, kind: SessionKind, mut session: Session) -> Vec<Session> {
        let mut state = self.lock();
        if state.closed || !session.is_reusable() {
            state.open = state.open.saturating_sub(1);
            drop(state);
            self.changed.notify_one();
            return vec![session];
        }

        session.touch();
        state.seq += 1;
        let seq = state.seq;
        let capacity = self.capacity(kind);
        let idle = state.idle(kind);
        idle.push_back(IdleSession { session, seq });
        let mut evicted = Vec::new();
        while idle.len() > capacity {
            if let Some(oldest) = idle.pop_front() {
                evicted.push(oldest.session);
            }
        }
        state.open = state.open.saturating_sub(evicted.len());
        drop(state);
        self.changed.notify_one();
        evicted
    }

    /// Give up one slot (session discarded, detached, or never created).
    fn forget_slot(&self) {
        let mut state = self.lock();
        state.open = state.open.saturating_sub(1);
        drop(state);
        self.changed.notify_one();
    }
}

// ── SessionPool ─────────────────────────────────────────────────────

/// Per-client pool of protocol sessions. Cheap to clone.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPool")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl SessionPool {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState::default()),
                changed: Notify::new(),
                connector: config.connector(),
                credentials: config.credentials.clone(),
                plain_capacity: config.plain_idle_capacity,
                write_capacity: config.write_idle_capacity,
                max_open: config.max_open.max(1),
            }),
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.inner.credentials.is_some()
    }

    pub fn credentials(&self) -> Option<&Arc<dyn CredentialProvider>> {
        self.inner.credentials.as_ref()
    }

    /// Check out a session of `kind`, creating (and for writes,
    /// authenticating) one if none is idle. Waits for capacity when every
    /// pooled session is checked out, bounded by `deadline`.
    pub async fn acquire(
        &self,
        kind: SessionKind,
        deadline: Instant,
    ) -> Result<PooledSession, CoreError> {
        if kind == SessionKind::Write && !self.has_credentials() {
            return Err(no_credentials());
        }
        let started = Instant::now();
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.inner.checkout(kind)? {
                Checkout::Reuse(session) => {
                    tracing::debug!(session = session.id(), %kind, "reusing idle session");
                    return Ok(PooledSession::new(&self.inner, kind, session));
                }
                Checkout::Create { evicted } => {
                    // Guards the slot from here on, including while the
                    // evicted session is being closed.
                    let reservation = Reservation {
                        pool: Arc::clone(&self.inner),
                        armed: true,
                    };
                    if let Some(mut old) = evicted {
                        tracing::info!(
                            session = old.id(),
                            %kind,
                            "evicting least recently used idle session"
                        );
                        old.close().await;
                    }
                    return self.create(kind, deadline, reservation).await;
                }
                Checkout::Wait => {
                    tracing::trace!(%kind, "pool at capacity, waiting");
                    if timeout_at(deadline, notified).await.is_err() {
                        return Err(CoreError::Timeout {
                            timeout_ms: millis_since(started),
                        });
                    }
                }
            }
        }
    }

    async fn create(
        &self,
        kind: SessionKind,
        deadline: Instant,
        mut reservation: Reservation,
    ) -> Result<PooledSession, CoreError> {
        let session = self.open_session(kind, deadline).await?;
        reservation.armed = false;
        tracing::info!(session = session.id(), %kind, "session created");
        Ok(PooledSession::new(&self.inner, kind, session))
    }

    async fn open_session(
        &self,
        kind: SessionKind,
        deadline: Instant,
    ) -> Result<Session, CoreError> {
        let mut session = Session::connect(self.inner.connector.as_ref(), deadline).await?;
        if kind == SessionKind::Write {
            let credentials = self.inner.credentials.clone().ok_or_else(no_credentials)?;
            if let Err(e) = authenticate(&mut session, credentials, deadline).await {
                session.close().await;
                return Err(e.into());
            }
        }
        Ok(session)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        PoolStats {
            open: state.open,
            idle_plain: state.plain.len(),
            idle_write: state.write.len(),
            max_open: self.inner.max_open,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Close every idle session and refuse further acquires. Sessions
    /// checked out at this point are closed when they come back.
    pub async fn close(&self) {
        let idle: Vec<Session> = {
            let mut guard = self.inner.lock();
            let state = &mut *guard;
            if state.closed {
                return;
            }
            state.closed = true;
            let drained: Vec<Session> = state
                .plain
                .drain(..)
                .chain(state.write.drain(..))
                .map(|idle| idle.session)
                .collect();
            state.open = state.open.saturating_sub(drained.len());
            drained
        };
        self.inner.changed.notify_waiters();
        tracing::debug!(idle = idle.len(), "closing session pool");
        for mut session in idle {
            session.close().await;
        }
    }
}

fn no_credentials() -> CoreError {
    CoreError::AuthenticationFailed {
        message: "no credentials configured for settings".into(),
    }
}

fn millis_since(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Frees a reserved slot if session creation does not complete.
struct Reservation {
    pool: Arc<PoolInner>,
    armed: bool,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            self.pool.forget_slot();
        }
    }
}

// ── PooledSession ───────────────────────────────────────────────────

/// A checked-out session. Must be given back with [`release`](Self::release),
/// [`discard`](Self::discard) or [`detach`](Self::detach); simply dropping it
/// discards the session.
pub struct PooledSession {
    pool: Arc<PoolInner>,
    kind: SessionKind,
    session: Option<Session>,
}

impl PooledSession {
    fn new(pool: &Arc<PoolInner>, kind: SessionKind, session: Session) -> Self {
        Self {
            pool: Arc::clone(pool),
            kind,
            session: Some(session),
        }
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    /// Return the session to its idle set if it is healthy and holds no
    /// list; otherwise close it.
    pub async fn release(mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let id = session.id();
        let to_close = self.pool.check_in(self.kind, session);
        for mut s in to_close {
            if s.id() == id {
                tracing::debug!(session = id, kind = %self.kind, "session not reusable, closing");
            } else {
                tracing::info!(
                    session = s.id(),
                    kind = %self.kind,
                    "idle set full, evicting oldest session"
                );
            }
            s.close().await;
        }
    }

    /// Close the session and free its slot.
    pub async fn discard(mut self) {
        if let Some(mut session) = self.session.take() {
            tracing::debug!(session = session.id(), kind = %self.kind, "discarding session");
            session.close().await;
            self.pool.forget_slot();
        }
    }

    /// Take the session out of the pool for good. It no longer counts
    /// against the pool's cap.
    pub fn detach(mut self) -> Session {
        let session = self.take();
        self.pool.forget_slot();
        session
    }

    fn take(&mut self) -> Session {
        match self.session.take() {
            Some(s) => s,
            None => unreachable!("pooled session already consumed"),
        }
    }
}

impl Deref for PooledSession {
    type Target = Session;

    fn deref(&self) -> &Session {
        match &self.session {
            Some(s) => s,
            None => unreachable!("pooled session already consumed"),
        }
    }
}

impl DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut Session {
        match &mut self.session {
            Some(s) => s,
            None => unreachable!("pooled session already consumed"),
        }
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            tracing::debug!(
                session = session.id(),
                kind = %self.kind,
                "session dropped while checked out, discarding"
            );
            session.abort();
            self.pool.forget_slot();
        }
    }
}

impl fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledSession")
            .field("kind", &self.kind)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}
