// ── Bounded reading buffer ──
//
// Single producer (the dispatch loop), any number of consumers, usable from
// both OS threads (condvar) and async tasks (notify). Overflow drops the
// newest arrival. Stop and failure are terminal, but consumers always drain
// what is already queued before they observe either.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::error::CoreError;
use crate::model::Reading;

/// Outcome of waiting for the next reading.
#[derive(Debug)]
pub(crate) enum Next {
    Reading(Reading),
    /// Stopped and fully drained.
    Stopped,
    /// Failed and fully drained.
    Failed(CoreError),
    TimedOut,
}

#[derive(Default)]
struct State {
    queue: VecDeque<Reading>,
    stopped: bool,
    error: Option<CoreError>,
    dropped: u64,
    dropped_since_warning: u64,
    last_warning: Option<Instant>,
    warnings: u64,
}

impl State {
    fn take(&mut self) -> Option<Next> {
        if let Some(reading) = self.queue.pop_front() {
            return Some(Next::Reading(reading));
        }
        if let Some(e) = &self.error {
            return Some(Next::Failed(e.clone()));
        }
        self.stopped.then_some(Next::Stopped)
    }
}

pub(crate) struct ReadingBuffer {
    state: Mutex<State>,
    ready: Condvar,
    notify: Notify,
    capacity: usize,
    warning_interval: Duration,
}

impl ReadingBuffer {
    pub(crate) fn new(capacity: usize, warning_interval: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            ready: Condvar::new(),
            notify: Notify::new(),
            capacity: capacity.max(1),
            warning_interval,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake(&self) {
        self.ready.notify_all();
        self.notify.notify_waiters();
    }

    // ── Producer side ──

    /// Queue a reading. Returns `false` if it was dropped, either because
    /// the buffer is full or because the subscription already ended.
    pub(crate) fn push(&self, reading: Reading) -> bool {
        let mut state = self.lock();
        if state.stopped {
            return false;
        }
        if state.queue.len() >= self.capacity {
            state.dropped += 1;
            state.dropped_since_warning += 1;
            let due = state
                .last_warning
                .is_none_or(|at| at.elapsed() >= self.warning_interval);
            if due {
                tracing::warn!(
                    dropped = state.dropped_since_warning,
                    total_dropped = state.dropped,
                    capacity = self.capacity,
                    "subscription buffer full, dropping newest readings"
                );
                state.warnings += 1;
                state.dropped_since_warning = 0;
                state.last_warning = Some(Instant::now());
            }
            return false;
        }
        state.queue.push_back(reading);
        drop(state);
        self.wake();
        true
    }

    /// End the subscription normally. Returns `false` if already ended.
    pub(crate) fn stop(&self) -> bool {
        let mut state = self.lock();
        if state.stopped {
            return false;
        }
        state.stopped = true;
        drop(state);
        self.wake();
        true
    }

    /// End the subscription with `error`. Ignored once ended, so the first
    /// error wins and a user stop is never turned into a failure.
    pub(crate) fn fail(&self, error: CoreError) -> bool {
        let mut state = self.lock();
        if state.stopped {
            return false;
        }
        state.stopped = true;
        state.error = Some(error);
        drop(state);
        self.wake();
        true
    }

    // ── Consumer side ──

    /// Block the current thread for the next reading. `None` waits
    /// indefinitely; a zero timeout only drains what is queued.
    pub(crate) fn next_blocking(&self, timeout: Option<Duration>) -> Next {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock();
        loop {
            if let Some(next) = state.take() {
                return next;
            }
            state = match deadline {
                None => self
                    .ready
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Next::TimedOut;
                    }
                    self.ready
                        .wait_timeout(state, left)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Async counterpart of [`next_blocking`](Self::next_blocking).
    pub(crate) async fn next_async(&self, timeout: Option<Duration>) -> Next {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(next) = self.lock().take() {
                return next;
            }
            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Next::TimedOut;
                    }
                }
            }
        }
    }

    // ── Introspection ──

    pub(crate) fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    pub(crate) fn error(&self) -> Option<CoreError> {
        self.lock().error.clone()
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    pub(crate) fn drop_warnings(&self) -> u64 {
        self.lock().warnings
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().queue.len()
    }
}
