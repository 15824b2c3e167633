//! Subscription engine shared by the async and blocking clients.
//!
//! A subscription owns one dedicated session that streams replies into a
//! bounded [`ReadingBuffer`](buffer::ReadingBuffer). Consumers either pull
//! from the buffer or register a callback that a separate delivery loop
//! invokes once per reading. The drivers in [`crate::client`] and
//! [`crate::blocking`] decide where the dispatch and delivery loops run.

pub(crate) mod buffer;
pub(crate) mod dispatch;

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use dpmlink_api::{DeviceRequest, Session};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use self::buffer::{Next, ReadingBuffer};
use crate::config::ClientConfig;
use crate::error::CoreError;
use crate::model::Reading;
use crate::operations;
use crate::pool::SessionPool;

/// Error a callback may return; it is reported, never propagated.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Per-reading callback.
pub type Callback = Box<dyn FnMut(Reading) -> Result<(), CallbackError> + Send>;

/// Receives callback failures and the subscription's terminal error.
pub type ErrorHandler = Box<dyn FnMut(CoreError) + Send>;

// ── SubscriptionHandle ──────────────────────────────────────────────

/// State and control shared by every subscription driver.
#[derive(Clone)]
pub struct SubscriptionHandle {
    requests: Arc<[DeviceRequest]>,
    buffer: Arc<ReadingBuffer>,
    cancel: CancellationToken,
    callback_mode: bool,
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("requests", &self.requests.len())
            .field("stopped", &self.stopped())
            .field("dropped", &self.dropped())
            .field("callback_mode", &self.callback_mode)
            .finish()
    }
}

impl SubscriptionHandle {
    /// The device requests this subscription was opened with.
    pub fn requests(&self) -> &[DeviceRequest] {
        &self.requests
    }

    pub fn stopped(&self) -> bool {
        self.buffer.is_stopped()
    }

    /// Terminal error, if the subscription died.
    pub fn error(&self) -> Option<CoreError> {
        self.buffer.error()
    }

    /// Readings discarded because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.buffer.dropped()
    }

    /// Overflow warnings emitted so far.
    pub fn drop_warnings(&self) -> u64 {
        self.buffer.drop_warnings()
    }

    /// Readings waiting to be consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_callback_mode(&self) -> bool {
        self.callback_mode
    }

    /// Signal the dispatch loop to stop. Readers drain what is queued and
    /// then finish. Idempotent.
    pub fn stop(&self) {
        if self.buffer.stop() {
            tracing::debug!(requests = self.requests.len(), "subscription stop requested");
        }
        self.cancel.cancel();
    }

    /// Next reading, blocking the current thread. `Ok(None)` once the
    /// subscription has stopped and drained, or when `timeout` expires.
    pub(crate) fn next_blocking(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<Reading>, CoreError> {
        self.ensure_iterable()?;
        match self.buffer.next_blocking(timeout) {
            Next::Reading(r) => Ok(Some(r)),
            Next::Stopped | Next::TimedOut => Ok(None),
            Next::Failed(e) => Err(e),
        }
    }

    /// Next reading. `Ok(None)` once stopped and drained; expiry of
    /// `timeout` is a [`CoreError::Timeout`].
    pub(crate) async fn next_async(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<Reading>, CoreError> {
        self.ensure_iterable()?;
        match self.buffer.next_async(timeout).await {
            Next::Reading(r) => Ok(Some(r)),
            Next::Stopped => Ok(None),
            Next::Failed(e) => Err(e),
            Next::TimedOut => Err(CoreError::Timeout {
                timeout_ms: timeout
                    .map_or(0, |t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
            }),
        }
    }

    fn ensure_iterable(&self) -> Result<(), CoreError> {
        if self.callback_mode {
            return Err(CoreError::CallbackMode);
        }
        Ok(())
    }

    pub(crate) fn buffer(&self) -> Arc<ReadingBuffer> {
        Arc::clone(&self.buffer)
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

// ── Opening ─────────────────────────────────────────────────────────

/// A subscription whose list is started, ready for its dispatch loop.
pub(crate) struct Opened {
    pub handle: SubscriptionHandle,
    /// `None` when every add failed; the handle is then already stopped.
    pub session: Option<Session>,
}

/// Acquire a dedicated session, register `requests` and start streaming.
/// Add failures are delivered as failed readings ahead of any data.
pub(crate) async fn open(
    pool: &SessionPool,
    config: &ClientConfig,
    requests: Vec<DeviceRequest>,
    callback_mode: bool,
) -> Result<Opened, CoreError> {
    let deadline = Instant::now() + config.timeout;
    let started = operations::open_subscription(pool, &requests, deadline).await?;

    let handle = SubscriptionHandle {
        requests: requests.into(),
        buffer: Arc::new(ReadingBuffer::new(
            config.buffer_capacity,
            config.drop_warning_interval,
        )),
        cancel: CancellationToken::new(),
        callback_mode,
    };
    for failure in started.failures {
        handle.buffer.push(failure);
    }
    if started.session.is_none() {
        tracing::debug!("no subscription entries accepted, nothing to stream");
        handle.buffer.stop();
    }
    Ok(Opened {
        handle,
        session: started.session,
    })
}

// ── Callback delivery ───────────────────────────────────────────────

/// Drain `buffer` into `callback` until the subscription ends. Runs on a
/// thread of its own; a failing or panicking callback is reported and
/// delivery continues.
pub(crate) fn deliver(
    buffer: &ReadingBuffer,
    mut callback: Callback,
    mut on_error: Option<ErrorHandler>,
) {
    loop {
        match buffer.next_blocking(None) {
            Next::Reading(reading) => {
                let device = reading.device().to_owned();
                let failure = match panic::catch_unwind(AssertUnwindSafe(|| callback(reading))) {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(payload) => {
                        Some(format!("callback panicked: {}", panic_message(&*payload)))
                    }
                };
                if let Some(message) = failure {
                    report(
                        &mut on_error,
                        CoreError::Callback {
                            message: format!("{device}: {message}"),
                        },
                    );
                }
            }
            Next::Failed(e) => {
                if let Some(handler) = on_error.as_mut() {
                    handler(e);
                }
                break;
            }
            Next::Stopped | Next::TimedOut => break,
        }
    }
    tracing::debug!("callback delivery finished");
}

fn report(on_error: &mut Option<ErrorHandler>, error: CoreError) {
    match on_error {
        Some(handler) => handler(error),
        None => tracing::warn!(error = %error, "subscription callback failed"),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".into()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use dpmlink_api::{Status, Value};

    use super::*;

    fn reading(v: f64) -> Reading {
        Reading::from_reply(DeviceRequest::new("M:OUTTMP"), Status::OK, 0, Value::Scalar(v))
    }

    fn handle(callback_mode: bool) -> SubscriptionHandle {
        SubscriptionHandle {
            requests: vec![DeviceRequest::new("M:OUTTMP")].into(),
            buffer: Arc::new(ReadingBuffer::new(16, Duration::from_secs(5))),
            cancel: CancellationToken::new(),
            callback_mode,
        }
    }

    #[test]
    fn iterating_callback_subscription_is_an_error() {
        let h = handle(true);
        assert!(matches!(
            h.next_blocking(Some(Duration::ZERO)),
            Err(CoreError::CallbackMode)
        ));
    }

    #[test]
    fn stop_cancels_dispatch_and_is_idempotent() {
        let h = handle(false);
        h.stop();
        h.stop();
        assert!(h.stopped());
        assert!(h.cancel_token().is_cancelled());
        assert!(h.error().is_none());
        assert_eq!(h.next_blocking(None).unwrap(), None);
    }

    #[test]
    fn callback_failures_and_panics_are_reported_not_fatal() {
        let h = handle(true);
        for v in [1.0, 2.0, 3.0] {
            h.buffer.push(reading(v));
        }
        h.buffer.stop();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let callback: Callback = {
            let seen = Arc::clone(&seen);
            Box::new(move |r: Reading| {
                let calls = {
                    let mut seen = seen.lock().unwrap();
                    seen.push(r.value.as_scalar().unwrap_or_default());
                    seen.len()
                };
                match calls {
                    1 => Err("bad reading".into()),
                    2 => panic!("boom"),
                    _ => Ok(()),
                }
            })
        };
        let on_error: ErrorHandler = {
            let errors = Arc::clone(&errors);
            Box::new(move |e| errors.lock().unwrap().push(e.to_string()))
        };

        deliver(&h.buffer, callback, Some(on_error));

        assert_eq!(*seen.lock().unwrap(), vec![1.0, 2.0, 3.0]);
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("bad reading"), "{errors:?}");
        assert!(errors[1].contains("boom"), "{errors:?}");
    }

    #[test]
    fn terminal_error_reaches_error_handler() {
        let h = handle(true);
        h.buffer.fail(CoreError::ConnectionLost {
            reason: "reset".into(),
        });
        let errors = Arc::new(Mutex::new(Vec::new()));
        let on_error: ErrorHandler = {
            let errors = Arc::clone(&errors);
            Box::new(move |e| errors.lock().unwrap().push(e))
        };
        deliver(&h.buffer, Box::new(|_| Ok(())), Some(on_error));
        assert!(matches!(
            errors.lock().unwrap().as_slice(),
            [CoreError::ConnectionLost { .. }]
        ));
    }
}
