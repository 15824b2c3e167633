// ── Async client ──
//
// Facade over one session pool. Reads and writes run on the caller's task;
// each subscription gets a spawned dispatch task, plus a blocking-pool
// thread for callback delivery when a callback is registered.

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dpmlink_api::{DeviceRequest, Value};
use futures_core::Stream;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::ClientConfig;
use crate::error::CoreError;
use crate::model::{Reading, WriteResult};
use crate::operations;
use crate::pool::{PoolStats, SessionPool};
use crate::subscription::{self, Callback, ErrorHandler, SubscriptionHandle, dispatch};

pub(crate) struct ClientInner {
    pub(crate) config: ClientConfig,
    pub(crate) pool: SessionPool,
    /// Live subscriptions, stopped on close.
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
}

impl ClientInner {
    pub(crate) fn track(&self, handle: &SubscriptionHandle) {
        let mut subs = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subs.retain(|h| !h.stopped());
        subs.push(handle.clone());
    }

    fn deadline(&self, timeout: Option<Duration>) -> Instant {
        Instant::now() + timeout.unwrap_or(self.config.timeout)
    }
}

/// Asynchronous DPM client. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("host", &self.inner.config.host)
            .field("port", &self.inner.config.port)
            .field("pool", &self.inner.pool)
            .finish()
    }
}

impl Client {
    /// Create a client. No connection is made until the first call.
    pub fn new(config: ClientConfig) -> Self {
        let pool = SessionPool::new(&config);
        Self {
            inner: Arc::new(ClientInner {
                config,
                pool,
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    // ── Reads ───────────────────────────────────────────────────────

    /// Value of a single device.
    pub async fn read(&self, request: impl Into<DeviceRequest>) -> Result<Value, CoreError> {
        self.get(request).await.map(|r| r.value)
    }

    /// Full reading of a single device; a failed entry is an error.
    pub async fn get(&self, request: impl Into<DeviceRequest>) -> Result<Reading, CoreError> {
        let readings = self.read_many(&[request.into()], None).await?;
        let reading = single(readings)?;
        if reading.is_error() {
            return Err(CoreError::Device {
                device: reading.device().to_owned(),
                status: reading.status,
                message: reading.message().unwrap_or_default(),
            });
        }
        Ok(reading)
    }

    /// Read every request once, in input order. `timeout` defaults to the
    /// configured call timeout.
    pub async fn read_many(
        &self,
        requests: &[DeviceRequest],
        timeout: Option<Duration>,
    ) -> Result<Vec<Reading>, CoreError> {
        let deadline = self.inner.deadline(timeout);
        operations::read_many(&self.inner.pool, requests, deadline).await
    }

    // ── Writes ──────────────────────────────────────────────────────

    /// Write a single device; a failed entry is an error.
    pub async fn write(
        &self,
        request: impl Into<DeviceRequest>,
        value: impl Into<Value>,
    ) -> Result<WriteResult, CoreError> {
        let results = self
            .write_many(&[(request.into(), value.into())], None, None)
            .await?;
        let result = single(results)?;
        if !result.is_ok() {
            return Err(CoreError::Device {
                device: result.device().to_owned(),
                status: result.status,
                message: result.message().unwrap_or_default(),
            });
        }
        Ok(result)
    }

    /// Apply a batch of settings, tagged with `role` (or the configured
    /// default role).
    pub async fn write_many(
        &self,
        settings: &[(DeviceRequest, Value)],
        role: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Vec<WriteResult>, CoreError> {
        let deadline = self.inner.deadline(timeout);
        let role = role
            .map(str::to_owned)
            .or_else(|| self.inner.config.role.clone());
        operations::write_many(&self.inner.pool, settings, role, deadline).await
    }

    // ── Subscriptions ───────────────────────────────────────────────

    /// Stream readings for `requests` until stopped.
    pub async fn subscribe(
        &self,
        requests: Vec<DeviceRequest>,
    ) -> Result<AsyncSubscription, CoreError> {
        let opened =
            subscription::open(&self.inner.pool, &self.inner.config, requests, false).await?;
        let handle = opened.handle;
        let dispatch = opened.session.map(|session| self.spawn_dispatch(&handle, session));
        self.inner.track(&handle);
        Ok(AsyncSubscription {
            handle,
            dispatch,
            delivery: None,
        })
    }

    /// Deliver readings for `requests` to `callback`. Callback failures go
    /// to `on_error` when given, otherwise they are logged.
    pub async fn subscribe_with_callback(
        &self,
        requests: Vec<DeviceRequest>,
        callback: Callback,
        on_error: Option<ErrorHandler>,
    ) -> Result<AsyncSubscription, CoreError> {
        let opened =
            subscription::open(&self.inner.pool, &self.inner.config, requests, true).await?;
        let handle = opened.handle;
        let dispatch = opened.session.map(|session| self.spawn_dispatch(&handle, session));
        let buffer = handle.buffer();
        let delivery =
            tokio::task::spawn_blocking(move || subscription::deliver(&buffer, callback, on_error));
        self.inner.track(&handle);
        Ok(AsyncSubscription {
            handle,
            dispatch,
            delivery: Some(delivery),
        })
    }

    fn spawn_dispatch(
        &self,
        handle: &SubscriptionHandle,
        session: dpmlink_api::Session,
    ) -> JoinHandle<()> {
        tokio::spawn(dispatch::run(
            session,
            handle.buffer(),
            handle.cancel_token(),
            self.inner.config.poll_interval,
        ))
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Stop every subscription, close idle sessions and refuse further
    /// calls.
    pub async fn close(&self) {
        let subs: Vec<SubscriptionHandle> = std::mem::take(
            &mut *self
                .inner
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for sub in &subs {
            sub.stop();
        }
        self.inner.pool.close().await;
        tracing::debug!(subscriptions = subs.len(), "client closed");
    }

    /// Whether settings credentials are configured.
    pub fn authenticated(&self) -> bool {
        self.inner.pool.has_credentials()
    }

    /// Principal of the configured credentials.
    pub fn principal(&self) -> Option<String> {
        self.inner
            .pool
            .credentials()
            .map(|c| c.principal().to_owned())
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    pub(crate) fn inner(&self) -> &Arc<ClientInner> {
        &self.inner
    }
}

fn single<T>(items: Vec<T>) -> Result<T, CoreError> {
    items
        .into_iter()
        .next()
        .ok_or_else(|| CoreError::Internal("empty result for single request".into()))
}

// ── AsyncSubscription ───────────────────────────────────────────────

/// Async driver for one subscription. Dropping it stops the subscription.
pub struct AsyncSubscription {
    handle: SubscriptionHandle,
    dispatch: Option<JoinHandle<()>>,
    delivery: Option<JoinHandle<()>>,
}

impl fmt::Debug for AsyncSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AsyncSubscription").field(&self.handle).finish()
    }
}

impl AsyncSubscription {
    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    /// Next reading. `Ok(None)` once stopped and drained; with a timeout,
    /// expiry is a [`CoreError::Timeout`].
    pub async fn recv(&self, timeout: Option<Duration>) -> Result<Option<Reading>, CoreError> {
        self.handle.next_async(timeout).await
    }

    /// Readings as a stream. Ends after the subscription stops and drains,
    /// or after yielding its terminal error.
    pub fn readings(&self) -> Pin<Box<dyn Stream<Item = Result<Reading, CoreError>> + Send + '_>> {
        Box::pin(async_stream::stream! {
            loop {
                match self.handle.next_async(None).await {
                    Ok(Some(reading)) => yield Ok(reading),
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        })
    }

    /// Stop and wait for the dispatch and delivery loops to finish. The
    /// dedicated session is closed by the time this returns.
    pub async fn stop(&mut self) {
        self.handle.stop();
        if let Some(task) = self.dispatch.take() {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "subscription dispatch task failed");
            }
        }
        if let Some(task) = self.delivery.take() {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "subscription delivery task failed");
            }
        }
    }

    pub fn stopped(&self) -> bool {
        self.handle.stopped()
    }

    pub fn error(&self) -> Option<CoreError> {
        self.handle.error()
    }

    pub fn dropped(&self) -> u64 {
        self.handle.dropped()
    }
}

impl Drop for AsyncSubscription {
    fn drop(&mut self) {
        self.handle.stop();
    }
}
