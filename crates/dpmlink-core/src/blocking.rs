//! Blocking client.
//!
//! Wraps the async [`Client`](crate::Client) around a private multi-thread
//! runtime. Read and write calls block the calling thread; every
//! subscription's dispatch loop runs on an OS thread of its own, as does
//! callback delivery.
//!
//! Do not call these methods from inside an async runtime.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use dpmlink_api::{DeviceRequest, Value};
use tokio::runtime::Runtime;

use crate::client::Client as AsyncClient;
use crate::config::ClientConfig;
use crate::error::CoreError;
use crate::model::{Reading, WriteResult};
use crate::pool::PoolStats;
use crate::subscription::{self, Callback, ErrorHandler, SubscriptionHandle, dispatch};

/// Blocking DPM client.
pub struct Client {
    runtime: Arc<Runtime>,
    inner: AsyncClient,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("blocking::Client").field(&self.inner).finish()
    }
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self, CoreError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("dpmlink-io")
            .enable_all()
            .build()
            .map_err(|e| CoreError::Internal(format!("failed to start runtime: {e}")))?;
        Ok(Self {
            runtime: Arc::new(runtime),
            inner: AsyncClient::new(config),
        })
    }

    pub fn read(&self, request: impl Into<DeviceRequest>) -> Result<Value, CoreError> {
        self.runtime.block_on(self.inner.read(request))
    }

    pub fn get(&self, request: impl Into<DeviceRequest>) -> Result<Reading, CoreError> {
        self.runtime.block_on(self.inner.get(request))
    }

    pub fn read_many(
        &self,
        requests: &[DeviceRequest],
        timeout: Option<Duration>,
    ) -> Result<Vec<Reading>, CoreError> {
        self.runtime.block_on(self.inner.read_many(requests, timeout))
    }

    pub fn write(
        &self,
        request: impl Into<DeviceRequest>,
        value: impl Into<Value>,
    ) -> Result<WriteResult, CoreError> {
        self.runtime.block_on(self.inner.write(request, value))
    }

    pub fn write_many(
        &self,
        settings: &[(DeviceRequest, Value)],
        role: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Vec<WriteResult>, CoreError> {
        self.runtime
            .block_on(self.inner.write_many(settings, role, timeout))
    }

    /// Stream readings for `requests`; consume with
    /// [`Subscription::readings`].
    pub fn subscribe(&self, requests: Vec<DeviceRequest>) -> Result<Subscription, CoreError> {
        self.start(requests, None)
    }

    /// Deliver readings for `requests` to `callback` on a dedicated thread.
    pub fn subscribe_with_callback(
        &self,
        requests: Vec<DeviceRequest>,
        callback: Callback,
        on_error: Option<ErrorHandler>,
    ) -> Result<Subscription, CoreError> {
        self.start(requests, Some((callback, on_error)))
    }

    fn start(
        &self,
        requests: Vec<DeviceRequest>,
        callback: Option<(Callback, Option<ErrorHandler>)>,
    ) -> Result<Subscription, CoreError> {
        let inner = self.inner.inner();
        let opened = self.runtime.block_on(subscription::open(
            &inner.pool,
            &inner.config,
            requests,
            callback.is_some(),
        ))?;
        let handle = opened.handle;

        let mut threads = Vec::new();
        if let Some(session) = opened.session {
            let rt = Arc::clone(&self.runtime);
            let run = dispatch::run(
                session,
                handle.buffer(),
                handle.cancel_token(),
                inner.config.poll_interval,
            );
            threads.push(spawn_thread("dpmlink-dispatch", &handle, move || {
                rt.block_on(run);
            })?);
        }
        if let Some((callback, on_error)) = callback {
            let buffer = handle.buffer();
            threads.push(spawn_thread("dpmlink-callback", &handle, move || {
                subscription::deliver(&buffer, callback, on_error);
            })?);
        }
        inner.track(&handle);
        Ok(Subscription { handle, threads })
    }

    /// Stop every subscription, close idle sessions and refuse further
    /// calls.
    pub fn close(&self) {
        self.runtime.block_on(self.inner.close());
    }

    pub fn authenticated(&self) -> bool {
        self.inner.authenticated()
    }

    pub fn principal(&self) -> Option<String> {
        self.inner.principal()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool_stats()
    }
}

fn spawn_thread(
    name: &str,
    handle: &SubscriptionHandle,
    f: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>, CoreError> {
    thread::Builder::new()
        .name(name.to_owned())
        .spawn(f)
        .map_err(|e| {
            handle.stop();
            CoreError::Internal(format!("failed to spawn {name} thread: {e}"))
        })
}

// ── Subscription ────────────────────────────────────────────────────

/// Blocking driver for one subscription. Dropping it stops the
/// subscription without waiting.
pub struct Subscription {
    handle: SubscriptionHandle,
    threads: Vec<JoinHandle<()>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Subscription").field(&self.handle).finish()
    }
}

impl Subscription {
    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    /// Iterate readings. Ends once the subscription stops and drains, or
    /// silently when `timeout` passes without a reading. A terminal error
    /// is yielded once as the last item. A zero timeout drains what is
    /// buffered without blocking.
    pub fn readings(&self, timeout: Option<Duration>) -> Readings<'_> {
        Readings {
            handle: &self.handle,
            timeout,
            done: false,
        }
    }

    /// Stop and wait for the dispatch and delivery threads, except when
    /// called from the callback thread itself.
    pub fn stop(&mut self) {
        self.handle.stop();
        let current = thread::current().id();
        for t in self.threads.drain(..) {
            if t.thread().id() == current {
                continue;
            }
            if t.join().is_err() {
                tracing::error!("subscription thread panicked");
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

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.stop();
    }
}

/// Iterator returned by [`Subscription::readings`].
pub struct Readings<'a> {
    handle: &'a SubscriptionHandle,
    timeout: Option<Duration>,
    done: bool,
}

impl Iterator for Readings<'_> {
    type Item = Result<Reading, CoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.handle.next_blocking(self.timeout) {
            Ok(Some(reading)) => Some(Ok(reading)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
