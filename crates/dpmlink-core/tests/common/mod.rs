#![allow(clippy::unwrap_used, dead_code)]
// In-process DPM service speaking the list protocol over `tokio::io::duplex`.
//
// Each connection runs its own server task. Device behavior is configured
// per device name; counters expose how many connections were opened and
// closed so tests can observe pool reuse and discards.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use dpmlink_api::codec::FrameCodec;
use dpmlink_api::message::LIST_INDEX;
use dpmlink_api::transport::{BoxedStream, Connect};
use dpmlink_api::{Error, ListMode, Message, Setting, StaticCredentials, Status, Value};
use dpmlink_core::ClientConfig;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf, duplex};
use tokio::sync::Notify;
use tokio_util::codec::Framed;

/// How the fake service treats one device.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Accept and reply with this value.
    Scalar(f64),
    /// Refuse the add with this status.
    AddFails(Status),
    /// Accept, but refuse settings with this status.
    ApplyFails(Status),
    /// Accept and never produce data.
    Silent,
}

#[derive(Default)]
struct FakeState {
    devices: Mutex<HashMap<String, Behavior>>,
    connects: AtomicUsize,
    closes: AtomicUsize,
    auth_attempts: AtomicUsize,
    reverse: AtomicBool,
    reject_enable: AtomicBool,
    /// Replies per entry per streaming tick.
    burst: AtomicUsize,
    /// Shared counter so streamed values are strictly increasing.
    sequence: AtomicU64,
    applied: Mutex<Vec<(Option<String>, Vec<Setting>)>>,
    requests: Mutex<Vec<String>>,
    killed: AtomicBool,
    kill: Notify,
    hang_on_shutdown: AtomicBool,
}

/// Cloneable handle to the fake service; also the client's connector.
#[derive(Clone)]
pub struct FakeDpm {
    state: Arc<FakeState>,
    stream_every: Duration,
}

impl fmt::Debug for FakeDpm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeDpm")
            .field("connects", &self.connects())
            .finish_non_exhaustive()
    }
}

impl FakeDpm {
    pub fn new() -> Self {
        let state = FakeState::default();
        state.burst.store(1, Ordering::SeqCst);
        Self {
            state: Arc::new(state),
            stream_every: Duration::from_millis(10),
        }
    }

    pub fn device(self, name: &str, behavior: Behavior) -> Self {
        self.state
            .devices
            .lock()
            .unwrap()
            .insert(name.to_owned(), behavior);
        self
    }

    /// Send immediate-mode data in reverse list order.
    pub fn reverse_replies(self) -> Self {
        self.state.reverse.store(true, Ordering::SeqCst);
        self
    }

    pub fn reject_enable(self) -> Self {
        self.state.reject_enable.store(true, Ordering::SeqCst);
        self
    }

    pub fn burst(self, n: usize) -> Self {
        self.state.burst.store(n, Ordering::SeqCst);
        self
    }

    /// Client streams whose shutdown never completes.
    pub fn hang_on_shutdown(self) -> Self {
        self.state.hang_on_shutdown.store(true, Ordering::SeqCst);
        self
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn auth_attempts(&self) -> usize {
        self.state.auth_attempts.load(Ordering::SeqCst)
    }

    pub fn applied(&self) -> Vec<(Option<String>, Vec<Setting>)> {
        self.state.applied.lock().unwrap().clone()
    }

    /// Every request string received in `ListAdd`.
    pub fn requests(&self) -> Vec<String> {
        self.state.requests.lock().unwrap().clone()
    }

    /// Drop every open connection, now and from then on.
    pub fn kill_connections(&self) {
        self.state.killed.store(true, Ordering::SeqCst);
        self.state.kill.notify_waiters();
    }

    /// Wait until at least `n` connections have closed.
    pub async fn wait_for_closes(&self, n: usize) -> bool {
        for _ in 0..200 {
            if self.closes() >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    /// Client configuration wired to this service with short deadlines.
    pub fn config(&self) -> ClientConfig {
        let mut config = ClientConfig::new("fake-dpm", 6802);
        config.timeout = Duration::from_secs(2);
        config.poll_interval = Duration::from_millis(20);
        config.with_connector(Arc::new(self.clone()))
    }

    pub fn config_with_credentials(&self) -> ClientConfig {
        self.config().with_credentials(Arc::new(StaticCredentials::new(
            "operator@FNAL.GOV",
            b"ticket".to_vec(),
        )))
    }
}

impl Connect for FakeDpm {
    fn connect(&self) -> BoxFuture<'_, Result<BoxedStream, Error>> {
        Box::pin(async move {
            let (client, server) = duplex(256 * 1024);
            self.state.connects.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve(server, Arc::clone(&self.state), self.stream_every));
            let stream: BoxedStream = if self.state.hang_on_shutdown.load(Ordering::SeqCst) {
                Box::new(HangingShutdown(client))
            } else {
                Box::new(client)
            };
            Ok(stream)
        })
    }

    fn peer(&self) -> String {
        "fake-dpm".into()
    }
}

/// Passes reads and writes through; `poll_shutdown` stays pending.
struct HangingShutdown(DuplexStream);

impl AsyncRead for HangingShutdown {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for HangingShutdown {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

// ── Server ──────────────────────────────────────────────────────────

struct Entry {
    index: u16,
    device: String,
    settings_only: bool,
}

fn device_of(request: &str) -> String {
    request.split('.').next().unwrap_or(request).to_owned()
}

fn ack(index: u16, status: Status) -> Message {
    Message::StatusReply { index, status }
}

async fn serve(stream: DuplexStream, state: Arc<FakeState>, stream_every: Duration) {
    let mut framed = Framed::new(stream, FrameCodec);
    let mut entries: Vec<Entry> = Vec::new();
    let mut streaming = false;
    let mut ticker = tokio::time::interval(stream_every);

    loop {
        if state.killed.load(Ordering::SeqCst) {
            break;
        }
        let replies = tokio::select! {
            () = state.kill.notified() => break,
            msg = framed.next() => match msg {
                Some(Ok(msg)) => handle(&state, &mut entries, &mut streaming, msg),
                _ => break,
            },
            _ = ticker.tick(), if streaming => stream_tick(&state, &entries),
        };
        let mut failed = false;
        for reply in replies {
            if framed.send(reply).await.is_err() {
                failed = true;
                break;
            }
        }
        if failed {
            break;
        }
    }
    state.closes.fetch_add(1, Ordering::SeqCst);
}

fn behavior(state: &FakeState, device: &str) -> Behavior {
    state
        .devices
        .lock()
        .unwrap()
        .get(device)
        .cloned()
        .unwrap_or(Behavior::Scalar(42.0))
}

fn handle(
    state: &FakeState,
    entries: &mut Vec<Entry>,
    streaming: &mut bool,
    msg: Message,
) -> Vec<Message> {
    match msg {
        Message::ListAdd { index, request } => {
            state.requests.lock().unwrap().push(request.clone());
            let device = device_of(&request);
            if let Behavior::AddFails(status) = behavior(state, &device) {
                return vec![ack(index, status)];
            }
            entries.push(Entry {
                index,
                device,
                settings_only: request.ends_with("@N"),
            });
            vec![ack(index, Status::OK)]
        }
        Message::ListStart { mode } => {
            let mut replies = vec![ack(LIST_INDEX, Status::OK)];
            match mode {
                ListMode::Continuous => *streaming = true,
                ListMode::Immediate => {
                    let mut data: Vec<Message> = entries
                        .iter()
                        .filter(|e| !e.settings_only)
                        .filter_map(|e| match behavior(state, &e.device) {
                            Behavior::Scalar(v) => Some(data_reply(e.index, v)),
                            Behavior::ApplyFails(_) => Some(data_reply(e.index, 0.0)),
                            _ => None,
                        })
                        .collect();
                    if state.reverse.load(Ordering::SeqCst) {
                        data.reverse();
                    }
                    replies.extend(data);
                }
            }
            replies
        }
        Message::ListStop => {
            *streaming = false;
            vec![ack(LIST_INDEX, Status::OK)]
        }
        Message::ListClear => {
            *streaming = false;
            entries.clear();
            vec![ack(LIST_INDEX, Status::OK)]
        }
        Message::Authenticate { .. } => {
            state.auth_attempts.fetch_add(1, Ordering::SeqCst);
            vec![Message::AuthReply {
                service: "daeset@FAKE".into(),
                challenge: vec![1, 2, 3, 4],
            }]
        }
        Message::EnableSettings { token } => {
            let refused = state.reject_enable.load(Ordering::SeqCst) || token.is_empty();
            let status = if refused {
                Status::new(17, -1)
            } else {
                Status::OK
            };
            vec![ack(LIST_INDEX, status)]
        }
        Message::ApplySettings { role, settings } => {
            let replies = settings
                .iter()
                .map(|s| {
                    let device = entries
                        .iter()
                        .find(|e| e.index == s.index)
                        .map(|e| e.device.clone())
                        .unwrap_or_default();
                    match behavior(state, &device) {
                        Behavior::ApplyFails(status) => ack(s.index, status),
                        _ => ack(s.index, Status::OK),
                    }
                })
                .collect();
            state.applied.lock().unwrap().push((role, settings));
            replies
        }
        // Replies never flow client → server.
        _ => Vec::new(),
    }
}

fn stream_tick(state: &FakeState, entries: &[Entry]) -> Vec<Message> {
    let burst = state.burst.load(Ordering::SeqCst);
    let mut out = Vec::new();
    for _ in 0..burst {
        for e in entries {
            if matches!(behavior(state, &e.device), Behavior::Silent) {
                continue;
            }
            let n = state.sequence.fetch_add(1, Ordering::SeqCst);
            out.push(data_reply(e.index, f64::from(u32::try_from(n).unwrap())));
        }
    }
    out
}

fn data_reply(index: u16, value: f64) -> Message {
    Message::DataReply {
        index,
        status: Status::OK,
        timestamp_ms: 1_700_000_000_000,
        value: Value::Scalar(value),
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
