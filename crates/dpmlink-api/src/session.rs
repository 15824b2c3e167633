// Protocol session: one transport plus its list and authentication state.
//
// A session is exclusively owned by whoever currently holds it (a pool, an
// in-flight operation, or a subscription). It enforces the list lifecycle
// `NoList → Building → Started → Stopped → (clear) NoList` and the forward-only
// authentication progression `Idle → Authenticating → Authenticated →
// SettingsEnabled`, with `Closed` reachable from anywhere.
//
// Any error that can leave the wire out of step (I/O, framing, timeout,
// unexpected reply) marks the session unhealthy. Unhealthy sessions must be
// discarded, never reused.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use strum::Display;
use tokio::time::Instant;

use crate::error::Error;
use crate::message::{LIST_INDEX, ListMode, Message, Setting};
use crate::request::DeviceRequest;
use crate::status::Status;
use crate::transport::{Connect, Transport};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Authentication progression. Ordered; moves forward one step at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
pub enum AuthState {
    Idle,
    Authenticating,
    Authenticated,
    SettingsEnabled,
    Closed,
}

impl AuthState {
    /// The only state authentication may move to from here.
    fn successor(self) -> Option<Self> {
        match self {
            Self::Idle => Some(Self::Authenticating),
            Self::Authenticating => Some(Self::Authenticated),
            Self::Authenticated => Some(Self::SettingsEnabled),
            Self::SettingsEnabled | Self::Closed => None,
        }
    }
}

/// Server-side list lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ListState {
    NoList,
    Building,
    Started,
    Stopped,
}

/// One request registered in the session's active list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub index: u16,
    pub request: DeviceRequest,
    /// Status the server returned for the add.
    pub add_status: Status,
}

/// What to do with replies that arrive while waiting for a specific status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stray {
    /// Anything else is a protocol violation.
    Reject,
    /// Keep for the next `recv`.
    Keep,
    /// Discard silently (in-flight data racing a stop or clear).
    Discard,
}

pub struct Session {
    id: u64,
    transport: Transport,
    auth: AuthState,
    list: ListState,
    entries: Vec<ListEntry>,
    pending: VecDeque<Message>,
    last_used: Instant,
    healthy: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("auth", &self.auth)
            .field("list", &self.list)
            .field("entries", &self.entries.len())
            .field("healthy", &self.healthy)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Connect a fresh session.
    pub async fn connect(connector: &dyn Connect, deadline: Instant) -> Result<Self, Error> {
        let transport = Transport::connect(connector, deadline).await?;
        let session = Self::from_transport(transport);
        tracing::debug!(session = session.id, peer = %connector.peer(), "session connected");
        Ok(session)
    }

    pub fn from_transport(transport: Transport) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            transport,
            auth: AuthState::Idle,
            list: ListState::NoList,
            entries: Vec::new(),
            pending: VecDeque::new(),
            last_used: Instant::now(),
            healthy: true,
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth
    }

    pub fn list_state(&self) -> ListState {
        self.list
    }

    pub fn entries(&self) -> &[ListEntry] {
        &self.entries
    }

    pub fn entry(&self, index: u16) -> Option<&ListEntry> {
        self.entries.get(usize::from(index))
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    /// Usable at all: transport open and no fatal error observed.
    pub fn is_healthy(&self) -> bool {
        self.healthy && self.auth != AuthState::Closed && !self.transport.is_closed()
    }

    /// Healthy and holding no list, so safe to hand to another operation.
    pub fn is_reusable(&self) -> bool {
        self.is_healthy() && self.list == ListState::NoList
    }

    /// Mark the session as untrustworthy.
    pub fn poison(&mut self) {
        if self.healthy {
            tracing::debug!(session = self.id, "session marked unhealthy");
        }
        self.healthy = false;
    }

    // ── List lifecycle ──────────────────────────────────────────────

    /// Register `request` under the next free index and return that index
    /// with the server's add status. A failed add still consumes the index.
    pub async fn add(
        &mut self,
        request: &DeviceRequest,
        deadline: Instant,
    ) -> Result<(u16, Status), Error> {
        if !matches!(self.list, ListState::NoList | ListState::Building) {
            return Err(Error::InvalidState(format!(
                "cannot add to a list in state {}",
                self.list
            )));
        }
        let index = u16::try_from(self.entries.len())
            .ok()
            .filter(|i| *i != LIST_INDEX)
            .ok_or_else(|| Error::InvalidState("list is full".into()))?;

        let drf = request.to_drf();
        tracing::trace!(session = self.id, index, request = %drf, "list add");
        self.send(
            Message::ListAdd {
                index,
                request: drf,
            },
            deadline,
        )
        .await?;
        let status = self.await_status(index, deadline, Stray::Reject).await?;

        self.entries.push(ListEntry {
            index,
            request: request.clone(),
            add_status: status,
        });
        self.list = ListState::Building;
        Ok((index, status))
    }

    pub async fn start(&mut self, mode: ListMode, deadline: Instant) -> Result<(), Error> {
        if self.list != ListState::Building {
            return Err(Error::InvalidState(format!(
                "cannot start a list in state {}",
                self.list
            )));
        }
        self.send(Message::ListStart { mode }, deadline).await?;
        let status = self.await_status(LIST_INDEX, deadline, Stray::Keep).await?;
        if status.is_fatal() {
            self.poison();
            return Err(Error::Rejected {
                operation: "list start",
                status,
            });
        }
        tracing::debug!(session = self.id, %mode, entries = self.entries.len(), "list started");
        self.list = ListState::Started;
        Ok(())
    }

    /// Stop a started list. A no-op in any other state.
    pub async fn stop(&mut self, deadline: Instant) -> Result<(), Error> {
        if self.list != ListState::Started {
            return Ok(());
        }
        self.send(Message::ListStop, deadline).await?;
        self.await_list_ack("list stop", deadline).await?;
        self.pending.clear();
        self.list = ListState::Stopped;
        Ok(())
    }

    /// Clear the list and release every entry. A no-op with no list.
    pub async fn clear(&mut self, deadline: Instant) -> Result<(), Error> {
        if self.list == ListState::NoList {
            return Ok(());
        }
        self.send(Message::ListClear, deadline).await?;
        self.await_list_ack("list clear", deadline).await?;
        self.entries.clear();
        self.pending.clear();
        self.list = ListState::NoList;
        Ok(())
    }

    /// Stop and clear, returning the session to `NoList`.
    pub async fn reset(&mut self, deadline: Instant) -> Result<(), Error> {
        self.stop(deadline).await?;
        self.clear(deadline).await
    }

    /// Send an apply-settings request for entries of the started list.
    /// The per-entry status replies are read with [`recv`](Self::recv).
    pub async fn apply_settings(
        &mut self,
        role: Option<String>,
        settings: Vec<Setting>,
        deadline: Instant,
    ) -> Result<(), Error> {
        if self.auth != AuthState::SettingsEnabled {
            return Err(Error::InvalidState(format!(
                "settings require an enabled session, state is {}",
                self.auth
            )));
        }
        if self.list != ListState::Started {
            return Err(Error::InvalidState(format!(
                "cannot apply settings to a list in state {}",
                self.list
            )));
        }
        tracing::debug!(session = self.id, count = settings.len(), role = ?role, "apply settings");
        self.send(Message::ApplySettings { role, settings }, deadline)
            .await
    }

    // ── Authentication state ────────────────────────────────────────

    pub(crate) fn advance_auth(&mut self, next: AuthState) -> Result<(), Error> {
        if self.auth.successor() != Some(next) {
            return Err(Error::InvalidState(format!(
                "cannot move authentication from {} to {next}",
                self.auth
            )));
        }
        self.auth = next;
        Ok(())
    }

    // ── Wire I/O ────────────────────────────────────────────────────

    pub(crate) async fn send(&mut self, msg: Message, deadline: Instant) -> Result<(), Error> {
        if !self.is_healthy() {
            return Err(Error::SessionClosed);
        }
        tracing::trace!(session = self.id, message = msg.name(), "send");
        let result = self.transport.send(msg, deadline).await;
        self.check(result)
    }

    /// Next reply from the server, honouring replies set aside earlier.
    pub async fn recv(&mut self, deadline: Instant) -> Result<Message, Error> {
        if let Some(msg) = self.pending.pop_front() {
            return Ok(msg);
        }
        self.recv_wire(deadline).await
    }

    /// Wait up to `wait` for the next reply. Expiry is not an error and
    /// leaves the session healthy; the codec keeps any partial frame.
    pub async fn poll(&mut self, wait: Duration) -> Result<Option<Message>, Error> {
        if let Some(msg) = self.pending.pop_front() {
            return Ok(Some(msg));
        }
        if !self.is_healthy() {
            return Err(Error::SessionClosed);
        }
        match self.transport.recv(Instant::now() + wait).await {
            Ok(msg) => Ok(Some(msg)),
            Err(e) if e.is_timeout() => Ok(None),
            Err(e) => {
                self.poison();
                Err(e)
            }
        }
    }

    async fn recv_wire(&mut self, deadline: Instant) -> Result<Message, Error> {
        if !self.is_healthy() {
            return Err(Error::SessionClosed);
        }
        let result = self.transport.recv(deadline).await;
        if let Ok(msg) = &result {
            tracing::trace!(session = self.id, message = msg.name(), "recv");
        }
        self.check(result)
    }

    /// Read until the status reply for `index`.
    pub(crate) async fn await_status(
        &mut self,
        index: u16,
        deadline: Instant,
        stray: Stray,
    ) -> Result<Status, Error> {
        loop {
            let msg = self.recv_wire(deadline).await?;
            match msg {
                Message::StatusReply { index: i, status } if i == index => return Ok(status),
                Message::DataReply { .. } | Message::StatusReply { .. } => match stray {
                    Stray::Keep => self.pending.push_back(msg),
                    Stray::Discard => {
                        tracing::trace!(
                            session = self.id,
                            message = msg.name(),
                            "discarding in-flight reply"
                        );
                    }
                    Stray::Reject => {
                        return Err(self.unexpected(&msg, index));
                    }
                },
                other => return Err(self.unexpected(&other, index)),
            }
        }
    }

    async fn await_list_ack(
        &mut self,
        operation: &'static str,
        deadline: Instant,
    ) -> Result<(), Error> {
        let status = self.await_status(LIST_INDEX, deadline, Stray::Discard).await?;
        if status.is_fatal() {
            self.poison();
            return Err(Error::Rejected { operation, status });
        }
        Ok(())
    }

    fn unexpected(&mut self, msg: &Message, index: u16) -> Error {
        self.poison();
        Error::protocol(format!(
            "unexpected {} while waiting for status of index {index}",
            msg.name()
        ))
    }

    fn check<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(e) = &result {
            if e.is_session_fatal() {
                tracing::debug!(session = self.id, error = %e, "session I/O failed");
                self.poison();
            }
        }
        result
    }

    /// Close the transport. Idempotent.
    pub async fn close(&mut self) {
        if self.auth != AuthState::Closed {
            tracing::debug!(session = self.id, "closing session");
        }
        self.auth = AuthState::Closed;
        self.healthy = false;
        self.transport.close().await;
    }

    /// Close without waiting for an orderly shutdown.
    pub fn abort(&mut self) {
        self.auth = AuthState::Closed;
        self.healthy = false;
        self.transport.abort();
    }
}
