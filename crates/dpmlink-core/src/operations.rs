// ── Operation orchestrator ──
//
// The three call shapes as protocol sequences over a pooled session. Each
// sequence ends with the session back in `NoList` so it can be released;
// any error on the way discards the session instead.

use dpmlink_api::message::LIST_INDEX;
use dpmlink_api::{DeviceRequest, ListMode, Message, Session, Setting, Status, Value};
use tokio::time::Instant;

use crate::error::CoreError;
use crate::model::{Reading, WriteResult};
use crate::pool::{PooledSession, SessionKind, SessionPool};

// ── read_many ───────────────────────────────────────────────────────

/// Read every request once. Results are in input order; an entry the
/// server refused yields a failed reading for that entry only.
pub async fn read_many(
    pool: &SessionPool,
    requests: &[DeviceRequest],
    deadline: Instant,
) -> Result<Vec<Reading>, CoreError> {
    if requests.is_empty() {
        return Ok(Vec::new());
    }
    check_batch_size(requests.len())?;
    let mut session = pool.acquire(SessionKind::Plain, deadline).await?;
    let outcome = collect_readings(&mut session, requests, deadline).await;
    finish(session, outcome).await
}

async fn collect_readings(
    session: &mut Session,
    requests: &[DeviceRequest],
    deadline: Instant,
) -> Result<Vec<Reading>, CoreError> {
    let mut slots: Vec<Option<Reading>> = vec![None; requests.len()];
    let mut outstanding = 0usize;

    for (slot, request) in slots.iter_mut().zip(requests) {
        let (index, status) = session.add(request, deadline).await?;
        if status.is_fatal() {
            tracing::debug!(session = session.id(), index, %status, "read entry refused");
            *slot = Some(Reading::failed(request.clone(), status));
        } else {
            outstanding += 1;
        }
    }

    if outstanding > 0 {
        session.start(ListMode::Immediate, deadline).await?;
        while outstanding > 0 {
            match session.recv(deadline).await? {
                Message::DataReply {
                    index,
                    status,
                    timestamp_ms,
                    value,
                } => {
                    if let Some(slot) = open_slot(&mut slots, index) {
                        *slot = Some(Reading::from_reply(
                            requests_at(requests, index)?,
                            status,
                            timestamp_ms,
                            value,
                        ));
                        outstanding -= 1;
                    }
                }
                Message::StatusReply { index, status } if index == LIST_INDEX => {
                    if status.is_fatal() {
                        return Err(CoreError::Rejected {
                            operation: "read".into(),
                            status,
                        });
                    }
                }
                Message::StatusReply { index, status } => {
                    if status.is_fatal() {
                        if let Some(slot) = open_slot(&mut slots, index) {
                            *slot = Some(Reading::failed(requests_at(requests, index)?, status));
                            outstanding -= 1;
                        }
                    }
                }
                other => return Err(unexpected(&other, "read")),
            }
        }
    }

    session.reset(deadline).await?;
    slots
        .into_iter()
        .map(|slot| slot.ok_or_else(|| CoreError::Internal("read slot left unfilled".into())))
        .collect()
}

// ── write_many ──────────────────────────────────────────────────────

/// Apply a batch of settings. One result per setting, in input order; an
/// entry the server refused (at add or apply) yields a failed result.
pub async fn write_many(
    pool: &SessionPool,
    settings: &[(DeviceRequest, Value)],
    role: Option<String>,
    deadline: Instant,
) -> Result<Vec<WriteResult>, CoreError> {
    if !pool.has_credentials() {
        return Err(CoreError::AuthenticationFailed {
            message: "writes require credentials".into(),
        });
    }
    if settings.is_empty() {
        return Ok(Vec::new());
    }
    check_batch_size(settings.len())?;
    let mut session = pool.acquire(SessionKind::Write, deadline).await?;
    let outcome = apply_batch(&mut session, settings, role, deadline).await;
    finish(session, outcome).await
}

async fn apply_batch(
    session: &mut Session,
    settings: &[(DeviceRequest, Value)],
    role: Option<String>,
    deadline: Instant,
) -> Result<Vec<WriteResult>, CoreError> {
    // A pooled session is normally clean; make sure of it.
    session.reset(deadline).await?;

    let mut slots: Vec<Option<Status>> = vec![None; settings.len()];
    let mut batch = Vec::with_capacity(settings.len());

    for (slot, (request, value)) in slots.iter_mut().zip(settings) {
        let (index, status) = session.add(&request.for_setting(), deadline).await?;
        if status.is_fatal() {
            tracing::debug!(session = session.id(), index, %status, "setting refused at add");
            *slot = Some(status);
        } else {
            batch.push(Setting {
                index,
                value: value.clone(),
            });
        }
    }

    let mut outstanding = batch.len();
    if outstanding > 0 {
        session.start(ListMode::Immediate, deadline).await?;
        session.apply_settings(role, batch, deadline).await?;
        while outstanding > 0 {
            match session.recv(deadline).await? {
                Message::StatusReply { index, status } if index == LIST_INDEX => {
                    if status.is_fatal() {
                        return Err(CoreError::Rejected {
                            operation: "apply settings".into(),
                            status,
                        });
                    }
                }
                Message::StatusReply { index, status } => {
                    if let Some(slot) = open_slot(&mut slots, index) {
                        *slot = Some(status);
                        outstanding -= 1;
                    }
                }
                // Settings lists never produce data; stray replies are ignored.
                Message::DataReply { .. } => {}
                other => return Err(unexpected(&other, "write")),
            }
        }
    }

    session.reset(deadline).await?;
    slots
        .into_iter()
        .zip(settings)
        .map(|(status, (request, _))| {
            status
                .map(|s| WriteResult::new(request.clone(), s))
                .ok_or_else(|| CoreError::Internal("write slot left unfilled".into()))
        })
        .collect()
}

// ── subscribe ───────────────────────────────────────────────────────

/// A started continuous list on a session detached from the pool.
pub(crate) struct SubscriptionStart {
    /// `None` if no entry was accepted.
    pub session: Option<Session>,
    /// Readings for entries refused at add time.
    pub failures: Vec<Reading>,
}

pub(crate) async fn open_subscription(
    pool: &SessionPool,
    requests: &[DeviceRequest],
    deadline: Instant,
) -> Result<SubscriptionStart, CoreError> {
    check_batch_size(requests.len())?;
    let mut pooled = pool.acquire(SessionKind::Plain, deadline).await?;
    match start_continuous(&mut pooled, requests, deadline).await {
        Ok((failures, true)) => {
            let session = pooled.detach();
            tracing::info!(
                session = session.id(),
                entries = requests.len(),
                "subscription started"
            );
            Ok(SubscriptionStart {
                session: Some(session),
                failures,
            })
        }
        Ok((failures, false)) => {
            // Nothing to stream; the session goes back clean.
            match pooled.reset(deadline).await {
                Ok(()) => pooled.release().await,
                Err(_) => pooled.discard().await,
            }
            Ok(SubscriptionStart {
                session: None,
                failures,
            })
        }
        Err(e) => {
            pooled.discard().await;
            Err(e)
        }
    }
}

/// Add every request and start streaming if any was accepted.
async fn start_continuous(
    session: &mut Session,
    requests: &[DeviceRequest],
    deadline: Instant,
) -> Result<(Vec<Reading>, bool), CoreError> {
    let mut failures = Vec::new();
    for request in requests {
        let (index, status) = session.add(request, deadline).await?;
        if status.is_fatal() {
            tracing::debug!(session = session.id(), index, %status, "subscription entry refused");
            failures.push(Reading::failed(request.clone(), status));
        }
    }
    let accepted = failures.len() < requests.len();
    if accepted {
        session.start(ListMode::Continuous, deadline).await?;
    }
    Ok((failures, accepted))
}

// ── Helpers ─────────────────────────────────────────────────────────

/// One list holds at most `LIST_INDEX` entries; that index is reserved for
/// list-level replies.
fn check_batch_size(len: usize) -> Result<(), CoreError> {
    if len > usize::from(LIST_INDEX) {
        return Err(CoreError::InvalidRequest {
            message: format!("{len} requests exceed the {LIST_INDEX} entries one list can hold"),
        });
    }
    Ok(())
}

/// Release on success, discard on failure.
async fn finish<T>(
    session: PooledSession,
    outcome: Result<T, CoreError>,
) -> Result<T, CoreError> {
    match outcome {
        Ok(value) => {
            session.release().await;
            Ok(value)
        }
        Err(e) => {
            tracing::debug!(
                session = session.id(),
                error = %e,
                "operation failed, discarding session"
            );
            session.discard().await;
            Err(e)
        }
    }
}

/// The still-empty slot for list `index`, if there is one.
fn open_slot<T>(slots: &mut [Option<T>], index: u16) -> Option<&mut Option<T>> {
    slots
        .get_mut(usize::from(index))
        .filter(|slot| slot.is_none())
}

fn requests_at(requests: &[DeviceRequest], index: u16) -> Result<DeviceRequest, CoreError> {
    requests
        .get(usize::from(index))
        .cloned()
        .ok_or_else(|| CoreError::Protocol {
            message: format!("reply for unknown list index {index}"),
        })
}

fn unexpected(msg: &Message, operation: &str) -> CoreError {
    CoreError::Protocol {
        message: format!("unexpected {} during {operation}", msg.name()),
    }
}
