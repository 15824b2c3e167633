// ── Subscription dispatch loop ──
//
// Owns the subscription's dedicated session for its whole lifetime. Reads
// replies with a bounded wait so cancellation is noticed promptly, turns
// them into readings, and pushes them into the buffer. On exit the list is
// stopped (best effort) and the session closed.

use std::sync::Arc;
use std::time::Duration;

use dpmlink_api::message::LIST_INDEX;
use dpmlink_api::{Message, Session};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::buffer::ReadingBuffer;
use crate::error::CoreError;
use crate::model::Reading;

/// Bound on the polite list stop performed while shutting down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

pub(crate) async fn run(
    mut session: Session,
    buffer: Arc<ReadingBuffer>,
    cancel: CancellationToken,
    poll_interval: Duration,
) {
    let id = session.id();
    tracing::debug!(session = id, "subscription dispatch started");

    let outcome = loop {
        if buffer.is_stopped() {
            break Ok(());
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => break Ok(()),
            polled = session.poll(poll_interval) => match polled {
                Ok(None) => {}
                Ok(Some(msg)) => {
                    if let Err(e) = dispatch(&session, &buffer, msg) {
                        break Err(e);
                    }
                }
                Err(e) => break Err(CoreError::from(e)),
            },
        }
    };

    match outcome {
        Ok(()) => tracing::debug!(session = id, "subscription stopped"),
        Err(e) => {
            tracing::error!(session = id, error = %e, "subscription terminated");
            buffer.fail(e);
        }
    }

    if session.is_healthy() {
        let _ = session.reset(Instant::now() + SHUTDOWN_GRACE).await;
    }
    session.close().await;
}

fn dispatch(session: &Session, buffer: &ReadingBuffer, msg: Message) -> Result<(), CoreError> {
    match msg {
        Message::DataReply {
            index,
            status,
            timestamp_ms,
            value,
        } => {
            let Some(entry) = session.entry(index) else {
                tracing::trace!(session = session.id(), index, "data for unknown list index");
                return Ok(());
            };
            let reading = Reading::from_reply(entry.request.clone(), status, timestamp_ms, value);
            if !buffer.push(reading) {
                tracing::trace!(session = session.id(), index, "reading not buffered");
            }
            Ok(())
        }
        Message::StatusReply { index, status } if index == LIST_INDEX => {
            if status.is_fatal() {
                Err(CoreError::Rejected {
                    operation: "subscription".into(),
                    status,
                })
            } else {
                Ok(())
            }
        }
        Message::StatusReply { index, status } => {
            if status.is_fatal() {
                if let Some(entry) = session.entry(index) {
                    buffer.push(Reading::failed(entry.request.clone(), status));
                }
            }
            Ok(())
        }
        other => Err(CoreError::Protocol {
            message: format!("unexpected {} on a running subscription", other.name()),
        }),
    }
}
