use thiserror::Error;

use crate::status::Status;

/// Top-level error type for the `dpmlink-api` crate.
///
/// Covers every failure mode of the wire layer: connecting, framing,
/// decoding, the settings handshake, and deadlines. `dpmlink-core` maps
/// these into user-facing diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Transport ───────────────────────────────────────────────────
    /// TCP connect failed (refused, DNS failure, unreachable host).
    #[error("Cannot connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O failure on an established connection.
    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// The peer closed the connection.
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// Deadline elapsed before the operation completed.
    #[error("Timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    // ── Protocol ────────────────────────────────────────────────────
    /// Malformed, truncated, oversized, or out-of-sequence message.
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// The server refused a list-level operation.
    #[error("{operation} rejected by server: {status}")]
    Rejected {
        operation: &'static str,
        status: Status,
    },

    // ── Authentication ──────────────────────────────────────────────
    /// Identity exchange or enable-settings failed, or no credentials.
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    // ── Local misuse ────────────────────────────────────────────────
    /// Operation not valid in the session's current list or auth state.
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    /// Operation attempted on a session whose transport is closed.
    #[error("Session is closed")]
    SessionClosed,
}

impl Error {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Returns `true` if a session that observed this error can no longer
    /// be trusted and must be discarded instead of pooled.
    ///
    /// `InvalidState` is raised before any I/O, so it leaves the session intact.
    pub fn is_session_fatal(&self) -> bool {
        !matches!(self, Self::InvalidState(_))
    }

    /// Returns `true` for deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns `true` if the connection itself failed or went away.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. }
                | Self::Connection(_)
                | Self::ConnectionClosed
                | Self::SessionClosed
        )
    }
}
