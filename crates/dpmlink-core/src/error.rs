// ── Core error types ──
//
// User-facing errors from dpmlink-core. Callers never see framing or codec
// details directly; the `From<dpmlink_api::Error>` impl folds wire-level
// failures into these variants. `Clone` so a subscription's terminal error
// can be handed to every reader that observes it.

use dpmlink_api::Status;
use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot connect to DPM at {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    #[error("Connection lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    // ── Protocol errors ──────────────────────────────────────────────
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("{operation} rejected by server: {status}")]
    Rejected { operation: String, status: Status },

    // ── Device errors ────────────────────────────────────────────────
    /// A single-device call whose entry failed.
    #[error("{device}: {message}")]
    Device {
        device: String,
        status: Status,
        message: String,
    },

    // ── Client errors ────────────────────────────────────────────────
    #[error("Client is closed")]
    Closed,

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Subscription callback failed: {message}")]
    Callback { message: String },

    #[error("Subscription delivers readings to its callback and cannot be iterated")]
    CallbackMode,

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. } | Self::ConnectionLost { .. }
        )
    }
}

// ── Conversion from wire-level errors ────────────────────────────────

impl From<dpmlink_api::Error> for CoreError {
    fn from(err: dpmlink_api::Error) -> Self {
        match err {
            dpmlink_api::Error::Connect { addr, source } => CoreError::ConnectionFailed {
                addr,
                reason: source.to_string(),
            },
            dpmlink_api::Error::Connection(e) => CoreError::ConnectionLost {
                reason: e.to_string(),
            },
            dpmlink_api::Error::ConnectionClosed => CoreError::ConnectionLost {
                reason: "closed by peer".into(),
            },
            dpmlink_api::Error::SessionClosed => CoreError::ConnectionLost {
                reason: "session closed".into(),
            },
            dpmlink_api::Error::Timeout { timeout_ms } => CoreError::Timeout { timeout_ms },
            dpmlink_api::Error::Protocol { message } => CoreError::Protocol { message },
            dpmlink_api::Error::Rejected { operation, status } => CoreError::Rejected {
                operation: operation.to_owned(),
                status,
            },
            dpmlink_api::Error::Authentication { message } => {
                CoreError::AuthenticationFailed { message }
            }
            dpmlink_api::Error::InvalidState(msg) => {
                CoreError::Internal(format!("invalid session state: {msg}"))
            }
        }
    }
}
