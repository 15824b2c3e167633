// Protocol messages exchanged with a DPM service.
//
// Client requests manipulate a server-side list of device requests; server
// replies carry data or status for list entries, or the challenge for the
// settings handshake.

use strum::Display;

use crate::status::Status;

/// Index value used in `StatusReply` to address the whole list rather than
/// a single entry.
pub const LIST_INDEX: u16 = 0xFFFF;

// ── Values ──────────────────────────────────────────────────────────

/// Decoded device value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Scalar(f64),
    ScalarArray(Vec<f64>),
    Text(String),
    Raw(Vec<u8>),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::None => ValueType::None,
            Self::Scalar(_) => ValueType::Scalar,
            Self::ScalarArray(_) => ValueType::ScalarArray,
            Self::Text(_) => ValueType::Text,
            Self::Raw(_) => ValueType::Raw,
        }
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Scalar(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Self::ScalarArray(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Type tag of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ValueType {
    None,
    Scalar,
    ScalarArray,
    Text,
    Raw,
}

// ── List control ────────────────────────────────────────────────────

/// How a started list produces data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ListMode {
    /// One reply per entry, then quiet.
    Immediate,
    /// Replies stream until the list is stopped.
    Continuous,
}

/// One value to apply to a list entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Setting {
    pub index: u16,
    pub value: Value,
}

// ── Message ─────────────────────────────────────────────────────────

/// A single framed protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    // Client → server
    ListAdd {
        index: u16,
        request: String,
    },
    ListStart {
        mode: ListMode,
    },
    ListStop,
    ListClear,
    ApplySettings {
        role: Option<String>,
        settings: Vec<Setting>,
    },
    Authenticate {
        token: Vec<u8>,
    },
    EnableSettings {
        token: Vec<u8>,
    },

    // Server → client
    DataReply {
        index: u16,
        status: Status,
        timestamp_ms: u64,
        value: Value,
    },
    StatusReply {
        index: u16,
        status: Status,
    },
    AuthReply {
        service: String,
        challenge: Vec<u8>,
    },
}

impl Message {
    /// Short name used in logs and protocol errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ListAdd { .. } => "ListAdd",
            Self::ListStart { .. } => "ListStart",
            Self::ListStop => "ListStop",
            Self::ListClear => "ListClear",
            Self::ApplySettings { .. } => "ApplySettings",
            Self::Authenticate { .. } => "Authenticate",
            Self::EnableSettings { .. } => "EnableSettings",
            Self::DataReply { .. } => "DataReply",
            Self::StatusReply { .. } => "StatusReply",
            Self::AuthReply { .. } => "AuthReply",
        }
    }

    /// Whether this is a server reply rather than a client request.
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            Self::DataReply { .. } | Self::StatusReply { .. } | Self::AuthReply { .. }
        )
    }
}
