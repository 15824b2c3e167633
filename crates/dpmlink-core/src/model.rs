// ── Result types ──
//
// Immutable values handed back to callers: one `Reading` per device in a
// read or subscription, one `WriteResult` per setting in a write.

use chrono::{DateTime, Utc};
use dpmlink_api::{DeviceRequest, Status, Value, ValueType};

/// One observed value of a device.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub request: DeviceRequest,
    pub value: Value,
    pub value_type: ValueType,
    pub status: Status,
    /// Server acquisition time; `None` for readings synthesized from a
    /// failed add.
    pub timestamp: Option<DateTime<Utc>>,
}

impl Reading {
    pub(crate) fn from_reply(
        request: DeviceRequest,
        status: Status,
        timestamp_ms: u64,
        value: Value,
    ) -> Self {
        Self {
            request,
            value_type: value.value_type(),
            value,
            status,
            timestamp: timestamp_from_millis(timestamp_ms),
        }
    }

    pub(crate) fn failed(request: DeviceRequest, status: Status) -> Self {
        Self {
            request,
            value: Value::None,
            value_type: ValueType::None,
            status,
            timestamp: None,
        }
    }

    pub fn device(&self) -> &str {
        self.request.device()
    }

    /// Carries a usable value (success or warning).
    pub fn is_ok(&self) -> bool {
        !self.status.is_fatal()
    }

    pub fn is_warning(&self) -> bool {
        self.status.is_warning()
    }

    pub fn is_error(&self) -> bool {
        self.status.is_fatal()
    }

    pub fn message(&self) -> Option<String> {
        self.status.message()
    }
}

/// Outcome of one setting within a batched write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteResult {
    pub request: DeviceRequest,
    pub status: Status,
    pub timestamp: DateTime<Utc>,
}

impl WriteResult {
    pub(crate) fn new(request: DeviceRequest, status: Status) -> Self {
        Self {
            request,
            status,
            timestamp: Utc::now(),
        }
    }

    pub fn device(&self) -> &str {
        self.request.device()
    }

    pub fn is_ok(&self) -> bool {
        !self.status.is_fatal()
    }

    pub fn message(&self) -> Option<String> {
        self.status.message()
    }
}

fn timestamp_from_millis(ms: u64) -> Option<DateTime<Utc>> {
    i64::try_from(ms).ok().and_then(DateTime::from_timestamp_millis)
}
