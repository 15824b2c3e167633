// Composite facility/error status codes.
//
// A status travels as one signed 16-bit word: `facility + error * 256`.
// The low byte is the facility (unsigned), the high byte the error number
// (signed). Zero error means success, negative failure, positive an
// informational or pending condition.

use std::fmt;

use strum::{Display, FromRepr};

/// Subsystem that produced a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr)]
#[repr(u8)]
pub enum Facility {
    #[strum(to_string = "ACNET")]
    Acnet = 1,
    #[strum(to_string = "DIO")]
    Dio = 14,
    #[strum(to_string = "FTP")]
    Ftp = 15,
    #[strum(to_string = "DBM")]
    Dbm = 16,
    #[strum(to_string = "DPM")]
    Dpm = 17,
}

/// Sign of a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    Success,
    Warning,
    Failure,
}

/// Decoded composite status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Status {
    facility: u8,
    error: i8,
}

impl Status {
    pub const OK: Self = Self::new(0, 0);

    // ── DPM ──
    pub const DPM_PEND: Self = Self::new(17, 1);
    pub const DPM_STALE: Self = Self::new(17, 2);
    pub const DPM_BAD_REQUEST: Self = Self::new(17, -24);
    pub const DPM_NO_SUCH_DEVICE: Self = Self::new(17, -26);
    pub const DPM_NO_SUCH_PROP: Self = Self::new(17, -27);
    pub const DPM_BAD_RANGE: Self = Self::new(17, -28);
    pub const DPM_NO_SCALE: Self = Self::new(17, -31);
    pub const DPM_BAD_EVENT: Self = Self::new(17, -33);
    pub const DPM_INTERNAL_ERROR: Self = Self::new(17, -45);

    // ── ACNET / DBM ──
    pub const ACNET_PEND: Self = Self::new(1, 1);
    pub const ACNET_REQTMO: Self = Self::new(1, -6);
    pub const ACNET_NOT_CONNECTED: Self = Self::new(1, -21);
    pub const ACNET_NO_SUCH: Self = Self::new(1, -24);
    pub const DBM_NOPROP: Self = Self::new(16, -13);

    pub const fn new(facility: u8, error: i8) -> Self {
        Self { facility, error }
    }

    /// Split a wire status word into facility and error halves.
    pub fn from_code(code: i16) -> Self {
        let [hi, lo] = code.to_be_bytes();
        Self {
            facility: lo,
            error: i8::from_be_bytes([hi]),
        }
    }

    /// Recombine into the wire status word.
    pub fn code(self) -> i16 {
        let [hi] = self.error.to_be_bytes();
        i16::from_be_bytes([hi, self.facility])
    }

    pub fn facility(self) -> u8 {
        self.facility
    }

    /// The facility as a known subsystem, if it is one.
    pub fn known_facility(self) -> Option<Facility> {
        Facility::from_repr(self.facility)
    }

    pub fn error(self) -> i8 {
        self.error
    }

    pub fn severity(self) -> Severity {
        match self.error {
            0 => Severity::Success,
            e if e < 0 => Severity::Failure,
            _ => Severity::Warning,
        }
    }

    pub fn is_ok(self) -> bool {
        self.error == 0
    }

    pub fn is_warning(self) -> bool {
        self.error > 0
    }

    pub fn is_fatal(self) -> bool {
        self.error < 0
    }

    /// Human-readable description; `None` for success.
    pub fn message(self) -> Option<String> {
        match self.severity() {
            Severity::Success => None,
            Severity::Failure => Some(format!(
                "Device error (facility={}, error={})",
                self.facility, self.error
            )),
            Severity::Warning => Some(format!(
                "Warning (facility={}, error={})",
                self.facility, self.error
            )),
        }
    }
}

impl From<i16> for Status {
    fn from(code: i16) -> Self {
        Self::from_code(code)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.known_facility() {
            Some(fac) => write!(f, "[{fac} {}]", self.error),
            None => write!(f, "[{} {}]", self.facility, self.error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_composite_code() {
        // 17 + (-26 * 256)
        let status = Status::from_code(-6639);
        assert_eq!(status.facility(), 17);
        assert_eq!(status.error(), -26);
        assert_eq!(status, Status::DPM_NO_SUCH_DEVICE);
        assert_eq!(status.code(), -6639);
    }

    #[test]
    fn positive_error_is_warning() {
        let status = Status::from_code(17 + 256);
        assert_eq!(status, Status::DPM_PEND);
        assert_eq!(status.severity(), Severity::Warning);
        assert!(status.is_warning());
        assert!(!status.is_fatal());
    }

    #[test]
    fn zero_is_success() {
        assert!(Status::from_code(0).is_ok());
        assert!(Status::OK.message().is_none());
        // Facility alone does not make a failure.
        assert!(Status::new(17, 0).is_ok());
    }

    #[test]
    fn display_uses_facility_name() {
        assert_eq!(Status::DPM_BAD_RANGE.to_string(), "[DPM -28]");
        assert_eq!(Status::new(99, -1).to_string(), "[99 -1]");
    }

    #[test]
    fn message_mentions_both_halves() {
        let msg = Status::ACNET_REQTMO.message().unwrap_or_default();
        assert!(msg.contains("facility=1"), "{msg}");
        assert!(msg.contains("error=-6"), "{msg}");
    }
}
