// Structured device requests.
//
// Requests arrive already validated by an external parser; this module only
// holds the structured fields and renders the canonical request string sent
// in `ListAdd`. Nothing here re-checks syntax.

use std::fmt;
use std::time::Duration;

use strum::Display;

/// Device property being addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Property {
    #[default]
    Reading,
    Setting,
    Status,
    Control,
    Analog,
    Digital,
    Description,
}

/// Array or byte sub-range of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Range {
    /// Element range `[start:end]`; open-ended when `end` is `None`.
    Array { start: u32, end: Option<u32> },
    /// Raw byte window `{offset:length}`.
    Bytes { offset: u32, length: u32 },
}

/// When the server should produce data for a list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EventSpec {
    /// Server default for the property.
    #[default]
    Default,
    /// Once, as soon as possible.
    Immediate,
    /// Repeatedly at a fixed period.
    Periodic { period: Duration },
    /// On a clock event.
    Clock { event: u16 },
    /// Never produce data; used for settings, where each apply is confirmed
    /// by its own status reply.
    Never,
}

impl fmt::Display for EventSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => Ok(()),
            Self::Immediate => f.write_str("@I"),
            Self::Periodic { period } => write!(f, "@p,{}", period.as_millis()),
            Self::Clock { event } => write!(f, "@e,{event:02X}"),
            Self::Never => f.write_str("@N"),
        }
    }
}

/// A single validated device request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceRequest {
    device: String,
    property: Property,
    field: Option<String>,
    range: Option<Range>,
    event: EventSpec,
}

impl DeviceRequest {
    /// Request the default property of `device` with the server default event.
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            property: Property::default(),
            field: None,
            range: None,
            event: EventSpec::default(),
        }
    }

    pub fn with_property(mut self, property: Property) -> Self {
        self.property = property;
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_range(mut self, range: Range) -> Self {
        self.range = Some(range);
        self
    }

    pub fn with_event(mut self, event: EventSpec) -> Self {
        self.event = event;
        self
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn property(&self) -> Property {
        self.property
    }

    pub fn field(&self) -> Option<&str> {
        self.field.as_deref()
    }

    pub fn range(&self) -> Option<Range> {
        self.range
    }

    pub fn event(&self) -> EventSpec {
        self.event
    }

    /// The form of this request used for writes: readable properties are
    /// mapped to their settable counterparts and the event is forced to
    /// [`EventSpec::Never`].
    pub fn for_setting(&self) -> Self {
        let property = match self.property {
            Property::Reading => Property::Setting,
            Property::Status => Property::Control,
            other => other,
        };
        Self {
            property,
            event: EventSpec::Never,
            ..self.clone()
        }
    }

    /// Canonical request string, as carried in `ListAdd`.
    pub fn to_drf(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for DeviceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.device, self.property)?;
        if let Some(field) = &self.field {
            write!(f, ".{}", field.to_uppercase())?;
        }
        match self.range {
            Some(Range::Array { start, end: Some(end) }) => write!(f, "[{start}:{end}]")?,
            Some(Range::Array { start, end: None }) => write!(f, "[{start}:]")?,
            Some(Range::Bytes { offset, length }) => write!(f, "{{{offset}:{length}}}")?,
            None => {}
        }
        write!(f, "{}", self.event)
    }
}

impl From<&str> for DeviceRequest {
    fn from(device: &str) -> Self {
        Self::new(device)
    }
}

impl From<String> for DeviceRequest {
    fn from(device: String) -> Self {
        Self::new(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_default_request() {
        assert_eq!(DeviceRequest::new("M:OUTTMP").to_drf(), "M:OUTTMP.READING");
    }

    #[test]
    fn renders_all_qualifiers() {
        let req = DeviceRequest::new("B:IRING")
            .with_property(Property::Analog)
            .with_field("min")
            .with_range(Range::Array { start: 0, end: Some(4) })
            .with_event(EventSpec::Periodic {
                period: Duration::from_millis(500),
            });
        assert_eq!(req.to_drf(), "B:IRING.ANALOG.MIN[0:4]@p,500");
    }

    #[test]
    fn renders_byte_range_and_clock_event() {
        let req = DeviceRequest::new("G:AMANDA")
            .with_range(Range::Bytes { offset: 2, length: 8 })
            .with_event(EventSpec::Clock { event: 0x2 });
        assert_eq!(req.to_drf(), "G:AMANDA.READING{2:8}@e,02");
    }

    #[test]
    fn setting_form_forces_never_event() {
        let req = DeviceRequest::new("Z:ACLTST").with_event(EventSpec::Immediate);
        let setting = req.for_setting();
        assert_eq!(setting.property(), Property::Setting);
        assert_eq!(setting.event(), EventSpec::Never);
        assert_eq!(setting.to_drf(), "Z:ACLTST.SETTING@N");

        let status = DeviceRequest::new("Z:ACLTST").with_property(Property::Status);
        assert_eq!(status.for_setting().property(), Property::Control);
    }
}
