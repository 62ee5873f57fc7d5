use crate::domain::errors::FailureReason;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Byte order of the measurement field inside a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endianness {
    Big,
    Little,
}

/// Where the distance value sits in a measurement frame and how to read it.
///
/// Two firmware revisions are known in the field and they disagree, so the
/// layout is always configured explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeasurementField {
    pub offset: usize,
    /// Field width in bytes (2 or 3)
    pub width: usize,
    pub endianness: Endianness,
}

impl MeasurementField {
    /// Bytes 14-15, big-endian
    pub const BIG_ENDIAN_U16: Self = Self {
        offset: 14,
        width: 2,
        endianness: Endianness::Big,
    };

    /// Bytes 14-15, little-endian
    pub const LITTLE_ENDIAN_U16: Self = Self {
        offset: 14,
        width: 2,
        endianness: Endianness::Little,
    };

    /// Bytes 14-16, little-endian
    pub const LITTLE_ENDIAN_U24: Self = Self {
        offset: 14,
        width: 3,
        endianness: Endianness::Little,
    };

    /// One past the last byte this field reads
    pub fn end(&self) -> usize {
        self.offset + self.width
    }
}

impl Default for MeasurementField {
    fn default() -> Self {
        Self::BIG_ENDIAN_U16
    }
}

impl fmt::Display for MeasurementField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let order = match self.endianness {
            Endianness::Big => "BE",
            Endianness::Little => "LE",
        };
        write!(f, "bytes {}..{} {}", self.offset, self.end(), order)
    }
}

/// Firmware variant selectable from settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirmwareVariant {
    #[default]
    BigEndianU16,
    LittleEndianU16,
    LittleEndianU24,
}

impl From<FirmwareVariant> for MeasurementField {
    fn from(variant: FirmwareVariant) -> Self {
        match variant {
            FirmwareVariant::BigEndianU16 => MeasurementField::BIG_ENDIAN_U16,
            FirmwareVariant::LittleEndianU16 => MeasurementField::LITTLE_ENDIAN_U16,
            FirmwareVariant::LittleEndianU24 => MeasurementField::LITTLE_ENDIAN_U24,
        }
    }
}

/// A decoded distance reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measurement {
    pub value_mm: u32,
    /// Layout the value was read with
    pub field: MeasurementField,
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}mm", self.value_mm)
    }
}

/// Payload of a single GATT value-changed event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame(Box<[u8]>);

impl RawFrame {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for RawFrame {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes.into_boxed_slice())
    }
}

impl From<&[u8]> for RawFrame {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.into())
    }
}

/// Transport-specific object path, e.g. `/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectPath(String);

impl ObjectPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Child path built by appending one segment
    pub fn join(&self, segment: &str) -> Self {
        Self(format!("{}/{}", self.0.trim_end_matches('/'), segment))
    }

    /// True when `self` lies strictly below `ancestor` in the path hierarchy.
    ///
    /// Segment aware: `/dev_A1/char0001` is not a descendant of `/dev_A`.
    pub fn is_descendant_of(&self, ancestor: &ObjectPath) -> bool {
        let ancestor = ancestor.0.trim_end_matches('/');
        match self.0.strip_prefix(ancestor) {
            Some(rest) => rest.len() > 1 && rest.starts_with('/'),
            None => false,
        }
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectPath {
    fn from(path: &str) -> Self {
        Self(path.to_string())
    }
}

/// A device found by enumeration, selected once per session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub name: String,
    pub address: String,
    pub path: ObjectPath,
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// Lifecycle of a device session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    ResolvingServices,
    ResolvingCharacteristics,
    Subscribing,
    Armed,
    Closed,
    Failed(FailureReason),
}

impl SessionState {
    /// `Closed` and `Failed` never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::ResolvingServices => "resolving-services",
            Self::ResolvingCharacteristics => "resolving-characteristics",
            Self::Subscribing => "subscribing",
            Self::Armed => "armed",
            Self::Closed => "closed",
            Self::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "failed: {}", reason),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum AppEvent {
    Measurement(Measurement),
    SessionState(SessionState),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
