//! Error types for the device session
//!
//! Decoder rejections are local and only counted. Transport and configuration
//! failures end the session in [`SessionState::Failed`](crate::domain::models::SessionState).

use thiserror::Error;

/// Why a notification frame did not produce a measurement
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rejection {
    #[error("frame too short: {len} bytes (need at least {min})")]
    TooShort { len: usize, min: usize },

    #[error("not a measurement frame")]
    NotAMeasurementFrame,

    #[error("zero value")]
    ZeroValue,
}

/// Characteristic lookup failure over a GATT object tree
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveError {
    #[error("write characteristic not found")]
    MissingWrite,

    #[error("notify characteristic not found")]
    MissingNotify,

    #[error("neither write nor notify characteristic found")]
    MissingBoth,
}

/// Errors reported by a [`BleTransport`](crate::infrastructure::bluetooth::BleTransport)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("BLE adapter not available")]
    AdapterNotAvailable,

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("device not connected")]
    NotConnected,

    #[error("unknown characteristic: {0}")]
    UnknownCharacteristic(String),

    #[error("operation timed out")]
    Timeout,

    #[error("{0}")]
    Platform(String),
}

/// Error taxonomy for session failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connect, subscribe and write failures
    Transport,
    /// Device does not expose what the session needs; retrying will not help
    Configuration,
}

/// Reason code carried by a failed session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    #[error("connect timed out")]
    ConnectTimeout,

    #[error("connect failed: {0}")]
    ConnectError(TransportError),

    #[error("services not resolved after {attempts} attempts")]
    ServicesNotResolved { attempts: u32 },

    #[error("object tree unavailable: {0}")]
    EnumerationError(TransportError),

    #[error("required characteristics missing: {0}")]
    CharacteristicsMissing(ResolveError),

    #[error("subscribe failed: {0}")]
    SubscribeError(TransportError),

    #[error("heartbeat write failed: {0}")]
    HeartbeatError(TransportError),

    #[error("trigger write failed: {0}")]
    TriggerError(TransportError),

    #[error("device disconnected")]
    Disconnected,
}

impl FailureReason {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CharacteristicsMissing(_) => ErrorKind::Configuration,
            _ => ErrorKind::Transport,
        }
    }

    /// Remediation hint for the user, when there is one
    pub fn guidance(&self) -> Option<&'static str> {
        match self {
            Self::CharacteristicsMissing(_) => Some(
                "The device does not expose the expected characteristics. \
                 Remove the device from the system Bluetooth settings, re-pair it and retry.",
            ),
            Self::ServicesNotResolved { .. } => {
                Some("Move closer to the device or power-cycle it, then retry.")
            }
            Self::ConnectTimeout => Some("Make sure the device is switched on and in range."),
            _ => None,
        }
    }
}

/// Errors returned by [`DeviceSession`](crate::infrastructure::bluetooth::DeviceSession) operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("session failed: {0}")]
    Failed(FailureReason),

    #[error("session stopped before it was armed")]
    Cancelled,

    #[error("invalid session configuration: {0}")]
    InvalidConfig(String),
}
