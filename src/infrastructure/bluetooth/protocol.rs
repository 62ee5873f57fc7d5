//! FNIRSI IR40 Protocol
//!
//! This module contains the protocol definitions for communicating with
//! the IR40 laser distance meter

use crate::domain::errors::Rejection;
use crate::domain::models::{Endianness, Measurement, MeasurementField};
use tracing::trace;

/// Write Characteristic UUID - where commands are sent
pub const WRITE_CHAR_UUID: &str = "0000ee03-0000-1000-8000-00805f9b34fb";

/// Notify Characteristic UUID - where measurement frames are received
pub const NOTIFY_CHAR_UUID: &str = "0000ee02-0000-1000-8000-00805f9b34fb";

/// Shortest frame that can carry a measurement
pub const MIN_FRAME_LEN: usize = 17;

/// Device commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Keep-alive; the device powers down its link when idle
    Heartbeat,
    /// Fire the laser and report one measurement
    Trigger,
}

impl DeviceCommand {
    /// Get the raw bytes for this command
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Self::Heartbeat => &[0x00, 0x01, 0x02, 0x01, 0x05, 0x00, 0x00, 0x00, 0x01],
            Self::Trigger => &[0x00, 0x07, 0x02, 0x08, 0x0E, 0x00, 0x00, 0x00, 0x01],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::Trigger => "trigger",
        }
    }
}

/// Decode one notification frame
///
/// # Measurement Frame Structure (17+ bytes)
///
/// ```text
/// [0]     : 0x00
/// [1]     : sequence / unknown
/// [2]     : 0x02 (measurement frame; heartbeat echoes use other values)
/// [3-13]  : unknown
/// [14-15] : distance in mm (u16, byte order depends on firmware)
/// [16]    : high byte of distance on 24-bit LE firmware, otherwise unused
/// ```
pub fn decode(frame: &[u8], field: MeasurementField) -> Result<Measurement, Rejection> {
    let min = MIN_FRAME_LEN.max(field.end());
    if frame.len() < min {
        return Err(Rejection::TooShort {
            len: frame.len(),
            min,
        });
    }

    if frame[0] != 0x00 || frame[2] != 0x02 {
        return Err(Rejection::NotAMeasurementFrame);
    }

    let bytes = &frame[field.offset..field.end()];
    let value_mm = match field.endianness {
        Endianness::Big => bytes.iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b)),
        Endianness::Little => bytes
            .iter()
            .rev()
            .fold(0u32, |acc, &b| (acc << 8) | u32::from(b)),
    };

    if value_mm == 0 {
        return Err(Rejection::ZeroValue);
    }

    trace!("Decoded {}mm from {:02X?} ({})", value_mm, bytes, field);

    Ok(Measurement { value_mm, field })
}
