//! Bluetooth Module
//!
//! Provides BLE communication with the IR40 laser distance meter.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     DeviceSession                        │
//! │   (State machine - public API for the application)       │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌────────────┐  ┌────────────┐  ┌──────────┐
//! │ Transport  │  │  Resolver  │  │ Protocol │
//! │            │  │            │  │          │
//! │ - WinRT    │  │ - GATT     │  │ - UUIDs  │
//! │ - BlueZ    │  │   lookup   │  │ - Commands│
//! │            │  │            │  │ - Decoding│
//! └────────────┘  └────────────┘  └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Device protocol definitions, commands, and frame decoding
//! - [`resolver`] - Write/notify characteristic lookup in a GATT object tree
//! - [`transport`] - The [`BleTransport`] seam implemented per platform
//! - [`session`] - Connection lifecycle, keep-alive and notification handling

pub mod protocol;
pub mod resolver;
pub mod session;
pub mod transport;

#[cfg(all(target_os = "linux", feature = "bluez"))]
pub mod bluez;
#[cfg(windows)]
pub mod winrt;

#[cfg(test)]
pub(crate) mod fake;

pub use session::{DecodeStats, DeviceSession, SessionConfig};
pub use transport::{BleTransport, TransportEvent, WriteOptions};

use std::sync::Arc;

/// The transport for the platform this binary was built for, if any
pub async fn platform_transport() -> anyhow::Result<Arc<dyn BleTransport>> {
    #[cfg(windows)]
    {
        Ok(Arc::new(winrt::WinRtTransport::new()))
    }

    #[cfg(all(target_os = "linux", feature = "bluez"))]
    {
        Ok(Arc::new(bluez::BlueZTransport::new().await?))
    }

    #[cfg(not(any(windows, all(target_os = "linux", feature = "bluez"))))]
    {
        anyhow::bail!(
            "No BLE transport available on this platform (on Linux, build with --features bluez)"
        )
    }
}
