//! Transport seam between the session and a platform BLE stack

use crate::domain::errors::TransportError;
use crate::domain::gatt::ObjectTree;
use crate::domain::models::{DeviceHandle, ObjectPath, RawFrame};
use crate::domain::settings::CommandWriteType;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// Events pushed by the transport into a session's queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(RawFrame),
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteOptions {
    pub write_type: CommandWriteType,
}

/// Platform BLE stack as seen by a [`DeviceSession`](super::DeviceSession).
///
/// `subscribe_notify` hands the transport the sending half of a bounded
/// channel; every value-changed event on the characteristic becomes one
/// [`TransportEvent::Frame`], and a lost link becomes
/// [`TransportEvent::Disconnected`].
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Enumerate devices the adapter knows about or can see
    async fn discover_devices(&self, timeout: Duration) -> Result<Vec<DeviceHandle>, TransportError>;

    async fn connect(&self, device: &DeviceHandle, timeout: Duration) -> Result<(), TransportError>;

    async fn is_connected(&self, device: &DeviceHandle) -> bool;

    async fn are_services_resolved(&self, device: &DeviceHandle) -> bool;

    async fn enumerate_gatt_objects(&self) -> Result<ObjectTree, TransportError>;

    async fn subscribe_notify(
        &self,
        characteristic: &ObjectPath,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<(), TransportError>;

    async fn unsubscribe_notify(&self, characteristic: &ObjectPath) -> Result<(), TransportError>;

    async fn write_value(
        &self,
        characteristic: &ObjectPath,
        value: &[u8],
        options: WriteOptions,
    ) -> Result<(), TransportError>;

    async fn disconnect(&self, device: &DeviceHandle) -> Result<(), TransportError>;
}
