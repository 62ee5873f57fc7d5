//! WinRT Transport
//!
//! [`BleTransport`] on top of `Windows.Devices.Bluetooth`. WinRT has no
//! object tree, so one is synthesized from the GATT services of the connected
//! device, keyed by attribute handle: `/winrt/dev_<addr>/service<h>/char<h>`.

use crate::domain::errors::TransportError;
use crate::domain::gatt::{
    Capability, ObjectEntry, ObjectTree, PropertyValue, PROP_ADDRESS, PROP_ALIAS, PROP_FLAGS,
    PROP_UUID,
};
use crate::domain::models::{DeviceHandle, ObjectPath, RawFrame};
use crate::domain::settings::CommandWriteType;
use crate::infrastructure::bluetooth::transport::{BleTransport, TransportEvent, WriteOptions};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, trace, warn};
use windows::core::GUID;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattCharacteristicProperties,
    GattClientCharacteristicConfigurationDescriptorValue, GattCommunicationStatus,
    GattDeviceService, GattSession, GattValueChangedEventArgs, GattWriteOption,
};
use windows::Devices::Bluetooth::{
    BluetoothCacheMode, BluetoothConnectionStatus, BluetoothLEDevice,
};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

/// Notification subscription attempts before giving up
const NOTIFY_ATTEMPTS: u32 = 3;
const NOTIFY_RETRY_DELAY: Duration = Duration::from_millis(500);

fn platform(e: windows::core::Error) -> TransportError {
    TransportError::Platform(e.to_string())
}

/// `AA:BB:CC:DD:EE:FF` form of a 48-bit address
fn format_address(address: u64) -> String {
    (0..6)
        .rev()
        .map(|i| format!("{:02X}", (address >> (i * 8)) & 0xFF))
        .collect::<Vec<_>>()
        .join(":")
}

fn parse_address(address: &str) -> Result<u64, TransportError> {
    let hex: String = address.chars().filter(|c| *c != ':').collect();
    if hex.len() != 12 {
        return Err(TransportError::DeviceNotFound(address.to_string()));
    }
    u64::from_str_radix(&hex, 16).map_err(|_| TransportError::DeviceNotFound(address.to_string()))
}

fn device_path(address: u64) -> ObjectPath {
    ObjectPath::new(format!(
        "/winrt/dev_{}",
        format_address(address).replace(':', "_")
    ))
}

/// Lower-case hyphenated form, as BlueZ reports UUIDs
fn guid_to_string(guid: &GUID) -> String {
    format!(
        "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        guid.data1,
        guid.data2,
        guid.data3,
        guid.data4[0],
        guid.data4[1],
        guid.data4[2],
        guid.data4[3],
        guid.data4[4],
        guid.data4[5],
        guid.data4[6],
        guid.data4[7]
    )
}

fn flag_names(properties: GattCharacteristicProperties) -> Vec<String> {
    let known = [
        (GattCharacteristicProperties::Read, "read"),
        (GattCharacteristicProperties::Write, "write"),
        (
            GattCharacteristicProperties::WriteWithoutResponse,
            "write-without-response",
        ),
        (GattCharacteristicProperties::Notify, "notify"),
        (GattCharacteristicProperties::Indicate, "indicate"),
    ];
    known
        .iter()
        .filter(|(flag, _)| properties.0 & flag.0 != 0)
        .map(|(_, name)| name.to_string())
        .collect()
}

fn read_buffer(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let length = reader.UnconsumedBufferLength()? as usize;
    let mut bytes = vec![0u8; length];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

#[derive(Default)]
struct Connected {
    device: Option<BluetoothLEDevice>,
    path: Option<ObjectPath>,
    session: Option<GattSession>,
    services: Vec<GattDeviceService>,
    characteristics: HashMap<ObjectPath, GattCharacteristic>,
    value_tokens: HashMap<ObjectPath, i64>,
    status_token: Option<i64>,
}

/// BLE transport backed by WinRT
pub struct WinRtTransport {
    connected: Mutex<Connected>,
    /// Queues told about a lost link
    listeners: Arc<Mutex<Vec<mpsc::Sender<TransportEvent>>>>,
}

impl WinRtTransport {
    pub fn new() -> Self {
        Self {
            connected: Mutex::new(Connected::default()),
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Connected> {
        self.connected.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn device(&self) -> Result<BluetoothLEDevice, TransportError> {
        self.lock().device.clone().ok_or(TransportError::NotConnected)
    }

    fn characteristic(&self, path: &ObjectPath) -> Result<GattCharacteristic, TransportError> {
        self.lock()
            .characteristics
            .get(path)
            .cloned()
            .ok_or_else(|| TransportError::UnknownCharacteristic(path.to_string()))
    }

    /// Create a GattSession to maintain the BLE connection
    async fn create_gatt_session(
        device: &BluetoothLEDevice,
    ) -> windows::core::Result<GattSession> {
        let device_id = device.BluetoothDeviceId()?;
        let session = GattSession::FromDeviceIdAsync(&device_id)?.await?;
        session.SetMaintainConnection(true)?;
        Ok(session)
    }

    fn watch_connection_status(&self, device: &BluetoothLEDevice) -> windows::core::Result<i64> {
        let listeners = Arc::clone(&self.listeners);
        let handler =
            TypedEventHandler::new(move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
                if let Some(dev) = dev.as_ref() {
                    if dev.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                        info!("Device reported disconnection");
                        let listeners = listeners.lock().unwrap_or_else(PoisonError::into_inner);
                        for listener in listeners.iter() {
                            let _ = listener.try_send(TransportEvent::Disconnected);
                        }
                    }
                }
                Ok(())
            });
        device.ConnectionStatusChanged(&handler)
    }

    async fn enable_notifications(characteristic: &GattCharacteristic) -> Result<(), TransportError> {
        for attempt in 1..=NOTIFY_ATTEMPTS {
            let result = match characteristic
                .WriteClientCharacteristicConfigurationDescriptorAsync(
                    GattClientCharacteristicConfigurationDescriptorValue::Notify,
                ) {
                Ok(operation) => operation.await,
                Err(e) => Err(e),
            };

            match result {
                Ok(GattCommunicationStatus::Success) => return Ok(()),
                Ok(status) => warn!(
                    "Notification subscription attempt {} returned status: {:?}",
                    attempt, status
                ),
                Err(e) => warn!("Notification subscription attempt {} failed: {}", attempt, e),
            }

            if attempt < NOTIFY_ATTEMPTS {
                tokio::time::sleep(NOTIFY_RETRY_DELAY).await;
            }
        }
        Err(TransportError::Platform(format!(
            "failed to enable notifications after {} attempts",
            NOTIFY_ATTEMPTS
        )))
    }
}

impl Default for WinRtTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BleTransport for WinRtTransport {
    async fn discover_devices(&self, timeout: Duration) -> Result<Vec<DeviceHandle>, TransportError> {
        info!("Scanning for BLE devices for {:?}...", timeout);
        let found: Arc<Mutex<Vec<DeviceHandle>>> = Arc::new(Mutex::new(Vec::new()));

        let watcher = BluetoothLEAdvertisementWatcher::new().map_err(platform)?;
        watcher
            .SetScanningMode(BluetoothLEScanningMode::Active)
            .map_err(platform)?;

        let sink = Arc::clone(&found);
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let name = args.Advertisement()?.LocalName()?.to_string();
                    let address = args.BluetoothAddress()?;
                    let mut found = sink.lock().unwrap_or_else(PoisonError::into_inner);

                    match found.iter_mut().find(|d| d.path == device_path(address)) {
                        // a scan response may carry the name the first advertisement lacked
                        Some(known) if known.name == "Unknown" && !name.is_empty() => known.name = name,
                        Some(_) => {}
                        None => {
                            trace!("Discovered {:#X} '{}'", address, name);
                            found.push(DeviceHandle {
                                name: if name.is_empty() { "Unknown".to_string() } else { name },
                                address: format_address(address),
                                path: device_path(address),
                            });
                        }
                    }
                }
                Ok(())
            },
        );

        watcher.Received(&handler).map_err(platform)?;
        watcher.Start().map_err(platform)?;
        tokio::time::sleep(timeout).await;
        watcher.Stop().map_err(platform)?;

        let devices = found.lock().unwrap_or_else(PoisonError::into_inner).clone();
        info!("Scan finished, {} devices found", devices.len());
        Ok(devices)
    }

    async fn connect(&self, device: &DeviceHandle, _timeout: Duration) -> Result<(), TransportError> {
        let address = parse_address(&device.address)?;
        info!("Connecting to Bluetooth device: {:#X}", address);

        let le_device = BluetoothLEDevice::FromBluetoothAddressAsync(address)
            .map_err(platform)?
            .await
            .map_err(|_| TransportError::DeviceNotFound(device.address.clone()))?;

        let session = match Self::create_gatt_session(&le_device).await {
            Ok(session) => {
                debug!("GattSession created, MaintainConnection set to true");
                Some(session)
            }
            Err(e) => {
                warn!("Failed to create GattSession, continuing anyway: {}", e);
                None
            }
        };

        // WinRT connects lazily; an uncached service query forces the link up
        let result = le_device
            .GetGattServicesWithCacheModeAsync(BluetoothCacheMode::Uncached)
            .map_err(platform)?
            .await
            .map_err(platform)?;
        let status = result.Status().map_err(platform)?;
        if status != GattCommunicationStatus::Success {
            return Err(TransportError::Platform(format!(
                "failed to get GATT services: {:?}",
                status
            )));
        }
        let services: Vec<GattDeviceService> =
            result.Services().map_err(platform)?.into_iter().collect();
        debug!("Device exposes {} services", services.len());

        let status_token = self.watch_connection_status(&le_device).map_err(platform)?;

        let mut connected = self.lock();
        connected.device = Some(le_device);
        connected.path = Some(device.path.clone());
        connected.session = session;
        connected.services = services;
        connected.status_token = Some(status_token);
        Ok(())
    }

    async fn is_connected(&self, _device: &DeviceHandle) -> bool {
        self.lock()
            .device
            .as_ref()
            .and_then(|d| d.ConnectionStatus().ok())
            .map(|s| s == BluetoothConnectionStatus::Connected)
            .unwrap_or(false)
    }

    async fn are_services_resolved(&self, device: &DeviceHandle) -> bool {
        self.is_connected(device).await && !self.lock().services.is_empty()
    }

    async fn enumerate_gatt_objects(&self) -> Result<ObjectTree, TransportError> {
        let (device, device_path, services) = {
            let connected = self.lock();
            match (&connected.device, &connected.path) {
                (Some(device), Some(path)) => {
                    (device.clone(), path.clone(), connected.services.clone())
                }
                _ => return Err(TransportError::NotConnected),
            }
        };

        let mut tree = ObjectTree::new();
        let address = device.BluetoothAddress().map_err(platform)?;
        tree.insert(
            device_path.clone(),
            ObjectEntry::default()
                .with_capability(Capability::Device)
                .with_property(
                    PROP_ALIAS,
                    PropertyValue::Text(device.Name().map(|n| n.to_string()).unwrap_or_default()),
                )
                .with_property(PROP_ADDRESS, PropertyValue::Text(format_address(address))),
        );

        let mut characteristics = HashMap::new();
        for service in &services {
            let handle = service.AttributeHandle().map_err(platform)?;
            let service_path = device_path.join(&format!("service{:04x}", handle));
            tree.insert(
                service_path.clone(),
                ObjectEntry::default()
                    .with_capability(Capability::GattService)
                    .with_property(
                        PROP_UUID,
                        PropertyValue::Text(guid_to_string(&service.Uuid().map_err(platform)?)),
                    ),
            );

            let access = service.RequestAccessAsync().map_err(platform)?.await;
            trace!("Service {:04x} access status: {:?}", handle, access);

            let result = service
                .GetCharacteristicsAsync()
                .map_err(platform)?
                .await
                .map_err(platform)?;
            if result.Status().map_err(platform)? != GattCommunicationStatus::Success {
                warn!("Could not read characteristics of service {:04x}", handle);
                continue;
            }

            for characteristic in result.Characteristics().map_err(platform)? {
                let handle = characteristic.AttributeHandle().map_err(platform)?;
                let path = service_path.join(&format!("char{:04x}", handle));
                let uuid = guid_to_string(&characteristic.Uuid().map_err(platform)?);
                let flags = characteristic
                    .CharacteristicProperties()
                    .map(flag_names)
                    .unwrap_or_default();

                tree.insert(
                    path.clone(),
                    ObjectEntry::default()
                        .with_capability(Capability::GattCharacteristic)
                        .with_property(PROP_UUID, PropertyValue::Text(uuid))
                        .with_property(PROP_FLAGS, PropertyValue::TextList(flags)),
                );
                characteristics.insert(path, characteristic);
            }
        }

        debug!("Found {} characteristics", characteristics.len());
        self.lock().characteristics = characteristics;
        Ok(tree)
    }

    async fn subscribe_notify(
        &self,
        characteristic: &ObjectPath,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<(), TransportError> {
        let target = self.characteristic(characteristic)?;

        let sender = events.clone();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let bytes = read_buffer(&args.CharacteristicValue()?)?;
                    match sender.try_send(TransportEvent::Frame(RawFrame::from(bytes))) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => warn!("Notification queue full, frame dropped"),
                        Err(TrySendError::Closed(_)) => trace!("Notification queue closed"),
                    }
                }
                Ok(())
            },
        );
        let token = target.ValueChanged(&handler).map_err(platform)?;

        if let Err(e) = Self::enable_notifications(&target).await {
            let _ = target.RemoveValueChanged(token);
            return Err(e);
        }
        info!("Notifications enabled on {}", characteristic);

        self.lock().value_tokens.insert(characteristic.clone(), token);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(events);
        Ok(())
    }

    async fn unsubscribe_notify(&self, characteristic: &ObjectPath) -> Result<(), TransportError> {
        let target = self.characteristic(characteristic)?;
        if let Some(token) = self.lock().value_tokens.remove(characteristic) {
            target.RemoveValueChanged(token).map_err(platform)?;
        }
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let status = target
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::None,
            )
            .map_err(platform)?
            .await
            .map_err(platform)?;
        if status != GattCommunicationStatus::Success {
            return Err(TransportError::Platform(format!(
                "failed to disable notifications: {:?}",
                status
            )));
        }
        Ok(())
    }

    async fn write_value(
        &self,
        characteristic: &ObjectPath,
        value: &[u8],
        options: WriteOptions,
    ) -> Result<(), TransportError> {
        let target = self.characteristic(characteristic)?;

        let writer = DataWriter::new().map_err(platform)?;
        writer.WriteBytes(value).map_err(platform)?;
        let buffer = writer.DetachBuffer().map_err(platform)?;

        let option = match options.write_type {
            CommandWriteType::Command => GattWriteOption::WriteWithoutResponse,
            CommandWriteType::Request => GattWriteOption::WriteWithResponse,
        };
        let status = target
            .WriteValueWithOptionAsync(&buffer, option)
            .map_err(platform)?
            .await
            .map_err(platform)?;

        match status {
            GattCommunicationStatus::Success => Ok(()),
            GattCommunicationStatus::Unreachable => Err(TransportError::NotConnected),
            other => Err(TransportError::Platform(format!("write failed: {:?}", other))),
        }
    }

    async fn disconnect(&self, _device: &DeviceHandle) -> Result<(), TransportError> {
        let connected = std::mem::take(&mut *self.lock());
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        for (path, token) in &connected.value_tokens {
            if let Some(characteristic) = connected.characteristics.get(path) {
                let _ = characteristic.RemoveValueChanged(*token);
            }
        }
        for service in &connected.services {
            let _ = service.Close();
        }
        if let Some(session) = &connected.session {
            let _ = session.Close();
        }
        if let Some(device) = &connected.device {
            if let Some(token) = connected.status_token {
                let _ = device.RemoveConnectionStatusChanged(token);
            }
            device.Close().map_err(platform)?;
            info!("Disconnected from device");
        }
        Ok(())
    }
}
