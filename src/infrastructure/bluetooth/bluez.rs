//! BlueZ Transport
//!
//! [`BleTransport`] over the system bluetoothd via `bluer`. Object paths
//! mirror the ones BlueZ exports on D-Bus.

use crate::domain::errors::TransportError;
use crate::domain::gatt::{
    Capability, ObjectEntry, ObjectTree, PropertyValue, PROP_ADDRESS, PROP_ALIAS, PROP_FLAGS,
    PROP_UUID,
};
use crate::domain::models::{DeviceHandle, ObjectPath, RawFrame};
use crate::domain::settings::CommandWriteType;
use crate::infrastructure::bluetooth::transport::{BleTransport, TransportEvent, WriteOptions};
use async_trait::async_trait;
use bluer::gatt::remote::{Characteristic, CharacteristicWriteRequest};
use bluer::gatt::{CharacteristicFlags, WriteOp};
use bluer::{Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

fn platform(e: bluer::Error) -> TransportError {
    TransportError::Platform(e.to_string())
}

fn device_path(adapter: &str, address: Address) -> ObjectPath {
    ObjectPath::new(format!(
        "/org/bluez/{}/dev_{}",
        adapter,
        address.to_string().replace(':', "_")
    ))
}

fn flag_names(flags: &CharacteristicFlags) -> Vec<String> {
    [
        (flags.read, "read"),
        (flags.write, "write"),
        (flags.write_without_response, "write-without-response"),
        (flags.notify, "notify"),
        (flags.indicate, "indicate"),
    ]
    .iter()
    .filter(|(set, _)| *set)
    .map(|(_, name)| name.to_string())
    .collect()
}

#[derive(Default)]
struct Links {
    characteristics: HashMap<ObjectPath, Characteristic>,
    notify_tasks: HashMap<ObjectPath, JoinHandle<()>>,
    link_watch: Option<JoinHandle<()>>,
}

/// BLE transport backed by bluetoothd
pub struct BlueZTransport {
    _session: bluer::Session,
    adapter: Adapter,
    links: Mutex<Links>,
}

impl BlueZTransport {
    pub async fn new() -> Result<Self, TransportError> {
        let session = bluer::Session::new().await.map_err(platform)?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|_| TransportError::AdapterNotAvailable)?;
        adapter.set_powered(true).await.map_err(platform)?;
        info!("Using Bluetooth adapter {}", adapter.name());

        Ok(Self {
            _session: session,
            adapter,
            links: Mutex::new(Links::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Links> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn device(&self, handle: &DeviceHandle) -> Result<Device, TransportError> {
        let address: Address = handle
            .address
            .parse()
            .map_err(|_| TransportError::DeviceNotFound(handle.address.clone()))?;
        self.adapter.device(address).map_err(platform)
    }

    async fn handle(&self, address: Address) -> DeviceHandle {
        let name = match self.adapter.device(address) {
            Ok(device) => device.alias().await.unwrap_or_default(),
            Err(_) => String::new(),
        };
        DeviceHandle {
            name: if name.is_empty() { "Unknown".to_string() } else { name },
            address: address.to_string(),
            path: device_path(self.adapter.name(), address),
        }
    }

    fn characteristic(&self, path: &ObjectPath) -> Result<Characteristic, TransportError> {
        self.lock()
            .characteristics
            .get(path)
            .cloned()
            .ok_or_else(|| TransportError::UnknownCharacteristic(path.to_string()))
    }

    async fn watch_link(device: Device, events: mpsc::Sender<TransportEvent>) {
        let stream = match device.events().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Cannot watch device events: {}", e);
                return;
            }
        };
        futures::pin_mut!(stream);
        while let Some(event) = stream.next().await {
            if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                info!("Device reported disconnection");
                let _ = events.send(TransportEvent::Disconnected).await;
                return;
            }
        }
    }
}

#[async_trait]
impl BleTransport for BlueZTransport {
    async fn discover_devices(&self, timeout: Duration) -> Result<Vec<DeviceHandle>, TransportError> {
        info!("Scanning for BLE devices for {:?}...", timeout);
        let mut addresses = self.adapter.device_addresses().await.map_err(platform)?;

        let discovery = self.adapter.discover_devices().await.map_err(platform)?;
        futures::pin_mut!(discovery);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = discovery.next() => match event {
                    Some(AdapterEvent::DeviceAdded(address)) if !addresses.contains(&address) => {
                        trace!("Discovered {}", address);
                        addresses.push(address);
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }

        let mut devices = Vec::with_capacity(addresses.len());
        for address in addresses {
            devices.push(self.handle(address).await);
        }
        info!("Scan finished, {} devices known", devices.len());
        Ok(devices)
    }

    async fn connect(&self, device: &DeviceHandle, _timeout: Duration) -> Result<(), TransportError> {
        info!("Connecting to {}", device);
        self.device(device)?.connect().await.map_err(platform)
    }

    async fn is_connected(&self, device: &DeviceHandle) -> bool {
        match self.device(device) {
            Ok(device) => device.is_connected().await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn are_services_resolved(&self, device: &DeviceHandle) -> bool {
        match self.device(device) {
            Ok(device) => device.is_services_resolved().await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn enumerate_gatt_objects(&self) -> Result<ObjectTree, TransportError> {
        let mut tree = ObjectTree::new();
        let mut characteristics = HashMap::new();

        for address in self.adapter.device_addresses().await.map_err(platform)? {
            let device = self.adapter.device(address).map_err(platform)?;
            let path = device_path(self.adapter.name(), address);
            tree.insert(
                path.clone(),
                ObjectEntry::default()
                    .with_capability(Capability::Device)
                    .with_property(
                        PROP_ALIAS,
                        PropertyValue::Text(device.alias().await.unwrap_or_default()),
                    )
                    .with_property(PROP_ADDRESS, PropertyValue::Text(address.to_string())),
            );

            // services are only exported once resolved
            if !device.is_services_resolved().await.unwrap_or(false) {
                continue;
            }

            for service in device.services().await.map_err(platform)? {
                let service_path = path.join(&format!("service{:04x}", service.id()));
                let uuid = service.uuid().await.map_err(platform)?;
                tree.insert(
                    service_path.clone(),
                    ObjectEntry::default()
                        .with_capability(Capability::GattService)
                        .with_property(PROP_UUID, PropertyValue::Text(uuid.to_string())),
                );

                for characteristic in service.characteristics().await.map_err(platform)? {
                    let char_path = service_path.join(&format!("char{:04x}", characteristic.id()));
                    let uuid = characteristic.uuid().await.map_err(platform)?;
                    let flags = characteristic
                        .flags()
                        .await
                        .map(|f| flag_names(&f))
                        .unwrap_or_default();

                    tree.insert(
                        char_path.clone(),
                        ObjectEntry::default()
                            .with_capability(Capability::GattCharacteristic)
                            .with_property(PROP_UUID, PropertyValue::Text(uuid.to_string()))
                            .with_property(PROP_FLAGS, PropertyValue::TextList(flags)),
                    );
                    characteristics.insert(char_path, characteristic);
                }
            }
        }

        debug!(
            "Enumerated {} objects, {} characteristics",
            tree.len(),
            characteristics.len()
        );
        self.lock().characteristics = characteristics;
        Ok(tree)
    }

    async fn subscribe_notify(
        &self,
        characteristic: &ObjectPath,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<(), TransportError> {
        let target = self.characteristic(characteristic)?;
        let stream = target.notify().await.map_err(platform)?;
        info!("Notifications enabled on {}", characteristic);

        let sender = events.clone();
        let forward = tokio::spawn(async move {
            futures::pin_mut!(stream);
            while let Some(value) = stream.next().await {
                match sender.try_send(TransportEvent::Frame(RawFrame::from(value))) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => warn!("Notification queue full, frame dropped"),
                    Err(TrySendError::Closed(_)) => return,
                }
            }
            // bluetoothd ends the stream when the link goes away
            let _ = sender.send(TransportEvent::Disconnected).await;
        });

        let device = self
            .adapter
            .device(target.device_address())
            .map_err(platform)?;
        let watch = tokio::spawn(Self::watch_link(device, events));

        let mut links = self.lock();
        if let Some(previous) = links.notify_tasks.insert(characteristic.clone(), forward) {
            previous.abort();
        }
        if let Some(previous) = links.link_watch.replace(watch) {
            previous.abort();
        }
        Ok(())
    }

    async fn unsubscribe_notify(&self, characteristic: &ObjectPath) -> Result<(), TransportError> {
        let mut links = self.lock();
        // dropping the notify stream stops notifications
        if let Some(task) = links.notify_tasks.remove(characteristic) {
            task.abort();
        }
        if let Some(watch) = links.link_watch.take() {
            watch.abort();
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
        let request = CharacteristicWriteRequest {
            op_type: match options.write_type {
                CommandWriteType::Command => WriteOp::Command,
                CommandWriteType::Request => WriteOp::Request,
            },
            ..Default::default()
        };
        target.write_ext(value, &request).await.map_err(platform)
    }

    async fn disconnect(&self, device: &DeviceHandle) -> Result<(), TransportError> {
        {
            let mut links = self.lock();
            for (_, task) in links.notify_tasks.drain() {
                task.abort();
            }
            if let Some(watch) = links.link_watch.take() {
                watch.abort();
            }
            links.characteristics.clear();
        }
        self.device(device)?.disconnect().await.map_err(platform)?;
        info!("Disconnected from {}", device);
        Ok(())
    }
}
