//! Scripted in-memory transport for session tests

use crate::domain::errors::TransportError;
use crate::domain::gatt::{Capability, ObjectEntry, ObjectTree, PropertyValue, PROP_ADDRESS, PROP_ALIAS};
use crate::domain::models::{DeviceHandle, ObjectPath, RawFrame};
use crate::infrastructure::bluetooth::protocol::{DeviceCommand, NOTIFY_CHAR_UUID, WRITE_CHAR_UUID};
use crate::infrastructure::bluetooth::transport::{BleTransport, TransportEvent, WriteOptions};
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

pub fn ir40_device() -> DeviceHandle {
    DeviceHandle {
        name: "IR40".to_string(),
        address: "AA:BB:CC:DD:EE:FF".to_string(),
        path: ObjectPath::from("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF"),
    }
}

/// Object tree of an IR40 as BlueZ reports it
pub fn ir40_tree(device: &DeviceHandle) -> ObjectTree {
    let mut tree = ObjectTree::new();
    tree.insert(
        device.path.clone(),
        ObjectEntry::default()
            .with_capability(Capability::Device)
            .with_property(PROP_ALIAS, PropertyValue::Text(device.name.clone()))
            .with_property(PROP_ADDRESS, PropertyValue::Text(device.address.clone())),
    );
    let service = device.path.join("service000c");
    tree.insert(
        service.clone(),
        ObjectEntry::default().with_capability(Capability::GattService),
    );
    tree.insert_characteristic(service.join("char000d"), NOTIFY_CHAR_UUID, &["notify"]);
    tree.insert_characteristic(
        service.join("char0010"),
        WRITE_CHAR_UUID,
        &["write", "write-without-response"],
    );
    tree
}

#[derive(Debug, Clone)]
pub struct FakeBehaviour {
    pub already_connected: bool,
    /// Connect sleeps this long before succeeding
    pub connect_delay: Option<Duration>,
    /// Connect succeeds but the link is down right after
    pub drop_link_after_connect: bool,
    pub connect_error: Option<TransportError>,
    /// Number of negative "services resolved" answers; `None` never resolves
    pub services_resolved_after: Option<u32>,
    pub subscribe_error: Option<TransportError>,
    /// Subscribe registers the channel, then takes this long to confirm
    pub subscribe_delay: Option<Duration>,
    /// Each write takes this long to complete
    pub write_delay: Option<Duration>,
    /// Every write fails with this error
    pub write_error: Option<TransportError>,
    /// Writes with this index or later fail
    pub fail_writes_from: Option<usize>,
}

impl Default for FakeBehaviour {
    fn default() -> Self {
        Self {
            already_connected: false,
            connect_delay: None,
            drop_link_after_connect: false,
            connect_error: None,
            services_resolved_after: Some(0),
            subscribe_error: None,
            subscribe_delay: None,
            write_delay: None,
            write_error: None,
            fail_writes_from: None,
        }
    }
}

#[derive(Default)]
struct Recorded {
    link_up: bool,
    in_flight: usize,
    max_in_flight: usize,
    connects: u32,
    service_polls: u32,
    subscriptions: u32,
    unsubscriptions: u32,
    disconnects: u32,
    write_attempts: usize,
    writes: Vec<(ObjectPath, Vec<u8>)>,
    events: Option<mpsc::Sender<TransportEvent>>,
}

pub struct FakeTransport {
    tree: ObjectTree,
    behaviour: FakeBehaviour,
    recorded: Mutex<Recorded>,
}

impl FakeTransport {
    pub fn new(tree: ObjectTree, behaviour: FakeBehaviour) -> Self {
        let recorded = Recorded {
            link_up: behaviour.already_connected,
            ..Default::default()
        };
        Self {
            tree,
            behaviour,
            recorded: Mutex::new(recorded),
        }
    }

    fn recorded(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap()
    }

    /// Deliver a notification as the device would
    pub async fn push_frame(&self, bytes: Vec<u8>) {
        let sender = self.recorded().events.clone().expect("not subscribed");
        sender.send(TransportEvent::Frame(RawFrame::from(bytes))).await.unwrap();
    }

    /// Report a lost link
    pub async fn drop_link(&self) {
        let sender = self.recorded().events.clone().expect("not subscribed");
        sender.send(TransportEvent::Disconnected).await.unwrap();
    }

    pub fn writes(&self) -> Vec<(ObjectPath, Vec<u8>)> {
        self.recorded().writes.clone()
    }

    fn count_writes(&self, command: DeviceCommand) -> usize {
        self.recorded()
            .writes
            .iter()
            .filter(|(_, bytes)| bytes.as_slice() == command.as_bytes())
            .count()
    }

    pub fn heartbeat_writes(&self) -> usize {
        self.count_writes(DeviceCommand::Heartbeat)
    }

    pub fn trigger_writes(&self) -> usize {
        self.count_writes(DeviceCommand::Trigger)
    }

    /// Highest number of writes that were running at the same time
    pub fn max_writes_in_flight(&self) -> usize {
        self.recorded().max_in_flight
    }

    pub fn write_attempts(&self) -> usize {
        self.recorded().write_attempts
    }

    pub fn connects(&self) -> u32 {
        self.recorded().connects
    }

    pub fn service_polls(&self) -> u32 {
        self.recorded().service_polls
    }

    pub fn subscriptions(&self) -> u32 {
        self.recorded().subscriptions
    }

    pub fn unsubscriptions(&self) -> u32 {
        self.recorded().unsubscriptions
    }

    pub fn disconnects(&self) -> u32 {
        self.recorded().disconnects
    }
}

#[async_trait]
impl BleTransport for FakeTransport {
    async fn discover_devices(&self, _timeout: Duration) -> Result<Vec<DeviceHandle>, TransportError> {
        Ok(vec![ir40_device()])
    }

    async fn connect(&self, _device: &DeviceHandle, _timeout: Duration) -> Result<(), TransportError> {
        self.recorded().connects += 1;
        if let Some(delay) = self.behaviour.connect_delay {
            tokio::time::sleep(delay).await;
        }
        match &self.behaviour.connect_error {
            Some(e) => Err(e.clone()),
            None => {
                self.recorded().link_up = !self.behaviour.drop_link_after_connect;
                Ok(())
            }
        }
    }

    async fn is_connected(&self, _device: &DeviceHandle) -> bool {
        self.recorded().link_up
    }

    async fn are_services_resolved(&self, _device: &DeviceHandle) -> bool {
        let mut recorded = self.recorded();
        let negative_answers = recorded.service_polls;
        recorded.service_polls += 1;
        match self.behaviour.services_resolved_after {
            Some(after) => negative_answers >= after,
            None => false,
        }
    }

    async fn enumerate_gatt_objects(&self) -> Result<ObjectTree, TransportError> {
        Ok(self.tree.clone())
    }

    async fn subscribe_notify(
        &self,
        characteristic: &ObjectPath,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<(), TransportError> {
        if let Some(e) = &self.behaviour.subscribe_error {
            return Err(e.clone());
        }
        if self.tree.get(characteristic).is_none() {
            return Err(TransportError::UnknownCharacteristic(characteristic.to_string()));
        }
        {
            let mut recorded = self.recorded();
            recorded.subscriptions += 1;
            recorded.events = Some(events);
        }
        if let Some(delay) = self.behaviour.subscribe_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn unsubscribe_notify(&self, _characteristic: &ObjectPath) -> Result<(), TransportError> {
        let mut recorded = self.recorded();
        recorded.unsubscriptions += 1;
        recorded.events = None;
        Ok(())
    }

    async fn write_value(
        &self,
        characteristic: &ObjectPath,
        value: &[u8],
        _options: WriteOptions,
    ) -> Result<(), TransportError> {
        let index = {
            let mut recorded = self.recorded();
            recorded.write_attempts += 1;
            recorded.in_flight += 1;
            recorded.max_in_flight = recorded.max_in_flight.max(recorded.in_flight);
            recorded.write_attempts - 1
        };
        if let Some(delay) = self.behaviour.write_delay {
            tokio::time::sleep(delay).await;
        }

        let mut recorded = self.recorded();
        recorded.in_flight -= 1;
        if let Some(e) = &self.behaviour.write_error {
            return Err(e.clone());
        }
        if matches!(self.behaviour.fail_writes_from, Some(from) if index >= from) {
            return Err(TransportError::Platform("write rejected".into()));
        }
        recorded.writes.push((characteristic.clone(), value.to_vec()));
        Ok(())
    }

    async fn disconnect(&self, _device: &DeviceHandle) -> Result<(), TransportError> {
        self.recorded().disconnects += 1;
        Ok(())
    }
}
