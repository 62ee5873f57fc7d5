//! Device Session Module
//!
//! Drives one IR40 connection from `Idle` to `Armed`, keeps it alive, and
//! feeds notification frames through the decoder to a [`MeasurementSink`].
//!
//! ```text
//! Idle ─start()─▶ Connecting ─▶ ResolvingServices ─▶ ResolvingCharacteristics
//!                                                              │
//!                     Closed ◀─stop()─ Armed ◀─ Subscribing ◀──┘
//!
//!        any state ──(transport / configuration error)──▶ Failed(reason)
//! ```
//!
//! While `Armed`, two tasks run: one drains the transport's event queue and
//! one writes the heartbeat command on a fixed interval. Heartbeat and trigger
//! writes share a single write lock so command frames never interleave.

use crate::domain::errors::{FailureReason, Rejection, SessionError, TransportError};
use crate::domain::models::{DeviceHandle, MeasurementField, RawFrame, SessionState};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::protocol::{self, DeviceCommand};
use crate::infrastructure::bluetooth::resolver::{self, Resolution};
use crate::infrastructure::bluetooth::transport::{BleTransport, TransportEvent, WriteOptions};
use crate::infrastructure::sink::MeasurementSink;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// Configuration for session behavior
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Write characteristic UUID
    pub write_char_uuid: String,
    /// Notify characteristic UUID
    pub notify_char_uuid: String,
    /// Where the distance sits in a frame for the connected firmware
    pub measurement_field: MeasurementField,
    /// Upper bound for the transport connect
    pub connect_timeout: Duration,
    /// Delay between "services resolved" checks
    pub services_poll_interval: Duration,
    /// Number of "services resolved" checks before giving up
    pub services_poll_max_attempts: u32,
    /// Keep-alive period while armed
    pub heartbeat_interval: Duration,
    /// Upper bound for a single command write
    pub write_timeout: Duration,
    /// Capacity of the notification queue between transport and session
    pub notification_queue_capacity: usize,
    pub write_options: WriteOptions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for SessionConfig {
    fn from(s: &Settings) -> Self {
        Self {
            write_char_uuid: s.write_char_uuid.clone(),
            notify_char_uuid: s.notify_char_uuid.clone(),
            measurement_field: s.measurement_field.into(),
            connect_timeout: Duration::from_millis(s.connect_timeout_ms),
            services_poll_interval: Duration::from_millis(s.services_poll_interval_ms),
            services_poll_max_attempts: s.services_poll_max_attempts,
            heartbeat_interval: Duration::from_millis(s.heartbeat_interval_ms),
            write_timeout: Duration::from_millis(s.write_timeout_ms),
            notification_queue_capacity: s.notification_queue_capacity,
            write_options: WriteOptions {
                write_type: s.command_write_type,
            },
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), SessionError> {
        let invalid = |what: &str| Err(SessionError::InvalidConfig(what.to_string()));

        if self.write_char_uuid.trim().is_empty() || self.notify_char_uuid.trim().is_empty() {
            return invalid("characteristic UUIDs must not be empty");
        }
        if self.write_char_uuid.eq_ignore_ascii_case(&self.notify_char_uuid) {
            return invalid("write and notify UUIDs must differ");
        }
        if self.heartbeat_interval.is_zero() || self.services_poll_interval.is_zero() {
            return invalid("intervals must be non-zero");
        }
        if self.connect_timeout.is_zero() || self.write_timeout.is_zero() {
            return invalid("timeouts must be non-zero");
        }
        if self.services_poll_max_attempts == 0 {
            return invalid("services poll attempts must be at least 1");
        }
        if self.notification_queue_capacity == 0 {
            return invalid("notification queue capacity must be at least 1");
        }
        if self.measurement_field.width == 0 || self.measurement_field.width > 4 {
            return invalid("measurement field width must be 1..=4 bytes");
        }
        Ok(())
    }
}

/// Snapshot of a session's frame counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    pub frames: u64,
    pub measurements: u64,
    pub too_short: u64,
    pub not_measurement: u64,
    pub zero_value: u64,
}

impl DecodeStats {
    pub fn rejected(&self) -> u64 {
        self.too_short + self.not_measurement + self.zero_value
    }
}

#[derive(Debug, Default)]
struct DecodeCounters {
    frames: AtomicU64,
    measurements: AtomicU64,
    too_short: AtomicU64,
    not_measurement: AtomicU64,
    zero_value: AtomicU64,
}

impl DecodeCounters {
    fn reject(&self, rejection: Rejection) {
        let counter = match rejection {
            Rejection::TooShort { .. } => &self.too_short,
            Rejection::NotAMeasurementFrame => &self.not_measurement,
            Rejection::ZeroValue => &self.zero_value,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DecodeStats {
        DecodeStats {
            frames: self.frames.load(Ordering::Relaxed),
            measurements: self.measurements.load(Ordering::Relaxed),
            too_short: self.too_short.load(Ordering::Relaxed),
            not_measurement: self.not_measurement.load(Ordering::Relaxed),
            zero_value: self.zero_value.load(Ordering::Relaxed),
        }
    }
}

/// Why `establish` stopped early
enum Abort {
    Failed(FailureReason),
    /// The session was stopped from outside
    Cancelled,
}

impl From<FailureReason> for Abort {
    fn from(reason: FailureReason) -> Self {
        Self::Failed(reason)
    }
}

enum CommandError {
    NotArmed,
    Transport(TransportError),
}

struct Lifecycle {
    state: SessionState,
    device: Option<DeviceHandle>,
    resolution: Option<Resolution>,
    /// A notify subscription was requested and may be registered
    subscribed: bool,
    released: bool,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    transport: Arc<dyn BleTransport>,
    sink: Arc<dyn MeasurementSink>,
    config: SessionConfig,
    lifecycle: Mutex<Lifecycle>,
    state_tx: watch::Sender<SessionState>,
    counters: DecodeCounters,
    /// Serializes writes to the write characteristic
    write_lock: tokio::sync::Mutex<()>,
}

/// One connection to one IR40.
///
/// A session runs once: after `Closed` or `Failed`, build a new one.
pub struct DeviceSession {
    inner: Arc<Inner>,
}

impl DeviceSession {
    pub fn new(
        transport: Arc<dyn BleTransport>,
        sink: Arc<dyn MeasurementSink>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let (state_tx, _) = watch::channel(SessionState::Idle);

        Ok(Self {
            inner: Arc::new(Inner {
                transport,
                sink,
                config,
                lifecycle: Mutex::new(Lifecycle {
                    state: SessionState::Idle,
                    device: None,
                    resolution: None,
                    subscribed: false,
                    released: false,
                    tasks: Vec::new(),
                }),
                state_tx,
                counters: DecodeCounters::default(),
                write_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state.clone()
    }

    /// Receiver that observes every published state change
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn stats(&self) -> DecodeStats {
        self.inner.counters.snapshot()
    }

    /// Characteristics picked during start-up, with any duplicate matches
    pub fn resolution(&self) -> Option<Resolution> {
        self.inner.lock().resolution.clone()
    }

    /// Connect to `device` and bring the session up to `Armed`.
    ///
    /// Returns once armed, or with the failure that ended the session. If
    /// [`stop`](Self::stop) is called meanwhile, the pending step is abandoned
    /// and `Cancelled` is returned.
    pub async fn start(&self, device: DeviceHandle) -> Result<(), SessionError> {
        {
            let mut lifecycle = self.inner.lock();
            if lifecycle.state != SessionState::Idle {
                return Err(SessionError::InvalidState {
                    operation: "start",
                    state: lifecycle.state.name(),
                });
            }
            lifecycle.device = Some(device.clone());
            lifecycle.state = SessionState::Connecting;
            self.inner.state_tx.send_replace(SessionState::Connecting);
        }
        info!("Starting session with {}", device);

        let mut state_rx = self.inner.state_tx.subscribe();
        let stopped = async move {
            let _ = state_rx.wait_for(SessionState::is_terminal).await;
        };
        let outcome = tokio::select! {
            outcome = self.inner.establish(&device) => outcome,
            _ = stopped => Err(Abort::Cancelled),
        };

        match outcome {
            Ok(()) => {
                info!("Session armed");
                Ok(())
            }
            Err(Abort::Failed(reason)) => {
                if !self.inner.fail(reason.clone()) {
                    return Err(SessionError::Cancelled);
                }
                self.inner.release().await;
                Err(SessionError::Failed(reason))
            }
            Err(Abort::Cancelled) => {
                info!("Session start cancelled");
                Err(SessionError::Cancelled)
            }
        }
    }

    /// Ask the device to take one measurement.
    ///
    /// The reading arrives later as a notification and goes to the sink.
    pub async fn trigger(&self) -> Result<(), SessionError> {
        {
            let lifecycle = self.inner.lock();
            if lifecycle.state != SessionState::Armed {
                return Err(SessionError::InvalidState {
                    operation: "trigger",
                    state: lifecycle.state.name(),
                });
            }
        }

        match self.inner.send_command(DeviceCommand::Trigger).await {
            Ok(()) => Ok(()),
            Err(CommandError::NotArmed) => Err(SessionError::InvalidState {
                operation: "trigger",
                state: self.inner.lock().state.name(),
            }),
            Err(CommandError::Transport(e)) => {
                error!("Trigger write failed: {}", e);
                let reason = FailureReason::TriggerError(e);
                self.inner.fail_and_release(reason.clone());
                Err(SessionError::Failed(reason))
            }
        }
    }

    /// Cancel periodic work, unsubscribe and release the connection.
    ///
    /// No-op on a session that is already `Closed` or `Failed`.
    pub async fn stop(&self) {
        let (previous, tasks) = {
            let mut lifecycle = self.inner.lock();
            if lifecycle.state.is_terminal() {
                debug!("stop() ignored: session already {}", lifecycle.state.name());
                return;
            }
            let tasks = std::mem::take(&mut lifecycle.tasks);
            for task in &tasks {
                task.abort();
            }
            let previous = std::mem::replace(&mut lifecycle.state, SessionState::Closed);
            self.inner.state_tx.send_replace(SessionState::Closed);
            (previous, tasks)
        };

        for task in tasks {
            let _ = task.await;
        }

        if previous != SessionState::Idle {
            self.inner.release().await;
        }
        info!("Session closed (was {})", previous.name());
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        for task in self.inner.lock().tasks.drain(..) {
            task.abort();
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move `from` → `to`; fails if something else changed the state meanwhile
    fn advance(&self, from: SessionState, to: SessionState) -> Result<(), Abort> {
        let mut lifecycle = self.lock();
        if lifecycle.state != from {
            return Err(Abort::Cancelled);
        }
        info!("Session {} -> {}", from.name(), to.name());
        lifecycle.state = to.clone();
        self.state_tx.send_replace(to);
        Ok(())
    }

    /// Enter `Failed`, stopping periodic work first. False if already terminal.
    fn fail(&self, reason: FailureReason) -> bool {
        let mut lifecycle = self.lock();
        if lifecycle.state.is_terminal() {
            return false;
        }
        for task in lifecycle.tasks.drain(..) {
            task.abort();
        }
        warn!(
            "Session failed in state {}: {}",
            lifecycle.state.name(),
            reason
        );
        if let Some(guidance) = reason.guidance() {
            warn!("{}", guidance);
        }
        let state = SessionState::Failed(reason);
        lifecycle.state = state.clone();
        self.state_tx.send_replace(state);
        true
    }

    /// Fail from inside a session task and release the link in the background
    fn fail_and_release(self: &Arc<Self>, reason: FailureReason) {
        if self.fail(reason) {
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.release().await });
        }
    }

    /// Unsubscribe and disconnect, at most once
    async fn release(&self) {
        let (device, notify) = {
            let mut lifecycle = self.lock();
            if lifecycle.released {
                return;
            }
            lifecycle.released = true;
            let notify = match (&lifecycle.resolution, lifecycle.subscribed) {
                (Some(resolution), true) => Some(resolution.characteristics.notify.clone()),
                _ => None,
            };
            (lifecycle.device.clone(), notify)
        };

        if let Some(notify) = notify {
            if let Err(e) = self.transport.unsubscribe_notify(&notify).await {
                warn!("Failed to stop notifications on {}: {}", notify, e);
            }
        }
        if let Some(device) = device {
            if let Err(e) = self.transport.disconnect(&device).await {
                warn!("Failed to disconnect {}: {}", device, e);
            } else {
                info!("Disconnected from {}", device);
            }
        }
    }

    async fn establish(self: &Arc<Self>, device: &DeviceHandle) -> Result<(), Abort> {
        let config = &self.config;

        // Step 1: Connect
        if self.transport.is_connected(device).await {
            info!("{} already connected", device);
        } else {
            info!("Connecting to {}...", device);
            let connect = self.transport.connect(device, config.connect_timeout);
            match time::timeout(config.connect_timeout, connect).await {
                Ok(Ok(())) => {}
                Ok(Err(TransportError::Timeout)) | Err(_) => {
                    return Err(FailureReason::ConnectTimeout.into());
                }
                Ok(Err(e)) => return Err(FailureReason::ConnectError(e).into()),
            }
        }
        self.advance(SessionState::Connecting, SessionState::ResolvingServices)?;

        // Step 2: Wait for service discovery; the transport has no event for it
        let mut attempts = 0;
        loop {
            if self.transport.are_services_resolved(device).await {
                debug!("Services resolved after {} checks", attempts + 1);
                break;
            }
            if !self.transport.is_connected(device).await {
                return Err(FailureReason::Disconnected.into());
            }
            attempts += 1;
            if attempts >= config.services_poll_max_attempts {
                return Err(FailureReason::ServicesNotResolved { attempts }.into());
            }
            time::sleep(config.services_poll_interval).await;
        }
        self.advance(
            SessionState::ResolvingServices,
            SessionState::ResolvingCharacteristics,
        )?;

        // Step 3: Locate characteristics
        let tree = self
            .transport
            .enumerate_gatt_objects()
            .await
            .map_err(FailureReason::EnumerationError)?;
        debug!("Object tree has {} entries", tree.len());

        let resolution = resolver::resolve(
            &tree,
            &device.path,
            &config.write_char_uuid,
            &config.notify_char_uuid,
        )
        .map_err(FailureReason::CharacteristicsMissing)?;
        let characteristics = resolution.characteristics.clone();
        info!(
            "Found write characteristic {} and notify characteristic {}",
            characteristics.write, characteristics.notify
        );
        self.lock().resolution = Some(resolution);
        self.advance(
            SessionState::ResolvingCharacteristics,
            SessionState::Subscribing,
        )?;

        // Step 4: Subscribe
        // flagged before the call so a concurrent release unsubscribes
        let (events_tx, events_rx) = mpsc::channel(config.notification_queue_capacity);
        self.lock().subscribed = true;
        if let Err(e) = self
            .transport
            .subscribe_notify(&characteristics.notify, events_tx)
            .await
        {
            self.lock().subscribed = false;
            return Err(FailureReason::SubscribeError(e).into());
        }
        if self.lock().released {
            // release ran while the subscription was in flight
            let _ = self.transport.unsubscribe_notify(&characteristics.notify).await;
            return Err(Abort::Cancelled);
        }
        info!("Notifications enabled");

        // Step 5: Arm
        self.arm(events_rx)
    }

    fn arm(self: &Arc<Self>, events: mpsc::Receiver<TransportEvent>) -> Result<(), Abort> {
        let mut lifecycle = self.lock();
        if lifecycle.state != SessionState::Subscribing {
            return Err(Abort::Cancelled);
        }

        lifecycle.tasks = vec![
            tokio::spawn(Arc::clone(self).run_events(events)),
            tokio::spawn(Arc::clone(self).run_heartbeat()),
        ];
        info!("Session subscribing -> armed");
        lifecycle.state = SessionState::Armed;
        self.state_tx.send_replace(SessionState::Armed);
        Ok(())
    }

    async fn run_events(self: Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Frame(frame) => self.handle_frame(&frame),
                TransportEvent::Disconnected => {
                    warn!("Device disconnected");
                    self.fail_and_release(FailureReason::Disconnected);
                    return;
                }
            }
        }
        debug!("Notification queue closed by transport");
        self.fail_and_release(FailureReason::Disconnected);
    }

    fn handle_frame(&self, frame: &RawFrame) {
        self.counters.frames.fetch_add(1, Ordering::Relaxed);

        match protocol::decode(frame.as_bytes(), self.config.measurement_field) {
            Ok(measurement) => {
                self.counters.measurements.fetch_add(1, Ordering::Relaxed);
                info!("Parsed: {}", measurement);
                self.sink.on_measurement(measurement);
            }
            Err(rejection) => {
                self.counters.reject(rejection);
                trace!("Dropped frame {:02X?}: {}", frame.as_bytes(), rejection);
            }
        }
    }

    async fn run_heartbeat(self: Arc<Self>) {
        let mut ticker = time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.send_command(DeviceCommand::Heartbeat).await {
                Ok(()) => {}
                Err(CommandError::NotArmed) => return,
                Err(CommandError::Transport(e)) => {
                    error!("Heartbeat write failed: {}", e);
                    self.fail_and_release(FailureReason::HeartbeatError(e));
                    return;
                }
            }
        }
    }

    async fn send_command(&self, command: DeviceCommand) -> Result<(), CommandError> {
        let _guard = self.write_lock.lock().await;

        let write = {
            let lifecycle = self.lock();
            match (&lifecycle.state, &lifecycle.resolution) {
                (SessionState::Armed, Some(resolution)) => resolution.characteristics.write.clone(),
                _ => return Err(CommandError::NotArmed),
            }
        };

        debug!("Sending {} command", command.name());
        let write_value =
            self.transport
                .write_value(&write, command.as_bytes(), self.config.write_options);
        match time::timeout(self.config.write_timeout, write_value).await {
            Ok(result) => result.map_err(CommandError::Transport),
            Err(_) => Err(CommandError::Transport(TransportError::Timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::ResolveError;
    use crate::domain::gatt::ObjectTree;
    use crate::domain::models::AppEvent;
    use crate::infrastructure::bluetooth::fake::{ir40_device, ir40_tree, FakeBehaviour, FakeTransport};
    use crate::infrastructure::bluetooth::protocol::WRITE_CHAR_UUID;
    use crate::infrastructure::sink::ChannelSink;

    const HEARTBEAT: Duration = Duration::from_secs(25);

    fn measurement_frame(hi: u8, lo: u8) -> Vec<u8> {
        let mut frame = vec![0u8; 17];
        frame[2] = 0x02;
        frame[14] = hi;
        frame[15] = lo;
        frame
    }

    struct Harness {
        transport: Arc<FakeTransport>,
        session: Arc<DeviceSession>,
        events: mpsc::UnboundedReceiver<AppEvent>,
    }

    fn harness(behaviour: FakeBehaviour) -> Harness {
        harness_with_tree(behaviour, ir40_tree(&ir40_device()))
    }

    fn harness_with_tree(behaviour: FakeBehaviour, tree: ObjectTree) -> Harness {
        let transport = Arc::new(FakeTransport::new(tree, behaviour));
        let (tx, events) = mpsc::unbounded_channel();
        let session = DeviceSession::new(
            transport.clone(),
            Arc::new(ChannelSink::new(tx)),
            SessionConfig::default(),
        )
        .unwrap();

        Harness {
            transport,
            session: Arc::new(session),
            events,
        }
    }

    async fn next_measurement(events: &mut mpsc::UnboundedReceiver<AppEvent>) -> u32 {
        match events.recv().await {
            Some(AppEvent::Measurement(m)) => m.value_mm,
            other => panic!("expected a measurement, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn arms_and_delivers_measurements() {
        let mut h = harness(FakeBehaviour::default());
        h.session.start(ir40_device()).await.unwrap();
        assert_eq!(h.session.state(), SessionState::Armed);
        assert_eq!(h.transport.subscriptions(), 1);

        h.transport.push_frame(vec![0x00, 0x02]).await; // too short
        h.transport.push_frame({
            let mut echo = measurement_frame(0x05, 0x85);
            echo[2] = 0x01;
            echo
        })
        .await;
        h.transport.push_frame(measurement_frame(0, 0)).await;
        h.transport.push_frame(measurement_frame(0x05, 0x85)).await;

        assert_eq!(next_measurement(&mut h.events).await, 1413);

        let stats = h.session.stats();
        assert_eq!(stats.frames, 4);
        assert_eq!(stats.measurements, 1);
        assert_eq!(stats.too_short, 1);
        assert_eq!(stats.not_measurement, 1);
        assert_eq!(stats.zero_value, 1);
        assert_eq!(stats.rejected(), 3);

        h.session.stop().await;
    }

    #[tokio::test]
    async fn measurements_arrive_in_order() {
        let mut h = harness(FakeBehaviour::default());
        h.session.start(ir40_device()).await.unwrap();

        for value in [1u8, 2, 3] {
            h.transport.push_frame(measurement_frame(0, value)).await;
        }
        assert_eq!(next_measurement(&mut h.events).await, 1);
        assert_eq!(next_measurement(&mut h.events).await, 2);
        assert_eq!(next_measurement(&mut h.events).await, 3);

        h.session.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn one_heartbeat_per_interval() {
        let h = harness(FakeBehaviour::default());
        h.session.start(ir40_device()).await.unwrap();

        // first heartbeat goes out on arming
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.transport.heartbeat_writes(), 1);

        for expected in 2..=5 {
            tokio::time::sleep(HEARTBEAT).await;
            assert_eq!(h.transport.heartbeat_writes(), expected);
        }

        assert!(h
            .transport
            .writes()
            .iter()
            .all(|(path, _)| path.as_str().ends_with("char0010")));
        h.session.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn no_heartbeat_after_stop() {
        let h = harness(FakeBehaviour::default());
        h.session.start(ir40_device()).await.unwrap();
        tokio::time::sleep(HEARTBEAT + Duration::from_secs(1)).await;
        assert_eq!(h.transport.heartbeat_writes(), 2);

        h.session.stop().await;
        assert_eq!(h.session.state(), SessionState::Closed);

        tokio::time::sleep(HEARTBEAT * 5).await;
        assert_eq!(h.transport.heartbeat_writes(), 2);
        assert_eq!(h.transport.unsubscriptions(), 1);
        assert_eq!(h.transport.disconnects(), 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let h = harness(FakeBehaviour::default());
        h.session.start(ir40_device()).await.unwrap();

        h.session.stop().await;
        h.session.stop().await;

        assert_eq!(h.session.state(), SessionState::Closed);
        assert_eq!(h.transport.unsubscriptions(), 1);
        assert_eq!(h.transport.disconnects(), 1);
    }

    #[tokio::test]
    async fn stop_on_idle_session_does_not_touch_transport() {
        let h = harness(FakeBehaviour::default());
        h.session.stop().await;

        assert_eq!(h.session.state(), SessionState::Closed);
        assert_eq!(h.transport.disconnects(), 0);
        assert!(matches!(
            h.session.start(ir40_device()).await,
            Err(SessionError::InvalidState { operation: "start", .. })
        ));
    }

    #[tokio::test]
    async fn trigger_outside_armed_is_rejected() {
        let h = harness(FakeBehaviour::default());

        let err = h.session.trigger().await.unwrap_err();
        assert_eq!(
            err,
            SessionError::InvalidState {
                operation: "trigger",
                state: "idle"
            }
        );
        assert!(h.transport.writes().is_empty());

        h.session.start(ir40_device()).await.unwrap();
        h.session.stop().await;
        let writes_before = h.transport.writes().len();

        assert!(matches!(
            h.session.trigger().await,
            Err(SessionError::InvalidState { state: "closed", .. })
        ));
        assert_eq!(h.transport.writes().len(), writes_before);
    }

    #[tokio::test]
    async fn trigger_writes_command() {
        let h = harness(FakeBehaviour::default());
        h.session.start(ir40_device()).await.unwrap();

        h.session.trigger().await.unwrap();
        h.session.trigger().await.unwrap();

        assert_eq!(h.transport.trigger_writes(), 2);
        h.session.stop().await;
    }

    #[tokio::test]
    async fn trigger_write_error_fails_session() {
        let h = harness(FakeBehaviour {
            fail_writes_from: Some(1),
            ..Default::default()
        });
        h.session.start(ir40_device()).await.unwrap();
        while h.transport.heartbeat_writes() == 0 {
            tokio::task::yield_now().await;
        }

        let reason =
            FailureReason::TriggerError(TransportError::Platform("write rejected".into()));
        assert_eq!(
            h.session.trigger().await,
            Err(SessionError::Failed(reason.clone()))
        );
        assert_eq!(h.session.state(), SessionState::Failed(reason));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_and_trigger_writes_never_overlap() {
        let h = harness(FakeBehaviour {
            write_delay: Some(Duration::from_secs(2)),
            ..Default::default()
        });
        h.session.start(ir40_device()).await.unwrap();

        let triggers: Vec<_> = (0..2)
            .map(|_| {
                let session = h.session.clone();
                tokio::spawn(async move { session.trigger().await })
            })
            .collect();
        for trigger in triggers {
            assert_eq!(trigger.await.unwrap(), Ok(()));
        }
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(h.transport.max_writes_in_flight(), 1);
        assert_eq!(h.transport.heartbeat_writes(), 1);
        assert_eq!(h.transport.trigger_writes(), 2);
        h.session.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn hung_heartbeat_write_times_out() {
        let h = harness(FakeBehaviour {
            write_delay: Some(Duration::from_secs(60)),
            ..Default::default()
        });
        let mut states = h.session.subscribe();
        h.session.start(ir40_device()).await.unwrap();

        let state = states
            .wait_for(SessionState::is_terminal)
            .await
            .unwrap()
            .clone();
        assert_eq!(
            state,
            SessionState::Failed(FailureReason::HeartbeatError(TransportError::Timeout))
        );
        assert!(h.transport.writes().is_empty());
    }

    #[tokio::test]
    async fn duplicate_characteristics_are_reported() {
        let device = ir40_device();
        let mut tree = ir40_tree(&device);
        tree.insert_characteristic(
            device.path.join("service0020").join("char0021"),
            WRITE_CHAR_UUID,
            &["write"],
        );
        let h = harness_with_tree(FakeBehaviour::default(), tree);
        assert_eq!(h.session.resolution(), None);

        h.session.start(device).await.unwrap();

        let resolution = h.session.resolution().unwrap();
        assert!(resolution.is_ambiguous());
        assert_eq!(resolution.duplicate_write, 1);
        assert_eq!(resolution.duplicate_notify, 0);
        assert!(resolution.characteristics.write.as_str().ends_with("char0010"));
        h.session.stop().await;
    }

    #[tokio::test]
    async fn missing_characteristic_never_arms() {
        let device = ir40_device();
        let mut tree = ObjectTree::new();
        tree.insert_characteristic(
            device.path.join("service000c").join("char0010"),
            WRITE_CHAR_UUID,
            &["write-without-response"],
        );
        let h = harness_with_tree(FakeBehaviour::default(), tree);

        let err = h.session.start(device).await.unwrap_err();
        let reason = FailureReason::CharacteristicsMissing(ResolveError::MissingNotify);
        assert_eq!(err, SessionError::Failed(reason.clone()));
        assert_eq!(h.session.state(), SessionState::Failed(reason));
        assert_eq!(h.transport.subscriptions(), 0);
        assert!(h.transport.writes().is_empty());
        assert_eq!(h.transport.disconnects(), 1);
    }

    #[tokio::test]
    async fn subscribe_error_never_arms() {
        let h = harness(FakeBehaviour {
            subscribe_error: Some(TransportError::Platform("notify refused".into())),
            ..Default::default()
        });

        let err = h.session.start(ir40_device()).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Failed(FailureReason::SubscribeError(_))
        ));
        tokio::task::yield_now().await;
        assert!(h.transport.writes().is_empty());
        assert_eq!(h.transport.unsubscriptions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_fails_session() {
        let h = harness(FakeBehaviour {
            connect_delay: Some(Duration::from_secs(60)),
            ..Default::default()
        });

        let err = h.session.start(ir40_device()).await.unwrap_err();
        assert_eq!(err, SessionError::Failed(FailureReason::ConnectTimeout));
        assert_eq!(h.transport.service_polls(), 0);
    }

    #[tokio::test]
    async fn connect_error_fails_session() {
        let h = harness(FakeBehaviour {
            connect_error: Some(TransportError::DeviceNotFound("AA".into())),
            ..Default::default()
        });

        let err = h.session.start(ir40_device()).await.unwrap_err();
        assert_eq!(
            err,
            SessionError::Failed(FailureReason::ConnectError(TransportError::DeviceNotFound(
                "AA".into()
            )))
        );
    }

    #[tokio::test]
    async fn already_connected_device_skips_connect() {
        let h = harness(FakeBehaviour {
            already_connected: true,
            ..Default::default()
        });
        h.session.start(ir40_device()).await.unwrap();

        assert_eq!(h.transport.connects(), 0);
        h.session.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn services_poll_is_bounded() {
        let h = harness(FakeBehaviour {
            services_resolved_after: None,
            ..Default::default()
        });

        let err = h.session.start(ir40_device()).await.unwrap_err();
        assert_eq!(
            err,
            SessionError::Failed(FailureReason::ServicesNotResolved { attempts: 30 })
        );
        assert_eq!(h.transport.service_polls(), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn link_lost_while_resolving_services_fails_session() {
        let h = harness(FakeBehaviour {
            drop_link_after_connect: true,
            services_resolved_after: None,
            ..Default::default()
        });

        let err = h.session.start(ir40_device()).await.unwrap_err();
        assert_eq!(err, SessionError::Failed(FailureReason::Disconnected));
        assert_eq!(h.transport.service_polls(), 1);
        assert_eq!(h.transport.subscriptions(), 0);
        assert_eq!(h.transport.disconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn services_resolve_after_a_few_polls() {
        let h = harness(FakeBehaviour {
            services_resolved_after: Some(4),
            ..Default::default()
        });

        h.session.start(ir40_device()).await.unwrap();
        assert_eq!(h.transport.service_polls(), 5);
        h.session.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_error_fails_session_and_stops_loop() {
        let h = harness(FakeBehaviour {
            fail_writes_from: Some(1),
            ..Default::default()
        });
        let mut states = h.session.subscribe();
        h.session.start(ir40_device()).await.unwrap();

        let state = states
            .wait_for(SessionState::is_terminal)
            .await
            .unwrap()
            .clone();
        assert!(matches!(
            state,
            SessionState::Failed(FailureReason::HeartbeatError(_))
        ));
        let attempts = h.transport.write_attempts();
        assert_eq!(attempts, 2);

        tokio::time::sleep(HEARTBEAT * 4).await;
        assert_eq!(h.transport.write_attempts(), attempts);
        assert_eq!(h.transport.disconnects(), 1);

        // failed is terminal
        h.session.stop().await;
        assert!(matches!(h.session.state(), SessionState::Failed(_)));
    }

    #[tokio::test]
    async fn disconnect_event_fails_session() {
        let h = harness(FakeBehaviour::default());
        let mut states = h.session.subscribe();
        h.session.start(ir40_device()).await.unwrap();

        h.transport.drop_link().await;

        let state = states
            .wait_for(SessionState::is_terminal)
            .await
            .unwrap()
            .clone();
        assert_eq!(state, SessionState::Failed(FailureReason::Disconnected));
        assert!(matches!(
            h.session.trigger().await,
            Err(SessionError::InvalidState { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_connect() {
        let h = harness(FakeBehaviour {
            connect_delay: Some(Duration::from_secs(10)),
            ..Default::default()
        });

        let session = h.session.clone();
        let start = tokio::spawn(async move { session.start(ir40_device()).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.session.state(), SessionState::Connecting);
        h.session.stop().await;

        assert_eq!(start.await.unwrap(), Err(SessionError::Cancelled));
        assert_eq!(h.session.state(), SessionState::Closed);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.transport.service_polls(), 0);
        assert!(h.transport.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_subscribe_removes_subscription() {
        let h = harness(FakeBehaviour {
            subscribe_delay: Some(Duration::from_secs(10)),
            ..Default::default()
        });

        let session = h.session.clone();
        let start = tokio::spawn(async move { session.start(ir40_device()).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.session.state(), SessionState::Subscribing);
        h.session.stop().await;

        assert_eq!(start.await.unwrap(), Err(SessionError::Cancelled));
        assert_eq!(h.session.state(), SessionState::Closed);
        assert_eq!(h.transport.subscriptions(), 1);
        assert_eq!(h.transport.unsubscriptions(), 1);
        assert_eq!(h.transport.disconnects(), 1);

        tokio::time::sleep(HEARTBEAT * 2).await;
        assert!(h.transport.writes().is_empty());
    }

    #[test]
    fn config_from_settings() {
        let settings = Settings {
            heartbeat_interval_ms: 1_000,
            measurement_field: crate::domain::models::FirmwareVariant::LittleEndianU16,
            ..Default::default()
        };
        let config = SessionConfig::from(&settings);

        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.measurement_field, MeasurementField::LITTLE_ENDIAN_U16);
        assert_eq!(config.connect_timeout, Duration::from_secs(15));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = SessionConfig {
            heartbeat_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SessionError::InvalidConfig(_))
        ));

        let config = SessionConfig {
            services_poll_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SessionConfig {
            notify_char_uuid: WRITE_CHAR_UUID.to_uppercase(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
