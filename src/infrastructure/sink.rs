//! Measurement consumers

use crate::domain::models::{AppEvent, Measurement};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Receives every measurement a session decodes, once, in arrival order.
///
/// Called from the session's event task; implementations must not block.
pub trait MeasurementSink: Send + Sync {
    fn on_measurement(&self, measurement: Measurement);
}

/// Forwards measurements into the application event loop
pub struct ChannelSink {
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl ChannelSink {
    pub fn new(event_sender: mpsc::UnboundedSender<AppEvent>) -> Self {
        Self { event_sender }
    }
}

impl MeasurementSink for ChannelSink {
    fn on_measurement(&self, measurement: Measurement) {
        if self
            .event_sender
            .send(AppEvent::Measurement(measurement))
            .is_err()
        {
            warn!("Dropping {}: event receiver closed", measurement);
        }
    }
}

/// Logs each reading
pub struct LogSink;

impl MeasurementSink for LogSink {
    fn on_measurement(&self, measurement: Measurement) {
        info!(value_mm = measurement.value_mm, "Measurement ({})", measurement.field);
    }
}

/// Fans one measurement out to several sinks
pub struct FanoutSink {
    sinks: Vec<Box<dyn MeasurementSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Box<dyn MeasurementSink>>) -> Self {
        Self { sinks }
    }
}

impl MeasurementSink for FanoutSink {
    fn on_measurement(&self, measurement: Measurement) {
        for sink in &self.sinks {
            sink.on_measurement(measurement);
        }
    }
}

/// Sink that types readings into the focused window, where the platform has one
#[cfg(windows)]
pub fn keystroke_sink() -> Option<Box<dyn MeasurementSink>> {
    Some(Box::new(
        crate::infrastructure::input_simulator::KeystrokeSink::new(),
    ))
}

/// Sink that types readings into the focused window, where the platform has one
#[cfg(all(target_os = "linux", feature = "keystrokes"))]
pub fn keystroke_sink() -> Option<Box<dyn MeasurementSink>> {
    match crate::infrastructure::text_input::TextInputSink::new() {
        Ok(sink) => Some(Box::new(sink)),
        Err(e) => {
            warn!("Cannot type measurements, no display connection: {}", e);
            None
        }
    }
}

/// Sink that types readings into the focused window, where the platform has one
#[cfg(not(any(windows, all(target_os = "linux", feature = "keystrokes"))))]
pub fn keystroke_sink() -> Option<Box<dyn MeasurementSink>> {
    warn!(
        "Typing measurements is not supported in this build \
         (on Linux, build with --features keystrokes); readings are only printed"
    );
    None
}
