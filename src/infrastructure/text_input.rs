use crate::domain::models::Measurement;
use crate::infrastructure::sink::MeasurementSink;
use enigo::{Enigo, Keyboard, Settings as EnigoSettings};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

/// Types each reading into the focused X11 window
pub struct TextInputSink {
    enigo: Mutex<Enigo>,
}

impl TextInputSink {
    pub fn new() -> anyhow::Result<Self> {
        let enigo = Enigo::new(&EnigoSettings::default())?;
        Ok(Self {
            enigo: Mutex::new(enigo),
        })
    }
}

impl MeasurementSink for TextInputSink {
    fn on_measurement(&self, measurement: Measurement) {
        debug!("Typing {}", measurement.value_mm);
        let mut enigo = self.enigo.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = enigo.text(&measurement.value_mm.to_string()) {
            warn!("Could not type {}: {}", measurement, e);
        }
    }
}
