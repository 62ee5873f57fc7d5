//! Terminal front end: pick a device, then ENTER fires a measurement.

use crate::domain::errors::SessionError;
use crate::domain::models::{AppEvent, DeviceHandle, MessageSeverity, SessionState, StatusMessage};
use crate::domain::settings::SettingsService;
use crate::infrastructure::bluetooth::resolver::Resolution;
use crate::infrastructure::bluetooth::{BleTransport, DeviceSession, SessionConfig};
use crate::infrastructure::sink::{
    keystroke_sink, ChannelSink, FanoutSink, LogSink, MeasurementSink,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SelectionError {
    #[error("'{0}' is not a number")]
    NotANumber(String),

    #[error("no device with index {index} (0..{count})")]
    OutOfRange { index: usize, count: usize },
}

/// Index of the device used last time, else the first one
pub fn default_index(devices: &[DeviceHandle], last_address: Option<&str>) -> usize {
    last_address
        .and_then(|address| {
            devices
                .iter()
                .position(|d| d.address.eq_ignore_ascii_case(address))
        })
        .unwrap_or(0)
}

/// Parse the user's choice; an empty answer takes `default`
pub fn parse_selection(input: &str, count: usize, default: usize) -> Result<usize, SelectionError> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(default);
    }
    let index = input
        .parse::<usize>()
        .map_err(|_| SelectionError::NotANumber(input.to_string()))?;
    if index >= count {
        return Err(SelectionError::OutOfRange { index, count });
    }
    Ok(index)
}

fn print_status(status: &StatusMessage) {
    match status.severity {
        MessageSeverity::Error => eprintln!("error: {}", status.message),
        MessageSeverity::Warning => eprintln!("warning: {}", status.message),
        MessageSeverity::Info | MessageSeverity::Success => println!("{}", status.message),
    }
}

fn failure_status(error: &SessionError) -> StatusMessage {
    let mut message = format!("Could not arm the device: {}", error);
    if let SessionError::Failed(reason) = error {
        if let Some(hint) = reason.guidance() {
            message.push('\n');
            message.push_str(hint);
        }
    }
    StatusMessage {
        message,
        severity: MessageSeverity::Error,
    }
}

/// Warning shown when several characteristics matched a UUID
fn ambiguity_status(resolution: &Resolution) -> Option<StatusMessage> {
    resolution.is_ambiguous().then(|| StatusMessage {
        message: format!(
            "The device reports duplicate characteristics (write: +{}, notify: +{}); \
             using {} and {}",
            resolution.duplicate_write,
            resolution.duplicate_notify,
            resolution.characteristics.write,
            resolution.characteristics.notify
        ),
        severity: MessageSeverity::Warning,
    })
}

pub struct ConsoleApp {
    settings: SettingsService,
    transport: Arc<dyn BleTransport>,
}

impl ConsoleApp {
    pub fn new(settings: SettingsService, transport: Arc<dyn BleTransport>) -> Self {
        Self {
            settings,
            transport,
        }
    }

    fn build_sink(&self, event_tx: mpsc::UnboundedSender<AppEvent>) -> Arc<dyn MeasurementSink> {
        let mut sinks: Vec<Box<dyn MeasurementSink>> =
            vec![Box::new(ChannelSink::new(event_tx)), Box::new(LogSink)];

        if self.settings.get().type_measurements {
            sinks.extend(keystroke_sink());
        }

        Arc::new(FanoutSink::new(sinks))
    }

    async fn select_device(
        &mut self,
        lines: &mut Lines<BufReader<Stdin>>,
    ) -> anyhow::Result<DeviceHandle> {
        let timeout = Duration::from_millis(self.settings.get().discovery_timeout_ms);
        println!("Scanning for devices...");
        let devices = self.transport.discover_devices(timeout).await?;
        if devices.is_empty() {
            anyhow::bail!("No Bluetooth devices found");
        }

        let default = default_index(&devices, self.settings.get().last_device_address.as_deref());
        for (index, device) in devices.iter().enumerate() {
            println!("  [{}] {}", index, device);
        }

        loop {
            println!("Select device [{}]:", default);
            let Some(line) = lines.next_line().await? else {
                anyhow::bail!("No device selected");
            };
            match parse_selection(&line, devices.len(), default) {
                Ok(index) => {
                    let device = devices[index].clone();
                    if let Err(e) = self.settings.set_last_device(&device.address) {
                        warn!("Could not remember device: {}", e);
                    }
                    return Ok(device);
                }
                Err(e) => eprintln!("{}", e),
            }
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let device = self.select_device(&mut lines).await?;
        info!("Selected {}", device);

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let session = DeviceSession::new(
            Arc::clone(&self.transport),
            self.build_sink(event_tx.clone()),
            SessionConfig::from(self.settings.get()),
        )?;

        let mut state_rx = session.subscribe();
        let state_tx = event_tx.clone();
        let state_forwarder = tokio::spawn(async move {
            while state_rx.changed().await.is_ok() {
                let state = state_rx.borrow_and_update().clone();
                if state_tx.send(AppEvent::SessionState(state)).is_err() {
                    break;
                }
            }
        });

        println!("Connecting to {}...", device);
        if let Err(e) = session.start(device).await {
            print_status(&failure_status(&e));
            state_forwarder.abort();
            return Err(e.into());
        }
        if let Some(status) = session.resolution().as_ref().and_then(ambiguity_status) {
            print_status(&status);
        }
        println!("Ready. Press ENTER to measure, Ctrl-C to quit.");

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(_)) => {
                        if let Err(e) = session.trigger().await {
                            let _ = event_tx.send(AppEvent::LogMessage(failure_status(&e)));
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!("stdin closed: {}", e);
                        break;
                    }
                },
                Some(event) = event_rx.recv() => match event {
                    AppEvent::Measurement(measurement) => println!("{}", measurement),
                    AppEvent::SessionState(state) => {
                        info!("Session {}", state);
                        if let SessionState::Failed(reason) = &state {
                            print_status(&failure_status(&SessionError::Failed(reason.clone())));
                        }
                        if state.is_terminal() {
                            break;
                        }
                    }
                    AppEvent::LogMessage(status) => print_status(&status),
                },
                _ = tokio::signal::ctrl_c() => {
                    println!();
                    break;
                }
            }
        }

        session.stop().await;
        state_forwarder.abort();

        let stats = session.stats();
        info!(
            frames = stats.frames,
            measurements = stats.measurements,
            rejected = stats.rejected(),
            "Session finished"
        );
        Ok(())
    }
}
