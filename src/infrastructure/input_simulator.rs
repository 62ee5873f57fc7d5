use crate::domain::models::Measurement;
use crate::infrastructure::sink::MeasurementSink;
use tracing::{debug, trace, warn};
use windows::Win32::UI::Input::KeyboardAndMouse::{
    SendInput, INPUT, INPUT_0, INPUT_KEYBOARD, KEYBDINPUT, KEYBD_EVENT_FLAGS, KEYEVENTF_KEYUP,
    VIRTUAL_KEY,
};

/// Virtual-key code of the `0` key; `1`..`9` follow it
const VK_DIGIT_0: u16 = 0x30;

pub struct InputSimulator;

impl InputSimulator {
    pub fn new() -> Self {
        Self
    }

    fn send_key(&self, key: VIRTUAL_KEY, flags: KEYBD_EVENT_FLAGS) -> anyhow::Result<()> {
        let input = INPUT {
            r#type: INPUT_KEYBOARD,
            Anonymous: INPUT_0 {
                ki: KEYBDINPUT {
                    wVk: key,
                    wScan: 0,
                    dwFlags: flags,
                    time: 0,
                    dwExtraInfo: 0,
                },
            },
        };
        let sent = unsafe { SendInput(&[input], std::mem::size_of::<INPUT>() as i32) };
        if sent != 1 {
            anyhow::bail!("SendInput blocked for key {:?}", key);
        }
        Ok(())
    }

    /// Simulate key press and release
    pub fn key_press(&self, key: VIRTUAL_KEY) -> anyhow::Result<()> {
        trace!("Key press: {:?}", key);
        self.send_key(key, KEYBD_EVENT_FLAGS::default())?;
        self.send_key(key, KEYEVENTF_KEYUP)
    }

    /// Type the decimal digits of `value` into the focused window
    pub fn type_number(&self, value: u32) -> anyhow::Result<()> {
        debug!("Typing {}", value);
        for digit in value.to_string().bytes() {
            let key = VIRTUAL_KEY(VK_DIGIT_0 + u16::from(digit - b'0'));
            self.key_press(key)?;
        }
        Ok(())
    }
}

impl Default for InputSimulator {
    fn default() -> Self {
        Self::new()
    }
}

/// Types each reading as keystrokes, like a barcode scanner
pub struct KeystrokeSink {
    simulator: InputSimulator,
}

impl KeystrokeSink {
    pub fn new() -> Self {
        Self {
            simulator: InputSimulator::new(),
        }
    }
}

impl Default for KeystrokeSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MeasurementSink for KeystrokeSink {
    fn on_measurement(&self, measurement: Measurement) {
        if let Err(e) = self.simulator.type_number(measurement.value_mm) {
            warn!("Could not type {}: {}", measurement, e);
        }
    }
}
