pub mod bluetooth;
#[cfg(windows)]
pub mod input_simulator;
pub mod logging;
pub mod sink;
#[cfg(all(target_os = "linux", feature = "keystrokes"))]
pub mod text_input;
