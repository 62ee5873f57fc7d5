//! Bridge between an IR40 laser distance meter and the desktop.
//!
//! The meter is driven over BLE: a keep-alive keeps it awake, a trigger
//! command fires a measurement, and each reading arrives as a notification
//! that is decoded and handed to a [`MeasurementSink`](infrastructure::sink::MeasurementSink).

pub mod domain;
pub mod infrastructure;
pub mod presentation;
