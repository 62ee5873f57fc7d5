pub mod errors;
pub mod gatt;
pub mod models;
pub mod settings;
