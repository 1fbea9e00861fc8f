//! Bluetooth Module
//!
//! BLE communication with the desk.
//!
//! ## Modules
//!
//! - [`protocol`] - DPG protocol definitions, characteristic UUIDs and
//!   payload codecs
//! - [`connection`] - the [`connection::DeskLink`] seam and its btleplug
//!   implementation, including notification dispatch

pub mod connection;
pub mod protocol;

pub use connection::{default_adapter, BtleConnection, DeskLink, NotificationRegistry};
pub use protocol::{DeskCharacteristic, DpgCommand};
