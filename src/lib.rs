//! Control library for Linak DPG standing desks over Bluetooth LE.
//!
//! The desk exposes a handful of GATT characteristics: a DPG control
//! point answering property queries with notifications, a telemetry
//! characteristic carrying height/speed samples, and a write-only move
//! target. [`LinakDesk`] wraps all of it behind a typed API:
//!
//! ```no_run
//! use btleplug::api::BDAddr;
//! use linak_desk::{infrastructure::bluetooth::default_adapter, LinakDesk};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let adapter = default_adapter().await?;
//! let desk = LinakDesk::new(adapter, BDAddr::from_str_delim("E8:5B:5B:12:34:56")?);
//!
//! desk.init().await?;
//! println!("{}", desk.current_height_with_offset().await?);
//! desk.move_to_cm(80.0).await?;
//! desk.wait_for_stop().await;
//! desk.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod desk;
pub mod domain;
pub mod error;
pub mod infrastructure;

#[cfg(test)]
pub(crate) mod testing;

pub use desk::LinakDesk;
pub use domain::position::{DeskPosition, HeightSpeed, Speed};
pub use error::{DeskError, LinkError, ProtocolError, StateError};
