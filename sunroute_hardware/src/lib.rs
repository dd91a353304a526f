#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Board backends for the diversion controller.
//!
//! - `sim`: in-process board, meters and house model (always available)
//! - `gpio`: Raspberry Pi GPIO through rppal (`hardware` feature, Linux only)
pub mod error;
pub mod sim;

#[cfg(all(feature = "hardware", target_os = "linux"))]
pub mod gpio;

pub use error::HwError;
pub use sim::{House, SimBoard, SimClock, SimMeter, SimTemperature};
