#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Solar excess diversion engine (hardware-agnostic).
//!
//! All hardware interactions go through the `sunroute_traits` boundary:
//! `Board` for GPIO and firing timers, `Meter` for power readings and
//! `TemperatureSensor` for load probes.
//!
//! ## Architecture
//!
//! - **Zero-cross**: semi-period tracking and grid online detection (`zero_cross`)
//! - **Dimmers**: phase-control firing delays from a duty cycle (`dimmer`)
//! - **Grid**: prioritized, expiring metric sources (`grid`)
//! - **PID**: the grid power regulator (`pid`)
//! - **Relays**: whole-load switching with hysteresis (`relay`)
//! - **Outputs**: one dimmer plus optional bypass relay per load (`output`)
//! - **Diversion**: priority fill, fail-safe stop and calibration (`router`)
//! - **Scheduling**: cooperative task runner (`scheduler`)
//! - **Runtime**: builder wiring all of the above from a `Config` (`runtime`)
//!
//! Interrupt-context state (zero-cross edges, firing channels) sits behind
//! `critical_section::Mutex`; everything else is owned by the runtime and
//! touched from one thread.

pub mod conversions;
pub mod dimmer;
pub mod error;
pub mod grid;
pub mod hw_error;
pub mod mocks;
pub mod output;
pub mod pid;
pub mod relay;
pub mod router;
pub mod runtime;
pub mod sampler;
pub mod scheduler;
pub mod util;
pub mod zero_cross;

pub use error::{BuildError, Report, Result, RouterError};
pub use grid::{Grid, GridMetrics, Source};
pub use output::{OutputState, RouterOutput, TimeOfWeek};
pub use runtime::{MeterSource, Router, RouterBuilder, RouterContext};
