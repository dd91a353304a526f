//! Hardware seams for the diversion controller.
//!
//! Everything the core touches on the device goes through these traits so
//! the control logic can run unchanged against simulated backends in tests.
pub mod clock;

pub use clock::{Clock, MonotonicClock};

use std::time::Duration;

/// Boxed error returned by every hardware seam.
pub type HwResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// A digital output line (firing gate, relay coil).
pub trait DigitalOutput: Send {
    fn set_high(&mut self) -> HwResult<()>;
    fn set_low(&mut self) -> HwResult<()>;
}

/// One-shot timer used to fire a phase-controlled output after a zero-cross.
///
/// Implementations call back into the owning firing channel when the armed
/// delay expires; arming again before expiry replaces the pending deadline.
pub trait FiringTimer: Send {
    fn arm(&mut self, delay_us: u32) -> HwResult<()>;
    fn cancel(&mut self);
}

/// Pin capabilities and peripheral allocation of the target board.
pub trait Board: Send + Sync {
    fn is_input_capable(&self, pin: i32) -> bool;
    fn is_output_capable(&self, pin: i32) -> bool;

    /// Claim `pin` as a push-pull output.
    fn output(&self, pin: u8) -> HwResult<Box<dyn DigitalOutput>>;

    /// Allocate a one-shot timer. Boards have a small fixed pool; running out
    /// is reported as an error.
    fn firing_timer(&self) -> HwResult<Box<dyn FiringTimer>>;
}

/// Partial electrical measurement produced by one meter read.
///
/// Fields a meter does not provide stay `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Measurement {
    pub power: Option<f32>,
    pub voltage: Option<f32>,
    pub frequency: Option<f32>,
    pub current: Option<f32>,
    pub apparent_power: Option<f32>,
    pub power_factor: Option<f32>,
    pub energy: Option<f32>,
    pub energy_returned: Option<f32>,
}

impl Measurement {
    pub fn with_power(power: f32) -> Self {
        Self {
            power: Some(power),
            ..Self::default()
        }
    }

    pub fn with_power_voltage(power: f32, voltage: f32) -> Self {
        Self {
            power: Some(power),
            voltage: Some(voltage),
            ..Self::default()
        }
    }
}

/// Blocking energy meter (serial/Modbus/TCP). Read from a sampler thread.
pub trait Meter {
    fn read(&mut self, timeout: Duration) -> HwResult<Measurement>;
}

/// Temperature probe attached to an output (water tank, heater body).
pub trait TemperatureSensor: Send {
    /// Latest temperature in °C, `None` when the probe is not answering.
    fn read(&mut self) -> Option<f32>;
}
