//! rppal-backed board for relay-only installations.
//!
//! The Pi has no user-space one-shot timers tied to a zero-cross input, so
//! `firing_timer` always fails and phase control stays disabled; relays and
//! bypass outputs work normally.
use crate::error::HwError;
use rppal::gpio::{Gpio, OutputPin};
use sunroute_traits::{Board, DigitalOutput, FiringTimer, HwResult};

/// BCM numbering, header pins only.
const MAX_BCM: i32 = 27;

pub struct GpioBoard {
    gpio: Gpio,
}

impl GpioBoard {
    pub fn new() -> Result<Self, HwError> {
        let gpio = Gpio::new().map_err(|e| HwError::Gpio(e.to_string()))?;
        Ok(Self { gpio })
    }
}

struct GpioOutput {
    pin: OutputPin,
}

impl DigitalOutput for GpioOutput {
    fn set_high(&mut self) -> HwResult<()> {
        self.pin.set_high();
        Ok(())
    }

    fn set_low(&mut self) -> HwResult<()> {
        self.pin.set_low();
        Ok(())
    }
}

impl Board for GpioBoard {
    fn is_input_capable(&self, pin: i32) -> bool {
        (0..=MAX_BCM).contains(&pin)
    }

    fn is_output_capable(&self, pin: i32) -> bool {
        (0..=MAX_BCM).contains(&pin)
    }

    fn output(&self, pin: u8) -> HwResult<Box<dyn DigitalOutput>> {
        if !self.is_output_capable(i32::from(pin)) {
            return Err(HwError::InvalidPin(i32::from(pin)).into());
        }
        let pin = self
            .gpio
            .get(pin)
            .map_err(|e| HwError::Gpio(format!("open gpio {pin}: {e}")))?
            .into_output_low();
        tracing::debug!(pin = pin.pin(), "gpio output claimed");
        Ok(Box::new(GpioOutput { pin }))
    }

    fn firing_timer(&self) -> HwResult<Box<dyn FiringTimer>> {
        Err(HwError::TimerExhausted.into())
    }
}
