//! On/off auxiliary loads and their automatic commutation.
//!
//! A relay with a nominal load is under automatic control: [`auto_switch`]
//! toggles at most one relay per call from the virtual grid power, and the
//! manual path is locked. Relays without a nominal load are manual-only.
use crate::error::RouterError;
use crate::hw_error::map_hw_error;
use std::time::{Duration, Instant};
use sunroute_traits::{Board, DigitalOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayKind {
    #[default]
    NormallyOpen,
    NormallyClosed,
}

fn coil_high(kind: RelayKind, on: bool) -> bool {
    match kind {
        RelayKind::NormallyOpen => on,
        RelayKind::NormallyClosed => !on,
    }
}

pub struct Relay {
    name: String,
    kind: RelayKind,
    pin: Option<Box<dyn DigitalOutput>>,
    on: bool,
    switch_count: u64,
    revert_at: Option<Instant>,
    nominal_load: u16,
    tolerance: f32,
}

impl Relay {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: RelayKind::NormallyOpen,
            pin: None,
            on: false,
            switch_count: 0,
            revert_at: None,
            nominal_load: 0,
            tolerance: 0.0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Claim the coil pin and drive the load off.
    pub fn begin(&mut self, board: &dyn Board, pin: i32, kind: RelayKind) -> Result<(), RouterError> {
        if self.pin.is_some() {
            return Ok(());
        }
        let gpio = u8::try_from(pin)
            .ok()
            .filter(|_| board.is_output_capable(pin))
            .ok_or(RouterError::InvalidPin(pin));
        let out = gpio
            .and_then(|g| board.output(g).map_err(|e| map_hw_error(&*e)))
            .and_then(|mut out| {
                let res = if coil_high(kind, false) { out.set_high() } else { out.set_low() };
                res.map(|()| out).map_err(|e| map_hw_error(&*e))
            });
        match out {
            Ok(out) => {
                self.pin = Some(out);
                self.kind = kind;
                self.on = false;
                self.switch_count = 0;
                tracing::info!(relay = %self.name, pin, ?kind, "relay ready");
                Ok(())
            }
            Err(e) => {
                tracing::error!(relay = %self.name, pin, error = %e, "relay disabled");
                Err(e)
            }
        }
    }

    pub fn end(&mut self) {
        if self.pin.is_some() {
            self.drive(false);
            self.pin = None;
            self.revert_at = None;
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.pin.is_some()
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    pub fn switch_count(&self) -> u64 {
        self.switch_count
    }

    pub fn load(&self) -> u16 {
        self.nominal_load
    }

    pub fn set_load(&mut self, watts: u16) {
        self.nominal_load = watts;
    }

    /// Hysteresis band as a fraction of the nominal load.
    pub fn tolerance(&self) -> f32 {
        self.tolerance
    }

    pub fn set_tolerance(&mut self, fraction: f32) {
        self.tolerance = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
    }

    /// Under automatic commutation.
    pub fn is_auto(&self) -> bool {
        self.nominal_load > 0
    }

    fn is_auto_candidate(&self) -> bool {
        self.is_enabled() && self.is_auto()
    }

    fn drive(&mut self, on: bool) -> bool {
        let Some(pin) = self.pin.as_mut() else {
            return false;
        };
        let res = if coil_high(self.kind, on) { pin.set_high() } else { pin.set_low() };
        if let Err(e) = res {
            tracing::warn!(relay = %self.name, error = %e, "relay write failed");
            return false;
        }
        if self.on != on {
            self.on = on;
            self.switch_count += 1;
        }
        true
    }

    /// Switch regardless of mode. With a duration the relay flips back once
    /// it elapses (see [`Relay::tick`]).
    pub fn set_state(&mut self, on: bool, duration: Option<Duration>, now: Instant) -> bool {
        if !self.drive(on) {
            return false;
        }
        self.revert_at = duration.filter(|d| !d.is_zero()).map(|d| now + d);
        tracing::debug!(relay = %self.name, on, "relay switched");
        true
    }

    /// Manual command; refused while the relay is under automatic control.
    pub fn try_state(&mut self, on: bool, duration: Option<Duration>, now: Instant) -> bool {
        if self.is_auto() {
            tracing::debug!(relay = %self.name, "manual relay command refused in auto mode");
            return false;
        }
        self.set_state(on, duration, now)
    }

    /// Service a pending timed revert.
    pub fn tick(&mut self, now: Instant) {
        if let Some(at) = self.revert_at
            && now >= at
        {
            let back = !self.on;
            self.set_state(back, None, now);
        }
    }

    /// Power drawn right now, by nominal load.
    pub fn power(&self) -> f32 {
        if self.on { f32::from(self.nominal_load) } else { 0.0 }
    }
}

/// One relay transition decided by [`auto_switch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub index: usize,
    pub on: bool,
}

/// Toggle at most one automatic relay from the virtual grid power.
///
/// OFF relays are tried in order and switched on when
/// `vgp + load <= -load * tolerance`; otherwise ON relays are tried from the
/// last one and switched off when `vgp >= load * tolerance`.
pub fn auto_switch(relays: &mut [Relay], virtual_grid_power: f32, now: Instant) -> Option<Transition> {
    if !virtual_grid_power.is_finite() {
        return None;
    }
    for (index, relay) in relays.iter_mut().enumerate() {
        if !relay.is_auto_candidate() || relay.is_on() {
            continue;
        }
        let load = f32::from(relay.load());
        if virtual_grid_power + load <= -load * relay.tolerance() {
            tracing::info!(relay = %relay.name, vgp = virtual_grid_power, "auto relay on");
            if relay.set_state(true, None, now) {
                return Some(Transition { index, on: true });
            }
        }
    }

    for (index, relay) in relays.iter_mut().enumerate().rev() {
        if !relay.is_auto_candidate() || !relay.is_on() {
            continue;
        }
        let load = f32::from(relay.load());
        if virtual_grid_power >= load * relay.tolerance() {
            tracing::info!(relay = %relay.name, vgp = virtual_grid_power, "auto relay off");
            if relay.set_state(false, None, now) {
                return Some(Transition { index, on: false });
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use sunroute_hardware::SimBoard;

    fn relay(board: &SimBoard, pin: i32, load: u16, tolerance: f32) -> Relay {
        let mut r = Relay::new(format!("r{pin}"));
        r.begin(board, pin, RelayKind::NormallyOpen).unwrap();
        r.set_load(load);
        r.set_tolerance(tolerance);
        r
    }

    #[test]
    fn normally_closed_inverts_the_coil() {
        let board = SimBoard::default();
        let mut r = Relay::new("nc");
        r.begin(&board, 4, RelayKind::NormallyClosed).unwrap();
        let coil = board.pin(4).unwrap();
        assert!(coil.is_high(), "off means energized for NC");
        assert!(r.set_state(true, None, Instant::now()));
        assert!(!coil.is_high());
        assert_eq!(r.switch_count(), 1);
    }

    #[test]
    fn begin_drives_coil_off_without_counting_a_switch() {
        let board = SimBoard::default();
        let mut r = Relay::new("no");
        r.begin(&board, 4, RelayKind::NormallyOpen).unwrap();
        assert!(r.is_enabled());
        assert!(!r.is_on());
        assert!(!board.pin(4).unwrap().is_high());
        assert_eq!(r.switch_count(), 0);
    }

    struct StuckOutput;

    impl DigitalOutput for StuckOutput {
        fn set_high(&mut self) -> sunroute_traits::HwResult<()> {
            Err("coil driver stuck".into())
        }
        fn set_low(&mut self) -> sunroute_traits::HwResult<()> {
            Err("coil driver stuck".into())
        }
    }

    struct StuckBoard;

    impl Board for StuckBoard {
        fn is_input_capable(&self, _pin: i32) -> bool {
            true
        }
        fn is_output_capable(&self, _pin: i32) -> bool {
            true
        }
        fn output(&self, _pin: u8) -> sunroute_traits::HwResult<Box<dyn DigitalOutput>> {
            Ok(Box::new(StuckOutput))
        }
        fn firing_timer(&self) -> sunroute_traits::HwResult<Box<dyn sunroute_traits::FiringTimer>> {
            Err("no timers".into())
        }
    }

    #[test]
    fn failed_initial_write_leaves_relay_disabled_and_off() {
        let mut r = Relay::new("stuck");
        let err = r.begin(&StuckBoard, 4, RelayKind::NormallyOpen).unwrap_err();
        assert_eq!(err, RouterError::Hardware("coil driver stuck".into()));
        assert!(!r.is_enabled());
        assert!(!r.is_on());
        assert_eq!(r.switch_count(), 0);
    }

    #[test]
    fn invalid_pin_keeps_relay_disabled() {
        let board = SimBoard::default();
        let mut r = Relay::new("x");
        assert_eq!(r.begin(&board, 39, RelayKind::NormallyOpen), Err(RouterError::InvalidPin(39)));
        assert!(!r.is_enabled());
        assert!(!r.try_state(true, None, Instant::now()));
    }

    #[test]
    fn manual_command_locked_in_auto_mode() {
        let board = SimBoard::default();
        let mut r = relay(&board, 4, 1000, 0.05);
        assert!(!r.try_state(true, None, Instant::now()));
        assert!(!r.is_on());
        r.set_load(0);
        assert!(r.try_state(true, None, Instant::now()));
        assert!(r.is_on());
    }

    #[test]
    fn timed_state_reverts() {
        let board = SimBoard::default();
        let mut r = relay(&board, 4, 0, 0.0);
        let t0 = Instant::now();
        assert!(r.try_state(true, Some(Duration::from_secs(5)), t0));
        r.tick(t0 + Duration::from_secs(4));
        assert!(r.is_on());
        r.tick(t0 + Duration::from_secs(5));
        assert!(!r.is_on());
    }

    #[test]
    fn manual_only_relays_are_never_auto_switched() {
        let board = SimBoard::default();
        let mut relays = vec![relay(&board, 4, 0, 0.05)];
        assert_eq!(auto_switch(&mut relays, -5000.0, Instant::now()), None);
    }

    #[test]
    fn last_relay_is_switched_off_first() {
        let board = SimBoard::default();
        let now = Instant::now();
        let mut relays = vec![relay(&board, 4, 500, 0.05), relay(&board, 5, 500, 0.05)];
        assert_eq!(auto_switch(&mut relays, -2000.0, now), Some(Transition { index: 0, on: true }));
        assert_eq!(auto_switch(&mut relays, -2000.0, now), Some(Transition { index: 1, on: true }));
        assert_eq!(auto_switch(&mut relays, 100.0, now), Some(Transition { index: 1, on: false }));
    }
}
