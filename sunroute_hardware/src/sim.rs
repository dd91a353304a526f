//! Simulated board, meters and house used by tests and the CLI `run` command.
//!
//! Every simulated peripheral hands out a probe (`Arc` shared state) so the
//! caller can observe pin levels and armed timers, or steer the electrical
//! model, while the core owns the trait object.
use crate::error::HwError;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sunroute_traits::{
    Board, Clock, DigitalOutput, FiringTimer, HwResult, Measurement, Meter, TemperatureSensor,
};

/// Observable state of one simulated output pin.
#[derive(Debug, Default)]
pub struct PinProbe {
    high: AtomicBool,
    rising_edges: AtomicU64,
}

impl PinProbe {
    pub fn is_high(&self) -> bool {
        self.high.load(Ordering::Acquire)
    }

    /// Number of low→high transitions seen so far.
    pub fn pulses(&self) -> u64 {
        self.rising_edges.load(Ordering::Acquire)
    }
}

struct SimOutput {
    probe: Arc<PinProbe>,
}

impl DigitalOutput for SimOutput {
    fn set_high(&mut self) -> HwResult<()> {
        if !self.probe.high.swap(true, Ordering::AcqRel) {
            self.probe.rising_edges.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    fn set_low(&mut self) -> HwResult<()> {
        self.probe.high.store(false, Ordering::Release);
        Ok(())
    }
}

/// Sentinel for "no deadline armed".
const DISARMED: u32 = u32::MAX;

/// Observable state of one simulated one-shot timer.
#[derive(Debug)]
pub struct TimerProbe {
    armed_us: AtomicU32,
    arms: AtomicU64,
    fail: AtomicBool,
}

impl Default for TimerProbe {
    fn default() -> Self {
        Self {
            armed_us: AtomicU32::new(DISARMED),
            arms: AtomicU64::new(0),
            fail: AtomicBool::new(false),
        }
    }
}

impl TimerProbe {
    /// Delay of the pending deadline, if any.
    pub fn armed(&self) -> Option<u32> {
        let v = self.armed_us.load(Ordering::Acquire);
        (v != DISARMED).then_some(v)
    }

    /// Consume the pending deadline, as the hardware does when it expires.
    pub fn expire(&self) -> Option<u32> {
        let v = self.armed_us.swap(DISARMED, Ordering::AcqRel);
        (v != DISARMED).then_some(v)
    }

    pub fn arm_count(&self) -> u64 {
        self.arms.load(Ordering::Acquire)
    }

    /// Make every following `arm` call fail.
    pub fn fail_arming(&self, fail: bool) {
        self.fail.store(fail, Ordering::Release);
    }
}

struct SimTimer {
    probe: Arc<TimerProbe>,
}

impl FiringTimer for SimTimer {
    fn arm(&mut self, delay_us: u32) -> HwResult<()> {
        if self.probe.fail.load(Ordering::Acquire) {
            return Err(HwError::Gpio("timer arm rejected".into()).into());
        }
        self.probe.armed_us.store(delay_us, Ordering::Release);
        self.probe.arms.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn cancel(&mut self) {
        self.probe.armed_us.store(DISARMED, Ordering::Release);
    }
}

/// Board with a configurable set of usable pins and a fixed timer pool.
pub struct SimBoard {
    inputs: HashSet<i32>,
    outputs: HashSet<i32>,
    timers_left: AtomicUsize,
    pins: Mutex<Vec<(u8, Arc<PinProbe>)>>,
    timers: Mutex<Vec<Arc<TimerProbe>>>,
}

impl Default for SimBoard {
    /// ESP32-like layout: GPIO 0..=39 readable, 0..=33 writable, 4 timers.
    fn default() -> Self {
        Self::new(0..=39, 0..=33, 4)
    }
}

impl SimBoard {
    pub fn new(
        inputs: impl IntoIterator<Item = i32>,
        outputs: impl IntoIterator<Item = i32>,
        timers: usize,
    ) -> Self {
        Self {
            inputs: inputs.into_iter().collect(),
            outputs: outputs.into_iter().collect(),
            timers_left: AtomicUsize::new(timers),
            pins: Mutex::new(Vec::new()),
            timers: Mutex::new(Vec::new()),
        }
    }

    /// Probe of a pin previously claimed through [`Board::output`].
    pub fn pin(&self, pin: u8) -> Option<Arc<PinProbe>> {
        let pins = self.pins.lock().ok()?;
        pins.iter().find(|(p, _)| *p == pin).map(|(_, probe)| probe.clone())
    }

    /// Probes of all timers handed out so far, in allocation order.
    pub fn timers(&self) -> Vec<Arc<TimerProbe>> {
        self.timers.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

impl Board for SimBoard {
    fn is_input_capable(&self, pin: i32) -> bool {
        self.inputs.contains(&pin)
    }

    fn is_output_capable(&self, pin: i32) -> bool {
        self.outputs.contains(&pin)
    }

    fn output(&self, pin: u8) -> HwResult<Box<dyn DigitalOutput>> {
        if !self.is_output_capable(i32::from(pin)) {
            return Err(HwError::InvalidPin(i32::from(pin)).into());
        }
        let mut pins = self
            .pins
            .lock()
            .map_err(|_| HwError::Gpio("pin table poisoned".into()))?;
        if pins.iter().any(|(p, _)| *p == pin) {
            return Err(HwError::PinInUse(pin).into());
        }
        let probe = Arc::new(PinProbe::default());
        pins.push((pin, probe.clone()));
        tracing::trace!(pin, "sim output claimed");
        Ok(Box::new(SimOutput { probe }))
    }

    fn firing_timer(&self) -> HwResult<Box<dyn FiringTimer>> {
        if self
            .timers_left
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err()
        {
            return Err(HwError::TimerExhausted.into());
        }
        let probe = Arc::new(TimerProbe::default());
        if let Ok(mut timers) = self.timers.lock() {
            timers.push(probe.clone());
        }
        Ok(Box::new(SimTimer { probe }))
    }
}

#[derive(Debug, Clone, Copy)]
struct HouseState {
    solar_w: f32,
    consumption_w: f32,
    routed_w: f32,
    voltage: f32,
    frequency: f32,
    online: bool,
}

/// Electrical model of the house: solar production, base consumption and
/// whatever the router currently pushes into its loads.
#[derive(Debug, Clone)]
pub struct House {
    state: Arc<Mutex<HouseState>>,
}

impl House {
    pub fn new(solar_w: f32, consumption_w: f32) -> Self {
        Self {
            state: Arc::new(Mutex::new(HouseState {
                solar_w,
                consumption_w,
                routed_w: 0.0,
                voltage: 230.0,
                frequency: 50.0,
                online: true,
            })),
        }
    }

    fn update(&self, f: impl FnOnce(&mut HouseState)) {
        if let Ok(mut s) = self.state.lock() {
            f(&mut s);
        }
    }

    pub fn set_solar(&self, w: f32) {
        self.update(|s| s.solar_w = w);
    }

    pub fn set_consumption(&self, w: f32) {
        self.update(|s| s.consumption_w = w);
    }

    /// Power currently absorbed by routed loads and relays.
    pub fn set_routed(&self, w: f32) {
        self.update(|s| s.routed_w = w);
    }

    pub fn set_online(&self, online: bool) {
        self.update(|s| s.online = online);
    }

    pub fn voltage(&self) -> f32 {
        self.state.lock().map(|s| s.voltage).unwrap_or(0.0)
    }

    /// Import (positive) or export (negative) at the grid connection point.
    pub fn grid_power(&self) -> f32 {
        self.state
            .lock()
            .map(|s| s.consumption_w + s.routed_w - s.solar_w)
            .unwrap_or(0.0)
    }

    fn measurement(&self) -> Option<Measurement> {
        let s = *self.state.lock().ok()?;
        if !s.online {
            return None;
        }
        let power = s.consumption_w + s.routed_w - s.solar_w;
        let apparent = power.abs();
        Some(Measurement {
            power: Some(power),
            voltage: Some(s.voltage),
            frequency: Some(s.frequency),
            current: Some(apparent / s.voltage),
            apparent_power: Some(apparent),
            power_factor: Some(1.0),
            ..Measurement::default()
        })
    }
}

/// Grid meter reading the [`House`] model.
pub struct SimMeter {
    house: House,
}

impl SimMeter {
    pub fn new(house: House) -> Self {
        Self { house }
    }
}

impl Meter for SimMeter {
    fn read(&mut self, _timeout: Duration) -> HwResult<Measurement> {
        self.house
            .measurement()
            .ok_or_else(|| HwError::Timeout.into())
    }
}

/// Temperature probe whose value is set by the test or simulation.
#[derive(Debug, Clone, Default)]
pub struct SimTemperature {
    value: Arc<Mutex<Option<f32>>>,
}

impl SimTemperature {
    pub fn new(celsius: Option<f32>) -> Self {
        Self {
            value: Arc::new(Mutex::new(celsius)),
        }
    }

    pub fn set(&self, celsius: Option<f32>) {
        if let Ok(mut v) = self.value.lock() {
            *v = celsius;
        }
    }
}

impl TemperatureSensor for SimTemperature {
    fn read(&mut self) -> Option<f32> {
        self.value.lock().ok().and_then(|v| *v)
    }
}

/// Fast-forward clock for simulations: time only moves when advanced.
#[derive(Debug, Clone)]
pub struct SimClock {
    origin: Instant,
    elapsed_us: Arc<AtomicU64>,
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SimClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed_us: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn advance(&self, d: Duration) {
        let us = u64::try_from(d.as_micros()).unwrap_or(u64::MAX);
        self.elapsed_us.fetch_add(us, Ordering::AcqRel);
    }

    /// Simulated time since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_micros(self.elapsed_us.load(Ordering::Acquire))
    }
}

impl Clock for SimClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn sleep(&self, d: Duration) {
        self.advance(d);
    }
}
