//! Phase-control firing of a resistive load.
//!
//! [`Dimmer`] lives in task context and turns a requested duty cycle into a
//! firing delay. [`FiringChannel`] is its interrupt-side half: it owns the
//! gate pin and one-shot timer, and reads the delay through a single atomic
//! word so the edge handler never sees a torn value.
use crate::error::RouterError;
use crate::hw_error::map_hw_error;
use crate::zero_cross::ZeroCrossListener;
use core::cell::RefCell;
use critical_section::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use sunroute_traits::{Board, DigitalOutput, FiringTimer};

/// Duty quantization.
pub const RESOLUTION_BITS: u32 = 12;
pub const MAX_DUTY: u32 = (1 << RESOLUTION_BITS) - 1;

const TABLE_PHASE_LEN: usize = 80;
const TABLE_PHASE_SCALE: u32 = (TABLE_PHASE_LEN as u32 - 1) * (1 << (16 - RESOLUTION_BITS));

/// Fraction of the half cycle (scaled to 2^16) to wait before firing, for
/// evenly spaced power levels. Derived from the integral of sin² so equal
/// duty steps give equal power steps.
static FIRING_TABLE: [u16; TABLE_PHASE_LEN] = [
    0xefea, 0xdfd4, 0xd735, 0xd10d, 0xcc12, 0xc7cc, 0xc403, 0xc094, 0xbd6a, 0xba78, 0xb7b2, 0xb512,
    0xb291, 0xb02b, 0xaddc, 0xaba2, 0xa97a, 0xa762, 0xa557, 0xa35a, 0xa167, 0x9f7f, 0x9da0, 0x9bc9,
    0x99fa, 0x9831, 0x966e, 0x94b1, 0x92f9, 0x9145, 0x8f95, 0x8de8, 0x8c3e, 0x8a97, 0x88f2, 0x8750,
    0x85ae, 0x840e, 0x826e, 0x80cf, 0x7f31, 0x7d92, 0x7bf2, 0x7a52, 0x78b0, 0x770e, 0x7569, 0x73c2,
    0x7218, 0x706b, 0x6ebb, 0x6d07, 0x6b4f, 0x6992, 0x67cf, 0x6606, 0x6437, 0x6260, 0x6081, 0x5e99,
    0x5ca6, 0x5aa9, 0x589e, 0x5686, 0x545e, 0x5224, 0x4fd5, 0x4d6f, 0x4aee, 0x484e, 0x4588, 0x4296,
    0x3f6c, 0x3bfd, 0x3834, 0x33ee, 0x2ef3, 0x28cb, 0x202c, 0x1016,
];

/// Table entry `i` scaled to a semi-period, exposed for calibration checks.
pub fn table_delay_us(index: usize, semi_period_us: u32) -> Option<u32> {
    FIRING_TABLE
        .get(index)
        .map(|v| scale(u32::from(*v), semi_period_us))
}

#[inline]
fn scale(fraction: u32, semi_period_us: u32) -> u32 {
    u32::try_from((u64::from(fraction) * u64::from(semi_period_us)) >> 16).unwrap_or(u32::MAX)
}

/// Delay after the zero-cross for a duty in [0, 1].
///
/// 0 maps to the full semi-period (never fires), 1 to no delay.
pub fn firing_delay_us(duty: f32, semi_period_us: u32) -> u32 {
    if duty.is_nan() || duty <= 0.0 {
        return semi_period_us;
    }
    if duty >= 1.0 {
        return 0;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    let quantized = (duty * MAX_DUTY as f32) as u32;
    let slot = quantized * TABLE_PHASE_SCALE + (TABLE_PHASE_SCALE >> 1);
    let index = (slot >> 16) as usize;
    let a = u32::from(FIRING_TABLE[index]);
    let b = u32::from(FIRING_TABLE[(index + 1).min(TABLE_PHASE_LEN - 1)]);
    let delay = a - (((a - b) * (slot & 0xffff)) >> 16);
    scale(delay, semi_period_us)
}

/// Delay word value meaning "do not fire this half cycle".
const NEVER: u16 = u16::MAX;

struct FiringHw {
    gate: Box<dyn DigitalOutput>,
    timer: Box<dyn FiringTimer>,
}

/// Interrupt-side half of a phase-controlled output.
pub struct FiringChannel {
    delay_us: AtomicU16,
    hw: Mutex<RefCell<Option<FiringHw>>>,
    fault: AtomicBool,
    fired: AtomicU64,
}

impl FiringChannel {
    fn new() -> Self {
        Self {
            delay_us: AtomicU16::new(NEVER),
            hw: Mutex::new(RefCell::new(None)),
            fault: AtomicBool::new(false),
            fired: AtomicU64::new(0),
        }
    }

    fn install(&self, hw: FiringHw) {
        critical_section::with(|cs| *self.hw.borrow_ref_mut(cs) = Some(hw));
        self.clear_fault();
    }

    fn clear_fault(&self) {
        self.fault.store(false, Ordering::Release);
    }

    fn is_installed(&self) -> bool {
        critical_section::with(|cs| self.hw.borrow_ref(cs).is_some())
    }

    /// Stop firing and release the gate, keeping the hardware claimed.
    fn park(&self) {
        self.delay_us.store(NEVER, Ordering::Release);
        critical_section::with(|cs| {
            if let Some(hw) = self.hw.borrow_ref_mut(cs).as_mut() {
                hw.timer.cancel();
                let _ = hw.gate.set_low();
            }
        });
    }

    fn set_delay(&self, delay: u16) {
        self.delay_us.store(delay, Ordering::Release);
    }

    /// Timer expiry: pulse the gate. The triac latches until the next zero-cross.
    pub fn on_timer_expired(&self) {
        critical_section::with(|cs| {
            if let Some(hw) = self.hw.borrow_ref_mut(cs).as_mut()
                && hw.gate.set_high().is_ok()
            {
                let _ = hw.gate.set_low();
                self.fired.fetch_add(1, Ordering::Relaxed);
            }
        });
    }

    /// Number of gate pulses emitted.
    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }

    pub fn is_faulted(&self) -> bool {
        self.fault.load(Ordering::Acquire)
    }
}

impl ZeroCrossListener for FiringChannel {
    fn on_zero_cross(&self, semi_period_us: u32) {
        let delay = self.delay_us.load(Ordering::Acquire);
        critical_section::with(|cs| {
            let mut slot = self.hw.borrow_ref_mut(cs);
            let Some(hw) = slot.as_mut() else {
                return;
            };
            if delay == NEVER || u32::from(delay) >= semi_period_us {
                hw.timer.cancel();
                return;
            }
            if hw.timer.arm(u32::from(delay)).is_err() {
                self.delay_us.store(NEVER, Ordering::Release);
                self.fault.store(true, Ordering::Release);
            }
        });
    }
}

/// Task-side phase-control output.
pub struct Dimmer {
    name: String,
    board: Arc<dyn Board>,
    channel: Arc<FiringChannel>,
    claimed_pin: Option<u8>,
    enabled: bool,
    semi_period_us: u32,
    duty: f32,
    duty_min: f32,
    duty_max: f32,
    duty_limit: f32,
    firing_delay_us: u16,
}

fn unit(v: f32) -> f32 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

impl Dimmer {
    pub fn new(name: impl Into<String>, board: Arc<dyn Board>) -> Self {
        Self {
            name: name.into(),
            board,
            channel: Arc::new(FiringChannel::new()),
            claimed_pin: None,
            enabled: false,
            semi_period_us: 0,
            duty: 0.0,
            duty_min: 0.0,
            duty_max: 1.0,
            duty_limit: 1.0,
            firing_delay_us: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Interrupt half, to register with the zero-cross reference and the
    /// timer driver.
    pub fn channel(&self) -> Arc<FiringChannel> {
        self.channel.clone()
    }

    /// Bind the gate pin and timing reference. On failure the dimmer stays
    /// disabled but keeps its duty setpoint.
    pub fn begin(&mut self, pin: i32, semi_period_us: u32) -> Result<(), RouterError> {
        if self.enabled {
            return Ok(());
        }
        let gpio = u8::try_from(pin).ok().filter(|_| self.board.is_output_capable(pin));
        let Some(gpio) = gpio else {
            tracing::error!(dimmer = %self.name, pin, "invalid dimmer pin, output disabled");
            return Err(RouterError::InvalidPin(pin));
        };
        if self.claimed_pin != Some(gpio) || !self.channel.is_installed() {
            let gate = self.board.output(gpio).map_err(|e| {
                let err = map_hw_error(&*e);
                tracing::error!(dimmer = %self.name, pin, error = %err, "cannot claim dimmer pin");
                err
            })?;
            let timer = self.board.firing_timer().map_err(|e| {
                let err = map_hw_error(&*e);
                tracing::error!(dimmer = %self.name, error = %err, "no firing timer, output disabled");
                err
            })?;
            self.channel.install(FiringHw { gate, timer });
            self.claimed_pin = Some(gpio);
        }
        self.channel.clear_fault();
        self.semi_period_us = semi_period_us;
        self.enabled = true;
        tracing::info!(dimmer = %self.name, pin, semi_period_us, duty = self.duty, "dimmer started");
        self.apply();
        Ok(())
    }

    /// Stop firing. The duty setpoint is kept for the next `begin`.
    pub fn end(&mut self) {
        if !self.enabled {
            return;
        }
        self.enabled = false;
        self.channel.park();
        self.firing_delay_us = 0;
        tracing::info!(dimmer = %self.name, "dimmer stopped");
    }

    /// Disable phase control if the interrupt side hit a timer fault.
    pub fn poll_fault(&mut self) -> bool {
        if !self.enabled || !self.channel.is_faulted() {
            return false;
        }
        tracing::error!(dimmer = %self.name, "firing timer fault, phase control disabled");
        self.end();
        true
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enabled and synchronized to the grid.
    pub fn is_online(&self) -> bool {
        self.enabled && self.semi_period_us > 0
    }

    pub fn semi_period(&self) -> u32 {
        self.semi_period_us
    }

    pub fn set_semi_period(&mut self, semi_period_us: u32) {
        if self.semi_period_us != semi_period_us {
            self.semi_period_us = semi_period_us;
            self.apply();
        }
    }

    /// Requested duty, before min/max/limit.
    pub fn duty_cycle(&self) -> f32 {
        self.duty
    }

    pub fn set_duty_cycle(&mut self, duty: f32) {
        self.duty = unit(duty);
        self.apply();
    }

    pub fn duty_cycle_min(&self) -> f32 {
        self.duty_min
    }

    pub fn set_duty_cycle_min(&mut self, min: f32) {
        self.duty_min = unit(min);
        self.apply();
    }

    pub fn duty_cycle_max(&self) -> f32 {
        self.duty_max
    }

    pub fn set_duty_cycle_max(&mut self, max: f32) {
        self.duty_max = unit(max);
        self.apply();
    }

    pub fn duty_cycle_limit(&self) -> f32 {
        self.duty_limit
    }

    pub fn set_duty_cycle_limit(&mut self, limit: f32) {
        self.duty_limit = unit(limit);
        self.apply();
    }

    /// Duty that will be fired: `clamp(duty, min, max)` capped by `limit`.
    /// A request of exactly 0 means off and skips the min floor.
    pub fn effective_duty(&self) -> f32 {
        if self.duty <= 0.0 {
            return 0.0;
        }
        self.duty.max(self.duty_min).min(self.duty_max).min(self.duty_limit)
    }

    /// Duty actually delivered right now.
    pub fn live_duty(&self) -> f32 {
        if self.is_online() { self.effective_duty() } else { 0.0 }
    }

    pub fn is_on(&self) -> bool {
        self.live_duty() > 0.0
    }

    pub fn firing_delay(&self) -> u16 {
        self.firing_delay_us
    }

    /// Conduction angle start in radians, 0..π.
    pub fn phase_angle(&self) -> f32 {
        if self.semi_period_us == 0 {
            return std::f32::consts::PI;
        }
        #[allow(clippy::cast_precision_loss)]
        let ratio = f32::from(self.firing_delay_us) / self.semi_period_us as f32;
        std::f32::consts::PI * ratio.min(1.0)
    }

    /// Recompute the firing delay and publish it to the interrupt side.
    pub fn apply(&mut self) {
        if !self.enabled {
            return;
        }
        let duty = self.effective_duty();
        let delay = firing_delay_us(duty, self.semi_period_us);
        self.firing_delay_us = u16::try_from(delay).unwrap_or(u16::MAX);
        if self.semi_period_us == 0 || duty <= 0.0 || delay >= self.semi_period_us {
            self.channel.set_delay(NEVER);
        } else {
            self.channel.set_delay(self.firing_delay_us);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sunroute_hardware::SimBoard;

    #[test]
    fn table_is_strictly_decreasing() {
        assert!(FIRING_TABLE.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn extremes() {
        assert_eq!(firing_delay_us(0.0, 10_000), 10_000);
        assert_eq!(firing_delay_us(1.0, 10_000), 0);
        assert_eq!(firing_delay_us(f32::NAN, 10_000), 10_000);
    }

    #[test]
    fn half_duty_sits_between_adjacent_entries() {
        let delay = firing_delay_us(0.5, 10_000);
        let hi = table_delay_us(39, 10_000).unwrap();
        let lo = table_delay_us(40, 10_000).unwrap();
        assert!((lo..=hi).contains(&delay), "{lo} <= {delay} <= {hi}");
        assert_eq!(delay, 5_000);
    }

    fn started(board: &Arc<SimBoard>) -> Dimmer {
        let mut d = Dimmer::new("d", board.clone());
        d.begin(25, 10_000).unwrap();
        d
    }

    #[test]
    fn invalid_pin_keeps_setpoint_for_later_begin() {
        let board = Arc::new(SimBoard::default());
        let mut d = Dimmer::new("d", board.clone());
        assert_eq!(d.begin(36, 10_000), Err(RouterError::InvalidPin(36)));
        d.set_duty_cycle(0.4);
        assert!(!d.is_enabled());
        assert!((d.duty_cycle() - 0.4).abs() < f32::EPSILON);
        assert_eq!(d.live_duty(), 0.0);

        d.begin(25, 10_000).unwrap();
        assert!((d.live_duty() - 0.4).abs() < f32::EPSILON);
        assert!(d.firing_delay() > 0);
    }

    #[test]
    fn end_preserves_duty_and_restart_resumes() {
        let board = Arc::new(SimBoard::default());
        let mut d = started(&board);
        d.set_duty_cycle(0.7);
        let delay = d.firing_delay();
        d.end();
        assert!(!d.is_on());
        assert!((d.duty_cycle() - 0.7).abs() < f32::EPSILON);
        d.begin(25, 10_000).unwrap();
        assert_eq!(d.firing_delay(), delay);
    }

    #[test]
    fn zero_request_ignores_min_floor() {
        let board = Arc::new(SimBoard::default());
        let mut d = started(&board);
        d.set_duty_cycle_min(0.2);
        d.set_duty_cycle(0.0);
        assert_eq!(d.effective_duty(), 0.0);
        d.set_duty_cycle(0.1);
        assert!((d.effective_duty() - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn zero_cross_arms_timer_and_expiry_pulses_gate() {
        let board = Arc::new(SimBoard::default());
        let mut d = started(&board);
        let ch = d.channel();
        let timer = board.timers()[0].clone();
        let gate = board.pin(25).unwrap();

        ch.on_zero_cross(10_000);
        assert_eq!(timer.armed(), None, "duty 0 never fires");

        d.set_duty_cycle(0.5);
        ch.on_zero_cross(10_000);
        assert_eq!(timer.expire(), Some(5_000));
        ch.on_timer_expired();
        assert_eq!(gate.pulses(), 1);
        assert!(!gate.is_high());
        assert_eq!(ch.fired(), 1);
    }

    #[test]
    fn timer_fault_disables_phase_control() {
        let board = Arc::new(SimBoard::default());
        let mut d = started(&board);
        d.set_duty_cycle(0.5);
        board.timers()[0].fail_arming(true);
        d.channel().on_zero_cross(10_000);
        assert!(d.poll_fault());
        assert!(!d.is_enabled());
        assert!((d.duty_cycle() - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn restart_after_timer_fault_stays_enabled() {
        let board = Arc::new(SimBoard::default());
        let mut d = started(&board);
        d.set_duty_cycle(0.5);
        let timer = board.timers()[0].clone();
        timer.fail_arming(true);
        d.channel().on_zero_cross(10_000);
        assert!(d.poll_fault());

        timer.fail_arming(false);
        d.begin(25, 10_000).unwrap();
        assert!(!d.channel().is_faulted());
        assert!(!d.poll_fault());
        assert!(d.is_enabled());

        d.channel().on_zero_cross(10_000);
        assert_eq!(timer.armed(), Some(5_000));
        assert!(!d.poll_fault());
    }

    #[test]
    fn exhausted_timer_pool_is_reported() {
        let board = Arc::new(SimBoard::new(0..=39, 0..=33, 0));
        let mut d = Dimmer::new("d", board);
        assert_eq!(d.begin(25, 10_000), Err(RouterError::TimerUnavailable));
        assert!(!d.is_enabled());
    }
}
