//! Router output: one phase-controlled load with an optional bypass relay.
//!
//! The output owns its [`Dimmer`] and bypass [`Relay`], applies the
//! per-output policies (temperature limit, excess limiter, auto-bypass
//! window) and exposes the state seen by collaborators.
use crate::dimmer::Dimmer;
use crate::relay::Relay;
use crate::util::Expiring;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use sunroute_traits::Measurement;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    Disabled,
    Idle,
    Routing,
    BypassManual,
    BypassAuto,
}

impl OutputState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Idle => "idle",
            Self::Routing => "routing",
            Self::BypassManual => "bypass_manual",
            Self::BypassAuto => "bypass_auto",
        }
    }
}

/// Local day of week (Sunday = 0) and minute of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeOfWeek {
    pub weekday: u8,
    pub minute: u16,
}

impl TimeOfWeek {
    /// Local time for a UNIX timestamp shifted by `utc_offset_min`.
    pub fn from_unix(secs: i64, utc_offset_min: i16) -> Self {
        let local = secs + i64::from(utc_offset_min) * 60;
        let days = local.div_euclid(86_400);
        // 1970-01-01 was a Thursday.
        let weekday = u8::try_from((days + 4).rem_euclid(7)).unwrap_or(0);
        let minute = u16::try_from(local.rem_euclid(86_400) / 60).unwrap_or(0);
        Self { weekday, minute }
    }

    pub fn now(utc_offset_min: i16) -> Option<Self> {
        let secs = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
        Some(Self::from_unix(i64::try_from(secs).ok()?, utc_offset_min))
    }
}

/// Auto-bypass policy: force the load on while it is cold inside a time
/// window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutoBypass {
    pub enabled: bool,
    pub start_temp: f32,
    pub stop_temp: f32,
    /// Minutes since midnight.
    pub start_minute: u16,
    pub stop_minute: u16,
    /// Bit `n` set for week day `n` (Sunday = 0).
    pub week_days: u8,
}

impl Default for AutoBypass {
    fn default() -> Self {
        Self {
            enabled: false,
            start_temp: 50.0,
            stop_temp: 60.0,
            start_minute: 22 * 60,
            stop_minute: 6 * 60,
            week_days: 0x7f,
        }
    }
}

impl AutoBypass {
    /// `[start, stop)`, wrapping midnight when stop < start; empty when equal.
    pub fn in_window(&self, minute: u16) -> bool {
        let (start, stop) = (self.start_minute, self.stop_minute);
        (start < stop && minute >= start && minute < stop)
            || (start > stop && (minute >= start || minute < stop))
    }

    pub fn runs_on(&self, weekday: u8) -> bool {
        weekday < 7 && self.week_days & (1 << weekday) != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputConfig {
    pub auto_dimmer: bool,
    /// Load resistance in ohms; 0 until calibrated.
    pub calibrated_resistance: f32,
    /// 0 disables the limit.
    pub dimmer_temp_limit: f32,
    /// 0 disables the cap.
    pub excess_power_limiter: f32,
    pub auto_bypass: AutoBypass,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            auto_dimmer: true,
            calibrated_resistance: 0.0,
            dimmer_temp_limit: 0.0,
            excess_power_limiter: 0.0,
            auto_bypass: AutoBypass::default(),
        }
    }
}

/// Values derived from the duty cycle, voltage and load resistance.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OutputMetrics {
    pub resistance: f32,
    pub voltage: f32,
    pub power: f32,
    pub power_factor: f32,
    pub dimmed_voltage: f32,
    pub current: f32,
    pub apparent_power: f32,
    pub thdi: f32,
}

impl OutputMetrics {
    pub fn theoretical(duty: f32, voltage: f32, resistance: f32) -> Self {
        let d = if duty.is_finite() { duty.clamp(0.0, 1.0) } else { 0.0 };
        let r = if resistance.is_finite() && resistance > 0.0 { resistance } else { 0.0 };
        let max_power = if r > 0.0 { voltage * voltage / r } else { 0.0 };
        let power_factor = d.sqrt();
        let dimmed_voltage = power_factor * voltage;
        let current = if r > 0.0 { dimmed_voltage / r } else { 0.0 };
        Self {
            resistance: r,
            voltage,
            power: d * max_power,
            power_factor,
            dimmed_voltage,
            current,
            apparent_power: current * voltage,
            thdi: if d > 0.0 { (1.0 / d - 1.0).sqrt() } else { 0.0 },
        }
    }
}

pub struct RouterOutput {
    name: String,
    config: OutputConfig,
    dimmer: Dimmer,
    relay: Option<Relay>,
    bypass: bool,
    auto_bypass_active: bool,
    temperature: Expiring<f32>,
    measurement: Expiring<Measurement>,
}

/// Temperature and output-meter readings older than this are ignored.
pub const DEFAULT_READING_EXPIRATION: Duration = Duration::from_secs(60);

impl RouterOutput {
    pub fn new(name: impl Into<String>, dimmer: Dimmer, config: OutputConfig) -> Self {
        Self {
            name: name.into(),
            config,
            dimmer,
            relay: None,
            bypass: false,
            auto_bypass_active: false,
            temperature: Expiring::new(DEFAULT_READING_EXPIRATION),
            measurement: Expiring::new(DEFAULT_READING_EXPIRATION),
        }
    }

    #[must_use]
    pub fn with_bypass_relay(mut self, relay: Relay) -> Self {
        self.relay = Some(relay);
        self
    }

    #[must_use]
    pub fn with_reading_expiration(mut self, expiration: Duration) -> Self {
        self.temperature = Expiring::new(expiration);
        self.measurement = Expiring::new(expiration);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &OutputConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut OutputConfig {
        &mut self.config
    }

    pub fn dimmer(&self) -> &Dimmer {
        &self.dimmer
    }

    pub fn dimmer_mut(&mut self) -> &mut Dimmer {
        &mut self.dimmer
    }

    pub fn bypass_relay(&self) -> Option<&Relay> {
        self.relay.as_ref()
    }

    fn relay_enabled(&self) -> bool {
        self.relay.as_ref().is_some_and(Relay::is_enabled)
    }

    fn relay_on(&self) -> bool {
        self.relay.as_ref().is_some_and(Relay::is_on)
    }

    pub fn state(&self) -> OutputState {
        if !self.dimmer.is_online() && !self.relay_enabled() {
            OutputState::Disabled
        } else if self.auto_bypass_active {
            OutputState::BypassAuto
        } else if self.bypass {
            OutputState::BypassManual
        } else if self.dimmer.is_on() {
            OutputState::Routing
        } else {
            OutputState::Idle
        }
    }

    pub fn is_on(&self) -> bool {
        self.dimmer.is_on() || self.relay_on()
    }

    pub fn is_auto_dimmer_enabled(&self) -> bool {
        self.config.auto_dimmer && self.config.calibrated_resistance > 0.0 && !self.bypass
    }

    pub fn update_temperature(&mut self, celsius: f32, at: Instant) {
        if celsius.is_finite() {
            self.temperature.update(celsius, at);
        } else {
            self.temperature.invalidate();
        }
    }

    pub fn temperature(&self, now: Instant) -> Option<f32> {
        self.temperature.get(now)
    }

    pub fn is_temperature_limit_reached(&self, now: Instant) -> bool {
        let limit = self.config.dimmer_temp_limit;
        limit > 0.0 && self.temperature(now).unwrap_or(0.0) >= limit
    }

    /// Record a reading of the meter wired on this output.
    pub fn update_measurement(&mut self, m: Measurement, at: Instant) {
        self.measurement.update(m, at);
    }

    /// Output meter reading. Load-side values are only meaningful while
    /// routing and are masked otherwise.
    pub fn measurement(&self, now: Instant) -> Option<Measurement> {
        let m = self.measurement.get(now)?;
        if self.state() == OutputState::Routing {
            return Some(m);
        }
        Some(Measurement {
            voltage: m.voltage,
            frequency: m.frequency,
            energy: m.energy,
            energy_returned: m.energy_returned,
            ..Measurement::default()
        })
    }

    /// Load resistance seen by the output meter (`P / I²`).
    pub fn measured_resistance(&self, now: Instant) -> Option<f32> {
        let m = self.measurement(now)?;
        let (p, i) = (m.power?, m.current?);
        (p > 0.0 && i > 0.0).then(|| p / (i * i))
    }

    /// Duty requested on the dimmer, 0..=1.
    pub fn duty_cycle(&self) -> f32 {
        self.dimmer.duty_cycle()
    }

    /// Manual duty command in percent; refused while auto-dimmer or a bypass
    /// is active, or when the temperature limit forbids heating.
    pub fn try_set_duty_cycle(&mut self, percent: f32, now: Instant) -> bool {
        if self.auto_bypass_active || self.bypass {
            tracing::warn!(output = %self.name, "bypass active, duty cycle unchanged");
            return false;
        }
        if self.config.auto_dimmer {
            tracing::warn!(output = %self.name, "auto dimmer active, duty cycle unchanged");
            return false;
        }
        if !percent.is_finite() {
            return false;
        }
        let duty = (percent / 100.0).clamp(0.0, 1.0);
        if duty > 0.0 && self.is_temperature_limit_reached(now) {
            tracing::warn!(output = %self.name, limit = self.config.dimmer_temp_limit, "temperature limit reached");
            return false;
        }
        self.dimmer.set_duty_cycle(duty);
        tracing::debug!(output = %self.name, duty = self.dimmer.duty_cycle(), "duty cycle set");
        true
    }

    /// Force the dimmer off regardless of mode.
    pub(crate) fn dimmer_off(&mut self) {
        self.dimmer.set_duty_cycle(0.0);
    }

    pub(crate) fn set_dimmer_duty(&mut self, duty: f32) {
        self.dimmer.set_duty_cycle(duty);
    }

    pub fn apply_temperature_limit(&mut self, now: Instant) {
        if self.auto_bypass_active || self.bypass || !self.dimmer.is_on() {
            return;
        }
        if self.is_temperature_limit_reached(now) {
            tracing::warn!(output = %self.name, limit = self.config.dimmer_temp_limit, "temperature limit reached, dimmer off");
            self.dimmer_off();
        }
    }

    /// Take up to `available` watts from the excess; returns the power the
    /// dimmer will actually route.
    pub fn auto_divert(&mut self, voltage: f32, available: f32, now: Instant) -> f32 {
        if !self.dimmer.is_enabled() || !self.is_auto_dimmer_enabled() {
            return 0.0;
        }
        if !(available.is_finite() && available > 0.0) || self.is_temperature_limit_reached(now) {
            self.dimmer_off();
            return 0.0;
        }
        let max_power = if voltage.is_finite() && voltage > 0.0 {
            voltage * voltage / self.config.calibrated_resistance
        } else {
            0.0
        };
        let mut power = available.min(max_power);
        if self.config.excess_power_limiter > 0.0 {
            power = power.min(self.config.excess_power_limiter);
        }
        let duty = if max_power > 0.0 { power / max_power } else { 0.0 };
        self.dimmer.set_duty_cycle(duty);
        max_power * self.dimmer.live_duty()
    }

    /// Power going into the load: the output meter when it is fresh and the
    /// output routes, otherwise the theoretical value.
    pub fn routed_power(&self, voltage: f32, now: Instant) -> f32 {
        if let Some(p) = self.measurement(now).and_then(|m| m.power)
            && p > 0.0
        {
            return p;
        }
        self.metrics(voltage).power
    }

    pub fn metrics(&self, voltage: f32) -> OutputMetrics {
        OutputMetrics::theoretical(self.dimmer.live_duty(), voltage, self.config.calibrated_resistance)
    }

    pub fn is_bypass_on(&self) -> bool {
        self.bypass
    }

    pub fn is_auto_bypass_active(&self) -> bool {
        self.auto_bypass_active
    }

    /// Manual bypass command, refused while auto-bypass holds the output.
    pub fn try_bypass_state(&mut self, on: bool, now: Instant) -> bool {
        if self.auto_bypass_active {
            tracing::warn!(output = %self.name, "auto bypass active, bypass unchanged");
            return false;
        }
        self.set_bypass(on, now);
        self.bypass == on
    }

    fn set_bypass(&mut self, on: bool, now: Instant) {
        let relay = self.relay.as_mut().filter(|r| r.is_enabled());
        match (on, relay) {
            (true, Some(relay)) => {
                self.dimmer.set_duty_cycle(0.0);
                if !relay.is_on() {
                    tracing::debug!(output = %self.name, "bypass relay on");
                    relay.set_state(true, None, now);
                }
            }
            (true, None) => {
                tracing::debug!(output = %self.name, "bypass through dimmer at full power");
                self.dimmer.set_duty_cycle(1.0);
            }
            (false, Some(relay)) => {
                if relay.is_on() {
                    tracing::debug!(output = %self.name, "bypass relay off");
                    relay.set_state(false, None, now);
                }
            }
            (false, None) => self.dimmer.set_duty_cycle(0.0),
        }
        self.bypass = on;
    }

    fn stop_auto_bypass(&mut self, reason: &str, now: Instant) {
        if self.auto_bypass_active {
            tracing::info!(output = %self.name, reason, "stopping auto bypass");
            self.auto_bypass_active = false;
            self.set_bypass(false, now);
        }
    }

    /// Evaluate the auto-bypass policy. `time` is the local time of week,
    /// `None` when the wall clock is not set.
    pub fn apply_auto_bypass(&mut self, time: Option<TimeOfWeek>, now: Instant) {
        let policy = self.config.auto_bypass;
        if policy.enabled && !self.auto_bypass_active && self.bypass {
            tracing::info!(output = %self.name, "auto bypass enabled, manual bypass off");
            self.set_bypass(false, now);
        }
        if !policy.enabled {
            self.stop_auto_bypass("disabled", now);
            return;
        }
        let Some(time) = time else {
            self.stop_auto_bypass("wall clock unavailable", now);
            return;
        };

        if !self.temperature.never_updated() {
            let Some(temp) = self.temperature(now) else {
                self.stop_auto_bypass("temperature unavailable", now);
                return;
            };
            if temp >= policy.stop_temp {
                self.stop_auto_bypass("stop temperature reached", now);
                return;
            }
            if temp > policy.start_temp {
                return;
            }
        }

        if !policy.in_window(time.minute) {
            self.stop_auto_bypass("outside time window", now);
            return;
        }

        if !self.auto_bypass_active {
            if policy.runs_on(time.weekday) {
                tracing::info!(output = %self.name, weekday = time.weekday, minute = time.minute, "starting auto bypass");
                self.set_bypass(true, now);
                self.auto_bypass_active = self.bypass;
            }
            return;
        }

        let holding = self.relay_on() || (!self.relay_enabled() && self.dimmer.live_duty() >= 1.0);
        if !holding {
            tracing::info!(output = %self.name, "auto bypass active, restarting bypass");
            self.set_bypass(true, now);
        }
    }

    /// Release the hardware.
    pub fn end(&mut self) {
        self.dimmer.end();
        if let Some(relay) = self.relay.as_mut() {
            relay.end();
        }
    }
}
