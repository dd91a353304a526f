#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schema for the diversion controller.
//!
//! - `Config` and its sections are deserialized from TOML and validated.
//! - Every section has defaults, so an empty file yields a router with no
//!   outputs or relays and a 50 Hz grid.
use serde::Deserialize;
use std::collections::HashSet;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct SourceExpiration {
    /// Value pushed by a collaborator (MQTT, HTTP).
    pub external_ms: u64,
    /// Remote meter reached over the network.
    pub remote_ms: u64,
    /// Meter wired to the controller.
    pub local_ms: u64,
    /// Meter measuring one output, used for voltage/frequency only.
    pub output_ms: u64,
}

impl Default for SourceExpiration {
    fn default() -> Self {
        Self {
            external_ms: 60_000,
            remote_ms: 10_000,
            local_ms: 10_000,
            output_ms: 10_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct GridCfg {
    /// 50 or 60; 0 lets the zero-cross detector decide.
    pub nominal_frequency_hz: u8,
    pub expiration: SourceExpiration,
    /// Minimum change of resolved grid power that triggers an early diversion pass.
    pub power_delta_w: f32,
}

impl Default for GridCfg {
    fn default() -> Self {
        Self {
            nominal_frequency_hz: 50,
            expiration: SourceExpiration::default(),
            power_delta_w: 1.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct ZcdCfg {
    pub enabled: bool,
    pub pin: i32,
    /// Edges must keep arriving within this window for the grid to count as online.
    pub online_timeout_ms: u64,
    /// Give up a semi-period recording after this long.
    pub record_timeout_ms: u64,
}

impl Default for ZcdCfg {
    fn default() -> Self {
        Self {
            enabled: true,
            pin: 35,
            online_timeout_ms: 100,
            record_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TermMode {
    #[default]
    Error,
    Input,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PidTrigger {
    /// Run on a fixed interval with time-scaled gains.
    #[default]
    Interval,
    /// Run whenever a new grid measurement arrives.
    Measure,
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct PidCfg {
    pub setpoint_w: f32,
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
    pub out_min_w: f32,
    pub out_max_w: f32,
    pub p_mode: TermMode,
    pub d_mode: TermMode,
    pub reversed: bool,
    pub trigger: PidTrigger,
    pub interval_ms: u64,
    /// Input noise rejection in percent; 0 disables the input filter.
    pub noise_pct: u8,
}

impl Default for PidCfg {
    fn default() -> Self {
        Self {
            setpoint_w: 0.0,
            kp: 0.1,
            ki: 0.3,
            kd: 0.05,
            out_min_w: -300.0,
            out_max_w: 4000.0,
            p_mode: TermMode::Input,
            d_mode: TermMode::Error,
            reversed: false,
            trigger: PidTrigger::Interval,
            interval_ms: 500,
            noise_pct: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RelayKind {
    /// Normally open: energized coil closes the load circuit.
    #[default]
    No,
    /// Normally closed: energized coil opens the load circuit.
    Nc,
}

#[derive(Debug, Deserialize, Clone, Copy, Default)]
pub struct BypassRelayCfg {
    pub pin: u8,
    #[serde(default, rename = "type")]
    pub kind: RelayKind,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AutoBypassCfg {
    pub enabled: bool,
    pub start_temp_c: f32,
    pub stop_temp_c: f32,
    /// Window start, `HH:MM` local time.
    pub start_time: String,
    /// Window end, `HH:MM`; may be earlier than the start to wrap midnight.
    pub stop_time: String,
    /// Three-letter English day names (`mon`, `tue`, ...).
    pub week_days: Vec<String>,
}

impl Default for AutoBypassCfg {
    fn default() -> Self {
        Self {
            enabled: false,
            start_temp_c: 50.0,
            stop_temp_c: 60.0,
            start_time: "22:00".to_string(),
            stop_time: "06:00".to_string(),
            week_days: WEEK_DAYS.iter().map(|d| (*d).to_string()).collect(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OutputCfg {
    pub name: String,
    pub enabled: bool,
    pub dimmer_pin: Option<i32>,
    pub duty_min: f32,
    pub duty_max: f32,
    pub duty_limit: f32,
    pub auto_dimmer: bool,
    /// Calibrated load resistance in ohms; 0 means not calibrated yet.
    pub resistance_ohm: f32,
    /// Stop dimming above this temperature; 0 disables the limit.
    pub dimmer_temp_limit_c: f32,
    /// Cap on the power this output may take from the excess; 0 disables the cap.
    pub excess_limiter_w: f32,
    pub bypass_relay: Option<BypassRelayCfg>,
    pub auto_bypass: AutoBypassCfg,
}

impl Default for OutputCfg {
    fn default() -> Self {
        Self {
            name: "output".to_string(),
            enabled: true,
            dimmer_pin: None,
            duty_min: 0.0,
            duty_max: 1.0,
            duty_limit: 1.0,
            auto_dimmer: true,
            resistance_ohm: 0.0,
            dimmer_temp_limit_c: 0.0,
            excess_limiter_w: 0.0,
            bypass_relay: None,
            auto_bypass: AutoBypassCfg::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RelayCfg {
    pub name: String,
    pub pin: Option<u8>,
    #[serde(rename = "type")]
    pub kind: RelayKind,
    /// Nominal resistive load in watts; 0 keeps the relay manual-only.
    pub nominal_load_w: u16,
    /// Hysteresis band as a percentage of the nominal load.
    pub tolerance_pct: f32,
}

impl Default for RelayCfg {
    fn default() -> Self {
        Self {
            name: "relay".to_string(),
            pin: None,
            kind: RelayKind::No,
            nominal_load_w: 0,
            tolerance_pct: 7.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct SchedulerCfg {
    /// Record per-task execution statistics.
    pub profiling: bool,
    /// Safety/bypass housekeeping cadence.
    pub router_interval_ms: u64,
    /// Relay auto-switch cadence.
    pub relay_interval_ms: u64,
    /// Local time offset from UTC, used by auto-bypass windows.
    pub utc_offset_min: i16,
}

impl Default for SchedulerCfg {
    fn default() -> Self {
        Self {
            profiling: false,
            router_interval_ms: 500,
            relay_interval_ms: 10_000,
            utc_offset_min: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct MetersCfg {
    pub sample_rate_hz: u32,
    pub read_timeout_ms: u64,
}

impl Default for MetersCfg {
    fn default() -> Self {
        Self {
            sample_rate_hz: 4,
            read_timeout_ms: 500,
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct Config {
    pub grid: GridCfg,
    pub zcd: ZcdCfg,
    pub pid: PidCfg,
    pub outputs: Vec<OutputCfg>,
    pub relays: Vec<RelayCfg>,
    pub scheduler: SchedulerCfg,
    pub meters: MetersCfg,
    pub logging: Logging,
}

pub const WEEK_DAYS: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

/// Parse `HH:MM` into minutes since midnight.
pub fn parse_hhmm(s: &str) -> Option<u16> {
    let (h, m) = s.trim().split_once(':')?;
    let h: u16 = h.parse().ok()?;
    let m: u16 = m.parse().ok()?;
    (h < 24 && m < 60).then_some(h * 60 + m)
}

/// Index of a three-letter day name, Sunday = 0.
pub fn week_day_index(s: &str) -> Option<u8> {
    let lower = s.trim().to_ascii_lowercase();
    WEEK_DAYS
        .iter()
        .position(|d| *d == lower)
        .and_then(|i| u8::try_from(i).ok())
}

fn in_unit(x: f32) -> bool {
    x.is_finite() && (0.0..=1.0).contains(&x)
}

impl Config {
    pub fn validate(&self) -> eyre::Result<()> {
        // Grid
        if !matches!(self.grid.nominal_frequency_hz, 0 | 50 | 60) {
            eyre::bail!("grid.nominal_frequency_hz must be 0, 50 or 60");
        }
        if !self.grid.power_delta_w.is_finite() || self.grid.power_delta_w < 0.0 {
            eyre::bail!("grid.power_delta_w must be >= 0");
        }

        // Zero-cross
        if self.zcd.enabled && self.zcd.pin < 0 {
            eyre::bail!("zcd.pin must be >= 0 when zcd.enabled");
        }
        if self.zcd.online_timeout_ms == 0 {
            eyre::bail!("zcd.online_timeout_ms must be >= 1");
        }
        if self.zcd.record_timeout_ms == 0 {
            eyre::bail!("zcd.record_timeout_ms must be >= 1");
        }

        // PID
        for (name, v) in [("kp", self.pid.kp), ("ki", self.pid.ki), ("kd", self.pid.kd)] {
            if !v.is_finite() || v < 0.0 {
                eyre::bail!("pid.{name} must be a finite value >= 0");
            }
        }
        if !self.pid.setpoint_w.is_finite() {
            eyre::bail!("pid.setpoint_w must be finite");
        }
        if !(self.pid.out_min_w.is_finite() && self.pid.out_max_w.is_finite())
            || self.pid.out_min_w >= self.pid.out_max_w
        {
            eyre::bail!("pid.out_min_w must be < pid.out_max_w");
        }
        if self.pid.interval_ms == 0 {
            eyre::bail!("pid.interval_ms must be >= 1");
        }
        if self.pid.noise_pct >= 100 {
            eyre::bail!("pid.noise_pct must be in [0, 99]");
        }

        // Outputs
        let mut names = HashSet::new();
        let mut pins = HashSet::new();
        if self.zcd.enabled {
            pins.insert(self.zcd.pin);
        }
        for o in &self.outputs {
            if !names.insert(o.name.as_str()) {
                eyre::bail!("outputs.name '{}' is duplicated", o.name);
            }
            if !(in_unit(o.duty_min) && in_unit(o.duty_max) && in_unit(o.duty_limit)) {
                eyre::bail!("outputs.{}: duty_min/duty_max/duty_limit must be in [0.0, 1.0]", o.name);
            }
            if o.duty_min > o.duty_max {
                eyre::bail!("outputs.{}: duty_min must be <= duty_max", o.name);
            }
            if !o.resistance_ohm.is_finite() || o.resistance_ohm < 0.0 {
                eyre::bail!("outputs.{}: resistance_ohm must be >= 0", o.name);
            }
            if !o.dimmer_temp_limit_c.is_finite() || o.dimmer_temp_limit_c < 0.0 {
                eyre::bail!("outputs.{}: dimmer_temp_limit_c must be >= 0", o.name);
            }
            if !o.excess_limiter_w.is_finite() || o.excess_limiter_w < 0.0 {
                eyre::bail!("outputs.{}: excess_limiter_w must be >= 0", o.name);
            }
            if let Some(pin) = o.dimmer_pin
                && pin >= 0
                && !pins.insert(pin)
            {
                eyre::bail!("outputs.{}: dimmer_pin {pin} is already in use", o.name);
            }
            if let Some(r) = o.bypass_relay
                && !pins.insert(i32::from(r.pin))
            {
                eyre::bail!("outputs.{}: bypass_relay.pin {} is already in use", o.name, r.pin);
            }
            let ab = &o.auto_bypass;
            if ab.enabled {
                if ab.start_temp_c >= ab.stop_temp_c {
                    eyre::bail!("outputs.{}: auto_bypass.start_temp_c must be < stop_temp_c", o.name);
                }
                if parse_hhmm(&ab.start_time).is_none() || parse_hhmm(&ab.stop_time).is_none() {
                    eyre::bail!("outputs.{}: auto_bypass times must be HH:MM", o.name);
                }
                if let Some(bad) = ab.week_days.iter().find(|d| week_day_index(d).is_none()) {
                    eyre::bail!("outputs.{}: auto_bypass.week_days has unknown day '{bad}'", o.name);
                }
            }
        }

        // Relays
        let mut relay_names = HashSet::new();
        for r in &self.relays {
            if !relay_names.insert(r.name.as_str()) {
                eyre::bail!("relays.name '{}' is duplicated", r.name);
            }
            if !r.tolerance_pct.is_finite() || !(0.0..=100.0).contains(&r.tolerance_pct) {
                eyre::bail!("relays.{}: tolerance_pct must be in [0, 100]", r.name);
            }
            if let Some(pin) = r.pin
                && !pins.insert(i32::from(pin))
            {
                eyre::bail!("relays.{}: pin {pin} is already in use", r.name);
            }
        }

        // Scheduler
        if self.scheduler.router_interval_ms == 0 {
            eyre::bail!("scheduler.router_interval_ms must be >= 1");
        }
        if self.scheduler.relay_interval_ms == 0 {
            eyre::bail!("scheduler.relay_interval_ms must be >= 1");
        }
        if !(-720..=840).contains(&self.scheduler.utc_offset_min) {
            eyre::bail!("scheduler.utc_offset_min must be in [-720, 840]");
        }

        // Meters
        if self.meters.sample_rate_hz == 0 {
            eyre::bail!("meters.sample_rate_hz must be > 0");
        }
        if self.meters.read_timeout_ms == 0 {
            eyre::bail!("meters.read_timeout_ms must be >= 1");
        }

        // Logging
        if let Some(rot) = self.logging.rotation.as_deref()
            && !matches!(rot, "never" | "daily" | "hourly")
        {
            eyre::bail!("logging.rotation must be one of never|daily|hourly");
        }

        Ok(())
    }
}
