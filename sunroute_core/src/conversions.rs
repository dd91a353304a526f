//! `From` implementations bridging `sunroute_config` types to `sunroute_core` types.

use crate::grid::Source;
use crate::output::{AutoBypass, OutputConfig};
use crate::pid::{DerivativeMode, PidTunings, ProportionalMode};
use crate::relay::RelayKind;
use std::time::Duration;
use sunroute_config::{PidTrigger, TermMode};

// ── PID ──────────────────────────────────────────────────────────────────────

impl From<TermMode> for ProportionalMode {
    fn from(m: TermMode) -> Self {
        match m {
            TermMode::Error => Self::OnError,
            TermMode::Input => Self::OnInput,
        }
    }
}

impl From<TermMode> for DerivativeMode {
    fn from(m: TermMode) -> Self {
        match m {
            TermMode::Error => Self::OnError,
            TermMode::Input => Self::OnInput,
        }
    }
}

impl From<&sunroute_config::PidCfg> for PidTunings {
    fn from(c: &sunroute_config::PidCfg) -> Self {
        Self {
            setpoint: c.setpoint_w,
            kp: c.kp,
            ki: c.ki,
            kd: c.kd,
            out_min: c.out_min_w,
            out_max: c.out_max_w,
            p_mode: c.p_mode.into(),
            d_mode: c.d_mode.into(),
            reversed: c.reversed,
            // Interval runs scale gains per second; measurement-driven runs do not.
            time_sampling: c.trigger == PidTrigger::Interval,
            filter_alpha: 1.0 - f32::from(c.noise_pct.min(99)) / 100.0,
        }
    }
}

// ── Relays ───────────────────────────────────────────────────────────────────

impl From<sunroute_config::RelayKind> for RelayKind {
    fn from(k: sunroute_config::RelayKind) -> Self {
        match k {
            sunroute_config::RelayKind::No => Self::NormallyOpen,
            sunroute_config::RelayKind::Nc => Self::NormallyClosed,
        }
    }
}

// ── Outputs ──────────────────────────────────────────────────────────────────

impl From<&sunroute_config::AutoBypassCfg> for AutoBypass {
    fn from(c: &sunroute_config::AutoBypassCfg) -> Self {
        let defaults = Self::default();
        let week_days = c
            .week_days
            .iter()
            .filter_map(|d| sunroute_config::week_day_index(d))
            .fold(0u8, |mask, i| mask | (1 << i));
        Self {
            enabled: c.enabled,
            start_temp: c.start_temp_c,
            stop_temp: c.stop_temp_c,
            start_minute: sunroute_config::parse_hhmm(&c.start_time).unwrap_or(defaults.start_minute),
            stop_minute: sunroute_config::parse_hhmm(&c.stop_time).unwrap_or(defaults.stop_minute),
            week_days,
        }
    }
}

impl From<&sunroute_config::OutputCfg> for OutputConfig {
    fn from(c: &sunroute_config::OutputCfg) -> Self {
        Self {
            auto_dimmer: c.auto_dimmer,
            calibrated_resistance: c.resistance_ohm,
            dimmer_temp_limit: c.dimmer_temp_limit_c,
            excess_power_limiter: c.excess_limiter_w,
            auto_bypass: (&c.auto_bypass).into(),
        }
    }
}

// ── Grid ─────────────────────────────────────────────────────────────────────

/// Per-source record expiration.
pub fn source_expirations(c: &sunroute_config::SourceExpiration) -> [(Source, Duration); 4] {
    [
        (Source::External, Duration::from_millis(c.external_ms)),
        (Source::Remote, Duration::from_millis(c.remote_ms)),
        (Source::Local, Duration::from_millis(c.local_ms)),
        (Source::Output, Duration::from_millis(c.output_ms)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_trigger_selects_time_sampling() {
        let mut cfg = sunroute_config::PidCfg::default();
        let t = PidTunings::from(&cfg);
        assert!(t.time_sampling);
        assert_eq!(t.p_mode, ProportionalMode::OnInput);
        assert!((t.filter_alpha - 1.0).abs() < f32::EPSILON);

        cfg.trigger = PidTrigger::Measure;
        cfg.noise_pct = 25;
        let t = PidTunings::from(&cfg);
        assert!(!t.time_sampling);
        assert!((t.filter_alpha - 0.75).abs() < 1e-6);
    }

    #[test]
    fn auto_bypass_days_become_a_mask() {
        let cfg = sunroute_config::AutoBypassCfg {
            week_days: vec!["sun".into(), "sat".into()],
            start_time: "21:30".into(),
            ..sunroute_config::AutoBypassCfg::default()
        };
        let ab = AutoBypass::from(&cfg);
        assert_eq!(ab.week_days, 0b100_0001);
        assert_eq!(ab.start_minute, 21 * 60 + 30);
        assert!(ab.runs_on(0) && ab.runs_on(6) && !ab.runs_on(3));
    }
}
