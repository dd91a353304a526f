//! PID controller turning grid power into a power-to-divert command.
//!
//! Output is expressed in routed watts. With proportional-on-input the P term
//! is accumulated into the integral sum (incremental form), which keeps the
//! output smooth when the setpoint or the measurement jumps.
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProportionalMode {
    OnError,
    #[default]
    OnInput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DerivativeMode {
    #[default]
    OnError,
    OnInput,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidTunings {
    pub setpoint: f32,
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
    pub out_min: f32,
    pub out_max: f32,
    pub p_mode: ProportionalMode,
    pub d_mode: DerivativeMode,
    pub reversed: bool,
    /// Scale I and D by the elapsed seconds between computations.
    pub time_sampling: bool,
    /// Input low-pass factor in (0, 1]; 1 disables filtering.
    pub filter_alpha: f32,
}

impl Default for PidTunings {
    fn default() -> Self {
        Self {
            setpoint: 0.0,
            kp: 0.1,
            ki: 0.3,
            kd: 0.05,
            out_min: -300.0,
            out_max: 4000.0,
            p_mode: ProportionalMode::OnInput,
            d_mode: DerivativeMode::OnError,
            reversed: false,
            time_sampling: false,
            filter_alpha: 1.0,
        }
    }
}

#[inline]
fn bound(v: f32, lo: f32, hi: f32) -> f32 {
    v.max(lo).min(hi)
}

#[derive(Debug, Clone)]
pub struct Pid {
    t: PidTunings,
    integral: f32,
    input: Option<f32>,
    last_error: Option<f32>,
    last_time: Option<Instant>,
    output: f32,
    p_term: f32,
    i_term: f32,
    d_term: f32,
}

impl Default for Pid {
    fn default() -> Self {
        Self::new(PidTunings::default())
    }
}

impl Pid {
    pub fn new(tunings: PidTunings) -> Self {
        let mut pid = Self {
            t: PidTunings::default(),
            integral: 0.0,
            input: None,
            last_error: None,
            last_time: None,
            output: 0.0,
            p_term: 0.0,
            i_term: 0.0,
            d_term: 0.0,
        };
        pid.configure(tunings);
        pid
    }

    /// Apply a whole tuning set; invalid limits are ignored.
    pub fn configure(&mut self, t: PidTunings) {
        self.set_setpoint(t.setpoint);
        self.set_tunings(t.kp, t.ki, t.kd);
        self.set_output_limits(t.out_min, t.out_max);
        self.t.p_mode = t.p_mode;
        self.t.d_mode = t.d_mode;
        self.t.reversed = t.reversed;
        self.t.time_sampling = t.time_sampling;
        self.set_filter_alpha(t.filter_alpha);
    }

    pub fn tunings(&self) -> PidTunings {
        self.t
    }

    pub fn setpoint(&self) -> f32 {
        self.t.setpoint
    }

    pub fn set_setpoint(&mut self, setpoint: f32) {
        if setpoint.is_finite() {
            self.t.setpoint = setpoint;
        }
    }

    pub fn kp(&self) -> f32 {
        self.t.kp
    }

    pub fn ki(&self) -> f32 {
        self.t.ki
    }

    pub fn kd(&self) -> f32 {
        self.t.kd
    }

    /// Negative or non-finite gains are rejected as a whole.
    pub fn set_tunings(&mut self, kp: f32, ki: f32, kd: f32) -> bool {
        if [kp, ki, kd].iter().any(|g| !g.is_finite() || *g < 0.0) {
            return false;
        }
        self.t.kp = kp;
        self.t.ki = ki;
        self.t.kd = kd;
        true
    }

    pub fn out_min(&self) -> f32 {
        self.t.out_min
    }

    pub fn out_max(&self) -> f32 {
        self.t.out_max
    }

    /// Limits must satisfy `min < max`; the current state is pulled inside.
    pub fn set_output_limits(&mut self, min: f32, max: f32) -> bool {
        if !(min.is_finite() && max.is_finite()) || min >= max {
            return false;
        }
        self.t.out_min = min;
        self.t.out_max = max;
        self.integral = bound(self.integral, min, max);
        self.output = bound(self.output, min, max);
        true
    }

    pub fn proportional_mode(&self) -> ProportionalMode {
        self.t.p_mode
    }

    pub fn set_proportional_mode(&mut self, mode: ProportionalMode) {
        self.t.p_mode = mode;
    }

    pub fn derivative_mode(&self) -> DerivativeMode {
        self.t.d_mode
    }

    pub fn set_derivative_mode(&mut self, mode: DerivativeMode) {
        self.t.d_mode = mode;
    }

    pub fn is_reversed(&self) -> bool {
        self.t.reversed
    }

    pub fn set_reversed(&mut self, reversed: bool) {
        self.t.reversed = reversed;
    }

    pub fn set_time_sampling(&mut self, enabled: bool) {
        self.t.time_sampling = enabled;
        self.last_time = None;
    }

    pub fn set_filter_alpha(&mut self, alpha: f32) {
        if alpha.is_finite() && alpha > 0.0 && alpha <= 1.0 {
            self.t.filter_alpha = alpha;
        }
    }

    /// Restart from `output` with no history.
    pub fn reset(&mut self, output: f32) {
        let v = bound(output, self.t.out_min, self.t.out_max);
        self.integral = v;
        self.output = v;
        self.input = None;
        self.last_error = None;
        self.last_time = None;
        self.p_term = 0.0;
        self.i_term = 0.0;
        self.d_term = 0.0;
    }

    pub fn output(&self) -> f32 {
        self.output
    }

    pub fn integral(&self) -> f32 {
        self.integral
    }

    /// Last (filtered) input.
    pub fn input(&self) -> Option<f32> {
        self.input
    }

    pub fn error(&self) -> Option<f32> {
        self.last_error
    }

    pub fn p_term(&self) -> f32 {
        self.p_term
    }

    pub fn i_term(&self) -> f32 {
        self.i_term
    }

    pub fn d_term(&self) -> f32 {
        self.d_term
    }

    /// One control step. Non-finite inputs leave the state untouched.
    pub fn compute(&mut self, input: f32, now: Instant) -> f32 {
        if !input.is_finite() {
            return self.output;
        }
        let t = self.t;
        let input = match self.input {
            Some(prev) if t.filter_alpha < 1.0 => t.filter_alpha * input + (1.0 - t.filter_alpha) * prev,
            _ => input,
        };
        let dt = match (t.time_sampling, self.last_time) {
            (true, Some(last)) => now.saturating_duration_since(last).as_secs_f32().max(1e-3),
            _ => 1.0,
        };
        let direction = if t.reversed { -1.0 } else { 1.0 };
        let error = direction * (t.setpoint - input);
        let d_input = self.input.map_or(0.0, |prev| direction * (input - prev));
        let d_error = self.last_error.map_or(0.0, |prev| error - prev);

        self.p_term = match t.p_mode {
            ProportionalMode::OnError => t.kp * error,
            ProportionalMode::OnInput => -t.kp * d_input,
        };
        self.i_term = t.ki * error * dt;
        self.d_term = match t.d_mode {
            DerivativeMode::OnError => t.kd * d_error / dt,
            DerivativeMode::OnInput => -t.kd * d_input / dt,
        };

        let mut integral = self.integral + self.i_term;
        let direct = match t.p_mode {
            ProportionalMode::OnError => self.p_term,
            ProportionalMode::OnInput => {
                integral += self.p_term;
                0.0
            }
        };
        let raw = integral + direct + self.d_term;
        // Freeze accumulation that would push further into saturation.
        if (raw > t.out_max && self.i_term > 0.0) || (raw < t.out_min && self.i_term < 0.0) {
            integral -= self.i_term;
        }
        self.integral = bound(integral, t.out_min, t.out_max);
        self.output = bound(self.integral + direct + self.d_term, t.out_min, t.out_max);

        self.input = Some(input);
        self.last_error = Some(error);
        self.last_time = Some(now);
        self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn export_increases_diverted_power() {
        let mut pid = Pid::default();
        let now = Instant::now();
        let first = pid.compute(-1000.0, now);
        assert!(first > 0.0);
        let second = pid.compute(-800.0, now + Duration::from_millis(500));
        assert!(second > 0.0);
    }

    #[test]
    fn reversed_flips_direction() {
        let mut pid = Pid::new(PidTunings {
            reversed: true,
            ..PidTunings::default()
        });
        assert!(pid.compute(-1000.0, Instant::now()) < 0.0);
    }

    #[test]
    fn sustained_saturation_does_not_wind_up() {
        let mut pid = Pid::new(PidTunings {
            p_mode: ProportionalMode::OnError,
            kp: 1.0,
            ki: 1.0,
            kd: 0.0,
            out_min: 0.0,
            out_max: 100.0,
            ..PidTunings::default()
        });
        let now = Instant::now();
        for _ in 0..1000 {
            pid.compute(-10_000.0, now);
        }
        assert_eq!(pid.output(), 100.0);
        assert!(pid.integral() <= 100.0);
        // Recovery is immediate once the error reverses.
        let out = pid.compute(50.0, now);
        assert!(out < 100.0, "out={out}");
    }

    #[test]
    fn reset_clears_history() {
        let mut pid = Pid::default();
        let now = Instant::now();
        pid.compute(-500.0, now);
        pid.reset(0.0);
        assert_eq!(pid.output(), 0.0);
        assert_eq!(pid.integral(), 0.0);
        assert_eq!(pid.input(), None);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut pid = Pid::default();
        assert!(!pid.set_output_limits(10.0, 10.0));
        assert!(!pid.set_tunings(-1.0, 0.0, 0.0));
        assert_eq!(pid.out_max(), 4000.0);
        assert!((pid.kp() - 0.1).abs() < f32::EPSILON);
    }

    #[test]
    fn time_sampling_scales_integral_by_elapsed_seconds() {
        let mut pid = Pid::new(PidTunings {
            p_mode: ProportionalMode::OnError,
            kp: 0.0,
            ki: 1.0,
            kd: 0.0,
            time_sampling: true,
            ..PidTunings::default()
        });
        let t0 = Instant::now();
        pid.compute(-100.0, t0);
        let before = pid.integral();
        pid.compute(-100.0, t0 + Duration::from_millis(250));
        assert!((pid.integral() - before - 25.0).abs() < 1e-3);
    }
}
