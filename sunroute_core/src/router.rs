//! Diversion controller: PID over grid power, excess split across outputs in
//! priority order, fail-safe stop and load calibration.
use crate::grid::GridMetrics;
use crate::output::RouterOutput;
use crate::pid::Pid;
use std::time::{Duration, Instant};

/// Time each calibration duty level is held before measuring.
pub const CALIBRATION_SETTLE: Duration = Duration::from_secs(5);
/// Gap between two diversion runs above which the measurement path is
/// reported as too slow.
pub const SLOW_MEASUREMENT: Duration = Duration::from_secs(2);

pub type CalibrationCallback = Box<dyn FnOnce(&[RouterOutput]) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationStep {
    /// Turn everything off and take manual control.
    Prepare,
    /// Start the current output at half duty.
    Half,
    /// Measure at half duty, then go full.
    MeasureHalf,
    /// Measure at full duty, average, move on.
    MeasureFull,
}

struct Calibration {
    step: CalibrationStep,
    index: usize,
    since: Instant,
    first_reading: Option<f32>,
    saved: Vec<(bool, bool)>,
    done: Option<CalibrationCallback>,
}

/// What one diversion pass did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DivertOutcome {
    /// Calibration holds the outputs.
    Skipped,
    /// Watts routed into the outputs.
    Diverted(f32),
    /// Exporting with nothing routed: PID restarted from 0.
    Reset,
    /// Voltage or power unknown: every output stopped.
    Stopped,
}

pub struct DiversionController {
    pid: Pid,
    routed: f32,
    last_run: Option<Instant>,
    calibration: Option<Calibration>,
}

impl DiversionController {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            routed: 0.0,
            last_run: None,
            calibration: None,
        }
    }

    pub fn pid(&self) -> &Pid {
        &self.pid
    }

    pub fn pid_mut(&mut self) -> &mut Pid {
        &mut self.pid
    }

    /// Power routed by the last pass.
    pub fn routed_power(&self) -> f32 {
        self.routed
    }

    /// Run the PID on `power` and fill outputs in order with the result.
    /// Returns the routed power.
    pub fn divert(&mut self, outputs: &mut [RouterOutput], voltage: f32, power: f32, now: Instant) -> f32 {
        let mut available = self.pid.compute(power, now);
        let mut routed = 0.0;
        for output in outputs.iter_mut().filter(|o| o.is_auto_dimmer_enabled()) {
            let used = output.auto_divert(voltage, available, now);
            available -= used;
            routed += used;
        }
        self.routed = routed;
        routed
    }

    /// Fail-safe: every output outside a bypass goes to 0 and the PID
    /// restarts from 0. Idempotent.
    pub fn no_divert(&mut self, outputs: &mut [RouterOutput]) {
        for output in outputs.iter_mut().filter(|o| !o.is_bypass_on()) {
            output.dimmer_off();
        }
        self.pid.reset(0.0);
        self.routed = 0.0;
    }

    /// One pass of the diversion task against the arbitrated metrics.
    pub fn run(&mut self, outputs: &mut [RouterOutput], metrics: &GridMetrics, now: Instant) -> DivertOutcome {
        if self.is_calibration_running() {
            return DivertOutcome::Skipped;
        }
        let previous = self.last_run.replace(now);
        let (Some(voltage), Some(power)) = (metrics.voltage, metrics.power) else {
            self.no_divert(outputs);
            return DivertOutcome::Stopped;
        };
        let routed = self.divert(outputs, voltage, power, now);
        if routed > 0.0 {
            if let Some(prev) = previous
                && now.saturating_duration_since(prev) >= SLOW_MEASUREMENT
            {
                tracing::warn!(gap_ms = now.saturating_duration_since(prev).as_millis(), "grid measurement too slow");
            }
            DivertOutcome::Diverted(routed)
        } else if power < 0.0 {
            // Integral would otherwise climb to out_max while nothing can route.
            self.pid.reset(0.0);
            DivertOutcome::Reset
        } else {
            DivertOutcome::Diverted(0.0)
        }
    }

    /// Grid power with the routed loads removed.
    pub fn virtual_grid_power(grid_power: f32, outputs: &[RouterOutput], voltage: f32, now: Instant) -> f32 {
        grid_power - outputs.iter().map(|o| o.routed_power(voltage, now)).sum::<f32>()
    }

    pub fn is_calibration_running(&self) -> bool {
        self.calibration.is_some()
    }

    pub fn calibration_step(&self) -> Option<(CalibrationStep, usize)> {
        self.calibration.as_ref().map(|c| (c.step, c.index))
    }

    /// Start measuring each output's load resistance. Ignored while a
    /// calibration is already running.
    pub fn begin_calibration(&mut self, done: Option<CalibrationCallback>, now: Instant) -> bool {
        if self.calibration.is_some() {
            return false;
        }
        tracing::info!("starting calibration");
        self.calibration = Some(Calibration {
            step: CalibrationStep::Prepare,
            index: 0,
            since: now,
            first_reading: None,
            saved: Vec::new(),
            done,
        });
        true
    }

    /// Advance the calibration state machine.
    pub fn calibrate(&mut self, outputs: &mut [RouterOutput], now: Instant) {
        let Some(mut cal) = self.calibration.take() else {
            return;
        };
        match cal.step {
            CalibrationStep::Prepare => {
                cal.saved = outputs
                    .iter_mut()
                    .map(|o| {
                        let saved = (o.config().auto_dimmer, o.config().auto_bypass.enabled);
                        o.config_mut().auto_dimmer = false;
                        o.config_mut().auto_bypass.enabled = false;
                        o.apply_auto_bypass(None, now);
                        o.try_bypass_state(false, now);
                        o.dimmer_off();
                        tracing::info!(output = %o.name(), "output off for calibration");
                        saved
                    })
                    .collect();
                self.pid.reset(0.0);
                self.routed = 0.0;
                cal.index = 0;
                cal.step = CalibrationStep::Half;
            }
            CalibrationStep::Half => match outputs.get_mut(cal.index) {
                Some(o) if o.dimmer().is_online() => {
                    tracing::info!(output = %o.name(), "calibrating at 50%");
                    o.set_dimmer_duty(0.5);
                    cal.since = now;
                    cal.step = CalibrationStep::MeasureHalf;
                }
                Some(o) => {
                    tracing::warn!(output = %o.name(), "dimmer offline, skipped by calibration");
                    cal.index += 1;
                }
                None => {}
            },
            CalibrationStep::MeasureHalf => {
                if now.saturating_duration_since(cal.since) > CALIBRATION_SETTLE
                    && let Some(o) = outputs.get_mut(cal.index)
                {
                    cal.first_reading = o.measured_resistance(now);
                    tracing::info!(output = %o.name(), resistance = ?cal.first_reading, "calibrating at 100%");
                    o.set_dimmer_duty(1.0);
                    cal.since = now;
                    cal.step = CalibrationStep::MeasureFull;
                }
            }
            CalibrationStep::MeasureFull => {
                if now.saturating_duration_since(cal.since) > CALIBRATION_SETTLE
                    && let Some(o) = outputs.get_mut(cal.index)
                {
                    let second = o.measured_resistance(now);
                    let resistance = match (cal.first_reading.take(), second) {
                        (Some(a), Some(b)) => Some((a + b) / 2.0),
                        (a, b) => a.or(b),
                    };
                    match resistance {
                        Some(r) => {
                            o.config_mut().calibrated_resistance = r;
                            tracing::info!(output = %o.name(), resistance = r, "output calibrated");
                        }
                        None => tracing::warn!(output = %o.name(), "no output measurement, resistance unchanged"),
                    }
                    o.dimmer_off();
                    cal.index += 1;
                    cal.step = CalibrationStep::Half;
                }
            }
        }

        if cal.step == CalibrationStep::Half && cal.index >= outputs.len() {
            for (o, (auto_dimmer, auto_bypass)) in outputs.iter_mut().zip(cal.saved) {
                o.config_mut().auto_dimmer = auto_dimmer;
                o.config_mut().auto_bypass.enabled = auto_bypass;
            }
            tracing::info!("calibration done");
            if let Some(done) = cal.done {
                done(outputs);
            }
            return;
        }
        self.calibration = Some(cal);
    }
}
