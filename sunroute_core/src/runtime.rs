//! Composition root: builds every component from a validated [`Config`] and
//! registers the control tasks on one cooperative scheduler.
//!
//! Task order within a pass is fixed so that the diversion and relay
//! decisions see the metrics read earlier in the same pass:
//!
//! 1. `meters`: drain grid/output meters and temperature sensors
//! 2. `zero_cross`: push the semi-period to the dimmers, handle faults
//! 3. `divert`: PID pass (early run on grid power change)
//! 4. `router`: fail-safe stop, temperature limits, auto-bypass
//! 5. `relays`: relay auto-switch on virtual grid power
//! 6. `relay_timers`: timed manual relay states
//! 7. `calibration`: calibration state machine
use crate::conversions::source_expirations;
use crate::dimmer::Dimmer;
use crate::error::{BuildError, Result};
use crate::grid::{Grid, GridMetrics, Source};
use crate::output::{RouterOutput, TimeOfWeek};
use crate::pid::Pid;
use crate::relay::{Relay, auto_switch};
use crate::router::{CalibrationCallback, DiversionController, DivertOutcome};
use crate::sampler::MeterSampler;
use crate::scheduler::{EarlyRun, Task, TaskManager};
use crate::zero_cross::{MAX_RECORDED_EDGES, RecordingState, ZeroCrossDetector};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sunroute_config::{Config, PidTrigger};
use sunroute_traits::clock::{Clock, MonotonicClock};
use sunroute_traits::{Board, Measurement, Meter, TemperatureSensor};

pub mod task_names {
    pub const METERS: &str = "meters";
    pub const ZERO_CROSS: &str = "zero_cross";
    pub const DIVERT: &str = "divert";
    pub const ROUTER: &str = "router";
    pub const RELAYS: &str = "relays";
    pub const RELAY_TIMERS: &str = "relay_timers";
    pub const CALIBRATION: &str = "calibration";
}

/// Interval of the diversion task when it is driven by measurements.
const MEASURE_TRIGGER_FALLBACK: Duration = Duration::from_secs(2);
const ZERO_CROSS_SYNC: Duration = Duration::from_millis(100);
const RELAY_TIMERS: Duration = Duration::from_secs(1);
const CALIBRATION_STEP: Duration = Duration::from_millis(500);

/// How a meter is read.
pub enum MeterSource {
    /// Read inside the `meters` task.
    Direct(Box<dyn Meter + Send>),
    /// Read on a background thread.
    Sampled(MeterSampler),
}

impl MeterSource {
    fn poll(&mut self, timeout: Duration, clock: &dyn Clock) -> Option<(Measurement, Instant)> {
        match self {
            Self::Direct(meter) => match meter.read(timeout) {
                Ok(m) => Some((m, clock.now())),
                Err(e) => {
                    tracing::trace!(error = %e, "meter read failed");
                    None
                }
            },
            Self::Sampled(sampler) => sampler.latest(),
        }
    }
}

/// Activity counters for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub meter_reads: u64,
    pub divert_runs: u64,
    pub pid_resets: u64,
    pub stops: u64,
    pub relay_switches: u64,
}

type TimeOfWeekFn = Box<dyn Fn() -> Option<TimeOfWeek> + Send>;

/// State shared by the control tasks; owned by [`Router`].
pub struct RouterContext {
    clock: Arc<dyn Clock + Send + Sync>,
    grid: Grid,
    outputs: Vec<RouterOutput>,
    relays: Vec<Relay>,
    diversion: DiversionController,
    zcd: Option<ZeroCrossDetector>,
    grid_meters: Vec<(Source, MeterSource)>,
    output_meters: Vec<(usize, MeterSource)>,
    temperature_sensors: Vec<(usize, Box<dyn TemperatureSensor + Send>)>,
    read_timeout: Duration,
    nominal_frequency: f32,
    divert_on_measure: bool,
    divert_trigger: EarlyRun,
    time_of_week: TimeOfWeekFn,
    counters: Counters,
}

impl RouterContext {
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn grid_mut(&mut self) -> &mut Grid {
        &mut self.grid
    }

    pub fn outputs(&self) -> &[RouterOutput] {
        &self.outputs
    }

    pub fn outputs_mut(&mut self) -> &mut [RouterOutput] {
        &mut self.outputs
    }

    pub fn output(&self, name: &str) -> Option<&RouterOutput> {
        self.outputs.iter().find(|o| o.name() == name)
    }

    pub fn output_mut(&mut self, name: &str) -> Option<&mut RouterOutput> {
        self.outputs.iter_mut().find(|o| o.name() == name)
    }

    pub fn relays(&self) -> &[Relay] {
        &self.relays
    }

    pub fn relay_mut(&mut self, name: &str) -> Option<&mut Relay> {
        self.relays.iter_mut().find(|r| r.name() == name)
    }

    pub fn diversion(&self) -> &DiversionController {
        &self.diversion
    }

    pub fn diversion_mut(&mut self) -> &mut DiversionController {
        &mut self.diversion
    }

    pub fn zero_cross(&self) -> Option<&ZeroCrossDetector> {
        self.zcd.as_ref()
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    pub fn metrics(&self) -> GridMetrics {
        self.grid.resolve()
    }

    /// Arbitrated grid frequency, else the nominal one, else the detected one.
    pub fn frequency(&self) -> f32 {
        self.grid
            .frequency()
            .or_else(|| (self.nominal_frequency > 0.0).then_some(self.nominal_frequency))
            .unwrap_or_else(|| self.zcd.as_ref().map_or(0.0, ZeroCrossDetector::frequency))
    }

    /// Half-cycle the dimmers fire against; 0 without a live zero-cross.
    pub fn semi_period(&self) -> u32 {
        self.zcd.as_ref().map_or(0, ZeroCrossDetector::semi_period)
    }

    pub fn is_auto_dimmer_enabled(&self) -> bool {
        self.outputs.iter().any(RouterOutput::is_auto_dimmer_enabled)
    }

    pub fn has_auto_relay(&self) -> bool {
        self.relays.iter().any(|r| r.is_enabled() && r.is_auto())
    }

    pub fn is_calibration_running(&self) -> bool {
        self.diversion.is_calibration_running()
    }

    /// Power going into the outputs right now.
    pub fn routed_power(&self) -> f32 {
        let voltage = self.grid.voltage().unwrap_or(0.0);
        let now = self.now();
        self.outputs.iter().map(|o| o.routed_power(voltage, now)).sum()
    }

    pub fn virtual_grid_power(&self) -> Option<f32> {
        let m = self.grid.resolve();
        let power = m.power?;
        Some(DiversionController::virtual_grid_power(
            power,
            &self.outputs,
            m.voltage.unwrap_or(0.0),
            self.now(),
        ))
    }

    /// Value pushed by a collaborator; may trigger an early diversion pass.
    pub fn update_external_power(&mut self, watts: f32) {
        let now = self.now();
        self.grid.update_external_power(watts, now);
        self.notify_power_change();
    }

    pub fn begin_calibration(&mut self, done: Option<CalibrationCallback>) -> bool {
        let now = self.now();
        self.diversion.begin_calibration(done, now)
    }

    fn notify_power_change(&mut self) {
        if self.grid.refresh_power() && self.divert_on_measure {
            self.divert_trigger.request();
        }
    }
}

// ── Task bodies ──────────────────────────────────────────────────────────────

fn read_meters(ctx: &mut RouterContext) {
    let clock = ctx.clock.clone();
    let timeout = ctx.read_timeout;
    for (source, meter) in &mut ctx.grid_meters {
        if let Some((m, at)) = meter.poll(timeout, &*clock) {
            ctx.grid.update(*source, m, at);
            ctx.counters.meter_reads += 1;
        }
    }
    for (index, meter) in &mut ctx.output_meters {
        if let Some((m, at)) = meter.poll(timeout, &*clock) {
            ctx.grid.update(Source::Output, m, at);
            if let Some(o) = ctx.outputs.get_mut(*index) {
                o.update_measurement(m, at);
            }
            ctx.counters.meter_reads += 1;
        }
    }
    let now = clock.now();
    for (index, sensor) in &mut ctx.temperature_sensors {
        if let (Some(celsius), Some(o)) = (sensor.read(), ctx.outputs.get_mut(*index)) {
            o.update_temperature(celsius, now);
        }
    }
    ctx.notify_power_change();
}

fn sync_zero_cross(ctx: &mut RouterContext) {
    if let Some(zcd) = ctx.zcd.as_ref() {
        match zcd.poll_recording() {
            RecordingState::Recorded | RecordingState::Error => {
                if zcd.apply_recording().is_none() {
                    tracing::warn!("zero-cross recording failed, keeping nominal semi-period");
                }
            }
            RecordingState::Idle | RecordingState::Recording => {}
        }
    }
    let semi = ctx.semi_period();
    for o in &mut ctx.outputs {
        o.dimmer_mut().poll_fault();
        o.dimmer_mut().set_semi_period(semi);
    }
}

fn divert(ctx: &mut RouterContext) {
    let now = ctx.now();
    let metrics = ctx.grid.resolve();
    match ctx.diversion.run(&mut ctx.outputs, &metrics, now) {
        DivertOutcome::Diverted(_) => ctx.counters.divert_runs += 1,
        DivertOutcome::Reset => {
            ctx.counters.divert_runs += 1;
            ctx.counters.pid_resets += 1;
        }
        DivertOutcome::Stopped => ctx.counters.stops += 1,
        DivertOutcome::Skipped => {}
    }
}

fn housekeeping(ctx: &mut RouterContext) {
    let now = ctx.now();
    let metrics = ctx.grid.resolve();
    if !ctx.is_calibration_running() && (metrics.voltage.is_none() || metrics.power.is_none()) {
        ctx.diversion.no_divert(&mut ctx.outputs);
    }
    let time = (ctx.time_of_week)();
    for o in &mut ctx.outputs {
        o.apply_temperature_limit(now);
        if !ctx.diversion.is_calibration_running() {
            o.apply_auto_bypass(time, now);
        }
    }
}

fn switch_relays(ctx: &mut RouterContext) {
    let Some(vgp) = ctx.virtual_grid_power() else {
        return;
    };
    let now = ctx.now();
    if let Some(t) = auto_switch(&mut ctx.relays, vgp, now) {
        ctx.counters.relay_switches += 1;
        tracing::debug!(relay = t.index, on = t.on, vgp, "relay transition");
    }
}

fn tick_relays(ctx: &mut RouterContext) {
    let now = ctx.now();
    for r in &mut ctx.relays {
        r.tick(now);
    }
}

fn calibrate(ctx: &mut RouterContext) {
    let now = ctx.now();
    ctx.diversion.calibrate(&mut ctx.outputs, now);
}

// ── Router ───────────────────────────────────────────────────────────────────

pub struct Router {
    ctx: RouterContext,
    tasks: TaskManager<RouterContext>,
}

impl core::fmt::Debug for Router {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Router")
            .field("outputs", &self.ctx.outputs.len())
            .field("relays", &self.ctx.relays.len())
            .field("tasks", &self.tasks.len())
            .field("passes", &self.tasks.passes())
            .finish()
    }
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::default()
    }

    /// One scheduler pass; returns how many tasks ran.
    pub fn loop_once(&mut self) -> usize {
        self.tasks.loop_once(&mut self.ctx)
    }

    pub fn context(&self) -> &RouterContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut RouterContext {
        &mut self.ctx
    }

    pub fn tasks(&self) -> &TaskManager<RouterContext> {
        &self.tasks
    }

    pub fn tasks_mut(&mut self) -> &mut TaskManager<RouterContext> {
        &mut self.tasks
    }

    pub fn request_early_run(&self, task: &str) -> bool {
        self.tasks.request_early_run(task)
    }

    /// Stop routing, release relays and outputs.
    pub fn shutdown(&mut self) {
        let now = self.ctx.now();
        self.ctx.diversion.no_divert(&mut self.ctx.outputs);
        for o in &mut self.ctx.outputs {
            o.try_bypass_state(false, now);
            o.end();
        }
        for r in &mut self.ctx.relays {
            r.end();
        }
        if let Some(zcd) = self.ctx.zcd.as_mut() {
            zcd.end();
        }
        tracing::info!("router shut down");
    }
}

// ── Builder ──────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RouterBuilder {
    board: Option<Arc<dyn Board>>,
    clock: Option<Arc<dyn Clock + Send + Sync>>,
    config: Option<Config>,
    grid_meters: Vec<(Source, MeterSource)>,
    output_meters: Vec<(String, MeterSource)>,
    temperature_sensors: Vec<(String, Box<dyn TemperatureSensor + Send>)>,
    time_of_week: Option<TimeOfWeekFn>,
}

impl RouterBuilder {
    #[must_use]
    pub fn with_board(mut self, board: Arc<dyn Board>) -> Self {
        self.board = Some(board);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Meter feeding the grid record of `source`.
    #[must_use]
    pub fn with_grid_meter(mut self, source: Source, meter: MeterSource) -> Self {
        self.grid_meters.push((source, meter));
        self
    }

    /// Meter wired on the named output.
    #[must_use]
    pub fn with_output_meter(mut self, output: impl Into<String>, meter: MeterSource) -> Self {
        self.output_meters.push((output.into(), meter));
        self
    }

    #[must_use]
    pub fn with_temperature_sensor(
        mut self,
        output: impl Into<String>,
        sensor: Box<dyn TemperatureSensor + Send>,
    ) -> Self {
        self.temperature_sensors.push((output.into(), sensor));
        self
    }

    /// Local time source for auto-bypass windows.
    #[must_use]
    pub fn with_time_of_week(mut self, f: impl Fn() -> Option<TimeOfWeek> + Send + 'static) -> Self {
        self.time_of_week = Some(Box::new(f));
        self
    }

    pub fn try_build(self) -> Result<Router> {
        let board = self.board.ok_or_else(|| eyre::Report::new(BuildError::MissingBoard))?;
        let config = self.config.ok_or_else(|| eyre::Report::new(BuildError::MissingConfig))?;
        config
            .validate()
            .map_err(|e| eyre::Report::new(BuildError::InvalidConfig(e.to_string())))?;
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()) as Arc<dyn Clock + Send + Sync>);

        let mut grid = Grid::new(clock.clone());
        for (source, expiration) in source_expirations(&config.grid.expiration) {
            grid.set_expiration(source, expiration);
        }
        grid.set_power_delta(config.grid.power_delta_w);

        let nominal = f32::from(config.grid.nominal_frequency_hz);
        let zcd = config.zcd.enabled.then(|| {
            let mut zcd = ZeroCrossDetector::new(board.clone(), clock.clone()).with_timeouts(
                Duration::from_millis(config.zcd.online_timeout_ms),
                Duration::from_millis(config.zcd.record_timeout_ms),
            );
            match zcd.begin(config.zcd.pin, nominal) {
                Ok(()) if nominal <= 0.0 => {
                    zcd.start_recording(MAX_RECORDED_EDGES);
                }
                Ok(()) => {}
                Err(e) => tracing::warn!(error = %e, "running without zero-cross detection"),
            }
            zcd
        });

        let reading_expiration = Duration::from_millis(config.grid.expiration.output_ms);
        let outputs: Vec<RouterOutput> = config
            .outputs
            .iter()
            .map(|c| {
                let mut dimmer = Dimmer::new(c.name.clone(), board.clone());
                dimmer.set_duty_cycle_min(c.duty_min);
                dimmer.set_duty_cycle_max(c.duty_max);
                dimmer.set_duty_cycle_limit(c.duty_limit);
                if let Some(zcd) = zcd.as_ref() {
                    zcd.add_listener(dimmer.channel());
                }
                if c.enabled
                    && let Some(pin) = c.dimmer_pin
                    && let Err(e) = dimmer.begin(pin, zcd.as_ref().map_or(0, ZeroCrossDetector::semi_period))
                {
                    tracing::warn!(output = %c.name, error = %e, "dimmer unavailable");
                }
                let mut output = RouterOutput::new(c.name.clone(), dimmer, c.into())
                    .with_reading_expiration(reading_expiration);
                if let Some(b) = c.bypass_relay {
                    let mut relay = Relay::new(format!("{}_bypass", c.name));
                    if c.enabled
                        && let Err(e) = relay.begin(&*board, i32::from(b.pin), b.kind.into())
                    {
                        tracing::warn!(output = %c.name, error = %e, "bypass relay unavailable");
                    }
                    output = output.with_bypass_relay(relay);
                }
                output
            })
            .collect();

        let relays: Vec<Relay> = config
            .relays
            .iter()
            .map(|c| {
                let mut relay = Relay::new(c.name.clone());
                match c.pin {
                    Some(pin) => {
                        if let Err(e) = relay.begin(&*board, i32::from(pin), c.kind.into()) {
                            tracing::warn!(relay = %c.name, error = %e, "relay unavailable");
                        }
                    }
                    None => tracing::info!(relay = %c.name, "relay has no pin, disabled"),
                }
                relay.set_load(c.nominal_load_w);
                relay.set_tolerance(c.tolerance_pct / 100.0);
                relay
            })
            .collect();

        let index_of = |name: &str| {
            outputs
                .iter()
                .position(|o| o.name() == name)
                .ok_or_else(|| eyre::Report::new(BuildError::InvalidConfig(format!("unknown output '{name}'"))))
        };
        let output_meters = self
            .output_meters
            .into_iter()
            .map(|(name, meter)| index_of(&name).map(|i| (i, meter)))
            .collect::<Result<Vec<_>>>()?;
        let temperature_sensors = self
            .temperature_sensors
            .into_iter()
            .map(|(name, sensor)| index_of(&name).map(|i| (i, sensor)))
            .collect::<Result<Vec<_>>>()?;

        let utc_offset = config.scheduler.utc_offset_min;
        let time_of_week: TimeOfWeekFn = match self.time_of_week {
            Some(f) => f,
            None => Box::new(move || TimeOfWeek::now(utc_offset)),
        };

        let measure_trigger = config.pid.trigger == PidTrigger::Measure;
        let mut ctx = RouterContext {
            clock: clock.clone(),
            grid,
            outputs,
            relays,
            diversion: DiversionController::new(Pid::new((&config.pid).into())),
            zcd,
            grid_meters: self.grid_meters,
            output_meters,
            temperature_sensors,
            read_timeout: Duration::from_millis(config.meters.read_timeout_ms),
            nominal_frequency: nominal,
            divert_on_measure: measure_trigger,
            divert_trigger: EarlyRun::default(),
            time_of_week,
            counters: Counters::default(),
        };

        let mut tasks = TaskManager::new("core", clock);
        let meters_period = Duration::from_micros(crate::util::period_us(config.meters.sample_rate_hz));
        let divert_interval = if measure_trigger {
            MEASURE_TRIGGER_FALLBACK
        } else {
            Duration::from_millis(config.pid.interval_ms)
        };
        tasks.add(Task::new(task_names::METERS, read_meters).every(meters_period));
        tasks.add(Task::new(task_names::ZERO_CROSS, sync_zero_cross).every(ZERO_CROSS_SYNC));
        ctx.divert_trigger = tasks.add(
            Task::new(task_names::DIVERT, divert)
                .every(divert_interval)
                .when(|c: &RouterContext| !c.is_calibration_running() && c.is_auto_dimmer_enabled()),
        );
        tasks.add(
            Task::new(task_names::ROUTER, housekeeping)
                .every(Duration::from_millis(config.scheduler.router_interval_ms)),
        );
        tasks.add(
            Task::new(task_names::RELAYS, switch_relays)
                .every(Duration::from_millis(config.scheduler.relay_interval_ms))
                .when(|c: &RouterContext| {
                    c.has_auto_relay() && !c.is_calibration_running() && c.is_auto_dimmer_enabled()
                }),
        );
        tasks.add(Task::new(task_names::RELAY_TIMERS, tick_relays).every(RELAY_TIMERS));
        tasks.add(
            Task::new(task_names::CALIBRATION, calibrate)
                .every(CALIBRATION_STEP)
                .when(RouterContext::is_calibration_running),
        );
        if config.scheduler.profiling {
            tasks.set_profiling(true);
        }

        tracing::info!(
            outputs = ctx.outputs.len(),
            relays = ctx.relays.len(),
            zero_cross = ctx.zcd.as_ref().is_some_and(ZeroCrossDetector::is_enabled),
            "router ready"
        );
        Ok(Router { ctx, tasks })
    }
}
