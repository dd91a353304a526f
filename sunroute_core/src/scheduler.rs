//! Cooperative, non-preemptive task runner.
//!
//! A [`TaskManager`] owns its tasks and runs them in registration order
//! against a context `C` owned by the caller. Task bodies run to completion;
//! nothing here blocks on another task. Early runs are requested through
//! [`EarlyRun`] handles, which are plain atomic flags and may be raised from
//! any thread.
use crate::util::RunningStats;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use sunroute_traits::Clock;

pub type TaskBody<C> = Box<dyn FnMut(&mut C) + Send>;
pub type EnabledWhen<C> = Box<dyn Fn(&C) -> bool + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskKind {
    /// Runs once, then disables itself.
    Once,
    #[default]
    Forever,
}

/// Handle to request an out-of-band run of one task.
#[derive(Debug, Clone, Default)]
pub struct EarlyRun(Arc<AtomicBool>);

impl EarlyRun {
    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Task<C> {
    name: String,
    body: TaskBody<C>,
    enabled_when: Option<EnabledWhen<C>>,
    kind: TaskKind,
    interval: Duration,
    enabled: bool,
    running: bool,
    early: EarlyRun,
    last_start: Option<Instant>,
    last_end: Option<Instant>,
    iterations: u64,
    stats: Option<RunningStats>,
}

impl<C> Task<C> {
    /// A forever task running on every pass until given an interval.
    pub fn new(name: impl Into<String>, body: impl FnMut(&mut C) + Send + 'static) -> Self {
        Self {
            name: name.into(),
            body: Box::new(body),
            enabled_when: None,
            kind: TaskKind::Forever,
            interval: Duration::ZERO,
            enabled: true,
            running: false,
            early: EarlyRun::default(),
            last_start: None,
            last_end: None,
            iterations: 0,
            stats: None,
        }
    }

    #[must_use]
    pub fn every(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn when(mut self, predicate: impl Fn(&C) -> bool + Send + 'static) -> Self {
        self.enabled_when = Some(Box::new(predicate));
        self
    }

    #[must_use]
    pub fn once(mut self) -> Self {
        self.kind = TaskKind::Once;
        self
    }

    #[must_use]
    pub fn profiled(mut self) -> Self {
        self.stats = Some(RunningStats::default());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn pause(&mut self) {
        self.enabled = false;
    }

    pub fn resume(&mut self) {
        self.enabled = true;
    }

    pub fn early_run(&self) -> EarlyRun {
        self.early.clone()
    }

    pub fn request_early_run(&self) {
        self.early.request();
    }

    pub fn last_start(&self) -> Option<Instant> {
        self.last_start
    }

    pub fn last_end(&self) -> Option<Instant> {
        self.last_end
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn stats(&self) -> Option<&RunningStats> {
        self.stats.as_ref()
    }

    pub fn set_profiling(&mut self, on: bool) {
        match (on, self.stats.is_some()) {
            (true, false) => self.stats = Some(RunningStats::default()),
            (false, true) => self.stats = None,
            _ => {}
        }
    }

    fn is_due(&self, now: Instant) -> bool {
        self.interval.is_zero()
            || self.early.is_requested()
            || self
                .last_end
                .is_none_or(|end| now.saturating_duration_since(end) >= self.interval)
    }

    /// Runnable right now against `ctx`.
    pub fn should_run(&self, ctx: &C, now: Instant) -> bool {
        self.enabled
            && !self.running
            && self.is_due(now)
            && self.enabled_when.as_ref().is_none_or(|p| p(ctx))
    }

    fn execute(&mut self, ctx: &mut C, clock: &dyn Clock) {
        let start = clock.now();
        self.running = true;
        self.last_start = Some(start);
        self.early.clear();
        (self.body)(ctx);
        let end = clock.now();
        self.running = false;
        self.last_end = Some(end);
        self.iterations += 1;
        if let Some(stats) = self.stats.as_mut() {
            let elapsed_us = u64::try_from(end.saturating_duration_since(start).as_micros()).unwrap_or(u64::MAX);
            stats.record(elapsed_us);
            tracing::debug!(
                task = %self.name,
                elapsed_us,
                count = stats.count(),
                mean_us = stats.mean().unwrap_or_default(),
                max_us = stats.max().unwrap_or_default(),
                "task profile"
            );
        }
        if self.kind == TaskKind::Once {
            self.enabled = false;
        }
    }

    /// Run the body if runnable. Returns whether it ran.
    pub fn try_run(&mut self, ctx: &mut C, clock: &dyn Clock) -> bool {
        if !self.should_run(ctx, clock.now()) {
            return false;
        }
        self.execute(ctx, clock);
        true
    }
}

pub struct TaskManager<C> {
    name: String,
    clock: Arc<dyn Clock + Send + Sync>,
    tasks: Vec<Task<C>>,
    passes: u64,
}

impl<C> TaskManager<C> {
    pub fn new(name: impl Into<String>, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        Self {
            name: name.into(),
            clock,
            tasks: Vec::new(),
            passes: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a task; it runs after every task added before it.
    pub fn add(&mut self, task: Task<C>) -> EarlyRun {
        let handle = task.early_run();
        tracing::debug!(manager = %self.name, task = %task.name, interval_ms = task.interval.as_millis(), "task registered");
        self.tasks.push(task);
        handle
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task<C>> {
        self.tasks.iter()
    }

    pub fn task(&self, name: &str) -> Option<&Task<C>> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn task_mut(&mut self, name: &str) -> Option<&mut Task<C>> {
        self.tasks.iter_mut().find(|t| t.name == name)
    }

    /// Completed scheduler passes.
    pub fn passes(&self) -> u64 {
        self.passes
    }

    /// Offer every task one chance to run, in registration order.
    /// Returns how many ran.
    pub fn loop_once(&mut self, ctx: &mut C) -> usize {
        let clock = &*self.clock;
        let ran = self.tasks.iter_mut().filter_map(|t| t.try_run(ctx, clock).then_some(())).count();
        self.passes += 1;
        ran
    }

    pub fn request_early_run(&self, name: &str) -> bool {
        self.task(name).map(Task::request_early_run).is_some()
    }

    pub fn pause(&mut self, name: &str) -> bool {
        self.task_mut(name).map(Task::pause).is_some()
    }

    pub fn resume(&mut self, name: &str) -> bool {
        self.task_mut(name).map(Task::resume).is_some()
    }

    /// Run a task now, ignoring its interval and predicate.
    /// Paused tasks stay paused.
    pub fn force_run(&mut self, name: &str, ctx: &mut C) -> bool {
        let clock = self.clock.clone();
        match self.task_mut(name) {
            Some(task) if task.enabled && !task.running => {
                task.execute(ctx, &*clock);
                true
            }
            _ => false,
        }
    }

    pub fn set_profiling(&mut self, on: bool) {
        self.tasks.iter_mut().for_each(|t| t.set_profiling(on));
    }
}
