//! AC zero-cross timing reference.
//!
//! The edge handler (`ZeroCrossIsr::on_edge`) runs in interrupt context: it
//! only touches atomics and a short critical section, then notifies the
//! registered listeners with the current semi-period. Task context reads the
//! estimate through [`ZeroCrossDetector`].
//!
//! Steady state uses rising edges only: one pulse per zero-cross, so the
//! rising-to-rising interval is a half cycle. Falling edges only matter while
//! recording, to measure the pulse width.
use crate::error::RouterError;
use crate::util::{frequency_hz, semi_period_us};
use core::cell::RefCell;
use critical_section::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use sunroute_traits::{Board, Clock};

/// Semi-period assumed when the nominal frequency is left to auto-detection.
pub const DEFAULT_SEMI_PERIOD_US: u32 = 10_000;
/// Plausible half-cycle bounds when no nominal frequency is configured.
const MIN_SEMI_PERIOD_US: u32 = 6_000;
const MAX_SEMI_PERIOD_US: u32 = 14_000;
/// A recording is accepted for grids between 40 and 70 Hz.
const RECORD_MIN_SEMI_US: u32 = 7_142;
const RECORD_MAX_SEMI_US: u32 = 12_500;
/// Upper bound of edges captured by one recording.
pub const MAX_RECORDED_EDGES: usize = 64;

const NO_EDGE: u64 = u64::MAX;
/// Consecutive over-long intervals after which the estimate is re-seeded.
const RESEED_AFTER: u32 = 3;

/// Receives every accepted zero-cross from interrupt context.
///
/// Implementations must be bounded and allocation-free.
pub trait ZeroCrossListener: Send + Sync {
    fn on_zero_cross(&self, semi_period_us: u32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Idle,
    Recording,
    Recorded,
    Error,
}

/// Outcome of a successful recording burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recording {
    pub semi_period_us: u32,
    /// Shortest rising→falling pulse seen; 0 when no falling edge was captured.
    pub min_pulse_us: u32,
    pub edges: usize,
}

impl Recording {
    pub fn frequency_hz(&self) -> f32 {
        frequency_hz(self.semi_period_us)
    }
}

#[derive(Debug)]
struct Recorder {
    state: RecordingState,
    target: usize,
    edges: usize,
    last_rise: u64,
    interval_sum: u64,
    intervals: u64,
    min_pulse: u64,
    started_us: u64,
    result: Option<Recording>,
}

impl Recorder {
    const fn idle() -> Self {
        Self {
            state: RecordingState::Idle,
            target: 0,
            edges: 0,
            last_rise: NO_EDGE,
            interval_sum: 0,
            intervals: 0,
            min_pulse: u64::MAX,
            started_us: 0,
            result: None,
        }
    }

    fn capture(&mut self, edge: Edge, t: u64) {
        if self.state != RecordingState::Recording {
            return;
        }
        match edge {
            Edge::Rising => {
                if self.last_rise != NO_EDGE {
                    self.interval_sum += t.saturating_sub(self.last_rise);
                    self.intervals += 1;
                }
                self.last_rise = t;
            }
            Edge::Falling => {
                if self.last_rise != NO_EDGE {
                    self.min_pulse = self.min_pulse.min(t.saturating_sub(self.last_rise));
                }
            }
        }
        self.edges += 1;
        if self.edges >= self.target {
            self.finish();
        }
    }

    fn finish(&mut self) {
        if self.intervals == 0 {
            self.state = RecordingState::Error;
            return;
        }
        let semi = u32::try_from(self.interval_sum / self.intervals).unwrap_or(u32::MAX);
        if (RECORD_MIN_SEMI_US..=RECORD_MAX_SEMI_US).contains(&semi) {
            let min_pulse = if self.min_pulse == u64::MAX {
                0
            } else {
                u32::try_from(self.min_pulse).unwrap_or(u32::MAX)
            };
            self.result = Some(Recording {
                semi_period_us: semi,
                min_pulse_us: min_pulse,
                edges: self.edges,
            });
            self.state = RecordingState::Recorded;
        } else {
            self.state = RecordingState::Error;
        }
    }
}

struct Inner {
    clock: Arc<dyn Clock + Send + Sync>,
    epoch: Instant,
    enabled: AtomicBool,
    semi_period_us: AtomicU32,
    min_interval_us: AtomicU32,
    max_interval_us: AtomicU32,
    last_rise_us: AtomicU64,
    edges: AtomicU64,
    glitches: AtomicU64,
    missed: AtomicU64,
    long_streak: AtomicU32,
    recorder: Mutex<RefCell<Recorder>>,
    listeners: Mutex<RefCell<Vec<Arc<dyn ZeroCrossListener>>>>,
}

impl Inner {
    fn micros(&self, at: Instant) -> u64 {
        u64::try_from(at.saturating_duration_since(self.epoch).as_micros()).unwrap_or(u64::MAX - 1)
    }

    fn on_edge(&self, edge: Edge, t: u64) {
        if !self.enabled.load(Ordering::Acquire) {
            return;
        }
        critical_section::with(|cs| self.recorder.borrow_ref_mut(cs).capture(edge, t));
        if edge == Edge::Falling {
            return;
        }

        let prev = self.last_rise_us.load(Ordering::Acquire);
        if prev != NO_EDGE {
            let interval = u32::try_from(t.saturating_sub(prev)).unwrap_or(u32::MAX);
            if interval < self.min_interval_us.load(Ordering::Relaxed) {
                self.glitches.fetch_add(1, Ordering::Relaxed);
                return;
            }
            let old = self.semi_period_us.load(Ordering::Relaxed);
            if interval > self.max_interval_us.load(Ordering::Relaxed) {
                // Signal dropout: restart the interval chain from this edge.
                self.long_streak.store(0, Ordering::Relaxed);
                self.missed.fetch_add(1, Ordering::Relaxed);
            } else if old != 0 && u64::from(interval) * 2 >= u64::from(old) * 3 {
                self.missed.fetch_add(1, Ordering::Relaxed);
                if self.long_streak.fetch_add(1, Ordering::Relaxed) + 1 >= RESEED_AFTER {
                    self.long_streak.store(0, Ordering::Relaxed);
                    self.semi_period_us.store(interval, Ordering::Release);
                }
            } else {
                self.long_streak.store(0, Ordering::Relaxed);
                let filtered = (u64::from(old) * 7 + u64::from(interval)) / 8;
                self.semi_period_us
                    .store(u32::try_from(filtered).unwrap_or(old), Ordering::Release);
            }
        }
        self.last_rise_us.store(t, Ordering::Release);
        self.edges.fetch_add(1, Ordering::Relaxed);

        let semi = self.semi_period_us.load(Ordering::Acquire);
        critical_section::with(|cs| {
            for l in self.listeners.borrow_ref(cs).iter() {
                l.on_zero_cross(semi);
            }
        });
    }
}

/// Interrupt-side handle; clone it into the edge-capture driver.
#[derive(Clone)]
pub struct ZeroCrossIsr {
    inner: Arc<Inner>,
}

impl ZeroCrossIsr {
    /// Edge captured now.
    pub fn on_edge(&self, edge: Edge) {
        let t = self.inner.micros(self.inner.clock.now());
        self.inner.on_edge(edge, t);
    }

    /// Edge captured at a hardware timestamp.
    pub fn on_edge_at(&self, edge: Edge, at: Instant) {
        let t = self.inner.micros(at);
        self.inner.on_edge(edge, t);
    }
}

/// Task-side view of the zero-cross reference.
pub struct ZeroCrossDetector {
    inner: Arc<Inner>,
    board: Arc<dyn Board>,
    pin: Option<i32>,
    online_timeout: Duration,
    record_timeout: Duration,
}

impl ZeroCrossDetector {
    pub fn new(board: Arc<dyn Board>, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        let epoch = clock.now();
        Self {
            inner: Arc::new(Inner {
                clock,
                epoch,
                enabled: AtomicBool::new(false),
                semi_period_us: AtomicU32::new(0),
                min_interval_us: AtomicU32::new(MIN_SEMI_PERIOD_US),
                max_interval_us: AtomicU32::new(MAX_SEMI_PERIOD_US),
                last_rise_us: AtomicU64::new(NO_EDGE),
                edges: AtomicU64::new(0),
                glitches: AtomicU64::new(0),
                missed: AtomicU64::new(0),
                long_streak: AtomicU32::new(0),
                recorder: Mutex::new(RefCell::new(Recorder::idle())),
                listeners: Mutex::new(RefCell::new(Vec::new())),
            }),
            board,
            pin: None,
            online_timeout: Duration::from_millis(100),
            record_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_timeouts(mut self, online: Duration, record: Duration) -> Self {
        self.online_timeout = online;
        self.record_timeout = record;
        self
    }

    pub fn isr(&self) -> ZeroCrossIsr {
        ZeroCrossIsr {
            inner: self.inner.clone(),
        }
    }

    /// Register a listener notified on every accepted zero-cross.
    pub fn add_listener(&self, listener: Arc<dyn ZeroCrossListener>) {
        critical_section::with(|cs| self.inner.listeners.borrow_ref_mut(cs).push(listener));
    }

    /// Arm edge capture on `pin`. `nominal_frequency_hz` of 0 accepts any
    /// plausible mains frequency.
    pub fn begin(&mut self, pin: i32, nominal_frequency_hz: f32) -> Result<(), RouterError> {
        if self.is_enabled() {
            return Ok(());
        }
        if !self.board.is_input_capable(pin) {
            tracing::error!(pin, "zero-cross pin is not a valid input, phase control unavailable");
            return Err(RouterError::InvalidPin(pin));
        }
        let nominal = match semi_period_us(nominal_frequency_hz) {
            0 => {
                self.set_bounds(MIN_SEMI_PERIOD_US, MAX_SEMI_PERIOD_US);
                DEFAULT_SEMI_PERIOD_US
            }
            semi => {
                self.set_bounds(semi / 2, semi.saturating_mul(2));
                semi
            }
        };
        self.inner.semi_period_us.store(nominal, Ordering::Release);
        self.inner.long_streak.store(0, Ordering::Relaxed);
        self.inner.last_rise_us.store(NO_EDGE, Ordering::Release);
        self.inner.enabled.store(true, Ordering::Release);
        self.pin = Some(pin);
        tracing::info!(pin, semi_period_us = nominal, "zero-cross detection started");
        Ok(())
    }

    fn set_bounds(&self, min_us: u32, max_us: u32) {
        self.inner.min_interval_us.store(min_us, Ordering::Relaxed);
        self.inner.max_interval_us.store(max_us, Ordering::Relaxed);
    }

    pub fn end(&mut self) {
        if !self.is_enabled() {
            return;
        }
        self.inner.enabled.store(false, Ordering::Release);
        self.inner.semi_period_us.store(0, Ordering::Release);
        self.inner.last_rise_us.store(NO_EDGE, Ordering::Release);
        self.pin = None;
        tracing::info!("zero-cross detection stopped");
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    pub fn pin(&self) -> Option<i32> {
        self.pin
    }

    /// Edges keep arriving within the online window.
    pub fn is_online(&self) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let last = self.inner.last_rise_us.load(Ordering::Acquire);
        if last == NO_EDGE {
            return false;
        }
        let now = self.inner.micros(self.inner.clock.now());
        let timeout = u64::try_from(self.online_timeout.as_micros()).unwrap_or(u64::MAX);
        now.saturating_sub(last) <= timeout
    }

    /// Filtered half-cycle duration; 0 when disabled or offline.
    pub fn semi_period(&self) -> u32 {
        if self.is_online() {
            self.inner.semi_period_us.load(Ordering::Acquire)
        } else {
            0
        }
    }

    /// Mains frequency derived from the semi-period; 0 when offline.
    pub fn frequency(&self) -> f32 {
        frequency_hz(self.semi_period())
    }

    pub fn edge_count(&self) -> u64 {
        self.inner.edges.load(Ordering::Relaxed)
    }

    pub fn glitch_count(&self) -> u64 {
        self.inner.glitches.load(Ordering::Relaxed)
    }

    /// Over-long intervals kept out of the filter.
    pub fn missed_edge_count(&self) -> u64 {
        self.inner.missed.load(Ordering::Relaxed)
    }

    /// Capture a burst of `edges` edges to auto-detect the semi-period.
    /// Returns false when disabled or a recording is already in progress.
    pub fn start_recording(&self, edges: usize) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let started = self.inner.micros(self.inner.clock.now());
        critical_section::with(|cs| {
            let mut rec = self.inner.recorder.borrow_ref_mut(cs);
            if rec.state == RecordingState::Recording {
                return false;
            }
            *rec = Recorder::idle();
            rec.state = RecordingState::Recording;
            rec.target = edges.clamp(2, MAX_RECORDED_EDGES);
            rec.started_us = started;
            true
        })
    }

    /// Fail a recording that has been running longer than the record timeout.
    pub fn poll_recording(&self) -> RecordingState {
        let now = self.inner.micros(self.inner.clock.now());
        let timeout = u64::try_from(self.record_timeout.as_micros()).unwrap_or(u64::MAX);
        critical_section::with(|cs| {
            let mut rec = self.inner.recorder.borrow_ref_mut(cs);
            if rec.state == RecordingState::Recording
                && now.saturating_sub(rec.started_us) >= timeout
            {
                tracing::warn!(edges = rec.edges, "zero-cross recording timed out");
                rec.state = RecordingState::Error;
            }
            rec.state
        })
    }

    pub fn recording_state(&self) -> RecordingState {
        critical_section::with(|cs| self.inner.recorder.borrow_ref(cs).state)
    }

    pub fn recording(&self) -> Option<Recording> {
        critical_section::with(|cs| self.inner.recorder.borrow_ref(cs).result)
    }

    /// Seed steady-state tracking with the recorded semi-period and return the
    /// recorder to idle.
    pub fn apply_recording(&self) -> Option<Recording> {
        let result = critical_section::with(|cs| {
            let mut rec = self.inner.recorder.borrow_ref_mut(cs);
            let result = rec.result;
            if rec.state != RecordingState::Recording {
                *rec = Recorder::idle();
            }
            result
        })?;
        let semi = result.semi_period_us;
        self.set_bounds(semi / 2, semi.saturating_mul(2));
        self.inner.long_streak.store(0, Ordering::Relaxed);
        self.inner.semi_period_us.store(semi, Ordering::Release);
        tracing::info!(
            semi_period_us = semi,
            min_pulse_us = result.min_pulse_us,
            "zero-cross recording applied"
        );
        Some(result)
    }
}
