//! Multi-source grid metrics arbitration.
//!
//! One expiring record per [`Source`]; [`Grid::resolve_at`] picks, field by
//! field, the highest-priority source whose record is fresh and has the field.
//! Resolution depends only on the records and the given instant.
use std::sync::Arc;
use std::time::{Duration, Instant};
use sunroute_traits::{Clock, Measurement};

/// Measurement sources, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    /// Value pushed by a collaborator (MQTT payload, HTTP call).
    External,
    /// Meter reached over the network.
    Remote,
    /// Meter wired to the controller.
    Local,
    /// Meter on an output; trusted for voltage and frequency only.
    Output,
}

impl Source {
    pub const PRIORITY: [Self; 4] = [Self::External, Self::Remote, Self::Local, Self::Output];

    const fn index(self) -> usize {
        match self {
            Self::External => 0,
            Self::Remote => 1,
            Self::Local => 2,
            Self::Output => 3,
        }
    }

    /// Whether this source may provide anything besides voltage/frequency.
    const fn is_grid_meter(self) -> bool {
        !matches!(self, Self::Output)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Record {
    metrics: Measurement,
    updated: Option<Instant>,
    expiration: Duration,
}

impl Record {
    /// `expiration` of zero never expires.
    fn fresh(&self, now: Instant) -> Option<&Measurement> {
        let updated = self.updated?;
        if self.expiration.is_zero() || now.saturating_duration_since(updated) < self.expiration {
            Some(&self.metrics)
        } else {
            None
        }
    }
}

/// Resolved metrics, each field from the best source that has it.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GridMetrics {
    pub power: Option<f32>,
    pub voltage: Option<f32>,
    pub frequency: Option<f32>,
    pub current: Option<f32>,
    pub apparent_power: Option<f32>,
    pub power_factor: Option<f32>,
    pub energy: Option<f32>,
    pub energy_returned: Option<f32>,
    /// Source the power value came from.
    pub power_source: Option<Source>,
}

impl GridMetrics {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn finite(v: Option<f32>) -> Option<f32> {
    v.filter(|x| x.is_finite())
}

fn positive(v: Option<f32>) -> Option<f32> {
    v.filter(|x| x.is_finite() && *x > 0.0)
}

pub struct Grid {
    clock: Arc<dyn Clock + Send + Sync>,
    records: [Record; 4],
    power_delta: f32,
    last_power: Option<f32>,
}

impl Grid {
    pub fn new(clock: Arc<dyn Clock + Send + Sync>) -> Self {
        Self {
            clock,
            records: [Record::default(); 4],
            power_delta: 1.0,
            last_power: None,
        }
    }

    pub fn set_expiration(&mut self, source: Source, expiration: Duration) {
        self.records[source.index()].expiration = expiration;
    }

    pub fn expiration(&self, source: Source) -> Duration {
        self.records[source.index()].expiration
    }

    /// Minimum power change reported by [`Grid::refresh_power`].
    pub fn set_power_delta(&mut self, watts: f32) {
        self.power_delta = watts.max(0.0);
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Replace the record of `source`.
    pub fn update(&mut self, source: Source, metrics: Measurement, at: Instant) {
        let rec = &mut self.records[source.index()];
        rec.metrics = metrics;
        rec.updated = Some(at);
    }

    /// Drop the record of `source` (meter disconnected).
    pub fn invalidate(&mut self, source: Source) {
        self.records[source.index()].updated = None;
    }

    pub fn update_external_power(&mut self, watts: f32, at: Instant) {
        self.update(Source::External, Measurement::with_power(watts), at);
    }

    /// Fresh record of one source, if any.
    pub fn record(&self, source: Source) -> Option<Measurement> {
        self.records[source.index()].fresh(self.clock.now()).copied()
    }

    pub fn resolve(&self) -> GridMetrics {
        self.resolve_at(self.clock.now())
    }

    pub fn resolve_at(&self, now: Instant) -> GridMetrics {
        let fresh = Source::PRIORITY.map(|s| (s, self.records[s.index()].fresh(now)));
        let pick = |grid_only: bool, field: fn(&Measurement) -> Option<f32>| {
            fresh
                .iter()
                .filter(|(s, _)| !grid_only || s.is_grid_meter())
                .find_map(|(s, m)| m.and_then(field).map(|v| (*s, v)))
        };

        let power = pick(true, |m| finite(m.power));
        GridMetrics {
            power: power.map(|(_, v)| v),
            power_source: power.map(|(s, _)| s),
            voltage: pick(false, |m| positive(m.voltage)).map(|(_, v)| v),
            frequency: pick(false, |m| positive(m.frequency)).map(|(_, v)| v),
            current: pick(true, |m| finite(m.current)).map(|(_, v)| v),
            apparent_power: pick(true, |m| finite(m.apparent_power)).map(|(_, v)| v),
            power_factor: pick(true, |m| finite(m.power_factor)).map(|(_, v)| v),
            energy: pick(true, |m| finite(m.energy)).map(|(_, v)| v),
            energy_returned: pick(true, |m| finite(m.energy_returned)).map(|(_, v)| v),
        }
    }

    pub fn power(&self) -> Option<f32> {
        self.resolve().power
    }

    pub fn voltage(&self) -> Option<f32> {
        self.resolve().voltage
    }

    pub fn frequency(&self) -> Option<f32> {
        self.resolve().frequency
    }

    /// A grid voltage is known.
    pub fn is_connected(&self) -> bool {
        self.voltage().is_some()
    }

    /// Re-resolve power and report whether it moved by more than the delta
    /// (or appeared/disappeared) since the last call.
    pub fn refresh_power(&mut self) -> bool {
        let power = self.power();
        let changed = match (self.last_power, power) {
            (Some(old), Some(new)) => (new - old).abs() > self.power_delta,
            (None, None) => false,
            _ => true,
        };
        if changed {
            self.last_power = power;
        }
        changed
    }
}
