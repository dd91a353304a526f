//! Common time/period helpers for sunroute_core.
use std::time::{Duration, Instant};

/// Number of microseconds in one second.
pub const MICROS_PER_SEC: u64 = 1_000_000;
/// Number of milliseconds in one second.
pub const MILLIS_PER_SEC: u64 = 1_000;

/// Compute the period in microseconds for a given sampling rate in Hz.
/// - Clamps `hz` to at least 1 to avoid division by zero.
/// - Ensures result is at least 1 microsecond.
#[inline]
pub fn period_us(hz: u32) -> u64 {
    (MICROS_PER_SEC / u64::from(hz.max(1))).max(1)
}

/// Half-cycle duration in microseconds for a mains frequency; 0 for 0 Hz.
#[inline]
pub fn semi_period_us(frequency_hz: f32) -> u32 {
    if !(frequency_hz.is_finite() && frequency_hz > 0.0) {
        return 0;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let us = (500_000.0 / frequency_hz).round() as u32;
    us
}

/// Mains frequency for a half-cycle duration; 0 when unknown.
#[inline]
pub fn frequency_hz(semi_period_us: u32) -> f32 {
    if semi_period_us == 0 {
        0.0
    } else {
        #[allow(clippy::cast_precision_loss)]
        let f = 500_000.0 / semi_period_us as f32;
        f
    }
}

/// Bounded-memory running statistics (Welford) over durations in micros.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    count: u64,
    min: u64,
    max: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    pub fn record(&mut self, sample: u64) {
        self.count += 1;
        if self.count == 1 {
            self.min = sample;
            self.max = sample;
        } else {
            self.min = self.min.min(sample);
            self.max = self.max.max(sample);
        }
        #[allow(clippy::cast_precision_loss)]
        let x = sample as f64;
        #[allow(clippy::cast_precision_loss)]
        let n = self.count as f64;
        let delta = x - self.mean;
        self.mean += delta / n;
        self.m2 += delta * (x - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min(&self) -> Option<u64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<u64> {
        (self.count > 0).then_some(self.max)
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then_some(self.mean)
    }

    /// Population standard deviation.
    pub fn std_dev(&self) -> Option<f64> {
        #[allow(clippy::cast_precision_loss)]
        let n = self.count as f64;
        (self.count > 0).then(|| (self.m2 / n).sqrt())
    }
}

/// Last value of a reading that goes stale after `expiration`
/// (zero never expires).
#[derive(Debug, Clone, Copy)]
pub struct Expiring<T> {
    value: Option<T>,
    updated: Option<Instant>,
    expiration: Duration,
}

impl<T: Copy> Expiring<T> {
    pub const fn new(expiration: Duration) -> Self {
        Self {
            value: None,
            updated: None,
            expiration,
        }
    }

    pub fn update(&mut self, value: T, at: Instant) {
        self.value = Some(value);
        self.updated = Some(at);
    }

    pub fn invalidate(&mut self) {
        self.value = None;
    }

    /// Nothing was ever recorded.
    pub fn never_updated(&self) -> bool {
        self.updated.is_none()
    }

    pub fn get(&self, now: Instant) -> Option<T> {
        let updated = self.updated?;
        if self.expiration.is_zero() || now.saturating_duration_since(updated) < self.expiration {
            self.value
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiring_value_goes_stale() {
        let t0 = Instant::now();
        let mut v = Expiring::new(Duration::from_secs(2));
        assert!(v.never_updated());
        assert_eq!(v.get(t0), None);
        v.update(42.0_f32, t0);
        assert_eq!(v.get(t0 + Duration::from_secs(1)), Some(42.0));
        assert_eq!(v.get(t0 + Duration::from_secs(2)), None);
        assert!(!v.never_updated());
        v.invalidate();
        assert_eq!(v.get(t0), None);
    }

    #[test]
    fn semi_period_round_trip() {
        assert_eq!(semi_period_us(50.0), 10_000);
        assert_eq!(semi_period_us(60.0), 8_333);
        assert_eq!(semi_period_us(0.0), 0);
        assert!((frequency_hz(10_000) - 50.0).abs() < 1e-4);
        assert!(frequency_hz(0).abs() < f32::EPSILON);
    }

    #[test]
    fn running_stats_track_extremes_and_mean() {
        let mut s = RunningStats::default();
        assert_eq!(s.mean(), None);
        for v in [10, 20, 30, 40] {
            s.record(v);
        }
        assert_eq!(s.count(), 4);
        assert_eq!(s.min(), Some(10));
        assert_eq!(s.max(), Some(40));
        assert!((s.mean().unwrap() - 25.0).abs() < 1e-9);
        assert!((s.std_dev().unwrap() - 125f64.sqrt()).abs() < 1e-9);
    }
}
