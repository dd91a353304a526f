//! Background meter sampling.
//!
//! Each `MeterSampler` owns one blocking [`Meter`] on its own thread and
//! publishes the latest reading with its timestamp over a bounded channel.
//! The scheduler side drains the channel without blocking and tracks the
//! last successful read for staleness checks.
//!
//! The thread is signalled and joined when the sampler is dropped.
use crossbeam_channel as xch;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use sunroute_traits::clock::Clock;
use sunroute_traits::{Measurement, Meter};

pub struct MeterSampler {
    name: String,
    rx: xch::Receiver<(Measurement, Instant)>,
    last_ok: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
    epoch: Instant,
    shutdown: Arc<AtomicBool>,
    join_handle: Option<std::thread::JoinHandle<()>>,
}

impl MeterSampler {
    /// Read `meter` at `hz`, each read bounded by `timeout`.
    pub fn spawn<M, C>(name: impl Into<String>, mut meter: M, hz: u32, timeout: Duration, clock: C) -> Self
    where
        M: Meter + Send + 'static,
        C: Clock + Send + Sync + 'static,
    {
        let name = name.into();
        let (tx, rx) = xch::bounded(1);
        let stale = rx.clone();
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let last_ok = Arc::new(AtomicU64::new(0));
        let last_ok_thread = last_ok.clone();
        let errors = Arc::new(AtomicU64::new(0));
        let errors_thread = errors.clone();
        let period = Duration::from_micros(crate::util::period_us(hz));
        let epoch = clock.now();
        let thread_name = name.clone();

        let join_handle = std::thread::spawn(move || {
            loop {
                if shutdown_thread.load(Ordering::Relaxed) {
                    tracing::debug!(meter = %thread_name, "sampler received shutdown signal");
                    break;
                }

                match meter.read(timeout) {
                    Ok(m) => {
                        let at = clock.now();
                        // Replace a reading the consumer has not picked up yet.
                        while stale.try_recv().is_ok() {}
                        if tx.try_send((m, at)).is_err() {
                            tracing::trace!(meter = %thread_name, "reading dropped, slot busy");
                        }
                        last_ok_thread.store(clock.ms_since(epoch), Ordering::Relaxed);
                    }
                    Err(e) => {
                        errors_thread.fetch_add(1, Ordering::Relaxed);
                        tracing::trace!(meter = %thread_name, error = %e, "meter read failed");
                    }
                }

                if shutdown_thread.load(Ordering::Relaxed) {
                    break;
                }
                clock.sleep(period);
            }
            tracing::trace!(meter = %thread_name, "sampler thread exiting");
        });

        Self {
            name,
            rx,
            last_ok,
            errors,
            epoch,
            shutdown,
            join_handle: Some(join_handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Most recent reading published since the last call.
    pub fn latest(&self) -> Option<(Measurement, Instant)> {
        self.rx.try_iter().last()
    }

    /// Failed reads so far.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Milliseconds since the last good read, relative to `now_ms` from the
    /// sampler epoch.
    pub fn stalled_for(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_ok.load(Ordering::Relaxed))
    }

    pub fn epoch(&self) -> Instant {
        self.epoch
    }
}

impl Drop for MeterSampler {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        // The thread exits after the read in flight (bounded by its timeout).
        if let Some(handle) = self.join_handle.take() {
            match handle.join() {
                Ok(()) => tracing::trace!(meter = %self.name, "sampler thread joined"),
                Err(e) => tracing::warn!(meter = %self.name, ?e, "sampler thread panicked during shutdown"),
            }
        }
    }
}
