//! Test and helper mocks for sunroute_core

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sunroute_traits::{HwResult, Measurement, Meter, TemperatureSensor};

/// A meter that never answers; stands for an unplugged or unconfigured meter.
pub struct NoopMeter;

impl Meter for NoopMeter {
    fn read(&mut self, _timeout: Duration) -> HwResult<Measurement> {
        Err(Box::new(std::io::Error::other("noop meter")))
    }
}

/// Meter replaying a script, then repeating its last reading.
/// `None` entries are read failures.
#[derive(Clone, Default)]
pub struct ScriptedMeter {
    script: Arc<Mutex<VecDeque<Option<Measurement>>>>,
    last: Arc<Mutex<Option<Measurement>>>,
}

impl ScriptedMeter {
    pub fn new(script: impl IntoIterator<Item = Option<Measurement>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into_iter().collect())),
            last: Arc::new(Mutex::new(None)),
        }
    }

    /// Queue another reading.
    pub fn push(&self, m: Option<Measurement>) {
        if let Ok(mut s) = self.script.lock() {
            s.push_back(m);
        }
    }
}

impl Meter for ScriptedMeter {
    fn read(&mut self, _timeout: Duration) -> HwResult<Measurement> {
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        let reading = match next {
            Some(m) => {
                if let (Some(m), Ok(mut last)) = (m, self.last.lock()) {
                    *last = Some(m);
                }
                m
            }
            None => self.last.lock().ok().and_then(|l| *l),
        };
        reading.ok_or_else(|| std::io::Error::other("scripted read failure").into())
    }
}

/// Temperature sensor with a fixed reading.
pub struct FixedTemperature(pub Option<f32>);

impl TemperatureSensor for FixedTemperature {
    fn read(&mut self) -> Option<f32> {
        self.0
    }
}
