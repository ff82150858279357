use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use vantage_core::contracts::MouseSample;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MouseConfig {
    /// Probability that a single pointer move is kept.
    pub sample_rate: f64,
    pub flush_interval_ms: i64,
    pub batch_size: usize,
}

impl Default for MouseConfig {
    fn default() -> Self {
        Self {
            sample_rate: 0.1,
            flush_interval_ms: 5_000,
            batch_size: 50,
        }
    }
}

impl MouseConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::milliseconds(self.flush_interval_ms)
    }
}

pub trait Sampler: Send {
    fn accept(&mut self, rate: f64) -> bool;
}

#[derive(Debug, Default)]
pub struct RandomSampler;

impl Sampler for RandomSampler {
    fn accept(&mut self, rate: f64) -> bool {
        if rate >= 1.0 {
            return true;
        }
        if rate <= 0.0 {
            return false;
        }
        rand::thread_rng().gen::<f64>() < rate
    }
}

/// Sampled pointer positions waiting to be sent as one `mouse_movement` event.
#[derive(Debug, Clone)]
pub struct MouseBuffer {
    samples: Vec<MouseSample>,
    last_flush: DateTime<Utc>,
}

impl MouseBuffer {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            samples: Vec::new(),
            last_flush: now,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Offers one pointer position. Returns true once the buffer holds a full batch.
    pub fn offer(
        &mut self,
        sample: MouseSample,
        sampler: &mut dyn Sampler,
        config: &MouseConfig,
    ) -> bool {
        if sampler.accept(config.sample_rate) {
            self.samples.push(sample);
        }
        self.samples.len() >= config.batch_size.max(1)
    }

    pub fn flush_due(&self, now: DateTime<Utc>, config: &MouseConfig) -> bool {
        now - self.last_flush >= config.flush_interval()
    }

    /// Empties the buffer. `None` when there was nothing to send.
    pub fn take(&mut self, now: DateTime<Utc>) -> Option<Vec<MouseSample>> {
        self.last_flush = now;
        if self.samples.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.samples))
        }
    }
}
