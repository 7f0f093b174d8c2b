use rand::Rng;
use std::time::Duration;

use crate::config::ConfirmationsConfig;

/// Exponential backoff: `min(max, initial * 2^(n-1) * (1 + U[0, jitter]))` for the n-th
/// retry. With `jitter <= 1` the sequence is non-decreasing.
#[derive(Clone, Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    jitter: f64,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            initial,
            max,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &ConfirmationsConfig) -> Self {
        Self::new(config.initial_backoff, config.max_backoff, config.backoff_jitter)
    }

    pub fn delay(&self, retry_count: u32) -> Duration {
        let sample = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..=self.jitter)
        } else {
            0.0
        };
        self.delay_with_jitter(retry_count, sample)
    }

    fn delay_with_jitter(&self, retry_count: u32, sample: f64) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(62) as i32;
        let raw = self.initial.as_secs_f64() * 2f64.powi(exponent) * (1.0 + sample);
        let capped = raw.min(self.max.as_secs_f64());
        Duration::from_secs_f64(capped)
    }
}
