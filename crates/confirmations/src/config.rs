use std::time::Duration;

use crate::error::ConfirmationsError;

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_INITIAL_BACKOFF_SECS: u64 = 1;
pub const DEFAULT_MAX_BACKOFF_SECS: u64 = 60 * 60;
pub const DEFAULT_BACKOFF_JITTER: f64 = 0.1;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_PAYOUT_INTERVAL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_PER_HOUR_CAP: u32 = 1;
pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 1;
/// Longest frequency-cap window
pub const MIN_AD_EVENT_RETENTION_DAYS: u64 = 28;

#[derive(Clone, Debug)]
pub struct ConfirmationsConfig {
    /// Retries allowed after the first attempt before an item is exhausted
    pub max_retries: u32,
    pub initial_backoff: Duration,
    /// Ceiling for the retry delay
    pub max_backoff: Duration,
    /// Extra random delay as a fraction of the backoff, in `[0, 1]`
    pub backoff_jitter: f64,
    pub request_timeout: Duration,
    pub payout_interval: Duration,
    /// Opted-out users still confirm, but without privacy tokens
    pub rewards_enabled: bool,
    pub per_hour_cap: u32,
    pub min_unblinded_payment_tokens_for_payout: usize,
    /// How often the background task looks for due work
    pub tick_interval: Duration,
    /// Ad events older than this are folded into lifetime tallies
    pub ad_event_retention: Duration,
}

impl Default for ConfirmationsConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: Duration::from_secs(DEFAULT_INITIAL_BACKOFF_SECS),
            max_backoff: Duration::from_secs(DEFAULT_MAX_BACKOFF_SECS),
            backoff_jitter: DEFAULT_BACKOFF_JITTER,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            payout_interval: Duration::from_secs(DEFAULT_PAYOUT_INTERVAL_SECS),
            rewards_enabled: true,
            per_hour_cap: DEFAULT_PER_HOUR_CAP,
            min_unblinded_payment_tokens_for_payout: 1,
            tick_interval: Duration::from_secs(DEFAULT_TICK_INTERVAL_SECS),
            ad_event_retention: days(MIN_AD_EVENT_RETENTION_DAYS),
        }
    }
}

impl ConfirmationsConfig {
    pub fn from_env() -> Result<Self, ConfirmationsError> {
        let defaults = Self::default();

        let config = Self {
            max_retries: env_or("CONFIRMATIONS_MAX_RETRIES", defaults.max_retries),
            initial_backoff: Duration::from_secs(env_or(
                "CONFIRMATIONS_INITIAL_BACKOFF_SECS",
                DEFAULT_INITIAL_BACKOFF_SECS,
            )),
            max_backoff: Duration::from_secs(env_or(
                "CONFIRMATIONS_MAX_BACKOFF_SECS",
                DEFAULT_MAX_BACKOFF_SECS,
            )),
            backoff_jitter: env_or("CONFIRMATIONS_BACKOFF_JITTER", defaults.backoff_jitter),
            request_timeout: Duration::from_secs(env_or(
                "CONFIRMATIONS_REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )),
            payout_interval: Duration::from_secs(env_or(
                "CONFIRMATIONS_PAYOUT_INTERVAL_SECS",
                DEFAULT_PAYOUT_INTERVAL_SECS,
            )),
            rewards_enabled: env_or("CONFIRMATIONS_REWARDS_ENABLED", defaults.rewards_enabled),
            per_hour_cap: env_or("CONFIRMATIONS_PER_HOUR_CAP", defaults.per_hour_cap),
            min_unblinded_payment_tokens_for_payout: env_or(
                "CONFIRMATIONS_MIN_PAYMENT_TOKENS",
                defaults.min_unblinded_payment_tokens_for_payout,
            ),
            tick_interval: Duration::from_secs(env_or(
                "CONFIRMATIONS_TICK_INTERVAL_SECS",
                DEFAULT_TICK_INTERVAL_SECS,
            )),
            ad_event_retention: days(env_or(
                "CONFIRMATIONS_AD_EVENT_RETENTION_DAYS",
                MIN_AD_EVENT_RETENTION_DAYS,
            )),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfirmationsError> {
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(ConfirmationsError::Config(format!(
                "backoff jitter must be within [0, 1], got {}",
                self.backoff_jitter
            )));
        }
        if self.initial_backoff.is_zero() || self.initial_backoff > self.max_backoff {
            return Err(ConfirmationsError::Config(format!(
                "initial backoff ({:?}) must be non-zero and not exceed max backoff ({:?})",
                self.initial_backoff, self.max_backoff
            )));
        }
        if self.request_timeout.is_zero() || self.tick_interval.is_zero() {
            return Err(ConfirmationsError::Config(
                "request timeout and tick interval must be non-zero".into(),
            ));
        }
        if self.payout_interval < Duration::from_secs(60) {
            return Err(ConfirmationsError::Config(
                "payout interval must be at least one minute".into(),
            ));
        }
        if self.ad_event_retention < days(MIN_AD_EVENT_RETENTION_DAYS) {
            return Err(ConfirmationsError::Config(format!(
                "ad event retention must cover the {} day cap window",
                MIN_AD_EVENT_RETENTION_DAYS
            )));
        }
        Ok(())
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.backoff_jitter = jitter;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_payout_interval(mut self, interval: Duration) -> Self {
        self.payout_interval = interval;
        self
    }

    pub fn with_rewards_enabled(mut self, enabled: bool) -> Self {
        self.rewards_enabled = enabled;
        self
    }

    pub fn with_per_hour_cap(mut self, cap: u32) -> Self {
        self.per_hour_cap = cap;
        self
    }

    pub fn with_min_payment_tokens(mut self, count: usize) -> Self {
        self.min_unblinded_payment_tokens_for_payout = count;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_ad_event_retention(mut self, retention: Duration) -> Self {
        self.ad_event_retention = retention;
        self
    }
}

fn days(count: u64) -> Duration {
    Duration::from_secs(count * 24 * 60 * 60)
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
