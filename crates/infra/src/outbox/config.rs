//! Worker configuration.

use std::time::Duration;

use super::retry::RetryPolicy;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_STUCK_JOB_THRESHOLD: Duration = Duration::from_secs(5 * 60);
const DEFAULT_SWEEP_EVERY_POLLS: u32 = 10;

pub const ENV_POLL_INTERVAL_MS: &str = "PDP_WORKER_POLL_INTERVAL_MS";
pub const ENV_BATCH_SIZE: &str = "PDP_WORKER_BATCH_SIZE";
pub const ENV_STUCK_THRESHOLD_SECS: &str = "PDP_WORKER_STUCK_THRESHOLD_SECS";
pub const ENV_SWEEP_EVERY_POLLS: &str = "PDP_WORKER_SWEEP_EVERY_POLLS";
pub const ENV_STATUS_UPDATE_ATTEMPTS: &str = "PDP_WORKER_STATUS_UPDATE_ATTEMPTS";

/// Configuration for [`PdpWorker`](super::worker::PdpWorker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Time between polls.
    pub poll_interval: Duration,
    /// Maximum jobs claimed per poll.
    pub batch_size: usize,
    /// A `processing` job untouched for longer than this is presumed abandoned.
    pub stuck_job_threshold: Duration,
    /// Run the stuck-job sweep on every N-th poll.
    pub sweep_every_polls: u32,
    /// Retry policy for persisting job outcomes.
    pub status_update_retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            stuck_job_threshold: DEFAULT_STUCK_JOB_THRESHOLD,
            sweep_every_polls: DEFAULT_SWEEP_EVERY_POLLS,
            status_update_retry: RetryPolicy::default(),
        }
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Parse { key: &'static str, value: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

impl WorkerConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_stuck_job_threshold(mut self, threshold: Duration) -> Self {
        self.stuck_job_threshold = threshold;
        self
    }

    pub fn with_sweep_every_polls(mut self, polls: u32) -> Self {
        self.sweep_every_polls = polls;
        self
    }

    pub fn with_status_update_retry(mut self, policy: RetryPolicy) -> Self {
        self.status_update_retry = policy;
        self
    }

    /// Read overrides from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through `lookup`; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse::<u64>(&lookup, ENV_POLL_INTERVAL_MS)? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(size) = parse::<usize>(&lookup, ENV_BATCH_SIZE)? {
            config.batch_size = size;
        }
        if let Some(secs) = parse::<u64>(&lookup, ENV_STUCK_THRESHOLD_SECS)? {
            config.stuck_job_threshold = Duration::from_secs(secs);
        }
        if let Some(polls) = parse::<u32>(&lookup, ENV_SWEEP_EVERY_POLLS)? {
            config.sweep_every_polls = polls;
        }
        if let Some(attempts) = parse::<u32>(&lookup, ENV_STATUS_UPDATE_ATTEMPTS)? {
            config.status_update_retry.max_attempts = attempts;
        }

        Ok(config)
    }

    /// Apply fallbacks: a zero stuck threshold means the default.
    pub fn normalized(mut self) -> Self {
        if self.stuck_job_threshold.is_zero() {
            self.stuck_job_threshold = DEFAULT_STUCK_JOB_THRESHOLD;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Zero("poll_interval"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Zero("batch_size"));
        }
        if self.sweep_every_polls == 0 {
            return Err(ConfigError::Zero("sweep_every_polls"));
        }
        if self.status_update_retry.max_attempts == 0 {
            return Err(ConfigError::Zero("status_update_retry.max_attempts"));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Parse { key, value: raw }),
    }
}
