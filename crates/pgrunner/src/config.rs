//! Worker pool configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable that, when set to `1`, enables a full dump of the
/// pool options at startup. The dump may include operational details you do
/// not want in shared logs, hence the name.
pub const ENABLE_DANGEROUS_LOGS_ENV: &str = "PGRUNNER_ENABLE_DANGEROUS_LOGS";

/// Worker pool configuration
///
/// # Example
///
/// ```
/// use pgrunner::PoolOptions;
/// use std::time::Duration;
///
/// let options = PoolOptions::default()
///     .with_concurrency(4)
///     .with_graceful_shutdown_abort_timeout(Duration::from_secs(10));
///
/// assert!(options.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolOptions {
    /// Number of workers supervised by the pool
    pub concurrency: usize,

    /// When true, the pool does not subscribe to the process signal broker
    pub no_handle_signals: bool,

    /// Lower bound on the delay between reset-locked maintenance ticks
    #[serde(with = "duration_millis")]
    pub min_reset_locked_interval: Duration,

    /// Upper bound on the delay between reset-locked maintenance ticks
    #[serde(with = "duration_millis")]
    pub max_reset_locked_interval: Duration,

    /// How long graceful shutdown waits before firing the pool abort signal
    #[serde(with = "duration_millis")]
    pub graceful_shutdown_abort_timeout: Duration,

    /// Capacity of the lifecycle event channel
    pub events_channel_capacity: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            no_handle_signals: false,
            min_reset_locked_interval: Duration::from_secs(8 * 60),
            max_reset_locked_interval: Duration::from_secs(10 * 60),
            graceful_shutdown_abort_timeout: Duration::from_secs(5),
            events_channel_capacity: 128,
        }
    }
}

impl PoolOptions {
    /// Create options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of workers
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Opt out of process signal handling
    pub fn with_no_handle_signals(mut self, no_handle_signals: bool) -> Self {
        self.no_handle_signals = no_handle_signals;
        self
    }

    /// Set the reset-locked tick interval bounds
    pub fn with_reset_locked_interval(mut self, min: Duration, max: Duration) -> Self {
        self.min_reset_locked_interval = min;
        self.max_reset_locked_interval = max;
        self
    }

    /// Set the graceful shutdown abort timeout
    pub fn with_graceful_shutdown_abort_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_shutdown_abort_timeout = timeout;
        self
    }

    /// Set the event channel capacity
    pub fn with_events_channel_capacity(mut self, capacity: usize) -> Self {
        self.events_channel_capacity = capacity.max(1);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_reset_locked_interval.is_zero() || self.max_reset_locked_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "reset-locked intervals must be greater than zero".into(),
            ));
        }
        if self.min_reset_locked_interval > self.max_reset_locked_interval {
            return Err(ConfigError::Invalid(
                "min_reset_locked_interval must not exceed max_reset_locked_interval".into(),
            ));
        }
        if self.events_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "events_channel_capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Whether the dangerous startup option dump is enabled for this process.
pub(crate) fn dangerous_logs_enabled() -> bool {
    std::env::var(ENABLE_DANGEROUS_LOGS_ENV)
        .map(|value| value == "1")
        .unwrap_or(false)
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Invalid option combination
    #[error("invalid pool options: {0}")]
    Invalid(String),
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
