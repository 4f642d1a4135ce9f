//! Engine configuration
//!
//! Everything here is consumed, not acquired: the caller builds an
//! [`EngineConfig`] (defaults, builder methods, serde, or environment
//! overrides) and hands it to the engine.

use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default reconciler cadence
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 10;

/// Default retry budget per action
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default bound on concurrent bulk submissions
pub const DEFAULT_BULK_MAX_IN_FLIGHT: usize = 8;

/// Default number of runs the history log retains
pub const DEFAULT_HISTORY_MAX_ENTRIES: usize = 500;

/// Environment overrides understood by [`EngineConfig::from_env`]
pub const ENV_REFRESH_SECS: &str = "PODFLEET_REFRESH_SECS";
pub const ENV_MAX_RETRIES: &str = "PODFLEET_MAX_RETRIES";
pub const ENV_ROLLING_PARALLELISM: &str = "PODFLEET_ROLLING_PARALLELISM";
pub const ENV_HISTORY_PATH: &str = "PODFLEET_HISTORY_PATH";
pub const ENV_HISTORY_MAX_ENTRIES: &str = "PODFLEET_HISTORY_MAX_ENTRIES";

/// Exponential backoff: `base * 2^(attempt - 1)`, capped at `cap`.
///
/// `attempt` starts at 1 for the first retry.
pub(crate) fn backoff_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    base.saturating_mul(1u32 << exp).min(cap)
}

/// Retry policy applied by the action coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(with = "serde_millis")]
    pub base_delay: Duration,

    /// Upper bound for any single delay
    #[serde(with = "serde_millis")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Disable retries entirely
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff_delay(self.base_delay, attempt, self.max_delay)
    }
}

/// What happens to an old pod once its replacement is healthy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RetireAction {
    #[default]
    Terminate,
    Stop,
}

/// Rolling deploy settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollingConfig {
    /// Old pods replaced concurrently per step
    pub parallelism: usize,

    /// How long a replacement may take to reach Running
    #[serde(with = "serde_millis")]
    pub health_timeout: Duration,

    /// How often the store is checked while waiting
    #[serde(with = "serde_millis")]
    pub health_poll_interval: Duration,

    /// Wait between a healthy replacement and retiring the old pod
    #[serde(with = "serde_millis")]
    pub drain_grace: Duration,

    pub retire_action: RetireAction,

    /// Terminate a replacement that never became healthy
    pub cleanup_failed_replacement: bool,
}

impl Default for RollingConfig {
    fn default() -> Self {
        Self {
            parallelism: 1,
            health_timeout: Duration::from_secs(300),
            health_poll_interval: Duration::from_secs(5),
            drain_grace: Duration::ZERO,
            retire_action: RetireAction::Terminate,
            cleanup_failed_replacement: true,
        }
    }
}

impl RollingConfig {
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    pub fn with_health_poll_interval(mut self, interval: Duration) -> Self {
        self.health_poll_interval = interval;
        self
    }

    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    pub fn with_retire_action(mut self, action: RetireAction) -> Self {
        self.retire_action = action;
        self
    }
}

/// Configuration for the whole engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Reconciler cadence
    #[serde(with = "serde_millis")]
    pub refresh_interval: Duration,

    /// Cap on the reconciler's failure backoff
    #[serde(with = "serde_millis")]
    pub max_refresh_backoff: Duration,

    pub retry: RetryPolicy,

    /// Concurrent submissions per bulk batch
    pub bulk_max_in_flight: usize,

    pub rolling: RollingConfig,

    /// JSON-lines file backing the history log
    pub history_path: Option<PathBuf>,

    /// Newest runs kept; the file is compacted to this on open
    pub history_max_entries: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS),
            max_refresh_backoff: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            bulk_max_in_flight: DEFAULT_BULK_MAX_IN_FLIGHT,
            rolling: RollingConfig::default(),
            history_path: None,
            history_max_entries: DEFAULT_HISTORY_MAX_ENTRIES,
        }
    }
}

impl EngineConfig {
    /// Defaults with overrides taken from the process environment
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key/value source
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_REFRESH_SECS) {
            self.refresh_interval = Duration::from_secs(parse_var(ENV_REFRESH_SECS, &raw)?);
        }
        if let Some(raw) = lookup(ENV_MAX_RETRIES) {
            self.retry.max_retries = parse_var(ENV_MAX_RETRIES, &raw)?;
        }
        if let Some(raw) = lookup(ENV_ROLLING_PARALLELISM) {
            self.rolling.parallelism = parse_var(ENV_ROLLING_PARALLELISM, &raw)?;
        }
        if let Some(raw) = lookup(ENV_HISTORY_PATH) {
            if !raw.trim().is_empty() {
                self.history_path = Some(PathBuf::from(raw.trim()));
            }
        }
        if let Some(raw) = lookup(ENV_HISTORY_MAX_ENTRIES) {
            self.history_max_entries = parse_var(ENV_HISTORY_MAX_ENTRIES, &raw)?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.refresh_interval.is_zero() {
            return Err(OrchestratorError::config("refresh interval must be > 0"));
        }
        if self.rolling.parallelism == 0 {
            return Err(OrchestratorError::config("rolling parallelism must be >= 1"));
        }
        if self.bulk_max_in_flight == 0 {
            return Err(OrchestratorError::config("bulk max-in-flight must be >= 1"));
        }
        if self.history_max_entries == 0 {
            return Err(OrchestratorError::config("history max entries must be >= 1"));
        }
        Ok(())
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_rolling(mut self, rolling: RollingConfig) -> Self {
        self.rolling = rolling;
        self
    }

    pub fn with_bulk_max_in_flight(mut self, max: usize) -> Self {
        self.bulk_max_in_flight = max;
        self
    }

    pub fn with_history_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.history_path = Some(path.into());
        self
    }

    pub fn with_history_max_entries(mut self, max: usize) -> Self {
        self.history_max_entries = max;
        self
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| OrchestratorError::config(format!("invalid value for {}: {:?}", key, raw)))
}

/// Durations as integer milliseconds
mod serde_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
