//! Scheduler configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// Scheduler configuration
///
/// Loadable from YAML or JSON; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SchedulerConfig {
    /// Concurrent descriptor callbacks within one transaction
    pub worker_pool_size: usize,
    /// Queued transactions before `submit` waits
    pub queue_capacity: usize,
    /// Retry retriable failures of NB transactions
    pub enable_retry: bool,
    /// Retry policy for transactions that do not set their own
    pub retry: RetryPolicy,
    /// Remove southbound values without NB intent on refresh
    pub strict_refresh: bool,
    /// Period of automatic refresh; disabled when `None`
    pub refresh_interval_secs: Option<u64>,
    /// Record processed transactions
    pub record_transaction_history: bool,
    /// Most recent transactions kept in history
    pub transaction_history_limit: usize,
    /// Transactions older than this are dropped from history
    pub transaction_history_age_limit_mins: u64,
    /// Log a summary after each transaction
    pub print_txn_summary: bool,
    /// Buffered status updates per subscriber
    pub status_channel_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            queue_capacity: 100,
            enable_retry: true,
            retry: RetryPolicy::default(),
            strict_refresh: false,
            refresh_interval_secs: None,
            record_transaction_history: true,
            transaction_history_limit: 1000,
            transaction_history_age_limit_mins: 24 * 60,
            print_txn_summary: true,
            status_channel_capacity: 1024,
        }
    }
}

impl SchedulerConfig {
    /// Load from a `.yaml`, `.yml` or `.json` file
    ///
    /// # Errors
    /// I/O and parse failures, unknown extensions and invalid values.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml" | "yml") => serde_yaml::from_str(&raw)?,
            Some("json") => serde_json::from_str(&raw)?,
            other => {
                return Err(ConfigError::UnsupportedFormat(
                    other.unwrap_or_default().to_string(),
                ))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_pool_size == 0 {
            return Err(ConfigError::Invalid("worker-pool-size must be positive".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue-capacity must be positive".into()));
        }
        if self.status_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "status-channel-capacity must be positive".into(),
            ));
        }
        if self.enable_retry && self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max-attempts must be positive".into()));
        }
        if self.refresh_interval_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "refresh-interval-secs must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Retry policy applied by default, `None` when retries are disabled
    #[must_use]
    pub fn default_retry(&self) -> Option<RetryPolicy> {
        self.enable_retry.then_some(self.retry)
    }

    /// Periodic refresh interval, if enabled
    #[must_use]
    pub fn refresh_interval(&self) -> Option<Duration> {
        self.refresh_interval_secs.map(Duration::from_secs)
    }

    /// Maximum age of recorded transactions
    #[must_use]
    pub fn history_age_limit(&self) -> chrono::Duration {
        chrono::Duration::minutes(
            i64::try_from(self.transaction_history_age_limit_mins).unwrap_or(i64::MAX / 60_000),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = SchedulerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.default_retry(), Some(RetryPolicy::default()));
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "worker-pool-size: 8\nstrict-refresh: true\nretry:\n  max-attempts: 5").unwrap();

        let config = SchedulerConfig::load(file.path()).unwrap();
        assert_eq!(config.worker_pool_size, 8);
        assert!(config.strict_refresh);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.period_ms, RetryPolicy::default().period_ms);
        assert_eq!(config.queue_capacity, 100);
    }

    #[test]
    fn json_config() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"enable-retry": false, "refresh-interval-secs": 30}}"#).unwrap();

        let config = SchedulerConfig::load(file.path()).unwrap();
        assert_eq!(config.default_retry(), None);
        assert_eq!(config.refresh_interval(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn rejects_unknown_extension_and_bad_values() {
        let file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        assert!(matches!(
            SchedulerConfig::load(file.path()),
            Err(ConfigError::UnsupportedFormat(ext)) if ext == "toml"
        ));

        let config = SchedulerConfig {
            worker_pool_size: 0,
            ..SchedulerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
