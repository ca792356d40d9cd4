//! Benchmark configuration.
//!
//! Every phase carries its own wait time as a typed field, so the driver never has to look a
//! setting up by name while it is running. Sections that are missing from a configuration
//! document fall back to their [`Default`] values.

use crate::error::{BenchmarkError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Parameters for one benchmark run. Immutable once the run has started.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BenchmarkConfig {
    /// An operation that takes at most this many milliseconds is "on time".
    pub delay_limit_millis: u64,

    /// Number of compliance ratios that must be collected before a verdict is attempted.
    pub compliance_test_samples: usize,

    /// A worker count complies when the on-time ratio is strictly above this value.
    pub percentile_threshold: f64,

    /// How many of the most recent latencies the compliance ratio is computed over.
    pub history_size: usize,

    /// The search never runs more workers than this.
    pub max_workers: usize,

    /// Exponential ramp.
    pub exponential: ExponentialStepConfig,

    /// Binary search over the ramp's bracket.
    pub binary_search: BinarySearchStepConfig,

    /// Step-wise refinement of the binary search result.
    pub fine_tune: FineTuneStepConfig,

    /// Final measurement at the discovered worker count.
    pub stable_stats: StableStatsStepConfig,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            delay_limit_millis: 100,
            compliance_test_samples: 3,
            percentile_threshold: 0.95,
            history_size: 1000,
            max_workers: 100_000,
            exponential: ExponentialStepConfig::default(),
            binary_search: BinarySearchStepConfig::default(),
            fine_tune: FineTuneStepConfig::default(),
            stable_stats: StableStatsStepConfig::default(),
        }
    }
}

/// Settings for the exponential ramp.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ExponentialStepConfig {
    /// Worker count of the first probe.
    pub initial_workers: usize,
    /// Factor applied to the worker count after every compliant probe.
    pub multiplier: usize,
    /// Interval between compliance samples.
    pub base_wait_time_sec: u64,
}

impl Default for ExponentialStepConfig {
    fn default() -> Self {
        Self {
            initial_workers: 10,
            multiplier: 2,
            base_wait_time_sec: 5,
        }
    }
}

/// Settings for the binary search.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BinarySearchStepConfig {
    /// The search stops once the bracket is at most this wide.
    pub threshold: usize,
    /// Interval between compliance samples.
    pub base_wait_time_sec: u64,
}

impl Default for BinarySearchStepConfig {
    fn default() -> Self {
        Self {
            threshold: 10,
            base_wait_time_sec: 5,
        }
    }
}

/// Settings for fine tuning.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct FineTuneStepConfig {
    /// Half of the step used when walking down to a compliant worker count.
    pub initial_step: usize,
    /// Interval between compliance samples.
    pub base_wait_time_sec: u64,
}

impl Default for FineTuneStepConfig {
    fn default() -> Self {
        Self {
            initial_step: 4,
            base_wait_time_sec: 5,
        }
    }
}

/// Settings for the final measurement.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StableStatsStepConfig {
    /// How long statistics are collected for.
    pub wait_time_sec: u64,
}

impl Default for StableStatsStepConfig {
    fn default() -> Self {
        Self { wait_time_sec: 300 }
    }
}

impl ExponentialStepConfig {
    /// Interval between compliance samples.
    pub fn base_wait_time(&self) -> Duration {
        Duration::from_secs(self.base_wait_time_sec)
    }
}

impl BinarySearchStepConfig {
    /// Interval between compliance samples.
    pub fn base_wait_time(&self) -> Duration {
        Duration::from_secs(self.base_wait_time_sec)
    }
}

impl FineTuneStepConfig {
    /// Interval between compliance samples.
    pub fn base_wait_time(&self) -> Duration {
        Duration::from_secs(self.base_wait_time_sec)
    }
}

impl StableStatsStepConfig {
    /// How long statistics are collected for.
    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(self.wait_time_sec)
    }
}

impl BenchmarkConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: BenchmarkConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// The delay limit as a [`Duration`].
    pub fn delay_limit(&self) -> Duration {
        Duration::from_millis(self.delay_limit_millis)
    }

    /// Reject settings under which the search could not terminate or could never succeed.
    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: &str) -> Result<()> {
            Err(BenchmarkError::Config(msg.to_string()))
        }

        if self.delay_limit_millis == 0 {
            return invalid("delay_limit_millis must be > 0");
        }
        if self.compliance_test_samples == 0 {
            return invalid("compliance_test_samples must be > 0");
        }
        if !(0.0..=1.0).contains(&self.percentile_threshold) {
            return invalid("percentile_threshold must be within [0, 1]");
        }
        if self.history_size == 0 {
            return invalid("history_size must be > 0");
        }
        if self.exponential.initial_workers == 0 {
            return invalid("exponential.initial_workers must be > 0");
        }
        if self.exponential.multiplier < 2 {
            return invalid("exponential.multiplier must be >= 2");
        }
        if self.max_workers < self.exponential.initial_workers {
            return invalid("max_workers must be >= exponential.initial_workers");
        }
        if self.binary_search.threshold == 0 {
            return invalid("binary_search.threshold must be > 0");
        }
        if self.fine_tune.initial_step == 0 {
            return invalid("fine_tune.initial_step must be > 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(BenchmarkConfig::default().validate().is_ok());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config = BenchmarkConfig::from_json_str(
            r#"{
                "delay_limit_millis": 250,
                "binary_search": { "threshold": 3 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.delay_limit(), Duration::from_millis(250));
        assert_eq!(config.binary_search.threshold, 3);
        assert_eq!(config.binary_search.base_wait_time(), Duration::from_secs(5));
        assert_eq!(config.exponential, ExponentialStepConfig::default());
    }

    #[test]
    fn rejects_diverging_settings() {
        let mut config = BenchmarkConfig::default();
        config.exponential.multiplier = 1;
        assert!(matches!(config.validate(), Err(BenchmarkError::Config(_))));

        let mut config = BenchmarkConfig::default();
        config.binary_search.threshold = 0;
        assert!(config.validate().is_err());

        let mut config = BenchmarkConfig::default();
        config.percentile_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = BenchmarkConfig::default();
        config.max_workers = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_json_is_an_error() {
        let err = BenchmarkConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, BenchmarkError::Json(_)));
    }
}
