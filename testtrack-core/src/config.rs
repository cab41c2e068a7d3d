// Copyright (c) The testtrack Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The orchestrator's aggregate configuration, loaded from an optional
//! TOML file via the `config` crate and layered under programmatic
//! overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::lifecycle::Effort;
use crate::regression_selector::SelectorParams;
use crate::sprt::SprtParams;

fn default_concurrency() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

fn default_max_failures() -> u32 {
    1
}

fn default_max_reruns() -> u32 {
    100
}

fn default_grace_period() -> Duration {
    Duration::from_secs(5)
}

fn default_timeout() -> Option<Duration> {
    None
}

/// Every tunable the orchestrator core reads, gathered in one place.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Concurrency cap for the executor's semaphore. Defaults to the
    /// host's available parallelism.
    pub concurrency: usize,
    /// Detection-mode early-stop threshold on failed-result count.
    pub max_failures: u32,
    /// Effort mode governing rerun behavior.
    pub effort: Effort,
    /// Per-test rerun budget under `converge`/`max` effort.
    pub max_reruns: u32,
    /// Forward (burn-in/promotion) SPRT parameters.
    pub sprt: SprtParams,
    /// Reverse (demotion) SPRT parameters; `None` reuses `sprt`.
    pub demotion_sprt: Option<SprtParams>,
    /// Auto-disable threshold in days for `flaky` tests.
    pub flaky_deadline_days: Option<i64>,
    /// Whether a matching `target_hash` suppresses execution.
    pub skip_unchanged: bool,
    /// Fraction of stable candidates selected before dependency
    /// closure.
    pub max_test_percentage: f64,
    /// Maximum BFS hop distance scored by the regression selector.
    pub max_hops: u32,
    /// Grace period between SIGTERM and SIGKILL on cancellation.
    #[serde(with = "humantime_duration")]
    pub grace_period: Duration,
    /// Optional per-test wallclock timeout.
    #[serde(with = "humantime_duration_opt")]
    pub timeout: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_failures: default_max_failures(),
            effort: Effort::None,
            max_reruns: default_max_reruns(),
            sprt: SprtParams::default(),
            demotion_sprt: None,
            flaky_deadline_days: None,
            skip_unchanged: true,
            max_test_percentage: SelectorParams::default().max_test_percentage,
            max_hops: SelectorParams::default().max_hops,
            grace_period: default_grace_period(),
            timeout: default_timeout(),
        }
    }
}

impl OrchestratorConfig {
    /// Loads configuration by layering an optional TOML file under
    /// this struct's defaults; any field absent from the file keeps
    /// its default.
    pub fn load(toml_path: Option<&camino::Utf8Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = toml_path {
            builder = builder.add_source(config::File::with_name(path.as_str()).required(false));
        }
        builder.build()?.try_deserialize()
    }

    /// This config's selector parameters, as consumed by
    /// [`crate::regression_selector::select`].
    pub fn selector_params(&self) -> SelectorParams {
        SelectorParams {
            max_test_percentage: self.max_test_percentage,
            max_hops: self.max_hops,
        }
    }
}

mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        value.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

mod humantime_duration_opt {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        value.map(|d| d.as_secs_f64()).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        let secs: Option<f64> = Option::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs_f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_have_expected_values() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_reruns, 100);
        assert_eq!(config.grace_period, Duration::from_secs(5));
        assert_eq!(config.max_test_percentage, 0.10);
        assert_eq!(config.max_hops, 2);
        assert!(config.skip_unchanged);
    }

    #[test]
    fn load_with_no_file_returns_defaults() {
        let loaded = OrchestratorConfig::load(None).unwrap();
        assert_eq!(loaded, OrchestratorConfig::default());
    }
}
