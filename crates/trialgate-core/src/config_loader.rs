// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Configuration loader for [`TrialGateEngine`](crate::engine::TrialGateEngine).
//!
//! Supports two load strategies:
//!
//! 1. **TOML file**: [`load_config`] reads and deserialises a TOML file into
//!    a [`TrialGateConfig`].
//! 2. **Environment variables**: [`load_config_from_env`] reads
//!    `TRIALGATE_`-prefixed variables.
//!
//! [`TrialGateConfig::into_config`] validates the flat form and produces the
//! engine [`Config`]; anything not covered keeps its default.
//!
//! # File format
//!
//! ```toml
//! environment             = "staging"   # "development" | "staging" | "production"
//! default_trial_count     = 5
//! reset_period_ms         = 604800000   # 0 disables renewal
//! rate_limit_max_requests = 10
//! rate_limit_window_ms    = 60000
//! retry_max_attempts      = 3
//! retry_timeout_ms        = 5000
//! exploration_rate        = 0.1
//! min_sample_size         = 30
//! update_interval_ms      = 60000
//!
//! [weights]
//! video_analysis = 1
//! bulk_analysis  = 3
//! ```
//!
//! # Environment variables
//!
//! | Variable                            | Type    | Default        |
//! |-------------------------------------|---------|----------------|
//! | `TRIALGATE_ENVIRONMENT`             | string  | "production"   |
//! | `TRIALGATE_DEFAULT_TRIAL_COUNT`     | integer | 5              |
//! | `TRIALGATE_RESET_PERIOD_MS`         | integer | 604800000      |
//! | `TRIALGATE_RATE_LIMIT_MAX_REQUESTS` | integer | 10             |
//! | `TRIALGATE_RATE_LIMIT_WINDOW_MS`    | integer | 60000          |
//! | `TRIALGATE_RETRY_MAX_ATTEMPTS`      | integer | 3              |
//! | `TRIALGATE_RETRY_TIMEOUT_MS`        | integer | 5000           |
//! | `TRIALGATE_EXPLORATION_RATE`        | float   | 0.1            |
//! | `TRIALGATE_MIN_SAMPLE_SIZE`         | integer | 30             |
//! | `TRIALGATE_UPDATE_INTERVAL_MS`      | integer | 60000          |

#![cfg(feature = "config-loader")]

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::{Config, Environment};
use crate::types::ActionKind;

// ---------------------------------------------------------------------------
// TrialGateConfig
// ---------------------------------------------------------------------------

/// Flat, file-friendly configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrialGateConfig {
    pub environment: Environment,
    pub default_trial_count: u32,
    /// `0` disables periodic renewal.
    pub reset_period_ms: u64,
    pub rate_limit_max_requests: u32,
    pub rate_limit_window_ms: u64,
    pub retry_max_attempts: u32,
    pub retry_timeout_ms: u64,
    pub exploration_rate: f64,
    pub min_sample_size: u64,
    pub update_interval_ms: u64,
    /// Overrides for individual action weights, keyed by action kind.
    pub weights: BTreeMap<String, u32>,
}

impl Default for TrialGateConfig {
    fn default() -> Self {
        let config = Config::default();
        Self {
            environment: config.environment,
            default_trial_count: config.default_trial_count,
            reset_period_ms: config.reset_period_ms.unwrap_or(0),
            rate_limit_max_requests: config.rate_limit.max_requests,
            rate_limit_window_ms: config.rate_limit.window_ms,
            retry_max_attempts: config.retry.max_attempts,
            retry_timeout_ms: config.retry.timeout_ms,
            exploration_rate: config.optimizer.exploration_rate,
            min_sample_size: config.optimizer.min_sample_size,
            update_interval_ms: config.optimizer.update_interval_ms,
            weights: BTreeMap::new(),
        }
    }
}

impl TrialGateConfig {
    /// Validate and expand into the engine [`Config`].
    pub fn into_config(self) -> Result<Config, ConfigError> {
        if self.default_trial_count == 0 {
            return Err(ConfigError::InvalidRange {
                field: "default_trial_count".into(),
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.rate_limit_max_requests == 0 {
            return Err(ConfigError::InvalidRange {
                field: "rate_limit_max_requests".into(),
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.exploration_rate) {
            return Err(ConfigError::InvalidRange {
                field: "exploration_rate".into(),
                value: self.exploration_rate.to_string(),
                reason: "must be in range 0.0-1.0".into(),
            });
        }

        let mut config = Config {
            environment: self.environment,
            default_trial_count: self.default_trial_count,
            reset_period_ms: (self.reset_period_ms > 0).then_some(self.reset_period_ms),
            ..Config::default()
        };
        config.rate_limit.max_requests = self.rate_limit_max_requests;
        config.rate_limit.window_ms = self.rate_limit_window_ms;
        config.retry.max_attempts = self.retry_max_attempts;
        config.retry.timeout_ms = self.retry_timeout_ms;
        config.optimizer.exploration_rate = self.exploration_rate;
        config.optimizer.min_sample_size = self.min_sample_size;
        config.optimizer.update_interval_ms = self.update_interval_ms;

        for (name, weight) in self.weights {
            let kind = ActionKind::from_str(&name).map_err(|error| ConfigError::ParseField {
                field: format!("weights.{name}"),
                value: weight.to_string(),
                reason: error.to_string(),
            })?;
            if weight == 0 {
                return Err(ConfigError::InvalidRange {
                    field: format!("weights.{name}"),
                    value: "0".into(),
                    reason: "weights must be at least 1".into(),
                });
            }
            config.weights.set(kind, weight);
        }
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors that can occur while loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// A required file could not be opened.
    FileRead { path: String, source: std::io::Error },
    /// The TOML content could not be deserialised.
    TomlParse { source: toml::de::Error },
    /// A field could not be parsed to its expected type.
    ParseField { field: String, value: String, reason: String },
    /// A field value is outside the permitted range.
    InvalidRange { field: String, value: String, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileRead { path, source } =>
                write!(f, "Failed to read config file \"{path}\": {source}"),
            ConfigError::TomlParse { source } =>
                write!(f, "Failed to parse TOML config: {source}"),
            ConfigError::ParseField { field, value, reason } =>
                write!(f, "Field \"{field}\": cannot parse \"{value}\" ({reason})"),
            ConfigError::InvalidRange { field, value, reason } =>
                write!(f, "Field \"{field}\": value \"{value}\" out of range ({reason})"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::FileRead { source, .. } => Some(source),
            ConfigError::TomlParse { source }    => Some(source),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// TOML loader
// ---------------------------------------------------------------------------

/// Load a [`TrialGateConfig`] from a TOML file.
///
/// # Example
///
/// ```rust,no_run
/// use trialgate_core::config_loader::load_config;
///
/// let config = load_config("/etc/trialgate/trialgate.toml").unwrap().into_config().unwrap();
/// println!("Trials per fingerprint: {}", config.default_trial_count);
/// ```
pub fn load_config(path: &str) -> Result<TrialGateConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
        path: path.to_owned(),
        source,
    })?;
    parse_config(&content)
}

/// Parse TOML text.  Missing keys take their defaults.
pub fn parse_config(content: &str) -> Result<TrialGateConfig, ConfigError> {
    toml::from_str::<TrialGateConfig>(content).map_err(|source| ConfigError::TomlParse { source })
}

// ---------------------------------------------------------------------------
// Environment variable loader
// ---------------------------------------------------------------------------

/// Load a [`TrialGateConfig`] from `TRIALGATE_`-prefixed environment
/// variables.  Unset variables keep their defaults.
pub fn load_config_from_env() -> Result<TrialGateConfig, ConfigError> {
    let defaults = TrialGateConfig::default();

    let environment = match std::env::var("TRIALGATE_ENVIRONMENT") {
        Ok(value) => parse_environment(&value)?,
        Err(_) => defaults.environment,
    };

    Ok(TrialGateConfig {
        environment,
        default_trial_count: read_env("TRIALGATE_DEFAULT_TRIAL_COUNT", defaults.default_trial_count)?,
        reset_period_ms: read_env("TRIALGATE_RESET_PERIOD_MS", defaults.reset_period_ms)?,
        rate_limit_max_requests: read_env("TRIALGATE_RATE_LIMIT_MAX_REQUESTS", defaults.rate_limit_max_requests)?,
        rate_limit_window_ms: read_env("TRIALGATE_RATE_LIMIT_WINDOW_MS", defaults.rate_limit_window_ms)?,
        retry_max_attempts: read_env("TRIALGATE_RETRY_MAX_ATTEMPTS", defaults.retry_max_attempts)?,
        retry_timeout_ms: read_env("TRIALGATE_RETRY_TIMEOUT_MS", defaults.retry_timeout_ms)?,
        exploration_rate: read_env("TRIALGATE_EXPLORATION_RATE", defaults.exploration_rate)?,
        min_sample_size: read_env("TRIALGATE_MIN_SAMPLE_SIZE", defaults.min_sample_size)?,
        update_interval_ms: read_env("TRIALGATE_UPDATE_INTERVAL_MS", defaults.update_interval_ms)?,
        weights: defaults.weights,
    })
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn parse_environment(value: &str) -> Result<Environment, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "development" | "dev" => Ok(Environment::Development),
        "staging" => Ok(Environment::Staging),
        "production" | "prod" => Ok(Environment::Production),
        other => Err(ConfigError::ParseField {
            field: "TRIALGATE_ENVIRONMENT".into(),
            value: other.into(),
            reason: "expected one of: development, staging, production".into(),
        }),
    }
}

fn read_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value.trim().parse::<T>().map_err(|source| ConfigError::ParseField {
            field: key.to_owned(),
            value,
            reason: source.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = parse_config("").unwrap().into_config().unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn file_overrides_and_weights() {
        let flat = parse_config(
            r#"
            environment = "development"
            default_trial_count = 8
            reset_period_ms = 0

            [weights]
            bulk_analysis = 4
            "#,
        )
        .unwrap();
        let config = flat.into_config().unwrap();
        assert!(config.environment.allows_reset());
        assert_eq!(config.default_trial_count, 8);
        assert_eq!(config.reset_period_ms, None);
        assert_eq!(config.weights.weight_of(ActionKind::BulkAnalysis), Some(4));
        assert_eq!(config.weights.weight_of(ActionKind::VideoAnalysis), Some(1));
    }

    #[test]
    fn unknown_weight_and_bad_ranges_are_rejected() {
        let flat = parse_config("[weights]\nteleport = 2\n").unwrap();
        assert!(matches!(flat.into_config(), Err(ConfigError::ParseField { .. })));

        let flat = parse_config("exploration_rate = 1.5\n").unwrap();
        assert!(matches!(flat.into_config(), Err(ConfigError::InvalidRange { .. })));

        assert!(matches!(parse_config("default_trial_count = \"five\""), Err(ConfigError::TomlParse { .. })));
    }

    #[test]
    fn environment_variables_override_defaults() {
        std::env::set_var("TRIALGATE_ENVIRONMENT", "Staging");
        std::env::set_var("TRIALGATE_MIN_SAMPLE_SIZE", "50");
        let loaded = load_config_from_env();
        std::env::remove_var("TRIALGATE_ENVIRONMENT");
        std::env::remove_var("TRIALGATE_MIN_SAMPLE_SIZE");

        let flat = loaded.unwrap();
        assert_eq!(flat.environment, Environment::Staging);
        assert_eq!(flat.min_sample_size, 50);
        assert_eq!(flat.default_trial_count, 5);
    }
}
