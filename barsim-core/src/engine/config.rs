//! Engine configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse engine config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Recognized engine options. Unspecified fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Starting equity.
    pub initial_balance: f64,
    pub commission_per_unit: f64,
    /// Smallest price increment; submitted prices are rounded to it.
    pub tick_size: f64,
    /// Bars between `ProgressUpdate` events. `0` suppresses them entirely.
    pub progress_update_interval: usize,
    /// Bus history retention.
    pub history_limit: usize,
    /// Labelling only.
    pub symbol: String,
    /// Labelling only.
    pub timeframe: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_balance: 100_000.0,
            commission_per_unit: 0.0,
            tick_size: 0.25,
            progress_update_interval: 1,
            history_limit: 10_000,
            symbol: "SIM".into(),
            timeframe: "1m".into(),
        }
    }
}

impl EngineConfig {
    /// Parse a config from TOML, validating value ranges.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.initial_balance > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "initial_balance must be positive, got {}",
                self.initial_balance
            )));
        }
        if self.commission_per_unit < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "commission_per_unit must be non-negative, got {}",
                self.commission_per_unit
            )));
        }
        if !(self.tick_size > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "tick_size must be positive, got {}",
                self.tick_size
            )));
        }
        Ok(())
    }

    /// Canonical bytes for run fingerprinting.
    pub fn fingerprint_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("config serializes")
    }
}
