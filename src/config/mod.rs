//! Core configuration.
//!
//! Loaded from TOML with `@`-prefixed `imports` merged underneath the main
//! file. Every section and field has a default, so an empty document is a
//! valid configuration.

mod devices;
mod error;
mod general;
mod loading;
mod resample;
mod volume;

#[cfg(test)]
mod tests;

pub use devices::DeviceConfig;
pub use error::ConfigError;
pub use general::{GeneralConfig, LogLevel};
pub use resample::ResampleConfig;
pub use volume::VolumeConfig;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::sample::{RATE_MAX, RATE_MIN};

/// Complete configuration of a [`Core`](crate::server::Core).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
pub struct CoreConfig {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Volume policy.
    #[serde(default)]
    pub volume: VolumeConfig,

    /// Device limits and defaults.
    #[serde(default)]
    pub devices: DeviceConfig,

    /// Resampler selection.
    #[serde(default)]
    pub resample: ResampleConfig,
}

impl CoreConfig {
    /// Parse and validate a TOML document (imports are not resolved).
    ///
    /// # Errors
    /// Returns error if the TOML is malformed or a value is out of range.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: CoreConfig =
            toml::from_str(content).map_err(|e| ConfigError::toml_parse(e, None))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    /// Returns the first field that is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rates = [
            ("devices.default_sample_rate", self.devices.default_sample_rate),
            ("devices.alternate_sample_rate", self.devices.alternate_sample_rate),
        ];
        for (field, rate) in rates {
            if !(RATE_MIN..=RATE_MAX).contains(&rate) {
                return Err(ConfigError::InvalidField {
                    field: field.to_string(),
                    reason: format!("{rate} Hz outside {RATE_MIN}..={RATE_MAX}"),
                });
            }
        }

        if self.devices.cycle_usec == 0 {
            return Err(ConfigError::InvalidField {
                field: "devices.cycle_usec".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }
        if self.devices.channel_capacity == 0 {
            return Err(ConfigError::InvalidField {
                field: "devices.channel_capacity".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }
        if self.devices.max_streams_per_device == 0 {
            return Err(ConfigError::InvalidField {
                field: "devices.max_streams_per_device".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }

        Ok(())
    }

    /// JSON schema of the configuration, for editors and documentation.
    pub fn json_schema() -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(CoreConfig)).unwrap_or_default()
    }
}
