mod log_level;

pub use log_level::LogLevel;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Settings that are not tied to a subsystem.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
pub struct GeneralConfig {
    /// Default verbosity when `RUST_LOG` is unset.
    #[serde(default)]
    pub log_level: LogLevel,
}
