use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::resample::ResampleMethod;

/// Resampler selection.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(default)]
pub struct ResampleConfig {
    /// Method used when a stream does not ask for one.
    pub method: ResampleMethod,
}
