use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Volume policy.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct VolumeConfig {
    /// Derive each capable device's volume from its loudest stream.
    pub flat_volumes: bool,

    /// Time hardware volume writes against output latency on devices that support it.
    pub deferred_volume: bool,

    /// Microseconds by which increases are delayed and decreases advanced.
    pub deferred_volume_safety_margin_usec: u64,

    /// Extra microseconds added to every deferred write.
    pub deferred_volume_extra_delay_usec: u64,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            flat_volumes: true,
            deferred_volume: true,
            deferred_volume_safety_margin_usec: 8_000,
            deferred_volume_extra_delay_usec: 0,
        }
    }
}
