use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Device limits and defaults.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    /// Streams one device accepts before refusing new ones.
    pub max_streams_per_device: usize,

    /// Rate a device falls back to when it has no explicit default.
    pub default_sample_rate: u32,

    /// Second rate a device may switch to while idle.
    pub alternate_sample_rate: u32,

    /// Processing period of every device context, in microseconds.
    pub cycle_usec: u64,

    /// Depth of the bounded control-to-device call queue.
    pub channel_capacity: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            max_streams_per_device: 256,
            default_sample_rate: 44_100,
            alternate_sample_rate: 48_000,
            cycle_usec: 10_000,
            channel_capacity: 64,
        }
    }
}
