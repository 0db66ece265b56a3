use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Verbosity of core diagnostics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Device-thread loss and other faults only.
    Error,

    /// Refused or degraded operations (failed hardware calls, rejected moves).
    Warn,

    /// Device and stream lifecycle (default level).
    #[default]
    Info,

    /// Volume propagation and state transitions.
    Debug,

    /// Per-cycle device-context activity.
    Trace,
}

impl LogLevel {
    /// Matching `tracing` level
    pub fn as_tracing_level(self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Error => write!(f, "error"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Trace => write!(f, "trace"),
        }
    }
}
