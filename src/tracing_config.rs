//! Subscriber setup for hosts embedding the core.

use std::{env, path::Path};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogLevel;

const FORMAT_VAR: &str = "MIXCORE_LOG_FORMAT";

/// Filter honouring `RUST_LOG`, falling back to the configured level.
pub fn filter_for(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()))
}

/// Initialize console logging
///
/// `MIXCORE_LOG_FORMAT=json` selects JSON lines, anything else pretty output
/// with thread names (device contexts are named after their device).
///
/// # Errors
/// Returns error if a global subscriber is already installed
pub fn init(level: LogLevel) -> Result<(), Box<dyn std::error::Error>> {
    let registry = tracing_subscriber::registry().with(filter_for(level));

    match env::var(FORMAT_VAR).as_deref() {
        Ok("json") => {
            registry
                .with(fmt::layer().json().with_target(true).with_level(true))
                .try_init()?;
        }
        _ => {
            registry
                .with(
                    fmt::layer()
                        .pretty()
                        .with_target(true)
                        .with_level(true)
                        .with_thread_names(true),
                )
                .try_init()?;
        }
    }

    Ok(())
}

/// Initialize console logging plus a daily-rotated file in `log_dir`
///
/// # Errors
/// Returns error if the appender cannot be built or a subscriber is already installed
pub fn init_with_file(level: LogLevel, log_dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    const FILES_TO_KEEP: usize = 7;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .max_log_files(FILES_TO_KEEP)
        .filename_prefix("mixcore")
        .filename_suffix("log")
        .build(log_dir)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let registry = tracing_subscriber::registry().with(filter_for(level));

    match env::var(FORMAT_VAR).as_deref() {
        Ok("json") => {
            registry
                .with(fmt::layer().json().with_writer(std::io::stdout))
                .with(fmt::layer().json().with_writer(non_blocking).with_ansi(false))
                .try_init()?;
        }
        _ => {
            registry
                .with(
                    fmt::layer()
                        .pretty()
                        .with_thread_names(true)
                        .with_writer(std::io::stdout),
                )
                .with(
                    fmt::layer()
                        .compact()
                        .with_thread_names(true)
                        .with_writer(non_blocking)
                        .with_ansi(false),
                )
                .try_init()?;
        }
    }

    // The writer must outlive the process-wide subscriber
    std::mem::forget(guard);

    Ok(())
}
