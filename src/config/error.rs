use std::{
    fmt, io,
    path::{Path, PathBuf},
};

use thiserror::Error;

/// Errors raised while loading or validating a [`CoreConfig`](super::CoreConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A loaded value is out of range
    #[error("invalid config field '{field}': {reason}")]
    InvalidField {
        /// Dotted path of the field
        field: String,
        /// Why the value was rejected
        reason: String,
    },

    /// The merged document does not match the schema
    #[error("configuration validation failed: {details}")]
    Validation {
        /// Deserializer message
        details: String,
    },

    /// I/O error on a config file
    #[error("I/O error on '{path}': {source}")]
    Io {
        /// File being read
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// TOML parsing error with location context
    #[error("failed to parse TOML at '{location}': {details}")]
    TomlParse {
        /// File path or "string"
        location: String,
        /// Parse error details
        details: String,
    },

    /// Import resolution failed or formed a cycle
    #[error("failed to import '{path}': {details}")]
    Import {
        /// Path of the import
        path: PathBuf,
        /// What went wrong
        details: String,
    },
}

impl ConfigError {
    /// TOML parse error, located at `path` when one is known.
    pub fn toml_parse(error: impl fmt::Display, path: Option<&Path>) -> Self {
        let location = match path {
            Some(p) => p
                .canonicalize()
                .unwrap_or_else(|_| p.to_path_buf())
                .to_string_lossy()
                .to_string(),
            None => "string".to_string(),
        };

        ConfigError::TomlParse {
            location,
            details: error.to_string(),
        }
    }

    /// Import error for `path`.
    pub fn import(error: impl fmt::Display, path: &Path) -> Self {
        ConfigError::Import {
            path: path.canonicalize().unwrap_or_else(|_| path.to_path_buf()),
            details: error.to_string(),
        }
    }

    pub(crate) fn io(source: io::Error, path: &Path) -> Self {
        ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
