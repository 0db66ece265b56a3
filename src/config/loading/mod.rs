mod circular_detection;
mod merging;

use std::{
    fs,
    path::{Path, PathBuf},
};

use circular_detection::ImportChain;
use merging::merge_documents;
use toml::Value;

use super::{ConfigError, CoreConfig};

impl CoreConfig {
    /// Load a configuration file, merging its imports underneath it.
    ///
    /// Imports are listed as `imports = ["@other"]`; paths are relative to
    /// the importing file and get a `.toml` extension when none is given.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - a file cannot be read
    /// - a document is not valid TOML
    /// - imports form a cycle
    /// - the merged document does not describe a valid configuration
    pub fn load(path: &Path) -> Result<CoreConfig, ConfigError> {
        let canonical = path.canonicalize().map_err(|e| ConfigError::io(e, path))?;

        let mut chain = ImportChain::default();
        let merged = Self::load_document(&canonical, &mut chain)?;

        let config: CoreConfig = merged.try_into().map_err(|e| ConfigError::Validation {
            details: format!("{e}"),
        })?;
        config.validate()?;

        tracing::debug!(path = %canonical.display(), "loaded configuration");
        Ok(config)
    }

    /// Like [`CoreConfig::load`], but a missing file yields the defaults.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be loaded.
    pub fn load_or_default(path: &Path) -> Result<CoreConfig, ConfigError> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no configuration file, using defaults");
            return Ok(CoreConfig::default());
        }
        Self::load(path)
    }

    fn load_document(path: &Path, chain: &mut ImportChain) -> Result<Value, ConfigError> {
        chain.enter(path)?;
        let result = Self::load_document_inner(path, chain);
        chain.leave();
        result
    }

    fn load_document_inner(path: &Path, chain: &mut ImportChain) -> Result<Value, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::io(e, path))?;
        let document: Value =
            toml::from_str(&content).map_err(|e| ConfigError::toml_parse(e, Some(path)))?;

        let imports = Self::import_paths(&document)
            .iter()
            .map(|import| {
                let resolved = Self::resolve_import(path, import)?;
                let canonical = resolved
                    .canonicalize()
                    .map_err(|e| ConfigError::import(e, &resolved))?;
                Self::load_document(&canonical, chain)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(merge_documents(imports, document))
    }

    fn import_paths(document: &Value) -> Vec<String> {
        let Some(Value::Array(imports)) = document.get("imports") else {
            return Vec::new();
        };

        imports
            .iter()
            .filter_map(|v| v.as_str())
            .filter_map(|s| s.strip_prefix('@'))
            .map(str::to_owned)
            .collect()
    }

    fn resolve_import(base: &Path, import: &str) -> Result<PathBuf, ConfigError> {
        let parent = base
            .parent()
            .ok_or_else(|| ConfigError::import("base path has no parent directory", base))?;

        let mut relative = PathBuf::from(import);
        if relative.extension().is_none() {
            relative.set_extension("toml");
        }

        Ok(parent.join(relative))
    }
}
