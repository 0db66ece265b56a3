use std::path::{Path, PathBuf};

use crate::config::ConfigError;

/// Chain of files currently being loaded, used to reject import cycles
#[derive(Debug, Default)]
pub struct ImportChain {
    chain: Vec<PathBuf>,
}

impl ImportChain {
    /// Enter `path`, failing if it is already being loaded further up the chain
    pub fn enter(&mut self, path: &Path) -> Result<(), ConfigError> {
        if self.chain.iter().any(|p| p == path) {
            let names: Vec<String> = self
                .chain
                .iter()
                .chain(std::iter::once(&path.to_path_buf()))
                .map(|p| {
                    p.file_name()
                        .unwrap_or(p.as_os_str())
                        .to_string_lossy()
                        .to_string()
                })
                .collect();

            return Err(ConfigError::import(
                format!("circular import: {}", names.join(" -> ")),
                path,
            ));
        }

        self.chain.push(path.to_path_buf());
        Ok(())
    }

    /// Leave the most recently entered file
    pub fn leave(&mut self) {
        self.chain.pop();
    }
}
