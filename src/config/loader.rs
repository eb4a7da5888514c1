//! Local configuration file loading and parsing.

use std::path::Path;

use crate::error::ConfigError;
use crate::settings::SettingsTree;

/// Loads the configuration file from disk and parses it into a tree.
pub fn load_from_path(path: &Path) -> Result<SettingsTree, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
        path: path.to_path_buf(),
        source: e,
    })?;

    SettingsTree::from_yaml_str(&content).map_err(|e| ConfigError::ParseFailed {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}
