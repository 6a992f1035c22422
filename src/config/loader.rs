//! Configuration loading

use std::path::Path;

use tracing::info;

use super::Config;
use crate::error::ConfigError;

/// Load, parse and validate the configuration document at `path`.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }
    let content = std::fs::read_to_string(path)?;
    let config = parse_config(&content)?;
    info!(path = %path.display(), "configuration loaded");
    Ok(config)
}

/// Parse and validate a configuration document from a string.
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.validate()?;
    Ok(config)
}
