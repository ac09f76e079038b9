//! Configuration loader with environment variable expansion

use super::{ConfigError, UploaderConfig};
use lazy_static::lazy_static;
use std::path::Path;

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<UploaderConfig, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::parse(&content)?;
        tracing::debug!(path = %path.display(), ?config, "Loaded uploader configuration");
        Ok(config)
    }

    /// Parse and validate configuration from YAML text
    pub fn parse(content: &str) -> Result<UploaderConfig, ConfigError> {
        let expanded = expand_env_vars(content);
        let config: UploaderConfig = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }
}

lazy_static! {
    // ${VAR} or ${VAR:-default}
    static ref ENV_VAR: regex_lite::Regex =
        regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();
}

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` keeps the placeholder if the variable is not set
/// - `${VAR_NAME:-default}` falls back to `default`
fn expand_env_vars(s: &str) -> String {
    ENV_VAR
        .replace_all(s, |cap: &regex_lite::Captures<'_>| {
            match std::env::var(&cap[1]) {
                Ok(value) => value,
                Err(_) => match cap.get(2) {
                    Some(default) => default.as_str().to_string(),
                    None => cap[0].to_string(),
                },
            }
        })
        .into_owned()
}
