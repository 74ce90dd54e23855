//! Configuration loader.

use std::fs;
use std::path::Path;

use regex::Regex;
use serde::de::DeserializeOwned;

use crate::error::ConfigError;

/// Configuration loader with environment variable substitution.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load a configuration schema from a TOML file.
    pub fn load<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = fs::read_to_string(path)?;
        Self::load_str(&content)
    }

    /// Load a configuration schema from a string.
    pub fn load_str<T: DeserializeOwned>(content: &str) -> Result<T, ConfigError> {
        let expanded = Self::expand_env_vars(content)?;
        let config: T = toml::from_str(&expanded)?;
        Ok(config)
    }

    /// Load from `path` when given, falling back to the schema defaults.
    pub fn load_or_default<T: DeserializeOwned + Default>(
        path: Option<&Path>,
    ) -> Result<T, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(T::default()),
        }
    }

    /// Expand environment variables in the format `${VAR}`.
    fn expand_env_vars(content: &str) -> Result<String, ConfigError> {
        let re = Regex::new(r"\$\{([^}]+)\}")
            .map_err(|e| ConfigError::InvalidFormat(e.to_string()))?;
        let mut result = content.to_string();

        for cap in re.captures_iter(content) {
            let var_name = &cap[1];
            let var_value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotSet(var_name.to_string()))?;
            result = result.replace(&cap[0], &var_value);
        }

        Ok(result)
    }

    /// Expand shell-style paths (e.g., `~/.autohands`).
    pub fn expand_path(path: &str) -> String {
        shellexpand::tilde(path).to_string()
    }
}
