//! Supervisor configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use autohands_config::{ConfigError, ConfigLoader};
use serde::{Deserialize, Serialize};

/// Supervisor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Health monitor tick (in seconds).
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Staleness threshold for resource types without an entry in `staleness_secs`.
    #[serde(default = "default_staleness")]
    pub default_staleness_secs: u64,

    /// Per resource type staleness thresholds (in seconds).
    #[serde(default)]
    pub staleness_secs: HashMap<String, u64>,

    /// Bound on a single tier attempt, covering the capability call and the
    /// wait for a fresh heartbeat (in seconds).
    #[serde(default = "default_tier_timeout")]
    pub tier_timeout_secs: u64,

    /// Highest tier the engine runs without an operator.
    #[serde(default = "default_max_automated_tier")]
    pub max_automated_tier: u32,

    /// Recovery episodes allowed to run at once across all resources.
    #[serde(default = "default_max_concurrent_recoveries")]
    pub max_concurrent_recoveries: usize,

    /// How long terminal resources stay listed (in seconds).
    #[serde(default = "default_terminal_retention")]
    pub terminal_retention_secs: u64,

    /// Lifetime of a kill confirmation token (in seconds).
    #[serde(default = "default_kill_confirmation_ttl")]
    pub kill_confirmation_ttl_secs: u64,

    /// Capacity of the broadcast channel feeding event subscribers.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Directory for file-backed persistence. Disabled when unset.
    #[serde(default)]
    pub store_dir: Option<PathBuf>,

    /// Directory for rolling log files. Console only when unset.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_tick_interval() -> u64 {
    5
}

fn default_staleness() -> u64 {
    60
}

fn default_tier_timeout() -> u64 {
    30
}

fn default_max_automated_tier() -> u32 {
    2
}

fn default_max_concurrent_recoveries() -> usize {
    4
}

fn default_terminal_retention() -> u64 {
    300 // 5 minutes
}

fn default_kill_confirmation_ttl() -> u64 {
    60
}

fn default_event_buffer() -> usize {
    1024
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            default_staleness_secs: default_staleness(),
            staleness_secs: HashMap::new(),
            tier_timeout_secs: default_tier_timeout(),
            max_automated_tier: default_max_automated_tier(),
            max_concurrent_recoveries: default_max_concurrent_recoveries(),
            terminal_retention_secs: default_terminal_retention(),
            kill_confirmation_ttl_secs: default_kill_confirmation_ttl(),
            event_buffer: default_event_buffer(),
            store_dir: None,
            log_dir: None,
        }
    }
}

impl SupervisorConfig {
    /// Load and validate a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Load from `path`, or start from the defaults when none is given.
    /// Validated either way.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config: Self = ConfigLoader::load_or_default(path)?;
        config.store_dir = config
            .store_dir
            .map(|p| PathBuf::from(ConfigLoader::expand_path(&p.to_string_lossy())));
        config.log_dir = config
            .log_dir
            .map(|p| PathBuf::from(ConfigLoader::expand_path(&p.to_string_lossy())));
        config.validate()?;
        Ok(config)
    }

    /// Set the staleness threshold for one resource type.
    pub fn with_staleness(mut self, resource_type: impl Into<String>, secs: u64) -> Self {
        self.staleness_secs.insert(resource_type.into(), secs);
        self
    }

    /// Get the tick interval as a Duration.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    /// Get the staleness threshold for a resource type.
    pub fn staleness_for(&self, resource_type: &str) -> Duration {
        let secs = self
            .staleness_secs
            .get(resource_type)
            .copied()
            .unwrap_or(self.default_staleness_secs);
        Duration::from_secs(secs)
    }

    /// Get the tier timeout as a Duration.
    pub fn tier_timeout(&self) -> Duration {
        Duration::from_secs(self.tier_timeout_secs)
    }

    /// Get the terminal retention window as a Duration.
    pub fn terminal_retention(&self) -> Duration {
        Duration::from_secs(self.terminal_retention_secs)
    }

    /// Get the kill confirmation lifetime as a Duration.
    pub fn kill_confirmation_ttl(&self) -> Duration {
        Duration::from_secs(self.kill_confirmation_ttl_secs)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_secs == 0 {
            return Err(ConfigError::invalid("tick_interval_secs", "must be > 0"));
        }

        if self.default_staleness_secs == 0 {
            return Err(ConfigError::invalid("default_staleness_secs", "must be > 0"));
        }

        if let Some((resource_type, _)) = self.staleness_secs.iter().find(|(_, secs)| **secs == 0) {
            return Err(ConfigError::invalid(
                format!("staleness_secs.{}", resource_type),
                "must be > 0",
            ));
        }

        if self.tier_timeout_secs == 0 {
            return Err(ConfigError::invalid("tier_timeout_secs", "must be > 0"));
        }

        if !(1..=2).contains(&self.max_automated_tier) {
            return Err(ConfigError::invalid(
                "max_automated_tier",
                "must be 1 or 2; kill is never automated",
            ));
        }

        if self.max_concurrent_recoveries == 0 {
            return Err(ConfigError::invalid("max_concurrent_recoveries", "must be > 0"));
        }

        if self.kill_confirmation_ttl_secs == 0 {
            return Err(ConfigError::invalid("kill_confirmation_ttl_secs", "must be > 0"));
        }

        if self.event_buffer == 0 {
            return Err(ConfigError::invalid("event_buffer", "must be > 0"));
        }

        Ok(())
    }
}
