use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::core::errors::{Result, TaskLaneError};

/// Task manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// How long `stop_task` waits for a cancelled run to exit, in milliseconds
    pub stop_timeout_ms: u64,
    /// Reject tasks whose actions share an id instead of letting
    /// later outputs overwrite earlier ones
    pub strict_action_ids: bool,
    /// Maximum number of concurrently running tasks (None = unbounded)
    pub max_running_tasks: Option<usize>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: 30_000,
            strict_action_ids: false,
            max_running_tasks: None,
        }
    }
}

impl ManagerConfig {
    pub fn builder() -> ManagerConfigBuilder {
        ManagerConfigBuilder::new()
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.stop_timeout_ms == 0 {
            return Err(TaskLaneError::configuration(
                "stop_timeout_ms must be greater than 0",
            ));
        }
        if self.max_running_tasks == Some(0) {
            return Err(TaskLaneError::configuration(
                "max_running_tasks must be greater than 0 when set",
            ));
        }
        Ok(())
    }

    /// Short timeouts and strict ids, for development and tests
    pub fn development() -> Self {
        Self {
            stop_timeout_ms: 5_000,
            strict_action_ids: true,
            ..Default::default()
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| TaskLaneError::Io {
            operation: format!("read config {}", path.display()),
            source,
        })?;
        Self::from_yaml_str(&contents)
    }
}

/// Builder for ManagerConfig
pub struct ManagerConfigBuilder {
    config: ManagerConfig,
}

impl ManagerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ManagerConfig::default(),
        }
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.config.stop_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn strict_action_ids(mut self, strict: bool) -> Self {
        self.config.strict_action_ids = strict;
        self
    }

    pub fn max_running_tasks(mut self, limit: usize) -> Self {
        self.config.max_running_tasks = Some(limit);
        self
    }

    /// Build and validate
    pub fn build(self) -> Result<ManagerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ManagerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
