//! Engine settings.
//!
//! Settings can come from a JSON file; any field left out keeps its default.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::{MapReduceError, MapReduceResult};
use crate::utils::available_workers;

/// Default capacity of each stage's result channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Upper bound on concurrently running map or reduce workers.
    pub workers: usize,
    /// Number of undelivered task outcomes a stage buffers before workers
    /// block on sending.
    pub channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: available_workers(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl EngineConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_channel_capacity(mut self, channel_capacity: usize) -> Self {
        self.channel_capacity = channel_capacity;
        self
    }

    pub fn validate(&self) -> MapReduceResult<()> {
        if self.workers == 0 {
            return Err(MapReduceError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(MapReduceError::InvalidConfig(
                "channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Reads settings from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_json_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }
}
