use std::path::PathBuf;
use std::sync::Arc;

use datafusion::execution::disk_manager::{DiskManager, DiskManagerConfig};
use datafusion::execution::memory_pool::{GreedyMemoryPool, MemoryPool, UnboundedMemoryPool};
use log::debug;
use serde::{Deserialize, Serialize};
use windower_common::error::{Result, WindowerError};

use crate::file_handles::FileHandleSemaphore;
use crate::governor::ResourceGovernor;

pub const DEFAULT_MAX_OPEN_FILES: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Byte budget shared by all buffering operators. `None` means unbounded.
    pub memory_limit: Option<usize>,
    pub max_open_files: usize,
    pub spill_enabled: bool,
    /// Directories for spill files. Empty uses the OS temp directory.
    pub spill_directories: Vec<PathBuf>,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            memory_limit: None,
            max_open_files: DEFAULT_MAX_OPEN_FILES,
            spill_enabled: true,
            spill_directories: vec![],
        }
    }
}

impl GovernorConfig {
    pub fn with_memory_limit(mut self, limit: usize) -> Self {
        self.memory_limit = Some(limit);
        self
    }

    pub fn with_max_open_files(mut self, max_open_files: usize) -> Self {
        self.max_open_files = max_open_files;
        self
    }

    pub fn with_spill_enabled(mut self, enabled: bool) -> Self {
        self.spill_enabled = enabled;
        self
    }

    pub fn with_spill_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spill_directories.push(dir.into());
        self
    }

    pub fn build(&self) -> Result<ResourceGovernor> {
        if self.memory_limit == Some(0) {
            return Err(WindowerError::Config(
                "memory_limit must be greater than zero".to_string(),
            ));
        }
        let memory_pool: Arc<dyn MemoryPool> = match self.memory_limit {
            Some(limit) => Arc::new(GreedyMemoryPool::new(limit)),
            None => Arc::new(UnboundedMemoryPool::default()),
        };
        let disk_config = match (self.spill_enabled, self.spill_directories.is_empty()) {
            (false, _) => DiskManagerConfig::Disabled,
            (true, true) => DiskManagerConfig::NewOs,
            (true, false) => DiskManagerConfig::NewSpecified(self.spill_directories.clone()),
        };
        let disk_manager = DiskManager::try_new(disk_config)?;
        debug!(
            "building resource governor: memory_limit={:?}, max_open_files={}, spill_enabled={}",
            self.memory_limit, self.max_open_files, self.spill_enabled
        );
        Ok(ResourceGovernor::new(
            memory_pool,
            disk_manager,
            FileHandleSemaphore::new(self.max_open_files),
        ))
    }
}
