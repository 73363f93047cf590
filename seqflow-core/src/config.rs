//! Configuration shared by readers, planners and caches

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::iterator::DEFAULT_CHUNK_SIZE;
use crate::memory::{MemoryBudget, DEFAULT_RESERVE_BYTES};

/// Settings passed explicitly to the components that need them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeqflowConfig {
    /// Directory holding cache storage units
    pub cache_dir: PathBuf,

    /// Prefix of every storage unit name
    pub cache_prefix: String,

    /// Chunk size used by iterators that are not planned
    pub default_chunk_size: usize,

    /// Memory kept free when sizing pipelines
    pub memory_reserve_bytes: u64,

    /// Skip files that cannot be read instead of failing
    pub drop_unreadable_files: bool,
}

impl Default for SeqflowConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("seqflow-cache"),
            cache_prefix: "seqflow-".to_string(),
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            memory_reserve_bytes: DEFAULT_RESERVE_BYTES,
            drop_unreadable_files: false,
        }
    }
}

impl SeqflowConfig {
    /// Parse from JSON; missing fields keep their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Same settings with another cache directory
    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = cache_dir.into();
        self
    }

    /// Memory budget of this machine after the configured reserve
    pub fn system_budget(&self) -> Result<MemoryBudget> {
        MemoryBudget::from_system(self.memory_reserve_bytes)
    }
}
