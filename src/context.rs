//! Engine context
//!
//! Everything that would otherwise be process-wide mutable state: the
//! configuration, memory accounting, the sequence/snapshot registry and
//! the striped lock table. Blocks receive it by reference on every
//! operation instead of reaching for globals.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::error::Result;
use crate::locks::LockTable;
use crate::memory::{MemoryTracker, SizeLadder};
use crate::version::VersionManager;

/// Shared state for one engine instance
#[derive(Debug)]
pub struct EngineContext {
    config: Config,
    memory: Arc<MemoryTracker>,
    versions: VersionManager,
    locks: LockTable,
    data_ladder: SizeLadder,
    index_ladder: SizeLadder,
    epoch: Instant,
}

impl EngineContext {
    /// Validate `config` and build a fresh context
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            memory: Arc::new(MemoryTracker::new(config.max_memory)),
            versions: VersionManager::new(),
            locks: LockTable::new(config.lock_stripes),
            data_ladder: SizeLadder::new(config.max_data_block_size),
            index_ladder: SizeLadder::new(config.max_index_block_size),
            epoch: Instant::now(),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn memory(&self) -> &Arc<MemoryTracker> {
        &self.memory
    }

    pub fn versions(&self) -> &VersionManager {
        &self.versions
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    pub fn data_ladder(&self) -> &SizeLadder {
        &self.data_ladder
    }

    pub fn index_ladder(&self) -> &SizeLadder {
        &self.index_ladder
    }

    /// Milliseconds since this context was created
    pub fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}
