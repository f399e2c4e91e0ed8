//! Configuration for sortedkv
//!
//! Centralized configuration with sensible defaults. Values can be set
//! through the builder or overlaid from `SORTEDKV_*` environment variables.

use crate::error::{KvError, Result};

/// Environment variable overriding [`Config::max_data_block_size`]
pub const ENV_MAX_DATA_BLOCK_SIZE: &str = "SORTEDKV_MAX_DATA_BLOCK_SIZE";
/// Environment variable overriding [`Config::max_index_block_size`]
pub const ENV_MAX_INDEX_BLOCK_SIZE: &str = "SORTEDKV_MAX_INDEX_BLOCK_SIZE";
/// Environment variable overriding [`Config::max_memory`]
pub const ENV_MAX_MEMORY: &str = "SORTEDKV_MAX_MEMORY";
/// Environment variable overriding [`Config::lock_stripes`]
pub const ENV_LOCK_STRIPES: &str = "SORTEDKV_LOCK_STRIPES";

/// Main configuration for a sortedkv instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Block Configuration
    // -------------------------------------------------------------------------
    /// Largest capacity a data block may grow to (bytes).
    /// Records bigger than half of this are stored externally.
    pub max_data_block_size: usize,

    /// Largest capacity an index block may grow to (bytes)
    pub max_index_block_size: usize,

    /// Fraction of stale records that triggers an automatic compaction
    pub compaction_threshold: f64,

    // -------------------------------------------------------------------------
    // Memory Configuration
    // -------------------------------------------------------------------------
    /// Process-wide budget for block buffers and external allocations (bytes)
    pub max_memory: u64,

    // -------------------------------------------------------------------------
    // Concurrency Configuration
    // -------------------------------------------------------------------------
    /// Number of striped writer locks shared by all index blocks
    pub lock_stripes: usize,

    /// How long after a split or rekey readers re-verify routing (milliseconds)
    pub unsafe_modification_window_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_data_block_size: 4096,
            max_index_block_size: 4096,
            compaction_threshold: 0.25,
            max_memory: 1024 * 1024 * 1024, // 1 GB
            lock_stripes: 1024,
            unsafe_modification_window_ms: 50,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Defaults overlaid with any `SORTEDKV_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        if let Some(v) = read_env(ENV_MAX_DATA_BLOCK_SIZE)? {
            config.max_data_block_size = v as usize;
        }
        if let Some(v) = read_env(ENV_MAX_INDEX_BLOCK_SIZE)? {
            config.max_index_block_size = v as usize;
        }
        if let Some(v) = read_env(ENV_MAX_MEMORY)? {
            config.max_memory = v;
        }
        if let Some(v) = read_env(ENV_LOCK_STRIPES)? {
            config.lock_stripes = v as usize;
        }
        config.validate()?;
        Ok(config)
    }

    /// Check that every knob is within the range the block formats support.
    ///
    /// Record and entry lengths are 2-byte fields and buffer offsets are
    /// `u16`, so neither block kind may exceed 32 KB.
    pub fn validate(&self) -> Result<()> {
        if !(512..=32 * 1024).contains(&self.max_data_block_size) {
            return Err(KvError::Config(format!(
                "max_data_block_size must be in 512..=32768, got {}",
                self.max_data_block_size
            )));
        }
        if !(1024..=32 * 1024).contains(&self.max_index_block_size) {
            return Err(KvError::Config(format!(
                "max_index_block_size must be in 1024..=32768, got {}",
                self.max_index_block_size
            )));
        }
        if self.lock_stripes == 0 {
            return Err(KvError::Config("lock_stripes must be positive".to_string()));
        }
        if !(self.compaction_threshold > 0.0 && self.compaction_threshold <= 1.0) {
            return Err(KvError::Config(format!(
                "compaction_threshold must be in (0, 1], got {}",
                self.compaction_threshold
            )));
        }
        Ok(())
    }

    /// Records whose encoded size reaches this many bytes leave the block
    pub fn external_threshold(&self) -> usize {
        self.max_data_block_size / 2
    }

    /// Index keys at least this long are stored outside the index buffer
    pub fn index_key_threshold(&self) -> usize {
        self.max_index_block_size / 16
    }
}

fn read_env(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| KvError::Config(format!("{}={:?}: {}", name, raw, e))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(KvError::Config(format!("{}: {}", name, e))),
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the maximum data block size (in bytes)
    pub fn max_data_block_size(mut self, size: usize) -> Self {
        self.config.max_data_block_size = size;
        self
    }

    /// Set the maximum index block size (in bytes)
    pub fn max_index_block_size(mut self, size: usize) -> Self {
        self.config.max_index_block_size = size;
        self
    }

    /// Set the process memory budget (in bytes)
    pub fn max_memory(mut self, bytes: u64) -> Self {
        self.config.max_memory = bytes;
        self
    }

    /// Set the number of lock stripes
    pub fn lock_stripes(mut self, count: usize) -> Self {
        self.config.lock_stripes = count;
        self
    }

    /// Set the stale-record ratio that triggers compaction
    pub fn compaction_threshold(mut self, ratio: f64) -> Self {
        self.config.compaction_threshold = ratio;
        self
    }

    /// Set the routing re-verification window (in milliseconds)
    pub fn unsafe_modification_window_ms(mut self, ms: u64) -> Self {
        self.config.unsafe_modification_window_ms = ms;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
