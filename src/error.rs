//! Error types for sortedkv
//!
//! Provides a unified error type for all public operations, plus the
//! internal retry signal used by the optimistic locking protocol.

use thiserror::Error;

/// Result type alias using KvError
pub type Result<T> = std::result::Result<T, KvError>;

/// Unified error type for sortedkv operations
#[derive(Debug, Error)]
pub enum KvError {
    // -------------------------------------------------------------------------
    // Argument Errors
    // -------------------------------------------------------------------------
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // -------------------------------------------------------------------------
    // Capacity Errors
    // -------------------------------------------------------------------------
    #[error("Memory budget exhausted: requested {requested} bytes with limit {limit}")]
    MemoryExhausted { requested: usize, limit: u64 },

    #[error("Block capacity exhausted: {0}")]
    CapacityExhausted(String),

    // -------------------------------------------------------------------------
    // Structural Errors
    // -------------------------------------------------------------------------
    #[error("Structural invariant violated: {0}")]
    Corruption(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl KvError {
    /// Capacity conditions are ordinary outcomes for `put`, not failures.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            KvError::MemoryExhausted { .. } | KvError::CapacityExhausted(_)
        )
    }
}

/// Outcome of a single optimistic attempt inside the engine.
///
/// `Retry` means a routing precondition failed (the block was split, merged
/// or removed after it was located) and the caller must restart from the
/// floor lookup. It never escapes the engine.
#[derive(Debug)]
pub(crate) enum OpError {
    Retry,
    Fail(KvError),
}

pub(crate) type OpResult<T> = std::result::Result<T, OpError>;

impl From<KvError> for OpError {
    fn from(e: KvError) -> Self {
        OpError::Fail(e)
    }
}
