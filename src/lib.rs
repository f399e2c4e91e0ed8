//! # sortedkv
//!
//! An embedded, in-memory, ordered key/value engine with:
//! - Byte-string keys in lexicographic order and byte-string values
//! - Point reads, writes and deletes plus range deletes
//! - Snapshot reads (MVCC) over a global sequence counter
//! - Forward and reverse range scanners, buffered or zero-copy
//! - Striped writer locks with optimistic routing for concurrency
//! - A process-wide memory budget covering every block allocation
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       BigSortedMap                           │
//! │        put / get / delete / delete_range / scanners          │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ floor lookup by first key
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │              Skip map: first key → IndexBlock                │
//! │        (striped writer locks, per-block RwLock)              │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │ IndexBlock  │   ...    │ IndexBlock  │
//!   │ (entries)   │          │ (entries)   │
//!   └──────┬──────┘          └─────────────┘
//!          │
//!          ▼
//!   ┌─────────────┐   records (key asc, seq desc)
//!   │  DataBlock  │──► embedded, or with the value /
//!   └─────────────┘    key+value held externally
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod memory;
pub mod version;
pub mod locks;
pub mod context;
pub mod record;
pub mod block;
pub mod engine;
pub mod scanner;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{KvError, Result};
pub use config::Config;
pub use context::EngineContext;
pub use engine::{BigSortedMap, MapStats};
pub use scanner::{RawScanner, Scanner};
pub use version::{SeqId, SnapshotId, LATEST};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of sortedkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
