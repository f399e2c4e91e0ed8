//! Block Module
//!
//! The two block kinds the engine is built from.
//!
//! ## Structure
//! ```text
//!   engine map ──► IndexBlock ──► DataBlock ──► records
//!   (by first key)  (entries by    (versions by
//!                    first key)     key, seq desc)
//! ```

mod data;
mod index;

pub use data::{DataBlock, DeleteStatus, PutStatus};
pub use index::{IndexBlock, IndexDelete, IndexPut, RangeDelete};
