//! Scanner Module
//!
//! Ordered iteration over a key range `[start, stop)` at a fixed snapshot.
//!
//! ## Variants
//! ```text
//!               forward          reverse
//!   buffered    Scanner          Scanner        (copies one data block
//!                                                per batch, no lock held
//!                                                between batches)
//!   raw         RawScanner       RawScanner     (borrows block memory,
//!                                                holds one index block
//!                                                read lock)
//! ```
//!
//! Every scanner creates a snapshot when opened and releases it when
//! closed or dropped, so it never observes writes made after it opened.

mod buffered;
mod cursor;
mod raw;

pub use buffered::Scanner;
pub use raw::RawScanner;

use crate::error::{KvError, Result};

fn check_range(start: Option<&[u8]>, stop: Option<&[u8]>) -> Result<()> {
    match (start, stop) {
        (Some(start), Some(stop)) if start > stop => Err(KvError::InvalidArgument(
            "scan start sorts after scan stop".to_string(),
        )),
        _ => Ok(()),
    }
}

fn in_range(start: Option<&[u8]>, stop: Option<&[u8]>, key: &[u8]) -> bool {
    start.map_or(true, |start| key >= start) && stop.map_or(true, |stop| key < stop)
}
