use std::ops::Bound;

use super::cursor::BlockCursor;
use super::{check_range, in_range};
use crate::engine::BigSortedMap;
use crate::error::Result;
use crate::version::SnapshotId;

/// Zero-copy scanner over a key range
///
/// Keys and values are borrowed straight from block memory, so the index
/// block under the cursor stays read-locked until the scanner moves past
/// it or is closed. Writers to that block wait meanwhile; do not write
/// from the thread driving an open raw scanner.
pub struct RawScanner<'a> {
    map: &'a BigSortedMap,
    snapshot: Option<SnapshotId>,
    start: Option<Vec<u8>>,
    stop: Option<Vec<u8>>,
    reverse: bool,
    cursor: Option<BlockCursor>,
}

impl<'a> RawScanner<'a> {
    pub(crate) fn open(
        map: &'a BigSortedMap,
        start: Option<&[u8]>,
        stop: Option<&[u8]>,
        reverse: bool,
    ) -> Result<Self> {
        check_range(start, stop)?;
        let snapshot = map.create_snapshot();
        let mut scanner = Self {
            map,
            snapshot: Some(snapshot),
            start: start.map(<[u8]>::to_vec),
            stop: stop.map(<[u8]>::to_vec),
            reverse,
            cursor: None,
        };
        let bound = if reverse {
            stop.map_or(Bound::Unbounded, Bound::Excluded)
        } else {
            start.map_or(Bound::Unbounded, Bound::Included)
        };
        let cursor = BlockCursor::seek(map, bound, snapshot, reverse)?;
        scanner.cursor = scanner.bounded(cursor);
        Ok(scanner)
    }

    fn bounded(&self, cursor: Option<BlockCursor>) -> Option<BlockCursor> {
        cursor.filter(|c| in_range(self.start.as_deref(), self.stop.as_deref(), c.key()))
    }

    /// Whether the scanner is positioned on a record
    pub fn has_next(&self) -> bool {
        self.cursor.is_some()
    }

    /// Move to the next record; false once the range is exhausted
    pub fn advance(&mut self) -> Result<bool> {
        let (Some(cursor), Some(snapshot)) = (self.cursor.take(), self.snapshot) else {
            return Ok(false);
        };
        let next = cursor.step(self.map, snapshot, self.reverse)?;
        self.cursor = self.bounded(next);
        Ok(self.cursor.is_some())
    }

    /// Current key; empty once exhausted
    pub fn key(&self) -> &[u8] {
        self.cursor.as_ref().map_or(&[][..], BlockCursor::key)
    }

    /// Current value; empty once exhausted
    pub fn value(&self) -> &[u8] {
        self.cursor.as_ref().map_or(&[][..], BlockCursor::value)
    }

    pub fn key_size(&self) -> usize {
        self.key().len()
    }

    pub fn value_size(&self) -> usize {
        self.value().len()
    }

    /// Copy the current key into `buf` if it fits; returns the key size
    pub fn key_into(&self, buf: &mut [u8]) -> usize {
        copy_if_fits(self.key(), buf)
    }

    /// Copy the current value into `buf` if it fits; returns the value size
    pub fn value_into(&self, buf: &mut [u8]) -> usize {
        copy_if_fits(self.value(), buf)
    }

    /// Release the block lock and the scanner's snapshot
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        self.cursor = None;
        if let Some(id) = self.snapshot.take() {
            self.map.release_snapshot(id);
        }
    }
}

impl Drop for RawScanner<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

pub(super) fn copy_if_fits(src: &[u8], buf: &mut [u8]) -> usize {
    if src.len() <= buf.len() {
        buf[..src.len()].copy_from_slice(src);
    }
    src.len()
}
