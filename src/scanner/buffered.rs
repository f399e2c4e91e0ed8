use std::ops::Bound;

use bytes::{Bytes, BytesMut};
use tracing::trace;

use super::cursor::BlockCursor;
use super::raw::copy_if_fits;
use super::{check_range, in_range};
use crate::engine::BigSortedMap;
use crate::error::Result;
use crate::version::SnapshotId;

enum Resume {
    Begin,
    /// Continue strictly beyond this key in the scan direction
    After(Vec<u8>),
    Done,
}

/// Buffered scanner over a key range
///
/// Copies the visible records of one data block at a time into a private
/// batch while holding the block's read lock only for the copy. Between
/// batches no lock is held, so concurrent writers are never blocked for
/// long; the scanner's snapshot keeps its view stable.
pub struct Scanner<'a> {
    map: &'a BigSortedMap,
    snapshot: Option<SnapshotId>,
    start: Option<Vec<u8>>,
    stop: Option<Vec<u8>>,
    reverse: bool,
    batch: Vec<(Bytes, Bytes)>,
    pos: usize,
    resume: Resume,
}

impl<'a> Scanner<'a> {
    pub(crate) fn open(
        map: &'a BigSortedMap,
        start: Option<&[u8]>,
        stop: Option<&[u8]>,
        reverse: bool,
    ) -> Result<Self> {
        check_range(start, stop)?;
        let mut scanner = Self {
            map,
            snapshot: Some(map.create_snapshot()),
            start: start.map(<[u8]>::to_vec),
            stop: stop.map(<[u8]>::to_vec),
            reverse,
            batch: Vec::new(),
            pos: 0,
            resume: Resume::Begin,
        };
        scanner.fill()?;
        Ok(scanner)
    }

    /// Load the next batch: every visible in-range record of one data block
    fn fill(&mut self) -> Result<()> {
        self.batch.clear();
        self.pos = 0;
        let Some(snapshot) = self.snapshot else {
            self.resume = Resume::Done;
            return Ok(());
        };
        let bound = match &self.resume {
            Resume::Done => return Ok(()),
            Resume::After(key) => Bound::Excluded(key.as_slice()),
            Resume::Begin if self.reverse => self.stop.as_deref().map_or(Bound::Unbounded, Bound::Excluded),
            Resume::Begin => self.start.as_deref().map_or(Bound::Unbounded, Bound::Included),
        };
        let Some(mut cursor) = BlockCursor::seek(self.map, bound, snapshot, self.reverse)? else {
            self.resume = Resume::Done;
            return Ok(());
        };

        let mut buf = BytesMut::new();
        let mut spans = Vec::new();
        let mut exhausted = false;
        loop {
            let key = cursor.key();
            if !in_range(self.start.as_deref(), self.stop.as_deref(), key) {
                exhausted = true;
                break;
            }
            let key_at = buf.len();
            buf.extend_from_slice(key);
            let value_at = buf.len();
            buf.extend_from_slice(cursor.value());
            spans.push((key_at, value_at, buf.len()));
            if !cursor.step_in_block(snapshot, self.reverse) {
                break;
            }
        }
        drop(cursor);

        let frozen = buf.freeze();
        self.batch = spans
            .into_iter()
            .map(|(k, v, end)| (frozen.slice(k..v), frozen.slice(v..end)))
            .collect();
        self.resume = match self.batch.last() {
            Some((key, _)) if !exhausted => Resume::After(key.to_vec()),
            _ => Resume::Done,
        };
        trace!(records = self.batch.len(), "Loaded scanner batch");
        Ok(())
    }

    /// Whether the scanner is positioned on a record
    pub fn has_next(&self) -> bool {
        self.pos < self.batch.len()
    }

    /// Move to the next record; false once the range is exhausted
    pub fn advance(&mut self) -> Result<bool> {
        if self.pos < self.batch.len() {
            self.pos += 1;
        }
        if self.pos >= self.batch.len() {
            self.fill()?;
        }
        Ok(self.has_next())
    }

    /// Current key; empty once exhausted
    pub fn key(&self) -> &[u8] {
        self.batch.get(self.pos).map_or(&[][..], |(key, _)| &key[..])
    }

    /// Current value; empty once exhausted
    pub fn value(&self) -> &[u8] {
        self.batch.get(self.pos).map_or(&[][..], |(_, value)| &value[..])
    }

    /// Current key as a shared buffer, without copying
    pub fn key_bytes(&self) -> Option<Bytes> {
        self.batch.get(self.pos).map(|(key, _)| key.clone())
    }

    /// Current value as a shared buffer, without copying
    pub fn value_bytes(&self) -> Option<Bytes> {
        self.batch.get(self.pos).map(|(_, value)| value.clone())
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

    /// Release the scanner's snapshot
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        self.batch.clear();
        self.resume = Resume::Done;
        if let Some(id) = self.snapshot.take() {
            self.map.release_snapshot(id);
        }
    }
}

impl Drop for Scanner<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
