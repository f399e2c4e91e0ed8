//! Data Block
//!
//! A sorted, packed run of record versions in one buffer.
//!
//! ## Layout
//! ```text
//!   buffer:  [rec 0][rec 1][rec 2] ... [rec n-1][ free space ]
//!            ▲      ▲      ▲
//!   offsets: 0      ...    ...        (one u16 per record, same order)
//! ```
//!
//! Records are kept in version order (key asc, seq desc, op asc), so every
//! version of a key forms one contiguous run with the newest first. The
//! offset table is a side index used for binary search; it is updated in
//! step with every insertion and removal.
//!
//! ## Version retention
//! A put or delete never destroys a version some active snapshot can still
//! read. Older versions accumulate as "stale" records until the stale
//! ratio crosses the configured threshold, at which point the block is
//! compacted.

use tracing::{debug, trace};

use crate::context::EngineContext;
use crate::error::{KvError, Result};
use crate::memory::{BlockBuffer, ExternalStore};
use crate::record::{write_record, AllocClass, NewRecord, OpType, Placement, RecordView, SEQ_SIZE};
use crate::version::{SeqId, SnapshotId};

/// Outcome of [`DataBlock::put`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutStatus {
    /// The key had no versions in this block
    Inserted,
    /// An existing version was overwritten, replaced or shadowed
    Updated,
    /// The block cannot hold the record even at maximum size
    NoRoom,
}

/// Outcome of [`DataBlock::delete`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStatus {
    /// No live version of the key
    NotFound,
    /// Every version of the key was physically removed
    Removed,
    /// A tombstone now hides the key at the newest version
    Tombstoned,
    /// The tombstone does not fit even at maximum size
    NoRoom,
}

/// Sorted run of record versions
#[derive(Debug)]
pub struct DataBlock {
    buf: BlockBuffer,
    data_size: usize,
    offsets: Vec<u16>,
    stale: usize,
    externals: ExternalStore,
}

impl DataBlock {
    // =========================================================================
    // Construction
    // =========================================================================

    /// Empty block at the smallest capacity
    pub fn new(ctx: &EngineContext) -> Result<Self> {
        Self::with_capacity(ctx, ctx.data_ladder().smallest())
    }

    pub fn with_capacity(ctx: &EngineContext, capacity: usize) -> Result<Self> {
        Ok(Self {
            buf: BlockBuffer::allocate(ctx.memory(), capacity)?,
            data_size: 0,
            offsets: Vec::new(),
            stale: 0,
            externals: ExternalStore::new(ctx.memory()),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn record_count(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Bytes in use
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn stale_count(&self) -> usize {
        self.stale
    }

    /// Live external allocations owned by this block
    pub fn external_count(&self) -> usize {
        self.externals.len()
    }

    /// View of the record at position `idx`
    pub fn record(&self, idx: usize) -> RecordView<'_> {
        RecordView::new(&self.buf, self.offsets[idx] as usize, &self.externals)
    }

    /// Every record version in block order
    pub fn records(&self) -> impl Iterator<Item = RecordView<'_>> + '_ {
        (0..self.record_count()).map(move |idx| self.record(idx))
    }

    pub fn key_at(&self, idx: usize) -> &[u8] {
        self.record(idx).key()
    }

    pub fn first_key(&self) -> Option<&[u8]> {
        (!self.is_empty()).then(|| self.key_at(0))
    }

    pub fn last_key(&self) -> Option<&[u8]> {
        self.record_count()
            .checked_sub(1)
            .map(|idx| self.key_at(idx))
    }

    // =========================================================================
    // Search
    // =========================================================================

    /// Position of the first record whose key is `>= key`
    pub fn run_start(&self, key: &[u8]) -> usize {
        let (mut lo, mut hi) = (0, self.record_count());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.key_at(mid) < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// One past the last record sharing the key at `from`
    pub fn run_end(&self, from: usize) -> usize {
        let n = self.record_count();
        if from >= n {
            return n;
        }
        let key = self.key_at(from);
        let mut end = from + 1;
        while end < n && self.key_at(end) == key {
            end += 1;
        }
        end
    }

    /// First record of the run containing `idx`
    pub fn run_start_of(&self, idx: usize) -> usize {
        let key = self.key_at(idx);
        let mut start = idx;
        while start > 0 && self.key_at(start - 1) == key {
            start -= 1;
        }
        start
    }

    /// Position just past every record whose key is `<= key`
    pub fn run_after(&self, key: &[u8]) -> usize {
        let start = self.run_start(key);
        if start < self.record_count() && self.key_at(start) == key {
            self.run_end(start)
        } else {
            start
        }
    }

    fn run_of(&self, key: &[u8]) -> Option<(usize, usize)> {
        let start = self.run_start(key);
        if start < self.record_count() && self.key_at(start) == key {
            Some((start, self.run_end(start)))
        } else {
            None
        }
    }

    /// Visible version within a run: the first with `seq <= snapshot`,
    /// reported only if it is a put.
    pub fn visible_in_run(&self, start: usize, end: usize, snapshot: SnapshotId) -> Option<usize> {
        for idx in start..end {
            let record = self.record(idx);
            if record.seq_id() <= snapshot {
                return (record.op() == OpType::Put).then_some(idx);
            }
        }
        None
    }

    /// Next visible record at or after run boundary `from`, with its run end
    pub fn next_visible(&self, from: usize, snapshot: SnapshotId) -> Option<(usize, usize)> {
        let mut start = from;
        while start < self.record_count() {
            let end = self.run_end(start);
            if let Some(idx) = self.visible_in_run(start, end, snapshot) {
                return Some((idx, end));
            }
            start = end;
        }
        None
    }

    /// Last visible record before run boundary `before`, with its run start
    pub fn prev_visible(&self, before: usize, snapshot: SnapshotId) -> Option<(usize, usize)> {
        let mut end = before.min(self.record_count());
        while end > 0 {
            let start = self.run_start_of(end - 1);
            if let Some(idx) = self.visible_in_run(start, end, snapshot) {
                return Some((idx, start));
            }
            end = start;
        }
        None
    }

    /// Visible version of `key` at `snapshot`
    pub fn get(&self, key: &[u8], snapshot: SnapshotId) -> Option<RecordView<'_>> {
        let (start, end) = self.run_of(key)?;
        self.visible_in_run(start, end, snapshot)
            .map(|idx| self.record(idx))
    }

    /// Distinct keys in `[start, end)` whose newest version is a put
    pub fn live_keys_in(&self, start: &[u8], end: &[u8]) -> Vec<Vec<u8>> {
        let mut keys = Vec::new();
        let mut idx = self.run_start(start);
        while idx < self.record_count() {
            let record = self.record(idx);
            if record.key() >= end {
                break;
            }
            if record.op() == OpType::Put {
                keys.push(record.key().to_vec());
            }
            idx = self.run_end(idx);
        }
        keys
    }

    // =========================================================================
    // Put / Delete
    // =========================================================================

    pub fn needs_compaction(&self, ctx: &EngineContext) -> bool {
        let n = self.record_count();
        n > 0 && self.stale as f64 / n as f64 > ctx.config().compaction_threshold
    }

    /// Insert or update `key`.
    ///
    /// The current newest version survives (as a stale record) only when a
    /// snapshot taken at or after it and before `seq` still needs it.
    /// Otherwise it is overwritten in place when the new value has the same
    /// class and length, or replaced.
    pub fn put(
        &mut self,
        ctx: &EngineContext,
        key: &[u8],
        value: &[u8],
        seq: SeqId,
        expire: u64,
    ) -> Result<PutStatus> {
        if self.needs_compaction(ctx) {
            self.compact(ctx, true)?;
        }
        let class = AllocClass::classify(key.len(), value.len(), ctx.config().external_threshold());
        let needed = class.encoded_len(key.len(), value.len());
        let mut compacted = false;
        loop {
            let at = self.run_start(key);
            let existing = at < self.record_count() && self.key_at(at) == key;

            let mut replace = false;
            let mut growth = needed;
            let mut seq = seq;
            if existing {
                let newest = self.record(at);
                // never slide under a newer version
                seq = seq.max(newest.seq_id());
                if !ctx.versions().has_snapshot_in(newest.seq_id(), seq) {
                    if newest.op() == OpType::Put
                        && newest.class() == class
                        && newest.value_size() == value.len()
                    {
                        self.overwrite_in_place(at, value, seq, expire)?;
                        return Ok(PutStatus::Updated);
                    }
                    replace = true;
                    growth = needed.saturating_sub(newest.encoded_len());
                }
            }

            if !self.fits(growth) {
                if !compacted && self.stale > 0 {
                    self.compact(ctx, true)?;
                    compacted = true;
                    continue;
                }
                if !self.grow(ctx, self.data_size + growth)? {
                    return Ok(PutStatus::NoRoom);
                }
            }

            let placement = self.place(key, value, class)?;
            if replace {
                self.remove_range(at, at + 1);
            } else if existing {
                self.stale += 1;
            }
            self.insert_at(
                at,
                &NewRecord {
                    key,
                    value,
                    seq,
                    op: OpType::Put,
                    expire,
                },
                placement,
            );
            return Ok(if existing {
                PutStatus::Updated
            } else {
                PutStatus::Inserted
            });
        }
    }

    /// Delete `key` as of `seq`.
    ///
    /// With no snapshot needing any version of the key, the whole run is
    /// removed. Otherwise a tombstone is added (or replaces the newest
    /// version when nothing needs it) so older snapshots keep their view.
    pub fn delete(&mut self, ctx: &EngineContext, key: &[u8], seq: SeqId) -> Result<DeleteStatus> {
        if self.needs_compaction(ctx) {
            self.compact(ctx, true)?;
        }
        let class = AllocClass::classify(key.len(), 0, ctx.config().external_threshold());
        let needed = class.encoded_len(key.len(), 0);
        let mut compacted = false;
        loop {
            let Some((start, end)) = self.run_of(key) else {
                return Ok(DeleteStatus::NotFound);
            };
            let newest = self.record(start);
            if newest.is_delete() {
                return Ok(DeleteStatus::NotFound);
            }
            let seq = seq.max(newest.seq_id());

            let oldest_seq = self.record(end - 1).seq_id();
            if !ctx.versions().has_snapshot_in(oldest_seq, seq) {
                self.remove_range(start, end);
                self.stale = self.stale.saturating_sub(end - start - 1);
                return Ok(DeleteStatus::Removed);
            }

            let keep_newest = ctx.versions().has_snapshot_in(newest.seq_id(), seq);
            let growth = if keep_newest {
                needed
            } else {
                needed.saturating_sub(newest.encoded_len())
            };
            if !self.fits(growth) {
                if !compacted && self.stale > 0 {
                    self.compact(ctx, true)?;
                    compacted = true;
                    continue;
                }
                if !self.grow(ctx, self.data_size + growth)? {
                    return Ok(DeleteStatus::NoRoom);
                }
            }

            let placement = self.place(key, &[], class)?;
            if keep_newest {
                self.stale += 1;
            } else {
                self.remove_range(start, start + 1);
            }
            self.insert_at(
                start,
                &NewRecord {
                    key,
                    value: &[],
                    seq,
                    op: OpType::Delete,
                    expire: 0,
                },
                placement,
            );
            self.stale += 1;
            return Ok(DeleteStatus::Tombstoned);
        }
    }

    /// Delete every live key in `[start, end)`.
    ///
    /// Returns how many keys were deleted and, if a tombstone did not fit,
    /// the key that still needs deleting once the block has been split.
    pub fn delete_keys_in(
        &mut self,
        ctx: &EngineContext,
        start: &[u8],
        end: &[u8],
        seq: SeqId,
    ) -> Result<(usize, Option<Vec<u8>>)> {
        let mut deleted = 0;
        for key in self.live_keys_in(start, end) {
            match self.delete(ctx, &key, seq)? {
                DeleteStatus::Removed | DeleteStatus::Tombstoned => deleted += 1,
                DeleteStatus::NotFound => {}
                DeleteStatus::NoRoom => return Ok((deleted, Some(key))),
            }
        }
        Ok((deleted, None))
    }

    /// Expiration of the newest version of `key`, if it is live
    pub fn get_expire(&self, key: &[u8]) -> Option<u64> {
        let (start, _) = self.run_of(key)?;
        let newest = self.record(start);
        (newest.op() == OpType::Put).then(|| newest.expire())
    }

    /// Set the expiration of the newest version of `key`; false if not live
    pub fn set_expire(&mut self, key: &[u8], expire: u64) -> bool {
        let Some((start, _)) = self.run_of(key) else {
            return false;
        };
        if self.record(start).op() != OpType::Put {
            return false;
        }
        let off = self.offsets[start] as usize;
        self.buf[off + 4..off + 12].copy_from_slice(&expire.to_be_bytes());
        true
    }

    // =========================================================================
    // Compaction
    // =========================================================================

    /// Drop versions no active snapshot can read.
    ///
    /// For each key the newest version is kept; an older version is kept
    /// when a snapshot falls between it and the next newer kept candidate.
    /// Tombstones left at the bottom of a run hide nothing and go too.
    /// Returns whether any record was dropped.
    pub fn compact(&mut self, ctx: &EngineContext, force: bool) -> Result<bool> {
        if !force && !self.needs_compaction(ctx) {
            return Ok(false);
        }
        let n = self.record_count();
        let mut keep = vec![false; n];
        let mut start = 0;
        while start < n {
            let end = self.run_end(start);
            keep[start] = true;
            for idx in start + 1..end {
                let newer = self.record(idx - 1).seq_id();
                keep[idx] = ctx
                    .versions()
                    .has_snapshot_in(self.record(idx).seq_id(), newer);
            }
            let mut bottom = end;
            loop {
                let Some(idx) = (start..bottom).rev().find(|&i| keep[i]) else {
                    break;
                };
                if !self.record(idx).is_delete() {
                    break;
                }
                keep[idx] = false;
                bottom = idx;
            }
            start = end;
        }

        let dropped = keep.iter().filter(|&&k| !k).count();
        if dropped == 0 {
            self.stale = self.count_stale();
            return Ok(false);
        }

        let mut packed = Vec::with_capacity(self.data_size);
        let mut offsets = Vec::with_capacity(n - dropped);
        let mut freed = Vec::new();
        for (idx, &kept) in keep.iter().enumerate() {
            let record = self.record(idx);
            if kept {
                let off = self.offsets[idx] as usize;
                offsets.push(packed.len() as u16);
                packed.extend_from_slice(&self.buf[off..off + record.encoded_len()]);
            } else if let Some(handle) = record.external_handle() {
                freed.push(handle);
            }
        }
        for handle in freed {
            self.externals.free(handle);
        }
        self.buf[..packed.len()].copy_from_slice(&packed);
        self.data_size = packed.len();
        self.offsets = offsets;
        self.stale = self.count_stale();
        trace!(dropped, remaining = self.record_count(), "Compacted data block");
        Ok(true)
    }

    // =========================================================================
    // Split / Merge
    // =========================================================================

    /// Position where a split would start the right half: the median,
    /// moved to the nearest key boundary so no run is cut in two.
    pub fn split_index(&self) -> Option<usize> {
        let n = self.record_count();
        if n < 2 {
            return None;
        }
        let mid = n / 2;
        let mut idx = mid;
        while idx < n && self.key_at(idx) == self.key_at(idx - 1) {
            idx += 1;
        }
        if idx == n {
            idx = mid;
            while idx > 0 && self.key_at(idx) == self.key_at(idx - 1) {
                idx -= 1;
            }
        }
        (idx > 0 && idx < n).then_some(idx)
    }

    /// First key of the right half a split would produce
    pub fn split_key(&self) -> Option<&[u8]> {
        self.split_index().map(|idx| self.key_at(idx))
    }

    /// Move the upper half of the records into a new block.
    ///
    /// Returns `None` when the block holds a single key. External bodies
    /// move with their records.
    pub fn split(&mut self, ctx: &EngineContext, force_compact: bool) -> Result<Option<DataBlock>> {
        if force_compact {
            self.compact(ctx, true)?;
        }
        let Some(idx) = self.split_index() else {
            return Ok(None);
        };
        let base = self.offsets[idx] as usize;
        let moved = self.data_size - base;
        let capacity = ctx
            .data_ladder()
            .fit(moved)
            .unwrap_or_else(|| ctx.data_ladder().max());
        let mut right = DataBlock::with_capacity(ctx, capacity)?;

        right.buf[..moved].copy_from_slice(&self.buf[base..self.data_size]);
        right.data_size = moved;
        right.offsets = self.offsets[idx..]
            .iter()
            .map(|&off| off - base as u16)
            .collect();
        let handles: Vec<u64> = (idx..self.record_count())
            .filter_map(|i| self.record(i).external_handle())
            .collect();
        for handle in handles {
            self.externals.transfer(handle, &mut right.externals);
        }

        let left_count = idx;
        self.offsets.truncate(left_count);
        self.data_size = base;
        self.stale = self.count_stale();
        right.stale = right.count_stale();
        if let Some(target) = ctx.data_ladder().fit(self.data_size) {
            if target < self.capacity() {
                self.buf.resize(target, self.data_size)?;
            }
        }

        debug!(
            left_records = self.record_count(),
            right_records = right.record_count(),
            "Split data block"
        );
        Ok(Some(right))
    }

    /// Append every record of `other`, whose keys must all be greater.
    ///
    /// Both blocks are compacted first; the merge only happens when the
    /// combined data stays below the maximum block size. On success
    /// `other` is left empty.
    pub fn merge(&mut self, ctx: &EngineContext, other: &mut DataBlock) -> Result<bool> {
        if self.stale > 0 {
            self.compact(ctx, true)?;
        }
        if other.stale > 0 {
            other.compact(ctx, true)?;
        }
        let total = self.data_size + other.data_size;
        if total >= ctx.config().max_data_block_size {
            return Ok(false);
        }
        if let (Some(last), Some(first)) = (self.last_key(), other.first_key()) {
            if last >= first {
                return Err(KvError::Corruption(
                    "merging data blocks out of key order".to_string(),
                ));
            }
        }
        if !self.fits(other.data_size) && !self.grow(ctx, total)? {
            return Ok(false);
        }

        let base = self.data_size;
        self.buf[base..total].copy_from_slice(&other.buf[..other.data_size]);
        self.offsets
            .extend(other.offsets.iter().map(|&off| off + base as u16));
        let handles: Vec<u64> = other
            .records()
            .filter_map(|record| record.external_handle())
            .collect();
        for handle in handles {
            other.externals.transfer(handle, &mut self.externals);
        }
        self.data_size = total;
        self.stale += other.stale;

        other.offsets.clear();
        other.data_size = 0;
        other.stale = 0;
        Ok(true)
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    /// Records other than the live newest version of their key
    fn count_stale(&self) -> usize {
        let n = self.record_count();
        let mut stale = 0;
        let mut start = 0;
        while start < n {
            let end = self.run_end(start);
            stale += end - start;
            if self.record(start).op() == OpType::Put {
                stale -= 1;
            }
            start = end;
        }
        stale
    }

    fn fits(&self, growth: usize) -> bool {
        self.data_size + growth <= self.capacity()
    }

    /// Grow along the size ladder to hold `total` bytes; false at the top
    fn grow(&mut self, ctx: &EngineContext, total: usize) -> Result<bool> {
        match ctx.data_ladder().fit(total) {
            Some(capacity) => {
                self.buf.resize(capacity, self.data_size)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn place(&mut self, key: &[u8], value: &[u8], class: AllocClass) -> Result<Placement> {
        Ok(match class {
            AllocClass::Embedded => Placement::Embedded,
            AllocClass::ExternalValue => Placement::ExternalValue {
                handle: self.externals.allocate(&[value])?,
            },
            AllocClass::ExternalKeyValue => {
                let key_len = (key.len() as u32).to_be_bytes();
                Placement::ExternalKeyValue {
                    handle: self.externals.allocate(&[&key_len, key, value])?,
                    len: (4 + key.len() + value.len()) as u32,
                }
            }
        })
    }

    fn overwrite_in_place(&mut self, idx: usize, value: &[u8], seq: SeqId, expire: u64) -> Result<()> {
        let record = self.record(idx);
        let off = self.offsets[idx] as usize;
        let seq_at = off + record.seq_offset();
        let class = record.class();
        let handle = record.external_handle();
        let key_len = record.key_size();

        match class {
            AllocClass::Embedded => {
                let at = seq_at + SEQ_SIZE + 1;
                self.buf[at..at + value.len()].copy_from_slice(value);
            }
            AllocClass::ExternalValue | AllocClass::ExternalKeyValue => {
                let body = handle
                    .and_then(|h| self.externals.get_mut(h))
                    .ok_or_else(|| KvError::Corruption("dangling external handle".to_string()))?;
                let skip = if class == AllocClass::ExternalKeyValue {
                    4 + key_len
                } else {
                    0
                };
                body[skip..].copy_from_slice(value);
            }
        }
        self.buf[seq_at..seq_at + SEQ_SIZE].copy_from_slice(&seq.to_be_bytes());
        self.buf[off + 4..off + 12].copy_from_slice(&expire.to_be_bytes());
        Ok(())
    }

    fn insert_at(&mut self, idx: usize, record: &NewRecord<'_>, placement: Placement) {
        let len = placement
            .class()
            .encoded_len(record.key.len(), record.value.len());
        let off = self
            .offsets
            .get(idx)
            .map_or(self.data_size, |&o| o as usize);
        self.buf.copy_within(off..self.data_size, off + len);
        write_record(&mut self.buf[off..off + len], record, placement);
        self.offsets.insert(idx, off as u16);
        for o in &mut self.offsets[idx + 1..] {
            *o += len as u16;
        }
        self.data_size += len;
    }

    fn remove_range(&mut self, start: usize, end: usize) {
        if start >= end {
            return;
        }
        let handles: Vec<u64> = (start..end)
            .filter_map(|idx| self.record(idx).external_handle())
            .collect();
        for handle in handles {
            self.externals.free(handle);
        }
        let from = self.offsets[start] as usize;
        let to = self
            .offsets
            .get(end)
            .map_or(self.data_size, |&o| o as usize);
        let len = to - from;
        self.buf.copy_within(to..self.data_size, from);
        self.offsets.drain(start..end);
        for o in &mut self.offsets[start..] {
            *o -= len as u16;
        }
        self.data_size -= len;
    }
}
