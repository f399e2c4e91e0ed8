//! Index Block
//!
//! A sorted list of entries, one per data block, routing keys to blocks.
//!
//! ## Entry Layout
//! All integers are big-endian.
//! ```text
//! inline key:    [keylen:2][kind=0:1][slot:4][key bytes]
//! external key:  [0:2]     [kind=1:1][slot:4][keylen:4][handle:8]
//! ```
//!
//! The entry key of a data block is that block's first key, so the entry
//! responsible for a key is the last entry whose key is `<=` it. The
//! anchor index block (the one covering the smallest keys) keeps an entry
//! with the empty key at position 0 that is never removed, which makes
//! that lookup total.
//!
//! Data blocks live in a slab owned by the index block; the `slot` field
//! of an entry is the slab index.

use bytes::{Buf, BufMut};
use tracing::{debug, error, warn};

use super::data::{DataBlock, DeleteStatus, PutStatus};
use crate::context::EngineContext;
use crate::error::{KvError, Result};
use crate::memory::{BlockBuffer, ExternalStore};
use crate::record::RecordView;
use crate::version::{SeqId, SnapshotId};

const ENTRY_HEADER: usize = 7;
const EXTERNAL_KEY_REF: usize = 12;
const KIND_INLINE: u8 = 0;
const KIND_EXTERNAL: u8 = 1;

/// Outcome of [`IndexBlock::put`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexPut {
    Stored,
    /// A data block must split but there is no room for its entry
    IndexFull,
}

/// Outcome of [`IndexBlock::delete`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexDelete {
    NotFound,
    Deleted,
    /// The delete may rewrite an entry key and there is no room to do so;
    /// the index block must be split before retrying
    ParentSplitRequired,
}

/// Outcome of [`IndexBlock::delete_range`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeDelete {
    pub deleted: usize,
    /// Set when the index block ran out of room part way; the caller must
    /// split it and continue from this key
    pub resume: Option<Vec<u8>>,
}

enum SplitOutcome {
    Split,
    IndexFull,
    Unsplittable,
}

enum RangeStop {
    IndexFull(Vec<u8>),
    SplitBlock(u32, Vec<u8>),
}

/// An entry key ready to be written: inline bytes or an allocated body
#[derive(Clone, Copy)]
enum EntryKey<'k> {
    Inline(&'k [u8]),
    External { handle: u64, len: usize },
}

/// Routing table for a contiguous key range
#[derive(Debug)]
pub struct IndexBlock {
    buf: BlockBuffer,
    data_size: usize,
    offsets: Vec<u16>,
    blocks: Vec<Option<DataBlock>>,
    free_slots: Vec<u32>,
    externals: ExternalStore,
    first_key: Vec<u8>,
    anchor: bool,
    key_threshold: usize,
}

impl IndexBlock {
    // =========================================================================
    // Construction
    // =========================================================================

    fn empty(ctx: &EngineContext, anchor: bool, capacity: usize) -> Result<Self> {
        Ok(Self {
            buf: BlockBuffer::allocate(ctx.memory(), capacity)?,
            data_size: 0,
            offsets: Vec::new(),
            blocks: Vec::new(),
            free_slots: Vec::new(),
            externals: ExternalStore::new(ctx.memory()),
            first_key: Vec::new(),
            anchor,
            key_threshold: ctx.config().index_key_threshold(),
        })
    }

    /// The index block covering the smallest keys: one empty data block
    /// under the empty key
    pub fn new_anchor(ctx: &EngineContext) -> Result<Self> {
        let mut index = Self::empty(ctx, true, ctx.index_ladder().smallest())?;
        let data = DataBlock::new(ctx)?;
        let slot = index.store_block(data);
        index.insert_entry(0, &[], slot)?;
        Ok(index)
    }

    /// A non-anchor index block holding a single record
    pub fn with_record(
        ctx: &EngineContext,
        key: &[u8],
        value: &[u8],
        seq: SeqId,
        expire: u64,
    ) -> Result<Self> {
        let mut index = Self::empty(ctx, false, ctx.index_ladder().smallest())?;
        let mut data = DataBlock::new(ctx)?;
        if data.put(ctx, key, value, seq, expire)? == PutStatus::NoRoom {
            return Err(KvError::CapacityExhausted(
                "record does not fit an empty data block".to_string(),
            ));
        }
        let slot = index.store_block(data);
        index.insert_entry(0, key, slot)?;
        index.refresh_first_key();
        Ok(index)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn is_anchor(&self) -> bool {
        self.anchor
    }

    /// Smallest key this block is responsible for (empty for the anchor)
    pub fn first_key(&self) -> &[u8] {
        &self.first_key
    }

    pub fn entry_count(&self) -> usize {
        self.offsets.len()
    }

    pub fn data_size(&self) -> usize {
        self.data_size
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Record versions across all data blocks
    pub fn record_count(&self) -> usize {
        self.blocks.iter().flatten().map(DataBlock::record_count).sum()
    }

    /// External allocations owned by this block and its data blocks
    pub fn external_count(&self) -> usize {
        self.externals.len()
            + self
                .blocks
                .iter()
                .flatten()
                .map(DataBlock::external_count)
                .sum::<usize>()
    }

    /// Largest key stored in any data block
    pub fn max_key(&self) -> Option<&[u8]> {
        (0..self.entry_count())
            .rev()
            .find_map(|pos| self.data_block(pos).and_then(DataBlock::last_key))
    }

    pub fn entry_key(&self, pos: usize) -> &[u8] {
        let off = self.offsets[pos] as usize;
        let mut header = &self.buf[off..off + ENTRY_HEADER];
        let key_len = header.get_u16() as usize;
        let kind = header.get_u8();
        let body = off + ENTRY_HEADER;
        if kind == KIND_EXTERNAL {
            let handle = (&self.buf[body + 4..body + EXTERNAL_KEY_REF]).get_u64();
            let key = self.externals.get(handle);
            debug_assert!(key.is_some(), "dangling external handle {}", handle);
            key.unwrap_or_else(|| {
                error!(handle, pos, "Index entry key points at a freed allocation");
                &[]
            })
        } else {
            &self.buf[body..body + key_len]
        }
    }

    fn entry_slot(&self, pos: usize) -> u32 {
        let off = self.offsets[pos] as usize;
        (&self.buf[off + 3..off + ENTRY_HEADER]).get_u32()
    }

    fn entry_handle(&self, pos: usize) -> Option<u64> {
        let off = self.offsets[pos] as usize;
        if self.buf[off + 2] != KIND_EXTERNAL {
            return None;
        }
        let body = off + ENTRY_HEADER;
        Some((&self.buf[body + 4..body + EXTERNAL_KEY_REF]).get_u64())
    }

    fn entry_len_at(&self, pos: usize) -> usize {
        let off = self.offsets[pos] as usize;
        let end = self
            .offsets
            .get(pos + 1)
            .map_or(self.data_size, |&o| o as usize);
        end - off
    }

    fn entry_len(&self, key_len: usize) -> usize {
        if key_len >= self.key_threshold {
            ENTRY_HEADER + EXTERNAL_KEY_REF
        } else {
            ENTRY_HEADER + key_len
        }
    }

    /// Largest size any single entry can take
    pub fn max_entry_len(&self) -> usize {
        ENTRY_HEADER + (self.key_threshold - 1).max(EXTERNAL_KEY_REF)
    }

    /// Position of the entry responsible for `key`
    pub fn locate(&self, key: &[u8]) -> usize {
        let (mut lo, mut hi) = (0, self.entry_count());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.entry_key(mid) <= key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo.saturating_sub(1)
    }

    pub fn data_block(&self, pos: usize) -> Option<&DataBlock> {
        let slot = self.entry_slot(pos) as usize;
        self.blocks.get(slot).and_then(Option::as_ref)
    }

    fn data_block_mut(&mut self, pos: usize) -> Result<&mut DataBlock> {
        let slot = self.entry_slot(pos);
        self.slot_mut(slot)
    }

    fn slot_mut(&mut self, slot: u32) -> Result<&mut DataBlock> {
        self.blocks
            .get_mut(slot as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| KvError::Corruption(format!("index entry points at empty slot {}", slot)))
    }

    fn tracks_first_key(&self, pos: usize) -> bool {
        !(self.anchor && pos == 0)
    }

    // =========================================================================
    // Point Operations
    // =========================================================================

    /// Visible version of `key` at `snapshot`
    pub fn get(&self, key: &[u8], snapshot: SnapshotId) -> Option<RecordView<'_>> {
        if self.entry_count() == 0 {
            return None;
        }
        self.data_block(self.locate(key))?.get(key, snapshot)
    }

    pub fn get_expire(&self, key: &[u8]) -> Option<u64> {
        if self.entry_count() == 0 {
            return None;
        }
        self.data_block(self.locate(key))?.get_expire(key)
    }

    pub fn set_expire(&mut self, key: &[u8], expire: u64) -> Result<bool> {
        if self.entry_count() == 0 {
            return Ok(false);
        }
        let pos = self.locate(key);
        Ok(self.data_block_mut(pos)?.set_expire(key, expire))
    }

    /// Store `key` in the responsible data block, splitting it when full
    pub fn put(
        &mut self,
        ctx: &EngineContext,
        key: &[u8],
        value: &[u8],
        seq: SeqId,
        expire: u64,
    ) -> Result<IndexPut> {
        loop {
            let pos = self.locate(key);
            match self.data_block_mut(pos)?.put(ctx, key, value, seq, expire)? {
                PutStatus::Inserted | PutStatus::Updated => {
                    // compaction inside the data block can retire its first key
                    if self.tracks_first_key(pos) {
                        self.after_write("resync entry key", |index| index.sync_first_key(ctx, pos))?;
                        self.refresh_first_key();
                    }
                    return Ok(IndexPut::Stored);
                }
                PutStatus::NoRoom => match self.split_data_block(ctx, pos)? {
                    SplitOutcome::Split => continue,
                    SplitOutcome::IndexFull => return Ok(IndexPut::IndexFull),
                    SplitOutcome::Unsplittable => {
                        return Err(KvError::CapacityExhausted(
                            "data block holds a single key and cannot split".to_string(),
                        ))
                    }
                },
            }
        }
    }

    /// Delete `key` and tidy up the data block it lived in
    pub fn delete(&mut self, ctx: &EngineContext, key: &[u8], seq: SeqId) -> Result<IndexDelete> {
        loop {
            let pos = self.locate(key);
            if self.tracks_first_key(pos) {
                let block_first = self.data_block(pos).and_then(DataBlock::first_key);
                let may_rekey = block_first == Some(key) || block_first != Some(self.entry_key(pos));
                if may_rekey && !self.ensure_room(ctx, self.max_entry_len())? {
                    return Ok(IndexDelete::ParentSplitRequired);
                }
            }
            let block = self.data_block_mut(pos)?;
            let records_before = block.record_count();
            match block.delete(ctx, key, seq)? {
                DeleteStatus::NotFound => {
                    // compaction may have run even though the key was absent
                    if self.data_block(pos).map_or(0, DataBlock::record_count) != records_before {
                        self.settle(ctx, pos)?;
                    }
                    return Ok(IndexDelete::NotFound);
                }
                DeleteStatus::Removed | DeleteStatus::Tombstoned => {
                    self.settle(ctx, pos)?;
                    return Ok(IndexDelete::Deleted);
                }
                DeleteStatus::NoRoom => match self.split_data_block(ctx, pos)? {
                    SplitOutcome::Split => continue,
                    SplitOutcome::IndexFull => return Ok(IndexDelete::ParentSplitRequired),
                    SplitOutcome::Unsplittable => {
                        return Err(KvError::CapacityExhausted(
                            "no room for a tombstone in a single-key data block".to_string(),
                        ))
                    }
                },
            }
        }
    }

    /// Delete every live key in `[start, end)` held by this block.
    ///
    /// Entry rewrites and removals are collected while walking the data
    /// blocks and applied at the end, once enough room is known to exist.
    pub fn delete_range(
        &mut self,
        ctx: &EngineContext,
        start: &[u8],
        end: &[u8],
        seq: SeqId,
    ) -> Result<RangeDelete> {
        let mut deleted = 0;
        let mut cursor = start.to_vec();
        loop {
            let mut pending_update = Vec::new();
            let mut pending_remove = Vec::new();
            let mut stop = None;

            let mut pos = self.locate(&cursor);
            while pos < self.entry_count() {
                if self.tracks_first_key(pos) && self.entry_key(pos) >= end {
                    break;
                }
                let headroom = (pending_update.len() + 1) * self.max_entry_len();
                if !self.ensure_room(ctx, headroom)? {
                    let at = self.entry_key(pos).max(cursor.as_slice()).to_vec();
                    stop = Some(RangeStop::IndexFull(at));
                    break;
                }
                let slot = self.entry_slot(pos);
                let block = self.slot_mut(slot)?;
                let first_before = block.first_key().map(<[u8]>::to_vec);
                let (count, stuck) = block.delete_keys_in(ctx, &cursor, end, seq)?;
                deleted += count;
                if block.is_empty() {
                    pending_remove.push(slot);
                } else if block.first_key() != first_before.as_deref() {
                    pending_update.push(slot);
                }
                if let Some(key) = stuck {
                    stop = Some(RangeStop::SplitBlock(slot, key));
                    break;
                }
                pos += 1;
            }
            self.apply_pending(ctx, &pending_update, &pending_remove)?;

            match stop {
                None => break,
                Some(RangeStop::IndexFull(at)) => {
                    self.refresh_first_key();
                    return Ok(RangeDelete {
                        deleted,
                        resume: Some(at),
                    });
                }
                Some(RangeStop::SplitBlock(slot, key)) => {
                    let pos = self.position_of_slot(slot).ok_or_else(|| {
                        KvError::Corruption("data block vanished during range delete".to_string())
                    })?;
                    match self.split_data_block(ctx, pos)? {
                        SplitOutcome::Split => cursor = key,
                        SplitOutcome::IndexFull => {
                            self.refresh_first_key();
                            return Ok(RangeDelete {
                                deleted,
                                resume: Some(key),
                            });
                        }
                        SplitOutcome::Unsplittable => {
                            return Err(KvError::CapacityExhausted(
                                "no room for a tombstone in a single-key data block".to_string(),
                            ))
                        }
                    }
                }
            }
        }
        self.refresh_first_key();
        Ok(RangeDelete {
            deleted,
            resume: None,
        })
    }

    // =========================================================================
    // Split / Merge
    // =========================================================================

    /// Move the upper half of the entries (and their data blocks) into a
    /// new, non-anchor index block. `None` with fewer than two entries.
    pub fn split(&mut self, ctx: &EngineContext) -> Result<Option<IndexBlock>> {
        let n = self.entry_count();
        if n < 2 {
            return Ok(None);
        }
        let mid = n / 2;
        if (mid..n).any(|pos| self.data_block(pos).is_none()) {
            return Err(KvError::Corruption(
                "index entry without a data block".to_string(),
            ));
        }
        let moved = self.data_size - self.offsets[mid] as usize;
        let capacity = ctx
            .index_ladder()
            .fit(moved)
            .unwrap_or_else(|| ctx.index_ladder().max());
        let mut right = IndexBlock::empty(ctx, false, capacity)?;

        let keys: Vec<Vec<u8>> = (mid..n).map(|pos| self.entry_key(pos).to_vec()).collect();
        let mut prepared = Vec::with_capacity(keys.len());
        for key in &keys {
            prepared.push(right.prepare_key(key)?);
        }
        for (i, key) in prepared.into_iter().enumerate() {
            let slot = self.entry_slot(mid + i);
            if let Some(block) = self.release_slot(slot) {
                let new_slot = right.store_block(block);
                right.write_entry(i, key, new_slot);
            }
        }
        self.truncate_entries(mid);
        if let Some(target) = ctx.index_ladder().fit(self.data_size) {
            if target < self.capacity() {
                self.buf.resize(target, self.data_size)?;
            }
        }
        right.refresh_first_key();

        debug!(
            left_entries = self.entry_count(),
            right_entries = right.entry_count(),
            "Split index block"
        );
        Ok(Some(right))
    }

    /// Absorb every entry of `other`, the next index block in key order.
    /// On success `other` is left without entries.
    pub fn merge(&mut self, ctx: &EngineContext, other: &mut IndexBlock) -> Result<bool> {
        if other.anchor || self.data_size + other.data_size > ctx.config().max_index_block_size {
            return Ok(false);
        }
        if (0..other.entry_count()).any(|pos| other.data_block(pos).is_none()) {
            return Err(KvError::Corruption(
                "index entry without a data block".to_string(),
            ));
        }
        if !self.ensure_room(ctx, other.data_size)? {
            return Ok(false);
        }

        let keys: Vec<Vec<u8>> = (0..other.entry_count())
            .map(|pos| other.entry_key(pos).to_vec())
            .collect();
        let mut prepared = Vec::with_capacity(keys.len());
        for key in &keys {
            match self.prepare_key(key) {
                Ok(key) => prepared.push(key),
                Err(e) => {
                    self.discard_prepared(prepared);
                    return Err(e);
                }
            }
        }
        let base = self.entry_count();
        for (i, key) in prepared.into_iter().enumerate() {
            let slot = other.entry_slot(i);
            if let Some(block) = other.release_slot(slot) {
                let new_slot = self.store_block(block);
                self.write_entry(base + i, key, new_slot);
            }
        }
        other.truncate_entries(0);
        self.refresh_first_key();
        Ok(true)
    }

    /// Drop every entry and data block and give the buffer back to the
    /// budget. Used once the block has been unpublished.
    pub(crate) fn clear(&mut self) -> Result<()> {
        self.truncate_entries(0);
        self.blocks.clear();
        self.free_slots.clear();
        self.buf.resize(0, 0)
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    fn split_data_block(&mut self, ctx: &EngineContext, pos: usize) -> Result<SplitOutcome> {
        let key = match self.data_block(pos).and_then(DataBlock::split_key) {
            Some(key) => key.to_vec(),
            None => return Ok(SplitOutcome::Unsplittable),
        };
        if !self.ensure_room(ctx, self.entry_len(key.len()))? {
            return Ok(SplitOutcome::IndexFull);
        }
        let prepared = self.prepare_key(&key)?;
        let right = match self.data_block_mut(pos)?.split(ctx, false) {
            Ok(Some(right)) => right,
            Ok(None) => {
                self.discard_prepared(vec![prepared]);
                return Ok(SplitOutcome::Unsplittable);
            }
            Err(e) => {
                self.discard_prepared(vec![prepared]);
                return Err(e);
            }
        };
        let slot = self.store_block(right);
        self.write_entry(pos + 1, prepared, slot);
        Ok(SplitOutcome::Split)
    }

    /// Remove an emptied data block, or resync its entry key and try to
    /// fold its right neighbour into it
    fn settle(&mut self, ctx: &EngineContext, pos: usize) -> Result<()> {
        let empty = self.data_block(pos).map_or(true, DataBlock::is_empty);
        if empty && self.tracks_first_key(pos) {
            self.remove_entry(pos);
        } else {
            self.after_write("resync entry key", |index| index.sync_first_key(ctx, pos))?;
            self.after_write("merge data blocks", |index| index.try_merge_right(ctx, pos))?;
        }
        self.refresh_first_key();
        Ok(())
    }

    fn try_merge_right(&mut self, ctx: &EngineContext, pos: usize) -> Result<bool> {
        if pos + 1 >= self.entry_count() {
            return Ok(false);
        }
        let left_size = self.data_block(pos).map_or(0, DataBlock::data_size);
        let right_size = self.data_block(pos + 1).map_or(0, DataBlock::data_size);
        if left_size + right_size >= ctx.config().max_data_block_size {
            return Ok(false);
        }
        let right_slot = self.entry_slot(pos + 1);
        let Some(mut right) = self
            .blocks
            .get_mut(right_slot as usize)
            .and_then(Option::take)
        else {
            return Err(KvError::Corruption(format!(
                "index entry points at empty slot {}",
                right_slot
            )));
        };
        let outcome = match self.data_block_mut(pos) {
            Ok(left) => left.merge(ctx, &mut right),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(true) => {
                let slot = self.drop_entry(pos + 1);
                self.release_slot(slot);
                Ok(true)
            }
            other => {
                self.blocks[right_slot as usize] = Some(right);
                other
            }
        }
    }

    /// Make the entry key at `pos` equal its data block's first key.
    /// False when the rewrite needs room the block cannot provide; the
    /// stale entry key still routes correctly since it is smaller.
    fn sync_first_key(&mut self, ctx: &EngineContext, pos: usize) -> Result<bool> {
        if !self.tracks_first_key(pos) {
            return Ok(true);
        }
        let first = match self.data_block(pos).and_then(DataBlock::first_key) {
            Some(first) if first != self.entry_key(pos) => first.to_vec(),
            _ => return Ok(true),
        };
        let old_len = self.entry_len_at(pos);
        let new_len = self.entry_len(first.len());
        if new_len > old_len && !self.ensure_room(ctx, new_len - old_len)? {
            debug!("No room to resync index entry key");
            return Ok(false);
        }
        let prepared = self.prepare_key(&first)?;
        let slot = self.drop_entry(pos);
        self.write_entry(pos, prepared, slot);
        Ok(true)
    }

    fn apply_pending(&mut self, ctx: &EngineContext, update: &[u32], remove: &[u32]) -> Result<()> {
        for &slot in remove {
            if let Some(pos) = self.position_of_slot(slot) {
                if self.tracks_first_key(pos) {
                    self.remove_entry(pos);
                }
            }
        }
        for &slot in update {
            if let Some(pos) = self.position_of_slot(slot) {
                self.after_write("resync entry key", |index| index.sync_first_key(ctx, pos))?;
            }
        }
        Ok(())
    }

    /// Bookkeeping that follows a write which already landed. Running out
    /// of memory leaves the block routable, so it is logged and skipped.
    fn after_write(
        &mut self,
        step: &str,
        f: impl FnOnce(&mut Self) -> Result<bool>,
    ) -> Result<bool> {
        match f(self) {
            Ok(done) => Ok(done),
            Err(e) if e.is_capacity() => {
                warn!(step, error = %e, "Skipped index bookkeeping after write");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn position_of_slot(&self, slot: u32) -> Option<usize> {
        (0..self.entry_count()).find(|&pos| self.entry_slot(pos) == slot)
    }

    fn refresh_first_key(&mut self) {
        if self.anchor {
            self.first_key.clear();
        } else if self.entry_count() > 0 {
            self.first_key = self.entry_key(0).to_vec();
        }
    }

    /// Grow along the size ladder until `growth` more bytes fit
    fn ensure_room(&mut self, ctx: &EngineContext, growth: usize) -> Result<bool> {
        let needed = self.data_size + growth;
        if needed <= self.capacity() {
            return Ok(true);
        }
        match ctx.index_ladder().fit(needed) {
            Some(capacity) => {
                self.buf.resize(capacity, self.data_size)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn store_block(&mut self, block: DataBlock) -> u32 {
        match self.free_slots.pop() {
            Some(slot) => {
                self.blocks[slot as usize] = Some(block);
                slot
            }
            None => {
                self.blocks.push(Some(block));
                (self.blocks.len() - 1) as u32
            }
        }
    }

    fn release_slot(&mut self, slot: u32) -> Option<DataBlock> {
        let block = self.blocks.get_mut(slot as usize)?.take();
        self.free_slots.push(slot);
        block
    }

    fn prepare_key<'k>(&mut self, key: &'k [u8]) -> Result<EntryKey<'k>> {
        if key.len() >= self.key_threshold {
            let handle = self.externals.allocate(&[key])?;
            Ok(EntryKey::External {
                handle,
                len: key.len(),
            })
        } else {
            Ok(EntryKey::Inline(key))
        }
    }

    fn discard_prepared(&mut self, prepared: Vec<EntryKey<'_>>) {
        for key in prepared {
            if let EntryKey::External { handle, .. } = key {
                self.externals.free(handle);
            }
        }
    }

    fn insert_entry(&mut self, pos: usize, key: &[u8], slot: u32) -> Result<()> {
        if self.data_size + self.entry_len(key.len()) > self.capacity() {
            return Err(KvError::Corruption(
                "index entry inserted without room".to_string(),
            ));
        }
        let prepared = self.prepare_key(key)?;
        self.write_entry(pos, prepared, slot);
        Ok(())
    }

    /// Write an entry whose room has already been ensured
    fn write_entry(&mut self, pos: usize, key: EntryKey<'_>, slot: u32) {
        let len = match key {
            EntryKey::Inline(bytes) => ENTRY_HEADER + bytes.len(),
            EntryKey::External { .. } => ENTRY_HEADER + EXTERNAL_KEY_REF,
        };
        debug_assert!(self.data_size + len <= self.capacity());
        let off = self
            .offsets
            .get(pos)
            .map_or(self.data_size, |&o| o as usize);
        self.buf.copy_within(off..self.data_size, off + len);

        let mut out: &mut [u8] = &mut self.buf[off..off + len];
        match key {
            EntryKey::Inline(bytes) => {
                out.put_u16(bytes.len() as u16);
                out.put_u8(KIND_INLINE);
                out.put_u32(slot);
                out.put_slice(bytes);
            }
            EntryKey::External { handle, len } => {
                out.put_u16(0);
                out.put_u8(KIND_EXTERNAL);
                out.put_u32(slot);
                out.put_u32(len as u32);
                out.put_u64(handle);
            }
        }

        self.offsets.insert(pos, off as u16);
        for o in &mut self.offsets[pos + 1..] {
            *o += len as u16;
        }
        self.data_size += len;
    }

    /// Remove the entry bytes at `pos`, returning its slot
    fn drop_entry(&mut self, pos: usize) -> u32 {
        let slot = self.entry_slot(pos);
        if let Some(handle) = self.entry_handle(pos) {
            self.externals.free(handle);
        }
        let off = self.offsets[pos] as usize;
        let len = self.entry_len_at(pos);
        self.buf.copy_within(off + len..self.data_size, off);
        self.offsets.remove(pos);
        for o in &mut self.offsets[pos..] {
            *o -= len as u16;
        }
        self.data_size -= len;
        slot
    }

    fn remove_entry(&mut self, pos: usize) -> Option<DataBlock> {
        let slot = self.drop_entry(pos);
        self.release_slot(slot)
    }

    /// Drop every entry from `pos` on; their slots must already be released
    fn truncate_entries(&mut self, pos: usize) {
        let handles: Vec<u64> = (pos..self.entry_count())
            .filter_map(|p| self.entry_handle(p))
            .collect();
        for handle in handles {
            self.externals.free(handle);
        }
        self.data_size = self
            .offsets
            .get(pos)
            .map_or(self.data_size, |&o| o as usize);
        self.offsets.truncate(pos);
    }
}
