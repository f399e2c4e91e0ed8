//! Engine Module
//!
//! The ordered map of index blocks and the public key/value API.
//!
//! ## Responsibilities
//! - Route every key to the index block with the greatest first key `<=` it
//! - Serialize writers per index block through striped locks
//! - Keep the map consistent while index blocks split, merge, change their
//!   first key or disappear
//! - Own snapshot creation and release
//!
//! ## Concurrency Model: Optimistic Routing
//!
//! - **Writes** (put/delete/delete_range/set_expire):
//!   1. Floor lookup in the lock-free skip map
//!   2. Lock the block's stripe, then take its write lock
//!   3. Re-check that the block is still valid, unchanged and still the
//!      floor for the key; otherwise drop everything and retry
//!
//! - **Reads** (get/exists/scanners): take the block's read lock and check
//!   validity. The floor is only re-verified when the block changed shape
//!   within the last `unsafe_modification_window_ms`.
//!
//! Structural changes (new sibling after a split, rekey, removal) are
//! published to the map while the affected block's write lock is held.

use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::utils::Backoff;
use crossbeam_skiplist::SkipMap;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{MutexGuard, RawRwLock, RwLock};
use tracing::{debug, error, info, trace, warn};

use crate::block::{IndexBlock, IndexDelete, IndexPut};
use crate::config::Config;
use crate::context::EngineContext;
use crate::error::{KvError, OpError, OpResult, Result};
use crate::scanner::{RawScanner, Scanner};
use crate::version::{SnapshotId, LATEST};

pub(crate) type ReadGuard = ArcRwLockReadGuard<RawRwLock, IndexBlock>;
type WriteGuard = ArcRwLockWriteGuard<RawRwLock, IndexBlock>;

/// Largest combined key and value length a record can describe
const MAX_RECORD_BYTES: usize = u32::MAX as usize - 4;

// =============================================================================
// Index Slot
// =============================================================================

/// One index block as published in the engine map
#[derive(Debug)]
pub(crate) struct IndexSlot {
    id: u64,
    block: Arc<RwLock<IndexBlock>>,
    valid: AtomicBool,
    generation: AtomicU64,
    /// Milliseconds (engine clock) of the last split or rekey
    last_unsafe_mod: AtomicU64,
}

impl IndexSlot {
    fn new(id: u64, block: IndexBlock, now: u64) -> Self {
        Self {
            id,
            block: Arc::new(RwLock::new(block)),
            valid: AtomicBool::new(true),
            generation: AtomicU64::new(0),
            last_unsafe_mod: AtomicU64::new(now),
        }
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn touch(&self, now: u64) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.last_unsafe_mod.store(now, Ordering::Release);
    }

    fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn recently_modified(&self, now: u64, window: u64) -> bool {
        now.saturating_sub(self.last_unsafe_mod.load(Ordering::Acquire)) <= window
    }
}

/// Exclusive access to one index block: its stripe plus its write lock.
/// Field order releases the block lock before the stripe.
struct WriteAccess<'a> {
    block: WriteGuard,
    slot: Arc<IndexSlot>,
    _stripe: MutexGuard<'a, ()>,
}

// =============================================================================
// Statistics
// =============================================================================

/// Point-in-time structural counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapStats {
    pub index_blocks: usize,
    pub data_blocks: usize,
    /// Record versions, including stale versions and tombstones
    pub records: usize,
    pub external_allocations: usize,
    pub memory_allocated: u64,
    pub active_snapshots: usize,
}

struct RangeStep {
    deleted: usize,
    next: Option<Vec<u8>>,
}

// =============================================================================
// BigSortedMap
// =============================================================================

/// An ordered, in-memory, multi-versioned key/value map
///
/// All operations take `&self`; share the map between threads with an
/// `Arc` or scoped threads.
pub struct BigSortedMap {
    ctx: EngineContext,
    index: SkipMap<Vec<u8>, Arc<IndexSlot>>,
    next_slot_id: AtomicU64,
}

impl BigSortedMap {
    /// Open an empty map with the given config
    ///
    /// On startup:
    /// 1. Validate the config and build the engine context
    /// 2. Create the anchor index block, which covers the empty key
    pub fn open(config: Config) -> Result<Self> {
        let map = Self {
            ctx: EngineContext::new(config)?,
            index: SkipMap::new(),
            next_slot_id: AtomicU64::new(0),
        };
        map.register(IndexBlock::new_anchor(&map.ctx)?);
        info!(
            max_data_block_size = map.ctx.config().max_data_block_size,
            max_index_block_size = map.ctx.config().max_index_block_size,
            max_memory = map.ctx.config().max_memory,
            "Opened sorted map"
        );
        Ok(map)
    }

    /// Open with the default config overlaid by `SORTEDKV_*` variables
    pub fn open_from_env() -> Result<Self> {
        Self::open(Config::from_env()?)
    }

    // =========================================================================
    // Point Operations
    // =========================================================================

    /// Insert or update a key
    ///
    /// Returns `Ok(false)` when the memory budget or block capacity does not
    /// allow the write; the key is not written in that case.
    pub fn put(&self, key: &[u8], value: &[u8], expire_at: u64) -> Result<bool> {
        validate_key(key)?;
        if key.len() + value.len() > MAX_RECORD_BYTES {
            return Err(KvError::InvalidArgument(format!(
                "record of {} bytes is too large",
                key.len() + value.len()
            )));
        }
        match self.run(|| self.try_put(key, value, expire_at)) {
            Ok(()) => Ok(true),
            Err(e) if e.is_capacity() => {
                warn!(key_len = key.len(), value_len = value.len(), error = %e, "Put rejected");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Newest value of `key`
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_at(key, LATEST)
    }

    /// Value of `key` as seen by snapshot `version`
    pub fn get_at(&self, key: &[u8], version: SnapshotId) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        self.run(|| {
            let (_, guard) = self.acquire_read(key)?;
            Ok(guard.get(key, version).map(|record| record.value().to_vec()))
        })
    }

    /// Copy the newest value of `key` into `buf`.
    ///
    /// Returns the value's size; the copy only happens when it fits, so a
    /// size larger than `buf.len()` tells the caller how much to allocate.
    pub fn get_into(&self, key: &[u8], buf: &mut [u8]) -> Result<Option<usize>> {
        validate_key(key)?;
        self.run(|| {
            let (_, guard) = self.acquire_read(key)?;
            Ok(guard.get(key, LATEST).map(|record| {
                let value = record.value();
                if value.len() <= buf.len() {
                    buf[..value.len()].copy_from_slice(value);
                }
                value.len()
            }))
        })
    }

    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        validate_key(key)?;
        self.run(|| {
            let (_, guard) = self.acquire_read(key)?;
            Ok(guard.get(key, LATEST).is_some())
        })
    }

    /// Delete a key; false if it had no live value
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        validate_key(key)?;
        self.run(|| self.try_delete(key))
    }

    /// Delete every key in `[start, end)`, returning how many were deleted
    ///
    /// Steps:
    /// 1. Delete the range within the index block holding the cursor
    /// 2. Split that block first if it ran out of room, then resume
    /// 3. Move the cursor to the next index block until `end` is passed
    pub fn delete_range(&self, start: &[u8], end: &[u8]) -> Result<usize> {
        validate_key(start)?;
        if start >= end {
            return Ok(0);
        }
        let mut cursor = start.to_vec();
        let mut total = 0;
        loop {
            let step = self.run(|| self.try_delete_range(&cursor, end))?;
            total += step.deleted;
            match step.next {
                Some(next) => cursor = next,
                None => break,
            }
        }
        debug!(deleted = total, "Deleted key range");
        Ok(total)
    }

    /// Expiration time stored with the newest value of `key`
    pub fn get_expire(&self, key: &[u8]) -> Result<Option<u64>> {
        validate_key(key)?;
        self.run(|| {
            let (_, guard) = self.acquire_read(key)?;
            Ok(guard.get_expire(key))
        })
    }

    /// Replace the expiration time of the newest value of `key`
    pub fn set_expire(&self, key: &[u8], expire_at: u64) -> Result<bool> {
        validate_key(key)?;
        self.run(|| {
            let mut access = self.acquire_write(key)?;
            Ok(access.block.set_expire(key, expire_at)?)
        })
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Freeze the current view; reads at the returned id ignore later writes
    pub fn create_snapshot(&self) -> SnapshotId {
        let id = self.ctx.versions().create_snapshot();
        trace!(snapshot = id, "Created snapshot");
        id
    }

    pub fn release_snapshot(&self, id: SnapshotId) -> bool {
        self.ctx.versions().release_snapshot(id)
    }

    pub fn oldest_snapshot(&self) -> Option<SnapshotId> {
        self.ctx.versions().oldest_active()
    }

    pub fn newest_snapshot(&self) -> Option<SnapshotId> {
        self.ctx.versions().newest_active()
    }

    // =========================================================================
    // Scanners
    // =========================================================================

    /// Ascending scan over `[start, stop)`; `None` leaves a side open
    pub fn scanner(&self, start: Option<&[u8]>, stop: Option<&[u8]>) -> Result<Scanner<'_>> {
        Scanner::open(self, start, stop, false)
    }

    /// Descending scan over `[start, stop)`
    pub fn reverse_scanner(&self, start: Option<&[u8]>, stop: Option<&[u8]>) -> Result<Scanner<'_>> {
        Scanner::open(self, start, stop, true)
    }

    /// Ascending zero-copy scan; keeps one index block read-locked
    pub fn raw_scanner(&self, start: Option<&[u8]>, stop: Option<&[u8]>) -> Result<RawScanner<'_>> {
        RawScanner::open(self, start, stop, false)
    }

    /// Descending zero-copy scan
    pub fn raw_reverse_scanner(
        &self,
        start: Option<&[u8]>,
        stop: Option<&[u8]>,
    ) -> Result<RawScanner<'_>> {
        RawScanner::open(self, start, stop, true)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Free every block and snapshot, leaving an empty map.
    ///
    /// Must not run concurrently with other operations on the same map.
    pub fn dispose(&self) -> Result<()> {
        // Removed map entries are reclaimed lazily, so empty every block
        // here to return its memory to the budget right away
        for entry in self.index.iter() {
            let slot = entry.value();
            let mut block = slot.block.write();
            slot.invalidate();
            block.clear()?;
        }
        self.index.clear();
        self.ctx.versions().reset();
        self.register(IndexBlock::new_anchor(&self.ctx)?);
        info!(memory_allocated = self.ctx.memory().allocated(), "Disposed sorted map");
        Ok(())
    }

    pub fn stats(&self) -> MapStats {
        let mut stats = MapStats {
            memory_allocated: self.ctx.memory().allocated(),
            active_snapshots: self.ctx.versions().active_snapshots(),
            ..MapStats::default()
        };
        for entry in self.index.iter() {
            let block = entry.value().block.read();
            stats.index_blocks += 1;
            stats.data_blocks += block.entry_count();
            stats.records += block.record_count();
            stats.external_allocations += block.external_count();
        }
        stats
    }

    /// Bytes currently reserved against the memory budget
    pub fn memory_allocated(&self) -> u64 {
        self.ctx.memory().allocated()
    }

    pub fn config(&self) -> &Config {
        self.ctx.config()
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    // =========================================================================
    // Write Paths
    // =========================================================================

    // Each write path reads its sequence number only once it holds the
    // block's write lock, so versions of a key land in sequence order.

    fn try_put(&self, key: &[u8], value: &[u8], expire: u64) -> OpResult<()> {
        let mut access = self.acquire_write(key)?;
        let seq = self.ctx.versions().current();
        let old_first = access.block.first_key().to_vec();
        match access.block.put(&self.ctx, key, value, seq, expire)? {
            IndexPut::Stored => {
                self.reconcile(&mut access, &old_first)?;
                Ok(())
            }
            IndexPut::IndexFull => {
                let beyond = access.block.max_key().map_or(true, |max| key > max);
                if beyond {
                    // Step 1: the key sorts after everything here, so it can
                    // start a new index block of its own
                    let block = IndexBlock::with_record(&self.ctx, key, value, seq, expire)?;
                    let slot = self.register(block);
                    debug!(slot = slot.id, "Opened index block for trailing key");
                    Ok(())
                } else {
                    // Step 2: make room by splitting, then route again
                    self.split_index(&mut access)?;
                    Err(OpError::Retry)
                }
            }
        }
    }

    fn try_delete(&self, key: &[u8]) -> OpResult<bool> {
        let mut access = self.acquire_write(key)?;
        let seq = self.ctx.versions().current();
        let old_first = access.block.first_key().to_vec();
        match access.block.delete(&self.ctx, key, seq)? {
            IndexDelete::NotFound => {
                // a miss may still have compacted the block down to nothing
                self.reconcile(&mut access, &old_first)?;
                Ok(false)
            }
            IndexDelete::Deleted => {
                self.reconcile(&mut access, &old_first)?;
                Ok(true)
            }
            IndexDelete::ParentSplitRequired => {
                self.split_index(&mut access)?;
                Err(OpError::Retry)
            }
        }
    }

    fn try_delete_range(&self, cursor: &[u8], end: &[u8]) -> OpResult<RangeStep> {
        let mut access = self.acquire_write(cursor)?;
        let seq = self.ctx.versions().current();
        let old_first = access.block.first_key().to_vec();
        let next_block = self
            .index
            .lower_bound(Bound::Excluded(old_first.as_slice()))
            .map(|entry| entry.key().clone());

        let outcome = access.block.delete_range(&self.ctx, cursor, end, seq)?;
        let resume = outcome.resume.clone();
        self.reconcile(&mut access, &old_first)?;

        let next = match resume {
            Some(resume) => {
                if access.slot.is_valid() && access.block.entry_count() > 1 {
                    self.split_index(&mut access)?;
                }
                Some(resume)
            }
            None => next_block.filter(|key| key.as_slice() < end),
        };
        Ok(RangeStep {
            deleted: outcome.deleted,
            next,
        })
    }

    /// Publish the effects of a write on the block's first key: rekey the
    /// map entry, or unregister the block once it holds nothing. Then try
    /// to fold the next index block in.
    fn reconcile(&self, access: &mut WriteAccess<'_>, old_first: &[u8]) -> OpResult<()> {
        if !access.block.is_anchor() {
            if access.block.entry_count() == 0 {
                self.unregister(&access.slot, old_first)?;
                access.block.clear()?;
                return Ok(());
            }
            if access.block.first_key() != old_first {
                let new_first = access.block.first_key().to_vec();
                self.index.insert(new_first, Arc::clone(&access.slot));
                self.remove_mapping(&access.slot, old_first)?;
                access.slot.touch(self.ctx.now_millis());
                trace!(slot = access.slot.id, "Rekeyed index block");
            }
        }
        self.try_merge_next(access);
        Ok(())
    }

    fn split_index(&self, access: &mut WriteAccess<'_>) -> OpResult<()> {
        let right = access.block.split(&self.ctx)?.ok_or_else(|| {
            KvError::Corruption("index block with a single entry ran out of room".to_string())
        })?;
        let right_slot = self.register(right);
        access.slot.touch(self.ctx.now_millis());
        debug!(slot = access.slot.id, sibling = right_slot.id, "Split index block");
        Ok(())
    }

    /// Fold the next index block into this one when both are small.
    ///
    /// Only uses try-locks, so it never waits while holding a write lock.
    fn try_merge_next(&self, access: &mut WriteAccess<'_>) {
        let max = self.ctx.config().max_index_block_size;
        if access.block.data_size() >= max / 4 {
            return;
        }
        let Some(next) = self
            .index
            .lower_bound(Bound::Excluded(access.block.first_key()))
            .map(|entry| Arc::clone(entry.value()))
        else {
            return;
        };

        let locks = self.ctx.locks();
        let _stripe = if locks.stripe_index(next.id) == locks.stripe_index(access.slot.id) {
            None
        } else {
            match locks.stripe(next.id).try_lock() {
                Some(guard) => Some(guard),
                None => return,
            }
        };
        let Some(mut next_block) = next.block.try_write_arc() else {
            return;
        };
        if !next.is_valid() || access.block.data_size() + next_block.data_size() > max {
            return;
        }

        let next_key = next_block.first_key().to_vec();
        match access.block.merge(&self.ctx, &mut *next_block) {
            Ok(true) => {
                next.invalidate();
                if let Err(OpError::Fail(e)) = self.remove_mapping(&next, &next_key) {
                    error!(error = %e, "Merged index block missing from map");
                }
                if let Err(e) = next_block.clear() {
                    warn!(error = %e, "Failed to release merged index block");
                }
                access.slot.touch(self.ctx.now_millis());
                debug!(slot = access.slot.id, absorbed = next.id, "Merged index blocks");
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Index block merge failed"),
        }
    }

    fn register(&self, block: IndexBlock) -> Arc<IndexSlot> {
        let key = block.first_key().to_vec();
        let id = self.next_slot_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(IndexSlot::new(id, block, self.ctx.now_millis()));
        self.index.insert(key, Arc::clone(&slot));
        slot
    }

    fn unregister(&self, slot: &Arc<IndexSlot>, key: &[u8]) -> OpResult<()> {
        slot.invalidate();
        self.remove_mapping(slot, key)?;
        trace!(slot = slot.id, "Removed empty index block");
        Ok(())
    }

    fn remove_mapping(&self, slot: &Arc<IndexSlot>, key: &[u8]) -> OpResult<()> {
        match self.index.get(key) {
            Some(entry) if Arc::ptr_eq(entry.value(), slot) => {
                entry.remove();
                Ok(())
            }
            _ => Err(OpError::Fail(KvError::Corruption(format!(
                "index block {} not mapped under its first key",
                slot.id
            )))),
        }
    }

    // =========================================================================
    // Routing
    // =========================================================================

    /// Run one optimistic attempt until it stops asking for a retry
    fn run<T>(&self, mut attempt: impl FnMut() -> OpResult<T>) -> Result<T> {
        let backoff = Backoff::new();
        loop {
            match attempt() {
                Ok(value) => return Ok(value),
                Err(OpError::Retry) => {
                    trace!("Routing changed underneath, retrying");
                    backoff.snooze();
                }
                Err(OpError::Fail(e)) => {
                    if matches!(e, KvError::Corruption(_)) {
                        error!(error = %e, "Structural invariant violated");
                    }
                    return Err(e);
                }
            }
        }
    }

    fn floor(&self, key: &[u8]) -> Option<Arc<IndexSlot>> {
        self.index
            .upper_bound(Bound::Included(key))
            .map(|entry| Arc::clone(entry.value()))
    }

    fn acquire_write(&self, key: &[u8]) -> OpResult<WriteAccess<'_>> {
        let slot = self.floor(key).ok_or_else(|| {
            KvError::Corruption("no index block covers the key".to_string())
        })?;
        let generation = slot.generation();
        let stripe = self.ctx.locks().stripe(slot.id).lock();
        let block = slot.block.write_arc();
        if !slot.is_valid() || slot.generation() != generation {
            return Err(OpError::Retry);
        }
        match self.floor(key) {
            Some(current) if Arc::ptr_eq(&current, &slot) => {}
            _ => return Err(OpError::Retry),
        }
        Ok(WriteAccess {
            block,
            slot,
            _stripe: stripe,
        })
    }

    fn acquire_read(&self, key: &[u8]) -> OpResult<(Arc<IndexSlot>, ReadGuard)> {
        let slot = self.floor(key).ok_or_else(|| {
            KvError::Corruption("no index block covers the key".to_string())
        })?;
        let generation = slot.generation();
        let guard = slot.block.read_arc();
        if !slot.is_valid() || slot.generation() != generation {
            return Err(OpError::Retry);
        }
        let window = self.ctx.config().unsafe_modification_window_ms;
        if slot.recently_modified(self.ctx.now_millis(), window) {
            match self.floor(key) {
                Some(current) if Arc::ptr_eq(&current, &slot) => {}
                _ => return Err(OpError::Retry),
            }
        }
        Ok((slot, guard))
    }

    // -------------------------------------------------------------------------
    // Scanner support
    // -------------------------------------------------------------------------

    /// Read-lock the index block responsible for `key`
    pub(crate) fn read_floor(&self, key: &[u8]) -> Result<(Arc<IndexSlot>, ReadGuard)> {
        self.run(|| self.acquire_read(key))
    }

    /// Read-lock the last index block in key order
    pub(crate) fn read_last(&self) -> Result<(Arc<IndexSlot>, ReadGuard)> {
        self.run(|| {
            let slot = self
                .index
                .back()
                .map(|entry| Arc::clone(entry.value()))
                .ok_or_else(|| KvError::Corruption("engine map is empty".to_string()))?;
            let guard = slot.block.read_arc();
            if !slot.is_valid() {
                return Err(OpError::Retry);
            }
            Ok((slot, guard))
        })
    }

    /// Read-lock the first index block whose first key is `> key`
    pub(crate) fn read_after(&self, key: &[u8]) -> Result<Option<(Arc<IndexSlot>, ReadGuard)>> {
        self.run(|| {
            let Some(slot) = self
                .index
                .lower_bound(Bound::Excluded(key))
                .map(|entry| Arc::clone(entry.value()))
            else {
                return Ok(None);
            };
            let guard = slot.block.read_arc();
            if !slot.is_valid() {
                return Err(OpError::Retry);
            }
            Ok(Some((slot, guard)))
        })
    }

    /// Read-lock the last index block whose first key is `< key`
    pub(crate) fn read_before(&self, key: &[u8]) -> Result<Option<(Arc<IndexSlot>, ReadGuard)>> {
        self.run(|| {
            let Some(slot) = self
                .index
                .upper_bound(Bound::Excluded(key))
                .map(|entry| Arc::clone(entry.value()))
            else {
                return Ok(None);
            };
            let guard = slot.block.read_arc();
            if !slot.is_valid() {
                return Err(OpError::Retry);
            }
            Ok(Some((slot, guard)))
        })
    }
}

impl std::fmt::Debug for BigSortedMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BigSortedMap")
            .field("index_blocks", &self.index.len())
            .field("memory_allocated", &self.ctx.memory().allocated())
            .finish()
    }
}

fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(KvError::InvalidArgument("key must not be empty".to_string()));
    }
    Ok(())
}
