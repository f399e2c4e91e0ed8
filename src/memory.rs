//! Memory Module
//!
//! Accounting and ownership for every byte the engine allocates.
//!
//! ## Responsibilities
//! - Enforce the process-wide memory budget
//! - Own block buffers and release their reservation on drop
//! - Own oversized key/value bodies ("external allocations") so that each
//!   one is freed exactly once, when the record referencing it goes away
//! - Provide the capacity ladder blocks grow and shrink along
//!
//! ## Ownership
//! ```text
//!   MemoryTracker (shared, atomic counters)
//!        ▲                     ▲
//!        │ reserve/release     │ reserve/release
//!   BlockBuffer            ExternalAlloc
//!   (one per block)        (one per oversized record, held in the
//!                           ExternalStore of the owning block)
//! ```

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{KvError, Result};

// =============================================================================
// Memory Tracker
// =============================================================================

/// Process-wide memory budget and allocation counters
#[derive(Debug)]
pub struct MemoryTracker {
    limit: u64,
    allocated: AtomicU64,
    buffers: AtomicUsize,
    externals: AtomicUsize,
    next_handle: AtomicU64,
}

impl MemoryTracker {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            allocated: AtomicU64::new(0),
            buffers: AtomicUsize::new(0),
            externals: AtomicUsize::new(0),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Reserve `bytes` against the budget, failing without side effects
    /// when the budget would be exceeded.
    pub fn reserve(&self, bytes: usize) -> Result<()> {
        let limit = self.limit;
        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current.checked_add(bytes as u64)?;
                (next <= limit).then_some(next)
            })
            .map(|_| ())
            .map_err(|_| KvError::MemoryExhausted {
                requested: bytes,
                limit,
            })
    }

    /// Return `bytes` to the budget
    pub fn release(&self, bytes: usize) {
        self.allocated.fetch_sub(bytes as u64, Ordering::AcqRel);
    }

    /// Bytes currently reserved
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Acquire)
    }

    /// Configured budget
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Live block buffers
    pub fn buffer_count(&self) -> usize {
        self.buffers.load(Ordering::Acquire)
    }

    /// Live external allocations
    pub fn external_count(&self) -> usize {
        self.externals.load(Ordering::Acquire)
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }
}

// =============================================================================
// Block Buffer
// =============================================================================

/// A zero-initialized, fixed-capacity buffer reserved against the budget.
///
/// The buffer's length is its capacity; callers track how much of it is in
/// use. Dropping the buffer releases the reservation.
#[derive(Debug)]
pub struct BlockBuffer {
    data: Vec<u8>,
    tracker: Arc<MemoryTracker>,
}

impl BlockBuffer {
    pub fn allocate(tracker: &Arc<MemoryTracker>, capacity: usize) -> Result<Self> {
        tracker.reserve(capacity)?;
        tracker.buffers.fetch_add(1, Ordering::AcqRel);
        Ok(Self {
            data: vec![0u8; capacity],
            tracker: Arc::clone(tracker),
        })
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Change capacity, keeping the first `used` bytes intact
    pub fn resize(&mut self, capacity: usize, used: usize) -> Result<()> {
        debug_assert!(used <= capacity);
        let current = self.data.len();
        if capacity > current {
            self.tracker.reserve(capacity - current)?;
            self.data.resize(capacity, 0);
        } else if capacity < current {
            self.data.truncate(capacity);
            self.data.shrink_to_fit();
            self.tracker.release(current - capacity);
        }
        Ok(())
    }
}

impl Deref for BlockBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for BlockBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for BlockBuffer {
    fn drop(&mut self) {
        self.tracker.release(self.data.len());
        self.tracker.buffers.fetch_sub(1, Ordering::AcqRel);
    }
}

// =============================================================================
// External Allocations
// =============================================================================

/// An oversized record body living outside its block's buffer
#[derive(Debug)]
pub struct ExternalAlloc {
    bytes: Box<[u8]>,
    tracker: Arc<MemoryTracker>,
}

impl ExternalAlloc {
    /// Allocate a body holding the concatenation of `parts`
    pub fn allocate(tracker: &Arc<MemoryTracker>, parts: &[&[u8]]) -> Result<Self> {
        let len = parts.iter().map(|p| p.len()).sum();
        tracker.reserve(len)?;
        tracker.externals.fetch_add(1, Ordering::AcqRel);
        Ok(Self {
            bytes: parts.concat().into_boxed_slice(),
            tracker: Arc::clone(tracker),
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Deref for ExternalAlloc {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl DerefMut for ExternalAlloc {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl Drop for ExternalAlloc {
    fn drop(&mut self) {
        self.tracker.release(self.bytes.len());
        self.tracker.externals.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Handle-addressed external allocations owned by one block.
///
/// A record stores the handle in its 8-byte address field. Handles are
/// unique process-wide, so allocations can move between stores on split
/// and merge without renumbering.
#[derive(Debug)]
pub struct ExternalStore {
    allocs: HashMap<u64, ExternalAlloc>,
    tracker: Arc<MemoryTracker>,
}

impl ExternalStore {
    pub fn new(tracker: &Arc<MemoryTracker>) -> Self {
        Self {
            allocs: HashMap::new(),
            tracker: Arc::clone(tracker),
        }
    }

    /// Allocate a body for `parts` and return its handle
    pub fn allocate(&mut self, parts: &[&[u8]]) -> Result<u64> {
        let alloc = ExternalAlloc::allocate(&self.tracker, parts)?;
        let handle = self.tracker.next_handle();
        self.allocs.insert(handle, alloc);
        Ok(handle)
    }

    pub fn get(&self, handle: u64) -> Option<&[u8]> {
        self.allocs.get(&handle).map(|a| &a[..])
    }

    pub fn get_mut(&mut self, handle: u64) -> Option<&mut [u8]> {
        self.allocs.get_mut(&handle).map(|a| &mut a[..])
    }

    /// Free the body behind `handle`; false if this store does not own it
    pub fn free(&mut self, handle: u64) -> bool {
        self.allocs.remove(&handle).is_some()
    }

    /// Hand ownership of `handle` to another store
    pub fn transfer(&mut self, handle: u64, to: &mut ExternalStore) -> bool {
        match self.allocs.remove(&handle) {
            Some(alloc) => {
                to.allocs.insert(handle, alloc);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.allocs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocs.is_empty()
    }

    /// Total bytes held outside the owning block
    pub fn bytes(&self) -> usize {
        self.allocs.values().map(|a| a.len()).sum()
    }
}

// =============================================================================
// Size Ladder
// =============================================================================

/// Capacities blocks are allocated with: `256 × {4..16}`, capped at the
/// configured maximum, which is always the top rung.
#[derive(Debug, Clone)]
pub struct SizeLadder {
    sizes: Vec<usize>,
}

impl SizeLadder {
    const RUNG: usize = 256;

    pub fn new(max: usize) -> Self {
        let mut sizes: Vec<usize> = (4..=16)
            .map(|k| k * Self::RUNG)
            .filter(|&s| s < max)
            .collect();
        sizes.push(max);
        Self { sizes }
    }

    /// Smallest rung holding at least `bytes`, if any
    pub fn fit(&self, bytes: usize) -> Option<usize> {
        self.sizes.iter().copied().find(|&s| s >= bytes)
    }

    pub fn smallest(&self) -> usize {
        self.sizes[0]
    }

    pub fn max(&self) -> usize {
        self.sizes[self.sizes.len() - 1]
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }
}
