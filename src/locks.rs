//! Striped writer locks
//!
//! A fixed table of mutexes shared by every index block. A block's stripe
//! is picked by hashing its id, so the number of lock objects is bounded by
//! the table size no matter how many blocks exist. Two blocks may share a
//! stripe; code that needs two blocks at once must check for that before
//! locking the second one.

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;

/// Fixed-size table of striped mutexes
#[derive(Debug)]
pub struct LockTable {
    stripes: Box<[CachePadded<Mutex<()>>]>,
}

impl LockTable {
    pub fn new(stripes: usize) -> Self {
        let stripes = (0..stripes.max(1))
            .map(|_| CachePadded::new(Mutex::new(())))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { stripes }
    }

    /// Stripe index for a block id (Fibonacci hashing)
    pub fn stripe_index(&self, id: u64) -> usize {
        let mixed = id.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        ((mixed >> 32) as usize) % self.stripes.len()
    }

    pub fn stripe(&self, id: u64) -> &Mutex<()> {
        &self.stripes[self.stripe_index(id)]
    }

    pub fn len(&self) -> usize {
        self.stripes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stripes.is_empty()
    }
}
