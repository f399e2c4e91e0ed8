//! Version Module
//!
//! The global sequence counter and the set of active snapshots.
//!
//! ## Visibility Rules
//!
//! Every put/delete stamps its record with the counter's current value.
//! Creating a snapshot reads the counter and increments it, so writes that
//! start afterwards carry a strictly higher sequence id than the snapshot.
//! A reader at version `v` sees, for each key, the newest record whose
//! sequence id is `<= v`.
//!
//! A record version must survive compaction or overwrite exactly when some
//! active snapshot falls in the half-open interval between its own sequence
//! id and the sequence id of the next newer version of the same key.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Sequence id stamped on every record
pub type SeqId = u64;

/// Identifier of an active snapshot (a point on the sequence timeline)
pub type SnapshotId = u64;

/// Version ceiling that sees the newest record of every key
pub const LATEST: SeqId = u64::MAX;

/// Process-wide sequence counter plus active snapshot registry
#[derive(Debug)]
pub struct VersionManager {
    sequence: AtomicU64,
    active: Mutex<BTreeSet<SnapshotId>>,
    active_count: AtomicUsize,
}

impl VersionManager {
    pub fn new() -> Self {
        Self {
            sequence: AtomicU64::new(1),
            active: Mutex::new(BTreeSet::new()),
            active_count: AtomicUsize::new(0),
        }
    }

    /// Sequence id for a write starting now
    pub fn current(&self) -> SeqId {
        self.sequence.load(Ordering::Acquire)
    }

    /// Read-and-increment the counter and register the result as active
    pub fn create_snapshot(&self) -> SnapshotId {
        let mut active = self.active.lock();
        // a writer that sees the bumped counter must also see the count,
        // then wait on the registry lock until the id is in it
        self.active_count.store(active.len() + 1, Ordering::Release);
        let id = self.sequence.fetch_add(1, Ordering::AcqRel);
        active.insert(id);
        id
    }

    /// Forget a snapshot; false if it was not active
    pub fn release_snapshot(&self, id: SnapshotId) -> bool {
        let mut active = self.active.lock();
        let removed = active.remove(&id);
        self.active_count.store(active.len(), Ordering::Release);
        removed
    }

    pub fn oldest_active(&self) -> Option<SnapshotId> {
        if self.active_count.load(Ordering::Acquire) == 0 {
            return None;
        }
        self.active.lock().first().copied()
    }

    pub fn newest_active(&self) -> Option<SnapshotId> {
        if self.active_count.load(Ordering::Acquire) == 0 {
            return None;
        }
        self.active.lock().last().copied()
    }

    pub fn active_snapshots(&self) -> usize {
        self.active_count.load(Ordering::Acquire)
    }

    /// Whether an active snapshot `s` satisfies `from <= s < until`.
    ///
    /// This is the preservation test for a record version stamped `from`
    /// whose next newer version is stamped `until`.
    pub fn has_snapshot_in(&self, from: SeqId, until: SeqId) -> bool {
        if from >= until || self.active_count.load(Ordering::Acquire) == 0 {
            return false;
        }
        self.active.lock().range(from..until).next().is_some()
    }

    /// Drop every snapshot and restart the counter
    pub fn reset(&self) {
        let mut active = self.active.lock();
        active.clear();
        self.active_count.store(0, Ordering::Release);
        self.sequence.store(1, Ordering::Release);
    }
}

impl Default for VersionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_ids_increase() {
        let versions = VersionManager::new();
        let a = versions.create_snapshot();
        let b = versions.create_snapshot();
        assert!(b > a);
        assert_eq!(versions.current(), b + 1);
        assert_eq!(versions.oldest_active(), Some(a));
        assert_eq!(versions.newest_active(), Some(b));
    }

    #[test]
    fn test_has_snapshot_in_is_half_open() {
        let versions = VersionManager::new();
        let s = versions.create_snapshot();
        assert!(versions.has_snapshot_in(s, s + 1));
        assert!(versions.has_snapshot_in(0, s + 1));
        assert!(!versions.has_snapshot_in(0, s));
        assert!(!versions.has_snapshot_in(s + 1, LATEST));
        assert!(versions.release_snapshot(s));
        assert!(!versions.has_snapshot_in(0, LATEST));
        assert!(!versions.release_snapshot(s));
    }

    #[test]
    fn test_reset_clears_snapshots() {
        let versions = VersionManager::new();
        versions.create_snapshot();
        versions.reset();
        assert_eq!(versions.active_snapshots(), 0);
        assert_eq!(versions.current(), 1);
    }
}
