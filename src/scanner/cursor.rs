use std::ops::Bound;

use crate::block::IndexBlock;
use crate::engine::{BigSortedMap, ReadGuard};
use crate::error::Result;
use crate::version::SnapshotId;

/// Position on one visible record, holding its index block read-locked.
///
/// `run_bound` is the end of the record's run when moving forward and the
/// start of it when moving backward, which is where the next step resumes.
pub(crate) struct BlockCursor {
    guard: ReadGuard,
    entry: usize,
    record: usize,
    run_bound: usize,
}

impl BlockCursor {
    pub(crate) fn key(&self) -> &[u8] {
        self.guard
            .data_block(self.entry)
            .map_or(&[][..], |block| block.key_at(self.record))
    }

    pub(crate) fn value(&self) -> &[u8] {
        self.guard
            .data_block(self.entry)
            .map_or(&[][..], |block| block.record(self.record).value())
    }

    /// First visible record beyond `bound` in the scan direction
    pub(crate) fn seek(
        map: &BigSortedMap,
        bound: Bound<&[u8]>,
        snapshot: SnapshotId,
        reverse: bool,
    ) -> Result<Option<Self>> {
        if reverse {
            Self::seek_backward(map, bound, snapshot)
        } else {
            Self::seek_forward(map, bound, snapshot)
        }
    }

    /// Move to the next visible record, crossing data and index blocks.
    ///
    /// Crossing an index block releases its lock and relocates by the last
    /// key seen, so blocks that split or merged meanwhile are handled.
    pub(crate) fn step(
        mut self,
        map: &BigSortedMap,
        snapshot: SnapshotId,
        reverse: bool,
    ) -> Result<Option<Self>> {
        if self.step_in_block(snapshot, reverse) {
            return Ok(Some(self));
        }
        let next = if reverse {
            self.entry
                .checked_sub(1)
                .and_then(|through| last_in(&self.guard, through, Bound::Unbounded, snapshot))
        } else {
            first_in(&self.guard, self.entry + 1, Bound::Unbounded, snapshot)
        };
        if let Some((entry, record, run_bound)) = next {
            self.entry = entry;
            self.record = record;
            self.run_bound = run_bound;
            return Ok(Some(self));
        }
        let last = self.key().to_vec();
        drop(self);
        Self::seek(map, Bound::Excluded(last.as_slice()), snapshot, reverse)
    }

    /// Move to the next visible record of the current data block only
    pub(crate) fn step_in_block(&mut self, snapshot: SnapshotId, reverse: bool) -> bool {
        let Some(block) = self.guard.data_block(self.entry) else {
            return false;
        };
        let next = if reverse {
            block.prev_visible(self.run_bound, snapshot)
        } else {
            block.next_visible(self.run_bound, snapshot)
        };
        match next {
            Some((record, run_bound)) => {
                self.record = record;
                self.run_bound = run_bound;
                true
            }
            None => false,
        }
    }

    fn seek_forward(
        map: &BigSortedMap,
        lower: Bound<&[u8]>,
        snapshot: SnapshotId,
    ) -> Result<Option<Self>> {
        let target = match lower {
            Bound::Included(key) | Bound::Excluded(key) => key,
            Bound::Unbounded => &[][..],
        };
        let (_, mut guard) = map.read_floor(target)?;
        loop {
            if guard.entry_count() > 0 {
                let from = guard.locate(target);
                if let Some((entry, record, run_bound)) = first_in(&guard, from, lower, snapshot) {
                    return Ok(Some(Self {
                        guard,
                        entry,
                        record,
                        run_bound,
                    }));
                }
            }
            let first = guard.first_key().to_vec();
            drop(guard);
            match map.read_after(&first)? {
                Some((_, next)) => guard = next,
                None => return Ok(None),
            }
        }
    }

    fn seek_backward(
        map: &BigSortedMap,
        upper: Bound<&[u8]>,
        snapshot: SnapshotId,
    ) -> Result<Option<Self>> {
        let (_, mut guard) = match upper {
            Bound::Included(key) | Bound::Excluded(key) => map.read_floor(key)?,
            Bound::Unbounded => map.read_last()?,
        };
        loop {
            if guard.entry_count() > 0 {
                let through = match upper {
                    Bound::Included(key) | Bound::Excluded(key) => guard.locate(key),
                    Bound::Unbounded => guard.entry_count() - 1,
                };
                if let Some((entry, record, run_bound)) = last_in(&guard, through, upper, snapshot) {
                    return Ok(Some(Self {
                        guard,
                        entry,
                        record,
                        run_bound,
                    }));
                }
            }
            if guard.is_anchor() {
                return Ok(None);
            }
            let first = guard.first_key().to_vec();
            drop(guard);
            match map.read_before(&first)? {
                Some((_, prev)) => guard = prev,
                None => return Ok(None),
            }
        }
    }
}

/// First visible record at or after data block `from`, above `lower`
fn first_in(
    index: &IndexBlock,
    from: usize,
    lower: Bound<&[u8]>,
    snapshot: SnapshotId,
) -> Option<(usize, usize, usize)> {
    (from..index.entry_count()).find_map(|entry| {
        let block = index.data_block(entry)?;
        let start = match lower {
            Bound::Unbounded => 0,
            Bound::Included(key) => block.run_start(key),
            Bound::Excluded(key) => block.run_after(key),
        };
        block
            .next_visible(start, snapshot)
            .map(|(record, end)| (entry, record, end))
    })
}

/// Last visible record at or before data block `through`, below `upper`
fn last_in(
    index: &IndexBlock,
    through: usize,
    upper: Bound<&[u8]>,
    snapshot: SnapshotId,
) -> Option<(usize, usize, usize)> {
    (0..=through).rev().find_map(|entry| {
        let block = index.data_block(entry)?;
        let before = match upper {
            Bound::Unbounded => block.record_count(),
            Bound::Included(key) => block.run_after(key),
            Bound::Excluded(key) => block.run_start(key),
        };
        block
            .prev_visible(before, snapshot)
            .map(|(record, start)| (entry, record, start))
    })
}
