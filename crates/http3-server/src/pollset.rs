//! Slot-table bookkeeping for connection/stream lifecycle tracking.
//!
//! This engine drives QUIC I/O through `http3_quic`'s `Future`-returning
//! trait methods rather than a raw fd poll, so actual readiness comes
//! from the async runtime's reactor rather than this table. What this
//! module contributes is the bookkeeping discipline: a dense,
//! back-indexed slot array so connection and stream objects can be
//! enumerated, marked dead in O(1), and compacted without disturbing the
//! other live slots' indices mid-scan.
use std::marker::PhantomData;

/// A dense array of slots with O(1) dead-marking and back-indexed swap
/// compaction. `T` is typically an `Arc<...Ctx>` (connection or stream
/// context) that stores its own slot index for O(1) updates.
pub struct SlotTable<T> {
    slots: Vec<Option<T>>,
    first_dead: Option<usize>,
    _marker: PhantomData<T>,
}

impl<T> Default for SlotTable<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            first_dead: None,
            _marker: PhantomData,
        }
    }
}

impl<T> SlotTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `item`, returning its slot index. Callers should store this
    /// index back onto `item`'s context as its back-reference.
    pub fn push(&mut self, item: T) -> usize {
        let idx = self.slots.len();
        self.slots.push(Some(item));
        idx
    }

    pub fn get(&self, idx: usize) -> Option<&T> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut T> {
        self.slots.get_mut(idx).and_then(Option::as_mut)
    }

    /// Nulls a slot and records the earliest hole seen so far, for the next
    /// `consolidate` pass to start from.
    pub fn mark_dead(&mut self, idx: usize) -> Option<T> {
        let taken = self.slots.get_mut(idx).and_then(Option::take);
        if taken.is_some() {
            self.first_dead = Some(self.first_dead.map_or(idx, |d| d.min(idx)));
        }
        taken
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|v| (i, v)))
    }

    /// Swap-with-last compaction starting from the first recorded dead
    /// index. `relocate` is invoked with the moved item's new index so the
    /// caller can update its back-reference. After this returns there are
    /// no holes in `[0, len())`.
    pub fn consolidate(&mut self, mut relocate: impl FnMut(&mut T, usize)) {
        let Some(mut hole) = self.first_dead else {
            return;
        };
        let mut last = self.slots.len();
        while hole < last {
            if self.slots[hole].is_some() {
                hole += 1;
                continue;
            }
            last -= 1;
            if hole == last {
                break;
            }
            if let Some(mut moved) = self.slots[last].take() {
                relocate(&mut moved, hole);
                self.slots[hole] = Some(moved);
                hole += 1;
            }
        }
        self.slots.truncate(last);
        self.first_dead = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consolidate_leaves_no_holes() {
        let mut t: SlotTable<u32> = SlotTable::new();
        for i in 0..5 {
            t.push(i);
        }
        t.mark_dead(1);
        t.mark_dead(3);
        let mut relocated = Vec::new();
        t.consolidate(|v, new_idx| relocated.push((*v, new_idx)));
        for i in 0..t.len() {
            assert!(t.get(i).is_some(), "hole at {i} after consolidate");
        }
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn consolidate_noop_without_dead_slots() {
        let mut t: SlotTable<u32> = SlotTable::new();
        t.push(1);
        t.push(2);
        t.consolidate(|_, _| panic!("nothing should relocate"));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn mark_dead_is_idempotent_for_bookkeeping() {
        let mut t: SlotTable<u32> = SlotTable::new();
        let idx = t.push(42);
        assert_eq!(t.mark_dead(idx), Some(42));
        assert_eq!(t.mark_dead(idx), None);
    }
}
