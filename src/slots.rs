use crate::branch::{BranchId, BranchIndex, NO_BRANCH};
use crate::error::{DentryError, Result};
use crate::physical::PhysicalEntry;

/// One branch position of an entry. Dropping the slot releases its handle.
#[derive(Debug, Default)]
pub struct Slot {
    branch: Option<BranchId>,
    entry: Option<PhysicalEntry>,
}

impl Slot {
    pub fn branch(&self) -> Option<BranchId> {
        self.branch
    }

    pub fn entry(&self) -> Option<&PhysicalEntry> {
        self.entry.as_ref()
    }
}

/// Branch-ranked physical entries of one logical entry.
///
/// The populated range and the two markers are independent: a whiteout or an
/// opaque directory can be found in a branch outside `[lowest, highest]`.
#[derive(Debug, Default)]
pub struct SlotArray {
    slots: Vec<Slot>,
    lowest: Option<usize>,
    highest: Option<usize>,
    whiteout: Option<usize>,
    opaque: Option<usize>,
}

fn to_index(rank: Option<usize>) -> BranchIndex {
    rank.map_or(NO_BRANCH, |r| r as BranchIndex)
}

impl SlotArray {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, index: usize) -> Option<&PhysicalEntry> {
        self.slots.get(index).and_then(|s| s.entry.as_ref())
    }

    pub fn slot(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    /// Replace the slot at `index`, releasing the previous occupant.
    ///
    /// Panics if `index` is beyond the array; grow it first.
    pub fn set(&mut self, index: usize, entry: Option<PhysicalEntry>) {
        let count = self.slots.len();
        let slot = self
            .slots
            .get_mut(index)
            .unwrap_or_else(|| panic!("slot {} out of range for {} slots", index, count));
        slot.branch = entry.as_ref().map(PhysicalEntry::branch);
        if let Some(old) = std::mem::replace(&mut slot.entry, entry) {
            log::trace!("slot {} releases {:?}", index, old);
        }
    }

    /// Store `entry` at `index` and keep the populated range covering exactly
    /// the occupied slots at its edges.
    pub fn record(&mut self, index: usize, entry: Option<PhysicalEntry>) {
        let present = entry.is_some();
        self.set(index, entry);
        if present {
            self.widen_to(index);
        } else {
            self.tidy_range();
        }
    }

    /// Make room for `new_count` slots. Existing slots keep their positions.
    pub fn grow(&mut self, new_count: usize) -> Result<()> {
        let len = self.slots.len();
        if new_count <= len {
            return Ok(());
        }
        self.slots
            .try_reserve_exact(new_count - len)
            .map_err(|_| DentryError::OutOfMemory {
                requested: new_count,
            })?;
        self.slots.resize_with(new_count, Slot::default);
        Ok(())
    }

    pub fn lowest(&self) -> Option<usize> {
        self.lowest
    }

    pub fn highest(&self) -> Option<usize> {
        self.highest
    }

    pub fn whiteout(&self) -> Option<usize> {
        self.whiteout
    }

    pub fn opaque(&self) -> Option<usize> {
        self.opaque
    }

    pub fn set_lowest(&mut self, rank: Option<usize>) {
        self.lowest = rank;
    }

    pub fn set_highest(&mut self, rank: Option<usize>) {
        self.highest = rank;
    }

    // May point outside [lowest, highest].
    pub fn set_whiteout(&mut self, rank: Option<usize>) {
        self.whiteout = rank;
    }

    pub fn set_opaque(&mut self, rank: Option<usize>) {
        self.opaque = rank;
    }

    /// Lowest-priority rank still visible through this entry: `highest`, cut
    /// off just above a whiteout that sits inside the populated range.
    pub fn tail(&self) -> Option<usize> {
        let (lo, hi) = (self.lowest?, self.highest?);
        match self.whiteout {
            Some(wh) if wh < hi => Some(wh.saturating_sub(1).max(lo)),
            _ => Some(hi),
        }
    }

    /// `tail` for a directory, which also stops at its opaque rank.
    pub fn tail_dir(&self) -> Option<usize> {
        let tail = self.tail()?;
        match self.opaque {
            Some(opq) if opq < tail => Some(opq),
            _ => Some(tail),
        }
    }

    /// `(lowest, highest)` with `NO_BRANCH` for an empty array.
    pub fn populated_range(&self) -> (BranchIndex, BranchIndex) {
        (to_index(self.lowest), to_index(self.highest))
    }

    /// Narrow or widen the populated range; slots falling outside it are released.
    pub fn set_populated_range(&mut self, range: Option<(usize, usize)>) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let inside = range.is_some_and(|(lo, hi)| lo <= index && index <= hi);
            if !inside && slot.entry.is_some() {
                slot.branch = None;
                slot.entry = None;
            }
        }
        self.lowest = range.map(|(lo, _)| lo);
        self.highest = range.map(|(_, hi)| hi);
    }

    pub fn widen_to(&mut self, index: usize) {
        self.lowest = Some(self.lowest.map_or(index, |lo| lo.min(index)));
        self.highest = Some(self.highest.map_or(index, |hi| hi.max(index)));
    }

    /// Shrink the range to the first and last occupied slots inside it.
    pub fn tidy_range(&mut self) {
        let (Some(lo), Some(hi), false) = (self.lowest, self.highest, self.slots.is_empty()) else {
            self.lowest = None;
            self.highest = None;
            return;
        };
        let hi = hi.min(self.slots.len().saturating_sub(1));
        let occupied = |i: &usize| self.slots[*i].entry.is_some();
        let first = (lo..=hi).find(occupied);
        let last = (lo..=hi).rev().find(occupied);
        self.lowest = first;
        self.highest = first.and(last);
    }

    /// Release every handle and forget all ranges and markers.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.branch = None;
            slot.entry = None;
        }
        self.lowest = None;
        self.highest = None;
        self.whiteout = None;
        self.opaque = None;
    }

    /// Rank holding exactly this physical handle, if any.
    pub fn find_branch(&self, entry: &PhysicalEntry) -> Option<usize> {
        let (lo, hi) = (self.lowest?, self.highest?);
        (lo..=hi.min(self.slots.len().checked_sub(1)?))
            .find(|&i| self.slots[i].entry.as_ref().is_some_and(|e| e.same(entry)))
    }

    pub fn check_range_consistency(&self) -> bool {
        match (self.lowest, self.highest) {
            (None, None) => true,
            (Some(lo), Some(hi)) => lo <= hi && hi < self.slots.len(),
            _ => false,
        }
    }

    pub fn inconsistency(&self) -> DentryError {
        let (lowest, highest) = self.populated_range();
        DentryError::InconsistentRange {
            lowest,
            highest,
            count: self.slots.len(),
        }
    }

    pub fn populated(&self) -> impl Iterator<Item = (usize, &PhysicalEntry)> {
        let range = match (self.lowest, self.highest) {
            (Some(lo), Some(hi)) => lo..hi.saturating_add(1).min(self.slots.len()),
            _ => 0..0,
        };
        range.filter_map(move |i| self.slots[i].entry.as_ref().map(|e| (i, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physical::EntryKind;

    fn entry(branch: u64, path: &str) -> PhysicalEntry {
        PhysicalEntry::new(BranchId(branch), path, EntryKind::File)
    }

    #[test]
    fn empty_array_has_sentinel_range() {
        let slots = SlotArray::new();
        assert_eq!(slots.populated_range(), (NO_BRANCH, NO_BRANCH));
        assert!(slots.check_range_consistency());
        assert_eq!(slots.count(), 0);
    }

    #[test]
    fn grow_preserves_existing_slots() {
        let mut slots = SlotArray::new();
        slots.grow(2).unwrap();
        let h = entry(1, "/f");
        slots.record(1, Some(h.clone()));

        slots.grow(5).unwrap();
        assert_eq!(slots.count(), 5);
        assert!(slots.get(1).unwrap().same(&h));
        assert!(slots.get(0).is_none());
        for i in 2..5 {
            assert!(slots.get(i).is_none());
        }

        // shrinking requests are no-ops
        slots.grow(1).unwrap();
        assert_eq!(slots.count(), 5);
    }

    #[test]
    fn grow_failure_leaves_array_untouched() {
        let mut slots = SlotArray::new();
        slots.grow(1).unwrap();
        slots.record(0, Some(entry(0, "/a")));

        let err = slots.grow(usize::MAX).unwrap_err();
        assert!(matches!(err, DentryError::OutOfMemory { .. }));
        assert_eq!(slots.count(), 1);
        assert_eq!(slots.populated_range(), (0, 0));
    }

    #[test]
    fn set_releases_previous_occupant() {
        let mut slots = SlotArray::new();
        slots.grow(1).unwrap();
        let first = entry(0, "/a");
        slots.set(0, Some(first.clone()));
        assert_eq!(first.ref_count(), 2);

        slots.set(0, Some(entry(0, "/b")));
        assert_eq!(first.ref_count(), 1);
        assert_eq!(slots.slot(0).unwrap().branch(), Some(BranchId(0)));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn set_beyond_count_panics() {
        let mut slots = SlotArray::new();
        slots.set(0, None);
    }

    #[test]
    fn record_maintains_range_edges() {
        let mut slots = SlotArray::new();
        slots.grow(4).unwrap();
        slots.record(2, Some(entry(2, "/c")));
        assert_eq!(slots.populated_range(), (2, 2));
        slots.record(0, Some(entry(0, "/a")));
        assert_eq!(slots.populated_range(), (0, 2));

        slots.record(0, None);
        assert_eq!(slots.populated_range(), (2, 2));
        slots.record(2, None);
        assert_eq!(slots.populated_range(), (NO_BRANCH, NO_BRANCH));
        assert!(slots.check_range_consistency());
    }

    #[test]
    fn narrowing_the_range_releases_outside_slots() {
        let mut slots = SlotArray::new();
        slots.grow(3).unwrap();
        let outer = entry(0, "/a");
        slots.record(0, Some(outer.clone()));
        slots.record(2, Some(entry(2, "/c")));

        slots.set_populated_range(Some((1, 2)));
        assert!(slots.get(0).is_none());
        assert_eq!(outer.ref_count(), 1);
        for i in 0..slots.count() {
            let (lo, hi) = slots.populated_range();
            if (i as BranchIndex) < lo || (i as BranchIndex) > hi {
                assert!(slots.get(i).is_none());
            }
        }
    }

    #[test]
    fn markers_may_lie_outside_the_range() {
        let mut slots = SlotArray::new();
        slots.grow(4).unwrap();
        slots.record(0, Some(entry(0, "/a")));
        slots.set_whiteout(Some(3));
        slots.set_opaque(Some(2));
        assert_eq!(slots.whiteout(), Some(3));
        assert_eq!(slots.opaque(), Some(2));
        assert!(slots.check_range_consistency());
    }

    #[test]
    fn consistency_check_catches_bad_bounds() {
        let mut slots = SlotArray::new();
        slots.grow(2).unwrap();

        slots.set_lowest(Some(0));
        assert!(!slots.check_range_consistency());

        slots.set_highest(Some(2));
        assert!(!slots.check_range_consistency());

        slots.set_lowest(Some(1));
        slots.set_highest(Some(0));
        assert!(!slots.check_range_consistency());
        assert!(matches!(
            slots.inconsistency(),
            DentryError::InconsistentRange {
                lowest: 1,
                highest: 0,
                count: 2
            }
        ));

        slots.set_highest(Some(1));
        assert!(slots.check_range_consistency());
    }

    #[test]
    fn find_branch_matches_handle_identity() {
        let mut slots = SlotArray::new();
        slots.grow(3).unwrap();
        let a = entry(0, "/x");
        let b = entry(2, "/x");
        slots.record(0, Some(a.clone()));
        slots.record(2, Some(b.clone()));

        assert_eq!(slots.find_branch(&a), Some(0));
        assert_eq!(slots.find_branch(&b), Some(2));
        assert_eq!(slots.find_branch(&entry(0, "/x")), None);
    }

    #[test]
    fn clear_releases_everything() {
        let mut slots = SlotArray::new();
        slots.grow(2).unwrap();
        let a = entry(0, "/a");
        slots.record(0, Some(a.clone()));
        slots.set_whiteout(Some(1));

        slots.clear();
        assert_eq!(a.ref_count(), 1);
        assert_eq!(slots.populated_range(), (NO_BRANCH, NO_BRANCH));
        assert_eq!(slots.whiteout(), None);
        assert_eq!(slots.count(), 2);
        assert_eq!(slots.populated().count(), 0);
    }

    #[test]
    fn tail_stops_above_whiteout_and_opaque() {
        let mut slots = SlotArray::new();
        assert_eq!(slots.tail(), None);
        assert_eq!(slots.tail_dir(), None);

        slots.grow(5).unwrap();
        slots.record(1, Some(entry(1, "/d")));
        slots.record(4, Some(entry(4, "/d")));
        assert_eq!(slots.tail(), Some(4));

        slots.set_whiteout(Some(3));
        assert_eq!(slots.tail(), Some(2));
        assert_eq!(slots.tail_dir(), Some(2));

        // never cut above the lowest populated rank
        slots.set_whiteout(Some(1));
        assert_eq!(slots.tail(), Some(1));
        slots.set_whiteout(Some(0));
        assert_eq!(slots.tail(), Some(1));

        // a whiteout at the highest rank leaves it visible
        slots.set_whiteout(Some(4));
        assert_eq!(slots.tail(), Some(4));

        slots.set_opaque(Some(2));
        assert_eq!(slots.tail(), Some(4));
        assert_eq!(slots.tail_dir(), Some(2));
        slots.set_whiteout(Some(2));
        slots.set_opaque(Some(3));
        assert_eq!(slots.tail_dir(), Some(1));
    }
}
