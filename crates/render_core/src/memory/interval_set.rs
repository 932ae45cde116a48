//! Free-range tracker for fixed-capacity linear resources
//!
//! An [`IntervalSet`] records which byte ranges of a linear resource (in practice
//! a GPU vertex or element buffer) are still free. It knows nothing about buffers
//! or meshes; callers ask it for an offset, mark the range used, and hand it back
//! when they are done.
//!
//! # Layout
//!
//! ```text
//! by_start: [ (0,16) (64,8) (200,56) ]        sorted by start, used for merging
//! by_size:  [ (200,56) (0,16) (64,8) ]        sorted by size descending, used for allocation
//! ```
//!
//! Both indices hold exactly the same intervals. No two free intervals overlap and
//! no two are byte-adjacent: adjacent ranges are merged the moment they are freed.
//!
//! # Performance Notes
//! Both indices are sorted `Vec`s. Lookups are binary searches (`O(log n)`) while
//! inserts and removals shift elements (`O(n)`). The interval count is bounded by the
//! number of resident meshes in one buffer, not by its byte size, so this stays cheap.

use std::cmp::Reverse;
use super::IntervalError;

/// A contiguous free byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interval {
    /// First free byte
    pub start: u64,
    /// Number of free bytes
    pub size: u64,
}

impl Interval {
    /// Create a new interval
    pub fn new(start: u64, size: u64) -> Self {
        Self { start, size }
    }

    /// One past the last byte of the interval
    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    /// Ordering key of the by-size index: largest first, ties broken by start
    fn size_key(&self) -> (Reverse<u64>, u64) {
        (Reverse(self.size), self.start)
    }
}

/// Interval-based free space tracker with largest-block allocation
#[derive(Debug, Clone)]
pub struct IntervalSet {
    capacity: u64,
    by_start: Vec<Interval>,
    by_size: Vec<Interval>,
}

impl IntervalSet {
    /// Create a set with one free interval spanning `[0, capacity)`
    pub fn new(capacity: u64) -> Self {
        let mut set = Self {
            capacity,
            by_start: Vec::new(),
            by_size: Vec::new(),
        };
        if capacity > 0 {
            let whole = Interval::new(0, capacity);
            set.by_start.push(whole);
            set.by_size.push(whole);
        }
        set
    }

    /// Total bytes tracked by this set
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes currently free
    pub fn free_bytes(&self) -> u64 {
        self.by_start.iter().map(|interval| interval.size).sum()
    }

    /// Bytes currently marked used
    pub fn used_bytes(&self) -> u64 {
        self.capacity - self.free_bytes()
    }

    /// Size of the largest free interval, zero when nothing is free
    pub fn largest_free(&self) -> u64 {
        self.by_size.first().map_or(0, |interval| interval.size)
    }

    /// Number of disjoint free intervals
    pub fn interval_count(&self) -> usize {
        self.by_start.len()
    }

    /// True when every byte is free again
    pub fn is_empty(&self) -> bool {
        self.free_bytes() == self.capacity
    }

    /// Free intervals in ascending start order
    pub fn iter(&self) -> impl Iterator<Item = &Interval> {
        self.by_start.iter()
    }

    /// Find an offset where `size` bytes are free
    ///
    /// Uses a "largest available block" policy: only the head of the by-size index is
    /// inspected. If the largest block is too small no other block can be large enough,
    /// so `None` is returned without scanning.
    pub fn alloc_find(&self, size: u64) -> Option<u64> {
        self.by_size
            .first()
            .filter(|largest| largest.size >= size)
            .map(|largest| largest.start)
    }

    /// Find room for `size` bytes and mark it used in one step
    pub fn allocate(&mut self, size: u64) -> Option<u64> {
        let offset = self.alloc_find(size)?;
        // The head interval contains [offset, offset + size) by construction
        self.unset(offset, size).ok()?;
        Some(offset)
    }

    /// Mark `[offset, offset + size)` as used
    ///
    /// The range must lie entirely inside one free interval. Leading and trailing
    /// remainders of that interval stay free.
    pub fn unset(&mut self, offset: u64, size: u64) -> Result<(), IntervalError> {
        if size == 0 {
            return Ok(());
        }
        self.check_bounds(offset, size)?;

        let containing = self.by_start.partition_point(|interval| interval.start <= offset);
        let index = containing
            .checked_sub(1)
            .filter(|&index| self.by_start[index].end() >= offset + size)
            .ok_or(IntervalError::NotFree { offset, size })?;

        let interval = self.by_start[index];
        self.remove_by_size(interval);

        let leading = Interval::new(interval.start, offset - interval.start);
        let trailing = Interval::new(offset + size, interval.end() - (offset + size));

        match (leading.size > 0, trailing.size > 0) {
            (false, false) => {
                self.by_start.remove(index);
            }
            (true, false) => {
                self.by_start[index] = leading;
                self.insert_by_size(leading);
            }
            (false, true) => {
                self.by_start[index] = trailing;
                self.insert_by_size(trailing);
            }
            (true, true) => {
                self.by_start[index] = leading;
                self.by_start.insert(index + 1, trailing);
                self.insert_by_size(leading);
                self.insert_by_size(trailing);
            }
        }

        log::trace!("IntervalSet: unset [{}, {}), {} intervals", offset, offset + size, self.by_start.len());
        self.debug_check();
        Ok(())
    }

    /// Return `[offset, offset + size)` to the free pool
    ///
    /// Coalesces with the neighbouring free intervals when they touch the range, so up
    /// to three intervals collapse into one.
    pub fn set(&mut self, offset: u64, size: u64) -> Result<(), IntervalError> {
        if size == 0 {
            return Ok(());
        }
        self.check_bounds(offset, size)?;

        let next_index = self.by_start.partition_point(|interval| interval.start < offset);
        let prev = next_index.checked_sub(1).map(|index| self.by_start[index]);
        let next = self.by_start.get(next_index).copied();

        if prev.is_some_and(|prev| prev.end() > offset)
            || next.is_some_and(|next| next.start < offset + size)
        {
            return Err(IntervalError::Overlap { offset, size });
        }

        let merge_prev = prev.filter(|prev| prev.end() == offset);
        let merge_next = next.filter(|next| next.start == offset + size);

        let merged = match (merge_prev, merge_next) {
            (Some(prev), Some(next)) => {
                self.remove_by_size(prev);
                self.remove_by_size(next);
                let merged = Interval::new(prev.start, prev.size + size + next.size);
                self.by_start[next_index - 1] = merged;
                self.by_start.remove(next_index);
                merged
            }
            (Some(prev), None) => {
                self.remove_by_size(prev);
                let merged = Interval::new(prev.start, prev.size + size);
                self.by_start[next_index - 1] = merged;
                merged
            }
            (None, Some(next)) => {
                self.remove_by_size(next);
                let merged = Interval::new(offset, size + next.size);
                self.by_start[next_index] = merged;
                merged
            }
            (None, None) => {
                let fresh = Interval::new(offset, size);
                self.by_start.insert(next_index, fresh);
                fresh
            }
        };
        self.insert_by_size(merged);

        log::trace!("IntervalSet: set [{}, {}), {} intervals", offset, offset + size, self.by_start.len());
        self.debug_check();
        Ok(())
    }

    /// Verify both structural invariants
    ///
    /// Returns a description of the first violation found. Called after every mutation
    /// in debug builds.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.by_start.len() != self.by_size.len() {
            return Err(format!(
                "index length mismatch: {} by start, {} by size",
                self.by_start.len(),
                self.by_size.len()
            ));
        }
        for pair in self.by_start.windows(2) {
            if pair[0].end() >= pair[1].start {
                return Err(format!("intervals {:?} and {:?} overlap or touch", pair[0], pair[1]));
            }
        }
        for pair in self.by_size.windows(2) {
            if pair[0].size_key() > pair[1].size_key() {
                return Err(format!("by-size index out of order at {:?}", pair[1]));
            }
        }
        if let Some(interval) = self.by_start.iter().find(|interval| interval.size == 0 || interval.end() > self.capacity) {
            return Err(format!("interval {:?} is empty or exceeds capacity {}", interval, self.capacity));
        }
        let mut sorted = self.by_size.clone();
        sorted.sort_by_key(|interval| interval.start);
        if sorted != self.by_start {
            return Err("indices reference different interval sets".to_string());
        }
        Ok(())
    }

    fn check_bounds(&self, offset: u64, size: u64) -> Result<(), IntervalError> {
        match offset.checked_add(size) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(IntervalError::OutOfBounds { offset, size, capacity: self.capacity }),
        }
    }

    fn insert_by_size(&mut self, interval: Interval) {
        let key = interval.size_key();
        let index = self.by_size.partition_point(|entry| entry.size_key() < key);
        self.by_size.insert(index, interval);
    }

    fn remove_by_size(&mut self, interval: Interval) {
        let key = interval.size_key();
        match self.by_size.binary_search_by_key(&key, Interval::size_key) {
            Ok(index) => {
                self.by_size.remove(index);
            }
            Err(_) => debug_assert!(false, "interval {interval:?} missing from by-size index"),
        }
    }

    fn debug_check(&self) {
        #[cfg(debug_assertions)]
        if let Err(violation) = self.check_invariants() {
            panic!("IntervalSet invariant violated: {violation}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn intervals(set: &IntervalSet) -> Vec<(u64, u64)> {
        set.iter().map(|interval| (interval.start, interval.size)).collect()
    }

    /// Byte-granular model of which bytes are free
    fn free_map(set: &IntervalSet) -> Vec<bool> {
        let mut map = vec![false; set.capacity() as usize];
        for interval in set.iter() {
            for byte in interval.start..interval.end() {
                map[byte as usize] = true;
            }
        }
        map
    }

    #[test]
    fn test_new_set_is_one_interval() {
        let set = IntervalSet::new(256);
        assert_eq!(intervals(&set), vec![(0, 256)]);
        assert!(set.is_empty());
        assert_eq!(set.largest_free(), 256);

        let empty = IntervalSet::new(0);
        assert_eq!(empty.interval_count(), 0);
        assert_eq!(empty.alloc_find(1), None);
    }

    #[test]
    fn test_unset_splits_leading_and_trailing() {
        let mut set = IntervalSet::new(100);
        set.unset(40, 20).unwrap();
        assert_eq!(intervals(&set), vec![(0, 40), (60, 40)]);
        assert_eq!(set.used_bytes(), 20);

        set.unset(0, 10).unwrap();
        assert_eq!(intervals(&set), vec![(10, 30), (60, 40)]);

        set.unset(90, 10).unwrap();
        assert_eq!(intervals(&set), vec![(10, 30), (60, 30)]);

        set.unset(10, 30).unwrap();
        assert_eq!(intervals(&set), vec![(60, 30)]);
        set.check_invariants().unwrap();
    }

    #[test]
    fn test_unset_rejects_ranges_outside_one_free_interval() {
        let mut set = IntervalSet::new(100);
        set.unset(40, 20).unwrap();

        assert_eq!(set.unset(30, 20), Err(IntervalError::NotFree { offset: 30, size: 20 }));
        assert_eq!(set.unset(45, 5), Err(IntervalError::NotFree { offset: 45, size: 5 }));
        assert!(matches!(set.unset(90, 20), Err(IntervalError::OutOfBounds { .. })));
        assert_eq!(intervals(&set), vec![(0, 40), (60, 40)]);
    }

    #[test]
    fn test_set_coalesces_with_both_neighbours() {
        let mut set = IntervalSet::new(90);
        set.unset(0, 90).unwrap();
        set.set(0, 30).unwrap();
        set.set(60, 30).unwrap();
        assert_eq!(intervals(&set), vec![(0, 30), (60, 30)]);

        set.set(30, 30).unwrap();
        assert_eq!(intervals(&set), vec![(0, 90)]);
        assert!(set.is_empty());
    }

    #[test]
    fn test_set_rejects_double_free() {
        let mut set = IntervalSet::new(64);
        set.unset(16, 16).unwrap();
        assert_eq!(set.set(8, 16), Err(IntervalError::Overlap { offset: 8, size: 16 }));
        assert_eq!(set.set(24, 16), Err(IntervalError::Overlap { offset: 24, size: 16 }));
        set.set(16, 16).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_alloc_find_uses_largest_block() {
        let mut set = IntervalSet::new(100);
        set.unset(10, 10).unwrap();
        set.unset(50, 10).unwrap();
        // Free: (0,10) (20,30) (60,40)
        assert_eq!(set.alloc_find(5), Some(60));
        assert_eq!(set.alloc_find(40), Some(60));
        assert_eq!(set.alloc_find(41), None);
        assert_eq!(set.allocate(40), Some(60));
        assert_eq!(set.alloc_find(25), Some(20));
    }

    #[test]
    fn test_coalescing_is_order_independent() {
        let mut combined = IntervalSet::new(128);
        combined.unset(0, 128).unwrap();
        combined.set(32, 48).unwrap();

        let mut left_first = IntervalSet::new(128);
        left_first.unset(0, 128).unwrap();
        left_first.set(32, 16).unwrap();
        left_first.set(48, 32).unwrap();

        let mut right_first = IntervalSet::new(128);
        right_first.unset(0, 128).unwrap();
        right_first.set(48, 32).unwrap();
        right_first.set(32, 16).unwrap();

        assert_eq!(intervals(&left_first), intervals(&combined));
        assert_eq!(intervals(&right_first), intervals(&combined));
        assert_eq!(intervals(&combined), vec![(32, 48)]);
    }

    #[test]
    fn test_randomized_round_trip_keeps_invariants() {
        const CAPACITY: u64 = 512;
        let mut rng = StdRng::seed_from_u64(0x1f2e_3d4c);
        let mut set = IntervalSet::new(CAPACITY);
        let mut live: Vec<(u64, u64)> = Vec::new();
        let mut allocated = 0u64;

        for _ in 0..2_000 {
            if live.is_empty() || rng.gen_bool(0.55) {
                let size = rng.gen_range(1..=48);
                if let Some(offset) = set.allocate(size) {
                    live.push((offset, size));
                    allocated += size;
                }
            } else {
                let (offset, size) = live.swap_remove(rng.gen_range(0..live.len()));
                set.set(offset, size).unwrap();
                allocated -= size;
            }

            set.check_invariants().unwrap();
            assert_eq!(set.free_bytes(), CAPACITY - allocated);

            let map = free_map(&set);
            for &(offset, size) in &live {
                assert!((offset..offset + size).all(|byte| !map[byte as usize]));
            }
        }

        for (offset, size) in live.drain(..) {
            set.set(offset, size).unwrap();
        }
        assert_eq!(intervals(&set), vec![(0, CAPACITY)]);
    }

    #[test]
    fn test_alloc_find_matches_brute_force_scan() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut set = IntervalSet::new(1024);
        let mut live = Vec::new();

        for _ in 0..500 {
            if rng.gen_bool(0.6) {
                let size = rng.gen_range(1..=96);
                if let Some(offset) = set.allocate(size) {
                    live.push((offset, size));
                }
            } else if !live.is_empty() {
                let (offset, size) = live.swap_remove(rng.gen_range(0..live.len()));
                set.set(offset, size).unwrap();
            }

            let wanted = rng.gen_range(1..=256);
            let brute_force = set.iter().any(|interval| interval.size >= wanted);
            assert_eq!(set.alloc_find(wanted).is_some(), brute_force, "wanted {wanted}");
        }
    }
}
