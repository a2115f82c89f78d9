//! Free-list allocator over a virtual arena
//!
//! Only offsets are handed out; the arena itself is allocated later with the
//! final high-water mark as its size.

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Which free range an allocation is carved from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocStrategy {
    /// Lowest free range that fits
    FirstFit,
    /// Smallest free range that fits, lowest offset on ties
    #[default]
    BestFit,
}

pub(crate) fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

#[derive(Debug, Clone)]
pub(crate) struct FreeListAllocator {
    strategy: AllocStrategy,
    alignment: usize,
    /// Sorted by start, never adjacent
    free: Vec<Range<usize>>,
    high_water: usize,
    live: usize,
    peak_live: usize,
}

impl FreeListAllocator {
    pub(crate) fn new(strategy: AllocStrategy, alignment: usize) -> Self {
        Self {
            strategy,
            alignment: alignment.max(1),
            free: Vec::new(),
            high_water: 0,
            live: 0,
            peak_live: 0,
        }
    }

    /// Size an allocation of `size` bytes actually occupies
    pub(crate) fn reserved(&self, size: usize) -> usize {
        align_up(size.max(1), self.alignment)
    }

    pub(crate) fn alloc(&mut self, size: usize) -> usize {
        let size = self.reserved(size);

        let candidate = match self.strategy {
            AllocStrategy::FirstFit => self.free.iter().position(|r| r.len() >= size),
            AllocStrategy::BestFit => self
                .free
                .iter()
                .enumerate()
                .filter(|(_, r)| r.len() >= size)
                .min_by_key(|(_, r)| (r.len(), r.start))
                .map(|(i, _)| i),
        };

        let offset = match candidate {
            Some(i) => {
                let range = &mut self.free[i];
                let offset = range.start;
                range.start += size;
                if range.is_empty() {
                    self.free.remove(i);
                }
                offset
            }
            // A free range touching the top can grow the arena in place
            None => match self.free.last() {
                Some(last) if last.end == self.high_water => {
                    let offset = last.start;
                    self.free.pop();
                    self.high_water = offset + size;
                    offset
                }
                _ => {
                    let offset = self.high_water;
                    self.high_water += size;
                    offset
                }
            },
        };

        self.live += size;
        self.peak_live = self.peak_live.max(self.live);
        offset
    }

    pub(crate) fn free(&mut self, offset: usize, size: usize) {
        let size = self.reserved(size);
        self.live -= size;

        let index = self.free.partition_point(|r| r.start < offset);
        self.free.insert(index, offset..offset + size);

        // Coalesce with the following range, then the preceding one
        if index + 1 < self.free.len() && self.free[index].end == self.free[index + 1].start {
            let next = self.free.remove(index + 1);
            self.free[index].end = next.end;
        }
        if index > 0 && self.free[index - 1].end == self.free[index].start {
            let current = self.free.remove(index);
            self.free[index - 1].end = current.end;
        }
    }

    pub(crate) fn high_water(&self) -> usize {
        self.high_water
    }

    pub(crate) fn peak_live(&self) -> usize {
        self.peak_live
    }

    #[cfg(test)]
    fn free_ranges(&self) -> &[Range<usize>] {
        &self.free
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reuse_after_free() {
        let mut alloc = FreeListAllocator::new(AllocStrategy::FirstFit, 32);
        let a = alloc.alloc(64);
        let b = alloc.alloc(64);
        assert_eq!((a, b), (0, 64));
        alloc.free(a, 64);
        assert_eq!(alloc.alloc(40), 0);
        assert_eq!(alloc.high_water(), 128);
        assert_eq!(alloc.peak_live(), 128);
    }

    #[test]
    fn test_coalescing() {
        let mut alloc = FreeListAllocator::new(AllocStrategy::FirstFit, 16);
        let a = alloc.alloc(16);
        let b = alloc.alloc(16);
        let c = alloc.alloc(16);
        let _d = alloc.alloc(16);
        alloc.free(a, 16);
        alloc.free(c, 16);
        assert_eq!(alloc.free_ranges(), &[0..16, 32..48]);
        alloc.free(b, 16);
        assert_eq!(alloc.free_ranges(), &[0..48]);
        assert_eq!(alloc.alloc(48), 0);
    }

    #[test]
    fn test_best_fit_picks_smallest_hole() {
        let mut first = FreeListAllocator::new(AllocStrategy::FirstFit, 8);
        let mut best = FreeListAllocator::new(AllocStrategy::BestFit, 8);
        for alloc in [&mut first, &mut best] {
            let big = alloc.alloc(64);
            let _keep = alloc.alloc(8);
            let small = alloc.alloc(16);
            let _keep2 = alloc.alloc(8);
            alloc.free(big, 64);
            alloc.free(small, 16);
        }
        assert_eq!(first.alloc(16), 0);
        assert_eq!(best.alloc(16), 72);
    }

    #[test]
    fn test_top_range_grows_in_place() {
        let mut alloc = FreeListAllocator::new(AllocStrategy::BestFit, 32);
        let a = alloc.alloc(32);
        let b = alloc.alloc(32);
        alloc.free(b, 32);
        assert_eq!(alloc.alloc(96), 32);
        assert_eq!(alloc.high_water(), 128);
        alloc.free(a, 32);
        assert_eq!(alloc.peak_live(), 128);
    }
}
