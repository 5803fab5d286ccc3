// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::DeviceMemory;
use crate::DeviceSize;
use std::{ffi::c_void, ops::Range, ptr::NonNull, sync::Arc};

/// One `DeviceMemory` allocation owned by a bank, which chunks are carved out of.
///
/// Everything in a `Region` is fixed at creation. The occupancy of its blocks is tracked
/// separately, in the [`RegionSlot`] that the bank keeps behind its lock.
#[derive(Debug)]
pub(super) struct Region {
    memory: DeviceMemory,
}

impl Region {
    #[inline]
    pub(super) fn new(memory: DeviceMemory) -> Self {
        Region { memory }
    }

    #[inline]
    pub(super) fn memory(&self) -> &DeviceMemory {
        &self.memory
    }

    #[inline]
    pub(super) fn capacity(&self) -> DeviceSize {
        self.memory.allocation_size()
    }

    #[inline]
    pub(super) fn memory_type_index(&self) -> u32 {
        self.memory.memory_type_index()
    }

    #[inline]
    pub(super) fn mapped_ptr(&self) -> Option<NonNull<c_void>> {
        self.memory.mapped_ptr()
    }
}

/// A region together with its block map, as stored in the bank's region list.
#[derive(Debug)]
pub(super) struct RegionSlot {
    pub(super) region: Arc<Region>,
    pub(super) blocks: BlockMap,
}

const WORD_BITS: usize = u64::BITS as usize;

/// One bit per block of a region: `0` means free, `1` means allocated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct BlockMap {
    // Bits past `len` in the last word are always zero.
    words: Vec<u64>,
    len: usize,
}

impl BlockMap {
    /// Creates a map of `len` free blocks.
    pub(super) fn new(len: usize) -> Self {
        BlockMap {
            words: vec![0; len.div_ceil(WORD_BITS)],
            len,
        }
    }

    /// Total number of blocks.
    #[inline]
    pub(super) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(super) fn is_allocated(&self, index: usize) -> bool {
        assert!(index < self.len);

        self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    /// Number of allocated blocks.
    pub(super) fn count_allocated(&self) -> usize {
        self.words
            .iter()
            .map(|word| word.count_ones() as usize)
            .sum()
    }

    /// Returns `true` if no block is allocated.
    pub(super) fn is_free(&self) -> bool {
        self.words.iter().all(|&word| word == 0)
    }

    pub(super) fn set_allocated(&mut self, range: Range<usize>) {
        self.set_range(range, true);
    }

    pub(super) fn set_free(&mut self, range: Range<usize>) {
        self.set_range(range, false);
    }

    fn set_range(&mut self, range: Range<usize>, value: bool) {
        assert!(range.start <= range.end && range.end <= self.len);

        let mut index = range.start;

        while index < range.end {
            let word_index = index / WORD_BITS;
            let bit = index % WORD_BITS;
            let count = usize::min(WORD_BITS - bit, range.end - index);
            let mask = low_bits(count) << bit;

            if value {
                self.words[word_index] |= mask;
            } else {
                self.words[word_index] &= !mask;
            }

            index += count;
        }
    }

    /// Returns the index of the first block at or after `from` whose state is `allocated`, or
    /// `self.len()` if there is none.
    fn next_with(&self, from: usize, allocated: bool) -> usize {
        let mut index = from;

        while index < self.len {
            let word_index = index / WORD_BITS;
            let word = if allocated {
                self.words[word_index]
            } else {
                !self.words[word_index]
            };
            let word = word >> (index % WORD_BITS);

            if word != 0 {
                return usize::min(index + word.trailing_zeros() as usize, self.len);
            }

            index = (word_index + 1) * WORD_BITS;
        }

        self.len
    }

    /// Iterates over the maximal runs of free blocks, from left to right.
    #[inline]
    pub(super) fn free_runs(&self) -> FreeRuns<'_> {
        FreeRuns {
            blocks: self,
            next: 0,
        }
    }
}

#[inline]
fn low_bits(count: usize) -> u64 {
    if count >= WORD_BITS {
        !0
    } else {
        (1 << count) - 1
    }
}

/// Iterator returned by [`BlockMap::free_runs`].
pub(super) struct FreeRuns<'a> {
    blocks: &'a BlockMap,
    next: usize,
}

impl Iterator for FreeRuns<'_> {
    type Item = Range<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.blocks.next_with(self.next, false);

        if start >= self.blocks.len() {
            self.next = start;
            return None;
        }

        let end = self.blocks.next_with(start, true);
        self.next = end;

        Some(start..end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_map_is_free() {
        let blocks = BlockMap::new(100);

        assert_eq!(blocks.len(), 100);
        assert!(blocks.is_free());
        assert_eq!(blocks.count_allocated(), 0);
        assert_eq!(blocks.free_runs().collect::<Vec<_>>(), [0..100]);
    }

    #[test]
    fn empty_map() {
        let blocks = BlockMap::new(0);

        assert!(blocks.is_free());
        assert_eq!(blocks.free_runs().next(), None);
    }

    #[test]
    fn set_across_words() {
        let mut blocks = BlockMap::new(200);

        blocks.set_allocated(60..130);
        assert_eq!(blocks.count_allocated(), 70);
        assert!(!blocks.is_allocated(59));
        assert!(blocks.is_allocated(60));
        assert!(blocks.is_allocated(64));
        assert!(blocks.is_allocated(128));
        assert!(blocks.is_allocated(129));
        assert!(!blocks.is_allocated(130));
        assert_eq!(blocks.free_runs().collect::<Vec<_>>(), [0..60, 130..200]);

        blocks.set_free(64..128);
        assert_eq!(blocks.count_allocated(), 6);
        assert_eq!(
            blocks.free_runs().collect::<Vec<_>>(),
            [0..60, 64..128, 130..200],
        );

        blocks.set_free(0..200);
        assert!(blocks.is_free());
    }

    #[test]
    fn full_words() {
        let mut blocks = BlockMap::new(128);

        blocks.set_allocated(0..128);
        assert_eq!(blocks.count_allocated(), 128);
        assert_eq!(blocks.free_runs().next(), None);

        blocks.set_free(127..128);
        assert_eq!(blocks.free_runs().collect::<Vec<_>>(), [127..128]);
    }

    #[test]
    fn runs_stop_at_len() {
        let mut blocks = BlockMap::new(70);

        blocks.set_allocated(0..3);
        blocks.set_allocated(69..70);
        assert_eq!(blocks.free_runs().collect::<Vec<_>>(), [3..69]);

        blocks.set_free(69..70);
        assert_eq!(blocks.free_runs().collect::<Vec<_>>(), [3..70]);
    }

    #[test]
    fn empty_range_is_noop() {
        let mut blocks = BlockMap::new(10);

        blocks.set_allocated(4..4);
        assert!(blocks.is_free());
    }

    #[test]
    fn out_of_bounds_range() {
        let mut blocks = BlockMap::new(10);

        assert_should_panic!({ blocks.set_allocated(5..11) });
    }
}
