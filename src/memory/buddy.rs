//! Buddy Allocator
//!
//! Power-of-two block allocator over a fixed page-granular arena. Free
//! lists are indexed by block order; allocation takes the smallest free
//! block that fits, splitting larger blocks on the way down, and freeing
//! merges adjacent buddies back up the order hierarchy.
//!
//! The allocator tracks an accounting counter alongside the free lists.
//! The two must always agree on the arena size; a mismatch means the
//! free lists are corrupt and is fatal (`AccountingViolation`).

use crate::config::{MAX_ORDER, PAGE_SIZE};
use crate::error::{KernelError, Result};

const fn block_size(order: usize) -> usize {
    PAGE_SIZE << order
}

/// Offset-based buddy allocator. Works purely on arena offsets; the
/// backing bytes live in the region manager.
pub struct BuddyArena {
    arena_size: usize,
    /// Free block offsets per order, `free_lists[o]` holding blocks of
    /// `PAGE_SIZE << o` bytes. Offsets are self-aligned to their size.
    free_lists: Vec<Vec<usize>>,
    /// Bytes currently handed out, counted in whole blocks.
    allocated: usize,
}

impl BuddyArena {
    /// Build an allocator over `arena_size` bytes. The size must be a
    /// nonzero multiple of `PAGE_SIZE`; it is decomposed greedily into
    /// maximal self-aligned power-of-two blocks.
    pub fn new(arena_size: usize) -> Result<Self> {
        if arena_size == 0 || arena_size % PAGE_SIZE != 0 {
            return Err(KernelError::OutOfMemory {
                requested: arena_size,
            });
        }
        let mut arena = Self {
            arena_size,
            free_lists: vec![Vec::new(); MAX_ORDER + 1],
            allocated: 0,
        };
        let mut offset = 0;
        while offset < arena_size {
            let remaining = arena_size - offset;
            let mut order = MAX_ORDER;
            while order > 0 && (block_size(order) > remaining || offset % block_size(order) != 0) {
                order -= 1;
            }
            arena.free_lists[order].push(offset);
            offset += block_size(order);
        }
        Ok(arena)
    }

    pub fn arena_size(&self) -> usize {
        self.arena_size
    }

    /// Bytes currently allocated (whole blocks).
    pub fn allocated_bytes(&self) -> usize {
        self.allocated
    }

    /// Bytes on the free lists.
    pub fn free_bytes(&self) -> usize {
        self.free_lists
            .iter()
            .enumerate()
            .map(|(order, list)| list.len() * block_size(order))
            .sum()
    }

    fn order_for(size: usize, align: usize) -> Option<usize> {
        let needed = size.max(align).max(PAGE_SIZE);
        (0..=MAX_ORDER).find(|&order| block_size(order) >= needed)
    }

    /// Allocate the smallest block covering `size` bytes at `align`
    /// alignment. Returns `(offset, block_size)`.
    ///
    /// Buddy blocks are self-aligned, so any power-of-two alignment up to
    /// the block size is satisfied by construction.
    pub fn allocate(&mut self, size: usize, align: usize) -> Result<(usize, usize)> {
        if size == 0 || !align.is_power_of_two() {
            return Err(KernelError::OutOfMemory { requested: size });
        }
        let order =
            Self::order_for(size, align).ok_or(KernelError::OutOfMemory { requested: size })?;

        let found = (order..=MAX_ORDER).find(|&o| !self.free_lists[o].is_empty());
        let mut current = match found {
            Some(o) => o,
            None => return Err(KernelError::OutOfMemory { requested: size }),
        };

        let offset = self.free_lists[current].pop().expect("non-empty list");
        // Split down to the requested order, returning the upper buddy of
        // each split to its free list.
        while current > order {
            current -= 1;
            self.free_lists[current].push(offset + block_size(current));
        }

        self.allocated += block_size(order);
        debug_assert!(self.verify().is_ok());
        Ok((offset, block_size(order)))
    }

    /// Return a block to the arena and merge with free buddies as far up
    /// as possible. `size` must be the block size returned by `allocate`;
    /// anything else is an accounting error, not a panic.
    pub fn free(&mut self, offset: usize, size: usize) -> Result<()> {
        let Some(mut order) = (0..=MAX_ORDER).find(|&o| block_size(o) == size) else {
            return Err(KernelError::AccountingViolation(
                "freed size is not a block size",
            ));
        };
        self.allocated -= size;

        let mut offset = offset;
        while order < MAX_ORDER {
            let buddy = offset ^ block_size(order);
            match self.free_lists[order].iter().position(|&b| b == buddy) {
                Some(pos) => {
                    self.free_lists[order].swap_remove(pos);
                    offset = offset.min(buddy);
                    order += 1;
                }
                None => break,
            }
        }
        self.free_lists[order].push(offset);
        debug_assert!(self.verify().is_ok());
        Ok(())
    }

    /// Cross-check the accounting counter against the free lists.
    pub fn verify(&self) -> Result<()> {
        if self.allocated + self.free_bytes() != self.arena_size {
            return Err(KernelError::AccountingViolation(
                "allocated + free bytes != arena size",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_splits_and_free_merges() {
        let mut arena = BuddyArena::new(16 * PAGE_SIZE).unwrap();
        assert_eq!(arena.free_bytes(), 16 * PAGE_SIZE);

        let (a, a_size) = arena.allocate(PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(a_size, PAGE_SIZE);
        let (b, b_size) = arena.allocate(3 * PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(b_size, 4 * PAGE_SIZE);
        assert_ne!(a, b);
        assert!(arena.verify().is_ok());

        arena.free(a, a_size).unwrap();
        arena.free(b, b_size).unwrap();
        // Everything merged back into the original single block.
        assert_eq!(arena.free_bytes(), 16 * PAGE_SIZE);
        assert_eq!(arena.allocated_bytes(), 0);
        assert_eq!(arena.free_lists[4].len(), 1);
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let mut arena = BuddyArena::new(2 * PAGE_SIZE).unwrap();
        let (a, sa) = arena.allocate(PAGE_SIZE, PAGE_SIZE).unwrap();
        let (_b, _sb) = arena.allocate(PAGE_SIZE, PAGE_SIZE).unwrap();
        assert!(matches!(
            arena.allocate(PAGE_SIZE, PAGE_SIZE),
            Err(KernelError::OutOfMemory { .. })
        ));

        // Freeing one page makes room again.
        arena.free(a, sa).unwrap();
        assert!(arena.allocate(PAGE_SIZE, PAGE_SIZE).is_ok());
    }

    #[test]
    fn alignment_rounds_up_block_order() {
        let mut arena = BuddyArena::new(8 * PAGE_SIZE).unwrap();
        let (offset, size) = arena.allocate(PAGE_SIZE, 4 * PAGE_SIZE).unwrap();
        assert_eq!(size, 4 * PAGE_SIZE);
        assert_eq!(offset % (4 * PAGE_SIZE), 0);
    }

    #[test]
    fn free_rejects_unknown_block_size() {
        let mut arena = BuddyArena::new(8 * PAGE_SIZE).unwrap();
        let (offset, size) = arena.allocate(PAGE_SIZE, PAGE_SIZE).unwrap();
        // 3 pages is never a block size, so this cannot have come from
        // allocate and must not touch the free lists.
        assert!(matches!(
            arena.free(offset, 3 * PAGE_SIZE),
            Err(KernelError::AccountingViolation(_))
        ));
        assert!(arena.verify().is_ok());
        arena.free(offset, size).unwrap();
        assert_eq!(arena.allocated_bytes(), 0);
    }

    #[test]
    fn oversized_request_fails() {
        let mut arena = BuddyArena::new(4 * PAGE_SIZE).unwrap();
        assert!(matches!(
            arena.allocate((PAGE_SIZE << MAX_ORDER) * 2, PAGE_SIZE),
            Err(KernelError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn non_power_of_two_arena_decomposes() {
        // 5 pages: one 4-page block plus one single page.
        let mut arena = BuddyArena::new(5 * PAGE_SIZE).unwrap();
        assert_eq!(arena.free_bytes(), 5 * PAGE_SIZE);
        let (_o, size) = arena.allocate(4 * PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(size, 4 * PAGE_SIZE);
        assert_eq!(arena.free_bytes(), PAGE_SIZE);
        assert!(arena.verify().is_ok());
    }
}
