//! Memory Region Manager
//!
//! Manages physically-backed, page-granular memory regions carved out of
//! a fixed arena by the buddy allocator. Regions back zero-copy IPC
//! transfers: instead of copying payload bytes, a capability to the
//! region travels in the message descriptor.
//!
//! The arena is modeled as a byte buffer owned by the manager; mappings
//! enforce the access-mode restrictions that page-table protection bits
//! would enforce on hardware. All mutation goes through the manager's
//! entry points; there is no direct field access from other components.

mod buddy;

pub use buddy::BuddyArena;

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, trace};

use crate::caps::{CapId, ProcessId, RegionId};
use crate::error::{KernelError, Result};

/// How a region may be accessed by its current owners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Exactly one owner, full access.
    Exclusive,
    /// Multiple owners, read-only for everyone.
    SharedRead,
    /// Multiple owners, read-write.
    SharedWrite,
}

impl AccessMode {
    pub fn allows_write(self) -> bool {
        !matches!(self, AccessMode::SharedRead)
    }
}

/// A page-granular memory region.
#[derive(Debug)]
pub struct Region {
    id: RegionId,
    offset: usize,
    /// Usable length requested by the caller.
    len: usize,
    /// Whole buddy block backing the region.
    block_size: usize,
    owners: BTreeSet<ProcessId>,
    mode: AccessMode,
}

impl Region {
    pub fn id(&self) -> RegionId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn owners(&self) -> impl Iterator<Item = ProcessId> + '_ {
        self.owners.iter().copied()
    }
}

/// An installed view of a region, the software analogue of a page-table
/// mapping. `writable` reflects both the region's access mode and the
/// mapping capability's rights; every access through the kernel
/// re-validates the capability, so revocation tears mappings down lazily.
#[derive(Debug, Clone, Copy)]
pub struct RegionMapping {
    pub cap: CapId,
    pub region: RegionId,
    pub len: usize,
    pub writable: bool,
}

/// Snapshot of arena usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub arena_size: usize,
    pub allocated_bytes: usize,
    pub free_bytes: usize,
    pub regions: usize,
}

/// Owner of the arena and the region table.
pub struct RegionManager {
    arena: Vec<u8>,
    buddy: BuddyArena,
    regions: BTreeMap<RegionId, Region>,
    next_region: u64,
}

impl RegionManager {
    /// Initialize the manager over a fresh arena. Called exactly once by
    /// platform init before any allocation.
    pub fn new(arena_size: usize) -> Result<Self> {
        let buddy = BuddyArena::new(arena_size)?;
        Ok(Self {
            arena: vec![0; arena_size],
            buddy,
            regions: BTreeMap::new(),
            next_region: 1,
        })
    }

    /// Allocate a region of at least `size` bytes at `align` alignment,
    /// exclusively owned by `owner`.
    pub fn allocate(&mut self, owner: ProcessId, size: usize, align: usize) -> Result<RegionId> {
        let (offset, block_size) = self.buddy.allocate(size, align)?;
        let id = RegionId(self.next_region);
        self.next_region += 1;

        let mut owners = BTreeSet::new();
        owners.insert(owner);
        self.regions.insert(
            id,
            Region {
                id,
                offset,
                len: size,
                block_size,
                owners,
                mode: AccessMode::Exclusive,
            },
        );
        trace!("allocated region{} ({size} bytes) for {owner}", id.0);
        Ok(id)
    }

    pub fn region(&self, id: RegionId) -> Result<&Region> {
        self.regions.get(&id).ok_or(KernelError::ExpiredCapability)
    }

    /// Add `pid` to the owner set, transitioning out of exclusive mode.
    /// The capability-side authorization (DELEGATE on the region) happens
    /// in the kernel facade before this is called.
    pub fn add_owner(&mut self, id: RegionId, pid: ProcessId, mode: AccessMode) -> Result<()> {
        let region = self
            .regions
            .get_mut(&id)
            .ok_or(KernelError::ExpiredCapability)?;
        if mode == AccessMode::Exclusive {
            // A second owner cannot join an exclusive region as exclusive.
            return Err(KernelError::InsufficientRights);
        }
        region.mode = mode;
        region.owners.insert(pid);
        debug_assert!(region.mode != AccessMode::Exclusive || region.owners.len() == 1);
        Ok(())
    }

    /// Drop `pid` from the owner set. The region is destroyed and its
    /// block returned to the arena once no owners remain. Returns whether
    /// the region was destroyed.
    pub fn remove_owner(&mut self, id: RegionId, pid: ProcessId) -> Result<bool> {
        let region = self
            .regions
            .get_mut(&id)
            .ok_or(KernelError::ExpiredCapability)?;
        region.owners.remove(&pid);
        if region.owners.is_empty() {
            let region = self.regions.remove(&id).expect("present above");
            self.buddy.free(region.offset, region.block_size)?;
            debug!("region{} destroyed, {} bytes freed", id.0, region.block_size);
            return Ok(true);
        }
        Ok(false)
    }

    /// Drop `pid` from every region it owns (termination cleanup).
    pub fn release_all(&mut self, pid: ProcessId) {
        let owned: Vec<RegionId> = self
            .regions
            .values()
            .filter(|r| r.owners.contains(&pid))
            .map(|r| r.id)
            .collect();
        for id in owned {
            let _ = self.remove_owner(id, pid);
        }
    }

    /// Read `len` bytes at `offset` within the region.
    pub fn read(&self, id: RegionId, offset: usize, len: usize) -> Result<&[u8]> {
        let region = self.region(id)?;
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= region.len)
            .ok_or(KernelError::InsufficientRights)?;
        Ok(&self.arena[region.offset + offset..region.offset + end])
    }

    /// Write `data` at `offset` within the region. Mode enforcement is
    /// the mapping's job; this is the raw arena access.
    pub fn write(&mut self, id: RegionId, offset: usize, data: &[u8]) -> Result<()> {
        let region = self
            .regions
            .get(&id)
            .ok_or(KernelError::ExpiredCapability)?;
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= region.len)
            .ok_or(KernelError::InsufficientRights)?;
        let base = region.offset;
        self.arena[base + offset..base + end].copy_from_slice(data);
        Ok(())
    }

    /// Cross-check allocator accounting (fatal on mismatch).
    pub fn verify(&self) -> Result<()> {
        self.buddy.verify()
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            arena_size: self.buddy.arena_size(),
            allocated_bytes: self.buddy.allocated_bytes(),
            free_bytes: self.buddy.free_bytes(),
            regions: self.regions.len(),
        }
    }
}
