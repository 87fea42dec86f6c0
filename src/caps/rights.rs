//! Capability Rights
//!
//! Rights control what operations a capability authorizes on its object.
//! Delegation is attenuation-only: a derived capability's rights are
//! always a subset of its parent's.

use bitflags::bitflags;

bitflags! {
    /// Rights mask carried by every capability.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Rights: u8 {
        /// Read the object (region bytes, endpoint receive).
        const READ = 1 << 0;
        /// Write the object (region bytes, endpoint send).
        const WRITE = 1 << 1;
        /// Execute from a memory region.
        const EXECUTE = 1 << 2;
        /// Derive attenuated child capabilities.
        const DELEGATE = 1 << 3;
        /// Revoke this capability and its descendants.
        const REVOKE = 1 << 4;
        /// Install a memory region into the holder's address space.
        const MAP = 1 << 5;
    }
}

impl Rights {
    /// Read-only access, mappable.
    pub const READ_MAP: Rights = Rights::READ.union(Rights::MAP);

    /// Read-write access, mappable.
    pub const RW_MAP: Rights = Rights::READ.union(Rights::WRITE).union(Rights::MAP);

    /// Check that `self` is a subset of `other`.
    #[inline]
    pub fn is_subset_of(self, other: Rights) -> bool {
        other.contains(self)
    }
}
