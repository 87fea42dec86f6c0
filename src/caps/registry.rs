//! Capability Registry
//!
//! The registry owns the mapping from unforgeable capability identifiers
//! to kernel objects and their permitted operations. It is the single
//! authority that mints or copies-with-attenuation capabilities; every
//! other component consults [`CapRegistry::check`] before acting.
//!
//! ## Handle encoding
//!
//! A [`CapId`] packs a slot index and a per-slot generation, mixed with a
//! per-boot nonce so handles are not guessable. Freeing a slot bumps its
//! generation, so a stale handle no longer resolves.
//!
//! ## Revocation
//!
//! Revocation is O(1) per capability regardless of delegation fan-out:
//! the revoked slot is freed and its generation bumped. Every derived
//! capability records its issuing chain (ancestor handles, bounded by
//! `MAX_DELEGATION_DEPTH`), and `check()` re-resolves that chain, so
//! descendants of a revoked capability fail lazily on next use. There is
//! no eager tree walk.
//!
//! Revocation, expiry, and absence are indistinguishable to callers: all
//! three surface as `ExpiredCapability`.

use log::{debug, trace};

use crate::caps::audit::{AuditOp, AuditRecord, AuditRing};
use crate::caps::{ObjectRef, ProcessId, Rights};
use crate::config::{AUDIT_RING_CAPACITY, MAX_DELEGATION_DEPTH};
use crate::error::{KernelError, Result};
use crate::sched::Tick;

/// Unforgeable capability handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CapId(u64);

impl CapId {
    /// Reconstruct a handle from its raw representation.
    ///
    /// Raw values are opaque; this exists for diagnostics and wire
    /// transfer of handles inside message descriptors.
    pub fn from_raw(raw: u64) -> Self {
        CapId(raw)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for CapId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "cap:{:#018x}", self.0)
    }
}

/// One capability record.
#[derive(Debug, Clone)]
struct CapEntry {
    holder: ProcessId,
    object: ObjectRef,
    rights: Rights,
    /// Absolute tick after which the capability is invalid. `None` never
    /// expires.
    expiry: Option<Tick>,
    depth: u8,
    /// Ancestor handles, root first. Bounded by `MAX_DELEGATION_DEPTH`.
    chain: Vec<CapId>,
}

struct Slot {
    generation: u32,
    entry: Option<CapEntry>,
}

/// Snapshot of registry counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapStats {
    pub active: usize,
    pub slots: usize,
    pub audit_records: usize,
    pub audit_appended: u64,
}

/// Arena-indexed capability table plus the audit ring.
///
/// Never reached as an ambient global: callers hold an explicit reference,
/// which keeps unit tests isolated.
pub struct CapRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    nonce: u64,
    audit: AuditRing,
}

impl CapRegistry {
    /// Create an empty registry. `nonce` is mixed into every handle and
    /// should differ per boot.
    pub fn new(nonce: u64) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            nonce,
            audit: AuditRing::new(AUDIT_RING_CAPACITY),
        }
    }

    fn encode(&self, index: u32, generation: u32) -> CapId {
        CapId(self.nonce ^ (((generation as u64) << 32) | index as u64))
    }

    fn decode(&self, cap: CapId) -> Option<(u32, u32)> {
        let mixed = cap.0 ^ self.nonce;
        let index = (mixed & 0xffff_ffff) as u32;
        let generation = (mixed >> 32) as u32;
        if (index as usize) < self.slots.len() {
            Some((index, generation))
        } else {
            None
        }
    }

    /// Resolve a handle to its live entry, honoring generation and expiry.
    fn entry(&self, cap: CapId, now: Tick) -> Option<&CapEntry> {
        let (index, generation) = self.decode(cap)?;
        let slot = &self.slots[index as usize];
        if slot.generation != generation {
            return None;
        }
        let entry = slot.entry.as_ref()?;
        if let Some(expiry) = entry.expiry {
            if now >= expiry {
                return None;
            }
        }
        Some(entry)
    }

    /// Resolve a handle and re-validate its whole issuing chain.
    fn live_entry(&self, cap: CapId, now: Tick) -> Option<&CapEntry> {
        let entry = self.entry(cap, now)?;
        for ancestor in &entry.chain {
            self.entry(*ancestor, now)?;
        }
        Some(entry)
    }

    fn insert(&mut self, entry: CapEntry) -> CapId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        debug_assert!(slot.entry.is_none());
        slot.entry = Some(entry);
        let generation = slot.generation;
        self.encode(index, generation)
    }

    fn record(&mut self, cap: CapId, accessor: ProcessId, op: AuditOp, now: Tick, outcome: bool) {
        self.audit.append(AuditRecord {
            cap,
            accessor,
            operation: op,
            timestamp: now,
            outcome,
        });
    }

    /// Mint a capability with no parent. Reserved for the kernel itself:
    /// boot-time root capabilities, freshly allocated regions, endpoint
    /// pairs, and device grants.
    pub fn mint_root(
        &mut self,
        holder: ProcessId,
        object: ObjectRef,
        rights: Rights,
        expiry: Option<Tick>,
        now: Tick,
    ) -> CapId {
        let cap = self.insert(CapEntry {
            holder,
            object,
            rights,
            expiry,
            depth: 0,
            chain: Vec::new(),
        });
        trace!("mint root {cap} for {holder} on {object} rights={rights:?}");
        self.record(cap, holder, AuditOp::Mint, now, true);
        cap
    }

    /// Mint a new capability on `object`, authorized by an existing parent
    /// capability of the accessor.
    ///
    /// Fails with `RightsEscalation` if `rights` is not a subset of the
    /// parent's mask, `ExpiredCapability` if the parent no longer
    /// resolves, `InsufficientRights` if the parent cannot delegate, and
    /// `DepthExceeded` past the chain bound. Validation happens before
    /// any mutation; failures never partially apply.
    pub fn mint(
        &mut self,
        accessor: ProcessId,
        parent: CapId,
        object: ObjectRef,
        rights: Rights,
        expiry: Option<Tick>,
        now: Tick,
    ) -> Result<CapId> {
        let derived = self.derive(accessor, parent, accessor, object, rights, expiry, now);
        let outcome = derived.is_ok();
        self.record(derived.unwrap_or(parent), accessor, AuditOp::Mint, now, outcome);
        derived
    }

    /// Copy-with-attenuation: grant `new_holder` a child of `cap` on the
    /// same object with `attenuated` rights.
    pub fn delegate(
        &mut self,
        accessor: ProcessId,
        cap: CapId,
        new_holder: ProcessId,
        attenuated: Rights,
        expiry: Option<Tick>,
        now: Tick,
    ) -> Result<CapId> {
        let object = match self.live_entry(cap, now) {
            Some(entry) if entry.holder == accessor => entry.object,
            Some(_) | None => {
                self.record(cap, accessor, AuditOp::Delegate, now, false);
                return Err(KernelError::ExpiredCapability);
            }
        };
        let derived = self.derive(accessor, cap, new_holder, object, attenuated, expiry, now);
        let outcome = derived.is_ok();
        self.record(derived.unwrap_or(cap), accessor, AuditOp::Delegate, now, outcome);
        derived
    }

    fn derive(
        &mut self,
        accessor: ProcessId,
        parent: CapId,
        new_holder: ProcessId,
        object: ObjectRef,
        rights: Rights,
        expiry: Option<Tick>,
        now: Tick,
    ) -> Result<CapId> {
        let parent_entry = self
            .live_entry(parent, now)
            .filter(|entry| entry.holder == accessor)
            .ok_or(KernelError::ExpiredCapability)?;

        if !parent_entry.rights.contains(Rights::DELEGATE) {
            return Err(KernelError::InsufficientRights);
        }
        if !rights.is_subset_of(parent_entry.rights) {
            return Err(KernelError::RightsEscalation);
        }
        if parent_entry.depth >= MAX_DELEGATION_DEPTH {
            return Err(KernelError::DepthExceeded);
        }

        let mut chain = parent_entry.chain.clone();
        chain.push(parent);
        let depth = parent_entry.depth + 1;

        let cap = self.insert(CapEntry {
            holder: new_holder,
            object,
            rights,
            expiry,
            depth,
            chain,
        });
        trace!("derive {cap} for {new_holder} on {object} depth={depth} rights={rights:?}");
        Ok(cap)
    }

    /// Revoke `cap`. O(1): frees the slot and bumps its generation.
    /// Descendants fail lazily when their issuing chain is next checked.
    pub fn revoke(&mut self, accessor: ProcessId, cap: CapId, now: Tick) -> Result<()> {
        let valid = matches!(self.entry(cap, now), Some(entry) if entry.holder == accessor);
        if !valid {
            self.record(cap, accessor, AuditOp::Revoke, now, false);
            return Err(KernelError::ExpiredCapability);
        }
        let (index, _) = self.decode(cap).expect("validated above");
        self.free_slot(index);
        debug!("revoke {cap} by {accessor}");
        self.record(cap, accessor, AuditOp::Revoke, now, true);
        Ok(())
    }

    fn free_slot(&mut self, index: u32) {
        let slot = &mut self.slots[index as usize];
        slot.entry = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
    }

    /// The single choke point: validate `cap` for `accessor` and the
    /// required rights, returning the object it names. Every call is
    /// audited with its outcome.
    pub fn check(
        &mut self,
        accessor: ProcessId,
        cap: CapId,
        required: Rights,
        now: Tick,
    ) -> Result<ObjectRef> {
        let result = match self.live_entry(cap, now) {
            Some(entry) if entry.holder == accessor => {
                if entry.rights.contains(required) {
                    Ok(entry.object)
                } else {
                    Err(KernelError::InsufficientRights)
                }
            }
            Some(_) | None => Err(KernelError::ExpiredCapability),
        };
        trace!("check {cap} by {accessor} required={required:?} -> {result:?}");
        self.record(cap, accessor, AuditOp::Check, now, result.is_ok());
        result
    }

    /// Rights mask of a live capability, without an audit record.
    /// Internal helper for attenuation decisions in the IPC path.
    pub(crate) fn rights_of(&self, cap: CapId, now: Tick) -> Option<Rights> {
        self.live_entry(cap, now).map(|entry| entry.rights)
    }

    /// Object of a live capability held by `holder`, without auditing.
    pub(crate) fn object_of(&self, holder: ProcessId, cap: CapId, now: Tick) -> Option<ObjectRef> {
        self.live_entry(cap, now)
            .filter(|entry| entry.holder == holder)
            .map(|entry| entry.object)
    }

    /// Revoke every capability held by `pid`. Part of the termination
    /// cascade; returns how many were dropped.
    pub fn revoke_held_by(&mut self, pid: ProcessId, now: Tick) -> usize {
        let mut dropped = 0;
        for index in 0..self.slots.len() as u32 {
            let holder = self.slots[index as usize]
                .entry
                .as_ref()
                .map(|entry| entry.holder);
            if holder == Some(pid) {
                let cap = self.encode(index, self.slots[index as usize].generation);
                self.free_slot(index);
                self.record(cap, pid, AuditOp::Revoke, now, true);
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!("revoked {dropped} capabilities held by terminated {pid}");
        }
        dropped
    }

    /// Reap entries whose issuing chain no longer resolves or whose
    /// expiry has passed. Purely a space optimization: such entries
    /// already fail `check()`.
    pub fn sweep(&mut self, now: Tick) -> usize {
        let mut reaped = 0;
        for index in 0..self.slots.len() as u32 {
            let cap = self.encode(index, self.slots[index as usize].generation);
            if self.slots[index as usize].entry.is_some() && self.live_entry(cap, now).is_none() {
                self.free_slot(index);
                reaped += 1;
            }
        }
        reaped
    }

    /// All live capabilities currently held by `pid`.
    pub fn held_by(&self, pid: ProcessId, now: Tick) -> Vec<CapId> {
        (0..self.slots.len() as u32)
            .map(|index| self.encode(index, self.slots[index as usize].generation))
            .filter(|cap| {
                self.live_entry(*cap, now)
                    .is_some_and(|entry| entry.holder == pid)
            })
            .collect()
    }

    pub fn stats(&self) -> CapStats {
        CapStats {
            active: self.slots.iter().filter(|s| s.entry.is_some()).count(),
            slots: self.slots.len(),
            audit_records: self.audit.len(),
            audit_appended: self.audit.total_appended(),
        }
    }

    /// Audit trail access for diagnostics.
    pub fn audit(&self) -> &AuditRing {
        &self.audit
    }
}
