//! Kernel Facade
//!
//! Single-core composition of the capability registry, memory region
//! manager, endpoint table, and scheduler. Every cross-component
//! operation lives here so the authority flow stays visible in one
//! place: a syscall-shaped entry point validates its capability through
//! [`CapRegistry::check`], then touches exactly the objects that
//! capability names.
//!
//! ## Blocking model
//!
//! Entry points never spin. A send on a full ring or a receive on an
//! empty one either fails immediately (`Wait::NonBlocking`) or parks the
//! caller on the endpoint and blocks it in the scheduler; the embedding
//! resumes the call after the wake reason says why it was woken. A
//! blocked receiver donates its priority to the bound peer until the
//! send that wakes it completes.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info};

use crate::caps::{
    CapId, CapRegistry, CapStats, DeviceId, EndpointId, ObjectRef, ProcessId, RegionId, Rights,
};
use crate::config::PAGE_SIZE;
use crate::error::{KernelError, Result};
use crate::ipc::{BlockedSender, Endpoint, IpcStats, MessageDescriptor, Payload};
use crate::memory::{AccessMode, MemoryStats, RegionManager, RegionMapping};
use crate::sched::{
    BlockReason, SchedState, Scheduler, Tick, TickOutcome, WakeReason,
};

/// Whether an IPC entry point may park the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Fail with `EndpointFull`/`WouldBlock` instead of parking.
    NonBlocking,
    /// Park the caller, optionally until an absolute deadline.
    Block { deadline: Option<Tick> },
}

impl Wait {
    fn deadline(self) -> Option<Tick> {
        match self {
            Wait::NonBlocking => None,
            Wait::Block { deadline } => deadline,
        }
    }
}

/// Result of a send entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Enqueued with this per-direction sequence number.
    Sent { seq: u64 },
    /// Caller is parked on the full ring; retry after the wake.
    Blocked,
}

/// Result of a receive entry point.
#[derive(Debug, Clone, Copy)]
pub enum RecvOutcome {
    Message(MessageDescriptor),
    /// Caller is parked on the empty ring; retry after the wake.
    Blocked,
}

/// Combined counter snapshot across components.
#[derive(Debug, Clone, Copy)]
pub struct KernelStats {
    pub caps: CapStats,
    pub memory: MemoryStats,
    pub ipc: IpcStats,
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

fn boot_nonce() -> u64 {
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x9e37_79b9_7f4a_7c15);
    splitmix64(seed)
}

/// One kernel instance over one arena and one core.
pub struct Kernel {
    caps: CapRegistry,
    memory: RegionManager,
    endpoints: BTreeMap<EndpointId, Endpoint>,
    sched: Scheduler,
    ipc_stats: IpcStats,
    next_endpoint: u64,
}

impl Kernel {
    /// Boot a kernel over a fresh arena of `arena_size` bytes (page
    /// multiple). The handle-mixing nonce is drawn from the wall clock.
    pub fn new(arena_size: usize) -> Result<Self> {
        Self::with_nonce(arena_size, boot_nonce())
    }

    /// Boot with an explicit nonce. Handle values depend on the nonce;
    /// behavior does not.
    pub fn with_nonce(arena_size: usize, nonce: u64) -> Result<Self> {
        let kernel = Self {
            caps: CapRegistry::new(nonce),
            memory: RegionManager::new(arena_size)?,
            endpoints: BTreeMap::new(),
            sched: Scheduler::new(),
            ipc_stats: IpcStats::default(),
            next_endpoint: 1,
        };
        info!("kernel up: {arena_size} byte arena");
        Ok(kernel)
    }

    pub fn now(&self) -> Tick {
        self.sched.now()
    }

    // ---- processes ------------------------------------------------------

    /// Create a process at `priority`. The process receives a root
    /// capability to itself; everything else must be delegated to it.
    pub fn spawn(&mut self, priority: u8) -> Result<(ProcessId, CapId)> {
        let pid = self.sched.spawn(priority)?;
        let now = self.sched.now();
        let cap = self
            .caps
            .mint_root(pid, ObjectRef::Process(pid), Rights::all(), None, now);
        Ok((pid, cap))
    }

    /// Create the first process after boot attestation. The platform
    /// passes the measured-boot verdict; an unverified image is refused
    /// and nothing is minted.
    pub fn spawn_root(&mut self, priority: u8, verified: bool) -> Result<(ProcessId, CapId)> {
        if !verified {
            return Err(KernelError::InsufficientRights);
        }
        self.spawn(priority)
    }

    /// Terminate `pid`: absorbing scheduler transition, full capability
    /// revocation, region release, and endpoint teardown. Peers parked on
    /// a torn-down endpoint are woken and observe the endpoint as gone.
    pub fn kill(&mut self, pid: ProcessId) -> Result<()> {
        self.sched.terminate(pid)?;

        // Endpoints first: unwinding a parked region handoff needs the
        // sender's capability chain still live.
        let bound: Vec<EndpointId> = self
            .endpoints
            .values()
            .filter(|ep| ep.peer_index(pid).is_some())
            .map(|ep| ep.id())
            .collect();
        for eid in bound {
            let ep = self.endpoints.remove(&eid).expect("collected above");
            self.teardown_endpoint(ep, Some(pid))?;
            debug!("endpoint{} destroyed with {pid}", eid.0);
        }

        let now = self.sched.now();
        self.caps.revoke_held_by(pid, now);
        self.memory.release_all(pid);
        Ok(())
    }

    /// Wake everything parked on a dying endpoint and unwind undelivered
    /// region handoffs. `killed` is skipped when the teardown is part of
    /// a termination cascade.
    fn teardown_endpoint(&mut self, mut ep: Endpoint, killed: Option<ProcessId>) -> Result<()> {
        for blocked in ep.drain_parked_senders() {
            if Some(blocked.pid) != killed {
                self.sched.unblock(blocked.pid, WakeReason::Cancelled)?;
            }
            if let Some(peer) = ep.peer_of(blocked.pid) {
                self.undo_region_handoff(peer, blocked.payload)?;
            }
        }
        for waiter in ep.parked() {
            if Some(waiter) != killed {
                self.sched.unblock(waiter, WakeReason::Cancelled)?;
            }
        }
        Ok(())
    }

    /// Grant `holder` a root capability to a device. Drivers are ordinary
    /// processes; this is how platform init hands out hardware access.
    pub fn register_device(
        &mut self,
        holder: ProcessId,
        device: DeviceId,
        rights: Rights,
    ) -> CapId {
        let now = self.sched.now();
        self.caps
            .mint_root(holder, ObjectRef::Device(device), rights, None, now)
    }

    // ---- capabilities ---------------------------------------------------

    /// Mint a child of `parent` on the same object, held by the accessor.
    pub fn mint(
        &mut self,
        accessor: ProcessId,
        parent: CapId,
        rights: Rights,
        expiry: Option<Tick>,
    ) -> Result<CapId> {
        let now = self.sched.now();
        let object = self
            .caps
            .object_of(accessor, parent, now)
            .ok_or(KernelError::ExpiredCapability)?;
        self.caps.mint(accessor, parent, object, rights, expiry, now)
    }

    /// Copy-with-attenuation to another process.
    pub fn delegate(
        &mut self,
        accessor: ProcessId,
        cap: CapId,
        to: ProcessId,
        rights: Rights,
        expiry: Option<Tick>,
    ) -> Result<CapId> {
        let now = self.sched.now();
        self.caps.delegate(accessor, cap, to, rights, expiry, now)
    }

    pub fn revoke(&mut self, accessor: ProcessId, cap: CapId) -> Result<()> {
        let now = self.sched.now();
        self.caps.revoke(accessor, cap, now)
    }

    pub fn check(&mut self, accessor: ProcessId, cap: CapId, required: Rights) -> Result<ObjectRef> {
        let now = self.sched.now();
        self.caps.check(accessor, cap, required, now)
    }

    // ---- memory ---------------------------------------------------------

    /// Allocate a page-aligned region of at least `size` bytes and return
    /// a full-rights capability to it.
    pub fn allocate(&mut self, owner: ProcessId, size: usize) -> Result<CapId> {
        let id = self.memory.allocate(owner, size, PAGE_SIZE)?;
        let now = self.sched.now();
        Ok(self.caps.mint_root(
            owner,
            ObjectRef::Region(id),
            Rights::RW_MAP | Rights::DELEGATE | Rights::REVOKE,
            None,
            now,
        ))
    }

    /// Share a region with another process: delegate an attenuated
    /// capability and add the process to the owner set under `mode`.
    pub fn share(
        &mut self,
        owner: ProcessId,
        cap: CapId,
        with: ProcessId,
        mode: AccessMode,
        rights: Rights,
        expiry: Option<Tick>,
    ) -> Result<CapId> {
        if mode == AccessMode::Exclusive {
            return Err(KernelError::InsufficientRights);
        }
        let id = self.region_of(owner, cap, Rights::DELEGATE)?;
        self.memory.region(id)?;
        let now = self.sched.now();
        let child = self.caps.delegate(owner, cap, with, rights, expiry, now)?;
        self.memory.add_owner(id, with, mode)?;
        Ok(child)
    }

    /// Give up the caller's hold on a region. The capability is revoked;
    /// the region is destroyed once no owners remain.
    pub fn free(&mut self, pid: ProcessId, cap: CapId) -> Result<()> {
        let id = self.region_of(pid, cap, Rights::empty())?;
        let now = self.sched.now();
        self.caps.revoke(pid, cap, now)?;
        self.memory.remove_owner(id, pid)?;
        Ok(())
    }

    /// Install a view of a region. Writability requires both the WRITE
    /// right on the capability and a writable access mode on the region.
    pub fn map(&mut self, pid: ProcessId, cap: CapId) -> Result<RegionMapping> {
        let id = self.region_of(pid, cap, Rights::MAP)?;
        let now = self.sched.now();
        let rights = self
            .caps
            .rights_of(cap, now)
            .ok_or(KernelError::ExpiredCapability)?;
        let region = self.memory.region(id)?;
        Ok(RegionMapping {
            cap,
            region: id,
            len: region.len(),
            writable: rights.contains(Rights::WRITE) && region.mode().allows_write(),
        })
    }

    /// Read through a mapping. The capability is re-validated on every
    /// access, so a revoked mapping dies here rather than at map time.
    pub fn read_mapped(
        &mut self,
        pid: ProcessId,
        mapping: &RegionMapping,
        offset: usize,
        len: usize,
    ) -> Result<&[u8]> {
        self.region_of(pid, mapping.cap, Rights::READ)?;
        self.memory.read(mapping.region, offset, len)
    }

    /// Write through a mapping, subject to the same re-validation.
    pub fn write_mapped(
        &mut self,
        pid: ProcessId,
        mapping: &RegionMapping,
        offset: usize,
        data: &[u8],
    ) -> Result<()> {
        if !mapping.writable {
            return Err(KernelError::InsufficientRights);
        }
        self.region_of(pid, mapping.cap, Rights::WRITE)?;
        self.memory.write(mapping.region, offset, data)
    }

    fn region_of(&mut self, pid: ProcessId, cap: CapId, required: Rights) -> Result<RegionId> {
        let now = self.sched.now();
        match self.caps.check(pid, cap, required, now)? {
            ObjectRef::Region(id) => Ok(id),
            _ => Err(KernelError::ExpiredCapability),
        }
    }

    // ---- ipc ------------------------------------------------------------

    /// Bind `a` and `b` to a fresh endpoint and hand each a send/receive
    /// capability for it. Endpoint capabilities are not delegable; the
    /// point-to-point binding is what keeps the rings single-producer.
    pub fn create_endpoint(&mut self, a: ProcessId, b: ProcessId) -> Result<(CapId, CapId)> {
        self.sched.entity(a)?;
        self.sched.entity(b)?;
        let eid = EndpointId(self.next_endpoint);
        self.next_endpoint += 1;
        self.endpoints.insert(eid, Endpoint::new(eid, a, b));

        let now = self.sched.now();
        let rights = Rights::READ | Rights::WRITE;
        let cap_a = self
            .caps
            .mint_root(a, ObjectRef::Endpoint(eid), rights, None, now);
        let cap_b = self
            .caps
            .mint_root(b, ObjectRef::Endpoint(eid), rights, None, now);
        debug!("endpoint{} binds {a} and {b}", eid.0);
        Ok((cap_a, cap_b))
    }

    /// Close the caller's side of an endpoint. The endpoint is destroyed
    /// once both sides are closed; any parked peer is woken.
    pub fn close_endpoint(&mut self, pid: ProcessId, cap: CapId) -> Result<()> {
        let eid = self.endpoint_of(pid, cap, Rights::empty())?;
        let ep = self
            .endpoints
            .get_mut(&eid)
            .ok_or(KernelError::ExpiredCapability)?;
        let destroy = ep.close(pid)?;
        if destroy {
            let ep = self.endpoints.remove(&eid).expect("present above");
            self.teardown_endpoint(ep, None)?;
            debug!("endpoint{} destroyed", eid.0);
        }
        Ok(())
    }

    /// Send an inline payload of at most `INLINE_MSG_MAX` bytes.
    pub fn send_bytes(
        &mut self,
        sender: ProcessId,
        cap: CapId,
        data: &[u8],
        wait: Wait,
    ) -> Result<SendOutcome> {
        let payload =
            Payload::inline(data).ok_or(KernelError::InsufficientRights)?;
        self.send_payload(sender, cap, payload, wait)
    }

    /// Zero-copy send: the peer receives an attenuated capability to the
    /// region instead of the payload bytes. The sender keeps its own
    /// capability; `writable` grants the peer write access and requires
    /// the WRITE right on `region_cap`.
    pub fn send_region(
        &mut self,
        sender: ProcessId,
        cap: CapId,
        region_cap: CapId,
        writable: bool,
        wait: Wait,
    ) -> Result<SendOutcome> {
        let eid = self.endpoint_of(sender, cap, Rights::WRITE)?;
        let ep = self
            .endpoints
            .get(&eid)
            .ok_or(KernelError::ExpiredCapability)?;
        let peer = ep.peer_of(sender).ok_or(KernelError::ExpiredCapability)?;
        let idx = ep.peer_index(sender).ok_or(KernelError::ExpiredCapability)?;
        // Every failure that can be seen up front is checked before the
        // delegation below, so a failed send leaves no trace: no child
        // capability, no ownership change.
        if ep.is_closed_for(sender) || ep.is_closed_for(peer) {
            return Err(KernelError::ExpiredCapability);
        }
        if matches!(wait, Wait::NonBlocking) && !ep.can_send(idx) {
            return Err(KernelError::EndpointFull);
        }

        let mut required = Rights::READ | Rights::DELEGATE;
        let mut granted = Rights::READ | Rights::MAP;
        let mode = if writable {
            required |= Rights::WRITE;
            granted |= Rights::WRITE;
            AccessMode::SharedWrite
        } else {
            AccessMode::SharedRead
        };
        let id = self.region_of(sender, region_cap, required)?;
        let now = self.sched.now();
        let delegated = self
            .caps
            .delegate(sender, region_cap, peer, granted, None, now)?;
        self.memory.add_owner(id, peer, mode)?;

        let payload = Payload::Region {
            cap: delegated,
            writable,
        };
        let outcome = self.send_payload(sender, cap, payload, wait);
        if matches!(outcome, Ok(SendOutcome::Sent { .. })) {
            self.ipc_stats.zero_copy_transfers += 1;
        }
        outcome
    }

    /// Unwind the capability and ownership side of a region handoff whose
    /// transfer never completed (timeout or endpoint teardown).
    fn undo_region_handoff(&mut self, peer: ProcessId, payload: Payload) -> Result<()> {
        let Payload::Region { cap, .. } = payload else {
            return Ok(());
        };
        let now = self.sched.now();
        if let Some(ObjectRef::Region(id)) = self.caps.object_of(peer, cap, now) {
            self.caps.revoke(peer, cap, now)?;
            self.memory.remove_owner(id, peer)?;
            debug!("unwound region{} handoff to {peer}", id.0);
        }
        Ok(())
    }

    fn send_payload(
        &mut self,
        sender: ProcessId,
        cap: CapId,
        payload: Payload,
        wait: Wait,
    ) -> Result<SendOutcome> {
        let eid = self.endpoint_of(sender, cap, Rights::WRITE)?;
        let ep = self
            .endpoints
            .get_mut(&eid)
            .ok_or(KernelError::ExpiredCapability)?;
        let idx = ep.peer_index(sender).ok_or(KernelError::ExpiredCapability)?;
        let peer = ep.peer_of(sender).ok_or(KernelError::ExpiredCapability)?;
        if ep.is_closed_for(sender) || ep.is_closed_for(peer) {
            return Err(KernelError::ExpiredCapability);
        }

        match ep.enqueue(idx, payload) {
            Ok(seq) => {
                let woken = ep.take_parked_receiver(1 - idx);
                if let Some(receiver) = woken {
                    // The receiver's inherited boost ends before the wake,
                    // so the preemption check sees the reverted priority.
                    self.sched.release_donation(sender, receiver)?;
                    self.sched.unblock(receiver, WakeReason::DataReady)?;
                }
                self.ipc_stats.messages_sent += 1;
                Ok(SendOutcome::Sent { seq })
            }
            Err(KernelError::EndpointFull) => match wait {
                Wait::NonBlocking => Err(KernelError::EndpointFull),
                Wait::Block { .. } => {
                    ep.park_sender(
                        idx,
                        BlockedSender {
                            pid: sender,
                            payload,
                        },
                    );
                    self.sched
                        .block(sender, BlockReason::IpcSend(eid), wait.deadline())?;
                    Ok(SendOutcome::Blocked)
                }
            },
            Err(other) => Err(other),
        }
    }

    /// Receive the next message in sequence order. An empty queue either
    /// fails (`WouldBlock`) or parks the caller, donating its priority to
    /// the bound peer until data arrives.
    pub fn receive(
        &mut self,
        receiver: ProcessId,
        cap: CapId,
        wait: Wait,
    ) -> Result<RecvOutcome> {
        let eid = self.endpoint_of(receiver, cap, Rights::READ)?;
        let ep = self
            .endpoints
            .get_mut(&eid)
            .ok_or(KernelError::ExpiredCapability)?;
        let idx = ep
            .peer_index(receiver)
            .ok_or(KernelError::ExpiredCapability)?;
        let peer = ep.peer_of(receiver).ok_or(KernelError::ExpiredCapability)?;
        if ep.is_closed_for(receiver) {
            return Err(KernelError::ExpiredCapability);
        }

        match ep.dequeue(idx) {
            Ok(desc) => {
                // A sender parked on the full ring gets the freed slot.
                let mut resumed = None;
                if let Some(blocked) = ep.take_parked_sender(1 - idx) {
                    let zero_copy = blocked.payload.is_zero_copy();
                    ep.enqueue(1 - idx, blocked.payload)?;
                    resumed = Some((blocked.pid, zero_copy));
                }
                if let Some((pid, zero_copy)) = resumed {
                    self.sched.unblock(pid, WakeReason::SlotFree)?;
                    self.ipc_stats.messages_sent += 1;
                    if zero_copy {
                        self.ipc_stats.zero_copy_transfers += 1;
                    }
                }
                self.ipc_stats.messages_received += 1;
                Ok(RecvOutcome::Message(desc))
            }
            Err(KernelError::WouldBlock) => match wait {
                Wait::NonBlocking => Err(KernelError::WouldBlock),
                Wait::Block { .. } => {
                    ep.park_receiver(idx, receiver);
                    self.sched
                        .block(receiver, BlockReason::IpcReceive(eid), wait.deadline())?;
                    self.sched.donate(peer, receiver)?;
                    Ok(RecvOutcome::Blocked)
                }
            },
            Err(other) => Err(other),
        }
    }

    fn endpoint_of(&mut self, pid: ProcessId, cap: CapId, required: Rights) -> Result<EndpointId> {
        let now = self.sched.now();
        match self.caps.check(pid, cap, required, now)? {
            ObjectRef::Endpoint(eid) => Ok(eid),
            _ => Err(KernelError::ExpiredCapability),
        }
    }

    // ---- scheduling -----------------------------------------------------

    pub fn schedule(&mut self) -> Result<Option<ProcessId>> {
        self.sched.schedule()
    }

    pub fn yield_now(&mut self, pid: ProcessId) -> Result<Option<ProcessId>> {
        self.sched.yield_now(pid)
    }

    pub fn current(&self) -> Option<ProcessId> {
        self.sched.current()
    }

    pub fn state(&self, pid: ProcessId) -> Result<SchedState> {
        self.sched.state(pid)
    }

    pub fn take_wake_reason(&mut self, pid: ProcessId) -> Option<WakeReason> {
        self.sched.take_wake_reason(pid)
    }

    pub fn effective_priority(&self, pid: ProcessId) -> Result<u8> {
        Ok(self.sched.entity(pid)?.effective_priority())
    }

    /// Timer tick. Deadline expiries unwind any IPC parking and inherited
    /// boosts the timed-out entity left behind.
    pub fn tick(&mut self) -> Result<TickOutcome> {
        let outcome = self.sched.tick()?;
        for pid in &outcome.timed_out {
            self.cancel_ipc_wait(*pid)?;
        }
        Ok(outcome)
    }

    fn cancel_ipc_wait(&mut self, pid: ProcessId) -> Result<()> {
        let mut cancelled: Vec<(ProcessId, Option<Payload>)> = Vec::new();
        for ep in self.endpoints.values_mut() {
            if ep.parked().contains(&pid) {
                let undelivered = ep.cancel_parked(pid);
                if let Some(peer) = ep.peer_of(pid) {
                    cancelled.push((peer, undelivered));
                }
            }
        }
        for (peer, undelivered) in cancelled {
            self.sched.release_donation(peer, pid)?;
            // A timed-out region send must not leave the peer holding the
            // handoff capability or an ownership stake.
            if let Some(payload) = undelivered {
                self.undo_region_handoff(peer, payload)?;
            }
        }
        Ok(())
    }

    // ---- diagnostics ----------------------------------------------------

    /// Cross-check allocator accounting and scheduler bookkeeping. A
    /// fatal error here means the instance must halt.
    pub fn verify(&self) -> Result<()> {
        self.memory.verify()?;
        self.sched.assert_invariants()
    }

    pub fn stats(&self) -> KernelStats {
        KernelStats {
            caps: self.caps.stats(),
            memory: self.memory.stats(),
            ipc: self.ipc_stats,
        }
    }

    /// Capability audit trail, newest last.
    pub fn audit(&self) -> &crate::caps::AuditRing {
        self.caps.audit()
    }
}
