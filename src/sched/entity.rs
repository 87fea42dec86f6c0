//! Scheduling Entities
//!
//! One entity per process. State transitions are driven only by the
//! scheduler and by IPC blocking/unblocking; `Terminated` is absorbing.

use crate::caps::{EndpointId, ProcessId};
use crate::config::REALTIME_BAND;
use crate::sched::Tick;

/// Entity lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedState {
    Ready,
    Running,
    Blocked,
    Terminated,
}

/// Why a blocked entity was made Ready again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// A message arrived for a blocked receiver.
    DataReady,
    /// A ring slot freed for a blocked sender.
    SlotFree,
    /// The blocking deadline expired.
    TimedOut,
    /// The endpoint was torn down under the waiter (peer exit or close).
    Cancelled,
}

/// What a blocked entity is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    IpcSend(EndpointId),
    IpcReceive(EndpointId),
}

/// A priority donation from a blocked high-precedence entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Donation {
    pub donor: ProcessId,
    pub priority: u8,
}

/// Per-process scheduling record.
#[derive(Debug)]
pub struct SchedEntity {
    pub(crate) pid: ProcessId,
    pub(crate) base_priority: u8,
    /// Active priority-inheritance boosts; the effective priority is the
    /// strongest of base and donations.
    pub(crate) donations: Vec<Donation>,
    pub(crate) state: SchedState,
    /// When the entity last became Ready; drives the longest-waiting
    /// tie-break and FIFO order within a band.
    pub(crate) ready_since: Tick,
    pub(crate) quantum_left: u32,
    pub(crate) deadline: Option<Tick>,
    pub(crate) block_reason: Option<BlockReason>,
    pub(crate) last_wake: Option<WakeReason>,
}

impl SchedEntity {
    pub(crate) fn new(pid: ProcessId, priority: u8, now: Tick) -> Self {
        Self {
            pid,
            base_priority: priority,
            donations: Vec::new(),
            state: SchedState::Ready,
            ready_since: now,
            quantum_left: 0,
            deadline: None,
            block_reason: None,
            last_wake: None,
        }
    }

    /// Effective priority: the base, overridden by any stronger
    /// (numerically lower) inherited boost.
    pub fn effective_priority(&self) -> u8 {
        self.donations
            .iter()
            .map(|d| d.priority)
            .min()
            .map_or(self.base_priority, |boost| boost.min(self.base_priority))
    }

    pub fn base_priority(&self) -> u8 {
        self.base_priority
    }

    pub fn state(&self) -> SchedState {
        self.state
    }

    /// What the entity is blocked on, if anything.
    pub fn block_reason(&self) -> Option<BlockReason> {
        self.block_reason
    }

    pub fn is_realtime(&self) -> bool {
        self.effective_priority() < REALTIME_BAND
    }
}
