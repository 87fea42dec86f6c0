//! Deterministic Priority Scheduler
//!
//! Selects the next runnable entity from multilevel priority bands,
//! highest precedence (lowest numeric value) first. Within a band the
//! longest-waiting Ready entity runs next, which gives strict FIFO for
//! the real-time band and starvation-free round-robin (with a fixed
//! quantum) elsewhere. Selection is a pure function of priority and
//! wait time, with ties broken by pid rather than randomly; any
//! data-dependent choice would be a timing side-channel.
//!
//! The scheduler serves a single logical core; its internal state needs
//! no locking because scheduling decisions are not preemptible. That
//! assumption must be revisited before any multi-core work.
//!
//! Priority inheritance is mandatory: a high-precedence receiver blocked
//! on a low-precedence sender donates its effective priority to the
//! sender until the send completes, closing the classic
//! priority-inversion window.

mod entity;

pub use entity::{BlockReason, SchedEntity, SchedState, WakeReason};
pub(crate) use entity::Donation;

use std::collections::BTreeMap;

use log::{debug, error, trace};

use crate::caps::ProcessId;
use crate::config::{NUM_PRIORITIES, TIME_QUANTUM};
use crate::error::{KernelError, Result};

/// Logical time, advanced by the timer interrupt.
pub type Tick = u64;

/// What a timer tick caused.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickOutcome {
    /// Blocked entities whose deadline expired this tick (now Ready).
    pub timed_out: Vec<ProcessId>,
    /// The running entity exhausted its quantum and was preempted.
    pub preempted: Option<ProcessId>,
}

/// Single-core scheduler instance.
pub struct Scheduler {
    entities: BTreeMap<ProcessId, SchedEntity>,
    running: Option<ProcessId>,
    clock: Tick,
    next_pid: u32,
}

impl Scheduler {
    /// Create a scheduler for one core. Called exactly once per core by
    /// platform init; multi-core runs independent instances.
    pub fn new() -> Self {
        Self {
            entities: BTreeMap::new(),
            running: None,
            clock: 0,
            next_pid: 1,
        }
    }

    pub fn now(&self) -> Tick {
        self.clock
    }

    /// Create a Ready entity at `priority`.
    ///
    /// Priority levels are a granted resource like any other, so asking
    /// for a level outside `0..NUM_PRIORITIES` is `InsufficientRights`
    /// rather than a separate invalid-argument error.
    pub fn spawn(&mut self, priority: u8) -> Result<ProcessId> {
        if priority >= NUM_PRIORITIES {
            return Err(KernelError::InsufficientRights);
        }
        let pid = ProcessId(self.next_pid);
        self.next_pid += 1;
        self.entities
            .insert(pid, SchedEntity::new(pid, priority, self.clock));
        debug!("spawned {pid} at priority {priority}");
        Ok(pid)
    }

    pub fn entity(&self, pid: ProcessId) -> Result<&SchedEntity> {
        self.entities
            .get(&pid)
            .ok_or(KernelError::SchedulerInvariantViolation("unknown entity"))
    }

    fn entity_mut(&mut self, pid: ProcessId) -> Result<&mut SchedEntity> {
        self.entities
            .get_mut(&pid)
            .ok_or(KernelError::SchedulerInvariantViolation("unknown entity"))
    }

    pub fn state(&self, pid: ProcessId) -> Result<SchedState> {
        Ok(self.entity(pid)?.state())
    }

    pub fn current(&self) -> Option<ProcessId> {
        self.running
    }

    /// Take (and clear) the reason the entity was last woken.
    pub fn take_wake_reason(&mut self, pid: ProcessId) -> Option<WakeReason> {
        self.entities.get_mut(&pid).and_then(|e| e.last_wake.take())
    }

    /// Pick the best Ready entity: lowest effective priority, then
    /// longest waiting, then lowest pid.
    fn best_ready(&self) -> Option<ProcessId> {
        self.entities
            .values()
            .filter(|e| e.state == SchedState::Ready)
            .min_by_key(|e| (e.effective_priority(), e.ready_since, e.pid))
            .map(|e| e.pid)
    }

    /// Select the next runnable entity, filling the core if idle.
    /// Invoked on every blocking IPC operation, timer tick, and yield.
    pub fn schedule(&mut self) -> Result<Option<ProcessId>> {
        self.assert_invariants()?;
        if self.running.is_some() {
            return Ok(self.running);
        }
        if let Some(pid) = self.best_ready() {
            let quantum = TIME_QUANTUM;
            let entity = self.entity_mut(pid)?;
            entity.state = SchedState::Running;
            entity.quantum_left = quantum;
            self.running = Some(pid);
            trace!("scheduled {pid} (prio {})", self.entity(pid)?.effective_priority());
        }
        Ok(self.running)
    }

    /// Voluntarily give up the core; the entity goes to the back of its
    /// band and the best Ready entity (possibly itself) runs next.
    pub fn yield_now(&mut self, pid: ProcessId) -> Result<Option<ProcessId>> {
        if self.running == Some(pid) {
            let clock = self.clock;
            let entity = self.entity_mut(pid)?;
            entity.state = SchedState::Ready;
            entity.ready_since = clock;
            self.running = None;
        }
        self.schedule()
    }

    /// Transition to Blocked (voluntary suspension point inside a
    /// blocking IPC call) with an optional absolute deadline.
    pub fn block(&mut self, pid: ProcessId, reason: BlockReason, deadline: Option<Tick>) -> Result<()> {
        let entity = self.entity_mut(pid)?;
        if entity.state == SchedState::Terminated {
            return Err(KernelError::SchedulerInvariantViolation(
                "blocking a terminated entity",
            ));
        }
        entity.state = SchedState::Blocked;
        entity.block_reason = Some(reason);
        entity.deadline = deadline;
        if self.running == Some(pid) {
            self.running = None;
        }
        trace!("{pid} blocked on {reason:?} (deadline {deadline:?})");
        self.schedule()?;
        Ok(())
    }

    /// Wake a blocked entity. If it now outranks the running entity, the
    /// running entity is preempted immediately.
    pub fn unblock(&mut self, pid: ProcessId, reason: WakeReason) -> Result<()> {
        let clock = self.clock;
        let entity = self.entity_mut(pid)?;
        if entity.state != SchedState::Blocked {
            return Ok(());
        }
        entity.state = SchedState::Ready;
        entity.ready_since = clock;
        entity.deadline = None;
        entity.block_reason = None;
        entity.last_wake = Some(reason);
        trace!("{pid} unblocked: {reason:?}");
        self.preempt_if_outranked()?;
        self.schedule()?;
        Ok(())
    }

    fn preempt_if_outranked(&mut self) -> Result<()> {
        let Some(running) = self.running else {
            return Ok(());
        };
        let running_prio = self.entity(running)?.effective_priority();
        let outranked = self
            .entities
            .values()
            .any(|e| e.state == SchedState::Ready && e.effective_priority() < running_prio);
        if outranked {
            let clock = self.clock;
            let entity = self.entity_mut(running)?;
            entity.state = SchedState::Ready;
            entity.ready_since = clock;
            self.running = None;
        }
        Ok(())
    }

    /// Timer interrupt: advance the clock, expire deadlines, and enforce
    /// the round-robin quantum for non-real-time entities.
    pub fn tick(&mut self) -> Result<TickOutcome> {
        self.clock += 1;
        let clock = self.clock;
        let mut outcome = TickOutcome::default();

        let expired: Vec<ProcessId> = self
            .entities
            .values()
            .filter(|e| {
                e.state == SchedState::Blocked && e.deadline.is_some_and(|d| d <= clock)
            })
            .map(|e| e.pid)
            .collect();
        for pid in expired {
            let entity = self.entity_mut(pid)?;
            entity.state = SchedState::Ready;
            entity.ready_since = clock;
            entity.deadline = None;
            entity.block_reason = None;
            entity.last_wake = Some(WakeReason::TimedOut);
            debug!("{pid} timed out while blocked");
            outcome.timed_out.push(pid);
        }

        if let Some(pid) = self.running {
            let realtime = self.entity(pid)?.is_realtime();
            if !realtime {
                let entity = self.entity_mut(pid)?;
                entity.quantum_left = entity.quantum_left.saturating_sub(1);
                if entity.quantum_left == 0 {
                    entity.state = SchedState::Ready;
                    entity.ready_since = clock;
                    self.running = None;
                    outcome.preempted = Some(pid);
                }
            }
        }

        self.preempt_if_outranked()?;
        self.schedule()?;
        Ok(outcome)
    }

    /// Absorbing transition; the caller handles capability cleanup.
    pub fn terminate(&mut self, pid: ProcessId) -> Result<()> {
        let entity = self.entity_mut(pid)?;
        entity.state = SchedState::Terminated;
        entity.donations.clear();
        entity.deadline = None;
        if self.running == Some(pid) {
            self.running = None;
        }
        // Boosts this entity donated die with it.
        for other in self.entities.values_mut() {
            other.donations.retain(|d| d.donor != pid);
        }
        debug!("{pid} terminated");
        self.schedule()?;
        Ok(())
    }

    /// Record a priority-inheritance boost: `donor` (blocked) lends its
    /// effective priority to `beneficiary` until released.
    pub fn donate(&mut self, beneficiary: ProcessId, donor: ProcessId) -> Result<()> {
        let priority = self.entity(donor)?.effective_priority();
        let entity = self.entity_mut(beneficiary)?;
        entity.donations.retain(|d| d.donor != donor);
        entity.donations.push(Donation { donor, priority });
        trace!("{donor} donates priority {priority} to {beneficiary}");
        // The boost may move the beneficiary ahead of the running entity.
        self.preempt_if_outranked()?;
        self.schedule()?;
        Ok(())
    }

    /// Release a boost exactly when the blocking operation completes.
    pub fn release_donation(&mut self, beneficiary: ProcessId, donor: ProcessId) -> Result<()> {
        if let Ok(entity) = self.entity_mut(beneficiary) {
            entity.donations.retain(|d| d.donor != donor);
        }
        Ok(())
    }

    /// Fatal-on-violation consistency check: at most one Running entity,
    /// and the `running` slot agrees with entity state.
    pub fn assert_invariants(&self) -> Result<()> {
        let running: Vec<ProcessId> = self
            .entities
            .values()
            .filter(|e| e.state == SchedState::Running)
            .map(|e| e.pid)
            .collect();
        let consistent = match (running.as_slice(), self.running) {
            ([], None) => true,
            ([pid], Some(current)) => *pid == current,
            _ => false,
        };
        if !consistent {
            error!("scheduler invariant breach: running={running:?} slot={:?}", self.running);
            return Err(KernelError::SchedulerInvariantViolation(
                "running-entity bookkeeping diverged",
            ));
        }
        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
