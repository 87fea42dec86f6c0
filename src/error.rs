//! Kernel Error Taxonomy
//!
//! Every operation in the core is local and synchronous and returns a
//! `Result` rather than unwinding; callers (including internal
//! cross-component calls) handle failures locally.
//!
//! Two classes are fatal: a scheduler invariant breach and a buddy
//! allocator accounting mismatch. Both indicate memory-safety-relevant
//! corruption, and the affected core must halt rather than keep operating
//! on a possibly inconsistent capability graph. A hosted embedding checks
//! [`KernelError::is_fatal`] and stops the instance.

use thiserror::Error;

/// Errors surfaced by the capability registry, memory manager, IPC layer,
/// and scheduler.
///
/// Note that revocation, expiry, and plain absence of a capability all
/// surface as [`KernelError::ExpiredCapability`]: a process must not be
/// able to tell "revoked" apart from "never valid", or it could infer the
/// capability state of other processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    /// Requested rights are not a subset of the parent capability's rights.
    #[error("rights escalation: requested rights exceed the parent capability")]
    RightsEscalation,

    /// Capability is expired, revoked, or was never valid.
    #[error("capability is expired or not valid")]
    ExpiredCapability,

    /// Delegation chain would exceed the fixed depth bound.
    #[error("delegation depth exceeded")]
    DepthExceeded,

    /// Capability is valid but does not carry the required rights.
    #[error("insufficient rights for the requested operation")]
    InsufficientRights,

    /// No free block large enough exists after attempting merges.
    #[error("out of memory: no free block for {requested} bytes")]
    OutOfMemory { requested: usize },

    /// Ring transport has no free slot and the caller asked not to block.
    #[error("endpoint ring is full")]
    EndpointFull,

    /// Queue is empty (receive) and the caller asked not to block.
    #[error("operation would block")]
    WouldBlock,

    /// Per-direction sequence numbers are no longer contiguous. The
    /// single-producer discipline makes a gap a corruption bug, not a
    /// recoverable loss.
    #[error("sequence violation: expected {expected}, got {got}")]
    SequenceViolation { expected: u64, got: u64 },

    /// A blocking operation's deadline expired.
    #[error("operation timed out")]
    Timeout,

    /// A scheduler invariant was breached (fatal).
    #[error("scheduler invariant violated: {0}")]
    SchedulerInvariantViolation(&'static str),

    /// Buddy allocator accounting no longer matches the arena (fatal).
    #[error("memory accounting mismatch: {0}")]
    AccountingViolation(&'static str),
}

impl KernelError {
    /// Whether this error must halt the affected core.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KernelError::SchedulerInvariantViolation(_) | KernelError::AccountingViolation(_)
        )
    }
}

pub type Result<T> = core::result::Result<T, KernelError>;
