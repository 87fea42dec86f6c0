//! # Raksha Kernel Core
//!
//! Capability-secure microkernel core: unforgeable capabilities gate
//! every object access, IPC is zero-copy past a small inline threshold,
//! and scheduling is deterministic multilevel priority with inheritance.
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------+
//! |                        Kernel facade                          |
//! |  spawn/kill  mint/delegate/revoke  alloc/map  send/receive    |
//! +-------+---------------+---------------+---------------+-------+
//!         |               |               |               |
//!   CapRegistry     RegionManager     Endpoints       Scheduler
//!   slots + audit   buddy arena       SPSC rings      128 levels
//! +---------------------------------------------------------------+
//! ```
//!
//! The facade is the only place components touch each other; each
//! component is independently testable with no ambient state.
//!
//! ## Security model
//!
//! A capability is the sole authority to act on a kernel object.
//! Delegation only attenuates, chains are depth-bounded, and revocation
//! invalidates whole subtrees lazily in O(1). Revoked, expired, and
//! never-valid handles are indistinguishable to callers.

pub mod caps;
pub mod config;
pub mod error;
pub mod ipc;
pub mod kernel;
pub mod memory;
pub mod sched;

pub use caps::{CapId, CapRegistry, ObjectRef, ProcessId, RegionId, Rights};
pub use error::{KernelError, Result};
pub use kernel::{Kernel, RecvOutcome, SendOutcome, Wait};
pub use memory::{AccessMode, RegionMapping};
pub use sched::{SchedState, Scheduler, Tick, WakeReason};
