//! Kernel Configuration
//!
//! Compile-time tunables for the capability registry, memory manager,
//! IPC transport, and scheduler. Everything here is a constant: the core
//! holds no persisted or runtime-reloadable configuration.

/// Page size in bytes. The memory arena is managed at page granularity.
pub const PAGE_SIZE: usize = 4096;

/// Maximum buddy order. The largest single allocation is
/// `PAGE_SIZE << MAX_ORDER` bytes (4 MiB with 4 KiB pages).
pub const MAX_ORDER: usize = 10;

/// Maximum inline message payload in bytes.
///
/// Payloads at or below this threshold are copied into the ring slot;
/// larger payloads must travel as region-handle messages. Copying 64
/// bytes is cheaper than the capability bookkeeping a region transfer
/// requires.
pub const INLINE_MSG_MAX: usize = 64;

/// Number of descriptor slots per ring direction. Must be a power of two;
/// one slot is kept empty to distinguish full from empty.
pub const RING_SLOTS: usize = 64;

/// Maximum delegation depth for a capability chain.
///
/// Bounds both attenuation chains and the per-check ancestor walk, so a
/// `check()` is O(MAX_DELEGATION_DEPTH) = O(1).
pub const MAX_DELEGATION_DEPTH: u8 = 8;

/// Capacity of the append-only audit ring. Oldest records are evicted.
pub const AUDIT_RING_CAPACITY: usize = 1024;

/// Number of priority levels (0 = highest precedence).
pub const NUM_PRIORITIES: u8 = 128;

/// Priorities below this bound form the real-time band: strict FIFO,
/// never preempted by quantum expiry.
pub const REALTIME_BAND: u8 = 32;

/// Round-robin time quantum, in timer ticks, for non-real-time entities.
pub const TIME_QUANTUM: u32 = 10;
