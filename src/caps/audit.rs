//! Capability Audit Ring
//!
//! Every mint, delegate, revoke, and check appends a record to a bounded
//! append-only ring; when full, the oldest record is evicted. The ring is
//! the system's forensic trail for capability activity and is consulted
//! only by diagnostics, never by the authorization path itself.

use std::collections::VecDeque;

use crate::caps::registry::CapId;
use crate::caps::ProcessId;
use crate::sched::Tick;

/// Which registry operation produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOp {
    Mint,
    Delegate,
    Revoke,
    Check,
}

/// One audit record.
#[derive(Debug, Clone, Copy)]
pub struct AuditRecord {
    pub cap: CapId,
    pub accessor: ProcessId,
    pub operation: AuditOp,
    pub timestamp: Tick,
    pub outcome: bool,
}

/// Bounded, oldest-evicted record ring.
pub struct AuditRing {
    records: VecDeque<AuditRecord>,
    capacity: usize,
    /// Total records ever appended, including evicted ones.
    appended: u64,
}

impl AuditRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
            appended: 0,
        }
    }

    pub fn append(&mut self, record: AuditRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
        self.appended += 1;
    }

    /// Records currently retained, oldest first.
    pub fn records(&self) -> impl Iterator<Item = &AuditRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Total records appended over the ring's lifetime.
    pub fn total_appended(&self) -> u64 {
        self.appended
    }
}
