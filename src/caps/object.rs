//! Kernel Object References
//!
//! A capability names exactly one kernel object through a tagged variant.
//! `check()` matches on the variant explicitly; there is no virtual
//! dispatch across object kinds.

use core::fmt;

/// Scheduling entity / process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u32);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid{}", self.0)
    }
}

/// Physically-backed memory region identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionId(pub u64);

/// IPC endpoint identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointId(pub u64);

/// Device identifier. Drivers are ordinary scheduling entities and
/// acquire device capabilities through the registry like any process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u32);

/// The kernel object a capability refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectRef {
    Region(RegionId),
    Endpoint(EndpointId),
    Process(ProcessId),
    Device(DeviceId),
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectRef::Region(r) => write!(f, "region{}", r.0),
            ObjectRef::Endpoint(e) => write!(f, "endpoint{}", e.0),
            ObjectRef::Process(p) => write!(f, "{p}"),
            ObjectRef::Device(d) => write!(f, "device{}", d.0),
        }
    }
}
