//! Capability System
//!
//! Unforgeable, attenuable tokens are the only way to reach kernel
//! objects. The registry owns every capability record, delegations are
//! attenuation-only, and revocation invalidates descendants lazily via
//! per-slot generations.

mod audit;
mod object;
mod registry;
mod rights;

pub use audit::{AuditOp, AuditRecord, AuditRing};
pub use object::{DeviceId, EndpointId, ObjectRef, ProcessId, RegionId};
pub use registry::{CapId, CapRegistry, CapStats};
pub use rights::Rights;
