//! Zero-Copy IPC
//!
//! Point-to-point endpoints over lock-free SPSC ring transports. Small
//! payloads are copied inline into a ring slot; larger payloads travel
//! as an attenuated capability to a shared memory region, so no payload
//! bytes move through the kernel.

mod endpoint;
mod message;
mod ring;

pub use endpoint::{BlockedSender, Endpoint};
pub use message::{MessageDescriptor, Payload};
pub use ring::RingTransport;

/// Transfer counters, kept by the kernel facade.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IpcStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub zero_copy_transfers: u64,
}
