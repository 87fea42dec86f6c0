//! IPC Message Descriptors
//!
//! A message is either inline (small, copied into the ring slot) or a
//! region handle (a capability to a shared region travels instead of the
//! payload bytes). Region-handle messages never carry raw pointers.
//!
//! Each descriptor carries a per-endpoint-direction sequence number;
//! delivery must be contiguous, and a gap is a protocol violation.

use static_assertions::const_assert;

use crate::caps::CapId;
use crate::config::INLINE_MSG_MAX;

/// Message payload: inline bytes or a delegated region capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    Inline {
        bytes: [u8; INLINE_MSG_MAX],
        len: u8,
    },
    Region {
        cap: CapId,
        writable: bool,
    },
}

impl Payload {
    /// Build an inline payload. Returns `None` above the inline
    /// threshold; larger payloads must travel as region handles.
    pub fn inline(data: &[u8]) -> Option<Payload> {
        if data.len() > INLINE_MSG_MAX {
            return None;
        }
        let mut bytes = [0u8; INLINE_MSG_MAX];
        bytes[..data.len()].copy_from_slice(data);
        Some(Payload::Inline {
            bytes,
            len: data.len() as u8,
        })
    }

    /// The inline bytes, if this is an inline payload.
    pub fn as_inline(&self) -> Option<&[u8]> {
        match self {
            Payload::Inline { bytes, len } => Some(&bytes[..*len as usize]),
            Payload::Region { .. } => None,
        }
    }

    pub fn is_zero_copy(&self) -> bool {
        matches!(self, Payload::Region { .. })
    }
}

/// Fixed-size slot content of the ring transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageDescriptor {
    /// Contiguous per-direction sequence number.
    pub seq: u64,
    pub payload: Payload,
}

impl Default for MessageDescriptor {
    fn default() -> Self {
        Self {
            seq: 0,
            payload: Payload::Inline {
                bytes: [0; INLINE_MSG_MAX],
                len: 0,
            },
        }
    }
}

// Descriptors are copied into ring slots; keep them cache-friendly.
const_assert!(core::mem::size_of::<MessageDescriptor>() <= 96);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_threshold_enforced() {
        assert!(Payload::inline(&[0u8; INLINE_MSG_MAX]).is_some());
        assert!(Payload::inline(&[0u8; INLINE_MSG_MAX + 1]).is_none());

        let p = Payload::inline(b"ping").unwrap();
        assert_eq!(p.as_inline(), Some(&b"ping"[..]));
        assert!(!p.is_zero_copy());
    }

    #[test]
    fn region_payload_is_zero_copy() {
        let p = Payload::Region {
            cap: CapId::from_raw(42),
            writable: false,
        };
        assert!(p.is_zero_copy());
        assert_eq!(p.as_inline(), None);
    }
}
