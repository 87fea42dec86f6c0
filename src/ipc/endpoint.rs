//! IPC Endpoints
//!
//! An endpoint is the rendezvous object between exactly two bound
//! processes. Each direction owns a ring transport and a pair of
//! contiguous sequence counters; the point-to-point restriction is what
//! makes the rings safely single-producer/single-consumer and keeps
//! zero-copy delegation free of reference-counted shared ownership.

use log::error;

use crate::caps::{EndpointId, ProcessId};
use crate::config::RING_SLOTS;
use crate::error::{KernelError, Result};
use crate::ipc::message::{MessageDescriptor, Payload};
use crate::ipc::ring::RingTransport;

/// A sender parked on a full ring, with the payload it still has to
/// enqueue. At most one per direction: the direction has a single
/// producer process, and a process has at most one in-flight syscall.
#[derive(Debug)]
pub struct BlockedSender {
    pub pid: ProcessId,
    pub payload: Payload,
}

/// Per-direction transport state.
pub struct DirectionState {
    ring: RingTransport,
    next_send_seq: u64,
    next_recv_seq: u64,
    blocked_sender: Option<BlockedSender>,
    blocked_receiver: Option<ProcessId>,
}

impl DirectionState {
    fn new() -> Self {
        Self {
            ring: RingTransport::new(RING_SLOTS),
            next_send_seq: 0,
            next_recv_seq: 0,
            blocked_sender: None,
            blocked_receiver: None,
        }
    }
}

/// Point-to-point IPC endpoint.
pub struct Endpoint {
    id: EndpointId,
    peers: [ProcessId; 2],
    dirs: [DirectionState; 2],
    closed: [bool; 2],
}

impl Endpoint {
    pub fn new(id: EndpointId, a: ProcessId, b: ProcessId) -> Self {
        Self {
            id,
            peers: [a, b],
            dirs: [DirectionState::new(), DirectionState::new()],
            closed: [false, false],
        }
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn peers(&self) -> [ProcessId; 2] {
        self.peers
    }

    /// Position of `pid` in the bound pair, if bound.
    pub fn peer_index(&self, pid: ProcessId) -> Option<usize> {
        self.peers.iter().position(|&p| p == pid)
    }

    /// The other bound process.
    pub fn peer_of(&self, pid: ProcessId) -> Option<ProcessId> {
        self.peer_index(pid).map(|idx| self.peers[1 - idx])
    }

    /// Direction index for messages sent by peer `sender_idx`.
    fn dir_for_sender(&mut self, sender_idx: usize) -> &mut DirectionState {
        &mut self.dirs[sender_idx]
    }

    /// Direction index for messages received by peer `receiver_idx`.
    fn dir_for_receiver(&mut self, receiver_idx: usize) -> &mut DirectionState {
        &mut self.dirs[1 - receiver_idx]
    }

    /// Enqueue a payload from peer `sender_idx`, assigning the next
    /// sequence number. Fails with `EndpointFull` without consuming a
    /// sequence number when the ring has no free slot.
    pub fn enqueue(&mut self, sender_idx: usize, payload: Payload) -> Result<u64> {
        let dir = self.dir_for_sender(sender_idx);
        let seq = dir.next_send_seq;
        dir.ring.push(MessageDescriptor { seq, payload })?;
        dir.next_send_seq += 1;
        Ok(seq)
    }

    /// Dequeue the next message for peer `receiver_idx`, enforcing
    /// sequence contiguity. Empty ring surfaces as `WouldBlock`; the
    /// blocking decision belongs to the caller.
    pub fn dequeue(&mut self, receiver_idx: usize) -> Result<MessageDescriptor> {
        let id = self.id;
        let dir = self.dir_for_receiver(receiver_idx);
        let desc = dir.ring.pop().ok_or(KernelError::WouldBlock)?;
        if desc.seq != dir.next_recv_seq {
            error!(
                "endpoint{}: sequence gap, expected {} got {}",
                id.0, dir.next_recv_seq, desc.seq
            );
            return Err(KernelError::SequenceViolation {
                expected: dir.next_recv_seq,
                got: desc.seq,
            });
        }
        dir.next_recv_seq += 1;
        Ok(desc)
    }

    /// Whether the ring toward `receiver_idx`'s peer has a free slot.
    pub fn can_send(&self, sender_idx: usize) -> bool {
        !self.dirs[sender_idx].ring.is_full()
    }

    pub fn pending_for(&self, receiver_idx: usize) -> usize {
        self.dirs[1 - receiver_idx].ring.len()
    }

    pub fn park_sender(&mut self, sender_idx: usize, blocked: BlockedSender) {
        let dir = self.dir_for_sender(sender_idx);
        debug_assert!(dir.blocked_sender.is_none(), "single producer discipline");
        dir.blocked_sender = Some(blocked);
    }

    pub fn take_parked_sender(&mut self, sender_idx: usize) -> Option<BlockedSender> {
        self.dir_for_sender(sender_idx).blocked_sender.take()
    }

    pub fn park_receiver(&mut self, receiver_idx: usize, pid: ProcessId) {
        let dir = self.dir_for_receiver(receiver_idx);
        debug_assert!(dir.blocked_receiver.is_none(), "single consumer discipline");
        dir.blocked_receiver = Some(pid);
    }

    pub fn take_parked_receiver(&mut self, receiver_idx: usize) -> Option<ProcessId> {
        self.dir_for_receiver(receiver_idx).blocked_receiver.take()
    }

    /// Remove a specific parked process (timeout or termination). If the
    /// process was a parked sender, its undelivered payload is returned
    /// so the caller can unwind any handoff bound to it.
    pub fn cancel_parked(&mut self, pid: ProcessId) -> Option<Payload> {
        let mut undelivered = None;
        for dir in &mut self.dirs {
            if dir.blocked_sender.as_ref().is_some_and(|b| b.pid == pid) {
                undelivered = dir.blocked_sender.take().map(|b| b.payload);
            }
            if dir.blocked_receiver == Some(pid) {
                dir.blocked_receiver = None;
            }
        }
        undelivered
    }

    /// Remove and return every parked sender (endpoint teardown).
    pub fn drain_parked_senders(&mut self) -> Vec<BlockedSender> {
        self.dirs
            .iter_mut()
            .filter_map(|dir| dir.blocked_sender.take())
            .collect()
    }

    /// Every process currently parked on this endpoint.
    pub fn parked(&self) -> Vec<ProcessId> {
        let mut waiting = Vec::new();
        for dir in &self.dirs {
            if let Some(blocked) = &dir.blocked_sender {
                waiting.push(blocked.pid);
            }
            if let Some(pid) = dir.blocked_receiver {
                waiting.push(pid);
            }
        }
        waiting
    }

    /// Mark one peer's side closed. The endpoint is destroyed once both
    /// sides are closed (or a peer terminates).
    pub fn close(&mut self, pid: ProcessId) -> Result<bool> {
        let idx = self
            .peer_index(pid)
            .ok_or(KernelError::ExpiredCapability)?;
        self.closed[idx] = true;
        Ok(self.closed == [true, true])
    }

    pub fn is_closed_for(&self, pid: ProcessId) -> bool {
        self.peer_index(pid)
            .map(|idx| self.closed[idx])
            .unwrap_or(true)
    }
}
