//! End-to-end scenarios across the whole kernel facade
//!
//! These tests exercise complete workflows combining:
//! - Process creation and capability grants
//! - Zero-copy region transfer over IPC
//! - Revocation cascades under delegation
//! - Priority inheritance under contention

use raksha_kernel::config::{INLINE_MSG_MAX, PAGE_SIZE};
use raksha_kernel::kernel::{Kernel, RecvOutcome, SendOutcome, Wait};
use raksha_kernel::{AccessMode, KernelError, Rights, SchedState, WakeReason};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn kernel(arena: usize) -> Kernel {
    init_logging();
    Kernel::with_nonce(arena, 0x0123_4567_89ab_cdef).unwrap()
}

/// Two processes exchange one inline message in each direction; both
/// directions start their sequence space at zero.
#[test]
fn test_ping_pong_round_trip() {
    let mut k = kernel(16 * PAGE_SIZE);
    let (client, _) = k.spawn(50).unwrap();
    let (server, _) = k.spawn(50).unwrap();
    let (cap_client, cap_server) = k.create_endpoint(client, server).unwrap();

    let sent = k
        .send_bytes(client, cap_client, b"ping", Wait::NonBlocking)
        .unwrap();
    assert_eq!(sent, SendOutcome::Sent { seq: 0 });

    let ping = match k.receive(server, cap_server, Wait::NonBlocking).unwrap() {
        RecvOutcome::Message(desc) => desc,
        RecvOutcome::Blocked => panic!("ping was pending"),
    };
    assert_eq!(ping.seq, 0);
    assert_eq!(ping.payload.as_inline(), Some(&b"ping"[..]));

    let sent = k
        .send_bytes(server, cap_server, b"pong", Wait::NonBlocking)
        .unwrap();
    assert_eq!(sent, SendOutcome::Sent { seq: 0 });

    let pong = match k.receive(client, cap_client, Wait::NonBlocking).unwrap() {
        RecvOutcome::Message(desc) => desc,
        RecvOutcome::Blocked => panic!("pong was pending"),
    };
    assert_eq!(pong.seq, 0);
    assert_eq!(pong.payload.as_inline(), Some(&b"pong"[..]));

    let stats = k.stats().ipc;
    assert_eq!(stats.messages_sent, 2);
    assert_eq!(stats.messages_received, 2);
    assert_eq!(stats.zero_copy_transfers, 0);
    assert!(!k.audit().is_empty());
}

/// A 1 MiB payload travels as an attenuated region capability; the
/// receiver reads the sender's bytes through its own mapping and cannot
/// write.
#[test]
fn test_zero_copy_region_transfer() {
    let mut k = kernel(4 * 1024 * 1024);
    let (producer, _) = k.spawn(50).unwrap();
    let (consumer, _) = k.spawn(50).unwrap();
    let (cap_p, cap_c) = k.create_endpoint(producer, consumer).unwrap();

    const LEN: usize = 1024 * 1024;
    let region = k.allocate(producer, LEN).unwrap();
    let mapping = k.map(producer, region).unwrap();
    assert!(mapping.writable);
    k.write_mapped(producer, &mapping, 0, &[0xAA]).unwrap();
    k.write_mapped(producer, &mapping, LEN - 1, &[0xBB]).unwrap();

    let sent = k
        .send_region(producer, cap_p, region, false, Wait::NonBlocking)
        .unwrap();
    assert_eq!(sent, SendOutcome::Sent { seq: 0 });

    let desc = match k.receive(consumer, cap_c, Wait::NonBlocking).unwrap() {
        RecvOutcome::Message(desc) => desc,
        RecvOutcome::Blocked => panic!("transfer was pending"),
    };
    assert!(desc.payload.is_zero_copy());
    let handed = match desc.payload {
        raksha_kernel::ipc::Payload::Region { cap, writable } => {
            assert!(!writable);
            cap
        }
        _ => panic!("expected a region payload"),
    };

    let view = k.map(consumer, handed).unwrap();
    assert!(!view.writable);
    assert_eq!(view.len, LEN);
    assert_eq!(k.read_mapped(consumer, &view, 0, 1).unwrap(), &[0xAA]);
    assert_eq!(
        k.read_mapped(consumer, &view, LEN - 1, 1).unwrap(),
        &[0xBB]
    );
    assert_eq!(
        k.write_mapped(consumer, &view, 0, &[0xCC]),
        Err(KernelError::InsufficientRights)
    );
    assert_eq!(k.stats().ipc.zero_copy_transfers, 1);
}

/// Revoking the head of a delegation chain kills every descendant on
/// next use, while the underlying region stays live for nobody (all
/// access went through the chain).
#[test]
fn test_revocation_cascades_through_chain() {
    let mut k = kernel(16 * PAGE_SIZE);
    let (a, _) = k.spawn(50).unwrap();
    let (b, _) = k.spawn(50).unwrap();
    let (c, _) = k.spawn(50).unwrap();

    let c1 = k.allocate(a, PAGE_SIZE).unwrap();
    let c2 = k
        .delegate(a, c1, b, Rights::READ | Rights::MAP | Rights::DELEGATE, None)
        .unwrap();
    let c3 = k.delegate(b, c2, c, Rights::READ, None).unwrap();

    assert!(k.check(b, c2, Rights::READ).is_ok());
    assert!(k.check(c, c3, Rights::READ).is_ok());

    k.revoke(a, c1).unwrap();
    assert_eq!(k.check(b, c2, Rights::READ), Err(KernelError::ExpiredCapability));
    assert_eq!(k.check(c, c3, Rights::READ), Err(KernelError::ExpiredCapability));
}

/// The shared-region path: delegation via `share` adds the peer to the
/// owner set, and the region survives until the last owner frees it.
#[test]
fn test_shared_region_lifetime() {
    let mut k = kernel(16 * PAGE_SIZE);
    let (a, _) = k.spawn(50).unwrap();
    let (b, _) = k.spawn(50).unwrap();

    let cap_a = k.allocate(a, PAGE_SIZE).unwrap();
    let cap_b = k
        .share(a, cap_a, b, AccessMode::SharedRead, Rights::READ_MAP, None)
        .unwrap();
    assert_eq!(k.stats().memory.regions, 1);

    k.free(a, cap_a).unwrap();
    // B remains an owner, so the region stays allocated. B's capability
    // chains to the now-revoked parent, so the handle itself is dead.
    assert_eq!(k.stats().memory.regions, 1);
    k.free(b, cap_b).unwrap_err();
    k.kill(b).unwrap();
    assert_eq!(k.stats().memory.regions, 0);
    assert!(k.verify().is_ok());
}

/// The classic inversion scenario: a high-precedence receiver blocks on
/// a low-precedence sender while a medium-precedence entity is runnable.
/// The donation lets the sender run ahead of the medium entity, and the
/// boost reverts exactly when the send completes.
#[test]
fn test_priority_inversion_avoided() {
    let mut k = kernel(16 * PAGE_SIZE);
    let (low, _) = k.spawn(100).unwrap();
    let (_mid, _) = k.spawn(60).unwrap();
    let (high, _) = k.spawn(10).unwrap();
    let (cap_low, cap_high) = k.create_endpoint(low, high).unwrap();

    assert_eq!(k.schedule().unwrap(), Some(high));
    match k.receive(high, cap_high, Wait::Block { deadline: None }).unwrap() {
        RecvOutcome::Blocked => {}
        RecvOutcome::Message(_) => panic!("queue was empty"),
    }

    // The donation lifts the sender over the medium entity.
    assert_eq!(k.effective_priority(low).unwrap(), 10);
    assert_eq!(k.current(), Some(low));

    k.send_bytes(low, cap_low, b"done", Wait::NonBlocking).unwrap();
    assert_eq!(k.effective_priority(low).unwrap(), 100);
    assert_eq!(k.current(), Some(high));
    assert_eq!(k.take_wake_reason(high), Some(WakeReason::DataReady));

    match k.receive(high, cap_high, Wait::NonBlocking).unwrap() {
        RecvOutcome::Message(desc) => {
            assert_eq!(desc.payload.as_inline(), Some(&b"done"[..]))
        }
        RecvOutcome::Blocked => panic!("message was pending"),
    }
}

/// A sender parked on a full ring is resumed with its payload delivered
/// in order once the receiver drains a slot.
#[test]
fn test_blocked_sender_resumes_in_order() {
    let mut k = kernel(16 * PAGE_SIZE);
    let (a, _) = k.spawn(50).unwrap();
    let (b, _) = k.spawn(50).unwrap();
    let (cap_a, cap_b) = k.create_endpoint(a, b).unwrap();

    let mut filled = 0u64;
    loop {
        match k.send_bytes(a, cap_a, &filled.to_le_bytes(), Wait::NonBlocking) {
            Ok(SendOutcome::Sent { seq }) => {
                assert_eq!(seq, filled);
                filled += 1;
            }
            Err(KernelError::EndpointFull) => break,
            other => panic!("unexpected send result: {other:?}"),
        }
    }

    let outcome = k
        .send_bytes(a, cap_a, &filled.to_le_bytes(), Wait::Block { deadline: None })
        .unwrap();
    assert_eq!(outcome, SendOutcome::Blocked);
    assert_eq!(k.state(a).unwrap(), SchedState::Blocked);

    // Draining one slot re-enqueues the parked payload as the tail.
    match k.receive(b, cap_b, Wait::NonBlocking).unwrap() {
        RecvOutcome::Message(desc) => assert_eq!(desc.seq, 0),
        RecvOutcome::Blocked => panic!("ring was full"),
    }
    assert_eq!(k.take_wake_reason(a), Some(WakeReason::SlotFree));

    let mut expected = 1;
    loop {
        match k.receive(b, cap_b, Wait::NonBlocking) {
            Ok(RecvOutcome::Message(desc)) => {
                assert_eq!(desc.seq, expected);
                expected += 1;
            }
            Err(KernelError::WouldBlock) => break,
            other => panic!("unexpected receive result: {other:?}"),
        }
    }
    assert_eq!(expected, filled + 1);
}

/// Expiry behaves like revocation: the handle dies silently at its
/// deadline and is indistinguishable from one that never existed.
#[test]
fn test_expiring_delegation() {
    let mut k = kernel(16 * PAGE_SIZE);
    let (a, _) = k.spawn(50).unwrap();
    let (b, _) = k.spawn(50).unwrap();

    let parent = k.allocate(a, PAGE_SIZE).unwrap();
    let lease = k
        .delegate(a, parent, b, Rights::READ_MAP, Some(3))
        .unwrap();

    assert!(k.check(b, lease, Rights::READ).is_ok());
    for _ in 0..3 {
        k.tick().unwrap();
    }
    assert_eq!(k.check(b, lease, Rights::READ), Err(KernelError::ExpiredCapability));
    // The parent is untouched by the child's expiry.
    assert!(k.check(a, parent, Rights::READ).is_ok());
}

/// Inline threshold boundary: exactly the threshold fits, one byte more
/// must go through a region transfer.
#[test]
fn test_inline_threshold_boundary() {
    let mut k = kernel(16 * PAGE_SIZE);
    let (a, _) = k.spawn(50).unwrap();
    let (b, _) = k.spawn(50).unwrap();
    let (cap_a, cap_b) = k.create_endpoint(a, b).unwrap();

    let exact = vec![0x42u8; INLINE_MSG_MAX];
    k.send_bytes(a, cap_a, &exact, Wait::NonBlocking).unwrap();
    match k.receive(b, cap_b, Wait::NonBlocking).unwrap() {
        RecvOutcome::Message(desc) => {
            assert_eq!(desc.payload.as_inline(), Some(exact.as_slice()))
        }
        RecvOutcome::Blocked => panic!("message was pending"),
    }

    let over = vec![0x42u8; INLINE_MSG_MAX + 1];
    assert!(k.send_bytes(a, cap_a, &over, Wait::NonBlocking).is_err());
}
