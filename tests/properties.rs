//! Randomized sweeps over the core invariants
//!
//! Each test drives a component with a seeded linear congruential
//! generator, so runs are deterministic and failures reproduce. The
//! sweeps check the invariants the unit tests pin pointwise:
//! - Delegation never widens rights anywhere in a chain
//! - Transfers lose, duplicate, and reorder nothing
//! - Buddy accounting balances through arbitrary alloc/free traffic
//! - Same-band entities all make progress
//! - Inherited boosts revert exactly

use raksha_kernel::config::{MAX_DELEGATION_DEPTH, PAGE_SIZE};
use raksha_kernel::kernel::{Kernel, RecvOutcome, SendOutcome, Wait};
use raksha_kernel::memory::BuddyArena;
use raksha_kernel::sched::Scheduler;
use raksha_kernel::{KernelError, Rights};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Lcg(u64);

impl Lcg {
    fn new(seed: u64) -> Self {
        Lcg(seed)
    }

    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound
    }
}

/// Pick a random subset of `mask`, always keeping DELEGATE so chains can
/// continue.
fn random_subset(rng: &mut Lcg, mask: Rights) -> Rights {
    let bits = mask.bits() & rng.next() as u8;
    (Rights::from_bits_truncate(bits) | Rights::DELEGATE) & mask
}

#[test]
fn test_attenuation_monotone_over_random_chains() {
    init_logging();
    let mut rng = Lcg::new(7);
    let mut k = Kernel::with_nonce(16 * PAGE_SIZE, 11).unwrap();
    let (holder, _) = k.spawn(50).unwrap();

    for _ in 0..50 {
        let root = k.allocate(holder, PAGE_SIZE).unwrap();
        let mut parent = root;
        let mut parent_rights = Rights::RW_MAP | Rights::DELEGATE | Rights::REVOKE;

        for depth in 0..MAX_DELEGATION_DEPTH {
            let child_rights = random_subset(&mut rng, parent_rights);
            let child = match k.mint(holder, parent, child_rights, None) {
                Ok(cap) => cap,
                Err(KernelError::DepthExceeded) => {
                    assert_eq!(depth, MAX_DELEGATION_DEPTH);
                    break;
                }
                Err(other) => panic!("unexpected mint failure: {other}"),
            };

            // Every right the child carries, the parent carried.
            assert!(child_rights.is_subset_of(parent_rights));
            for right in [Rights::READ, Rights::WRITE, Rights::MAP, Rights::REVOKE] {
                if !child_rights.contains(right) {
                    assert_eq!(
                        k.check(holder, child, right),
                        Err(KernelError::InsufficientRights)
                    );
                }
            }
            // Escalation past the parent mask always fails.
            if parent_rights != Rights::all() {
                let widened = parent_rights | Rights::EXECUTE;
                assert_eq!(
                    k.mint(holder, child, widened, None),
                    Err(KernelError::RightsEscalation)
                );
            }
            parent = child;
            parent_rights = child_rights;
        }
        k.free(holder, root).unwrap();
    }
    assert!(k.verify().is_ok());
}

#[test]
fn test_random_revocation_kills_exactly_the_subtree() {
    init_logging();
    let mut rng = Lcg::new(21);
    let mut k = Kernel::with_nonce(16 * PAGE_SIZE, 17).unwrap();
    let (holder, _) = k.spawn(50).unwrap();

    // Grow a random delegation tree over one region. Each node records
    // its parent index so the expected live set is computable.
    let root = k.allocate(holder, PAGE_SIZE).unwrap();
    let mut nodes: Vec<(raksha_kernel::CapId, Option<usize>)> = vec![(root, None)];
    while nodes.len() < 30 {
        let parent = rng.below(nodes.len() as u64) as usize;
        match k.mint(holder, nodes[parent].0, Rights::READ | Rights::DELEGATE, None) {
            Ok(cap) => nodes.push((cap, Some(parent))),
            Err(KernelError::DepthExceeded) => {}
            Err(other) => panic!("unexpected mint failure: {other}"),
        }
    }

    let mut revoked: Vec<usize> = Vec::new();
    let is_dead = |idx: usize, revoked: &[usize], nodes: &[(raksha_kernel::CapId, Option<usize>)]| {
        let mut cursor = Some(idx);
        while let Some(i) = cursor {
            if revoked.contains(&i) {
                return true;
            }
            cursor = nodes[i].1;
        }
        false
    };

    for _ in 0..6 {
        let target = (0..nodes.len())
            .filter(|&i| !is_dead(i, &revoked, &nodes))
            .max_by_key(|_| rng.next());
        let Some(target) = target else { break };
        k.revoke(holder, nodes[target].0).unwrap();
        revoked.push(target);

        for (idx, (cap, _)) in nodes.iter().enumerate() {
            let alive = !is_dead(idx, &revoked, &nodes);
            let outcome = k.check(holder, *cap, Rights::READ);
            if alive {
                assert!(outcome.is_ok(), "live node {idx} failed its check");
            } else {
                assert_eq!(outcome, Err(KernelError::ExpiredCapability));
            }
        }
    }
}

#[test]
fn test_transfer_preserves_order_without_loss() {
    init_logging();
    let mut rng = Lcg::new(42);
    let mut k = Kernel::with_nonce(16 * PAGE_SIZE, 13).unwrap();
    let (a, _) = k.spawn(50).unwrap();
    let (b, _) = k.spawn(50).unwrap();
    let (cap_a, cap_b) = k.create_endpoint(a, b).unwrap();

    const TOTAL: u64 = 2_000;
    let mut sent = 0u64;
    let mut received = 0u64;

    while received < TOTAL {
        let try_send = sent < TOTAL && rng.below(2) == 0;
        if try_send {
            match k.send_bytes(a, cap_a, &sent.to_le_bytes(), Wait::NonBlocking) {
                Ok(SendOutcome::Sent { seq }) => {
                    assert_eq!(seq, sent);
                    sent += 1;
                }
                Ok(SendOutcome::Blocked) => unreachable!("nonblocking send"),
                Err(KernelError::EndpointFull) => {}
                Err(other) => panic!("unexpected send failure: {other}"),
            }
        } else {
            match k.receive(b, cap_b, Wait::NonBlocking) {
                Ok(RecvOutcome::Message(desc)) => {
                    assert_eq!(desc.seq, received);
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(desc.payload.as_inline().unwrap());
                    assert_eq!(u64::from_le_bytes(bytes), received);
                    received += 1;
                }
                Ok(RecvOutcome::Blocked) => unreachable!("nonblocking receive"),
                Err(KernelError::WouldBlock) => {}
                Err(other) => panic!("unexpected receive failure: {other}"),
            }
        }
    }

    assert_eq!(sent, TOTAL);
    let stats = k.stats().ipc;
    assert_eq!(stats.messages_sent, TOTAL);
    assert_eq!(stats.messages_received, TOTAL);
}

#[test]
fn test_buddy_accounting_balances_under_churn() {
    init_logging();
    let mut rng = Lcg::new(1234);
    let mut arena = BuddyArena::new(256 * PAGE_SIZE).unwrap();
    let mut live: Vec<(usize, usize)> = Vec::new();

    for _ in 0..2_000 {
        let free_one = !live.is_empty() && rng.below(5) < 2;
        if free_one {
            let block = live.swap_remove(rng.below(live.len() as u64) as usize);
            arena.free(block.0, block.1).unwrap();
        } else {
            let pages = 1 + rng.below(8) as usize;
            match arena.allocate(pages * PAGE_SIZE, PAGE_SIZE) {
                Ok(block) => live.push(block),
                Err(KernelError::OutOfMemory { .. }) => {}
                Err(other) => panic!("unexpected allocator failure: {other}"),
            }
        }
        arena.verify().unwrap();
        assert_eq!(
            arena.allocated_bytes(),
            live.iter().map(|(_, size)| size).sum::<usize>()
        );
    }

    for (offset, size) in live.drain(..) {
        arena.free(offset, size).unwrap();
    }
    assert_eq!(arena.allocated_bytes(), 0);
    assert_eq!(arena.free_bytes(), 256 * PAGE_SIZE);
}

#[test]
fn test_same_band_entities_all_make_progress() {
    init_logging();
    let mut sched = Scheduler::new();
    let pids: Vec<_> = (0..4).map(|_| sched.spawn(64).unwrap()).collect();
    sched.schedule().unwrap();

    let mut runs = vec![0u32; pids.len()];
    for _ in 0..400 {
        if let Some(current) = sched.current() {
            let slot = pids.iter().position(|&p| p == current).unwrap();
            runs[slot] += 1;
        }
        sched.tick().unwrap();
    }

    // Quantum round-robin shares the core evenly within a band.
    for &count in &runs {
        assert!(count >= 90, "starved entity ran only {count} ticks");
    }
    assert!(sched.assert_invariants().is_ok());
}

#[test]
fn test_inherited_boosts_revert_exactly() {
    init_logging();
    let mut rng = Lcg::new(99);
    let mut sched = Scheduler::new();
    let bases: Vec<u8> = (0..8).map(|_| 32 + rng.below(96) as u8).collect();
    let pids: Vec<_> = bases.iter().map(|&p| sched.spawn(p).unwrap()).collect();

    for _ in 0..200 {
        let donor = rng.below(pids.len() as u64) as usize;
        let beneficiary = rng.below(pids.len() as u64) as usize;
        if donor == beneficiary {
            continue;
        }
        sched.donate(pids[beneficiary], pids[donor]).unwrap();
        let effective = sched.entity(pids[beneficiary]).unwrap().effective_priority();
        // A boost never pushes below the strongest involved priority.
        assert!(effective <= bases[beneficiary]);
        assert!(effective >= bases[donor].min(bases[beneficiary]));
        sched.release_donation(pids[beneficiary], pids[donor]).unwrap();
        assert_eq!(
            sched.entity(pids[beneficiary]).unwrap().effective_priority(),
            bases[beneficiary]
        );
    }
}
