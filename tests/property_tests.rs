//! Property tests for argument sanitizing, descriptor packing, queue
//! transitions and advice

use std::sync::Arc;

use proptest::prelude::*;

use mach_vm::bsd::kern_mman::{madvise, mmap, MmapArgs};
use mach_vm::bsd::proc::Proc;
use mach_vm::config::VmConfig;
use mach_vm::kern::copyio::copyout;
use mach_vm::mach_vm::pmap::SparsePhysMemory;
use mach_vm::mach_vm::vm_packing::{PackedPtr, PackingParams};
use mach_vm::mach_vm::vm_page::QState;
use mach_vm::mach_vm::vm_sanitize::{sanitize_addr_size, SanitizeFlags};
use mach_vm::mach_vm::{QueueKind, VmMap, VmSystem};

const PAGE: u64 = 4096;

fn system(pages: u64) -> Arc<VmSystem> {
    VmSystem::bootstrap(
        VmConfig::default().with_page_colors(1),
        &[0..pages * PAGE],
        Arc::new(SparsePhysMemory::new()),
    )
    .unwrap()
}

fn params() -> PackingParams {
    PackingParams {
        array_base: 0x1000_0000,
        array_count: 4096,
        elem_size: 64,
        heap_base: 0x4000_0000,
        heap_limit: 0x4000_0000 + (1 << 24) * 64,
        shift: 6,
    }
}

/// Primary queue counts, leaving out the secondary background/donate lists
fn primary_counts(sys: &VmSystem) -> Vec<usize> {
    QueueKind::ALL
        .iter()
        .filter(|k| !matches!(k, QueueKind::Background | QueueKind::Donate))
        .map(|&k| sys.queues().count(k))
        .collect()
}

#[derive(Debug, Clone, Copy)]
enum Move {
    Activate,
    Deactivate,
    Cleaned,
    Speculate,
    Throttle,
    Secluded,
    Pageout,
    Wire,
    Unwire,
}

fn any_move() -> impl Strategy<Value = Move> {
    prop_oneof![
        Just(Move::Activate),
        Just(Move::Deactivate),
        Just(Move::Cleaned),
        Just(Move::Speculate),
        Just(Move::Throttle),
        Just(Move::Secluded),
        Just(Move::Pageout),
        Just(Move::Wire),
        Just(Move::Unwire),
    ]
}

proptest! {
    #[test]
    fn sanitize_rejects_overflow_and_normalizes(addr in any::<u64>(), len in any::<u64>()) {
        let result = sanitize_addr_size(addr, len, SanitizeFlags::empty());
        match addr.checked_add(len) {
            None => prop_assert!(result.is_err()),
            Some(_) if len == 0 => prop_assert_eq!(result, Ok(None)),
            Some(end) => {
                if end > u64::MAX - (PAGE - 1) {
                    prop_assert!(result.is_err());
                } else {
                    let range = result.unwrap().unwrap();
                    prop_assert_eq!(range.start % PAGE, 0);
                    prop_assert_eq!(range.end % PAGE, 0);
                    prop_assert!(range.start <= addr);
                    prop_assert!(range.end >= end);
                    prop_assert!(range.end - end < PAGE);
                }
            }
        }
    }

    #[test]
    fn array_addresses_round_trip(index in 0u32..4096) {
        let p = params();
        let addr = p.array_base + index as usize * p.elem_size;
        let packed = p.pack(addr);
        prop_assert_eq!(packed, PackedPtr::ArrayIndex(index));
        prop_assert_eq!(PackedPtr::from_bits(packed.to_bits()), packed);
        prop_assert_eq!(p.unpack(packed), addr);
    }

    #[test]
    fn heap_addresses_round_trip(slot in 1usize..(1 << 24)) {
        let p = params();
        let addr = p.heap_base + (slot << p.shift);
        prop_assert!(p.is_packable(addr));
        let packed = p.pack(addr);
        prop_assert_eq!(PackedPtr::from_bits(packed.to_bits()), packed);
        prop_assert_eq!(p.unpack(packed), addr);
    }

    #[test]
    fn transitions_move_exactly_one_count(moves in prop::collection::vec(any_move(), 1..24)) {
        let sys = system(8);
        let queues = sys.queues();
        let id = queues.grab().unwrap();
        queues.activate(id);
        queues.page(id).clear_busy();
        let managed = queues.managed_pages();
        let mut now = 0;

        for m in moves {
            let before = primary_counts(&sys);
            prop_assert_eq!(before.iter().sum::<usize>(), managed);
            match m {
                Move::Activate => queues.activate(id),
                Move::Deactivate => queues.deactivate(id),
                Move::Cleaned => queues.enqueue_cleaned(id),
                Move::Speculate => {
                    now += 10;
                    queues.speculate(id, now);
                }
                Move::Throttle => queues.throttle(id),
                Move::Secluded => queues.make_secluded(id),
                Move::Pageout => queues.enqueue_pageout(id),
                Move::Wire => {
                    queues.wire(id);
                }
                Move::Unwire => {
                    if queues.page(id).wire_count() > 0 {
                        queues.unwire(id, true);
                    }
                }
            }
            let page = queues.page(id);
            prop_assert_eq!(page.wire_count() > 0, page.q_state() == QState::Wired);
            let after = primary_counts(&sys);
            prop_assert_eq!(after.iter().sum::<usize>(), managed);
            let changed: Vec<i64> = before
                .iter()
                .zip(&after)
                .map(|(&b, &a)| a as i64 - b as i64)
                .filter(|&d| d != 0)
                .collect();
            prop_assert!(changed.is_empty() || (changed.len() == 2 && changed.iter().sum::<i64>() == 0));
        }
    }

    #[test]
    fn advice_is_idempotent(advice in 0u32..12, touched in prop::collection::vec(any::<bool>(), 4)) {
        let sys = system(32);
        let p = Proc::new(1, Arc::new(VmMap::new(&sys)));
        let addr = mmap(&p, &MmapArgs::anon(4 * PAGE)).unwrap();
        for (i, &touch) in touched.iter().enumerate() {
            if touch {
                copyout(p.map(), b"x", addr + i as u64 * PAGE).unwrap();
            }
        }
        let snapshot = |p: &Proc| {
            let map = p.map();
            let mut out = Vec::new();
            map.page_range_query(addr, 4, |disp| out.push(disp));
            let entry = map.lookup(addr).unwrap();
            (out, entry.behavior, entry.flags, map.regions())
        };

        let first = madvise(&p, addr, 4 * PAGE, advice);
        let once = snapshot(&p);
        let second = madvise(&p, addr, 4 * PAGE, advice);
        prop_assert_eq!(first, second);
        prop_assert_eq!(snapshot(&p), once);
    }
}
