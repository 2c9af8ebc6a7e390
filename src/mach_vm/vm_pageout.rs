//! Pageout mechanism
//!
//! Based on Mach4 vm/vm_pageout.h/c by Avadis Tevanian, Jr. (1986)
//!
//! This module carries the mechanism only. Which pages to age and when to
//! run is decided by a `ReclaimPolicy`; the queue manager hands out
//! candidates and this code disposes of each one:
//! - Clean pages are freed
//! - Dirty pages of pager-backed objects are written back, then evicted
//! - Everything else is reactivated
//!
//! Pages on the pageout queue (the laundry) are written back by
//! `drain_laundry` and parked on the cleaned queue.

use crate::mach_vm::vm_page_store::VmPageId;
use crate::mach_vm::VmSystem;

// ============================================================================
// Pageout Constants
// ============================================================================

/// Candidates taken per reclaim pass
pub const RECLAIM_BATCH: usize = 32;

/// Laundry pages written per drain
pub const LAUNDRY_BATCH: usize = 64;

/// Target inactive ratio (pages)
pub const INACTIVE_TARGET_RATIO: usize = 3;

// ============================================================================
// Targets and statistics
// ============================================================================

/// Free and inactive page targets derived from memory size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageoutTargets {
    /// Reclaim until this many pages are free
    pub free_target: usize,
    /// Below this many free pages memory is critical
    pub free_min: usize,
    /// Desired inactive population
    pub inactive_target: usize,
}

impl PageoutTargets {
    /// Configure thresholds based on memory size
    pub fn for_pages(total_pages: usize) -> Self {
        Self {
            // 5% free
            free_target: total_pages / 20,
            // 2% free is critical
            free_min: total_pages / 50,
            inactive_target: total_pages / INACTIVE_TARGET_RATIO,
        }
    }
}

/// What one pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReclaimStats {
    /// Candidates examined
    pub scanned: usize,
    /// Pages returned to the free queues
    pub freed: usize,
    /// Pages written to their pager
    pub written: usize,
    /// Pages put back on the active queue
    pub reactivated: usize,
}

impl ReclaimStats {
    fn merge(&mut self, other: ReclaimStats) {
        self.scanned += other.scanned;
        self.freed += other.freed;
        self.written += other.written;
        self.reactivated += other.reactivated;
    }
}

// ============================================================================
// Policy seam
// ============================================================================

/// Decides how much the pageout mechanism should reclaim
pub trait ReclaimPolicy {
    /// Pages to free in this scan
    fn reclaim_target(&self, sys: &VmSystem) -> usize;

    /// Laundry pages to write back in this scan
    fn laundry_target(&self, _sys: &VmSystem) -> usize {
        LAUNDRY_BATCH
    }
}

/// Reclaims up to the free target
#[derive(Debug, Clone, Copy)]
pub struct FreeTargetPolicy {
    pub targets: PageoutTargets,
}

impl FreeTargetPolicy {
    pub fn new(sys: &VmSystem) -> Self {
        Self {
            targets: PageoutTargets::for_pages(sys.queues().managed_pages()),
        }
    }

    /// Check if memory is critically low
    pub fn is_critical(&self, sys: &VmSystem) -> bool {
        sys.queues().free_count() < self.targets.free_min
    }
}

impl ReclaimPolicy for FreeTargetPolicy {
    fn reclaim_target(&self, sys: &VmSystem) -> usize {
        self.targets
            .free_target
            .saturating_sub(sys.queues().free_count())
    }
}

// ============================================================================
// Mechanism
// ============================================================================

/// Put a candidate back in use and drop our hold on it
fn reactivate(sys: &VmSystem, id: VmPageId) {
    let queues = sys.queues();
    queues.activate(id);
    queues.page(id).clear_busy();
}

/// Dispose of up to `n` reclaim candidates
pub fn reclaim_pages(sys: &VmSystem, n: usize) -> ReclaimStats {
    let queues = sys.queues();
    let mut stats = ReclaimStats::default();
    for id in queues.reclaim_candidates(n) {
        stats.scanned += 1;
        let page = queues.page(id);
        let Some(object) = sys.objects().lookup(page.object_id()) else {
            reactivate(sys, id);
            stats.reactivated += 1;
            continue;
        };
        let state = page.state();
        let offset = page.offset();
        if state.reference() {
            page.set_reference(false);
            reactivate(sys, id);
            stats.reactivated += 1;
            continue;
        }
        if !state.dirty() {
            object.page_free(offset);
            sys.counters().reclaimed.inc();
            stats.freed += 1;
            continue;
        }
        let Some(pager) = object.pager() else {
            // Anonymous data has nowhere to go
            reactivate(sys, id);
            stats.reactivated += 1;
            continue;
        };
        match pager.data_return(offset, page.phys_page(), sys.phys()) {
            Ok(()) => {
                sys.counters().pageouts.inc();
                sys.counters().reclaimed.inc();
                object.page_evict(offset);
                stats.written += 1;
                stats.freed += 1;
            }
            Err(err) => {
                log::debug!(
                    "vm_pageout: writeback of object {} offset {:#x} failed: {}",
                    object.id(),
                    offset,
                    err
                );
                reactivate(sys, id);
                stats.reactivated += 1;
            }
        }
    }
    if stats.scanned > 0 {
        log::trace!(
            "vm_pageout: scanned {} freed {} written {}",
            stats.scanned,
            stats.freed,
            stats.written
        );
    }
    stats
}

/// Write back up to `n` pages from the pageout queue
///
/// Written pages move to the cleaned queue where reclaim finds them first.
pub fn drain_laundry(sys: &VmSystem, n: usize) -> ReclaimStats {
    let queues = sys.queues();
    let mut stats = ReclaimStats::default();
    for id in queues.laundry_candidates(n) {
        stats.scanned += 1;
        let page = queues.page(id);
        page.update(|s| s.with_laundry(false));
        let object = sys.objects().lookup(page.object_id());
        let pager = object.as_ref().and_then(|o| o.pager());
        match pager {
            Some(pager) if page.is_dirty() => {
                if pager
                    .data_return(page.offset(), page.phys_page(), sys.phys())
                    .is_ok()
                {
                    page.set_dirty(false);
                    sys.counters().pageouts.inc();
                    queues.enqueue_cleaned(id);
                    page.clear_busy();
                    stats.written += 1;
                } else {
                    reactivate(sys, id);
                    stats.reactivated += 1;
                }
            }
            Some(_) => {
                queues.enqueue_cleaned(id);
                page.clear_busy();
            }
            None => {
                reactivate(sys, id);
                stats.reactivated += 1;
            }
        }
    }
    stats
}

/// One scan: drain the laundry, then reclaim what the policy asks for
pub fn pageout_scan(sys: &VmSystem, policy: &dyn ReclaimPolicy) -> ReclaimStats {
    let mut stats = drain_laundry(sys, policy.laundry_target(sys));
    let mut wanted = policy.reclaim_target(sys);
    while wanted > 0 {
        let pass = reclaim_pages(sys, wanted.min(RECLAIM_BATCH));
        let progress = pass.scanned;
        wanted = wanted.saturating_sub(pass.freed);
        stats.merge(pass);
        if progress == 0 {
            break;
        }
        if pass.freed == 0 && pass.reactivated == progress {
            break;
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsd::vnode::{MemVnodeOps, Vnode, VnodeType};
    use crate::config::VmConfig;
    use crate::mach_vm::pmap::{PhysMemory, SparsePhysMemory};
    use crate::mach_vm::vm_object::VmObject;
    use crate::mach_vm::vm_page::{QState, PAGE_SIZE};
    use crate::mach_vm::vm_resident::QueueKind;
    use alloc::sync::Arc;
    use alloc::vec;

    fn system(pages: u64) -> Arc<VmSystem> {
        let config = VmConfig::default().with_page_colors(1);
        VmSystem::bootstrap(
            config,
            &[0..pages * PAGE_SIZE as u64],
            Arc::new(SparsePhysMemory::new()),
        )
        .unwrap()
    }

    /// Resident, inactive, unreferenced page at `offset`
    fn inactive_page(sys: &VmSystem, object: &VmObject, offset: u64, dirty: bool) -> VmPageId {
        let id = sys.grab_page().unwrap();
        object.page_insert(offset, id);
        let queues = sys.queues();
        queues.activate(id);
        queues.deactivate(id);
        queues.page(id).set_dirty(dirty);
        queues.page(id).clear_busy();
        id
    }

    #[test]
    fn test_targets() {
        let t = PageoutTargets::for_pages(1000);
        assert_eq!(t.free_target, 50);
        assert_eq!(t.free_min, 20);
        assert_eq!(t.inactive_target, 333);
    }

    #[test]
    fn test_reclaim_dispositions() {
        let sys = system(8);
        let ops = Arc::new(MemVnodeOps::new(&[0u8; 2 * PAGE_SIZE]));
        let vnode = Vnode::new(VnodeType::Reg, "/data/file", ops.clone());
        let file = vnode.vm_object(sys.objects());
        let anon = sys.objects().create_internal(2 * PAGE_SIZE as u64);

        let dirty_file = inactive_page(&sys, &file, 0, true);
        sys.phys()
            .write_page(sys.queues().page(dirty_file).phys_page(), &[9u8; PAGE_SIZE]);
        inactive_page(&sys, &file, PAGE_SIZE as u64, false);
        let dirty_anon = inactive_page(&sys, &anon, 0, true);

        let stats = reclaim_pages(&sys, 8);
        assert_eq!(stats.scanned, 3);
        assert_eq!(stats.freed, 2);
        assert_eq!(stats.written, 1);
        assert_eq!(stats.reactivated, 1);

        assert!(ops.contents()[..PAGE_SIZE].iter().all(|&b| b == 9));
        assert!(file.is_paged_out(0));
        assert_eq!(file.resident_count(), 0);
        assert_eq!(sys.queues().page(dirty_anon).q_state(), QState::Active);
        assert!(!sys.queues().page(dirty_anon).is_busy());
        assert_eq!(sys.counters().reclaimed.get(), 2);
        assert_eq!(sys.counters().pageouts.get(), 1);
    }

    #[test]
    fn test_referenced_pages_survive() {
        let sys = system(4);
        let anon = sys.objects().create_internal(PAGE_SIZE as u64);
        let id = inactive_page(&sys, &anon, 0, false);
        sys.queues().page(id).set_reference(true);
        let stats = reclaim_pages(&sys, 4);
        assert_eq!(stats.reactivated, 1);
        assert_eq!(anon.page_lookup(0), Some(id));
        assert!(!sys.queues().page(id).state().reference());
    }

    #[test]
    fn test_drain_laundry() {
        let sys = system(8);
        let ops = Arc::new(MemVnodeOps::new(&[0u8; PAGE_SIZE]));
        let vnode = Vnode::new(VnodeType::Reg, "/data/log", ops.clone());
        let file = vnode.vm_object(sys.objects());
        let id = inactive_page(&sys, &file, 0, true);
        sys.phys()
            .write_page(sys.queues().page(id).phys_page(), &[3u8; PAGE_SIZE]);
        sys.queues().enqueue_pageout(id);
        assert_eq!(sys.queues().count(QueueKind::Pageout), 1);

        let stats = drain_laundry(&sys, LAUNDRY_BATCH);
        assert_eq!(stats.written, 1);
        let page = sys.queues().page(id);
        assert_eq!(page.q_state(), QState::InactiveCleaned);
        assert!(!page.is_dirty());
        assert!(!page.state().laundry());
        assert_eq!(ops.contents(), vec![3u8; PAGE_SIZE]);
    }

    #[test]
    fn test_scan_reaches_free_target() {
        let sys = system(100);
        let anon = sys.objects().create_internal(100 * PAGE_SIZE as u64);
        for i in 0..100u64 {
            inactive_page(&sys, &anon, i * PAGE_SIZE as u64, false);
        }
        assert_eq!(sys.queues().free_count(), 0);
        let policy = FreeTargetPolicy::new(&sys);
        assert!(policy.is_critical(&sys));
        let stats = pageout_scan(&sys, &policy);
        assert_eq!(stats.freed, policy.targets.free_target);
        assert_eq!(sys.queues().free_count(), 5);
        assert!(!policy.is_critical(&sys));
    }
}
