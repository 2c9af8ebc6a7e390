//! VM Fault - Page Resolution
//!
//! Based on Mach4 vm/vm_fault.h/c
//! Brings the page behind a mapped address into memory. Used for user
//! touches, for wiring and for read-ahead.
//!
//! ## Fault Types
//!
//! - **Zero-fill**: Anonymous pages get zero-filled on first access
//! - **Page-in**: Pages of pager-backed objects are requested from the pager
//! - **Copy-on-write**: Writes through a private file mapping copy the page
//!   into the entry's shadow object
//!
//! A page being filled is entered busy in its object first, so a second
//! fault on the same offset waits for the fill instead of racing it.

use alloc::sync::Arc;

use crate::kern::kern_return::{KernError, KernResult};
use crate::mach_vm::vm_map::{EntryFlags, VmMap, VmMapEntry, VmProt};
use crate::mach_vm::vm_object::VmObject;
use crate::mach_vm::vm_page::QState;
use crate::mach_vm::vm_page_store::VmPageId;
use crate::mach_vm::VmSystem;

/// Queue a newly filled page goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPlacement {
    /// Demand fault, the page is in use
    Active,
    /// Read-ahead at time `now`, reclaimable first if never touched
    Speculative(u64),
}

// ============================================================================
// Fault entry points
// ============================================================================

/// Resolve a fault of `fault_type` at `addr` in `map`
///
/// Returns the page now backing `addr`.
pub fn vm_fault(map: &VmMap, addr: u64, fault_type: VmProt) -> KernResult<VmPageId> {
    let sys = Arc::clone(map.system());
    let mut inner = map.lock();
    let entry = inner.lookup_mut(addr).ok_or(KernError::InvalidAddress)?;
    let write = fault_type.contains(VmProt::WRITE);
    if write && !entry.protection.contains(VmProt::WRITE) {
        return Err(KernError::ProtectionFailure);
    }
    if fault_type.contains(VmProt::EXECUTE) && !entry.protection.contains(VmProt::EXECUTE) {
        return Err(KernError::ProtectionFailure);
    }
    if !write && !entry.protection.can_fetch() {
        return Err(KernError::ProtectionFailure);
    }
    resolve(&sys, entry, addr, write, FaultPlacement::Active)
}

/// Resolve `addr` within `entry` without protection checks
///
/// The caller holds the map lock. A write through a copy-on-write entry
/// leaves the page in the entry's shadow object.
pub fn resolve(
    sys: &VmSystem,
    entry: &mut VmMapEntry,
    addr: u64,
    write: bool,
    placement: FaultPlacement,
) -> KernResult<VmPageId> {
    sys.counters().faults.inc();
    let offset = entry.object_offset(addr);
    if !entry.flags.contains(EntryFlags::NEEDS_COPY) {
        return page_in(sys, &entry.object, offset, write, placement);
    }

    if let Some(shadow) = &entry.shadow {
        if let Some(id) = shadow.page_lookup(offset) {
            let page = sys.queues().page(id);
            page.wait_while_busy();
            touch(sys, id, write);
            return Ok(id);
        }
    }
    if !write {
        return page_in(sys, &entry.object, offset, false, placement);
    }
    copy_on_write(sys, entry, offset)
}

// ============================================================================
// Page-in and zero fill
// ============================================================================

/// Find or fill the page of `object` at `offset`
fn page_in(
    sys: &VmSystem,
    object: &Arc<VmObject>,
    offset: u64,
    write: bool,
    placement: FaultPlacement,
) -> KernResult<VmPageId> {
    let queues = sys.queues();
    loop {
        if let Some(id) = object.page_lookup(offset) {
            queues.page(id).wait_while_busy();
            // Freed while we waited
            if object.page_lookup(offset) != Some(id) {
                continue;
            }
            touch(sys, id, write);
            return Ok(id);
        }

        let id = sys.grab_page()?;
        if object.page_insert_absent(offset, id).is_err() {
            queues.release(id);
            continue;
        }
        let page = queues.page(id);
        match object.pager() {
            Some(pager) => {
                if let Err(err) = pager.data_request(offset, page.phys_page(), sys.phys()) {
                    log::debug!(
                        "vm_fault: pager failed at object {} offset {:#x}: {}",
                        object.id(),
                        offset,
                        err
                    );
                    object.page_free(offset);
                    return Err(KernError::MemoryError);
                }
                sys.counters().pageins.inc();
            }
            None => {
                sys.phys().zero_page(page.phys_page());
                sys.counters().zero_fills.inc();
            }
        }
        match placement {
            FaultPlacement::Active => queues.activate(id),
            FaultPlacement::Speculative(now) => queues.speculate(id, now),
        }
        mark_mapped(sys, id, write, placement == FaultPlacement::Active);
        page.clear_busy();
        return Ok(id);
    }
}

/// Copy the source page into the entry's shadow and return the copy
fn copy_on_write(sys: &VmSystem, entry: &mut VmMapEntry, offset: u64) -> KernResult<VmPageId> {
    let queues = sys.queues();
    let src = page_in(sys, &entry.object, offset, false, FaultPlacement::Active)?;
    let shadow = Arc::clone(
        entry
            .shadow
            .get_or_insert_with(|| sys.objects().create_internal(entry.object.size())),
    );

    let src_page = queues.page(src);
    src_page.acquire_busy();
    let dst = match sys.grab_page() {
        Ok(dst) => dst,
        Err(err) => {
            src_page.clear_busy();
            return Err(err);
        }
    };
    sys.phys()
        .copy_page(src_page.phys_page(), queues.page(dst).phys_page());
    src_page.clear_busy();

    if let Err(resident) = shadow.page_insert_absent(offset, dst) {
        queues.release(dst);
        touch(sys, resident, true);
        return Ok(resident);
    }
    queues.activate(dst);
    mark_mapped(sys, dst, true, true);
    queues.page(dst).clear_busy();
    sys.counters().cow_faults.inc();
    Ok(dst)
}

// ============================================================================
// Page state on access
// ============================================================================

fn mark_mapped(sys: &VmSystem, id: VmPageId, write: bool, referenced: bool) {
    sys.queues().page(id).update(|s| {
        let s = s.with_pmapped(true).with_reference(referenced);
        if write {
            s.with_dirty(true).with_wpmapped(true)
        } else {
            s
        }
    });
}

/// Record an access to a resident page
///
/// Read-ahead and inactive pages that get used go back to the active queue.
fn touch(sys: &VmSystem, id: VmPageId, write: bool) {
    mark_mapped(sys, id, write, true);
    let queues = sys.queues();
    let q = queues.page(id).q_state();
    if q == QState::Speculative || q.is_inactive() {
        queues.activate(id);
    }
}
