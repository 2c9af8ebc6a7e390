//! VM Object - Memory Object Abstraction
//!
//! Based on Mach4 vm/vm_object.h/c
//!
//! A VM object is a unit of backing store. Internal objects hold anonymous
//! memory; external objects are backed by a pager. Every resident page of
//! an object is threaded on the object's `listq` list and indexed by offset.
//! A page's back-reference to its object is the 32-bit object id, resolved
//! through `VmObjectTable`.
//!
//! Lock order: object lock, then the queue lock.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

use crate::mach_vm::memory_object::Pager;
use crate::mach_vm::vm_page::{LinkRole, VM_OBJECT_NULL};
use crate::mach_vm::vm_page_queue::PageQueue;
use crate::mach_vm::vm_page_store::VmPageId;
use crate::mach_vm::vm_resident::VmPageQueues;

/// VM Object ID (0 is never allocated)
pub type VmObjectId = u32;

struct ObjectInner {
    /// Resident pages in insertion order
    memq: PageQueue,
    /// Resident pages by offset
    resident: BTreeMap<u64, VmPageId>,
    /// Offsets whose data was written back and evicted
    paged_out: BTreeSet<u64>,
}

/// VM Object - represents a unit of backing store
pub struct VmObject {
    id: VmObjectId,
    internal: bool,
    size: AtomicU64,
    pager: Option<Arc<dyn Pager>>,
    inner: Mutex<ObjectInner>,
    table: Arc<VmObjectTable>,
}

impl VmObject {
    pub fn id(&self) -> VmObjectId {
        self.id
    }

    /// Anonymous memory
    pub fn is_internal(&self) -> bool {
        self.internal
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    pub fn pager(&self) -> Option<&Arc<dyn Pager>> {
        self.pager.as_ref()
    }

    fn queues(&self) -> &VmPageQueues {
        &self.table.queues
    }

    /// Look up the resident page at `offset`
    pub fn page_lookup(&self, offset: u64) -> Option<VmPageId> {
        self.inner.lock().resident.get(&offset).copied()
    }

    /// Enter a page at `offset`
    ///
    /// Panics if a page is already resident there.
    pub fn page_insert(&self, offset: u64, id: VmPageId) {
        if self.page_insert_absent(offset, id).is_err() {
            panic!("vm_object: offset {:#x} already resident", offset);
        }
    }

    /// Enter a page at `offset` unless one is already resident
    ///
    /// Returns the resident page on conflict; `id` is left untouched.
    pub fn page_insert_absent(&self, offset: u64, id: VmPageId) -> Result<(), VmPageId> {
        let queues = self.queues();
        let mut inner = self.inner.lock();
        if let Some(&resident) = inner.resident.get(&offset) {
            return Err(resident);
        }
        let page = queues.page(id);
        page.set_identity(self.id, offset);
        let internal = self.internal;
        page.update(|s| s.with_hashed(true).with_internal(internal));
        inner.memq.enqueue_tail(queues.store(), id);
        inner.resident.insert(offset, id);
        inner.paged_out.remove(&offset);
        Ok(())
    }

    /// Remove the page at `offset` from the object without freeing it
    pub fn page_remove(&self, offset: u64) -> Option<VmPageId> {
        let mut inner = self.inner.lock();
        self.unlink_locked(&mut inner, offset)
    }

    fn unlink_locked(&self, inner: &mut ObjectInner, offset: u64) -> Option<VmPageId> {
        let id = inner.resident.remove(&offset)?;
        let queues = self.queues();
        inner.memq.remove(queues.store(), id);
        let page = queues.page(id);
        page.set_identity(VM_OBJECT_NULL, 0);
        page.update(|s| s.with_hashed(false));
        Some(id)
    }

    /// Remove the page at `offset` and return it to the free queues
    ///
    /// Any wire references left on the page are dropped. Returns whether a
    /// page was resident.
    pub fn page_free(&self, offset: u64) -> bool {
        let mut inner = self.inner.lock();
        let Some(id) = self.unlink_locked(&mut inner, offset) else {
            return false;
        };
        release_page(self.queues(), id);
        true
    }

    /// Evict the page at `offset` after its data went to backing store
    pub fn page_evict(&self, offset: u64) -> bool {
        let mut inner = self.inner.lock();
        let Some(id) = self.unlink_locked(&mut inner, offset) else {
            return false;
        };
        inner.paged_out.insert(offset);
        release_page(self.queues(), id);
        true
    }

    /// Resident pages with offsets in `[start, end)`
    pub fn pages_in(&self, start: u64, end: u64) -> Vec<(u64, VmPageId)> {
        if start >= end {
            return Vec::new();
        }
        self.inner
            .lock()
            .resident
            .range(start..end)
            .map(|(&off, &id)| (off, id))
            .collect()
    }

    pub fn resident_count(&self) -> usize {
        self.inner.lock().resident.len()
    }

    /// Whether data for `offset` lives in backing store rather than memory
    pub fn is_paged_out(&self, offset: u64) -> bool {
        self.inner.lock().paged_out.contains(&offset)
    }

    /// Forget evicted data in `[start, end)`
    pub fn discard_paged_out(&self, start: u64, end: u64) {
        let mut inner = self.inner.lock();
        let gone: Vec<u64> = inner.paged_out.range(start..end).copied().collect();
        for off in gone {
            inner.paged_out.remove(&off);
        }
    }

    /// Walk the resident list in insertion order
    pub fn memq_offsets(&self) -> Vec<u64> {
        let inner = self.inner.lock();
        let queues = self.queues();
        inner
            .memq
            .iter(queues.store())
            .map(|id| queues.page(id).offset())
            .collect()
    }
}

/// Drop wire references, leave every queue and go back to the free list
fn release_page(queues: &VmPageQueues, id: VmPageId) {
    let page = queues.page(id);
    while page.wire_count() > 0 {
        queues.unwire(id, false);
    }
    queues.dequeue(id);
    if page.state().fictitious() {
        queues.release_fictitious(id);
    } else {
        queues.release(id);
    }
}

impl Drop for VmObject {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let offsets: Vec<u64> = inner.resident.keys().copied().collect();
        for off in offsets {
            if let Some(id) = inner.resident.remove(&off) {
                let queues = &self.table.queues;
                inner.memq.remove(queues.store(), id);
                let page = queues.page(id);
                page.set_identity(VM_OBJECT_NULL, 0);
                page.update(|s| s.with_hashed(false));
                release_page(queues, id);
            }
        }
        self.table.objects.lock().remove(&self.id);
        log::trace!("vm_object: object {} terminated", self.id);
    }
}

impl core::fmt::Debug for VmObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmObject")
            .field("id", &self.id)
            .field("internal", &self.internal)
            .field("size", &self.size())
            .finish()
    }
}

// ============================================================================
// Object table
// ============================================================================

/// Resolves object ids stored in page descriptors
pub struct VmObjectTable {
    queues: Arc<VmPageQueues>,
    objects: Mutex<BTreeMap<VmObjectId, Weak<VmObject>>>,
    next_id: AtomicU32,
}

impl VmObjectTable {
    pub fn new(queues: Arc<VmPageQueues>) -> Arc<Self> {
        Arc::new(Self {
            queues,
            objects: Mutex::new(BTreeMap::new()),
            next_id: AtomicU32::new(1),
        })
    }

    pub fn queues(&self) -> &Arc<VmPageQueues> {
        &self.queues
    }

    fn create(self: &Arc<Self>, size: u64, pager: Option<Arc<dyn Pager>>) -> Arc<VmObject> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        assert!(id != VM_OBJECT_NULL, "vm_object: id space exhausted");
        let object = Arc::new(VmObject {
            id,
            internal: pager.is_none(),
            size: AtomicU64::new(size),
            pager,
            inner: Mutex::new(ObjectInner {
                memq: PageQueue::new(LinkRole::ListQ),
                resident: BTreeMap::new(),
                paged_out: BTreeSet::new(),
            }),
            table: Arc::clone(self),
        });
        self.objects.lock().insert(id, Arc::downgrade(&object));
        object
    }

    /// New anonymous object
    pub fn create_internal(self: &Arc<Self>, size: u64) -> Arc<VmObject> {
        self.create(size, None)
    }

    /// New pager-backed object
    pub fn create_external(self: &Arc<Self>, size: u64, pager: Arc<dyn Pager>) -> Arc<VmObject> {
        self.create(size, Some(pager))
    }

    /// Resolve an id
    pub fn lookup(&self, id: VmObjectId) -> Option<Arc<VmObject>> {
        self.objects.lock().get(&id)?.upgrade()
    }

    /// Live objects
    pub fn count(&self) -> usize {
        self.objects.lock().len()
    }
}
