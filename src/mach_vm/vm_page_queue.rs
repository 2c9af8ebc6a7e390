//! Page queues
//!
//! FIFO lists of descriptors threaded through one of the descriptor's link
//! roles. The list head holds packed handles only; the links themselves
//! live in the descriptors, so a page can sit on a primary queue, its
//! object's resident list and a special queue at the same time.
//!
//! A queue does no locking of its own. Every call must be made under the
//! lock that owns the queue.

use crate::mach_vm::vm_page::LinkRole;
use crate::mach_vm::vm_page_store::{VmPageId, VmPageStore};

/// A queue of pages
#[derive(Debug)]
pub struct PageQueue {
    head: u32,
    tail: u32,
    count: usize,
    role: LinkRole,
}

impl PageQueue {
    pub const fn new(role: LinkRole) -> Self {
        Self {
            head: 0,
            tail: 0,
            count: 0,
            role,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn first(&self) -> Option<VmPageId> {
        VmPageId::from_bits(self.head)
    }

    pub fn last(&self) -> Option<VmPageId> {
        VmPageId::from_bits(self.tail)
    }

    /// Add a page at the tail
    pub fn enqueue_tail(&mut self, store: &VmPageStore, id: VmPageId) {
        let links = store.page(id).link(self.role);
        debug_assert!(links.next() == 0 && links.prev() == 0 && self.head != id.bits());
        links.set(0, self.tail);
        match VmPageId::from_bits(self.tail) {
            Some(tail) => store.page(tail).link(self.role).set_next(id.bits()),
            None => self.head = id.bits(),
        }
        self.tail = id.bits();
        self.count += 1;
    }

    /// Add a page at the head
    pub fn enqueue_head(&mut self, store: &VmPageStore, id: VmPageId) {
        let links = store.page(id).link(self.role);
        debug_assert!(links.next() == 0 && links.prev() == 0 && self.head != id.bits());
        links.set(self.head, 0);
        match VmPageId::from_bits(self.head) {
            Some(head) => store.page(head).link(self.role).set_prev(id.bits()),
            None => self.tail = id.bits(),
        }
        self.head = id.bits();
        self.count += 1;
    }

    /// Unlink a page
    ///
    /// Panics if the page is not on this queue.
    pub fn remove(&mut self, store: &VmPageStore, id: VmPageId) {
        let links = store.page(id).link(self.role);
        let (next, prev) = (links.next(), links.prev());

        match VmPageId::from_bits(prev) {
            Some(p) => {
                let plinks = store.page(p).link(self.role);
                assert_eq!(plinks.next(), id.bits(), "page_queue: corrupt links");
                plinks.set_next(next);
            }
            None => {
                assert_eq!(self.head, id.bits(), "page_queue: page not on queue");
                self.head = next;
            }
        }
        match VmPageId::from_bits(next) {
            Some(n) => store
                .page(n)
                .link(self.role)
                .set_prev(prev),
            None => {
                assert_eq!(self.tail, id.bits(), "page_queue: page not on queue");
                self.tail = prev;
            }
        }
        links.clear();
        self.count -= 1;
    }

    /// Remove and return the head
    pub fn dequeue_head(&mut self, store: &VmPageStore) -> Option<VmPageId> {
        let id = self.first()?;
        self.remove(store, id);
        Some(id)
    }

    /// Move every page of `other` to the tail of this queue
    pub fn append(&mut self, store: &VmPageStore, other: &mut PageQueue) {
        debug_assert_eq!(self.role as usize, other.role as usize);
        let Some(other_head) = other.first() else {
            return;
        };
        match VmPageId::from_bits(self.tail) {
            Some(tail) => {
                store
                    .page(tail)
                    .link(self.role)
                    .set_next(other.head);
                store
                    .page(other_head)
                    .link(self.role)
                    .set_prev(self.tail);
            }
            None => self.head = other.head,
        }
        self.tail = other.tail;
        self.count += other.count;
        other.head = 0;
        other.tail = 0;
        other.count = 0;
    }

    /// Walk the queue head to tail
    ///
    /// The queue must not be modified while the iterator is alive.
    pub fn iter<'a>(&self, store: &'a VmPageStore) -> PageQueueIter<'a> {
        PageQueueIter {
            store,
            role: self.role,
            next: self.head,
        }
    }
}

/// Iterator over a queue
pub struct PageQueueIter<'a> {
    store: &'a VmPageStore,
    role: LinkRole,
    next: u32,
}

impl Iterator for PageQueueIter<'_> {
    type Item = VmPageId;

    fn next(&mut self) -> Option<VmPageId> {
        let id = VmPageId::from_bits(self.next)?;
        self.next = self.store.page(id).link(self.role).next();
        Some(id)
    }
}
