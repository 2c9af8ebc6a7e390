//! VM Page - Physical Page Descriptor
//!
//! Based on Mach vm/vm_page.h
//!
//! One `VmPage` describes one physical frame. The record is exactly one
//! cache line: links to other descriptors are packed 32-bit references
//! (see `vm_packing`), and every small field and flag lives in a single
//! 64-bit state word updated atomically.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bitfield_struct::bitfield;
use static_assertions::const_assert_eq;

// ============================================================================
// Constants
// ============================================================================

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

/// Mask of the in-page offset bits
pub const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;

/// Size of one descriptor, and the alignment of zone descriptors
pub const VM_PAGE_SIZE: usize = 64;

/// log2 of `VM_PAGE_SIZE`, the heap packing shift
pub const VM_PAGE_PACKED_SHIFT: u32 = 6;

/// Physical page number of a fictitious page
pub const PHYS_PAGE_FICTITIOUS: u32 = u32::MAX;

/// Object id meaning "not tabled in any object"
pub const VM_OBJECT_NULL: u32 = 0;

// ============================================================================
// Queue state
// ============================================================================

/// Which primary queue owns a page
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum QState {
    NotOnQ = 0,
    Wired = 1,
    /// Owned by the compressor
    UsedByCompressor = 2,
    Free = 3,
    /// On a per-CPU local free queue
    FreeLocal = 4,
    /// On the low-page free queue
    FreeLopage = 5,
    Throttled = 6,
    Pageout = 7,
    Speculative = 8,
    /// On a per-CPU local active queue
    ActiveLocal = 9,
    Active = 10,
    InactiveInternal = 11,
    InactiveExternal = 12,
    InactiveCleaned = 13,
    Secluded = 14,
}

impl QState {
    pub const fn from_bits(bits: u8) -> Self {
        match bits {
            1 => QState::Wired,
            2 => QState::UsedByCompressor,
            3 => QState::Free,
            4 => QState::FreeLocal,
            5 => QState::FreeLopage,
            6 => QState::Throttled,
            7 => QState::Pageout,
            8 => QState::Speculative,
            9 => QState::ActiveLocal,
            10 => QState::Active,
            11 => QState::InactiveInternal,
            12 => QState::InactiveExternal,
            13 => QState::InactiveCleaned,
            14 => QState::Secluded,
            _ => QState::NotOnQ,
        }
    }

    pub const fn is_free(self) -> bool {
        matches!(self, QState::Free | QState::FreeLocal | QState::FreeLopage)
    }

    pub const fn is_inactive(self) -> bool {
        matches!(
            self,
            QState::InactiveInternal | QState::InactiveExternal | QState::InactiveCleaned
        )
    }

    pub const fn is_active(self) -> bool {
        matches!(self, QState::Active | QState::ActiveLocal)
    }
}

/// Secondary (special queue) membership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SecondaryQ {
    None = 0,
    Background = 1,
    Donate = 2,
}

impl SecondaryQ {
    pub const fn from_bits(bits: u8) -> Self {
        match bits {
            1 => SecondaryQ::Background,
            2 => SecondaryQ::Donate,
            _ => SecondaryQ::None,
        }
    }
}

// ============================================================================
// State word
// ============================================================================

/// Packed per-page state
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageState {
    /// Primary queue (`QState`)
    #[bits(4)]
    pub q_state: u8,
    /// Speculative bin the page was entered into
    #[bits(6)]
    pub spec_bin: u8,
    /// Special queue (`SecondaryQ`)
    #[bits(2)]
    pub secondary: u8,
    /// CPU owning the local queue the page is on
    #[bits(6)]
    pub local_cpu: u8,

    /// Transitional ownership held
    pub busy: bool,
    /// Someone is waiting for `busy` to clear
    pub wanted: bool,
    /// Entered in an object
    pub tabled: bool,
    /// Entered in the object/offset hash
    pub hashed: bool,
    /// No real frame behind this descriptor
    pub fictitious: bool,
    pub clustered: bool,
    /// Has a hardware mapping
    pub pmapped: bool,
    /// Has an executable hardware mapping
    pub xpmapped: bool,
    /// Has a writable hardware mapping
    pub wpmapped: bool,
    pub free_when_done: bool,
    /// Data requested but not yet supplied
    pub absent: bool,
    pub error: bool,
    pub dirty: bool,
    /// Being written back
    pub cleaning: bool,
    pub precious: bool,
    pub overwriting: bool,
    pub restart: bool,
    pub unusual: bool,
    pub cs_validated: bool,
    pub cs_tainted: bool,
    pub cs_nx: bool,
    pub reusable: bool,
    pub written_by_kernel: bool,
    /// Referenced since last scan
    pub reference: bool,
    /// Handed to the pageout path
    pub laundry: bool,
    /// Belongs to an anonymous (internal) object
    pub internal: bool,

    #[bits(20)]
    __: u32,
}

impl PageState {
    pub fn queue(&self) -> QState {
        QState::from_bits(self.q_state())
    }

    pub fn with_queue(self, q: QState) -> Self {
        self.with_q_state(q as u8)
    }

    pub fn secondary_queue(&self) -> SecondaryQ {
        SecondaryQ::from_bits(self.secondary())
    }

    pub fn with_secondary_queue(self, q: SecondaryQ) -> Self {
        self.with_secondary(q as u8)
    }
}

// ============================================================================
// Descriptor
// ============================================================================

/// Index of a link role in `VmPage::links`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum LinkRole {
    /// Primary queue membership
    PageQ = 0,
    /// Per-object resident list
    ListQ = 1,
    /// Background / donate queues
    SpecialQ = 2,
}

/// Packed doubly-linked list links
///
/// Only touched while holding the lock of the list the role belongs to.
#[derive(Debug, Default)]
#[repr(C)]
pub struct QueueLinks {
    pub next: AtomicU32,
    pub prev: AtomicU32,
}

impl QueueLinks {
    pub const fn new() -> Self {
        Self {
            next: AtomicU32::new(0),
            prev: AtomicU32::new(0),
        }
    }

    pub fn next(&self) -> u32 {
        self.next.load(Ordering::Relaxed)
    }

    pub fn prev(&self) -> u32 {
        self.prev.load(Ordering::Relaxed)
    }

    pub fn set_next(&self, next: u32) {
        self.next.store(next, Ordering::Relaxed);
    }

    pub fn set_prev(&self, prev: u32) {
        self.prev.store(prev, Ordering::Relaxed);
    }

    pub fn set(&self, next: u32, prev: u32) {
        self.next.store(next, Ordering::Relaxed);
        self.prev.store(prev, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        self.set(0, 0);
    }
}

/// Virtual Memory Page
#[derive(Debug)]
#[repr(C, align(64))]
pub struct VmPage {
    /// Links, one per `LinkRole`
    pub links: [QueueLinks; 3],
    /// Owning object id, `VM_OBJECT_NULL` when untabled
    object: AtomicU32,
    /// Wire references
    wire_count: AtomicU32,
    /// Offset within the owning object
    offset: AtomicU64,
    /// `PageState` word
    state: AtomicU64,
    /// Physical page number
    phys_page: AtomicU32,
}

const_assert_eq!(core::mem::size_of::<VmPage>(), VM_PAGE_SIZE);
const_assert_eq!(core::mem::align_of::<VmPage>(), VM_PAGE_SIZE);

impl VmPage {
    /// Descriptor for frame `phys_page`, not on any queue
    pub const fn new(phys_page: u32) -> Self {
        Self {
            links: [QueueLinks::new(), QueueLinks::new(), QueueLinks::new()],
            object: AtomicU32::new(VM_OBJECT_NULL),
            wire_count: AtomicU32::new(0),
            offset: AtomicU64::new(0),
            state: AtomicU64::new(0),
            phys_page: AtomicU32::new(phys_page),
        }
    }

    pub fn link(&self, role: LinkRole) -> &QueueLinks {
        &self.links[role as usize]
    }

    pub fn phys_page(&self) -> u32 {
        self.phys_page.load(Ordering::Relaxed)
    }

    /// Physical address of the frame
    pub fn phys_addr(&self) -> u64 {
        u64::from(self.phys_page()) << PAGE_SHIFT
    }

    pub(crate) fn set_phys_page(&self, phys_page: u32) {
        self.phys_page.store(phys_page, Ordering::Relaxed);
    }

    /// Snapshot of the state word
    pub fn state(&self) -> PageState {
        PageState::from_bits(self.state.load(Ordering::Acquire))
    }

    /// Atomically rewrite the state word, returning the new state
    pub fn update(&self, f: impl Fn(PageState) -> PageState) -> PageState {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            let new = f(PageState::from_bits(cur)).into_bits();
            match self
                .state
                .compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return PageState::from_bits(new),
                Err(actual) => cur = actual,
            }
        }
    }

    pub(crate) fn reset_state(&self, state: PageState) {
        self.state.store(state.into_bits(), Ordering::Release);
    }

    pub fn q_state(&self) -> QState {
        self.state().queue()
    }

    pub fn is_busy(&self) -> bool {
        self.state().busy()
    }

    pub fn is_dirty(&self) -> bool {
        self.state().dirty()
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.update(|s| s.with_dirty(dirty));
    }

    pub fn set_reference(&self, reference: bool) {
        self.update(|s| s.with_reference(reference));
    }

    // ------------------------------------------------------------------------
    // Busy protocol
    // ------------------------------------------------------------------------

    /// Take transitional ownership; false if someone else holds it
    pub fn try_set_busy(&self) -> bool {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            let s = PageState::from_bits(cur);
            if s.busy() {
                return false;
            }
            let new = s.with_busy(true).into_bits();
            match self
                .state
                .compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Drop transitional ownership
    ///
    /// Returns whether a waiter had set `wanted`, i.e. whether a wakeup is
    /// owed.
    pub fn clear_busy(&self) -> bool {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            let s = PageState::from_bits(cur);
            assert!(s.busy(), "vm_page: clear_busy on a page that is not busy");
            let new = s.with_busy(false).with_wanted(false).into_bits();
            match self
                .state
                .compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return s.wanted(),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Spin until `busy` clears, flagging the page as wanted meanwhile
    pub fn wait_while_busy(&self) {
        while self.is_busy() {
            self.update(|s| if s.busy() { s.with_wanted(true) } else { s });
            core::hint::spin_loop();
        }
    }

    /// Wait for the page and take ownership of it
    pub fn acquire_busy(&self) {
        while !self.try_set_busy() {
            self.wait_while_busy();
        }
    }

    // ------------------------------------------------------------------------
    // Wiring and object identity
    // ------------------------------------------------------------------------

    pub fn wire_count(&self) -> u32 {
        self.wire_count.load(Ordering::Acquire)
    }

    /// Bump the wire count, returning the new value
    pub(crate) fn inc_wire(&self) -> u32 {
        let prev = self.wire_count.fetch_add(1, Ordering::AcqRel);
        assert!(prev != u32::MAX, "vm_page: wire count overflow");
        prev + 1
    }

    /// Drop a wire reference, returning the new value
    pub(crate) fn dec_wire(&self) -> u32 {
        let prev = self.wire_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev != 0, "vm_page: unwiring an unwired page");
        prev - 1
    }

    pub fn object_id(&self) -> u32 {
        self.object.load(Ordering::Acquire)
    }

    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }

    /// Record object identity; caller holds the object lock
    pub(crate) fn set_identity(&self, object: u32, offset: u64) {
        self.offset.store(offset, Ordering::Release);
        self.object.store(object, Ordering::Release);
        let tabled = object != VM_OBJECT_NULL;
        self.update(|s| s.with_tabled(tabled));
    }
}

/// Convert address to page number
pub const fn addr_to_page(addr: u64) -> u32 {
    (addr >> PAGE_SHIFT) as u32
}

/// Convert page number to address
pub const fn page_to_addr(page: u32) -> u64 {
    (page as u64) << PAGE_SHIFT
}

/// Round address down to page boundary
pub const fn trunc_page(addr: u64) -> u64 {
    addr & !PAGE_MASK
}

/// Round address up to page boundary, `None` on overflow
pub const fn round_page(addr: u64) -> Option<u64> {
    match addr.checked_add(PAGE_MASK) {
        Some(v) => Some(v & !PAGE_MASK),
        None => None,
    }
}

/// Whether `addr` is page aligned
pub const fn page_aligned(addr: u64) -> bool {
    addr & PAGE_MASK == 0
}
