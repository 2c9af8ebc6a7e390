//! Resident page queues
//!
//! Based on Mach vm/vm_resident.c
//!
//! `VmPageQueues` owns every page queue in the system and is the only code
//! that changes a page's `q_state`. A transition unlinks the page from the
//! queue named by its current state and links it onto the next one inside
//! a single critical section of the queue lock, updating both live counts
//! there, so no observer ever sees a page on two queues or on none.
//!
//! The queue lock is always innermost. Nothing here calls back into the
//! object or map layers.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;

use crate::config::{ConfigError, VmConfig, WaterMarkRatio};
use crate::mach_vm::vm_page::{
    LinkRole, PageState, QState, SecondaryQ, VmPage, PHYS_PAGE_FICTITIOUS, VM_OBJECT_NULL,
};
use crate::mach_vm::vm_page_queue::PageQueue;
use crate::mach_vm::vm_page_store::{VmPageId, VmPageStore};

/// Index of the aged speculative bin
pub const SPECULATIVE_AGED: usize = 0;

// ============================================================================
// Queue names and counters
// ============================================================================

/// Countable queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum QueueKind {
    Free = 0,
    FreeLocal,
    FreeLopage,
    Active,
    ActiveLocal,
    InactiveInternal,
    InactiveExternal,
    InactiveCleaned,
    /// Protected speculative bins
    Speculative,
    /// The aged speculative bin
    SpeculativeAged,
    Secluded,
    Throttled,
    Pageout,
    Wired,
    Compressor,
    Background,
    Donate,
}

const QUEUE_KINDS: usize = QueueKind::Donate as usize + 1;

impl QueueKind {
    pub const ALL: [QueueKind; QUEUE_KINDS] = [
        QueueKind::Free,
        QueueKind::FreeLocal,
        QueueKind::FreeLopage,
        QueueKind::Active,
        QueueKind::ActiveLocal,
        QueueKind::InactiveInternal,
        QueueKind::InactiveExternal,
        QueueKind::InactiveCleaned,
        QueueKind::Speculative,
        QueueKind::SpeculativeAged,
        QueueKind::Secluded,
        QueueKind::Throttled,
        QueueKind::Pageout,
        QueueKind::Wired,
        QueueKind::Compressor,
        QueueKind::Background,
        QueueKind::Donate,
    ];

    fn of(state: PageState) -> Option<QueueKind> {
        Some(match state.queue() {
            QState::NotOnQ => return None,
            QState::Wired => QueueKind::Wired,
            QState::UsedByCompressor => QueueKind::Compressor,
            QState::Free => QueueKind::Free,
            QState::FreeLocal => QueueKind::FreeLocal,
            QState::FreeLopage => QueueKind::FreeLopage,
            QState::Throttled => QueueKind::Throttled,
            QState::Pageout => QueueKind::Pageout,
            QState::Speculative if state.spec_bin() as usize == SPECULATIVE_AGED => {
                QueueKind::SpeculativeAged
            }
            QState::Speculative => QueueKind::Speculative,
            QState::ActiveLocal => QueueKind::ActiveLocal,
            QState::Active => QueueKind::Active,
            QState::InactiveInternal => QueueKind::InactiveInternal,
            QState::InactiveExternal => QueueKind::InactiveExternal,
            QState::InactiveCleaned => QueueKind::InactiveCleaned,
            QState::Secluded => QueueKind::Secluded,
        })
    }
}

/// Auxiliary queues with water-mark targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuxQueue {
    Secluded,
    Throttled,
    Background,
    Donate,
}

impl AuxQueue {
    fn kind(self) -> QueueKind {
        match self {
            AuxQueue::Secluded => QueueKind::Secluded,
            AuxQueue::Throttled => QueueKind::Throttled,
            AuxQueue::Background => QueueKind::Background,
            AuxQueue::Donate => QueueKind::Donate,
        }
    }
}

/// Position of an auxiliary queue relative to its water marks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pressure {
    BelowLow,
    Normal,
    AboveHigh,
}

/// Snapshot of every queue count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueCounts {
    counts: [usize; QUEUE_KINDS],
}

impl QueueCounts {
    pub fn get(&self, kind: QueueKind) -> usize {
        self.counts[kind as usize]
    }

    /// All free pages, global, local and low
    pub fn free_total(&self) -> usize {
        self.get(QueueKind::Free) + self.get(QueueKind::FreeLocal) + self.get(QueueKind::FreeLopage)
    }

    /// All inactive pages
    pub fn inactive_total(&self) -> usize {
        self.get(QueueKind::InactiveInternal)
            + self.get(QueueKind::InactiveExternal)
            + self.get(QueueKind::InactiveCleaned)
    }
}

// ============================================================================
// Queue set
// ============================================================================

struct SpecBin {
    queue: PageQueue,
    /// Time the bin stops being current
    age_ts: u64,
}

/// Everything guarded by the queue lock
struct QueueSet {
    free: Vec<PageQueue>,
    color_hint: usize,
    lopage: PageQueue,
    local_free: Vec<PageQueue>,
    local_active: Vec<PageQueue>,
    active: PageQueue,
    inactive_internal: PageQueue,
    inactive_external: PageQueue,
    inactive_cleaned: PageQueue,
    /// Index 0 is the aged bin
    speculative: Vec<SpecBin>,
    spec_current: usize,
    secluded: PageQueue,
    throttled: PageQueue,
    pageout: PageQueue,
    background: PageQueue,
    donate: PageQueue,
}

impl QueueSet {
    fn new(colors: usize, cpus: usize, bins: usize) -> Self {
        let queues = |n: usize| -> Vec<PageQueue> {
            (0..n).map(|_| PageQueue::new(LinkRole::PageQ)).collect()
        };
        Self {
            free: queues(colors),
            color_hint: 0,
            lopage: PageQueue::new(LinkRole::PageQ),
            local_free: queues(cpus),
            local_active: queues(cpus),
            active: PageQueue::new(LinkRole::PageQ),
            inactive_internal: PageQueue::new(LinkRole::PageQ),
            inactive_external: PageQueue::new(LinkRole::PageQ),
            inactive_cleaned: PageQueue::new(LinkRole::PageQ),
            speculative: (0..=bins)
                .map(|_| SpecBin {
                    queue: PageQueue::new(LinkRole::PageQ),
                    age_ts: 0,
                })
                .collect(),
            spec_current: 1,
            secluded: PageQueue::new(LinkRole::PageQ),
            throttled: PageQueue::new(LinkRole::PageQ),
            pageout: PageQueue::new(LinkRole::PageQ),
            background: PageQueue::new(LinkRole::SpecialQ),
            donate: PageQueue::new(LinkRole::SpecialQ),
        }
    }

    /// The list a page in `state` is threaded on, `None` for off-list states
    fn list(&mut self, state: PageState, color: usize) -> Option<&mut PageQueue> {
        Some(match state.queue() {
            QState::NotOnQ | QState::Wired | QState::UsedByCompressor => return None,
            QState::Free => &mut self.free[color],
            QState::FreeLocal => &mut self.local_free[state.local_cpu() as usize],
            QState::FreeLopage => &mut self.lopage,
            QState::Throttled => &mut self.throttled,
            QState::Pageout => &mut self.pageout,
            QState::Speculative => &mut self.speculative[state.spec_bin() as usize].queue,
            QState::ActiveLocal => &mut self.local_active[state.local_cpu() as usize],
            QState::Active => &mut self.active,
            QState::InactiveInternal => &mut self.inactive_internal,
            QState::InactiveExternal => &mut self.inactive_external,
            QState::InactiveCleaned => &mut self.inactive_cleaned,
            QState::Secluded => &mut self.secluded,
        })
    }
}

// ============================================================================
// Queue manager
// ============================================================================

/// Target placement of a transition
#[derive(Debug, Clone, Copy)]
enum Place {
    NotOnQ,
    Free,
    FreeLocal(usize),
    FreeLopage,
    Active,
    ActiveLocal(usize),
    Inactive(QState),
    Speculative(usize),
    Secluded,
    Throttled,
    Pageout,
    Wired,
    Compressor,
}

/// Owner of every page queue
pub struct VmPageQueues {
    store: VmPageStore,
    lock: Mutex<QueueSet>,
    counts: [AtomicUsize; QUEUE_KINDS],
    /// Pages managed, boot-time plus hot-added
    managed: AtomicUsize,
    color_mask: usize,
    lopage_limit: u32,
    local_free_batch: usize,
    spec_bins: usize,
    spec_interval: u64,
    secluded_marks: WaterMarkRatio,
    throttled_marks: WaterMarkRatio,
    background_marks: WaterMarkRatio,
    donate_marks: WaterMarkRatio,
    /// Pages moved to the aged bin so far
    aged_total: AtomicU64,
}

impl VmPageQueues {
    /// Build the descriptor store and put every frame on a free queue
    pub fn bootstrap(
        config: &VmConfig,
        ram: &[core::ops::Range<u64>],
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let store = VmPageStore::new(ram, config.aux_zone_capacity)?;
        let colors = config.colors() as usize;
        let queues = Arc::new(Self {
            lock: Mutex::new(QueueSet::new(
                colors,
                config.cpus,
                config.speculative_bins as usize,
            )),
            store,
            counts: core::array::from_fn(|_| AtomicUsize::new(0)),
            managed: AtomicUsize::new(0),
            color_mask: colors - 1,
            lopage_limit: config.lopage_limit,
            local_free_batch: config.local_free_batch.max(1),
            spec_bins: config.speculative_bins as usize,
            spec_interval: config.speculative_bin_ms,
            secluded_marks: config.secluded_marks,
            throttled_marks: config.throttled_marks,
            background_marks: config.background_marks,
            donate_marks: config.donate_marks,
            aged_total: AtomicU64::new(0),
        });

        {
            let mut q = queues.lock.lock();
            for id in queues.store.main_ids() {
                queues.place(&mut q, id, queues.free_place(id));
            }
        }
        queues
            .managed
            .store(queues.store.main_len(), Ordering::Relaxed);

        log::info!(
            "vm_resident: {} pages, {} colors, {} speculative bins of {} ms, {} cpus",
            queues.store.main_len(),
            colors,
            config.speculative_bins,
            config.speculative_bin_ms,
            config.cpus
        );
        Ok(queues)
    }

    pub fn store(&self) -> &VmPageStore {
        &self.store
    }

    pub fn page(&self, id: VmPageId) -> &VmPage {
        self.store.page(id)
    }

    /// Pages under management
    pub fn managed_pages(&self) -> usize {
        self.managed.load(Ordering::Relaxed)
    }

    pub fn colors(&self) -> usize {
        self.color_mask + 1
    }

    pub fn speculative_bins(&self) -> usize {
        self.spec_bins
    }

    pub fn aged_total(&self) -> u64 {
        self.aged_total.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------------
    // Transition primitive
    // ------------------------------------------------------------------------

    fn color_of(&self, page: &VmPage) -> usize {
        page.phys_page() as usize & self.color_mask
    }

    fn free_place(&self, id: VmPageId) -> Place {
        if self.page(id).phys_page() < self.lopage_limit {
            Place::FreeLopage
        } else {
            Place::Free
        }
    }

    fn bump(&self, kind: Option<QueueKind>, up: bool) {
        if let Some(kind) = kind {
            if up {
                self.counts[kind as usize].fetch_add(1, Ordering::Relaxed);
            } else {
                self.counts[kind as usize].fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    /// Unlink `id` from whatever queue its state names
    fn unlink(&self, q: &mut QueueSet, id: VmPageId) -> PageState {
        let page = self.page(id);
        let state = page.state();
        let color = self.color_of(page);
        if let Some(list) = q.list(state, color) {
            list.remove(&self.store, id);
        }
        self.bump(QueueKind::of(state), false);
        page.update(|s| s.with_queue(QState::NotOnQ).with_spec_bin(0).with_local_cpu(0))
    }

    /// Unlink `id` and link it at `to`, all under the caller's queue lock
    fn place(&self, q: &mut QueueSet, id: VmPageId, to: Place) {
        self.unlink(q, id);
        let page = self.page(id);
        let (qstate, bin, cpu) = match to {
            Place::NotOnQ => (QState::NotOnQ, 0, 0),
            Place::Free => (QState::Free, 0, 0),
            Place::FreeLocal(cpu) => (QState::FreeLocal, 0, cpu),
            Place::FreeLopage => (QState::FreeLopage, 0, 0),
            Place::Active => (QState::Active, 0, 0),
            Place::ActiveLocal(cpu) => (QState::ActiveLocal, 0, cpu),
            Place::Inactive(state) => (state, 0, 0),
            Place::Speculative(bin) => (QState::Speculative, bin, 0),
            Place::Secluded => (QState::Secluded, 0, 0),
            Place::Throttled => (QState::Throttled, 0, 0),
            Place::Pageout => (QState::Pageout, 0, 0),
            Place::Wired => (QState::Wired, 0, 0),
            Place::Compressor => (QState::UsedByCompressor, 0, 0),
        };
        let state = page.update(|s| {
            s.with_queue(qstate)
                .with_spec_bin(bin as u8)
                .with_local_cpu(cpu as u8)
        });
        let color = self.color_of(page);
        if let Some(list) = q.list(state, color) {
            list.enqueue_tail(&self.store, id);
        }
        self.bump(QueueKind::of(state), true);
        log::trace!("vm_resident: page {:#x} -> {:?}", id.bits(), qstate);
    }

    fn assert_not_free(&self, id: VmPageId, op: &str) {
        let q = self.page(id).q_state();
        assert!(!q.is_free(), "vm_resident: {} on a free page", op);
    }

    // ------------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------------

    fn take_free(&self, q: &mut QueueSet) -> Option<VmPageId> {
        let colors = q.free.len();
        for step in 0..colors {
            let color = (q.color_hint + step) & self.color_mask;
            if let Some(id) = q.free[color].first() {
                q.color_hint = (color + 1) & self.color_mask;
                return Some(id);
            }
        }
        None
    }

    /// Hand out a page ready for use: busy, untabled, not on any queue
    fn hand_out(&self, q: &mut QueueSet, id: VmPageId) -> VmPageId {
        self.place(q, id, Place::NotOnQ);
        self.page(id).reset_state(PageState::new().with_busy(true));
        id
    }

    /// Take a page from the colored free queues
    ///
    /// Colors are visited round-robin from a rotating hint so consecutive
    /// grabs spread over cache sets. The page comes back busy.
    pub fn grab(&self) -> Option<VmPageId> {
        let mut q = self.lock.lock();
        let id = self.take_free(&mut q)?;
        Some(self.hand_out(&mut q, id))
    }

    /// Take a page from `cpu`'s local free queue, refilling it in a batch
    /// from the global queues when empty
    pub fn grab_local(&self, cpu: usize) -> Option<VmPageId> {
        let mut q = self.lock.lock();
        if q.local_free[cpu].is_empty() {
            for _ in 0..self.local_free_batch {
                let Some(id) = self.take_free(&mut q) else {
                    break;
                };
                self.place(&mut q, id, Place::FreeLocal(cpu));
            }
        }
        let id = q.local_free[cpu].first()?;
        Some(self.hand_out(&mut q, id))
    }

    /// Take a page below the low-page limit
    pub fn grab_lopage(&self) -> Option<VmPageId> {
        let mut q = self.lock.lock();
        let id = q.lopage.first()?;
        Some(self.hand_out(&mut q, id))
    }

    /// Return a page to the free queues
    ///
    /// The page must be unwired, untabled and real.
    pub fn release(&self, id: VmPageId) {
        let page = self.page(id);
        let state = page.state();
        assert!(!state.fictitious(), "vm_resident: releasing a fictitious page");
        assert_eq!(page.wire_count(), 0, "vm_resident: releasing a wired page");
        assert!(!state.queue().is_free(), "vm_resident: double free");
        debug_assert_eq!(page.object_id(), VM_OBJECT_NULL);

        let mut q = self.lock.lock();
        self.clear_secondary(&mut q, id);
        let to = self.free_place(id);
        self.place(&mut q, id, to);
        page.reset_state(PageState::new().with_queue(page.q_state()));
    }

    // ------------------------------------------------------------------------
    // LRU membership
    // ------------------------------------------------------------------------

    /// Move a page to the global active queue
    pub fn activate(&self, id: VmPageId) {
        self.assert_not_free(id, "activate");
        let page = self.page(id);
        let mut q = self.lock.lock();
        if page.wire_count() > 0 || page.q_state() == QState::UsedByCompressor {
            return;
        }
        if page.q_state() != QState::Active {
            self.place(&mut q, id, Place::Active);
        }
    }

    /// Move a page to `cpu`'s local active queue
    pub fn activate_local(&self, id: VmPageId, cpu: usize) {
        self.assert_not_free(id, "activate_local");
        let page = self.page(id);
        let mut q = self.lock.lock();
        if page.wire_count() > 0 {
            return;
        }
        self.place(&mut q, id, Place::ActiveLocal(cpu));
    }

    /// Drain `cpu`'s local queues: active pages to the global active queue,
    /// unused local free pages back to the colored free queues
    pub fn drain_local(&self, cpu: usize) -> usize {
        let mut q = self.lock.lock();
        let mut moved = 0;
        while let Some(id) = q.local_active[cpu].first() {
            self.place(&mut q, id, Place::Active);
            moved += 1;
        }
        while let Some(id) = q.local_free[cpu].first() {
            let to = self.free_place(id);
            self.place(&mut q, id, to);
            moved += 1;
        }
        moved
    }

    /// Move a page to the inactive queue matching its backing
    ///
    /// No-op for pages already inactive or wired.
    pub fn deactivate(&self, id: VmPageId) {
        self.assert_not_free(id, "deactivate");
        let page = self.page(id);
        let mut q = self.lock.lock();
        let state = page.state();
        if state.queue().is_inactive() || page.wire_count() > 0 {
            return;
        }
        let to = if state.internal() {
            QState::InactiveInternal
        } else {
            QState::InactiveExternal
        };
        self.place(&mut q, id, Place::Inactive(to));
        page.set_reference(false);
    }

    /// Put a freshly cleaned page on the cleaned queue
    pub fn enqueue_cleaned(&self, id: VmPageId) {
        self.assert_not_free(id, "enqueue_cleaned");
        let mut q = self.lock.lock();
        if self.page(id).wire_count() > 0 {
            return;
        }
        self.place(&mut q, id, Place::Inactive(QState::InactiveCleaned));
    }

    // ------------------------------------------------------------------------
    // Speculative aging
    // ------------------------------------------------------------------------

    /// Age the speculative bins up to time `now`, returning how many pages
    /// moved to the aged bin
    fn age_bins(&self, q: &mut QueueSet, now: u64) -> usize {
        let mut moved = 0;
        if q.speculative[q.spec_current].age_ts == 0 {
            q.speculative[q.spec_current].age_ts = now + self.spec_interval;
            return 0;
        }
        for _ in 0..self.spec_bins {
            let cur = q.spec_current;
            if now < q.speculative[cur].age_ts {
                return moved;
            }
            let next = if cur == self.spec_bins { 1 } else { cur + 1 };
            // The next bin holds the oldest protected pages
            while let Some(id) = q.speculative[next].queue.first() {
                self.place(q, id, Place::Speculative(SPECULATIVE_AGED));
                moved += 1;
            }
            q.speculative[next].age_ts = q.speculative[cur].age_ts + self.spec_interval;
            q.spec_current = next;
        }
        let cur = q.spec_current;
        if now >= q.speculative[cur].age_ts {
            q.speculative[cur].age_ts = now + self.spec_interval;
        }
        moved
    }

    /// Enter a page into the current speculative bin
    pub fn speculate(&self, id: VmPageId, now: u64) {
        self.assert_not_free(id, "speculate");
        let mut q = self.lock.lock();
        if self.page(id).wire_count() > 0 {
            return;
        }
        let aged = self.age_bins(&mut q, now);
        self.aged_total.fetch_add(aged as u64, Ordering::Relaxed);
        let bin = q.spec_current;
        self.place(&mut q, id, Place::Speculative(bin));
    }

    /// Clock tick for the speculative bins
    pub fn speculative_tick(&self, now: u64) -> usize {
        let mut q = self.lock.lock();
        let aged = self.age_bins(&mut q, now);
        if aged > 0 {
            log::trace!("vm_resident: {} speculative pages aged", aged);
        }
        self.aged_total.fetch_add(aged as u64, Ordering::Relaxed);
        aged
    }

    /// Current speculative bin
    pub fn speculative_current_bin(&self) -> usize {
        self.lock.lock().spec_current
    }

    // ------------------------------------------------------------------------
    // Auxiliary queues and ownership
    // ------------------------------------------------------------------------

    // Wired pages stay on the wired queue until their last unwire

    pub fn throttle(&self, id: VmPageId) {
        self.assert_not_free(id, "throttle");
        let mut q = self.lock.lock();
        if self.page(id).wire_count() > 0 {
            return;
        }
        self.place(&mut q, id, Place::Throttled);
    }

    pub fn make_secluded(&self, id: VmPageId) {
        self.assert_not_free(id, "make_secluded");
        let mut q = self.lock.lock();
        if self.page(id).wire_count() > 0 {
            return;
        }
        self.place(&mut q, id, Place::Secluded);
    }

    /// Queue a dirty page for writeback
    pub fn enqueue_pageout(&self, id: VmPageId) {
        self.assert_not_free(id, "enqueue_pageout");
        let mut q = self.lock.lock();
        if self.page(id).wire_count() > 0 {
            return;
        }
        self.place(&mut q, id, Place::Pageout);
        self.page(id).update(|s| s.with_laundry(true));
    }

    /// Pass ownership of a page to the compressor
    pub fn give_to_compressor(&self, id: VmPageId) {
        self.assert_not_free(id, "give_to_compressor");
        let mut q = self.lock.lock();
        if self.page(id).wire_count() > 0 {
            return;
        }
        self.clear_secondary(&mut q, id);
        self.place(&mut q, id, Place::Compressor);
    }

    /// Add a wire reference; the first one takes the page off its queue
    pub fn wire(&self, id: VmPageId) -> u32 {
        self.assert_not_free(id, "wire");
        let page = self.page(id);
        let mut q = self.lock.lock();
        if page.wire_count() == 0 {
            self.place(&mut q, id, Place::Wired);
        }
        page.inc_wire()
    }

    /// Drop a wire reference
    ///
    /// When the last reference goes the page lands on the active queue if
    /// `requeue`, otherwise on no queue.
    pub fn unwire(&self, id: VmPageId, requeue: bool) -> u32 {
        let page = self.page(id);
        let mut q = self.lock.lock();
        let left = page.dec_wire();
        if left == 0 {
            let to = if requeue { Place::Active } else { Place::NotOnQ };
            self.place(&mut q, id, to);
        }
        left
    }

    /// Take a page off every primary queue
    pub fn dequeue(&self, id: VmPageId) {
        let mut q = self.lock.lock();
        let page = self.page(id);
        if page.wire_count() == 0 {
            self.place(&mut q, id, Place::NotOnQ);
        }
    }

    fn clear_secondary(&self, q: &mut QueueSet, id: VmPageId) {
        let page = self.page(id);
        match page.state().secondary_queue() {
            SecondaryQ::None => return,
            SecondaryQ::Background => {
                q.background.remove(&self.store, id);
                self.bump(Some(QueueKind::Background), false);
            }
            SecondaryQ::Donate => {
                q.donate.remove(&self.store, id);
                self.bump(Some(QueueKind::Donate), false);
            }
        }
        page.update(|s| s.with_secondary_queue(SecondaryQ::None));
    }

    /// Set the page's special queue membership
    pub fn set_secondary(&self, id: VmPageId, to: SecondaryQ) {
        let page = self.page(id);
        let mut q = self.lock.lock();
        if page.state().secondary_queue() == to {
            return;
        }
        self.clear_secondary(&mut q, id);
        match to {
            SecondaryQ::None => return,
            SecondaryQ::Background => {
                q.background.enqueue_tail(&self.store, id);
                self.bump(Some(QueueKind::Background), true);
            }
            SecondaryQ::Donate => {
                q.donate.enqueue_tail(&self.store, id);
                self.bump(Some(QueueKind::Donate), true);
            }
        }
        page.update(|s| s.with_secondary_queue(to));
    }

    // ------------------------------------------------------------------------
    // Reclamation interface
    // ------------------------------------------------------------------------

    /// Hand out up to `n` reclaim candidates
    ///
    /// Queues are consulted in order: aged speculative, cleaned, external,
    /// internal. Busy pages are skipped. Every returned page is busy and on
    /// no queue; the caller frees it or puts it back.
    pub fn reclaim_candidates(&self, n: usize) -> Vec<VmPageId> {
        self.take_candidates(
            &[
                QState::Speculative,
                QState::InactiveCleaned,
                QState::InactiveExternal,
                QState::InactiveInternal,
            ],
            n,
        )
    }

    /// Hand out up to `n` pages waiting on the pageout queue, busy and on
    /// no queue
    pub fn laundry_candidates(&self, n: usize) -> Vec<VmPageId> {
        self.take_candidates(&[QState::Pageout], n)
    }

    fn take_candidates(&self, sources: &[QState], n: usize) -> Vec<VmPageId> {
        let mut out = Vec::new();
        let mut q = self.lock.lock();
        for &source in sources {
            let mut picked = Vec::new();
            {
                let list = match source {
                    QState::Speculative => &q.speculative[SPECULATIVE_AGED].queue,
                    QState::InactiveCleaned => &q.inactive_cleaned,
                    QState::InactiveExternal => &q.inactive_external,
                    QState::Pageout => &q.pageout,
                    _ => &q.inactive_internal,
                };
                for id in list.iter(&self.store) {
                    if out.len() + picked.len() >= n {
                        break;
                    }
                    if self.page(id).try_set_busy() {
                        picked.push(id);
                    }
                }
            }
            for &id in &picked {
                self.place(&mut q, id, Place::NotOnQ);
            }
            out.extend(picked);
            if out.len() >= n {
                break;
            }
        }
        out
    }

    /// Live count of one queue
    pub fn count(&self, kind: QueueKind) -> usize {
        self.counts[kind as usize].load(Ordering::Relaxed)
    }

    /// Snapshot of every queue count, taken under the queue lock
    pub fn counts(&self) -> QueueCounts {
        let _q = self.lock.lock();
        let mut snap = QueueCounts::default();
        for kind in QueueKind::ALL {
            snap.counts[kind as usize] = self.count(kind);
        }
        snap
    }

    /// Free pages across all free queues
    pub fn free_count(&self) -> usize {
        self.count(QueueKind::Free) + self.count(QueueKind::FreeLocal) + self.count(QueueKind::FreeLopage)
    }

    /// Compare an auxiliary queue with its water marks
    pub fn pressure(&self, queue: AuxQueue) -> Pressure {
        let marks = match queue {
            AuxQueue::Secluded => self.secluded_marks,
            AuxQueue::Throttled => self.throttled_marks,
            AuxQueue::Background => self.background_marks,
            AuxQueue::Donate => self.donate_marks,
        };
        let managed = self.managed_pages();
        let low = managed * marks.low_per_mille as usize / 1000;
        let high = managed * marks.high_per_mille as usize / 1000;
        let count = self.count(queue.kind());
        if count < low {
            Pressure::BelowLow
        } else if count > high {
            Pressure::AboveHigh
        } else {
            Pressure::Normal
        }
    }

    // ------------------------------------------------------------------------
    // Hot-add and fictitious pages
    // ------------------------------------------------------------------------

    /// Bring a new frame under management
    pub fn hot_add(&self, phys_page: u32) -> Option<VmPageId> {
        if phys_page == PHYS_PAGE_FICTITIOUS || self.store.lookup_phys(phys_page).is_some() {
            log::warn!("vm_resident: hot-add of page {:#x} refused", phys_page);
            return None;
        }
        let Some(id) = self.store.zone_alloc(phys_page) else {
            log::warn!(
                "vm_resident: descriptor zone exhausted, hot-add of {:#x} refused",
                phys_page
            );
            return None;
        };
        self.page(id).reset_state(PageState::new());
        let mut q = self.lock.lock();
        let to = self.free_place(id);
        self.place(&mut q, id, to);
        self.managed.fetch_add(1, Ordering::Relaxed);
        Some(id)
    }

    /// Allocate a fictitious page: busy, on no queue, never freeable
    pub fn create_fictitious(&self) -> Option<VmPageId> {
        let id = self.store.zone_alloc(PHYS_PAGE_FICTITIOUS)?;
        self.page(id)
            .reset_state(PageState::new().with_fictitious(true).with_busy(true));
        Some(id)
    }

    /// Destroy a fictitious page
    pub fn release_fictitious(&self, id: VmPageId) {
        let page = self.page(id);
        assert!(page.state().fictitious(), "vm_resident: page is not fictitious");
        {
            let mut q = self.lock.lock();
            self.clear_secondary(&mut q, id);
            self.place(&mut q, id, Place::NotOnQ);
        }
        page.reset_state(PageState::new());
        self.store.zone_free(id);
    }
}
