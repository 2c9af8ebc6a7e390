//! VM Map - Address Space Management
//!
//! Based on Mach4 vm/vm_map.h/c
//! VM maps represent the virtual address space of a task.
//! Each map contains a set of map entries that describe the mappings.
//!
//! Every entry maps a window of one VM object. Private file mappings are
//! copy-on-write: the entry keeps the file object read-only and collects
//! written pages in a private `shadow` object indexed by the same offsets.
//! Anonymous mappings write their internal object directly.
//!
//! Operations that take a range either clip the entries at the range ends
//! or work on whole entries. Checks that can fail run over the whole range
//! before anything is changed, so a failed call leaves the map as it was.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, MutexGuard};

use crate::bsd::vnode::Vnode;
use crate::kern::kern_return::{KernError, KernResult};
use crate::mach_vm::memory_object::{CryptPager, Pager, TextCrypter};
use crate::mach_vm::vm_fault::{self, FaultPlacement};
use crate::mach_vm::vm_object::VmObject;
use crate::mach_vm::vm_page::{page_aligned, QState, PAGE_SIZE};
use crate::mach_vm::vm_page_store::VmPageId;
use crate::mach_vm::VmSystem;

const PAGE: u64 = PAGE_SIZE as u64;

// ============================================================================
// VM Map Types
// ============================================================================

bitflags! {
    /// Memory protection flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VmProt: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXECUTE = 0x4;
        /// Default (read/write)
        const DEFAULT = Self::READ.bits() | Self::WRITE.bits();
        /// All permissions
        const ALL = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

impl VmProt {
    /// Readable or executable, the accesses a read fault satisfies
    pub fn can_fetch(&self) -> bool {
        self.intersects(VmProt::READ | VmProt::EXECUTE)
    }
}

impl Default for VmProt {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Inheritance on fork
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum VmInherit {
    /// Share the mapping
    Share = 0,
    /// Copy the mapping
    #[default]
    Copy = 1,
    /// Don't inherit
    None = 2,
}

impl VmInherit {
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(VmInherit::Share),
            1 => Some(VmInherit::Copy),
            2 => Some(VmInherit::None),
            _ => None,
        }
    }
}

/// Paging behavior, both the sticky per-entry kind and the one-shot
/// advice applied by `behavior_set`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VmBehavior {
    #[default]
    Default,
    Random,
    Sequential,
    WillNeed,
    DontNeed,
    Free,
    ZeroWiredPages,
    Reusable,
    Reuse,
    CanReuse,
    Pageout,
    Zero,
}

bitflags! {
    /// Map entry flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntryFlags: u32 {
        /// Private mapping of an object that must not be written
        const NEEDS_COPY = 0x0001;
        /// Object is shared with another mapping or task
        const IS_SHARED = 0x0002;
        /// Just-in-time code region, exempt from W^X
        const JIT = 0x0004;
        /// Write-protected region with implicit RW toggling
        const TPRO = 0x0008;
        const NO_CACHE = 0x0010;
        const RESILIENT_CODESIGN = 0x0020;
        const RESILIENT_MEDIA = 0x0040;
        /// Pages are zeroed when unwired
        const ZERO_WIRED = 0x0080;
        /// Marked reusable by advice
        const REUSABLE = 0x0100;
        const TRANSLATED_ALLOW_EXECUTE = 0x0200;
        /// Backed by a decrypting pager
        const ENCRYPTED = 0x0400;
    }
}

bitflags! {
    /// Page query result (VM_PAGE_QUERY_*)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PageDisposition: u32 {
        const PRESENT = 0x001;
        const FICTITIOUS = 0x002;
        const REF = 0x004;
        const DIRTY = 0x008;
        const PAGED_OUT = 0x010;
        const COPIED = 0x020;
        const SPECULATIVE = 0x040;
        const EXTERNAL = 0x080;
        const CS_VALIDATED = 0x100;
        const CS_TAINTED = 0x200;
        const CS_NX = 0x400;
        const REUSABLE = 0x800;
    }
}

bitflags! {
    /// msync work requested of the map (vm_sync_t)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmSyncFlags: u32 {
        const ASYNCHRONOUS = 0x01;
        const SYNCHRONOUS = 0x02;
        const INVALIDATE = 0x04;
        const KILLPAGES = 0x08;
        const DEACTIVATE = 0x10;
        /// Fail if the range has holes
        const CONTIGUOUS = 0x20;
    }
}

// ============================================================================
// VM Map Entry
// ============================================================================

/// VM Map Entry - describes a single mapping in the address space
#[derive(Debug, Clone)]
pub struct VmMapEntry {
    /// Start address of this entry
    pub start: u64,

    /// End address of this entry
    pub end: u64,

    /// Backing object
    pub object: Arc<VmObject>,

    /// Offset into the object
    pub offset: u64,

    /// Private copies of written pages, indexed like `object`
    pub shadow: Option<Arc<VmObject>>,

    /// Protection (current)
    pub protection: VmProt,

    /// Maximum protection
    pub max_protection: VmProt,

    /// Inheritance behavior
    pub inheritance: VmInherit,

    /// Paging behavior
    pub behavior: VmBehavior,

    /// User wire count
    pub user_wired_count: u32,

    /// Entry flags
    pub flags: EntryFlags,

    /// Allocation tag
    pub tag: u8,
}

/// A resident page seen through an entry
#[derive(Debug, Clone)]
pub struct MappedPage {
    pub object: Arc<VmObject>,
    pub offset: u64,
    pub id: VmPageId,
    /// Page lives in the entry's private copy
    pub copied: bool,
}

impl VmMapEntry {
    /// Create a new map entry
    pub fn new(start: u64, end: u64, object: Arc<VmObject>, offset: u64) -> Self {
        Self {
            start,
            end,
            object,
            offset,
            shadow: None,
            protection: VmProt::DEFAULT,
            max_protection: VmProt::ALL,
            inheritance: VmInherit::default(),
            behavior: VmBehavior::Default,
            user_wired_count: 0,
            flags: EntryFlags::empty(),
            tag: 0,
        }
    }

    /// Get entry size
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    /// Check if address is in this entry
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Check if this entry overlaps with a range
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }

    /// Object offset backing `addr`
    pub fn object_offset(&self, addr: u64) -> u64 {
        self.offset + (addr - self.start)
    }

    pub fn is_wired(&self) -> bool {
        self.user_wired_count > 0
    }

    /// Anonymous memory no other mapping sees
    pub fn is_private_anon(&self) -> bool {
        self.object.is_internal() && !self.flags.contains(EntryFlags::IS_SHARED)
    }

    /// Shared mapping of a pager-backed object, the memory msync flushes
    pub fn is_shared_external(&self) -> bool {
        !self.object.is_internal() && !self.flags.contains(EntryFlags::NEEDS_COPY)
    }

    /// Split this entry at address, returning the upper portion
    pub fn split(&mut self, at: u64) -> Option<VmMapEntry> {
        if at <= self.start || at >= self.end {
            return None;
        }
        let mut upper = self.clone();
        upper.start = at;
        upper.offset = self.object_offset(at);
        self.end = at;
        Some(upper)
    }

    /// Resident page backing `addr`, the private copy winning
    pub fn resident_page(&self, addr: u64) -> Option<MappedPage> {
        let offset = self.object_offset(addr);
        if let Some(shadow) = &self.shadow {
            if let Some(id) = shadow.page_lookup(offset) {
                return Some(MappedPage {
                    object: Arc::clone(shadow),
                    offset,
                    id,
                    copied: true,
                });
            }
        }
        self.object.page_lookup(offset).map(|id| MappedPage {
            object: Arc::clone(&self.object),
            offset,
            id,
            copied: false,
        })
    }

    /// Resident pages visible through `[start, end)`
    pub fn mapped_pages(&self, start: u64, end: u64) -> Vec<MappedPage> {
        let (lo, hi) = self.offsets(start, end);
        let mut out = Vec::new();
        if let Some(shadow) = &self.shadow {
            out.extend(shadow.pages_in(lo, hi).into_iter().map(|(offset, id)| MappedPage {
                object: Arc::clone(shadow),
                offset,
                id,
                copied: true,
            }));
        }
        let shadowed = out.len();
        for (offset, id) in self.object.pages_in(lo, hi) {
            if out[..shadowed].iter().any(|p| p.offset == offset) {
                continue;
            }
            out.push(MappedPage {
                object: Arc::clone(&self.object),
                offset,
                id,
                copied: false,
            });
        }
        out
    }

    /// Resident pages of memory only this mapping owns in `[start, end)`
    pub fn private_pages(&self, start: u64, end: u64) -> Vec<MappedPage> {
        let (lo, hi) = self.offsets(start, end);
        let mut out = Vec::new();
        if self.flags.contains(EntryFlags::IS_SHARED) {
            return out;
        }
        if let Some(shadow) = &self.shadow {
            out.extend(shadow.pages_in(lo, hi).into_iter().map(|(offset, id)| MappedPage {
                object: Arc::clone(shadow),
                offset,
                id,
                copied: true,
            }));
        }
        if self.object.is_internal() {
            out.extend(self.object.pages_in(lo, hi).into_iter().map(|(offset, id)| MappedPage {
                object: Arc::clone(&self.object),
                offset,
                id,
                copied: false,
            }));
        }
        out
    }

    /// Object offsets of `[start, end)` clamped to the entry
    fn offsets(&self, start: u64, end: u64) -> (u64, u64) {
        let start = start.max(self.start);
        let end = end.min(self.end);
        if start >= end {
            return (0, 0);
        }
        (self.object_offset(start), self.object_offset(end))
    }
}

/// What a new entry maps, and how
#[derive(Debug, Clone)]
pub struct EntrySpec {
    pub object: Arc<VmObject>,
    pub offset: u64,
    pub protection: VmProt,
    pub max_protection: VmProt,
    pub inheritance: VmInherit,
    pub flags: EntryFlags,
    pub tag: u8,
}

/// Where a new entry goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Exactly at `addr`, replacing what is there when `overwrite`
    Fixed { addr: u64, overwrite: bool },
    /// First hole at or above `hint` that ends at or below `limit`
    Anywhere { hint: u64, limit: u64 },
}

// ============================================================================
// VM Map
// ============================================================================

/// Entries and the per-map bookkeeping guarded by the map lock
pub struct MapInner {
    entries: BTreeMap<u64, VmMapEntry>,
    /// Pages wired on behalf of the user, by virtual page
    wired: BTreeMap<u64, VmPageId>,
    size: u64,
}

impl MapInner {
    /// Entry containing `addr`
    pub fn lookup(&self, addr: u64) -> Option<&VmMapEntry> {
        let (_, entry) = self.entries.range(..=addr).next_back()?;
        entry.contains(addr).then_some(entry)
    }

    pub fn lookup_mut(&mut self, addr: u64) -> Option<&mut VmMapEntry> {
        let (_, entry) = self.entries.range_mut(..=addr).next_back()?;
        entry.contains(addr).then_some(entry)
    }

    /// Keys of the entries overlapping `[start, end)`, in address order
    fn overlapping(&self, start: u64, end: u64) -> Vec<u64> {
        let mut keys = Vec::new();
        if start >= end {
            return keys;
        }
        if let Some((&key, entry)) = self.entries.range(..start).next_back() {
            if entry.end > start {
                keys.push(key);
            }
        }
        keys.extend(self.entries.range(start..end).map(|(&key, _)| key));
        keys
    }

    /// Whether entries cover `[start, end)` without holes
    fn is_contiguous(&self, start: u64, end: u64) -> bool {
        let mut cursor = start;
        for key in self.overlapping(start, end) {
            let entry = &self.entries[&key];
            if entry.start > cursor {
                return false;
            }
            cursor = entry.end;
        }
        cursor >= end
    }

    fn check_protect(&self, start: u64, end: u64, new_prot: VmProt) -> KernResult<()> {
        if !self.is_contiguous(start, end) {
            return Err(KernError::InvalidAddress);
        }
        for key in self.overlapping(start, end) {
            if !self.entries[&key].max_protection.contains(new_prot) {
                return Err(KernError::ProtectionFailure);
            }
        }
        Ok(())
    }

    /// Split the entry straddling `at`
    fn clip(&mut self, at: u64) {
        let Some((_, entry)) = self.entries.range_mut(..at).next_back() else {
            return;
        };
        if let Some(upper) = entry.split(at) {
            self.entries.insert(at, upper);
        }
    }

    fn clip_range(&mut self, start: u64, end: u64) -> Vec<u64> {
        self.clip(start);
        self.clip(end);
        self.overlapping(start, end)
    }

    /// Entry count after replacing `[start, end)` with one entry
    fn count_after_replace(&self, start: u64, end: u64) -> usize {
        let keys = self.overlapping(start, end);
        let mut count = self.entries.len() - keys.len() + 1;
        if let Some(first) = keys.first() {
            if self.entries[first].start < start {
                count += 1;
            }
        }
        if let Some(last) = keys.last() {
            if self.entries[last].end > end {
                count += 1;
            }
        }
        count
    }
}

/// VM Map - represents a task's address space
pub struct VmMap {
    sys: Arc<VmSystem>,

    inner: Mutex<MapInner>,

    /// Minimum address
    min_offset: u64,

    /// Maximum address
    max_offset: u64,

    max_entries: usize,

    enforce_wx: bool,

    /// Timestamp for versioning
    timestamp: AtomicU64,
}

impl VmMap {
    /// Create a user map with the configured bounds
    pub fn new(sys: &Arc<VmSystem>) -> Self {
        let config = sys.config();
        Self::with_bounds(sys, config.map_min, config.map_max)
    }

    pub fn with_bounds(sys: &Arc<VmSystem>, min: u64, max: u64) -> Self {
        let config = sys.config();
        Self {
            sys: Arc::clone(sys),
            inner: Mutex::new(MapInner {
                entries: BTreeMap::new(),
                wired: BTreeMap::new(),
                size: 0,
            }),
            min_offset: min,
            max_offset: max,
            max_entries: config.max_map_entries,
            enforce_wx: config.enforce_wx,
            timestamp: AtomicU64::new(0),
        }
    }

    pub fn system(&self) -> &Arc<VmSystem> {
        &self.sys
    }

    pub fn min_offset(&self) -> u64 {
        self.min_offset
    }

    pub fn max_offset(&self) -> u64 {
        self.max_offset
    }

    /// Lock the map
    pub fn lock(&self) -> MutexGuard<'_, MapInner> {
        self.inner.lock()
    }

    fn bump(&self) {
        self.timestamp.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Relaxed)
    }

    /// Get map size
    pub fn total_size(&self) -> u64 {
        self.inner.lock().size
    }

    /// Get entry count
    pub fn entry_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Copy of the entry containing `addr`
    pub fn lookup(&self, addr: u64) -> Option<VmMapEntry> {
        self.inner.lock().lookup(addr).cloned()
    }

    /// `(start, end)` of every entry
    pub fn regions(&self) -> Vec<(u64, u64)> {
        self.inner
            .lock()
            .entries
            .values()
            .map(|e| (e.start, e.end))
            .collect()
    }

    /// Virtual pages wired on behalf of the user
    pub fn user_wired_pages(&self) -> usize {
        self.inner.lock().wired.len()
    }

    /// Whether `[start, end)` is fully mapped
    pub fn is_mapped(&self, start: u64, end: u64) -> bool {
        self.inner.lock().is_contiguous(start, end)
    }

    fn in_bounds(&self, start: u64, end: u64) -> bool {
        start >= self.min_offset && end <= self.max_offset && start < end
    }

    // ------------------------------------------------------------------------
    // Placement
    // ------------------------------------------------------------------------

    /// First hole of `size` bytes at or above `hint` ending by `limit`
    fn find_space(&self, inner: &MapInner, hint: u64, size: u64, limit: u64) -> KernResult<u64> {
        let limit = limit.min(self.max_offset);
        let mut addr = hint.max(self.min_offset);
        if let Some((_, entry)) = inner.entries.range(..=addr).next_back() {
            if entry.end > addr {
                addr = entry.end;
            }
        }
        for entry in inner.entries.range(addr..).map(|(_, e)| e) {
            let end = addr.checked_add(size).ok_or(KernError::NoSpace)?;
            if end <= entry.start {
                break;
            }
            addr = addr.max(entry.end);
        }
        let end = addr.checked_add(size).ok_or(KernError::NoSpace)?;
        if end > limit {
            return Err(KernError::NoSpace);
        }
        Ok(addr)
    }

    /// Enter a new mapping of `size` bytes
    ///
    /// A fixed overwrite replaces whatever overlaps the window in one step
    /// under the map lock; every check runs first, so on failure the old
    /// mappings are untouched.
    pub fn enter(&self, placement: Placement, size: u64, spec: EntrySpec) -> KernResult<u64> {
        if size == 0 || !page_aligned(size) || !page_aligned(spec.offset) {
            return Err(KernError::InvalidArgument);
        }
        let mut protection = spec.protection;
        if self.enforce_wx
            && protection.contains(VmProt::WRITE | VmProt::EXECUTE)
            && !spec.flags.contains(EntryFlags::JIT)
        {
            log::warn!("vm_map: W+X mapping requested, removing execute");
            protection.remove(VmProt::EXECUTE);
        }
        if !spec.max_protection.contains(protection) {
            return Err(KernError::ProtectionFailure);
        }

        let mut inner = self.inner.lock();
        let (start, replaced) = match placement {
            Placement::Fixed { addr, overwrite } => {
                if !page_aligned(addr) {
                    return Err(KernError::InvalidArgument);
                }
                let end = addr.checked_add(size).ok_or(KernError::InvalidAddress)?;
                if !self.in_bounds(addr, end) {
                    return Err(KernError::InvalidAddress);
                }
                let overlapping = inner.overlapping(addr, end);
                if !overlapping.is_empty() && !overwrite {
                    return Err(KernError::NoSpace);
                }
                if inner.count_after_replace(addr, end) > self.max_entries {
                    return Err(KernError::NoSpace);
                }
                let mut replaced = Vec::new();
                if !overlapping.is_empty() {
                    for key in inner.clip_range(addr, end) {
                        if let Some(old) = inner.entries.remove(&key) {
                            inner.size -= old.size();
                            replaced.push(old);
                        }
                    }
                }
                (addr, replaced)
            }
            Placement::Anywhere { hint, limit } => {
                if inner.entries.len() + 1 > self.max_entries {
                    return Err(KernError::NoSpace);
                }
                (self.find_space(&inner, hint, size, limit)?, Vec::new())
            }
        };

        let end = start + size;
        let mut entry = VmMapEntry::new(start, end, spec.object, spec.offset);
        entry.protection = protection;
        entry.max_protection = spec.max_protection;
        entry.inheritance = spec.inheritance;
        entry.flags = spec.flags;
        entry.tag = spec.tag;
        inner.entries.insert(start, entry);
        inner.size += size;
        for old in replaced {
            self.retire(&mut inner, old);
        }
        self.bump();
        log::trace!("vm_map: entered [{:#x}, {:#x})", start, end);
        Ok(start)
    }

    /// Release what a removed entry held: user wirings and its private pages
    fn retire(&self, inner: &mut MapInner, entry: VmMapEntry) {
        let queues = self.sys.queues();
        let wired: Vec<u64> = inner
            .wired
            .range(entry.start..entry.end)
            .map(|(&va, _)| va)
            .collect();
        for va in wired {
            if let Some(id) = inner.wired.remove(&va) {
                queues.unwire(id, true);
            }
        }
        for page in entry.private_pages(entry.start, entry.end) {
            page.object.page_free(page.offset);
        }
        if entry.is_private_anon() {
            let (lo, hi) = entry.offsets(entry.start, entry.end);
            entry.object.discard_paged_out(lo, hi);
        }
    }

    /// Remove all mappings in `[start, end)`
    ///
    /// Parts of the range with no mapping are ignored.
    pub fn remove(&self, start: u64, end: u64) -> KernResult<()> {
        if start >= end {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        let keys = inner.overlapping(start, end);
        if keys.is_empty() {
            return Ok(());
        }
        for key in inner.clip_range(start, end) {
            if let Some(old) = inner.entries.remove(&key) {
                inner.size -= old.size();
                self.retire(&mut inner, old);
            }
        }
        self.bump();
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Attributes
    // ------------------------------------------------------------------------

    /// Change protection on a range
    ///
    /// The whole range must be mapped and allow `new_prot`, otherwise
    /// nothing changes.
    pub fn protect(&self, start: u64, end: u64, new_prot: VmProt) -> KernResult<()> {
        let mut inner = self.inner.lock();
        inner.check_protect(start, end, new_prot)?;
        self.apply_protect(&mut inner, start, end, new_prot);
        Ok(())
    }

    fn apply_protect(&self, inner: &mut MapInner, start: u64, end: u64, new_prot: VmProt) {
        let mut stripped = false;
        for key in inner.clip_range(start, end) {
            if let Some(entry) = inner.entries.get_mut(&key) {
                let mut prot = new_prot;
                if self.enforce_wx
                    && prot.contains(VmProt::WRITE | VmProt::EXECUTE)
                    && !entry.flags.contains(EntryFlags::JIT)
                {
                    prot.remove(VmProt::EXECUTE);
                    stripped = true;
                }
                entry.protection = prot;
            }
        }
        if stripped {
            log::warn!(
                "vm_map: W+X protection on [{:#x}, {:#x}), removing execute",
                start,
                end
            );
        }
        self.bump();
    }

    /// Set fork-time inheritance on a range
    pub fn inherit(&self, start: u64, end: u64, inheritance: VmInherit) -> KernResult<()> {
        let mut inner = self.inner.lock();
        for key in inner.clip_range(start, end) {
            if let Some(entry) = inner.entries.get_mut(&key) {
                entry.inheritance = inheritance;
            }
        }
        self.bump();
        Ok(())
    }

    /// Apply paging behavior or advice to a range
    ///
    /// `now` dates pages read ahead for `WillNeed`.
    pub fn behavior_set(
        &self,
        start: u64,
        end: u64,
        behavior: VmBehavior,
        now: u64,
    ) -> KernResult<()> {
        let mut inner = self.inner.lock();
        if !inner.is_contiguous(start, end) {
            return Err(KernError::NoSpace);
        }
        let queues = self.sys.queues();
        match behavior {
            VmBehavior::Default | VmBehavior::Random | VmBehavior::Sequential => {
                for key in inner.clip_range(start, end) {
                    if let Some(entry) = inner.entries.get_mut(&key) {
                        entry.behavior = behavior;
                    }
                }
                self.bump();
            }
            VmBehavior::WillNeed => {
                for key in inner.overlapping(start, end) {
                    let Some(entry) = inner.entries.get_mut(&key) else {
                        continue;
                    };
                    if !entry.protection.can_fetch() {
                        continue;
                    }
                    let Some(pager) = entry.object.pager().cloned() else {
                        continue;
                    };
                    let mut va = start.max(entry.start);
                    while va < end.min(entry.end) {
                        let offset = entry.object_offset(va);
                        if entry.resident_page(va).is_none() && pager.has_page(offset) {
                            // Read-ahead is best effort
                            if vm_fault::resolve(
                                &self.sys,
                                entry,
                                va,
                                false,
                                FaultPlacement::Speculative(now),
                            )
                            .is_err()
                            {
                                return Ok(());
                            }
                        }
                        va += PAGE;
                    }
                }
            }
            VmBehavior::DontNeed => {
                for key in inner.overlapping(start, end) {
                    for page in inner.entries[&key].mapped_pages(start, end) {
                        if !queues.page(page.id).is_busy() {
                            queues.deactivate(page.id);
                        }
                    }
                }
            }
            VmBehavior::Free => {
                for key in inner.overlapping(start, end) {
                    for page in inner.entries[&key].private_pages(start, end) {
                        let p = queues.page(page.id);
                        if p.is_busy() || p.wire_count() > 0 {
                            continue;
                        }
                        p.set_dirty(false);
                        queues.deactivate(page.id);
                    }
                }
            }
            VmBehavior::ZeroWiredPages => {
                for key in inner.clip_range(start, end) {
                    if let Some(entry) = inner.entries.get_mut(&key) {
                        entry.flags.insert(EntryFlags::ZERO_WIRED);
                    }
                }
                self.bump();
            }
            VmBehavior::Reusable => {
                for key in inner.overlapping(start, end) {
                    if !inner.entries[&key].protection.contains(VmProt::WRITE) {
                        return Err(KernError::ProtectionFailure);
                    }
                }
                for key in inner.clip_range(start, end) {
                    let Some(entry) = inner.entries.get_mut(&key) else {
                        continue;
                    };
                    entry.flags.insert(EntryFlags::REUSABLE);
                    for page in entry.private_pages(start, end) {
                        let p = queues.page(page.id);
                        if p.is_busy() || p.wire_count() > 0 {
                            continue;
                        }
                        p.update(|s| s.with_reusable(true).with_dirty(false));
                        queues.deactivate(page.id);
                    }
                }
                self.bump();
            }
            VmBehavior::Reuse => {
                for key in inner.clip_range(start, end) {
                    let Some(entry) = inner.entries.get_mut(&key) else {
                        continue;
                    };
                    entry.flags.remove(EntryFlags::REUSABLE);
                    for page in entry.private_pages(start, end) {
                        queues.page(page.id).update(|s| s.with_reusable(false));
                    }
                }
                self.bump();
            }
            VmBehavior::CanReuse => {
                for key in inner.overlapping(start, end) {
                    let entry = &inner.entries[&key];
                    if !entry.is_private_anon() && entry.shadow.is_none() {
                        return Err(KernError::InvalidArgument);
                    }
                }
            }
            VmBehavior::Pageout => {
                for key in inner.overlapping(start, end) {
                    for page in inner.entries[&key].mapped_pages(start, end) {
                        let p = queues.page(page.id);
                        if p.is_busy() || p.wire_count() > 0 {
                            continue;
                        }
                        if p.is_dirty() {
                            if p.q_state() != QState::Pageout {
                                queues.enqueue_pageout(page.id);
                            }
                        } else {
                            queues.deactivate(page.id);
                        }
                    }
                }
            }
            VmBehavior::Zero => {
                let keys = inner.overlapping(start, end);
                for key in &keys {
                    let entry = &inner.entries[key];
                    if !entry.protection.contains(VmProt::WRITE) {
                        return Err(KernError::ProtectionFailure);
                    }
                    if !entry.is_private_anon() {
                        return Err(KernError::NotSupported);
                    }
                }
                for key in keys {
                    for page in inner.entries[&key].private_pages(start, end) {
                        if queues.page(page.id).wire_count() > 0 {
                            self.sys.phys().zero_page(queues.page(page.id).phys_page());
                        } else {
                            page.object.page_free(page.offset);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Wiring
    // ------------------------------------------------------------------------

    /// Wire `[start, end)` for the user
    ///
    /// Pages are faulted in with the entry's protection and wired. If a page
    /// cannot be had, everything wired by this call is unwired again.
    pub fn wire_user(&self, start: u64, end: u64) -> KernResult<()> {
        let mut inner = self.inner.lock();
        if !inner.is_contiguous(start, end) {
            return Err(KernError::InvalidAddress);
        }
        for key in inner.overlapping(start, end) {
            if inner.entries[&key].protection.is_empty() {
                return Err(KernError::ProtectionFailure);
            }
        }
        let keys = inner.clip_range(start, end);
        let queues = self.sys.queues();
        let mut newly: Vec<u64> = Vec::new();
        let mut failure = None;
        'entries: for key in &keys {
            let MapInner { entries, wired, .. } = &mut *inner;
            let Some(entry) = entries.get_mut(key) else {
                continue;
            };
            if entry.user_wired_count > 0 {
                continue;
            }
            let write = entry.protection.contains(VmProt::WRITE);
            let mut va = entry.start;
            while va < entry.end {
                match vm_fault::resolve(&self.sys, entry, va, write, FaultPlacement::Active) {
                    Ok(id) => {
                        queues.wire(id);
                        wired.insert(va, id);
                        newly.push(va);
                    }
                    Err(err) => {
                        failure = Some(err);
                        break 'entries;
                    }
                }
                va += PAGE;
            }
        }
        if let Some(err) = failure {
            for va in newly {
                if let Some(id) = inner.wired.remove(&va) {
                    queues.unwire(id, true);
                }
            }
            log::debug!("vm_map: wire of [{:#x}, {:#x}) failed: {}", start, end, err);
            return Err(err);
        }
        for key in &keys {
            if let Some(entry) = inner.entries.get_mut(key) {
                entry.user_wired_count += 1;
            }
        }
        self.bump();
        Ok(())
    }

    /// Drop one user wiring from `[start, end)`
    pub fn unwire_user(&self, start: u64, end: u64) -> KernResult<()> {
        let mut inner = self.inner.lock();
        if !inner.is_contiguous(start, end) {
            return Err(KernError::InvalidAddress);
        }
        let queues = self.sys.queues();
        for key in inner.clip_range(start, end) {
            let MapInner { entries, wired, .. } = &mut *inner;
            let Some(entry) = entries.get_mut(&key) else {
                continue;
            };
            if entry.user_wired_count == 0 {
                continue;
            }
            entry.user_wired_count -= 1;
            if entry.user_wired_count > 0 {
                continue;
            }
            let zero = entry.flags.contains(EntryFlags::ZERO_WIRED);
            let vas: Vec<u64> = wired.range(entry.start..entry.end).map(|(&va, _)| va).collect();
            for va in vas {
                if let Some(id) = wired.remove(&va) {
                    if zero {
                        self.sys.phys().zero_page(queues.page(id).phys_page());
                    }
                    queues.unwire(id, true);
                }
            }
        }
        self.bump();
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Sync, query, signing
    // ------------------------------------------------------------------------

    /// Flush, invalidate or discard pages of `[start, end)`
    pub fn msync(&self, start: u64, end: u64, flags: VmSyncFlags) -> KernResult<()> {
        let inner = self.inner.lock();
        if flags.contains(VmSyncFlags::CONTIGUOUS) && !inner.is_contiguous(start, end) {
            return Err(KernError::InvalidAddress);
        }
        let queues = self.sys.queues();
        let mut result = Ok(());
        for key in inner.overlapping(start, end) {
            let entry = &inner.entries[&key];
            let pages = if entry.is_shared_external() {
                entry.mapped_pages(start, end)
            } else {
                entry.private_pages(start, end)
            };
            for page in pages {
                let p = queues.page(page.id);
                let unwired = p.wire_count() == 0;
                if flags.contains(VmSyncFlags::KILLPAGES) {
                    if unwired {
                        page.object.page_free(page.offset);
                    }
                    continue;
                }
                if entry.is_shared_external() && p.is_dirty() {
                    if flags.contains(VmSyncFlags::SYNCHRONOUS) {
                        if let Err(err) = self.write_back(&page) {
                            log::debug!(
                                "vm_map: writeback of offset {:#x} failed: {}",
                                page.offset,
                                err
                            );
                            result = Err(KernError::Failure);
                            continue;
                        }
                    } else if flags.contains(VmSyncFlags::ASYNCHRONOUS)
                        && unwired
                        && p.q_state() != QState::Pageout
                    {
                        queues.enqueue_pageout(page.id);
                    }
                }
                if flags.contains(VmSyncFlags::DEACTIVATE) {
                    queues.deactivate(page.id);
                }
                if flags.contains(VmSyncFlags::INVALIDATE)
                    && entry.is_shared_external()
                    && unwired
                    && !p.is_dirty()
                {
                    page.object.page_free(page.offset);
                }
            }
        }
        result
    }

    /// Write one dirty page to its pager, holding it busy across the I/O
    fn write_back(&self, page: &MappedPage) -> Result<(), crate::mach_vm::memory_object::PagerError> {
        let Some(pager) = page.object.pager() else {
            return Ok(());
        };
        let p = self.sys.queues().page(page.id);
        p.acquire_busy();
        let result = pager.data_return(page.offset, p.phys_page(), self.sys.phys());
        if result.is_ok() {
            p.set_dirty(false);
            self.sys.counters().pageouts.inc();
        }
        p.clear_busy();
        result
    }

    /// Disposition of the page at `addr`, `None` if unmapped
    pub fn page_query(&self, addr: u64) -> Option<PageDisposition> {
        let inner = self.inner.lock();
        Self::disposition(&self.sys, &inner, addr)
    }

    /// Dispositions of `pages` consecutive pages from `start`, one map lock
    /// hold for the batch
    pub fn page_range_query(
        &self,
        start: u64,
        pages: usize,
        mut f: impl FnMut(Option<PageDisposition>),
    ) {
        let inner = self.inner.lock();
        let mut va = start;
        for _ in 0..pages {
            f(Self::disposition(&self.sys, &inner, va));
            va = va.wrapping_add(PAGE);
        }
    }

    fn disposition(sys: &VmSystem, inner: &MapInner, addr: u64) -> Option<PageDisposition> {
        let entry = inner.lookup(addr)?;
        let mut disp = PageDisposition::empty();
        match entry.resident_page(addr) {
            Some(page) => {
                let state = sys.queues().page(page.id).state();
                disp |= PageDisposition::PRESENT;
                if page.copied {
                    disp |= PageDisposition::COPIED;
                } else if !page.object.is_internal() {
                    disp |= PageDisposition::EXTERNAL;
                }
                if state.reference() {
                    disp |= PageDisposition::REF;
                }
                if state.dirty() {
                    disp |= PageDisposition::DIRTY;
                }
                if state.queue() == QState::Speculative {
                    disp |= PageDisposition::SPECULATIVE;
                }
                if state.fictitious() {
                    disp |= PageDisposition::FICTITIOUS;
                }
                if state.cs_validated() {
                    disp |= PageDisposition::CS_VALIDATED;
                }
                if state.cs_tainted() {
                    disp |= PageDisposition::CS_TAINTED;
                }
                if state.cs_nx() {
                    disp |= PageDisposition::CS_NX;
                }
                if state.reusable() {
                    disp |= PageDisposition::REUSABLE;
                }
            }
            None => {
                let offset = entry.object_offset(addr);
                if !entry.object.is_internal() {
                    disp |= PageDisposition::EXTERNAL;
                }
                if entry.object.is_paged_out(offset) {
                    disp |= PageDisposition::PAGED_OUT;
                }
            }
        }
        Some(disp)
    }

    /// Mark the resident pages of `[start, end)` as carrying a valid code
    /// signature
    ///
    /// Every page must be resident; nothing is marked otherwise.
    pub fn sign(&self, start: u64, end: u64) -> KernResult<()> {
        self.sign_and_protect(start, end, None)
    }

    /// Mark the pages of `[start, end)` validated and then apply `prot`
    ///
    /// Both happen under one map lock. Residency and the protection are
    /// checked before any page is marked, so on error the pages and the
    /// entries are left as they were.
    pub fn sign_and_protect(&self, start: u64, end: u64, prot: Option<VmProt>) -> KernResult<()> {
        let mut inner = self.inner.lock();
        if !inner.is_contiguous(start, end) {
            return Err(KernError::InvalidAddress);
        }
        if let Some(prot) = prot {
            inner.check_protect(start, end, prot)?;
        }
        let mut pages = Vec::new();
        let mut va = start;
        while va < end {
            let page = inner
                .lookup(va)
                .and_then(|entry| entry.resident_page(va))
                .ok_or(KernError::Failure)?;
            pages.push(page.id);
            va += PAGE;
        }
        let queues = self.sys.queues();
        for id in pages {
            queues
                .page(id)
                .update(|s| s.with_cs_validated(true).with_cs_tainted(false));
        }
        if let Some(prot) = prot {
            self.apply_protect(&mut inner, start, end, prot);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Encrypted remap
    // ------------------------------------------------------------------------

    /// File behind `[start, end)` and the file offset of `start`
    pub fn crypt_source(&self, start: u64, end: u64) -> KernResult<(Arc<Vnode>, u64)> {
        let inner = self.inner.lock();
        if !inner.is_contiguous(start, end) {
            return Err(KernError::InvalidAddress);
        }
        let mut source = None;
        for key in inner.overlapping(start, end) {
            let entry = &inner.entries[&key];
            let vnode = entry
                .object
                .pager()
                .and_then(|p| p.vnode())
                .ok_or(KernError::InvalidArgument)?;
            if source.is_none() {
                source = Some((Arc::clone(vnode), entry.object_offset(start.max(entry.start))));
            }
        }
        source.ok_or(KernError::InvalidAddress)
    }

    /// Rebind `[start, end)` to objects that decrypt through `crypter`
    pub fn remap_crypt(
        &self,
        start: u64,
        end: u64,
        crypter: Arc<dyn TextCrypter>,
    ) -> KernResult<()> {
        let mut inner = self.inner.lock();
        if !inner.is_contiguous(start, end) {
            return Err(KernError::InvalidAddress);
        }
        for key in inner.overlapping(start, end) {
            let entry = &inner.entries[&key];
            if entry.object.pager().is_none() {
                return Err(KernError::InvalidArgument);
            }
            if entry.is_wired() {
                return Err(KernError::Failure);
            }
        }
        let objects = Arc::clone(self.sys.objects());
        let mut remapped: BTreeMap<u32, Arc<VmObject>> = BTreeMap::new();
        for key in inner.clip_range(start, end) {
            let Some(entry) = inner.entries.get_mut(&key) else {
                continue;
            };
            let Some(backing) = entry.object.pager().cloned() else {
                continue;
            };
            let object = remapped
                .entry(entry.object.id())
                .or_insert_with(|| {
                    let pager: Arc<dyn Pager> =
                        Arc::new(CryptPager::new(backing, Arc::clone(&crypter)));
                    objects.create_external(entry.object.size(), pager)
                })
                .clone();
            entry.object = object;
            entry.shadow = None;
            entry.flags.insert(EntryFlags::ENCRYPTED | EntryFlags::NEEDS_COPY);
        }
        self.bump();
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Fork
    // ------------------------------------------------------------------------

    /// Build a child map by inheritance
    ///
    /// Shared entries map the same objects in both maps. Copied anonymous
    /// memory is copied page by page; copied file mappings become private
    /// copy-on-write mappings of the same file. User wirings are not
    /// inherited.
    pub fn fork(&self) -> KernResult<VmMap> {
        let child = VmMap::with_bounds(&self.sys, self.min_offset, self.max_offset);
        let mut inner = self.inner.lock();
        let mut child_inner = child.inner.lock();
        for entry in inner.entries.values_mut() {
            let mut copy = entry.clone();
            copy.user_wired_count = 0;
            match entry.inheritance {
                VmInherit::None => continue,
                VmInherit::Share => {
                    entry.flags.insert(EntryFlags::IS_SHARED);
                    copy.flags.insert(EntryFlags::IS_SHARED);
                }
                VmInherit::Copy => {
                    let (lo, hi) = entry.offsets(entry.start, entry.end);
                    copy.flags.remove(EntryFlags::IS_SHARED);
                    if entry.object.is_internal() && entry.shadow.is_none() {
                        copy.object = self.copy_object(&entry.object, lo, hi)?;
                    } else {
                        copy.flags.insert(EntryFlags::NEEDS_COPY);
                        copy.shadow = match &entry.shadow {
                            Some(shadow) => Some(self.copy_object(shadow, lo, hi)?),
                            None => None,
                        };
                    }
                }
            }
            child_inner.size += copy.size();
            child_inner.entries.insert(copy.start, copy);
        }
        drop(child_inner);
        drop(inner);
        self.bump();
        Ok(child)
    }

    /// New internal object holding copies of `src`'s resident pages in
    /// `[lo, hi)`
    fn copy_object(&self, src: &Arc<VmObject>, lo: u64, hi: u64) -> KernResult<Arc<VmObject>> {
        let queues = self.sys.queues();
        let dst = self.sys.objects().create_internal(src.size());
        for (offset, id) in src.pages_in(lo, hi) {
            let from = queues.page(id);
            from.acquire_busy();
            let copied = self.sys.grab_page();
            let to = match copied {
                Ok(to) => to,
                Err(err) => {
                    from.clear_busy();
                    return Err(err);
                }
            };
            self.sys
                .phys()
                .copy_page(from.phys_page(), queues.page(to).phys_page());
            let dirty = from.is_dirty();
            from.clear_busy();
            dst.page_insert(offset, to);
            queues.page(to).set_dirty(dirty);
            queues.activate(to);
            queues.page(to).clear_busy();
        }
        Ok(dst)
    }
}

impl core::fmt::Debug for VmMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmMap")
            .field("min_offset", &self.min_offset)
            .field("max_offset", &self.max_offset)
            .field("entries", &self.entry_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use crate::mach_vm::pmap::SparsePhysMemory;
    use crate::mach_vm::vm_fault::vm_fault;
    use crate::mach_vm::vm_resident::QueueKind;

    const BASE: u64 = 0x10_0000;

    fn system(pages: u64) -> Arc<VmSystem> {
        let config = VmConfig::default()
            .with_page_colors(1)
            .with_max_map_entries(16);
        VmSystem::bootstrap(
            config,
            &[0..pages * PAGE],
            Arc::new(SparsePhysMemory::new()),
        )
        .unwrap()
    }

    fn anon(sys: &Arc<VmSystem>, size: u64) -> EntrySpec {
        EntrySpec {
            object: sys.objects().create_internal(size),
            offset: 0,
            protection: VmProt::DEFAULT,
            max_protection: VmProt::ALL,
            inheritance: VmInherit::Copy,
            flags: EntryFlags::empty(),
            tag: 0,
        }
    }

    fn fixed(addr: u64) -> Placement {
        Placement::Fixed {
            addr,
            overwrite: false,
        }
    }

    #[test]
    fn test_anywhere_placement_skips_entries() {
        let sys = system(16);
        let map = VmMap::new(&sys);
        map.enter(fixed(BASE), 2 * PAGE, anon(&sys, 2 * PAGE)).unwrap();
        let hint = Placement::Anywhere {
            hint: BASE,
            limit: u64::MAX,
        };
        let addr = map.enter(hint, PAGE, anon(&sys, PAGE)).unwrap();
        assert_eq!(addr, BASE + 2 * PAGE);
        assert_eq!(map.total_size(), 3 * PAGE);
    }

    #[test]
    fn test_anywhere_respects_limit() {
        let sys = system(16);
        let map = VmMap::new(&sys);
        let hint = Placement::Anywhere {
            hint: BASE,
            limit: BASE + PAGE,
        };
        assert_eq!(
            map.enter(hint, 2 * PAGE, anon(&sys, 2 * PAGE)),
            Err(KernError::NoSpace)
        );
    }

    #[test]
    fn test_fixed_without_overwrite_refuses_overlap() {
        let sys = system(16);
        let map = VmMap::new(&sys);
        map.enter(fixed(BASE), 2 * PAGE, anon(&sys, 2 * PAGE)).unwrap();
        assert_eq!(
            map.enter(fixed(BASE + PAGE), PAGE, anon(&sys, PAGE)),
            Err(KernError::NoSpace)
        );
    }

    #[test]
    fn test_overwrite_clips_neighbors() {
        let sys = system(16);
        let map = VmMap::new(&sys);
        map.enter(fixed(BASE), 4 * PAGE, anon(&sys, 4 * PAGE)).unwrap();
        let over = Placement::Fixed {
            addr: BASE + PAGE,
            overwrite: true,
        };
        map.enter(over, 2 * PAGE, anon(&sys, 2 * PAGE)).unwrap();
        assert_eq!(
            map.regions(),
            vec![
                (BASE, BASE + PAGE),
                (BASE + PAGE, BASE + 3 * PAGE),
                (BASE + 3 * PAGE, BASE + 4 * PAGE)
            ]
        );
        assert_eq!(map.lookup(BASE + 3 * PAGE).unwrap().offset, 3 * PAGE);
        assert_eq!(map.total_size(), 4 * PAGE);
    }

    #[test]
    fn test_remove_frees_private_pages() {
        let sys = system(16);
        let map = VmMap::new(&sys);
        map.enter(fixed(BASE), 2 * PAGE, anon(&sys, 2 * PAGE)).unwrap();
        vm_fault(&map, BASE, VmProt::WRITE).unwrap();
        vm_fault(&map, BASE + PAGE, VmProt::READ).unwrap();
        assert_eq!(sys.queues().free_count(), 14);
        map.remove(BASE + PAGE, BASE + 2 * PAGE).unwrap();
        assert_eq!(sys.queues().free_count(), 15);
        map.remove(BASE, BASE + 2 * PAGE).unwrap();
        assert_eq!(sys.queues().free_count(), 16);
        // Already gone
        map.remove(BASE, BASE + 2 * PAGE).unwrap();
        assert_eq!(map.entry_count(), 0);
    }

    #[test]
    fn test_protect_is_all_or_nothing() {
        let sys = system(16);
        let map = VmMap::new(&sys);
        map.enter(fixed(BASE), PAGE, anon(&sys, PAGE)).unwrap();
        let mut ro = anon(&sys, PAGE);
        ro.protection = VmProt::READ;
        ro.max_protection = VmProt::READ;
        map.enter(fixed(BASE + PAGE), PAGE, ro).unwrap();

        assert_eq!(
            map.protect(BASE, BASE + 2 * PAGE, VmProt::DEFAULT),
            Err(KernError::ProtectionFailure)
        );
        assert_eq!(map.lookup(BASE).unwrap().protection, VmProt::DEFAULT);
        assert_eq!(
            map.protect(BASE, BASE + 3 * PAGE, VmProt::READ),
            Err(KernError::InvalidAddress)
        );
        map.protect(BASE, BASE + 2 * PAGE, VmProt::READ).unwrap();
        assert_eq!(map.lookup(BASE).unwrap().protection, VmProt::READ);
    }

    #[test]
    fn test_protect_strips_write_execute() {
        let sys = system(16);
        let map = VmMap::new(&sys);
        map.enter(fixed(BASE), PAGE, anon(&sys, PAGE)).unwrap();
        map.protect(BASE, BASE + PAGE, VmProt::ALL).unwrap();
        assert_eq!(map.lookup(BASE).unwrap().protection, VmProt::DEFAULT);

        let mut jit = anon(&sys, PAGE);
        jit.flags = EntryFlags::JIT;
        map.enter(fixed(BASE + PAGE), PAGE, jit).unwrap();
        map.protect(BASE + PAGE, BASE + 2 * PAGE, VmProt::ALL).unwrap();
        assert_eq!(map.lookup(BASE + PAGE).unwrap().protection, VmProt::ALL);
    }

    #[test]
    fn test_wire_unwind_on_shortage() {
        let sys = system(2);
        let map = VmMap::new(&sys);
        map.enter(fixed(BASE), 4 * PAGE, anon(&sys, 4 * PAGE)).unwrap();
        assert_eq!(
            map.wire_user(BASE, BASE + 4 * PAGE),
            Err(KernError::ResourceShortage)
        );
        assert_eq!(map.user_wired_pages(), 0);
        assert_eq!(sys.queues().count(QueueKind::Wired), 0);
        assert_eq!(map.lookup(BASE).unwrap().user_wired_count, 0);
    }

    #[test]
    fn test_wire_and_unwire() {
        let sys = system(8);
        let map = VmMap::new(&sys);
        map.enter(fixed(BASE), 2 * PAGE, anon(&sys, 2 * PAGE)).unwrap();
        map.wire_user(BASE, BASE + 2 * PAGE).unwrap();
        assert_eq!(sys.queues().count(QueueKind::Wired), 2);
        map.unwire_user(BASE, BASE + 2 * PAGE).unwrap();
        assert_eq!(sys.queues().count(QueueKind::Wired), 0);
        assert_eq!(sys.queues().count(QueueKind::Active), 2);
    }

    #[test]
    fn test_fork_copies_and_shares() {
        let sys = system(16);
        let map = VmMap::new(&sys);
        map.enter(fixed(BASE), PAGE, anon(&sys, PAGE)).unwrap();
        let mut shared = anon(&sys, PAGE);
        shared.inheritance = VmInherit::Share;
        map.enter(fixed(BASE + PAGE), PAGE, shared).unwrap();
        let mut none = anon(&sys, PAGE);
        none.inheritance = VmInherit::None;
        map.enter(fixed(BASE + 2 * PAGE), PAGE, none).unwrap();
        vm_fault(&map, BASE, VmProt::WRITE).unwrap();

        let child = map.fork().unwrap();
        assert_eq!(child.regions().len(), 2);
        let parent_copy = map.lookup(BASE).unwrap();
        let child_copy = child.lookup(BASE).unwrap();
        assert!(!Arc::ptr_eq(&parent_copy.object, &child_copy.object));
        assert_eq!(child_copy.object.resident_count(), 1);

        let child_shared = child.lookup(BASE + PAGE).unwrap();
        assert!(Arc::ptr_eq(
            &child_shared.object,
            &map.lookup(BASE + PAGE).unwrap().object
        ));
        assert!(child_shared.flags.contains(EntryFlags::IS_SHARED));
    }

    #[test]
    fn test_page_query() {
        let sys = system(8);
        let map = VmMap::new(&sys);
        map.enter(fixed(BASE), 2 * PAGE, anon(&sys, 2 * PAGE)).unwrap();
        assert_eq!(map.page_query(BASE), Some(PageDisposition::empty()));
        vm_fault(&map, BASE, VmProt::WRITE).unwrap();
        let disp = map.page_query(BASE).unwrap();
        assert!(disp.contains(PageDisposition::PRESENT | PageDisposition::DIRTY));
        assert!(!disp.contains(PageDisposition::EXTERNAL));
        assert_eq!(map.page_query(BASE + 4 * PAGE), None);
    }

    #[test]
    fn test_sign_needs_resident_pages() {
        let sys = system(8);
        let map = VmMap::new(&sys);
        map.enter(fixed(BASE), 2 * PAGE, anon(&sys, 2 * PAGE)).unwrap();
        vm_fault(&map, BASE, VmProt::READ).unwrap();
        assert_eq!(map.sign(BASE, BASE + 2 * PAGE), Err(KernError::Failure));
        assert!(!map
            .page_query(BASE)
            .unwrap()
            .contains(PageDisposition::CS_VALIDATED));
        map.sign(BASE, BASE + PAGE).unwrap();
        assert!(map
            .page_query(BASE)
            .unwrap()
            .contains(PageDisposition::CS_VALIDATED));
    }

    #[test]
    fn test_entry_limit() {
        let config = VmConfig::default().with_page_colors(1).with_max_map_entries(2);
        let sys = VmSystem::bootstrap(config, &[0..8 * PAGE], Arc::new(SparsePhysMemory::new()))
            .unwrap();
        let map = VmMap::new(&sys);
        map.enter(fixed(BASE), 3 * PAGE, anon(&sys, 3 * PAGE)).unwrap();
        // Punching a hole in the middle would need three entries
        let over = Placement::Fixed {
            addr: BASE + PAGE,
            overwrite: true,
        };
        assert_eq!(
            map.enter(over, PAGE, anon(&sys, PAGE)),
            Err(KernError::NoSpace)
        );
        assert_eq!(map.regions(), vec![(BASE, BASE + 3 * PAGE)]);
    }
}
