//! Page descriptor store
//!
//! Owns every `VmPage`: the main array built once at boot with one
//! descriptor per managed frame, and a fixed auxiliary zone of 64-byte
//! aligned descriptors used for hot-added and fictitious frames. Pages are
//! named by `VmPageId`, the non-zero packed form of the descriptor's
//! address, so queue links and handles share one encoding.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::num::NonZeroU32;
use core::ops::Range;

use spin::Mutex;

use crate::config::ConfigError;
use crate::mach_vm::vm_packing::{PackedPtr, PackingParams, ARRAY_INDEX_BIT};
use crate::mach_vm::vm_page::{
    VmPage, PAGE_SHIFT, PHYS_PAGE_FICTITIOUS, VM_PAGE_PACKED_SHIFT, VM_PAGE_SIZE,
};

/// Handle naming one descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmPageId(NonZeroU32);

impl VmPageId {
    /// Raw packed value, as stored in link fields
    pub const fn bits(self) -> u32 {
        self.0.get()
    }

    pub const fn from_bits(bits: u32) -> Option<Self> {
        match NonZeroU32::new(bits) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    pub const fn packed(self) -> PackedPtr {
        PackedPtr::from_bits(self.0.get())
    }
}

/// Descriptor storage
pub struct VmPageStore {
    main: Box<[VmPage]>,
    zone: Box<[VmPage]>,
    /// Free zone slots, popped from the back
    zone_free: Mutex<Vec<u32>>,
    params: PackingParams,
}

impl VmPageStore {
    /// Build the store for the given physical byte ranges
    ///
    /// Ranges are shrunk to whole pages and may come in any order, but
    /// must not overlap. `aux_capacity` zone descriptors are reserved up
    /// front.
    pub fn new(ram: &[Range<u64>], aux_capacity: usize) -> Result<Self, ConfigError> {
        // Frame order keeps `lookup_phys` a binary search
        let mut frames: Vec<Range<u64>> = ram
            .iter()
            .map(|range| range.start.div_ceil(1 << PAGE_SHIFT)..range.end >> PAGE_SHIFT)
            .filter(|frames| !frames.is_empty())
            .collect();
        frames.sort_unstable_by_key(|frames| frames.start);
        for pair in frames.windows(2) {
            if pair[1].start < pair[0].end {
                return Err(ConfigError::OverlappingRam(pair[1].start));
            }
        }

        let mut main = Vec::new();
        for range in frames {
            for pfn in range {
                let pfn = u32::try_from(pfn).map_err(|_| ConfigError::TooManyPages)?;
                main.push(VmPage::new(pfn));
            }
        }
        if main.is_empty() {
            return Err(ConfigError::NoMemory);
        }
        if main.len() >= ARRAY_INDEX_BIT as usize || aux_capacity >= ARRAY_INDEX_BIT as usize - 1
        {
            return Err(ConfigError::TooManyPages);
        }
        let main = main.into_boxed_slice();

        let zone: Box<[VmPage]> = (0..aux_capacity)
            .map(|_| VmPage::new(PHYS_PAGE_FICTITIOUS))
            .collect();
        let zone_start = zone.as_ptr() as usize;
        let params = PackingParams {
            array_base: main.as_ptr() as usize,
            array_count: main.len() as u32,
            elem_size: VM_PAGE_SIZE,
            heap_base: zone_start.wrapping_sub(VM_PAGE_SIZE),
            heap_limit: zone_start + aux_capacity * VM_PAGE_SIZE,
            shift: VM_PAGE_PACKED_SHIFT,
        };
        let zone_free = (0..aux_capacity as u32).rev().collect();

        Ok(Self {
            main,
            zone,
            zone_free: Mutex::new(zone_free),
            params,
        })
    }

    pub fn params(&self) -> &PackingParams {
        &self.params
    }

    /// Descriptor for `id`
    pub fn page(&self, id: VmPageId) -> &VmPage {
        let page = match id.packed() {
            PackedPtr::ArrayIndex(index) => &self.main[index as usize],
            PackedPtr::HeapOffset(offset) => &self.zone[offset as usize - 1],
            PackedPtr::Null => unreachable!(),
        };
        debug_assert_eq!(
            self.params.unpack(id.packed()),
            page as *const VmPage as usize
        );
        page
    }

    /// Handle for a descriptor owned by this store
    pub fn id_of(&self, page: &VmPage) -> VmPageId {
        let bits = self.params.pack(page as *const VmPage as usize).to_bits();
        match VmPageId::from_bits(bits) {
            Some(id) => id,
            None => panic!("vm_page_store: descriptor packed to null"),
        }
    }

    /// Handle for a raw link value, `None` for the null link
    pub fn id(&self, bits: u32) -> Option<VmPageId> {
        VmPageId::from_bits(bits)
    }

    /// Number of boot-time descriptors
    pub fn main_len(&self) -> usize {
        self.main.len()
    }

    /// Handles of all boot-time descriptors, in frame order
    pub fn main_ids(&self) -> impl Iterator<Item = VmPageId> + '_ {
        self.main.iter().map(move |page| self.id_of(page))
    }

    /// Boot-time descriptor for physical page `pfn`, if managed
    pub fn lookup_phys(&self, pfn: u32) -> Option<VmPageId> {
        let index = self
            .main
            .binary_search_by_key(&pfn, |page| page.phys_page())
            .ok()?;
        Some(self.id_of(&self.main[index]))
    }

    pub fn is_zone(&self, id: VmPageId) -> bool {
        matches!(id.packed(), PackedPtr::HeapOffset(_))
    }

    /// Take a zone descriptor for frame `phys_page`
    pub fn zone_alloc(&self, phys_page: u32) -> Option<VmPageId> {
        let slot = self.zone_free.lock().pop()?;
        let page = &self.zone[slot as usize];
        page.set_phys_page(phys_page);
        Some(self.id_of(page))
    }

    /// Return a zone descriptor
    pub fn zone_free(&self, id: VmPageId) {
        let PackedPtr::HeapOffset(offset) = id.packed() else {
            panic!("vm_page_store: freeing a boot-time descriptor to the zone");
        };
        let page = self.page(id);
        page.set_phys_page(PHYS_PAGE_FICTITIOUS);
        page.set_identity(0, 0);
        self.zone_free.lock().push(offset - 1);
    }

    pub fn zone_available(&self) -> usize {
        self.zone_free.lock().len()
    }
}
