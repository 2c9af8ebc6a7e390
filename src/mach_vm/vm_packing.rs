//! Descriptor pointer packing
//!
//! Queue links and handles refer to page descriptors with 32-bit packed
//! values instead of full addresses. Two encodings share the space:
//!
//! - descriptors inside the contiguous boot-time array are stored as their
//!   array index with bit 31 set
//! - descriptors allocated in the auxiliary zone are stored as
//!   `(address - heap_base) >> shift`, which needs every zone descriptor
//!   aligned to `1 << shift` bytes
//!
//! Zero is reserved for "no descriptor". `heap_base` sits one alignment
//! unit below the zone so that no zone descriptor ever packs to zero.

/// Discriminant bit of the array-index encoding
pub const ARRAY_INDEX_BIT: u32 = 1 << 31;

/// Packed descriptor reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackedPtr {
    Null,
    /// Index into the main descriptor array
    ArrayIndex(u32),
    /// Aligned offset from the heap base
    HeapOffset(u32),
}

impl PackedPtr {
    /// Raw 32-bit form stored in link fields
    pub const fn to_bits(self) -> u32 {
        match self {
            PackedPtr::Null => 0,
            PackedPtr::ArrayIndex(index) => index | ARRAY_INDEX_BIT,
            PackedPtr::HeapOffset(offset) => offset,
        }
    }

    /// Decode a raw link value
    pub const fn from_bits(bits: u32) -> Self {
        if bits == 0 {
            PackedPtr::Null
        } else if bits & ARRAY_INDEX_BIT != 0 {
            PackedPtr::ArrayIndex(bits & !ARRAY_INDEX_BIT)
        } else {
            PackedPtr::HeapOffset(bits)
        }
    }

    pub const fn is_null(self) -> bool {
        matches!(self, PackedPtr::Null)
    }
}

/// Address ranges and alignment the codec packs against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackingParams {
    /// Address of element 0 of the main array
    pub array_base: usize,
    /// Number of elements in the main array
    pub array_count: u32,
    /// Size of one array element
    pub elem_size: usize,
    /// Base the heap offsets are measured from
    pub heap_base: usize,
    /// One past the last packable heap address
    pub heap_limit: usize,
    /// Alignment shift of heap descriptors
    pub shift: u32,
}

impl PackingParams {
    fn array_end(&self) -> usize {
        self.array_base + self.array_count as usize * self.elem_size
    }

    fn in_array(&self, addr: usize) -> bool {
        addr >= self.array_base
            && addr < self.array_end()
            && (addr - self.array_base) % self.elem_size == 0
    }

    fn in_heap(&self, addr: usize) -> bool {
        addr > self.heap_base
            && addr < self.heap_limit
            && (addr - self.heap_base) & ((1usize << self.shift) - 1) == 0
            && ((addr - self.heap_base) >> self.shift) < ARRAY_INDEX_BIT as usize
    }

    /// Whether `addr` fits either encoding
    pub fn is_packable(&self, addr: usize) -> bool {
        addr == 0 || self.in_array(addr) || self.in_heap(addr)
    }

    /// Pack a descriptor address
    ///
    /// Panics if the address fits neither encoding.
    pub fn pack(&self, addr: usize) -> PackedPtr {
        let packed = if addr == 0 {
            PackedPtr::Null
        } else if self.in_array(addr) {
            PackedPtr::ArrayIndex(((addr - self.array_base) / self.elem_size) as u32)
        } else if self.in_heap(addr) {
            PackedPtr::HeapOffset(((addr - self.heap_base) >> self.shift) as u32)
        } else {
            panic!("vm_packing: address {:#x} is not packable", addr);
        };
        debug_assert_eq!(self.unpack(packed), addr, "vm_packing: lossy pack");
        packed
    }

    /// Unpack to the original address
    pub fn unpack(&self, packed: PackedPtr) -> usize {
        match packed {
            PackedPtr::Null => 0,
            PackedPtr::ArrayIndex(index) => {
                assert!(
                    index < self.array_count,
                    "vm_packing: array index {} out of range",
                    index
                );
                self.array_base + index as usize * self.elem_size
            }
            PackedPtr::HeapOffset(offset) => self.heap_base + ((offset as usize) << self.shift),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> PackingParams {
        PackingParams {
            array_base: 0x10_0000,
            array_count: 16,
            elem_size: 64,
            heap_base: 0x20_0000 - 64,
            heap_limit: 0x20_0000 + 8 * 64,
            shift: 6,
        }
    }

    #[test]
    fn test_null() {
        let p = params();
        assert_eq!(p.pack(0), PackedPtr::Null);
        assert_eq!(PackedPtr::from_bits(0), PackedPtr::Null);
        assert_eq!(p.unpack(PackedPtr::Null), 0);
    }

    #[test]
    fn test_array_encoding() {
        let p = params();
        let addr = 0x10_0000 + 5 * 64;
        let packed = p.pack(addr);
        assert_eq!(packed, PackedPtr::ArrayIndex(5));
        assert_eq!(packed.to_bits(), 5 | ARRAY_INDEX_BIT);
        assert_eq!(PackedPtr::from_bits(packed.to_bits()), packed);
        assert_eq!(p.unpack(packed), addr);
    }

    #[test]
    fn test_heap_encoding_never_zero() {
        let p = params();
        let packed = p.pack(0x20_0000);
        assert_eq!(packed, PackedPtr::HeapOffset(1));
        assert_ne!(packed.to_bits(), 0);
        assert_eq!(p.unpack(packed), 0x20_0000);
    }

    #[test]
    #[should_panic(expected = "not packable")]
    fn test_misaligned_heap_address_aborts() {
        params().pack(0x20_0000 + 8);
    }

    #[test]
    #[should_panic(expected = "not packable")]
    fn test_foreign_address_aborts() {
        params().pack(0x30_0000);
    }
}
