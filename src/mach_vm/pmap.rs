//! Physical frame access
//!
//! Based on Mach4 vm/pmap.h
//!
//! Hardware page tables are outside this crate. What the VM layer does need
//! from the machine-dependent side is a way to move data in and out of a
//! physical frame: zero fill, copy-on-write copies, pager I/O. `PhysMemory`
//! is that seam.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use spin::Mutex;

use crate::mach_vm::vm_page::PAGE_SIZE;

/// Data access to physical frames
pub trait PhysMemory: Send + Sync {
    /// Fill a frame with zeros
    fn zero_page(&self, phys_page: u32);

    /// Copy one frame onto another
    fn copy_page(&self, src: u32, dst: u32);

    /// Read a whole frame into `buf` (`PAGE_SIZE` bytes)
    fn read_page(&self, phys_page: u32, buf: &mut [u8]);

    /// Overwrite a whole frame from `buf` (`PAGE_SIZE` bytes)
    fn write_page(&self, phys_page: u32, buf: &[u8]);
}

/// Frame contents kept in a sparse table
///
/// Stands in for the machine layer on hosts without direct physical access.
/// Frames never written read as zeros.
#[derive(Default)]
pub struct SparsePhysMemory {
    frames: Mutex<BTreeMap<u32, Box<[u8]>>>,
}

impl SparsePhysMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of frames holding non-zero data
    pub fn populated(&self) -> usize {
        self.frames.lock().len()
    }
}

impl PhysMemory for SparsePhysMemory {
    fn zero_page(&self, phys_page: u32) {
        self.frames.lock().remove(&phys_page);
    }

    fn copy_page(&self, src: u32, dst: u32) {
        let mut frames = self.frames.lock();
        match frames.get(&src).cloned() {
            Some(data) => {
                frames.insert(dst, data);
            }
            None => {
                frames.remove(&dst);
            }
        }
    }

    fn read_page(&self, phys_page: u32, buf: &mut [u8]) {
        match self.frames.lock().get(&phys_page) {
            Some(data) => buf[..PAGE_SIZE].copy_from_slice(data),
            None => buf[..PAGE_SIZE].fill(0),
        }
    }

    fn write_page(&self, phys_page: u32, buf: &[u8]) {
        let mut frames = self.frames.lock();
        if buf[..PAGE_SIZE].iter().all(|&b| b == 0) {
            frames.remove(&phys_page);
        } else {
            frames.insert(phys_page, Box::from(&buf[..PAGE_SIZE]));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sparse_frames() {
        let mem = SparsePhysMemory::new();
        let mut buf = [0u8; PAGE_SIZE];
        mem.read_page(3, &mut buf);
        assert!(buf.iter().all(|&b| b == 0));

        buf[10] = 0xAB;
        mem.write_page(3, &buf);
        mem.copy_page(3, 4);
        let mut out = [0u8; PAGE_SIZE];
        mem.read_page(4, &mut out);
        assert_eq!(out[10], 0xAB);
        assert_eq!(mem.populated(), 2);

        mem.zero_page(3);
        mem.read_page(3, &mut out);
        assert_eq!(out[10], 0);
        assert_eq!(mem.populated(), 1);
    }
}
