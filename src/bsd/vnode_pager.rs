//! Vnode pager
//!
//! Pages a regular file in and out through its `VnodeOps`. Reads past end
//! of file come back zero filled; writeback never extends the file.

use alloc::sync::Arc;
use alloc::vec;

use crate::bsd::vnode::Vnode;
use crate::mach_vm::memory_object::{Pager, PagerError, PagerKind};
use crate::mach_vm::pmap::PhysMemory;
use crate::mach_vm::vm_page::PAGE_SIZE;

pub struct VnodePager {
    vnode: Arc<Vnode>,
}

impl VnodePager {
    pub fn new(vnode: Arc<Vnode>) -> Self {
        Self { vnode }
    }
}

impl Pager for VnodePager {
    fn kind(&self) -> PagerKind {
        PagerKind::Vnode
    }

    fn has_page(&self, offset: u64) -> bool {
        offset < self.vnode.size()
    }

    fn data_request(
        &self,
        offset: u64,
        phys_page: u32,
        mem: &dyn PhysMemory,
    ) -> Result<(), PagerError> {
        let mut buf = vec![0u8; PAGE_SIZE];
        self.vnode.ops().read(offset, &mut buf)?;
        mem.write_page(phys_page, &buf);
        Ok(())
    }

    fn data_return(
        &self,
        offset: u64,
        phys_page: u32,
        mem: &dyn PhysMemory,
    ) -> Result<(), PagerError> {
        let mut buf = vec![0u8; PAGE_SIZE];
        mem.read_page(phys_page, &mut buf);
        self.vnode.ops().write(offset, &buf)?;
        Ok(())
    }

    fn vnode(&self) -> Option<&Arc<Vnode>> {
        Some(&self.vnode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsd::vnode::{MemVnodeOps, VnodeType};
    use crate::mach_vm::pmap::SparsePhysMemory;

    #[test]
    fn test_pagein_pageout() {
        let ops = Arc::new(MemVnodeOps::new(&[7u8; PAGE_SIZE + 16]));
        let vnode = Vnode::new(VnodeType::Reg, "/data", ops.clone());
        let pager = VnodePager::new(vnode);
        let mem = SparsePhysMemory::new();

        // Tail page is short, the rest reads as zeros
        pager.data_request(PAGE_SIZE as u64, 5, &mem).unwrap();
        let mut buf = vec![0u8; PAGE_SIZE];
        mem.read_page(5, &mut buf);
        assert!(buf[..16].iter().all(|&b| b == 7));
        assert!(buf[16..].iter().all(|&b| b == 0));

        buf[0] = 9;
        mem.write_page(5, &buf);
        pager.data_return(PAGE_SIZE as u64, 5, &mem).unwrap();
        assert_eq!(ops.contents()[PAGE_SIZE], 9);
        assert_eq!(ops.contents().len(), PAGE_SIZE + 16);
    }
}
