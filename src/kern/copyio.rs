//! Copyin/Copyout - User Memory Access
//!
//! Based on Mach4 kern/kern_subr.c and machine/copyio.c
//!
//! Copies data between a task's address map and kernel buffers. Each user
//! page is resolved through `vm_fault` with the access the copy needs, so a
//! copy sees exactly what the task would: zero-filled anonymous memory,
//! file contents, or its own private copies.
//!
//! Transfers run page by page; a failure partway leaves the bytes already
//! copied in place and reports the error.

use alloc::vec;
use thiserror::Error;

use crate::kern::kern_return::KernError;
use crate::mach_vm::vm_fault::vm_fault;
use crate::mach_vm::vm_map::{VmMap, VmProt};
use crate::mach_vm::vm_page::{trunc_page, PAGE_SIZE};

/// Maximum size for a single copy operation
pub const COPYIO_MAX_SIZE: usize = 64 * 1024;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during copy operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CopyError {
    /// Address range wraps or is unmapped
    #[error("bad user address")]
    BadAddress,
    /// Mapping does not allow the access
    #[error("protection violation")]
    Protection,
    /// Page could not be brought in
    #[error("page fault could not be resolved")]
    PageFault,
    #[error("copy larger than {COPYIO_MAX_SIZE} bytes")]
    TooLarge,
}

impl From<KernError> for CopyError {
    fn from(err: KernError) -> Self {
        match err {
            KernError::InvalidAddress => CopyError::BadAddress,
            KernError::ProtectionFailure => CopyError::Protection,
            _ => CopyError::PageFault,
        }
    }
}

/// Bytes copied on success
pub type CopyResult = Result<usize, CopyError>;

fn check_range(addr: u64, len: usize) -> Result<(), CopyError> {
    if len > COPYIO_MAX_SIZE {
        return Err(CopyError::TooLarge);
    }
    addr.checked_add(len as u64).ok_or(CopyError::BadAddress)?;
    Ok(())
}

/// Walk `[addr, addr + len)` one page piece at a time
fn for_each_piece(
    addr: u64,
    len: usize,
    mut f: impl FnMut(u64, usize, usize, usize) -> Result<(), CopyError>,
) -> Result<(), CopyError> {
    let mut done = 0usize;
    while done < len {
        let va = addr + done as u64;
        let page_va = trunc_page(va);
        let in_page = (va - page_va) as usize;
        let n = (PAGE_SIZE - in_page).min(len - done);
        f(page_va, in_page, done, n)?;
        done += n;
    }
    Ok(())
}

// ============================================================================
// Copy Operations
// ============================================================================

/// Copy `dst.len()` bytes from user address `addr` in `map`
pub fn copyin(map: &VmMap, addr: u64, dst: &mut [u8]) -> CopyResult {
    check_range(addr, dst.len())?;
    let sys = map.system();
    let mut frame = vec![0u8; PAGE_SIZE];
    for_each_piece(addr, dst.len(), |page_va, in_page, done, n| {
        let id = vm_fault(map, page_va, VmProt::READ)?;
        sys.phys()
            .read_page(sys.queues().page(id).phys_page(), &mut frame);
        dst[done..done + n].copy_from_slice(&frame[in_page..in_page + n]);
        Ok(())
    })?;
    Ok(dst.len())
}

/// Copy `src` to user address `addr` in `map`
pub fn copyout(map: &VmMap, src: &[u8], addr: u64) -> CopyResult {
    check_range(addr, src.len())?;
    let sys = map.system();
    let mut frame = vec![0u8; PAGE_SIZE];
    for_each_piece(addr, src.len(), |page_va, in_page, done, n| {
        let id = vm_fault(map, page_va, VmProt::WRITE)?;
        let phys = sys.queues().page(id).phys_page();
        sys.phys().read_page(phys, &mut frame);
        frame[in_page..in_page + n].copy_from_slice(&src[done..done + n]);
        sys.phys().write_page(phys, &frame);
        Ok(())
    })?;
    Ok(src.len())
}

/// Fetch a 64-bit word from user space
pub fn fuword64(map: &VmMap, addr: u64) -> Result<u64, CopyError> {
    let mut buf = [0u8; 8];
    copyin(map, addr, &mut buf)?;
    Ok(u64::from_ne_bytes(buf))
}

/// Store a 64-bit word to user space
pub fn suword64(map: &VmMap, addr: u64, value: u64) -> Result<(), CopyError> {
    copyout(map, &value.to_ne_bytes(), addr)?;
    Ok(())
}
