//! Argument sanitizing for the mapping calls
//!
//! Based on XNU vm/vm_sanitize.c
//!
//! Every mapping syscall runs its raw address, length and protection
//! through these helpers before touching the map. Each call picks the
//! zero-length and alignment rules it needs with `SanitizeFlags`.

use bitflags::bitflags;

use crate::kern::kern_return::{KernError, KernResult};
use crate::mach_vm::vm_page::{page_aligned, round_page, trunc_page};

bitflags! {
    /// Per-call sanitizing rules
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SanitizeFlags: u32 {
        /// Zero length is an error rather than a no-op
        const SIZE_ZERO_FAILS = 0x1;
        /// The start address must already be page aligned
        const CHECK_ALIGNED_START = 0x2;
    }
}

/// A page-aligned, overflow-checked range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SanitizedRange {
    /// First byte, truncated to a page
    pub start: u64,
    /// One past the last byte, rounded to a page
    pub end: u64,
}

impl SanitizedRange {
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    pub fn pages(&self) -> u64 {
        self.size() >> crate::mach_vm::vm_page::PAGE_SHIFT
    }
}

/// Check `addr`/`size` and widen them to whole pages
///
/// `Ok(None)` means a zero-length request the caller should treat as an
/// immediate success.
pub fn sanitize_addr_size(
    addr: u64,
    size: u64,
    flags: SanitizeFlags,
) -> KernResult<Option<SanitizedRange>> {
    if flags.contains(SanitizeFlags::CHECK_ALIGNED_START) && !page_aligned(addr) {
        return Err(KernError::InvalidArgument);
    }
    let end = addr.checked_add(size).ok_or(KernError::InvalidArgument)?;
    if size == 0 {
        if flags.contains(SanitizeFlags::SIZE_ZERO_FAILS) {
            return Err(KernError::InvalidArgument);
        }
        return Ok(None);
    }
    let end = round_page(end).ok_or(KernError::InvalidArgument)?;
    Ok(Some(SanitizedRange {
        start: trunc_page(addr),
        end,
    }))
}

/// Reject protection bits outside `allowed`
pub fn sanitize_prot(prot: u32, allowed: u32) -> KernResult<u32> {
    if prot & !allowed != 0 {
        return Err(KernError::InvalidArgument);
    }
    Ok(prot)
}

/// Round a placement hint up to a page without rejecting misalignment
pub fn sanitize_hint(hint: u64) -> KernResult<u64> {
    round_page(hint).ok_or(KernError::InvalidArgument)
}

/// Check that `offset + size` fits
pub fn sanitize_offset_size(offset: u64, size: u64) -> KernResult<u64> {
    offset.checked_add(size).ok_or(KernError::InvalidArgument)
}
