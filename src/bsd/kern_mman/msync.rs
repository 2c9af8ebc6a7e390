//! msync

use crate::bsd::kern_mman::{fail, MsyncFlags};
use crate::bsd::proc::Proc;
use crate::kern::kern_return::KernError;
use crate::mach_vm::vm_error::{VmError, VmResult};
use crate::mach_vm::vm_map::VmSyncFlags;
use crate::mach_vm::vm_sanitize::{sanitize_addr_size, SanitizeFlags};

/// Translate BSD msync flags into map sync work
fn sync_flags(flags: MsyncFlags) -> VmSyncFlags {
    let mut sync = VmSyncFlags::CONTIGUOUS;
    if flags.contains(MsyncFlags::KILLPAGES) {
        sync |= VmSyncFlags::KILLPAGES;
    }
    if flags.contains(MsyncFlags::DEACTIVATE) {
        sync |= VmSyncFlags::DEACTIVATE;
    }
    if flags.contains(MsyncFlags::INVALIDATE) {
        sync |= VmSyncFlags::INVALIDATE;
    }
    if !flags.intersects(MsyncFlags::KILLPAGES | MsyncFlags::DEACTIVATE) {
        if flags.contains(MsyncFlags::ASYNC) {
            sync |= VmSyncFlags::ASYNCHRONOUS;
        } else {
            sync |= VmSyncFlags::SYNCHRONOUS;
        }
    }
    sync
}

/// Flush, invalidate or discard `[addr, addr + len)`
///
/// The range must be mapped without holes.
pub fn msync(p: &Proc, addr: u64, len: u64, flags: u32) -> VmResult<()> {
    do_msync(p, addr, len, flags).map_err(|err| fail("msync", err))
}

fn do_msync(p: &Proc, addr: u64, len: u64, flags: u32) -> VmResult<()> {
    let flags = MsyncFlags::from_bits(flags).ok_or(VmError::InvalidArgument)?;
    if flags.contains(MsyncFlags::ASYNC)
        && flags.intersects(MsyncFlags::SYNC | MsyncFlags::INVALIDATE)
    {
        return Err(VmError::InvalidArgument);
    }
    let range = sanitize_addr_size(
        addr,
        len,
        SanitizeFlags::CHECK_ALIGNED_START | SanitizeFlags::SIZE_ZERO_FAILS,
    )
    .ok()
    .flatten()
    .ok_or(VmError::InvalidArgument)?;

    p.map()
        .msync(range.start, range.end, sync_flags(flags))
        .map_err(|err| match err {
            KernError::InvalidAddress | KernError::Failure => VmError::IoFailure,
            _ => VmError::InvalidArgument,
        })
}
