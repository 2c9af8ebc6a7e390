//! mlock and munlock

use crate::bsd::kern_mman::fail;
use crate::bsd::proc::Proc;
use crate::kern::kern_return::KernError;
use crate::mach_vm::vm_error::{VmError, VmResult};
use crate::mach_vm::vm_sanitize::{sanitize_addr_size, SanitizeFlags};

/// Wire `[addr, addr + len)` into memory
///
/// All or nothing: if any page cannot be wired, none stay wired.
pub fn mlock(p: &Proc, addr: u64, len: u64) -> VmResult<()> {
    let Some(range) = sanitize_addr_size(addr, len, SanitizeFlags::empty())
        .map_err(|_| fail("mlock", VmError::InvalidArgument))?
    else {
        return Ok(());
    };
    p.map()
        .wire_user(range.start, range.end)
        .map_err(|err| {
            let err = match err {
                KernError::ResourceShortage => VmError::ResourceShortage,
                KernError::ProtectionFailure => VmError::NotPermitted,
                KernError::InvalidArgument => VmError::InvalidArgument,
                _ => VmError::OutOfMemory,
            };
            fail("mlock", err)
        })
}

/// Drop the wiring on `[addr, addr + len)`
pub fn munlock(p: &Proc, addr: u64, len: u64) -> VmResult<()> {
    let Some(range) = sanitize_addr_size(addr, len, SanitizeFlags::empty())
        .map_err(|_| fail("munlock", VmError::InvalidArgument))?
    else {
        return Ok(());
    };
    p.map()
        .unwire_user(range.start, range.end)
        .map_err(|_| fail("munlock", VmError::OutOfMemory))
}

pub fn mlockall(_p: &Proc, _how: u32) -> VmResult<()> {
    Err(fail("mlockall", VmError::NotSupported))
}

pub fn munlockall(_p: &Proc) -> VmResult<()> {
    Err(fail("munlockall", VmError::NotSupported))
}
