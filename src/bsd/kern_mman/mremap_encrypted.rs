//! mremap_encrypted
//!
//! Rebinds a mapped range of an encrypted executable to a pager that
//! decrypts on page-in. The process supplies the crypter factory; without
//! one the call is unsupported.

use alloc::string::String;

use crate::bsd::kern_mman::fail;
use crate::bsd::proc::Proc;
use crate::kern::kern_return::KernError;
use crate::mach_vm::memory_object::{CryptInfo, CrypterError};
use crate::mach_vm::vm_error::{VmError, VmResult};
use crate::mach_vm::vm_sanitize::{sanitize_addr_size, SanitizeFlags};

/// Crypt ids from the encryption load command
pub mod cryptid {
    pub const NONE: u32 = 0;
    pub const UNFREE: u32 = 1;
    pub const UNFREE_ALT: u32 = 2;
    pub const NULL: u32 = 0x10;
}

/// Decryption transform for `id`, `None` if unknown
pub fn transform_for(id: u32) -> Option<&'static str> {
    match id {
        cryptid::UNFREE | cryptid::UNFREE_ALT => Some("com.apple.unfree"),
        cryptid::NULL => Some("com.apple.null"),
        _ => None,
    }
}

/// Remap `[addr, addr + len)` through the decrypter for `id`
pub fn mremap_encrypted(
    p: &Proc,
    addr: u64,
    len: u64,
    id: u32,
    cputype: i32,
    cpusubtype: i32,
) -> VmResult<()> {
    do_remap(p, addr, len, id, cputype, cpusubtype).map_err(|err| fail("mremap_encrypted", err))
}

fn do_remap(
    p: &Proc,
    addr: u64,
    len: u64,
    id: u32,
    cputype: i32,
    cpusubtype: i32,
) -> VmResult<()> {
    let range = sanitize_addr_size(
        addr,
        len,
        SanitizeFlags::CHECK_ALIGNED_START | SanitizeFlags::SIZE_ZERO_FAILS,
    )
    .ok()
    .flatten()
    .ok_or(VmError::InvalidArgument)?;

    if id == cryptid::NONE {
        return Ok(());
    }
    let transform = transform_for(id).ok_or(VmError::InvalidArgument)?;
    let factory = p.crypters().ok_or(VmError::NotSupported)?;

    let map = p.map();
    let (vnode, file_offset) =
        map.crypt_source(range.start, range.end)
            .map_err(|err| match err {
                KernError::InvalidArgument => VmError::InvalidArgument,
                _ => VmError::OutOfMemory,
            })?;

    let info = CryptInfo {
        transform,
        cputype,
        cpusubtype,
        path: String::from(vnode.path()),
        file_offset,
    };
    let crypter = factory.create(&info).map_err(|err| {
        log::debug!(
            "mremap_encrypted: no {} crypter for {}: {}",
            transform,
            info.path,
            err
        );
        match err {
            CrypterError::NotPrivileged => VmError::PermissionDenied,
            _ => VmError::OutOfMemory,
        }
    })?;

    map.remap_crypt(range.start, range.end, crypter)
        .map_err(|_| VmError::PermissionDenied)?;
    log::info!(
        "mremap_encrypted: [{:#x}, {:#x}) of {} now decrypts via {}",
        range.start,
        range.end,
        info.path,
        transform
    );
    Ok(())
}
