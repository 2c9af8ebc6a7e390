//! munmap, mprotect and minherit

use crate::bsd::kern_mman::{fail, ProtFlags};
use crate::bsd::proc::Proc;
use crate::kern::kern_return::KernError;
use crate::mach_vm::vm_error::{VmError, VmResult};
use crate::mach_vm::vm_map::{VmInherit, VmProt};
use crate::mach_vm::vm_sanitize::{sanitize_addr_size, sanitize_prot, SanitizeFlags};

/// Remove the mappings in `[addr, addr + len)`
///
/// `addr` must be page aligned and `len` nonzero. Unmapped parts of the
/// range are not an error.
pub fn munmap(p: &Proc, addr: u64, len: u64) -> VmResult<()> {
    let map = p.map();
    let range = sanitize_addr_size(
        addr,
        len,
        SanitizeFlags::CHECK_ALIGNED_START | SanitizeFlags::SIZE_ZERO_FAILS,
    )
    .ok()
    .flatten()
    .ok_or_else(|| fail("munmap", VmError::InvalidArgument))?;
    if range.start < map.min_offset() || range.end > map.max_offset() {
        return Err(fail("munmap", VmError::InvalidArgument));
    }
    map.remove(range.start, range.end)
        .map_err(|_| fail("munmap", VmError::InvalidArgument))
}

/// Change the protection of `[addr, addr + len)`
pub fn mprotect(p: &Proc, addr: u64, len: u64, prot: u32) -> VmResult<()> {
    do_mprotect(p, addr, len, prot).map_err(|err| fail("mprotect", err))
}

fn do_mprotect(p: &Proc, addr: u64, len: u64, prot: u32) -> VmResult<()> {
    let allowed = ProtFlags::RWX | ProtFlags::TRUSTED | ProtFlags::STRIP_READ;
    let prot = sanitize_prot(prot, allowed.bits())
        .map(ProtFlags::from_bits_truncate)
        .map_err(|_| VmError::InvalidArgument)?;
    let Some(range) = sanitize_addr_size(addr, len, SanitizeFlags::CHECK_ALIGNED_START)
        .map_err(|_| VmError::InvalidArgument)?
    else {
        return Ok(());
    };

    let mut vm_prot = prot.to_vm_prot();
    if prot.contains(ProtFlags::STRIP_READ) {
        vm_prot.remove(VmProt::READ);
    }

    let map = p.map();
    let result = if prot.contains(ProtFlags::TRUSTED) {
        let allowed = p
            .signing()
            .is_some_and(|policy| policy.allow_unsigned_code(p.pid(), range.start, range.end));
        if !allowed {
            return Err(VmError::PermissionDenied);
        }
        map.sign_and_protect(range.start, range.end, Some(vm_prot))
    } else {
        map.protect(range.start, range.end, vm_prot)
    };
    result.map_err(|err| match err {
        KernError::ProtectionFailure => VmError::PermissionDenied,
        KernError::InvalidAddress => VmError::OutOfMemory,
        _ => VmError::InvalidArgument,
    })
}

/// Set how `[addr, addr + len)` is passed to a forked child
pub fn minherit(p: &Proc, addr: u64, len: u64, inherit: u32) -> VmResult<()> {
    let Some(range) = sanitize_addr_size(addr, len, SanitizeFlags::empty())
        .map_err(|_| fail("minherit", VmError::InvalidArgument))?
    else {
        return Ok(());
    };
    let inheritance =
        VmInherit::from_raw(inherit).ok_or_else(|| fail("minherit", VmError::InvalidArgument))?;
    p.map()
        .inherit(range.start, range.end, inheritance)
        .map_err(|_| fail("minherit", VmError::InvalidArgument))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsd::kern_mman::testing::{proc, PAGE};
    use crate::bsd::kern_mman::{mmap, MapFlags, MmapArgs};
    use crate::bsd::proc::{CodeSigningPolicy, FileFlags, FileRef};
    use crate::bsd::vnode::{MemVnodeOps, Vnode, VnodeType};
    use crate::kern::copyio::{copyin, copyout};
    use crate::mach_vm::vm_map::PageDisposition;
    use alloc::sync::Arc;

    struct AllowAll;

    impl CodeSigningPolicy for AllowAll {
        fn allow_unsigned_code(&self, _pid: i32, _start: u64, _end: u64) -> bool {
            true
        }
    }

    #[test]
    fn test_munmap_arguments() {
        let p = proc();
        let addr = mmap(&p, &MmapArgs::anon(2 * PAGE)).unwrap();
        assert_eq!(munmap(&p, addr + 1, PAGE), Err(VmError::InvalidArgument));
        assert_eq!(munmap(&p, addr, 0), Err(VmError::InvalidArgument));
        assert_eq!(munmap(&p, 0, PAGE), Err(VmError::InvalidArgument));
        munmap(&p, addr, PAGE).unwrap();
        assert!(p.map().lookup(addr).is_none());
        assert!(p.map().lookup(addr + PAGE).is_some());
        // Already gone
        munmap(&p, addr, PAGE).unwrap();
    }

    #[test]
    fn test_mprotect_errors() {
        let p = proc();
        let addr = mmap(&p, &MmapArgs::anon(PAGE)).unwrap();
        assert_eq!(mprotect(&p, addr, PAGE, 0x100), Err(VmError::InvalidArgument));
        assert_eq!(mprotect(&p, addr + 8, PAGE, 1), Err(VmError::InvalidArgument));
        assert_eq!(mprotect(&p, addr, 0, 1), Ok(()));
        assert_eq!(mprotect(&p, addr, 2 * PAGE, 1), Err(VmError::OutOfMemory));
        mprotect(&p, addr, PAGE, ProtFlags::READ.bits()).unwrap();
        assert_eq!(p.map().lookup(addr).unwrap().protection, VmProt::READ);
    }

    #[test]
    fn test_mprotect_strip_read() {
        let p = proc();
        let addr = mmap(&p, &MmapArgs::anon(PAGE)).unwrap();
        let prot = ProtFlags::EXEC | ProtFlags::STRIP_READ;
        mprotect(&p, addr, PAGE, prot.bits()).unwrap();
        assert_eq!(p.map().lookup(addr).unwrap().protection, VmProt::EXECUTE);
    }

    #[test]
    fn test_trusted_needs_policy() {
        let p = proc();
        let addr = mmap(&p, &MmapArgs::anon(PAGE)).unwrap();
        let prot = ProtFlags::READ | ProtFlags::EXEC | ProtFlags::TRUSTED;
        assert_eq!(
            mprotect(&p, addr, PAGE, prot.bits()),
            Err(VmError::PermissionDenied)
        );

        let p = proc().with_signing(Arc::new(AllowAll));
        let addr = mmap(&p, &MmapArgs::anon(PAGE)).unwrap();
        // Nothing resident yet
        assert_eq!(
            mprotect(&p, addr, PAGE, prot.bits()),
            Err(VmError::InvalidArgument)
        );
        copyout(p.map(), b"code", addr).unwrap();
        mprotect(&p, addr, PAGE, prot.bits()).unwrap();
        let disp = p.map().page_query(addr).unwrap();
        assert!(disp.contains(PageDisposition::CS_VALIDATED));
    }

    #[test]
    fn test_trusted_refused_protection_leaves_pages_unsigned() {
        let p = proc().with_signing(Arc::new(AllowAll));
        let ops = Arc::new(MemVnodeOps::new(&[0x90; PAGE as usize]));
        let vnode = Vnode::new(VnodeType::Reg, "/usr/lib/libcode.dylib", ops);
        p.install_file(3, FileRef::vnode(vnode, FileFlags::READ));
        let args = MmapArgs::file(3, PAGE, 0, ProtFlags::READ, MapFlags::SHARED);
        let addr = mmap(&p, &args).unwrap();
        let mut buf = [0u8; 4];
        copyin(p.map(), addr, &mut buf).unwrap();

        let prot = ProtFlags::READ | ProtFlags::WRITE | ProtFlags::TRUSTED;
        assert_eq!(
            mprotect(&p, addr, PAGE, prot.bits()),
            Err(VmError::PermissionDenied)
        );
        let disp = p.map().page_query(addr).unwrap();
        assert!(disp.contains(PageDisposition::PRESENT));
        assert!(!disp.contains(PageDisposition::CS_VALIDATED));
        assert_eq!(p.map().lookup(addr).unwrap().protection, VmProt::READ);

        // Within max protection the same call signs and protects
        let prot = ProtFlags::READ | ProtFlags::TRUSTED;
        mprotect(&p, addr, PAGE, prot.bits()).unwrap();
        let disp = p.map().page_query(addr).unwrap();
        assert!(disp.contains(PageDisposition::CS_VALIDATED));
    }

    #[test]
    fn test_minherit() {
        let p = proc();
        let addr = mmap(&p, &MmapArgs::anon(2 * PAGE)).unwrap();
        assert_eq!(minherit(&p, addr, PAGE, 7), Err(VmError::InvalidArgument));
        assert_eq!(minherit(&p, addr, 0, 7), Ok(()));
        minherit(&p, addr, PAGE, VmInherit::None as u32).unwrap();
        assert_eq!(p.map().lookup(addr).unwrap().inheritance, VmInherit::None);
        assert_eq!(
            p.map().lookup(addr + PAGE).unwrap().inheritance,
            VmInherit::Copy
        );
    }
}
