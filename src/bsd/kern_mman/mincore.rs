//! mincore
//!
//! Residency is gathered a chunk of pages at a time under one map lock hold
//! and copied out to the caller's vector between chunks.

use heapless::Vec;

use crate::bsd::kern_mman::{fail, mincore_bits};
use crate::bsd::proc::Proc;
use crate::config::MAX_RESIDENCY_CHUNK_PAGES;
use crate::kern::copyio::copyout;
use crate::mach_vm::vm_error::{VmError, VmResult};
use crate::mach_vm::vm_map::PageDisposition;
use crate::mach_vm::vm_page::PAGE_SIZE;
use crate::mach_vm::vm_sanitize::{sanitize_addr_size, SanitizeFlags};

/// Residency byte for one page
pub fn residency_bits(disp: Option<PageDisposition>) -> u8 {
    let Some(disp) = disp else {
        return 0;
    };
    let mut bits = 0;
    if disp.contains(PageDisposition::PRESENT) {
        bits |= mincore_bits::INCORE;
    }
    if disp.contains(PageDisposition::REF) {
        bits |= mincore_bits::REFERENCED;
    }
    if disp.contains(PageDisposition::DIRTY) {
        bits |= mincore_bits::MODIFIED;
    }
    if disp.contains(PageDisposition::PAGED_OUT) {
        bits |= mincore_bits::PAGED_OUT;
    }
    if disp.contains(PageDisposition::COPIED) {
        bits |= mincore_bits::COPIED;
    }
    if !disp.contains(PageDisposition::EXTERNAL) {
        bits |= mincore_bits::ANONYMOUS;
    }
    bits
}

/// Report the residency of `[addr, addr + len)`, one byte per page written
/// to user address `vec`
pub fn mincore(p: &Proc, addr: u64, len: u64, vec: u64) -> VmResult<()> {
    let map = p.map();
    let Some(range) = sanitize_addr_size(addr, len, SanitizeFlags::empty())
        .map_err(|_| fail("mincore", VmError::InvalidArgument))?
    else {
        return Ok(());
    };
    let chunk = map
        .system()
        .config()
        .residency_chunk_pages
        .clamp(1, MAX_RESIDENCY_CHUNK_PAGES);

    let total = range.pages();
    let mut done = 0u64;
    let mut bytes: Vec<u8, MAX_RESIDENCY_CHUNK_PAGES> = Vec::new();
    while done < total {
        let count = (total - done).min(chunk as u64) as usize;
        let start = range.start + done * PAGE_SIZE as u64;
        bytes.clear();
        map.page_range_query(start, count, |disp| {
            // `count` never exceeds the capacity
            let _ = bytes.push(residency_bits(disp));
        });
        copyout(map, &bytes, vec + done).map_err(|err| {
            log::debug!("mincore: copyout to {:#x} failed: {}", vec + done, err);
            fail("mincore", VmError::InvalidArgument)
        })?;
        done += count as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsd::kern_mman::testing::{proc, proc_with, PAGE};
    use crate::bsd::kern_mman::{mmap, munmap, MapFlags, MmapArgs, ProtFlags};
    use crate::bsd::proc::{FileFlags, FileRef};
    use crate::bsd::vnode::{MemVnodeOps, Vnode, VnodeType};
    use crate::config::VmConfig;
    use crate::kern::copyio::{copyin, copyout};
    use alloc::sync::Arc;
    use alloc::vec;

    fn read_vec(p: &Proc, at: u64, n: usize) -> alloc::vec::Vec<u8> {
        let mut out = vec![0u8; n];
        copyin(p.map(), at, &mut out).unwrap();
        out
    }

    #[test]
    fn test_bits() {
        assert_eq!(residency_bits(None), 0);
        assert_eq!(
            residency_bits(Some(PageDisposition::empty())),
            mincore_bits::ANONYMOUS
        );
        let file_page = PageDisposition::PRESENT | PageDisposition::EXTERNAL | PageDisposition::REF;
        assert_eq!(
            residency_bits(Some(file_page)),
            mincore_bits::INCORE | mincore_bits::REFERENCED
        );
    }

    #[test]
    fn test_anon_residency() {
        let p = proc();
        let out = mmap(&p, &MmapArgs::anon(PAGE)).unwrap();
        let addr = mmap(&p, &MmapArgs::anon(3 * PAGE)).unwrap();
        copyout(p.map(), b"x", addr + PAGE).unwrap();
        munmap(&p, addr + 2 * PAGE, PAGE).unwrap();

        mincore(&p, addr, 3 * PAGE, out).unwrap();
        let bits = read_vec(&p, out, 3);
        assert_eq!(bits[0], mincore_bits::ANONYMOUS);
        assert_eq!(
            bits[1] & (mincore_bits::INCORE | mincore_bits::MODIFIED | mincore_bits::ANONYMOUS),
            mincore_bits::INCORE | mincore_bits::MODIFIED | mincore_bits::ANONYMOUS
        );
        assert_eq!(bits[2], 0);
    }

    #[test]
    fn test_chunked_matches_single_pass() {
        let config = VmConfig::default().with_residency_chunk_pages(2);
        let p = proc_with(config, 64);
        let out = mmap(&p, &MmapArgs::anon(PAGE)).unwrap();
        let vnode = Vnode::new(
            VnodeType::Reg,
            "/tmp/f",
            Arc::new(MemVnodeOps::new(&[3u8; 5 * PAGE as usize])),
        );
        p.install_file(3, FileRef::vnode(vnode, FileFlags::READ));
        let addr = mmap(
            &p,
            &MmapArgs::file(3, 5 * PAGE, 0, ProtFlags::READ, MapFlags::SHARED),
        )
        .unwrap();
        let mut byte = [0u8; 1];
        copyin(p.map(), addr + 3 * PAGE, &mut byte).unwrap();

        mincore(&p, addr, 5 * PAGE, out).unwrap();
        let bits = read_vec(&p, out, 5);
        assert_eq!(bits, vec![0, 0, 0, bits[3], 0]);
        assert_ne!(bits[3] & mincore_bits::INCORE, 0);
        assert_eq!(bits[3] & mincore_bits::ANONYMOUS, 0);
    }

    #[test]
    fn test_bad_vector() {
        let p = proc();
        let addr = mmap(&p, &MmapArgs::anon(PAGE)).unwrap();
        assert_eq!(
            mincore(&p, addr, PAGE, 0x7000_0000),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(mincore(&p, addr, 0, 0x7000_0000), Ok(()));
    }
}
