//! End-to-end scenarios through the BSD mapping calls

use std::sync::Arc;

use mach_vm::bsd::kern_mman::{
    madvise, mincore, mincore_bits, minherit, mlock, mmap, mprotect, msync, munlock, munmap,
    Advice, MapFlags, MmapArgs, MsyncFlags, ProtFlags,
};
use mach_vm::bsd::proc::{CodeSigningPolicy, FileFlags, FileRef, Proc, TickClock};
use mach_vm::bsd::vnode::{MemVnodeOps, Vnode, VnodeType};
use mach_vm::config::VmConfig;
use mach_vm::kern::copyio::{copyin, copyout};
use mach_vm::mach_vm::pmap::SparsePhysMemory;
use mach_vm::mach_vm::vm_map::{EntryFlags, VmInherit};
use mach_vm::mach_vm::{QueueKind, VmMap, VmSystem};
use mach_vm::VmError;

const PAGE: u64 = 4096;

fn system(config: VmConfig, pages: u64) -> Arc<VmSystem> {
    VmSystem::bootstrap(
        config.with_page_colors(1),
        &[0..pages * PAGE],
        Arc::new(SparsePhysMemory::new()),
    )
    .unwrap()
}

fn proc_on(sys: &Arc<VmSystem>) -> Proc {
    Proc::new(42, Arc::new(VmMap::new(sys)))
}

fn install(p: &Proc, fd: i32, data: &[u8], flags: FileFlags) -> Arc<MemVnodeOps> {
    let ops = Arc::new(MemVnodeOps::new(data));
    let vnode = Vnode::new(VnodeType::Reg, "/var/db/data", ops.clone());
    p.install_file(fd, FileRef::vnode(vnode, flags));
    ops
}

fn residency(p: &Proc, addr: u64, pages: usize, out: u64) -> Vec<u8> {
    mincore(p, addr, pages as u64 * PAGE, out).unwrap();
    let mut bits = vec![0u8; pages];
    copyin(p.map(), out, &mut bits).unwrap();
    bits
}

struct AllowUnsigned;

impl CodeSigningPolicy for AllowUnsigned {
    fn allow_unsigned_code(&self, _pid: i32, _start: u64, _end: u64) -> bool {
        true
    }
}

#[test]
fn anonymous_map_is_not_resident_until_touched() {
    let sys = system(VmConfig::default(), 32);
    let p = proc_on(&sys);
    let out = mmap(&p, &MmapArgs::anon(PAGE)).unwrap();

    let args = MmapArgs::anon(PAGE).at(0x10_0000);
    let addr = mmap(&p, &args).unwrap();
    assert_eq!(addr % PAGE, 0);
    assert_eq!(residency(&p, addr, 1, out)[0] & mincore_bits::INCORE, 0);

    copyout(p.map(), b"touch", addr).unwrap();
    let bits = residency(&p, addr, 1, out)[0];
    assert_ne!(bits & mincore_bits::INCORE, 0);
    assert_ne!(bits & mincore_bits::ANONYMOUS, 0);
}

#[test]
fn jit_refuses_fixed_placement() {
    let sys = system(VmConfig::default(), 8);
    let p = proc_on(&sys);
    let args = MmapArgs::anon(PAGE)
        .with_flags(MapFlags::ANON | MapFlags::PRIVATE | MapFlags::JIT | MapFlags::FIXED)
        .at(0x10_0000);
    assert_eq!(mmap(&p, &args), Err(VmError::InvalidArgument));
    assert_eq!(p.map().entry_count(), 0);
}

#[test]
fn zero_length_depends_on_strict_posix() {
    let sys = system(VmConfig::default(), 8);
    let p = proc_on(&sys);
    let lax = MmapArgs::anon(0);
    assert!(mmap(&p, &lax).is_ok());
    assert_eq!(p.map().entry_count(), 0);

    let strict = lax.with_flags(MapFlags::ANON | MapFlags::PRIVATE | MapFlags::UNIX03);
    assert_eq!(mmap(&p, &strict), Err(VmError::InvalidArgument));
}

#[test]
fn trusted_protection_needs_signing_policy() {
    let sys = system(VmConfig::default(), 8);
    let trusted = (ProtFlags::READ | ProtFlags::EXEC | ProtFlags::TRUSTED).bits();

    let p = proc_on(&sys);
    let addr = mmap(&p, &MmapArgs::anon(PAGE)).unwrap();
    copyout(p.map(), &[0xC3], addr).unwrap();
    assert_eq!(mprotect(&p, addr, PAGE, trusted), Err(VmError::PermissionDenied));

    let p = proc_on(&sys).with_signing(Arc::new(AllowUnsigned));
    let addr = mmap(&p, &MmapArgs::anon(PAGE)).unwrap();
    copyout(p.map(), &[0xC3], addr).unwrap();
    assert_eq!(mprotect(&p, addr, PAGE, trusted), Ok(()));
}

#[test]
fn read_ahead_pages_age_through_every_bin() {
    let bins = 3u32;
    let interval = 100u64;
    let sys = system(VmConfig::default().with_speculative(bins, interval), 16);
    let clock = Arc::new(TickClock::new(1000));
    let p = proc_on(&sys).with_clock(clock.clone());
    install(&p, 3, &[9u8; PAGE as usize], FileFlags::READ);
    let addr = mmap(
        &p,
        &MmapArgs::file(3, PAGE, 0, ProtFlags::READ, MapFlags::SHARED),
    )
    .unwrap();

    madvise(&p, addr, PAGE, Advice::WillNeed as u32).unwrap();
    let queues = sys.queues();
    assert_eq!(queues.count(QueueKind::Speculative), 1);

    for _ in 1..bins {
        let now = clock.advance(interval);
        assert_eq!(queues.speculative_tick(now), 0);
        assert_eq!(queues.count(QueueKind::Speculative), 1);
    }
    let now = clock.advance(interval);
    assert_eq!(queues.speculative_tick(now), 1);
    assert_eq!(queues.count(QueueKind::Speculative), 0);
    assert_eq!(queues.count(QueueKind::SpeculativeAged), 1);
}

#[test]
fn failed_fixed_map_leaves_old_mapping() {
    let sys = system(VmConfig::default().with_max_map_entries(2), 16);
    let p = proc_on(&sys);
    let base = 0x20_0000;
    let old = MmapArgs::anon(3 * PAGE)
        .with_flags(MapFlags::ANON | MapFlags::PRIVATE | MapFlags::FIXED)
        .at(base);
    mmap(&p, &old).unwrap();
    copyout(p.map(), b"keep", base + PAGE).unwrap();

    // Splitting the old entry around the new one needs three entries
    let over = MmapArgs::anon(PAGE)
        .with_flags(MapFlags::ANON | MapFlags::PRIVATE | MapFlags::FIXED)
        .at(base + PAGE);
    assert_eq!(mmap(&p, &over), Err(VmError::OutOfMemory));

    assert_eq!(p.map().entry_count(), 1);
    assert_eq!(p.map().regions(), vec![(base, base + 3 * PAGE)]);
    let mut buf = [0u8; 4];
    copyin(p.map(), base + PAGE, &mut buf).unwrap();
    assert_eq!(&buf, b"keep");
}

#[test]
fn fixed_map_replaces_in_place() {
    let sys = system(VmConfig::default(), 16);
    let p = proc_on(&sys);
    let base = 0x20_0000;
    let fixed = MmapArgs::anon(3 * PAGE)
        .with_flags(MapFlags::ANON | MapFlags::PRIVATE | MapFlags::FIXED)
        .at(base);
    mmap(&p, &fixed).unwrap();
    copyout(p.map(), b"old", base + PAGE).unwrap();

    let mut over = fixed.with_prot(ProtFlags::READ).at(base + PAGE);
    over.len = PAGE;
    assert_eq!(mmap(&p, &over), Ok(base + PAGE));
    assert_eq!(p.map().entry_count(), 3);
    let mut buf = [0xFFu8; 3];
    copyin(p.map(), base + PAGE, &mut buf).unwrap();
    assert_eq!(buf, [0u8; 3]);
}

#[test]
fn wiring_shortage_is_all_or_nothing() {
    let sys = system(VmConfig::default(), 4);
    let p = proc_on(&sys);
    let addr = mmap(&p, &MmapArgs::anon(8 * PAGE)).unwrap();
    assert_eq!(mlock(&p, addr, 8 * PAGE), Err(VmError::ResourceShortage));
    assert_eq!(sys.queues().count(QueueKind::Wired), 0);
    assert_eq!(p.map().user_wired_pages(), 0);

    mlock(&p, addr, 2 * PAGE).unwrap();
    assert_eq!(sys.queues().count(QueueKind::Wired), 2);
    munlock(&p, addr, 2 * PAGE).unwrap();
    assert_eq!(sys.queues().count(QueueKind::Wired), 0);
}

#[test]
fn sync_over_a_hole_fails() {
    let sys = system(VmConfig::default(), 8);
    let p = proc_on(&sys);
    let base = 0x30_0000;
    for at in [base, base + 2 * PAGE] {
        let args = MmapArgs::anon(PAGE)
            .with_flags(MapFlags::ANON | MapFlags::PRIVATE | MapFlags::FIXED)
            .at(at);
        mmap(&p, &args).unwrap();
    }
    assert_eq!(
        msync(&p, base, 3 * PAGE, MsyncFlags::SYNC.bits()),
        Err(VmError::IoFailure)
    );
    assert_eq!(msync(&p, base, PAGE, MsyncFlags::SYNC.bits()), Ok(()));
}

#[test]
fn unmap_twice_is_harmless() {
    let sys = system(VmConfig::default(), 8);
    let p = proc_on(&sys);
    let addr = mmap(&p, &MmapArgs::anon(2 * PAGE)).unwrap();
    munmap(&p, addr, 2 * PAGE).unwrap();
    let stamp = p.map().timestamp();
    munmap(&p, addr, 2 * PAGE).unwrap();
    assert_eq!(p.map().entry_count(), 0);
    assert_eq!(p.map().timestamp(), stamp);
}

#[test]
fn resilient_media_is_dropped_for_shared_mappings() {
    let sys = system(VmConfig::default(), 8);
    let p = proc_on(&sys);
    install(&p, 3, &[1u8; PAGE as usize], FileFlags::READ);

    let shared = MmapArgs::file(
        3,
        PAGE,
        0,
        ProtFlags::READ,
        MapFlags::SHARED | MapFlags::RESILIENT_MEDIA,
    );
    let addr = mmap(&p, &shared).unwrap();
    let flags = p.map().lookup(addr).unwrap().flags;
    assert!(!flags.contains(EntryFlags::RESILIENT_MEDIA));

    let private = shared.with_flags(MapFlags::PRIVATE | MapFlags::RESILIENT_MEDIA);
    let addr = mmap(&p, &private).unwrap();
    let flags = p.map().lookup(addr).unwrap().flags;
    assert!(flags.contains(EntryFlags::RESILIENT_MEDIA));
}

#[test]
fn private_file_writes_stay_private() {
    let sys = system(VmConfig::default(), 16);
    let p = proc_on(&sys);
    let ops = install(&p, 3, b"original contents", FileFlags::READ);
    let rw = ProtFlags::READ | ProtFlags::WRITE;

    let private = mmap(&p, &MmapArgs::file(3, PAGE, 0, rw, MapFlags::PRIVATE)).unwrap();
    let shared = mmap(
        &p,
        &MmapArgs::file(3, PAGE, 0, ProtFlags::READ, MapFlags::SHARED),
    )
    .unwrap();

    copyout(p.map(), b"modified", private).unwrap();
    let mut buf = [0u8; 8];
    copyin(p.map(), private, &mut buf).unwrap();
    assert_eq!(&buf, b"modified");
    copyin(p.map(), shared, &mut buf).unwrap();
    assert_eq!(&buf, b"original");
    assert_eq!(&ops.contents()[..8], b"original");

    let out = mmap(&p, &MmapArgs::anon(PAGE)).unwrap();
    assert_ne!(residency(&p, private, 1, out)[0] & mincore_bits::COPIED, 0);
}

#[test]
fn fork_honors_inheritance() {
    let sys = system(VmConfig::default(), 32);
    let parent = proc_on(&sys);
    let shared = mmap(&parent, &MmapArgs::anon(PAGE)).unwrap();
    let copied = mmap(&parent, &MmapArgs::anon(PAGE)).unwrap();
    let dropped = mmap(&parent, &MmapArgs::anon(PAGE)).unwrap();
    minherit(&parent, shared, PAGE, VmInherit::Share as u32).unwrap();
    minherit(&parent, dropped, PAGE, VmInherit::None as u32).unwrap();
    copyout(parent.map(), b"s", shared).unwrap();
    copyout(parent.map(), b"c", copied).unwrap();

    let child = parent.fork(43).unwrap();
    assert!(child.map().lookup(dropped).is_none());

    copyout(child.map(), b"S", shared).unwrap();
    copyout(child.map(), b"C", copied).unwrap();
    let mut byte = [0u8; 1];
    copyin(parent.map(), shared, &mut byte).unwrap();
    assert_eq!(&byte, b"S");
    copyin(parent.map(), copied, &mut byte).unwrap();
    assert_eq!(&byte, b"c");
}
