//! mmap
//!
//! Flag checks run first, in the order the BSD call makes them, then the
//! range is sanitized and the backing object chosen. Fixed requests replace
//! whatever is mapped in the window in one map operation.

use alloc::sync::Arc;

use crate::bsd::kern_mman::{fail, MapFlags, ProtFlags};
use crate::bsd::proc::{FileFlags, FileKind, Proc};
use crate::bsd::vnode::VnodeType;
use crate::config::Platform;
use crate::kern::kern_return::KernError;
use crate::mach_vm::vm_error::{VmError, VmResult};
use crate::mach_vm::vm_map::{EntryFlags, EntrySpec, Placement, VmInherit, VmProt};
use crate::mach_vm::vm_object::VmObject;
use crate::mach_vm::vm_page::{round_page, PAGE_MASK};
use crate::mach_vm::vm_sanitize::{
    sanitize_addr_size, sanitize_hint, sanitize_offset_size, sanitize_prot, SanitizeFlags,
};

/// Highest end address for `MAP_32BIT` placement
const LIMIT_32BIT: u64 = 1 << 32;

/// Raw mmap arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmapArgs {
    pub addr: u64,
    pub len: u64,
    pub prot: u32,
    pub flags: u32,
    pub fd: i32,
    pub pos: u64,
}

impl MmapArgs {
    /// Private anonymous read/write mapping of `len` bytes
    pub fn anon(len: u64) -> Self {
        Self {
            addr: 0,
            len,
            prot: (ProtFlags::READ | ProtFlags::WRITE).bits(),
            flags: (MapFlags::ANON | MapFlags::PRIVATE).bits(),
            fd: -1,
            pos: 0,
        }
    }

    /// Mapping of `len` bytes of file `fd` from `pos`
    pub fn file(fd: i32, len: u64, pos: u64, prot: ProtFlags, flags: MapFlags) -> Self {
        Self {
            addr: 0,
            len,
            prot: prot.bits(),
            flags: flags.bits(),
            fd,
            pos,
        }
    }

    pub fn at(mut self, addr: u64) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_prot(mut self, prot: ProtFlags) -> Self {
        self.prot = prot.bits();
        self
    }

    pub fn with_flags(mut self, flags: MapFlags) -> Self {
        self.flags = flags.bits();
        self
    }
}

/// Object, offset and limits a mapping will use
struct Backing {
    object: Arc<VmObject>,
    offset: u64,
    max_protection: VmProt,
    inheritance: VmInherit,
    flags: EntryFlags,
    tag: u8,
}

/// Map memory into the calling process
///
/// Returns the address of the first requested byte.
pub fn mmap(p: &Proc, args: &MmapArgs) -> VmResult<u64> {
    do_mmap(p, args).map_err(|err| fail("mmap", err))
}

fn do_mmap(p: &Proc, args: &MmapArgs) -> VmResult<u64> {
    let map = p.map();
    let sys = map.system();
    let config = sys.config();

    if p.sdk() >= config.strict_flags_sdk && MapFlags::from_bits(args.flags).is_none() {
        return Err(VmError::InvalidArgument);
    }
    let mut flags = MapFlags::from_bits_truncate(args.flags);
    let prot = sanitize_prot(args.prot, ProtFlags::RWX.bits())
        .map(ProtFlags::from_bits_truncate)
        .map_err(|_| VmError::InvalidArgument)?;

    if flags.contains(MapFlags::UNIX03) {
        if args.len == 0 {
            return Err(VmError::InvalidArgument);
        }
        let sharing = flags & (MapFlags::SHARED | MapFlags::PRIVATE);
        if sharing != MapFlags::SHARED && sharing != MapFlags::PRIVATE {
            return Err(VmError::InvalidArgument);
        }
    }

    let vm_prot = prot.to_vm_prot();

    if flags.contains(MapFlags::JIT)
        && (flags.intersects(MapFlags::FIXED | MapFlags::SHARED) || !flags.contains(MapFlags::ANON))
    {
        return Err(VmError::InvalidArgument);
    }

    if flags.intersects(MapFlags::RESILIENT_CODESIGN | MapFlags::RESILIENT_MEDIA)
        && flags.intersects(MapFlags::ANON | MapFlags::JIT)
    {
        return Err(VmError::InvalidArgument);
    }
    if flags.contains(MapFlags::RESILIENT_CODESIGN) {
        let forbidden = if flags.contains(MapFlags::SHARED) {
            VmProt::WRITE | VmProt::EXECUTE
        } else {
            VmProt::EXECUTE
        };
        if vm_prot.intersects(forbidden) {
            return Err(VmError::PermissionDenied);
        }
    }
    if flags.contains(MapFlags::RESILIENT_MEDIA | MapFlags::SHARED) {
        // Accepted and ignored for shared mappings
        log::debug!("mmap: ignoring MAP_RESILIENT_MEDIA on a shared mapping");
        flags.remove(MapFlags::RESILIENT_MEDIA);
    }

    if flags.contains(MapFlags::TPRO)
        && (!vm_prot.contains(VmProt::WRITE) || vm_prot.contains(VmProt::EXECUTE))
    {
        return Err(VmError::PermissionDenied);
    }

    if flags.contains(MapFlags::TRANSLATED_ALLOW_EXECUTE) && !p.is_translated() {
        return Err(VmError::InvalidArgument);
    }

    let limit = if flags.contains(MapFlags::MAP_32BIT) {
        if config.platform == Platform::Embedded {
            return Err(VmError::NotSupported);
        }
        LIMIT_32BIT
    } else {
        u64::MAX
    };

    // Fold the in-page part of the file offset into the mapping
    let pageoff = args.pos & PAGE_MASK;
    let pos = args.pos - pageoff;
    sanitize_offset_size(args.pos, args.len).map_err(|_| VmError::InvalidArgument)?;

    if args.len == 0 {
        return Ok(args.addr);
    }
    let size = args
        .len
        .checked_add(pageoff)
        .and_then(round_page)
        .ok_or(VmError::InvalidArgument)?;

    let placement = if flags.contains(MapFlags::FIXED) {
        let user_addr = args.addr.wrapping_sub(pageoff);
        let range = sanitize_addr_size(
            user_addr,
            size,
            SanitizeFlags::CHECK_ALIGNED_START | SanitizeFlags::SIZE_ZERO_FAILS,
        )
        .map_err(|_| VmError::InvalidArgument)?
        .ok_or(VmError::InvalidArgument)?;
        if range.end > limit {
            return Err(VmError::OutOfMemory);
        }
        Placement::Fixed {
            addr: range.start,
            overwrite: true,
        }
    } else {
        let hint = sanitize_hint(args.addr).map_err(|_| VmError::InvalidArgument)?;
        Placement::Anywhere {
            hint: hint.max(map.min_offset()),
            limit,
        }
    };

    let backing = if flags.contains(MapFlags::ANON) {
        anon_backing(p, args, flags, size)
    } else {
        file_backing(p, args, flags, vm_prot, pos)?
    };

    let mut entry_flags = backing.flags;
    if flags.contains(MapFlags::NOCACHE) {
        entry_flags |= EntryFlags::NO_CACHE;
    }
    if flags.contains(MapFlags::JIT) {
        entry_flags |= EntryFlags::JIT;
    }
    if flags.contains(MapFlags::TPRO) {
        entry_flags |= EntryFlags::TPRO;
    }
    if flags.contains(MapFlags::RESILIENT_CODESIGN) {
        entry_flags |= EntryFlags::RESILIENT_CODESIGN;
    }
    if flags.contains(MapFlags::RESILIENT_MEDIA) {
        entry_flags |= EntryFlags::RESILIENT_MEDIA;
    }
    if flags.contains(MapFlags::TRANSLATED_ALLOW_EXECUTE) {
        entry_flags |= EntryFlags::TRANSLATED_ALLOW_EXECUTE;
    }

    let mut max_protection = backing.max_protection;
    if flags.contains(MapFlags::RESILIENT_CODESIGN) {
        max_protection &= vm_prot;
    }

    let spec = EntrySpec {
        object: backing.object,
        offset: backing.offset,
        protection: vm_prot,
        max_protection,
        inheritance: backing.inheritance,
        flags: entry_flags,
        tag: backing.tag,
    };

    let start = match map.enter(placement, size, spec.clone()) {
        Err(KernError::NoSpace) => match placement {
            Placement::Anywhere { hint, limit } if hint > map.min_offset() => {
                log::trace!("mmap: no space above {:#x}, retrying from the bottom", hint);
                let retry = Placement::Anywhere {
                    hint: map.min_offset(),
                    limit,
                };
                map.enter(retry, size, spec)
            }
            _ => Err(KernError::NoSpace),
        },
        other => other,
    }
    .map_err(VmError::from_map_result)?;

    Ok(start + pageoff)
}

fn anon_backing(p: &Proc, args: &MmapArgs, flags: MapFlags, size: u64) -> Backing {
    let objects = p.map().system().objects();
    let shared = flags.contains(MapFlags::SHARED);
    // The descriptor slot carries a VM tag for anonymous memory
    let tag = if args.fd != -1 {
        ((args.fd as u32) >> 24) as u8
    } else {
        0
    };
    Backing {
        object: objects.create_internal(size),
        offset: 0,
        max_protection: VmProt::ALL,
        inheritance: if shared {
            VmInherit::Share
        } else {
            VmInherit::Copy
        },
        flags: if shared {
            EntryFlags::IS_SHARED
        } else {
            EntryFlags::empty()
        },
        tag,
    }
}

fn file_backing(
    p: &Proc,
    args: &MmapArgs,
    flags: MapFlags,
    prot: VmProt,
    pos: u64,
) -> VmResult<Backing> {
    let file = p.file(args.fd).ok_or(VmError::InvalidArgument)?;
    let vnode = match file.kind {
        FileKind::Vnode(vnode) => vnode,
        _ => return Err(VmError::NoSuchDevice),
    };
    match vnode.vtype() {
        VnodeType::Reg => {}
        VnodeType::Chr => return Err(VmError::NoSuchDevice),
        _ => return Err(VmError::InvalidArgument),
    }

    let shared = flags.contains(MapFlags::SHARED);
    let mut max_protection = VmProt::EXECUTE;
    if file.flags.contains(FileFlags::READ) {
        max_protection |= VmProt::READ;
    } else if prot.contains(VmProt::READ) {
        return Err(VmError::PermissionDenied);
    }
    if shared {
        if vnode.is_swap() && prot.contains(VmProt::WRITE) {
            return Err(VmError::PermissionDenied);
        }
        if file.flags.contains(FileFlags::WRITE) && !vnode.is_swap() {
            if vnode.is_immutable() {
                if prot.contains(VmProt::WRITE) {
                    return Err(VmError::PermissionDenied);
                }
            } else {
                max_protection |= VmProt::WRITE;
            }
        } else if prot.contains(VmProt::WRITE) {
            return Err(VmError::PermissionDenied);
        }
    } else {
        max_protection |= VmProt::WRITE;
    }

    if !vnode.mount_noatime() {
        vnode.touch_atime(p.now());
    }

    let objects = p.map().system().objects();
    Ok(Backing {
        object: vnode.vm_object(objects),
        offset: pos,
        max_protection,
        inheritance: if shared {
            VmInherit::Share
        } else {
            VmInherit::Copy
        },
        flags: if shared {
            EntryFlags::IS_SHARED
        } else {
            EntryFlags::NEEDS_COPY
        },
        tag: 0,
    })
}
