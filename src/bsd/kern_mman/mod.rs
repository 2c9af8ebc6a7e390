//! Memory-management syscalls
//!
//! Based on XNU bsd/kern/kern_mman.c
//!
//! Each call sanitizes its raw arguments, translates BSD flags into map
//! operations and maps the Mach result onto `VmError` with its own table.
//!
//! | call              | module             |
//! |-------------------|--------------------|
//! | mmap              | `mmap`             |
//! | munmap, mprotect, minherit | `mprotect` |
//! | msync             | `msync`            |
//! | madvise           | `madvise`          |
//! | mlock, munlock, mlockall, munlockall | `mlock` |
//! | mincore           | `mincore`          |
//! | mremap_encrypted  | `mremap_encrypted` |

use bitflags::bitflags;

use crate::mach_vm::vm_error::VmError;
use crate::mach_vm::vm_map::VmProt;

pub mod madvise;
pub mod mincore;
pub mod mlock;
pub mod mmap;
pub mod mprotect;
pub mod mremap_encrypted;
pub mod msync;

pub use madvise::{madvise, Advice};
pub use mincore::mincore;
pub use mlock::{mlock, mlockall, munlock, munlockall};
pub use mmap::{mmap, MmapArgs};
pub use mprotect::{minherit, mprotect, munmap};
pub use mremap_encrypted::mremap_encrypted;
pub use msync::msync;

// ============================================================================
// ABI values
// ============================================================================

bitflags! {
    /// mmap flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const SHARED = 0x0001;
        const PRIVATE = 0x0002;
        const FIXED = 0x0010;
        const RENAME = 0x0020;
        const NORESERVE = 0x0040;
        const NOEXTEND = 0x0100;
        const HASSEMAPHORE = 0x0200;
        const NOCACHE = 0x0400;
        const JIT = 0x0800;
        const ANON = 0x1000;
        const RESILIENT_CODESIGN = 0x2000;
        const RESILIENT_MEDIA = 0x4000;
        /// Place below 4 GiB
        const MAP_32BIT = 0x8000;
        const TRANSLATED_ALLOW_EXECUTE = 0x20000;
        /// Strict POSIX argument checks
        const UNIX03 = 0x40000;
        const TPRO = 0x80000;
    }
}

impl MapFlags {
    /// Old name for a private mapping
    pub const COPY: MapFlags = MapFlags::PRIVATE;
    /// File mapping, the absence of `ANON`
    pub const FILE: MapFlags = MapFlags::empty();
}

bitflags! {
    /// Protection bits accepted from user space
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProtFlags: u32 {
        const READ = 0x01;
        const WRITE = 0x02;
        const EXEC = 0x04;
        /// Mark as validated code without a signature check
        const TRUSTED = 0x20;
        /// Remove read, leaving execute-only
        const STRIP_READ = 0x80;
    }
}

impl ProtFlags {
    pub const RWX: ProtFlags = ProtFlags::READ.union(ProtFlags::WRITE).union(ProtFlags::EXEC);

    /// Hardware protection, with read implied by write or execute
    pub fn to_vm_prot(self) -> VmProt {
        let mut prot = VmProt::from_bits_truncate(self.intersection(Self::RWX).bits());
        if prot.intersects(VmProt::WRITE | VmProt::EXECUTE) {
            prot |= VmProt::READ;
        }
        prot
    }
}

bitflags! {
    /// msync flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsyncFlags: u32 {
        const ASYNC = 0x01;
        const INVALIDATE = 0x02;
        const KILLPAGES = 0x04;
        const DEACTIVATE = 0x08;
        const SYNC = 0x10;
    }
}

/// mincore result bits
pub mod mincore_bits {
    pub const INCORE: u8 = 0x01;
    pub const REFERENCED: u8 = 0x02;
    pub const MODIFIED: u8 = 0x04;
    pub const REFERENCED_OTHER: u8 = 0x08;
    pub const MODIFIED_OTHER: u8 = 0x10;
    pub const PAGED_OUT: u8 = 0x20;
    pub const COPIED: u8 = 0x40;
    pub const ANONYMOUS: u8 = 0x80;
}

/// Log a failed call and pass the error on
pub(crate) fn fail(call: &str, err: VmError) -> VmError {
    log::debug!("{}: {}", call, err);
    err
}
