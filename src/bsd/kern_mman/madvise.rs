//! madvise

use crate::bsd::kern_mman::fail;
use crate::bsd::proc::Proc;
use crate::kern::kern_return::KernError;
use crate::mach_vm::vm_error::{VmError, VmResult};
use crate::mach_vm::vm_map::VmBehavior;
use crate::mach_vm::vm_sanitize::{sanitize_addr_size, SanitizeFlags};

/// madvise advice values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Advice {
    Normal = 0,
    Random = 1,
    Sequential = 2,
    WillNeed = 3,
    DontNeed = 4,
    Free = 5,
    ZeroWiredPages = 6,
    FreeReusable = 7,
    FreeReuse = 8,
    CanReuse = 9,
    Pageout = 10,
    Zero = 11,
}

impl Advice {
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Advice::Normal,
            1 => Advice::Random,
            2 => Advice::Sequential,
            3 => Advice::WillNeed,
            4 => Advice::DontNeed,
            5 => Advice::Free,
            6 => Advice::ZeroWiredPages,
            7 => Advice::FreeReusable,
            8 => Advice::FreeReuse,
            9 => Advice::CanReuse,
            10 => Advice::Pageout,
            11 => Advice::Zero,
            _ => return None,
        })
    }

    /// Map behavior carrying this advice
    pub const fn behavior(self) -> VmBehavior {
        match self {
            Advice::Normal => VmBehavior::Default,
            Advice::Random => VmBehavior::Random,
            Advice::Sequential => VmBehavior::Sequential,
            Advice::WillNeed => VmBehavior::WillNeed,
            Advice::DontNeed => VmBehavior::DontNeed,
            Advice::Free => VmBehavior::Free,
            Advice::ZeroWiredPages => VmBehavior::ZeroWiredPages,
            Advice::FreeReusable => VmBehavior::Reusable,
            Advice::FreeReuse => VmBehavior::Reuse,
            Advice::CanReuse => VmBehavior::CanReuse,
            Advice::Pageout => VmBehavior::Pageout,
            Advice::Zero => VmBehavior::Zero,
        }
    }
}

/// Advise the VM about the use of `[addr, addr + len)`
pub fn madvise(p: &Proc, addr: u64, len: u64, advice: u32) -> VmResult<()> {
    do_madvise(p, addr, len, advice).map_err(|err| fail("madvise", err))
}

fn do_madvise(p: &Proc, addr: u64, len: u64, advice: u32) -> VmResult<()> {
    let advice = Advice::from_raw(advice).ok_or(VmError::InvalidArgument)?;
    let Some(range) = sanitize_addr_size(addr, len, SanitizeFlags::empty())
        .map_err(|_| VmError::InvalidArgument)?
    else {
        return Ok(());
    };
    p.map()
        .behavior_set(range.start, range.end, advice.behavior(), p.now())
        .map_err(|err| match err {
            KernError::NoSpace => VmError::OutOfMemory,
            KernError::ProtectionFailure => VmError::PermissionDenied,
            KernError::NotSupported => VmError::NotSupported,
            _ => VmError::InvalidArgument,
        })
}
