//! Caller-visible VM errors
//!
//! The small stable error set returned by the mapping syscalls. Mach-level
//! results (`KernError`) are translated into this set by each syscall with
//! its own table, the way the BSD layer does it call by call.

use thiserror::Error;

use crate::kern::kern_return::KernError;

/// BSD errno values for the VM error set
pub mod errno {
    pub const EIO: i32 = 5;
    pub const EAGAIN: i32 = 35;
    pub const ENOMEM: i32 = 12;
    pub const EACCES: i32 = 13;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
    pub const EPERM: i32 = 1;
    pub const ENOTSUP: i32 = 45;
}

/// Mapping syscall error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmError {
    /// Malformed flags, bad alignment, disallowed zero length, overflow
    #[error("invalid argument")]
    InvalidArgument,
    /// No address space range or no physical page available
    #[error("out of memory")]
    OutOfMemory,
    /// Protection or policy refused the request
    #[error("permission denied")]
    PermissionDenied,
    /// The range may not be wired at its current protection
    #[error("operation not permitted")]
    NotPermitted,
    /// Recognized but unimplemented, or not applicable here
    #[error("operation not supported")]
    NotSupported,
    /// Backing descriptor cannot be mapped
    #[error("no such device")]
    NoSuchDevice,
    /// Hole in a sync range or failed writeback
    #[error("i/o failure")]
    IoFailure,
    /// Wiring could not reclaim enough memory
    #[error("resource temporarily unavailable")]
    ResourceShortage,
}

impl VmError {
    /// BSD errno for this error
    pub const fn errno(self) -> i32 {
        match self {
            VmError::InvalidArgument => errno::EINVAL,
            VmError::OutOfMemory => errno::ENOMEM,
            VmError::PermissionDenied => errno::EACCES,
            VmError::NotPermitted => errno::EPERM,
            VmError::NotSupported => errno::ENOTSUP,
            VmError::NoSuchDevice => errno::ENODEV,
            VmError::IoFailure => errno::EIO,
            VmError::ResourceShortage => errno::EAGAIN,
        }
    }

    /// Translation used by the placement paths (map, fixed replace)
    pub const fn from_map_result(err: KernError) -> Self {
        match err {
            KernError::NoSpace | KernError::InvalidAddress => VmError::OutOfMemory,
            KernError::ProtectionFailure => VmError::PermissionDenied,
            KernError::ResourceShortage => VmError::ResourceShortage,
            _ => VmError::InvalidArgument,
        }
    }
}

pub type VmResult<T> = Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_values() {
        assert_eq!(VmError::InvalidArgument.errno(), errno::EINVAL);
        assert_eq!(VmError::ResourceShortage.errno(), errno::EAGAIN);
        assert_eq!(VmError::IoFailure.errno(), errno::EIO);
        assert_eq!(VmError::NotPermitted.errno(), errno::EPERM);
        assert_ne!(VmError::NotPermitted.errno(), VmError::PermissionDenied.errno());
    }

    #[test]
    fn test_map_translation() {
        assert_eq!(
            VmError::from_map_result(KernError::NoSpace),
            VmError::OutOfMemory
        );
        assert_eq!(
            VmError::from_map_result(KernError::ProtectionFailure),
            VmError::PermissionDenied
        );
        assert_eq!(
            VmError::from_map_result(KernError::Failure),
            VmError::InvalidArgument
        );
    }
}
