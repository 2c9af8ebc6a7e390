//! Mach return codes
//!
//! Based on Mach4 mach/kern_return.h
//!
//! Map and object operations report failures as `KernError`. The BSD
//! layer translates them to errno-style `VmError`s with a per-syscall
//! table, the way each `kern_mman` entry point does.

use thiserror::Error;

/// Kernel return type (Mach kern_return_t)
pub type KernReturn = i32;

/// Success
pub const KERN_SUCCESS: KernReturn = 0;
/// Address not valid in the target map
pub const KERN_INVALID_ADDRESS: KernReturn = 1;
/// Protection exceeds what the mapping allows
pub const KERN_PROTECTION_FAILURE: KernReturn = 2;
/// No room in the address space
pub const KERN_NO_SPACE: KernReturn = 3;
/// Invalid argument
pub const KERN_INVALID_ARGUMENT: KernReturn = 4;
/// Generic failure
pub const KERN_FAILURE: KernReturn = 5;
/// Resource shortage
pub const KERN_RESOURCE_SHORTAGE: KernReturn = 6;
/// Memory error (pager failure)
pub const KERN_MEMORY_ERROR: KernReturn = 10;
/// Operation not supported
pub const KERN_NOT_SUPPORTED: KernReturn = 46;

/// Mach-level failure of a map or object operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernError {
    #[error("invalid address")]
    InvalidAddress,
    #[error("protection failure")]
    ProtectionFailure,
    #[error("no space in address map")]
    NoSpace,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("failure")]
    Failure,
    #[error("resource shortage")]
    ResourceShortage,
    #[error("not supported")]
    NotSupported,
    #[error("memory error")]
    MemoryError,
}

impl KernError {
    /// Numeric `kern_return_t` value
    pub const fn code(self) -> KernReturn {
        match self {
            KernError::InvalidAddress => KERN_INVALID_ADDRESS,
            KernError::ProtectionFailure => KERN_PROTECTION_FAILURE,
            KernError::NoSpace => KERN_NO_SPACE,
            KernError::InvalidArgument => KERN_INVALID_ARGUMENT,
            KernError::Failure => KERN_FAILURE,
            KernError::ResourceShortage => KERN_RESOURCE_SHORTAGE,
            KernError::NotSupported => KERN_NOT_SUPPORTED,
            KernError::MemoryError => KERN_MEMORY_ERROR,
        }
    }
}

/// Result of a Mach-level operation
pub type KernResult<T> = Result<T, KernError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_return_codes() {
        assert_eq!(KERN_SUCCESS, 0);
        assert_eq!(KernError::NoSpace.code(), KERN_NO_SPACE);
        assert_eq!(KernError::NotSupported.code(), 46);
        assert_ne!(KernError::InvalidAddress.code(), KERN_SUCCESS);
    }
}
