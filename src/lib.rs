//! mach_vm - Mach virtual memory with the BSD mapping calls on top
//!
//! This crate provides the resident page manager (page descriptors, the
//! page queues and reclaim), VM objects and pagers, task address maps with
//! fault resolution, and the BSD memory-management syscalls that drive
//! them: mmap, munmap, mprotect, minherit, msync, madvise, mlock, munlock,
//! mincore and mremap_encrypted.
//!
//! Layering, bottom up:
//! - `config`: tunables fixed at bootstrap
//! - `kern`: return codes, event counters, user copy routines
//! - `mach_vm`: pages, queues, objects, maps, faults, pageout
//! - `bsd`: processes, vnodes and the syscall layer

#![cfg_attr(not(test), no_std)]
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Manual ceiling division is clearer in memory allocation contexts
#![allow(clippy::manual_div_ceil)]

// Standard library replacement for no_std
extern crate alloc;

pub mod config;
pub mod kern;

// Mach VM subsystem
pub mod mach_vm;

// BSD personality
pub mod bsd;

pub use config::VmConfig;
pub use mach_vm::{VmError, VmResult, VmSystem};

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = "mach_vm";
