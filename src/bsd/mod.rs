//! BSD personality
//!
//! Processes, vnodes and the memory-management syscalls built on the Mach
//! VM layer.

pub mod kern_mman;
pub mod proc;
pub mod vnode;
pub mod vnode_pager;

pub use proc::{FileFlags, FileKind, FileRef, Proc};
pub use vnode::{Vnode, VnodeFlags, VnodeType};
