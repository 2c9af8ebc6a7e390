//! Kernel-wide primitives shared by the VM and BSD layers.

pub mod copyio;
pub mod counters;
pub mod kern_return;

pub use counters::{MachCounter, VmEventCounters};
pub use kern_return::{KernError, KernResult, KernReturn};
