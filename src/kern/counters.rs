//! Kernel event counters
//!
//! Based on Mach4 kern/counters.h/c by CMU (1987-1991)
//!
//! Counters are plain relaxed atomics. They are never free-standing
//! globals here: every counter is a field of the subsystem that owns it
//! (the page queues own their population counts, the VM system owns its
//! event counts) and is read through that owner's accessors.

use core::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Counter Type
// ============================================================================

/// Mach counter type (atomically updated)
#[derive(Debug)]
pub struct MachCounter {
    value: AtomicU64,
    name: &'static str,
}

impl MachCounter {
    /// Create a new counter
    pub const fn new(name: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
        }
    }

    /// Increment counter by 1
    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment counter by n
    #[inline]
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Decrement counter by 1
    ///
    /// Underflow is a bookkeeping bug in the owner, not a runtime condition.
    #[inline]
    pub fn dec(&self) {
        let prev = self.value.fetch_sub(1, Ordering::Relaxed);
        assert!(prev != 0, "counter {} underflow", self.name);
    }

    /// Decrement counter by n
    #[inline]
    pub fn sub(&self, n: u64) {
        let prev = self.value.fetch_sub(n, Ordering::Relaxed);
        assert!(prev >= n, "counter {} underflow", self.name);
    }

    /// Set counter to specific value
    #[inline]
    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    /// Get current value
    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Get counter name
    pub fn name(&self) -> &'static str {
        self.name
    }
}

// ============================================================================
// VM event counters
// ============================================================================

/// Event counts kept by the VM system (vm_stat style)
#[derive(Debug)]
pub struct VmEventCounters {
    /// Faults resolved (touch, wire, will-need)
    pub faults: MachCounter,
    /// Pages filled with zeros on first touch
    pub zero_fills: MachCounter,
    /// Pages populated by a pager
    pub pageins: MachCounter,
    /// Pages written back to a pager
    pub pageouts: MachCounter,
    /// Private copies made on write
    pub cow_faults: MachCounter,
    /// Pages freed by the reclaim mechanism
    pub reclaimed: MachCounter,
    /// Grabs that found the free queues empty
    pub grab_failures: MachCounter,
}

impl VmEventCounters {
    pub const fn new() -> Self {
        Self {
            faults: MachCounter::new("faults"),
            zero_fills: MachCounter::new("zero_fills"),
            pageins: MachCounter::new("pageins"),
            pageouts: MachCounter::new("pageouts"),
            cow_faults: MachCounter::new("cow_faults"),
            reclaimed: MachCounter::new("reclaimed"),
            grab_failures: MachCounter::new("grab_failures"),
        }
    }
}
