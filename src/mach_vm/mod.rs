//! Mach Virtual Memory Subsystem
//!
//! Based on Mach4 vm/ subsystem.
//! Provides memory management including:
//! - vm_page, vm_page_store, vm_packing: per-frame descriptors
//! - vm_resident: the page queues
//! - vm_object: memory objects (backing store abstraction)
//! - memory_object: pager interface
//! - vm_map: address space management
//! - vm_fault: page resolution for touch, wiring and read-ahead
//! - vm_pageout: the reclaim mechanism
//! - vm_sanitize: argument checks shared by the mapping calls

pub mod memory_object;
pub mod pmap;
pub mod vm_error;
pub mod vm_fault;
pub mod vm_map;
pub mod vm_object;
pub mod vm_packing;
pub mod vm_page;
pub mod vm_page_queue;
pub mod vm_page_store;
pub mod vm_pageout;
pub mod vm_resident;
pub mod vm_sanitize;

pub use vm_error::{VmError, VmResult};
pub use vm_map::{EntryFlags, VmBehavior, VmInherit, VmMap, VmMapEntry, VmProt};
pub use vm_object::{VmObject, VmObjectId, VmObjectTable};
pub use vm_page::{VmPage, PAGE_SIZE};
pub use vm_page_store::VmPageId;
pub use vm_resident::{QueueKind, VmPageQueues};

use alloc::sync::Arc;
use core::ops::Range;
use spin::Once;

use crate::config::{ConfigError, VmConfig};
use crate::kern::counters::VmEventCounters;
use crate::kern::kern_return::{KernError, KernResult};
use pmap::PhysMemory;

// ============================================================================
// VM system
// ============================================================================

/// Everything the VM layer shares: configuration, page queues, the object
/// table, frame access and event counters
pub struct VmSystem {
    config: VmConfig,
    queues: Arc<VmPageQueues>,
    objects: Arc<VmObjectTable>,
    phys: Arc<dyn PhysMemory>,
    counters: VmEventCounters,
}

impl VmSystem {
    /// Bring up the page queues over `ram` and build the object table
    pub fn bootstrap(
        config: VmConfig,
        ram: &[Range<u64>],
        phys: Arc<dyn PhysMemory>,
    ) -> Result<Arc<Self>, ConfigError> {
        let queues = VmPageQueues::bootstrap(&config, ram)?;
        let objects = VmObjectTable::new(Arc::clone(&queues));
        Ok(Arc::new(Self {
            config,
            queues,
            objects,
            phys,
            counters: VmEventCounters::new(),
        }))
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn queues(&self) -> &Arc<VmPageQueues> {
        &self.queues
    }

    pub fn objects(&self) -> &Arc<VmObjectTable> {
        &self.objects
    }

    pub fn phys(&self) -> &dyn PhysMemory {
        &*self.phys
    }

    pub fn counters(&self) -> &VmEventCounters {
        &self.counters
    }

    /// Grab a free page, reclaiming when the free queues run dry
    ///
    /// Gives up with `ResourceShortage` after the configured number of
    /// reclaim passes instead of waiting forever.
    pub fn grab_page(&self) -> KernResult<VmPageId> {
        let attempts = self.config.wire_reclaim_attempts;
        for attempt in 0..=attempts {
            if let Some(id) = self.queues.grab() {
                return Ok(id);
            }
            self.counters.grab_failures.inc();
            if attempt == attempts {
                break;
            }
            let stats = vm_pageout::reclaim_pages(self, vm_pageout::RECLAIM_BATCH);
            log::trace!(
                "vm: free queues empty, reclaim pass {} freed {}",
                attempt + 1,
                stats.freed
            );
        }
        log::debug!("vm: no page after {} reclaim passes", attempts);
        Err(KernError::ResourceShortage)
    }
}

impl core::fmt::Debug for VmSystem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmSystem")
            .field("managed_pages", &self.queues.managed_pages())
            .field("free", &self.queues.free_count())
            .field("objects", &self.objects.count())
            .finish()
    }
}

static VM_SYSTEM: Once<Arc<VmSystem>> = Once::new();

/// Initialize the global VM system
///
/// Later calls return the system built by the first one.
pub fn init(
    config: VmConfig,
    ram: &[Range<u64>],
    phys: Arc<dyn PhysMemory>,
) -> Result<&'static Arc<VmSystem>, ConfigError> {
    VM_SYSTEM.try_call_once(|| VmSystem::bootstrap(config, ram, phys))
}

/// The global VM system, if initialized
pub fn vm_system() -> Option<&'static Arc<VmSystem>> {
    VM_SYSTEM.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mach_vm::pmap::SparsePhysMemory;

    #[test]
    fn test_grab_page_shortage() {
        let config = VmConfig::default()
            .with_page_colors(1)
            .with_wire_reclaim_attempts(2);
        let sys =
            VmSystem::bootstrap(config, &[0..2 * 4096], Arc::new(SparsePhysMemory::new())).unwrap();
        let a = sys.grab_page().unwrap();
        let b = sys.grab_page().unwrap();
        assert_ne!(a, b);
        assert_eq!(sys.grab_page(), Err(KernError::ResourceShortage));
        // One failure per pass plus the final try
        assert_eq!(sys.counters().grab_failures.get(), 3);
    }

    #[test]
    fn test_grab_page_reclaims() {
        let config = VmConfig::default().with_page_colors(1);
        let sys =
            VmSystem::bootstrap(config, &[0..4096], Arc::new(SparsePhysMemory::new())).unwrap();
        let object = sys.objects().create_internal(4096);
        let id = sys.grab_page().unwrap();
        object.page_insert(0, id);
        sys.queues().activate(id);
        sys.queues().deactivate(id);
        sys.queues().page(id).clear_busy();

        // The only page is clean and inactive, so it comes back
        let again = sys.grab_page().unwrap();
        assert_eq!(again, id);
        assert_eq!(object.resident_count(), 0);
        assert_eq!(sys.counters().reclaimed.get(), 1);
    }
}
