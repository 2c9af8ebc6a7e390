//! Vnodes
//!
//! The slice of the BSD vnode the mapping code consumes: type, path for
//! diagnostics, swap-file and mount flags, access time, and the data path
//! pagers go through. One VM object is cached per vnode so every mapping
//! of a file shares its resident pages.

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use crate::bsd::vnode_pager::VnodePager;
use crate::mach_vm::memory_object::{Pager, PagerError, SwapfilePager};
use crate::mach_vm::vm_object::{VmObject, VmObjectTable};
use crate::mach_vm::vm_page::{round_page, PAGE_SIZE};

/// Vnode type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VnodeType {
    Non,
    Reg,
    Dir,
    Blk,
    Chr,
    Lnk,
    Sock,
    Fifo,
}

bitflags! {
    /// Vnode and mount attributes relevant to mapping
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VnodeFlags: u32 {
        /// Vnode backs a swap file
        const SWAP = 0x1;
        /// Mount does not update access times
        const NOATIME = 0x2;
        /// File may not be modified
        const IMMUTABLE = 0x4;
    }
}

/// File data operations
pub trait VnodeOps: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`, returning the count read
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, PagerError>;

    /// Write `data` at `offset`, returning the count written
    fn write(&self, offset: u64, data: &[u8]) -> Result<usize, PagerError>;

    /// Current file size
    fn size(&self) -> u64;
}

/// A file
pub struct Vnode {
    vtype: VnodeType,
    path: String,
    flags: VnodeFlags,
    atime: AtomicU64,
    ops: Arc<dyn VnodeOps>,
    object: Mutex<Weak<VmObject>>,
}

impl Vnode {
    pub fn new(vtype: VnodeType, path: &str, ops: Arc<dyn VnodeOps>) -> Arc<Self> {
        Self::with_flags(vtype, path, ops, VnodeFlags::empty())
    }

    pub fn with_flags(
        vtype: VnodeType,
        path: &str,
        ops: Arc<dyn VnodeOps>,
        flags: VnodeFlags,
    ) -> Arc<Self> {
        Arc::new(Self {
            vtype,
            path: String::from(path),
            flags,
            atime: AtomicU64::new(0),
            ops,
            object: Mutex::new(Weak::new()),
        })
    }

    pub fn vtype(&self) -> VnodeType {
        self.vtype
    }

    /// Path, for diagnostics
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_swap(&self) -> bool {
        self.flags.contains(VnodeFlags::SWAP)
    }

    pub fn mount_noatime(&self) -> bool {
        self.flags.contains(VnodeFlags::NOATIME)
    }

    pub fn is_immutable(&self) -> bool {
        self.flags.contains(VnodeFlags::IMMUTABLE)
    }

    pub fn size(&self) -> u64 {
        self.ops.size()
    }

    pub fn ops(&self) -> &Arc<dyn VnodeOps> {
        &self.ops
    }

    pub fn atime(&self) -> u64 {
        self.atime.load(Ordering::Relaxed)
    }

    /// Record an access at `now`
    pub fn touch_atime(&self, now: u64) {
        self.atime.store(now, Ordering::Relaxed);
    }

    /// The vnode's VM object, created on first use
    ///
    /// Swap files get the obfuscating swap pager, everything else the
    /// plain vnode pager.
    pub fn vm_object(self: &Arc<Self>, objects: &Arc<VmObjectTable>) -> Arc<VmObject> {
        let mut cached = self.object.lock();
        if let Some(object) = cached.upgrade() {
            return object;
        }
        let pager: Arc<dyn Pager> = if self.is_swap() {
            Arc::new(SwapfilePager::new(Arc::clone(self)))
        } else {
            Arc::new(VnodePager::new(Arc::clone(self)))
        };
        let size = round_page(self.size()).unwrap_or(u64::MAX & !(PAGE_SIZE as u64 - 1));
        let object = objects.create_external(size, pager);
        *cached = Arc::downgrade(&object);
        object
    }
}

impl core::fmt::Debug for Vnode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vnode")
            .field("vtype", &self.vtype)
            .field("path", &self.path)
            .field("flags", &self.flags)
            .finish()
    }
}

/// File contents held in memory
#[derive(Debug, Default)]
pub struct MemVnodeOps {
    data: Mutex<Vec<u8>>,
}

impl MemVnodeOps {
    pub fn new(data: &[u8]) -> Self {
        Self {
            data: Mutex::new(data.to_vec()),
        }
    }

    /// Copy of the current contents
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl VnodeOps for MemVnodeOps {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, PagerError> {
        let data = self.data.lock();
        let start = usize::try_from(offset).map_err(|_| PagerError::OutOfRange)?;
        if start >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write(&self, offset: u64, src: &[u8]) -> Result<usize, PagerError> {
        let mut data = self.data.lock();
        let start = usize::try_from(offset).map_err(|_| PagerError::OutOfRange)?;
        if start >= data.len() {
            return Ok(0);
        }
        // Writeback never extends the file
        let n = src.len().min(data.len() - start);
        data[start..start + n].copy_from_slice(&src[..n]);
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.data.lock().len() as u64
    }
}
