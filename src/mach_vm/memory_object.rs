//! Memory Object - Pager Interface
//!
//! Based on Mach memory_object.h and the XNU apple-protect and swapfile
//! pagers.
//!
//! A pager fills a page's frame from backing storage on fault
//! (`data_request`) and writes a dirty frame back (`data_return`). The
//! vnode pager lives with the BSD vnode code; this module carries the
//! interface and the two pagers layered on a vnode:
//!
//! - `SwapfilePager` never exposes a swap file's real contents
//! - `CryptPager` decrypts executable text through a `TextCrypter`

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use thiserror::Error;

use crate::bsd::vnode::Vnode;
use crate::mach_vm::pmap::PhysMemory;
use crate::mach_vm::vm_page::PAGE_SIZE;

// ============================================================================
// Pager interface
// ============================================================================

/// Pager flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagerKind {
    /// Regular file
    Vnode,
    /// Swap file, contents hidden
    Swapfile,
    /// Encrypted text
    Crypt,
}

/// Pager failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PagerError {
    #[error("backing store i/o error")]
    Io,
    #[error("offset beyond end of backing store")]
    OutOfRange,
    #[error("pager does not accept writeback")]
    ReadOnly,
    #[error("decryption failed")]
    Crypt,
}

/// External pager
pub trait Pager: Send + Sync {
    fn kind(&self) -> PagerKind;

    /// Whether backing storage holds data for `offset`
    fn has_page(&self, offset: u64) -> bool;

    /// Populate frame `phys_page` with the data at `offset`
    fn data_request(
        &self,
        offset: u64,
        phys_page: u32,
        mem: &dyn PhysMemory,
    ) -> Result<(), PagerError>;

    /// Write frame `phys_page` back to `offset`
    fn data_return(&self, offset: u64, phys_page: u32, mem: &dyn PhysMemory)
        -> Result<(), PagerError>;

    /// Backing file, if any
    fn vnode(&self) -> Option<&Arc<Vnode>> {
        None
    }
}

// ============================================================================
// Swap file pager
// ============================================================================

/// Pager for mappings of a swap file
///
/// Every page reads back blank (zeros ending in a newline) and nothing is
/// ever written through it.
pub struct SwapfilePager {
    vnode: Arc<Vnode>,
}

impl SwapfilePager {
    pub fn new(vnode: Arc<Vnode>) -> Self {
        Self { vnode }
    }
}

impl Pager for SwapfilePager {
    fn kind(&self) -> PagerKind {
        PagerKind::Swapfile
    }

    fn has_page(&self, offset: u64) -> bool {
        offset < self.vnode.size()
    }

    fn data_request(
        &self,
        _offset: u64,
        phys_page: u32,
        mem: &dyn PhysMemory,
    ) -> Result<(), PagerError> {
        let mut blank = vec![0u8; PAGE_SIZE];
        blank[PAGE_SIZE - 1] = b'\n';
        mem.write_page(phys_page, &blank);
        Ok(())
    }

    fn data_return(&self, _: u64, _: u32, _: &dyn PhysMemory) -> Result<(), PagerError> {
        Err(PagerError::ReadOnly)
    }

    fn vnode(&self) -> Option<&Arc<Vnode>> {
        Some(&self.vnode)
    }
}

// ============================================================================
// Encrypted text
// ============================================================================

/// Crypter failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CrypterError {
    /// Caller lacks the entitlement for this transform
    #[error("not privileged for this transform")]
    NotPrivileged,
    /// Transform unknown or could not be set up
    #[error("transform unavailable")]
    Unavailable,
    #[error("decryption failed")]
    Failed,
}

/// Decrypts pages of one executable
pub trait TextCrypter: Send + Sync {
    /// Decrypt the page at file `offset` in place
    fn decrypt_page(&self, offset: u64, page: &mut [u8]) -> Result<(), CrypterError>;
}

/// What a crypter is being created for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptInfo {
    /// Name of the decryption transform
    pub transform: &'static str,
    pub cputype: i32,
    pub cpusubtype: i32,
    /// Path of the backing file
    pub path: String,
    /// File offset the mapping starts at
    pub file_offset: u64,
}

/// Creates crypters for encrypted remaps
pub trait TextCrypterFactory: Send + Sync {
    fn create(&self, info: &CryptInfo) -> Result<Arc<dyn TextCrypter>, CrypterError>;
}

/// Pager decrypting a file-backed pager's contents
pub struct CryptPager {
    backing: Arc<dyn Pager>,
    crypter: Arc<dyn TextCrypter>,
}

impl CryptPager {
    pub fn new(backing: Arc<dyn Pager>, crypter: Arc<dyn TextCrypter>) -> Self {
        Self { backing, crypter }
    }
}

impl Pager for CryptPager {
    fn kind(&self) -> PagerKind {
        PagerKind::Crypt
    }

    fn has_page(&self, offset: u64) -> bool {
        self.backing.has_page(offset)
    }

    fn data_request(
        &self,
        offset: u64,
        phys_page: u32,
        mem: &dyn PhysMemory,
    ) -> Result<(), PagerError> {
        self.backing.data_request(offset, phys_page, mem)?;
        let mut buf = vec![0u8; PAGE_SIZE];
        mem.read_page(phys_page, &mut buf);
        self.crypter
            .decrypt_page(offset, &mut buf)
            .map_err(|_| PagerError::Crypt)?;
        mem.write_page(phys_page, &buf);
        Ok(())
    }

    fn data_return(&self, _: u64, _: u32, _: &dyn PhysMemory) -> Result<(), PagerError> {
        Err(PagerError::ReadOnly)
    }

    fn vnode(&self) -> Option<&Arc<Vnode>> {
        self.backing.vnode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsd::vnode::{MemVnodeOps, VnodeType};
    use crate::bsd::vnode_pager::VnodePager;
    use crate::mach_vm::pmap::SparsePhysMemory;

    struct XorCrypter(u8);

    impl TextCrypter for XorCrypter {
        fn decrypt_page(&self, _offset: u64, page: &mut [u8]) -> Result<(), CrypterError> {
            page.iter_mut().for_each(|b| *b ^= self.0);
            Ok(())
        }
    }

    fn file(data: &[u8]) -> Arc<Vnode> {
        Vnode::new(VnodeType::Reg, "/bin/tool", Arc::new(MemVnodeOps::new(data)))
    }

    #[test]
    fn test_swapfile_pages_read_blank() {
        let mem = SparsePhysMemory::new();
        let vnode = file(&[0x55; PAGE_SIZE]);
        let pager = SwapfilePager::new(vnode);
        assert!(pager.has_page(0));
        assert!(!pager.has_page(PAGE_SIZE as u64));
        pager.data_request(0, 1, &mem).unwrap();

        let mut buf = vec![0u8; PAGE_SIZE];
        mem.read_page(1, &mut buf);
        assert!(buf[..PAGE_SIZE - 1].iter().all(|&b| b == 0));
        assert_eq!(buf[PAGE_SIZE - 1], b'\n');
        assert_eq!(pager.data_return(0, 1, &mem), Err(PagerError::ReadOnly));
    }

    #[test]
    fn test_crypt_pager_decrypts() {
        let mem = SparsePhysMemory::new();
        let vnode = file(&[0x0F; PAGE_SIZE]);
        let backing: Arc<dyn Pager> = Arc::new(VnodePager::new(vnode));
        let pager = CryptPager::new(backing, Arc::new(XorCrypter(0xFF)));
        pager.data_request(0, 2, &mem).unwrap();

        let mut buf = vec![0u8; PAGE_SIZE];
        mem.read_page(2, &mut buf);
        assert!(buf.iter().all(|&b| b == 0xF0));
        assert_eq!(pager.kind(), PagerKind::Crypt);
        assert!(pager.vnode().is_some());
    }
}
