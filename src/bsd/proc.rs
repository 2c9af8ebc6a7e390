//! Processes
//!
//! The part of a BSD process the memory syscalls consult: its address map,
//! its open files, the ABI level it was built against and the policy hooks
//! that gate code signing and decryption.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::bsd::vnode::Vnode;
use crate::mach_vm::memory_object::TextCrypterFactory;
use crate::mach_vm::vm_map::VmMap;

bitflags! {
    /// Open mode of a file descriptor
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileFlags: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
    }
}

/// What a descriptor refers to
#[derive(Debug, Clone)]
pub enum FileKind {
    Vnode(Arc<Vnode>),
    Socket,
    Pipe,
    Kqueue,
}

/// An open file
#[derive(Debug, Clone)]
pub struct FileRef {
    pub kind: FileKind,
    pub flags: FileFlags,
}

impl FileRef {
    pub fn vnode(vnode: Arc<Vnode>, flags: FileFlags) -> Self {
        Self {
            kind: FileKind::Vnode(vnode),
            flags,
        }
    }
}

/// Code-signing decisions the memory syscalls defer to
pub trait CodeSigningPolicy: Send + Sync {
    /// Whether `[start, end)` of process `pid` may be marked as validated
    /// code without a signature check
    fn allow_unsigned_code(&self, pid: i32, start: u64, end: u64) -> bool;
}

/// Policy that never allows unsigned code
#[derive(Debug, Default, Clone, Copy)]
pub struct StrictSigning;

impl CodeSigningPolicy for StrictSigning {
    fn allow_unsigned_code(&self, _pid: i32, _start: u64, _end: u64) -> bool {
        false
    }
}

/// Time source, milliseconds
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

/// Clock advanced by hand
#[derive(Debug, Default)]
pub struct TickClock {
    now: AtomicU64,
}

impl TickClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn advance(&self, ms: u64) -> u64 {
        self.now.fetch_add(ms, Ordering::Relaxed) + ms
    }
}

impl Clock for TickClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}

/// A process
pub struct Proc {
    pid: i32,
    map: Arc<VmMap>,
    files: Mutex<BTreeMap<i32, FileRef>>,
    /// ABI level the binary targets
    sdk: u32,
    /// Running under binary translation
    translated: bool,
    cputype: i32,
    cpusubtype: i32,
    signing: Option<Arc<dyn CodeSigningPolicy>>,
    crypters: Option<Arc<dyn TextCrypterFactory>>,
    clock: Arc<dyn Clock>,
}

impl Proc {
    pub fn new(pid: i32, map: Arc<VmMap>) -> Self {
        Self {
            pid,
            map,
            files: Mutex::new(BTreeMap::new()),
            sdk: u32::MAX,
            translated: false,
            cputype: 0,
            cpusubtype: 0,
            signing: None,
            crypters: None,
            clock: Arc::new(TickClock::default()),
        }
    }

    pub fn with_sdk(mut self, sdk: u32) -> Self {
        self.sdk = sdk;
        self
    }

    pub fn with_translated(mut self, translated: bool) -> Self {
        self.translated = translated;
        self
    }

    pub fn with_cpu(mut self, cputype: i32, cpusubtype: i32) -> Self {
        self.cputype = cputype;
        self.cpusubtype = cpusubtype;
        self
    }

    pub fn with_signing(mut self, policy: Arc<dyn CodeSigningPolicy>) -> Self {
        self.signing = Some(policy);
        self
    }

    pub fn with_crypters(mut self, factory: Arc<dyn TextCrypterFactory>) -> Self {
        self.crypters = Some(factory);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn map(&self) -> &Arc<VmMap> {
        &self.map
    }

    pub fn sdk(&self) -> u32 {
        self.sdk
    }

    pub fn is_translated(&self) -> bool {
        self.translated
    }

    pub fn cpu(&self) -> (i32, i32) {
        (self.cputype, self.cpusubtype)
    }

    pub fn signing(&self) -> Option<&Arc<dyn CodeSigningPolicy>> {
        self.signing.as_ref()
    }

    pub fn crypters(&self) -> Option<&Arc<dyn TextCrypterFactory>> {
        self.crypters.as_ref()
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Install `file` at `fd`, replacing what was there
    pub fn install_file(&self, fd: i32, file: FileRef) {
        self.files.lock().insert(fd, file);
    }

    pub fn close(&self, fd: i32) -> Option<FileRef> {
        self.files.lock().remove(&fd)
    }

    pub fn file(&self, fd: i32) -> Option<FileRef> {
        self.files.lock().get(&fd).cloned()
    }

    /// Child process sharing nothing but inherited memory
    pub fn fork(&self, pid: i32) -> crate::kern::kern_return::KernResult<Proc> {
        let map = Arc::new(self.map.fork()?);
        Ok(Proc {
            pid,
            map,
            files: Mutex::new(self.files.lock().clone()),
            sdk: self.sdk,
            translated: self.translated,
            cputype: self.cputype,
            cpusubtype: self.cpusubtype,
            signing: self.signing.clone(),
            crypters: self.crypters.clone(),
            clock: Arc::clone(&self.clock),
        })
    }
}

impl core::fmt::Debug for Proc {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Proc")
            .field("pid", &self.pid)
            .field("sdk", &self.sdk)
            .field("translated", &self.translated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsd::vnode::{MemVnodeOps, VnodeType};
    use crate::config::VmConfig;
    use crate::mach_vm::pmap::SparsePhysMemory;
    use crate::mach_vm::VmSystem;

    #[test]
    fn test_file_table_and_fork() {
        let config = VmConfig::default().with_page_colors(1);
        let sys = VmSystem::bootstrap(config, &[0..4 * 4096], Arc::new(SparsePhysMemory::new()))
            .unwrap();
        let p = Proc::new(7, Arc::new(VmMap::new(&sys))).with_sdk(1);
        let vnode = Vnode::new(VnodeType::Reg, "/etc/motd", Arc::new(MemVnodeOps::new(b"hi")));
        p.install_file(3, FileRef::vnode(vnode, FileFlags::READ));
        assert!(matches!(p.file(3).unwrap().kind, FileKind::Vnode(_)));
        assert!(p.file(4).is_none());

        let child = p.fork(8).unwrap();
        assert_eq!(child.pid(), 8);
        assert_eq!(child.sdk(), 1);
        assert!(child.file(3).is_some());
        assert!(p.close(3).is_some());
        assert!(child.file(3).is_some());
    }

    #[test]
    fn test_tick_clock() {
        let clock = TickClock::new(100);
        assert_eq!(clock.advance(50), 150);
        assert_eq!(clock.now(), 150);
        assert!(!StrictSigning.allow_unsigned_code(1, 0, 4096));
    }
}
