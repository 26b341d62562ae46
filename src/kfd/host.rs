//! Capabilities the surrounding host provides: user address spaces, task lookup,
//! graphics-file resolution and clocks.

use crate::error::{KfdError, KfdResult};
use crate::events::DebugEventQueue;
use crate::utils::PAGE_SIZE;
use std::fmt;
use std::sync::Arc;
use zerocopy::{FromBytes, Immutable, IntoBytes};

/// A process's user virtual address space.
pub trait AddressSpace: Send + Sync + fmt::Debug {
    /// Whether `[addr, addr + len)` is mapped and accessible.
    fn access_ok(&self, addr: u64, len: u64) -> bool;

    /// # Errors
    /// Returns `Fault` if any byte of the range is inaccessible.
    fn read(&self, addr: u64, buf: &mut [u8]) -> KfdResult<()>;

    /// # Errors
    /// Returns `Fault` if any byte of the range is inaccessible.
    fn write(&self, addr: u64, data: &[u8]) -> KfdResult<()>;

    /// Pins up to `npages` pages starting at the page-aligned `addr`.
    ///
    /// Returns how many pages were actually pinned, which may be fewer than requested.
    ///
    /// # Errors
    /// Returns `Fault` if not even the first page can be pinned.
    fn pin_pages(&self, addr: u64, npages: u64, write: bool) -> KfdResult<u64>;

    fn unpin_pages(&self, addr: u64, npages: u64);
}

/// Pages pinned in some address space, released on drop.
#[derive(Debug)]
pub struct PinnedPages {
    mm: Arc<dyn AddressSpace>,
    addr: u64,
    npages: u64,
}

impl PinnedPages {
    /// # Errors
    /// Propagates the address space's pin failure; zero pinned pages is a `Fault`.
    pub fn pin(mm: &Arc<dyn AddressSpace>, addr: u64, npages: u64, write: bool) -> KfdResult<Self> {
        let pinned = mm.pin_pages(addr, npages, write)?.min(npages);
        if pinned == 0 {
            tracing::error!(addr, "could not pin any page");
            return Err(KfdError::Fault(addr));
        }
        Ok(Self {
            mm: Arc::clone(mm),
            addr,
            npages: pinned,
        })
    }

    #[must_use]
    pub const fn addr(&self) -> u64 {
        self.addr
    }

    #[must_use]
    pub const fn npages(&self) -> u64 {
        self.npages
    }

    #[must_use]
    pub const fn len(&self) -> u64 {
        self.npages * PAGE_SIZE
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.npages == 0
    }
}

impl Drop for PinnedPages {
    fn drop(&mut self) {
        self.mm.unpin_pages(self.addr, self.npages);
    }
}

/// Copies one plain-old-data value out of a user address space.
///
/// # Errors
/// Returns `Fault` if the source is inaccessible.
pub fn copy_from_user<T>(mm: &dyn AddressSpace, addr: u64) -> KfdResult<T>
where
    T: FromBytes + IntoBytes,
{
    let mut value = T::new_zeroed();
    mm.read(addr, value.as_mut_bytes())?;
    Ok(value)
}

/// Copies `count` consecutive values out of a user address space.
///
/// # Errors
/// Returns `OutOfMemory` when the array cannot be allocated and `Fault` if
/// the source is inaccessible.
pub fn copy_array_from_user<T>(mm: &dyn AddressSpace, addr: u64, count: usize) -> KfdResult<Vec<T>>
where
    T: FromBytes + IntoBytes + Clone,
{
    let mut values = Vec::new();
    values
        .try_reserve_exact(count)
        .map_err(|_| KfdError::OutOfMemory)?;
    values.resize(count, T::new_zeroed());
    mm.read(addr, values.as_mut_slice().as_mut_bytes())?;
    Ok(values)
}

/// # Errors
/// Returns `Fault` if the destination is inaccessible.
pub fn copy_to_user<T>(mm: &dyn AddressSpace, addr: u64, values: &[T]) -> KfdResult<()>
where
    T: IntoBytes + Immutable,
{
    mm.write(addr, values.as_bytes())
}

/// A user task as seen by the device file.
#[derive(Debug, Clone)]
pub struct Task {
    /// Thread-group id, which is also the pid user space passes around.
    pub tgid: u32,
    /// 32-bit compat tasks have no ABI translation and are rejected.
    pub is_compat: bool,
    pub ptrace_parent: Option<u32>,
    pub mm: Arc<dyn AddressSpace>,
}

impl Task {
    #[must_use]
    pub fn new(tgid: u32, mm: Arc<dyn AddressSpace>) -> Self {
        Self {
            tgid,
            is_compat: false,
            ptrace_parent: None,
            mm,
        }
    }

    #[must_use]
    pub const fn with_compat(mut self, compat: bool) -> Self {
        self.is_compat = compat;
        self
    }

    #[must_use]
    pub const fn with_ptrace_parent(mut self, parent: u32) -> Self {
        self.ptrace_parent = Some(parent);
        self
    }

    /// Whether `tracer` may act on this task as its debugger.
    #[must_use]
    pub fn is_traced_by(&self, tracer: u32) -> bool {
        self.ptrace_parent == Some(tracer)
    }
}

/// Identity of an opened graphics render-node file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DrmFile(pub u64);

pub trait HostServices: Send + Sync {
    fn find_task(&self, pid: u32) -> Option<Task>;

    /// Grants `caller` attach-level access to `target`'s address space.
    ///
    /// # Errors
    /// `PermissionDenied` when ptrace access is refused, `NoSuchProcess` when
    /// the target has no address space anymore.
    fn mm_access(&self, caller: &Task, target: &Task) -> KfdResult<Arc<dyn AddressSpace>>;

    /// Resolves a file descriptor of the calling process to a render-node file.
    fn drm_file(&self, fd: u32) -> Option<DrmFile>;

    /// Installs a readable descriptor backed by the queue and returns its number.
    ///
    /// # Errors
    /// Whatever the host reports when it runs out of descriptors.
    fn install_debug_event_fd(&self, queue: Arc<DebugEventQueue>) -> KfdResult<i32>;

    fn raw_monotonic_ns(&self) -> u64;

    fn boottime_ns(&self) -> u64;
}
