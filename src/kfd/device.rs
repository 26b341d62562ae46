#![allow(clippy::cast_possible_truncation)]

use crate::debug::{AddressWatchInfo, WaveControlInfo};
use crate::error::{KfdError, KfdResult};
use crate::kfd::host::{DrmFile, PinnedPages};
use crate::kfd::ioctl::ProcessDeviceApertures;
use crate::process::memory::AllocFlags;
use crate::queues::QueueProperties;
use crate::utils::PAGE_SIZE;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ===============================================================================================
// Device Attributes
// ===============================================================================================

/// ASIC generations, ordered oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AsicFamily {
    Kaveri,
    Hawaii,
    Carrizo,
    Tonga,
    Fiji,
    Polaris10,
    Polaris11,
    Vega10,
    Raven,
    Vega20,
    Arcturus,
    Navi10,
}

impl AsicFamily {
    /// SOC15 parts carry a per-process doorbell page and support the debug trap.
    #[must_use]
    pub fn is_soc15(self) -> bool {
        self >= Self::Vega10
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    Hws,
    HwsNoOversubscription,
    /// Queues are programmed directly, without the hardware scheduler.
    NoHws,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmHandle(pub u64);

/// What a backend reports back for a queue it accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueHwInfo {
    /// Doorbell index in dwords, relative to the device doorbell aperture.
    pub doorbell_off: u32,
    /// VMID the no-HWS queue manager bound the process to, if any.
    pub vmid: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaveState {
    pub ctl_stack: Vec<u8>,
    pub save_area_used_size: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TileConfig {
    pub tile_config: Vec<u32>,
    pub macro_tile_config: Vec<u32>,
    pub gb_addr_config: u32,
    pub num_banks: u32,
    pub num_ranks: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    Coherent,
    NonCoherent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryPolicy {
    pub default_policy: CachePolicy,
    pub alternate_policy: CachePolicy,
    pub alternate_aperture_base: u64,
    pub alternate_aperture_size: u64,
}

// ===============================================================================================
// Fences
// ===============================================================================================

/// Completion token for an asynchronous device operation.
///
/// Fences from the same `context` complete in submission order.
#[derive(Debug, Clone)]
pub struct Fence {
    inner: Arc<FenceInner>,
}

#[derive(Debug)]
struct FenceInner {
    context: u64,
    seqno: u64,
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Fence {
    #[must_use]
    pub fn new(context: u64, seqno: u64) -> Self {
        Self {
            inner: Arc::new(FenceInner {
                context,
                seqno,
                signaled: Mutex::new(false),
                cond: Condvar::new(),
            }),
        }
    }

    #[must_use]
    pub fn signaled(context: u64, seqno: u64) -> Self {
        let fence = Self::new(context, seqno);
        fence.signal();
        fence
    }

    #[must_use]
    pub fn context(&self) -> u64 {
        self.inner.context
    }

    #[must_use]
    pub fn seqno(&self) -> u64 {
        self.inner.seqno
    }

    pub fn signal(&self) {
        let mut done = self.inner.signaled.lock();
        *done = true;
        self.inner.cond.notify_all();
    }

    #[must_use]
    pub fn is_signaled(&self) -> bool {
        *self.inner.signaled.lock()
    }

    /// # Errors
    /// Returns `Timeout` if the fence is still pending after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> KfdResult<()> {
        let deadline = Instant::now() + timeout;
        let mut done = self.inner.signaled.lock();
        while !*done {
            if self.inner.cond.wait_until(&mut done, deadline).timed_out() {
                return if *done { Ok(()) } else { Err(KfdError::Timeout) };
            }
        }
        Ok(())
    }
}

// ===============================================================================================
// Device Capability
// ===============================================================================================

/// The graphics driver half of a GPU: memory manager, queue manager and debug registers.
///
/// Optional capabilities default to succeeding without doing anything.
pub trait DeviceBackend: Send + Sync + fmt::Debug {
    // --- Address spaces ---

    /// # Errors
    /// Backend failure while creating page tables.
    fn create_process_vm(&self, pasid: u32) -> KfdResult<VmHandle>;

    /// # Errors
    /// Backend failure while adopting the render node's VM.
    fn acquire_process_vm(&self, drm: DrmFile, pasid: u32) -> KfdResult<VmHandle>;

    fn destroy_process_vm(&self, vm: VmHandle);

    // --- Buffer objects ---

    /// Returns the buffer and the offset user space mmaps it through.
    ///
    /// # Errors
    /// `OutOfMemory` or a backend failure.
    fn alloc_memory(
        &self,
        vm: VmHandle,
        va: u64,
        size: u64,
        flags: AllocFlags,
        cpu_addr: Option<u64>,
    ) -> KfdResult<(MemId, u64)>;

    /// # Errors
    /// Backend failure; the buffer is then still alive.
    fn free_memory(&self, mem: MemId) -> KfdResult<()>;

    /// # Errors
    /// Backend failure while updating page tables.
    fn map_memory(&self, mem: MemId, vm: VmHandle) -> KfdResult<()>;

    /// # Errors
    /// Backend failure while updating page tables.
    fn unmap_memory(&self, mem: MemId, vm: VmHandle) -> KfdResult<()>;

    /// Waits for pending page-table updates of `mem`.
    ///
    /// # Errors
    /// Backend failure.
    fn sync_memory(&self, _mem: MemId) -> KfdResult<()> {
        Ok(())
    }

    /// Wraps already pinned user pages into a GTT buffer in `vm`.
    ///
    /// # Errors
    /// Backend failure.
    fn import_pinned_pages(&self, vm: VmHandle, pages: &PinnedPages) -> KfdResult<MemId>;

    /// Maps a GTT buffer into the kernel and returns the kernel address.
    ///
    /// # Errors
    /// `InvalidArgument` for buffers that are not GTT.
    fn map_gtt_bo_to_kernel(&self, mem: MemId) -> KfdResult<u64>;

    /// Submits a copy and returns its fence with the number of bytes it will move.
    ///
    /// # Errors
    /// Backend failure at submission time.
    fn copy_mem_to_mem(
        &self,
        src: MemId,
        src_offset: u64,
        dst: MemId,
        dst_offset: u64,
        size: u64,
    ) -> KfdResult<(Fence, u64)>;

    fn flush_tlb_vmid(&self, vmid: u32);

    fn flush_tlb_pasid(&self, pasid: u32);

    // --- Queues ---

    /// # Errors
    /// Backend failure; no queue exists afterwards.
    fn create_queue(&self, pasid: u32, props: &QueueProperties) -> KfdResult<QueueHwInfo>;

    /// # Errors
    /// Backend failure.
    fn destroy_queue(&self, pasid: u32, queue_id: u32) -> KfdResult<()>;

    /// # Errors
    /// Backend failure.
    fn update_queue(&self, pasid: u32, props: &QueueProperties) -> KfdResult<()>;

    /// # Errors
    /// Backend failure.
    fn evict_process_queues(&self, _pasid: u32) -> KfdResult<()> {
        Ok(())
    }

    /// # Errors
    /// Backend failure.
    fn restore_process_queues(&self, _pasid: u32) -> KfdResult<()> {
        Ok(())
    }

    /// # Errors
    /// `InvalidArgument` for queues without a context save area.
    fn get_wave_state(&self, _pasid: u32, _queue_id: u32) -> KfdResult<WaveState> {
        Err(KfdError::InvalidArgument("queue has no wave state"))
    }

    /// # Errors
    /// Backend failure.
    fn suspend_queue(&self, _pasid: u32, _queue_id: u32, _grace_period: u32) -> KfdResult<()> {
        Ok(())
    }

    /// # Errors
    /// Backend failure.
    fn resume_queue(&self, _pasid: u32, _queue_id: u32) -> KfdResult<()> {
        Ok(())
    }

    /// # Errors
    /// Backend failure.
    fn set_queue_gws(&self, _pasid: u32, _queue_id: u32, _enable: bool) -> KfdResult<()> {
        Ok(())
    }

    // --- Debugger ---

    /// # Errors
    /// `Busy` if the debug VMID is already reserved.
    fn reserve_debug_vmid(&self) -> KfdResult<()> {
        Ok(())
    }

    /// # Errors
    /// Backend failure.
    fn release_debug_vmid(&self) -> KfdResult<()> {
        Ok(())
    }

    fn enable_debug_trap(&self, _vmid: u32) {}

    fn disable_debug_trap(&self, _vmid: u32) {}

    /// Returns the previous enable mask and the supported mask.
    ///
    /// # Errors
    /// `InvalidArgument` for modes the hardware does not know.
    fn set_wave_launch_trap_override(
        &self,
        _vmid: u32,
        _mode: u32,
        _enable_mask: u32,
        _support_request_mask: u32,
    ) -> KfdResult<(u32, u32)> {
        Ok((0, 0))
    }

    fn set_wave_launch_mode(&self, _mode: u32, _vmid: u32) {}

    /// # Errors
    /// Backend failure.
    fn set_precise_mem_ops(&self, _vmid: u32, _enable: bool) -> KfdResult<()> {
        Ok(())
    }

    /// # Errors
    /// Backend failure.
    fn set_address_watch(
        &self,
        _watch_id: u32,
        _addr: u64,
        _mask: u32,
        _mode: u32,
        _vmid: u32,
    ) -> KfdResult<()> {
        Ok(())
    }

    fn clear_address_watch(&self, _watch_id: u32) {}

    /// # Errors
    /// Backend failure.
    fn dbgmgr_address_watch(&self, _pasid: u32, _info: &AddressWatchInfo) -> KfdResult<()> {
        Ok(())
    }

    /// # Errors
    /// Backend failure.
    fn dbgmgr_wave_control(&self, _pasid: u32, _info: &WaveControlInfo) -> KfdResult<()> {
        Ok(())
    }

    // --- Miscellaneous per-process state ---

    /// # Errors
    /// Backend failure.
    fn set_memory_policy(&self, _pasid: u32, _policy: &MemoryPolicy) -> KfdResult<()> {
        Ok(())
    }

    /// # Errors
    /// Backend failure.
    fn set_trap_handler(&self, _pasid: u32, _tba_addr: u64, _tma_addr: u64) -> KfdResult<()> {
        Ok(())
    }

    fn set_scratch_backing_va(&self, _vmid: u32, _va: u64) {}

    fn gpu_clock_counter(&self) -> u64 {
        0
    }

    fn tile_config(&self) -> TileConfig {
        TileConfig::default()
    }

    /// Bus address of the doorbell page with the given process index.
    fn doorbell_page_addr(&self, index: u32) -> u64;

    /// Bus address of the register page user space may map for HDP flushes.
    fn mmio_remap_addr(&self) -> u64;
}

// ===============================================================================================
// Device
// ===============================================================================================

const NUM_WATCH_POINTS: u32 = 4;

/// One GPU node, registered once at probe time and never owned by a process.
#[derive(Debug)]
pub struct KfdDevice {
    pub gpu_id: u32,
    /// Position of the node in the topology, used for legacy aperture placement.
    pub node_index: u32,
    pub asic: AsicFamily,
    pub sched_policy: SchedPolicy,
    pub num_gws: u32,
    pub gws_debug_workaround: bool,
    pub large_bar: bool,
    pub gpuvm_size: u64,
    /// The VMID the debugger-enabled process runs in.
    pub debug_vmid: u32,
    watch_points: Mutex<u32>,
    backend: Arc<dyn DeviceBackend>,
}

impl KfdDevice {
    #[must_use]
    pub fn new(gpu_id: u32, asic: AsicFamily, backend: Arc<dyn DeviceBackend>) -> Self {
        Self {
            gpu_id,
            node_index: 0,
            asic,
            sched_policy: SchedPolicy::Hws,
            num_gws: 0,
            gws_debug_workaround: false,
            large_bar: false,
            gpuvm_size: 1 << 47,
            debug_vmid: 15,
            watch_points: Mutex::new(0),
            backend,
        }
    }

    #[must_use]
    pub fn with_node_index(mut self, index: u32) -> Self {
        self.node_index = index;
        self
    }

    #[must_use]
    pub fn with_sched_policy(mut self, policy: SchedPolicy) -> Self {
        self.sched_policy = policy;
        self
    }

    #[must_use]
    pub fn with_gws(mut self, num_gws: u32) -> Self {
        self.num_gws = num_gws;
        self
    }

    #[must_use]
    pub fn with_gws_debug_workaround(mut self, enabled: bool) -> Self {
        self.gws_debug_workaround = enabled;
        self
    }

    #[must_use]
    pub fn with_large_bar(mut self, large_bar: bool) -> Self {
        self.large_bar = large_bar;
        self
    }

    #[must_use]
    pub fn with_gpuvm_size(mut self, size: u64) -> Self {
        self.gpuvm_size = size;
        self
    }

    #[must_use]
    pub fn backend(&self) -> &dyn DeviceBackend {
        self.backend.as_ref()
    }

    #[must_use]
    pub fn is_soc15(&self) -> bool {
        self.asic.is_soc15()
    }

    #[must_use]
    pub fn is_no_hws(&self) -> bool {
        self.sched_policy == SchedPolicy::NoHws
    }

    /// Size of the doorbell page each process owns on this device.
    #[must_use]
    pub fn doorbell_process_slice(&self) -> u64 {
        if self.is_soc15() { 2 * PAGE_SIZE } else { PAGE_SIZE }
    }

    /// The LDS, scratch and GPUVM windows a process sees on this device.
    #[must_use]
    pub fn process_apertures(&self) -> ProcessDeviceApertures {
        let gpuvm_base = PAGE_SIZE;
        let gpuvm_limit = gpuvm_base.max(self.gpuvm_size) - 1;

        if self.is_soc15() {
            let lds_base = 0x1_u64 << 48;
            let scratch_base = 0x2_u64 << 48;
            ProcessDeviceApertures {
                lds_base,
                lds_limit: lds_base + 0xFFFF_FFFF,
                scratch_base,
                scratch_limit: scratch_base + 0xFFFF_FFFF,
                gpuvm_base,
                gpuvm_limit,
                gpu_id: self.gpu_id,
                pad: 0,
            }
        } else {
            // Pre-SOC15 parts place each node's windows in its own 2^61 slot.
            let slot = u64::from(self.node_index + 1) << 61;
            ProcessDeviceApertures {
                lds_base: slot,
                lds_limit: slot + 0xFFFF_FFFF,
                scratch_base: slot + 0x1_0000_0000,
                scratch_limit: slot + 0x1_FFFF_FFFF,
                gpuvm_base: slot + 0x1_0000_0000_0000 + gpuvm_base,
                gpuvm_limit: slot + 0x1_0000_0000_0000 + gpuvm_limit,
                gpu_id: self.gpu_id,
                pad: 0,
            }
        }
    }

    /// Claims the lowest free hardware watch point and programs it.
    ///
    /// # Errors
    /// `Busy` when every watch point is taken, or the backend failure.
    pub fn allocate_watch_point(&self, addr: u64, mask: u32, mode: u32) -> KfdResult<u32> {
        let mut used = self.watch_points.lock();
        let id = (0..NUM_WATCH_POINTS)
            .find(|id| *used & (1 << id) == 0)
            .ok_or(KfdError::Busy("no free watch point"))?;

        self.backend
            .set_address_watch(id, addr, mask, mode, self.debug_vmid)?;
        *used |= 1 << id;
        tracing::debug!(gpu_id = self.gpu_id, id, addr, "watch point set");
        Ok(id)
    }

    /// Clears every watch point in `bitmask`.
    pub fn release_watch_points(&self, bitmask: u32) {
        let mut used = self.watch_points.lock();
        for id in (0..NUM_WATCH_POINTS).filter(|id| bitmask & (1 << id) != 0) {
            self.backend.clear_address_watch(id);
            *used &= !(1 << id);
        }
    }
}

// ===============================================================================================
// Registry
// ===============================================================================================

/// All GPU nodes, keyed by their stable gpu_id.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<u32, Arc<KfdDevice>>,
}

impl DeviceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// `InvalidArgument` for gpu_id 0, `AlreadyExists` for a duplicate id.
    pub fn register(&mut self, device: KfdDevice) -> KfdResult<Arc<KfdDevice>> {
        if device.gpu_id == 0 {
            return Err(KfdError::InvalidArgument("gpu_id 0 is reserved"));
        }
        if self.devices.contains_key(&device.gpu_id) {
            return Err(KfdError::AlreadyExists("gpu_id"));
        }
        let device = Arc::new(device);
        self.devices.insert(device.gpu_id, Arc::clone(&device));
        Ok(device)
    }

    /// # Errors
    /// `NoSuchDevice` if the id does not resolve.
    pub fn lookup(&self, gpu_id: u32) -> KfdResult<Arc<KfdDevice>> {
        self.devices
            .get(&gpu_id)
            .cloned()
            .ok_or(KfdError::NoSuchDevice(gpu_id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<KfdDevice>> {
        self.devices.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
