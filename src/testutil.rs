//! In-memory stand-ins for the device backend and the host, plus a bed of
//! registered devices shared by the unit tests.

use crate::config::KfdConfig;
use crate::debug::DebugManagerTable;
use crate::error::{KfdError, KfdResult};
use crate::events::DebugEventQueue;
use crate::kfd::Kfd;
use crate::kfd::device::{
    AsicFamily, DeviceBackend, DeviceRegistry, Fence, KfdDevice, MemId, QueueHwInfo, SchedPolicy,
    TileConfig, VmHandle, WaveState,
};
use crate::kfd::host::{AddressSpace, DrmFile, HostServices, PinnedPages, Task};
use crate::kfd::ioctl::AllocMemoryOfGpuArgs;
use crate::process::{AllocFlags, Process, ProcessRef, ProcessRegistry};
use crate::queues::QueueProperties;
use crate::utils::{PAGE_SHIFT, PAGE_SIZE};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

// ===============================================================================================
// Address space
// ===============================================================================================

/// A flat user address space of `len` bytes starting at `base`.
#[derive(Debug)]
pub struct MockMm {
    base: u64,
    data: Mutex<Vec<u8>>,
    pinned: AtomicU64,
    pin_limit: AtomicU64,
}

impl MockMm {
    pub fn new(base: u64, len: u64) -> Arc<Self> {
        Arc::new(Self {
            base,
            data: Mutex::new(vec![0; len as usize]),
            pinned: AtomicU64::new(0),
            pin_limit: AtomicU64::new(u64::MAX),
        })
    }

    /// Caps how many pages a single pin call hands out.
    pub fn set_pin_limit(&self, pages: u64) {
        self.pin_limit.store(pages, Ordering::SeqCst);
    }

    /// Pages currently pinned.
    pub fn pinned_pages(&self) -> u64 {
        self.pinned.load(Ordering::SeqCst)
    }

    fn span(&self, addr: u64, len: u64, size: usize) -> Option<Range<usize>> {
        let start = addr.checked_sub(self.base)?;
        let end = start.checked_add(len)?;
        (end <= size as u64).then_some(start as usize..end as usize)
    }
}

impl AddressSpace for MockMm {
    fn access_ok(&self, addr: u64, len: u64) -> bool {
        self.span(addr, len, self.data.lock().len()).is_some()
    }

    fn read(&self, addr: u64, buf: &mut [u8]) -> KfdResult<()> {
        let data = self.data.lock();
        let span = self
            .span(addr, buf.len() as u64, data.len())
            .ok_or(KfdError::Fault(addr))?;
        buf.copy_from_slice(&data[span]);
        Ok(())
    }

    fn write(&self, addr: u64, bytes: &[u8]) -> KfdResult<()> {
        let mut data = self.data.lock();
        let size = data.len();
        let span = self
            .span(addr, bytes.len() as u64, size)
            .ok_or(KfdError::Fault(addr))?;
        data[span].copy_from_slice(bytes);
        Ok(())
    }

    fn pin_pages(&self, addr: u64, npages: u64, _write: bool) -> KfdResult<u64> {
        let pinned = (0..npages.min(self.pin_limit.load(Ordering::SeqCst)))
            .take_while(|page| self.access_ok(addr + page * PAGE_SIZE, PAGE_SIZE))
            .count() as u64;
        if pinned == 0 {
            return Err(KfdError::Fault(addr));
        }
        self.pinned.fetch_add(pinned, Ordering::SeqCst);
        Ok(pinned)
    }

    fn unpin_pages(&self, _addr: u64, npages: u64) {
        self.pinned.fetch_sub(npages, Ordering::SeqCst);
    }
}

// ===============================================================================================
// Device backend
// ===============================================================================================

static NEXT_FENCE_CONTEXT: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRecord {
    pub src: MemId,
    pub src_offset: u64,
    pub dst: MemId,
    pub dst_offset: u64,
    pub size: u64,
}

#[derive(Debug, Default)]
struct BackendState {
    next_id: u64,
    vms: HashSet<u64>,
    queues: HashSet<(u32, u32)>,
    /// Live buffers; the flag marks ones that can be mapped into the kernel.
    mems: HashMap<u64, bool>,
    imports: usize,
    maps: usize,
    evictions: usize,
    restores: usize,
    debug_vmid_releases: usize,
    last_cu_mask_len: Option<usize>,
    copies: Vec<CopyRecord>,
    fail_free: bool,
    fail_map: bool,
    fail_evict: bool,
    hold_fences: bool,
    fence_seqno: u64,
}

impl BackendState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Records what the core asks of a device and fails on request.
#[derive(Debug)]
pub struct MockBackend {
    fence_context: u64,
    state: Mutex<BackendState>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fence_context: NEXT_FENCE_CONTEXT.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(BackendState::default()),
        })
    }

    pub fn live_vms(&self) -> usize {
        self.state.lock().vms.len()
    }

    pub fn live_queues(&self) -> usize {
        self.state.lock().queues.len()
    }

    pub fn live_allocations(&self) -> usize {
        self.state.lock().mems.len()
    }

    pub fn imports(&self) -> usize {
        self.state.lock().imports
    }

    pub fn map_count(&self) -> usize {
        self.state.lock().maps
    }

    pub fn evictions(&self) -> usize {
        self.state.lock().evictions
    }

    pub fn restores(&self) -> usize {
        self.state.lock().restores
    }

    pub fn debug_vmid_releases(&self) -> usize {
        self.state.lock().debug_vmid_releases
    }

    pub fn last_cu_mask_len(&self) -> Option<usize> {
        self.state.lock().last_cu_mask_len
    }

    pub fn copies(&self) -> Vec<CopyRecord> {
        self.state.lock().copies.clone()
    }

    pub fn fail_next_free(&self) {
        self.state.lock().fail_free = true;
    }

    pub fn fail_next_map(&self) {
        self.state.lock().fail_map = true;
    }

    pub fn fail_next_evict(&self) {
        self.state.lock().fail_evict = true;
    }

    /// Leaves copy fences unsignaled.
    pub fn hold_fences(&self, hold: bool) {
        self.state.lock().hold_fences = hold;
    }
}

impl DeviceBackend for MockBackend {
    fn create_process_vm(&self, _pasid: u32) -> KfdResult<VmHandle> {
        let mut state = self.state.lock();
        let id = state.next_id();
        state.vms.insert(id);
        Ok(VmHandle(id))
    }

    fn acquire_process_vm(&self, _drm: DrmFile, pasid: u32) -> KfdResult<VmHandle> {
        self.create_process_vm(pasid)
    }

    fn destroy_process_vm(&self, vm: VmHandle) {
        self.state.lock().vms.remove(&vm.0);
    }

    fn alloc_memory(
        &self,
        _vm: VmHandle,
        _va: u64,
        _size: u64,
        flags: AllocFlags,
        _cpu_addr: Option<u64>,
    ) -> KfdResult<(MemId, u64)> {
        let mut state = self.state.lock();
        let id = state.next_id();
        state.mems.insert(id, flags.gtt || flags.userptr);
        Ok((MemId(id), id << PAGE_SHIFT))
    }

    fn free_memory(&self, mem: MemId) -> KfdResult<()> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_free) {
            return Err(KfdError::Device("injected free failure".into()));
        }
        state
            .mems
            .remove(&mem.0)
            .map(|_| ())
            .ok_or(KfdError::InvalidArgument("unknown buffer"))
    }

    fn map_memory(&self, _mem: MemId, _vm: VmHandle) -> KfdResult<()> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_map) {
            return Err(KfdError::Device("injected map failure".into()));
        }
        state.maps += 1;
        Ok(())
    }

    fn unmap_memory(&self, _mem: MemId, _vm: VmHandle) -> KfdResult<()> {
        Ok(())
    }

    fn import_pinned_pages(&self, _vm: VmHandle, _pages: &PinnedPages) -> KfdResult<MemId> {
        let mut state = self.state.lock();
        let id = state.next_id();
        state.mems.insert(id, true);
        state.imports += 1;
        Ok(MemId(id))
    }

    fn map_gtt_bo_to_kernel(&self, mem: MemId) -> KfdResult<u64> {
        match self.state.lock().mems.get(&mem.0) {
            Some(true) => Ok(0xffff_8000_0000_0000 | (mem.0 << PAGE_SHIFT)),
            _ => Err(KfdError::InvalidArgument("not a GTT buffer")),
        }
    }

    fn copy_mem_to_mem(
        &self,
        src: MemId,
        src_offset: u64,
        dst: MemId,
        dst_offset: u64,
        size: u64,
    ) -> KfdResult<(Fence, u64)> {
        let mut state = self.state.lock();
        state.copies.push(CopyRecord {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        });
        state.fence_seqno += 1;
        let fence = if state.hold_fences {
            Fence::new(self.fence_context, state.fence_seqno)
        } else {
            Fence::signaled(self.fence_context, state.fence_seqno)
        };
        Ok((fence, size))
    }

    fn flush_tlb_vmid(&self, _vmid: u32) {}

    fn flush_tlb_pasid(&self, _pasid: u32) {}

    fn create_queue(&self, pasid: u32, props: &QueueProperties) -> KfdResult<QueueHwInfo> {
        self.state.lock().queues.insert((pasid, props.queue_id));
        Ok(QueueHwInfo {
            doorbell_off: props.queue_id * 2,
            vmid: None,
        })
    }

    fn destroy_queue(&self, pasid: u32, queue_id: u32) -> KfdResult<()> {
        self.state.lock().queues.remove(&(pasid, queue_id));
        Ok(())
    }

    fn update_queue(&self, _pasid: u32, props: &QueueProperties) -> KfdResult<()> {
        self.state.lock().last_cu_mask_len = Some(props.cu_mask.len());
        Ok(())
    }

    fn evict_process_queues(&self, _pasid: u32) -> KfdResult<()> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_evict) {
            return Err(KfdError::Device("injected evict failure".into()));
        }
        state.evictions += 1;
        Ok(())
    }

    fn restore_process_queues(&self, _pasid: u32) -> KfdResult<()> {
        self.state.lock().restores += 1;
        Ok(())
    }

    fn get_wave_state(&self, _pasid: u32, _queue_id: u32) -> KfdResult<WaveState> {
        Ok(WaveState {
            ctl_stack: vec![0xab; 64],
            save_area_used_size: 0x100,
        })
    }

    fn release_debug_vmid(&self) -> KfdResult<()> {
        self.state.lock().debug_vmid_releases += 1;
        Ok(())
    }

    fn gpu_clock_counter(&self) -> u64 {
        0x1234_5678
    }

    fn tile_config(&self) -> TileConfig {
        TileConfig {
            tile_config: vec![0x10, 0x11, 0x12, 0x13],
            macro_tile_config: vec![0x20, 0x21],
            gb_addr_config: 0x2401_0042,
            num_banks: 16,
            num_ranks: 2,
        }
    }

    fn doorbell_page_addr(&self, index: u32) -> u64 {
        0xd000_0000 + u64::from(index) * 2 * PAGE_SIZE
    }

    fn mmio_remap_addr(&self) -> u64 {
        0xe000_0000
    }
}

// ===============================================================================================
// Host
// ===============================================================================================

#[derive(Debug, Default)]
pub struct MockHost {
    tasks: Mutex<HashMap<u32, Task>>,
    installed_fds: AtomicUsize,
    fail_fd_install: AtomicBool,
}

impl MockHost {
    pub fn add_task(&self, task: Task) {
        self.tasks.lock().insert(task.tgid, task);
    }

    pub fn installed_fds(&self) -> usize {
        self.installed_fds.load(Ordering::SeqCst)
    }

    pub fn fail_next_fd_install(&self) {
        self.fail_fd_install.store(true, Ordering::SeqCst);
    }
}

impl HostServices for MockHost {
    fn find_task(&self, pid: u32) -> Option<Task> {
        self.tasks.lock().get(&pid).cloned()
    }

    fn mm_access(&self, _caller: &Task, target: &Task) -> KfdResult<Arc<dyn AddressSpace>> {
        Ok(Arc::clone(&target.mm))
    }

    fn drm_file(&self, fd: u32) -> Option<DrmFile> {
        matches!(fd, 5 | 6).then_some(DrmFile(u64::from(fd)))
    }

    fn install_debug_event_fd(&self, _queue: Arc<DebugEventQueue>) -> KfdResult<i32> {
        if self.fail_fd_install.swap(false, Ordering::SeqCst) {
            return Err(KfdError::Device("no free file descriptors".into()));
        }
        let installed = self.installed_fds.fetch_add(1, Ordering::SeqCst);
        Ok(3 + installed as i32)
    }

    fn raw_monotonic_ns(&self) -> u64 {
        1_000_000
    }

    fn boottime_ns(&self) -> u64 {
        2_000_000
    }
}

// ===============================================================================================
// Test bed
// ===============================================================================================

const USER_MM_SIZE: u64 = 0x40_0000;

/// Four devices behind a [`Kfd`]: two Vega10s (`a` with GWS), a Fiji and a
/// Vega10 without hardware scheduling.
pub struct TestBed {
    pub gpu_a: u32,
    pub gpu_b: u32,
    pub gpu_legacy: u32,
    pub gpu_no_hws: u32,
    pub backend_a: Arc<MockBackend>,
    pub backend_b: Arc<MockBackend>,
    pub device_a: Arc<KfdDevice>,
    pub device_b: Arc<KfdDevice>,
    pub devices: Arc<DeviceRegistry>,
    pub processes: ProcessRegistry,
    pub debug_managers: Arc<DebugManagerTable>,
    pub host: Arc<MockHost>,
    kfd: Kfd,
    mms: Mutex<HashMap<u32, Arc<MockMm>>>,
}

impl TestBed {
    pub fn new() -> Self {
        Self::with_config(KfdConfig::default())
    }

    pub fn with_config(config: KfdConfig) -> Self {
        let backend_a = MockBackend::new();
        let backend_b = MockBackend::new();

        let mut registry = DeviceRegistry::new();
        let device_a = registry
            .register(KfdDevice::new(0x1001, AsicFamily::Vega10, backend_a.clone()).with_gws(64))
            .unwrap();
        let device_b = registry
            .register(KfdDevice::new(0x1002, AsicFamily::Vega10, backend_b.clone()).with_node_index(1))
            .unwrap();
        let legacy = registry
            .register(KfdDevice::new(0x1003, AsicFamily::Fiji, MockBackend::new()).with_node_index(2))
            .unwrap();
        let no_hws = registry
            .register(
                KfdDevice::new(0x1004, AsicFamily::Vega10, MockBackend::new())
                    .with_node_index(3)
                    .with_sched_policy(SchedPolicy::NoHws)
                    .with_gws(64),
            )
            .unwrap();

        let host = Arc::new(MockHost::default());
        let kfd = Kfd::new(config, registry, host.clone());

        Self {
            gpu_a: device_a.gpu_id,
            gpu_b: device_b.gpu_id,
            gpu_legacy: legacy.gpu_id,
            gpu_no_hws: no_hws.gpu_id,
            backend_a,
            backend_b,
            device_a,
            device_b,
            devices: Arc::clone(kfd.devices()),
            processes: kfd.processes().clone(),
            debug_managers: Arc::clone(kfd.debug_managers()),
            host,
            kfd,
            mms: Mutex::new(HashMap::new()),
        }
    }

    pub fn kfd(&self) -> &Kfd {
        &self.kfd
    }

    /// The address space of thread group `tgid`, created on first use.
    pub fn mm(&self, tgid: u32) -> Arc<MockMm> {
        Arc::clone(
            self.mms
                .lock()
                .entry(tgid)
                .or_insert_with(|| MockMm::new(0, USER_MM_SIZE)),
        )
    }

    pub fn task(&self, tgid: u32) -> Task {
        Task::new(tgid, self.mm(tgid))
    }

    /// Opens the device for `tgid`, registering the task with the host first.
    pub fn open(&self, tgid: u32) -> ProcessRef {
        let task = self.task(tgid);
        if self.host.find_task(tgid).is_none() {
            self.host.add_task(task.clone());
        }
        self.kfd.processes().create_or_get(&task).unwrap()
    }

    pub fn alloc_vram(&self, process: &Process, gpu_id: u32, va: u64, size: u64) -> u64 {
        self.alloc(process, gpu_id, va, size, AllocFlags::new().vram().writable(), 0)
    }

    pub fn alloc_gtt(&self, process: &Process, gpu_id: u32, va: u64, size: u64) -> u64 {
        self.alloc(process, gpu_id, va, size, AllocFlags::new().gtt().writable(), 0)
    }

    pub fn alloc_userptr(&self, process: &Process, gpu_id: u32, va: u64, size: u64, cpu_addr: u64) -> u64 {
        self.alloc(process, gpu_id, va, size, AllocFlags::new().userptr().writable(), cpu_addr)
    }

    fn alloc(&self, process: &Process, gpu_id: u32, va: u64, size: u64, flags: AllocFlags, mmap_offset: u64) -> u64 {
        let args = AllocMemoryOfGpuArgs {
            va_addr: va,
            size,
            mmap_offset,
            gpu_id,
            flags: flags.to_ioctl_flags(),
            ..Default::default()
        };
        process.alloc_memory_of_gpu(&self.devices, &args).unwrap().handle
    }
}
