//! The device file: open, ioctl dispatch, mmap and the power-management hooks.

use crate::config::KfdConfig;
use crate::debug::DebugManagerTable;
use crate::debug::legacy::{
    check_address_watch_size, check_wave_control_size, parse_address_watch, parse_wave_control,
};
use crate::error::{KfdError, KfdResult};
use crate::events::SignalPageSource;
use crate::kfd::device::{DeviceRegistry, KfdDevice};
use crate::kfd::host::{HostServices, Task, copy_array_from_user, copy_to_user};
use crate::kfd::ioctl::{
    DbgAddressWatchArgs, EventData, GetClockCountersArgs, GetProcessAperturesArgs,
    GetProcessAperturesNewArgs, GetTileConfigArgs, KFD_IOCTL_MAJOR_VERSION,
    KFD_IOCTL_MINOR_VERSION, KFD_MMAP_TYPE_DOORBELL, KFD_MMAP_TYPE_EVENTS, KFD_MMAP_TYPE_MASK,
    KFD_MMAP_TYPE_MMIO, KFD_MMAP_TYPE_RESERVED_MEM, NUM_OF_SUPPORTED_GPUS, mmap_get_gpu_id,
};
use crate::kfd::request::{Frame, Request, is_known_nr, kernel_cmd};
use crate::process::pdd::ProcessDevice;
use crate::process::{ProcessRef, ProcessRegistry};
use crate::queues::MAX_CU_MASK_BITS;
use crate::utils::{PAGE_SIZE, ioc_nr};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Size of the trap-handler buffers mapped through the reserved-memory window.
const RESERVED_MEM_SIZE: u64 = 2 * PAGE_SIZE;

const SYSTEM_CLOCK_FREQ_HZ: u64 = 1_000_000_000;

// ===============================================================================================
// Context
// ===============================================================================================

/// One KFD instance: the devices, the processes that opened the file and the
/// host it runs on.
pub struct Kfd {
    config: KfdConfig,
    devices: Arc<DeviceRegistry>,
    processes: ProcessRegistry,
    debug_managers: Arc<DebugManagerTable>,
    host: Arc<dyn HostServices>,
    /// Set while the driver is suspended; opens fail with `TryAgain`.
    locked: AtomicBool,
}

impl fmt::Debug for Kfd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kfd")
            .field("config", &self.config)
            .field("devices", &self.devices.len())
            .field("processes", &self.processes.len())
            .field("locked", &self.locked.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// An open handle on the device file. Closing it drops the process reference.
#[derive(Debug)]
pub struct KfdFile {
    process: ProcessRef,
    opener_tgid: u32,
}

impl KfdFile {
    #[must_use]
    pub const fn process(&self) -> &ProcessRef {
        &self.process
    }

    pub fn close(self) {
        tracing::debug!(pasid = self.process.pasid(), tgid = self.opener_tgid, "closing device file");
    }
}

impl Drop for KfdFile {
    fn drop(&mut self) {
        // Once this handle is gone only debug sessions would keep the process alive.
        let sessions = self.process.debug_session_count();
        if sessions > 0 && self.process.refcount() == sessions + 1 {
            self.process.release_debug_sessions();
        }
    }
}

/// What an mmap offset resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmapTarget {
    /// The process's doorbell page on a device.
    Doorbell { gpu_id: u32, addr: u64 },
    /// The process signal page.
    Events { source: SignalPageSource },
    /// Trap-handler buffers of the binding on `gpu_id`.
    ReservedMem { gpu_id: u32 },
    /// The device's MMIO remap page.
    Mmio { gpu_id: u32, addr: u64 },
}

impl Kfd {
    #[must_use]
    pub fn new(config: KfdConfig, devices: DeviceRegistry, host: Arc<dyn HostServices>) -> Self {
        let debug_managers = Arc::new(DebugManagerTable::new());
        tracing::info!(devices = devices.len(), "KFD initialized");
        Self {
            config,
            devices: Arc::new(devices),
            processes: ProcessRegistry::new(config, Arc::clone(&debug_managers)),
            debug_managers,
            host,
            locked: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &KfdConfig {
        &self.config
    }

    #[must_use]
    pub const fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    #[must_use]
    pub const fn processes(&self) -> &ProcessRegistry {
        &self.processes
    }

    #[must_use]
    pub const fn debug_managers(&self) -> &Arc<DebugManagerTable> {
        &self.debug_managers
    }

    #[must_use]
    pub fn host(&self) -> &dyn HostServices {
        self.host.as_ref()
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    // ===============================================================================================
    // File operations
    // ===============================================================================================

    /// Opens the device file for `task`, creating its process record on first use.
    ///
    /// # Errors
    /// `PermissionDenied` for 32-bit compat tasks, `TryAgain` while suspended.
    pub fn open(&self, task: &Task) -> KfdResult<KfdFile> {
        let process = self.processes.create_or_get(task)?;
        if self.is_locked() {
            tracing::debug!(tgid = task.tgid, "device is suspended, refusing open");
            return Err(KfdError::TryAgain);
        }
        tracing::debug!(pasid = process.pasid(), tgid = task.tgid, "opened device file");
        Ok(KfdFile {
            process,
            opener_tgid: task.tgid,
        })
    }

    /// Runs the ioctl `cmd` with the argument blob `arg`.
    ///
    /// Only the size encoded in `cmd` is read from and written back to `arg`,
    /// so callers built against older or newer argument layouts interoperate.
    /// Outputs are written back also when the handler fails.
    ///
    /// # Errors
    /// `InvalidArgument` for unknown commands, `BadFile` when the caller is not
    /// the thread group that opened the file, `Fault` for a short blob, and
    /// whatever the handler reports.
    pub fn ioctl(&self, file: &KfdFile, caller: &Task, cmd: u32, arg: &mut [u8]) -> KfdResult<i32> {
        let nr = ioc_nr(cmd);
        if !is_known_nr(nr) {
            tracing::debug!(nr, "ioctl number out of range");
            return Err(KfdError::InvalidArgument("unknown ioctl"));
        }
        if caller.tgid != file.opener_tgid {
            tracing::debug!(nr, caller = caller.tgid, opener = file.opener_tgid, "ioctl from foreign process");
            return Err(KfdError::BadFile);
        }
        let kcmd = kernel_cmd(cmd).ok_or(KfdError::InvalidArgument("no handler for ioctl"))?;

        let mut frame = Frame::decode(cmd, kcmd, arg)?;
        tracing::debug!(nr, name = frame.request.name(), pid = caller.tgid, "ioctl");
        let result = self.dispatch(&file.process, caller, &mut frame.request);
        frame.write_back(arg);

        if let Err(err) = &result {
            tracing::debug!(nr, name = frame.request.name(), errno = err.errno(), %err, "ioctl failed");
        }
        result
    }

    /// Resolves an mmap of `len` bytes at `offset`.
    ///
    /// # Errors
    /// `BadFile` for a foreign caller, `NoSuchDevice` for a doorbell or MMIO
    /// offset naming an unknown GPU, `InvalidArgument` for a wrong length or a
    /// missing binding or signal page.
    pub fn mmap(&self, file: &KfdFile, caller: &Task, offset: u64, len: u64) -> KfdResult<MmapTarget> {
        if caller.tgid != file.opener_tgid {
            return Err(KfdError::BadFile);
        }
        let process = &file.process;
        let gpu_id = mmap_get_gpu_id(offset);

        match offset & KFD_MMAP_TYPE_MASK {
            KFD_MMAP_TYPE_DOORBELL => {
                let device = self.devices.lookup(gpu_id)?;
                if len != device.doorbell_process_slice() {
                    return Err(KfdError::InvalidArgument("doorbell mapping size"));
                }
                let index = process
                    .state
                    .lock()
                    .pdds
                    .get(&gpu_id)
                    .map(ProcessDevice::doorbell_index)
                    .ok_or(KfdError::InvalidArgument("process not bound to device"))?;
                Ok(MmapTarget::Doorbell {
                    gpu_id,
                    addr: device.backend().doorbell_page_addr(index),
                })
            }
            KFD_MMAP_TYPE_EVENTS => {
                let expected = (u64::from(self.config.signal_event_limit) * 8).next_multiple_of(PAGE_SIZE);
                if len != expected {
                    return Err(KfdError::InvalidArgument("event page mapping size"));
                }
                let events = process.events.lock();
                let page = events
                    .signal_page()
                    .ok_or(KfdError::InvalidArgument("no signal page"))?;
                Ok(MmapTarget::Events {
                    source: page.source(),
                })
            }
            KFD_MMAP_TYPE_RESERVED_MEM => {
                if len != RESERVED_MEM_SIZE {
                    return Err(KfdError::InvalidArgument("reserved memory mapping size"));
                }
                self.devices.lookup(gpu_id)?;
                let mut state = process.state.lock();
                let pdd = state
                    .pdds
                    .get_mut(&gpu_id)
                    .ok_or(KfdError::InvalidArgument("process not bound to device"))?;
                pdd.reserved_mem_mapped = true;
                Ok(MmapTarget::ReservedMem { gpu_id })
            }
            KFD_MMAP_TYPE_MMIO => {
                let device = self.devices.lookup(gpu_id)?;
                if len != PAGE_SIZE {
                    return Err(KfdError::InvalidArgument("MMIO mapping size"));
                }
                Ok(MmapTarget::Mmio {
                    gpu_id,
                    addr: device.backend().mmio_remap_addr(),
                })
            }
            _ => Err(KfdError::InvalidArgument("mmap type")),
        }
    }

    /// Called when the address space of thread group `tgid` goes away. Ends
    /// its debug sessions, which drops the references they hold on the
    /// process.
    pub fn process_exit(&self, tgid: u32) {
        let Some(process) = self.processes.lookup_by_tgid(tgid) else {
            return;
        };
        let released = process.release_debug_sessions();
        tracing::debug!(pasid = process.pasid(), tgid, released, "process address space released");
    }

    // ===============================================================================================
    // Power management and interrupts
    // ===============================================================================================

    /// Locks out new opens and evicts the queues of every process.
    pub fn suspend_all(&self) {
        if self.locked.swap(true, Ordering::AcqRel) {
            return;
        }
        for process in self.processes.all() {
            if let Err(err) = process.evict_queues() {
                tracing::error!(pasid = process.pasid(), %err, "failed to suspend process queues");
            }
        }
        tracing::info!("KFD suspended");
    }

    /// Restores every process and accepts opens again.
    ///
    /// # Errors
    /// The first restore failure; the remaining processes are still restored.
    pub fn resume_all(&self) -> KfdResult<()> {
        if !self.is_locked() {
            return Ok(());
        }
        let mut result = Ok(());
        for process in self.processes.all() {
            if let Err(err) = process.restore_queues() {
                tracing::error!(pasid = process.pasid(), %err, "failed to resume process queues");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        self.locked.store(false, Ordering::Release);
        tracing::info!("KFD resumed");
        result
    }

    /// Routes a trap or VM-fault interrupt to the debugger of `pasid`.
    ///
    /// Returns false if the process is gone, not debugged on `gpu_id`, or the
    /// event was dropped.
    pub fn dispatch_debug_event(&self, gpu_id: u32, pasid: u32, doorbell_id: u32, is_vmfault: bool) -> bool {
        let Ok(process) = self.processes.lookup_by_pasid(pasid) else {
            tracing::debug!(gpu_id, pasid, "debug event for unknown process");
            return false;
        };
        if !process.is_debug_trap_enabled(gpu_id) {
            return false;
        }
        let recorded = process
            .events
            .lock()
            .record_debug_event(gpu_id, doorbell_id, is_vmfault);
        drop(process);
        recorded
    }

    // ===============================================================================================
    // Dispatch
    // ===============================================================================================

    fn dispatch(&self, process: &ProcessRef, caller: &Task, request: &mut Request) -> KfdResult<i32> {
        let devices: &DeviceRegistry = &self.devices;
        match request {
            Request::GetVersion(args) => {
                args.major_version = KFD_IOCTL_MAJOR_VERSION;
                args.minor_version = KFD_IOCTL_MINOR_VERSION;
            }
            Request::CreateQueue(args) => {
                let created = process.create_queue(devices, args)?;
                args.queue_id = created.queue_id;
                args.doorbell_offset = created.doorbell_offset;
            }
            Request::DestroyQueue(args) => process.destroy_queue(args.queue_id)?,
            Request::SetMemoryPolicy(args) => process.set_memory_policy(devices, args)?,
            Request::GetClockCounters(args) => self.get_clock_counters(args),
            Request::GetProcessApertures(args) => get_process_apertures(process, args),
            Request::UpdateQueue(args) => process.update_queue(args)?,
            Request::CreateEvent(args) => {
                let created = process.create_event(devices, args)?;
                args.event_id = created.event_id;
                args.event_trigger_data = created.trigger_data;
                args.event_page_offset = created.page_offset;
                args.event_slot_index = created.slot_index;
            }
            Request::DestroyEvent(args) => process.destroy_event(args.event_id)?,
            Request::SetEvent(args) => process.set_event(args.event_id)?,
            Request::ResetEvent(args) => process.reset_event(args.event_id)?,
            Request::WaitEvents(args) => {
                let events: Vec<EventData> =
                    copy_array_from_user(caller.mm.as_ref(), args.events_ptr, args.num_events as usize)?;
                let ids: Vec<u32> = events.iter().map(|event| event.event_id).collect();
                let outcome = process.wait_on_events(&ids, args.wait_for_all != 0, args.timeout)?;
                args.wait_result = outcome.wait_result;
            }
            Request::DbgRegister(args) => {
                let device = legacy_debug_device(devices, args.gpu_id)?;
                process.dbg_register(&self.debug_managers, &device)?;
            }
            Request::DbgUnregister(args) => {
                let device = legacy_debug_device(devices, args.gpu_id)?;
                process.dbg_unregister(&self.debug_managers, &device)?;
            }
            Request::DbgAddressWatch(args) => {
                let device = legacy_debug_device(devices, args.gpu_id)?;
                check_address_watch_size(args.buf_size_in_bytes)?;
                let payload = read_debug_payload(caller, args.content_ptr, args.buf_size_in_bytes)?;
                let info = parse_address_watch(&payload)?;
                self.debug_managers
                    .address_watch(&device, process.pasid(), &info)?;
            }
            Request::DbgWaveControl(args) => {
                let device = legacy_debug_device(devices, args.gpu_id)?;
                check_wave_control_size(args.buf_size_in_bytes)?;
                let payload = read_debug_payload(caller, args.content_ptr, args.buf_size_in_bytes)?;
                let info = parse_wave_control(&payload)?;
                self.debug_managers
                    .wave_control(&device, process.pasid(), &info)?;
            }
            Request::SetScratchBackingVa(args) => {
                process.set_scratch_backing_va(devices, args.gpu_id, args.va_addr)?;
            }
            Request::GetTileConfig(args) => get_tile_config(devices, caller, args)?,
            Request::SetTrapHandler(args) => {
                process.set_trap_handler(devices, args.gpu_id, args.tba_addr, args.tma_addr)?;
            }
            Request::GetProcessAperturesNew(args) => get_process_apertures_new(process, caller, args)?,
            Request::AcquireVm(args) => {
                let drm = self
                    .host
                    .drm_file(args.drm_fd)
                    .ok_or(KfdError::InvalidArgument("drm_fd is not a render node"))?;
                process.acquire_vm(devices, args.gpu_id, drm)?;
            }
            Request::AllocMemoryOfGpu(args) => {
                let allocated = process.alloc_memory_of_gpu(devices, args)?;
                args.handle = allocated.handle;
                args.mmap_offset = allocated.mmap_offset;
            }
            Request::FreeMemoryOfGpu(args) => process.free_memory_of_gpu(devices, args.handle)?,
            Request::MapMemoryToGpu(args) => {
                let ids = read_device_ids(caller, args.device_ids_array_ptr, args.n_devices)?;
                let outcome = process.map_memory_to_gpu(devices, args.handle, &ids, args.n_success);
                args.n_success = outcome.n_success;
                outcome.result?;
            }
            Request::UnmapMemoryFromGpu(args) => {
                let ids = read_device_ids(caller, args.device_ids_array_ptr, args.n_devices)?;
                let outcome = process.unmap_memory_from_gpu(devices, args.handle, &ids, args.n_success);
                args.n_success = outcome.n_success;
                outcome.result?;
            }
            Request::SetCuMask(args) => {
                // Malformed lengths are rejected by the queue layer before the mask is used.
                let mask = if args.num_cu_mask != 0 && args.num_cu_mask % 32 == 0 {
                    let words = args.num_cu_mask.min(MAX_CU_MASK_BITS) / 32;
                    copy_array_from_user(caller.mm.as_ref(), args.cu_mask_ptr, words as usize)?
                } else {
                    Vec::new()
                };
                process.set_cu_mask(args.queue_id, args.num_cu_mask, &mask)?;
            }
            Request::GetQueueWaveState(args) => {
                let (ctl_stack_used, save_area_used) =
                    process.get_queue_wave_state(args.queue_id, args.ctl_stack_address)?;
                args.ctl_stack_used_size = ctl_stack_used;
                args.save_area_used_size = save_area_used;
            }
            Request::AllocQueueGws(args) => {
                args.first_gws = process.alloc_queue_gws(args.queue_id, args.num_gws)?;
            }
            Request::DbgTrap(args) => {
                let count = self.dbg_trap(process, caller, args)?;
                return i32::try_from(count).map_err(|_| KfdError::InvalidArgument("queue count"));
            }
            Request::CrossMemoryCopy(args) => self.cross_memory_copy(process, caller, args)?,
        }
        Ok(0)
    }

    fn get_clock_counters(&self, args: &mut GetClockCountersArgs) {
        // An unknown GPU reads as zero rather than failing the whole query.
        args.gpu_clock_counter = self
            .devices
            .lookup(args.gpu_id)
            .map_or(0, |device| device.backend().gpu_clock_counter());
        args.cpu_clock_counter = self.host.raw_monotonic_ns();
        args.system_clock_counter = self.host.boottime_ns();
        args.system_clock_freq = SYSTEM_CLOCK_FREQ_HZ;
    }
}

// ===============================================================================================
// Handler helpers
// ===============================================================================================

fn legacy_debug_device(devices: &DeviceRegistry, gpu_id: u32) -> KfdResult<Arc<KfdDevice>> {
    devices.lookup(gpu_id).map_err(|_| {
        tracing::debug!(gpu_id, "legacy debugger call for unknown gpu");
        KfdError::InvalidArgument("unknown gpu id")
    })
}

/// Reads the variable part of a legacy debugger request. `buf_size`
/// includes the fixed header.
fn read_debug_payload(caller: &Task, content_ptr: u64, buf_size: u32) -> KfdResult<Vec<u8>> {
    let header = size_of::<DbgAddressWatchArgs>();
    let len = (buf_size as usize).saturating_sub(header);
    copy_array_from_user(caller.mm.as_ref(), content_ptr, len)
}

fn read_device_ids(caller: &Task, ptr: u64, n_devices: u32) -> KfdResult<Vec<u32>> {
    if n_devices == 0 {
        return Ok(Vec::new());
    }
    copy_array_from_user(caller.mm.as_ref(), ptr, n_devices as usize)
}

fn get_process_apertures(process: &ProcessRef, args: &mut GetProcessAperturesArgs) {
    let apertures = process.apertures();
    let count = apertures.len().min(NUM_OF_SUPPORTED_GPUS);
    args.process_apertures[..count].copy_from_slice(&apertures[..count]);
    args.num_of_nodes = count as u32;
}

/// With `num_of_nodes == 0` only the number of bound devices is reported.
fn get_process_apertures_new(
    process: &ProcessRef,
    caller: &Task,
    args: &mut GetProcessAperturesNewArgs,
) -> KfdResult<()> {
    let apertures = process.apertures();
    if args.num_of_nodes == 0 {
        args.num_of_nodes = apertures.len() as u32;
        return Ok(());
    }
    let count = apertures.len().min(args.num_of_nodes as usize);
    copy_to_user(
        caller.mm.as_ref(),
        args.kfd_process_device_apertures_ptr,
        &apertures[..count],
    )?;
    args.num_of_nodes = count as u32;
    Ok(())
}

/// Copies as many tile configs as the caller has room for. A zero count
/// reports how many the device has.
fn get_tile_config(devices: &DeviceRegistry, caller: &Task, args: &mut GetTileConfigArgs) -> KfdResult<()> {
    let device = devices
        .lookup(args.gpu_id)
        .map_err(|_| KfdError::InvalidArgument("unknown gpu id"))?;
    let config = device.backend().tile_config();

    args.gb_addr_config = config.gb_addr_config;
    args.num_banks = config.num_banks;
    args.num_ranks = config.num_ranks;

    if args.num_tile_configs == 0 {
        args.num_tile_configs = config.tile_config.len() as u32;
    } else {
        let count = config.tile_config.len().min(args.num_tile_configs as usize);
        copy_to_user(caller.mm.as_ref(), args.tile_config_ptr, &config.tile_config[..count])?;
        args.num_tile_configs = count as u32;
    }

    if args.num_macro_tile_configs == 0 {
        args.num_macro_tile_configs = config.macro_tile_config.len() as u32;
    } else {
        let count = config
            .macro_tile_config
            .len()
            .min(args.num_macro_tile_configs as usize);
        copy_to_user(
            caller.mm.as_ref(),
            args.macro_tile_config_ptr,
            &config.macro_tile_config[..count],
        )?;
        args.num_macro_tile_configs = count as u32;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kfd::ioctl::{
        AMDKFD_IOC_CREATE_QUEUE, AMDKFD_IOC_DBG_TRAP, AMDKFD_IOC_GET_PROCESS_APERTURES_NEW,
        AMDKFD_IOC_GET_TILE_CONFIG, AMDKFD_IOC_GET_VERSION, CreateEventArgs, CreateQueueArgs,
        DbgTrapArgs, KFD_IOC_DBG_TRAP_ENABLE, KFD_IOC_EVENT_SIGNAL, KFD_IOC_QUEUE_TYPE_COMPUTE_AQL,
        KFD_IOCTL_BASE, ProcessDeviceApertures, mmap_gpu_id,
    };
    use crate::kfd::device::DeviceBackend;
    use crate::testutil::TestBed;
    use crate::utils::io;
    use zerocopy::{FromBytes, IntoBytes};

    fn queue_args(gpu_id: u32) -> CreateQueueArgs {
        CreateQueueArgs {
            ring_base_address: 0x1000,
            ring_size: 0x1000,
            read_pointer_address: 0x2000,
            write_pointer_address: 0x2008,
            queue_type: KFD_IOC_QUEUE_TYPE_COMPUTE_AQL,
            queue_percentage: 100,
            gpu_id,
            ..Default::default()
        }
    }

    #[test]
    fn open_rejects_compat_tasks_and_suspended_driver() {
        let bed = TestBed::new();
        let kfd = bed.kfd();

        let compat = bed.task(100).with_compat(true);
        assert!(matches!(kfd.open(&compat), Err(KfdError::PermissionDenied(_))));

        kfd.suspend_all();
        assert!(matches!(kfd.open(&bed.task(100)), Err(KfdError::TryAgain)));
        assert!(bed.processes.is_empty());

        kfd.resume_all().unwrap();
        let file = kfd.open(&bed.task(100)).unwrap();
        assert_eq!(file.process().tgid(), 100);
        file.close();
        assert!(bed.processes.is_empty());
    }

    #[test]
    fn version_through_raw_bytes() {
        let bed = TestBed::new();
        let kfd = bed.kfd();
        let caller = bed.task(100);
        let file = kfd.open(&caller).unwrap();

        let mut blob = [0xffu8; 8];
        assert_eq!(kfd.ioctl(&file, &caller, AMDKFD_IOC_GET_VERSION, &mut blob), Ok(0));
        assert_eq!(u32::from_ne_bytes(blob[..4].try_into().unwrap()), KFD_IOCTL_MAJOR_VERSION);
        assert_eq!(u32::from_ne_bytes(blob[4..].try_into().unwrap()), KFD_IOCTL_MINOR_VERSION);
    }

    #[test]
    fn foreign_caller_and_unknown_commands_are_rejected() {
        let bed = TestBed::new();
        let kfd = bed.kfd();
        let file = kfd.open(&bed.task(100)).unwrap();
        let mut blob = [0u8; 8];

        assert_eq!(
            kfd.ioctl(&file, &bed.task(200), AMDKFD_IOC_GET_VERSION, &mut blob),
            Err(KfdError::BadFile)
        );
        let caller = bed.task(100);
        assert!(matches!(
            kfd.ioctl(&file, &caller, io(KFD_IOCTL_BASE, 0x40), &mut blob),
            Err(KfdError::InvalidArgument(_))
        ));
        assert!(matches!(
            kfd.ioctl(&file, &caller, io(KFD_IOCTL_BASE, 0x1C), &mut blob),
            Err(KfdError::InvalidArgument(_))
        ));
        assert!(matches!(
            kfd.ioctl(&file, &caller, AMDKFD_IOC_CREATE_QUEUE, &mut blob),
            Err(KfdError::Fault(_))
        ));
    }

    #[test]
    fn create_queue_writes_outputs_back() {
        let bed = TestBed::new();
        let kfd = bed.kfd();
        let caller = bed.task(100);
        let file = kfd.open(&caller).unwrap();

        let mut blob = queue_args(bed.gpu_a).as_bytes().to_vec();
        kfd.ioctl(&file, &caller, AMDKFD_IOC_CREATE_QUEUE, &mut blob).unwrap();
        kfd.ioctl(&file, &caller, AMDKFD_IOC_CREATE_QUEUE, &mut blob).unwrap();

        let args = CreateQueueArgs::read_from_bytes(&blob).unwrap();
        assert_eq!(args.queue_id, 1);
        assert_eq!(args.doorbell_offset & KFD_MMAP_TYPE_MASK, KFD_MMAP_TYPE_DOORBELL);
        assert_eq!(bed.backend_a.live_queues(), 2);
    }

    #[test]
    fn apertures_report_count_then_entries() {
        let bed = TestBed::new();
        let kfd = bed.kfd();
        let caller = bed.task(100);
        let file = kfd.open(&caller).unwrap();
        file.process().bind_device(&bed.device_a).unwrap();
        file.process().bind_device(&bed.device_b).unwrap();

        let mut args = GetProcessAperturesNewArgs::default();
        let mut blob = args.as_bytes().to_vec();
        kfd.ioctl(&file, &caller, AMDKFD_IOC_GET_PROCESS_APERTURES_NEW, &mut blob)
            .unwrap();
        assert_eq!(GetProcessAperturesNewArgs::read_from_bytes(&blob).unwrap().num_of_nodes, 2);

        args.kfd_process_device_apertures_ptr = 0x5000;
        args.num_of_nodes = 1;
        let mut blob = args.as_bytes().to_vec();
        kfd.ioctl(&file, &caller, AMDKFD_IOC_GET_PROCESS_APERTURES_NEW, &mut blob)
            .unwrap();
        assert_eq!(GetProcessAperturesNewArgs::read_from_bytes(&blob).unwrap().num_of_nodes, 1);

        let entries: Vec<ProcessDeviceApertures> = copy_array_from_user(caller.mm.as_ref(), 0x5000, 1).unwrap();
        assert_eq!(entries[0].gpu_id, bed.gpu_a);
    }

    #[test]
    fn tile_config_counts_and_unknown_gpu() {
        let bed = TestBed::new();
        let kfd = bed.kfd();
        let caller = bed.task(100);
        let file = kfd.open(&caller).unwrap();
        let available = bed.device_a.backend().tile_config();

        let args = GetTileConfigArgs {
            gpu_id: bed.gpu_a,
            ..Default::default()
        };
        let mut blob = args.as_bytes().to_vec();
        kfd.ioctl(&file, &caller, AMDKFD_IOC_GET_TILE_CONFIG, &mut blob).unwrap();
        let out = GetTileConfigArgs::read_from_bytes(&blob).unwrap();
        assert_eq!(out.num_tile_configs as usize, available.tile_config.len());
        assert_eq!(out.gb_addr_config, available.gb_addr_config);

        let unknown = GetTileConfigArgs {
            gpu_id: 0x9999,
            ..Default::default()
        };
        let mut blob = unknown.as_bytes().to_vec();
        assert!(matches!(
            kfd.ioctl(&file, &caller, AMDKFD_IOC_GET_TILE_CONFIG, &mut blob),
            Err(KfdError::InvalidArgument(_))
        ));
    }

    #[test]
    fn doorbell_mmap_needs_binding_and_exact_size() {
        let bed = TestBed::new();
        let kfd = bed.kfd();
        let caller = bed.task(100);
        let file = kfd.open(&caller).unwrap();
        let slice = bed.device_a.doorbell_process_slice();
        let offset = KFD_MMAP_TYPE_DOORBELL | mmap_gpu_id(bed.gpu_a);

        assert!(matches!(
            kfd.mmap(&file, &caller, offset, slice),
            Err(KfdError::InvalidArgument(_))
        ));
        file.process().bind_device(&bed.device_a).unwrap();
        assert_eq!(
            kfd.mmap(&file, &caller, offset, slice),
            Ok(MmapTarget::Doorbell {
                gpu_id: bed.gpu_a,
                addr: bed.backend_a.doorbell_page_addr(file.process().pasid()),
            })
        );
        assert!(matches!(
            kfd.mmap(&file, &caller, offset, PAGE_SIZE),
            Err(KfdError::InvalidArgument(_))
        ));
        assert_eq!(
            kfd.mmap(&file, &caller, KFD_MMAP_TYPE_DOORBELL | mmap_gpu_id(0x9999), slice),
            Err(KfdError::NoSuchDevice(0x9999))
        );
    }

    #[test]
    fn event_reserved_and_mmio_mappings() {
        let bed = TestBed::new();
        let kfd = bed.kfd();
        let caller = bed.task(100);
        let file = kfd.open(&caller).unwrap();
        let events_len = (u64::from(kfd.config().signal_event_limit) * 8).next_multiple_of(PAGE_SIZE);

        assert!(matches!(
            kfd.mmap(&file, &caller, KFD_MMAP_TYPE_EVENTS, events_len),
            Err(KfdError::InvalidArgument(_))
        ));
        let signal = CreateEventArgs {
            event_type: KFD_IOC_EVENT_SIGNAL,
            ..Default::default()
        };
        file.process().create_event(&bed.devices, &signal).unwrap();
        assert_eq!(
            kfd.mmap(&file, &caller, KFD_MMAP_TYPE_EVENTS, events_len),
            Ok(MmapTarget::Events {
                source: SignalPageSource::Kernel
            })
        );

        file.process().bind_device(&bed.device_a).unwrap();
        let reserved = KFD_MMAP_TYPE_RESERVED_MEM | mmap_gpu_id(bed.gpu_a);
        assert_eq!(
            kfd.mmap(&file, &caller, reserved, RESERVED_MEM_SIZE),
            Ok(MmapTarget::ReservedMem { gpu_id: bed.gpu_a })
        );
        assert!(file.process().state.lock().pdds[&bed.gpu_a].reserved_mem_mapped);
        assert_eq!(
            kfd.mmap(&file, &caller, KFD_MMAP_TYPE_RESERVED_MEM | mmap_gpu_id(0x7777), RESERVED_MEM_SIZE),
            Err(KfdError::NoSuchDevice(0x7777))
        );

        let mmio = KFD_MMAP_TYPE_MMIO | mmap_gpu_id(bed.gpu_a);
        assert_eq!(
            kfd.mmap(&file, &caller, mmio, PAGE_SIZE),
            Ok(MmapTarget::Mmio {
                gpu_id: bed.gpu_a,
                addr: bed.backend_a.mmio_remap_addr(),
            })
        );
    }

    #[test]
    fn debug_events_reach_only_debugged_processes() {
        let bed = TestBed::new();
        let kfd = bed.kfd();
        let caller = bed.task(100);
        let file = kfd.open(&caller).unwrap();
        let process = file.process();
        bed.host.add_task(caller.clone());
        process.create_queue(&bed.devices, &queue_args(bed.gpu_a)).unwrap();

        assert!(!kfd.dispatch_debug_event(bed.gpu_a, process.pasid(), 0, false));

        let enable = DbgTrapArgs {
            pid: 100,
            gpu_id: bed.gpu_a,
            op: KFD_IOC_DBG_TRAP_ENABLE,
            data1: 1,
            ..DbgTrapArgs::default()
        };
        let mut blob = enable.as_bytes().to_vec();
        assert_eq!(kfd.ioctl(&file, &caller, AMDKFD_IOC_DBG_TRAP, &mut blob), Ok(0));

        assert!(kfd.dispatch_debug_event(bed.gpu_a, process.pasid(), 0, false));
        assert!(kfd.dispatch_debug_event(bed.gpu_a, process.pasid(), 0, true));
        assert!(!kfd.dispatch_debug_event(bed.gpu_a, process.pasid() + 100, 0, false));
        let fifo_len = process.events.lock().debug_fifo(bed.gpu_a).map(|fifo| fifo.len());
        assert_eq!(fifo_len, Some(2));
    }

    fn enable_trap_on_self(bed: &TestBed, file: &KfdFile, caller: &Task) {
        bed.host.add_task(caller.clone());
        let mut enable = DbgTrapArgs {
            pid: caller.tgid,
            gpu_id: bed.gpu_a,
            op: KFD_IOC_DBG_TRAP_ENABLE,
            data1: 1,
            ..DbgTrapArgs::default()
        };
        bed.kfd().dbg_trap(file.process(), caller, &mut enable).unwrap();
    }

    #[test]
    fn closing_a_self_debugged_file_frees_the_process() {
        let bed = TestBed::new();
        let caller = bed.task(100);
        let file = bed.kfd().open(&caller).unwrap();
        enable_trap_on_self(&bed, &file, &caller);
        assert_eq!(file.process().refcount(), 2);

        file.close();
        assert!(bed.processes.is_empty());
        assert_eq!(bed.backend_a.debug_vmid_releases(), 1);
    }

    #[test]
    fn closing_one_of_two_files_keeps_the_session() {
        let bed = TestBed::new();
        let caller = bed.task(100);
        let first = bed.kfd().open(&caller).unwrap();
        let second = bed.kfd().open(&caller).unwrap();
        enable_trap_on_self(&bed, &first, &caller);

        first.close();
        assert!(second.process().is_debug_trap_enabled(bed.gpu_a));

        second.close();
        assert!(bed.processes.is_empty());
    }

    #[test]
    fn address_space_release_ends_debug_sessions() {
        let bed = TestBed::new();
        let caller = bed.task(100);
        let file = bed.kfd().open(&caller).unwrap();
        enable_trap_on_self(&bed, &file, &caller);
        let fifo = Arc::clone(file.process().events.lock().debug_fifo(bed.gpu_a).unwrap());

        bed.kfd().process_exit(100);
        assert!(!file.process().is_debug_trap_enabled(bed.gpu_a));
        assert!(fifo.is_closed());
        assert_eq!(file.process().refcount(), 1);
        assert_eq!(bed.backend_a.debug_vmid_releases(), 1);

        // Unknown thread groups are ignored.
        bed.kfd().process_exit(4242);
    }

    #[test]
    fn suspend_evicts_and_resume_restores() {
        let bed = TestBed::new();
        let kfd = bed.kfd();
        let file = kfd.open(&bed.task(100)).unwrap();
        file.process().bind_device(&bed.device_a).unwrap();

        kfd.suspend_all();
        kfd.suspend_all();
        assert!(kfd.is_locked());
        assert_eq!(bed.backend_a.evictions(), 1);

        kfd.resume_all().unwrap();
        assert!(!kfd.is_locked());
        assert_eq!(bed.backend_a.restores(), 1);
    }
}
