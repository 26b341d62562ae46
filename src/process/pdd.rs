use crate::error::{KfdError, KfdResult};
use crate::kfd::device::{KfdDevice, MemoryPolicy, VmHandle};
use crate::kfd::host::DrmFile;
use crate::kfd::ioctl::ProcessDeviceApertures;
use crate::process::ProcessRef;
use crate::process::memory::BufferObject;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Queue-manager view of a process on one device.
#[derive(Debug, Default, Clone, Copy)]
pub struct QueueProcessData {
    /// Only assigned by the no-HWS queue manager.
    pub vmid: Option<u32>,
    pub num_gws: u32,
    pub sh_hidden_private_base: u64,
    pub memory_policy: Option<MemoryPolicy>,
}

/// A process's binding to one GPU.
#[derive(Debug)]
pub struct ProcessDevice {
    device: Arc<KfdDevice>,
    apertures: ProcessDeviceApertures,
    vram_usage: AtomicU64,
    bos: BTreeMap<u32, BufferObject>,
    vm: Option<VmHandle>,
    drm_file: Option<DrmFile>,
    doorbell_index: u32,

    pub qpd: QueueProcessData,

    pub debug_trap_enabled: bool,
    pub watch_point_bitmask: u32,
    pub wave_launch_mode: u32,
    /// Reference held on the debugged process for the length of a trap session.
    pub(crate) debug_session: Option<ProcessRef>,

    pub tba_addr: u64,
    pub tma_addr: u64,
    pub reserved_mem_mapped: bool,
}

impl ProcessDevice {
    pub(crate) fn new(device: &Arc<KfdDevice>, pasid: u32) -> Self {
        Self {
            apertures: device.process_apertures(),
            device: Arc::clone(device),
            vram_usage: AtomicU64::new(0),
            bos: BTreeMap::new(),
            vm: None,
            drm_file: None,
            doorbell_index: pasid,
            qpd: QueueProcessData::default(),
            debug_trap_enabled: false,
            watch_point_bitmask: 0,
            wave_launch_mode: 0,
            debug_session: None,
            tba_addr: 0,
            tma_addr: 0,
            reserved_mem_mapped: false,
        }
    }

    #[must_use]
    pub fn device(&self) -> &Arc<KfdDevice> {
        &self.device
    }

    #[must_use]
    pub fn gpu_id(&self) -> u32 {
        self.device.gpu_id
    }

    #[must_use]
    pub const fn apertures(&self) -> &ProcessDeviceApertures {
        &self.apertures
    }

    #[must_use]
    pub fn vram_usage(&self) -> u64 {
        self.vram_usage.load(Ordering::Relaxed)
    }

    pub(crate) fn add_vram_usage(&self, size: u64) {
        let usage = self.vram_usage.load(Ordering::Relaxed);
        self.vram_usage
            .store(usage.saturating_add(size), Ordering::Relaxed);
    }

    pub(crate) fn sub_vram_usage(&self, size: u64) {
        let usage = self.vram_usage.load(Ordering::Relaxed);
        self.vram_usage
            .store(usage.saturating_sub(size), Ordering::Relaxed);
    }

    #[must_use]
    pub const fn doorbell_index(&self) -> u32 {
        self.doorbell_index
    }

    /// A binding is complete once the process has a VM on the device.
    #[must_use]
    pub const fn is_bound(&self) -> bool {
        self.vm.is_some()
    }

    #[must_use]
    pub const fn drm_file(&self) -> Option<DrmFile> {
        self.drm_file
    }

    /// # Errors
    /// `InvalidArgument` if the binding never got a VM.
    pub fn vm_handle(&self) -> KfdResult<VmHandle> {
        self.vm
            .ok_or(KfdError::InvalidArgument("process has no VM on this device"))
    }

    /// Attaches a VM to the binding.
    ///
    /// With a render-node file the VM is adopted from that file, at most once
    /// and only if no VM exists yet. Without one a private VM is created if
    /// the binding has none.
    ///
    /// # Errors
    /// `Busy` when a different file, or a private VM, is already attached.
    pub(crate) fn init_vm(&mut self, drm: Option<DrmFile>, pasid: u32) -> KfdResult<()> {
        let backend = self.device.backend();
        match (self.drm_file, drm) {
            (Some(current), Some(file)) if current == file => Ok(()),
            (Some(_), Some(_)) => Err(KfdError::Busy("VM acquired from another file")),
            (_, None) => {
                if self.vm.is_none() {
                    self.vm = Some(backend.create_process_vm(pasid)?);
                    tracing::debug!(gpu_id = self.gpu_id(), pasid, "created process VM");
                }
                Ok(())
            }
            (None, Some(file)) => {
                if self.vm.is_some() {
                    return Err(KfdError::Busy("VM already created for this device"));
                }
                self.vm = Some(backend.acquire_process_vm(file, pasid)?);
                self.drm_file = Some(file);
                tracing::debug!(gpu_id = self.gpu_id(), pasid, "acquired VM from render node");
                Ok(())
            }
        }
    }

    /// Stores `bo` under the lowest free handle.
    pub(crate) fn insert_bo(&mut self, bo: BufferObject) -> u32 {
        let mut idr = 0;
        for &used in self.bos.keys() {
            if used != idr {
                break;
            }
            idr += 1;
        }
        self.bos.insert(idr, bo);
        idr
    }

    #[must_use]
    pub fn bo(&self, idr: u32) -> Option<&BufferObject> {
        self.bos.get(&idr)
    }

    pub(crate) fn remove_bo(&mut self, idr: u32) -> Option<BufferObject> {
        self.bos.remove(&idr)
    }

    #[must_use]
    pub fn num_bos(&self) -> usize {
        self.bos.len()
    }

    pub fn flush_tlb(&self, pasid: u32) {
        let backend = self.device.backend();
        if self.device.is_no_hws() {
            if let Some(vmid) = self.qpd.vmid {
                backend.flush_tlb_vmid(vmid);
            }
        } else {
            backend.flush_tlb_pasid(pasid);
        }
    }

    /// Undoes the debugger enable sequence.
    pub(crate) fn disable_debug_trap(&mut self) {
        let device = Arc::clone(&self.device);
        device.release_watch_points(self.watch_point_bitmask);
        self.watch_point_bitmask = 0;
        self.debug_trap_enabled = false;
        device.backend().disable_debug_trap(device.debug_vmid);
        if let Err(err) = device.backend().release_debug_vmid() {
            tracing::warn!(gpu_id = device.gpu_id, %err, "failed to release debug VMID");
        }
    }

    /// Frees everything the binding owns. The debug-session reference, if
    /// any, is handed back so it can be dropped outside the process lock.
    pub(crate) fn release(&mut self, pasid: u32) -> Option<ProcessRef> {
        let gpu_id = self.gpu_id();
        if self.debug_trap_enabled {
            self.disable_debug_trap();
        }

        let backend = self.device.backend();
        for (idr, bo) in std::mem::take(&mut self.bos) {
            if let Err(err) = backend.free_memory(bo.mem) {
                tracing::warn!(gpu_id, idr, %err, "leaking buffer object at teardown");
            }
        }
        self.sub_vram_usage(self.vram_usage());

        if let Some(vm) = self.vm.take() {
            backend.destroy_process_vm(vm);
        }
        self.drm_file = None;
        tracing::debug!(gpu_id, pasid, "released process device");
        self.debug_session.take()
    }
}
