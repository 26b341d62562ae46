#![allow(clippy::cast_possible_truncation)]

use crate::error::{KfdError, KfdResult};
use crate::kfd::device::{DeviceRegistry, KfdDevice, MemId};
use crate::kfd::ioctl::{
    AllocMemoryOfGpuArgs, KFD_IOC_ALLOC_MEM_FLAGS_AQL_QUEUE_MEM, KFD_IOC_ALLOC_MEM_FLAGS_COHERENT,
    KFD_IOC_ALLOC_MEM_FLAGS_DOORBELL, KFD_IOC_ALLOC_MEM_FLAGS_EXECUTABLE,
    KFD_IOC_ALLOC_MEM_FLAGS_GTT, KFD_IOC_ALLOC_MEM_FLAGS_MMIO_REMAP,
    KFD_IOC_ALLOC_MEM_FLAGS_NO_SUBSTITUTE, KFD_IOC_ALLOC_MEM_FLAGS_PUBLIC,
    KFD_IOC_ALLOC_MEM_FLAGS_USERPTR, KFD_IOC_ALLOC_MEM_FLAGS_VRAM,
    KFD_IOC_ALLOC_MEM_FLAGS_WRITABLE, KFD_MMAP_TYPE_MMIO, handle_gpu_id, handle_idr, make_handle,
    mmap_gpu_id,
};
use crate::process::Process;
use crate::process::interval::{BoInterval, BoLocation};
use crate::utils::{PAGE_SIZE, is_page_aligned};
use std::sync::Arc;

/// Decoded `KFD_IOC_ALLOC_MEM_FLAGS_*`.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocFlags {
    pub vram: bool,
    pub gtt: bool,
    pub userptr: bool,
    pub doorbell: bool,
    pub mmio_remap: bool,
    pub writable: bool,
    pub executable: bool,
    pub public: bool,
    pub no_substitute: bool,
    pub aql_queue_mem: bool,
    pub coherent: bool,
}

impl AllocFlags {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn vram(mut self) -> Self {
        self.vram = true;
        self
    }

    #[must_use]
    pub const fn gtt(mut self) -> Self {
        self.gtt = true;
        self
    }

    #[must_use]
    pub const fn userptr(mut self) -> Self {
        self.userptr = true;
        self
    }

    #[must_use]
    pub const fn doorbell(mut self) -> Self {
        self.doorbell = true;
        self
    }

    #[must_use]
    pub const fn mmio_remap(mut self) -> Self {
        self.mmio_remap = true;
        self
    }

    #[must_use]
    pub const fn writable(mut self) -> Self {
        self.writable = true;
        self
    }

    #[must_use]
    pub const fn public(mut self) -> Self {
        self.public = true;
        self
    }

    #[must_use]
    pub const fn no_substitute(mut self) -> Self {
        self.no_substitute = true;
        self
    }

    #[must_use]
    pub const fn from_ioctl_flags(flags: u32) -> Self {
        Self {
            vram: flags & KFD_IOC_ALLOC_MEM_FLAGS_VRAM != 0,
            gtt: flags & KFD_IOC_ALLOC_MEM_FLAGS_GTT != 0,
            userptr: flags & KFD_IOC_ALLOC_MEM_FLAGS_USERPTR != 0,
            doorbell: flags & KFD_IOC_ALLOC_MEM_FLAGS_DOORBELL != 0,
            mmio_remap: flags & KFD_IOC_ALLOC_MEM_FLAGS_MMIO_REMAP != 0,
            writable: flags & KFD_IOC_ALLOC_MEM_FLAGS_WRITABLE != 0,
            executable: flags & KFD_IOC_ALLOC_MEM_FLAGS_EXECUTABLE != 0,
            public: flags & KFD_IOC_ALLOC_MEM_FLAGS_PUBLIC != 0,
            no_substitute: flags & KFD_IOC_ALLOC_MEM_FLAGS_NO_SUBSTITUTE != 0,
            aql_queue_mem: flags & KFD_IOC_ALLOC_MEM_FLAGS_AQL_QUEUE_MEM != 0,
            coherent: flags & KFD_IOC_ALLOC_MEM_FLAGS_COHERENT != 0,
        }
    }

    /// Converts back into the raw bitmask carried by the ioctl.
    #[must_use]
    pub const fn to_ioctl_flags(self) -> u32 {
        let mut ioc_flags = 0;

        if self.vram {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_VRAM;
        }
        if self.gtt {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_GTT;
        }
        if self.userptr {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_USERPTR;
        }
        if self.doorbell {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_DOORBELL;
        }
        if self.mmio_remap {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_MMIO_REMAP;
        }
        if self.writable {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_WRITABLE;
        }
        if self.executable {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_EXECUTABLE;
        }
        if self.public {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_PUBLIC;
        }
        if self.no_substitute {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_NO_SUBSTITUTE;
        }
        if self.aql_queue_mem {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_AQL_QUEUE_MEM;
        }
        if self.coherent {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_COHERENT;
        }

        ioc_flags
    }
}

/// A piece of GPU-addressable memory owned by a process.
#[derive(Debug, Clone)]
pub struct BufferObject {
    pub mem: MemId,
    pub va: u64,
    pub size: u64,
    pub flags: AllocFlags,
    /// CPU address backing a userptr allocation.
    pub cpu_addr: Option<u64>,
    pub device: Arc<KfdDevice>,
}

impl BufferObject {
    #[must_use]
    pub const fn is_userptr(&self) -> bool {
        self.cpu_addr.is_some()
    }

    #[must_use]
    pub const fn is_vram(&self) -> bool {
        self.flags.vram
    }
}

/// Result of a multi-device map or unmap.
///
/// `n_success` counts the devices done so far and is valid even when
/// `result` is an error; passing it back resumes after the last success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapOutcome {
    pub n_success: u32,
    pub result: KfdResult<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatedMemory {
    pub handle: u64,
    pub mmap_offset: u64,
}

impl Process {
    /// # Errors
    /// `InvalidArgument` for a bad size, placement or alignment,
    /// `NoSuchDevice` for an unknown gpu_id, or the backend failure.
    pub fn alloc_memory_of_gpu(
        &self,
        devices: &DeviceRegistry,
        args: &AllocMemoryOfGpuArgs,
    ) -> KfdResult<AllocatedMemory> {
        if args.size == 0 {
            return Err(KfdError::InvalidArgument("zero-sized allocation"));
        }
        let device = devices.lookup(args.gpu_id)?;
        let flags = AllocFlags::from_ioctl_flags(args.flags);

        if flags.public && flags.vram && !device.large_bar {
            tracing::debug!(gpu_id = args.gpu_id, "public VRAM requested without a large BAR");
            return Err(KfdError::InvalidArgument("public VRAM needs a large BAR"));
        }
        if flags.doorbell && args.size != device.doorbell_process_slice() {
            return Err(KfdError::InvalidArgument("doorbell allocation size"));
        }
        if flags.mmio_remap && args.size != PAGE_SIZE {
            return Err(KfdError::InvalidArgument("MMIO remap allocation size"));
        }
        if flags.userptr && !is_page_aligned(args.mmap_offset) {
            tracing::debug!(addr = args.mmap_offset, "unaligned userptr address");
            return Err(KfdError::InvalidArgument("unaligned userptr address"));
        }

        let backend = device.backend();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state
            .bo_intervals
            .overlaps(args.va_addr, args.va_addr.saturating_add(args.size - 1))
        {
            tracing::debug!(gpu_id = args.gpu_id, va = args.va_addr, size = args.size, "overlapping allocation");
            return Err(KfdError::InvalidArgument("virtual address range in use"));
        }
        let pdd = state.bind(&device, self.pasid())?;

        let backing = if flags.doorbell {
            Some(backend.doorbell_page_addr(pdd.doorbell_index()))
        } else if flags.mmio_remap {
            match backend.mmio_remap_addr() {
                0 => return Err(KfdError::OutOfMemory),
                addr => Some(addr),
            }
        } else if flags.userptr {
            Some(args.mmap_offset)
        } else {
            None
        };

        let vm = pdd.vm_handle()?;
        let (mem, offset) = backend
            .alloc_memory(vm, args.va_addr, args.size, flags, backing)
            .inspect_err(|err| {
                tracing::error!(gpu_id = args.gpu_id, size = args.size, %err, "allocation failed");
            })?;

        let idr = pdd.insert_bo(BufferObject {
            mem,
            va: args.va_addr,
            size: args.size,
            flags,
            cpu_addr: flags.userptr.then_some(args.mmap_offset),
            device: Arc::clone(&device),
        });
        if flags.vram {
            pdd.add_vram_usage(args.size);
        }
        state.bo_intervals.insert(
            args.va_addr,
            args.size,
            BoLocation {
                gpu_id: args.gpu_id,
                idr,
            },
        )?;

        let mmap_offset = if flags.mmio_remap {
            KFD_MMAP_TYPE_MMIO | mmap_gpu_id(args.gpu_id)
        } else {
            offset
        };
        let handle = make_handle(args.gpu_id, idr);
        tracing::debug!(gpu_id = args.gpu_id, handle, size = args.size, "allocated buffer object");
        Ok(AllocatedMemory {
            handle,
            mmap_offset,
        })
    }

    /// # Errors
    /// `NoSuchDevice` or `NotFound` for a stale handle, or the backend
    /// failure, in which case the handle stays valid for teardown.
    pub fn free_memory_of_gpu(&self, devices: &DeviceRegistry, handle: u64) -> KfdResult<()> {
        let gpu_id = handle_gpu_id(handle);
        let idr = handle_idr(handle);
        let device = devices.lookup(gpu_id)?;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let pdd = state
            .pdds
            .get_mut(&gpu_id)
            .ok_or(KfdError::NotFound("buffer object"))?;
        let bo = pdd
            .bo(idr)
            .cloned()
            .ok_or(KfdError::NotFound("buffer object"))?;

        device.backend().free_memory(bo.mem).inspect_err(|err| {
            tracing::error!(gpu_id, handle, %err, "free failed, keeping handle");
        })?;

        pdd.remove_bo(idr);
        if bo.is_vram() {
            pdd.sub_vram_usage(bo.size);
        }
        state.bo_intervals.remove(bo.va, BoLocation { gpu_id, idr });
        Ok(())
    }

    /// Maps a buffer object into the VM of every listed device, starting at
    /// index `n_success`.
    pub fn map_memory_to_gpu(
        &self,
        devices: &DeviceRegistry,
        handle: u64,
        device_ids: &[u32],
        n_success: u32,
    ) -> MapOutcome {
        let mut outcome = MapOutcome {
            n_success,
            result: Ok(()),
        };
        outcome.result = self.map_to_peers(devices, handle, device_ids, &mut outcome.n_success);
        outcome
    }

    fn map_to_peers(
        &self,
        devices: &DeviceRegistry,
        handle: u64,
        device_ids: &[u32],
        n_success: &mut u32,
    ) -> KfdResult<()> {
        check_device_list(device_ids, *n_success)?;
        let gpu_id = handle_gpu_id(handle);
        let device = devices.lookup(gpu_id)?;

        let mem = {
            let mut state = self.state.lock();
            let mem = state
                .bind(&device, self.pasid())?
                .bo(handle_idr(handle))
                .ok_or(KfdError::NotFound("buffer object"))?
                .mem;

            for (i, &peer_id) in device_ids.iter().enumerate().skip(*n_success as usize) {
                let peer = devices.lookup(peer_id)?;
                let vm = state.bind(&peer, self.pasid())?.vm_handle()?;
                peer.backend().map_memory(mem, vm).inspect_err(|err| {
                    tracing::error!(handle, peer_id, %err, "failed to map to gpu {}/{}", i, device_ids.len());
                })?;
                *n_success = i as u32 + 1;
            }
            mem
        };

        device.backend().sync_memory(mem)?;

        // Flush only once the page-table updates have landed.
        let state = self.state.lock();
        for peer_id in device_ids {
            if let Some(pdd) = state.pdds.get(peer_id) {
                pdd.flush_tlb(self.pasid());
            }
        }
        Ok(())
    }

    /// Removes a buffer object from the VM of every listed device, starting
    /// at index `n_success`.
    pub fn unmap_memory_from_gpu(
        &self,
        devices: &DeviceRegistry,
        handle: u64,
        device_ids: &[u32],
        n_success: u32,
    ) -> MapOutcome {
        let mut outcome = MapOutcome {
            n_success,
            result: Ok(()),
        };
        outcome.result =
            self.unmap_from_peers(devices, handle, device_ids, &mut outcome.n_success);
        outcome
    }

    fn unmap_from_peers(
        &self,
        devices: &DeviceRegistry,
        handle: u64,
        device_ids: &[u32],
        n_success: &mut u32,
    ) -> KfdResult<()> {
        check_device_list(device_ids, *n_success)?;
        let gpu_id = handle_gpu_id(handle);
        devices.lookup(gpu_id)?;

        let state = self.state.lock();
        let mem = state
            .pdds
            .get(&gpu_id)
            .ok_or(KfdError::NoSuchDevice(gpu_id))?
            .bo(handle_idr(handle))
            .ok_or(KfdError::NotFound("buffer object"))?
            .mem;

        for (i, &peer_id) in device_ids.iter().enumerate().skip(*n_success as usize) {
            let peer = devices.lookup(peer_id)?;
            let vm = state
                .pdds
                .get(&peer_id)
                .ok_or(KfdError::NoSuchDevice(peer_id))?
                .vm_handle()?;
            peer.backend().unmap_memory(mem, vm).inspect_err(|err| {
                tracing::error!(handle, peer_id, %err, "failed to unmap from gpu {}/{}", i, device_ids.len());
            })?;
            *n_success = i as u32 + 1;
        }
        Ok(())
    }

    /// Resolves the one buffer object that fully covers `[start, last]`.
    ///
    /// # Errors
    /// `Fault` if no single buffer object covers the range.
    pub(crate) fn bo_covering(&self, start: u64, last: u64) -> KfdResult<(BoInterval, BufferObject)> {
        let state = self.state.lock();
        let interval = state
            .bo_intervals
            .find(start, last)
            .filter(|interval| last <= interval.last)
            .ok_or_else(|| {
                tracing::error!(start, last, "range out of bounds");
                KfdError::Fault(start)
            })?;
        let bo = state
            .pdds
            .get(&interval.location.gpu_id)
            .and_then(|pdd| pdd.bo(interval.location.idr))
            .cloned()
            .ok_or(KfdError::Fault(start))?;
        Ok((interval, bo))
    }

    #[must_use]
    pub fn vram_usage(&self, gpu_id: u32) -> u64 {
        self.state
            .lock()
            .pdds
            .get(&gpu_id)
            .map_or(0, |pdd| pdd.vram_usage())
    }
}

fn check_device_list(device_ids: &[u32], n_success: u32) -> KfdResult<()> {
    if device_ids.is_empty() {
        return Err(KfdError::InvalidArgument("empty device list"));
    }
    if n_success as usize > device_ids.len() {
        return Err(KfdError::InvalidArgument("n_success exceeds n_devices"));
    }
    Ok(())
}
