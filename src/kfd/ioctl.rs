use crate::utils::{ior, iow, iowr};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

// ===============================================================================================
// Constants and Versioning
// ===============================================================================================

pub const KFD_IOCTL_BASE: u32 = 0x4B; // 'K'
pub const KFD_IOCTL_MAJOR_VERSION: u32 = 1;
pub const KFD_IOCTL_MINOR_VERSION: u32 = 3;

pub const KFD_IOCTL_DBG_MAJOR_VERSION: u32 = 3;
pub const KFD_IOCTL_DBG_MINOR_VERSION: u32 = 3;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct GetVersionArgs {
    pub major_version: u32,
    pub minor_version: u32,
}

// ===============================================================================================
// Queue Management
// ===============================================================================================

pub const KFD_IOC_QUEUE_TYPE_COMPUTE: u32 = 0x0;
pub const KFD_IOC_QUEUE_TYPE_SDMA: u32 = 0x1;
pub const KFD_IOC_QUEUE_TYPE_COMPUTE_AQL: u32 = 0x2;
pub const KFD_IOC_QUEUE_TYPE_SDMA_XGMI: u32 = 0x3;

pub const KFD_MAX_QUEUE_PERCENTAGE: u32 = 100;
pub const KFD_MAX_QUEUE_PRIORITY: u32 = 15;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct CreateQueueArgs {
    pub ring_base_address: u64,
    pub write_pointer_address: u64,
    pub read_pointer_address: u64,
    pub doorbell_offset: u64,

    pub ring_size: u32,
    pub gpu_id: u32,
    pub queue_type: u32,
    pub queue_percentage: u32,
    pub queue_priority: u32,
    pub queue_id: u32,

    pub eop_buffer_address: u64,
    pub eop_buffer_size: u64,
    pub ctx_save_restore_address: u64,
    pub ctx_save_restore_size: u32,
    pub ctl_stack_size: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DestroyQueueArgs {
    pub queue_id: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct UpdateQueueArgs {
    pub ring_base_address: u64,
    pub queue_id: u32,
    pub ring_size: u32,
    pub queue_percentage: u32,
    pub queue_priority: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SetCuMaskArgs {
    pub queue_id: u32,
    pub num_cu_mask: u32,
    pub cu_mask_ptr: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct GetQueueWaveStateArgs {
    pub ctl_stack_address: u64,
    pub ctl_stack_used_size: u32,
    pub save_area_used_size: u32,
    pub queue_id: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct AllocQueueGwsArgs {
    pub queue_id: u32,
    pub num_gws: u32,
    pub first_gws: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct QueueSnapshotEntry {
    pub ring_base_address: u64,
    pub write_pointer_address: u64,
    pub read_pointer_address: u64,
    pub ctx_save_restore_address: u64,
    pub queue_id: u32,
    pub gpu_id: u32,
    pub ring_size: u32,
    pub queue_type: u32,
    pub queue_status: u32,
    pub reserved: [u32; 19],
}

// ===============================================================================================
// Memory Policy
// ===============================================================================================

pub const KFD_IOC_CACHE_POLICY_COHERENT: u32 = 0;
pub const KFD_IOC_CACHE_POLICY_NONCOHERENT: u32 = 1;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SetMemoryPolicyArgs {
    pub alternate_aperture_base: u64,
    pub alternate_aperture_size: u64,
    pub gpu_id: u32,
    pub default_policy: u32,
    pub alternate_policy: u32,
    pub pad: u32,
}

// ===============================================================================================
// Profiling
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct GetClockCountersArgs {
    pub gpu_clock_counter: u64,
    pub cpu_clock_counter: u64,
    pub system_clock_counter: u64,
    pub system_clock_freq: u64,
    pub gpu_id: u32,
    pub pad: u32,
}

// ===============================================================================================
// Process Apertures
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ProcessDeviceApertures {
    pub lds_base: u64,
    pub lds_limit: u64,
    pub scratch_base: u64,
    pub scratch_limit: u64,
    pub gpuvm_base: u64,
    pub gpuvm_limit: u64,
    pub gpu_id: u32,
    pub pad: u32,
}

pub const NUM_OF_SUPPORTED_GPUS: usize = 7;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct GetProcessAperturesArgs {
    pub process_apertures: [ProcessDeviceApertures; NUM_OF_SUPPORTED_GPUS],
    pub num_of_nodes: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct GetProcessAperturesNewArgs {
    pub kfd_process_device_apertures_ptr: u64,
    pub num_of_nodes: u32,
    pub pad: u32,
}

// ===============================================================================================
// Deprecated Debugger Interface
// ===============================================================================================

pub const MAX_ALLOWED_NUM_POINTS: u32 = 100;
pub const MAX_ALLOWED_AW_BUFF_SIZE: u32 = 4096;
pub const MAX_ALLOWED_WAC_BUFF_SIZE: u32 = 128;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DbgRegisterArgs {
    pub gpu_id: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DbgUnregisterArgs {
    pub gpu_id: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DbgAddressWatchArgs {
    pub content_ptr: u64,
    pub gpu_id: u32,
    /// Includes the size of this header.
    pub buf_size_in_bytes: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DbgWaveControlArgs {
    pub content_ptr: u64,
    pub gpu_id: u32,
    /// Includes the size of this header.
    pub buf_size_in_bytes: u32,
}

// ===============================================================================================
// Debug Trap
// ===============================================================================================

pub const KFD_DBG_EV_STATUS_TRAP: u32 = 1 << 0;
pub const KFD_DBG_EV_STATUS_VMFAULT: u32 = 1 << 1;
pub const KFD_DBG_EV_STATUS_SUSPENDED: u32 = 4;
pub const KFD_DBG_EV_STATUS_NEW_QUEUE: u32 = 8;
pub const KFD_DBG_EV_FLAG_CLEAR_STATUS: u32 = 1;

pub const KFD_DBG_QUEUE_ERROR_MASK: u32 = 1 << 30;
pub const KFD_DBG_QUEUE_INVALID_MASK: u32 = 1 << 31;
pub const KFD_INVALID_QUEUEID: u32 = 0xffff_ffff;

pub const KFD_IOC_DBG_TRAP_ENABLE: u32 = 0;
pub const KFD_IOC_DBG_TRAP_SET_WAVE_LAUNCH_OVERRIDE: u32 = 1;
pub const KFD_IOC_DBG_TRAP_SET_WAVE_LAUNCH_MODE: u32 = 2;
pub const KFD_IOC_DBG_TRAP_NODE_SUSPEND: u32 = 3;
pub const KFD_IOC_DBG_TRAP_NODE_RESUME: u32 = 4;
pub const KFD_IOC_DBG_TRAP_QUERY_DEBUG_EVENT: u32 = 5;
pub const KFD_IOC_DBG_TRAP_GET_QUEUE_SNAPSHOT: u32 = 6;
pub const KFD_IOC_DBG_TRAP_GET_VERSION: u32 = 7;
pub const KFD_IOC_DBG_TRAP_CLEAR_ADDRESS_WATCH: u32 = 8;
pub const KFD_IOC_DBG_TRAP_SET_ADDRESS_WATCH: u32 = 9;
pub const KFD_IOC_DBG_TRAP_SET_PRECISE_MEM_OPS: u32 = 10;

/// One struct for every debug-trap op; `data1..data3` are interpreted per op.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DbgTrapArgs {
    pub ptr: u64,
    pub pid: u32,
    pub gpu_id: u32,
    pub op: u32,
    pub data1: u32,
    pub data2: u32,
    pub data3: u32,
}

// ===============================================================================================
// Events
// ===============================================================================================

pub const KFD_IOC_EVENT_SIGNAL: u32 = 0;
pub const KFD_IOC_EVENT_NODECHANGE: u32 = 1;
pub const KFD_IOC_EVENT_DEVICESTATECHANGE: u32 = 2;
pub const KFD_IOC_EVENT_HW_EXCEPTION: u32 = 3;
pub const KFD_IOC_EVENT_SYSTEM_EVENT: u32 = 4;
pub const KFD_IOC_EVENT_DEBUG_EVENT: u32 = 5;
pub const KFD_IOC_EVENT_PROFILE_EVENT: u32 = 6;
pub const KFD_IOC_EVENT_QUEUE_EVENT: u32 = 7;
pub const KFD_IOC_EVENT_MEMORY: u32 = 8;

pub const KFD_IOC_WAIT_RESULT_COMPLETE: u32 = 0;
pub const KFD_IOC_WAIT_RESULT_TIMEOUT: u32 = 1;
pub const KFD_IOC_WAIT_RESULT_FAIL: u32 = 2;

pub const KFD_SIGNAL_EVENT_LIMIT: u32 = 4096;
pub const KFD_EVENT_TIMEOUT_IMMEDIATE: u32 = 0;
pub const KFD_EVENT_TIMEOUT_INFINITE: u32 = 0xffff_ffff;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct CreateEventArgs {
    pub event_page_offset: u64,
    pub event_trigger_data: u32,
    pub event_type: u32,
    pub auto_reset: u32,
    pub node_id: u32,
    pub event_id: u32,
    pub event_slot_index: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DestroyEventArgs {
    pub event_id: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SetEventArgs {
    pub event_id: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ResetEventArgs {
    pub event_id: u32,
    pub pad: u32,
}

/// Mirrors `struct kfd_event_data`; the exception union is kept opaque.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct EventData {
    pub exception_data: [u64; 4],
    pub kfd_event_data_ext: u64,
    pub event_id: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct WaitEventsArgs {
    pub events_ptr: u64,
    pub num_events: u32,
    pub wait_for_all: u32,
    pub timeout: u32,
    pub wait_result: u32,
}

// ===============================================================================================
// Per-Device Process State
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SetScratchBackingVaArgs {
    pub va_addr: u64,
    pub gpu_id: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct GetTileConfigArgs {
    pub tile_config_ptr: u64,
    pub macro_tile_config_ptr: u64,
    pub num_tile_configs: u32,
    pub num_macro_tile_configs: u32,
    pub gpu_id: u32,
    pub gb_addr_config: u32,
    pub num_banks: u32,
    pub num_ranks: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SetTrapHandlerArgs {
    pub tba_addr: u64,
    pub tma_addr: u64,
    pub gpu_id: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct AcquireVmArgs {
    pub drm_fd: u32,
    pub gpu_id: u32,
}

// ===============================================================================================
// Memory Management
// ===============================================================================================

pub const KFD_IOC_ALLOC_MEM_FLAGS_VRAM: u32 = 1 << 0;
pub const KFD_IOC_ALLOC_MEM_FLAGS_GTT: u32 = 1 << 1;
pub const KFD_IOC_ALLOC_MEM_FLAGS_USERPTR: u32 = 1 << 2;
pub const KFD_IOC_ALLOC_MEM_FLAGS_DOORBELL: u32 = 1 << 3;
pub const KFD_IOC_ALLOC_MEM_FLAGS_MMIO_REMAP: u32 = 1 << 4;

pub const KFD_IOC_ALLOC_MEM_FLAGS_WRITABLE: u32 = 1 << 31;
pub const KFD_IOC_ALLOC_MEM_FLAGS_EXECUTABLE: u32 = 1 << 30;
pub const KFD_IOC_ALLOC_MEM_FLAGS_PUBLIC: u32 = 1 << 29;
pub const KFD_IOC_ALLOC_MEM_FLAGS_NO_SUBSTITUTE: u32 = 1 << 28;
pub const KFD_IOC_ALLOC_MEM_FLAGS_AQL_QUEUE_MEM: u32 = 1 << 27;
pub const KFD_IOC_ALLOC_MEM_FLAGS_COHERENT: u32 = 1 << 26;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct AllocMemoryOfGpuArgs {
    pub va_addr: u64,
    pub size: u64,
    pub handle: u64,
    /// In: CPU address of a userptr allocation. Out: offset for CPU mapping.
    pub mmap_offset: u64,
    pub gpu_id: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct FreeMemoryOfGpuArgs {
    pub handle: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MapMemoryToGpuArgs {
    pub handle: u64,
    pub device_ids_array_ptr: u64,
    pub n_devices: u32,
    pub n_success: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct UnmapMemoryFromGpuArgs {
    pub handle: u64,
    pub device_ids_array_ptr: u64,
    pub n_devices: u32,
    pub n_success: u32,
}

// ===============================================================================================
// Cross Memory Copy
// ===============================================================================================

pub const KFD_CROSS_MEMORY_RW_BIT: u32 = 1 << 0;

#[must_use]
pub const fn is_cross_memory_write(flags: u32) -> bool {
    flags & KFD_CROSS_MEMORY_RW_BIT != 0
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MemoryRange {
    pub va_addr: u64,
    pub size: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct CrossMemoryCopyArgs {
    pub pid: u32,
    pub flags: u32,
    pub src_mem_range_array: u64,
    pub src_mem_array_size: u64,
    pub dst_mem_range_array: u64,
    pub dst_mem_array_size: u64,
    pub bytes_copied: u64,
}

// ===============================================================================================
// Handles and mmap Offsets
// ===============================================================================================

/// Buffer handles carry the owning gpu_id in the upper 32 bits.
#[must_use]
pub const fn make_handle(gpu_id: u32, idr_handle: u32) -> u64 {
    ((gpu_id as u64) << 32) | idr_handle as u64
}

#[must_use]
pub const fn handle_gpu_id(handle: u64) -> u32 {
    (handle >> 32) as u32
}

#[must_use]
pub const fn handle_idr(handle: u64) -> u32 {
    (handle & 0xffff_ffff) as u32
}

pub const KFD_MMAP_TYPE_SHIFT: u32 = 62;
pub const KFD_MMAP_TYPE_MASK: u64 = 0x3 << KFD_MMAP_TYPE_SHIFT;
pub const KFD_MMAP_TYPE_DOORBELL: u64 = 0x3 << KFD_MMAP_TYPE_SHIFT;
pub const KFD_MMAP_TYPE_EVENTS: u64 = 0x2 << KFD_MMAP_TYPE_SHIFT;
pub const KFD_MMAP_TYPE_RESERVED_MEM: u64 = 0x1 << KFD_MMAP_TYPE_SHIFT;
pub const KFD_MMAP_TYPE_MMIO: u64 = 0x0 << KFD_MMAP_TYPE_SHIFT;

pub const KFD_MMAP_GPU_ID_SHIFT: u32 = 46;
pub const KFD_MMAP_GPU_ID_MASK: u64 = ((1 << 16) - 1) << KFD_MMAP_GPU_ID_SHIFT;

#[must_use]
pub const fn mmap_gpu_id(gpu_id: u32) -> u64 {
    ((gpu_id as u64) << KFD_MMAP_GPU_ID_SHIFT) & KFD_MMAP_GPU_ID_MASK
}

#[must_use]
pub const fn mmap_get_gpu_id(offset: u64) -> u32 {
    ((offset & KFD_MMAP_GPU_ID_MASK) >> KFD_MMAP_GPU_ID_SHIFT) as u32
}

// ===============================================================================================
// IOCTL Definitions
// ===============================================================================================

pub const AMDKFD_IOC_GET_VERSION: u32 = ior::<GetVersionArgs>(KFD_IOCTL_BASE, 0x01);
pub const AMDKFD_IOC_CREATE_QUEUE: u32 = iowr::<CreateQueueArgs>(KFD_IOCTL_BASE, 0x02);
pub const AMDKFD_IOC_DESTROY_QUEUE: u32 = iowr::<DestroyQueueArgs>(KFD_IOCTL_BASE, 0x03);
pub const AMDKFD_IOC_SET_MEMORY_POLICY: u32 = iow::<SetMemoryPolicyArgs>(KFD_IOCTL_BASE, 0x04);
pub const AMDKFD_IOC_GET_CLOCK_COUNTERS: u32 = iowr::<GetClockCountersArgs>(KFD_IOCTL_BASE, 0x05);
pub const AMDKFD_IOC_GET_PROCESS_APERTURES: u32 =
    ior::<GetProcessAperturesArgs>(KFD_IOCTL_BASE, 0x06);
pub const AMDKFD_IOC_UPDATE_QUEUE: u32 = iow::<UpdateQueueArgs>(KFD_IOCTL_BASE, 0x07);
pub const AMDKFD_IOC_CREATE_EVENT: u32 = iowr::<CreateEventArgs>(KFD_IOCTL_BASE, 0x08);
pub const AMDKFD_IOC_DESTROY_EVENT: u32 = iow::<DestroyEventArgs>(KFD_IOCTL_BASE, 0x09);
pub const AMDKFD_IOC_SET_EVENT: u32 = iow::<SetEventArgs>(KFD_IOCTL_BASE, 0x0A);
pub const AMDKFD_IOC_RESET_EVENT: u32 = iow::<ResetEventArgs>(KFD_IOCTL_BASE, 0x0B);
pub const AMDKFD_IOC_WAIT_EVENTS: u32 = iowr::<WaitEventsArgs>(KFD_IOCTL_BASE, 0x0C);
pub const AMDKFD_IOC_DBG_REGISTER: u32 = iow::<DbgRegisterArgs>(KFD_IOCTL_BASE, 0x0D);
pub const AMDKFD_IOC_DBG_UNREGISTER: u32 = iow::<DbgUnregisterArgs>(KFD_IOCTL_BASE, 0x0E);
pub const AMDKFD_IOC_DBG_ADDRESS_WATCH: u32 = iow::<DbgAddressWatchArgs>(KFD_IOCTL_BASE, 0x0F);
pub const AMDKFD_IOC_DBG_WAVE_CONTROL: u32 = iow::<DbgWaveControlArgs>(KFD_IOCTL_BASE, 0x10);
pub const AMDKFD_IOC_SET_SCRATCH_BACKING_VA: u32 =
    iowr::<SetScratchBackingVaArgs>(KFD_IOCTL_BASE, 0x11);
pub const AMDKFD_IOC_GET_TILE_CONFIG: u32 = iowr::<GetTileConfigArgs>(KFD_IOCTL_BASE, 0x12);
pub const AMDKFD_IOC_SET_TRAP_HANDLER: u32 = iow::<SetTrapHandlerArgs>(KFD_IOCTL_BASE, 0x13);
pub const AMDKFD_IOC_GET_PROCESS_APERTURES_NEW: u32 =
    iowr::<GetProcessAperturesNewArgs>(KFD_IOCTL_BASE, 0x14);
pub const AMDKFD_IOC_ACQUIRE_VM: u32 = iow::<AcquireVmArgs>(KFD_IOCTL_BASE, 0x15);
pub const AMDKFD_IOC_ALLOC_MEMORY_OF_GPU: u32 = iowr::<AllocMemoryOfGpuArgs>(KFD_IOCTL_BASE, 0x16);
pub const AMDKFD_IOC_FREE_MEMORY_OF_GPU: u32 = iow::<FreeMemoryOfGpuArgs>(KFD_IOCTL_BASE, 0x17);
pub const AMDKFD_IOC_MAP_MEMORY_TO_GPU: u32 = iowr::<MapMemoryToGpuArgs>(KFD_IOCTL_BASE, 0x18);
pub const AMDKFD_IOC_UNMAP_MEMORY_FROM_GPU: u32 =
    iowr::<UnmapMemoryFromGpuArgs>(KFD_IOCTL_BASE, 0x19);
pub const AMDKFD_IOC_SET_CU_MASK: u32 = iow::<SetCuMaskArgs>(KFD_IOCTL_BASE, 0x1A);
pub const AMDKFD_IOC_GET_QUEUE_WAVE_STATE: u32 =
    iowr::<GetQueueWaveStateArgs>(KFD_IOCTL_BASE, 0x1B);
pub const AMDKFD_IOC_ALLOC_QUEUE_GWS: u32 = iowr::<AllocQueueGwsArgs>(KFD_IOCTL_BASE, 0x1E);

pub const AMDKFD_COMMAND_START: u32 = 0x01;
pub const AMDKFD_COMMAND_END: u32 = 0x20;

pub const AMDKFD_IOC_DBG_TRAP: u32 = iowr::<DbgTrapArgs>(KFD_IOCTL_BASE, 0x82);
pub const AMDKFD_IOC_CROSS_MEMORY_COPY: u32 = iowr::<CrossMemoryCopyArgs>(KFD_IOCTL_BASE, 0x83);

pub const AMDKFD_COMMAND_START_2: u32 = 0x80;
pub const AMDKFD_COMMAND_END_2: u32 = 0x85;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uapi_struct_sizes() {
        assert_eq!(size_of::<CreateQueueArgs>(), 88);
        assert_eq!(size_of::<DbgTrapArgs>(), 32);
        assert_eq!(size_of::<CrossMemoryCopyArgs>(), 48);
        assert_eq!(size_of::<QueueSnapshotEntry>(), 128);
        assert_eq!(size_of::<GetProcessAperturesArgs>(), 400);
        assert_eq!(size_of::<EventData>(), 48);
    }

    #[test]
    fn handle_keeps_gpu_id_in_high_bits() {
        let handle = make_handle(0x1234, 7);
        assert_eq!(handle, 0x0000_1234_0000_0007);
        assert_eq!(handle_gpu_id(handle), 0x1234);
        assert_eq!(handle_idr(handle), 7);
    }

    #[test]
    fn mmap_offset_splits_type_and_gpu_id() {
        let offset = KFD_MMAP_TYPE_DOORBELL | mmap_gpu_id(0xbeef);
        assert_eq!(offset & KFD_MMAP_TYPE_MASK, KFD_MMAP_TYPE_DOORBELL);
        assert_eq!(mmap_get_gpu_id(offset), 0xbeef);
        assert_eq!(mmap_get_gpu_id(KFD_MMAP_TYPE_EVENTS), 0);
    }
}
