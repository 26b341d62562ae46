//! Typed ioctl requests and the descriptor table mapping command numbers to them.

use crate::error::{KfdError, KfdResult};
use crate::kfd::ioctl::{
    AMDKFD_COMMAND_END, AMDKFD_COMMAND_END_2, AMDKFD_COMMAND_START, AMDKFD_COMMAND_START_2,
    AMDKFD_IOC_ACQUIRE_VM, AMDKFD_IOC_ALLOC_MEMORY_OF_GPU, AMDKFD_IOC_ALLOC_QUEUE_GWS,
    AMDKFD_IOC_CREATE_EVENT, AMDKFD_IOC_CREATE_QUEUE, AMDKFD_IOC_CROSS_MEMORY_COPY,
    AMDKFD_IOC_DBG_ADDRESS_WATCH, AMDKFD_IOC_DBG_REGISTER, AMDKFD_IOC_DBG_TRAP,
    AMDKFD_IOC_DBG_UNREGISTER, AMDKFD_IOC_DBG_WAVE_CONTROL, AMDKFD_IOC_DESTROY_EVENT,
    AMDKFD_IOC_DESTROY_QUEUE, AMDKFD_IOC_FREE_MEMORY_OF_GPU, AMDKFD_IOC_GET_CLOCK_COUNTERS,
    AMDKFD_IOC_GET_PROCESS_APERTURES, AMDKFD_IOC_GET_PROCESS_APERTURES_NEW,
    AMDKFD_IOC_GET_QUEUE_WAVE_STATE, AMDKFD_IOC_GET_TILE_CONFIG, AMDKFD_IOC_GET_VERSION,
    AMDKFD_IOC_MAP_MEMORY_TO_GPU, AMDKFD_IOC_RESET_EVENT, AMDKFD_IOC_SET_CU_MASK,
    AMDKFD_IOC_SET_EVENT, AMDKFD_IOC_SET_MEMORY_POLICY, AMDKFD_IOC_SET_SCRATCH_BACKING_VA,
    AMDKFD_IOC_SET_TRAP_HANDLER, AMDKFD_IOC_UNMAP_MEMORY_FROM_GPU, AMDKFD_IOC_UPDATE_QUEUE,
    AMDKFD_IOC_WAIT_EVENTS, AcquireVmArgs, AllocMemoryOfGpuArgs, AllocQueueGwsArgs,
    CreateEventArgs, CreateQueueArgs, CrossMemoryCopyArgs, DbgAddressWatchArgs, DbgRegisterArgs,
    DbgTrapArgs, DbgUnregisterArgs, DbgWaveControlArgs, DestroyEventArgs, DestroyQueueArgs,
    FreeMemoryOfGpuArgs, GetClockCountersArgs, GetProcessAperturesArgs,
    GetProcessAperturesNewArgs, GetQueueWaveStateArgs, GetTileConfigArgs, GetVersionArgs,
    MapMemoryToGpuArgs, ResetEventArgs, SetCuMaskArgs, SetEventArgs, SetMemoryPolicyArgs,
    SetScratchBackingVaArgs, SetTrapHandlerArgs, UnmapMemoryFromGpuArgs, UpdateQueueArgs,
    WaitEventsArgs,
};
use crate::utils::{IOC_READ, IOC_WRITE, ioc_dir, ioc_nr, ioc_size};
use zerocopy::{FromBytes, IntoBytes};

macro_rules! requests {
    ($($variant:ident($args:ty) = $cmd:ident,)+) => {
        /// One decoded ioctl argument struct.
        #[derive(Debug, Clone, Copy)]
        pub enum Request {
            $($variant($args),)+
        }

        /// Kernel command of every supported ioctl.
        const DESCRIPTORS: &[u32] = &[$($cmd,)+];

        impl Request {
            fn decode(kernel_cmd: u32, blob: &[u8]) -> KfdResult<Self> {
                $(
                    if kernel_cmd == $cmd {
                        let (args, _) = <$args>::read_from_prefix(blob)
                            .map_err(|_| KfdError::InvalidArgument("short ioctl argument"))?;
                        return Ok(Self::$variant(args));
                    }
                )+
                Err(KfdError::InvalidArgument("no handler for ioctl"))
            }

            /// The argument struct as the kernel sees it.
            #[must_use]
            pub fn as_bytes(&self) -> &[u8] {
                match self {
                    $(Self::$variant(args) => args.as_bytes(),)+
                }
            }

            #[must_use]
            pub const fn name(&self) -> &'static str {
                match self {
                    $(Self::$variant(_) => stringify!($variant),)+
                }
            }
        }
    };
}

requests! {
    GetVersion(GetVersionArgs) = AMDKFD_IOC_GET_VERSION,
    CreateQueue(CreateQueueArgs) = AMDKFD_IOC_CREATE_QUEUE,
    DestroyQueue(DestroyQueueArgs) = AMDKFD_IOC_DESTROY_QUEUE,
    SetMemoryPolicy(SetMemoryPolicyArgs) = AMDKFD_IOC_SET_MEMORY_POLICY,
    GetClockCounters(GetClockCountersArgs) = AMDKFD_IOC_GET_CLOCK_COUNTERS,
    GetProcessApertures(GetProcessAperturesArgs) = AMDKFD_IOC_GET_PROCESS_APERTURES,
    UpdateQueue(UpdateQueueArgs) = AMDKFD_IOC_UPDATE_QUEUE,
    CreateEvent(CreateEventArgs) = AMDKFD_IOC_CREATE_EVENT,
    DestroyEvent(DestroyEventArgs) = AMDKFD_IOC_DESTROY_EVENT,
    SetEvent(SetEventArgs) = AMDKFD_IOC_SET_EVENT,
    ResetEvent(ResetEventArgs) = AMDKFD_IOC_RESET_EVENT,
    WaitEvents(WaitEventsArgs) = AMDKFD_IOC_WAIT_EVENTS,
    DbgRegister(DbgRegisterArgs) = AMDKFD_IOC_DBG_REGISTER,
    DbgUnregister(DbgUnregisterArgs) = AMDKFD_IOC_DBG_UNREGISTER,
    DbgAddressWatch(DbgAddressWatchArgs) = AMDKFD_IOC_DBG_ADDRESS_WATCH,
    DbgWaveControl(DbgWaveControlArgs) = AMDKFD_IOC_DBG_WAVE_CONTROL,
    SetScratchBackingVa(SetScratchBackingVaArgs) = AMDKFD_IOC_SET_SCRATCH_BACKING_VA,
    GetTileConfig(GetTileConfigArgs) = AMDKFD_IOC_GET_TILE_CONFIG,
    SetTrapHandler(SetTrapHandlerArgs) = AMDKFD_IOC_SET_TRAP_HANDLER,
    GetProcessAperturesNew(GetProcessAperturesNewArgs) = AMDKFD_IOC_GET_PROCESS_APERTURES_NEW,
    AcquireVm(AcquireVmArgs) = AMDKFD_IOC_ACQUIRE_VM,
    AllocMemoryOfGpu(AllocMemoryOfGpuArgs) = AMDKFD_IOC_ALLOC_MEMORY_OF_GPU,
    FreeMemoryOfGpu(FreeMemoryOfGpuArgs) = AMDKFD_IOC_FREE_MEMORY_OF_GPU,
    MapMemoryToGpu(MapMemoryToGpuArgs) = AMDKFD_IOC_MAP_MEMORY_TO_GPU,
    UnmapMemoryFromGpu(UnmapMemoryFromGpuArgs) = AMDKFD_IOC_UNMAP_MEMORY_FROM_GPU,
    SetCuMask(SetCuMaskArgs) = AMDKFD_IOC_SET_CU_MASK,
    GetQueueWaveState(GetQueueWaveStateArgs) = AMDKFD_IOC_GET_QUEUE_WAVE_STATE,
    AllocQueueGws(AllocQueueGwsArgs) = AMDKFD_IOC_ALLOC_QUEUE_GWS,
    DbgTrap(DbgTrapArgs) = AMDKFD_IOC_DBG_TRAP,
    CrossMemoryCopy(CrossMemoryCopyArgs) = AMDKFD_IOC_CROSS_MEMORY_COPY,
}

/// Whether `nr` falls in one of the two command ranges.
#[must_use]
pub fn is_known_nr(nr: u32) -> bool {
    (AMDKFD_COMMAND_START..AMDKFD_COMMAND_END).contains(&nr)
        || (AMDKFD_COMMAND_START_2..AMDKFD_COMMAND_END_2).contains(&nr)
}

/// The kernel command registered under the number of `cmd`, if any.
#[must_use]
pub fn kernel_cmd(cmd: u32) -> Option<u32> {
    let nr = ioc_nr(cmd);
    DESCRIPTORS.iter().copied().find(|kcmd| ioc_nr(*kcmd) == nr)
}

/// A request decoded from a user blob, with what is needed to copy it back.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub request: Request,
    user_cmd: u32,
}

impl Frame {
    /// Decodes the user blob of `user_cmd` as the kernel struct of `kernel_cmd`.
    ///
    /// Only the `usize` bytes encoded in `user_cmd` are read, and only when
    /// user space passes data in. The rest of the kernel struct is zero.
    ///
    /// # Errors
    /// `Fault` if `user` is shorter than the size encoded in `user_cmd`.
    pub fn decode(user_cmd: u32, kernel_cmd: u32, user: &[u8]) -> KfdResult<Self> {
        let usize = ioc_size(user_cmd);
        let ksize = ioc_size(kernel_cmd);
        let input = user.get(..usize).ok_or(KfdError::Fault(0))?;

        let mut blob = vec![0u8; usize.max(ksize)];
        if ioc_dir(user_cmd) & IOC_WRITE != 0 {
            blob[..usize].copy_from_slice(input);
        }
        Ok(Self {
            request: Request::decode(kernel_cmd, &blob)?,
            user_cmd,
        })
    }

    /// Copies the request back into `user` if the command returns data.
    pub fn write_back(&self, user: &mut [u8]) {
        let dir = ioc_dir(self.user_cmd);
        if dir & IOC_READ == 0 {
            return;
        }
        let usize = ioc_size(self.user_cmd).min(user.len());
        let out = self.request.as_bytes();
        let n = out.len().min(usize);
        user[..n].copy_from_slice(&out[..n]);
        if dir & IOC_WRITE == 0 {
            user[n..usize].fill(0);
        }
    }
}
