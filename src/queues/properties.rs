use crate::error::{KfdError, KfdResult};
use crate::kfd::host::AddressSpace;
use crate::kfd::ioctl::{
    CreateQueueArgs, KFD_IOC_QUEUE_TYPE_COMPUTE, KFD_IOC_QUEUE_TYPE_COMPUTE_AQL,
    KFD_IOC_QUEUE_TYPE_SDMA, KFD_IOC_QUEUE_TYPE_SDMA_XGMI, KFD_MAX_QUEUE_PERCENTAGE,
    KFD_MAX_QUEUE_PRIORITY, UpdateQueueArgs,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueType {
    Compute,
    Sdma,
    SdmaXgmi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueFormat {
    Pm4,
    Aql,
}

/// Decodes `KFD_IOC_QUEUE_TYPE_*`; AQL is a compute queue with the AQL packet format.
///
/// # Errors
/// `InvalidArgument` for unknown types.
pub fn queue_type_from_ioctl(queue_type: u32) -> KfdResult<(QueueType, QueueFormat)> {
    match queue_type {
        KFD_IOC_QUEUE_TYPE_COMPUTE => Ok((QueueType::Compute, QueueFormat::Pm4)),
        KFD_IOC_QUEUE_TYPE_COMPUTE_AQL => Ok((QueueType::Compute, QueueFormat::Aql)),
        KFD_IOC_QUEUE_TYPE_SDMA => Ok((QueueType::Sdma, QueueFormat::Pm4)),
        KFD_IOC_QUEUE_TYPE_SDMA_XGMI => Ok((QueueType::SdmaXgmi, QueueFormat::Pm4)),
        _ => {
            tracing::debug!(queue_type, "unsupported queue type");
            Err(KfdError::InvalidArgument("queue type"))
        }
    }
}

#[must_use]
pub const fn queue_type_to_ioctl(queue_type: QueueType, format: QueueFormat) -> u32 {
    match (queue_type, format) {
        (QueueType::Compute, QueueFormat::Aql) => KFD_IOC_QUEUE_TYPE_COMPUTE_AQL,
        (QueueType::Compute, QueueFormat::Pm4) => KFD_IOC_QUEUE_TYPE_COMPUTE,
        (QueueType::Sdma, _) => KFD_IOC_QUEUE_TYPE_SDMA,
        (QueueType::SdmaXgmi, _) => KFD_IOC_QUEUE_TYPE_SDMA_XGMI,
    }
}

/// Everything the queue manager and the hardware know about one queue.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueProperties {
    pub queue_id: u32,
    pub gpu_id: u32,
    pub queue_type: QueueType,
    pub format: QueueFormat,

    pub ring_base_address: u64,
    pub ring_size: u64,
    pub read_pointer_address: u64,
    pub write_pointer_address: u64,

    pub eop_buffer_address: u64,
    pub eop_buffer_size: u64,
    pub ctx_save_restore_address: u64,
    pub ctx_save_restore_size: u32,
    pub ctl_stack_size: u32,

    pub queue_percentage: u32,
    pub queue_priority: u32,

    pub doorbell_off: u32,
    /// One bit per compute unit, at most 1024 bits.
    pub cu_mask: Vec<u32>,
    pub is_gws: bool,
    pub is_suspended: bool,
}

fn check_scheduling_hints(percentage: u32, priority: u32) -> KfdResult<()> {
    if percentage > KFD_MAX_QUEUE_PERCENTAGE {
        tracing::debug!(percentage, "queue percentage must be between 0 and 100");
        return Err(KfdError::InvalidArgument("queue percentage"));
    }
    if priority > KFD_MAX_QUEUE_PRIORITY {
        tracing::debug!(priority, "queue priority must be between 0 and 15");
        return Err(KfdError::InvalidArgument("queue priority"));
    }
    Ok(())
}

fn check_ring(mm: &dyn AddressSpace, ring_base: u64, ring_size: u64) -> KfdResult<()> {
    if ring_base != 0 && !mm.access_ok(ring_base, size_of::<u64>() as u64) {
        tracing::debug!(ring_base, "can't access ring base address");
        return Err(KfdError::Fault(ring_base));
    }
    if ring_size != 0 && !ring_size.is_power_of_two() {
        tracing::debug!(ring_size, "ring size must be a power of 2 or 0");
        return Err(KfdError::InvalidArgument("ring size"));
    }
    Ok(())
}

fn check_user_addr(mm: &dyn AddressSpace, addr: u64, len: u64, what: &'static str) -> KfdResult<()> {
    if addr != 0 && !mm.access_ok(addr, len) {
        tracing::debug!(addr, what, "can't access user address");
        return Err(KfdError::Fault(addr));
    }
    Ok(())
}

impl QueueProperties {
    /// Validates a create request against the caller's address space.
    ///
    /// # Errors
    /// `InvalidArgument` for out-of-range hints, a bad ring size or queue
    /// type; `Fault` for an inaccessible address.
    pub fn from_create_args(args: &CreateQueueArgs, mm: &dyn AddressSpace) -> KfdResult<Self> {
        check_scheduling_hints(args.queue_percentage, args.queue_priority)?;
        check_ring(mm, args.ring_base_address, u64::from(args.ring_size))?;
        check_user_addr(mm, args.read_pointer_address, 4, "read pointer")?;
        check_user_addr(mm, args.write_pointer_address, 4, "write pointer")?;
        check_user_addr(mm, args.eop_buffer_address, 4, "EOP buffer")?;
        check_user_addr(mm, args.ctx_save_restore_address, 4, "context save area")?;
        let (queue_type, format) = queue_type_from_ioctl(args.queue_type)?;

        Ok(Self {
            queue_id: 0,
            gpu_id: args.gpu_id,
            queue_type,
            format,
            ring_base_address: args.ring_base_address,
            ring_size: u64::from(args.ring_size),
            read_pointer_address: args.read_pointer_address,
            write_pointer_address: args.write_pointer_address,
            eop_buffer_address: args.eop_buffer_address,
            eop_buffer_size: args.eop_buffer_size,
            ctx_save_restore_address: args.ctx_save_restore_address,
            ctx_save_restore_size: args.ctx_save_restore_size,
            ctl_stack_size: args.ctl_stack_size,
            queue_percentage: args.queue_percentage,
            queue_priority: args.queue_priority,
            doorbell_off: 0,
            cu_mask: Vec::new(),
            is_gws: false,
            is_suspended: false,
        })
    }

    /// # Errors
    /// Same rules as creation for the fields an update may change.
    pub fn check_update(args: &UpdateQueueArgs, mm: &dyn AddressSpace) -> KfdResult<()> {
        check_scheduling_hints(args.queue_percentage, args.queue_priority)?;
        check_ring(mm, args.ring_base_address, u64::from(args.ring_size))
    }

    pub fn apply_update(&mut self, args: &UpdateQueueArgs) {
        self.ring_base_address = args.ring_base_address;
        self.ring_size = u64::from(args.ring_size);
        self.queue_percentage = args.queue_percentage;
        self.queue_priority = args.queue_priority;
    }

    /// A queue is scheduled only when it has a ring and a share of the GPU.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.ring_size > 0 && self.ring_base_address != 0 && self.queue_percentage > 0
    }

    #[must_use]
    pub const fn ioctl_type(&self) -> u32 {
        queue_type_to_ioctl(self.queue_type, self.format)
    }
}
