//! Per-device process settings programmed through the queue manager: cache
//! policy, trap handler, scratch backing and the graphics VM.

use crate::error::{KfdError, KfdResult};
use crate::kfd::device::{CachePolicy, DeviceRegistry, KfdDevice, MemoryPolicy};
use crate::kfd::host::DrmFile;
use crate::kfd::ioctl::{
    KFD_IOC_CACHE_POLICY_COHERENT, KFD_IOC_CACHE_POLICY_NONCOHERENT, SetMemoryPolicyArgs,
};
use crate::process::Process;
use std::sync::Arc;

fn cache_policy_from_ioctl(policy: u32) -> KfdResult<CachePolicy> {
    match policy {
        KFD_IOC_CACHE_POLICY_COHERENT => Ok(CachePolicy::Coherent),
        KFD_IOC_CACHE_POLICY_NONCOHERENT => Ok(CachePolicy::NonCoherent),
        _ => {
            tracing::debug!(policy, "unknown cache policy");
            Err(KfdError::InvalidArgument("cache policy"))
        }
    }
}

/// Resolves the device of a settings ioctl; these report an unknown id as a
/// bad argument.
fn settings_device(devices: &DeviceRegistry, gpu_id: u32) -> KfdResult<Arc<KfdDevice>> {
    devices
        .lookup(gpu_id)
        .map_err(|_| KfdError::InvalidArgument("gpu id"))
}

impl Process {
    /// # Errors
    /// `InvalidArgument` for unknown policies or devices, `NoSuchProcess` if
    /// binding fails, or the device error.
    pub fn set_memory_policy(&self, devices: &DeviceRegistry, args: &SetMemoryPolicyArgs) -> KfdResult<()> {
        let policy = MemoryPolicy {
            default_policy: cache_policy_from_ioctl(args.default_policy)?,
            alternate_policy: cache_policy_from_ioctl(args.alternate_policy)?,
            alternate_aperture_base: args.alternate_aperture_base,
            alternate_aperture_size: args.alternate_aperture_size,
        };
        let device = settings_device(devices, args.gpu_id)?;

        let mut state = self.state.lock();
        let pdd = state
            .bind(&device, self.pasid())
            .map_err(|_| KfdError::NoSuchProcess(self.tgid()))?;
        device.backend().set_memory_policy(self.pasid(), &policy)?;
        pdd.qpd.memory_policy = Some(policy);
        Ok(())
    }

    /// # Errors
    /// `InvalidArgument` for an unknown device, `NoSuchProcess` if binding
    /// fails, or the device error.
    pub fn set_trap_handler(&self, devices: &DeviceRegistry, gpu_id: u32, tba_addr: u64, tma_addr: u64) -> KfdResult<()> {
        let device = settings_device(devices, gpu_id)?;

        let mut state = self.state.lock();
        let pdd = state
            .bind(&device, self.pasid())
            .map_err(|_| KfdError::NoSuchProcess(self.tgid()))?;
        device.backend().set_trap_handler(self.pasid(), tba_addr, tma_addr)?;
        pdd.tba_addr = tba_addr;
        pdd.tma_addr = tma_addr;
        Ok(())
    }

    /// Records the hidden private (scratch) base. Without the hardware
    /// scheduler the VMID is programmed directly once one is assigned.
    ///
    /// # Errors
    /// `InvalidArgument` for an unknown device, or binding errors.
    pub fn set_scratch_backing_va(&self, devices: &DeviceRegistry, gpu_id: u32, va_addr: u64) -> KfdResult<()> {
        let device = settings_device(devices, gpu_id)?;

        let vmid = {
            let mut state = self.state.lock();
            let pdd = state.bind(&device, self.pasid())?;
            pdd.qpd.sh_hidden_private_base = va_addr;
            pdd.qpd.vmid
        };

        if device.is_no_hws()
            && let Some(vmid) = vmid
        {
            device.backend().set_scratch_backing_va(vmid, va_addr);
        }
        Ok(())
    }

    /// Adopts the VM of a graphics file for `device`.
    ///
    /// # Errors
    /// `InvalidArgument` for an unknown device, `Busy` if the binding already
    /// has a different VM, or the device error.
    pub fn acquire_vm(&self, devices: &DeviceRegistry, gpu_id: u32, drm: DrmFile) -> KfdResult<()> {
        let device = settings_device(devices, gpu_id)?;

        let mut state = self.state.lock();
        let pdd = state.pdd_or_insert(&device, self.pasid());
        pdd.init_vm(Some(drm), self.pasid())
    }
}
