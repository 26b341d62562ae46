use super::properties::QueueProperties;
use crate::error::{KfdError, KfdResult};
use crate::kfd::device::DeviceRegistry;
use crate::kfd::host::copy_to_user;
use crate::kfd::ioctl::{
    CreateQueueArgs, KFD_DBG_EV_FLAG_CLEAR_STATUS, KFD_DBG_QUEUE_ERROR_MASK,
    KFD_DBG_QUEUE_INVALID_MASK, KFD_MMAP_TYPE_DOORBELL, QueueSnapshotEntry, UpdateQueueArgs,
    mmap_gpu_id,
};
use crate::process::Process;
use std::sync::Arc;

/// CU masks longer than this many bits are truncated.
pub const MAX_CU_MASK_BITS: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedQueue {
    pub queue_id: u32,
    /// mmap offset of the doorbell, including the queue's offset inside the
    /// process doorbell page on SOC15 parts.
    pub doorbell_offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSnapshot {
    /// Number of queues the process owns.
    pub total: u32,
    pub entries: Vec<QueueSnapshotEntry>,
}

impl Process {
    /// # Errors
    /// Validation errors from [`QueueProperties::from_create_args`],
    /// `NoSuchDevice` for an unknown GPU, `NoSuchProcess` if binding fails,
    /// `OutOfMemory` when the process is out of queue ids.
    pub fn create_queue(&self, devices: &DeviceRegistry, args: &CreateQueueArgs) -> KfdResult<CreatedQueue> {
        let props = QueueProperties::from_create_args(args, self.mm().as_ref())?;
        let device = devices.lookup(args.gpu_id)?;
        let pasid = self.pasid();

        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.bind(&device, pasid).map_err(|err| {
            tracing::debug!(gpu_id = device.gpu_id, pasid, %err, "failed to bind process for queue");
            KfdError::NoSuchProcess(self.tgid())
        })?;

        let max_queues = self.config().max_queues_per_process;
        let (queue_id, hw) = state.pqm.create_queue(pasid, &device, props, max_queues)?;
        if let Some(vmid) = hw.vmid
            && let Some(pdd) = state.pdds.get_mut(&device.gpu_id)
        {
            pdd.qpd.vmid = Some(vmid);
        }
        self.events.lock().register_queue(queue_id, device.gpu_id, hw.doorbell_off);

        let mut doorbell_offset = KFD_MMAP_TYPE_DOORBELL | mmap_gpu_id(device.gpu_id);
        if device.is_soc15() {
            // SOC15 doorbells are 64-bit; the offset is in dwords.
            doorbell_offset |= (u64::from(hw.doorbell_off) * 4) & (device.doorbell_process_slice() - 1);
        }

        tracing::debug!(pasid, queue_id, gpu_id = device.gpu_id, doorbell_offset, "created queue");
        Ok(CreatedQueue {
            queue_id,
            doorbell_offset,
        })
    }

    /// # Errors
    /// `NotFound` for an unknown queue, or the device error.
    pub fn destroy_queue(&self, queue_id: u32) -> KfdResult<()> {
        let mut state = self.state.lock();
        state.pqm.destroy_queue(self.pasid(), queue_id)?;
        self.events.lock().unregister_queue(queue_id);
        tracing::debug!(pasid = self.pasid(), queue_id, "destroyed queue");
        Ok(())
    }

    /// # Errors
    /// The create-time checks for the updated fields, `NotFound` for an
    /// unknown queue, or the device error.
    pub fn update_queue(&self, args: &UpdateQueueArgs) -> KfdResult<()> {
        QueueProperties::check_update(args, self.mm().as_ref())?;
        self.state
            .lock()
            .pqm
            .update_queue(self.pasid(), args.queue_id, |props| props.apply_update(args))
    }

    /// Replaces the CU mask of a queue. `num_cu_mask` is in bits.
    ///
    /// # Errors
    /// `InvalidArgument` if the length is zero, not a multiple of 32, or
    /// longer than `mask`; `NotFound` for an unknown queue.
    pub fn set_cu_mask(&self, queue_id: u32, num_cu_mask: u32, mask: &[u32]) -> KfdResult<()> {
        if num_cu_mask == 0 || num_cu_mask % 32 != 0 {
            tracing::debug!(num_cu_mask, "CU mask length must be a nonzero multiple of 32");
            return Err(KfdError::InvalidArgument("CU mask length"));
        }
        let num_cu_mask = if num_cu_mask > MAX_CU_MASK_BITS {
            tracing::debug!(num_cu_mask, "CU mask too long, truncating to 1024 bits");
            MAX_CU_MASK_BITS
        } else {
            num_cu_mask
        };
        let words = (num_cu_mask / 32) as usize;
        let mask = mask
            .get(..words)
            .ok_or(KfdError::InvalidArgument("CU mask buffer"))?
            .to_vec();

        self.state
            .lock()
            .pqm
            .update_queue(self.pasid(), queue_id, |props| props.cu_mask = mask)
    }

    /// Copies the control stack of a queue to `ctl_stack_address` and returns
    /// `(ctl_stack_used_size, save_area_used_size)`.
    ///
    /// # Errors
    /// `NotFound` for an unknown queue, the device error, or `Fault`.
    pub fn get_queue_wave_state(&self, queue_id: u32, ctl_stack_address: u64) -> KfdResult<(u32, u32)> {
        let state = self.state.lock();
        let queue = state.pqm.get(queue_id).ok_or(KfdError::NotFound("queue"))?;
        let wave = queue.device.backend().get_wave_state(self.pasid(), queue_id)?;

        let mut ctl_stack = wave.ctl_stack.as_slice();
        let limit = queue.props.ctl_stack_size as usize;
        if limit != 0 && ctl_stack.len() > limit {
            ctl_stack = &ctl_stack[..limit];
        }
        copy_to_user(self.mm().as_ref(), ctl_stack_address, ctl_stack)?;
        Ok((ctl_stack.len() as u32, wave.save_area_used_size))
    }

    /// Gives a queue the device's global wave sync resource, or takes it back
    /// when `num_gws` is zero. Returns the first GWS index.
    ///
    /// # Errors
    /// `NotFound` for an unknown queue or a device without GWS, `Unsupported`
    /// without hardware scheduling, `Busy` while the debugger conflicts or the
    /// resource is already held, `InvalidArgument` to release what isn't held.
    pub fn alloc_queue_gws(&self, queue_id: u32, num_gws: u32) -> KfdResult<u32> {
        let pasid = self.pasid();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let device = state
            .pqm
            .get(queue_id)
            .map(|queue| Arc::clone(&queue.device))
            .ok_or(KfdError::NotFound("queue"))?;
        if device.num_gws == 0 {
            tracing::debug!(gpu_id = device.gpu_id, "device has no GWS");
            return Err(KfdError::NotFound("GWS"));
        }
        if device.is_no_hws() {
            return Err(KfdError::Unsupported("GWS needs hardware scheduling"));
        }

        let pdd = state
            .pdds
            .get_mut(&device.gpu_id)
            .ok_or(KfdError::NotFound("process device"))?;
        if device.gws_debug_workaround && pdd.debug_trap_enabled {
            return Err(KfdError::Busy("GWS is unavailable while debugging"));
        }

        let want = num_gws != 0;
        match (want, pdd.qpd.num_gws != 0) {
            (true, true) => return Err(KfdError::Busy("GWS already allocated")),
            (false, false) => return Err(KfdError::InvalidArgument("no GWS to release")),
            _ => {}
        }

        device.backend().set_queue_gws(pasid, queue_id, want)?;
        pdd.qpd.num_gws = if want { device.num_gws } else { 0 };
        if let Some(queue) = state.pqm.get_mut(queue_id) {
            queue.props.is_gws = want;
        }
        tracing::debug!(pasid, queue_id, want, "updated queue GWS");
        Ok(0)
    }

    /// Describes up to `capacity` queues in creation order.
    #[must_use]
    pub fn queue_snapshot(&self, flags: u32, capacity: u32) -> QueueSnapshot {
        let state = self.state.lock();
        let mut events = self.events.lock();

        let entries = state
            .pqm
            .iter()
            .take(capacity as usize)
            .map(|queue| {
                let props = &queue.props;
                let queue_status = events.queue_status(props.queue_id).unwrap_or(0);
                if flags & KFD_DBG_EV_FLAG_CLEAR_STATUS != 0 {
                    events.clear_queue_events(props.queue_id);
                }
                QueueSnapshotEntry {
                    ring_base_address: props.ring_base_address,
                    write_pointer_address: props.write_pointer_address,
                    read_pointer_address: props.read_pointer_address,
                    ctx_save_restore_address: props.ctx_save_restore_address,
                    queue_id: props.queue_id,
                    gpu_id: props.gpu_id,
                    ring_size: props.ring_size as u32,
                    queue_type: props.ioctl_type(),
                    queue_status,
                    ..Default::default()
                }
            })
            .collect();

        QueueSnapshot {
            total: state.pqm.len() as u32,
            entries,
        }
    }

    /// Suspends each listed queue. Ids that fail are flagged in place with
    /// `KFD_DBG_QUEUE_INVALID_MASK` or `KFD_DBG_QUEUE_ERROR_MASK`. Returns
    /// the number of queues suspended.
    pub fn suspend_queues(&self, queue_ids: &mut [u32], grace_period: u32, flags: u32) -> u32 {
        self.for_each_debug_queue(queue_ids, flags, true, |queue, pasid| {
            queue.device.backend().suspend_queue(pasid, queue.props.queue_id, grace_period)
        })
    }

    /// Resumes each listed queue, flagging failures like [`Self::suspend_queues`].
    pub fn resume_queues(&self, queue_ids: &mut [u32], flags: u32) -> u32 {
        self.for_each_debug_queue(queue_ids, flags, false, |queue, pasid| {
            queue.device.backend().resume_queue(pasid, queue.props.queue_id)
        })
    }

    fn for_each_debug_queue(
        &self,
        queue_ids: &mut [u32],
        flags: u32,
        suspend: bool,
        op: impl Fn(&super::Queue, u32) -> KfdResult<()>,
    ) -> u32 {
        let pasid = self.pasid();
        let mut state = self.state.lock();
        let mut events = self.events.lock();
        let mut processed = 0;

        for id in queue_ids.iter_mut() {
            let queue_id = *id;
            let Some(queue) = state.pqm.get_mut(queue_id) else {
                *id |= KFD_DBG_QUEUE_INVALID_MASK;
                continue;
            };
            if queue.props.is_suspended == suspend {
                *id |= KFD_DBG_QUEUE_ERROR_MASK;
                continue;
            }
            if let Err(err) = op(&*queue, pasid) {
                tracing::error!(pasid, queue_id, suspend, %err, "failed to change queue suspend state");
                *id |= KFD_DBG_QUEUE_ERROR_MASK;
                continue;
            }

            queue.props.is_suspended = suspend;
            events.set_queue_suspended(queue_id, suspend);
            if flags & KFD_DBG_EV_FLAG_CLEAR_STATUS != 0 {
                events.clear_queue_events(queue_id);
            }
            processed += 1;
        }
        processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kfd::ioctl::{
        KFD_DBG_EV_STATUS_NEW_QUEUE, KFD_DBG_EV_STATUS_SUSPENDED, KFD_IOC_QUEUE_TYPE_COMPUTE_AQL,
        KFD_MAX_QUEUE_PRIORITY, KFD_MMAP_TYPE_MASK, mmap_get_gpu_id,
    };
    use crate::testutil::TestBed;

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
    fn ids_are_reused_lowest_first() {
        let bed = TestBed::new();
        let process = bed.open(1);
        let a = process.create_queue(&bed.devices, &queue_args(bed.gpu_a)).unwrap();
        let b = process.create_queue(&bed.devices, &queue_args(bed.gpu_a)).unwrap();
        assert_eq!((a.queue_id, b.queue_id), (0, 1));

        process.destroy_queue(0).unwrap();
        let c = process.create_queue(&bed.devices, &queue_args(bed.gpu_a)).unwrap();
        assert_eq!(c.queue_id, 0);
    }

    #[test]
    fn doorbell_offset_encodes_type_and_gpu() {
        let bed = TestBed::new();
        let process = bed.open(1);
        let created = process.create_queue(&bed.devices, &queue_args(bed.gpu_a)).unwrap();

        assert_eq!(created.doorbell_offset & KFD_MMAP_TYPE_MASK, KFD_MMAP_TYPE_DOORBELL);
        assert_eq!(mmap_get_gpu_id(created.doorbell_offset), bed.gpu_a);
        assert!(created.doorbell_offset & 0xFFFF < bed.device_a.doorbell_process_slice());
    }

    #[test]
    fn unknown_device_and_queue_ids() {
        let bed = TestBed::new();
        let process = bed.open(1);
        assert!(matches!(
            process.create_queue(&bed.devices, &queue_args(0x9999)),
            Err(KfdError::NoSuchDevice(0x9999))
        ));
        assert!(matches!(process.destroy_queue(5), Err(KfdError::NotFound(_))));
    }

    #[test]
    fn rejected_create_leaves_no_queue() {
        let bed = TestBed::new();
        let process = bed.open(1);
        process.create_queue(&bed.devices, &queue_args(bed.gpu_a)).unwrap();

        let too_busy = CreateQueueArgs {
            queue_percentage: 101,
            ..queue_args(bed.gpu_a)
        };
        let too_urgent = CreateQueueArgs {
            queue_priority: KFD_MAX_QUEUE_PRIORITY + 1,
            ..queue_args(bed.gpu_a)
        };
        let odd_ring = CreateQueueArgs {
            ring_size: 3,
            ..queue_args(bed.gpu_a)
        };
        for args in [too_busy, too_urgent, odd_ring] {
            assert!(matches!(
                process.create_queue(&bed.devices, &args),
                Err(KfdError::InvalidArgument(_))
            ));
        }
        assert_eq!(process.state.lock().pqm.len(), 1);
        assert_eq!(bed.backend_a.live_queues(), 1);
    }

    #[test]
    fn queue_limit_is_out_of_memory() {
        let bed = TestBed::with_config(crate::config::KfdConfig::new().with_max_queues_per_process(1));
        let process = bed.open(1);
        process.create_queue(&bed.devices, &queue_args(bed.gpu_a)).unwrap();
        assert!(matches!(
            process.create_queue(&bed.devices, &queue_args(bed.gpu_a)),
            Err(KfdError::OutOfMemory)
        ));
    }

    #[test]
    fn update_keeps_the_id_and_validates() {
        let bed = TestBed::new();
        let process = bed.open(1);
        let id = process.create_queue(&bed.devices, &queue_args(bed.gpu_a)).unwrap().queue_id;

        let update = UpdateQueueArgs {
            ring_base_address: 0x3000,
            queue_id: id,
            ring_size: 0x2000,
            queue_percentage: 50,
            queue_priority: 1,
        };
        process.update_queue(&update).unwrap();
        let snapshot = process.queue_snapshot(0, 8);
        assert_eq!(snapshot.entries[0].ring_base_address, 0x3000);
        assert_eq!(snapshot.entries[0].ring_size, 0x2000);

        let bad = UpdateQueueArgs {
            ring_size: 0x1800,
            ..update
        };
        assert!(matches!(process.update_queue(&bad), Err(KfdError::InvalidArgument(_))));
    }

    #[test]
    fn cu_mask_length_rules() {
        let bed = TestBed::new();
        let process = bed.open(1);
        let id = process.create_queue(&bed.devices, &queue_args(bed.gpu_a)).unwrap().queue_id;
        let mask = vec![u32::MAX; 64];

        assert!(matches!(process.set_cu_mask(id, 0, &mask), Err(KfdError::InvalidArgument(_))));
        assert!(matches!(process.set_cu_mask(id, 33, &mask), Err(KfdError::InvalidArgument(_))));
        process.set_cu_mask(id, 32, &mask).unwrap();
        assert_eq!(bed.backend_a.last_cu_mask_len(), Some(1));
        process.set_cu_mask(id, 1024, &mask).unwrap();
        assert_eq!(bed.backend_a.last_cu_mask_len(), Some(32));
        assert_eq!(process.state.lock().pqm.get(id).map(|queue| queue.props.cu_mask.len()), Some(32));
        process.set_cu_mask(id, 2048, &mask).unwrap();
        assert_eq!(bed.backend_a.last_cu_mask_len(), Some(32));
        assert!(matches!(process.set_cu_mask(99, 32, &mask), Err(KfdError::NotFound(_))));
    }

    #[test]
    fn gws_allocation_rules() {
        let bed = TestBed::new();
        let process = bed.open(1);
        let on_a = process.create_queue(&bed.devices, &queue_args(bed.gpu_a)).unwrap().queue_id;
        let on_b = process.create_queue(&bed.devices, &queue_args(bed.gpu_b)).unwrap().queue_id;

        assert!(matches!(process.alloc_queue_gws(on_b, 1), Err(KfdError::NotFound(_))));
        assert!(matches!(process.alloc_queue_gws(on_a, 0), Err(KfdError::InvalidArgument(_))));
        assert_eq!(process.alloc_queue_gws(on_a, 1).unwrap(), 0);
        assert!(matches!(process.alloc_queue_gws(on_a, 1), Err(KfdError::Busy(_))));
        process.alloc_queue_gws(on_a, 0).unwrap();
    }

    #[test]
    fn gws_needs_hardware_scheduling() {
        let bed = TestBed::new();
        let process = bed.open(1);
        let id = process.create_queue(&bed.devices, &queue_args(bed.gpu_no_hws)).unwrap().queue_id;
        assert!(matches!(process.alloc_queue_gws(id, 1), Err(KfdError::Unsupported(_))));
    }

    #[test]
    fn snapshot_reports_new_queues_and_caps_entries() {
        let bed = TestBed::new();
        let process = bed.open(1);
        for _ in 0..3 {
            process.create_queue(&bed.devices, &queue_args(bed.gpu_a)).unwrap();
        }

        let snapshot = process.queue_snapshot(0, 2);
        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.entries.len(), 2);
        assert_eq!(snapshot.entries[1].queue_id, 1);
        assert_eq!(snapshot.entries[0].queue_status, KFD_DBG_EV_STATUS_NEW_QUEUE);
        assert_eq!(snapshot.entries[0].queue_type, KFD_IOC_QUEUE_TYPE_COMPUTE_AQL);
    }

    #[test]
    fn suspend_flags_bad_ids_in_place() {
        let bed = TestBed::new();
        let process = bed.open(1);
        let id = process.create_queue(&bed.devices, &queue_args(bed.gpu_a)).unwrap().queue_id;

        let mut ids = [id, 42];
        assert_eq!(process.suspend_queues(&mut ids, 0, 0), 1);
        assert_eq!(ids, [id, 42 | KFD_DBG_QUEUE_INVALID_MASK]);
        assert_ne!(process.queue_snapshot(0, 1).entries[0].queue_status & KFD_DBG_EV_STATUS_SUSPENDED, 0);

        let mut again = [id];
        assert_eq!(process.suspend_queues(&mut again, 0, 0), 0);
        assert_eq!(again[0], id | KFD_DBG_QUEUE_ERROR_MASK);

        let mut resume = [id];
        assert_eq!(process.resume_queues(&mut resume, 0), 1);
        assert_eq!(process.queue_snapshot(0, 1).entries[0].queue_status & KFD_DBG_EV_STATUS_SUSPENDED, 0);
    }

    #[test]
    fn teardown_destroys_remaining_queues() {
        let bed = TestBed::new();
        let process = bed.open(1);
        process.create_queue(&bed.devices, &queue_args(bed.gpu_a)).unwrap();
        process.create_queue(&bed.devices, &queue_args(bed.gpu_a)).unwrap();
        assert_eq!(bed.backend_a.live_queues(), 2);

        drop(process);
        assert_eq!(bed.backend_a.live_queues(), 0);
    }
}
