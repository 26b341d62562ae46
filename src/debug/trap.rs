use crate::error::{KfdError, KfdResult};
use crate::kfd::Kfd;
use crate::kfd::host::{Task, copy_array_from_user, copy_to_user};
use crate::kfd::ioctl::{
    DbgTrapArgs, KFD_DBG_EV_FLAG_CLEAR_STATUS, KFD_IOC_DBG_TRAP_CLEAR_ADDRESS_WATCH,
    KFD_IOC_DBG_TRAP_ENABLE, KFD_IOC_DBG_TRAP_GET_QUEUE_SNAPSHOT, KFD_IOC_DBG_TRAP_GET_VERSION,
    KFD_IOC_DBG_TRAP_NODE_RESUME, KFD_IOC_DBG_TRAP_NODE_SUSPEND,
    KFD_IOC_DBG_TRAP_QUERY_DEBUG_EVENT, KFD_IOC_DBG_TRAP_SET_ADDRESS_WATCH,
    KFD_IOC_DBG_TRAP_SET_PRECISE_MEM_OPS, KFD_IOC_DBG_TRAP_SET_WAVE_LAUNCH_MODE,
    KFD_IOC_DBG_TRAP_SET_WAVE_LAUNCH_OVERRIDE,
};
use crate::kfd::device::KfdDevice;
use crate::process::ProcessRef;
use crate::process::pdd::ProcessDevice;

pub const KFD_DBG_TRAP_VERSION_MAJOR: u32 = 3;
pub const KFD_DBG_TRAP_VERSION_MINOR: u32 = 3;

const fn needs_device(op: u32) -> bool {
    !matches!(
        op,
        KFD_IOC_DBG_TRAP_NODE_SUSPEND
            | KFD_IOC_DBG_TRAP_NODE_RESUME
            | KFD_IOC_DBG_TRAP_GET_QUEUE_SNAPSHOT
            | KFD_IOC_DBG_TRAP_GET_VERSION
    )
}

impl Kfd {
    /// Runs one debug-trap operation on the process `args.pid`.
    ///
    /// Returns the number of queues processed for `NODE_SUSPEND` and
    /// `NODE_RESUME`, 0 otherwise. Outputs go back through `args`.
    ///
    /// # Errors
    /// `NoSuchProcess` when the target does not resolve or is neither the
    /// caller nor traced by it, `InvalidArgument` for unsupported devices and
    /// bad state transitions, `Busy` under the GWS workaround, `Fault` for
    /// unreadable queue arrays.
    pub fn dbg_trap(&self, process: &ProcessRef, caller: &Task, args: &mut DbgTrapArgs) -> KfdResult<u32> {
        let thread = self
            .host()
            .find_task(args.pid)
            .ok_or(KfdError::NoSuchProcess(args.pid))?;

        let is_attach = args.op == KFD_IOC_DBG_TRAP_ENABLE && args.data1 == 1;
        let target = if is_attach && thread.tgid != caller.tgid && thread.is_traced_by(caller.tgid) {
            self.processes().create_or_get(&thread)?
        } else {
            self.processes()
                .lookup_by_tgid(thread.tgid)
                .ok_or(KfdError::NoSuchProcess(args.pid))?
        };
        if !target.ptr_eq(process) && !thread.is_traced_by(caller.tgid) {
            tracing::debug!(pid = args.pid, tracer = caller.tgid, "debug target is not traced by caller");
            return Err(KfdError::NoSuchProcess(args.pid));
        }

        tracing::debug!(pid = args.pid, gpu_id = args.gpu_id, op = args.op, "debug trap");
        if !needs_device(args.op) {
            return Self::dbg_trap_process_op(&target, caller, args);
        }

        let device = self.devices().lookup(args.gpu_id).map_err(|_| {
            tracing::debug!(gpu_id = args.gpu_id, "debug trap on unknown device");
            KfdError::InvalidArgument("gpu id")
        })?;
        if !device.is_soc15() {
            tracing::debug!(gpu_id = device.gpu_id, asic = ?device.asic, "debug trap needs a SOC15 device");
            return Err(KfdError::InvalidArgument("debug trap not supported on this ASIC"));
        }
        if device.is_no_hws() {
            return Err(KfdError::InvalidArgument("debug trap needs hardware scheduling"));
        }

        let mut guard = target.state.lock();
        let pdd = guard.bind(&device, target.pasid()).map_err(|err| {
            tracing::debug!(gpu_id = device.gpu_id, %err, "failed to bind debug target");
            KfdError::InvalidArgument("cannot bind debug target")
        })?;
        if device.gws_debug_workaround && pdd.qpd.num_gws > 0 {
            return Err(KfdError::Busy("GWS allocated under the debug workaround"));
        }
        if args.op != KFD_IOC_DBG_TRAP_ENABLE && !pdd.debug_trap_enabled {
            return Err(KfdError::InvalidArgument("debug trap not enabled"));
        }

        match args.op {
            KFD_IOC_DBG_TRAP_ENABLE => match args.data1 {
                0 => {
                    let session = Self::disable_trap(&target, pdd)?;
                    drop(guard);
                    // The session reference may be the last one on the target.
                    drop(session);
                    Ok(0)
                }
                1 => {
                    self.enable_trap(&target, &device, pdd, args)?;
                    Ok(0)
                }
                _ => Err(KfdError::InvalidArgument("enable takes 0 or 1")),
            },
            KFD_IOC_DBG_TRAP_SET_WAVE_LAUNCH_OVERRIDE => {
                let (previous, supported) = device.backend().set_wave_launch_trap_override(
                    device.debug_vmid,
                    args.data1,
                    args.data2,
                    args.data3,
                )?;
                args.data2 = previous;
                args.data3 = supported;
                Ok(0)
            }
            KFD_IOC_DBG_TRAP_SET_WAVE_LAUNCH_MODE => {
                pdd.wave_launch_mode = args.data1;
                device
                    .backend()
                    .set_wave_launch_mode(args.data1, device.debug_vmid);
                Ok(0)
            }
            KFD_IOC_DBG_TRAP_QUERY_DEBUG_EVENT => {
                let clear = args.data2 & KFD_DBG_EV_FLAG_CLEAR_STATUS != 0;
                let (queue_id, status) = target.events.lock().query_debug_event(args.data1, clear)?;
                args.data1 = queue_id;
                args.data3 = status;
                Ok(0)
            }
            KFD_IOC_DBG_TRAP_CLEAR_ADDRESS_WATCH => {
                let bit = 1u32
                    .checked_shl(args.data1)
                    .filter(|bit| pdd.watch_point_bitmask & bit != 0)
                    .ok_or(KfdError::InvalidArgument("watch point not owned"))?;
                device.release_watch_points(bit);
                pdd.watch_point_bitmask ^= bit;
                Ok(0)
            }
            KFD_IOC_DBG_TRAP_SET_ADDRESS_WATCH => {
                if args.ptr == 0 {
                    return Err(KfdError::InvalidArgument("null watch address"));
                }
                let id = device.allocate_watch_point(args.ptr, args.data3, args.data2)?;
                pdd.watch_point_bitmask |= 1 << id;
                args.data1 = id;
                Ok(0)
            }
            KFD_IOC_DBG_TRAP_SET_PRECISE_MEM_OPS => match args.data1 {
                0 | 1 => {
                    device
                        .backend()
                        .set_precise_mem_ops(device.debug_vmid, args.data1 == 1)?;
                    Ok(0)
                }
                _ => Err(KfdError::InvalidArgument("precise memory ops takes 0 or 1")),
            },
            op => {
                tracing::debug!(op, "unknown debug trap op");
                Err(KfdError::InvalidArgument("unknown debug trap op"))
            }
        }
    }

    fn dbg_trap_process_op(target: &ProcessRef, caller: &Task, args: &mut DbgTrapArgs) -> KfdResult<u32> {
        match args.op {
            KFD_IOC_DBG_TRAP_NODE_SUSPEND | KFD_IOC_DBG_TRAP_NODE_RESUME => {
                if args.data2 == 0 {
                    return Ok(0);
                }
                let mut queue_ids: Vec<u32> =
                    copy_array_from_user(caller.mm.as_ref(), args.ptr, args.data2 as usize)?;
                let processed = if args.op == KFD_IOC_DBG_TRAP_NODE_SUSPEND {
                    target.suspend_queues(&mut queue_ids, args.data3, args.data1)
                } else {
                    target.resume_queues(&mut queue_ids, args.data1)
                };
                copy_to_user(caller.mm.as_ref(), args.ptr, &queue_ids)?;
                Ok(processed)
            }
            KFD_IOC_DBG_TRAP_GET_QUEUE_SNAPSHOT => {
                let capacity = args.data2;
                let snapshot = target.queue_snapshot(args.data1, capacity);
                if !snapshot.entries.is_empty() {
                    copy_to_user(caller.mm.as_ref(), args.ptr, &snapshot.entries)?;
                }
                args.data2 = if capacity == 0 {
                    snapshot.total
                } else {
                    snapshot.entries.len() as u32
                };
                Ok(0)
            }
            _ => {
                args.data1 = KFD_DBG_TRAP_VERSION_MAJOR;
                args.data2 = KFD_DBG_TRAP_VERSION_MINOR;
                Ok(0)
            }
        }
    }

    /// Turns the trap on for `pdd` and installs the debug-event descriptor,
    /// undoing everything if the descriptor cannot be installed.
    fn enable_trap(
        &self,
        target: &ProcessRef,
        device: &KfdDevice,
        pdd: &mut ProcessDevice,
        args: &mut DbgTrapArgs,
    ) -> KfdResult<()> {
        if pdd.debug_trap_enabled {
            return Err(KfdError::InvalidArgument("debug trap already enabled"));
        }
        let backend = device.backend();
        backend.reserve_debug_vmid()?;
        pdd.debug_trap_enabled = true;
        backend.enable_debug_trap(device.debug_vmid);

        let fifo = target.events.lock().open_debug_fifo(device.gpu_id);
        match self.host().install_debug_event_fd(fifo) {
            Ok(fd) => {
                args.data3 = fd as u32;
                pdd.debug_session = Some(target.clone());
                tracing::debug!(gpu_id = device.gpu_id, pasid = target.pasid(), fd, "debug trap enabled");
                Ok(())
            }
            Err(err) => {
                tracing::error!(gpu_id = device.gpu_id, %err, "failed to install debug event file");
                pdd.disable_debug_trap();
                target.events.lock().close_debug_fifo(device.gpu_id);
                Err(err)
            }
        }
    }

    /// Turns the trap off and hands back the session reference, which the
    /// caller drops once the process mutex is released.
    fn disable_trap(target: &ProcessRef, pdd: &mut ProcessDevice) -> KfdResult<Option<ProcessRef>> {
        if !pdd.debug_trap_enabled {
            return Err(KfdError::InvalidArgument("debug trap not enabled"));
        }
        pdd.disable_debug_trap();
        target.events.lock().close_debug_fifo(pdd.gpu_id());
        tracing::debug!(gpu_id = pdd.gpu_id(), pasid = target.pasid(), "debug trap disabled");
        Ok(pdd.debug_session.take())
    }
}
