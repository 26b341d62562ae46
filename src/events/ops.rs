use crate::error::{KfdError, KfdResult};
use crate::kfd::device::DeviceRegistry;
use crate::kfd::ioctl::{
    CreateEventArgs, KFD_EVENT_TIMEOUT_IMMEDIATE, KFD_EVENT_TIMEOUT_INFINITE,
    KFD_IOC_EVENT_SIGNAL, KFD_IOC_WAIT_RESULT_COMPLETE, KFD_IOC_WAIT_RESULT_FAIL,
    KFD_IOC_WAIT_RESULT_TIMEOUT, KFD_MMAP_TYPE_EVENTS, handle_gpu_id, handle_idr,
};
use crate::process::{Process, ProcessState};
use std::time::{Duration, Instant};

/// What `create_event` hands back to user space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedEvent {
    pub event_id: u32,
    pub trigger_data: u32,
    pub page_offset: u64,
    pub slot_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitOutcome {
    /// One of `KFD_IOC_WAIT_RESULT_*`.
    pub wait_result: u32,
    pub signaled: Vec<u32>,
}

impl WaitOutcome {
    fn without_events(wait_result: u32) -> Self {
        Self {
            wait_result,
            signaled: Vec::new(),
        }
    }
}

impl Process {
    /// Installs the user-supplied signal page named by `handle`.
    fn set_event_page(&self, state: &mut ProcessState, devices: &DeviceRegistry, handle: u64) -> KfdResult<()> {
        if self.events.lock().signal_page().is_some() {
            tracing::debug!(pasid = self.pasid(), "event page is already set");
            return Err(KfdError::AlreadyExists("event page"));
        }

        let gpu_id = handle_gpu_id(handle);
        let device = devices.lookup(gpu_id).map_err(|_| {
            tracing::debug!(gpu_id, "event page handle names an unknown device");
            KfdError::InvalidArgument("event page gpu id")
        })?;
        let pdd = state.bind(&device, self.pasid()).map_err(|err| {
            tracing::debug!(gpu_id, %err, "failed to bind for event page");
            err
        })?;
        let bo = pdd.bo(handle_idr(handle)).ok_or_else(|| {
            tracing::debug!(handle, "event page handle is not a buffer object");
            KfdError::InvalidArgument("event page handle")
        })?;
        let kernel_address = device.backend().map_gtt_bo_to_kernel(bo.mem).map_err(|err| {
            tracing::error!(gpu_id, handle, %err, "failed to map event page to kernel");
            err
        })?;

        self.events.lock().set_signal_page(handle, kernel_address)
    }

    /// Creates an event. A nonzero `event_page_offset` first installs the
    /// buffer object it names as the process signal page.
    ///
    /// # Errors
    /// `AlreadyExists` if a signal page is already set, `InvalidArgument` for
    /// a bad page handle, `OutOfMemory` when no event id is left.
    pub fn create_event(&self, devices: &DeviceRegistry, args: &CreateEventArgs) -> KfdResult<CreatedEvent> {
        // Held throughout so a kernel signal page can't appear while a user page is being mapped.
        let mut state = self.state.lock();
        if args.event_page_offset != 0 {
            self.set_event_page(&mut state, devices, args.event_page_offset)?;
        }

        let mut events = self.events.lock();
        let event_id = events.insert_event(args.event_type, args.auto_reset != 0, args.node_id)?;
        let uses_slot = events.event(event_id).is_some_and(super::Event::uses_signal_slot);
        tracing::debug!(pasid = self.pasid(), event_id, event_type = args.event_type, "created event");

        Ok(CreatedEvent {
            event_id,
            trigger_data: event_id,
            page_offset: if uses_slot { KFD_MMAP_TYPE_EVENTS } else { 0 },
            slot_index: if uses_slot { event_id } else { 0 },
        })
    }

    /// # Errors
    /// `InvalidArgument` for an unknown id.
    pub fn destroy_event(&self, event_id: u32) -> KfdResult<()> {
        self.events.lock().remove_event(event_id)?;
        self.event_cond.notify_all();
        Ok(())
    }

    /// Signals a CPU-signalable event and wakes waiters.
    ///
    /// # Errors
    /// `InvalidArgument` for an unknown id or a non-signal event.
    pub fn set_event(&self, event_id: u32) -> KfdResult<()> {
        let mut events = self.events.lock();
        let event = events.event_mut(event_id)?;
        if event.event_type != KFD_IOC_EVENT_SIGNAL {
            tracing::debug!(event_id, event_type = event.event_type, "event can't be signaled from the CPU");
            return Err(KfdError::InvalidArgument("event type"));
        }
        event.signaled = true;
        drop(events);
        self.event_cond.notify_all();
        Ok(())
    }

    /// # Errors
    /// `InvalidArgument` for an unknown id.
    pub fn reset_event(&self, event_id: u32) -> KfdResult<()> {
        self.events.lock().event_mut(event_id)?.signaled = false;
        Ok(())
    }

    /// Waits for any or all of `event_ids`. `timeout_ms` of 0 polls and
    /// `KFD_EVENT_TIMEOUT_INFINITE` waits forever. Auto-reset events are
    /// reset when the wait consumes them.
    ///
    /// # Errors
    /// `InvalidArgument` if an id is unknown on entry. Timeouts and events
    /// destroyed mid-wait are reported through the wait result.
    pub fn wait_on_events(&self, event_ids: &[u32], wait_for_all: bool, timeout_ms: u32) -> KfdResult<WaitOutcome> {
        let mut events = self.events.lock();
        if let Some(&unknown) = event_ids.iter().find(|id| events.event(**id).is_none()) {
            tracing::debug!(event_id = unknown, "wait on unknown event");
            return Err(KfdError::InvalidArgument("event id"));
        }

        let deadline = match timeout_ms {
            KFD_EVENT_TIMEOUT_INFINITE => None,
            KFD_EVENT_TIMEOUT_IMMEDIATE => Some(Instant::now()),
            ms => Some(Instant::now() + Duration::from_millis(u64::from(ms))),
        };

        let mut timed_out = false;
        loop {
            if event_ids.iter().any(|id| events.event(*id).is_none()) {
                return Ok(WaitOutcome::without_events(KFD_IOC_WAIT_RESULT_FAIL));
            }

            let signaled: Vec<u32> = event_ids
                .iter()
                .copied()
                .filter(|id| events.event(*id).is_some_and(|event| event.signaled))
                .collect();
            let done = if wait_for_all {
                signaled.len() == event_ids.len()
            } else {
                !signaled.is_empty()
            };

            if done {
                for id in &signaled {
                    if let Ok(event) = events.event_mut(*id)
                        && event.auto_reset
                    {
                        event.signaled = false;
                    }
                }
                return Ok(WaitOutcome {
                    wait_result: KFD_IOC_WAIT_RESULT_COMPLETE,
                    signaled,
                });
            }
            if timed_out {
                return Ok(WaitOutcome::without_events(KFD_IOC_WAIT_RESULT_TIMEOUT));
            }

            match deadline {
                Some(deadline) => timed_out = self.event_cond.wait_until(&mut events, deadline).timed_out(),
                None => self.event_cond.wait(&mut events),
            }
        }
    }
}
