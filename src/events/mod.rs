//! Per-process events, the host-visible signal page and the debugger's view
//! of queue status.

pub mod debug_queue;
mod ops;

use crate::config::KfdConfig;
use crate::error::{KfdError, KfdResult};
use crate::kfd::ioctl::{
    KFD_DBG_EV_STATUS_NEW_QUEUE, KFD_DBG_EV_STATUS_SUSPENDED, KFD_DBG_EV_STATUS_TRAP,
    KFD_DBG_EV_STATUS_VMFAULT, KFD_IOC_EVENT_DEBUG_EVENT, KFD_IOC_EVENT_SIGNAL,
    KFD_INVALID_QUEUEID, KFD_SIGNAL_EVENT_LIMIT,
};
use std::collections::BTreeMap;
use std::sync::Arc;

pub use debug_queue::{DEBUG_EVENT_TRAP, DEBUG_EVENT_VMFAULT, DebugEventQueue};
pub use ops::{CreatedEvent, WaitOutcome};

pub const UNSIGNALED_EVENT_SLOT: u64 = u64::MAX;

/// Non-signal events are numbered above the signal slot range.
pub const FIRST_NONSIGNAL_EVENT_ID: u32 = KFD_SIGNAL_EVENT_LIMIT;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub event_id: u32,
    pub event_type: u32,
    pub auto_reset: bool,
    pub signaled: bool,
    pub node_id: u32,
}

impl Event {
    /// Signal and debug events own a slot in the signal page.
    #[must_use]
    pub const fn uses_signal_slot(&self) -> bool {
        matches!(self.event_type, KFD_IOC_EVENT_SIGNAL | KFD_IOC_EVENT_DEBUG_EVENT)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalPageSource {
    /// Allocated by the first signal event.
    Kernel,
    /// A GTT buffer object supplied by user space, mapped into the kernel.
    UserBo { handle: u64, kernel_address: u64 },
}

/// Host-visible page of 64-bit event slots.
#[derive(Debug)]
pub struct SignalPage {
    source: SignalPageSource,
    slots: Vec<u64>,
}

impl SignalPage {
    fn new(source: SignalPageSource, num_slots: u32) -> Self {
        Self {
            source,
            slots: vec![UNSIGNALED_EVENT_SLOT; num_slots as usize],
        }
    }

    #[must_use]
    pub const fn source(&self) -> SignalPageSource {
        self.source
    }

    #[must_use]
    pub fn slot(&self, index: u32) -> Option<u64> {
        self.slots.get(index as usize).copied()
    }

    fn reset_slot(&mut self, index: u32) {
        if let Some(slot) = self.slots.get_mut(index as usize) {
            *slot = UNSIGNALED_EVENT_SLOT;
        }
    }
}

/// Debugger-visible status of one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueDebugStatus {
    queue_id: u32,
    gpu_id: u32,
    doorbell_off: u32,
    event_bits: u32,
    is_new: bool,
    is_suspended: bool,
}

impl QueueDebugStatus {
    const fn status(&self) -> u32 {
        let mut status = self.event_bits;
        if self.is_new {
            status |= KFD_DBG_EV_STATUS_NEW_QUEUE;
        }
        if self.is_suspended {
            status |= KFD_DBG_EV_STATUS_SUSPENDED;
        }
        status
    }

    const fn has_pending_event(&self) -> bool {
        self.event_bits & (KFD_DBG_EV_STATUS_TRAP | KFD_DBG_EV_STATUS_VMFAULT) != 0
    }
}

/// Everything guarded by the process event mutex.
#[derive(Debug)]
pub struct EventState {
    events: BTreeMap<u32, Event>,
    signal_page: Option<SignalPage>,
    signal_event_limit: u32,
    /// In queue creation order.
    debug_queues: Vec<QueueDebugStatus>,
    debug_fifos: BTreeMap<u32, Arc<DebugEventQueue>>,
    fifo_capacity: usize,
}

impl EventState {
    #[must_use]
    pub fn new(config: &KfdConfig) -> Self {
        Self {
            events: BTreeMap::new(),
            signal_page: None,
            signal_event_limit: config.signal_event_limit,
            debug_queues: Vec::new(),
            debug_fifos: BTreeMap::new(),
            fifo_capacity: config.debug_event_fifo_capacity,
        }
    }

    #[must_use]
    pub fn event(&self, event_id: u32) -> Option<&Event> {
        self.events.get(&event_id)
    }

    #[must_use]
    pub fn num_events(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub const fn signal_page(&self) -> Option<&SignalPage> {
        self.signal_page.as_ref()
    }

    /// Installs a user-supplied signal page. Only one page per process.
    ///
    /// # Errors
    /// `AlreadyExists` once a page is set.
    pub(crate) fn set_signal_page(&mut self, handle: u64, kernel_address: u64) -> KfdResult<()> {
        if self.signal_page.is_some() {
            return Err(KfdError::AlreadyExists("event page"));
        }
        self.signal_page = Some(SignalPage::new(
            SignalPageSource::UserBo {
                handle,
                kernel_address,
            },
            self.signal_event_limit,
        ));
        Ok(())
    }

    fn alloc_event_id(&mut self, uses_signal_slot: bool) -> KfdResult<u32> {
        if uses_signal_slot {
            let limit = self.signal_event_limit;
            let page = self
                .signal_page
                .get_or_insert_with(|| SignalPage::new(SignalPageSource::Kernel, limit));
            let id = (0..limit)
                .find(|id| !self.events.contains_key(id))
                .ok_or_else(|| {
                    tracing::warn!(limit, "signal event limit reached");
                    KfdError::OutOfMemory
                })?;
            page.reset_slot(id);
            Ok(id)
        } else {
            (FIRST_NONSIGNAL_EVENT_ID..=u32::MAX)
                .find(|id| !self.events.contains_key(id))
                .ok_or(KfdError::OutOfMemory)
        }
    }

    pub(crate) fn insert_event(&mut self, event_type: u32, auto_reset: bool, node_id: u32) -> KfdResult<u32> {
        let uses_signal_slot = matches!(event_type, KFD_IOC_EVENT_SIGNAL | KFD_IOC_EVENT_DEBUG_EVENT);
        let event_id = self.alloc_event_id(uses_signal_slot)?;
        self.events.insert(
            event_id,
            Event {
                event_id,
                event_type,
                auto_reset,
                signaled: false,
                node_id,
            },
        );
        Ok(event_id)
    }

    pub(crate) fn remove_event(&mut self, event_id: u32) -> KfdResult<Event> {
        let event = self
            .events
            .remove(&event_id)
            .ok_or(KfdError::InvalidArgument("event id"))?;
        if event.uses_signal_slot()
            && let Some(page) = self.signal_page.as_mut()
        {
            page.reset_slot(event_id);
        }
        Ok(event)
    }

    pub(crate) fn event_mut(&mut self, event_id: u32) -> KfdResult<&mut Event> {
        self.events
            .get_mut(&event_id)
            .ok_or(KfdError::InvalidArgument("event id"))
    }

    // ===============================================================================================
    // Queue debug status
    // ===============================================================================================

    pub(crate) fn register_queue(&mut self, queue_id: u32, gpu_id: u32, doorbell_off: u32) {
        self.debug_queues.push(QueueDebugStatus {
            queue_id,
            gpu_id,
            doorbell_off,
            event_bits: 0,
            is_new: true,
            is_suspended: false,
        });
    }

    pub(crate) fn unregister_queue(&mut self, queue_id: u32) {
        self.debug_queues.retain(|queue| queue.queue_id != queue_id);
    }

    fn queue_mut(&mut self, queue_id: u32) -> Option<&mut QueueDebugStatus> {
        self.debug_queues
            .iter_mut()
            .find(|queue| queue.queue_id == queue_id)
    }

    /// The status word of a queue, without side effects.
    #[must_use]
    pub fn queue_status(&self, queue_id: u32) -> Option<u32> {
        self.debug_queues
            .iter()
            .find(|queue| queue.queue_id == queue_id)
            .map(QueueDebugStatus::status)
    }

    pub(crate) fn clear_queue_events(&mut self, queue_id: u32) {
        if let Some(queue) = self.queue_mut(queue_id) {
            queue.event_bits = 0;
        }
    }

    pub(crate) fn set_queue_suspended(&mut self, queue_id: u32, suspended: bool) {
        if let Some(queue) = self.queue_mut(queue_id) {
            queue.is_suspended = suspended;
        }
    }

    /// Reports and acknowledges a debug event.
    ///
    /// With a specific `queue_id` the status of that queue is returned even if
    /// nothing is pending. With [`KFD_INVALID_QUEUEID`] the first queue with a
    /// pending trap or VM fault is chosen.
    ///
    /// # Errors
    /// `InvalidArgument` for an unknown queue, `TryAgain` when nothing is pending.
    pub fn query_debug_event(&mut self, queue_id: u32, clear_status: bool) -> KfdResult<(u32, u32)> {
        let queue = if queue_id == KFD_INVALID_QUEUEID {
            self.debug_queues
                .iter_mut()
                .find(|queue| queue.has_pending_event())
                .ok_or(KfdError::TryAgain)?
        } else {
            self.debug_queues
                .iter_mut()
                .find(|queue| queue.queue_id == queue_id)
                .ok_or(KfdError::InvalidArgument("queue id"))?
        };

        let status = queue.status();
        queue.is_new = false;
        if clear_status {
            queue.event_bits = 0;
        }
        Ok((queue.queue_id, status))
    }

    // ===============================================================================================
    // Debug event fifos
    // ===============================================================================================

    pub(crate) fn open_debug_fifo(&mut self, gpu_id: u32) -> Arc<DebugEventQueue> {
        let fifo = Arc::new(DebugEventQueue::new(self.fifo_capacity));
        if let Some(old) = self.debug_fifos.insert(gpu_id, Arc::clone(&fifo)) {
            old.close();
        }
        fifo
    }

    pub(crate) fn close_debug_fifo(&mut self, gpu_id: u32) {
        if let Some(fifo) = self.debug_fifos.remove(&gpu_id) {
            fifo.close();
        }
    }

    #[must_use]
    pub fn debug_fifo(&self, gpu_id: u32) -> Option<&Arc<DebugEventQueue>> {
        self.debug_fifos.get(&gpu_id)
    }

    /// Marks the queue that raised an interrupt and queues a tag for the
    /// debugger. A VM fault is charged to the first queue on the device, a
    /// trap to the queue owning `doorbell_id`.
    ///
    /// Returns false when the event was dropped.
    pub(crate) fn record_debug_event(&mut self, gpu_id: u32, doorbell_id: u32, is_vmfault: bool) -> bool {
        let Some(fifo) = self.debug_fifos.get(&gpu_id).cloned() else {
            return false;
        };

        let queue = self.debug_queues.iter_mut().find(|queue| {
            queue.gpu_id == gpu_id && (is_vmfault || queue.doorbell_off == doorbell_id)
        });
        let Some(queue) = queue else {
            tracing::debug!(gpu_id, doorbell_id, is_vmfault, "no queue for debug event");
            return false;
        };

        let (bit, tag) = if is_vmfault {
            (KFD_DBG_EV_STATUS_VMFAULT, DEBUG_EVENT_VMFAULT)
        } else {
            (KFD_DBG_EV_STATUS_TRAP, DEBUG_EVENT_TRAP)
        };
        queue.event_bits |= bit;
        fifo.push(tag)
    }

    /// Closes every debug fifo so blocked readers see end-of-file.
    pub fn close_debug_queues(&mut self) {
        for (_, fifo) in std::mem::take(&mut self.debug_fifos) {
            fifo.close();
        }
    }
}
