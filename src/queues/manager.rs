use super::properties::QueueProperties;
use crate::error::{KfdError, KfdResult};
use crate::kfd::device::{KfdDevice, QueueHwInfo};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A user-mode queue and the device it runs on.
#[derive(Debug)]
pub struct Queue {
    pub props: QueueProperties,
    pub device: Arc<KfdDevice>,
}

/// The queues of one process, across all of its devices.
///
/// Queues are kept in creation order; debugger scans walk them that way.
#[derive(Debug, Default)]
pub struct ProcessQueueManager {
    queues: BTreeMap<u64, Queue>,
    ids: HashMap<u32, u64>,
    next_seq: u64,
}

impl ProcessQueueManager {
    fn find_free_id(&self, max_queues: u32) -> KfdResult<u32> {
        (0..max_queues)
            .find(|id| !self.ids.contains_key(id))
            .ok_or_else(|| {
                tracing::debug!(max_queues, "no more queue ids for this process");
                KfdError::OutOfMemory
            })
    }

    /// Assigns the lowest free id and asks the device to create the queue.
    ///
    /// # Errors
    /// `OutOfMemory` when every id is taken, otherwise whatever the device reports.
    pub fn create_queue(
        &mut self,
        pasid: u32,
        device: &Arc<KfdDevice>,
        mut props: QueueProperties,
        max_queues: u32,
    ) -> KfdResult<(u32, QueueHwInfo)> {
        let queue_id = self.find_free_id(max_queues)?;
        props.queue_id = queue_id;
        props.gpu_id = device.gpu_id;

        let hw = device.backend().create_queue(pasid, &props)?;
        props.doorbell_off = hw.doorbell_off;

        let seq = self.next_seq;
        self.next_seq += 1;
        self.ids.insert(queue_id, seq);
        self.queues.insert(
            seq,
            Queue {
                props,
                device: Arc::clone(device),
            },
        );
        Ok((queue_id, hw))
    }

    /// Destroys a queue. A device timeout still releases the queue; any other
    /// device error leaves it in place.
    ///
    /// # Errors
    /// `NotFound` for an unknown id, or the device error.
    pub fn destroy_queue(&mut self, pasid: u32, queue_id: u32) -> KfdResult<Queue> {
        let seq = *self.ids.get(&queue_id).ok_or(KfdError::NotFound("queue"))?;
        let queue = self.queues.get(&seq).ok_or(KfdError::NotFound("queue"))?;

        match queue.device.backend().destroy_queue(pasid, queue_id) {
            Ok(()) => {}
            Err(KfdError::Timeout) => {
                tracing::warn!(pasid, queue_id, "queue destroy timed out, releasing anyway");
            }
            Err(err) => {
                tracing::error!(pasid, queue_id, %err, "failed to destroy queue");
                return Err(err);
            }
        }

        self.ids.remove(&queue_id);
        self.queues.remove(&seq).ok_or(KfdError::NotFound("queue"))
    }

    /// Applies `change` to a copy of the queue's properties and commits it
    /// once the device accepts the update.
    ///
    /// # Errors
    /// `NotFound` for an unknown id, or the device error.
    pub fn update_queue(
        &mut self,
        pasid: u32,
        queue_id: u32,
        change: impl FnOnce(&mut QueueProperties),
    ) -> KfdResult<()> {
        let queue = self.get_mut(queue_id).ok_or(KfdError::NotFound("queue"))?;
        let mut props = queue.props.clone();
        change(&mut props);
        queue.device.backend().update_queue(pasid, &props)?;
        queue.props = props;
        Ok(())
    }

    #[must_use]
    pub fn get(&self, queue_id: u32) -> Option<&Queue> {
        self.ids.get(&queue_id).and_then(|seq| self.queues.get(seq))
    }

    pub fn get_mut(&mut self, queue_id: u32) -> Option<&mut Queue> {
        let seq = self.ids.get(&queue_id)?;
        self.queues.get_mut(seq)
    }

    /// Queues in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &Queue> {
        self.queues.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Destroys every queue at process teardown, logging failures.
    pub fn destroy_all(&mut self, pasid: u32) {
        for (_, queue) in std::mem::take(&mut self.queues) {
            let queue_id = queue.props.queue_id;
            if let Err(err) = queue.device.backend().destroy_queue(pasid, queue_id) {
                tracing::warn!(pasid, queue_id, %err, "failed to destroy queue at teardown");
            }
        }
        self.ids.clear();
    }
}
