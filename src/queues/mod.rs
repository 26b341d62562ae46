//! User-mode queues: properties, the per-process queue manager and the
//! queue operations exposed to user space.

pub mod manager;
mod ops;
pub mod properties;

pub use manager::{ProcessQueueManager, Queue};
pub use ops::{CreatedQueue, MAX_CU_MASK_BITS, QueueSnapshot};
pub use properties::{QueueFormat, QueueProperties, QueueType};
