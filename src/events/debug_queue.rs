use crate::error::{KfdError, KfdResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const DEBUG_EVENT_TRAP: u8 = b't';
pub const DEBUG_EVENT_VMFAULT: u8 = b'v';

#[derive(Debug, Default)]
struct Fifo {
    tags: VecDeque<u8>,
    closed: bool,
}

/// Bounded FIFO of one-byte event tags read by a debugger.
///
/// Tags are pushed from the interrupt path and drained by [`read`](Self::read).
/// Once closed, readers drain what is left and then see end-of-file.
#[derive(Debug)]
pub struct DebugEventQueue {
    fifo: Mutex<Fifo>,
    readable: Condvar,
    capacity: usize,
}

impl DebugEventQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            fifo: Mutex::new(Fifo::default()),
            readable: Condvar::new(),
            capacity,
        }
    }

    /// Appends a tag and wakes readers. Returns false when the tag was dropped.
    pub fn push(&self, tag: u8) -> bool {
        let mut fifo = self.fifo.lock();
        if fifo.closed {
            return false;
        }
        if fifo.tags.len() >= self.capacity {
            tracing::warn!(tag = %char::from(tag), capacity = self.capacity, "debug event fifo full, dropping event");
            return false;
        }
        fifo.tags.push_back(tag);
        drop(fifo);
        self.readable.notify_all();
        true
    }

    /// Blocks until at least one tag is available, then drains as many as fit
    /// in `buf`. `None` waits forever.
    ///
    /// # Errors
    /// `Timeout` if nothing arrived in time. A closed and drained queue
    /// returns `Ok(0)`.
    pub fn read(&self, buf: &mut [u8], timeout: Option<Duration>) -> KfdResult<usize> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut fifo = self.fifo.lock();
        while fifo.tags.is_empty() && !fifo.closed {
            match deadline {
                Some(deadline) => {
                    if self.readable.wait_until(&mut fifo, deadline).timed_out()
                        && fifo.tags.is_empty()
                        && !fifo.closed
                    {
                        return Err(KfdError::Timeout);
                    }
                }
                None => self.readable.wait(&mut fifo),
            }
        }

        let count = buf.len().min(fifo.tags.len());
        for (slot, tag) in buf.iter_mut().zip(fifo.tags.drain(..count)) {
            *slot = tag;
        }
        Ok(count)
    }

    /// True when a read would not block.
    #[must_use]
    pub fn is_readable(&self) -> bool {
        let fifo = self.fifo.lock();
        !fifo.tags.is_empty() || fifo.closed
    }

    pub fn close(&self) {
        self.fifo.lock().closed = true;
        self.readable.notify_all();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.fifo.lock().closed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fifo.lock().tags.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fifo.lock().tags.is_empty()
    }
}
