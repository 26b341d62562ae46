use std::time::Duration;

/// Tunables shared by every subsystem hanging off a [`crate::Kfd`] context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KfdConfig {
    /// Upper bound for every GPU fence wait issued by the cross-memory copy engine.
    pub cma_wait_timeout: Duration,
    /// Size, in pages, of the bounce buffer used for device-to-device copies.
    pub max_system_bo_pages: u64,
    /// Number of tags a debug-event queue holds before new ones are dropped.
    pub debug_event_fifo_capacity: usize,
    pub signal_event_limit: u32,
    pub max_queues_per_process: u32,
    /// Remote pages pinned per batch during host-side userptr copies.
    pub userptr_pin_batch_pages: u64,
}

impl Default for KfdConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl KfdConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cma_wait_timeout: Duration::from_millis(1000),
            max_system_bo_pages: 512,
            debug_event_fifo_capacity: 4096,
            signal_event_limit: 4096,
            max_queues_per_process: 1024,
            userptr_pin_batch_pages: 64,
        }
    }

    #[must_use]
    pub const fn with_cma_wait_timeout(mut self, timeout: Duration) -> Self {
        self.cma_wait_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_max_system_bo_pages(mut self, pages: u64) -> Self {
        self.max_system_bo_pages = pages;
        self
    }

    #[must_use]
    pub const fn with_debug_event_fifo_capacity(mut self, tags: usize) -> Self {
        self.debug_event_fifo_capacity = tags;
        self
    }

    #[must_use]
    pub const fn with_signal_event_limit(mut self, slots: u32) -> Self {
        self.signal_event_limit = slots;
        self
    }

    #[must_use]
    pub const fn with_max_queues_per_process(mut self, queues: u32) -> Self {
        self.max_queues_per_process = queues;
        self
    }

    #[must_use]
    pub const fn with_userptr_pin_batch_pages(mut self, pages: u64) -> Self {
        self.userptr_pin_batch_pages = pages;
        self
    }

    #[must_use]
    pub const fn max_system_bo_size(&self) -> u64 {
        self.max_system_bo_pages * crate::utils::PAGE_SIZE
    }
}
