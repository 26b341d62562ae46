//! Per-process state: the registry keyed by thread group, reference-counted
//! handles, and the device bindings each process accumulates.

pub mod interval;
pub mod memory;
pub mod pdd;
pub mod settings;

use crate::config::KfdConfig;
use crate::debug::DebugManagerTable;
use crate::error::{KfdError, KfdResult};
use crate::events::EventState;
use crate::kfd::device::KfdDevice;
use crate::kfd::host::{AddressSpace, Task};
use crate::kfd::ioctl::ProcessDeviceApertures;
use crate::queues::ProcessQueueManager;
use interval::BoIntervalMap;
use parking_lot::{Condvar, Mutex};
use pdd::ProcessDevice;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

pub use memory::{AllocFlags, AllocatedMemory, BufferObject, MapOutcome};

/// Everything guarded by the process mutex.
#[derive(Debug, Default)]
pub struct ProcessState {
    pub(crate) pqm: ProcessQueueManager,
    pub(crate) pdds: BTreeMap<u32, ProcessDevice>,
    pub(crate) bo_intervals: BoIntervalMap,
}

impl ProcessState {
    /// Returns the binding for `device`, creating the record if needed but
    /// without giving it a VM.
    pub(crate) fn pdd_or_insert(&mut self, device: &Arc<KfdDevice>, pasid: u32) -> &mut ProcessDevice {
        match self.pdds.entry(device.gpu_id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                tracing::debug!(gpu_id = device.gpu_id, pasid, "new process device");
                entry.insert(ProcessDevice::new(device, pasid))
            }
        }
    }

    /// Binds the process to `device`. Idempotent once the binding has a VM.
    ///
    /// # Errors
    /// Propagates VM creation failures.
    pub(crate) fn bind(&mut self, device: &Arc<KfdDevice>, pasid: u32) -> KfdResult<&mut ProcessDevice> {
        let pdd = self.pdd_or_insert(device, pasid);
        if !pdd.is_bound() {
            pdd.init_vm(None, pasid)?;
        }
        Ok(pdd)
    }
}

/// One user process that opened the device file.
#[derive(Debug)]
pub struct Process {
    pasid: u32,
    tgid: u32,
    mm: Arc<dyn AddressSpace>,
    config: KfdConfig,
    refcount: AtomicUsize,
    registry: Weak<RegistryInner>,
    /// The process mutex. Always taken before `events` and the debug-manager lock.
    pub(crate) state: Mutex<ProcessState>,
    pub(crate) events: Mutex<EventState>,
    pub(crate) event_cond: Condvar,
}

impl Process {
    #[must_use]
    pub const fn pasid(&self) -> u32 {
        self.pasid
    }

    #[must_use]
    pub const fn tgid(&self) -> u32 {
        self.tgid
    }

    #[must_use]
    pub fn mm(&self) -> &Arc<dyn AddressSpace> {
        &self.mm
    }

    #[must_use]
    pub const fn config(&self) -> &KfdConfig {
        &self.config
    }

    #[must_use]
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// # Errors
    /// Propagates VM creation failures.
    pub fn bind_device(&self, device: &Arc<KfdDevice>) -> KfdResult<()> {
        self.state.lock().bind(device, self.pasid).map(|_| ())
    }

    #[must_use]
    pub fn num_bound_devices(&self) -> usize {
        self.state.lock().pdds.len()
    }

    #[must_use]
    pub fn is_debug_trap_enabled(&self, gpu_id: u32) -> bool {
        self.state
            .lock()
            .pdds
            .get(&gpu_id)
            .is_some_and(|pdd| pdd.debug_trap_enabled)
    }

    /// Turns the debug trap off on every binding and drops the session
    /// references. Returns how many sessions were ended.
    pub fn release_debug_sessions(&self) -> usize {
        let sessions: Vec<ProcessRef> = {
            let mut state = self.state.lock();
            let mut events = self.events.lock();
            state
                .pdds
                .values_mut()
                .filter(|pdd| pdd.debug_trap_enabled)
                .filter_map(|pdd| {
                    pdd.disable_debug_trap();
                    events.close_debug_fifo(pdd.gpu_id());
                    pdd.debug_session.take()
                })
                .collect()
        };
        sessions.len()
    }

    pub(crate) fn debug_session_count(&self) -> usize {
        self.state
            .lock()
            .pdds
            .values()
            .filter(|pdd| pdd.debug_session.is_some())
            .count()
    }

    /// Apertures of every bound device, in gpu_id order.
    #[must_use]
    pub fn apertures(&self) -> Vec<ProcessDeviceApertures> {
        self.state
            .lock()
            .pdds
            .values()
            .map(|pdd| *pdd.apertures())
            .collect()
    }

    /// Evicts the queues on every bound device, restoring the ones already
    /// evicted if a device fails.
    ///
    /// # Errors
    /// The first device failure.
    pub fn evict_queues(&self) -> KfdResult<()> {
        let state = self.state.lock();
        let mut evicted: Vec<&ProcessDevice> = Vec::new();
        for pdd in state.pdds.values() {
            let backend = pdd.device().backend();
            if let Err(err) = backend.evict_process_queues(self.pasid) {
                tracing::error!(gpu_id = pdd.gpu_id(), pasid = self.pasid, %err, "failed to evict queues");
                for done in evicted {
                    if let Err(err) = done.device().backend().restore_process_queues(self.pasid) {
                        tracing::error!(gpu_id = done.gpu_id(), %err, "failed to roll back eviction");
                    }
                }
                return Err(err);
            }
            evicted.push(pdd);
        }
        Ok(())
    }

    /// Restores every bound device.
    ///
    /// # Errors
    /// The first failure, reported after all devices were attempted.
    pub fn restore_queues(&self) -> KfdResult<()> {
        let state = self.state.lock();
        let mut result = Ok(());
        for pdd in state.pdds.values() {
            if let Err(err) = pdd.device().backend().restore_process_queues(self.pasid) {
                tracing::error!(gpu_id = pdd.gpu_id(), pasid = self.pasid, %err, "failed to restore queues");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    fn teardown(&self, debug_managers: Option<&DebugManagerTable>) {
        tracing::debug!(pasid = self.pasid, tgid = self.tgid, "tearing down process");

        let sessions: Vec<ProcessRef> = {
            let mut state = self.state.lock();
            state.pqm.destroy_all(self.pasid);
            state
                .pdds
                .values_mut()
                .filter_map(|pdd| pdd.release(self.pasid))
                .collect()
        };
        drop(sessions);

        self.events.lock().close_debug_queues();
        self.event_cond.notify_all();

        if let Some(table) = debug_managers {
            table.unregister_pasid(self.pasid);
        }
    }
}

/// A counted reference to a [`Process`].
///
/// Cloning takes a reference; dropping the last one removes the process from
/// the registry and tears it down, outside of every process lock.
#[derive(Debug)]
pub struct ProcessRef {
    inner: Arc<Process>,
}

impl ProcessRef {
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn try_acquire(process: &Arc<Process>) -> Option<Self> {
        process
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count > 0).then_some(count + 1)
            })
            .ok()
            .map(|_| Self {
                inner: Arc::clone(process),
            })
    }
}

impl Deref for ProcessRef {
    type Target = Process;

    fn deref(&self) -> &Process {
        &self.inner
    }
}

impl Clone for ProcessRef {
    fn clone(&self) -> Self {
        self.inner.refcount.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for ProcessRef {
    fn drop(&mut self) {
        if self.inner.refcount.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        let Some(registry) = self.inner.registry.upgrade() else {
            self.inner.teardown(None);
            return;
        };
        {
            let mut table = registry.table.lock();
            if table
                .get(&self.inner.tgid)
                .is_some_and(|entry| Arc::ptr_eq(entry, &self.inner))
            {
                table.remove(&self.inner.tgid);
            }
        }
        self.inner.teardown(Some(&registry.debug_managers));
    }
}

#[derive(Debug)]
struct RegistryInner {
    table: Mutex<HashMap<u32, Arc<Process>>>,
    next_pasid: AtomicU32,
    config: KfdConfig,
    debug_managers: Arc<DebugManagerTable>,
}

/// All live processes, keyed by thread-group id.
#[derive(Debug, Clone)]
pub struct ProcessRegistry {
    inner: Arc<RegistryInner>,
}

impl ProcessRegistry {
    #[must_use]
    pub fn new(config: KfdConfig, debug_managers: Arc<DebugManagerTable>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                table: Mutex::new(HashMap::new()),
                next_pasid: AtomicU32::new(1),
                config,
                debug_managers,
            }),
        }
    }

    /// Returns the process of `task`'s thread group, creating it on first use.
    ///
    /// # Errors
    /// `PermissionDenied` for 32-bit compat tasks.
    pub fn create_or_get(&self, task: &Task) -> KfdResult<ProcessRef> {
        if task.is_compat {
            tracing::debug!(tgid = task.tgid, "32-bit compat process rejected");
            return Err(KfdError::PermissionDenied("32-bit processes are not supported"));
        }

        let mut table = self.inner.table.lock();
        if let Some(process) = table.get(&task.tgid).and_then(ProcessRef::try_acquire) {
            return Ok(process);
        }

        let pasid = self.inner.next_pasid.fetch_add(1, Ordering::Relaxed);
        let process = Arc::new(Process {
            pasid,
            tgid: task.tgid,
            mm: Arc::clone(&task.mm),
            config: self.inner.config,
            refcount: AtomicUsize::new(1),
            registry: Arc::downgrade(&self.inner),
            state: Mutex::new(ProcessState::default()),
            events: Mutex::new(EventState::new(&self.inner.config)),
            event_cond: Condvar::new(),
        });
        table.insert(task.tgid, Arc::clone(&process));
        tracing::debug!(pasid, tgid = task.tgid, "created process");
        Ok(ProcessRef { inner: process })
    }

    /// # Errors
    /// `NotFound` if no live process has that PASID.
    pub fn lookup_by_pasid(&self, pasid: u32) -> KfdResult<ProcessRef> {
        self.inner
            .table
            .lock()
            .values()
            .filter(|process| process.pasid == pasid)
            .find_map(ProcessRef::try_acquire)
            .ok_or(KfdError::NotFound("process"))
    }

    #[must_use]
    pub fn lookup_by_tgid(&self, tgid: u32) -> Option<ProcessRef> {
        self.inner
            .table
            .lock()
            .get(&tgid)
            .and_then(ProcessRef::try_acquire)
    }

    /// References to every live process.
    #[must_use]
    pub fn all(&self) -> Vec<ProcessRef> {
        self.inner
            .table
            .lock()
            .values()
            .filter_map(ProcessRef::try_acquire)
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.table.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.table.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockMm, TestBed};

    #[test]
    fn same_thread_group_shares_one_record() {
        let bed = TestBed::new();
        let first = bed.open(42);
        let second = bed.open(42);

        assert!(first.ptr_eq(&second));
        assert_eq!(first.refcount(), 2);
        assert_eq!(bed.processes.len(), 1);
    }

    #[test]
    fn compat_task_is_rejected_without_a_record() {
        let bed = TestBed::new();
        let task = Task::new(7, MockMm::new(0, 0)).with_compat(true);

        assert!(matches!(
            bed.processes.create_or_get(&task),
            Err(KfdError::PermissionDenied(_))
        ));
        assert!(bed.processes.is_empty());
    }

    #[test]
    fn last_reference_removes_and_tears_down() {
        let bed = TestBed::new();
        let process = bed.open(42);
        let pasid = process.pasid();
        process.bind_device(&bed.device_a).unwrap();

        let clone = process.clone();
        drop(process);
        assert!(bed.processes.lookup_by_pasid(pasid).is_ok());

        drop(clone);
        assert!(matches!(
            bed.processes.lookup_by_pasid(pasid),
            Err(KfdError::NotFound(_))
        ));
        assert_eq!(bed.backend_a.live_vms(), 0);
    }

    #[test]
    fn bind_is_idempotent() {
        let bed = TestBed::new();
        let process = bed.open(42);

        process.bind_device(&bed.device_a).unwrap();
        process.bind_device(&bed.device_a).unwrap();

        assert_eq!(process.num_bound_devices(), 1);
        assert_eq!(bed.backend_a.live_vms(), 1);
    }

    #[test]
    fn reopening_after_teardown_gets_a_fresh_pasid() {
        let bed = TestBed::new();
        let old = bed.open(42).pasid();
        let new = bed.open(42).pasid();
        assert_ne!(old, new);
    }

    #[test]
    fn eviction_rolls_back_on_failure() {
        let bed = TestBed::new();
        let process = bed.open(42);
        process.bind_device(&bed.device_a).unwrap();
        process.bind_device(&bed.device_b).unwrap();

        bed.backend_b.fail_next_evict();
        assert!(process.evict_queues().is_err());
        assert_eq!(bed.backend_a.evictions(), 1);
        assert_eq!(bed.backend_a.restores(), 1);

        process.evict_queues().unwrap();
        process.restore_queues().unwrap();
        assert_eq!(bed.backend_b.restores(), 1);
    }
}
