//! The deprecated debugger interface: one registered debugger per device,
//! address watch points and wave control forwarded to the device.

use crate::error::{KfdError, KfdResult};
use crate::kfd::device::{AsicFamily, KfdDevice};
use crate::kfd::ioctl::{MAX_ALLOWED_AW_BUFF_SIZE, MAX_ALLOWED_NUM_POINTS, MAX_ALLOWED_WAC_BUFF_SIZE};
use crate::process::Process;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Header shared by the address-watch and wave-control ioctls.
const DBG_ARGS_HEADER_SIZE: u32 = 16;

/// Size of the packed wave-control request, header included.
pub const WAVE_CONTROL_ARGS_SIZE: u32 = DBG_ARGS_HEADER_SIZE + 24;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressWatchInfo {
    pub num_watch_points: u32,
    pub modes: Vec<u32>,
    pub addresses: Vec<u64>,
    /// Absent when user space asked for the default masks.
    pub masks: Option<Vec<u64>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaveControlInfo {
    pub operand: u32,
    pub mode: u32,
    pub trap_id: u32,
    pub msg: u32,
}

struct PayloadReader<'a> {
    payload: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    const fn new(payload: &'a [u8]) -> Self {
        Self { payload, pos: 0 }
    }

    fn take(&mut self, len: usize) -> KfdResult<&'a [u8]> {
        let bytes = self
            .pos
            .checked_add(len)
            .and_then(|end| self.payload.get(self.pos..end))
            .ok_or(KfdError::InvalidArgument("debugger payload too short"))?;
        self.pos += len;
        Ok(bytes)
    }

    fn u32(&mut self) -> KfdResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self) -> KfdResult<u64> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_ne_bytes(raw))
    }

    fn u32s(&mut self, count: usize) -> KfdResult<Vec<u32>> {
        (0..count).map(|_| self.u32()).collect()
    }

    fn u64s(&mut self, count: usize) -> KfdResult<Vec<u64>> {
        (0..count).map(|_| self.u64()).collect()
    }
}

/// Checks the size of an address-watch request, header included.
///
/// # Errors
/// `InvalidArgument` if the size can't hold a payload or is over the limit.
pub fn check_address_watch_size(buf_size: u32) -> KfdResult<()> {
    if buf_size > MAX_ALLOWED_AW_BUFF_SIZE || buf_size <= DBG_ARGS_HEADER_SIZE + 8 {
        tracing::debug!(buf_size, "bad address watch buffer size");
        return Err(KfdError::InvalidArgument("address watch buffer size"));
    }
    Ok(())
}

/// Parses the payload following the ioctl header:
/// `num: u32, modes: [u32; num], addresses: [u64; num]`, then a mask
/// eight-byte mask slot. When its first byte is nonzero the slot is the start
/// of `masks: [u64; num]`; otherwise it is skipped.
///
/// # Errors
/// `InvalidArgument` for too many points or a payload that ends early.
pub fn parse_address_watch(payload: &[u8]) -> KfdResult<AddressWatchInfo> {
    let mut reader = PayloadReader::new(payload);
    let num_watch_points = reader.u32()?;
    if num_watch_points > MAX_ALLOWED_NUM_POINTS {
        tracing::debug!(num_watch_points, "too many watch points");
        return Err(KfdError::InvalidArgument("number of watch points"));
    }
    let count = num_watch_points as usize;
    let modes = reader.u32s(count)?;
    let addresses = reader.u64s(count)?;

    let indicator = *reader
        .payload
        .get(reader.pos)
        .ok_or(KfdError::InvalidArgument("missing watch mask indicator"))?;
    let masks = if indicator > 0 {
        Some(reader.u64s(count)?)
    } else {
        reader.take(8)?;
        None
    };

    Ok(AddressWatchInfo {
        num_watch_points,
        modes,
        addresses,
        masks,
    })
}

/// Checks the size of a wave-control request, header included.
///
/// # Errors
/// `InvalidArgument` unless it is exactly the packed size.
pub fn check_wave_control_size(buf_size: u32) -> KfdResult<()> {
    if buf_size > MAX_ALLOWED_WAC_BUFF_SIZE || buf_size != WAVE_CONTROL_ARGS_SIZE {
        tracing::debug!(buf_size, "bad wave control buffer size");
        return Err(KfdError::InvalidArgument("wave control buffer size"));
    }
    Ok(())
}

/// Parses `operand, mode, trap_id, msg` plus four reserved bytes.
///
/// # Errors
/// `InvalidArgument` if the payload is short.
pub fn parse_wave_control(payload: &[u8]) -> KfdResult<WaveControlInfo> {
    let mut reader = PayloadReader::new(payload);
    Ok(WaveControlInfo {
        operand: reader.u32()?,
        mode: reader.u32()?,
        trap_id: reader.u32()?,
        msg: reader.u32()?,
    })
}

/// Which process debugs each device under the deprecated interface.
///
/// The table mutex is the global debug-manager lock; it is always taken
/// after the process mutex.
#[derive(Debug, Default)]
pub struct DebugManagerTable {
    managers: Mutex<BTreeMap<u32, u32>>,
}

impl DebugManagerTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn owner(&self, gpu_id: u32) -> Option<u32> {
        self.managers.lock().get(&gpu_id).copied()
    }

    fn with_owned_manager<T>(
        &self,
        device: &KfdDevice,
        pasid: u32,
        op: impl FnOnce() -> KfdResult<T>,
    ) -> KfdResult<T> {
        let managers = self.managers.lock();
        if managers.get(&device.gpu_id) != Some(&pasid) {
            tracing::debug!(gpu_id = device.gpu_id, pasid, "process is not the registered debugger");
            return Err(KfdError::InvalidArgument("debugger not registered"));
        }
        let result = op();
        drop(managers);
        result
    }

    /// # Errors
    /// `InvalidArgument` unless `pasid` is the registered debugger, or the device error.
    pub fn address_watch(&self, device: &KfdDevice, pasid: u32, info: &AddressWatchInfo) -> KfdResult<()> {
        self.with_owned_manager(device, pasid, || device.backend().dbgmgr_address_watch(pasid, info))
    }

    /// # Errors
    /// `InvalidArgument` unless `pasid` is the registered debugger, or the device error.
    pub fn wave_control(&self, device: &KfdDevice, pasid: u32, info: &WaveControlInfo) -> KfdResult<()> {
        self.with_owned_manager(device, pasid, || device.backend().dbgmgr_wave_control(pasid, info))
    }

    /// Drops every registration a dying process still holds.
    pub fn unregister_pasid(&self, pasid: u32) {
        self.managers.lock().retain(|gpu_id, owner| {
            if *owner == pasid {
                tracing::debug!(gpu_id, pasid, "unregistering debugger at teardown");
            }
            *owner != pasid
        });
    }
}

impl Process {
    /// Registers the process as the debugger of `device`.
    ///
    /// # Errors
    /// `Unsupported` on Carrizo, binding errors, `Busy` if another debugger
    /// is registered.
    pub fn dbg_register(&self, table: &DebugManagerTable, device: &Arc<KfdDevice>) -> KfdResult<()> {
        if device.asic == AsicFamily::Carrizo {
            tracing::debug!(gpu_id = device.gpu_id, "debugger is not supported on Carrizo");
            return Err(KfdError::Unsupported("debugger on Carrizo"));
        }

        let mut state = self.state.lock();
        let mut managers = table.managers.lock();
        state.bind(device, self.pasid())?;

        if let Some(owner) = managers.get(&device.gpu_id) {
            tracing::debug!(gpu_id = device.gpu_id, owner, "debugger already registered");
            return Err(KfdError::Busy("debugger already registered"));
        }
        managers.insert(device.gpu_id, self.pasid());
        tracing::debug!(gpu_id = device.gpu_id, pasid = self.pasid(), "registered debugger");
        Ok(())
    }

    /// # Errors
    /// `Unsupported` on Carrizo, `InvalidArgument` unless this process is the
    /// registered debugger.
    pub fn dbg_unregister(&self, table: &DebugManagerTable, device: &KfdDevice) -> KfdResult<()> {
        if device.asic == AsicFamily::Carrizo {
            return Err(KfdError::Unsupported("debugger on Carrizo"));
        }

        let _state = self.state.lock();
        let mut managers = table.managers.lock();
        if managers.get(&device.gpu_id) != Some(&self.pasid()) {
            return Err(KfdError::InvalidArgument("debugger not registered"));
        }
        managers.remove(&device.gpu_id);
        Ok(())
    }
}
