//! Debugger support: the deprecated per-device debug manager and the
//! debug-trap interface.

pub mod legacy;
mod trap;

pub use legacy::{AddressWatchInfo, DebugManagerTable, WaveControlInfo};
