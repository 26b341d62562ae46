//! Compute-queue, process and device binding core of the AMD KFD driver.
//!
//! A [`Kfd`] context owns the registered devices and every process that
//! opened the device file. User space talks to it through
//! [`Kfd::ioctl`] and [`Kfd::mmap`]; the hardware and the host kernel sit
//! behind the [`kfd::device::DeviceBackend`] and [`kfd::host::HostServices`]
//! traits.

pub mod cma;
pub mod config;
pub mod debug;
pub mod error;
pub mod events;
pub mod kfd;
pub mod process;
pub mod queues;
pub mod utils;

#[cfg(test)]
mod testutil;

pub use config::KfdConfig;
pub use error::{KfdError, KfdResult};
pub use kfd::Kfd;
