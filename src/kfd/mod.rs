//! The device-file layer: devices, host capabilities, the ioctl ABI and its dispatcher.

pub mod chardev;
pub mod device;
pub mod host;
pub mod ioctl;
pub mod request;

pub use chardev::{Kfd, KfdFile, MmapTarget};
