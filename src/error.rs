use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KfdError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("No such device: gpu_id 0x{0:x}")]
    NoSuchDevice(u32),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("No such process: {0}")]
    NoSuchProcess(u32),

    #[error("Permission denied: {0}")]
    PermissionDenied(&'static str),

    #[error("KFD file used from a process other than its opener")]
    BadFile,

    #[error("Resource busy: {0}")]
    Busy(&'static str),

    #[error("Unsupported: {0}")]
    Unsupported(&'static str),

    #[error("Bad address 0x{0:x}")]
    Fault(u64),

    #[error("Operation timed out")]
    Timeout,

    #[error("Resource temporarily unavailable")]
    TryAgain,

    #[error("Already exists: {0}")]
    AlreadyExists(&'static str),

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Device error: {0}")]
    Device(String),
}

impl KfdError {
    /// The negative errno reported through the raw ioctl transport.
    #[must_use]
    pub const fn errno(&self) -> i32 {
        let code = match self {
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::NoSuchDevice(_) => libc::ENODEV,
            Self::NotFound(_) => libc::ENOENT,
            Self::NoSuchProcess(_) => libc::ESRCH,
            Self::PermissionDenied(_) => libc::EPERM,
            Self::BadFile => libc::EBADF,
            Self::Busy(_) => libc::EBUSY,
            Self::Unsupported(_) => libc::EOPNOTSUPP,
            Self::Fault(_) => libc::EFAULT,
            Self::Timeout => libc::ETIME,
            Self::TryAgain => libc::EAGAIN,
            Self::AlreadyExists(_) => libc::EEXIST,
            Self::OutOfMemory => libc::ENOMEM,
            Self::Device(_) => libc::EIO,
        };
        -code
    }
}

/// Result type of every fallible entry point in the crate.
pub type KfdResult<T> = Result<T, KfdError>;
