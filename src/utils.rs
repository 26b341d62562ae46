#![allow(clippy::used_underscore_items, clippy::cast_possible_truncation)]

const _IOC_NRBITS: u32 = 8;
const _IOC_TYPEBITS: u32 = 8;
const _IOC_SIZEBITS: u32 = 14;
const _IOC_DIRBITS: u32 = 2;

const _IOC_NRSHIFT: u32 = 0;
const _IOC_TYPESHIFT: u32 = _IOC_NRSHIFT + _IOC_NRBITS;
const _IOC_SIZESHIFT: u32 = _IOC_TYPESHIFT + _IOC_TYPEBITS;
const _IOC_DIRSHIFT: u32 = _IOC_SIZESHIFT + _IOC_SIZEBITS;

const _IOC_NRMASK: u32 = (1 << _IOC_NRBITS) - 1;
const _IOC_SIZEMASK: u32 = (1 << _IOC_SIZEBITS) - 1;
const _IOC_DIRMASK: u32 = (1 << _IOC_DIRBITS) - 1;

pub const IOC_NONE: u32 = 0;
pub const IOC_WRITE: u32 = 1;
pub const IOC_READ: u32 = 2;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
pub const PAGE_MASK: u64 = !(PAGE_SIZE - 1);

#[must_use]
pub const fn _ioc(dir: u32, type_: u32, nr: u32, size: usize) -> u32 {
    (dir << _IOC_DIRSHIFT)
        | (type_ << _IOC_TYPESHIFT)
        | (nr << _IOC_NRSHIFT)
        | ((size as u32) << _IOC_SIZESHIFT)
}

#[must_use]
pub const fn io(type_: u32, nr: u32) -> u32 {
    _ioc(IOC_NONE, type_, nr, 0)
}

#[must_use]
pub const fn ior<T>(type_: u32, nr: u32) -> u32 {
    _ioc(IOC_READ, type_, nr, std::mem::size_of::<T>())
}

#[must_use]
pub const fn iow<T>(type_: u32, nr: u32) -> u32 {
    _ioc(IOC_WRITE, type_, nr, std::mem::size_of::<T>())
}

#[must_use]
pub const fn iowr<T>(type_: u32, nr: u32) -> u32 {
    _ioc(IOC_READ | IOC_WRITE, type_, nr, std::mem::size_of::<T>())
}

#[must_use]
pub const fn ioc_nr(cmd: u32) -> u32 {
    (cmd >> _IOC_NRSHIFT) & _IOC_NRMASK
}

#[must_use]
pub const fn ioc_size(cmd: u32) -> usize {
    ((cmd >> _IOC_SIZESHIFT) & _IOC_SIZEMASK) as usize
}

/// Direction bits as seen from user space: `IOC_WRITE` means the kernel reads the blob.
#[must_use]
pub const fn ioc_dir(cmd: u32) -> u32 {
    (cmd >> _IOC_DIRSHIFT) & _IOC_DIRMASK
}

#[must_use]
pub const fn page_align_down(addr: u64) -> u64 {
    addr & PAGE_MASK
}

#[must_use]
pub const fn is_page_aligned(addr: u64) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}
