use crate::error::{KfdError, KfdResult};
use crate::kfd::device::{KfdDevice, MemId};
use crate::kfd::host::{AddressSpace, PinnedPages};
use crate::kfd::ioctl::MemoryRange;
use crate::process::{BufferObject, Process};
use crate::utils::{PAGE_MASK, PAGE_SIZE};
use std::sync::Arc;

/// A GTT buffer wrapping pinned pages of a userptr range, so the other side's
/// device can reach them. Freed and unpinned on drop.
#[derive(Debug)]
pub(crate) struct ShadowBo {
    device: Arc<KfdDevice>,
    mem: MemId,
    _pages: PinnedPages,
}

impl Drop for ShadowBo {
    fn drop(&mut self) {
        if let Err(err) = self.device.backend().free_memory(self.mem) {
            tracing::warn!(gpu_id = self.device.gpu_id, %err, "failed to free shadow buffer");
        }
    }
}

/// Cursor over one side of a cross-memory copy: an array of user ranges and
/// the buffer object under the current position.
#[derive(Debug)]
pub(crate) struct CmaIter<'a> {
    ranges: &'a [MemoryRange],
    index: usize,
    /// Offset inside `ranges[index]`.
    offset: u64,
    /// Bytes left across all ranges.
    total: u64,
    pub(crate) process: &'a Process,
    pub(crate) mm: Arc<dyn AddressSpace>,
    bo: Option<BufferObject>,
    bo_offset: u64,
    shadows: Vec<ShadowBo>,
}

impl<'a> CmaIter<'a> {
    /// # Errors
    /// `InvalidArgument` for an empty array or a byte count that overflows,
    /// `Fault` if the first range is not covered by one buffer object.
    pub(crate) fn new(
        ranges: &'a [MemoryRange],
        process: &'a Process,
        mm: Arc<dyn AddressSpace>,
    ) -> KfdResult<Self> {
        if ranges.is_empty() {
            return Err(KfdError::InvalidArgument("empty range array"));
        }
        let total = ranges
            .iter()
            .try_fold(0u64, |sum, range| sum.checked_add(range.size))
            .ok_or(KfdError::InvalidArgument("range sizes overflow"))?;

        let mut iter = Self {
            ranges,
            index: 0,
            offset: 0,
            total,
            process,
            mm,
            bo: None,
            bo_offset: 0,
            shadows: Vec::new(),
        };
        if total == 0 {
            return Ok(iter);
        }
        iter.skip_empty_ranges();
        iter.update_bo()?;
        Ok(iter)
    }

    fn skip_empty_ranges(&mut self) {
        while self.index < self.ranges.len() && self.ranges[self.index].size == 0 {
            self.index += 1;
        }
    }

    fn update_bo(&mut self) -> KfdResult<()> {
        let range = self.ranges[self.index];
        let last = range
            .va_addr
            .checked_add(range.size - 1)
            .ok_or(KfdError::Fault(range.va_addr))?;
        let (interval, bo) = self.process.bo_covering(range.va_addr, last)?;
        self.bo_offset = range.va_addr + self.offset - interval.start;
        self.bo = Some(bo);
        Ok(())
    }

    /// Moves the cursor `bytes` forward, stepping into the next range and
    /// buffer object once the current range is consumed.
    ///
    /// # Errors
    /// `Fault` when `bytes` runs past the current range or the remaining
    /// total, or when the next range has no buffer object.
    pub(crate) fn advance(&mut self, bytes: u64) -> KfdResult<()> {
        if self.at_end() {
            return Ok(());
        }
        let range = self.ranges[self.index];
        let offset = self.offset + bytes;
        if bytes > self.total || offset > range.size {
            return Err(KfdError::Fault(range.va_addr));
        }
        self.total -= bytes;
        self.offset = offset;
        self.bo_offset += bytes;

        if self.offset == range.size {
            self.index += 1;
            self.offset = 0;
            self.skip_empty_ranges();
            if self.at_end() {
                self.bo = None;
                return Ok(());
            }
            self.update_bo()?;
        }
        Ok(())
    }

    #[must_use]
    pub(crate) fn at_end(&self) -> bool {
        self.index >= self.ranges.len() || self.total == 0
    }

    /// Bytes left in the current range.
    #[must_use]
    pub(crate) fn range_remaining(&self) -> u64 {
        self.ranges
            .get(self.index)
            .map_or(0, |range| range.size - self.offset)
    }

    #[must_use]
    pub(crate) fn remaining(&self) -> u64 {
        self.total
    }

    /// The buffer object under the cursor.
    ///
    /// # Errors
    /// `Fault` once the iterator is exhausted.
    pub(crate) fn bo(&self) -> KfdResult<&BufferObject> {
        self.bo.as_ref().ok_or(KfdError::Fault(0))
    }

    /// Offset of the cursor inside [`Self::bo`].
    #[must_use]
    pub(crate) const fn bo_offset(&self) -> u64 {
        self.bo_offset
    }

    /// Pins the userptr pages under the cursor and wraps them in a GTT buffer
    /// on `device`, in this side's process VM. Returns the buffer and the
    /// offset of the cursor inside it.
    ///
    /// The returned size is smaller than `size` when not every page could be pinned.
    ///
    /// # Errors
    /// `InvalidArgument` if this side's process is not bound to `device`,
    /// `Fault` if no page can be pinned, or the backend failure.
    pub(crate) fn create_shadow(
        &mut self,
        device: &Arc<KfdDevice>,
        size: u64,
        write: bool,
    ) -> KfdResult<(MemId, u64, u64)> {
        // (buffer, offset of the cursor inside it, bytes covered)
        let bo = self.bo()?;
        let cpu_addr = bo
            .cpu_addr
            .ok_or(KfdError::InvalidArgument("shadow of a non-userptr buffer"))?;
        let addr = cpu_addr + self.bo_offset;
        let offset_in_page = addr & !PAGE_MASK;
        let npages = (size + offset_in_page).div_ceil(PAGE_SIZE);

        let vm = {
            let state = self.process.state.lock();
            state
                .pdds
                .get(&device.gpu_id)
                .ok_or(KfdError::InvalidArgument("process not bound to copy device"))?
                .vm_handle()?
        };

        let pages = PinnedPages::pin(&self.mm, addr & PAGE_MASK, npages, write)?;
        let size = if pages.npages() < npages {
            pages.len() - offset_in_page
        } else {
            size
        };
        let mem = device.backend().import_pinned_pages(vm, &pages)?;
        tracing::trace!(gpu_id = device.gpu_id, addr, size, "created shadow buffer");

        self.shadows.push(ShadowBo {
            device: Arc::clone(device),
            mem,
            _pages: pages,
        });
        Ok((mem, offset_in_page, size))
    }
}
