//! Cross-process memory copies between buffer objects of two KFD processes.
//!
//! Both sides are arrays of virtual ranges, each range lying inside one
//! buffer object of its process. Chunks are copied on whichever device can
//! reach both buffers; userptr memory is either copied on the host or wrapped
//! into a GTT shadow buffer, and VRAM on two different devices is bounced
//! through a system-memory buffer on the source device.

mod iter;

use crate::config::KfdConfig;
use crate::error::{KfdError, KfdResult};
use crate::kfd::Kfd;
use crate::kfd::device::{Fence, KfdDevice, MemId};
use crate::kfd::host::{AddressSpace, PinnedPages, Task, copy_array_from_user};
use crate::kfd::ioctl::{CrossMemoryCopyArgs, MemoryRange, is_cross_memory_write};
use crate::process::{AllocFlags, Process, ProcessRef};
use crate::utils::{PAGE_MASK, PAGE_SIZE};
use iter::CmaIter;
use std::sync::Arc;

/// Result of a cross-memory copy.
///
/// `bytes_copied` is valid even when `result` is an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOutcome {
    pub bytes_copied: u64,
    pub result: KfdResult<()>,
}

/// Direction of a copy, seen from the calling process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    /// Local sources into remote destinations.
    Write,
    /// Remote sources into local destinations.
    Read,
}

/// One side of a copy: a process, the address space its userptr ranges
/// live in, and its ranges.
#[derive(Debug, Clone, Copy)]
pub struct CopySide<'a> {
    pub process: &'a Process,
    pub mm: &'a Arc<dyn AddressSpace>,
    pub ranges: &'a [MemoryRange],
}

/// The system-memory bounce buffer of device-to-device copies.
#[derive(Debug)]
struct BounceBo {
    device: Arc<KfdDevice>,
    mem: MemId,
}

impl Drop for BounceBo {
    fn drop(&mut self) {
        if let Err(err) = self.device.backend().free_memory(self.mem) {
            tracing::warn!(gpu_id = self.device.gpu_id, %err, "failed to free bounce buffer");
        }
    }
}

#[derive(Debug)]
struct Chunk {
    fence: Option<Fence>,
    copied: u64,
}

struct CopyEngine<'a> {
    config: &'a KfdConfig,
    direction: CopyDirection,
    bounce: Option<BounceBo>,
    last_fence: Option<Fence>,
}

impl CopyEngine<'_> {
    fn wait(&self, fence: &Fence) -> KfdResult<()> {
        fence.wait_timeout(self.config.cma_wait_timeout).inspect_err(|err| {
            tracing::error!(context = fence.context(), seqno = fence.seqno(), %err, "copy fence wait failed");
        })
    }

    /// Copies between two userptr buffers through the host, one remote page at a time.
    fn copy_userptr(&self, src: &CmaIter<'_>, dst: &CmaIter<'_>, size: u64) -> KfdResult<u64> {
        let write = self.direction == CopyDirection::Write;
        let (remote, local) = if write { (dst, src) } else { (src, dst) };
        let remote_addr = remote.bo()?.cpu_addr.ok_or(KfdError::Fault(0))? + remote.bo_offset();
        let mut local_addr = local.bo()?.cpu_addr.ok_or(KfdError::Fault(0))? + local.bo_offset();

        let offset_in_page = remote_addr & !PAGE_MASK;
        let mut page_addr = remote_addr & PAGE_MASK;
        let mut pages_left = (size + offset_in_page).div_ceil(PAGE_SIZE);
        let mut offset = offset_in_page;
        let mut to_copy = size;
        let batch = self.config.userptr_pin_batch_pages.max(1);
        let mut buf = vec![0u8; PAGE_SIZE as usize];

        while to_copy > 0 && pages_left > 0 {
            let pinned = PinnedPages::pin(&remote.mm, page_addr, pages_left.min(batch), write)?;
            for _ in 0..pinned.npages() {
                if to_copy == 0 {
                    break;
                }
                let len = to_copy.min(PAGE_SIZE - offset);
                let chunk = &mut buf[..len as usize];
                if write {
                    local.mm.read(local_addr, chunk)?;
                    remote.mm.write(page_addr + offset, chunk)?;
                } else {
                    remote.mm.read(page_addr + offset, chunk)?;
                    local.mm.write(local_addr, chunk)?;
                }
                to_copy -= len;
                local_addr += len;
                page_addr += PAGE_SIZE;
                offset = 0;
            }
            pages_left -= pinned.npages();
        }
        Ok(size - to_copy)
    }

    /// Copies up to `size` bytes from the buffer under `src` to the one under
    /// `dst` and returns how many bytes the submitted copy moves.
    fn copy_bos(&mut self, src: &mut CmaIter<'_>, dst: &mut CmaIter<'_>, size: u64) -> KfdResult<Chunk> {
        let src_bo = src.bo()?.clone();
        let dst_bo = dst.bo()?.clone();

        if src_bo.is_userptr() && dst_bo.is_userptr() {
            let copied = self.copy_userptr(src, dst, size)?;
            return Ok(Chunk {
                fence: None,
                copied,
            });
        }

        let mut device = Arc::clone(&dst_bo.device);
        let (mut src_mem, mut src_offset) = (src_bo.mem, src.bo_offset());
        let (mut dst_mem, mut dst_offset) = (dst_bo.mem, dst.bo_offset());
        let mut size = size;
        let mut bounced = false;

        if src_bo.is_userptr() {
            let (mem, offset, covered) = src.create_shadow(&device, size, false)?;
            (src_mem, src_offset, size) = (mem, offset, covered);
        } else if dst_bo.is_userptr() {
            device = Arc::clone(&src_bo.device);
            let (mem, offset, covered) = dst.create_shadow(&device, size, true)?;
            (dst_mem, dst_offset, size) = (mem, offset, covered);
        } else if src_bo.device.gpu_id != dst_bo.device.gpu_id {
            if src_bo.is_vram() && dst_bo.is_vram() {
                // Bounced chunks finish before returning, so earlier work is settled first.
                if let Some(previous) = self.last_fence.take() {
                    self.wait(&previous)?;
                }
                size = size.min(self.config.max_system_bo_size());
                let bounce = self.bounce_buffer(src.process, &src_bo.device)?;
                let (fence, moved) = src_bo
                    .device
                    .backend()
                    .copy_mem_to_mem(src_mem, src_offset, bounce, 0, size)?;
                self.wait(&fence)?;
                (src_mem, src_offset, size) = (bounce, 0, moved);
                bounced = true;
            } else if src_bo.is_vram() {
                device = Arc::clone(&src_bo.device);
            }
        }

        let (fence, copied) = device
            .backend()
            .copy_mem_to_mem(src_mem, src_offset, dst_mem, dst_offset, size)
            .inspect_err(|err| {
                tracing::error!(gpu_id = device.gpu_id, size, %err, "copy submission failed");
            })?;
        if bounced {
            self.wait(&fence)?;
            return Ok(Chunk {
                fence: None,
                copied,
            });
        }
        Ok(Chunk {
            fence: Some(fence),
            copied,
        })
    }

    /// Allocates the bounce buffer on the first device-to-device chunk.
    fn bounce_buffer(&mut self, process: &Process, device: &Arc<KfdDevice>) -> KfdResult<MemId> {
        if let Some(bounce) = &self.bounce {
            return Ok(bounce.mem);
        }
        let vm = {
            let state = process.state.lock();
            state
                .pdds
                .get(&device.gpu_id)
                .ok_or(KfdError::InvalidArgument("process not bound to source device"))?
                .vm_handle()?
        };
        let flags = AllocFlags {
            gtt: true,
            writable: true,
            no_substitute: true,
            ..AllocFlags::default()
        };
        let (mem, _) = device
            .backend()
            .alloc_memory(vm, 0, self.config.max_system_bo_size(), flags, None)
            .map_err(|err| {
                tracing::error!(gpu_id = device.gpu_id, %err, "failed to allocate bounce buffer");
                KfdError::InvalidArgument("bounce buffer allocation")
            })?;
        self.bounce = Some(BounceBo {
            device: Arc::clone(device),
            mem,
        });
        Ok(mem)
    }

    /// Remembers the fence of a submitted chunk. Chunks on one device
    /// complete in order; when the device changes the previous chunk is
    /// waited for first.
    fn track(&mut self, fence: Fence) -> KfdResult<()> {
        let previous = self.last_fence.replace(fence);
        if let Some(previous) = previous
            && self
                .last_fence
                .as_ref()
                .is_some_and(|fence| fence.context() != previous.context())
        {
            return self.wait(&previous);
        }
        Ok(())
    }

    /// Copies the rest of the current source range into the destination,
    /// spilling over destination ranges as needed.
    fn copy_single_range(&mut self, src: &mut CmaIter<'_>, dst: &mut CmaIter<'_>, copied: &mut u64) -> KfdResult<()> {
        let mut size = src.range_remaining();

        while size > 0 && !dst.at_end() {
            let chunk = size.min(dst.range_remaining());
            let Chunk { fence, copied: n } = self.copy_bos(src, dst, chunk)?;
            if let Some(fence) = fence {
                self.track(fence)?;
            }
            if n == 0 {
                return Err(KfdError::Device("copy made no progress".into()));
            }
            *copied += n;
            size -= n;
            src.advance(n)?;
            dst.advance(n)?;
        }
        Ok(())
    }
}

/// Copies `src` ranges into `dst` ranges.
///
/// The fence of the last submitted chunk is always waited for before
/// returning, also after a failure.
#[must_use]
pub fn copy_ranges(config: &KfdConfig, direction: CopyDirection, src: CopySide<'_>, dst: CopySide<'_>) -> CopyOutcome {
    let iters = CmaIter::new(src.ranges, src.process, Arc::clone(src.mm))
        .and_then(|src_iter| Ok((src_iter, CmaIter::new(dst.ranges, dst.process, Arc::clone(dst.mm))?)));
    let (mut src_iter, mut dst_iter) = match iters {
        Ok(iters) => iters,
        Err(err) => {
            return CopyOutcome {
                bytes_copied: 0,
                result: Err(err),
            };
        }
    };

    let mut engine = CopyEngine {
        config,
        direction,
        bounce: None,
        last_fence: None,
    };
    let mut bytes_copied = 0;
    let mut result = Ok(());
    while !src_iter.at_end() && !dst_iter.at_end() {
        if let Err(err) = engine.copy_single_range(&mut src_iter, &mut dst_iter, &mut bytes_copied) {
            tracing::error!(copied = bytes_copied, %err, "cross-memory copy failed");
            result = Err(err);
            break;
        }
    }

    if let Some(fence) = engine.last_fence.take()
        && let Err(err) = engine.wait(&fence)
        && result.is_ok()
    {
        result = Err(err);
    }
    // Shadow and bounce buffers are dropped with the iterators and the engine,
    // after the last copy has finished.
    CopyOutcome { bytes_copied, result }
}

impl Kfd {
    /// Copies between the calling process and the process `args.pid`.
    ///
    /// On return `args.bytes_copied` holds the bytes moved, also on failure,
    /// except for argument errors caught before anything was attempted.
    ///
    /// # Errors
    /// `InvalidArgument` for null or empty arrays and for a target that never
    /// opened the device, `Fault` for unreadable arrays or unmapped ranges,
    /// `NoSuchProcess` for an unknown pid, `PermissionDenied` when the caller
    /// may not access the target's memory, `Timeout` when the final copy
    /// never completes.
    pub fn cross_memory_copy(&self, local: &ProcessRef, caller: &Task, args: &mut CrossMemoryCopyArgs) -> KfdResult<()> {
        if args.src_mem_range_array == 0
            || args.src_mem_array_size == 0
            || args.dst_mem_range_array == 0
            || args.dst_mem_array_size == 0
        {
            return Err(KfdError::InvalidArgument("empty cross-memory copy arrays"));
        }
        args.bytes_copied = 0;

        let src_ranges: Vec<MemoryRange> = copy_array_from_user(
            caller.mm.as_ref(),
            args.src_mem_range_array,
            args.src_mem_array_size as usize,
        )?;
        let dst_ranges: Vec<MemoryRange> = copy_array_from_user(
            caller.mm.as_ref(),
            args.dst_mem_range_array,
            args.dst_mem_array_size as usize,
        )?;

        let target = self
            .host()
            .find_task(args.pid)
            .ok_or(KfdError::NoSuchProcess(args.pid))?;
        let remote_mm = self.host().mm_access(caller, &target).inspect_err(|err| {
            tracing::debug!(pid = args.pid, %err, "cannot access target address space");
        })?;
        let remote = self
            .processes()
            .lookup_by_tgid(target.tgid)
            .ok_or(KfdError::InvalidArgument("target never opened the device"))?;

        let local_side = |ranges| CopySide {
            process: local,
            mm: &caller.mm,
            ranges,
        };
        let remote_side = |ranges| CopySide {
            process: &remote,
            mm: &remote_mm,
            ranges,
        };
        let (direction, src, dst) = if is_cross_memory_write(args.flags) {
            (CopyDirection::Write, local_side(&src_ranges), remote_side(&dst_ranges))
        } else {
            (CopyDirection::Read, remote_side(&src_ranges), local_side(&dst_ranges))
        };

        let outcome = copy_ranges(self.config(), direction, src, dst);
        args.bytes_copied = outcome.bytes_copied;
        tracing::debug!(pid = args.pid, ?direction, bytes = outcome.bytes_copied, "cross-memory copy done");
        outcome.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kfd::ioctl::KFD_CROSS_MEMORY_RW_BIT;
    use crate::testutil::TestBed;
    use std::time::Duration;
    use zerocopy::IntoBytes;

    fn range(va_addr: u64, size: u64) -> MemoryRange {
        MemoryRange { va_addr, size }
    }

    fn side<'a>(process: &'a Process, ranges: &'a [MemoryRange]) -> CopySide<'a> {
        CopySide {
            process,
            mm: process.mm(),
            ranges,
        }
    }

    #[test]
    fn same_device_copy_spans_ranges() {
        let bed = TestBed::new();
        let local = bed.open(100);
        let remote = bed.open(200);
        bed.alloc_vram(&local, bed.gpu_a, 0x10_0000, 0x4000);
        bed.alloc_vram(&remote, bed.gpu_a, 0x20_0000, 0x2000);
        bed.alloc_vram(&remote, bed.gpu_a, 0x30_0000, 0x2000);

        let src = [range(0x10_0000, 0x3000)];
        let dst = [range(0x20_0000, 0x2000), range(0x30_0000, 0x1000)];
        let outcome = copy_ranges(
            &KfdConfig::default(),
            CopyDirection::Write,
            side(&local, &src),
            side(&remote, &dst),
        );
        assert_eq!(outcome.result, Ok(()));
        assert_eq!(outcome.bytes_copied, 0x3000);

        let copies = bed.backend_a.copies();
        assert_eq!(copies.len(), 2);
        assert_eq!(copies[0].size, 0x2000);
        assert_eq!(copies[1].src_offset, 0x2000);
        assert_eq!(copies[1].dst_offset, 0);
    }

    #[test]
    fn copy_stops_when_destination_is_exhausted() {
        let bed = TestBed::new();
        let local = bed.open(100);
        let remote = bed.open(200);
        bed.alloc_vram(&local, bed.gpu_a, 0x10_0000, 0x4000);
        bed.alloc_vram(&remote, bed.gpu_a, 0x20_0000, 0x1000);

        let src = [range(0x10_0000, 0x4000)];
        let dst = [range(0x20_0000, 0x1000)];
        let outcome = copy_ranges(
            &KfdConfig::default(),
            CopyDirection::Write,
            side(&local, &src),
            side(&remote, &dst),
        );
        assert_eq!(outcome.result, Ok(()));
        assert_eq!(outcome.bytes_copied, 0x1000);
    }

    #[test]
    fn vram_between_devices_bounces_through_system_memory() {
        let bed = TestBed::new();
        let local = bed.open(100);
        let remote = bed.open(200);
        bed.alloc_vram(&local, bed.gpu_a, 0x10_0000, 0x3000);
        bed.alloc_vram(&remote, bed.gpu_b, 0x20_0000, 0x3000);

        let config = KfdConfig::default().with_max_system_bo_pages(2);
        let src = [range(0x10_0000, 0x3000)];
        let dst = [range(0x20_0000, 0x3000)];
        let outcome = copy_ranges(&config, CopyDirection::Write, side(&local, &src), side(&remote, &dst));
        assert_eq!(outcome.result, Ok(()));
        assert_eq!(outcome.bytes_copied, 0x3000);

        // Each chunk is staged on the source device, then pulled by the destination.
        assert_eq!(bed.backend_a.copies().len(), 2);
        assert_eq!(bed.backend_b.copies().len(), 2);
        assert_eq!(bed.backend_a.copies()[0].size, 0x2000);
        assert_eq!(bed.backend_b.copies()[1].size, 0x1000);
        // The bounce buffer is gone afterwards.
        assert_eq!(bed.backend_a.live_allocations(), 1);
    }

    #[test]
    fn vram_to_gtt_on_other_device_runs_on_source() {
        let bed = TestBed::new();
        let local = bed.open(100);
        let remote = bed.open(200);
        bed.alloc_vram(&local, bed.gpu_a, 0x10_0000, 0x1000);
        bed.alloc_gtt(&remote, bed.gpu_b, 0x20_0000, 0x1000);

        let src = [range(0x10_0000, 0x1000)];
        let dst = [range(0x20_0000, 0x1000)];
        let outcome = copy_ranges(
            &KfdConfig::default(),
            CopyDirection::Write,
            side(&local, &src),
            side(&remote, &dst),
        );
        assert_eq!(outcome.result, Ok(()));
        assert_eq!(bed.backend_a.copies().len(), 1);
        assert!(bed.backend_b.copies().is_empty());
    }

    #[test]
    fn userptr_to_userptr_copies_on_the_host() {
        let bed = TestBed::new();
        let local = bed.open(100);
        let remote = bed.open(200);
        bed.alloc_userptr(&local, bed.gpu_a, 0x10_0000, 0x2000, 0x1_0000);
        bed.alloc_userptr(&remote, bed.gpu_a, 0x20_0000, 0x2000, 0x1_0000);

        let payload: Vec<u8> = (0..0x1800u32).map(|i| (i % 251) as u8).collect();
        local.mm().write(0x1_0000, &payload).unwrap();

        let src = [range(0x10_0000, 0x1800)];
        let dst = [range(0x20_0400, 0x1800)];
        let config = KfdConfig::default().with_userptr_pin_batch_pages(1);
        let outcome = copy_ranges(&config, CopyDirection::Write, side(&local, &src), side(&remote, &dst));
        assert_eq!(outcome.result, Ok(()));
        assert_eq!(outcome.bytes_copied, 0x1800);

        let mut copied = vec![0u8; 0x1800];
        remote.mm().read(0x1_0400, &mut copied).unwrap();
        assert_eq!(copied, payload);
        assert!(bed.backend_a.copies().is_empty());
    }

    #[test]
    fn userptr_source_is_shadowed_on_destination_device() {
        let bed = TestBed::new();
        let local = bed.open(100);
        let remote = bed.open(200);
        bed.alloc_userptr(&local, bed.gpu_a, 0x10_0000, 0x2000, 0x1_0000);
        local.bind_device(&bed.device_b).unwrap();
        bed.alloc_vram(&remote, bed.gpu_b, 0x20_0000, 0x2000);

        let src = [range(0x10_0100, 0x1000)];
        let dst = [range(0x20_0000, 0x1000)];
        let outcome = copy_ranges(
            &KfdConfig::default(),
            CopyDirection::Write,
            side(&local, &src),
            side(&remote, &dst),
        );
        assert_eq!(outcome.result, Ok(()));
        assert_eq!(outcome.bytes_copied, 0x1000);

        let copies = bed.backend_b.copies();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].src_offset, 0x100);
        assert_eq!(bed.backend_b.imports(), 1);
        // Shadow freed and pages unpinned.
        assert_eq!(bed.backend_b.live_allocations(), 1);
        assert_eq!(bed.mm(100).pinned_pages(), 0);
    }

    #[test]
    fn partial_pin_shortens_the_chunk() {
        let bed = TestBed::new();
        let local = bed.open(100);
        let remote = bed.open(200);
        bed.alloc_userptr(&local, bed.gpu_a, 0x10_0000, 0x2000, 0x1_0000);
        local.bind_device(&bed.device_b).unwrap();
        bed.alloc_vram(&remote, bed.gpu_b, 0x20_0000, 0x2000);
        bed.mm(100).set_pin_limit(1);

        let src = [range(0x10_0100, 0x1800)];
        let dst = [range(0x20_0000, 0x1800)];
        let outcome = copy_ranges(
            &KfdConfig::default(),
            CopyDirection::Write,
            side(&local, &src),
            side(&remote, &dst),
        );
        assert_eq!(outcome.result, Ok(()));
        assert_eq!(outcome.bytes_copied, 0x1800);

        let sizes: Vec<u64> = bed.backend_b.copies().iter().map(|copy| copy.size).collect();
        assert_eq!(sizes, [0xf00, 0x900]);
        assert_eq!(bed.backend_b.imports(), 2);
        assert_eq!(bed.mm(100).pinned_pages(), 0);
    }

    #[test]
    fn userptr_shadow_needs_binding_on_the_copy_device() {
        let bed = TestBed::new();
        let local = bed.open(100);
        let remote = bed.open(200);
        bed.alloc_userptr(&local, bed.gpu_a, 0x10_0000, 0x1000, 0x1_0000);
        bed.alloc_vram(&remote, bed.gpu_b, 0x20_0000, 0x1000);

        let src = [range(0x10_0000, 0x1000)];
        let dst = [range(0x20_0000, 0x1000)];
        let outcome = copy_ranges(
            &KfdConfig::default(),
            CopyDirection::Write,
            side(&local, &src),
            side(&remote, &dst),
        );
        assert!(matches!(outcome.result, Err(KfdError::InvalidArgument(_))));
        assert_eq!(outcome.bytes_copied, 0);
    }

    #[test]
    fn unmapped_destination_reports_partial_progress() {
        let bed = TestBed::new();
        let local = bed.open(100);
        let remote = bed.open(200);
        bed.alloc_vram(&local, bed.gpu_a, 0x10_0000, 0x2000);
        bed.alloc_vram(&remote, bed.gpu_a, 0x20_0000, 0x1000);

        let src = [range(0x10_0000, 0x2000)];
        let dst = [range(0x20_0000, 0x1000), range(0x40_0000, 0x1000)];
        let outcome = copy_ranges(
            &KfdConfig::default(),
            CopyDirection::Write,
            side(&local, &src),
            side(&remote, &dst),
        );
        assert!(matches!(outcome.result, Err(KfdError::Fault(_))));
        assert_eq!(outcome.bytes_copied, 0x1000);
    }

    #[test]
    fn unsignaled_final_fence_times_out() {
        let bed = TestBed::new();
        let local = bed.open(100);
        let remote = bed.open(200);
        bed.alloc_vram(&local, bed.gpu_a, 0x10_0000, 0x1000);
        bed.alloc_vram(&remote, bed.gpu_a, 0x20_0000, 0x1000);
        bed.backend_a.hold_fences(true);

        let config = KfdConfig::default().with_cma_wait_timeout(Duration::from_millis(10));
        let src = [range(0x10_0000, 0x1000)];
        let dst = [range(0x20_0000, 0x1000)];
        let outcome = copy_ranges(&config, CopyDirection::Write, side(&local, &src), side(&remote, &dst));
        assert_eq!(outcome.result, Err(KfdError::Timeout));
        assert_eq!(outcome.bytes_copied, 0x1000);
    }

    #[test]
    fn bounce_waits_for_the_pending_chunk_first() {
        let bed = TestBed::new();
        let local = bed.open(100);
        let remote = bed.open(200);
        bed.alloc_vram(&local, bed.gpu_a, 0x10_0000, 0x2000);
        bed.alloc_vram(&remote, bed.gpu_a, 0x20_0000, 0x1000);
        bed.alloc_vram(&remote, bed.gpu_b, 0x30_0000, 0x1000);
        bed.backend_a.hold_fences(true);

        let config = KfdConfig::default().with_cma_wait_timeout(Duration::from_millis(10));
        let src = [range(0x10_0000, 0x2000)];
        let dst = [range(0x20_0000, 0x1000), range(0x30_0000, 0x1000)];
        let outcome = copy_ranges(&config, CopyDirection::Write, side(&local, &src), side(&remote, &dst));
        assert_eq!(outcome.result, Err(KfdError::Timeout));
        assert_eq!(outcome.bytes_copied, 0x1000);
        // The staging copy was never submitted behind the unfinished chunk.
        assert_eq!(bed.backend_a.copies().len(), 1);
        assert!(bed.backend_b.copies().is_empty());
    }

    #[test]
    fn ioctl_entry_resolves_remote_process() {
        let bed = TestBed::new();
        let kfd = bed.kfd();
        let caller = bed.task(100);
        let local = bed.open(100);
        let remote = bed.open(200);
        bed.alloc_vram(&local, bed.gpu_a, 0x10_0000, 0x1000);
        bed.alloc_vram(&remote, bed.gpu_a, 0x20_0000, 0x1000);

        let src = [range(0x10_0000, 0x1000)];
        let dst = [range(0x20_0000, 0x1000)];
        caller.mm.write(0x8000, src.as_bytes()).unwrap();
        caller.mm.write(0x9000, dst.as_bytes()).unwrap();

        let mut args = CrossMemoryCopyArgs {
            pid: 200,
            flags: KFD_CROSS_MEMORY_RW_BIT,
            src_mem_range_array: 0x8000,
            src_mem_array_size: 1,
            dst_mem_range_array: 0x9000,
            dst_mem_array_size: 1,
            bytes_copied: 77,
        };
        kfd.cross_memory_copy(&local, &caller, &mut args).unwrap();
        assert_eq!(args.bytes_copied, 0x1000);
    }

    #[test]
    fn ioctl_entry_rejects_null_arrays_and_unknown_targets() {
        let bed = TestBed::new();
        let kfd = bed.kfd();
        let caller = bed.task(100);
        let local = bed.open(100);

        let mut args = CrossMemoryCopyArgs {
            pid: 200,
            bytes_copied: 77,
            ..CrossMemoryCopyArgs::default()
        };
        let err = kfd.cross_memory_copy(&local, &caller, &mut args).unwrap_err();
        assert!(matches!(err, KfdError::InvalidArgument(_)));
        assert_eq!(args.bytes_copied, 77);

        caller.mm.write(0x8000, range(0x10_0000, 0x1000).as_bytes()).unwrap();
        args.src_mem_range_array = 0x8000;
        args.src_mem_array_size = 1;
        args.dst_mem_range_array = 0x8000;
        args.dst_mem_array_size = 1;
        args.pid = 999;
        let err = kfd.cross_memory_copy(&local, &caller, &mut args).unwrap_err();
        assert_eq!(err, KfdError::NoSuchProcess(999));
        assert_eq!(args.bytes_copied, 0);

        // Known task that never opened the device.
        bed.host.add_task(bed.task(300));
        args.pid = 300;
        let err = kfd.cross_memory_copy(&local, &caller, &mut args).unwrap_err();
        assert!(matches!(err, KfdError::InvalidArgument(_)));
    }
}
