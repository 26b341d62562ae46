use crate::error::{KfdError, KfdResult};
use std::collections::BTreeMap;

/// Where a buffer object lives: owning device and its handle in that device's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoLocation {
    pub gpu_id: u32,
    pub idr: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoInterval {
    pub start: u64,
    /// Inclusive end address.
    pub last: u64,
    pub location: BoLocation,
}

/// Virtual address ranges of a process's buffer objects, keyed by start address.
///
/// Ranges never overlap; a buffer object owns `[start, last]`.
#[derive(Debug, Default)]
pub struct BoIntervalMap {
    ranges: BTreeMap<u64, BoInterval>,
}

impl BoIntervalMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any buffer object overlaps `[start, last]`.
    #[must_use]
    pub fn overlaps(&self, start: u64, last: u64) -> bool {
        self.ranges
            .range(..=last)
            .next_back()
            .is_some_and(|(_, interval)| interval.last >= start)
    }

    /// # Errors
    /// `InvalidArgument` when the range overlaps a buffer object already in the map.
    pub fn insert(&mut self, start: u64, size: u64, location: BoLocation) -> KfdResult<()> {
        if size == 0 {
            return Ok(());
        }
        let last = start.saturating_add(size - 1);
        if self.overlaps(start, last) {
            tracing::debug!(start, last, "virtual address range already in use");
            return Err(KfdError::InvalidArgument("virtual address range in use"));
        }
        self.ranges.insert(
            start,
            BoInterval {
                start,
                last,
                location,
            },
        );
        Ok(())
    }

    pub fn remove(&mut self, start: u64, location: BoLocation) {
        if self
            .ranges
            .get(&start)
            .is_some_and(|interval| interval.location == location)
        {
            self.ranges.remove(&start);
        }
    }

    /// The single buffer object overlapping `[start, last]`.
    ///
    /// Returns `None` when nothing overlaps or when the range touches more
    /// than one buffer object. The caller still has to check `last` against
    /// the returned interval.
    #[must_use]
    pub fn find(&self, start: u64, last: u64) -> Option<BoInterval> {
        let mut overlapping = self
            .ranges
            .range(..=last)
            .rev()
            .map(|(_, interval)| interval)
            .take_while(|interval| interval.last >= start);

        let first = overlapping.next().copied()?;
        if overlapping.next().is_some() {
            tracing::debug!(start, last, "range spans more than one buffer object");
            return None;
        }
        Some(first)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}
