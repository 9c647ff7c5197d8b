//! Logical-to-physical extent map for extent-mapped devices.
//!
//! Devices that need caller-supplied physical offsets (see
//! [`DeviceCapabilities::extent_mapped`](crate::device::DeviceCapabilities))
//! get an [`ExtentTable`] built at open time. Lookups are range searches: any
//! offset inside an extent finds that extent, and an insert that overlaps an
//! existing extent is rejected as a duplicate.

use std::collections::BTreeMap;
use std::ops::Range;

use crate::error::{BlockError, BlockResult};

/// One contiguous logical range and the physical offset backing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// First logical byte covered.
    pub logical: u64,
    /// Number of bytes covered.
    pub length: u64,
    /// Physical offset of `logical`.
    pub physical: u64,
}

impl Extent {
    /// Creates an extent.
    #[must_use]
    pub const fn new(logical: u64, length: u64, physical: u64) -> Self {
        Self {
            logical,
            length,
            physical,
        }
    }

    /// One past the last logical byte.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.logical + self.length
    }

    /// Returns `true` if `offset` lies inside this extent.
    #[must_use]
    pub const fn contains(&self, offset: u64) -> bool {
        offset >= self.logical && offset < self.end()
    }

    /// Physical offset of a logical `offset` inside this extent.
    #[must_use]
    pub const fn translate(&self, offset: u64) -> u64 {
        self.physical + (offset - self.logical)
    }

    /// Bytes between `offset` and the end of this extent.
    #[must_use]
    pub const fn remaining_from(&self, offset: u64) -> u64 {
        self.end() - offset
    }
}

/// Interval map of non-overlapping extents keyed by logical start.
#[derive(Debug, Clone, Default)]
pub struct ExtentTable {
    extents: BTreeMap<u64, Extent>,
}

impl ExtentTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of extents held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    /// Returns `true` if no extents are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Extents in logical order.
    pub fn iter(&self) -> impl Iterator<Item = &Extent> {
        self.extents.values()
    }

    /// Finds the extent containing `offset`.
    #[must_use]
    pub fn find_containing(&self, offset: u64) -> Option<Extent> {
        self.extents
            .range(..=offset)
            .next_back()
            .map(|(_, extent)| *extent)
            .filter(|extent| extent.contains(offset))
    }

    /// Inserts an extent.
    ///
    /// Empty extents and extents overlapping an existing one are rejected
    /// with [`BlockError::InvalidParameter`].
    pub fn insert(&mut self, extent: Extent) -> BlockResult<()> {
        if extent.length == 0 || self.overlaps(extent.logical..extent.end()) {
            return Err(BlockError::InvalidParameter);
        }
        self.extents.insert(extent.logical, extent);
        Ok(())
    }

    /// Drops everything at or beyond `offset`.
    ///
    /// An extent crossing `offset` is truncated so its head stays mapped.
    pub fn remove_from(&mut self, offset: u64) {
        let tail = self.extents.split_off(&offset);
        drop(tail);
        if let Some(mut entry) = self.extents.last_entry() {
            let extent = entry.get_mut();
            if extent.end() > offset {
                extent.length = offset - extent.logical;
            }
        }
    }

    /// Covered logical ranges with adjacent extents coalesced.
    #[must_use]
    pub fn covered_ranges(&self) -> Vec<Range<u64>> {
        let mut ranges: Vec<Range<u64>> = Vec::new();
        for extent in self.extents.values() {
            match ranges.last_mut() {
                Some(last) if last.end == extent.logical => last.end = extent.end(),
                _ => ranges.push(extent.logical..extent.end()),
            }
        }
        ranges
    }

    /// Returns `true` if `range` is mapped without gaps.
    #[must_use]
    pub fn covers(&self, range: Range<u64>) -> bool {
        let mut cursor = range.start;
        while cursor < range.end {
            match self.find_containing(cursor) {
                Some(extent) => cursor = extent.end(),
                None => return false,
            }
        }
        true
    }

    fn overlaps(&self, range: Range<u64>) -> bool {
        if let Some((_, before)) = self.extents.range(..=range.start).next_back()
            && before.end() > range.start
        {
            return true;
        }
        self.extents.range(range.start..range.end).next().is_some()
    }
}
