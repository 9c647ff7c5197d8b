//! Deterministic in-memory device for engine tests.
//!
//! [`ScriptedDevice`] stores bytes in memory and either completes each
//! submission synchronously from inside `submit`, or holds submissions until
//! the test releases them with [`ScriptedDevice::complete_next`]. Bytes move
//! when a submission completes, not when it is submitted.

use std::collections::VecDeque;
use std::io;
use std::ops::Range;
use std::sync::{Mutex, MutexGuard};

use crate::device::{
    BlockDevice, DeviceCapabilities, DeviceIo, IoCompleter, IoOutcome, IoPriorityHint,
};
use crate::error::BlockError;
use crate::extent::Extent;
use crate::request::{IoKind, Priority};

/// Granularity of [`BlockDevice::allocated_ranges`].
const ALLOCATION_UNIT: u64 = 512;

/// One recorded submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    /// Transfer direction.
    pub kind: IoKind,
    /// Device offset (physical for extent-mapped devices).
    pub offset: u64,
    /// Bytes requested.
    pub length: u64,
    /// Number of memory segments.
    pub segments: usize,
    /// Scheduling class of the batch.
    pub priority: Priority,
    /// Priority hint carried on the submission.
    pub hint: IoPriorityHint,
}

#[derive(Default)]
struct Inner {
    storage: Vec<u8>,
    size: u64,
    extents: Vec<Extent>,
    next_physical: u64,
    held: VecDeque<(DeviceIo, IoCompleter)>,
    failures: Vec<(u64, io::ErrorKind)>,
    resize_failure: Option<io::ErrorKind>,
    extent_query_failure: Option<io::ErrorKind>,
    log: Vec<Submission>,
    outstanding: [usize; 2],
    peak: [usize; 2],
    hint: IoPriorityHint,
    flushes: usize,
}

impl Inner {
    fn physical_end(&mut self, end: u64) {
        let end = usize::try_from(end).unwrap_or(usize::MAX);
        if self.storage.len() < end {
            self.storage.resize(end, 0);
        }
    }

    fn allocate_extents(&mut self, range: Range<u64>, unit: u64) {
        let mut logical = range.start;
        while logical < range.end {
            let length = unit.min(range.end - logical);
            // Leave a gap so physical offsets never equal logical ones.
            self.next_physical += unit;
            self.extents
                .push(Extent::new(logical, length, self.next_physical));
            self.next_physical += length;
            logical += length;
        }
    }

    fn truncate_extents(&mut self, size: u64) {
        self.extents.retain(|extent| extent.logical < size);
        if let Some(last) = self.extents.last_mut()
            && last.end() > size
        {
            last.length = size - last.logical;
        }
    }

    fn logical_to_physical(&self, offset: u64) -> Option<u64> {
        self.extents
            .iter()
            .find(|extent| extent.contains(offset))
            .map(|extent| extent.translate(offset))
    }
}

fn class(priority: Priority) -> usize {
    match priority {
        Priority::Foreground => 0,
        Priority::Background => 1,
    }
}

/// Scripted in-memory [`BlockDevice`].
pub struct ScriptedDevice {
    capabilities: DeviceCapabilities,
    holding: bool,
    transfer_limit: Option<u64>,
    extent_unit: Option<u64>,
    inner: Mutex<Inner>,
}

impl Default for ScriptedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedDevice {
    /// A device that completes every submission before `submit` returns.
    #[must_use]
    pub fn new() -> Self {
        Self {
            capabilities: DeviceCapabilities::default(),
            holding: false,
            transfer_limit: None,
            extent_unit: None,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// A device that holds submissions until the test completes them.
    #[must_use]
    pub fn held() -> Self {
        Self::new().holding()
    }

    /// Switches to held mode.
    #[must_use]
    pub fn holding(mut self) -> Self {
        self.holding = true;
        self
    }

    /// Reports the file as read-only.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.capabilities.read_only = true;
        self
    }

    /// Reports the file as sparse.
    #[must_use]
    pub fn sparse(mut self) -> Self {
        self.capabilities.sparse = true;
        self
    }

    /// Refuses multi-segment submissions.
    #[must_use]
    pub fn without_scatter_gather(mut self) -> Self {
        self.capabilities.scatter_gather = false;
        self
    }

    /// Maps logical offsets through extents of at most `unit` bytes,
    /// allocated whenever the file grows.
    #[must_use]
    pub fn extent_mapped(mut self, unit: u64) -> Self {
        self.capabilities.extent_mapped = true;
        self.extent_unit = Some(unit.max(1));
        self
    }

    /// Transfers at most `limit` bytes per submission.
    #[must_use]
    pub fn with_transfer_limit(mut self, limit: u64) -> Self {
        self.transfer_limit = Some(limit);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    /// Fails the next submission addressed at device `offset`.
    pub fn fail_at(&self, offset: u64, kind: io::ErrorKind) {
        self.lock().failures.push((offset, kind));
    }

    /// Fails the next [`BlockDevice::set_size`] call without changing the size.
    pub fn fail_next_resize(&self, kind: io::ErrorKind) {
        self.lock().resize_failure = Some(kind);
    }

    /// Fails the next [`BlockDevice::query_extents`] call.
    pub fn fail_next_extent_query(&self, kind: io::ErrorKind) {
        self.lock().extent_query_failure = Some(kind);
    }

    /// Submissions held and not yet completed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock().held.len()
    }

    /// Completes the oldest held submission; `false` if none was held.
    pub fn complete_next(&self) -> bool {
        let next = self.lock().held.pop_front();
        match next {
            Some((io, completer)) => {
                let outcome = self.perform(&io);
                completer.complete(outcome);
                true
            }
            None => false,
        }
    }

    /// Completes held submissions, including ones submitted meanwhile,
    /// until none remain. Returns how many were completed.
    pub fn complete_all(&self) -> usize {
        let mut completed = 0;
        while self.complete_next() {
            completed += 1;
        }
        completed
    }

    /// Every submission so far, in order.
    #[must_use]
    pub fn submissions(&self) -> Vec<Submission> {
        self.lock().log.clone()
    }

    /// Highest number of simultaneously outstanding submissions of `priority`.
    #[must_use]
    pub fn peak_outstanding(&self, priority: Priority) -> usize {
        self.lock().peak[class(priority)]
    }

    /// Number of flushes performed.
    #[must_use]
    pub fn flushes(&self) -> usize {
        self.lock().flushes
    }

    /// Current priority hint.
    #[must_use]
    pub fn hint(&self) -> IoPriorityHint {
        self.lock().hint
    }

    /// Reads `len` bytes at logical `offset`, bypassing the engine.
    #[must_use]
    pub fn read_back(&self, offset: u64, len: usize) -> Vec<u8> {
        let inner = self.lock();
        (0..len as u64)
            .map(|i| {
                let logical = offset + i;
                let physical = if self.capabilities.extent_mapped {
                    inner.logical_to_physical(logical)
                } else {
                    Some(logical)
                };
                physical
                    .and_then(|at| usize::try_from(at).ok())
                    .and_then(|at| inner.storage.get(at).copied())
                    .unwrap_or(0)
            })
            .collect()
    }

    /// Writes `data` at logical `offset`, bypassing the engine.
    pub fn seed(&self, offset: u64, data: &[u8]) {
        let mut inner = self.lock();
        for (i, byte) in data.iter().enumerate() {
            let logical = offset + i as u64;
            let physical = if self.capabilities.extent_mapped {
                inner.logical_to_physical(logical)
            } else {
                Some(logical)
            };
            if let Some(at) = physical {
                inner.physical_end(at + 1);
                inner.storage[at as usize] = *byte;
            }
        }
        if !self.capabilities.extent_mapped {
            inner.size = inner.size.max(offset + data.len() as u64);
        }
    }

    /// Moves the bytes of a submission and decides its outcome.
    fn perform(&self, io: &DeviceIo) -> IoOutcome {
        let mut inner = self.lock();
        inner.outstanding[class(io.priority)] -= 1;

        if let Some(index) = inner
            .failures
            .iter()
            .position(|(offset, _)| *offset == io.offset)
        {
            let (_, kind) = inner.failures.remove(index);
            return IoOutcome::failure(BlockError::from_io(&io::Error::new(
                kind,
                "injected failure",
            )));
        }
        if io.kind == IoKind::Write && self.capabilities.read_only {
            return IoOutcome::failure(BlockError::from_io(&io::Error::from(
                io::ErrorKind::PermissionDenied,
            )));
        }

        let moved = self.transfer_limit.map_or(io.length, |limit| limit.min(io.length));
        let mut device_at = io.offset;
        let mut left = moved;
        for segment in &io.segments {
            if left == 0 {
                break;
            }
            let take = (segment.len() as u64).min(left);
            let start = device_at as usize;
            let end = start + take as usize;
            match io.kind {
                IoKind::Write => {
                    inner.physical_end(device_at + take);
                    let storage = &mut inner.storage[start..end];
                    segment.with_bytes(|bytes| storage.copy_from_slice(&bytes[..take as usize]));
                }
                IoKind::Read => {
                    let storage = &inner.storage;
                    segment.with_bytes_mut(|bytes| {
                        for (i, byte) in bytes[..take as usize].iter_mut().enumerate() {
                            *byte = storage.get(start + i).copied().unwrap_or(0);
                        }
                    });
                }
            }
            device_at += take;
            left -= take;
        }
        if io.kind == IoKind::Write && !self.capabilities.extent_mapped {
            inner.size = inner.size.max(io.offset + moved);
        }
        IoOutcome::partial(io.length - moved)
    }
}

impl std::fmt::Debug for ScriptedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedDevice")
            .field("capabilities", &self.capabilities)
            .field("holding", &self.holding)
            .finish_non_exhaustive()
    }
}

impl BlockDevice for ScriptedDevice {
    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    fn submit(&self, io: DeviceIo, completer: IoCompleter) {
        {
            let mut inner = self.lock();
            inner.log.push(Submission {
                kind: io.kind,
                offset: io.offset,
                length: io.length,
                segments: io.segments.len(),
                priority: io.priority,
                hint: io.hint,
            });
            let class = class(io.priority);
            inner.outstanding[class] += 1;
            inner.peak[class] = inner.peak[class].max(inner.outstanding[class]);
            if self.holding {
                inner.held.push_back((io, completer));
                return;
            }
        }
        let outcome = self.perform(&io);
        completer.complete(outcome);
    }

    fn query_extents(&self, range: Range<u64>) -> io::Result<Vec<Extent>> {
        let mut inner = self.lock();
        if let Some(kind) = inner.extent_query_failure.take() {
            return Err(io::Error::from(kind));
        }
        Ok(inner
            .extents
            .iter()
            .filter(|extent| extent.logical < range.end && extent.end() > range.start)
            .map(|extent| {
                let start = extent.logical.max(range.start);
                let end = extent.end().min(range.end);
                Extent::new(start, end - start, extent.translate(start))
            })
            .collect())
    }

    fn flush(&self) -> io::Result<()> {
        self.lock().flushes += 1;
        Ok(())
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.lock().size)
    }

    fn set_size(&self, size: u64) -> io::Result<()> {
        if self.capabilities.read_only {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        let mut inner = self.lock();
        if let Some(kind) = inner.resize_failure.take() {
            return Err(io::Error::from(kind));
        }
        let old = inner.size;
        match self.extent_unit {
            Some(unit) if size > old => inner.allocate_extents(old..size, unit),
            Some(_) => inner.truncate_extents(size),
            None => {
                let end = usize::try_from(size).unwrap_or(usize::MAX);
                inner.storage.resize(end, 0);
            }
        }
        inner.size = size;
        Ok(())
    }

    fn trim(&self, range: Range<u64>) -> io::Result<()> {
        if !self.capabilities.sparse {
            return Err(io::Error::from(io::ErrorKind::Unsupported));
        }
        let mut inner = self.lock();
        let end = range.end.min(inner.size);
        for at in range.start..end {
            let physical = if self.capabilities.extent_mapped {
                inner.logical_to_physical(at)
            } else {
                Some(at)
            };
            if let Some(physical) = physical
                && let Some(byte) = inner.storage.get_mut(physical as usize)
            {
                *byte = 0;
            }
        }
        Ok(())
    }

    fn allocated_ranges(&self, range: Range<u64>) -> io::Result<Vec<Range<u64>>> {
        if !self.capabilities.sparse {
            return Err(io::Error::from(io::ErrorKind::Unsupported));
        }
        let size = self.lock().size;
        let end = range.end.min(size);
        let mut ranges: Vec<Range<u64>> = Vec::new();
        let mut block = range.start - range.start % ALLOCATION_UNIT;
        while block < end {
            let block_end = (block + ALLOCATION_UNIT).min(end);
            let len = (block_end - block) as usize;
            let allocated = self.read_back(block, len).iter().any(|&b| b != 0);
            if allocated {
                let start = block.max(range.start);
                match ranges.last_mut() {
                    Some(last) if last.end == start => last.end = block_end,
                    _ => ranges.push(start..block_end),
                }
            }
            block = block_end;
        }
        Ok(ranges)
    }

    fn set_priority_hint(&self, hint: IoPriorityHint) -> io::Result<()> {
        self.lock().hint = hint;
        Ok(())
    }
}
