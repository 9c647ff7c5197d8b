//! The storage primitive consumed by the engine.
//!
//! A [`BlockDevice`] accepts one [`DeviceIo`] at a time per batch and reports
//! back through the [`IoCompleter`] it was handed, from any thread and at any
//! later point (including synchronously, before `submit` returns).
//! Administrative calls are blocking and run on the engine's job pool.

mod file;

pub use file::{FileDevice, FileDeviceOptions};

use std::fmt;
use std::io;
use std::ops::Range;
use std::sync::Weak;

use crate::buffer::BufferSegment;
use crate::error::BlockError;
use crate::extent::Extent;
use crate::request::{IoKind, Priority};

/// What a device can do; queried once when the file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// The device accepts multi-segment submissions.
    pub scatter_gather: bool,
    /// Submissions must address physical offsets from
    /// [`BlockDevice::query_extents`].
    pub extent_mapped: bool,
    /// The file must not be modified.
    pub read_only: bool,
    /// The file supports holes (trim and allocation queries).
    pub sparse: bool,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            scatter_gather: true,
            extent_mapped: false,
            read_only: false,
            sparse: false,
        }
    }
}

/// System I/O priority hint carried on every submission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum IoPriorityHint {
    /// Lowest priority.
    VeryLow,
    /// Below normal.
    Low,
    /// Default.
    #[default]
    Normal,
}

/// One device submission.
#[derive(Debug, Clone)]
pub struct DeviceIo {
    /// Transfer direction.
    pub kind: IoKind,
    /// Device offset: logical, or physical for extent-mapped devices.
    pub offset: u64,
    /// Total bytes across `segments`.
    pub length: u64,
    /// Memory windows transferred back to back.
    pub segments: Vec<BufferSegment>,
    /// Scheduling class of the batch.
    pub priority: Priority,
    /// Current system priority hint.
    pub hint: IoPriorityHint,
}

/// Result of one device submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoOutcome {
    /// Failure of the submission, if any.
    pub status: Result<(), BlockError>,
    /// Bytes of the submission that were not transferred.
    pub bytes_remaining: u64,
}

impl IoOutcome {
    /// Everything transferred.
    #[must_use]
    pub const fn success() -> Self {
        Self {
            status: Ok(()),
            bytes_remaining: 0,
        }
    }

    /// Succeeded but stopped `bytes_remaining` short of the requested length.
    #[must_use]
    pub const fn partial(bytes_remaining: u64) -> Self {
        Self {
            status: Ok(()),
            bytes_remaining,
        }
    }

    /// Failed.
    #[must_use]
    pub const fn failure(error: BlockError) -> Self {
        Self {
            status: Err(error),
            bytes_remaining: 0,
        }
    }
}

/// Receiver of device completions; implemented by the engine.
pub(crate) trait CompletionSink: Send + Sync {
    fn deliver(&self, token: usize, outcome: IoOutcome);
}

/// One-shot completion callback for a [`DeviceIo`].
///
/// Dropping a completer without calling [`complete`](Self::complete) reports
/// the submission as failed, so a device that shuts down with work in hand
/// never strands a batch.
pub struct IoCompleter {
    token: usize,
    sink: Option<Weak<dyn CompletionSink>>,
}

impl IoCompleter {
    pub(crate) fn new(token: usize, sink: Weak<dyn CompletionSink>) -> Self {
        Self {
            token,
            sink: Some(sink),
        }
    }

    /// Reports the outcome of the submission.
    pub fn complete(mut self, outcome: IoOutcome) {
        self.deliver(outcome);
    }

    fn deliver(&mut self, outcome: IoOutcome) {
        if let Some(sink) = self.sink.take().and_then(|weak| weak.upgrade()) {
            sink.deliver(self.token, outcome);
        }
    }
}

impl fmt::Debug for IoCompleter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoCompleter")
            .field("token", &self.token)
            .field("pending", &self.sink.is_some())
            .finish()
    }
}

impl Drop for IoCompleter {
    fn drop(&mut self) {
        if self.sink.is_some() {
            self.deliver(IoOutcome::failure(BlockError::from_io(&io::Error::new(
                io::ErrorKind::Interrupted,
                "device dropped the submission",
            ))));
        }
    }
}

/// A raw or sparse file the engine reads and writes in blocks.
pub trait BlockDevice: Send + Sync + 'static {
    /// Capabilities of the opened file.
    fn capabilities(&self) -> DeviceCapabilities;

    /// Starts an asynchronous transfer; `completer` must be completed exactly
    /// once, from any thread.
    fn submit(&self, io: DeviceIo, completer: IoCompleter);

    /// Physical extents backing the logical `range`.
    ///
    /// Only called for extent-mapped devices.
    fn query_extents(&self, range: Range<u64>) -> io::Result<Vec<Extent>> {
        let _ = range;
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    /// Makes completed writes durable.
    fn flush(&self) -> io::Result<()>;

    /// Current end of file.
    fn size(&self) -> io::Result<u64>;

    /// Truncates or extends the file.
    fn set_size(&self, size: u64) -> io::Result<()>;

    /// Releases the storage behind `range` of a sparse file.
    fn trim(&self, range: Range<u64>) -> io::Result<()> {
        let _ = range;
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    /// Allocated (non-hole) ranges of a sparse file within `range`.
    fn allocated_ranges(&self, range: Range<u64>) -> io::Result<Vec<Range<u64>>> {
        let _ = range;
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    /// Applies a new system priority hint.
    fn set_priority_hint(&self, hint: IoPriorityHint) -> io::Result<()> {
        let _ = hint;
        Ok(())
    }
}
