//! Asynchronous, coalescing block-file I/O.
//!
//! A [`BlockFile`] sits between callers issuing block-aligned reads, writes
//! and in-file copies, and a [`BlockDevice`] performing the actual transfers.
//! Requests are queued by priority, merged into batches of up to
//! [`MAX_BATCH_SIZE`] bytes and submitted to the device; a request completes
//! once every batch that carried a part of it has finished.
//!
//! # Features
//!
//! - **Coalescing**: contiguous, page-aligned requests of the same kind share
//!   one device submission (scatter/gather when the device supports it)
//! - **Priorities**: foreground work always goes first; background work runs
//!   only when no foreground work is queued or in flight, under a
//!   configurable concurrency cap
//! - **Copies**: read-then-write moves of data within the file
//! - **Extent-mapped devices**: logical offsets are translated through an
//!   [`ExtentTable`] and submissions are split at extent boundaries
//! - **Administrative jobs**: resize, flush, trim and allocation queries run
//!   on a small worker pool and report through a [`JobHandle`]
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use block_io::{BlockFile, EngineConfig, FileDevice, FileDeviceOptions};
//! use block_io::{IoBuffer, IoBuffers, IoKind, Priority};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let device = FileDevice::create(dir.path().join("data.img"), FileDeviceOptions::default())
//!     .unwrap();
//! let file = BlockFile::open(Arc::new(device), EngineConfig::default()).unwrap();
//!
//! let source = IoBuffer::from_slice(&[1u8; 8192], 4096);
//! file.start_transfer(Priority::Foreground, IoKind::Write, 0, IoBuffers::flat(source))
//!     .unwrap()
//!     .wait()
//!     .unwrap();
//!
//! let staging = IoBuffer::zeroed(8192, 4096);
//! file.start_copy(Priority::Background, 0, 65536, IoBuffers::flat(staging))
//!     .unwrap()
//!     .wait()
//!     .unwrap();
//! ```

#![deny(rustdoc::broken_intra_doc_links)]
#![warn(missing_docs)]

mod alignment;
mod assembler;
mod batch;
mod buffer;
mod config;
pub mod debug_io;
mod device;
mod engine;
mod error;
mod extent;
mod fault;
mod jobs;
mod metrics;
mod queue;
mod request;

/// Scripted in-memory device for deterministic tests.
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use alignment::validate_alignment;
pub use batch::BatchKind;
pub use buffer::{BufferSegment, IoBuffer, IoBuffers};
pub use config::{
    DEFAULT_BACKGROUND_LIMIT, DEFAULT_BLOCK_SIZE, DEFAULT_PAGE_SIZE, DEFAULT_QUEUE_DEPTH,
    DEFAULT_SLOW_IO_THRESHOLD, EngineConfig, MAX_BATCH_SIZE, QUEUE_DEPTH_ENV,
    resolve_queue_depth,
};
pub use device::{
    BlockDevice, DeviceCapabilities, DeviceIo, FileDevice, FileDeviceOptions, IoCompleter,
    IoOutcome, IoPriorityHint,
};
pub use engine::{BlockFile, EngineStats};
pub use error::{BlockError, BlockResult};
pub use extent::{Extent, ExtentTable};
pub use fault::FaultSwitch;
pub use jobs::JobHandle;
pub use metrics::{IoMetrics, MetricsSnapshot};
pub use request::{IoKind, Priority, RequestStatus, TransferRequest};
