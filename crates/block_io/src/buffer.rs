//! Caller-owned I/O buffers.
//!
//! An [`IoBuffer`] is a fixed-size, address-stable allocation whose start is
//! aligned to a caller-chosen boundary. Requests reference buffers through
//! [`BufferSegment`]s, and a request carries either one flat segment or a list
//! of non-contiguous segments ([`IoBuffers`]).
//!
//! # Sharing
//!
//! Buffers are shared through [`Arc`] between the caller and in-flight device
//! submissions. The bytes sit behind a mutex that the device holds only while
//! copying one segment, so the caller can inspect a buffer once its request
//! completes without any unsafe aliasing.

use std::fmt;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard};

/// An address-stable, aligned byte buffer.
pub struct IoBuffer {
    storage: Mutex<Vec<u8>>,
    start: usize,
    len: usize,
    address: usize,
}

impl IoBuffer {
    /// Allocates a zeroed buffer of `len` bytes whose start is a multiple of `align`.
    ///
    /// # Panics
    ///
    /// Panics if `align` is zero.
    #[must_use]
    pub fn zeroed(len: usize, align: usize) -> Arc<Self> {
        assert!(align > 0, "alignment must be positive");
        // Over-allocate so an aligned window of `len` bytes always exists; the
        // vector is never resized, so its heap address is stable.
        let storage = vec![0u8; len + align];
        let base = storage.as_ptr() as usize;
        let start = (align - base % align) % align;
        Arc::new(Self {
            address: base + start,
            storage: Mutex::new(storage),
            start,
            len,
        })
    }

    /// Allocates an aligned buffer holding a copy of `data`.
    #[must_use]
    pub fn from_slice(data: &[u8], align: usize) -> Arc<Self> {
        let buffer = Self::zeroed(data.len(), align);
        buffer.write_at(0, data);
        buffer
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` for a zero-length buffer.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address of the first byte, used for alignment checks.
    #[must_use]
    pub fn address(&self) -> usize {
        self.address
    }

    /// Copies the whole buffer out.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let guard = self.lock();
        guard[self.start..self.start + self.len].to_vec()
    }

    /// Copies `data` into the buffer at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the write would run past the end of the buffer.
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.len, "write past end of buffer");
        let mut guard = self.lock();
        let from = self.start + offset;
        guard[from..from + data.len()].copy_from_slice(data);
    }

    /// Fills the whole buffer with `byte`.
    pub fn fill(&self, byte: u8) {
        let mut guard = self.lock();
        guard[self.start..self.start + self.len].fill(byte);
    }

    /// Runs `f` over the bytes in `range` (relative to the buffer start).
    pub(crate) fn with_bytes<R>(&self, range: Range<usize>, f: impl FnOnce(&[u8]) -> R) -> R {
        debug_assert!(range.end <= self.len);
        let guard = self.lock();
        f(&guard[self.start + range.start..self.start + range.end])
    }

    /// Runs `f` over the mutable bytes in `range` (relative to the buffer start).
    pub(crate) fn with_bytes_mut<R>(
        &self,
        range: Range<usize>,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> R {
        debug_assert!(range.end <= self.len);
        let mut guard = self.lock();
        f(&mut guard[self.start + range.start..self.start + range.end])
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.storage
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

impl fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoBuffer")
            .field("address", &format_args!("{:#x}", self.address))
            .field("len", &self.len)
            .finish()
    }
}

/// A window into an [`IoBuffer`].
#[derive(Debug, Clone)]
pub struct BufferSegment {
    buffer: Arc<IoBuffer>,
    offset: usize,
    len: usize,
}

impl BufferSegment {
    /// Creates a segment covering `len` bytes of `buffer` starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the window exceeds the buffer.
    #[must_use]
    pub fn new(buffer: Arc<IoBuffer>, offset: usize, len: usize) -> Self {
        assert!(offset + len <= buffer.len(), "segment exceeds buffer");
        Self {
            buffer,
            offset,
            len,
        }
    }

    /// Creates a segment covering the whole buffer.
    #[must_use]
    pub fn whole(buffer: Arc<IoBuffer>) -> Self {
        let len = buffer.len();
        Self::new(buffer, 0, len)
    }

    /// Length of the window.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the window is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Memory address of the first byte of the window.
    #[must_use]
    pub fn address(&self) -> usize {
        self.buffer.address() + self.offset
    }

    /// The underlying buffer.
    #[must_use]
    pub fn buffer(&self) -> &Arc<IoBuffer> {
        &self.buffer
    }

    /// Returns the sub-window `[from, from + len)` of this segment.
    #[must_use]
    pub fn slice(&self, from: usize, len: usize) -> Self {
        assert!(from + len <= self.len, "slice exceeds segment");
        Self {
            buffer: Arc::clone(&self.buffer),
            offset: self.offset + from,
            len,
        }
    }

    /// Returns `true` when `next` continues this window in the same buffer.
    pub(crate) fn is_followed_by(&self, next: &Self) -> bool {
        Arc::ptr_eq(&self.buffer, &next.buffer) && self.offset + self.len == next.offset
    }

    /// Grows the window by `len` bytes.
    pub(crate) fn extend(&mut self, len: usize) {
        debug_assert!(self.offset + self.len + len <= self.buffer.len());
        self.len += len;
    }

    /// Copies the window's bytes into `out`.
    ///
    /// # Panics
    ///
    /// Panics if `out` is shorter than the window.
    pub fn read_into(&self, out: &mut [u8]) {
        self.buffer
            .with_bytes(self.offset..self.offset + self.len, |bytes| {
                out[..bytes.len()].copy_from_slice(bytes);
            });
    }

    /// Overwrites the window's bytes from `data`.
    ///
    /// # Panics
    ///
    /// Panics if `data` is shorter than the window.
    pub fn write_from(&self, data: &[u8]) {
        self.buffer
            .with_bytes_mut(self.offset..self.offset + self.len, |bytes| {
                let n = bytes.len();
                bytes.copy_from_slice(&data[..n]);
            });
    }

    /// Runs `f` over the window's bytes.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.buffer.with_bytes(self.offset..self.offset + self.len, f)
    }

    /// Runs `f` over the window's mutable bytes.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.buffer
            .with_bytes_mut(self.offset..self.offset + self.len, f)
    }
}

/// The memory a request transfers to or from.
#[derive(Debug, Clone)]
pub enum IoBuffers {
    /// One contiguous buffer window.
    Flat(BufferSegment),
    /// Non-contiguous windows transferred back to back.
    Segmented(Vec<BufferSegment>),
}

impl IoBuffers {
    /// Wraps a whole buffer as a flat transfer.
    #[must_use]
    pub fn flat(buffer: Arc<IoBuffer>) -> Self {
        Self::Flat(BufferSegment::whole(buffer))
    }

    /// Wraps whole buffers as a segmented transfer.
    #[must_use]
    pub fn segmented(buffers: impl IntoIterator<Item = Arc<IoBuffer>>) -> Self {
        Self::Segmented(buffers.into_iter().map(BufferSegment::whole).collect())
    }

    /// Total number of bytes.
    #[must_use]
    pub fn total_len(&self) -> u64 {
        self.segments().iter().map(|s| s.len() as u64).sum()
    }

    /// The segments in transfer order.
    #[must_use]
    pub fn segments(&self) -> &[BufferSegment] {
        match self {
            Self::Flat(segment) => std::slice::from_ref(segment),
            Self::Segmented(segments) => segments,
        }
    }

    /// Returns the untransferred tail of the segment containing `cursor`.
    ///
    /// `cursor` is a byte offset into the request. The returned window starts
    /// at `cursor` and stops at the end of its segment, so it is always
    /// contiguous in memory.
    pub(crate) fn window_at(&self, cursor: u64) -> Option<BufferSegment> {
        let mut start = 0u64;
        for segment in self.segments() {
            let end = start + segment.len() as u64;
            if cursor < end {
                let skip = (cursor - start) as usize;
                return Some(segment.slice(skip, segment.len() - skip));
            }
            start = end;
        }
        None
    }
}
