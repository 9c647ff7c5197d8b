//! Batches (coalesced device submissions) and the fixed pool that owns them.
//!
//! The pool is sized once to the queue depth. Acquiring hands out the index
//! of a free batch; releasing resets it and pushes the index back on a stack,
//! so the most recently finished batch is reused first.

use std::time::Instant;

use crate::buffer::BufferSegment;
use crate::error::BlockError;
use crate::request::{IoKind, Priority, RequestId};

/// Batch representation, fixed per file at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    /// Page-aligned ranges merge into a list of buffer segments.
    Segmented,
    /// Every batch carries exactly one buffer window.
    Flat,
}

/// Phase of a batch; plain transfers only ever use the first phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BatchPhase {
    /// Plain transfer, or the read half of a copy.
    Primary,
    /// Write half of a copy.
    CopyWrite,
}

/// Memory carried by a batch.
#[derive(Debug, Clone, Default)]
pub(crate) enum BatchPayload {
    #[default]
    Empty,
    /// Page-aligned windows in file order.
    Segments(Vec<BufferSegment>),
    /// A single window that may not be merged with anything else.
    Flat(BufferSegment),
}

impl BatchPayload {
    fn segments(&self) -> &[BufferSegment] {
        match self {
            Self::Empty => &[],
            Self::Segments(segments) => segments,
            Self::Flat(segment) => std::slice::from_ref(segment),
        }
    }

    /// Windows covering `[from, from + len)` of the batch's bytes.
    pub(crate) fn window(&self, from: u64, len: u64) -> Vec<BufferSegment> {
        let end = from + len;
        let mut out = Vec::new();
        let mut start = 0u64;
        for segment in self.segments() {
            let seg_end = start + segment.len() as u64;
            if seg_end > from && start < end {
                let lo = from.max(start) - start;
                let hi = end.min(seg_end) - start;
                out.push(segment.slice(lo as usize, (hi - lo) as usize));
            }
            if seg_end >= end {
                break;
            }
            start = seg_end;
        }
        out
    }
}

/// One coalesced I/O unit.
#[derive(Debug)]
pub(crate) struct Batch {
    pub(crate) priority: Priority,
    pub(crate) kind: IoKind,
    pub(crate) is_copy: bool,
    pub(crate) offset: u64,
    pub(crate) target_offset: u64,
    pub(crate) length: u64,
    pub(crate) payload: BatchPayload,
    /// Pages referenced by a segmented payload.
    pub(crate) pages: usize,
    /// Requests holding a reference through this batch, each listed once.
    pub(crate) requests: Vec<RequestId>,
    pub(crate) phase: BatchPhase,
    /// Bytes of the current phase already transferred.
    pub(crate) progress: u64,
    /// Length of the outstanding device submission.
    pub(crate) submitted_len: u64,
    pub(crate) submitted_at: Option<Instant>,
    pub(crate) status: Option<BlockError>,
}

impl Default for Batch {
    fn default() -> Self {
        Self {
            priority: Priority::Foreground,
            kind: IoKind::Read,
            is_copy: false,
            offset: 0,
            target_offset: 0,
            length: 0,
            payload: BatchPayload::Empty,
            pages: 0,
            requests: Vec::new(),
            phase: BatchPhase::Primary,
            progress: 0,
            submitted_len: 0,
            submitted_at: None,
            status: None,
        }
    }
}

impl Batch {
    pub(crate) fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// File offset where the current phase starts.
    pub(crate) fn phase_offset(&self) -> u64 {
        match self.phase {
            BatchPhase::Primary => self.offset,
            BatchPhase::CopyWrite => self.target_offset,
        }
    }

    /// Device operation of the current phase.
    pub(crate) fn phase_kind(&self) -> IoKind {
        match self.phase {
            BatchPhase::Primary => self.kind,
            BatchPhase::CopyWrite => IoKind::Write,
        }
    }

    /// Records `id` as a constituent; returns `true` if it was not yet listed.
    pub(crate) fn attach(&mut self, id: RequestId) -> bool {
        if self.requests.last() == Some(&id) {
            return false;
        }
        debug_assert!(!self.requests.contains(&id));
        self.requests.push(id);
        true
    }

    fn reset(&mut self) {
        let mut requests = std::mem::take(&mut self.requests);
        requests.clear();
        *self = Self {
            requests,
            ..Self::default()
        };
    }
}

/// Fixed set of batches, allocated once.
#[derive(Debug)]
pub(crate) struct BatchPool {
    batches: Vec<Batch>,
    free: Vec<usize>,
}

impl BatchPool {
    pub(crate) fn new(depth: usize) -> Self {
        let batches = (0..depth).map(|_| Batch::default()).collect();
        let free = (0..depth).rev().collect();
        Self { batches, free }
    }

    pub(crate) fn acquire(&mut self) -> Option<usize> {
        self.free.pop()
    }

    /// Resets the batch and makes it available again.
    pub(crate) fn release(&mut self, index: usize) {
        debug_assert!(!self.free.contains(&index));
        self.batches[index].reset();
        self.free.push(index);
    }

    pub(crate) fn get(&self, index: usize) -> &Batch {
        &self.batches[index]
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> &mut Batch {
        &mut self.batches[index]
    }

    pub(crate) fn available(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.batches.len()
    }
}
