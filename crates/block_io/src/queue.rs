//! FIFO of pending requests plus the partially consumed "current" request.

use std::collections::VecDeque;

use crate::request::RequestId;

/// Position inside the request at the head of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Cursor {
    pub(crate) id: RequestId,
    /// Bytes of the request already placed into batches.
    pub(crate) consumed: u64,
}

/// One priority class of pending work.
///
/// Requests leave `pending` in insertion order. Once the assembler has taken
/// part of a request it becomes `current` and stays logically at the head
/// until every byte has been placed into a batch.
#[derive(Debug, Default)]
pub(crate) struct RequestQueue {
    pending: VecDeque<RequestId>,
    current: Option<Cursor>,
}

impl RequestQueue {
    pub(crate) fn enqueue(&mut self, id: RequestId) {
        self.pending.push_back(id);
    }

    /// Removes a request that has not been touched by the assembler.
    ///
    /// Returns `false` if the request is not in the pending list, which
    /// includes the case where it is the current request.
    pub(crate) fn remove(&mut self, id: RequestId) -> bool {
        match self.pending.iter().position(|queued| *queued == id) {
            Some(index) => {
                self.pending.remove(index);
                true
            }
            None => false,
        }
    }

    /// Empty list and no active cursor.
    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.current.is_none()
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn current(&self) -> Option<Cursor> {
        self.current
    }

    pub(crate) fn set_current(&mut self, cursor: Option<Cursor>) {
        self.current = cursor;
    }

    pub(crate) fn take_current(&mut self) -> Option<Cursor> {
        self.current.take()
    }

    pub(crate) fn pop_front(&mut self) -> Option<RequestId> {
        self.pending.pop_front()
    }

    /// Empties the pending list, leaving any current request in place.
    pub(crate) fn drain_pending(&mut self) -> Vec<RequestId> {
        self.pending.drain(..).collect()
    }
}
