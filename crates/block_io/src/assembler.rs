//! Batch assembly: queue selection and greedy coalescing.
//!
//! [`fill_batch`] picks a queue using the foreground-first policy and pulls
//! ranges from it into a free batch until the batch is full, the queue runs
//! dry, or the next range cannot be merged. [`add_to_batch`] decides how much
//! of one memory-contiguous range a batch can take.

use crate::alignment::is_window_aligned;
use crate::batch::{Batch, BatchKind, BatchPayload};
use crate::buffer::BufferSegment;
use crate::config::EngineConfig;
use crate::queue::{Cursor, RequestQueue};
use crate::request::{IoKind, Priority, RequestArena, RequestPhase};

/// Limits applied while filling a batch.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Geometry {
    pub(crate) page_size: usize,
    pub(crate) max_batch_size: u64,
    pub(crate) max_segments: usize,
    pub(crate) batch_kind: BatchKind,
}

impl Geometry {
    pub(crate) fn new(config: &EngineConfig, batch_kind: BatchKind) -> Self {
        Self {
            page_size: config.page_size,
            max_batch_size: config.max_batch_size as u64,
            max_segments: config.max_segments_per_batch,
            batch_kind,
        }
    }
}

/// Batches currently submitted, per priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct InFlight {
    pub(crate) foreground: usize,
    pub(crate) background: usize,
}

impl InFlight {
    pub(crate) fn increment(&mut self, priority: Priority) {
        match priority {
            Priority::Foreground => self.foreground += 1,
            Priority::Background => self.background += 1,
        }
    }

    pub(crate) fn decrement(&mut self, priority: Priority) {
        let slot = match priority {
            Priority::Foreground => &mut self.foreground,
            Priority::Background => &mut self.background,
        };
        debug_assert!(*slot > 0);
        *slot = slot.saturating_sub(1);
    }
}

/// The two request queues.
#[derive(Debug, Default)]
pub(crate) struct Queues {
    pub(crate) foreground: RequestQueue,
    pub(crate) background: RequestQueue,
}

impl Queues {
    pub(crate) fn get_mut(&mut self, priority: Priority) -> &mut RequestQueue {
        match priority {
            Priority::Foreground => &mut self.foreground,
            Priority::Background => &mut self.background,
        }
    }
}

/// Chooses which queue the next batch drains, if any.
///
/// Foreground wins whenever it has pending work. Background is considered
/// only when no foreground batch is in flight, and only below its cap.
pub(crate) fn select_queue(
    queues: &Queues,
    in_flight: InFlight,
    background_limit: usize,
) -> Option<Priority> {
    if !queues.foreground.is_empty() {
        return Some(Priority::Foreground);
    }
    if in_flight.foreground > 0 || queues.background.is_empty() {
        return None;
    }
    if in_flight.background >= background_limit {
        return None;
    }
    Some(Priority::Background)
}

/// Fills `batch` from the selected queue.
///
/// Returns `false` when nothing could be dispatched; the batch is left empty.
pub(crate) fn fill_batch(
    geometry: &Geometry,
    queues: &mut Queues,
    requests: &mut RequestArena,
    batch: &mut Batch,
    in_flight: InFlight,
    background_limit: usize,
) -> bool {
    let Some(priority) = select_queue(queues, in_flight, background_limit) else {
        return false;
    };
    let queue = queues.get_mut(priority);

    loop {
        let cursor = match queue.current() {
            Some(cursor) => cursor,
            None => {
                let Some(id) = queue.pop_front() else {
                    break;
                };
                let Some(request) = requests.get_mut(id) else {
                    continue;
                };
                request.enqueued = false;
                request.phase = RequestPhase::InFlight;
                // The queue's claim on its current request.
                request.ref_count += 1;
                Cursor { id, consumed: 0 }
            }
        };
        let Some(request) = requests.get_mut(cursor.id) else {
            queue.set_current(None);
            continue;
        };

        let mut consumed = cursor.consumed;
        let mut blocked = false;
        while consumed < request.length {
            let Some(window) = request.params.buffers.window_at(consumed) else {
                break;
            };
            let len = window.len() as u64;
            let not_added = add_to_batch(
                geometry,
                batch,
                priority,
                request.params.kind,
                request.params.offset + consumed,
                request.params.target_offset.map(|target| target + consumed),
                &window,
            );
            let added = len - not_added;
            if added > 0 {
                if batch.attach(cursor.id) {
                    request.ref_count += 1;
                }
                consumed += added;
            }
            if not_added > 0 {
                blocked = true;
                break;
            }
        }

        if consumed >= request.length {
            queue.set_current(None);
            request.ref_count -= 1;
        } else {
            queue.set_current(Some(Cursor {
                id: cursor.id,
                consumed,
            }));
        }
        if blocked {
            break;
        }
    }

    !batch.is_empty()
}

/// Offers one memory-contiguous range to `batch`.
///
/// Returns the number of bytes of `window` that were not added.
pub(crate) fn add_to_batch(
    geometry: &Geometry,
    batch: &mut Batch,
    priority: Priority,
    kind: IoKind,
    offset: u64,
    target_offset: Option<u64>,
    window: &BufferSegment,
) -> u64 {
    let len = window.len() as u64;
    if matches!(batch.payload, BatchPayload::Flat(_)) {
        return len;
    }

    let mergeable = geometry.batch_kind == BatchKind::Segmented
        && is_window_aligned(window.address(), len, geometry.page_size);

    if !mergeable {
        if !batch.is_empty() {
            return len;
        }
        let take = len.min(geometry.max_batch_size);
        open_batch(batch, priority, kind, offset, target_offset);
        batch.payload = BatchPayload::Flat(window.slice(0, take as usize));
        batch.length = take;
        return len - take;
    }

    if batch.is_empty() {
        open_batch(batch, priority, kind, offset, target_offset);
    } else {
        let end = batch.offset + batch.length;
        let target_matches = match target_offset {
            Some(target) => batch.is_copy && target == batch.target_offset + batch.length,
            None => !batch.is_copy,
        };
        if offset != end || kind != batch.kind || !target_matches {
            return len;
        }
    }

    let page = geometry.page_size as u64;
    let byte_room = geometry.max_batch_size - batch.length;
    let page_room =
        (geometry.max_segments.saturating_sub(batch.pages) as u64).saturating_mul(page);
    let take = len.min(byte_room).min(page_room);
    if take == 0 {
        return len;
    }

    let piece = window.slice(0, take as usize);
    match &mut batch.payload {
        BatchPayload::Segments(segments) => match segments.last_mut() {
            Some(last) if last.is_followed_by(&piece) => last.extend(piece.len()),
            _ => segments.push(piece),
        },
        payload => *payload = BatchPayload::Segments(vec![piece]),
    }
    batch.length += take;
    batch.pages += (take / page) as usize;
    len - take
}

fn open_batch(
    batch: &mut Batch,
    priority: Priority,
    kind: IoKind,
    offset: u64,
    target_offset: Option<u64>,
) {
    batch.priority = priority;
    batch.kind = kind;
    batch.is_copy = target_offset.is_some();
    batch.offset = offset;
    batch.target_offset = target_offset.unwrap_or(0);
}
