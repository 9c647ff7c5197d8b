//! The block-file engine: dispatch, completion and administrative jobs.
//!
//! # Locking
//!
//! All queue, batch and request bookkeeping lives in one [`EngineState`]
//! behind a single mutex. Device submissions and caller-visible completions
//! always happen after the lock is released.
//!
//! # Pump
//!
//! Device completions are pushed onto a channel and drained by a trampoline.
//! Whichever thread wins the `pumping` flag processes completions and
//! dispatches new batches in a loop; every other thread, including a device
//! that completes synchronously from inside `submit`, only raises
//! `pump_requested` and returns. Stack depth therefore stays constant no
//! matter how many completions arrive back to back.

use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use crate::alignment::validate_alignment;
use crate::assembler::{Geometry, InFlight, Queues, fill_batch};
use crate::batch::{BatchKind, BatchPhase, BatchPool};
use crate::buffer::IoBuffers;
use crate::config::EngineConfig;
use crate::debug_io;
use crate::device::{
    BlockDevice, CompletionSink, DeviceCapabilities, DeviceIo, IoCompleter, IoOutcome,
    IoPriorityHint,
};
use crate::error::{BlockError, BlockResult};
use crate::extent::ExtentTable;
use crate::fault::FaultSwitch;
use crate::jobs::{JobHandle, JobPool};
use crate::metrics::{IoMetrics, MetricsSnapshot};
use crate::request::{
    CompletionSignal, IoKind, Priority, RequestArena, RequestId, RequestParams, RequestPhase,
    RequestState, RequestStatus, TransferRequest,
};

/// Snapshot of queue and in-flight state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    /// Foreground requests waiting, including a partially consumed one.
    pub foreground_queued: usize,
    /// Background requests waiting, including a partially consumed one.
    pub background_queued: usize,
    /// Foreground batches at the device.
    pub foreground_in_flight: usize,
    /// Background batches at the device.
    pub background_in_flight: usize,
    /// Batches available in the pool.
    pub free_batches: usize,
    /// Size of the batch pool.
    pub queue_depth: usize,
    /// Current background concurrency cap.
    pub background_limit: usize,
    /// Batch representation chosen at open.
    pub batch_kind: BatchKind,
    /// Request slots in use.
    pub live_requests: usize,
    /// Extents currently mapped (extent-mapped devices only).
    pub extents: usize,
    /// Counters from the injected metrics collector.
    pub metrics: MetricsSnapshot,
}

/// A device completion waiting for the pump.
struct Completion {
    batch: usize,
    outcome: IoOutcome,
}

/// A request ready to be completed outside the lock.
struct Finished {
    signal: Arc<CompletionSignal>,
    outcome: BlockResult<()>,
    operation: &'static str,
    offset: u64,
}

struct EngineState {
    requests: RequestArena,
    queues: Queues,
    pool: BatchPool,
    in_flight: InFlight,
    background_limit: usize,
    extents: ExtentTable,
    hint: IoPriorityHint,
}

impl EngineState {
    /// Fails every queued request, and the current requests' unconsumed
    /// remainder, with [`BlockError::NoSuchDevice`].
    fn fail_queued(&mut self, finished: &mut Vec<Finished>) {
        for priority in [Priority::Foreground, Priority::Background] {
            let queue = self.queues.get_mut(priority);
            let pending = queue.drain_pending();
            let current = queue.take_current();
            for id in pending {
                if let Some(request) = self.requests.get_mut(id) {
                    request.status = Some(BlockError::NoSuchDevice);
                }
                finished.extend(retire(&mut self.requests, id));
            }
            if let Some(cursor) = current
                && let Some(request) = self.requests.get_mut(cursor.id)
            {
                request.status = Some(BlockError::NoSuchDevice);
                request.ref_count -= 1;
                if request.ref_count == 0 {
                    finished.extend(retire(&mut self.requests, cursor.id));
                }
            }
        }
    }
}

/// Marks a request complete and captures what the caller will observe.
fn retire(requests: &mut RequestArena, id: RequestId) -> Option<Finished> {
    let request = requests.get_mut(id)?;
    request.phase = RequestPhase::Completed;
    request.enqueued = false;
    let finished = Finished {
        signal: Arc::clone(&request.signal),
        outcome: request.outcome(),
        operation: debug_io::kind_label(request.params.kind, request.params.is_copy()),
        offset: request.params.offset,
    };
    if request.detached {
        requests.remove(id);
    }
    Some(finished)
}

/// Engine internals shared by [`BlockFile`], its requests and device completers.
pub(crate) struct Shared {
    me: Weak<Shared>,
    state: Mutex<EngineState>,
    device: Arc<dyn BlockDevice>,
    capabilities: DeviceCapabilities,
    geometry: Geometry,
    block_size: usize,
    slow_io_threshold: Duration,
    metrics: Arc<IoMetrics>,
    fault: FaultSwitch,
    completions_tx: Sender<Completion>,
    completions_rx: Receiver<Completion>,
    pumping: AtomicBool,
    pump_requested: AtomicBool,
    jobs: JobPool,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    /// Checks run before a request may enter a queue.
    fn admit(&self, params: &RequestParams, length: u64) -> BlockResult<()> {
        if self.fault.is_tripped() {
            return Err(BlockError::NoSuchDevice);
        }
        if length == 0 {
            return Err(BlockError::InvalidParameter);
        }
        if self.capabilities.read_only && params.modifies_file() {
            return Err(BlockError::AccessDenied);
        }
        validate_alignment(
            self.block_size,
            params.offset,
            params.target_offset,
            &params.buffers,
        )
    }

    pub(crate) fn start_request(&self, id: RequestId) -> BlockResult<()> {
        let admitted = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            let Some(request) = state.requests.get_mut(id) else {
                return Err(BlockError::InvalidParameter);
            };
            if request.phase != RequestPhase::Idle {
                return Err(BlockError::InvalidParameter);
            }
            let operation = debug_io::kind_label(request.params.kind, request.params.is_copy());
            let offset = request.params.offset;
            match self.admit(&request.params, request.length) {
                Ok(()) => {
                    request.ref_count = 0;
                    request.status = None;
                    request.enqueued = true;
                    request.phase = RequestPhase::Queued;
                    let priority = request.params.priority;
                    let length = request.length;
                    state.queues.get_mut(priority).enqueue(id);
                    Ok((operation, priority, offset, length))
                }
                Err(error) => {
                    request.status = Some(error.clone());
                    let finished = retire(&mut state.requests, id);
                    Err((error, finished, operation, offset))
                }
            }
        };

        match admitted {
            Ok((operation, priority, offset, length)) => {
                debug_io::trace_request_start(
                    operation,
                    debug_io::priority_label(priority),
                    offset,
                    length,
                );
                self.pump();
                Ok(())
            }
            Err((error, finished, operation, offset)) => {
                debug_io::trace_request_rejected(operation, offset, &error.to_string());
                self.publish(finished.into_iter().collect());
                Err(error)
            }
        }
    }

    pub(crate) fn cancel_request(&self, id: RequestId) -> bool {
        let cancelled = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            let Some(request) = state.requests.get(id) else {
                return false;
            };
            let offset = request.params.offset;
            // Once a batch holds a reference the request completes normally.
            let untouched = request.enqueued && request.ref_count == 0;
            let priority = request.params.priority;
            if untouched && state.queues.get_mut(priority).remove(id) {
                if let Some(request) = state.requests.get_mut(id) {
                    request.status = Some(BlockError::Cancelled);
                }
                Ok(retire(&mut state.requests, id))
            } else {
                Err(offset)
            }
        };

        match cancelled {
            Ok(finished) => {
                if let Some(done) = &finished {
                    debug_io::trace_request_cancel(done.offset, true);
                }
                self.publish(finished.into_iter().collect());
                true
            }
            Err(offset) => {
                debug_io::trace_request_cancel(offset, false);
                false
            }
        }
    }

    pub(crate) fn cancel_all(&self) -> usize {
        let finished = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            let mut finished = Vec::new();
            for priority in [Priority::Foreground, Priority::Background] {
                for id in state.queues.get_mut(priority).drain_pending() {
                    if let Some(request) = state.requests.get_mut(id) {
                        request.status = Some(BlockError::Cancelled);
                    }
                    finished.extend(retire(&mut state.requests, id));
                }
            }
            finished
        };
        let count = finished.len();
        for done in &finished {
            debug_io::trace_request_cancel(done.offset, true);
        }
        self.publish(finished);
        count
    }

    pub(crate) fn reuse_request(&self, id: RequestId, params: RequestParams) -> BlockResult<()> {
        let mut state = self.lock_state();
        let request = state
            .requests
            .get_mut(id)
            .ok_or(BlockError::InvalidParameter)?;
        let settled = match request.phase {
            RequestPhase::Idle => true,
            // Completed under the lock but not yet published to the caller.
            RequestPhase::Completed => request.signal.outcome().is_some(),
            RequestPhase::Queued | RequestPhase::InFlight => false,
        };
        if !settled {
            return Err(BlockError::InvalidParameter);
        }
        request.reset(params);
        Ok(())
    }

    pub(crate) fn request_status(&self, id: RequestId) -> RequestStatus {
        let state = self.lock_state();
        let Some(request) = state.requests.get(id) else {
            return RequestStatus::NotStarted;
        };
        match request.phase {
            RequestPhase::Idle => RequestStatus::NotStarted,
            RequestPhase::Queued | RequestPhase::InFlight => RequestStatus::Pending,
            RequestPhase::Completed => request
                .signal
                .outcome()
                .map_or(RequestStatus::Pending, RequestStatus::Complete),
        }
    }

    /// Frees the slot of a dropped handle, or defers that until completion.
    pub(crate) fn release_request(&self, id: RequestId) {
        let mut state = self.lock_state();
        let Some(request) = state.requests.get_mut(id) else {
            return;
        };
        match request.phase {
            RequestPhase::Idle | RequestPhase::Completed => {
                state.requests.remove(id);
            }
            RequestPhase::Queued | RequestPhase::InFlight => request.detached = true,
        }
    }

    /// Completes requests to their callers. Must be called without the lock.
    fn publish(&self, finished: Vec<Finished>) {
        for done in finished {
            let failure = done.outcome.as_ref().err().map(ToString::to_string);
            debug_io::trace_request_complete(done.operation, done.offset, failure.as_deref());
            self.metrics.record_request(
                done.outcome.is_ok(),
                done.outcome == Err(BlockError::Cancelled),
            );
            let first = done.signal.complete(done.outcome);
            debug_assert!(first, "request completed twice");
        }
    }

    fn pump(&self) {
        self.pump_requested.store(true, Ordering::SeqCst);
        while self
            .pumping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            while self.pump_requested.swap(false, Ordering::SeqCst)
                || !self.completions_rx.is_empty()
            {
                while let Ok(completion) = self.completions_rx.try_recv() {
                    self.process_completion(completion);
                }
                self.dispatch();
            }
            self.pumping.store(false, Ordering::SeqCst);
            if !self.pump_requested.load(Ordering::SeqCst) && self.completions_rx.is_empty() {
                break;
            }
        }
    }

    /// Fills and submits batches until the pool or the queues run dry.
    fn dispatch(&self) {
        loop {
            let mut finished = Vec::new();
            let next = {
                let mut guard = self.lock_state();
                let state = &mut *guard;
                if self.fault.is_tripped() {
                    state.fail_queued(&mut finished);
                    None
                } else if let Some(index) = state.pool.acquire() {
                    let produced = fill_batch(
                        &self.geometry,
                        &mut state.queues,
                        &mut state.requests,
                        state.pool.get_mut(index),
                        state.in_flight,
                        state.background_limit,
                    );
                    if produced {
                        let priority = state.pool.get(index).priority;
                        state.in_flight.increment(priority);
                        self.metrics
                            .observe_in_flight(state.in_flight.foreground, state.in_flight.background);
                        Some((index, self.advance(state, index, &mut finished)))
                    } else {
                        state.pool.release(index);
                        None
                    }
                } else {
                    None
                }
            };
            self.publish(finished);
            match next {
                Some((index, Some(io))) => self.submit(index, io),
                // The batch finished without reaching the device.
                Some((_, None)) => {}
                None => break,
            }
        }
    }

    /// Handles one device completion.
    fn process_completion(&self, completion: Completion) {
        let index = completion.batch;
        let mut finished = Vec::new();
        let resubmit = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            let batch = state.pool.get_mut(index);

            if let Some(started) = batch.submitted_at.take() {
                let elapsed = started.elapsed();
                if elapsed > self.slow_io_threshold {
                    self.metrics.record_slow_batch();
                    debug_io::trace_slow_batch(
                        index,
                        debug_io::kind_label(batch.phase_kind(), false),
                        batch.phase_offset() + batch.progress,
                        u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    );
                }
            }

            match completion.outcome.status {
                Err(error) => batch.status = Some(error),
                Ok(()) => {
                    let transferred = batch
                        .submitted_len
                        .saturating_sub(completion.outcome.bytes_remaining);
                    match batch.phase_kind() {
                        IoKind::Read => self.metrics.record_read(transferred),
                        IoKind::Write => self.metrics.record_written(transferred),
                    }
                    if transferred == 0 {
                        batch.status = Some(BlockError::ShortTransfer);
                    } else {
                        batch.progress += transferred;
                    }
                }
            }

            let next = self.advance(state, index, &mut finished);
            if self.fault.is_tripped() {
                state.fail_queued(&mut finished);
            }
            next
        };

        if let Some(io) = resubmit {
            self.submit(index, io);
        }
        self.publish(finished);
    }

    /// Prepares the next device submission for a batch, or finishes it.
    ///
    /// A batch needs another submission when its current phase is only
    /// partly transferred (an extent boundary or a short device transfer),
    /// or when the read half of a copy has just finished.
    fn advance(
        &self,
        state: &mut EngineState,
        index: usize,
        finished: &mut Vec<Finished>,
    ) -> Option<DeviceIo> {
        let EngineState {
            pool, extents, hint, ..
        } = &mut *state;
        let batch = pool.get_mut(index);

        if batch.status.is_none()
            && batch.progress >= batch.length
            && batch.is_copy
            && batch.phase == BatchPhase::Primary
        {
            batch.phase = BatchPhase::CopyWrite;
            batch.progress = 0;
        }

        if batch.status.is_none() && batch.progress < batch.length {
            let offset = batch.phase_offset() + batch.progress;
            let remaining = batch.length - batch.progress;
            let mapped = if self.capabilities.extent_mapped {
                extents.find_containing(offset).map(|extent| {
                    (
                        extent.translate(offset),
                        remaining.min(extent.remaining_from(offset)),
                    )
                })
            } else {
                Some((offset, remaining))
            };

            if let Some((device_offset, length)) = mapped {
                let segments = batch.payload.window(batch.progress, length);
                let kind = batch.phase_kind();
                batch.submitted_len = length;
                batch.submitted_at = Some(Instant::now());
                self.metrics.record_submit();
                debug_io::trace_batch_submit(
                    index,
                    debug_io::kind_label(kind, false),
                    device_offset,
                    length,
                    segments.len(),
                );
                return Some(DeviceIo {
                    kind,
                    offset: device_offset,
                    length,
                    segments,
                    priority: batch.priority,
                    hint: *hint,
                });
            }
            debug_io::trace_extent_missing(index, offset);
            batch.status = Some(BlockError::InvalidParameter);
        }

        self.finish_batch(state, index, finished);
        None
    }

    /// Releases a batch's request references and returns it to the pool.
    fn finish_batch(&self, state: &mut EngineState, index: usize, finished: &mut Vec<Finished>) {
        let batch = state.pool.get_mut(index);
        let failure = batch.status.clone();
        let priority = batch.priority;
        let offset = batch.offset;
        let length = batch.length;
        let requests = std::mem::take(&mut batch.requests);

        if let Some(error) = &failure {
            debug_io::trace_batch_failed(index, offset, &error.to_string());
        }
        for &id in &requests {
            let Some(request) = state.requests.get_mut(id) else {
                continue;
            };
            if let Some(error) = &failure {
                request.status = Some(error.clone());
            }
            debug_assert!(request.ref_count > 0);
            request.ref_count -= 1;
            if request.ref_count == 0 {
                finished.extend(retire(&mut state.requests, id));
            }
        }

        debug_io::trace_batch_complete(index, requests.len(), length);
        state.pool.get_mut(index).requests = requests;
        state.pool.release(index);
        state.in_flight.decrement(priority);
        self.metrics.record_batch_done(failure.is_some());
    }

    fn submit(&self, index: usize, io: DeviceIo) {
        let sink: Weak<dyn CompletionSink> = self.me.clone();
        self.device.submit(io, IoCompleter::new(index, sink));
    }

    fn resize(&self, size: u64) -> BlockResult<()> {
        let old = self.device.size()?;
        if !self.capabilities.extent_mapped {
            return Ok(self.device.set_size(size)?);
        }

        if size < old {
            // Unmap first so no new submission can address the truncated tail.
            let saved = {
                let mut state = self.lock_state();
                let saved = state.extents.clone();
                state.extents.remove_from(size);
                saved
            };
            if let Err(error) = self.device.set_size(size) {
                self.lock_state().extents = saved;
                return Err(error.into());
            }
        } else if size > old {
            self.device.set_size(size)?;
            if let Err(error) = self.map_grown(old..size) {
                // The grown region could not be mapped; give it back.
                let _ = self.device.set_size(old);
                return Err(error);
            }
        }
        let extents = self.lock_state().extents.len();
        debug_io::trace_extents_updated(old, size, extents);
        Ok(())
    }

    /// Maps a freshly grown range, committing only if every extent fits.
    fn map_grown(&self, range: Range<u64>) -> BlockResult<()> {
        let grown = self.device.query_extents(range)?;
        let mut state = self.lock_state();
        let mut table = state.extents.clone();
        for extent in grown {
            table.insert(extent)?;
        }
        state.extents = table;
        Ok(())
    }
}

impl CompletionSink for Shared {
    fn deliver(&self, token: usize, outcome: IoOutcome) {
        // The receiver lives in `self`, so the channel cannot be disconnected.
        let _ = self.completions_tx.send(Completion {
            batch: token,
            outcome,
        });
        self.pump();
    }
}

/// An open block file: queues, batches and completions for one device.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use block_io::{BlockFile, EngineConfig, FileDevice, FileDeviceOptions};
/// use block_io::{IoBuffer, IoBuffers, IoKind, Priority};
///
/// let dir = tempfile::tempdir().unwrap();
/// let device = FileDevice::create(dir.path().join("disk.img"), FileDeviceOptions::default())
///     .unwrap();
/// let file = BlockFile::open(Arc::new(device), EngineConfig::default()).unwrap();
///
/// let data = IoBuffer::from_slice(&[7u8; 4096], 4096);
/// let write = file
///     .start_transfer(Priority::Foreground, IoKind::Write, 0, IoBuffers::flat(data))
///     .unwrap();
/// write.wait().unwrap();
/// ```
pub struct BlockFile {
    shared: Arc<Shared>,
}

impl BlockFile {
    /// Opens the engine over `device`.
    ///
    /// Validates `config`, allocates the batch pool, picks the batch kind
    /// from the device's capabilities, builds the extent table for
    /// extent-mapped devices and starts the administrative job pool.
    ///
    /// # Errors
    ///
    /// [`BlockError::InvalidConfig`] for inconsistent geometry,
    /// [`BlockError::InsufficientResources`] if the job pool cannot start,
    /// or the device's error while reading its size or extents.
    pub fn open(device: Arc<dyn BlockDevice>, config: EngineConfig) -> BlockResult<Self> {
        config.validate()?;
        let capabilities = device.capabilities();

        // Scatter/gather is unavailable for sparse or read-only files on the
        // extent-mapped path.
        let extent_restricted =
            capabilities.extent_mapped && (capabilities.sparse || capabilities.read_only);
        let scatter_gather = config.scatter_gather.unwrap_or(true)
            && capabilities.scatter_gather
            && !extent_restricted;
        let batch_kind = if scatter_gather {
            BatchKind::Segmented
        } else {
            BatchKind::Flat
        };

        let mut extents = ExtentTable::new();
        if capabilities.extent_mapped {
            let size = device.size()?;
            if size > 0 {
                for extent in device.query_extents(0..size)? {
                    extents.insert(extent)?;
                }
            }
            debug_io::trace_extents_updated(0, size, extents.len());
        }

        let jobs = JobPool::new(config.admin_threads)?;
        let (completions_tx, completions_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new_cyclic(|me| Shared {
            me: me.clone(),
            state: Mutex::new(EngineState {
                requests: RequestArena::new(),
                queues: Queues::default(),
                pool: BatchPool::new(config.queue_depth),
                in_flight: InFlight::default(),
                background_limit: config.background_limit.max(1),
                extents,
                hint: IoPriorityHint::Normal,
            }),
            device,
            capabilities,
            geometry: Geometry::new(&config, batch_kind),
            block_size: config.block_size,
            slow_io_threshold: config.slow_io_threshold,
            metrics: Arc::clone(&config.metrics),
            fault: config.fault.clone(),
            completions_tx,
            completions_rx,
            pumping: AtomicBool::new(false),
            pump_requested: AtomicBool::new(false),
            jobs,
        });
        Ok(Self { shared })
    }

    fn build(&self, params: RequestParams) -> BlockResult<TransferRequest> {
        let state = RequestState::new(params);
        let signal = Arc::clone(&state.signal);
        let id = self.shared.lock_state().requests.insert(state)?;
        Ok(TransferRequest::new(Arc::clone(&self.shared), id, signal))
    }

    /// Builds an unstarted read or write.
    ///
    /// The length is the total length of `buffers`.
    ///
    /// # Errors
    ///
    /// [`BlockError::InsufficientResources`] if no request slot is available.
    pub fn transfer(
        &self,
        priority: Priority,
        kind: IoKind,
        offset: u64,
        buffers: IoBuffers,
    ) -> BlockResult<TransferRequest> {
        self.build(RequestParams::transfer(priority, kind, offset, buffers))
    }

    /// Builds an unstarted copy of `buffers.total_len()` bytes from
    /// `source_offset` to `target_offset`, staged through `buffers`.
    ///
    /// # Errors
    ///
    /// [`BlockError::InsufficientResources`] if no request slot is available.
    pub fn copy(
        &self,
        priority: Priority,
        source_offset: u64,
        target_offset: u64,
        buffers: IoBuffers,
    ) -> BlockResult<TransferRequest> {
        self.build(RequestParams::copy(
            priority,
            source_offset,
            target_offset,
            buffers,
        ))
    }

    /// Builds and starts a read or write.
    ///
    /// # Errors
    ///
    /// Any error of [`TransferRequest::start`].
    pub fn start_transfer(
        &self,
        priority: Priority,
        kind: IoKind,
        offset: u64,
        buffers: IoBuffers,
    ) -> BlockResult<TransferRequest> {
        let request = self.transfer(priority, kind, offset, buffers)?;
        request.start()?;
        Ok(request)
    }

    /// Builds and starts a copy.
    ///
    /// # Errors
    ///
    /// Any error of [`TransferRequest::start`].
    pub fn start_copy(
        &self,
        priority: Priority,
        source_offset: u64,
        target_offset: u64,
        buffers: IoBuffers,
    ) -> BlockResult<TransferRequest> {
        let request = self.copy(priority, source_offset, target_offset, buffers)?;
        request.start()?;
        Ok(request)
    }

    /// Cancels `request` if it is still untouched in its queue.
    pub fn cancel(&self, request: &TransferRequest) -> bool {
        self.shared.cancel_request(request.id())
    }

    /// Cancels every queued request; returns how many were cancelled.
    ///
    /// Requests already (partly) handed to a batch finish normally.
    pub fn cancel_all(&self) -> usize {
        self.shared.cancel_all()
    }

    /// Caps the number of background batches in flight (minimum 1).
    pub fn set_background_concurrency_limit(&self, limit: usize) {
        self.shared.lock_state().background_limit = limit.max(1);
        self.shared.pump();
    }

    /// Queue, pool and metrics snapshot.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let state = self.shared.lock_state();
        let queued = |queue: &crate::queue::RequestQueue| {
            queue.pending_len() + usize::from(queue.current().is_some())
        };
        EngineStats {
            foreground_queued: queued(&state.queues.foreground),
            background_queued: queued(&state.queues.background),
            foreground_in_flight: state.in_flight.foreground,
            background_in_flight: state.in_flight.background,
            free_batches: state.pool.available(),
            queue_depth: state.pool.capacity(),
            background_limit: state.background_limit,
            batch_kind: self.shared.geometry.batch_kind,
            live_requests: state.requests.live(),
            extents: state.extents.len(),
            metrics: self.shared.metrics.snapshot(),
        }
    }

    /// Capabilities reported by the device at open.
    #[must_use]
    pub fn capabilities(&self) -> DeviceCapabilities {
        self.shared.capabilities
    }

    /// Alignment unit for offsets, lengths and buffers.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.shared.block_size
    }

    /// The injected metrics collector.
    #[must_use]
    pub fn metrics(&self) -> &Arc<IoMetrics> {
        &self.shared.metrics
    }

    /// Logical ranges currently mapped by the extent table.
    #[must_use]
    pub fn mapped_ranges(&self) -> Vec<Range<u64>> {
        self.shared.lock_state().extents.covered_ranges()
    }

    fn admin_guard(&self, modifies: bool) -> BlockResult<()> {
        if self.shared.fault.is_tripped() {
            return Err(BlockError::NoSuchDevice);
        }
        if modifies && self.shared.capabilities.read_only {
            return Err(BlockError::AccessDenied);
        }
        Ok(())
    }

    /// Resizes the file and updates the extent table.
    pub fn set_file_size(&self, size: u64) -> JobHandle<()> {
        if let Err(error) = self.admin_guard(true) {
            return JobHandle::ready(Err(error));
        }
        debug_io::trace_admin_job("set_file_size", size);
        let shared = Arc::clone(&self.shared);
        self.shared.jobs.spawn(move || shared.resize(size))
    }

    /// Reads the device's end of file.
    pub fn query_end_of_file(&self) -> JobHandle<u64> {
        if let Err(error) = self.admin_guard(false) {
            return JobHandle::ready(Err(error));
        }
        debug_io::trace_admin_job("query_end_of_file", 0);
        let device = Arc::clone(&self.shared.device);
        self.shared.jobs.spawn(move || Ok(device.size()?))
    }

    /// Flushes completed writes to durable storage.
    pub fn flush(&self) -> JobHandle<()> {
        if let Err(error) = self.admin_guard(false) {
            return JobHandle::ready(Err(error));
        }
        debug_io::trace_admin_job("flush", 0);
        let device = Arc::clone(&self.shared.device);
        self.shared.jobs.spawn(move || Ok(device.flush()?))
    }

    /// Releases the storage behind `[from, to_plus_one)` of a sparse file.
    pub fn trim(&self, from: u64, to_plus_one: u64) -> JobHandle<()> {
        if let Err(error) = self.admin_guard(true) {
            return JobHandle::ready(Err(error));
        }
        if !self.shared.capabilities.sparse {
            return JobHandle::ready(Err(BlockError::Unsupported));
        }
        if from >= to_plus_one {
            return JobHandle::ready(Err(BlockError::InvalidParameter));
        }
        debug_io::trace_admin_job("trim", from);
        let device = Arc::clone(&self.shared.device);
        self.shared
            .jobs
            .spawn(move || Ok(device.trim(from..to_plus_one)?))
    }

    /// Allocated (non-hole) ranges of a sparse file within `range`.
    pub fn query_allocations(&self, range: Range<u64>) -> JobHandle<Vec<Range<u64>>> {
        if let Err(error) = self.admin_guard(false) {
            return JobHandle::ready(Err(error));
        }
        if !self.shared.capabilities.sparse {
            return JobHandle::ready(Err(BlockError::Unsupported));
        }
        debug_io::trace_admin_job("query_allocations", range.start);
        let device = Arc::clone(&self.shared.device);
        self.shared
            .jobs
            .spawn(move || Ok(device.allocated_ranges(range)?))
    }

    /// Changes the system I/O priority hint carried by later submissions.
    pub fn set_io_priority_hint(&self, hint: IoPriorityHint) -> JobHandle<()> {
        if let Err(error) = self.admin_guard(false) {
            return JobHandle::ready(Err(error));
        }
        debug_io::trace_admin_job("set_io_priority_hint", hint as u64);
        let shared = Arc::clone(&self.shared);
        self.shared.jobs.spawn(move || {
            shared.device.set_priority_hint(hint)?;
            shared.lock_state().hint = hint;
            Ok(())
        })
    }
}

impl fmt::Debug for BlockFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockFile")
            .field("capabilities", &self.shared.capabilities)
            .field("batch_kind", &self.shared.geometry.batch_kind)
            .field("jobs", &self.shared.jobs)
            .finish_non_exhaustive()
    }
}
