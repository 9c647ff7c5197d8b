//! Transfer requests: the caller-facing handle and the engine-side arena.
//!
//! Request state lives in a [`RequestArena`] inside the engine lock. The
//! caller holds a [`TransferRequest`], which names its slot by a generational
//! [`RequestId`] and shares a [`CompletionSignal`] with the engine.
//!
//! # Reference counting
//!
//! A slot's `ref_count` is the number of in-flight batches that reference the
//! request, plus one while the request is the "current" (partially consumed)
//! request of its queue. It is zero while the request waits in a queue and
//! when every batch has finished with it; the request completes when the
//! count falls back to zero after dispatch.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::buffer::IoBuffers;
use crate::engine::Shared;
use crate::error::{BlockError, BlockResult};

/// Scheduling class of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    /// Serviced ahead of background work.
    Foreground,
    /// Serviced only when no foreground work is pending or in flight.
    Background,
}

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoKind {
    /// Device to memory.
    Read,
    /// Memory to device.
    Write,
}

/// Observable state of a [`TransferRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStatus {
    /// Built or reused but not started.
    NotStarted,
    /// Queued or in flight.
    Pending,
    /// Finished with the given outcome.
    Complete(BlockResult<()>),
}

/// Generational index of a request slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RequestId {
    index: u32,
    generation: u32,
}

impl RequestId {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

/// What a request does, as supplied by the caller.
#[derive(Debug, Clone)]
pub(crate) struct RequestParams {
    pub(crate) priority: Priority,
    pub(crate) kind: IoKind,
    pub(crate) offset: u64,
    pub(crate) target_offset: Option<u64>,
    pub(crate) buffers: IoBuffers,
}

impl RequestParams {
    pub(crate) fn transfer(priority: Priority, kind: IoKind, offset: u64, buffers: IoBuffers) -> Self {
        Self {
            priority,
            kind,
            offset,
            target_offset: None,
            buffers,
        }
    }

    /// A copy reads at `source` first, then writes the same bytes at `target`.
    pub(crate) fn copy(priority: Priority, source: u64, target: u64, buffers: IoBuffers) -> Self {
        Self {
            priority,
            kind: IoKind::Read,
            offset: source,
            target_offset: Some(target),
            buffers,
        }
    }

    pub(crate) const fn is_copy(&self) -> bool {
        self.target_offset.is_some()
    }

    pub(crate) fn modifies_file(&self) -> bool {
        self.is_copy() || self.kind == IoKind::Write
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestPhase {
    Idle,
    Queued,
    InFlight,
    Completed,
}

/// Engine-side state of one request.
#[derive(Debug)]
pub(crate) struct RequestState {
    pub(crate) params: RequestParams,
    pub(crate) length: u64,
    pub(crate) ref_count: u32,
    pub(crate) status: Option<BlockError>,
    pub(crate) enqueued: bool,
    pub(crate) phase: RequestPhase,
    /// The caller dropped its handle; free the slot on completion.
    pub(crate) detached: bool,
    pub(crate) signal: Arc<CompletionSignal>,
}

impl RequestState {
    pub(crate) fn new(params: RequestParams) -> Self {
        let length = params.buffers.total_len();
        Self {
            params,
            length,
            ref_count: 0,
            status: None,
            enqueued: false,
            phase: RequestPhase::Idle,
            detached: false,
            signal: Arc::new(CompletionSignal::new()),
        }
    }

    /// Replaces the operation and clears every transient field.
    pub(crate) fn reset(&mut self, params: RequestParams) {
        self.length = params.buffers.total_len();
        self.params = params;
        self.ref_count = 0;
        self.status = None;
        self.enqueued = false;
        self.phase = RequestPhase::Idle;
        self.signal.reset();
    }

    /// Outcome reported to the caller.
    pub(crate) fn outcome(&self) -> BlockResult<()> {
        self.status.clone().map_or(Ok(()), Err)
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    state: Option<RequestState>,
}

/// Slot storage for requests, addressed by [`RequestId`].
#[derive(Debug, Default)]
pub(crate) struct RequestArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl RequestArena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, state: RequestState) -> BlockResult<RequestId> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.state = Some(state);
            return Ok(RequestId::new(index, slot.generation));
        }
        let index = u32::try_from(self.slots.len()).map_err(|_| BlockError::InsufficientResources)?;
        self.slots.push(Slot {
            generation: 0,
            state: Some(state),
        });
        Ok(RequestId::new(index, 0))
    }

    pub(crate) fn get(&self, id: RequestId) -> Option<&RequestState> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.state.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: RequestId) -> Option<&mut RequestState> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.state.as_mut())
    }

    pub(crate) fn remove(&mut self, id: RequestId) -> Option<RequestState> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)?;
        let state = slot.state.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(state)
    }

    /// Number of occupied slots.
    pub(crate) fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

type Callback = Box<dyn FnOnce(BlockResult<()>) + Send>;

#[derive(Default)]
struct SignalState {
    outcome: Option<BlockResult<()>>,
    callback: Option<Callback>,
}

/// One-shot completion latch shared by the engine and the caller.
#[derive(Default)]
pub(crate) struct CompletionSignal {
    state: Mutex<SignalState>,
    ready: Condvar,
}

impl CompletionSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Publishes the outcome and runs the callback, if any.
    ///
    /// Returns `false` if an outcome was already published.
    pub(crate) fn complete(&self, result: BlockResult<()>) -> bool {
        let callback = {
            let mut state = self.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(result.clone());
            state.callback.take()
        };
        self.ready.notify_all();
        if let Some(callback) = callback {
            callback(result);
        }
        true
    }

    pub(crate) fn reset(&self) {
        self.lock().outcome = None;
    }

    pub(crate) fn outcome(&self) -> Option<BlockResult<()>> {
        self.lock().outcome.clone()
    }

    pub(crate) fn wait(&self) -> BlockResult<()> {
        let mut state = self.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(|poison| poison.into_inner());
        }
    }

    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Option<BlockResult<()>> {
        let state = self.lock();
        let (state, _) = self
            .ready
            .wait_timeout_while(state, timeout, |state| state.outcome.is_none())
            .unwrap_or_else(|poison| poison.into_inner());
        state.outcome.clone()
    }

    /// Registers `callback`, or runs it now if the outcome is already known.
    pub(crate) fn set_callback(&self, callback: Callback) {
        let known = {
            let mut state = self.lock();
            if state.outcome.is_none() {
                state.callback = Some(callback);
                return;
            }
            state.outcome.clone()
        };
        if let Some(outcome) = known {
            callback(outcome);
        }
    }

    fn lock(&self) -> MutexGuard<'_, SignalState> {
        self.state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

impl fmt::Debug for CompletionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("CompletionSignal")
            .field("outcome", &state.outcome)
            .field("has_callback", &state.callback.is_some())
            .finish()
    }
}

/// Handle to one read, write or copy against a [`BlockFile`](crate::BlockFile).
///
/// Built by [`BlockFile::transfer`](crate::BlockFile::transfer) or
/// [`BlockFile::copy`](crate::BlockFile::copy). Dropping a pending handle does
/// not cancel the I/O; the engine keeps the request until its batches finish.
pub struct TransferRequest {
    shared: Arc<Shared>,
    id: RequestId,
    signal: Arc<CompletionSignal>,
}

impl TransferRequest {
    pub(crate) fn new(shared: Arc<Shared>, id: RequestId, signal: Arc<CompletionSignal>) -> Self {
        Self { shared, id, signal }
    }

    pub(crate) fn id(&self) -> RequestId {
        self.id
    }

    /// Validates the request and queues it for dispatch.
    ///
    /// Validation failures are returned here and are also published as the
    /// request's outcome, so [`wait`](Self::wait) observes them too.
    ///
    /// # Errors
    ///
    /// [`BlockError::MisalignedIo`], [`BlockError::AccessDenied`],
    /// [`BlockError::InvalidParameter`] (zero length, or already started) or
    /// [`BlockError::NoSuchDevice`] when the fault switch is tripped.
    pub fn start(&self) -> BlockResult<()> {
        self.shared.start_request(self.id)
    }

    /// Cancels the request if no batch has taken any of it yet.
    ///
    /// Returns `true` if the request was removed from its queue and completed
    /// with [`BlockError::Cancelled`]; otherwise this is a no-op.
    pub fn cancel(&self) -> bool {
        self.shared.cancel_request(self.id)
    }

    /// Blocks until the request completes.
    ///
    /// # Errors
    ///
    /// Returns the request's failure, or [`BlockError::InvalidParameter`] if
    /// the request was never started.
    pub fn wait(&self) -> BlockResult<()> {
        if self.status() == RequestStatus::NotStarted {
            return Err(BlockError::InvalidParameter);
        }
        self.signal.wait()
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> Option<BlockResult<()>> {
        self.signal.wait_timeout(timeout)
    }

    /// Current state of the request.
    #[must_use]
    pub fn status(&self) -> RequestStatus {
        self.shared.request_status(self.id)
    }

    /// Returns `true` once the outcome is published.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.signal.outcome().is_some()
    }

    /// Registers a callback run exactly once with the outcome.
    ///
    /// The callback runs on the thread that completes the request, outside
    /// the engine lock; it must not block on other requests of the same file.
    /// If the request already completed, the callback runs immediately.
    pub fn on_complete(&self, callback: impl FnOnce(BlockResult<()>) + Send + 'static) {
        self.signal.set_callback(Box::new(callback));
    }

    /// Rearms a finished (or unstarted) request as a plain transfer.
    ///
    /// # Errors
    ///
    /// [`BlockError::InvalidParameter`] while the request is pending.
    pub fn reuse_for_transfer(
        &self,
        priority: Priority,
        kind: IoKind,
        offset: u64,
        buffers: IoBuffers,
    ) -> BlockResult<()> {
        self.shared.reuse_request(
            self.id,
            RequestParams::transfer(priority, kind, offset, buffers),
        )
    }

    /// Rearms a finished (or unstarted) request as a copy.
    ///
    /// # Errors
    ///
    /// [`BlockError::InvalidParameter`] while the request is pending.
    pub fn reuse_for_copy(
        &self,
        priority: Priority,
        source_offset: u64,
        target_offset: u64,
        buffers: IoBuffers,
    ) -> BlockResult<()> {
        self.shared.reuse_request(
            self.id,
            RequestParams::copy(priority, source_offset, target_offset, buffers),
        )
    }
}

impl fmt::Debug for TransferRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferRequest")
            .field("id", &self.id)
            .field("signal", &self.signal)
            .finish_non_exhaustive()
    }
}

impl Drop for TransferRequest {
    fn drop(&mut self) {
        self.shared.release_request(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::IoBuffer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn params(len: usize) -> RequestParams {
        RequestParams::transfer(
            Priority::Foreground,
            IoKind::Write,
            0,
            IoBuffers::flat(IoBuffer::zeroed(len, 512)),
        )
    }

    #[test]
    fn arena_reuses_slots_with_new_generation() {
        let mut arena = RequestArena::new();
        let first = arena.insert(RequestState::new(params(512))).unwrap();
        assert_eq!(arena.live(), 1);
        assert!(arena.remove(first).is_some());
        assert_eq!(arena.live(), 0);

        let second = arena.insert(RequestState::new(params(1024))).unwrap();
        assert_ne!(first, second);
        assert!(arena.get(first).is_none());
        assert_eq!(arena.get(second).map(|s| s.length), Some(1024));
        assert!(arena.remove(first).is_none());
    }

    #[test]
    fn copy_params_start_with_read() {
        let p = RequestParams::copy(
            Priority::Background,
            0,
            4096,
            IoBuffers::flat(IoBuffer::zeroed(512, 512)),
        );
        assert!(p.is_copy());
        assert_eq!(p.kind, IoKind::Read);
        assert!(p.modifies_file());
        assert!(!params(512).is_copy());
    }

    #[test]
    fn reset_clears_transient_state() {
        let mut state = RequestState::new(params(512));
        state.ref_count = 2;
        state.status = Some(BlockError::Cancelled);
        state.phase = RequestPhase::Completed;
        state.signal.complete(Err(BlockError::Cancelled));

        state.reset(params(2048));
        assert_eq!(state.length, 2048);
        assert_eq!(state.ref_count, 0);
        assert_eq!(state.phase, RequestPhase::Idle);
        assert!(state.signal.outcome().is_none());
        assert_eq!(state.outcome(), Ok(()));
    }

    #[test]
    fn signal_completes_once() {
        let signal = CompletionSignal::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        signal.set_callback(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(signal.complete(Ok(())));
        assert!(!signal.complete(Err(BlockError::Cancelled)));
        assert_eq!(signal.wait(), Ok(()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_callback_runs_immediately() {
        let signal = CompletionSignal::new();
        signal.complete(Err(BlockError::NoSuchDevice));
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        signal.set_callback(Box::new(move |outcome| {
            *slot.lock().unwrap() = Some(outcome);
        }));
        assert_eq!(*seen.lock().unwrap(), Some(Err(BlockError::NoSuchDevice)));
    }

    #[test]
    fn wait_timeout_expires_without_outcome() {
        let signal = CompletionSignal::new();
        assert!(signal.wait_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn wait_wakes_on_other_thread() {
        let signal = Arc::new(CompletionSignal::new());
        let remote = Arc::clone(&signal);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.complete(Ok(()));
        });
        assert_eq!(signal.wait(), Ok(()));
        handle.join().unwrap();
    }
}
