//! Integration tests for request validation, completion and cancellation.
//!
//! # Coverage Areas
//!
//! - Misaligned requests are rejected before they reach a queue
//! - Every request completes exactly once, after all of its batches
//! - Cancellation only affects untouched queued requests
//! - `cancel_all` is idempotent
//! - Tripping the fault switch drains queued work

mod integration;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use blockfile::testing::ScriptedDevice;
use blockfile::{
    BlockError, BufferSegment, EngineConfig, FaultSwitch, IoBuffer, IoBuffers, IoKind, Priority,
    RequestStatus, TransferRequest,
};
use integration::helpers::*;
use proptest::prelude::*;

fn count_completions(request: &TransferRequest) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    request.on_complete(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    calls
}

// ============================================================================
// Alignment
// ============================================================================

#[test]
fn misaligned_requests_never_reach_a_queue() {
    let device = Arc::new(ScriptedDevice::held());
    let file = open(&device, small_config());

    let offset = file.start_transfer(Priority::Foreground, IoKind::Write, 100, filled(PAGE, 1));
    assert_eq!(offset.unwrap_err(), BlockError::MisalignedIo);

    let length = file.start_transfer(Priority::Foreground, IoKind::Write, 0, filled(1000, 1));
    assert_eq!(length.unwrap_err(), BlockError::MisalignedIo);

    let backing = IoBuffer::zeroed(2 * PAGE, PAGE);
    let shifted = IoBuffers::Flat(BufferSegment::new(backing, 8, 512));
    let address = file.start_transfer(Priority::Foreground, IoKind::Read, 0, shifted);
    assert_eq!(address.unwrap_err(), BlockError::MisalignedIo);

    let target = file.start_copy(Priority::Background, 0, 4000, filled(PAGE, 0));
    assert_eq!(target.unwrap_err(), BlockError::MisalignedIo);

    let stats = file.stats();
    assert_eq!((stats.foreground_queued, stats.background_queued), (0, 0));
    assert!(device.submissions().is_empty());
    assert_eq!(stats.live_requests, 0);
}

#[test]
fn segmented_buffers_are_checked_segment_by_segment() {
    let device = Arc::new(ScriptedDevice::new());
    let file = open(&device, small_config());
    let good = IoBuffer::zeroed(PAGE, PAGE);
    let odd = IoBuffer::zeroed(PAGE + 512, PAGE);
    let buffers = IoBuffers::Segmented(vec![
        BufferSegment::whole(good),
        BufferSegment::new(odd, 256, 512),
    ]);
    assert_eq!(
        file.start_transfer(Priority::Foreground, IoKind::Write, 0, buffers)
            .unwrap_err(),
        BlockError::MisalignedIo
    );
}

// ============================================================================
// Completion
// ============================================================================

#[test]
fn scattered_buffers_round_trip() {
    let device = Arc::new(ScriptedDevice::new());
    let file = open(&device, small_config());

    let parts = [
        IoBuffer::from_slice(&[1; PAGE], PAGE),
        IoBuffer::from_slice(&[2; PAGE], PAGE),
        IoBuffer::from_slice(&[3; 2 * PAGE], PAGE),
    ];
    file.start_transfer(
        Priority::Foreground,
        IoKind::Write,
        8192,
        IoBuffers::segmented(parts.iter().cloned()),
    )
    .unwrap()
    .wait()
    .unwrap();

    let (buffers, out) = sink(4 * PAGE);
    file.start_transfer(Priority::Foreground, IoKind::Read, 8192, buffers)
        .unwrap()
        .wait()
        .unwrap();
    let bytes = out.to_vec();
    assert!(bytes[..PAGE].iter().all(|&b| b == 1));
    assert!(bytes[PAGE..2 * PAGE].iter().all(|&b| b == 2));
    assert!(bytes[2 * PAGE..].iter().all(|&b| b == 3));
}

#[test]
fn request_spanning_batches_completes_after_the_last_one() {
    let device = Arc::new(ScriptedDevice::held());
    let file = open(&device, small_config());

    let request = file
        .start_transfer(Priority::Foreground, IoKind::Write, 0, filled(192 * 1024, 4))
        .unwrap();
    let calls = count_completions(&request);
    assert_eq!(device.pending(), 3);

    assert!(device.complete_next());
    assert!(device.complete_next());
    assert_eq!(request.status(), RequestStatus::Pending);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    assert!(device.complete_next());
    assert_eq!(request.wait(), Ok(()));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn callback_registered_late_runs_immediately() {
    let device = Arc::new(ScriptedDevice::new());
    let file = open(&device, small_config());
    let request = file
        .start_transfer(Priority::Foreground, IoKind::Write, 0, filled(PAGE, 1))
        .unwrap();
    request.wait().unwrap();
    assert_eq!(count_completions(&request).load(Ordering::SeqCst), 1);
}

#[test]
fn callback_may_start_another_request() {
    let device = Arc::new(ScriptedDevice::new());
    let file = Arc::new(open(&device, small_config()));
    let follow_up = file
        .transfer(Priority::Foreground, IoKind::Write, 65536, filled(PAGE, 8))
        .unwrap();
    let follow_up = Arc::new(follow_up);

    let first = file
        .transfer(Priority::Foreground, IoKind::Write, 0, filled(PAGE, 1))
        .unwrap();
    let chained = Arc::clone(&follow_up);
    first.on_complete(move |result| {
        assert_eq!(result, Ok(()));
        chained.start().unwrap();
    });
    first.start().unwrap();

    first.wait().unwrap();
    follow_up.wait().unwrap();
    assert_eq!(device.read_back(65536, PAGE), vec![8; PAGE]);
}

#[test]
fn reused_request_runs_again() {
    let device = Arc::new(ScriptedDevice::new());
    let file = open(&device, small_config());
    let request = file
        .start_copy(Priority::Background, 0, 8192, filled(PAGE, 0))
        .unwrap();
    request.wait().unwrap();

    request
        .reuse_for_copy(Priority::Foreground, 8192, 16384, filled(PAGE, 0))
        .unwrap();
    assert_eq!(request.status(), RequestStatus::NotStarted);
    request.start().unwrap();
    assert_eq!(request.wait(), Ok(()));
    assert_eq!(device.submissions().len(), 4);
}

#[test]
fn pending_request_cannot_be_reused() {
    let device = Arc::new(ScriptedDevice::held());
    let file = open(&device, small_config());
    let request = file
        .start_transfer(Priority::Foreground, IoKind::Write, 0, filled(PAGE, 1))
        .unwrap();
    assert_eq!(
        request.reuse_for_transfer(Priority::Foreground, IoKind::Read, 0, filled(PAGE, 0)),
        Err(BlockError::InvalidParameter)
    );
    device.complete_all();
    request.wait().unwrap();
}

// ============================================================================
// Cancellation
// ============================================================================

#[test]
fn cancel_only_affects_untouched_requests() {
    let device = Arc::new(ScriptedDevice::held());
    let file = open(&device, small_config().with_queue_depth(1));

    let in_flight = file
        .start_transfer(Priority::Foreground, IoKind::Write, 0, filled(PAGE, 1))
        .unwrap();
    let queued = file
        .start_transfer(Priority::Foreground, IoKind::Write, 65536, filled(PAGE, 2))
        .unwrap();
    let calls = count_completions(&queued);

    assert!(!file.cancel(&in_flight));
    assert!(queued.cancel());
    assert!(!queued.cancel());
    assert_eq!(queued.wait(), Err(BlockError::Cancelled));
    assert_eq!(queued.status(), RequestStatus::Complete(Err(BlockError::Cancelled)));

    let later = file
        .start_transfer(Priority::Foreground, IoKind::Write, 131072, filled(PAGE, 3))
        .unwrap();
    assert!(device.complete_next());
    // Now in a batch: cancelling is a no-op.
    assert!(!later.cancel());
    device.complete_all();

    assert_eq!(in_flight.wait(), Ok(()));
    assert_eq!(later.wait(), Ok(()));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(device.read_back(65536, PAGE), vec![0; PAGE]);
    assert_eq!(file.stats().metrics.requests_cancelled, 1);
}

#[test]
fn cancel_all_is_idempotent() {
    let device = Arc::new(ScriptedDevice::held());
    let file = open(&device, small_config().with_queue_depth(1));
    assert_eq!(file.cancel_all(), 0);

    let running = file
        .start_transfer(Priority::Foreground, IoKind::Write, 0, filled(PAGE, 1))
        .unwrap();
    let queued: Vec<_> = (1..4u64)
        .map(|i| {
            let priority = if i % 2 == 0 {
                Priority::Background
            } else {
                Priority::Foreground
            };
            file.start_transfer(priority, IoKind::Write, i * 65536, filled(PAGE, 2))
                .unwrap()
        })
        .collect();
    let counters: Vec<_> = queued.iter().map(count_completions).collect();

    assert_eq!(file.cancel_all(), 3);
    assert_eq!(file.cancel_all(), 0);
    for request in &queued {
        assert_eq!(request.wait(), Err(BlockError::Cancelled));
    }
    assert!(counters.iter().all(|c| c.load(Ordering::SeqCst) == 1));

    assert_eq!(device.complete_all(), 1);
    assert_eq!(running.wait(), Ok(()));
}

#[test]
fn dropping_pending_handles_does_not_cancel() {
    let device = Arc::new(ScriptedDevice::held());
    let file = open(&device, small_config());
    for i in 0..4u64 {
        let request = file
            .start_transfer(Priority::Foreground, IoKind::Write, i * 65536, filled(PAGE, 6))
            .unwrap();
        drop(request);
    }
    assert_eq!(file.stats().live_requests, 4);
    assert_eq!(device.complete_all(), 4);
    assert_eq!(file.stats().live_requests, 0);
    assert_eq!(device.read_back(3 * 65536, PAGE), vec![6; PAGE]);
}

// ============================================================================
// Fault switch
// ============================================================================

#[test]
fn tripped_fault_switch_drains_queued_work() {
    let fault = FaultSwitch::new();
    let device = Arc::new(ScriptedDevice::held());
    let file = open(
        &device,
        small_config()
            .with_queue_depth(1)
            .with_fault_switch(fault.clone()),
    );

    let running = file
        .start_transfer(Priority::Foreground, IoKind::Write, 0, filled(PAGE, 1))
        .unwrap();
    let waiting = file
        .start_transfer(Priority::Background, IoKind::Write, 65536, filled(PAGE, 1))
        .unwrap();

    fault.trip();
    assert!(device.complete_next());
    assert_eq!(running.wait(), Ok(()));
    assert_eq!(waiting.wait(), Err(BlockError::NoSuchDevice));
    assert_eq!(device.pending(), 0);

    assert_eq!(
        file.start_transfer(Priority::Foreground, IoKind::Read, 0, filled(PAGE, 0))
            .unwrap_err(),
        BlockError::NoSuchDevice
    );

    fault.reset();
    file.start_transfer(Priority::Foreground, IoKind::Read, 0, filled(PAGE, 0))
        .unwrap();
    assert_eq!(device.complete_all(), 1);
}

#[test]
fn metrics_are_shared_through_the_config() {
    let metrics = Arc::new(blockfile::IoMetrics::new());
    let device = Arc::new(ScriptedDevice::new());
    let file = open(
        &device,
        EngineConfig::default().with_metrics(Arc::clone(&metrics)),
    );
    file.start_transfer(Priority::Foreground, IoKind::Write, 0, filled(2 * PAGE, 1))
        .unwrap()
        .wait()
        .unwrap();
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.bytes_sent, 8192);
    assert_eq!(snapshot.batches_completed, 1);
    assert_eq!(snapshot.requests_completed, 1);
}

// ============================================================================
// Reference-count soundness
// ============================================================================

#[derive(Debug, Clone)]
struct Step {
    pages: u64,
    kind: IoKind,
    priority: Priority,
    complete_after: usize,
}

fn step() -> impl Strategy<Value = Step> {
    (
        1u64..=4,
        prop_oneof![Just(IoKind::Read), Just(IoKind::Write)],
        prop_oneof![Just(Priority::Foreground), Just(Priority::Background)],
        0usize..3,
    )
        .prop_map(|(pages, kind, priority, complete_after)| Step {
            pages,
            kind,
            priority,
            complete_after,
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn every_request_completes_exactly_once(steps in proptest::collection::vec(step(), 1..24)) {
        let device = Arc::new(ScriptedDevice::held());
        // Two-page batches force requests of three or four pages to split.
        let file = open(
            &device,
            EngineConfig::default()
                .with_max_batch_size(2 * PAGE)
                .with_queue_depth(2),
        );

        let mut started = Vec::new();
        for (index, step) in steps.iter().enumerate() {
            // Every request owns a four-page slot so neighbours may merge but never overlap.
            let offset = index as u64 * 4 * PAGE as u64;
            let len = step.pages as usize * PAGE;
            let tag = index as u8 + 1;
            let (buffers, buffer) = if step.kind == IoKind::Write {
                let buffer = IoBuffer::from_slice(&vec![tag; len], PAGE);
                (IoBuffers::flat(Arc::clone(&buffer)), buffer)
            } else {
                device.seed(offset, &vec![tag; len]);
                sink(len)
            };
            let request = file
                .start_transfer(step.priority, step.kind, offset, buffers)
                .unwrap();
            let calls = count_completions(&request);
            started.push((request, calls, buffer, offset, len, tag, step.kind));
            for _ in 0..step.complete_after {
                device.complete_next();
            }
        }
        device.complete_all();

        for (request, calls, buffer, offset, len, tag, kind) in &started {
            prop_assert_eq!(request.wait(), Ok(()));
            prop_assert_eq!(calls.load(Ordering::SeqCst), 1);
            let bytes = if *kind == IoKind::Write {
                device.read_back(*offset, *len)
            } else {
                buffer.to_vec()
            };
            prop_assert!(bytes.iter().all(|b| b == tag));
        }
        let stats = file.stats();
        prop_assert_eq!(stats.free_batches, stats.queue_depth);
        prop_assert_eq!(stats.foreground_in_flight + stats.background_in_flight, 0);
        prop_assert_eq!(stats.foreground_queued + stats.background_queued, 0);
    }
}
