//! Batch submission and completion tracing (Level 2).

#[cfg(feature = "tracing")]
use tracing::{trace, warn};

/// Trace a device submission.
///
/// # Arguments
///
/// * `batch` - Pool index of the batch
/// * `operation` - Device operation of the current phase
/// * `offset` - Device offset (physical for extent-mapped devices)
/// * `length` - Bytes submitted
/// * `segments` - Memory windows in the submission
#[cfg(feature = "tracing")]
#[inline]
pub fn trace_batch_submit(batch: usize, operation: &str, offset: u64, length: u64, segments: usize) {
    trace!(
        target: "blockio::io",
        batch = batch,
        operation = operation,
        offset = offset,
        length = length,
        segments = segments,
        "[IO2] submit batch {} {} {} bytes at {} ({} segments)",
        batch,
        operation,
        length,
        offset,
        segments
    );
}

/// Trace a device submission - no-op when tracing is disabled.
#[cfg(not(feature = "tracing"))]
#[inline]
pub fn trace_batch_submit(
    _batch: usize,
    _operation: &str,
    _offset: u64,
    _length: u64,
    _segments: usize,
) {
}

/// Trace a batch returning to the pool.
#[cfg(feature = "tracing")]
#[inline]
pub fn trace_batch_complete(batch: usize, requests: usize, length: u64) {
    trace!(
        target: "blockio::io",
        batch = batch,
        requests = requests,
        length = length,
        "[IO2] batch {} done ({} bytes, {} requests)",
        batch,
        length,
        requests
    );
}

/// Trace a batch returning to the pool - no-op when tracing is disabled.
#[cfg(not(feature = "tracing"))]
#[inline]
pub fn trace_batch_complete(_batch: usize, _requests: usize, _length: u64) {}

/// Trace a device round trip slower than the configured threshold.
#[cfg(feature = "tracing")]
#[inline]
pub fn trace_slow_batch(batch: usize, operation: &str, offset: u64, elapsed_ms: u64) {
    warn!(
        target: "blockio::io",
        batch = batch,
        operation = operation,
        offset = offset,
        elapsed_ms = elapsed_ms,
        "[IO2] slow {} at {} took {} ms",
        operation,
        offset,
        elapsed_ms
    );
}

/// Trace a slow device round trip - no-op when tracing is disabled.
#[cfg(not(feature = "tracing"))]
#[inline]
pub fn trace_slow_batch(_batch: usize, _operation: &str, _offset: u64, _elapsed_ms: u64) {}

/// Trace a batch failing; the error is recorded on every constituent request.
#[cfg(feature = "tracing")]
#[inline]
pub fn trace_batch_failed(batch: usize, offset: u64, reason: &str) {
    warn!(
        target: "blockio::io",
        batch = batch,
        offset = offset,
        error = reason,
        "[IO2] batch {} at {} failed: {}",
        batch,
        offset,
        reason
    );
}

/// Trace a batch failing - no-op when tracing is disabled.
#[cfg(not(feature = "tracing"))]
#[inline]
pub fn trace_batch_failed(_batch: usize, _offset: u64, _reason: &str) {}
