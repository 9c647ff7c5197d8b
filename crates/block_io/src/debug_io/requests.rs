//! Request lifecycle tracing (Level 1).

#[cfg(feature = "tracing")]
use tracing::debug;

/// Trace a request entering its queue.
#[cfg(feature = "tracing")]
#[inline]
pub fn trace_request_start(operation: &str, priority: &str, offset: u64, length: u64) {
    debug!(
        target: "blockio::io",
        operation = operation,
        priority = priority,
        offset = offset,
        length = length,
        "[IO1] start {} {} bytes at {} ({})",
        operation,
        length,
        offset,
        priority
    );
}

/// Trace a request entering its queue - no-op when tracing is disabled.
#[cfg(not(feature = "tracing"))]
#[inline]
pub fn trace_request_start(_operation: &str, _priority: &str, _offset: u64, _length: u64) {}

/// Trace a request refused before it was queued.
#[cfg(feature = "tracing")]
#[inline]
pub fn trace_request_rejected(operation: &str, offset: u64, reason: &str) {
    debug!(
        target: "blockio::io",
        operation = operation,
        offset = offset,
        reason = reason,
        "[IO1] reject {} at {}: {}",
        operation,
        offset,
        reason
    );
}

/// Trace a request refused before it was queued - no-op when tracing is disabled.
#[cfg(not(feature = "tracing"))]
#[inline]
pub fn trace_request_rejected(_operation: &str, _offset: u64, _reason: &str) {}

/// Trace a cancellation attempt.
#[cfg(feature = "tracing")]
#[inline]
pub fn trace_request_cancel(offset: u64, removed: bool) {
    debug!(
        target: "blockio::io",
        operation = "cancel",
        offset = offset,
        removed = removed,
        "[IO1] cancel request at {} ({})",
        offset,
        if removed { "removed" } else { "already dispatched" }
    );
}

/// Trace a cancellation attempt - no-op when tracing is disabled.
#[cfg(not(feature = "tracing"))]
#[inline]
pub fn trace_request_cancel(_offset: u64, _removed: bool) {}

/// Trace a request completing back to its caller.
///
/// # Arguments
///
/// * `operation` - "read", "write" or "copy"
/// * `offset` - Source offset of the request
/// * `failure` - Rendered error, or `None` on success
#[cfg(feature = "tracing")]
#[inline]
pub fn trace_request_complete(operation: &str, offset: u64, failure: Option<&str>) {
    match failure {
        Some(reason) => debug!(
            target: "blockio::io",
            operation = operation,
            offset = offset,
            error = reason,
            "[IO1] {} at {} failed: {}",
            operation,
            offset,
            reason
        ),
        None => debug!(
            target: "blockio::io",
            operation = operation,
            offset = offset,
            "[IO1] {} at {} complete",
            operation,
            offset
        ),
    }
}

/// Trace a request completing back to its caller - no-op when tracing is disabled.
#[cfg(not(feature = "tracing"))]
#[inline]
pub fn trace_request_complete(_operation: &str, _offset: u64, _failure: Option<&str>) {}
