//! Administrative job and extent-table tracing (Level 3).

#[cfg(feature = "tracing")]
use tracing::{debug, error};

/// Trace an administrative job being scheduled.
#[cfg(feature = "tracing")]
#[inline]
pub fn trace_admin_job(job: &str, argument: u64) {
    debug!(
        target: "blockio::io",
        operation = job,
        argument = argument,
        "[IO3] {} ({})",
        job,
        argument
    );
}

/// Trace an administrative job - no-op when tracing is disabled.
#[cfg(not(feature = "tracing"))]
#[inline]
pub fn trace_admin_job(_job: &str, _argument: u64) {}

/// Trace the extent table after a size change.
#[cfg(feature = "tracing")]
#[inline]
pub fn trace_extents_updated(old_size: u64, new_size: u64, extents: usize) {
    debug!(
        target: "blockio::io",
        operation = "extents",
        old_size = old_size,
        new_size = new_size,
        extents = extents,
        "[IO3] extent table {} -> {} bytes ({} extents)",
        old_size,
        new_size,
        extents
    );
}

/// Trace the extent table after a size change - no-op when tracing is disabled.
#[cfg(not(feature = "tracing"))]
#[inline]
pub fn trace_extents_updated(_old_size: u64, _new_size: u64, _extents: usize) {}

/// Trace a submission whose offset has no extent; the table and the file's
/// allocation have diverged.
#[cfg(feature = "tracing")]
#[inline]
pub fn trace_extent_missing(batch: usize, offset: u64) {
    error!(
        target: "blockio::io",
        batch = batch,
        offset = offset,
        "[IO3] no extent maps offset {} (batch {})",
        offset,
        batch
    );
}

/// Trace a missing extent - no-op when tracing is disabled.
#[cfg(not(feature = "tracing"))]
#[inline]
pub fn trace_extent_missing(_batch: usize, _offset: u64) {}
