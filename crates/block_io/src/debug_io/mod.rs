//! Structured tracing hooks for the block I/O engine.
//!
//! Every hook logs to the `blockio::io` target and compiles to an empty inline
//! function when the `tracing` feature is disabled, so call sites never need
//! their own `cfg` guards.
//!
//! | Level | Module | Events |
//! |---|---|---|
//! | 1 | [`requests`] | request start, rejection, cancellation, completion |
//! | 2 | [`batches`] | batch submission, continuation, completion, slow and failed batches |
//! | 3 | [`admin`] | administrative jobs and extent-table maintenance |

pub mod admin;
pub mod batches;
pub mod requests;

pub use admin::{trace_admin_job, trace_extent_missing, trace_extents_updated};
pub use batches::{
    trace_batch_complete, trace_batch_failed, trace_batch_submit, trace_slow_batch,
};
pub use requests::{
    trace_request_cancel, trace_request_complete, trace_request_rejected, trace_request_start,
};

use crate::request::{IoKind, Priority};

/// Label for a transfer direction.
#[must_use]
pub const fn kind_label(kind: IoKind, is_copy: bool) -> &'static str {
    match (kind, is_copy) {
        (_, true) => "copy",
        (IoKind::Read, false) => "read",
        (IoKind::Write, false) => "write",
    }
}

/// Label for a priority class.
#[must_use]
pub const fn priority_label(priority: Priority) -> &'static str {
    match priority {
        Priority::Foreground => "foreground",
        Priority::Background => "background",
    }
}
