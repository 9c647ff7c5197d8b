//! Block-alignment checks applied before a request is queued.

use crate::buffer::IoBuffers;
use crate::error::{BlockError, BlockResult};

/// Checks that a request can be serviced by a device with `block_size` granularity.
///
/// The source offset, the copy target (if any), the total length and every
/// buffer segment's address and size must all be multiples of `block_size`.
pub fn validate_alignment(
    block_size: usize,
    offset: u64,
    target_offset: Option<u64>,
    buffers: &IoBuffers,
) -> BlockResult<()> {
    let block = block_size as u64;
    if !offset.is_multiple_of(block) {
        return Err(BlockError::MisalignedIo);
    }
    if let Some(target) = target_offset
        && !target.is_multiple_of(block)
    {
        return Err(BlockError::MisalignedIo);
    }
    if !buffers.total_len().is_multiple_of(block) {
        return Err(BlockError::MisalignedIo);
    }
    let segments_aligned = buffers.segments().iter().all(|segment| {
        segment.address().is_multiple_of(block_size) && segment.len().is_multiple_of(block_size)
    });
    if !segments_aligned {
        return Err(BlockError::MisalignedIo);
    }
    Ok(())
}

/// Returns `true` when a memory window starting at `address` with `len` bytes
/// lies on `unit` boundaries.
pub(crate) fn is_window_aligned(address: usize, len: u64, unit: usize) -> bool {
    address.is_multiple_of(unit) && len.is_multiple_of(unit as u64)
}
