//! Engine configuration, geometry constants and queue-depth resolution.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{BlockError, BlockResult};
use crate::fault::FaultSwitch;
use crate::metrics::IoMetrics;

/// Default device block size (512-byte sectors).
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Default memory page size used for scatter/gather eligibility.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Largest transfer carried by one batch (1 MiB).
pub const MAX_BATCH_SIZE: usize = 1024 * 1024;

/// Default number of batches in the pool.
pub const DEFAULT_QUEUE_DEPTH: usize = 32;

/// Default number of background batches allowed in flight.
pub const DEFAULT_BACKGROUND_LIMIT: usize = 2;

/// Default latency after which a batch is reported as slow.
pub const DEFAULT_SLOW_IO_THRESHOLD: Duration = Duration::from_millis(500);

/// Upper bound for the batch pool.
const QUEUE_DEPTH_UPPER_BOUND: usize = 256;

/// Lower bound for the batch pool.
const QUEUE_DEPTH_LOWER_BOUND: usize = 1;

/// Environment variable consulted when no explicit queue depth is given.
pub const QUEUE_DEPTH_ENV: &str = "BLOCKIO_QUEUE_DEPTH";

/// Resolves the effective queue depth.
///
/// Priority: explicit value > `BLOCKIO_QUEUE_DEPTH` env var > [`DEFAULT_QUEUE_DEPTH`].
/// Result is clamped to `[1, 256]`.
pub fn resolve_queue_depth(explicit: Option<usize>) -> usize {
    let raw = if let Some(v) = explicit {
        v
    } else if let Ok(env_val) = std::env::var(QUEUE_DEPTH_ENV) {
        env_val.parse::<usize>().unwrap_or(DEFAULT_QUEUE_DEPTH)
    } else {
        DEFAULT_QUEUE_DEPTH
    };
    raw.clamp(QUEUE_DEPTH_LOWER_BOUND, QUEUE_DEPTH_UPPER_BOUND)
}

/// Configuration for a [`BlockFile`](crate::BlockFile).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Alignment required of request offsets, lengths and buffers.
    pub block_size: usize,
    /// Alignment a range needs to be merged into a segmented batch.
    pub page_size: usize,
    /// Maximum bytes carried by one batch.
    pub max_batch_size: usize,
    /// Maximum pages referenced by one segmented batch.
    pub max_segments_per_batch: usize,
    /// Number of batches in the pool; bounds I/O concurrency.
    pub queue_depth: usize,
    /// Maximum background batches in flight.
    pub background_limit: usize,
    /// Worker threads for administrative jobs.
    pub admin_threads: usize,
    /// Device round trips slower than this are reported.
    pub slow_io_threshold: Duration,
    /// Scatter/gather override. `None` follows the device capability,
    /// `Some(false)` forces single-buffer batches.
    pub scatter_gather: Option<bool>,
    /// Diagnostics collector shared with the caller.
    pub metrics: Arc<IoMetrics>,
    /// Storage-disabled switch, possibly shared across engines.
    pub fault: FaultSwitch,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
            max_batch_size: MAX_BATCH_SIZE,
            max_segments_per_batch: MAX_BATCH_SIZE / DEFAULT_PAGE_SIZE,
            queue_depth: resolve_queue_depth(None),
            background_limit: DEFAULT_BACKGROUND_LIMIT,
            admin_threads: 1,
            slow_io_threshold: DEFAULT_SLOW_IO_THRESHOLD,
            scatter_gather: None,
            metrics: Arc::new(IoMetrics::new()),
            fault: FaultSwitch::new(),
        }
    }
}

impl EngineConfig {
    /// Creates a config optimized for large sequential transfers.
    #[must_use]
    pub fn for_large_transfers() -> Self {
        Self {
            queue_depth: resolve_queue_depth(Some(64)),
            background_limit: 4,
            ..Self::default()
        }
    }

    /// Creates a config optimized for many small random transfers.
    #[must_use]
    pub fn for_small_transfers() -> Self {
        Self {
            queue_depth: resolve_queue_depth(Some(128)),
            max_batch_size: 256 * 1024,
            max_segments_per_batch: 256 * 1024 / DEFAULT_PAGE_SIZE,
            ..Self::default()
        }
    }

    /// Sets the block size and keeps the page size at least as large.
    #[must_use]
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        if self.page_size < block_size {
            self.page_size = block_size;
            self.cap_segments();
        }
        self
    }

    /// Sets the scatter/gather page size.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self.cap_segments();
        self
    }

    /// Sets the maximum batch size; the segment cap follows the page size.
    #[must_use]
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self.max_segments_per_batch = max_batch_size / self.page_size.max(1);
        self
    }

    /// Sets the maximum number of pages per segmented batch.
    ///
    /// Values above `max_batch_size / page_size` are rejected by
    /// [`validate`](Self::validate).
    #[must_use]
    pub fn with_max_segments_per_batch(mut self, max_segments: usize) -> Self {
        self.max_segments_per_batch = max_segments;
        self
    }

    /// Sets the batch pool size, clamped to `[1, 256]`.
    #[must_use]
    pub fn with_queue_depth(mut self, queue_depth: usize) -> Self {
        self.queue_depth = resolve_queue_depth(Some(queue_depth));
        self
    }

    /// Sets the background concurrency cap.
    #[must_use]
    pub fn with_background_limit(mut self, limit: usize) -> Self {
        self.background_limit = limit;
        self
    }

    /// Sets the number of administrative worker threads.
    #[must_use]
    pub fn with_admin_threads(mut self, threads: usize) -> Self {
        self.admin_threads = threads;
        self
    }

    /// Sets the slow-I/O reporting threshold.
    #[must_use]
    pub fn with_slow_io_threshold(mut self, threshold: Duration) -> Self {
        self.slow_io_threshold = threshold;
        self
    }

    /// Overrides scatter/gather availability.
    #[must_use]
    pub fn with_scatter_gather(mut self, enabled: bool) -> Self {
        self.scatter_gather = Some(enabled);
        self
    }

    /// Injects a shared metrics collector.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<IoMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Injects a shared fault switch.
    #[must_use]
    pub fn with_fault_switch(mut self, fault: FaultSwitch) -> Self {
        self.fault = fault;
        self
    }

    // A batch never holds more pages than fit in its byte limit.
    fn cap_segments(&mut self) {
        let pages_per_batch = self.max_batch_size / self.page_size.max(1);
        self.max_segments_per_batch = self.max_segments_per_batch.min(pages_per_batch);
    }

    /// Checks the geometry for internal consistency.
    pub fn validate(&self) -> BlockResult<()> {
        if self.block_size == 0 {
            return Err(BlockError::InvalidConfig("block size must be positive".into()));
        }
        if self.page_size == 0 || !self.page_size.is_multiple_of(self.block_size) {
            return Err(BlockError::InvalidConfig(format!(
                "page size {} must be a positive multiple of the block size {}",
                self.page_size, self.block_size
            )));
        }
        if self.max_batch_size == 0 || !self.max_batch_size.is_multiple_of(self.page_size) {
            return Err(BlockError::InvalidConfig(format!(
                "max batch size {} must be a positive multiple of the page size",
                self.max_batch_size
            )));
        }
        if self.max_segments_per_batch == 0 {
            return Err(BlockError::InvalidConfig(
                "max segments per batch must be positive".into(),
            ));
        }
        let pages_per_batch = self.max_batch_size / self.page_size;
        if self.max_segments_per_batch > pages_per_batch {
            return Err(BlockError::InvalidConfig(format!(
                "max segments per batch {} exceeds the {pages_per_batch} pages a batch can hold",
                self.max_segments_per_batch
            )));
        }
        if !(QUEUE_DEPTH_LOWER_BOUND..=QUEUE_DEPTH_UPPER_BOUND).contains(&self.queue_depth) {
            return Err(BlockError::InvalidConfig(format!(
                "queue depth {} outside [{QUEUE_DEPTH_LOWER_BOUND}, {QUEUE_DEPTH_UPPER_BOUND}]",
                self.queue_depth
            )));
        }
        if self.admin_threads == 0 {
            return Err(BlockError::InvalidConfig(
                "at least one admin thread is required".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_batch_size, MAX_BATCH_SIZE);
        assert_eq!(config.max_segments_per_batch, MAX_BATCH_SIZE / DEFAULT_PAGE_SIZE);
        assert_eq!(config.background_limit, DEFAULT_BACKGROUND_LIMIT);
    }

    #[test]
    fn presets_are_valid() {
        assert!(EngineConfig::for_large_transfers().validate().is_ok());
        assert!(EngineConfig::for_small_transfers().validate().is_ok());
    }

    #[test]
    fn resolve_queue_depth_explicit_is_clamped() {
        assert_eq!(resolve_queue_depth(Some(8)), 8);
        assert_eq!(resolve_queue_depth(Some(0)), QUEUE_DEPTH_LOWER_BOUND);
        assert_eq!(resolve_queue_depth(Some(10_000)), QUEUE_DEPTH_UPPER_BOUND);
    }

    #[test]
    fn block_size_raises_page_size() {
        let config = EngineConfig::default().with_block_size(8192);
        assert_eq!(config.page_size, 8192);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_block_size() {
        let mut config = EngineConfig::default();
        config.block_size = 0;
        assert!(matches!(config.validate(), Err(BlockError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_page_size_not_multiple_of_block() {
        let config = EngineConfig::default().with_block_size(512).with_page_size(768);
        assert!(matches!(config.validate(), Err(BlockError::InvalidConfig(_))));
    }

    #[test]
    fn accepts_non_power_of_two_geometry() {
        let config = EngineConfig::default()
            .with_block_size(100)
            .with_page_size(100)
            .with_max_batch_size(1000);
        assert!(config.validate().is_ok());
        assert_eq!(config.max_segments_per_batch, 10);
    }

    #[test]
    fn rejects_batch_size_not_multiple_of_page() {
        let mut config = EngineConfig::default();
        config.max_batch_size = DEFAULT_PAGE_SIZE + 1;
        assert!(matches!(config.validate(), Err(BlockError::InvalidConfig(_))));
    }

    #[test]
    fn max_batch_size_updates_segment_cap() {
        let config = EngineConfig::default().with_max_batch_size(64 * 1024);
        assert_eq!(config.max_segments_per_batch, 16);
    }

    #[test]
    fn rejects_segment_cap_beyond_batch_pages() {
        let config = EngineConfig::default().with_max_segments_per_batch(usize::MAX);
        assert!(matches!(config.validate(), Err(BlockError::InvalidConfig(_))));

        let config = EngineConfig::default()
            .with_max_segments_per_batch(MAX_BATCH_SIZE / DEFAULT_PAGE_SIZE + 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn larger_pages_shrink_segment_cap() {
        let config = EngineConfig::default().with_page_size(2 * DEFAULT_PAGE_SIZE);
        assert_eq!(
            config.max_segments_per_batch,
            MAX_BATCH_SIZE / (2 * DEFAULT_PAGE_SIZE)
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_admin_threads() {
        let config = EngineConfig::default().with_admin_threads(0);
        assert!(config.validate().is_err());
    }
}
