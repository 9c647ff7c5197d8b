//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use blockfile::testing::ScriptedDevice;
use blockfile::{BlockFile, EngineConfig, IoBuffer, IoBuffers};

/// Alignment used for every test buffer.
pub const PAGE: usize = 4096;

/// Opens an engine over `device` with `config`.
pub fn open(device: &Arc<ScriptedDevice>, config: EngineConfig) -> BlockFile {
    BlockFile::open(device.clone(), config).expect("open block file")
}

/// A flat buffer of `len` copies of `byte`.
pub fn filled(len: usize, byte: u8) -> IoBuffers {
    IoBuffers::flat(IoBuffer::from_slice(&vec![byte; len], PAGE))
}

/// A zeroed flat buffer and a handle to inspect it afterwards.
pub fn sink(len: usize) -> (IoBuffers, Arc<IoBuffer>) {
    let buffer = IoBuffer::zeroed(len, PAGE);
    (IoBuffers::flat(Arc::clone(&buffer)), buffer)
}

/// Configuration with small, easily reasoned-about geometry:
/// 512-byte blocks, 4 KiB pages and 64 KiB batches.
pub fn small_config() -> EngineConfig {
    EngineConfig::default()
        .with_max_batch_size(64 * 1024)
        .with_max_segments_per_batch(16)
}
