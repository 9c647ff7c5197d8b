//! Asynchronous coalescing I/O for raw and sparse block files.
//!
//! This crate is a thin facade over [`block_io`], which holds the engine,
//! the device boundary and the built-in [`FileDevice`]. Downstream code
//! depends on `blockfile` and never names the inner crate.

#![deny(rustdoc::broken_intra_doc_links)]

pub use block_io::*;
