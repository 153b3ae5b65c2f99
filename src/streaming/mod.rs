//! Streaming utilities for moving records without materializing them.
//!
//! This module provides bounded batch reading of source ranges, the output
//! consolidator that applies batches to shared artifacts, and atomic file
//! writing with automatic cleanup on failure.

mod atomic_writer;
mod chunked_reader;
mod consolidator;

pub use atomic_writer::{write_atomic, AtomicCsvWriter};
pub use chunked_reader::{ChunkConfig, ChunkedReader};
pub use consolidator::{Consolidator, WriteOutcome};
