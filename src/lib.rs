//! Repartitions large multi-sheet workbooks into bounded output workbooks.
//!
//! A run analyzes the input, plans the source-to-destination segments, then
//! writes every output target through a bounded worker pool, either straight
//! from the input (direct mode) or through a SQLite staging store (two-phase
//! mode).

pub mod commands;
pub mod config;
pub mod error;
pub mod execution;
pub mod partition;
pub mod state;
pub mod storage;
pub mod streaming;
pub mod workbook;
