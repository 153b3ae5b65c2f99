//! Storage module for the SQLite staging database.

mod staging;

pub use staging::{
    GroupState, StagedGroup, StagingStore, META_EMITTED_COUNTS, META_SCHEMA, META_SOURCE_PATH,
};
