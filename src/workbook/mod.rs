//! Tabular workbook access.
//!
//! The splitter core only talks to workbooks through two narrow capabilities:
//! a [`RecordSource`] that lists, counts and streams named groups (sheets),
//! and an [`ArtifactSink`] that creates output workbooks and appends rows to
//! their groups. The CSV workbook format implements both; an in-memory source
//! exists for tests and embedding.

mod csv_dir;
mod manifest;
mod memory;

pub use csv_dir::{CsvWorkbook, CsvWorkbookSink};
pub use manifest::{GroupEntry, Manifest, MANIFEST_FILE};
pub use memory::MemorySource;

use crate::error::AppError;

/// One record: the ordered field values of a row.
pub type Record = Vec<String>;

/// Identifier of an output artifact (1-based).
pub type ArtifactId = u64;

/// Sequential row iterator returned by a source.
pub type RowIter = Box<dyn Iterator<Item = Result<Record, AppError>> + Send>;

/// An opened group: its header and a lazy sequence of its data rows.
pub struct GroupReader {
    pub header: Record,
    pub rows: RowIter,
}

// ─────────────────────────────────────────────────────────────────────────────
// Capabilities
// ─────────────────────────────────────────────────────────────────────────────

/// Read side: an ordered set of named groups.
pub trait RecordSource: Send + Sync {
    /// Lists group names in source order.
    fn list_groups(&self) -> Result<Vec<String>, AppError>;

    /// Counts the data rows (header excluded) of a group.
    fn count_rows(&self, name: &str) -> Result<u64, AppError>;

    /// Returns the header of a group without reading its rows.
    fn group_header(&self, name: &str) -> Result<Record, AppError>;

    /// Opens a sequential reader positioned at the first data row.
    fn open_group_reader(&self, name: &str) -> Result<GroupReader, AppError>;
}

/// Write side: output artifacts holding named groups.
pub trait ArtifactSink: Send + Sync {
    /// Creates the artifact if absent.
    fn create_or_open(&self, artifact: ArtifactId) -> Result<(), AppError>;

    /// Creates the group (header plus rows) if absent, otherwise appends `rows`
    /// after its committed content. Returns the new extent in rows.
    fn create_or_append_group(
        &self,
        artifact: ArtifactId,
        group: &str,
        header: &[String],
        rows: &[Record],
    ) -> Result<u64, AppError>;

    /// Returns the committed row count of a group, or `None` if it does not exist.
    fn read_group_extent(&self, artifact: ArtifactId, group: &str)
        -> Result<Option<u64>, AppError>;

    /// Lists the groups currently present in an artifact, in artifact order.
    fn list_artifact_groups(&self, artifact: ArtifactId) -> Result<Vec<String>, AppError>;

    /// Reconstructs the artifact from the groups on disk, keeping the first
    /// `keep_rows` rows of `group` and appending `rows` after them. Every file
    /// is replaced atomically. Returns the new extent of `group`.
    fn rebuild_group(
        &self,
        artifact: ArtifactId,
        group: &str,
        header: &[String],
        keep_rows: u64,
        rows: &[Record],
    ) -> Result<u64, AppError>;
}
