//! Input analysis: discovers groups and counts their records without loading
//! row data.

use serde::Serialize;
use tracing::{debug, info, warn};

use super::InputGroup;
use crate::error::AppError;
use crate::workbook::{Record, RecordSource};

/// Result of analyzing a source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceAnalysis {
    pub groups: Vec<InputGroup>,
    /// First non-empty header of the source.
    pub schema: Record,
    /// Groups whose header differs from `schema`.
    pub header_mismatches: Vec<String>,
    pub total_records: u64,
}

/// Lists and counts every group of `source`.
///
/// # Errors
///
/// Any failure is fatal: `SourceUnreadable` if the source cannot be listed,
/// `GroupMissing` if a listed group disappears while it is counted.
pub fn analyze(source: &dyn RecordSource) -> Result<SourceAnalysis, AppError> {
    let names = source.list_groups()?;

    let mut groups = Vec::with_capacity(names.len());
    let mut schema: Record = Vec::new();
    let mut header_mismatches = Vec::new();

    for (rank, name) in names.into_iter().enumerate() {
        let header = source.group_header(&name)?;
        let record_count = source.count_rows(&name)?;
        debug!(group = %name, rank, record_count, "Counted group");

        if schema.is_empty() {
            schema = header.clone();
        } else if !header.is_empty() && header != schema {
            warn!(
                "[ANALYZER] Header of '{}' differs from the first sheet ({} vs {} fields)",
                name,
                header.len(),
                schema.len()
            );
            header_mismatches.push(name.clone());
        }

        groups.push(InputGroup {
            name,
            rank,
            record_count,
            schema: header,
        });
    }

    let total_records = groups.iter().map(|g| g.record_count).sum();
    info!(
        "[ANALYZER] Found {} groups holding {} records",
        groups.len(),
        total_records
    );

    Ok(SourceAnalysis {
        groups,
        schema,
        header_mismatches,
        total_records,
    })
}
