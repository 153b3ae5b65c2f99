//! Output consolidation.
//!
//! Applies one batch of records to one output group. The artifact's lock is
//! held for the whole read-modify-write cycle, and the write position always
//! comes from the extent stored on disk. A batch that is already present is
//! skipped, so re-running a partially completed split is safe.
//!
//! Key behaviours:
//! - Idempotent re-application of identical batches
//! - Partial overlaps rewritten from the batch's destination offset
//! - Reconstruction of the artifact when the normal cycle fails

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::OutputNaming;
use crate::error::AppError;
use crate::execution::ArtifactLocks;
use crate::partition::OutputTarget;
use crate::workbook::{ArtifactSink, Record};

/// What a write did to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WriteOutcome {
    /// The group was created with this batch.
    Created,
    /// The batch was appended after the group's content.
    Appended,
    /// The group already held the batch.
    AlreadyPresent,
    /// The group (and its artifact's manifest) was reconstructed.
    Rebuilt,
}

/// Serializes writes per artifact and reconciles them with stored extents.
pub struct Consolidator {
    sink: Arc<dyn ArtifactSink>,
    naming: OutputNaming,
    locks: ArtifactLocks,
}

impl Consolidator {
    pub fn new(sink: Arc<dyn ArtifactSink>, naming: OutputNaming) -> Self {
        Self {
            sink,
            naming,
            locks: ArtifactLocks::new(),
        }
    }

    pub fn naming(&self) -> &OutputNaming {
        &self.naming
    }

    /// Name of the output group of `target`.
    pub fn group_name(&self, target: OutputTarget) -> String {
        self.naming.group_name(target.group)
    }

    /// Writes `rows` at `dest_offset` of `target`'s group.
    ///
    /// Blocking; call from a blocking thread.
    ///
    /// # Errors
    ///
    /// Returns `AppError::WriteFailed` if the batch would leave a gap in the
    /// group, or if both the normal cycle and reconstruction fail.
    pub fn write(
        &self,
        target: OutputTarget,
        dest_offset: u64,
        header: &[String],
        rows: &[Record],
    ) -> Result<WriteOutcome, AppError> {
        let group = self.group_name(target);
        let label = format!("{}/{}", self.naming.artifact_name(target.artifact), group);

        let lock = self.locks.handle(target.artifact);
        let _guard = lock.lock().unwrap_or_else(|p| p.into_inner());

        match self.apply(target, &group, dest_offset, header, rows) {
            Ok(outcome) => {
                debug!(output = %label, dest_offset, rows = rows.len(), ?outcome, "Batch applied");
                Ok(outcome)
            }
            Err(e @ AppError::WriteFailed { .. }) => Err(e),
            Err(e) => {
                warn!(
                    "[CONSOLIDATOR] Write to {} failed ({}), reconstructing artifact",
                    label, e
                );
                self.sink
                    .rebuild_group(target.artifact, &group, header, dest_offset, rows)
                    .map(|_| WriteOutcome::Rebuilt)
                    .map_err(|rebuild_err| AppError::WriteFailed {
                        target: label,
                        message: format!("{}; reconstruction failed: {}", e, rebuild_err),
                    })
            }
        }
    }

    /// Replaces the content of `target`'s group with `rows`, whatever it held.
    ///
    /// Used when the rows planned for the group changed since it was written,
    /// so its stored extent no longer says anything about its content.
    pub fn replace(
        &self,
        target: OutputTarget,
        header: &[String],
        rows: &[Record],
    ) -> Result<WriteOutcome, AppError> {
        let group = self.group_name(target);
        let label = format!("{}/{}", self.naming.artifact_name(target.artifact), group);

        let lock = self.locks.handle(target.artifact);
        let _guard = lock.lock().unwrap_or_else(|p| p.into_inner());

        self.sink
            .rebuild_group(target.artifact, &group, header, 0, rows)
            .map_err(|e| AppError::WriteFailed {
                target: label.clone(),
                message: format!("replacing the group failed: {}", e),
            })?;
        debug!(output = %label, rows = rows.len(), "Group replaced");
        Ok(WriteOutcome::Rebuilt)
    }

    /// One read-modify-write cycle. The caller holds the artifact lock.
    fn apply(
        &self,
        target: OutputTarget,
        group: &str,
        dest_offset: u64,
        header: &[String],
        rows: &[Record],
    ) -> Result<WriteOutcome, AppError> {
        let artifact = target.artifact;
        let len = rows.len() as u64;

        self.sink.create_or_open(artifact)?;
        let extent = self.sink.read_group_extent(artifact, group)?;

        match extent {
            None if dest_offset == 0 => {
                self.sink
                    .create_or_append_group(artifact, group, header, rows)?;
                Ok(WriteOutcome::Created)
            }
            Some(extent) if extent == dest_offset => {
                self.sink
                    .create_or_append_group(artifact, group, header, rows)?;
                Ok(WriteOutcome::Appended)
            }
            Some(extent) if extent >= dest_offset + len => Ok(WriteOutcome::AlreadyPresent),
            Some(extent) if extent > dest_offset => {
                debug!(
                    group,
                    extent, dest_offset, "Partial overlap, rewriting from offset"
                );
                self.sink
                    .rebuild_group(artifact, group, header, dest_offset, rows)?;
                Ok(WriteOutcome::Rebuilt)
            }
            extent => Err(AppError::WriteFailed {
                target: format!("{}/{}", self.naming.artifact_name(artifact), group),
                message: format!(
                    "batch starts at row {} but the group holds {} rows",
                    dest_offset,
                    extent.unwrap_or(0)
                ),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workbook::{CsvWorkbook, CsvWorkbookSink, RecordSource, MANIFEST_FILE};
    use std::fs;
    use tempfile::TempDir;

    fn header() -> Record {
        vec!["serial".to_string()]
    }

    fn rows(range: std::ops::Range<u32>) -> Vec<Record> {
        range.map(|i| vec![i.to_string()]).collect()
    }

    fn target(artifact: u64, group: u64) -> OutputTarget {
        OutputTarget { artifact, group }
    }

    fn setup() -> (TempDir, CsvWorkbookSink, Consolidator) {
        let dir = TempDir::new().expect("temp dir");
        let sink = CsvWorkbookSink::new(dir.path(), OutputNaming::default());
        let consolidator = Consolidator::new(Arc::new(sink.clone()), OutputNaming::default());
        (dir, sink, consolidator)
    }

    fn read_group(sink: &CsvWorkbookSink, artifact: u64, group: &str) -> Vec<Record> {
        let workbook = CsvWorkbook::open(sink.artifact_dir(artifact)).expect("open artifact");
        workbook
            .open_group_reader(group)
            .expect("reader")
            .rows
            .map(|r| r.expect("row"))
            .collect()
    }

    #[test]
    fn create_then_append() {
        let (_dir, sink, consolidator) = setup();

        let outcome = consolidator
            .write(target(1, 1), 0, &header(), &rows(0..3))
            .expect("create");
        assert_eq!(outcome, WriteOutcome::Created);

        let outcome = consolidator
            .write(target(1, 1), 3, &header(), &rows(3..4))
            .expect("append");
        assert_eq!(outcome, WriteOutcome::Appended);

        assert_eq!(read_group(&sink, 1, "Sheet_1"), rows(0..4));
    }

    #[test]
    fn reapplying_a_batch_is_a_no_op() {
        let (_dir, sink, consolidator) = setup();
        consolidator
            .write(target(1, 1), 0, &header(), &rows(0..3))
            .expect("create");
        consolidator
            .write(target(1, 1), 3, &header(), &rows(3..5))
            .expect("append");

        let outcome = consolidator
            .write(target(1, 1), 3, &header(), &rows(3..5))
            .expect("re-apply");
        assert_eq!(outcome, WriteOutcome::AlreadyPresent);
        assert_eq!(read_group(&sink, 1, "Sheet_1"), rows(0..5));
    }

    #[test]
    fn partial_overlap_is_overwritten() {
        let (_dir, sink, consolidator) = setup();
        consolidator
            .write(target(1, 1), 0, &header(), &rows(0..4))
            .expect("create");

        // Group holds 4 rows; the batch covers rows 2..6.
        let outcome = consolidator
            .write(target(1, 1), 2, &header(), &rows(20..24))
            .expect("overlap");
        assert_eq!(outcome, WriteOutcome::Rebuilt);

        let mut expected = rows(0..2);
        expected.extend(rows(20..24));
        assert_eq!(read_group(&sink, 1, "Sheet_1"), expected);
    }

    #[test]
    fn replace_discards_stale_rows() {
        let (_dir, sink, consolidator) = setup();
        consolidator
            .write(target(1, 1), 0, &header(), &rows(0..4))
            .expect("create");
        consolidator
            .write(target(1, 2), 0, &header(), &rows(4..6))
            .expect("neighbour");

        let outcome = consolidator
            .replace(target(1, 1), &header(), &rows(10..12))
            .expect("replace");
        assert_eq!(outcome, WriteOutcome::Rebuilt);
        assert_eq!(read_group(&sink, 1, "Sheet_1"), rows(10..12));
        assert_eq!(read_group(&sink, 1, "Sheet_2"), rows(4..6));

        // A stored extent that covers the next batch no longer hides it.
        let outcome = consolidator
            .write(target(1, 1), 2, &header(), &rows(12..13))
            .expect("append after replace");
        assert_eq!(outcome, WriteOutcome::Appended);
        assert_eq!(read_group(&sink, 1, "Sheet_1"), rows(10..13));
    }

    #[test]
    fn gap_is_write_failed() {
        let (_dir, _sink, consolidator) = setup();
        let err = consolidator
            .write(target(1, 1), 5, &header(), &rows(0..1))
            .expect_err("gap");
        assert!(matches!(err, AppError::WriteFailed { .. }));
    }

    #[test]
    fn lost_manifest_triggers_reconstruction() {
        let (_dir, sink, consolidator) = setup();
        consolidator
            .write(target(1, 1), 0, &header(), &rows(0..2))
            .expect("group 1");
        consolidator
            .write(target(1, 2), 0, &header(), &rows(2..4))
            .expect("group 2");
        fs::remove_file(sink.artifact_dir(1).join(MANIFEST_FILE)).expect("remove manifest");

        let outcome = consolidator
            .write(target(1, 2), 2, &header(), &rows(4..5))
            .expect("write after manifest loss");
        assert_eq!(outcome, WriteOutcome::Rebuilt);

        assert_eq!(read_group(&sink, 1, "Sheet_1"), rows(0..2));
        assert_eq!(read_group(&sink, 1, "Sheet_2"), rows(2..5));
    }

    #[test]
    fn concurrent_writers_to_one_artifact_keep_it_consistent() {
        let (_dir, sink, consolidator) = setup();
        let consolidator = Arc::new(consolidator);

        let handles: Vec<_> = (1..=3u64)
            .map(|slot| {
                let consolidator = Arc::clone(&consolidator);
                std::thread::spawn(move || {
                    let base = (slot as u32) * 100;
                    for batch in 0..5u32 {
                        let start = base + batch * 2;
                        consolidator
                            .write(
                                target(1, slot),
                                u64::from(batch * 2),
                                &header(),
                                &rows(start..start + 2),
                            )
                            .expect("write");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread");
        }

        for slot in 1..=3u32 {
            let base = slot * 100;
            assert_eq!(
                read_group(&sink, 1, &format!("Sheet_{}", slot)),
                rows(base..base + 10)
            );
        }
    }
}
