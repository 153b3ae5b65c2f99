//! Emission: one work unit per output target, fed by either the source
//! workbook (direct mode) or the staging store (two-phase mode).

use std::sync::Arc;

use tracing::debug;

use crate::error::AppError;
use crate::execution::{UnitKind, WorkUnit};
use crate::partition::{InputGroup, PartitionPlan};
use crate::state::RunState;
use crate::storage::StagingStore;
use crate::streaming::{ChunkConfig, ChunkedReader};
use crate::workbook::{Record, RecordSource};

/// Batches of one source range.
pub type BatchIter = Box<dyn Iterator<Item = Result<Vec<Record>, AppError>> + Send>;

/// Where emission reads segment records from.
pub trait SegmentSource: Send + Sync {
    fn batches(
        &self,
        group: &InputGroup,
        offset: u64,
        length: u64,
        chunk: ChunkConfig,
    ) -> Result<BatchIter, AppError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Direct mode
// ─────────────────────────────────────────────────────────────────────────────

/// Reads segments straight from the source workbook.
pub struct DirectSegments {
    source: Arc<dyn RecordSource>,
}

impl DirectSegments {
    pub fn new(source: Arc<dyn RecordSource>) -> Self {
        Self { source }
    }
}

impl SegmentSource for DirectSegments {
    fn batches(
        &self,
        group: &InputGroup,
        offset: u64,
        length: u64,
        chunk: ChunkConfig,
    ) -> Result<BatchIter, AppError> {
        let reader = ChunkedReader::open(self.source.as_ref(), group, offset, length, chunk)?;
        Ok(Box::new(reader))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Two-phase mode
// ─────────────────────────────────────────────────────────────────────────────

/// Reads segments from the staging store through its order index.
pub struct StagedSegments {
    store: StagingStore,
}

impl StagedSegments {
    pub fn new(store: StagingStore) -> Self {
        Self { store }
    }
}

impl SegmentSource for StagedSegments {
    fn batches(
        &self,
        group: &InputGroup,
        offset: u64,
        length: u64,
        chunk: ChunkConfig,
    ) -> Result<BatchIter, AppError> {
        Ok(Box::new(StagedBatches {
            store: self.store.clone(),
            rank: group.rank,
            group: group.name.clone(),
            offset,
            next: offset,
            end: offset + length,
            step: chunk.max_records.max(1),
            finished: length == 0,
        }))
    }
}

struct StagedBatches {
    store: StagingStore,
    rank: usize,
    group: String,
    offset: u64,
    next: u64,
    end: u64,
    step: u64,
    finished: bool,
}

impl Iterator for StagedBatches {
    type Item = Result<Vec<Record>, AppError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let wanted = self.step.min(self.end - self.next);
        let batch = match self.store.query_group_range(self.rank, self.next, wanted) {
            Ok(batch) => batch,
            Err(e) => {
                self.finished = true;
                return Some(Err(e));
            }
        };

        if (batch.len() as u64) < wanted {
            self.finished = true;
            return Some(Err(AppError::RangeUnavailable {
                group: self.group.clone(),
                offset: self.offset,
                end: self.end,
                available: self.next + batch.len() as u64,
            }));
        }

        self.next += wanted;
        self.finished = self.next >= self.end;
        Some(Ok(batch))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Units
// ─────────────────────────────────────────────────────────────────────────────

/// Builds one unit per target. Each unit applies its target's segments in
/// plan order, so one target never has two segments in flight.
///
/// With `rewrite` set, each target's first batch replaces whatever its group
/// held instead of being reconciled against the stored extent.
pub fn target_units(
    state: &RunState,
    plan: &PartitionPlan,
    groups: &[InputGroup],
    segments: Arc<dyn SegmentSource>,
    rewrite: bool,
) -> Vec<WorkUnit> {
    let groups: Arc<Vec<InputGroup>> = Arc::new(groups.to_vec());
    let chunk = state.chunk();

    plan.targets()
        .into_iter()
        .map(|plan_target| {
            let label = state.target_label(plan_target.target);
            let kind = UnitKind::Target {
                target: plan_target.target,
            };
            let consolidator = Arc::clone(&state.consolidator);
            let groups = Arc::clone(&groups);
            let segments = Arc::clone(&segments);

            WorkUnit::new(label, kind, move |cancel| {
                let target = plan_target.target;
                let mut written = 0u64;

                for segment in &plan_target.segments {
                    let group = groups.get(segment.source_group).ok_or_else(|| {
                        AppError::Internal(format!(
                            "Segment references unknown group rank {}",
                            segment.source_group
                        ))
                    })?;

                    let mut dest_offset = segment.dest_offset;
                    for batch in
                        segments.batches(group, segment.source_offset, segment.length, chunk)?
                    {
                        if cancel.is_cancelled() {
                            return Err(AppError::Cancelled);
                        }
                        let batch = batch?;
                        if rewrite && dest_offset == 0 {
                            consolidator.replace(target, &group.schema, &batch)?;
                        } else {
                            consolidator.write(target, dest_offset, &group.schema, &batch)?;
                        }
                        dest_offset += batch.len() as u64;
                        written += batch.len() as u64;
                    }

                    debug!(
                        target_artifact = target.artifact,
                        target_group = target.group,
                        source = %group.name,
                        offset = segment.source_offset,
                        length = segment.length,
                        "Segment written"
                    );
                }

                Ok(written)
            })
        })
        .collect()
}
