//! Greedy partition planner.
//!
//! Walks the input groups in listing order and fills one output target at a
//! time. Exactly one target is open at any point; a later input group always
//! tops off the target left open by the previous one, even when that target
//! is the last slot of an artifact.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info};

use super::{CapacityPolicy, InputGroup};
use crate::workbook::ArtifactId;

/// One output group slot: (artifact, group), both 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct OutputTarget {
    pub artifact: ArtifactId,
    pub group: u64,
}

impl std::fmt::Display for OutputTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.artifact, self.group)
    }
}

/// A contiguous source range mapped onto a contiguous destination range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Segment {
    /// Rank of the source group.
    pub source_group: usize,
    pub source_offset: u64,
    pub length: u64,
    pub target: OutputTarget,
    /// Row offset inside the destination group where this segment starts.
    pub dest_offset: u64,
}

impl Segment {
    /// Whether this segment creates its destination group.
    pub fn begins_group(&self) -> bool {
        self.dest_offset == 0
    }
}

/// The segments of one target, in plan order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanTarget {
    pub target: OutputTarget,
    pub records: u64,
    pub segments: Vec<Segment>,
}

/// Output of the planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionPlan {
    pub capacity: CapacityPolicy,
    pub total_records: u64,
    pub output_groups: u64,
    pub artifacts: u64,
    pub segments: Vec<Segment>,
}

impl PartitionPlan {
    /// Groups the segments by target, in target order.
    pub fn targets(&self) -> Vec<PlanTarget> {
        let mut by_target: BTreeMap<OutputTarget, PlanTarget> = BTreeMap::new();
        for segment in &self.segments {
            let entry = by_target
                .entry(segment.target)
                .or_insert_with(|| PlanTarget {
                    target: segment.target,
                    records: 0,
                    segments: Vec::new(),
                });
            entry.records += segment.length;
            entry.segments.push(segment.clone());
        }
        by_target.into_values().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Plans the repartitioning of `groups` under `capacity`.
///
/// Pure and deterministic: the same inputs always yield the same plan.
pub fn plan(groups: &[InputGroup], capacity: &CapacityPolicy) -> PartitionPlan {
    let per_group = capacity.records_per_group();
    let per_artifact = capacity.groups_per_artifact();

    let mut segments = Vec::new();
    let mut artifact: ArtifactId = 1;
    let mut slot: u64 = 1;
    let mut filled: u64 = 0;

    for group in groups {
        let mut offset = 0;
        let mut remaining = group.record_count;

        while remaining > 0 {
            if filled == per_group {
                filled = 0;
                if slot == per_artifact {
                    artifact += 1;
                    slot = 1;
                } else {
                    slot += 1;
                }
            }

            let length = remaining.min(per_group - filled);
            segments.push(Segment {
                source_group: group.rank,
                source_offset: offset,
                length,
                target: OutputTarget {
                    artifact,
                    group: slot,
                },
                dest_offset: filled,
            });

            offset += length;
            remaining -= length;
            filled += length;
        }

        if group.record_count == 0 {
            debug!(group = %group.name, "Empty group contributes no segment");
        }
    }

    let total_records: u64 = groups.iter().map(|g| g.record_count).sum();
    let output_groups = total_records.div_ceil(per_group);
    let artifacts = output_groups.div_ceil(per_artifact);

    info!(
        "[PLANNER] {} records from {} groups -> {} segments, {} output groups, {} artifacts",
        total_records,
        groups.len(),
        segments.len(),
        output_groups,
        artifacts
    );

    PartitionPlan {
        capacity: *capacity,
        total_records,
        output_groups,
        artifacts,
        segments,
    }
}
