//! Input analysis and partition planning.
//!
//! The analyzer turns a [`RecordSource`](crate::workbook::RecordSource) into an
//! ordered list of [`InputGroup`]s; the planner maps those groups onto output
//! targets under a [`CapacityPolicy`].

mod analyzer;
mod planner;

pub use analyzer::{analyze, SourceAnalysis};
pub use planner::{plan, OutputTarget, PartitionPlan, PlanTarget, Segment};

use serde::Serialize;

use crate::error::AppError;
use crate::workbook::Record;

/// Output limits: groups per artifact and records per group, both at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CapacityPolicy {
    groups_per_artifact: u64,
    records_per_group: u64,
}

impl CapacityPolicy {
    /// # Errors
    ///
    /// Returns `AppError::InvalidConfig` if either limit is zero.
    pub fn new(groups_per_artifact: u64, records_per_group: u64) -> Result<Self, AppError> {
        if groups_per_artifact == 0 {
            return Err(AppError::InvalidConfig(
                "groups per artifact must be at least 1".into(),
            ));
        }
        if records_per_group == 0 {
            return Err(AppError::InvalidConfig(
                "records per group must be at least 1".into(),
            ));
        }
        Ok(Self {
            groups_per_artifact,
            records_per_group,
        })
    }

    pub fn groups_per_artifact(&self) -> u64 {
        self.groups_per_artifact
    }

    pub fn records_per_group(&self) -> u64 {
        self.records_per_group
    }
}

/// One group of the input, as discovered by the analyzer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputGroup {
    pub name: String,
    /// Position in the source listing (0-based).
    pub rank: usize,
    pub record_count: u64,
    /// Ordered field names.
    pub schema: Record,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_rejects_zero() {
        assert!(matches!(
            CapacityPolicy::new(0, 10),
            Err(AppError::InvalidConfig(_))
        ));
        assert!(matches!(
            CapacityPolicy::new(3, 0),
            Err(AppError::InvalidConfig(_))
        ));

        let policy = CapacityPolicy::new(1, 1).expect("minimal policy");
        assert_eq!(policy.groups_per_artifact(), 1);
        assert_eq!(policy.records_per_group(), 1);
    }
}
