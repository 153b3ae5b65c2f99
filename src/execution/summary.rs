//! Run summary: planned versus written work and every failed unit.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{UnitKind, UnitResult, UnitStatus};
use crate::error::AppError;
use crate::partition::{OutputTarget, PartitionPlan};
use crate::streaming::write_atomic;

/// How the records travelled from source to artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Direct,
    Staged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitFailure {
    pub unit: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub planned_targets: u64,
    pub written_targets: u64,
    pub planned_artifacts: u64,
    /// Artifacts whose every target was written.
    pub written_artifacts: u64,
    pub records_planned: u64,
    pub records_written: u64,
    /// Input groups staged (two-phase mode only).
    pub groups_staged: Option<u64>,
    /// Input groups that failed to stage; emission is skipped when non-empty.
    pub ingest_failed: Vec<String>,
    pub failures: Vec<UnitFailure>,
    pub cancelled: Vec<String>,
    pub elapsed_ms: u64,
}

impl RunSummary {
    pub fn new(mode: RunMode, plan: &PartitionPlan) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            mode,
            planned_targets: plan.output_groups,
            written_targets: 0,
            planned_artifacts: plan.artifacts,
            written_artifacts: 0,
            records_planned: plan.total_records,
            records_written: 0,
            groups_staged: None,
            ingest_failed: Vec::new(),
            failures: Vec::new(),
            cancelled: Vec::new(),
            elapsed_ms: 0,
        }
    }

    /// Folds ingestion unit results into the summary.
    pub fn record_ingestion(&mut self, results: &[UnitResult]) {
        let mut staged = self.groups_staged.unwrap_or(0);
        for result in results {
            match &result.status {
                UnitStatus::Completed { .. } => staged += 1,
                UnitStatus::Failed { reason } => {
                    if let UnitKind::Group { name, .. } = &result.kind {
                        self.ingest_failed.push(name.clone());
                    }
                    self.failures.push(UnitFailure {
                        unit: result.label.clone(),
                        reason: reason.clone(),
                    });
                }
                UnitStatus::Cancelled => self.cancelled.push(result.label.clone()),
            }
        }
        self.groups_staged = Some(staged);
    }

    /// Folds emission unit results into the summary.
    pub fn record_emission(&mut self, results: &[UnitResult]) {
        let mut incomplete: BTreeSet<u64> = BTreeSet::new();
        let mut seen: BTreeSet<u64> = BTreeSet::new();

        for result in results {
            let artifact = match &result.kind {
                UnitKind::Target {
                    target: OutputTarget { artifact, .. },
                } => Some(*artifact),
                UnitKind::Group { .. } => None,
            };
            if let Some(artifact) = artifact {
                seen.insert(artifact);
            }

            match &result.status {
                UnitStatus::Completed { records } => {
                    self.written_targets += 1;
                    self.records_written += records;
                }
                UnitStatus::Failed { reason } => {
                    incomplete.extend(artifact);
                    self.failures.push(UnitFailure {
                        unit: result.label.clone(),
                        reason: reason.clone(),
                    });
                }
                UnitStatus::Cancelled => {
                    incomplete.extend(artifact);
                    self.cancelled.push(result.label.clone());
                }
            }
        }

        self.written_artifacts = seen.difference(&incomplete).count() as u64;
    }

    pub fn finish(&mut self, elapsed: Duration) {
        self.elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    }

    /// No failed or cancelled unit, and every planned target written.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
            && self.cancelled.is_empty()
            && self.written_targets == self.planned_targets
    }

    /// The error that best describes an unsuccessful run.
    pub fn error(&self) -> Option<AppError> {
        if self.is_success() {
            return None;
        }
        if !self.ingest_failed.is_empty() {
            return Some(AppError::PartialIngestFailure {
                failed: self.ingest_failed.clone(),
            });
        }
        if let Some(failure) = self.failures.first() {
            return Some(AppError::WriteFailed {
                target: failure.unit.clone(),
                message: if self.failures.len() > 1 {
                    format!(
                        "{} (and {} more failed units)",
                        failure.reason,
                        self.failures.len() - 1
                    )
                } else {
                    failure.reason.clone()
                },
            });
        }
        if !self.cancelled.is_empty() {
            return Some(AppError::Cancelled);
        }
        Some(AppError::Internal(format!(
            "{} of {} targets written",
            self.written_targets, self.planned_targets
        )))
    }

    /// Logs the outcome: info on success, one error line per failed unit otherwise.
    pub fn log(&self) {
        info!(
            "[SPLIT] Run {} ({:?}): {}/{} targets, {}/{} artifacts, {}/{} records in {} ms",
            self.run_id,
            self.mode,
            self.written_targets,
            self.planned_targets,
            self.written_artifacts,
            self.planned_artifacts,
            self.records_written,
            self.records_planned,
            self.elapsed_ms
        );
        for failure in &self.failures {
            error!("[SPLIT] {} failed: {}", failure.unit, failure.reason);
        }
        if !self.cancelled.is_empty() {
            warn!("[SPLIT] {} unit(s) cancelled", self.cancelled.len());
        }
    }

    /// Writes the summary as pretty JSON.
    pub fn write_json(&self, path: &Path) -> Result<(), AppError> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| AppError::Internal(format!("Failed to encode summary: {}", e)))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                AppError::Io(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
        write_atomic(path, &bytes)?;
        Ok(())
    }
}
