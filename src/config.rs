//! Run configuration.
//!
//! Built from command line arguments by the binary, or directly by library
//! callers through the builder-style setters. `validate()` is called before
//! any I/O.

use std::path::PathBuf;

use serde::Serialize;

use crate::error::AppError;
use crate::partition::CapacityPolicy;
use crate::streaming::ChunkConfig;
use crate::workbook::ArtifactId;

/// Default output groups per artifact.
pub const DEFAULT_GROUPS_PER_ARTIFACT: u64 = 3;

/// Default data records per output group.
pub const DEFAULT_RECORDS_PER_GROUP: u64 = 40_000;

// ─────────────────────────────────────────────────────────────────────────────
// Output naming
// ─────────────────────────────────────────────────────────────────────────────

/// Names of output artifacts and of the groups inside them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputNaming {
    /// Artifact `n` is named `<artifact_prefix>_<n>`.
    pub artifact_prefix: String,
    /// Group slot `k` is named `<group_prefix><k>`.
    pub group_prefix: String,
}

impl Default for OutputNaming {
    fn default() -> Self {
        Self {
            artifact_prefix: "output".to_string(),
            group_prefix: "Sheet_".to_string(),
        }
    }
}

impl OutputNaming {
    pub fn artifact_name(&self, artifact: ArtifactId) -> String {
        format!("{}_{}", self.artifact_prefix, artifact)
    }

    pub fn group_name(&self, slot: u64) -> String {
        format!("{}{}", self.group_prefix, slot)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Staging
// ─────────────────────────────────────────────────────────────────────────────

/// Two-phase mode settings.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StagingConfig {
    /// Database to create or reuse. `None` uses a temporary database.
    pub db_path: Option<PathBuf>,
    /// Remove the database once the run finishes.
    pub delete_after_run: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// SplitConfig
// ─────────────────────────────────────────────────────────────────────────────

/// Everything a split run needs.
#[derive(Debug, Clone, Serialize)]
pub struct SplitConfig {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub groups_per_artifact: u64,
    pub records_per_group: u64,
    pub chunk: ChunkConfig,
    pub workers: usize,
    pub naming: OutputNaming,
    pub staging: Option<StagingConfig>,
}

impl SplitConfig {
    /// Creates a direct-mode configuration with defaults.
    pub fn new(input: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output_dir: output_dir.into(),
            groups_per_artifact: DEFAULT_GROUPS_PER_ARTIFACT,
            records_per_group: DEFAULT_RECORDS_PER_GROUP,
            chunk: ChunkConfig::default(),
            workers: default_workers(),
            naming: OutputNaming::default(),
            staging: None,
        }
    }

    pub fn groups_per_artifact(mut self, groups: u64) -> Self {
        self.groups_per_artifact = groups;
        self
    }

    pub fn records_per_group(mut self, records: u64) -> Self {
        self.records_per_group = records;
        self
    }

    pub fn chunk_records(mut self, records: u64) -> Self {
        self.chunk = self.chunk.max_records(records);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn naming(mut self, naming: OutputNaming) -> Self {
        self.naming = naming;
        self
    }

    pub fn staging(mut self, staging: StagingConfig) -> Self {
        self.staging = Some(staging);
        self
    }

    /// Returns the capacity policy, validating both limits.
    pub fn capacity(&self) -> Result<CapacityPolicy, AppError> {
        CapacityPolicy::new(self.groups_per_artifact, self.records_per_group)
    }

    /// Rejects configurations that cannot produce a valid run.
    pub fn validate(&self) -> Result<(), AppError> {
        self.capacity()?;

        if self.chunk.max_records == 0 {
            return Err(AppError::InvalidConfig(
                "chunk size must be at least 1 record".into(),
            ));
        }
        if self.chunk.max_bytes == 0 {
            return Err(AppError::InvalidConfig(
                "chunk byte budget must be at least 1 byte".into(),
            ));
        }
        if self.workers == 0 {
            return Err(AppError::InvalidConfig(
                "worker count must be at least 1".into(),
            ));
        }
        if self.naming.artifact_prefix.is_empty() || self.naming.group_prefix.is_empty() {
            return Err(AppError::InvalidConfig(
                "artifact and group prefixes must not be empty".into(),
            ));
        }
        let is_separator = |c: char| c == '/' || c == '\\';
        if self.naming.group_prefix.contains(is_separator)
            || self.naming.artifact_prefix.contains(is_separator)
        {
            return Err(AppError::InvalidConfig(
                "artifact and group prefixes must not contain path separators".into(),
            ));
        }

        Ok(())
    }
}

/// Available cores minus one, leaving a core for the rest of the system.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SplitConfig::new("in.csv", "out");
        config.validate().expect("defaults should validate");
        assert_eq!(config.groups_per_artifact, 3);
        assert_eq!(config.records_per_group, 40_000);
        assert!(config.workers >= 1);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = SplitConfig::new("in.csv", "out")
            .records_per_group(0)
            .validate()
            .expect_err("zero records per group");
        assert!(matches!(err, AppError::InvalidConfig(_)));

        let err = SplitConfig::new("in.csv", "out")
            .groups_per_artifact(0)
            .validate()
            .expect_err("zero groups per artifact");
        assert!(matches!(err, AppError::InvalidConfig(_)));
    }

    #[test]
    fn zero_chunk_and_workers_are_rejected() {
        assert!(SplitConfig::new("in", "out")
            .chunk_records(0)
            .validate()
            .is_err());
        assert!(SplitConfig::new("in", "out").workers(0).validate().is_err());
    }

    #[test]
    fn prefixes_with_separators_are_rejected() {
        let naming = OutputNaming {
            artifact_prefix: "../escape".into(),
            group_prefix: "Sheet_".into(),
        };
        assert!(SplitConfig::new("in", "out")
            .naming(naming)
            .validate()
            .is_err());
    }

    #[test]
    fn naming_formats_artifacts_and_groups() {
        let naming = OutputNaming::default();
        assert_eq!(naming.artifact_name(2), "output_2");
        assert_eq!(naming.group_name(3), "Sheet_3");
    }
}
