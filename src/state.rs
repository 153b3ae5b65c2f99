//! Shared state of one split run.
//!
//! Built once per run from a validated [`SplitConfig`] and shared by every
//! work unit through `Arc`s.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::SplitConfig;
use crate::error::AppError;
use crate::execution::{Coordinator, WorkerPool};
use crate::partition::OutputTarget;
use crate::streaming::{ChunkConfig, Consolidator};
use crate::workbook::{ArtifactSink, CsvWorkbookSink};

// ─────────────────────────────────────────────────────────────────────────────
// Run State
// ─────────────────────────────────────────────────────────────────────────────

pub struct RunState {
    pub config: SplitConfig,
    /// Output writer shared by all target units.
    pub consolidator: Arc<Consolidator>,
    pub coordinator: Coordinator,
}

impl RunState {
    /// Validates `config` and builds the output side of the run.
    pub fn new(config: SplitConfig, cancel: CancellationToken) -> Result<Self, AppError> {
        config.validate()?;

        let sink: Arc<dyn ArtifactSink> = Arc::new(CsvWorkbookSink::new(
            &config.output_dir,
            config.naming.clone(),
        ));
        let consolidator = Arc::new(Consolidator::new(sink, config.naming.clone()));
        let coordinator = Coordinator::new(WorkerPool::new(config.workers)?, cancel);

        Ok(Self {
            config,
            consolidator,
            coordinator,
        })
    }

    pub fn chunk(&self) -> ChunkConfig {
        self.config.chunk
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        self.coordinator.cancel_token()
    }

    /// `<artifact>/<group>` label of a target, used in logs and summaries.
    pub fn target_label(&self, target: OutputTarget) -> String {
        format!(
            "{}/{}",
            self.config.naming.artifact_name(target.artifact),
            self.config.naming.group_name(target.group)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn invalid_config_is_rejected() {
        let dir = TempDir::new().expect("temp dir");
        let config = SplitConfig::new(dir.path(), dir.path()).records_per_group(0);
        assert!(matches!(
            RunState::new(config, CancellationToken::new()),
            Err(AppError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn labels_follow_naming() {
        let dir = TempDir::new().expect("temp dir");
        let state = RunState::new(
            SplitConfig::new(dir.path(), dir.path()),
            CancellationToken::new(),
        )
        .expect("state");
        assert_eq!(
            state.target_label(OutputTarget {
                artifact: 2,
                group: 3
            }),
            "output_2/Sheet_3"
        );
    }
}
