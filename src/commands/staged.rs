//! Two-phase mode.
//!
//! Ingestion stages every input group into SQLite in parallel, one unit per
//! group. Emission then plans from the staged counts and writes each output
//! target from the staging store. A group that failed to stage counts as
//! empty, so the rest are still written and the run reports the failure.
//! The stages are connected only through the database, so either can be
//! retried on its own: completed groups are skipped on re-run, and a run whose
//! input is gone can still emit from a completed staging database.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::emit::{target_units, StagedSegments};
use super::split::{analyze_source, open_source};
use crate::config::{SplitConfig, StagingConfig};
use crate::error::AppError;
use crate::execution::{RunMode, RunSummary, UnitKind, UnitResult, WorkUnit};
use crate::partition::{plan, InputGroup, SourceAnalysis};
use crate::state::RunState;
use crate::storage::{
    StagedGroup, StagingStore, META_EMITTED_COUNTS, META_SCHEMA, META_SOURCE_PATH,
};
use crate::streaming::{ChunkConfig, ChunkedReader};
use crate::workbook::RecordSource;

/// File name of the staging database kept next to the outputs.
pub const STAGING_DB_FILE: &str = "staging.db";

/// Runs a two-phase split.
///
/// # Errors
///
/// Returns an error only when the run cannot start: invalid options, an
/// unusable staging database, or an input that is unreadable while the
/// staging database holds no completed ingestion. Unit failures are reported
/// in the returned summary.
pub async fn run_staged(
    config: SplitConfig,
    cancel: CancellationToken,
) -> Result<RunSummary, AppError> {
    let started = Instant::now();
    let staging = config.staging.clone().unwrap_or_default();
    let state = RunState::new(config, cancel)?;

    let (store, temp_dir) = open_store(&staging).await?;
    let outcome = stage_and_emit(&state, &store).await;

    let output_dir = state.config.output_dir.clone();
    let release =
        tokio::task::spawn_blocking(move || release_store(store, temp_dir, &staging, &output_dir))
            .await
            .map_err(|e| AppError::Internal(format!("Staging cleanup task failed: {}", e)))
            .and_then(|result| result);
    if let Err(e) = release {
        error!("[STAGING] {}", e);
    }

    let mut summary = outcome?;
    summary.finish(started.elapsed());
    summary.log();
    Ok(summary)
}

async fn open_store(staging: &StagingConfig) -> Result<(StagingStore, Option<TempDir>), AppError> {
    match &staging.db_path {
        Some(path) => {
            info!("[STAGING] Using staging database {}", path.display());
            Ok((StagingStore::init(path.clone()).await?, None))
        }
        None => {
            let dir = tempfile::Builder::new()
                .prefix("sheetsplit-")
                .tempdir()
                .map_err(|e| {
                    AppError::Io(format!("Failed to create temporary directory: {}", e))
                })?;
            let store = StagingStore::init(dir.path().join(STAGING_DB_FILE)).await?;
            debug!(path = %store.db_path().display(), "Temporary staging database created");
            Ok((store, Some(dir)))
        }
    }
}

/// Applies the database lifecycle once the run is over.
///
/// A temporary database is copied to `<output_dir>/staging.db` unless it is to
/// be deleted. An explicit database is kept for reuse unless it is to be
/// deleted.
fn release_store(
    store: StagingStore,
    temp_dir: Option<TempDir>,
    staging: &StagingConfig,
    output_dir: &Path,
) -> Result<(), AppError> {
    match temp_dir {
        Some(_dir) if staging.delete_after_run => {
            info!("[STAGING] Temporary staging database removed");
            Ok(())
        }
        Some(_dir) => {
            let dest = saved_db_path(output_dir);
            store.copy_to(&dest)?;
            info!("[STAGING] Staging database saved to {}", dest.display());
            Ok(())
        }
        None if staging.delete_after_run => {
            let path = store.db_path().to_path_buf();
            store.remove()?;
            info!("[STAGING] Removed staging database {}", path.display());
            Ok(())
        }
        None => {
            info!(
                "[STAGING] Keeping staging database {} for reuse",
                store.db_path().display()
            );
            Ok(())
        }
    }
}

async fn stage_and_emit(state: &RunState, store: &StagingStore) -> Result<RunSummary, AppError> {
    let capacity = state.config.capacity()?;

    let (groups, plan, mut summary) = match open_source(&state.config.input).await {
        Ok(source) => {
            let analysis = analyze_source(Arc::clone(&source)).await?;
            let results = ingest(state, store, source, &analysis).await?;

            let groups = contributing_groups(&analysis.groups, &store.group_states().await?);
            let plan = plan(&groups, &capacity);
            let mut summary = RunSummary::new(RunMode::Staged, &plan);
            summary.record_ingestion(&results);

            if !summary.cancelled.is_empty() {
                warn!(
                    "[STAGING] Ingestion cancelled ({} unit(s)); skipping emission",
                    summary.cancelled.len()
                );
                return Ok(summary);
            }
            if !summary.ingest_failed.is_empty() {
                warn!(
                    "[STAGING] {} sheet(s) failed to stage ({}); emitting the rest",
                    summary.ingest_failed.len(),
                    summary.ingest_failed.join(", ")
                );
            }
            (groups, plan, summary)
        }
        Err(AppError::SourceUnreadable(reason)) => {
            let staged = completed_groups(store.group_states().await?).filter(|g| !g.is_empty());
            let Some(groups) = staged else {
                return Err(AppError::SourceUnreadable(reason));
            };
            let source = store.metadata(META_SOURCE_PATH)?.unwrap_or_default();
            warn!(
                "[STAGING] Input unreadable ({}); emitting from the staging database (staged from '{}')",
                reason, source
            );
            let plan = plan(&groups, &capacity);
            let mut summary = RunSummary::new(RunMode::Staged, &plan);
            summary.groups_staged = Some(0);
            (groups, plan, summary)
        }
        Err(e) => return Err(e),
    };

    if plan.is_empty() {
        info!("[STAGING] Staged input holds no records; nothing to write");
        return Ok(summary);
    }

    let counts = serde_json::to_string(&groups.iter().map(|g| g.record_count).collect::<Vec<_>>())
        .map_err(|e| AppError::Internal(format!("Failed to encode record counts: {}", e)))?;
    let check = store.clone();
    let check_counts = counts.clone();
    let rewrite =
        tokio::task::spawn_blocking(move || emitted_counts_changed(&check, &check_counts))
            .await
            .map_err(|e| AppError::Internal(format!("Staging metadata task failed: {}", e)))??;
    if rewrite {
        info!(
            "[STAGING] Record counts changed since the last emission; rewriting every output sheet"
        );
    }

    tokio::fs::create_dir_all(&state.config.output_dir)
        .await
        .map_err(|e| AppError::Io(format!("Failed to create output directory: {}", e)))?;

    let units = target_units(
        state,
        &plan,
        &groups,
        Arc::new(StagedSegments::new(store.clone())),
        rewrite,
    );
    let results = state.coordinator.run(units).await;
    summary.record_emission(&results);

    if rewrite && results.iter().all(|r| r.is_completed()) {
        let record = store.clone();
        tokio::task::spawn_blocking(move || record.set_metadata(META_EMITTED_COUNTS, &counts))
            .await
            .map_err(|e| AppError::Internal(format!("Staging metadata task failed: {}", e)))??;
    }
    Ok(summary)
}

/// Compares the per-group counts about to be emitted with the recorded ones.
///
/// The first emission records its counts up front. A later emission with
/// different counts must rewrite its targets, since the stored extents were
/// planned from other counts; its counts are recorded once it has completed.
fn emitted_counts_changed(store: &StagingStore, counts: &str) -> Result<bool, AppError> {
    match store.metadata(META_EMITTED_COUNTS)? {
        Some(previous) => Ok(previous != counts),
        None => {
            store.set_metadata(META_EMITTED_COUNTS, counts)?;
            Ok(false)
        }
    }
}

/// The analyzed groups as emission sees them. A group that did not complete
/// staging contributes no records, so the groups after it move up.
fn contributing_groups(groups: &[InputGroup], staged: &[StagedGroup]) -> Vec<InputGroup> {
    let staged: HashMap<usize, &StagedGroup> =
        staged.iter().map(|group| (group.rank, group)).collect();

    groups
        .iter()
        .map(|group| {
            let record_count = staged
                .get(&group.rank)
                .filter(|s| s.is_complete() && s.name == group.name)
                .map_or(0, |s| s.staged_rows);
            InputGroup {
                record_count,
                ..group.clone()
            }
        })
        .collect()
}

/// Input groups rebuilt from the staging database, if every staged group is
/// complete and the ranks are contiguous from zero.
fn completed_groups(staged: Vec<StagedGroup>) -> Option<Vec<InputGroup>> {
    let complete = staged
        .iter()
        .enumerate()
        .all(|(i, group)| group.rank == i && group.is_complete());
    if !complete {
        return None;
    }

    Some(
        staged
            .into_iter()
            .map(|group| InputGroup {
                name: group.name,
                rank: group.rank,
                record_count: group.staged_rows,
                schema: group.header,
            })
            .collect(),
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Ingestion
// ─────────────────────────────────────────────────────────────────────────────

async fn ingest(
    state: &RunState,
    store: &StagingStore,
    source: Arc<dyn RecordSource>,
    analysis: &SourceAnalysis,
) -> Result<Vec<UnitResult>, AppError> {
    let input = state.config.input.display().to_string();
    let schema = serde_json::to_string(&analysis.schema)
        .map_err(|e| AppError::Internal(format!("Failed to encode schema: {}", e)))?;
    let rank_count = analysis.groups.len();

    let prepare = store.clone();
    let previous = tokio::task::spawn_blocking(move || {
        prepare.set_metadata(META_SOURCE_PATH, &input)?;
        prepare.set_metadata(META_SCHEMA, &schema)?;
        prepare.retain_ranks(rank_count)?;
        prepare.group_states_blocking()
    })
    .await
    .map_err(|e| AppError::Internal(format!("Staging setup task failed: {}", e)))??;

    let previous: HashMap<usize, StagedGroup> = previous
        .into_iter()
        .map(|group| (group.rank, group))
        .collect();

    let units: Vec<WorkUnit> = analysis
        .groups
        .iter()
        .filter(|group| {
            let staged = previous
                .get(&group.rank)
                .is_some_and(|prev| already_staged(prev, group));
            if staged {
                info!("[STAGING] Sheet '{}' already staged; skipping", group.name);
            }
            !staged
        })
        .map(|group| {
            ingest_unit(
                store.clone(),
                Arc::clone(&source),
                group.clone(),
                state.chunk(),
            )
        })
        .collect();

    info!("[STAGING] Ingesting {} sheet(s)", units.len());
    Ok(state.coordinator.run(units).await)
}

/// A staged group matches the input group it would be ingested from.
fn already_staged(staged: &StagedGroup, group: &InputGroup) -> bool {
    staged.is_complete()
        && staged.name == group.name
        && staged.expected_rows == group.record_count
        && staged.header == group.schema
}

fn ingest_unit(
    store: StagingStore,
    source: Arc<dyn RecordSource>,
    group: InputGroup,
    chunk: ChunkConfig,
) -> WorkUnit {
    let label = format!("stage {}", group.name);
    let kind = UnitKind::Group {
        rank: group.rank,
        name: group.name.clone(),
    };

    WorkUnit::new(label, kind, move |cancel| {
        let result = stage_group(&store, source.as_ref(), &group, chunk, cancel);
        if let Err(e) = &result {
            if let Err(mark) = store.fail_group(group.rank, &e.to_string()) {
                error!(
                    "[STAGING] Failed to record failure of '{}': {}",
                    group.name, mark
                );
            }
        }
        result
    })
}

fn stage_group(
    store: &StagingStore,
    source: &dyn RecordSource,
    group: &InputGroup,
    chunk: ChunkConfig,
    cancel: &CancellationToken,
) -> Result<u64, AppError> {
    store.begin_group(group.rank, &group.name, &group.schema, group.record_count)?;

    let mut next_row = 0u64;
    for batch in ChunkedReader::open(source, group, 0, group.record_count, chunk)? {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        let batch = batch?;
        store.append(group.rank, next_row, &batch)?;
        next_row += batch.len() as u64;
    }

    store.complete_group(group.rank)?;
    debug!(group = %group.name, rank = group.rank, rows = next_row, "Group staged");
    Ok(next_row)
}

/// Default location of a kept staging database for `output_dir`.
pub fn saved_db_path(output_dir: &Path) -> PathBuf {
    output_dir.join(STAGING_DB_FILE)
}
