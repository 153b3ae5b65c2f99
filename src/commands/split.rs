//! Direct segment mode and dry-run planning.
//!
//! Direct mode analyzes the input, plans the segments and runs one emission
//! unit per output target, reading each segment straight from the input.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::emit::{target_units, DirectSegments};
use crate::config::SplitConfig;
use crate::error::AppError;
use crate::execution::{RunMode, RunSummary};
use crate::partition::{analyze, plan, InputGroup, PartitionPlan, PlanTarget, SourceAnalysis};
use crate::state::RunState;
use crate::workbook::{CsvWorkbook, RecordSource};

/// Opens the input workbook on a blocking thread.
pub(crate) async fn open_source(input: &Path) -> Result<Arc<dyn RecordSource>, AppError> {
    let input = input.to_path_buf();
    let workbook = tokio::task::spawn_blocking(move || CsvWorkbook::open(input))
        .await
        .map_err(|e| AppError::Internal(format!("Open task failed: {}", e)))??;
    Ok(Arc::new(workbook))
}

/// Analyzes a source on a blocking thread.
pub(crate) async fn analyze_source(
    source: Arc<dyn RecordSource>,
) -> Result<SourceAnalysis, AppError> {
    let analysis = tokio::task::spawn_blocking(move || analyze(source.as_ref()))
        .await
        .map_err(|e| AppError::Internal(format!("Analysis task failed: {}", e)))??;

    for name in &analysis.header_mismatches {
        warn!(
            "[SPLIT] Sheet '{}' has a different header; its rows are copied as-is",
            name
        );
    }
    Ok(analysis)
}

// ─────────────────────────────────────────────────────────────────────────────
// Direct mode
// ─────────────────────────────────────────────────────────────────────────────

/// Runs a direct-mode split.
///
/// # Errors
///
/// Returns an error only when the run cannot start (invalid options, an
/// unreadable input, a failed analysis). Unit failures are reported in the
/// returned summary.
pub async fn run_split(
    config: SplitConfig,
    cancel: CancellationToken,
) -> Result<RunSummary, AppError> {
    let started = Instant::now();
    let state = RunState::new(config, cancel)?;

    let source = open_source(&state.config.input).await?;
    let analysis = analyze_source(Arc::clone(&source)).await?;
    let plan = plan(&analysis.groups, &state.config.capacity()?);

    let mut summary = RunSummary::new(RunMode::Direct, &plan);
    if plan.is_empty() {
        info!("[SPLIT] Input holds no records; nothing to write");
        summary.finish(started.elapsed());
        summary.log();
        return Ok(summary);
    }

    tokio::fs::create_dir_all(&state.config.output_dir)
        .await
        .map_err(|e| AppError::Io(format!("Failed to create output directory: {}", e)))?;

    let units = target_units(
        &state,
        &plan,
        &analysis.groups,
        Arc::new(DirectSegments::new(source)),
        false,
    );
    let results = state.coordinator.run(units).await;

    summary.record_emission(&results);
    summary.finish(started.elapsed());
    summary.log();
    Ok(summary)
}

// ─────────────────────────────────────────────────────────────────────────────
// Dry run
// ─────────────────────────────────────────────────────────────────────────────

/// Output of the `plan` command.
#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub input: PathBuf,
    pub groups: Vec<InputGroup>,
    pub header_mismatches: Vec<String>,
    pub plan: PartitionPlan,
    pub targets: Vec<NamedTarget>,
}

/// A planned target with its artifact and group names.
#[derive(Debug, Clone, Serialize)]
pub struct NamedTarget {
    pub artifact_name: String,
    pub group_name: String,
    #[serde(flatten)]
    pub target: PlanTarget,
}

/// Analyzes and plans without writing anything.
pub async fn plan_split(config: &SplitConfig) -> Result<PlanReport, AppError> {
    config.validate()?;

    let source = open_source(&config.input).await?;
    let analysis = analyze_source(source).await?;
    let plan = plan(&analysis.groups, &config.capacity()?);

    let targets = plan
        .targets()
        .into_iter()
        .map(|target| NamedTarget {
            artifact_name: config.naming.artifact_name(target.target.artifact),
            group_name: config.naming.group_name(target.target.group),
            target,
        })
        .collect();

    Ok(PlanReport {
        input: config.input.clone(),
        groups: analysis.groups,
        header_mismatches: analysis.header_mismatches,
        plan,
        targets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workbook::Record;
    use std::fs;
    use tempfile::TempDir;

    /// Writes a manifest-less input workbook with numbered rows.
    fn write_input(dir: &Path, groups: &[(&str, usize)]) -> PathBuf {
        let input = dir.join("input");
        fs::create_dir_all(&input).expect("create input");
        for (name, rows) in groups {
            let mut content = String::from("serial,qri\n");
            for i in 0..*rows {
                content.push_str(&format!("{}{},q{}\n", name, i, i));
            }
            fs::write(input.join(format!("{}.csv", name)), content).expect("write group");
        }
        input
    }

    fn read_group(dir: &Path, group: &str) -> Vec<Record> {
        let workbook = CsvWorkbook::open(dir).expect("open output");
        workbook
            .open_group_reader(group)
            .expect("reader")
            .rows
            .map(|r| r.expect("row"))
            .collect()
    }

    fn serials(records: &[Record]) -> Vec<String> {
        records.iter().map(|r| r[0].clone()).collect()
    }

    fn expected(name: &str, range: std::ops::Range<usize>) -> Vec<String> {
        range.map(|i| format!("{}{}", name, i)).collect()
    }

    fn worked_config(dir: &TempDir) -> SplitConfig {
        let input = write_input(dir.path(), &[("A", 7), ("B", 5)]);
        SplitConfig::new(input, dir.path().join("out"))
            .groups_per_artifact(2)
            .records_per_group(4)
            .chunk_records(2)
            .workers(3)
    }

    #[tokio::test]
    async fn worked_example_direct_mode() {
        let dir = TempDir::new().expect("temp dir");
        let config = worked_config(&dir);
        let out = config.output_dir.clone();

        let summary = run_split(config, CancellationToken::new())
            .await
            .expect("run");
        assert!(summary.is_success(), "summary: {:?}", summary);
        assert_eq!(summary.written_targets, 3);
        assert_eq!(summary.written_artifacts, 2);
        assert_eq!(summary.records_written, 12);

        assert_eq!(
            serials(&read_group(&out.join("output_1"), "Sheet_1")),
            expected("A", 0..4)
        );
        let mut topped_off = expected("A", 4..7);
        topped_off.extend(expected("B", 0..1));
        assert_eq!(
            serials(&read_group(&out.join("output_1"), "Sheet_2")),
            topped_off
        );
        assert_eq!(
            serials(&read_group(&out.join("output_2"), "Sheet_1")),
            expected("B", 1..5)
        );
        assert!(!out.join("output_3").exists());
    }

    #[tokio::test]
    async fn rerun_is_a_no_op() {
        let dir = TempDir::new().expect("temp dir");
        let config = worked_config(&dir);
        let out = config.output_dir.clone();

        run_split(config.clone(), CancellationToken::new())
            .await
            .expect("first run");
        let first = fs::read(out.join("output_1").join("Sheet_2.csv")).expect("read");

        let summary = run_split(config, CancellationToken::new())
            .await
            .expect("second run");
        assert!(summary.is_success());
        let second = fs::read(out.join("output_1").join("Sheet_2.csv")).expect("read");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn round_trip_preserves_order() {
        let dir = TempDir::new().expect("temp dir");
        let groups = [("G1", 13), ("G2", 0), ("G3", 29), ("G4", 8)];
        let input = write_input(dir.path(), &groups);
        let out = dir.path().join("out");
        let config = SplitConfig::new(input, &out)
            .groups_per_artifact(3)
            .records_per_group(5)
            .chunk_records(3)
            .workers(4);

        let summary = run_split(config, CancellationToken::new())
            .await
            .expect("run");
        assert!(summary.is_success());
        assert_eq!(summary.planned_targets, 10);
        assert_eq!(summary.planned_artifacts, 4);

        let mut concatenated = Vec::new();
        for artifact in 1..=4 {
            let dir = out.join(format!("output_{}", artifact));
            let workbook = CsvWorkbook::open(&dir).expect("open artifact");
            for group in workbook.list_groups().expect("groups") {
                assert!(workbook.count_rows(&group).expect("count") <= 5);
                concatenated.extend(serials(&read_group(&dir, &group)));
            }
        }

        let mut all = Vec::new();
        for (name, rows) in groups {
            all.extend(expected(name, 0..rows));
        }
        assert_eq!(concatenated, all);
    }

    #[tokio::test]
    async fn empty_input_writes_nothing() {
        let dir = TempDir::new().expect("temp dir");
        let input = write_input(dir.path(), &[("A", 0)]);
        let out = dir.path().join("out");

        let summary = run_split(SplitConfig::new(input, &out), CancellationToken::new())
            .await
            .expect("run");
        assert!(summary.is_success());
        assert_eq!(summary.planned_artifacts, 0);
        assert!(!out.exists());
    }

    /// Collects formatted log output of the current thread.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("log buffer").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn empty_input_still_logs_the_run() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let dir = TempDir::new().expect("temp dir");
        let input = write_input(dir.path(), &[("A", 0)]);
        let summary = run_split(
            SplitConfig::new(input, dir.path().join("out")),
            CancellationToken::new(),
        )
        .await
        .expect("run");

        let output = String::from_utf8(logs.0.lock().expect("log buffer").clone()).expect("utf-8");
        assert!(
            output.contains(&format!("[SPLIT] Run {}", summary.run_id)),
            "logs: {}",
            output
        );
    }

    #[tokio::test]
    async fn missing_input_is_source_unreadable() {
        let dir = TempDir::new().expect("temp dir");
        let config = SplitConfig::new(dir.path().join("nope"), dir.path().join("out"));
        let err = run_split(config, CancellationToken::new())
            .await
            .expect_err("missing input");
        assert!(matches!(err, AppError::SourceUnreadable(_)));
    }

    #[tokio::test]
    async fn input_file_names_are_kept_verbatim() {
        let dir = TempDir::new().expect("temp dir");
        let input = write_input(dir.path(), &[("sales(2023)", 3)]);
        let out = dir.path().join("out");

        let summary = run_split(SplitConfig::new(input, &out), CancellationToken::new())
            .await
            .expect("run");
        assert!(summary.is_success(), "summary: {:?}", summary);
        assert_eq!(
            serials(&read_group(&out.join("output_1"), "Sheet_1")),
            expected("sales(2023)", 0..3)
        );
    }

    #[tokio::test]
    async fn non_utf8_input_fails_before_writing() {
        let dir = TempDir::new().expect("temp dir");
        let input = dir.path().join("input");
        fs::create_dir_all(&input).expect("create input");
        fs::write(input.join("A.csv"), b"serial,city\na,M\xfcnchen\n").expect("write");
        let out = dir.path().join("out");

        let err = run_split(SplitConfig::new(input, &out), CancellationToken::new())
            .await
            .expect_err("latin-1 input");
        assert!(
            matches!(err, AppError::SourceUnreadable(_)),
            "got {:?}",
            err
        );
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn cancelled_run_reports_cancelled_units() {
        let dir = TempDir::new().expect("temp dir");
        let config = worked_config(&dir);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = run_split(config, cancel).await.expect("run");
        assert!(!summary.is_success());
        assert_eq!(summary.cancelled.len(), 3);
        assert!(matches!(summary.error(), Some(AppError::Cancelled)));
    }

    #[tokio::test]
    async fn plan_report_names_targets() {
        let dir = TempDir::new().expect("temp dir");
        let config = worked_config(&dir);

        let report = plan_split(&config).await.expect("plan");
        assert_eq!(report.plan.artifacts, 2);
        assert_eq!(report.targets.len(), 3);
        assert_eq!(report.targets[2].artifact_name, "output_2");
        assert_eq!(report.targets[2].group_name, "Sheet_1");
        assert!(!config.output_dir.exists(), "dry run writes nothing");

        let json = serde_json::to_value(&report).expect("serialize");
        assert_eq!(json["targets"][1]["records"], 4);
    }
}
