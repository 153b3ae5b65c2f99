//! Synthetic input workbooks for benchmarks and tests.

use std::path::{Path, PathBuf};
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::AppError;
use crate::streaming::AtomicCsvWriter;
use crate::workbook::{GroupEntry, Manifest};

/// Upper bound (exclusive) of generated cell values.
const MAX_VALUE: u32 = 1_000_000;

/// Shape of a generated workbook.
#[derive(Debug, Clone, Serialize)]
pub struct GenerateConfig {
    pub output: PathBuf,
    pub groups: u64,
    pub rows: u64,
    pub columns: u64,
    /// Fixed seed for reproducible output.
    pub seed: Option<u64>,
}

impl GenerateConfig {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
            groups: 5,
            rows: 50_000,
            columns: 2,
            seed: None,
        }
    }

    pub fn groups(mut self, groups: u64) -> Self {
        self.groups = groups;
        self
    }

    pub fn rows(mut self, rows: u64) -> Self {
        self.rows = rows;
        self
    }

    pub fn columns(mut self, columns: u64) -> Self {
        self.columns = columns;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// What `generate` wrote.
#[derive(Debug, Clone, Serialize)]
pub struct GenerateReport {
    pub output: PathBuf,
    pub groups: u64,
    pub records: u64,
    pub bytes: u64,
    pub elapsed_ms: u64,
}

/// Writes a workbook of `groups` sheets named `Sheet_<i>`, each holding `rows`
/// records of `columns` random integers under columns `Column_<j>`.
pub async fn run_generate(config: GenerateConfig) -> Result<GenerateReport, AppError> {
    tokio::task::spawn_blocking(move || generate_workbook(&config))
        .await
        .map_err(|e| AppError::Internal(format!("Generate task failed: {}", e)))?
}

fn generate_workbook(config: &GenerateConfig) -> Result<GenerateReport, AppError> {
    if config.columns == 0 {
        return Err(AppError::InvalidConfig(
            "a generated workbook needs at least 1 column".into(),
        ));
    }

    let started = Instant::now();
    std::fs::create_dir_all(&config.output).map_err(|e| {
        AppError::Io(format!(
            "Failed to create {}: {}",
            config.output.display(),
            e
        ))
    })?;

    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let header: Vec<String> = (1..=config.columns)
        .map(|j| format!("Column_{}", j))
        .collect();

    let mut manifest = Manifest::default();
    for i in 1..=config.groups {
        let name = format!("Sheet_{}", i);
        let entry = write_group(&config.output, &name, &header, config.rows, &mut rng)?;
        info!("[GENERATE] Wrote sheet {}/{}", i, config.groups);
        manifest.groups.push(entry);
    }
    manifest.save(&config.output)?;

    let report = GenerateReport {
        output: config.output.clone(),
        groups: config.groups,
        records: config.groups * config.rows,
        bytes: manifest.groups.iter().map(|g| g.bytes).sum(),
        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    };
    info!(
        "[GENERATE] {} sheets, {} records written to {}",
        report.groups,
        report.records,
        report.output.display()
    );
    Ok(report)
}

fn write_group(
    dir: &Path,
    name: &str,
    header: &[String],
    rows: u64,
    rng: &mut StdRng,
) -> Result<GroupEntry, AppError> {
    let file = format!("{}.csv", name);
    let mut writer = AtomicCsvWriter::new(dir.join(&file))?;
    writer.write_record(header)?;

    let mut row = vec![String::new(); header.len()];
    for _ in 0..rows {
        for cell in row.iter_mut() {
            *cell = rng.gen_range(0..MAX_VALUE).to_string();
        }
        writer.write_record(&row)?;
    }

    let (path, bytes) = writer.finish()?;
    debug!(path = %path.display(), rows, bytes, "Generated group");

    Ok(GroupEntry {
        name: name.to_string(),
        file,
        header: header.to_vec(),
        rows,
        bytes,
    })
}
