//! `sheetsplit` command line.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sheetsplit::commands::{plan_split, run_generate, run_split, run_staged, GenerateConfig};
use sheetsplit::config::{
    default_workers, OutputNaming, SplitConfig, StagingConfig, DEFAULT_GROUPS_PER_ARTIFACT,
    DEFAULT_RECORDS_PER_GROUP,
};
use sheetsplit::error::AppError;
use sheetsplit::execution::RunSummary;
use sheetsplit::streaming::ChunkConfig;

/// Split large multi-sheet workbooks into bounded output workbooks
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Split reading segments straight from the input
    Split {
        input: PathBuf,
        output_dir: PathBuf,
        #[command(flatten)]
        options: SplitOptions,
    },
    /// Stage the input into SQLite, then split from the staging database
    Staged {
        input: PathBuf,
        output_dir: PathBuf,
        /// Staging database to create or reuse (default: a temporary database)
        #[arg(long)]
        staging_db: Option<PathBuf>,
        /// Delete the staging database after the run
        #[arg(long)]
        delete_staging: bool,
        #[command(flatten)]
        options: SplitOptions,
    },
    /// Print the partition plan as JSON without writing anything
    Plan {
        input: PathBuf,
        #[command(flatten)]
        options: SplitOptions,
    },
    /// Write a synthetic input workbook
    Generate {
        output: PathBuf,
        /// Number of sheets
        #[arg(long, default_value_t = 5)]
        groups: u64,
        /// Data rows per sheet
        #[arg(long, default_value_t = 50_000)]
        rows: u64,
        /// Columns per sheet
        #[arg(long, default_value_t = 2)]
        columns: u64,
        /// Seed for reproducible content
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[derive(Args, Debug)]
struct SplitOptions {
    /// Output sheets per output workbook
    #[arg(long, default_value_t = DEFAULT_GROUPS_PER_ARTIFACT)]
    groups_per_artifact: u64,

    /// Data rows per output sheet
    #[arg(long, default_value_t = DEFAULT_RECORDS_PER_GROUP)]
    records_per_group: u64,

    /// Records per read/write batch
    #[arg(long, default_value_t = ChunkConfig::default().max_records)]
    chunk_size: u64,

    /// Concurrent workers (default: available cores minus one)
    #[arg(long)]
    workers: Option<usize>,

    /// Output workbook name prefix
    #[arg(long, default_value = "output")]
    artifact_prefix: String,

    /// Output sheet name prefix
    #[arg(long, default_value = "Sheet_")]
    group_prefix: String,

    /// Write the run summary as JSON to this path
    #[arg(long)]
    summary_json: Option<PathBuf>,
}

impl SplitOptions {
    fn to_config(&self, input: PathBuf, output_dir: PathBuf) -> SplitConfig {
        SplitConfig::new(input, output_dir)
            .groups_per_artifact(self.groups_per_artifact)
            .records_per_group(self.records_per_group)
            .chunk_records(self.chunk_size)
            .workers(self.workers.unwrap_or_else(default_workers))
            .naming(OutputNaming {
                artifact_prefix: self.artifact_prefix.clone(),
                group_prefix: self.group_prefix.clone(),
            })
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("sheetsplit={}", cli.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; no new units will start");
            interrupt.cancel();
        }
    });

    match cli.command {
        Command::Split {
            input,
            output_dir,
            options,
        } => {
            let config = options.to_config(input, output_dir);
            let outcome = run_split(config, cancel).await;
            finish_run(outcome, options.summary_json.as_deref())
        }
        Command::Staged {
            input,
            output_dir,
            staging_db,
            delete_staging,
            options,
        } => {
            let config = options.to_config(input, output_dir).staging(StagingConfig {
                db_path: staging_db,
                delete_after_run: delete_staging,
            });
            let outcome = run_staged(config, cancel).await;
            finish_run(outcome, options.summary_json.as_deref())
        }
        Command::Plan { input, options } => {
            let config = options.to_config(input, PathBuf::new());
            match plan_split(&config).await {
                Ok(report) => {
                    let mut stdout = std::io::stdout().lock();
                    serde_json::to_writer_pretty(&mut stdout, &report)
                        .context("Failed to print the plan")?;
                    writeln!(stdout).context("Failed to print the plan")?;
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => Ok(fail(&e)),
            }
        }
        Command::Generate {
            output,
            groups,
            rows,
            columns,
            seed,
        } => {
            let mut config = GenerateConfig::new(output)
                .groups(groups)
                .rows(rows)
                .columns(columns);
            config.seed = seed;
            match run_generate(config).await {
                Ok(_) => Ok(ExitCode::SUCCESS),
                Err(e) => Ok(fail(&e)),
            }
        }
    }
}

/// Writes the optional JSON summary and turns the run outcome into an exit code.
fn finish_run(
    outcome: Result<RunSummary, AppError>,
    summary_json: Option<&Path>,
) -> Result<ExitCode> {
    let summary = match outcome {
        Ok(summary) => summary,
        Err(e) => return Ok(fail(&e)),
    };

    if let Some(path) = summary_json {
        summary
            .write_json(path)
            .with_context(|| format!("Failed to write summary to {}", path.display()))?;
    }

    match summary.error() {
        Some(e) => Ok(fail(&e)),
        None => Ok(ExitCode::SUCCESS),
    }
}

/// Prints a diagnostic for `error` and returns the failure exit code.
fn fail(error: &AppError) -> ExitCode {
    let presentation = error.to_presentation();
    eprintln!("error: {}: {}", presentation.title, presentation.message);
    eprintln!("  cause: {}", error);
    if let Some(action) = presentation.action {
        eprintln!("  hint: {}", action);
    }
    ExitCode::FAILURE
}
