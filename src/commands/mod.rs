//! Command handlers behind the `sheetsplit` subcommands.

mod emit;
pub mod generate;
pub mod split;
pub mod staged;

pub use generate::{run_generate, GenerateConfig, GenerateReport};
pub use split::{plan_split, run_split, NamedTarget, PlanReport};
pub use staged::{run_staged, saved_db_path, STAGING_DB_FILE};
