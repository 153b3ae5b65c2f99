//! SQLite staging store for two-phase splits.
//!
//! Ingestion workers each own one input group and append its records keyed by
//! `(source_group_rank, row_num)`. Emission reads them back in that order
//! through the index, independently of insertion order. Every append is one
//! committed transaction, so staged rows are durable once `append` returns.

use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::AppError;
use crate::workbook::Record;

/// Current schema version. Increment when adding new migrations.
const SCHEMA_VERSION: i32 = 1;

/// V1 schema: staged rows, per-group ingestion state and run metadata.
const V1_SCHEMA: &str = r#"
-- One row per staged record
CREATE TABLE IF NOT EXISTS staged_rows (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_group_rank INTEGER NOT NULL,
    row_num INTEGER NOT NULL,
    fields TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_staged_rows_order ON staged_rows(source_group_rank, row_num);

-- Ingestion state of each input group
CREATE TABLE IF NOT EXISTS staged_groups (
    source_group_rank INTEGER PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    header TEXT NOT NULL,
    expected_rows INTEGER NOT NULL,
    staged_rows INTEGER NOT NULL DEFAULT 0,
    state TEXT NOT NULL,
    error_message TEXT,
    updated_at INTEGER NOT NULL
);

-- Run metadata (source path, schema)
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
"#;

/// Metadata key of the ingested source path.
pub const META_SOURCE_PATH: &str = "source_path";

/// Metadata key of the ingested schema (JSON array).
pub const META_SCHEMA: &str = "schema";

/// Metadata key of the per-group record counts last emitted (JSON array).
pub const META_EMITTED_COUNTS: &str = "emitted_counts";

// ─────────────────────────────────────────────────────────────────────────────
// Models
// ─────────────────────────────────────────────────────────────────────────────

/// Ingestion state of one input group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GroupState {
    Ingesting,
    Completed,
    Failed,
}

impl GroupState {
    pub fn as_str(self) -> &'static str {
        match self {
            GroupState::Ingesting => "ingesting",
            GroupState::Completed => "completed",
            GroupState::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Result<Self, AppError> {
        match value {
            "ingesting" => Ok(GroupState::Ingesting),
            "completed" => Ok(GroupState::Completed),
            "failed" => Ok(GroupState::Failed),
            other => Err(AppError::Staging(format!(
                "Unknown group state '{}'",
                other
            ))),
        }
    }
}

/// Staging record of one input group.
#[derive(Debug, Clone, Serialize)]
pub struct StagedGroup {
    pub rank: usize,
    pub name: String,
    pub header: Record,
    pub expected_rows: u64,
    pub staged_rows: u64,
    pub state: GroupState,
    pub error_message: Option<String>,
    pub updated_at: i64,
}

impl StagedGroup {
    /// Completed with every expected row staged.
    pub fn is_complete(&self) -> bool {
        self.state == GroupState::Completed && self.staged_rows == self.expected_rows
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// StagingStore
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to a staging database file. Each operation opens its own connection.
#[derive(Debug, Clone)]
pub struct StagingStore {
    db_path: PathBuf,
}

impl StagingStore {
    /// Opens (creating if needed) the staging database and runs migrations.
    pub async fn init(db_path: PathBuf) -> Result<Self, AppError> {
        let path = db_path.clone();

        tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    AppError::Staging(format!("Failed to create database directory: {e}"))
                })?;
            }

            let mut conn = Connection::open(&path)
                .map_err(|e| AppError::Staging(format!("Failed to open database: {e}")))?;

            configure_connection(&conn)?;
            run_migrations(&mut conn)?;

            Ok::<_, AppError>(())
        })
        .await
        .map_err(|e| AppError::Internal(format!("Staging init task failed: {e}")))??;

        debug!(path = %db_path.display(), "Staging database ready");
        Ok(Self { db_path })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection, AppError> {
        let conn = Connection::open(&self.db_path)
            .map_err(|e| AppError::Staging(format!("Failed to open database: {e}")))?;
        configure_connection(&conn)?;
        Ok(conn)
    }

    // ── Ingestion (blocking, called from worker units) ────────────────────────

    /// Marks a group as ingesting and removes any rows left by an earlier attempt.
    pub fn begin_group(
        &self,
        rank: usize,
        name: &str,
        header: &[String],
        expected_rows: u64,
    ) -> Result<(), AppError> {
        let mut conn = self.connect()?;
        let header = encode_record(header)?;

        let tx = conn
            .transaction()
            .map_err(|e| AppError::Staging(format!("Failed to start transaction: {e}")))?;

        tx.execute(
            "DELETE FROM staged_rows WHERE source_group_rank = ?1",
            params![rank as i64],
        )
        .map_err(|e| AppError::Staging(format!("Failed to clear staged rows: {e}")))?;

        tx.execute(
            r#"
            INSERT INTO staged_groups (source_group_rank, name, header, expected_rows, staged_rows, state, error_message, updated_at)
            VALUES (?1, ?2, ?3, ?4, 0, ?5, NULL, ?6)
            ON CONFLICT(source_group_rank) DO UPDATE SET
                name = excluded.name,
                header = excluded.header,
                expected_rows = excluded.expected_rows,
                staged_rows = 0,
                state = excluded.state,
                error_message = NULL,
                updated_at = excluded.updated_at
            "#,
            params![
                rank as i64,
                name,
                header,
                expected_rows as i64,
                GroupState::Ingesting.as_str(),
                current_timestamp(),
            ],
        )
        .map_err(|e| AppError::Staging(format!("Failed to record group start: {e}")))?;

        tx.commit()
            .map_err(|e| AppError::Staging(format!("Failed to commit group start: {e}")))?;

        Ok(())
    }

    /// Appends `rows` of group `rank`, numbered from `start_row`, in one
    /// transaction. Returns the group's staged row count afterwards.
    pub fn append(&self, rank: usize, start_row: u64, rows: &[Record]) -> Result<u64, AppError> {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction()
            .map_err(|e| AppError::Staging(format!("Failed to start transaction: {e}")))?;

        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO staged_rows (source_group_rank, row_num, fields) VALUES (?1, ?2, ?3)",
                )
                .map_err(|e| AppError::Staging(format!("Failed to prepare insert: {e}")))?;

            for (i, row) in rows.iter().enumerate() {
                stmt.execute(params![
                    rank as i64,
                    (start_row + i as u64) as i64,
                    encode_record(row)?
                ])
                .map_err(|e| AppError::Staging(format!("Failed to stage row: {e}")))?;
            }
        }

        tx.execute(
            "UPDATE staged_groups SET staged_rows = staged_rows + ?2, updated_at = ?3 WHERE source_group_rank = ?1",
            params![rank as i64, rows.len() as i64, current_timestamp()],
        )
        .map_err(|e| AppError::Staging(format!("Failed to update staged count: {e}")))?;

        let staged: i64 = tx
            .query_row(
                "SELECT staged_rows FROM staged_groups WHERE source_group_rank = ?1",
                params![rank as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| AppError::Staging(format!("Failed to read staged count: {e}")))?
            .ok_or_else(|| AppError::Staging(format!("Group {} was never started", rank)))?;

        tx.commit()
            .map_err(|e| AppError::Staging(format!("Failed to commit rows: {e}")))?;

        Ok(staged as u64)
    }

    /// Marks a group as completed.
    pub fn complete_group(&self, rank: usize) -> Result<(), AppError> {
        self.set_state(rank, GroupState::Completed, None)
    }

    /// Marks a group as failed and removes its rows, so it contributes nothing.
    pub fn fail_group(&self, rank: usize, message: &str) -> Result<(), AppError> {
        let conn = self.connect()?;
        conn.execute(
            "DELETE FROM staged_rows WHERE source_group_rank = ?1",
            params![rank as i64],
        )
        .map_err(|e| AppError::Staging(format!("Failed to clear staged rows: {e}")))?;

        conn.execute(
            "UPDATE staged_groups SET staged_rows = 0 WHERE source_group_rank = ?1",
            params![rank as i64],
        )
        .map_err(|e| AppError::Staging(format!("Failed to reset staged count: {e}")))?;

        self.set_state(rank, GroupState::Failed, Some(message))
    }

    fn set_state(
        &self,
        rank: usize,
        state: GroupState,
        message: Option<&str>,
    ) -> Result<(), AppError> {
        let conn = self.connect()?;
        let updated = conn
            .execute(
                "UPDATE staged_groups SET state = ?2, error_message = ?3, updated_at = ?4 WHERE source_group_rank = ?1",
                params![rank as i64, state.as_str(), message, current_timestamp()],
            )
            .map_err(|e| AppError::Staging(format!("Failed to update group state: {e}")))?;

        if updated == 0 {
            return Err(AppError::Staging(format!(
                "Group {} was never started",
                rank
            )));
        }
        debug!(rank, state = state.as_str(), "Staged group state updated");
        Ok(())
    }

    /// Removes groups ranked at or past `rank_count` (left by a larger earlier input).
    pub fn retain_ranks(&self, rank_count: usize) -> Result<(), AppError> {
        let conn = self.connect()?;
        let removed = conn
            .execute(
                "DELETE FROM staged_groups WHERE source_group_rank >= ?1",
                params![rank_count as i64],
            )
            .map_err(|e| AppError::Staging(format!("Failed to prune groups: {e}")))?;
        conn.execute(
            "DELETE FROM staged_rows WHERE source_group_rank >= ?1",
            params![rank_count as i64],
        )
        .map_err(|e| AppError::Staging(format!("Failed to prune rows: {e}")))?;

        if removed > 0 {
            info!("[STAGING] Removed {} stale group(s)", removed);
        }
        Ok(())
    }

    // ── Metadata ──────────────────────────────────────────────────────────────

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<(), AppError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO metadata (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .map_err(|e| AppError::Staging(format!("Failed to write metadata: {e}")))?;
        Ok(())
    }

    pub fn metadata(&self, key: &str) -> Result<Option<String>, AppError> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| AppError::Staging(format!("Failed to read metadata: {e}")))
    }

    // ── Reads ─────────────────────────────────────────────────────────────────

    /// Lists every staged group ordered by rank.
    pub fn group_states_blocking(&self) -> Result<Vec<StagedGroup>, AppError> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT source_group_rank, name, header, expected_rows, staged_rows, state, error_message, updated_at
                FROM staged_groups
                ORDER BY source_group_rank ASC
                "#,
            )
            .map_err(|e| AppError::Staging(format!("Failed to prepare query: {e}")))?;

        let raw = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            })
            .map_err(|e| AppError::Staging(format!("Failed to query groups: {e}")))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::Staging(format!("Failed to collect groups: {e}")))?;

        raw.into_iter()
            .map(
                |(rank, name, header, expected, staged, state, error_message, updated_at)| {
                    Ok(StagedGroup {
                        rank: rank as usize,
                        name,
                        header: decode_record(&header)?,
                        expected_rows: expected as u64,
                        staged_rows: staged as u64,
                        state: GroupState::parse(&state)?,
                        error_message,
                        updated_at,
                    })
                },
            )
            .collect()
    }

    /// Reads rows `[offset, offset + limit)` of group `rank`, in row order.
    pub fn query_group_range(
        &self,
        rank: usize,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Record>, AppError> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare_cached(
                r#"
                SELECT fields FROM staged_rows
                WHERE source_group_rank = ?1 AND row_num >= ?2 AND row_num < ?3
                ORDER BY row_num ASC
                "#,
            )
            .map_err(|e| AppError::Staging(format!("Failed to prepare query: {e}")))?;

        let end = offset.saturating_add(limit);
        let encoded = stmt
            .query_map(
                params![rank as i64, offset as i64, end.min(i64::MAX as u64) as i64],
                |row| row.get::<_, String>(0),
            )
            .map_err(|e| AppError::Staging(format!("Failed to query rows: {e}")))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::Staging(format!("Failed to collect rows: {e}")))?;

        encoded.iter().map(|fields| decode_record(fields)).collect()
    }

    /// Reads a contiguous logical range of all staged rows, ordered by
    /// `(source_group_rank, row_num)`.
    pub fn query_blocking(&self, range: Range<u64>) -> Result<Vec<Record>, AppError> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT fields FROM staged_rows
                ORDER BY source_group_rank ASC, row_num ASC
                LIMIT ?1 OFFSET ?2
                "#,
            )
            .map_err(|e| AppError::Staging(format!("Failed to prepare query: {e}")))?;

        let limit = range.end.saturating_sub(range.start);
        let encoded = stmt
            .query_map(params![limit as i64, range.start as i64], |row| {
                row.get::<_, String>(0)
            })
            .map_err(|e| AppError::Staging(format!("Failed to query rows: {e}")))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::Staging(format!("Failed to collect rows: {e}")))?;

        encoded.iter().map(|fields| decode_record(fields)).collect()
    }

    /// Total staged rows.
    pub fn count_blocking(&self) -> Result<u64, AppError> {
        let conn = self.connect()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM staged_rows", [], |row| row.get(0))
            .map_err(|e| AppError::Staging(format!("Failed to count rows: {e}")))?;
        Ok(count as u64)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Folds the WAL into the main database file so the file can be copied alone.
    pub fn checkpoint(&self) -> Result<(), AppError> {
        let conn = self.connect()?;
        let busy: i64 = conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| row.get(0))
            .map_err(|e| AppError::Staging(format!("Failed to checkpoint database: {e}")))?;
        if busy != 0 {
            return Err(AppError::Staging(
                "Checkpoint blocked by another connection".into(),
            ));
        }
        Ok(())
    }

    /// Checkpoints the database and copies it to `dest`.
    pub fn copy_to(&self, dest: &Path) -> Result<u64, AppError> {
        self.checkpoint()?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AppError::Io(format!("Failed to create {}: {e}", parent.display())))?;
        }
        std::fs::copy(&self.db_path, dest).map_err(|e| {
            AppError::Io(format!(
                "Failed to copy staging database to {}: {e}",
                dest.display()
            ))
        })
    }

    /// Deletes the database file and its WAL side files.
    pub fn remove(self) -> Result<(), AppError> {
        for suffix in ["", "-wal", "-shm"] {
            let mut path = self.db_path.clone().into_os_string();
            path.push(suffix);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(AppError::Io(format!(
                        "Failed to remove {}: {e}",
                        PathBuf::from(path).display()
                    )))
                }
            }
        }
        debug!(path = %self.db_path.display(), "Staging database removed");
        Ok(())
    }

    // ── Async wrappers ────────────────────────────────────────────────────────

    pub async fn group_states(&self) -> Result<Vec<StagedGroup>, AppError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.group_states_blocking())
            .await
            .map_err(|e| AppError::Internal(format!("Group states task failed: {e}")))?
    }

    pub async fn query(&self, range: Range<u64>) -> Result<Vec<Record>, AppError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.query_blocking(range))
            .await
            .map_err(|e| AppError::Internal(format!("Query task failed: {e}")))?
    }

    pub async fn count(&self) -> Result<u64, AppError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.count_blocking())
            .await
            .map_err(|e| AppError::Internal(format!("Count task failed: {e}")))?
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Configures connection with busy timeout and WAL mode.
fn configure_connection(conn: &Connection) -> Result<(), AppError> {
    conn.busy_timeout(Duration::from_secs(10))
        .map_err(|e| AppError::Staging(format!("Failed to set busy timeout: {e}")))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|e| AppError::Staging(format!("Failed to set WAL mode: {e}")))?;

    Ok(())
}

/// Runs database migrations using PRAGMA user_version.
fn run_migrations(conn: &mut Connection) -> Result<(), AppError> {
    let current_version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(|e| AppError::Staging(format!("Failed to get schema version: {e}")))?;

    if current_version >= SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn
        .transaction()
        .map_err(|e| AppError::Staging(format!("Failed to start migration transaction: {e}")))?;

    if current_version < 1 {
        tx.execute_batch(V1_SCHEMA)
            .map_err(|e| AppError::Staging(format!("V1 migration failed: {e}")))?;
    }

    tx.pragma_update(None, "user_version", SCHEMA_VERSION)
        .map_err(|e| AppError::Staging(format!("Failed to update schema version: {e}")))?;

    tx.commit()
        .map_err(|e| AppError::Staging(format!("Failed to commit migration: {e}")))?;

    Ok(())
}

fn encode_record(record: &[String]) -> Result<String, AppError> {
    serde_json::to_string(record)
        .map_err(|e| AppError::Internal(format!("Failed to encode record: {e}")))
}

fn decode_record(fields: &str) -> Result<Record, AppError> {
    serde_json::from_str(fields)
        .map_err(|e| AppError::Staging(format!("Corrupt staged record: {e}")))
}

fn current_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
