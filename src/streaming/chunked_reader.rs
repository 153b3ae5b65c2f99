//! Bounded batch reading of one source range.
//!
//! A [`ChunkedReader`] yields the records of `[offset, offset + length)` of one
//! input group as batches that respect both a record limit and a byte budget.
//! Only the current batch is held in memory.

use serde::Serialize;

use crate::error::AppError;
use crate::partition::InputGroup;
use crate::workbook::{Record, RecordSource, RowIter};

/// Batch bounds for reading and writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkConfig {
    /// Maximum records per batch.
    pub max_records: u64,
    /// Maximum estimated bytes per batch (default: 64 MiB).
    pub max_bytes: u64,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_records: 10_000,
            max_bytes: 64 * 1024 * 1024, // 64 MiB
        }
    }
}

impl ChunkConfig {
    /// Sets the max_records limit.
    pub fn max_records(mut self, records: u64) -> Self {
        self.max_records = records;
        self
    }

    /// Sets the max_bytes limit.
    pub fn max_bytes(mut self, bytes: u64) -> Self {
        self.max_bytes = bytes;
        self
    }
}

/// Lazy, non-restartable batch iterator over one source range.
pub struct ChunkedReader {
    group: String,
    rows: RowIter,
    config: ChunkConfig,
    offset: u64,
    end: u64,
    /// Absolute row position of the next record to return.
    position: u64,
    /// Record read ahead that did not fit the previous batch.
    pending: Option<Record>,
    finished: bool,
}

impl std::fmt::Debug for ChunkedReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedReader")
            .field("group", &self.group)
            .field("offset", &self.offset)
            .field("end", &self.end)
            .field("position", &self.position)
            .finish()
    }
}

impl ChunkedReader {
    /// Opens `group` and positions the reader at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::RangeUnavailable` if the range exceeds the counted
    /// size of the group, or if the source ends before `offset`.
    pub fn open(
        source: &dyn RecordSource,
        group: &InputGroup,
        offset: u64,
        length: u64,
        config: ChunkConfig,
    ) -> Result<Self, AppError> {
        let end = offset.checked_add(length).unwrap_or(u64::MAX);
        if end > group.record_count {
            return Err(AppError::RangeUnavailable {
                group: group.name.clone(),
                offset,
                end,
                available: group.record_count,
            });
        }

        let mut rows = source.open_group_reader(&group.name)?.rows;
        for skipped in 0..offset {
            match rows.next() {
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(AppError::RangeUnavailable {
                        group: group.name.clone(),
                        offset,
                        end,
                        available: skipped,
                    })
                }
            }
        }

        Ok(Self {
            group: group.name.clone(),
            rows,
            config,
            offset,
            end,
            position: offset,
            pending: None,
            finished: length == 0,
        })
    }

    fn short_read(&self) -> AppError {
        AppError::RangeUnavailable {
            group: self.group.clone(),
            offset: self.offset,
            end: self.end,
            available: self.position,
        }
    }
}

impl Iterator for ChunkedReader {
    type Item = Result<Vec<Record>, AppError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let mut batch = Vec::new();
        let mut batch_bytes = 0u64;

        while self.position < self.end && (batch.len() as u64) < self.config.max_records {
            let record = match self.pending.take() {
                Some(record) => record,
                None => match self.rows.next() {
                    Some(Ok(record)) => record,
                    Some(Err(e)) => {
                        self.finished = true;
                        return Some(Err(e));
                    }
                    None => {
                        self.finished = true;
                        return Some(Err(self.short_read()));
                    }
                },
            };

            let size = estimated_size(&record);
            if !fits_budget(batch_bytes, batch.len(), size, &self.config) {
                self.pending = Some(record);
                break;
            }
            batch_bytes += size;
            batch.push(record);
            self.position += 1;
        }

        if self.position == self.end {
            self.finished = true;
        }
        Some(Ok(batch))
    }
}

/// Whether a record of `size` bytes may join the batch. A batch always accepts
/// its first record, so a record larger than the byte budget forms its own batch.
fn fits_budget(batch_bytes: u64, batch_rows: usize, size: u64, config: &ChunkConfig) -> bool {
    batch_rows == 0 || batch_bytes + size <= config.max_bytes
}

/// Serialized size estimate: field bytes plus one separator or terminator each.
fn estimated_size(record: &[String]) -> u64 {
    record
        .iter()
        .map(|f| f.len() as u64 + 1)
        .sum::<u64>()
        .max(1)
}
