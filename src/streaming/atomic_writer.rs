//! Atomic file writers with automatic cleanup on failure.
//!
//! Writes go to a temporary file in the same directory as the destination,
//! which atomically replaces the destination on `finish()`. If dropped
//! before finishing, the temporary file is automatically cleaned up.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use csv::{Writer, WriterBuilder};
use tempfile::NamedTempFile;

use crate::error::AppError;

/// An atomic CSV writer that ensures data integrity.
///
/// Writes to a temporary file and atomically persists to the final path
/// on `finish()`. If dropped without calling `finish()`, the temporary
/// file is automatically deleted.
pub struct AtomicCsvWriter {
    writer: Writer<BufWriter<NamedTempFile>>,
    final_path: PathBuf,
}

impl AtomicCsvWriter {
    /// Creates a new atomic CSV writer targeting the specified path.
    ///
    /// The temporary file is created in the same directory as `final_path`
    /// so the final rename stays on one filesystem.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the parent directory cannot be determined
    /// or the temporary file cannot be created.
    pub fn new(final_path: impl AsRef<Path>) -> Result<Self, AppError> {
        let final_path = final_path.as_ref().to_path_buf();
        let temp_file = temp_file_beside(&final_path)?;

        let csv_writer = WriterBuilder::new()
            .flexible(true)
            .from_writer(BufWriter::new(temp_file));

        Ok(Self {
            writer: csv_writer,
            final_path,
        })
    }

    /// Writes one record (header or data row).
    pub fn write_record<I, T>(&mut self, record: I) -> Result<(), AppError>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        self.writer
            .write_record(record)
            .map_err(|e| AppError::Csv(format!("Failed to write record: {}", e)))
    }

    /// Flushes all buffers, syncs the temporary file and atomically persists
    /// it to the final path. Returns the final path and its size in bytes.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if flushing or persisting fails.
    /// On error, the temporary file is cleaned up automatically.
    pub fn finish(self) -> Result<(PathBuf, u64), AppError> {
        let buf_writer = self
            .writer
            .into_inner()
            .map_err(|e| AppError::Io(format!("Failed to flush CSV writer: {}", e.error())))?;

        let named_temp = buf_writer
            .into_inner()
            .map_err(|e| AppError::Io(format!("Failed to flush buffer: {}", e.error())))?;

        persist(named_temp, &self.final_path)
    }
}

/// Atomically replaces `final_path` with `bytes`.
pub fn write_atomic(final_path: &Path, bytes: &[u8]) -> Result<u64, AppError> {
    let mut temp = temp_file_beside(final_path)?;
    temp.write_all(bytes)
        .map_err(|e| AppError::Io(format!("Failed to write temporary file: {}", e)))?;
    persist(temp, final_path).map(|(_, len)| len)
}

fn temp_file_beside(final_path: &Path) -> Result<NamedTempFile, AppError> {
    let parent_dir = final_path.parent().ok_or_else(|| {
        AppError::Io(format!(
            "Cannot determine parent directory for: {}",
            final_path.display()
        ))
    })?;

    NamedTempFile::new_in(parent_dir)
        .map_err(|e| AppError::Io(format!("Failed to create temporary file: {}", e)))
}

fn persist(named_temp: NamedTempFile, final_path: &Path) -> Result<(PathBuf, u64), AppError> {
    named_temp
        .as_file()
        .sync_all()
        .map_err(|e| AppError::Io(format!("Failed to sync temporary file: {}", e)))?;

    let file = named_temp.persist(final_path).map_err(|e| {
        AppError::Io(format!(
            "Failed to persist file to {}: {}",
            final_path.display(),
            e.error
        ))
    })?;

    let len = file
        .metadata()
        .map_err(|e| AppError::Io(format!("Failed to stat {}: {}", final_path.display(), e)))?
        .len();

    Ok((final_path.to_path_buf(), len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn record(fields: &[&str]) -> Vec<String> {
        fields.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_successful_write_reports_size() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let final_path = temp_dir.path().join("Sheet_1.csv");

        let mut writer = AtomicCsvWriter::new(&final_path).expect("Failed to create writer");
        writer
            .write_record(&record(&["serial", "qri"]))
            .expect("header");
        writer.write_record(&record(&["1001", "a"])).expect("row 1");
        writer.write_record(&record(&["1002", "b"])).expect("row 2");

        let (result_path, len) = writer.finish().expect("Failed to finish");

        assert_eq!(result_path, final_path);
        let content = fs::read_to_string(&final_path).expect("Failed to read file");
        assert_eq!(content, "serial,qri\n1001,a\n1002,b\n");
        assert_eq!(len, content.len() as u64);
    }

    #[test]
    fn test_drop_cleanup() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let final_path = temp_dir.path().join("Sheet_1.csv");

        {
            let mut writer = AtomicCsvWriter::new(&final_path).expect("Failed to create writer");
            writer.write_record(&record(&["Header"])).expect("write");
            // Dropped without finish()
        }

        let entries_after: Vec<_> = fs::read_dir(temp_dir.path())
            .expect("Failed to read dir")
            .collect();
        assert!(entries_after.is_empty(), "temp file should be cleaned up");
        assert!(!final_path.exists());
    }

    #[test]
    fn test_overwrite_behavior() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let final_path = temp_dir.path().join("Sheet_1.csv");
        fs::write(&final_path, "OLD_CONTENT").expect("Failed to write dummy file");

        let mut writer = AtomicCsvWriter::new(&final_path).expect("Failed to create writer");
        writer.write_record(&record(&["NEW"])).expect("write");
        writer.finish().expect("Failed to finish");

        let content = fs::read_to_string(&final_path).expect("Failed to read file");
        assert_eq!(content, "NEW\n");
    }

    #[test]
    fn test_quoted_fields_survive() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let final_path = temp_dir.path().join("complex.csv");

        let mut writer = AtomicCsvWriter::new(&final_path).expect("Failed to create writer");
        writer
            .write_record(&record(&["Name", "Description"]))
            .expect("header");
        writer
            .write_record(&record(&["Item1", "Contains, comma"]))
            .expect("row");
        writer
            .write_record(&record(&["Item2", "Multi\nline"]))
            .expect("row");
        writer.finish().expect("Failed to finish");

        let mut reader = csv::Reader::from_path(&final_path).expect("Failed to open reader");
        let rows: Vec<Vec<String>> = reader
            .records()
            .map(|r| r.expect("record").iter().map(String::from).collect())
            .collect();
        assert_eq!(rows[0][1], "Contains, comma");
        assert_eq!(rows[1][1], "Multi\nline");
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("manifest.json");
        fs::write(&path, "{}").expect("seed");

        let len = write_atomic(&path, b"{\"version\":1}").expect("write_atomic");

        assert_eq!(len, 13);
        assert_eq!(fs::read_to_string(&path).expect("read"), "{\"version\":1}");
    }

    #[cfg(unix)]
    #[test]
    fn test_invalid_parent_directory() {
        assert!(AtomicCsvWriter::new("/").is_err());
    }
}
