//! CSV workbook format.
//!
//! A workbook is a directory holding one `<group>.csv` file per group (header
//! row first) and an optional `manifest.json`. A single `.csv` file is also
//! accepted as a one-group input workbook.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use csv::{ByteRecord, Reader, ReaderBuilder, StringRecord, WriterBuilder};
use tracing::{debug, warn};

use super::manifest::{GroupEntry, Manifest};
use super::{ArtifactId, ArtifactSink, GroupReader, Record, RecordSource};
use crate::config::OutputNaming;
use crate::error::AppError;
use crate::streaming::AtomicCsvWriter;

const CSV_EXTENSION: &str = "csv";

// ─────────────────────────────────────────────────────────────────────────────
// Source
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum Layout {
    SingleFile { name: String },
    Directory { manifest: Option<Manifest> },
}

/// A CSV workbook opened for reading.
#[derive(Debug)]
pub struct CsvWorkbook {
    root: PathBuf,
    layout: Layout,
}

impl CsvWorkbook {
    /// Opens a workbook directory or a single CSV file.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SourceUnreadable` if the path does not exist, cannot
    /// be listed, or carries a corrupt manifest.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let root = path.as_ref().to_path_buf();
        let metadata = fs::metadata(&root)
            .map_err(|e| AppError::SourceUnreadable(format!("{}: {}", root.display(), e)))?;

        if metadata.is_file() {
            let name = root
                .file_stem()
                .and_then(|s| s.to_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    AppError::SourceUnreadable(format!("{}: invalid file name", root.display()))
                })?;
            return Ok(Self {
                root,
                layout: Layout::SingleFile { name },
            });
        }

        fs::read_dir(&root)
            .map_err(|e| AppError::SourceUnreadable(format!("{}: {}", root.display(), e)))?;
        let manifest = Manifest::load(&root)
            .map_err(|e| AppError::SourceUnreadable(format!("{}: {}", root.display(), e)))?;

        Ok(Self {
            root,
            layout: Layout::Directory { manifest },
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn manifest_entry(&self, name: &str) -> Option<&GroupEntry> {
        match &self.layout {
            Layout::Directory {
                manifest: Some(manifest),
            } => manifest.group(name),
            _ => None,
        }
    }

    fn group_path(&self, name: &str) -> Result<PathBuf, AppError> {
        match &self.layout {
            Layout::SingleFile { name: only } if only == name => Ok(self.root.clone()),
            Layout::SingleFile { .. } => Err(AppError::GroupMissing(name.to_string())),
            Layout::Directory { manifest: Some(m) } => m
                .group(name)
                .map(|entry| self.root.join(&entry.file))
                .ok_or_else(|| AppError::GroupMissing(name.to_string())),
            // Names come from the scanned file stems, so they map back unchanged.
            Layout::Directory { manifest: None } => {
                Ok(self.root.join(format!("{}.{}", name, CSV_EXTENSION)))
            }
        }
    }

    fn open_csv(&self, name: &str) -> Result<Reader<Box<dyn Read + Send>>, AppError> {
        let path = self.group_path(name)?;
        let bound = self.manifest_entry(name).map(|entry| entry.bytes);
        open_bounded(&path, bound).map_err(|e| match e {
            AppError::ArtifactInconsistent(_) => AppError::GroupMissing(name.to_string()),
            other => other,
        })
    }
}

impl RecordSource for CsvWorkbook {
    fn list_groups(&self) -> Result<Vec<String>, AppError> {
        match &self.layout {
            Layout::SingleFile { name } => Ok(vec![name.clone()]),
            Layout::Directory { manifest: Some(m) } => {
                Ok(m.groups.iter().map(|g| g.name.clone()).collect())
            }
            Layout::Directory { manifest: None } => {
                scan_csv_files(&self.root).map_err(|e| AppError::SourceUnreadable(e.to_string()))
            }
        }
    }

    fn count_rows(&self, name: &str) -> Result<u64, AppError> {
        if let Some(entry) = self.manifest_entry(name) {
            let path = self.root.join(&entry.file);
            let len = file_len(&path).ok_or_else(|| AppError::GroupMissing(name.to_string()))?;
            if len < entry.bytes {
                return Err(AppError::RangeUnavailable {
                    group: name.to_string(),
                    offset: 0,
                    end: entry.rows,
                    available: 0,
                });
            }
            return Ok(entry.rows);
        }

        // No count metadata: stream the file, holding one record at a time.
        // Rows are checked for UTF-8 here so an unreadable sheet fails the
        // analysis instead of every unit that later reads it.
        let mut reader = self.open_csv(name)?;
        let mut record = ByteRecord::new();
        let mut rows = 0u64;
        while reader
            .read_byte_record(&mut record)
            .map_err(|e| AppError::Csv(format!("Failed to count rows of '{}': {}", name, e)))?
        {
            rows += 1;
            record
                .iter()
                .try_for_each(|f| std::str::from_utf8(f).map(|_| ()))
                .map_err(|e| {
                    AppError::SourceUnreadable(format!(
                        "sheet '{}' row {} is not valid UTF-8: {}",
                        name, rows, e
                    ))
                })?;
        }
        Ok(rows)
    }

    fn group_header(&self, name: &str) -> Result<Record, AppError> {
        if let Some(entry) = self.manifest_entry(name) {
            return Ok(entry.header.clone());
        }
        let mut reader = self.open_csv(name)?;
        read_header(&mut reader, name)
    }

    fn open_group_reader(&self, name: &str) -> Result<GroupReader, AppError> {
        let mut reader = self.open_csv(name)?;
        let header = read_header(&mut reader, name)?;
        let group = name.to_string();

        let rows = reader.into_records().map(move |result| {
            result
                .map(|record| record.iter().map(String::from).collect())
                .map_err(|e| AppError::Csv(format!("Failed to read a row of '{}': {}", group, e)))
        });

        Ok(GroupReader {
            header,
            rows: Box::new(rows),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sink
// ─────────────────────────────────────────────────────────────────────────────

/// Writes output artifacts as CSV workbooks under one root directory.
#[derive(Debug, Clone)]
pub struct CsvWorkbookSink {
    root: PathBuf,
    naming: OutputNaming,
}

impl CsvWorkbookSink {
    pub fn new(root: impl Into<PathBuf>, naming: OutputNaming) -> Self {
        Self {
            root: root.into(),
            naming,
        }
    }

    /// Directory of an artifact.
    pub fn artifact_dir(&self, artifact: ArtifactId) -> PathBuf {
        self.root.join(self.naming.artifact_name(artifact))
    }
}

impl ArtifactSink for CsvWorkbookSink {
    fn create_or_open(&self, artifact: ArtifactId) -> Result<(), AppError> {
        let dir = self.artifact_dir(artifact);
        fs::create_dir_all(&dir)
            .map_err(|e| AppError::Io(format!("Failed to create {}: {}", dir.display(), e)))
    }

    fn create_or_append_group(
        &self,
        artifact: ArtifactId,
        group: &str,
        header: &[String],
        rows: &[Record],
    ) -> Result<u64, AppError> {
        let dir = self.artifact_dir(artifact);
        let mut manifest = match Manifest::load(&dir)? {
            Some(manifest) => manifest,
            None if scan_csv_files(&dir)?.is_empty() => Manifest::default(),
            None => {
                return Err(AppError::ArtifactInconsistent(format!(
                    "{} holds groups but no manifest",
                    dir.display()
                )))
            }
        };

        let extent = match manifest.group_mut(group) {
            Some(entry) => {
                let path = dir.join(&entry.file);
                entry.bytes = append_committed(&path, entry.bytes, rows)?;
                entry.rows += rows.len() as u64;
                entry.rows
            }
            None => {
                let file = group_file_name(group);
                let path = dir.join(&file);
                if path.exists() {
                    return Err(AppError::ArtifactInconsistent(format!(
                        "{} exists but is not in the manifest",
                        path.display()
                    )));
                }

                let mut writer = AtomicCsvWriter::new(&path)?;
                writer.write_record(header)?;
                for row in rows {
                    writer.write_record(row)?;
                }
                let (_, bytes) = writer.finish()?;

                manifest.groups.push(GroupEntry {
                    name: group.to_string(),
                    file,
                    header: header.to_vec(),
                    rows: rows.len() as u64,
                    bytes,
                });
                // Groups may be created out of order by concurrent units.
                manifest.groups.sort_by_key(|g| natural_key(&g.name));
                rows.len() as u64
            }
        };

        manifest.save(&dir)?;
        Ok(extent)
    }

    fn read_group_extent(
        &self,
        artifact: ArtifactId,
        group: &str,
    ) -> Result<Option<u64>, AppError> {
        let dir = self.artifact_dir(artifact);
        if !dir.exists() {
            return Ok(None);
        }

        match Manifest::load(&dir)? {
            Some(manifest) => match manifest.group(group) {
                Some(entry) => {
                    let len = file_len(&dir.join(&entry.file)).unwrap_or(0);
                    if len < entry.bytes {
                        return Err(AppError::ArtifactInconsistent(format!(
                            "{}/{} is shorter than its committed length ({} < {})",
                            dir.display(),
                            entry.file,
                            len,
                            entry.bytes
                        )));
                    }
                    Ok(Some(entry.rows))
                }
                None => Ok(None),
            },
            None if dir.join(group_file_name(group)).exists() => {
                Err(AppError::ArtifactInconsistent(format!(
                    "{} holds '{}' but no manifest",
                    dir.display(),
                    group
                )))
            }
            None => Ok(None),
        }
    }

    fn list_artifact_groups(&self, artifact: ArtifactId) -> Result<Vec<String>, AppError> {
        let dir = self.artifact_dir(artifact);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut names: Vec<String> = match Manifest::load(&dir) {
            Ok(Some(manifest)) => manifest.groups.into_iter().map(|g| g.name).collect(),
            _ => Vec::new(),
        };
        for name in scan_csv_files(&dir)? {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        Ok(names)
    }

    fn rebuild_group(
        &self,
        artifact: ArtifactId,
        group: &str,
        header: &[String],
        keep_rows: u64,
        rows: &[Record],
    ) -> Result<u64, AppError> {
        self.create_or_open(artifact)?;
        let dir = self.artifact_dir(artifact);

        let previous = match Manifest::load(&dir) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(
                    "[WORKBOOK] Ignoring unreadable manifest in {}: {}",
                    dir.display(),
                    e
                );
                None
            }
        };

        let mut names = self.list_artifact_groups(artifact)?;
        if !names.iter().any(|n| n == group) {
            names.push(group.to_string());
        }
        names.sort_by_key(|name| natural_key(name));

        let mut manifest = Manifest::default();
        let mut target_rows = 0u64;

        for name in &names {
            let prior = previous.as_ref().and_then(|m| m.group(name)).cloned();
            let file = prior
                .as_ref()
                .map(|entry| entry.file.clone())
                .unwrap_or_else(|| group_file_name(name));
            let path = dir.join(&file);
            let bound = prior
                .as_ref()
                .filter(|entry| file_len(&path).is_some_and(|len| len >= entry.bytes))
                .map(|entry| entry.bytes);

            if name == group {
                let (group_header, count, bytes) =
                    rewrite_group(&path, bound, Some(keep_rows), header, rows)?;
                target_rows = count;
                manifest.groups.push(GroupEntry {
                    name: name.clone(),
                    file,
                    header: group_header,
                    rows: count,
                    bytes,
                });
                continue;
            }

            match (prior, bound) {
                (Some(entry), Some(_)) => manifest.groups.push(entry),
                _ if path.exists() => {
                    debug!(group = %name, "Recounting group without a valid manifest entry");
                    let (group_header, count, bytes) = rewrite_group(&path, None, None, &[], &[])?;
                    manifest.groups.push(GroupEntry {
                        name: name.clone(),
                        file,
                        header: group_header,
                        rows: count,
                        bytes,
                    });
                }
                _ => warn!(
                    "[WORKBOOK] Dropping '{}' from {}: file is gone",
                    name,
                    dir.display()
                ),
            }
        }

        manifest.save(&dir)?;
        Ok(target_rows)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// File name of a group: unsafe characters replaced by `_`.
fn group_file_name(name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '_' | '-' | ' ' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}.{}", safe, CSV_EXTENSION)
}

/// Sort key placing `Sheet_2` before `Sheet_10`.
fn natural_key(name: &str) -> (String, u64, String) {
    let digits_start = name.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    let (prefix, digits) = name.split_at(digits_start);
    (
        prefix.to_string(),
        digits.parse().unwrap_or(0),
        name.to_string(),
    )
}

/// Lists the group names (file stems) of the `.csv` files in `dir`.
fn scan_csv_files(dir: &Path) -> Result<Vec<String>, AppError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(AppError::Io(format!(
                "Failed to list {}: {}",
                dir.display(),
                e
            )))
        }
    };

    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(CSV_EXTENSION))
        .filter_map(|path| {
            path.file_stem()
                .and_then(|s| s.to_str())
                .map(str::to_string)
        })
        .collect();

    names.sort_by_key(|name| natural_key(name));
    Ok(names)
}

fn file_len(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().map(|m| m.len())
}

/// Opens a CSV file, reading at most `bound` bytes when given.
fn open_bounded(path: &Path, bound: Option<u64>) -> Result<Reader<Box<dyn Read + Send>>, AppError> {
    let file = File::open(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => {
            AppError::ArtifactInconsistent(format!("{} is missing", path.display()))
        }
        _ => AppError::Io(format!("Failed to open {}: {}", path.display(), e)),
    })?;

    let input: Box<dyn Read + Send> = match bound {
        Some(bytes) => Box::new(BufReader::new(file.take(bytes))),
        None => Box::new(BufReader::new(file)),
    };

    Ok(ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(input))
}

fn read_header<R: Read>(reader: &mut Reader<R>, name: &str) -> Result<Record, AppError> {
    let header = reader
        .headers()
        .map_err(|e| AppError::Csv(format!("Failed to read header of '{}': {}", name, e)))?;
    Ok(header.iter().map(String::from).collect())
}

/// Appends `rows` after the first `committed` bytes of `path`, discarding any
/// uncommitted tail. Returns the new committed length.
fn append_committed(path: &Path, committed: u64, rows: &[Record]) -> Result<u64, AppError> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => {
                AppError::ArtifactInconsistent(format!("{} is listed but missing", path.display()))
            }
            _ => AppError::Io(format!("Failed to open {}: {}", path.display(), e)),
        })?;

    let io_err =
        |e: std::io::Error| AppError::Io(format!("Failed to append to {}: {}", path.display(), e));

    let len = file.metadata().map_err(io_err)?.len();
    if len < committed {
        return Err(AppError::ArtifactInconsistent(format!(
            "{} is shorter than its committed length ({} < {})",
            path.display(),
            len,
            committed
        )));
    }
    if len > committed {
        debug!(path = %path.display(), discarded = len - committed, "Discarding uncommitted bytes");
    }

    file.set_len(committed).map_err(io_err)?;
    file.seek(SeekFrom::End(0)).map_err(io_err)?;
    {
        let mut writer = WriterBuilder::new()
            .flexible(true)
            .from_writer(BufWriter::new(&mut file));
        for row in rows {
            writer
                .write_record(row)
                .map_err(|e| AppError::Csv(format!("Failed to write record: {}", e)))?;
        }
        writer.flush().map_err(io_err)?;
    }
    file.sync_data().map_err(io_err)?;

    Ok(file.metadata().map_err(io_err)?.len())
}

/// Atomically rewrites a group file: its header, the first `keep` existing
/// rows (all when `None`), then `extra`. Returns (header, rows, bytes).
fn rewrite_group(
    path: &Path,
    bound: Option<u64>,
    keep: Option<u64>,
    fallback_header: &[String],
    extra: &[Record],
) -> Result<(Record, u64, u64), AppError> {
    let mut writer = AtomicCsvWriter::new(path)?;
    let mut kept = 0u64;

    let header = if path.exists() {
        let mut reader = open_bounded(path, bound)?;
        let existing = read_header(&mut reader, &path.display().to_string())?;
        let header = if existing.is_empty() {
            fallback_header.to_vec()
        } else {
            existing
        };
        if !header.is_empty() {
            writer.write_record(&header)?;
        }

        let mut record = StringRecord::new();
        while keep.map_or(true, |k| kept < k)
            && reader
                .read_record(&mut record)
                .map_err(|e| AppError::Csv(format!("Failed to read {}: {}", path.display(), e)))?
        {
            writer.write_record(&record)?;
            kept += 1;
        }
        header
    } else {
        writer.write_record(fallback_header)?;
        fallback_header.to_vec()
    };

    if let Some(k) = keep {
        if kept < k {
            return Err(AppError::ArtifactInconsistent(format!(
                "{} holds {} rows, {} required before the new batch",
                path.display(),
                kept,
                k
            )));
        }
    }

    for row in extra {
        writer.write_record(row)?;
    }
    let (_, bytes) = writer.finish()?;

    Ok((header, kept + extra.len() as u64, bytes))
}
