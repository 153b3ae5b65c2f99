//! Workbook manifest: the ordered group list with committed extents.
//!
//! The manifest is the only metadata a CSV workbook carries. It records each
//! group's header, committed row count and committed byte length. Bytes past
//! the committed length belong to an interrupted append and are ignored.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::streaming::write_atomic;

/// File name of the manifest inside a workbook directory.
pub const MANIFEST_FILE: &str = "manifest.json";

const MANIFEST_VERSION: u32 = 1;

/// One group of a workbook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEntry {
    pub name: String,
    pub file: String,
    pub header: Vec<String>,
    /// Committed data rows (header excluded).
    pub rows: u64,
    /// Committed byte length of `file`.
    pub bytes: u64,
}

/// Ordered list of a workbook's groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub groups: Vec<GroupEntry>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            groups: Vec::new(),
        }
    }
}

impl Manifest {
    /// Loads the manifest of `dir`.
    ///
    /// Returns `Ok(None)` when the workbook has no manifest and
    /// `AppError::ArtifactInconsistent` when it exists but cannot be parsed.
    pub fn load(dir: &Path) -> Result<Option<Self>, AppError> {
        let path = dir.join(MANIFEST_FILE);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(AppError::Io(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let manifest: Manifest = serde_json::from_slice(&bytes).map_err(|e| {
            AppError::ArtifactInconsistent(format!("{} is corrupt: {}", path.display(), e))
        })?;

        if manifest.version != MANIFEST_VERSION {
            return Err(AppError::ArtifactInconsistent(format!(
                "{} has unsupported version {}",
                path.display(),
                manifest.version
            )));
        }

        Ok(Some(manifest))
    }

    /// Atomically writes the manifest into `dir`.
    pub fn save(&self, dir: &Path) -> Result<(), AppError> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| AppError::Internal(format!("Failed to encode manifest: {}", e)))?;
        write_atomic(&dir.join(MANIFEST_FILE), &bytes)?;
        Ok(())
    }

    pub fn group(&self, name: &str) -> Option<&GroupEntry> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn group_mut(&mut self, name: &str) -> Option<&mut GroupEntry> {
        self.groups.iter_mut().find(|g| g.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(name: &str, rows: u64) -> GroupEntry {
        GroupEntry {
            name: name.to_string(),
            file: format!("{}.csv", name),
            header: vec!["serial".into(), "qri".into()],
            rows,
            bytes: 11 + rows * 7,
        }
    }

    #[test]
    fn load_missing_manifest_is_none() {
        let dir = TempDir::new().expect("temp dir");
        assert!(Manifest::load(dir.path()).expect("load").is_none());
    }

    #[test]
    fn save_then_load_preserves_group_order() {
        let dir = TempDir::new().expect("temp dir");
        let mut manifest = Manifest::default();
        manifest.groups.push(entry("Sheet_2", 3));
        manifest.groups.push(entry("Sheet_1", 4));
        manifest.save(dir.path()).expect("save");

        let loaded = Manifest::load(dir.path()).expect("load").expect("present");
        let names: Vec<&str> = loaded.groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["Sheet_2", "Sheet_1"]);
    }

    #[test]
    fn group_lookup_by_name() {
        let mut manifest = Manifest::default();
        manifest.groups.push(entry("Sheet_1", 1));
        if let Some(group) = manifest.group_mut("Sheet_1") {
            group.rows = 9;
        }
        assert_eq!(manifest.group("Sheet_1").map(|g| g.rows), Some(9));
        assert!(manifest.group("Sheet_2").is_none());
    }

    #[test]
    fn corrupt_manifest_is_inconsistent() {
        let dir = TempDir::new().expect("temp dir");
        std::fs::write(dir.path().join(MANIFEST_FILE), "{not json").expect("write");
        let err = Manifest::load(dir.path()).expect_err("corrupt manifest should fail");
        assert!(matches!(err, AppError::ArtifactInconsistent(_)));
    }
}
