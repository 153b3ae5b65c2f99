//! In-memory record source.

use std::sync::RwLock;

use super::{GroupReader, Record, RecordSource};
use crate::error::AppError;

#[derive(Debug, Clone)]
struct MemoryGroup {
    name: String,
    header: Record,
    rows: Vec<Record>,
}

/// A record source backed by vectors. Groups can be altered after creation
/// to simulate a source that changes between analysis and extraction.
#[derive(Debug, Default)]
pub struct MemorySource {
    groups: RwLock<Vec<MemoryGroup>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a group.
    pub fn with_group(self, name: &str, header: Record, rows: Vec<Record>) -> Self {
        self.groups
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(MemoryGroup {
                name: name.to_string(),
                header,
                rows,
            });
        self
    }

    pub fn remove_group(&self, name: &str) {
        self.groups
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|g| g.name != name);
    }

    /// Drops every row past `rows`.
    pub fn truncate_group(&self, name: &str, rows: usize) {
        let mut groups = self.groups.write().unwrap_or_else(|p| p.into_inner());
        if let Some(group) = groups.iter_mut().find(|g| g.name == name) {
            group.rows.truncate(rows);
        }
    }

    fn snapshot(&self, name: &str) -> Result<MemoryGroup, AppError> {
        self.groups
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .find(|g| g.name == name)
            .cloned()
            .ok_or_else(|| AppError::GroupMissing(name.to_string()))
    }
}

impl RecordSource for MemorySource {
    fn list_groups(&self) -> Result<Vec<String>, AppError> {
        Ok(self
            .groups
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|g| g.name.clone())
            .collect())
    }

    fn count_rows(&self, name: &str) -> Result<u64, AppError> {
        let groups = self.groups.read().unwrap_or_else(|p| p.into_inner());
        groups
            .iter()
            .find(|g| g.name == name)
            .map(|g| g.rows.len() as u64)
            .ok_or_else(|| AppError::GroupMissing(name.to_string()))
    }

    fn group_header(&self, name: &str) -> Result<Record, AppError> {
        self.snapshot(name).map(|g| g.header)
    }

    fn open_group_reader(&self, name: &str) -> Result<GroupReader, AppError> {
        let group = self.snapshot(name)?;
        Ok(GroupReader {
            header: group.header,
            rows: Box::new(group.rows.into_iter().map(Ok)),
        })
    }
}
