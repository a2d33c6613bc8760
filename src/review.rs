//! Append log for fixes deferred to human review.
//!
//! Low-confidence fixes under the `defer-review` action land here instead of
//! in the working tree. The file is a YAML sequence; appends re-read the
//! existing content, merge, and rewrite through a temp-file rename so a crash
//! mid-run never corrupts it.

use crate::model::{Category, Complexity};
use crate::state::atomic_write;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Default review file name, kept alongside the repository being remediated.
pub const REVIEW_FILE_NAME: &str = ".kantra-ai-review.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewItem {
    pub violation_id: String,
    pub file_path: String,
    pub line_number: u32,
    pub description: String,
    pub confidence: f64,
    pub reason: String,
    pub category: Category,
    pub effort: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<Complexity>,
}

/// Serialized writer for the review file. Batch workers append concurrently;
/// the mutex keeps the read-merge-rewrite cycle atomic.
pub struct ReviewLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ReviewLog {
    pub fn new(input_dir: &Path) -> Self {
        Self {
            path: input_dir.join(REVIEW_FILE_NAME),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an item unless an entry with the same
    /// `(violation_id, file_path, line_number)` already exists.
    pub fn append(&self, item: ReviewItem) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut items = self.read_items()?;
        let exists = items.iter().any(|existing| {
            existing.violation_id == item.violation_id
                && existing.file_path == item.file_path
                && existing.line_number == item.line_number
        });
        if !exists {
            items.push(item);
            let raw = serde_yaml::to_string(&items).context("Failed to serialize review items")?;
            atomic_write(&self.path, raw.as_bytes())?;
        }
        Ok(())
    }

    pub fn read_items(&self) -> Result<Vec<ReviewItem>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read review file {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse review file {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(violation: &str, path: &str, line: u32) -> ReviewItem {
        ReviewItem {
            violation_id: violation.to_string(),
            file_path: path.to_string(),
            line_number: line,
            description: "desc".to_string(),
            confidence: 0.55,
            reason: "confidence 0.55 below medium threshold 0.80".to_string(),
            category: Category::Mandatory,
            effort: 5,
            complexity: Some(Complexity::Medium),
        }
    }

    #[test]
    fn test_append_creates_file_with_snake_case_fields() {
        let dir = tempfile::tempdir().unwrap();
        let log = ReviewLog::new(dir.path());
        log.append(item("v1", "src/A.java", 10)).unwrap();

        let raw = std::fs::read_to_string(log.path()).unwrap();
        for field in [
            "violation_id",
            "file_path",
            "line_number",
            "description",
            "confidence",
            "reason",
            "category",
            "effort",
            "complexity",
        ] {
            assert!(raw.contains(field), "missing field {field} in:\n{raw}");
        }
    }

    #[test]
    fn test_append_merges_with_existing_entries() {
        let dir = tempfile::tempdir().unwrap();
        let log = ReviewLog::new(dir.path());
        log.append(item("v1", "src/A.java", 10)).unwrap();
        log.append(item("v2", "src/B.java", 20)).unwrap();

        let items = log.read_items().unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn test_append_dedupes_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let log = ReviewLog::new(dir.path());
        log.append(item("v1", "src/A.java", 10)).unwrap();
        log.append(item("v1", "src/A.java", 10)).unwrap();

        assert_eq!(log.read_items().unwrap().len(), 1);
    }

    #[test]
    fn test_read_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = ReviewLog::new(dir.path());
        assert!(log.read_items().unwrap().is_empty());
    }
}
