//! Archive descriptors and source items.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One file contributing to a category's archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveSourceItem {
    pub path: PathBuf,

    /// Size recorded when the item was contributed
    pub byte_size: u64,

    pub entity_id: String,

    pub category: String,

    #[serde(default)]
    pub semester: Option<String>,

    pub contributed_at: DateTime<Utc>,
}

impl ArchiveSourceItem {
    /// Name the file gets inside an archive.
    pub fn entry_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned())
    }
}

/// One written archive file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivePart {
    pub path: PathBuf,
    pub byte_size: u64,
    pub entry_count: usize,
    /// Hex SHA-256 of the part file
    pub sha256: String,
}

/// Persisted metadata about a category's built archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveDescriptor {
    pub category: String,
    pub parts: Vec<ArchivePart>,
    pub item_count: usize,
    pub total_bytes: u64,
    pub built_at: DateTime<Utc>,
}

impl ArchiveDescriptor {
    pub fn part_paths(&self) -> Vec<PathBuf> {
        self.parts.iter().map(|p| p.path.clone()).collect()
    }

    /// Fresh iff every part exists and nothing newer was contributed since the build.
    pub fn is_fresh(&self, latest_source: Option<DateTime<Utc>>) -> bool {
        let parts_present = !self.parts.is_empty()
            && self.parts.iter().all(|p| Path::new(&p.path).is_file());
        let up_to_date = latest_source.is_none_or(|latest| latest <= self.built_at);
        parts_present && up_to_date
    }
}

/// Result handed to archive consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveOutcome {
    /// Ordered part files, or `None` when nothing could be served
    pub parts: Option<Vec<PathBuf>>,
    /// Whether this call wrote a new archive
    pub rebuilt: bool,
    pub message: String,
}

impl ArchiveOutcome {
    pub fn unchanged(parts: Vec<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            parts: Some(parts),
            rebuilt: false,
            message: message.into(),
        }
    }

    pub fn rebuilt(parts: Vec<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            parts: Some(parts),
            rebuilt: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            parts: None,
            rebuilt: false,
            message: message.into(),
        }
    }
}
