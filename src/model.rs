use std::path::{Path, PathBuf};

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::path::resolve_for_containment;

/// Final word on a video's health for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationDecision {
    Pass,
    FailCorrupt,
    FailLowQuality,
    FailDuplicate,
    FailSample,
    Unknown,
}

impl ValidationDecision {
    /// Low quality is retain-but-flag; only Pass and FailLowQuality files
    /// survive to the destination.
    pub fn is_retainable(self) -> bool {
        matches!(
            self,
            ValidationDecision::Pass | ValidationDecision::FailLowQuality
        )
    }
}

/// Ground-truth label for a recorded decision, fed back into threshold
/// adaptation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeLabel {
    TruePositive,
    TrueNegative,
    FalsePositive,
    FalseNegative,
    UserOverride,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskTier {
    Unknown,
    Hdd,
    Ssd,
    Nvme,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Write,
    Delete,
    Move,
    Overwrite,
}

/// A proposed file operation. Constructed immediately before an invariant
/// check; never reused across checks.
#[derive(Debug, Clone)]
pub struct FileOperation {
    pub kind: OperationKind,
    pub target: PathBuf,
    pub destination: Option<PathBuf>,
    pub timestamp: DateTime<Utc>,
}

impl FileOperation {
    pub fn delete(target: impl Into<PathBuf>) -> Self {
        Self {
            kind: OperationKind::Delete,
            target: target.into(),
            destination: None,
            timestamp: Utc::now(),
        }
    }

    pub fn move_to(target: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            kind: OperationKind::Move,
            target: target.into(),
            destination: Some(destination.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn write(target: impl Into<PathBuf>) -> Self {
        Self {
            kind: OperationKind::Write,
            target: target.into(),
            destination: None,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub path: PathBuf,
    pub decision: ValidationDecision,
    pub timestamp: DateTime<Utc>,
    pub duration_secs: Option<f64>,
    pub bitrate_kbps: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub note: String,
}

impl ValidationResult {
    pub fn new(
        path: impl Into<PathBuf>,
        decision: ValidationDecision,
        note: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            decision,
            timestamp: Utc::now(),
            duration_secs: None,
            bitrate_kbps: None,
            width: None,
            height: None,
            note: note.into(),
        }
    }
}

/// Session-scoped map from resolved path to the last validation result.
/// Owned by the driver and passed by reference into the components that
/// need it; dies with the run.
#[derive(Debug, Default)]
pub struct ValidationCache {
    entries: AHashMap<PathBuf, ValidationResult>,
}

impl ValidationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, result: ValidationResult) {
        let key = resolve_for_containment(&result.path);
        self.entries.insert(key, result);
    }

    pub fn get(&self, path: &Path) -> Option<&ValidationResult> {
        self.entries.get(&resolve_for_containment(path))
    }

    pub fn decision_for(&self, path: &Path) -> Option<ValidationDecision> {
        self.get(path).map(|r| r.decision)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn results(&self) -> impl Iterator<Item = &ValidationResult> {
        self.entries.values()
    }
}

/// Append-only record of one decision and what it turned out to be worth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationOutcome {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub duration_ms: u64,
    pub decision: ValidationDecision,
    pub outcome: OutcomeLabel,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateRecord {
    pub candidate: PathBuf,
    pub keeper: PathBuf,
    pub reason: String,
}

/// Folder lifecycle states; legal transitions live in the safety engine's
/// adjacency table (I7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FolderState {
    Scanned,
    Repairing,
    Extracting,
    Validating,
    Moving,
    Cleaning,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Music,
    Images,
    Documents,
}

#[derive(Debug, Clone)]
pub struct VideoFolder {
    pub path: PathBuf,
    pub video_count: usize,
    pub archive_part_count: usize,
    pub repair_part_count: usize,
}

#[derive(Debug, Clone)]
pub struct ContentFolder {
    pub path: PathBuf,
    pub kind: ContentKind,
    pub file_count: usize,
}

/// Pre-computed classification of the source tree. Built once per run,
/// read-only during execution.
#[derive(Debug, Default, Clone)]
pub struct WorkPlan {
    pub video_folders: Vec<VideoFolder>,
    pub content_folders: Vec<ContentFolder>,
    pub junk_folders: Vec<PathBuf>,
    pub loose_videos: Vec<PathBuf>,
}

impl WorkPlan {
    pub fn total_folders(&self) -> usize {
        self.video_folders.len() + self.content_folders.len() + self.junk_folders.len()
    }
}
