use crate::config::Thresholds;
use crate::core::cluster::BootstrapFailure;
use crate::core::filter::FaceRejection;
use crate::core::registry::DuplicateReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const SUMMARY_FILE: &str = "dataset_summary.json";

/// Why a candidate was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectKind {
    NoFace,
    FaceTooSmall,
    FaceTooLarge,
    MultipleFaces,
    DuplicateHash,
    DuplicateStructure,
    DuplicateEmbedding,
    WrongIdentity,
    DownloadFailure,
    Unreadable,
    EmbeddingFailure,
    Timeout,
}

impl RejectKind {
    pub fn name(self) -> &'static str {
        match self {
            RejectKind::NoFace => "no_face",
            RejectKind::FaceTooSmall => "face_too_small",
            RejectKind::FaceTooLarge => "face_too_large",
            RejectKind::MultipleFaces => "multiple_faces",
            RejectKind::DuplicateHash => "duplicate_hash",
            RejectKind::DuplicateStructure => "duplicate_structure",
            RejectKind::DuplicateEmbedding => "duplicate_embedding",
            RejectKind::WrongIdentity => "wrong_identity",
            RejectKind::DownloadFailure => "download_failure",
            RejectKind::Unreadable => "unreadable",
            RejectKind::EmbeddingFailure => "embedding_failure",
            RejectKind::Timeout => "timeout",
        }
    }

    /// Coarse bucket used in the summary totals.
    pub fn group(self) -> &'static str {
        match self {
            RejectKind::NoFace | RejectKind::FaceTooSmall | RejectKind::FaceTooLarge => "no_face",
            RejectKind::MultipleFaces => "multi_face",
            RejectKind::DuplicateHash
            | RejectKind::DuplicateStructure
            | RejectKind::DuplicateEmbedding => "duplicate",
            RejectKind::WrongIdentity => "wrong_identity",
            RejectKind::DownloadFailure => "download_failure",
            RejectKind::Unreadable | RejectKind::EmbeddingFailure | RejectKind::Timeout => "other",
        }
    }
}

impl fmt::Display for RejectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<&FaceRejection> for RejectKind {
    fn from(rejection: &FaceRejection) -> Self {
        match rejection {
            FaceRejection::NoFace => RejectKind::NoFace,
            FaceRejection::FaceTooSmall => RejectKind::FaceTooSmall,
            FaceRejection::FaceTooLarge => RejectKind::FaceTooLarge,
            FaceRejection::MultipleFaces(_) => RejectKind::MultipleFaces,
        }
    }
}

impl From<&DuplicateReason> for RejectKind {
    fn from(reason: &DuplicateReason) -> Self {
        match reason {
            DuplicateReason::Hash { .. } => RejectKind::DuplicateHash,
            DuplicateReason::Structure { .. } => RejectKind::DuplicateStructure,
            DuplicateReason::Embedding { .. } => RejectKind::DuplicateEmbedding,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub kind: RejectKind,
    pub detail: String,
}

impl Rejection {
    pub fn new(kind: RejectKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

/// Result of running one candidate through the pipeline.
#[derive(Debug)]
pub enum Outcome<E> {
    Accepted(PathBuf),
    Rejected(Rejection),
    /// An error that ends the subject's run.
    Error(E),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectState {
    Done,
    Exhausted,
    Failed,
}

/// How identity was checked while collecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum IdentityMode {
    Verified {
        cluster_size: usize,
        sample_size: usize,
    },
    /// Reference embedding read from an earlier run's exemplar.
    Loaded,
    /// Stored images already met the target; no candidate was checked.
    NotRequired,
    /// No reference; every face was treated as the subject.
    Permissive { cause: String },
}

impl IdentityMode {
    pub fn permissive(failure: &BootstrapFailure) -> Self {
        IdentityMode::Permissive {
            cause: failure.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectReport {
    pub name: String,
    pub accepted_count: usize,
    pub target_count: usize,
    pub shortfall: usize,
    pub state: SubjectState,
    pub rounds: usize,
    pub candidates: usize,
    /// Files already present from an earlier run.
    pub resumed: usize,
    pub identity: IdentityMode,
    pub rejections: BTreeMap<RejectKind, usize>,
    pub rejection_groups: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubjectReport {
    pub fn new(name: &str, target_count: usize) -> Self {
        Self {
            name: name.to_string(),
            accepted_count: 0,
            target_count,
            shortfall: target_count,
            state: SubjectState::Exhausted,
            rounds: 0,
            candidates: 0,
            resumed: 0,
            identity: IdentityMode::NotRequired,
            rejections: BTreeMap::new(),
            rejection_groups: BTreeMap::new(),
            error: None,
        }
    }

    pub fn record_rejection(&mut self, kind: RejectKind) {
        *self.rejections.entry(kind).or_insert(0) += 1;
        *self.rejection_groups.entry(kind.group().to_string()).or_insert(0) += 1;
    }

    pub fn rejected(&self, kind: RejectKind) -> usize {
        self.rejections.get(&kind).copied().unwrap_or(0)
    }

    pub fn total_rejected(&self) -> usize {
        self.rejections.values().sum()
    }

    pub fn finish(&mut self, accepted_count: usize, state: SubjectState) {
        self.accepted_count = accepted_count;
        self.shortfall = self.target_count.saturating_sub(accepted_count);
        self.state = state;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub generated_at: DateTime<Utc>,
    pub thresholds: Thresholds,
    pub total_accepted: usize,
    pub total_target: usize,
    pub subjects: Vec<SubjectReport>,
}

impl DatasetSummary {
    pub fn new(thresholds: Thresholds, subjects: Vec<SubjectReport>) -> Self {
        Self {
            generated_at: Utc::now(),
            thresholds,
            total_accepted: subjects.iter().map(|s| s.accepted_count).sum(),
            total_target: subjects.iter().map(|s| s.target_count).sum(),
            subjects,
        }
    }
}

pub fn write_summary(output: &Path, summary: &DatasetSummary) -> std::io::Result<PathBuf> {
    fs::create_dir_all(output)?;
    let path = output.join(SUMMARY_FILE);
    let json = serde_json::to_string_pretty(summary).map_err(std::io::Error::other)?;
    fs::write(&path, json)?;
    Ok(path)
}
