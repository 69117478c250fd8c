//! Shared types used across all pipeline stages.
//!
//! The generation stage, the upload stage, and the batch orchestrator all
//! report through these types, and [`BatchResult`] is serialized as-is into
//! the JSON report. Field names are part of the report format.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::artifact::Artifact;

/// Failure taxonomy shared by every stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The generator exited non-zero or produced no output file.
    GenerationFailed,
    /// A collaborator call exceeded its wall-clock budget.
    Timeout,
    /// Local I/O failed (permissions, missing directory, ...).
    FilesystemError,
    /// The uploader exited non-zero.
    UploadFailed,
    /// The batch configuration was malformed.
    ConfigError,
    /// Anything else, including success-without-URL from the uploader.
    Unknown,
    /// Abandoned because a fail-fast batch aborted before it ran.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::GenerationFailed => "generation_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::FilesystemError => "filesystem_error",
            ErrorKind::UploadFailed => "upload_failed",
            ErrorKind::ConfigError => "config_error",
            ErrorKind::Unknown => "unknown",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage an outcome belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Generation,
    Upload,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Generation => "generation",
            Stage::Upload => "upload",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-artifact lifecycle.
///
/// ```text
/// pending → generating → generated → uploading → uploaded
///                      ↘ generation_failed      ↘ upload_failed
/// ```
///
/// States only move forward. `generated` is terminal when uploads are
/// disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactState {
    #[default]
    Pending,
    Generating,
    Generated,
    GenerationFailed,
    Uploading,
    Uploaded,
    UploadFailed,
}

impl ArtifactState {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactState::Pending => "pending",
            ArtifactState::Generating => "generating",
            ArtifactState::Generated => "generated",
            ArtifactState::GenerationFailed => "generation_failed",
            ArtifactState::Uploading => "uploading",
            ArtifactState::Uploaded => "uploaded",
            ArtifactState::UploadFailed => "upload_failed",
        }
    }

    /// Whether `next` is a legal successor of `self`.
    ///
    /// `pending → generated` and `pending → uploaded` are allowed so that
    /// artifacts restored from a checkpoint can skip work they already did.
    pub fn can_advance_to(self, next: ArtifactState) -> bool {
        use ArtifactState::*;
        matches!(
            (self, next),
            (Pending, Generating)
                | (Pending, Generated)
                | (Pending, Uploaded)
                | (Generating, Generated)
                | (Generating, GenerationFailed)
                | (Generated, Uploading)
                | (Uploading, Uploaded)
                | (Uploading, UploadFailed)
        )
    }

    /// True for states no stage will move the artifact out of.
    pub fn is_terminal(self, upload_enabled: bool) -> bool {
        match self {
            ArtifactState::GenerationFailed
            | ArtifactState::Uploaded
            | ArtifactState::UploadFailed => true,
            ArtifactState::Generated => !upload_enabled,
            _ => false,
        }
    }
}

impl fmt::Display for ArtifactState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified stage failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct StageError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Outcome of one artifact passing through one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub name: String,
    pub filename: String,
    pub stage: Stage,
    pub local_path: Option<PathBuf>,
    pub remote_url: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl TaskResult {
    pub fn succeeded(artifact: &Artifact, stage: Stage) -> Self {
        Self {
            name: artifact.name.clone(),
            filename: artifact.filename.clone(),
            stage,
            local_path: artifact.local_path.clone(),
            remote_url: artifact.remote_url.clone(),
            success: true,
            error: None,
            error_kind: None,
        }
    }

    pub fn failed(artifact: &Artifact, stage: Stage, err: &StageError) -> Self {
        Self {
            name: artifact.name.clone(),
            filename: artifact.filename.clone(),
            stage,
            local_path: artifact.local_path.clone(),
            remote_url: artifact.remote_url.clone(),
            success: false,
            error: Some(err.message.clone()),
            error_kind: Some(err.kind),
        }
    }

    /// The failure as a [`StageError`], if this result is a failure.
    pub fn stage_error(&self) -> Option<StageError> {
        self.error_kind.map(|kind| {
            StageError::new(kind, self.error.clone().unwrap_or_default())
        })
    }
}

/// One entry of [`BatchResult::errors`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub artifact_name: String,
    pub stage: Stage,
    pub error_kind: ErrorKind,
    pub message: String,
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed during {} ({}): {}",
            self.artifact_name, self.stage, self.error_kind, self.message
        )
    }
}

/// Final snapshot of one artifact, used for reports and document rewriting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageReport {
    pub name: String,
    pub filename: String,
    pub prompt: String,
    pub aspect_ratio: String,
    pub local_path: Option<PathBuf>,
    pub remote_url: Option<String>,
    pub state: ArtifactState,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
}

/// Aggregate outcome of a batch run.
///
/// Invariants: `uploaded <= generated <= total`, and `images` holds exactly
/// one entry per input artifact in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub total: usize,
    pub generated: usize,
    pub uploaded: usize,
    pub failed: usize,
    /// Artifacts restored from a checkpoint instead of being regenerated.
    #[serde(default)]
    pub skipped: usize,
    pub errors: Vec<ErrorRecord>,
    pub images: Vec<ImageReport>,
}

impl BatchResult {
    /// True when nothing failed and nothing was abandoned.
    pub fn is_complete_success(&self) -> bool {
        self.failed == 0 && self.images.iter().all(|img| img.success)
    }

    /// Look up an image snapshot by artifact name.
    pub fn image(&self, name: &str) -> Option<&ImageReport> {
        self.images.iter().find(|img| img.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::GenerationFailed).unwrap();
        assert_eq!(json, "\"generation_failed\"");
        let json = serde_json::to_string(&ErrorKind::FilesystemError).unwrap();
        assert_eq!(json, "\"filesystem_error\"");
    }

    #[test]
    fn state_machine_moves_forward_only() {
        use ArtifactState::*;
        assert!(Pending.can_advance_to(Generating));
        assert!(Generating.can_advance_to(Generated));
        assert!(Generating.can_advance_to(GenerationFailed));
        assert!(Generated.can_advance_to(Uploading));
        assert!(Uploading.can_advance_to(Uploaded));
        assert!(Uploading.can_advance_to(UploadFailed));

        assert!(!Generated.can_advance_to(Generating));
        assert!(!Uploaded.can_advance_to(Uploading));
        assert!(!GenerationFailed.can_advance_to(Uploading));
        assert!(!UploadFailed.can_advance_to(Uploaded));
        assert!(!Generating.can_advance_to(Uploading));
    }

    #[test]
    fn generated_is_terminal_only_without_upload() {
        assert!(ArtifactState::Generated.is_terminal(false));
        assert!(!ArtifactState::Generated.is_terminal(true));
        assert!(ArtifactState::Uploaded.is_terminal(true));
        assert!(ArtifactState::GenerationFailed.is_terminal(true));
        assert!(!ArtifactState::Pending.is_terminal(false));
    }

    #[test]
    fn task_result_error_kind_tracks_success() {
        let artifact = Artifact::new("cover", "a lighthouse at dawn");
        let ok = TaskResult::succeeded(&artifact, Stage::Generation);
        assert!(ok.success);
        assert!(ok.error_kind.is_none());
        assert!(ok.stage_error().is_none());

        let err = StageError::new(ErrorKind::Timeout, "generation timed out after 120s");
        let failed = TaskResult::failed(&artifact, Stage::Generation, &err);
        assert!(!failed.success);
        assert_eq!(failed.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(failed.stage_error(), Some(err));
    }

    #[test]
    fn error_record_display_names_artifact_and_stage() {
        let record = ErrorRecord {
            artifact_name: "cover".into(),
            stage: Stage::Upload,
            error_kind: ErrorKind::UploadFailed,
            message: "picgo exited with status 1".into(),
        };
        assert_eq!(
            record.to_string(),
            "cover failed during upload (upload_failed): picgo exited with status 1"
        );
    }
}
