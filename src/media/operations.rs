//! The generation and upload stages.
//!
//! Each stage wraps one collaborator call in the retry policy and converts
//! whatever went wrong into a classified [`StageError`]. Stages work on one
//! artifact at a time and know nothing about batches.

use super::backend::{BackendError, ImageGenerator, ImageUploader, format_deadline};
use super::credentials::CredentialValidator;
use super::params::{GenerateParams, Resolution};
use crate::artifact::Artifact;
use crate::retry::RetryPolicy;
use crate::types::{ArtifactState, ErrorKind, Stage, StageError, TaskResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Diagnostics longer than this are cut before they reach reports.
pub const MAX_DIAGNOSTIC_CHARS: usize = 200;

/// Turns artifacts into local image files.
#[derive(Clone)]
pub struct GenerationStage {
    generator: Arc<dyn ImageGenerator>,
    retry: RetryPolicy,
    output_dir: PathBuf,
    resolution: Resolution,
    model: String,
    timeout: Duration,
}

impl GenerationStage {
    pub fn new(
        generator: Arc<dyn ImageGenerator>,
        retry: RetryPolicy,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            generator,
            retry,
            output_dir: output_dir.into(),
            resolution: Resolution::default(),
            model: String::new(),
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Where `artifact` will be written.
    pub fn target_path(&self, artifact: &Artifact) -> PathBuf {
        self.output_dir.join(&artifact.filename)
    }

    /// Generate one image, moving the artifact to `generated` or
    /// `generation_failed`.
    pub fn generate(&self, artifact: &mut Artifact) -> TaskResult {
        artifact.advance(ArtifactState::Generating);
        match self.try_generate(artifact) {
            Ok(path) => {
                artifact.local_path = Some(path);
                artifact.advance(ArtifactState::Generated);
                TaskResult::succeeded(artifact, Stage::Generation)
            }
            Err(err) => {
                artifact.local_path = None;
                artifact.advance(ArtifactState::GenerationFailed);
                TaskResult::failed(artifact, Stage::Generation, &err)
            }
        }
    }

    fn try_generate(&self, artifact: &Artifact) -> Result<PathBuf, StageError> {
        std::fs::create_dir_all(&self.output_dir).map_err(|e| {
            StageError::new(
                ErrorKind::FilesystemError,
                format!("cannot create {}: {e}", self.output_dir.display()),
            )
        })?;

        let output = self.target_path(artifact);
        if output.exists() {
            std::fs::remove_file(&output).map_err(|e| {
                StageError::new(
                    ErrorKind::FilesystemError,
                    format!("cannot remove stale {}: {e}", output.display()),
                )
            })?;
        }

        let params = GenerateParams {
            prompt: artifact.prompt.clone(),
            size: artifact.aspect_ratio.pixel_size(),
            resolution: self.resolution,
            model: self.model.clone(),
            output: output.clone(),
            timeout: self.timeout,
        };

        self.retry
            .run(|| {
                self.generator.generate(&params)?;
                if output.is_file() {
                    Ok(())
                } else {
                    Err(BackendError::MissingOutput(output.clone()))
                }
            })
            .map_err(|e| classify_generation_error(&e))?;

        Ok(output)
    }
}

/// Map a generator failure onto the shared taxonomy.
pub fn classify_generation_error(err: &BackendError) -> StageError {
    match err {
        BackendError::Timeout { after } => StageError::new(
            ErrorKind::Timeout,
            format!("generation timed out after {}", format_deadline(after)),
        ),
        BackendError::Io(e) => StageError::new(ErrorKind::FilesystemError, e.to_string()),
        BackendError::Failed { .. } | BackendError::MissingOutput(_) => StageError::new(
            ErrorKind::GenerationFailed,
            truncate_diagnostic(&err.to_string()),
        ),
    }
}

/// Map an uploader failure onto the shared taxonomy.
pub fn classify_upload_error(err: &BackendError) -> StageError {
    match err {
        BackendError::Timeout { after } => StageError::new(
            ErrorKind::Timeout,
            format!("upload timed out after {}", format_deadline(after)),
        ),
        BackendError::Failed { .. } => {
            StageError::new(ErrorKind::UploadFailed, truncate_diagnostic(&err.to_string()))
        }
        BackendError::Io(e) => StageError::new(ErrorKind::FilesystemError, e.to_string()),
        BackendError::MissingOutput(_) => {
            StageError::new(ErrorKind::Unknown, truncate_diagnostic(&err.to_string()))
        }
    }
}

/// Cut a diagnostic to [`MAX_DIAGNOSTIC_CHARS`] characters.
pub fn truncate_diagnostic(text: &str) -> String {
    let text = text.trim();
    match text.char_indices().nth(MAX_DIAGNOSTIC_CHARS) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Pushes generated files to the image host.
pub struct UploadStage {
    uploader: Arc<dyn ImageUploader>,
    retry: RetryPolicy,
    timeout: Duration,
    credentials: CredentialValidator,
}

impl UploadStage {
    pub fn new(uploader: Arc<dyn ImageUploader>, retry: RetryPolicy) -> Self {
        Self {
            uploader,
            retry,
            timeout: Duration::from_secs(60),
            credentials: CredentialValidator::disabled(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_credentials(mut self, credentials: CredentialValidator) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn credentials(&self) -> &CredentialValidator {
        &self.credentials
    }

    /// Upload one file and return its public URL.
    pub fn upload(&self, path: &Path) -> Result<String, StageError> {
        self.credentials.validate_once();

        let stdout = self
            .retry
            .run(|| self.uploader.upload(path, self.timeout))
            .map_err(|e| classify_upload_error(&e))?;

        parse_upload_output(&stdout).ok_or_else(|| {
            let shown = if stdout.trim().is_empty() {
                "<empty>".to_string()
            } else {
                truncate_diagnostic(&stdout)
            };
            StageError::new(
                ErrorKind::Unknown,
                format!("uploader succeeded but printed no URL: {shown}"),
            )
        })
    }

    /// Upload a generated artifact, moving it to `uploaded` or `upload_failed`.
    pub fn upload_artifact(&self, artifact: &mut Artifact) -> TaskResult {
        let Some(path) = artifact.local_path.clone() else {
            let err = StageError::new(
                ErrorKind::FilesystemError,
                format!("{} has no local file to upload", artifact.name),
            );
            return TaskResult::failed(artifact, Stage::Upload, &err);
        };

        artifact.advance(ArtifactState::Uploading);
        match self.upload(&path) {
            Ok(url) => {
                artifact.remote_url = Some(url);
                artifact.advance(ArtifactState::Uploaded);
                TaskResult::succeeded(artifact, Stage::Upload)
            }
            Err(err) => {
                artifact.advance(ArtifactState::UploadFailed);
                TaskResult::failed(artifact, Stage::Upload, &err)
            }
        }
    }
}

/// Extract the image URL from an uploader's output.
///
/// The first line starting with `http://` or `https://` wins. Failing that,
/// the output is parsed as JSON and `url` is read from the object or from the
/// first element of an array.
pub fn parse_upload_output(stdout: &str) -> Option<String> {
    let from_lines = stdout
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("http://") || line.starts_with("https://"));
    if let Some(line) = from_lines {
        return Some(line.to_string());
    }

    let value: serde_json::Value = serde_json::from_str(stdout.trim()).ok()?;
    let entry = match &value {
        serde_json::Value::Array(items) => items.first()?,
        other => other,
    };
    entry
        .get("url")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
}
