//! Batch checkpoints for resuming interrupted runs.
//!
//! Generating a batch of images costs real money and several minutes. When a
//! run dies halfway (network outage, quota, Ctrl-C), the next run with
//! `--resume` picks up where the last one stopped instead of paying again.
//!
//! # Design
//!
//! A checkpoint records, by filename, which artifacts finished generation,
//! which failed, and which were uploaded (with their URLs). It is written
//! after every artifact so that at most one artifact's work is lost.
//!
//! ## Identity
//!
//! A checkpoint only applies to the exact batch that wrote it. The
//! **config identity** is the SHA-256 of the canonical JSON of the normalized
//! artifact list (defaults made explicit), so cosmetic changes to the input
//! file such as whitespace or key order do not matter, but editing any prompt,
//! aspect ratio, name, or filename does.
//!
//! ## Storage
//!
//! One JSON file per identity, at
//! `<dir>/.article-media-checkpoint-<first 16 hex digits>.json`. A file that is
//! missing, unreadable, from another format version, or for another identity
//! loads as `None`; it is never an error.
//!
//! ## Invariants
//!
//! - `completed ∩ failed = ∅` (a later success clears an earlier failure)
//! - `uploaded ⊆ completed`
//! - `|completed ∪ failed| ≤ total`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::artifact::ArtifactSpec;

/// Version of the checkpoint format. Bump to orphan existing files.
const CHECKPOINT_VERSION: u32 = 1;

const FILE_PREFIX: &str = ".article-media-checkpoint-";

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Persisted progress of one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub config_identity: String,
    pub total: usize,
    pub completed: BTreeSet<String>,
    pub failed: BTreeSet<String>,
    pub uploaded: BTreeSet<String>,
    #[serde(default)]
    pub remote_urls: BTreeMap<String, String>,
}

impl Checkpoint {
    pub fn new(config_identity: impl Into<String>, total: usize) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            timestamp: Utc::now(),
            config_identity: config_identity.into(),
            total,
            completed: BTreeSet::new(),
            failed: BTreeSet::new(),
            uploaded: BTreeSet::new(),
            remote_urls: BTreeMap::new(),
        }
    }

    pub fn mark_generated(&mut self, filename: &str) {
        self.failed.remove(filename);
        self.completed.insert(filename.to_string());
    }

    pub fn mark_failed(&mut self, filename: &str) {
        self.completed.remove(filename);
        self.uploaded.remove(filename);
        self.remote_urls.remove(filename);
        self.failed.insert(filename.to_string());
    }

    pub fn mark_uploaded(&mut self, filename: &str, url: &str) {
        self.mark_generated(filename);
        self.uploaded.insert(filename.to_string());
        self.remote_urls
            .insert(filename.to_string(), url.to_string());
    }

    pub fn is_generated(&self, filename: &str) -> bool {
        self.completed.contains(filename)
    }

    /// URL of a previously uploaded artifact.
    pub fn uploaded_url(&self, filename: &str) -> Option<&str> {
        if self.uploaded.contains(filename) {
            self.remote_urls.get(filename).map(String::as_str)
        } else {
            None
        }
    }

    fn touch(&mut self) {
        self.timestamp = Utc::now();
    }
}

/// Reads and writes the checkpoint for one batch identity.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
    identity: String,
}

impl CheckpointStore {
    pub fn new(dir: &Path, identity: impl Into<String>) -> Self {
        let identity = identity.into();
        let short: String = identity.chars().take(16).collect();
        Self {
            path: dir.join(format!("{FILE_PREFIX}{short}.json")),
            identity,
        }
    }

    /// Store for `specs` in `dir`.
    pub fn for_specs(dir: &Path, specs: &[ArtifactSpec]) -> Self {
        Self::new(dir, fingerprint_specs(specs))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// A fresh checkpoint bound to this store's identity.
    pub fn fresh(&self, total: usize) -> Checkpoint {
        Checkpoint::new(self.identity.clone(), total)
    }

    /// Write `checkpoint`, stamping the current time.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let mut checkpoint = checkpoint.clone();
        checkpoint.touch();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write-then-rename so a crash mid-write leaves the old file intact.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&checkpoint)?)?;
        std::fs::rename(&tmp, &self.path)?;
        tracing::debug!(
            path = %self.path.display(),
            completed = checkpoint.completed.len(),
            failed = checkpoint.failed.len(),
            uploaded = checkpoint.uploaded.len(),
            "checkpoint saved"
        );
        Ok(())
    }

    /// Load the checkpoint for this identity, if a usable one exists.
    pub fn load(&self) -> Option<Checkpoint> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        let checkpoint: Checkpoint = match serde_json::from_str(&content) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "ignoring unreadable checkpoint");
                return None;
            }
        };
        if checkpoint.version != CHECKPOINT_VERSION {
            tracing::debug!(found = checkpoint.version, "ignoring checkpoint from another version");
            return None;
        }
        if checkpoint.config_identity != self.identity {
            tracing::debug!("ignoring checkpoint for a different batch");
            return None;
        }
        Some(checkpoint)
    }

    /// Remove the checkpoint file. Missing files are fine.
    pub fn clear(&self) -> Result<(), CheckpointError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// SHA-256 over the canonical JSON of the normalized specs, as hex.
pub fn fingerprint_specs(specs: &[ArtifactSpec]) -> String {
    let normalized: Vec<ArtifactSpec> = specs.iter().map(ArtifactSpec::normalized).collect();
    // Struct field order is fixed, so serde_json output is canonical.
    let canonical = serde_json::to_vec(&normalized).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(b"article-media-batch\0");
    hasher.update(&canonical);
    format!("{:x}", hasher.finalize())
}
