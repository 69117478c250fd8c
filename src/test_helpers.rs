//! Shared test utilities for the article-media test suite.
//!
//! Provides batch fixtures, runner constructors wired to the mock backends,
//! and assertions over [`BatchResult`] invariants.
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let tmp = TempDir::new().unwrap();
//! let runner = mock_runner(
//!     MockGenerator::new(),
//!     MockUploader::new(),
//!     tmp.path(),
//!     fast_options(FailurePolicy::FailFast),
//! );
//! let mut batch = artifacts(3);
//! let result = runner.run_serial(&mut batch).unwrap();
//!
//! assert_batch_invariants(&result, &batch);
//! assert_eq!(image_names(&result), ["img-1", "img-2", "img-3"]);
//! ```

use std::path::Path;
use std::sync::Arc;

use crate::artifact::{Artifact, ArtifactSpec, artifacts_from_specs};
use crate::batch::{BatchOptions, BatchRunner, FailurePolicy, Pacing};
use crate::media::backend::tests::{MockGenerator, MockUploader};
use crate::media::{GenerationStage, UploadStage};
use crate::retry::RetryPolicy;
use crate::types::{ArtifactState, BatchResult, ImageReport};

// =========================================================================
// Fixtures
// =========================================================================

/// `n` specs named `img-1..=n` with prompts `prompt 1..=n`.
pub fn specs(n: usize) -> Vec<ArtifactSpec> {
    (1..=n)
        .map(|i| ArtifactSpec::new(format!("img-{i}"), format!("prompt {i}")))
        .collect()
}

/// Fresh artifacts for [`specs`].
pub fn artifacts(n: usize) -> Vec<Artifact> {
    artifacts_from_specs(&specs(n))
}

/// Options with no pacing, so tests do not sleep.
pub fn fast_options(policy: FailurePolicy) -> BatchOptions {
    BatchOptions {
        policy,
        pacing: Pacing::none(),
        ..BatchOptions::default()
    }
}

// =========================================================================
// Runners
// =========================================================================

/// Runner writing into `dir`, without retries, keeping handles to the mocks.
pub fn runner_with(
    generator: Arc<MockGenerator>,
    uploader: Arc<MockUploader>,
    dir: &Path,
    options: BatchOptions,
) -> BatchRunner {
    let generation = GenerationStage::new(generator, RetryPolicy::no_retry(), dir);
    let upload = UploadStage::new(uploader, RetryPolicy::no_retry());
    BatchRunner::new(generation, upload, options)
}

/// [`runner_with`] for tests that never inspect the mocks afterwards.
pub fn mock_runner(
    generator: MockGenerator,
    uploader: MockUploader,
    dir: &Path,
    options: BatchOptions,
) -> BatchRunner {
    runner_with(Arc::new(generator), Arc::new(uploader), dir, options)
}

// =========================================================================
// Result lookups and assertions
// =========================================================================

/// Image names in report order.
pub fn image_names(result: &BatchResult) -> Vec<&str> {
    result.images.iter().map(|i| i.name.as_str()).collect()
}

/// Find an image report by name. Panics if not found.
pub fn find_report<'a>(result: &'a BatchResult, name: &str) -> &'a ImageReport {
    result.image(name).unwrap_or_else(|| {
        let names = image_names(result);
        panic!("image '{name}' not found. Available: {names:?}")
    })
}

/// Assert the structural invariants every batch result must satisfy.
pub fn assert_batch_invariants(result: &BatchResult, artifacts: &[Artifact]) {
    assert_eq!(result.total, artifacts.len(), "total mismatch");
    let expected: Vec<&str> = artifacts.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(image_names(result), expected, "images out of declaration order");

    assert!(
        result.uploaded <= result.generated && result.generated <= result.total,
        "counters out of order: uploaded {} generated {} total {}",
        result.uploaded,
        result.generated,
        result.total
    );

    for image in &result.images {
        assert_eq!(
            image.error_kind.is_some(),
            !image.success,
            "error_kind/success disagree for '{}'",
            image.name
        );
    }

    assert_eq!(result.errors.len(), result.failed, "errors/failed mismatch");

    let in_state = |states: &[ArtifactState]| {
        result
            .images
            .iter()
            .filter(|img| states.contains(&img.state))
            .count()
    };
    assert_eq!(
        result.generated,
        in_state(&[
            ArtifactState::Generated,
            ArtifactState::Uploading,
            ArtifactState::Uploaded,
            ArtifactState::UploadFailed,
        ]),
        "generated counter disagrees with image states"
    );
    assert_eq!(
        result.uploaded,
        in_state(&[ArtifactState::Uploaded]),
        "uploaded counter disagrees with image states"
    );
    assert_eq!(
        result.failed,
        in_state(&[ArtifactState::GenerationFailed, ArtifactState::UploadFailed]),
        "failed counter disagrees with image states"
    );
}
