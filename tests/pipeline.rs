//! End-to-end batch behavior through the public API.
//!
//! The collaborators are in-process fakes: a generator that writes a small
//! file (or fails for scripted prompts) and an uploader that prints a
//! PicGo-style success block. Nothing here shells out or touches the network.
//!
//! Run with: cargo test --test pipeline

use article_media::artifact::{Artifact, ArtifactSpec, artifacts_from_specs, parse_batch_config};
use article_media::batch::{BatchError, BatchOptions, BatchRunner, FailurePolicy, Pacing, RunMode};
use article_media::checkpoint::CheckpointStore;
use article_media::config::Settings;
use article_media::estimate::estimate;
use article_media::markdown::{find_placeholders, rewrite_placeholders, specs_from_placeholders, uploaded_urls};
use article_media::media::{
    BackendError, GenerateParams, GenerationStage, ImageGenerator, ImageUploader, Resolution,
    UploadStage,
};
use article_media::retry::{RetryPolicy, Retryable};
use article_media::types::{BatchResult, ErrorKind, Stage};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

// =========================================================================
// Fakes
// =========================================================================

/// Writes the output file unless the prompt is listed in `failing`.
#[derive(Default)]
struct FakeGenerator {
    failing: HashSet<String>,
    /// Per-prompt sleep before answering.
    slow: Vec<(String, Duration)>,
    calls: Mutex<Vec<String>>,
}

impl FakeGenerator {
    fn failing(prompts: &[&str]) -> Self {
        Self {
            failing: prompts.iter().map(|p| p.to_string()).collect(),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl ImageGenerator for FakeGenerator {
    fn generate(&self, params: &GenerateParams) -> Result<(), BackendError> {
        self.calls.lock().unwrap().push(params.prompt.clone());
        if let Some((_, delay)) = self.slow.iter().find(|(p, _)| *p == params.prompt) {
            std::thread::sleep(*delay);
        }
        if self.failing.contains(&params.prompt) {
            return Err(BackendError::Failed {
                command: "fake-gen".into(),
                status: "exit status: 1".into(),
                diagnostic: format!("refused: {}", params.prompt),
            });
        }
        std::fs::write(&params.output, b"jpeg")?;
        Ok(())
    }
}

/// Succeeds with a URL unless `silent` (exit 0, no URL) or `failing`.
#[derive(Default)]
struct FakeUploader {
    silent: bool,
    failing: bool,
    uploads: Mutex<Vec<PathBuf>>,
}

impl FakeUploader {
    fn uploads(&self) -> Vec<PathBuf> {
        self.uploads.lock().unwrap().clone()
    }
}

impl ImageUploader for FakeUploader {
    fn upload(&self, path: &Path, _timeout: Duration) -> Result<String, BackendError> {
        self.uploads.lock().unwrap().push(path.to_path_buf());
        if self.failing {
            return Err(BackendError::Failed {
                command: "fake-upload".into(),
                status: "exit status: 2".into(),
                diagnostic: "quota exceeded".into(),
            });
        }
        if self.silent {
            return Ok("done\n".into());
        }
        let name = path.file_name().unwrap().to_string_lossy();
        Ok(format!("[PicGo SUCCESS]:\nhttps://cdn.test/{name}\n"))
    }
}

fn specs(n: usize) -> Vec<ArtifactSpec> {
    (1..=n)
        .map(|i| ArtifactSpec::new(format!("img-{i}"), format!("prompt {i}")))
        .collect()
}

fn options(policy: FailurePolicy) -> BatchOptions {
    BatchOptions {
        policy,
        pacing: Pacing::none(),
        ..BatchOptions::default()
    }
}

fn runner(
    generator: Arc<FakeGenerator>,
    uploader: Arc<FakeUploader>,
    dir: &Path,
    options: BatchOptions,
) -> BatchRunner {
    BatchRunner::new(
        GenerationStage::new(generator, RetryPolicy::no_retry(), dir),
        UploadStage::new(uploader, RetryPolicy::no_retry()),
        options,
    )
}

fn assert_invariants(result: &BatchResult, artifacts: &[Artifact]) {
    assert_eq!(result.total, artifacts.len());
    let names: Vec<&str> = result.images.iter().map(|i| i.name.as_str()).collect();
    let expected: Vec<&str> = artifacts.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, expected);
    assert!(result.uploaded <= result.generated);
    assert!(result.generated <= result.total);
    for image in &result.images {
        assert_eq!(image.error_kind.is_some(), !image.success, "{}", image.name);
    }
}

const MODES: [RunMode; 2] = [RunMode::Serial, RunMode::Parallel { workers: 2 }];

// =========================================================================
// Result contract, both modes
// =========================================================================

#[test]
fn every_artifact_appears_once_for_any_batch_size() {
    for n in [0, 1, 4] {
        for mode in MODES {
            let tmp = TempDir::new().unwrap();
            let generator = Arc::new(FakeGenerator::failing(&["prompt 2"]));
            let r = runner(generator, Arc::default(), tmp.path(), options(FailurePolicy::ContinueOnError));
            let mut batch = artifacts_from_specs(&specs(n));

            let result = r.run(&mut batch, mode).unwrap();

            assert_invariants(&result, &batch);
        }
    }
}

#[test]
fn two_serial_artifacts_generate_and_upload() {
    let tmp = TempDir::new().unwrap();
    let uploader = Arc::new(FakeUploader::default());
    let r = runner(Arc::default(), uploader.clone(), tmp.path(), options(FailurePolicy::FailFast));
    let mut batch = artifacts_from_specs(&specs(2));

    let result = r.run_serial(&mut batch).unwrap();

    assert_eq!(
        (result.total, result.generated, result.uploaded, result.failed),
        (2, 2, 2, 0)
    );
    assert_eq!(
        result.images[0].remote_url.as_deref(),
        Some("https://cdn.test/img-1.jpg")
    );
    assert_eq!(
        result.images[1].remote_url.as_deref(),
        Some("https://cdn.test/img-2.jpg")
    );
    assert_eq!(uploader.uploads().len(), 2);
}

#[test]
fn upload_without_url_is_an_unknown_failure() {
    let tmp = TempDir::new().unwrap();
    let uploader = Arc::new(FakeUploader {
        silent: true,
        ..FakeUploader::default()
    });
    let r = runner(Arc::default(), uploader, tmp.path(), options(FailurePolicy::ContinueOnError));
    let mut batch = artifacts_from_specs(&specs(1));

    let result = r.run(&mut batch, RunMode::Parallel { workers: 1 }).unwrap();

    let image = &result.images[0];
    assert!(!image.success);
    assert_eq!(image.error_kind, Some(ErrorKind::Unknown));
    assert_eq!(result.errors[0].stage, Stage::Upload);
    assert_invariants(&result, &batch);
}

// =========================================================================
// Failure policies
// =========================================================================

#[test]
fn parallel_fail_fast_second_of_three_fails() {
    let tmp = TempDir::new().unwrap();
    let generator = Arc::new(FakeGenerator {
        slow: vec![("prompt 2".into(), Duration::from_millis(150))],
        ..FakeGenerator::failing(&["prompt 2"])
    });
    let uploader = Arc::new(FakeUploader::default());
    let r = runner(generator, uploader.clone(), tmp.path(), options(FailurePolicy::FailFast));
    let mut batch = artifacts_from_specs(&specs(3));

    let err = r.run_parallel(&mut batch, 2).unwrap_err();

    let BatchError::Aborted { failure, partial } = err else {
        panic!("expected an abort");
    };
    assert_eq!(failure.artifact_name, "img-2");
    assert_eq!(failure.error_kind, ErrorKind::GenerationFailed);
    assert!(failure.message.contains("refused: prompt 2"));
    assert!((1..=2).contains(&partial.generated));
    assert!(partial.failed >= 1);
    assert_eq!(partial.uploaded, 0);
    assert!(uploader.uploads().is_empty());
}

#[test]
fn fail_fast_never_reports_unstarted_work_as_completed() {
    let tmp = TempDir::new().unwrap();
    let generator = Arc::new(FakeGenerator::failing(&["prompt 1"]));
    let r = runner(generator.clone(), Arc::default(), tmp.path(), options(FailurePolicy::FailFast));
    let mut batch = artifacts_from_specs(&specs(8));

    let err = r.run_parallel(&mut batch, 1).unwrap_err();

    let partial = err.partial().unwrap();
    let started: HashSet<String> = generator.calls().into_iter().collect();
    for (image, spec) in partial.images.iter().zip(specs(8)) {
        if !started.contains(&spec.prompt) {
            assert!(!image.success, "{} never started", image.name);
            assert_eq!(image.error_kind, Some(ErrorKind::Cancelled));
        }
    }
    assert_eq!(partial.generated, 0);
}

#[test]
fn continue_on_error_runs_to_completion() {
    let tmp = TempDir::new().unwrap();
    let generator = Arc::new(FakeGenerator::failing(&["prompt 1", "prompt 3"]));
    let uploader = Arc::new(FakeUploader {
        failing: true,
        ..FakeUploader::default()
    });
    let r = runner(generator, uploader.clone(), tmp.path(), options(FailurePolicy::ContinueOnError));
    let mut batch = artifacts_from_specs(&specs(4));

    let result = r.run_parallel(&mut batch, 2).unwrap();

    assert_eq!(result.failed, 4);
    assert_eq!(result.errors.len(), result.failed);
    assert_eq!(result.generated, 2);
    assert_eq!(uploader.uploads().len(), 2);
    assert!(
        result
            .errors
            .iter()
            .filter(|e| e.stage == Stage::Upload)
            .all(|e| e.error_kind == ErrorKind::UploadFailed)
    );
    assert_invariants(&result, &batch);
}

// =========================================================================
// Retry
// =========================================================================

#[derive(Debug)]
struct Flaky(&'static str);

impl fmt::Display for Flaky {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl Retryable for Flaky {}

#[test]
fn transient_failures_below_the_limit_are_retried() {
    let policy = RetryPolicy::default().with_initial_delay(Duration::ZERO);
    for k in 0..policy.max_attempts {
        let calls = AtomicUsize::new(0);
        let result = policy.run(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst) as u32;
            if n < k { Err(Flaky("HTTP 503 from upstream")) } else { Ok(n) }
        });
        assert_eq!(result.unwrap(), k);
        assert_eq!(calls.load(Ordering::SeqCst) as u32, k + 1);
    }
}

#[test]
fn non_transient_failure_is_returned_after_one_call() {
    let policy = RetryPolicy::default().with_initial_delay(Duration::ZERO);
    let calls = AtomicUsize::new(0);
    let result: Result<(), Flaky> = policy.run(|| {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(Flaky("prompt rejected by safety filter"))
    });
    assert_eq!(result.unwrap_err().0, "prompt rejected by safety filter");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// =========================================================================
// Checkpoints
// =========================================================================

#[test]
fn checkpoint_for_another_batch_is_ignored() {
    let tmp = TempDir::new().unwrap();
    let original = specs(2);
    let store = CheckpointStore::for_specs(tmp.path(), &original);
    store.save(&store.fresh(2)).unwrap();

    let mut edited = original.clone();
    edited[0].prompt = "a different prompt".into();
    let other = CheckpointStore::for_specs(tmp.path(), &edited);

    assert!(other.load().is_none());
    assert!(store.load().is_some());
}

#[test]
fn interrupted_batch_resumes_without_regenerating() {
    let tmp = TempDir::new().unwrap();
    let specs = specs(3);

    // First run dies on the third image.
    let first_gen = Arc::new(FakeGenerator::failing(&["prompt 3"]));
    let first = runner(first_gen, Arc::default(), tmp.path(), options(FailurePolicy::FailFast))
        .with_checkpoint(CheckpointStore::for_specs(tmp.path(), &specs), false);
    let mut batch = artifacts_from_specs(&specs);
    assert!(first.run_serial(&mut batch).is_err());

    // Second run with --resume only generates what is missing.
    let second_gen = Arc::new(FakeGenerator::default());
    let second_up = Arc::new(FakeUploader::default());
    let second = runner(second_gen.clone(), second_up.clone(), tmp.path(), options(FailurePolicy::FailFast))
        .with_checkpoint(CheckpointStore::for_specs(tmp.path(), &specs), true);
    let mut batch = artifacts_from_specs(&specs);
    let result = second.run_serial(&mut batch).unwrap();

    assert_eq!(second_gen.calls(), ["prompt 3"]);
    assert_eq!(second_up.uploads().len(), 1);
    assert_eq!(result.skipped, 2);
    assert_eq!((result.generated, result.uploaded), (3, 3));
    assert!(result.is_complete_success());
}

// =========================================================================
// Inputs and outputs
// =========================================================================

#[test]
fn markdown_article_round_trip() {
    let tmp = TempDir::new().unwrap();
    let article = "\
# Notes

<!-- IMAGE: cover | 16:9 | A lighthouse at dawn -->

Body text.

<!-- IMAGE: chart | A bar chart of harbor traffic -->
";
    let placeholders = find_placeholders(article).unwrap();
    let specs = specs_from_placeholders(&placeholders).unwrap();
    let generator = Arc::new(FakeGenerator::failing(&["A bar chart of harbor traffic"]));
    let r = runner(generator, Arc::default(), tmp.path(), options(FailurePolicy::ContinueOnError));
    let mut batch = artifacts_from_specs(&specs);

    let result = r.run_serial(&mut batch).unwrap();
    let (published, replaced) = rewrite_placeholders(article, &placeholders, &uploaded_urls(&result));

    assert_eq!(replaced, 1);
    assert!(published.contains("![cover](https://cdn.test/cover.jpg)"));
    assert!(published.contains("<!-- IMAGE: chart | A bar chart of harbor traffic -->"));
}

#[test]
fn batch_file_drives_a_run() {
    let tmp = TempDir::new().unwrap();
    let specs = parse_batch_config(
        r#"[{"name": "hero", "prompt": "mountains", "aspect_ratio": "21:9", "filename": "hero-wide.jpg"}]"#,
    )
    .unwrap();
    let generator = Arc::new(FakeGenerator::default());
    let r = runner(generator, Arc::default(), tmp.path(), options(FailurePolicy::FailFast));
    let mut batch = artifacts_from_specs(&specs);

    let result = r.run_serial(&mut batch).unwrap();

    assert_eq!(result.images[0].aspect_ratio, "21:9");
    assert_eq!(
        result.images[0].remote_url.as_deref(),
        Some("https://cdn.test/hero-wide.jpg")
    );
    assert!(tmp.path().join("hero-wide.jpg").is_file());
}

#[test]
fn stock_settings_estimate_ten_2k_images() {
    let settings = Settings::default();
    let e = estimate(
        10,
        &settings.generation.model,
        Resolution::TwoK,
        true,
        &settings.cost_model(),
    )
    .unwrap();
    assert!((e.cost_usd - 2.00).abs() < 1e-9);
    assert!((e.seconds - 320.0).abs() < 1e-9);
}
