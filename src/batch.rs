//! Batch orchestration: drive every artifact through generation and upload.
//!
//! Two entry points share one result contract ([`BatchResult`]):
//!
//! - [`BatchRunner::run_serial`]: one artifact at a time, in declaration
//!   order. Generate, pause, upload, pause, next.
//! - [`BatchRunner::run_parallel`]: two phases that never interleave.
//!
//! ```text
//! phase 1  generation   bounded rayon pool (N workers)    completion order
//!                          │ abort flag (fail-fast)
//!                          ▼
//! phase 2  upload       calling thread, one at a time       completion order
//! ```
//!
//! Uploads are never parallel: the image host tolerates neither concurrent
//! invocations nor bursts, hence `upload_pause` between them.
//!
//! ## Failure policies
//!
//! - **Fail-fast** (default): the first failure in either stage aborts the
//!   batch. Workers that have not started yet see the abort flag and never
//!   run; the runner stops waiting at once and returns
//!   [`BatchError::Aborted`] carrying a partial result. In-flight
//!   collaborator calls finish or time out on their own.
//! - **Continue-on-error**: every failure is recorded in `errors` and the
//!   batch runs to the end.
//!
//! Serial uploads are the exception: an upload failure in serial mode aborts
//! under either policy.
//!
//! ## Shared state
//!
//! Workers receive an owned copy of their artifact and hand it back over a
//! channel; only the calling thread writes artifacts, updates the [`Ledger`],
//! saves checkpoints and decides aborts, so counters and per-image states
//! always describe the same finished work. Workers share the queue and the
//! abort flag.
//!
//! ## Resuming
//!
//! With a checkpoint store attached, progress is saved after every artifact.
//! With `resume` set, a matching checkpoint restores uploaded artifacts
//! (URL known) and generated ones whose file still exists, so only the rest
//! is redone. The checkpoint is cleared once a batch finishes cleanly.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use thiserror::Error;

use crate::artifact::Artifact;
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::media::{GenerationStage, UploadStage};
use crate::progress::{ProgressSnapshot, ProgressTracker};
use crate::types::{
    ArtifactState, BatchResult, ErrorKind, ErrorRecord, ImageReport, Stage, StageError,
    TaskResult,
};

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("batch aborted: {failure}")]
    Aborted {
        failure: ErrorRecord,
        /// Everything recorded up to the abort.
        partial: Box<BatchResult>,
    },
    #[error("could not start generation workers: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

impl BatchError {
    /// The partial result of an aborted batch.
    pub fn partial(&self) -> Option<&BatchResult> {
        match self {
            BatchError::Aborted { partial, .. } => Some(&**partial),
            BatchError::Pool(_) => None,
        }
    }
}

/// What happens after the first failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    #[default]
    FailFast,
    ContinueOnError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Serial,
    Parallel { workers: usize },
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Serial => f.write_str("serial"),
            RunMode::Parallel { workers } => write!(f, "parallel ({workers} workers)"),
        }
    }
}

/// Pauses that keep the collaborators under their rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    /// Before each upload.
    pub upload_pause: Duration,
    /// Between artifacts in serial mode.
    pub task_delay: Duration,
}

impl Pacing {
    pub fn none() -> Self {
        Self {
            upload_pause: Duration::ZERO,
            task_delay: Duration::ZERO,
        }
    }
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            upload_pause: Duration::from_secs(1),
            task_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    pub policy: FailurePolicy,
    pub upload: bool,
    /// Remove each local file once its upload succeeded.
    pub delete_local: bool,
    pub pacing: Pacing,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            policy: FailurePolicy::FailFast,
            upload: true,
            delete_local: false,
            pacing: Pacing::default(),
        }
    }
}

/// Live notifications for the CLI.
#[derive(Debug, Clone)]
pub enum BatchEvent {
    Started {
        total: usize,
        /// Artifacts restored from a checkpoint.
        restored: usize,
        mode: RunMode,
    },
    Restored {
        name: String,
        uploaded: bool,
    },
    Generating {
        name: String,
    },
    Uploading {
        name: String,
    },
    Finished {
        result: TaskResult,
        progress: ProgressSnapshot,
    },
    LocalDeleted {
        name: String,
        path: PathBuf,
    },
    Aborted {
        failure: ErrorRecord,
    },
}

/// Counters, errors and the latest result per artifact.
#[derive(Debug, Default)]
struct Ledger {
    generated: usize,
    uploaded: usize,
    failed: usize,
    skipped: usize,
    errors: Vec<ErrorRecord>,
    last: Vec<Option<TaskResult>>,
}

impl Ledger {
    fn new(total: usize) -> Self {
        Self {
            last: vec![None; total],
            ..Self::default()
        }
    }

    fn record(&mut self, index: usize, result: &TaskResult) {
        match (result.stage, result.success) {
            (Stage::Generation, true) => self.generated += 1,
            (Stage::Upload, true) => self.uploaded += 1,
            (stage, false) => {
                self.failed += 1;
                let err = result
                    .stage_error()
                    .unwrap_or_else(|| StageError::new(ErrorKind::Unknown, ""));
                self.errors.push(ErrorRecord {
                    artifact_name: result.name.clone(),
                    stage,
                    error_kind: err.kind,
                    message: err.message,
                });
            }
        }
        if let Some(slot) = self.last.get_mut(index) {
            *slot = Some(result.clone());
        }
    }

    fn restore(&mut self, uploaded: bool) {
        self.generated += 1;
        self.skipped += 1;
        if uploaded {
            self.uploaded += 1;
        }
    }

    fn to_result(&self, artifacts: &[Artifact], upload: bool) -> BatchResult {
        BatchResult {
            total: artifacts.len(),
            generated: self.generated,
            uploaded: self.uploaded,
            failed: self.failed,
            skipped: self.skipped,
            errors: self.errors.clone(),
            images: artifacts
                .iter()
                .enumerate()
                .map(|(i, a)| image_report(a, self.last.get(i).and_then(Option::as_ref), upload))
                .collect(),
        }
    }
}

fn image_report(artifact: &Artifact, last: Option<&TaskResult>, upload: bool) -> ImageReport {
    let success = artifact.state == ArtifactState::Uploaded
        || (!upload && artifact.state == ArtifactState::Generated);

    let (error_kind, error) = if success {
        (None, None)
    } else if let Some(failure) = last.filter(|r| !r.success) {
        (failure.error_kind, failure.error.clone())
    } else if artifact.state == ArtifactState::Generated {
        (
            Some(ErrorKind::Cancelled),
            Some("upload not attempted: batch aborted".to_string()),
        )
    } else {
        (
            Some(ErrorKind::Cancelled),
            Some("not run: batch aborted".to_string()),
        )
    };

    ImageReport {
        name: artifact.name.clone(),
        filename: artifact.filename.clone(),
        prompt: artifact.prompt.clone(),
        aspect_ratio: artifact.aspect_ratio.to_string(),
        local_path: artifact.local_path.clone(),
        remote_url: artifact.remote_url.clone(),
        state: artifact.state,
        success,
        error_kind,
        error,
    }
}

fn lock(ledger: &Mutex<Ledger>) -> MutexGuard<'_, Ledger> {
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}

fn pause(duration: Duration) {
    if !duration.is_zero() {
        thread::sleep(duration);
    }
}

/// Checkpoint being maintained during one run.
struct Journal<'a> {
    store: &'a CheckpointStore,
    state: Checkpoint,
}

impl Journal<'_> {
    fn record(&mut self, artifact: &Artifact, result: &TaskResult) {
        match (result.stage, result.success, &artifact.remote_url) {
            (Stage::Generation, true, _) => self.state.mark_generated(&artifact.filename),
            (Stage::Generation, false, _) => self.state.mark_failed(&artifact.filename),
            (Stage::Upload, true, Some(url)) => self.state.mark_uploaded(&artifact.filename, url),
            // A failed upload keeps the file; a resumed run uploads it again.
            (Stage::Upload, _, _) => return,
        }
        self.save();
    }

    fn save(&self) {
        if let Err(e) = self.store.save(&self.state) {
            tracing::warn!(path = %self.store.path().display(), error = %e, "could not save checkpoint");
        }
    }

    fn finish(self, result: &BatchResult) {
        if result.is_complete_success() {
            if let Err(e) = self.store.clear() {
                tracing::warn!(error = %e, "could not remove checkpoint");
            }
        } else {
            self.save();
        }
    }
}

/// Generation result handed from a pool worker back to the runner.
struct Completion {
    index: usize,
    artifact: Artifact,
    result: TaskResult,
    progress: ProgressSnapshot,
}

/// Drives a batch of artifacts through the two stages.
pub struct BatchRunner {
    generation: GenerationStage,
    upload: UploadStage,
    options: BatchOptions,
    events: Option<Sender<BatchEvent>>,
    checkpoint: Option<CheckpointStore>,
    resume: bool,
}

impl BatchRunner {
    pub fn new(generation: GenerationStage, upload: UploadStage, options: BatchOptions) -> Self {
        Self {
            generation,
            upload,
            options,
            events: None,
            checkpoint: None,
            resume: false,
        }
    }

    /// Stream [`BatchEvent`]s to `sender`.
    pub fn with_events(mut self, sender: Sender<BatchEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Save progress to `store`; restore from it first when `resume` is set.
    pub fn with_checkpoint(mut self, store: CheckpointStore, resume: bool) -> Self {
        self.checkpoint = Some(store);
        self.resume = resume;
        self
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    pub fn run(&self, artifacts: &mut [Artifact], mode: RunMode) -> Result<BatchResult, BatchError> {
        match mode {
            RunMode::Serial => self.run_serial(artifacts),
            RunMode::Parallel { workers } => self.run_parallel(artifacts, workers),
        }
    }

    /// Process artifacts one at a time in declaration order.
    pub fn run_serial(&self, artifacts: &mut [Artifact]) -> Result<BatchResult, BatchError> {
        let ledger = Mutex::new(Ledger::new(artifacts.len()));
        let mut journal = self.open_journal(artifacts.len());
        self.restore(artifacts, &ledger, journal.as_ref());

        let pending: Vec<usize> = (0..artifacts.len())
            .filter(|&i| self.needs_work(&artifacts[i]))
            .collect();
        let restored = lock(&ledger).skipped;
        self.emit(BatchEvent::Started {
            total: artifacts.len(),
            restored,
            mode: RunMode::Serial,
        });
        let tracker = ProgressTracker::new(pending.len());

        for (position, &index) in pending.iter().enumerate() {
            if position > 0 {
                pause(self.options.pacing.task_delay);
            }

            if artifacts[index].state == ArtifactState::Pending {
                self.emit(BatchEvent::Generating {
                    name: artifacts[index].name.clone(),
                });
                let result = self.generation.generate(&mut artifacts[index]);
                lock(&ledger).record(index, &result);
                if let Some(journal) = journal.as_mut() {
                    journal.record(&artifacts[index], &result);
                }

                let done = !result.success || !self.options.upload;
                let progress = if done {
                    tracker.record(result.success)
                } else {
                    tracker.snapshot()
                };
                let failed = !result.success;
                self.emit(BatchEvent::Finished {
                    result: result.clone(),
                    progress,
                });
                if failed {
                    if self.options.policy == FailurePolicy::FailFast {
                        return Err(self.abort(&ledger, artifacts, &result));
                    }
                    continue;
                }
            }

            if self.options.upload && artifacts[index].state == ArtifactState::Generated {
                pause(self.options.pacing.upload_pause);
                let result = self.upload_one(index, artifacts, &ledger, journal.as_mut());
                let progress = tracker.record(result.success);
                let failed = !result.success;
                self.emit(BatchEvent::Finished {
                    result: result.clone(),
                    progress,
                });
                // Serial uploads stop the batch under either policy.
                if failed {
                    return Err(self.abort(&ledger, artifacts, &result));
                }
            }
        }

        let result = lock(&ledger).to_result(artifacts, self.options.upload);
        if let Some(journal) = journal {
            journal.finish(&result);
        }
        Ok(result)
    }

    /// Generate on a pool of `workers` threads, then upload serially.
    pub fn run_parallel(
        &self,
        artifacts: &mut [Artifact],
        workers: usize,
    ) -> Result<BatchResult, BatchError> {
        let ledger = Mutex::new(Ledger::new(artifacts.len()));
        let mut journal = self.open_journal(artifacts.len());
        self.restore(artifacts, &ledger, journal.as_ref());

        // Restored-but-not-uploaded artifacts go first in the upload queue.
        let mut upload_order: Vec<usize> = (0..artifacts.len())
            .filter(|&i| artifacts[i].state == ArtifactState::Generated)
            .collect();

        let queue: VecDeque<(usize, Artifact)> = artifacts
            .iter()
            .enumerate()
            .filter(|(_, a)| a.state == ArtifactState::Pending)
            .map(|(i, a)| (i, a.clone()))
            .collect();

        let workers = workers.max(1);
        let restored = lock(&ledger).skipped;
        self.emit(BatchEvent::Started {
            total: artifacts.len(),
            restored,
            mode: RunMode::Parallel { workers },
        });

        // Phase 1: generation.
        if !queue.is_empty() {
            let tracker = Arc::new(ProgressTracker::new(queue.len()));
            let abort = Arc::new(AtomicBool::new(false));
            let width = workers.min(queue.len());
            let queue = Arc::new(Mutex::new(queue));
            let (done_tx, done_rx) = mpsc::channel::<Completion>();

            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(width)
                .thread_name(|i| format!("article-media-gen-{i}"))
                .build()?;

            for _ in 0..width {
                let worker = Worker {
                    stage: self.generation.clone(),
                    queue: Arc::clone(&queue),
                    tracker: Arc::clone(&tracker),
                    abort: Arc::clone(&abort),
                    fail_fast: self.options.policy == FailurePolicy::FailFast,
                    done: done_tx.clone(),
                    events: self.events.clone(),
                };
                pool.spawn(move || worker.run());
            }
            drop(done_tx);

            for completion in done_rx.iter() {
                let index = completion.index;
                let result = self.accept(completion, artifacts, &ledger, journal.as_mut());
                if result.success {
                    upload_order.push(index);
                } else if self.options.policy == FailurePolicy::FailFast {
                    abort.store(true, Ordering::SeqCst);
                    // Work that finished before the abort still counts.
                    for queued in done_rx.try_iter() {
                        self.accept(queued, artifacts, &ledger, journal.as_mut());
                    }
                    return Err(self.abort(&ledger, artifacts, &result));
                }
            }
        }

        // Phase 2: uploads, strictly one at a time.
        if self.options.upload {
            let tracker = ProgressTracker::new(upload_order.len());
            for (position, &index) in upload_order.iter().enumerate() {
                if position > 0 {
                    pause(self.options.pacing.upload_pause);
                }
                let result = self.upload_one(index, artifacts, &ledger, journal.as_mut());
                let progress = tracker.record(result.success);
                let failed = !result.success;
                self.emit(BatchEvent::Finished {
                    result: result.clone(),
                    progress,
                });
                if failed && self.options.policy == FailurePolicy::FailFast {
                    return Err(self.abort(&ledger, artifacts, &result));
                }
            }
        }

        let result = lock(&ledger).to_result(artifacts, self.options.upload);
        if let Some(journal) = journal {
            journal.finish(&result);
        }
        Ok(result)
    }

    /// Write a finished generation back: artifact, ledger and checkpoint
    /// change together on the calling thread.
    fn accept(
        &self,
        completion: Completion,
        artifacts: &mut [Artifact],
        ledger: &Mutex<Ledger>,
        journal: Option<&mut Journal<'_>>,
    ) -> TaskResult {
        let Completion {
            index,
            artifact,
            result,
            progress,
        } = completion;
        artifacts[index] = artifact;
        lock(ledger).record(index, &result);
        if let Some(journal) = journal {
            journal.record(&artifacts[index], &result);
        }
        self.emit(BatchEvent::Finished {
            result: result.clone(),
            progress,
        });
        result
    }

    fn needs_work(&self, artifact: &Artifact) -> bool {
        match artifact.state {
            ArtifactState::Pending => true,
            ArtifactState::Generated => self.options.upload,
            _ => false,
        }
    }

    fn upload_one(
        &self,
        index: usize,
        artifacts: &mut [Artifact],
        ledger: &Mutex<Ledger>,
        journal: Option<&mut Journal<'_>>,
    ) -> TaskResult {
        let artifact = &mut artifacts[index];
        self.emit(BatchEvent::Uploading {
            name: artifact.name.clone(),
        });
        let result = self.upload.upload_artifact(artifact);
        lock(ledger).record(index, &result);
        if let Some(journal) = journal {
            journal.record(artifact, &result);
        }

        if result.success && self.options.delete_local {
            if let Some(path) = artifact.local_path.take() {
                match std::fs::remove_file(&path) {
                    Ok(()) => self.emit(BatchEvent::LocalDeleted {
                        name: artifact.name.clone(),
                        path,
                    }),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "could not delete local file");
                        artifact.local_path = Some(path);
                    }
                }
            }
        }
        result
    }

    fn open_journal(&self, total: usize) -> Option<Journal<'_>> {
        let store = self.checkpoint.as_ref()?;
        let state = self
            .resume
            .then(|| store.load())
            .flatten()
            .map(|mut cp| {
                cp.total = total;
                cp
            })
            .unwrap_or_else(|| store.fresh(total));
        Some(Journal { store, state })
    }

    /// Apply a loaded checkpoint to fresh artifacts.
    fn restore(&self, artifacts: &mut [Artifact], ledger: &Mutex<Ledger>, journal: Option<&Journal<'_>>) {
        if !self.resume {
            return;
        }
        let Some(journal) = journal else {
            return;
        };
        let checkpoint = &journal.state;
        for artifact in artifacts.iter_mut() {
            if artifact.state != ArtifactState::Pending {
                continue;
            }
            let path = self.generation.target_path(artifact);
            if let Some(url) = checkpoint.uploaded_url(&artifact.filename) {
                artifact.remote_url = Some(url.to_string());
                artifact.local_path = path.is_file().then_some(path);
                artifact.advance(ArtifactState::Uploaded);
                lock(ledger).restore(true);
                self.emit(BatchEvent::Restored {
                    name: artifact.name.clone(),
                    uploaded: true,
                });
            } else if checkpoint.is_generated(&artifact.filename) && path.is_file() {
                artifact.local_path = Some(path);
                artifact.advance(ArtifactState::Generated);
                lock(ledger).restore(false);
                self.emit(BatchEvent::Restored {
                    name: artifact.name.clone(),
                    uploaded: false,
                });
            }
        }
    }

    fn abort(&self, ledger: &Mutex<Ledger>, artifacts: &[Artifact], cause: &TaskResult) -> BatchError {
        let err = cause
            .stage_error()
            .unwrap_or_else(|| StageError::new(ErrorKind::Unknown, ""));
        let failure = ErrorRecord {
            artifact_name: cause.name.clone(),
            stage: cause.stage,
            error_kind: err.kind,
            message: err.message,
        };
        let partial = lock(ledger).to_result(artifacts, self.options.upload);
        tracing::debug!(artifact = %failure.artifact_name, stage = %failure.stage, "fail-fast abort");
        self.emit(BatchEvent::Aborted {
            failure: failure.clone(),
        });
        BatchError::Aborted {
            failure,
            partial: Box::new(partial),
        }
    }

    fn emit(&self, event: BatchEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

/// One generation worker on the pool; pulls artifacts until the queue is
/// empty or the batch aborts.
struct Worker {
    stage: GenerationStage,
    queue: Arc<Mutex<VecDeque<(usize, Artifact)>>>,
    tracker: Arc<ProgressTracker>,
    abort: Arc<AtomicBool>,
    fail_fast: bool,
    done: Sender<Completion>,
    events: Option<Sender<BatchEvent>>,
}

impl Worker {
    fn run(self) {
        loop {
            if self.abort.load(Ordering::SeqCst) {
                return;
            }
            let next = self
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            let Some((index, mut artifact)) = next else {
                return;
            };

            if let Some(tx) = &self.events {
                let _ = tx.send(BatchEvent::Generating {
                    name: artifact.name.clone(),
                });
            }

            let outcome = catch_unwind(AssertUnwindSafe(|| self.stage.generate(&mut artifact)));
            let result = outcome.unwrap_or_else(|payload| {
                artifact.local_path = None;
                artifact.state = ArtifactState::GenerationFailed;
                let err = StageError::new(
                    ErrorKind::Unknown,
                    format!("generation worker panicked: {}", panic_message(&*payload)),
                );
                TaskResult::failed(&artifact, Stage::Generation, &err)
            });

            let progress = self.tracker.record(result.success);
            if !result.success && self.fail_fast {
                self.abort.store(true, Ordering::SeqCst);
            }

            let completion = Completion {
                index,
                artifact,
                result,
                progress,
            };
            if self.done.send(completion).is_err() {
                // The runner stopped listening after an abort.
                return;
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
