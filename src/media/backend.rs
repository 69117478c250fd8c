//! Collaborator boundary: the generator and uploader traits.
//!
//! [`ImageGenerator`] turns a prompt into a file on disk; [`ImageUploader`]
//! pushes a file to the image host and returns whatever the tool printed.
//! Neither knows about artifacts, retries or batches. The production
//! implementations shell out to external tools
//! ([`CommandGenerator`](super::command_backend::CommandGenerator),
//! [`CommandUploader`](super::command_backend::CommandUploader)).

use super::params::GenerateParams;
use crate::retry::Retryable;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out after {}", format_deadline(.after))]
    Timeout { after: Duration },
    #[error("{command} exited with {status}: {diagnostic}")]
    Failed {
        command: String,
        status: String,
        diagnostic: String,
    },
    #[error("generator reported success but wrote no file at {0}")]
    MissingOutput(PathBuf),
}

impl Retryable for BackendError {
    fn retry_hint(&self) -> Option<bool> {
        match self {
            BackendError::Io(_) | BackendError::Timeout { .. } | BackendError::MissingOutput(_) => {
                Some(false)
            }
            BackendError::Failed { .. } => None,
        }
    }
}

/// `120s` for whole seconds, `1500ms` otherwise.
pub fn format_deadline(d: &Duration) -> String {
    if d.subsec_nanos() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

/// Produces one image file per call.
///
/// Implementations must be `Send + Sync`: parallel batches call a single
/// generator from several pool threads at once.
pub trait ImageGenerator: Send + Sync {
    /// Write an image for `params.prompt` to `params.output`.
    fn generate(&self, params: &GenerateParams) -> Result<(), BackendError>;
}

/// Pushes one local file to the image host.
pub trait ImageUploader: Send + Sync {
    /// Upload `path` and return the tool's standard output, from which the
    /// upload stage extracts the URL.
    fn upload(&self, path: &Path, timeout: Duration) -> Result<String, BackendError>;
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted outcome for one mock generator call.
    #[derive(Debug, Clone, PartialEq)]
    pub enum GenScript {
        /// Write the output file and succeed.
        Ok,
        /// Exit non-zero with this diagnostic.
        Fail(String),
        Timeout,
        /// Exit zero without writing a file.
        NoFile,
        Panic,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct RecordedGenerate {
        pub prompt: String,
        pub size: String,
        pub output: PathBuf,
    }

    /// Mock generator that writes small placeholder files.
    /// Uses Mutex (not RefCell) so it is Sync and works from rayon pool threads.
    #[derive(Default)]
    pub struct MockGenerator {
        /// Per-prompt queue of outcomes; an empty queue means `Ok`.
        pub scripts: Mutex<HashMap<String, VecDeque<GenScript>>>,
        pub calls: Mutex<Vec<RecordedGenerate>>,
        pub delay: Duration,
        /// Extra per-prompt delay on top of `delay`.
        pub slow: Mutex<HashMap<String, Duration>>,
        in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
    }

    impl MockGenerator {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }

        /// Queue outcomes for calls with this prompt.
        pub fn script(self, prompt: &str, outcomes: Vec<GenScript>) -> Self {
            self.scripts
                .lock()
                .unwrap()
                .insert(prompt.to_string(), outcomes.into());
            self
        }

        /// Make calls with this prompt take `delay` longer.
        pub fn slow(self, prompt: &str, delay: Duration) -> Self {
            self.slow.lock().unwrap().insert(prompt.to_string(), delay);
            self
        }

        pub fn get_calls(&self) -> Vec<RecordedGenerate> {
            self.calls.lock().unwrap().clone()
        }

        pub fn calls_for(&self, prompt: &str) -> usize {
            self.get_calls().iter().filter(|c| c.prompt == prompt).count()
        }
    }

    impl ImageGenerator for MockGenerator {
        fn generate(&self, params: &GenerateParams) -> Result<(), BackendError> {
            self.calls.lock().unwrap().push(RecordedGenerate {
                prompt: params.prompt.clone(),
                size: params.size.to_string(),
                output: params.output.clone(),
            });

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let extra = self.slow.lock().unwrap().get(&params.prompt).copied();
            let delay = self.delay + extra.unwrap_or_default();
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let outcome = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(&params.prompt)
                .and_then(VecDeque::pop_front)
                .unwrap_or(GenScript::Ok);

            match outcome {
                GenScript::Ok => {
                    std::fs::write(&params.output, b"\xFF\xD8\xFFmock")?;
                    Ok(())
                }
                GenScript::Fail(diagnostic) => Err(BackendError::Failed {
                    command: "mock-gen".into(),
                    status: "exit status: 1".into(),
                    diagnostic,
                }),
                GenScript::Timeout => Err(BackendError::Timeout {
                    after: params.timeout,
                }),
                GenScript::NoFile => Ok(()),
                GenScript::Panic => panic!("mock generator panicked on {}", params.prompt),
            }
        }
    }

    /// Scripted outcome for one mock upload.
    #[derive(Debug, Clone, PartialEq)]
    pub enum UploadScript {
        /// Print a CDN URL derived from the file name.
        Ok,
        /// Exit zero printing this text.
        Stdout(String),
        Fail(String),
    }

    #[derive(Default)]
    pub struct MockUploader {
        /// Outcomes consumed in call order; an empty queue means `Ok`.
        pub scripts: Mutex<VecDeque<UploadScript>>,
        pub uploads: Mutex<Vec<PathBuf>>,
    }

    impl MockUploader {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_scripts(scripts: Vec<UploadScript>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into()),
                uploads: Mutex::new(Vec::new()),
            }
        }

        pub fn get_uploads(&self) -> Vec<PathBuf> {
            self.uploads.lock().unwrap().clone()
        }

        pub fn url_for(path: &Path) -> String {
            format!(
                "https://cdn.example.com/img/{}",
                path.file_name().unwrap().to_string_lossy()
            )
        }
    }

    impl ImageUploader for MockUploader {
        fn upload(&self, path: &Path, _timeout: Duration) -> Result<String, BackendError> {
            self.uploads.lock().unwrap().push(path.to_path_buf());
            let outcome = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(UploadScript::Ok);
            match outcome {
                UploadScript::Ok => Ok(format!("[PicGo SUCCESS]:\n{}\n", Self::url_for(path))),
                UploadScript::Stdout(text) => Ok(text),
                UploadScript::Fail(diagnostic) => Err(BackendError::Failed {
                    command: "mock-upload".into(),
                    status: "exit status: 1".into(),
                    diagnostic,
                }),
            }
        }
    }

    #[test]
    fn timeout_message_keeps_subsecond_deadlines() {
        let short = BackendError::Timeout { after: Duration::from_millis(200) };
        assert_eq!(short.to_string(), "timed out after 200ms");
        let long = BackendError::Timeout { after: Duration::from_secs(120) };
        assert_eq!(long.to_string(), "timed out after 120s");
        assert_eq!(format_deadline(&Duration::from_millis(1500)), "1500ms");
    }

    #[test]
    fn retry_hints_by_variant() {
        assert_eq!(
            BackendError::Timeout { after: Duration::from_secs(1) }.retry_hint(),
            Some(false)
        );
        assert_eq!(
            BackendError::MissingOutput("/x.jpg".into()).retry_hint(),
            Some(false)
        );
        let failed = BackendError::Failed {
            command: "gen".into(),
            status: "exit status: 1".into(),
            diagnostic: "503".into(),
        };
        assert_eq!(failed.retry_hint(), None);
    }

    #[test]
    fn mock_generator_follows_script_then_succeeds() {
        let tmp = tempfile::TempDir::new().unwrap();
        let generator = MockGenerator::new().script("p", vec![GenScript::Fail("boom".into())]);
        let params = GenerateParams {
            prompt: "p".into(),
            size: crate::media::PixelSize {
                width: 10,
                height: 10,
            },
            resolution: Default::default(),
            model: "m".into(),
            output: tmp.path().join("a.jpg"),
            timeout: Duration::from_secs(1),
        };

        assert!(generator.generate(&params).is_err());
        assert!(!params.output.exists());
        generator.generate(&params).unwrap();
        assert!(params.output.exists());
        assert_eq!(generator.calls_for("p"), 2);
    }

    #[test]
    fn mock_uploader_prints_url_by_default() {
        let uploader = MockUploader::new();
        let out = uploader
            .upload(Path::new("/tmp/cover.jpg"), Duration::from_secs(1))
            .unwrap();
        assert!(out.contains("https://cdn.example.com/img/cover.jpg"));
        assert_eq!(uploader.get_uploads().len(), 1);
    }
}
