//! Production backends: external command-line tools.
//!
//! The generator is invoked as
//! `<command> <args…> --prompt P --size WxH --resolution R --model M --output PATH`
//! and the uploader as `<command> <args…> PATH`. Both run under a wall-clock
//! deadline; a child that outlives it is killed and reported as
//! [`BackendError::Timeout`].

use super::backend::{BackendError, ImageGenerator, ImageUploader};
use super::params::GenerateParams;
use crate::config::{GenerationSettings, UploadSettings};
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs the configured generator command once per image.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    pub command: String,
    pub args: Vec<String>,
}

impl CommandGenerator {
    pub fn from_settings(settings: &GenerationSettings) -> Self {
        Self {
            command: settings.command.clone(),
            args: settings.args.clone(),
        }
    }
}

impl ImageGenerator for CommandGenerator {
    fn generate(&self, params: &GenerateParams) -> Result<(), BackendError> {
        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .arg("--prompt")
            .arg(&params.prompt)
            .arg("--size")
            .arg(params.size.to_string())
            .arg("--resolution")
            .arg(params.resolution.as_str())
            .arg("--model")
            .arg(&params.model)
            .arg("--output")
            .arg(&params.output);
        run_with_timeout(command, params.timeout).map(|_| ())
    }
}

/// Runs the configured upload command once per file.
#[derive(Debug, Clone)]
pub struct CommandUploader {
    pub command: String,
    pub args: Vec<String>,
}

impl CommandUploader {
    pub fn from_settings(settings: &UploadSettings) -> Self {
        Self {
            command: settings.command.clone(),
            args: settings.args.clone(),
        }
    }
}

impl ImageUploader for CommandUploader {
    fn upload(&self, path: &Path, timeout: Duration) -> Result<String, BackendError> {
        let mut command = Command::new(&self.command);
        command.args(&self.args).arg(path);
        run_with_timeout(command, timeout)
    }
}

/// Run `command` to completion or until `timeout` elapses.
///
/// Returns standard output on exit status zero. On a non-zero exit the
/// diagnostic is standard error, or standard output when stderr is empty.
pub fn run_with_timeout(mut command: Command, timeout: Duration) -> Result<String, BackendError> {
    let label = command.get_program().to_string_lossy().into_owned();
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    // Drain both pipes concurrently so a chatty child cannot block on a full pipe.
    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            tracing::debug!(command = %label, timeout_ms = timeout.as_millis() as u64, "killed after deadline");
            return Err(BackendError::Timeout { after: timeout });
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stdout = join_reader(stdout);
    let stderr = join_reader(stderr);

    if status.success() {
        Ok(stdout)
    } else {
        let diagnostic = if stderr.trim().is_empty() {
            stdout
        } else {
            stderr
        };
        Err(BackendError::Failed {
            command: label,
            status: status.to_string(),
            diagnostic: diagnostic.trim().to_string(),
        })
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_reader(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

/// One line of the `check` report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightItem {
    pub label: String,
    pub ok: bool,
    pub detail: String,
}

impl PreflightItem {
    fn new(label: impl Into<String>, ok: bool, detail: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ok,
            detail: detail.into(),
        }
    }
}

/// Check that the collaborators are installed and configured.
///
/// Never fails: every problem becomes a `PreflightItem` with `ok == false`.
pub fn preflight(generation: &GenerationSettings, upload: &UploadSettings) -> Vec<PreflightItem> {
    let mut items = Vec::new();

    for script in generation.args.iter().filter(|a| looks_like_script(a)) {
        let exists = Path::new(script).is_file();
        items.push(PreflightItem::new(
            "generator script",
            exists,
            if exists {
                script.clone()
            } else {
                format!("{script} not found")
            },
        ));
    }

    items.push(probe("generator command", &generation.command));

    if !generation.api_key_env.is_empty() {
        let present = std::env::var(&generation.api_key_env)
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false);
        items.push(PreflightItem::new(
            "generator API key",
            present,
            if present {
                format!("${} is set", generation.api_key_env)
            } else {
                format!("${} is not set", generation.api_key_env)
            },
        ));
    }

    items.push(probe("upload command", &upload.command));

    if !upload.token_env.is_empty() {
        // Advisory: uploads work without it, validation is skipped.
        let present = std::env::var_os(&upload.token_env).is_some();
        items.push(PreflightItem::new(
            "upload token",
            true,
            if present {
                format!("${} is set", upload.token_env)
            } else {
                format!("${} is not set; credential check will be skipped", upload.token_env)
            },
        ));
    }

    items
}

fn looks_like_script(arg: &str) -> bool {
    !arg.starts_with('-')
        && [".py", ".sh", ".js"]
            .iter()
            .any(|ext| arg.ends_with(ext))
}

fn probe(label: &str, program: &str) -> PreflightItem {
    let mut command = Command::new(program);
    command.arg("--version");
    match run_with_timeout(command, PROBE_TIMEOUT) {
        Ok(out) => {
            let version = out.lines().next().unwrap_or("").trim();
            let detail = if version.is_empty() {
                program.to_string()
            } else {
                format!("{program} ({version})")
            };
            PreflightItem::new(label, true, detail)
        }
        Err(e) => PreflightItem::new(label, false, format!("{program}: {e}")),
    }
}
