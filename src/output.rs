//! CLI output formatting for batch runs.
//!
//! # Information-First Display
//!
//! Every line leads with the artifact's name; paths, URLs and diagnostics
//! follow as indented context. Progress lines carry the running
//! [`ProgressSnapshot`](crate::progress::ProgressSnapshot) so long batches
//! show an ETA.
//!
//! # Output Format
//!
//! ## Run
//!
//! ```text
//! Batch: 3 images, parallel (2 workers)
//! cover: generating
//! diagram: generating
//!     ok   cover → images/cover.jpg  [1/3 (33%) ok 1 failed 0, elapsed 24s, eta 48s]
//!     FAIL diagram (generation, timeout): timed out after 120s  [2/3 ...]
//! cover: uploading
//!     ok   cover → https://cdn.example.com/img/cover.jpg  [1/1 ...]
//! ```
//!
//! ## Summary
//!
//! ```text
//! Summary
//!     Total: 3
//!     Generated: 2
//!     Uploaded: 2
//!     Failed: 1
//!
//! Images
//! 001 cover
//!     File: cover.jpg
//!     Local: images/cover.jpg
//!     URL: https://cdn.example.com/img/cover.jpg
//!     Markdown: ![cover](https://cdn.example.com/img/cover.jpg)
//! 002 diagram
//!     File: diagram.jpg
//!     Not uploaded: timeout: timed out after 120s
//! ```
//!
//! # Architecture
//!
//! Each display has a `format_*` function (returns `Vec<String>`) for
//! testability and a `print_*` wrapper that writes to stdout. Format
//! functions are pure: no I/O, no side effects. Reports written to disk go
//! through [`write_report`], which picks JSON or Markdown by extension.

use std::path::Path;
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::batch::BatchEvent;
use crate::estimate::Estimate;
use crate::media::PreflightItem;
use crate::progress::format_duration;
use crate::types::{BatchResult, ErrorRecord, ImageReport, Stage};

// ============================================================================
// Shared helpers
// ============================================================================

/// Format a 1-based positional index as 3-digit zero-padded.
fn format_index(pos: usize) -> String {
    format!("{:0>3}", pos)
}

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

/// Truncate text to `max` characters, appending `...` if truncated.
fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let head: String = text.chars().take(max).collect();
        format!("{head}...")
    }
}

fn markdown_reference(name: &str, url: &str) -> String {
    format!("![{name}]({url})")
}

fn failure_line(failure: &ErrorRecord) -> String {
    format!(
        "{} ({}, {}): {}",
        failure.artifact_name, failure.stage, failure.error_kind, failure.message
    )
}

// ============================================================================
// Live events
// ============================================================================

/// Format one batch event as display lines.
pub fn format_batch_event(event: &BatchEvent) -> Vec<String> {
    match event {
        BatchEvent::Started {
            total,
            restored,
            mode,
        } => {
            let mut lines = vec![format!("Batch: {total} images, {mode}")];
            if *restored > 0 {
                lines.push(format!(
                    "{}{restored} restored from checkpoint",
                    indent(1)
                ));
            }
            lines
        }
        BatchEvent::Restored { name, uploaded } => {
            let what = if *uploaded { "uploaded" } else { "generated" };
            vec![format!("{name}: already {what}, skipping")]
        }
        BatchEvent::Generating { name } => vec![format!("{name}: generating")],
        BatchEvent::Uploading { name } => vec![format!("{name}: uploading")],
        BatchEvent::Finished { result, progress } => {
            let line = if result.success {
                let target = match result.stage {
                    Stage::Generation => result
                        .local_path
                        .as_ref()
                        .map(|p| p.display().to_string()),
                    Stage::Upload => result.remote_url.clone(),
                }
                .unwrap_or_default();
                format!("ok   {} \u{2192} {}", result.name, target)
            } else {
                let kind = result
                    .error_kind
                    .map(|k| k.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                format!(
                    "FAIL {} ({}, {}): {}",
                    result.name,
                    result.stage,
                    kind,
                    truncate(result.error.as_deref().unwrap_or(""), 120)
                )
            };
            vec![format!("{}{}  [{}]", indent(1), line, progress)]
        }
        BatchEvent::LocalDeleted { name, path } => {
            vec![format!("{}{name}: removed {}", indent(1), path.display())]
        }
        BatchEvent::Aborted { failure } => {
            vec![format!("Aborting (fail-fast): {}", failure_line(failure))]
        }
    }
}

/// Prints batch events on a background thread as they arrive.
pub struct EventPrinter {
    handle: JoinHandle<()>,
    drained: Receiver<()>,
}

impl EventPrinter {
    /// Print to stdout until every sender is dropped.
    pub fn spawn(events: Receiver<BatchEvent>) -> Self {
        Self::spawn_with(events, |line| println!("{line}"))
    }

    /// Like [`spawn`](Self::spawn), handing each line to `sink`.
    pub fn spawn_with(
        events: Receiver<BatchEvent>,
        mut sink: impl FnMut(&str) + Send + 'static,
    ) -> Self {
        let (drained_tx, drained) = mpsc::channel();
        let handle = thread::spawn(move || {
            for event in events {
                for line in format_batch_event(&event) {
                    sink(&line);
                }
            }
            let _ = drained_tx.send(());
        });
        Self { handle, drained }
    }

    /// Wait for the last sender to go away.
    pub fn finish(self) {
        if self.handle.join().is_err() {
            tracing::warn!("event printer panicked");
        }
    }

    /// Wait at most `timeout` for every queued event to be printed.
    ///
    /// Returns `false` when a sender is still alive at the deadline; the
    /// thread is then left to print whatever arrives later.
    pub fn drain(self, timeout: Duration) -> bool {
        match self.drained.recv_timeout(timeout) {
            Ok(()) => {
                self.finish();
                true
            }
            Err(_) => false,
        }
    }
}

// ============================================================================
// Summary
// ============================================================================

/// Format the end-of-run summary: counters, then one block per image.
pub fn format_summary(result: &BatchResult) -> Vec<String> {
    let mut lines = vec![
        "Summary".to_string(),
        format!("{}Total: {}", indent(1), result.total),
        format!("{}Generated: {}", indent(1), result.generated),
        format!("{}Uploaded: {}", indent(1), result.uploaded),
        format!("{}Failed: {}", indent(1), result.failed),
    ];
    if result.skipped > 0 {
        lines.push(format!("{}Restored: {}", indent(1), result.skipped));
    }

    if !result.images.is_empty() {
        lines.push(String::new());
        lines.push("Images".to_string());
        for (i, image) in result.images.iter().enumerate() {
            lines.extend(image_block(i + 1, image));
        }
    }

    if !result.errors.is_empty() {
        lines.push(String::new());
        lines.push("Errors".to_string());
        for error in &result.errors {
            lines.push(format!("{}{}", indent(1), failure_line(error)));
        }
    }
    lines
}

fn image_block(index: usize, image: &ImageReport) -> Vec<String> {
    let mut lines = vec![
        format!("{} {}", format_index(index), image.name),
        format!("{}File: {}", indent(1), image.filename),
    ];
    if let Some(path) = &image.local_path {
        lines.push(format!("{}Local: {}", indent(1), path.display()));
    }
    match &image.remote_url {
        Some(url) => {
            lines.push(format!("{}URL: {}", indent(1), url));
            lines.push(format!(
                "{}Markdown: {}",
                indent(1),
                markdown_reference(&image.name, url)
            ));
        }
        None if image.success => {}
        None => {
            let kind = image
                .error_kind
                .map(|k| k.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            lines.push(format!(
                "{}Not uploaded: {}: {}",
                indent(1),
                kind,
                truncate(image.error.as_deref().unwrap_or(""), 120)
            ));
        }
    }
    lines
}

pub fn print_summary(result: &BatchResult) {
    for line in format_summary(result) {
        println!("{}", line);
    }
}

/// Format the fail-fast abort banner.
pub fn format_abort(failure: &ErrorRecord, partial: &BatchResult) -> Vec<String> {
    let mut lines = vec![format!("==> Batch aborted: {}", failure_line(failure))];
    lines.push(format!(
        "{}{} of {} generated, {} uploaded before the abort",
        indent(1),
        partial.generated,
        partial.total,
        partial.uploaded
    ));
    lines
}

pub fn print_abort(failure: &ErrorRecord, partial: &BatchResult) {
    for line in format_abort(failure, partial) {
        println!("{}", line);
    }
}

// ============================================================================
// Dry run and preflight
// ============================================================================

/// Format a dry-run estimate.
pub fn format_estimate(estimate: &Estimate) -> Vec<String> {
    let per_unit = Duration::from_secs_f64(estimate.per_unit_seconds.max(0.0));
    let total = Duration::from_secs_f64(estimate.seconds.max(0.0));
    vec![
        "Dry run (nothing generated)".to_string(),
        format!("{}Images: {}", indent(1), estimate.count),
        format!("{}Model: {}", indent(1), estimate.model),
        format!("{}Resolution: {}", indent(1), estimate.resolution),
        format!(
            "{}Upload: {}",
            indent(1),
            if estimate.upload { "yes" } else { "no" }
        ),
        format!(
            "{}Cost: ${:.2} (${:.3} per image)",
            indent(1),
            estimate.cost_usd,
            estimate.per_unit_cost_usd
        ),
        format!(
            "{}Time: {} ({} per image)",
            indent(1),
            format_duration(total),
            format_duration(per_unit)
        ),
    ]
}

pub fn print_estimate(estimate: &Estimate) {
    for line in format_estimate(estimate) {
        println!("{}", line);
    }
}

/// Format preflight results, one line per check.
pub fn format_preflight(items: &[PreflightItem]) -> Vec<String> {
    items
        .iter()
        .map(|item| {
            let mark = if item.ok { "ok  " } else { "FAIL" };
            format!("{mark} {}: {}", item.label, item.detail)
        })
        .collect()
}

pub fn print_preflight(items: &[PreflightItem]) {
    for line in format_preflight(items) {
        println!("{}", line);
    }
}

// ============================================================================
// Reports
// ============================================================================

/// Render the Markdown image inventory.
pub fn render_markdown_report(result: &BatchResult) -> String {
    let mut lines = vec!["# Article images".to_string(), String::new()];
    for image in &result.images {
        lines.push(format!("## {}", image.name));
        lines.push(String::new());
        lines.push(format!("**File**: {}  ", image.filename));
        if let Some(path) = &image.local_path {
            lines.push(format!("**Local path**: `{}`  ", path.display()));
        }
        if let Some(url) = &image.remote_url {
            lines.push(format!("**CDN URL**: {}  ", url));
            lines.push(String::new());
            lines.push("**Markdown reference**:".to_string());
            lines.push("```markdown".to_string());
            lines.push(markdown_reference(&image.name, url));
            lines.push("```".to_string());
        } else if !image.success {
            let kind = image
                .error_kind
                .map(|k| k.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            lines.push(format!("**Not uploaded**: {kind}  "));
        }
        lines.push(String::new());
        lines.push(format!("**Prompt**: {}", image.prompt));
        lines.push(String::new());
        lines.push("---".to_string());
        lines.push(String::new());
    }
    lines.join("\n")
}

/// Write `result` to `path`: Markdown for `.md`/`.markdown`, JSON otherwise.
pub fn write_report(path: &Path, result: &BatchResult) -> std::io::Result<()> {
    let is_markdown = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("md") || e.eq_ignore_ascii_case("markdown"));
    let content = if is_markdown {
        render_markdown_report(result)
    } else {
        serde_json::to_string_pretty(result).map_err(std::io::Error::other)?
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)
}

// ============================================================================
// Tests
// ============================================================================
