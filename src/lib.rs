//! # article-media
//!
//! Batch image generation and CDN upload for article publishing. A batch is a
//! list of image descriptors (name, prompt, aspect ratio); each one is handed
//! to an external image generator, written to disk, then pushed to an image
//! host whose public URL ends up in the article.
//!
//! # Architecture: Two-Stage Pipeline
//!
//! ```text
//! input (JSON batch | Markdown placeholders)
//!   │
//!   ▼
//! 1. Generate   prompt   →  images/<name>.jpg   (serial, or bounded rayon pool)
//! 2. Upload     file     →  https://cdn/...     (always one at a time)
//!   │
//!   ▼
//! BatchResult  →  console summary, report (.json | .md), published article
//! ```
//!
//! Each artifact moves through a forward-only state machine
//! (`pending → generating → generated → uploading → uploaded`, with the two
//! failure states). The orchestrator aggregates per-artifact outcomes into a
//! single [`types::BatchResult`] whose `images` keep declaration order.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`artifact`] | Artifact descriptors, aspect ratios, batch-file parsing |
//! | [`batch`] | Orchestrator: serial and parallel runs, failure policies, resume |
//! | [`media`] | Collaborator traits, command backends, generation and upload stages |
//! | [`retry`] | Bounded exponential-backoff retry |
//! | [`checkpoint`] | Fingerprinted progress file for `--resume` |
//! | [`progress`] | Completion counters and ETA |
//! | [`estimate`] | Dry-run cost and time projection |
//! | [`markdown`] | `<!-- IMAGE: ... -->` placeholders: discovery and rewriting |
//! | [`config`] | `article-media.toml` loading, validation, merging, stock file |
//! | [`types`] | Shared result and error types serialized into reports |
//! | [`output`] | CLI output formatting and report rendering |
//!
//! # Design Decisions
//!
//! ## External Collaborators Behind Traits
//!
//! Image generation and hosting are done by other programs (a generator
//! script, `picgo`). The pipeline only sees [`media::ImageGenerator`] and
//! [`media::ImageUploader`], so tests drive it with in-process mocks and the
//! binary drives it with [`media::CommandGenerator`] and
//! [`media::CommandUploader`].
//!
//! ## Uploads Are Never Parallel
//!
//! Image hosts rate-limit aggressively and some upload tools keep global
//! state. Parallel mode therefore generates on a pool and then uploads on
//! the calling thread, pausing between uploads.
//!
//! ## Fail-Fast by Default
//!
//! Generation costs money. The default policy stops at the first failure,
//! and queued work never starts. `--continue-on-error` records failures and
//! runs the batch to the end instead.

pub mod artifact;
pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod estimate;
pub mod markdown;
pub mod media;
pub mod output;
pub mod progress;
pub mod retry;
pub mod types;

#[cfg(test)]
pub(crate) mod test_helpers;
