//! Tool settings.
//!
//! Handles loading, validating, and merging `article-media.toml`. Stock
//! defaults are the base layer; the user file overrides any subset of keys.
//!
//! ## Settings File Location
//!
//! `article-media.toml` in the working directory, or any path given with
//! `--settings`. A missing file means "all defaults".
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! [generation]
//! command = "python3"
//! args = ["scripts/nanobanana.py"]
//! model = "gemini-3-pro-image-preview"
//! resolution = "2K"          # 1K, 2K or 4K
//! timeout_secs = 120
//! api_key_env = "GEMINI_API_KEY"
//! images_dir = "images"      # Relative to the input file
//!
//! [upload]
//! command = "picgo"
//! args = ["upload"]
//! timeout_secs = 60
//! token_env = ""             # Env var holding a bearer token (optional)
//! validate_url = ""          # Endpoint probed once with that token (optional)
//!
//! [retry]
//! max_attempts = 3
//! initial_delay_secs = 2.0
//! backoff_factor = 1.5
//! retriable_errors = ["SSL", "ConnectionError", "TimeoutError", "NetworkError", "500", "502", "503", "504"]
//!
//! [concurrency]
//! workers = 2                # Parallel generation width
//! upload_pause_secs = 1.0    # Pause before each upload
//! task_delay_secs = 2.0      # Pause between artifacts in serial mode
//!
//! [estimate]
//! upload_secs = 5.0
//! generation_secs = { "1K" = 15.0, "2K" = 25.0, "4K" = 45.0 }
//!
//! [[estimate.pricing]]
//! model = "gemini-3-pro-image-preview"
//! resolution = "2K"
//! usd = 0.20
//! ```
//!
//! Tables merge key by key; arrays (such as `estimate.pricing`) replace the
//! default array wholesale. Unknown keys are rejected to catch typos early.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::estimate::{CostModel, PriceRow};
use crate::media::Resolution;
use crate::retry::{DEFAULT_RETRIABLE_ERRORS, RetryPolicy};

/// Default settings file name, looked up in the working directory.
pub const SETTINGS_FILENAME: &str = "article-media.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Settings loaded from `article-media.toml`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub generation: GenerationSettings,
    pub upload: UploadSettings,
    pub retry: RetrySettings,
    pub concurrency: ConcurrencySettings,
    pub estimate: EstimateSettings,
}

impl Settings {
    /// Validate values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.generation.command.trim().is_empty() {
            return Err(ConfigError::Validation(
                "generation.command must not be empty".into(),
            ));
        }
        if self.upload.command.trim().is_empty() {
            return Err(ConfigError::Validation(
                "upload.command must not be empty".into(),
            ));
        }
        if self.generation.timeout_secs == 0 || self.upload.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "timeout_secs must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if !self.retry.backoff_factor.is_finite() || self.retry.backoff_factor < 1.0 {
            return Err(ConfigError::Validation(
                "retry.backoff_factor must be >= 1.0".into(),
            ));
        }
        if self.concurrency.workers == 0 {
            return Err(ConfigError::Validation(
                "concurrency.workers must be at least 1".into(),
            ));
        }
        for (key, secs) in [
            ("retry.initial_delay_secs", self.retry.initial_delay_secs),
            ("concurrency.upload_pause_secs", self.concurrency.upload_pause_secs),
            ("concurrency.task_delay_secs", self.concurrency.task_delay_secs),
            ("estimate.upload_secs", self.estimate.upload_secs),
        ] {
            check_seconds(key, secs)?;
        }
        for (label, secs) in &self.estimate.generation_secs {
            label.parse::<Resolution>().map_err(|e| {
                ConfigError::Validation(format!("estimate.generation_secs: {e}"))
            })?;
            check_seconds(&format!("estimate.generation_secs.{label}"), *secs)?;
        }
        if let Some(row) = self.estimate.pricing.iter().find(|r| r.usd.is_nan() || r.usd < 0.0) {
            return Err(ConfigError::Validation(format!(
                "estimate.pricing: negative price for {} at {}",
                row.model, row.resolution
            )));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_delay: Duration::from_secs_f64(self.retry.initial_delay_secs),
            backoff_factor: self.retry.backoff_factor,
            retriable_errors: self.retry.retriable_errors.clone(),
        }
    }

    pub fn cost_model(&self) -> CostModel {
        CostModel {
            pricing: self.estimate.pricing.clone(),
            generation_secs: self.estimate.generation_secs.clone(),
            upload_secs: self.estimate.upload_secs,
            task_delay_secs: self.concurrency.task_delay_secs,
        }
    }
}

fn check_seconds(key: &str, secs: f64) -> Result<(), ConfigError> {
    if secs.is_finite() && secs >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Validation(format!(
            "{key} must be a non-negative number of seconds"
        )))
    }
}

/// Image generator invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GenerationSettings {
    pub command: String,
    /// Arguments placed before the request flags.
    pub args: Vec<String>,
    pub model: String,
    pub resolution: Resolution,
    pub timeout_secs: u64,
    /// Environment variable the generator reads its API key from.
    /// Checked by `check`; empty disables the check.
    pub api_key_env: String,
    /// Output directory for generated files, relative to the input file.
    pub images_dir: String,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            command: "python3".into(),
            args: vec!["scripts/nanobanana.py".into()],
            model: "gemini-3-pro-image-preview".into(),
            resolution: Resolution::TwoK,
            timeout_secs: 120,
            api_key_env: "GEMINI_API_KEY".into(),
            images_dir: "images".into(),
        }
    }
}

impl GenerationSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Image-host uploader invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UploadSettings {
    pub command: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
    /// Environment variable holding a bearer token; empty disables validation.
    pub token_env: String,
    /// URL probed once with the token; empty means "presence check only".
    pub validate_url: String,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            command: "picgo".into(),
            args: vec!["upload".into()],
            timeout_secs: 60,
            token_env: String::new(),
            validate_url: String::new(),
        }
    }
}

impl UploadSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_secs: f64,
    pub backoff_factor: f64,
    pub retriable_errors: Vec<String>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_secs: 2.0,
            backoff_factor: 1.5,
            retriable_errors: DEFAULT_RETRIABLE_ERRORS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConcurrencySettings {
    /// Parallel generation width.
    pub workers: usize,
    pub upload_pause_secs: f64,
    pub task_delay_secs: f64,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            workers: 2,
            upload_pause_secs: 1.0,
            task_delay_secs: 2.0,
        }
    }
}

/// Tables for `--dry-run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EstimateSettings {
    pub upload_secs: f64,
    /// Seconds per image, keyed by resolution label.
    pub generation_secs: BTreeMap<String, f64>,
    pub pricing: Vec<PriceRow>,
}

impl Default for EstimateSettings {
    fn default() -> Self {
        let price = |model: &str, resolution, usd| PriceRow {
            model: model.to_string(),
            resolution,
            usd,
        };
        Self {
            upload_secs: 5.0,
            generation_secs: BTreeMap::from([
                ("1K".to_string(), 15.0),
                ("2K".to_string(), 25.0),
                ("4K".to_string(), 45.0),
            ]),
            pricing: vec![
                price("gemini-3-pro-image-preview", Resolution::OneK, 0.134),
                price("gemini-3-pro-image-preview", Resolution::TwoK, 0.20),
                price("gemini-3-pro-image-preview", Resolution::FourK, 0.24),
                price("gemini-2.5-flash-image", Resolution::OneK, 0.039),
                price("gemini-2.5-flash-image", Resolution::TwoK, 0.039),
            ],
        }
    }
}

/// Returns the stock default settings as a `toml::Value::Table`.
///
/// This is the base layer user overrides are merged onto.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    Ok(toml::Value::try_from(Settings::default())?)
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Load a settings file as a raw TOML value.
///
/// Returns `Ok(None)` if the file does not exist.
pub fn load_raw_settings(path: &Path) -> Result<Option<toml::Value>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    let value: toml::Value = toml::from_str(&content)?;
    Ok(Some(value))
}

/// Merge an optional overlay onto a base value, then deserialize and validate.
pub fn resolve_settings(
    base: toml::Value,
    overlay: Option<toml::Value>,
) -> Result<Settings, ConfigError> {
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let settings: Settings = merged.try_into()?;
    settings.validate()?;
    Ok(settings)
}

/// Load settings from `path`, falling back to stock defaults.
pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    let base = stock_defaults_value()?;
    let overlay = load_raw_settings(path)?;
    if overlay.is_some() {
        tracing::debug!(path = %path.display(), "loaded settings file");
    }
    resolve_settings(base, overlay)
}

/// Returns a fully-commented stock `article-media.toml`.
///
/// Used by the `gen-config` CLI command.
pub fn stock_settings_toml() -> &'static str {
    r##"# article-media settings
# ======================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults.
# Unknown keys will cause an error.

# ---------------------------------------------------------------------------
# Image generation
# ---------------------------------------------------------------------------
# The generator is run once per image as:
#   <command> <args...> --prompt P --size WxH --resolution R --model M --output PATH
# It must exit 0 and write PATH.
[generation]
command = "python3"
args = ["scripts/nanobanana.py"]
model = "gemini-3-pro-image-preview"
# Quality tier: "1K", "2K" or "4K".
resolution = "2K"
timeout_secs = 120
# Checked by `article-media check`. Empty disables the check.
api_key_env = "GEMINI_API_KEY"
# Where generated files go, relative to the input file.
images_dir = "images"

# ---------------------------------------------------------------------------
# Upload
# ---------------------------------------------------------------------------
# The uploader is run once per image as: <command> <args...> PATH
# It must exit 0 and print the image URL (a line starting with http(s)://,
# or JSON with a "url" field).
[upload]
command = "picgo"
args = ["upload"]
timeout_secs = 60
# Optional one-time credential check before the first upload. Advisory only:
# a failed check is reported but never blocks uploading.
token_env = ""
validate_url = ""

# ---------------------------------------------------------------------------
# Retry (applies to every generator and uploader call)
# ---------------------------------------------------------------------------
# Only failures whose diagnostic contains one of retriable_errors are retried.
# Timeouts are never retried.
[retry]
max_attempts = 3
initial_delay_secs = 2.0
backoff_factor = 1.5
retriable_errors = ["SSL", "ConnectionError", "TimeoutError", "NetworkError", "500", "502", "503", "504"]

# ---------------------------------------------------------------------------
# Concurrency
# ---------------------------------------------------------------------------
# Generation runs on `workers` threads with --parallel; uploads are always
# one at a time.
[concurrency]
workers = 2
upload_pause_secs = 1.0
task_delay_secs = 2.0

# ---------------------------------------------------------------------------
# Dry-run estimates
# ---------------------------------------------------------------------------
[estimate]
upload_secs = 5.0
generation_secs = { "1K" = 15.0, "2K" = 25.0, "4K" = 45.0 }

# Overriding `pricing` replaces the whole table.
[[estimate.pricing]]
model = "gemini-3-pro-image-preview"
resolution = "1K"
usd = 0.134

[[estimate.pricing]]
model = "gemini-3-pro-image-preview"
resolution = "2K"
usd = 0.20

[[estimate.pricing]]
model = "gemini-3-pro-image-preview"
resolution = "4K"
usd = 0.24

[[estimate.pricing]]
model = "gemini-2.5-flash-image"
resolution = "1K"
usd = 0.039

[[estimate.pricing]]
model = "gemini-2.5-flash-image"
resolution = "2K"
usd = 0.039
"##
}
