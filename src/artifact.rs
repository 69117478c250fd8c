//! Artifact descriptors and batch configuration parsing.
//!
//! A batch is described by a JSON document listing the images an article
//! needs:
//!
//! ```json
//! {
//!   "images": [
//!     {"name": "cover", "prompt": "A lighthouse at dawn", "aspect_ratio": "16:9"},
//!     {"name": "diagram", "prompt": "Flat illustration of a pipeline", "filename": "pipe.jpg"}
//!   ]
//! }
//! ```
//!
//! A bare array (without the `images` wrapper) is accepted and wrapped.
//! `aspect_ratio` defaults to `3:2`, `filename` to `<name>.jpg`.
//!
//! ## Rejected input
//!
//! - missing or blank `name` / `prompt`
//! - aspect ratios outside the supported set
//! - legacy pixel-size fields (`size`, `width`, `height`, ...): the generator
//!   only accepts the enumerated aspect ratios, so guessing would silently
//!   produce the wrong shape
//! - unknown fields, empty lists, filenames containing path separators

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::media::PixelSize;
use crate::types::ArtifactState;

/// Per-image fields from older config formats that must not be guessed at.
const LEGACY_FIELDS: &[&str] = &["size", "width", "height", "dimensions", "resolution"];

#[derive(Error, Debug)]
pub enum BatchConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid batch config: {0}")]
    Shape(String),
    #[error("batch config contains no images")]
    Empty,
    #[error("images[{index}]: missing required field \"{field}\"")]
    MissingField { index: usize, field: &'static str },
    #[error(
        "images[{index}]: field \"{field}\" is no longer supported; use \"aspect_ratio\" with one of {supported} (e.g. \"3:2\")",
        supported = AspectRatio::supported_list()
    )]
    LegacyField { index: usize, field: String },
    #[error("images[{index}]: {source}")]
    AspectRatio {
        index: usize,
        source: UnknownAspectRatio,
    },
    #[error("images[{index}]: filename {filename:?} must be a plain file name")]
    InvalidFilename { index: usize, filename: String },
    #[error("images[{index}]: filename {filename:?} is already used by images[{first}]")]
    DuplicateFilename {
        index: usize,
        first: usize,
        filename: String,
    },
    #[error("images[{index}]: {source}")]
    Entry {
        index: usize,
        source: serde_json::Error,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "unsupported aspect ratio {0:?}; supported: {supported}",
    supported = AspectRatio::supported_list()
)]
pub struct UnknownAspectRatio(pub String);

/// The aspect ratios the image generator accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AspectRatio {
    Square,
    Portrait2x3,
    #[default]
    Landscape3x2,
    Portrait3x4,
    Landscape4x3,
    Portrait4x5,
    Landscape5x4,
    Portrait9x16,
    Landscape16x9,
    Ultrawide21x9,
}

impl AspectRatio {
    pub const ALL: [AspectRatio; 10] = [
        AspectRatio::Square,
        AspectRatio::Portrait2x3,
        AspectRatio::Landscape3x2,
        AspectRatio::Portrait3x4,
        AspectRatio::Landscape4x3,
        AspectRatio::Portrait4x5,
        AspectRatio::Landscape5x4,
        AspectRatio::Portrait9x16,
        AspectRatio::Landscape16x9,
        AspectRatio::Ultrawide21x9,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AspectRatio::Square => "1:1",
            AspectRatio::Portrait2x3 => "2:3",
            AspectRatio::Landscape3x2 => "3:2",
            AspectRatio::Portrait3x4 => "3:4",
            AspectRatio::Landscape4x3 => "4:3",
            AspectRatio::Portrait4x5 => "4:5",
            AspectRatio::Landscape5x4 => "5:4",
            AspectRatio::Portrait9x16 => "9:16",
            AspectRatio::Landscape16x9 => "16:9",
            AspectRatio::Ultrawide21x9 => "21:9",
        }
    }

    /// Concrete pixel size the generator is asked for.
    pub fn pixel_size(self) -> PixelSize {
        let (width, height) = match self {
            AspectRatio::Square => (1024, 1024),
            AspectRatio::Portrait2x3 => (832, 1248),
            AspectRatio::Landscape3x2 => (1248, 832),
            AspectRatio::Portrait3x4 => (864, 1184),
            AspectRatio::Landscape4x3 => (1184, 864),
            AspectRatio::Portrait4x5 => (896, 1152),
            AspectRatio::Landscape5x4 => (1152, 896),
            AspectRatio::Portrait9x16 => (768, 1344),
            AspectRatio::Landscape16x9 => (1344, 768),
            AspectRatio::Ultrawide21x9 => (1536, 672),
        };
        PixelSize { width, height }
    }

    fn supported_list() -> String {
        Self::ALL
            .iter()
            .map(|r| r.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl FromStr for AspectRatio {
    type Err = UnknownAspectRatio;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Self::ALL
            .into_iter()
            .find(|r| r.as_str() == trimmed)
            .ok_or_else(|| UnknownAspectRatio(s.to_string()))
    }
}

impl TryFrom<String> for AspectRatio {
    type Error = UnknownAspectRatio;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AspectRatio> for String {
    fn from(ratio: AspectRatio) -> Self {
        ratio.as_str().to_string()
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the batch configuration, as written by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactSpec {
    pub name: String,
    pub prompt: String,
    #[serde(default)]
    pub aspect_ratio: AspectRatio,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl ArtifactSpec {
    pub fn new(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt: prompt.into(),
            aspect_ratio: AspectRatio::default(),
            filename: None,
        }
    }

    /// The filename the artifact will be written to.
    pub fn resolved_filename(&self) -> String {
        self.filename
            .clone()
            .unwrap_or_else(|| format!("{}.jpg", self.name))
    }

    /// Copy with every default made explicit; used for fingerprinting so that
    /// `{"name": "a"}` and `{"name": "a", "filename": "a.jpg"}` match.
    pub fn normalized(&self) -> Self {
        Self {
            filename: Some(self.resolved_filename()),
            ..self.clone()
        }
    }
}

/// One unit of work tracked through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub prompt: String,
    pub aspect_ratio: AspectRatio,
    pub filename: String,
    /// Set by the generation stage once the file exists.
    pub local_path: Option<PathBuf>,
    /// Set by the upload stage once the image host returned a URL.
    pub remote_url: Option<String>,
    pub state: ArtifactState,
}

impl Artifact {
    pub fn new(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::from_spec(&ArtifactSpec::new(name, prompt))
    }

    pub fn from_spec(spec: &ArtifactSpec) -> Self {
        Self {
            name: spec.name.clone(),
            prompt: spec.prompt.clone(),
            aspect_ratio: spec.aspect_ratio,
            filename: spec.resolved_filename(),
            local_path: None,
            remote_url: None,
            state: ArtifactState::Pending,
        }
    }

    pub fn with_aspect_ratio(mut self, ratio: AspectRatio) -> Self {
        self.aspect_ratio = ratio;
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    /// Move to `next`, refusing backward or skipping transitions.
    ///
    /// Returns whether the transition happened.
    pub fn advance(&mut self, next: ArtifactState) -> bool {
        let legal = self.state.can_advance_to(next);
        debug_assert!(legal, "illegal transition {} -> {}", self.state, next);
        if legal {
            self.state = next;
        }
        legal
    }
}

/// Build artifacts from parsed specs, preserving order.
pub fn artifacts_from_specs(specs: &[ArtifactSpec]) -> Vec<Artifact> {
    specs.iter().map(Artifact::from_spec).collect()
}

/// Parse a batch configuration document.
pub fn parse_batch_config(text: &str) -> Result<Vec<ArtifactSpec>, BatchConfigError> {
    let value: Value = serde_json::from_str(text)?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => {
            if let Some(key) = map.keys().find(|k| k.as_str() != "images") {
                return Err(BatchConfigError::Shape(format!(
                    "unknown top-level field \"{key}\""
                )));
            }
            match map.remove("images") {
                Some(Value::Array(items)) => items,
                Some(_) => {
                    return Err(BatchConfigError::Shape(
                        "\"images\" must be an array".into(),
                    ));
                }
                None => {
                    return Err(BatchConfigError::Shape(
                        "expected an object with an \"images\" array, or a bare array".into(),
                    ));
                }
            }
        }
        _ => {
            return Err(BatchConfigError::Shape(
                "expected an object with an \"images\" array, or a bare array".into(),
            ));
        }
    };

    if items.is_empty() {
        return Err(BatchConfigError::Empty);
    }

    let specs = items
        .into_iter()
        .enumerate()
        .map(|(index, item)| parse_entry(index, item))
        .collect::<Result<Vec<_>, _>>()?;

    if let Some((index, first)) = first_duplicate_filename(&specs) {
        return Err(BatchConfigError::DuplicateFilename {
            index,
            first,
            filename: specs[index].resolved_filename(),
        });
    }
    Ok(specs)
}

/// `(index, first)` for the first spec whose resolved filename an earlier
/// spec already claimed.
pub fn first_duplicate_filename(specs: &[ArtifactSpec]) -> Option<(usize, usize)> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    for (index, spec) in specs.iter().enumerate() {
        if let Some(&first) = seen.get(&spec.resolved_filename()) {
            return Some((index, first));
        }
        seen.insert(spec.resolved_filename(), index);
    }
    None
}

fn parse_entry(index: usize, item: Value) -> Result<ArtifactSpec, BatchConfigError> {
    let obj = item
        .as_object()
        .ok_or_else(|| BatchConfigError::Shape(format!("images[{index}] must be an object")))?;

    if let Some(field) = LEGACY_FIELDS.iter().find(|f| obj.contains_key(**f)) {
        return Err(BatchConfigError::LegacyField {
            index,
            field: field.to_string(),
        });
    }

    for field in ["name", "prompt"] {
        match obj.get(field).and_then(Value::as_str) {
            Some(s) if !s.trim().is_empty() => {}
            _ => return Err(BatchConfigError::MissingField { index, field }),
        }
    }

    if let Some(Value::String(ratio)) = obj.get("aspect_ratio") {
        ratio
            .parse::<AspectRatio>()
            .map_err(|source| BatchConfigError::AspectRatio { index, source })?;
    }

    let spec: ArtifactSpec =
        serde_json::from_value(item).map_err(|source| BatchConfigError::Entry { index, source })?;

    let filename = spec.resolved_filename();
    if filename.trim().is_empty() || filename.contains(['/', '\\']) || filename == ".." {
        return Err(BatchConfigError::InvalidFilename { index, filename });
    }

    Ok(spec)
}

/// Read and parse a batch configuration file.
pub fn load_batch_config(path: &Path) -> Result<Vec<ArtifactSpec>, BatchConfigError> {
    let text = std::fs::read_to_string(path)?;
    parse_batch_config(&text)
}
