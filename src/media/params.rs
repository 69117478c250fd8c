//! Parameter types for collaborator calls.
//!
//! These structs describe *what* to ask for, not *how* it is done. They sit
//! between the [`operations`](super::operations) stages (which decide what to
//! generate and where) and the [`backend`](super::backend) traits (which talk
//! to the external tools), so tests can swap in mock backends without
//! touching stage logic.
//!
//! ## Types
//!
//! - [`PixelSize`]: concrete `WxH` passed to the generator.
//! - [`Resolution`]: generator quality tier (`1K`, `2K`, `4K`; default `2K`).
//! - [`GenerateParams`]: one generation request: prompt, size, tier, model, output path, time budget.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Pixel dimensions for a generated image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelSize {
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for PixelSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown resolution {0:?}; expected 1K, 2K or 4K")]
pub struct UnknownResolution(pub String);

/// Quality tier understood by the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "1K")]
    OneK,
    #[default]
    #[serde(rename = "2K")]
    TwoK,
    #[serde(rename = "4K")]
    FourK,
}

impl Resolution {
    pub const ALL: [Resolution; 3] = [Resolution::OneK, Resolution::TwoK, Resolution::FourK];

    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::OneK => "1K",
            Resolution::TwoK => "2K",
            Resolution::FourK => "4K",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = UnknownResolution;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "1K" => Ok(Resolution::OneK),
            "2K" => Ok(Resolution::TwoK),
            "4K" => Ok(Resolution::FourK),
            _ => Err(UnknownResolution(s.to_string())),
        }
    }
}

/// One generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateParams {
    pub prompt: String,
    pub size: PixelSize,
    pub resolution: Resolution,
    pub model: String,
    pub output: PathBuf,
    pub timeout: Duration,
}
