//! Dry-run cost and time projection.
//!
//! ```text
//! seconds = count × (generation_secs[resolution] + (upload ? upload_secs : 0) + task_delay_secs)
//! cost    = count × price[(model, resolution)]
//! ```
//!
//! Pure: no I/O, no clock. The figures come from `[estimate]` in the settings
//! file and are only as good as the table they are given.

use crate::media::Resolution;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EstimateError {
    #[error("no price configured for model {model:?} at {resolution}")]
    UnknownPrice { model: String, resolution: Resolution },
    #[error("no generation time configured for {0}")]
    UnknownTiming(Resolution),
}

/// Per-image price for one model at one resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PriceRow {
    pub model: String,
    pub resolution: Resolution,
    pub usd: f64,
}

/// Tables the estimator draws from.
#[derive(Debug, Clone, PartialEq)]
pub struct CostModel {
    pub pricing: Vec<PriceRow>,
    /// Seconds per generation, keyed by resolution label (`"2K"`).
    pub generation_secs: BTreeMap<String, f64>,
    pub upload_secs: f64,
    pub task_delay_secs: f64,
}

impl CostModel {
    fn price(&self, model: &str, resolution: Resolution) -> Option<f64> {
        self.pricing
            .iter()
            .find(|row| row.model == model && row.resolution == resolution)
            .map(|row| row.usd)
    }
}

/// Projected cost and duration of a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Estimate {
    pub count: usize,
    pub model: String,
    pub resolution: Resolution,
    pub upload: bool,
    pub per_unit_cost_usd: f64,
    pub per_unit_seconds: f64,
    pub cost_usd: f64,
    pub seconds: f64,
}

/// Project the cost and wall-clock time of generating `count` images.
pub fn estimate(
    count: usize,
    model: &str,
    resolution: Resolution,
    upload: bool,
    costs: &CostModel,
) -> Result<Estimate, EstimateError> {
    let per_unit_cost_usd =
        costs
            .price(model, resolution)
            .ok_or_else(|| EstimateError::UnknownPrice {
                model: model.to_string(),
                resolution,
            })?;
    let generation = costs
        .generation_secs
        .get(resolution.as_str())
        .copied()
        .ok_or(EstimateError::UnknownTiming(resolution))?;

    let upload_secs = if upload { costs.upload_secs } else { 0.0 };
    let per_unit_seconds = generation + upload_secs + costs.task_delay_secs;

    Ok(Estimate {
        count,
        model: model.to_string(),
        resolution,
        upload,
        per_unit_cost_usd,
        per_unit_seconds,
        cost_usd: per_unit_cost_usd * count as f64,
        seconds: per_unit_seconds * count as f64,
    })
}
