pub mod anchor;
pub mod blend;
pub mod density;
pub mod percentile;
pub mod pipeline;
pub mod spread;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use self::anchor::AnchorKind;

const CONFIG_FILE: &str = "config.toml";

/// Fusion engine configuration loaded from config.toml
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FusionConfig {
    /// Width of each temperature bucket in °F
    #[serde(default = "default_bucket_width")]
    pub bucket_width_f: f64,
    /// Lower edge of the bucket domain in °F
    #[serde(default = "default_bucket_min")]
    pub bucket_min_f: f64,
    /// Upper edge of the bucket domain in °F (exclusive)
    #[serde(default = "default_bucket_max")]
    pub bucket_max_f: f64,
    /// Static spread correction applied when no learned/anchor factor exists
    #[serde(default = "default_spread_correction")]
    pub spread_correction: f64,
    /// Weight of a point anchor in the mean blend (1.0 = full override).
    /// The calibration learner reconstructs predictions with this same value,
    /// so changing it invalidates stored calibration params.
    #[serde(default = "default_anchor_blend_weight")]
    pub anchor_blend_weight: f64,
    /// Weight of the percentile-fit density when blending with the ensemble density
    #[serde(default = "default_density_blend_weight")]
    pub density_blend_weight: f64,
    /// Minimum effective (trust-weighted) observations before a location is calibrated
    #[serde(default = "default_min_effective_samples")]
    pub min_effective_samples: f64,
    /// Trust weight for backfilled validation rows (organic rows weigh 1.0)
    #[serde(default = "default_backfill_weight")]
    pub backfill_weight: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            bucket_width_f: 2.0,
            bucket_min_f: 0.0,
            bucket_max_f: 130.0,
            spread_correction: 1.0,
            anchor_blend_weight: 0.85,
            density_blend_weight: 0.6,
            min_effective_samples: 5.0,
            backfill_weight: 0.6,
        }
    }
}

fn default_bucket_width() -> f64 { 2.0 }
fn default_bucket_min() -> f64 { 0.0 }
fn default_bucket_max() -> f64 { 130.0 }
fn default_spread_correction() -> f64 { 1.0 }
fn default_anchor_blend_weight() -> f64 { 0.85 }
fn default_density_blend_weight() -> f64 { 0.6 }
fn default_min_effective_samples() -> f64 { 5.0 }
fn default_backfill_weight() -> f64 { 0.6 }

impl FusionConfig {
    /// Load from config.toml, falling back to defaults when the file is absent
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str(&data)
                .with_context(|| format!("Failed to parse {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }
}

/// Per-model-source ensemble member temperatures
///
/// Sources are keyed by model name (e.g. "gefs", "ecmwf", "icon", "gem").
/// An input whose pooled member list is empty is terminal: the pipeline
/// returns a defined empty result for it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnsembleInput {
    pub sources: BTreeMap<String, Vec<f64>>,
}

impl EnsembleInput {
    pub fn from_source(name: &str, members: Vec<f64>) -> Self {
        let mut sources = BTreeMap::new();
        sources.insert(name.to_string(), members);
        Self { sources }
    }

    /// All members across sources, in source-name order
    pub fn pooled(&self) -> Vec<f64> {
        self.sources.values().flatten().copied().collect()
    }

    pub fn source_counts(&self) -> BTreeMap<String, usize> {
        self.sources
            .iter()
            .map(|(name, members)| (name.clone(), members.len()))
            .collect()
    }

    pub fn total_members(&self) -> usize {
        self.sources.values().map(|m| m.len()).sum()
    }
}

/// Temperature bucket [lower, upper) with its probability mass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketProbability {
    pub label: String,
    pub lower: f64,
    pub upper: f64,
    pub probability: f64,
}

impl BucketProbability {
    pub fn new(lower: f64, upper: f64) -> Self {
        Self {
            label: format!("{}-{}", lower as i64, upper as i64),
            lower,
            upper,
            probability: 0.0,
        }
    }
}

/// Build the empty bucket partition covering the configured domain
pub fn build_buckets(config: &FusionConfig) -> Vec<BucketProbability> {
    let mut buckets = Vec::new();
    let mut lower = config.bucket_min_f;
    while lower < config.bucket_max_f {
        let upper = lower + config.bucket_width_f;
        buckets.push(BucketProbability::new(lower, upper));
        lower = upper;
    }
    buckets
}

/// Calibrated bucket distribution plus diagnostics for one request
#[derive(Debug, Clone, Serialize)]
pub struct ProbabilityResult {
    pub location: String,
    pub forecast_date: NaiveDate,
    pub buckets: Vec<BucketProbability>,
    /// Pooled ensemble mean before any correction
    pub raw_mean: f64,
    /// Mean after the anchor chain and calibration bias
    pub corrected_mean: f64,
    /// Std of the raw pooled ensemble
    pub ensemble_std: f64,
    pub source_counts: BTreeMap<String, usize>,
    /// Cumulative mean shift attributable to each applied anchor
    pub anchor_shifts: Vec<(AnchorKind, f64)>,
    /// Primary anchor actually applied, "raw" when none, "none" for an empty ensemble
    pub anchor_source: String,
    /// Effective spread factor after composition and clamping
    pub spread_factor: f64,
    /// Learned bias offset applied on top of the anchor chain, if any
    pub calibration_bias: Option<f64>,
}

/// Hard failures of the fusion pipeline.
///
/// Unavailable optional inputs are not errors; they are modeled as `None`
/// and the pipeline falls through to the next source.
#[derive(Debug, thiserror::Error)]
pub enum FusionError {
    /// The density integrated to zero mass over the whole bucket domain.
    /// Distinct from an empty ensemble, which yields a defined empty result.
    #[error("density estimate for {n} samples carried no mass over the bucket domain")]
    ZeroDensity { n: usize },
}
