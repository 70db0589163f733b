use anyhow::Result;
use chrono::NaiveDate;
use serde::Deserialize;
use tracing::{info, warn};

use super::anchor::{self, Anchor};
use super::percentile::{self, PercentilePoints};
use super::{blend, density, spread};
use super::{EnsembleInput, FusionConfig, FusionError, ProbabilityResult};

/// Learned per-location correction injected into a request. Read-only here;
/// produced by the calibration learner.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CalibrationOverride {
    pub bias_offset: f64,
    pub spread_factor: f64,
}

/// One fully resolved probability request. All upstream values are already
/// fetched; the pipeline itself performs no I/O.
#[derive(Debug, Clone, Deserialize)]
pub struct FusionRequest {
    pub location: String,
    pub forecast_date: NaiveDate,
    pub ensemble: EnsembleInput,
    #[serde(default)]
    pub anchors: Vec<Anchor>,
    /// Externally supplied percentile forecast; drives both the secondary
    /// density and the anchor-implied spread factor
    #[serde(default)]
    pub percentiles: Option<PercentilePoints>,
    #[serde(default)]
    pub calibration: Option<CalibrationOverride>,
}

/// Run the full fusion chain for one request.
///
/// Order: anchor chain → learned bias shift → composed spread correction →
/// bucket density estimate → optional blend with the percentile-fit
/// density. An empty pooled ensemble is terminal and yields a defined
/// empty result, not an error.
pub fn compute(
    request: &FusionRequest,
    config: &FusionConfig,
    today: NaiveDate,
) -> Result<ProbabilityResult, FusionError> {
    let mut samples = request.ensemble.pooled();

    if samples.is_empty() {
        warn!("No ensemble members for {}", request.location);
        return Ok(empty_result(request));
    }

    let n = samples.len() as f64;
    let raw_mean = samples.iter().sum::<f64>() / n;
    let raw_std = if samples.len() > 1 {
        (samples.iter().map(|s| (s - raw_mean).powi(2)).sum::<f64>() / n).sqrt()
    } else {
        0.0
    };

    let same_day = request.forecast_date == today;
    let outcome = anchor::apply_chain(&mut samples, &request.anchors, same_day);

    // Learned bias corrects the residual left after the anchor blend
    if let Some(cal) = &request.calibration {
        for s in samples.iter_mut() {
            *s += cal.bias_offset;
        }
        info!(
            "Applied calibration for {}: bias={:+.2}, spread={:.2}",
            request.location, cal.bias_offset, cal.spread_factor
        );
    }
    let corrected_mean = samples.iter().sum::<f64>() / n;

    let anchor_implied = request
        .percentiles
        .as_ref()
        .map(|p| spread::anchor_implied_factor(p, raw_std));
    let learned = request.calibration.as_ref().map(|c| c.spread_factor);
    let factor = spread::compose(config.spread_correction, learned, anchor_implied);
    let applied_factor = spread::apply(&mut samples, factor);

    let ensemble_buckets = density::estimate_buckets(&samples, config)?;

    let secondary = request
        .percentiles
        .as_ref()
        .and_then(|p| percentile::fit_bucket_probabilities(p, config));
    let buckets = blend::blend(
        ensemble_buckets,
        secondary.as_deref(),
        config.density_blend_weight,
    );

    Ok(ProbabilityResult {
        location: request.location.clone(),
        forecast_date: request.forecast_date,
        buckets,
        raw_mean,
        corrected_mean,
        ensemble_std: raw_std,
        source_counts: request.ensemble.source_counts(),
        anchor_shifts: outcome.shifts,
        anchor_source: outcome
            .primary
            .map(|k| k.to_string())
            .unwrap_or_else(|| "raw".to_string()),
        spread_factor: applied_factor,
        calibration_bias: request.calibration.as_ref().map(|c| c.bias_offset),
    })
}

/// Pipeline work is CPU-bound (KDE, quadrature, least squares); run it off
/// the serving loop.
pub async fn compute_blocking(
    request: FusionRequest,
    config: FusionConfig,
    today: NaiveDate,
) -> Result<ProbabilityResult> {
    let result = tokio::task::spawn_blocking(move || compute(&request, &config, today)).await?;
    Ok(result?)
}

fn empty_result(request: &FusionRequest) -> ProbabilityResult {
    ProbabilityResult {
        location: request.location.clone(),
        forecast_date: request.forecast_date,
        buckets: Vec::new(),
        raw_mean: 0.0,
        corrected_mean: 0.0,
        ensemble_std: 0.0,
        source_counts: request.ensemble.source_counts(),
        anchor_shifts: Vec::new(),
        anchor_source: "none".to_string(),
        spread_factor: 1.0,
        calibration_bias: None,
    }
}
