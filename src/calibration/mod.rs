pub mod history;
pub mod store;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::fusion::FusionConfig;
use self::history::{Provenance, ValidationLog};

/// Clamp range for the learned spread factor
pub const SPREAD_FACTOR_MIN: f64 = 0.8;
pub const SPREAD_FACTOR_MAX: f64 = 2.0;

/// Learned per-location correction parameters.
///
/// `blend_weight` pins the anchor blend weight the parameters were computed
/// under; a record computed against a different serving-time weight is
/// stale and should be recomputed rather than applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationParams {
    pub location: String,
    /// Weighted mean of (actual - predicted)
    pub bias_offset: f64,
    /// Weighted std(actual) / std(predicted), clamped to [0.8, 2.0]
    pub spread_factor: f64,
    pub sample_size: usize,
    /// Trust-weighted row count that cleared the minimum
    pub effective_sample_size: f64,
    pub blend_weight: f64,
}

fn weighted_mean(values: &[f64], weights: &[f64]) -> f64 {
    let total: f64 = weights.iter().sum();
    values
        .iter()
        .zip(weights)
        .map(|(v, w)| v * w)
        .sum::<f64>()
        / total
}

fn weighted_std(values: &[f64], weights: &[f64]) -> f64 {
    let total: f64 = weights.iter().sum();
    let mean = weighted_mean(values, weights);
    (values
        .iter()
        .zip(weights)
        .map(|(v, w)| w * (v - mean).powi(2))
        .sum::<f64>()
        / total)
        .sqrt()
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

/// Recompute calibration parameters for every location in the validation
/// log.
///
/// Each row's predicted value is reconstructed with the same anchor blend
/// the pipeline uses (`w*anchor + (1-w)*ensemble`, single-source fallback),
/// so the learned bias corrects exactly the residual that blend leaves.
/// Backfilled rows weigh `config.backfill_weight`; locations whose weight
/// sum stays below `config.min_effective_samples` are omitted, never
/// zero-filled.
pub fn compute_calibration(
    log: &ValidationLog,
    config: &FusionConfig,
) -> HashMap<String, CalibrationParams> {
    let blend_weight = config.anchor_blend_weight;
    let mut result = HashMap::new();

    for location in log.locations() {
        let mut actuals = Vec::new();
        let mut predicted = Vec::new();
        let mut weights = Vec::new();

        for row in log.for_location(&location) {
            let prediction = match (row.anchor_point, row.ensemble_mean) {
                (Some(anchor), Some(ensemble)) => {
                    Some(blend_weight * anchor + (1.0 - blend_weight) * ensemble)
                }
                (Some(anchor), None) => Some(anchor),
                (None, Some(ensemble)) => Some(ensemble),
                (None, None) => None,
            };
            let (Some(actual), Some(prediction)) = (row.actual_high, prediction) else {
                continue;
            };
            actuals.push(actual);
            predicted.push(prediction);
            weights.push(match row.provenance {
                Provenance::Organic => 1.0,
                Provenance::Backfilled => config.backfill_weight,
            });
        }

        let effective_n: f64 = weights.iter().sum();
        if effective_n < config.min_effective_samples {
            debug!(
                "Skipping {}: effective_n={:.1} (need {:.0}, {} rows)",
                location,
                effective_n,
                config.min_effective_samples,
                actuals.len()
            );
            continue;
        }

        let errors: Vec<f64> = actuals
            .iter()
            .zip(&predicted)
            .map(|(a, p)| a - p)
            .collect();
        let bias_offset = weighted_mean(&errors, &weights);

        let std_predicted = weighted_std(&predicted, &weights);
        let spread_factor = if std_predicted > 1e-9 {
            (weighted_std(&actuals, &weights) / std_predicted)
                .clamp(SPREAD_FACTOR_MIN, SPREAD_FACTOR_MAX)
        } else {
            1.0
        };

        info!(
            "Calibration for {}: bias={:+.2}, spread={:.2}, n={} (effective={:.1})",
            location,
            bias_offset,
            spread_factor,
            actuals.len(),
            effective_n
        );
        result.insert(
            location.clone(),
            CalibrationParams {
                location,
                bias_offset: round4(bias_offset),
                spread_factor: round4(spread_factor),
                sample_size: actuals.len(),
                effective_sample_size: round4(effective_n),
                blend_weight,
            },
        );
    }

    result
}
