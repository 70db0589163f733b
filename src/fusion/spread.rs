use tracing::{debug, warn};

use super::percentile::PercentilePoints;

/// Clamp range for the anchor-implied factor (percentile sigma / ensemble sigma)
pub const ANCHOR_SPREAD_MIN: f64 = 0.5;
pub const ANCHOR_SPREAD_MAX: f64 = 3.0;

/// Fallback anchor-implied factor when the raw ensemble spread is too small
/// to form a meaningful ratio
const DEGENERATE_STD_FACTOR: f64 = 1.3;
const MIN_ENSEMBLE_STD: f64 = 0.1;

/// Scale samples around their current mean by `factor`. The mean is
/// invariant; `factor == 1.0` leaves the slice byte-for-byte untouched.
/// A NaN or non-positive factor falls back to 1.0. Returns the factor
/// actually applied.
pub fn apply(samples: &mut [f64], factor: f64) -> f64 {
    let factor = if factor.is_finite() && factor > 0.0 {
        factor
    } else {
        warn!("Invalid spread factor {}, falling back to 1.0", factor);
        1.0
    };
    if factor == 1.0 || samples.is_empty() {
        return factor;
    }
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    for s in samples.iter_mut() {
        *s = mean + (*s - mean) * factor;
    }
    factor
}

/// Effective spread factor: config default × learned calibration factor ×
/// anchor-implied factor, with absent components treated as 1
pub fn compose(config_default: f64, learned: Option<f64>, anchor_implied: Option<f64>) -> f64 {
    let factor = config_default * learned.unwrap_or(1.0) * anchor_implied.unwrap_or(1.0);
    debug!(
        "Composed spread factor {:.3} (default={:.2}, learned={:?}, anchor={:?})",
        factor, config_default, learned, anchor_implied
    );
    factor
}

/// Spread factor implied by a percentile forecast: the ratio of its
/// normal-equivalent sigma to the ensemble's own sigma, clamped to
/// [0.5, 3.0]. A near-zero ensemble std cannot form a ratio and yields
/// the 1.3 fallback.
pub fn anchor_implied_factor(points: &PercentilePoints, ensemble_std: f64) -> f64 {
    if ensemble_std <= MIN_ENSEMBLE_STD {
        return DEGENERATE_STD_FACTOR;
    }
    (points.implied_sigma() / ensemble_std).clamp(ANCHOR_SPREAD_MIN, ANCHOR_SPREAD_MAX)
}
