use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use tracing::{debug, warn};

use super::{BucketProbability, FusionConfig};

/// Quantile levels of the externally supplied percentile forecast
pub const QUANTILE_LEVELS: [f64; 5] = [0.10, 0.25, 0.50, 0.75, 0.90];

const MAX_ITERATIONS: usize = 100;
const STEP_TOLERANCE: f64 = 1e-8;
const MIN_SIGMA: f64 = 1e-3;

/// Five-point percentile forecast (10th/25th/50th/75th/90th), °F
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PercentilePoints {
    pub p10: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
}

impl PercentilePoints {
    fn values(&self) -> [f64; 5] {
        [self.p10, self.p25, self.p50, self.p75, self.p90]
    }

    pub fn is_monotonic(&self) -> bool {
        let v = self.values();
        v.windows(2).all(|w| w[0] <= w[1])
    }

    /// Sigma implied by the p10–p90 span of a normal distribution
    pub fn implied_sigma(&self) -> f64 {
        let z90 = Normal::new(0.0, 1.0).unwrap().inverse_cdf(0.9);
        (self.p90 - self.p10) / (2.0 * z90)
    }
}

/// Normal distribution fitted to a percentile forecast
#[derive(Debug, Clone, Copy)]
pub struct NormalFit {
    pub mean: f64,
    pub sigma: f64,
}

/// Least-squares fit of a normal distribution to the five percentile points.
///
/// Minimizes the squared error between theoretical quantiles
/// `mean + sigma*z_k` and the observed values over (mean, log-sigma), so
/// sigma stays positive. Returns `None` — never an error — when the input
/// is non-monotonic, the implied spread is degenerate, or the solver fails
/// to converge.
pub fn fit_normal(points: &PercentilePoints) -> Option<NormalFit> {
    if !points.is_monotonic() {
        warn!("Percentile forecast is not monotonic: {:?}", points);
        return None;
    }
    let iqr_sigma = (points.p75 - points.p25) / 1.349;
    if points.implied_sigma() < MIN_SIGMA || iqr_sigma < MIN_SIGMA {
        warn!("Percentile forecast has degenerate spread: {:?}", points);
        return None;
    }

    let std_normal = Normal::new(0.0, 1.0).unwrap();
    let z: Vec<f64> = QUANTILE_LEVELS.iter().map(|q| std_normal.inverse_cdf(*q)).collect();
    let y = points.values();

    // Gauss-Newton on (mu, s) with sigma = exp(s)
    let mut mu = points.p50;
    let mut s = iqr_sigma.ln();
    let mut converged = false;

    for _ in 0..MAX_ITERATIONS {
        let sigma = s.exp();
        let mut jtj = [[0.0f64; 2]; 2];
        let mut jtr = [0.0f64; 2];
        for k in 0..5 {
            let r = mu + sigma * z[k] - y[k];
            let j1 = sigma * z[k]; // d(model)/ds
            jtj[0][0] += 1.0;
            jtj[0][1] += j1;
            jtj[1][1] += j1 * j1;
            jtr[0] += r;
            jtr[1] += j1 * r;
        }
        jtj[1][0] = jtj[0][1];

        let det = jtj[0][0] * jtj[1][1] - jtj[0][1] * jtj[1][0];
        if det.abs() < 1e-12 {
            warn!("Singular normal equations in percentile fit");
            return None;
        }
        let dmu = (jtj[1][1] * jtr[0] - jtj[0][1] * jtr[1]) / det;
        let ds = (jtj[0][0] * jtr[1] - jtj[1][0] * jtr[0]) / det;
        mu -= dmu;
        s -= ds;
        if dmu.abs() < STEP_TOLERANCE && ds.abs() < STEP_TOLERANCE {
            converged = true;
            break;
        }
    }

    if !converged {
        warn!("Percentile fit did not converge for {:?}", points);
        return None;
    }
    let sigma = s.exp();
    if !mu.is_finite() || !sigma.is_finite() || sigma < MIN_SIGMA {
        return None;
    }
    debug!("Fitted normal to percentiles: mean={:.2}, sigma={:.2}", mu, sigma);
    Some(NormalFit { mean: mu, sigma })
}

/// Bucket probabilities of the fitted normal over the configured domain:
/// CDF differences per bucket, negatives clamped, normalized to sum to 1
pub fn fit_bucket_probabilities(
    points: &PercentilePoints,
    config: &FusionConfig,
) -> Option<Vec<BucketProbability>> {
    let fit = fit_normal(points)?;
    let dist = Normal::new(fit.mean, fit.sigma).ok()?;

    let mut buckets = super::build_buckets(config);
    let mut total = 0.0;
    for bucket in &mut buckets {
        let p = (dist.cdf(bucket.upper) - dist.cdf(bucket.lower)).max(0.0);
        bucket.probability = p;
        total += p;
    }
    if total > 0.0 {
        for bucket in &mut buckets {
            bucket.probability /= total;
        }
    }
    Some(buckets)
}
