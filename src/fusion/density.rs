use statrs::distribution::{Continuous, Normal};
use tracing::{debug, warn};

use super::{BucketProbability, FusionConfig, FusionError};

/// Below this count the KDE is unreliable and a plain histogram is used
const MIN_KDE_SAMPLES: usize = 5;

/// Buckets with less mass than this are dropped from the output
pub const NEGLIGIBLE_PROB: f64 = 1e-6;

/// Even number of Simpson subintervals per bucket
const SIMPSON_STEPS: usize = 8;

/// Gaussian kernel density estimate over a sample set
struct GaussianKde<'a> {
    samples: &'a [f64],
    bandwidth: f64,
    kernel: Normal,
}

impl<'a> GaussianKde<'a> {
    fn new(samples: &'a [f64], bandwidth: f64) -> Self {
        Self {
            samples,
            bandwidth,
            kernel: Normal::new(0.0, 1.0).unwrap(),
        }
    }

    fn pdf(&self, x: f64) -> f64 {
        let n = self.samples.len() as f64;
        self.samples
            .iter()
            .map(|xi| self.kernel.pdf((x - xi) / self.bandwidth))
            .sum::<f64>()
            / (n * self.bandwidth)
    }

    /// Simpson's rule over [lower, upper)
    fn integrate(&self, lower: f64, upper: f64) -> f64 {
        let h = (upper - lower) / SIMPSON_STEPS as f64;
        let mut acc = self.pdf(lower) + self.pdf(upper);
        for i in 1..SIMPSON_STEPS {
            let x = lower + i as f64 * h;
            acc += if i % 2 == 1 { 4.0 } else { 2.0 } * self.pdf(x);
        }
        acc * h / 3.0
    }
}

/// Silverman's rule of thumb: std * (3n/4)^(-1/5)
fn silverman_bandwidth(samples: &[f64]) -> f64 {
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let std = (samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n).sqrt();
    std * (3.0 * n / 4.0).powf(-0.2)
}

/// Convert a corrected sample set into normalized per-bucket probabilities.
///
/// With at least 5 samples a Gaussian KDE is integrated over each bucket;
/// fewer samples (or a zero bandwidth from identical samples) fall back to
/// the empirical histogram. An all-zero mass over the whole domain is a
/// hard `ZeroDensity` failure — never returned as a quietly empty
/// distribution.
pub fn estimate_buckets(
    samples: &[f64],
    config: &FusionConfig,
) -> Result<Vec<BucketProbability>, FusionError> {
    let mut buckets = super::build_buckets(config);

    if samples.len() >= MIN_KDE_SAMPLES {
        let bandwidth = silverman_bandwidth(samples);
        if bandwidth > 0.0 {
            let kde = GaussianKde::new(samples, bandwidth);
            let mut total = 0.0;
            for bucket in &mut buckets {
                let p = kde.integrate(bucket.lower, bucket.upper).max(0.0);
                bucket.probability = p;
                total += p;
            }
            debug!(
                "KDE over {} samples, bandwidth {:.3}, raw mass {:.4}",
                samples.len(),
                bandwidth,
                total
            );
            return finalize(buckets, total, samples.len());
        }
        warn!("Zero KDE bandwidth (identical samples), using histogram fallback");
    }

    let total = histogram(samples, &mut buckets);
    finalize(buckets, total, samples.len())
}

/// Fraction of samples per bucket, no smoothing. Returns the captured mass.
fn histogram(samples: &[f64], buckets: &mut [BucketProbability]) -> f64 {
    let n = samples.len();
    if n == 0 {
        return 0.0;
    }
    let mut total = 0.0;
    for bucket in buckets.iter_mut() {
        let count = samples
            .iter()
            .filter(|s| **s >= bucket.lower && **s < bucket.upper)
            .count();
        bucket.probability = count as f64 / n as f64;
        total += bucket.probability;
    }
    total
}

fn finalize(
    mut buckets: Vec<BucketProbability>,
    total: f64,
    n: usize,
) -> Result<Vec<BucketProbability>, FusionError> {
    if total <= 0.0 {
        return Err(FusionError::ZeroDensity { n });
    }
    for bucket in &mut buckets {
        bucket.probability /= total;
    }
    buckets.retain(|b| b.probability > NEGLIGIBLE_PROB);
    Ok(buckets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::distributions::Distribution;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn normal_samples(mean: f64, std: f64, n: usize) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(42);
        let dist = Normal::new(mean, std).unwrap();
        (0..n).map(|_| dist.sample(&mut rng)).collect()
    }

    fn total_mass(buckets: &[BucketProbability]) -> f64 {
        buckets.iter().map(|b| b.probability).sum()
    }

    #[test]
    fn test_kde_probabilities_sum_to_one() {
        let samples = normal_samples(75.0, 3.0, 82);
        let buckets = estimate_buckets(&samples, &FusionConfig::default()).unwrap();
        assert!((total_mass(&buckets) - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_all_probabilities_non_negative() {
        let samples = normal_samples(75.0, 5.0, 82);
        let buckets = estimate_buckets(&samples, &FusionConfig::default()).unwrap();
        assert!(buckets.iter().all(|b| b.probability >= 0.0));
    }

    #[test]
    fn test_histogram_fallback_below_five_samples() {
        let samples = vec![72.0, 74.0, 76.0, 78.0];
        let buckets = estimate_buckets(&samples, &FusionConfig::default()).unwrap();
        assert!((total_mass(&buckets) - 1.0).abs() < 0.01);
        // no smoothing: each sample lands in exactly one bucket at 1/4 mass
        for b in &buckets {
            assert!((b.probability - 0.25).abs() < 1e-9 || (b.probability - 0.5).abs() < 1e-9);
        }
    }

    #[test]
    fn test_single_sample_single_bucket() {
        let buckets = estimate_buckets(&[75.0], &FusionConfig::default()).unwrap();
        assert_eq!(buckets.len(), 1);
        assert!((buckets[0].probability - 1.0).abs() < 1e-9);
        assert_eq!(buckets[0].label, "74-76");
    }

    #[test]
    fn test_identical_samples_use_histogram() {
        let samples = vec![75.0; 30];
        let buckets = estimate_buckets(&samples, &FusionConfig::default()).unwrap();
        assert_eq!(buckets.len(), 1);
        assert!((buckets[0].probability - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_bimodal_mass_in_both_modes() {
        let mut samples = normal_samples(60.0, 2.0, 41);
        samples.extend(normal_samples(80.0, 2.0, 41));
        let buckets = estimate_buckets(&samples, &FusionConfig::default()).unwrap();
        let mass_60: f64 = buckets
            .iter()
            .filter(|b| b.lower >= 56.0 && b.upper <= 66.0)
            .map(|b| b.probability)
            .sum();
        let mass_80: f64 = buckets
            .iter()
            .filter(|b| b.lower >= 76.0 && b.upper <= 86.0)
            .map(|b| b.probability)
            .sum();
        assert!(mass_60 > 0.1, "expected mass around 60, got {}", mass_60);
        assert!(mass_80 > 0.1, "expected mass around 80, got {}", mass_80);
    }

    #[test]
    fn test_out_of_domain_samples_are_zero_density() {
        // everything far outside [0,130): the normalization attempt has
        // nothing to work with and must fail loudly
        let samples = vec![500.0, 510.0];
        let err = estimate_buckets(&samples, &FusionConfig::default()).unwrap_err();
        assert!(matches!(err, FusionError::ZeroDensity { n: 2 }));
    }

    #[test]
    fn test_wider_spread_never_fewer_buckets() {
        let tight = normal_samples(75.0, 1.0, 60);
        let mean = tight.iter().sum::<f64>() / tight.len() as f64;
        let wide: Vec<f64> = tight.iter().map(|s| mean + (s - mean) * 1.8).collect();

        let config = FusionConfig::default();
        let n_tight = estimate_buckets(&tight, &config)
            .unwrap()
            .iter()
            .filter(|b| b.probability > 0.01)
            .count();
        let n_wide = estimate_buckets(&wide, &config)
            .unwrap()
            .iter()
            .filter(|b| b.probability > 0.01)
            .count();
        assert!(n_wide >= n_tight);
    }
}
