use std::collections::BTreeMap;
use tracing::debug;

use super::density::NEGLIGIBLE_PROB;
use super::BucketProbability;

/// Mix the ensemble-derived bucket distribution with an independently
/// produced one on the same partition: `(1-w)*ensemble + w*secondary`,
/// renormalized. A missing secondary set or `w <= 0` returns the ensemble
/// distribution unchanged — a missing source never fails the pipeline.
pub fn blend(
    ensemble: Vec<BucketProbability>,
    secondary: Option<&[BucketProbability]>,
    weight: f64,
) -> Vec<BucketProbability> {
    let secondary = match secondary {
        Some(s) if weight > 0.0 && !s.is_empty() => s,
        _ => return ensemble,
    };
    let weight = weight.min(1.0);

    // Union of both partitions, keyed by bucket lower bound
    let mut merged: BTreeMap<i64, (BucketProbability, f64, f64)> = BTreeMap::new();
    for b in ensemble {
        let p = b.probability;
        merged.insert(bucket_key(&b), (b, p, 0.0));
    }
    for b in secondary {
        merged
            .entry(bucket_key(b))
            .and_modify(|entry| entry.2 = b.probability)
            .or_insert_with(|| {
                let mut spec = b.clone();
                spec.probability = 0.0;
                (spec, 0.0, b.probability)
            });
    }

    let mut buckets: Vec<BucketProbability> = merged
        .into_values()
        .map(|(mut bucket, e, s)| {
            bucket.probability = (1.0 - weight) * e + weight * s;
            bucket
        })
        .collect();

    let total: f64 = buckets.iter().map(|b| b.probability).sum();
    if total > 0.0 {
        for bucket in &mut buckets {
            bucket.probability /= total;
        }
    }
    buckets.retain(|b| b.probability > NEGLIGIBLE_PROB);
    debug!("Blended densities with w={:.2} into {} buckets", weight, buckets.len());
    buckets
}

fn bucket_key(bucket: &BucketProbability) -> i64 {
    (bucket.lower * 1000.0).round() as i64
}
