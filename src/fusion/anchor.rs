use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// External point estimates the ensemble mean can be corrected toward.
///
/// Priority is fixed: a same-day nowcast beats everything, then the blended
/// percentile model, then the official point forecast. The resolution-source
/// forecast never competes for primary; it composes additively afterward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorKind {
    /// Same-day high-frequency forecast (HRRR-style); eligible only when
    /// the forecast date is today
    Nowcast,
    /// Post-processed multi-model percentile forecast (NBM-style)
    PercentileModel,
    /// Official point forecast (NWS-style)
    OfficialPoint,
    /// Forecast from the source the market resolves against
    ResolutionSource,
}

impl std::fmt::Display for AnchorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnchorKind::Nowcast => write!(f, "nowcast"),
            AnchorKind::PercentileModel => write!(f, "percentile_model"),
            AnchorKind::OfficialPoint => write!(f, "official"),
            AnchorKind::ResolutionSource => write!(f, "resolution"),
        }
    }
}

/// One available anchor. A `value` of `None` means the upstream source had
/// nothing for this request; such anchors are skipped, never treated as 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anchor {
    pub kind: AnchorKind,
    pub value: Option<f64>,
    /// Blend weight in [0,1]: 0 leaves the mean untouched, 1 moves it onto
    /// the anchor value
    pub weight: f64,
}

/// Result of running the anchor chain over a sample set
#[derive(Debug, Clone, Default)]
pub struct AnchorOutcome {
    /// Mean shift contributed by each applied anchor, in application order
    pub shifts: Vec<(AnchorKind, f64)>,
    /// The primary (highest-priority) anchor that was applied, if any
    pub primary: Option<AnchorKind>,
}

fn mean(samples: &[f64]) -> f64 {
    samples.iter().sum::<f64>() / samples.len() as f64
}

/// Shift every sample so the mean moves to `weight*value + (1-weight)*mean`.
/// Spread is untouched; returns the applied shift.
fn apply_anchor(samples: &mut [f64], value: f64, weight: f64) -> f64 {
    let weight = weight.clamp(0.0, 1.0);
    if weight == 0.0 {
        return 0.0;
    }
    let current = mean(samples);
    let shift = weight * (value - current);
    for s in samples.iter_mut() {
        *s += shift;
    }
    shift
}

fn find_valued(anchors: &[Anchor], kind: AnchorKind) -> Option<&Anchor> {
    anchors
        .iter()
        .find(|a| a.kind == kind && a.value.is_some())
}

/// Apply the ordered anchor rule table to `samples`.
///
/// Primary anchor, first match wins:
///   1. Nowcast, only when `same_day`
///   2. PercentileModel
///   3. OfficialPoint
/// A ResolutionSource anchor is then applied on top of whatever the primary
/// produced — it composes against the updated mean, it does not replace.
pub fn apply_chain(samples: &mut [f64], anchors: &[Anchor], same_day: bool) -> AnchorOutcome {
    let mut outcome = AnchorOutcome::default();
    if samples.is_empty() {
        return outcome;
    }

    let primary = if same_day {
        find_valued(anchors, AnchorKind::Nowcast)
    } else {
        None
    }
    .or_else(|| find_valued(anchors, AnchorKind::PercentileModel))
    .or_else(|| find_valued(anchors, AnchorKind::OfficialPoint));

    if let Some(anchor) = primary {
        let value = anchor.value.unwrap_or_default();
        let before = mean(samples);
        let shift = apply_anchor(samples, value, anchor.weight);
        outcome.shifts.push((anchor.kind, shift));
        outcome.primary = Some(anchor.kind);
        info!(
            "Applied {} anchor: mean={:.1}, anchor={:.1}, w={:.2}, shift={:+.2}",
            anchor.kind, before, value, anchor.weight, shift
        );
    } else {
        debug!("No primary anchor available, keeping raw ensemble mean");
    }

    if let Some(anchor) = find_valued(anchors, AnchorKind::ResolutionSource) {
        let value = anchor.value.unwrap_or_default();
        let shift = apply_anchor(samples, value, anchor.weight);
        outcome.shifts.push((AnchorKind::ResolutionSource, shift));
        info!(
            "Applied resolution-source anchor: value={:.1}, w={:.2}, shift={:+.2}",
            value, anchor.weight, shift
        );
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples() -> Vec<f64> {
        // mean 30.0
        vec![27.0, 29.0, 30.0, 31.0, 33.0]
    }

    fn anchor(kind: AnchorKind, value: f64, weight: f64) -> Anchor {
        Anchor { kind, value: Some(value), weight }
    }

    #[test]
    fn test_weight_one_forces_mean_onto_anchor() {
        let mut s = samples();
        apply_chain(&mut s, &[anchor(AnchorKind::OfficialPoint, 37.0, 1.0)], false);
        assert!((mean(&s) - 37.0).abs() < 1e-9);
    }

    #[test]
    fn test_weight_zero_is_exact_noop() {
        let mut s = samples();
        let before = s.clone();
        let outcome = apply_chain(&mut s, &[anchor(AnchorKind::OfficialPoint, 37.0, 0.0)], false);
        assert_eq!(s, before);
        assert_eq!(outcome.shifts, vec![(AnchorKind::OfficialPoint, 0.0)]);
    }

    #[test]
    fn test_weighted_blend_target() {
        let mut s = samples();
        apply_chain(&mut s, &[anchor(AnchorKind::OfficialPoint, 37.0, 0.85)], false);
        let expected = 0.85 * 37.0 + 0.15 * 30.0;
        assert!((mean(&s) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_percentile_model_beats_official() {
        let mut s = samples();
        let outcome = apply_chain(
            &mut s,
            &[
                anchor(AnchorKind::OfficialPoint, 20.0, 1.0),
                anchor(AnchorKind::PercentileModel, 40.0, 1.0),
            ],
            false,
        );
        assert_eq!(outcome.primary, Some(AnchorKind::PercentileModel));
        assert!((mean(&s) - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_nowcast_requires_same_day() {
        let mut s = samples();
        let outcome = apply_chain(
            &mut s,
            &[
                anchor(AnchorKind::Nowcast, 50.0, 1.0),
                anchor(AnchorKind::OfficialPoint, 40.0, 1.0),
            ],
            false,
        );
        assert_eq!(outcome.primary, Some(AnchorKind::OfficialPoint));

        let mut s = samples();
        let outcome = apply_chain(
            &mut s,
            &[
                anchor(AnchorKind::Nowcast, 50.0, 1.0),
                anchor(AnchorKind::OfficialPoint, 40.0, 1.0),
            ],
            true,
        );
        assert_eq!(outcome.primary, Some(AnchorKind::Nowcast));
        assert!((mean(&s) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_resolution_source_composes_after_primary() {
        let mut s = samples();
        let outcome = apply_chain(
            &mut s,
            &[
                anchor(AnchorKind::OfficialPoint, 40.0, 1.0),
                anchor(AnchorKind::ResolutionSource, 44.0, 0.5),
            ],
            false,
        );
        // primary moves mean to 40, resolution then blends halfway to 44
        assert_eq!(outcome.primary, Some(AnchorKind::OfficialPoint));
        assert_eq!(outcome.shifts.len(), 2);
        assert!((mean(&s) - 42.0).abs() < 1e-9);
    }

    #[test]
    fn test_missing_value_is_skipped() {
        let mut s = samples();
        let outcome = apply_chain(
            &mut s,
            &[
                Anchor { kind: AnchorKind::PercentileModel, value: None, weight: 1.0 },
                anchor(AnchorKind::OfficialPoint, 40.0, 1.0),
            ],
            false,
        );
        // a valueless percentile anchor must not shadow the official one
        assert_eq!(outcome.primary, Some(AnchorKind::OfficialPoint));
        assert!((mean(&s) - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_anchors_leaves_samples_alone() {
        let mut s = samples();
        let before = s.clone();
        let outcome = apply_chain(&mut s, &[], false);
        assert_eq!(s, before);
        assert!(outcome.primary.is_none());
        assert!(outcome.shifts.is_empty());
    }

    #[test]
    fn test_spread_unchanged_by_anchor() {
        let mut s = samples();
        let spread_before: f64 = s.iter().map(|v| (v - mean(&s)).powi(2)).sum();
        apply_chain(&mut s, &[anchor(AnchorKind::OfficialPoint, 45.0, 0.7)], false);
        let spread_after: f64 = s.iter().map(|v| (v - mean(&s)).powi(2)).sum();
        assert!((spread_before - spread_after).abs() < 1e-9);
    }
}
