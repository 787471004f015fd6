use crate::domain::regime::{PreopenRisk, PreopenRiskLevel};
use crate::ingest::types::PreopenSnapshot;

// Index-futures drop (percent) that saturates the futures component.
const FUTURES_SATURATION_PCT: f64 = 2.0;
// Absolute FX move (percent) that saturates the FX component.
const FX_SATURATION_PCT: f64 = 1.0;

const WEIGHT_FUTURES: f64 = 0.7;
const WEIGHT_FX: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreopenBuckets {
    /// Scores at or above this are `watch`.
    pub watch: f64,
    /// Scores at or above this are `danger`.
    pub danger: f64,
}

impl Default for PreopenBuckets {
    fn default() -> Self {
        Self {
            watch: 0.3,
            danger: 0.6,
        }
    }
}

/// Pre-open risk from futures/FX deltas. Invalid input is calm.
pub fn compute_preopen_risk_score(snapshot: &PreopenSnapshot, buckets: &PreopenBuckets) -> PreopenRisk {
    if !snapshot.valid {
        return PreopenRisk::default();
    }

    let futures = snapshot
        .futures_change_pct
        .filter(|v| v.is_finite())
        .map(|v| (-v / FUTURES_SATURATION_PCT).clamp(0.0, 1.0))
        .unwrap_or(0.0);
    let fx = snapshot
        .fx_change_pct
        .filter(|v| v.is_finite())
        .map(|v| (v.abs() / FX_SATURATION_PCT).clamp(0.0, 1.0))
        .unwrap_or(0.0);

    let score = (WEIGHT_FUTURES * futures + WEIGHT_FX * fx).clamp(0.0, 1.0);
    let level = if score >= buckets.danger {
        PreopenRiskLevel::Danger
    } else if score >= buckets.watch {
        PreopenRiskLevel::Watch
    } else {
        PreopenRiskLevel::Calm
    };

    PreopenRisk { score, level }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(futures: Option<f64>, fx: Option<f64>) -> PreopenSnapshot {
        PreopenSnapshot {
            valid: true,
            futures_change_pct: futures,
            fx_change_pct: fx,
            observed_at: None,
        }
    }

    #[test]
    fn invalid_is_calm() {
        let r = compute_preopen_risk_score(&PreopenSnapshot::invalid(), &PreopenBuckets::default());
        assert_eq!(r.level, PreopenRiskLevel::Calm);
        assert_eq!(r.score, 0.0);
    }

    #[test]
    fn rising_futures_carry_no_risk() {
        let r = compute_preopen_risk_score(&snap(Some(1.5), Some(0.0)), &PreopenBuckets::default());
        assert_eq!(r.score, 0.0);
        assert_eq!(r.level, PreopenRiskLevel::Calm);
    }

    #[test]
    fn buckets_by_severity() {
        let b = PreopenBuckets::default();
        assert_eq!(compute_preopen_risk_score(&snap(Some(-1.0), Some(0.2)), &b).level, PreopenRiskLevel::Watch);
        assert_eq!(compute_preopen_risk_score(&snap(Some(-3.0), Some(1.5)), &b).level, PreopenRiskLevel::Danger);
        assert_eq!(compute_preopen_risk_score(&snap(Some(f64::NAN), None), &b).level, PreopenRiskLevel::Calm);
    }
}
