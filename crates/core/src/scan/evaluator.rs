use crate::domain::indicator::{finite, IndicatorSnapshot};
use crate::domain::preset::{label_for, ScoreBand, ThresholdSet};
use crate::domain::signal::{CandidateSignal, ConditionFlags};

/// Scores one instrument against one resolved threshold set.
///
/// Implementations must be total: bad input yields `matched == false`, never a panic.
pub trait SignalEvaluator: Send + Sync {
    fn evaluate(&self, snapshot: &IndicatorSnapshot, thresholds: &ThresholdSet) -> CandidateSignal;
}

/// Fixed rule set over the precomputed indicator fields.
#[derive(Debug, Clone)]
pub struct RuleEvaluator {
    score_bands: Vec<ScoreBand>,
}

impl RuleEvaluator {
    pub fn new(score_bands: Vec<ScoreBand>) -> Self {
        Self { score_bands }
    }
}

/// Fields without which no condition can be judged.
struct Required {
    ma_fast: f64,
    ma_slow: f64,
    ret_5d: f64,
    rsi: f64,
    relative_volume: f64,
}

fn required(s: &IndicatorSnapshot) -> Option<Required> {
    finite(s.close).filter(|c| *c > 0.0)?;
    Some(Required {
        ma_fast: finite(s.ma_fast)?,
        ma_slow: finite(s.ma_slow).filter(|m| *m > 0.0)?,
        ret_5d: finite(s.ret_5d)?,
        rsi: finite(s.rsi)?,
        relative_volume: s.relative_volume()?,
    })
}

fn conditions(s: &IndicatorSnapshot, r: &Required, t: &ThresholdSet) -> ConditionFlags {
    let crossed_up = r.ma_fast > r.ma_slow;
    let fresh = match (finite(s.ma_fast_prev), finite(s.ma_slow_prev)) {
        (Some(fp), Some(sp)) => fp <= sp,
        _ => false,
    };
    let trend_cross = crossed_up && (!t.fresh_cross_only || fresh);

    // A missing MACD histogram does not veto momentum; a negative one does.
    let macd_ok = finite(s.macd_hist).map_or(true, |h| h > 0.0);
    let momentum = r.ret_5d >= t.momentum_floor_pct && macd_ok;

    ConditionFlags {
        trend_cross,
        momentum,
        relative_volume: r.relative_volume >= t.volume_multiple,
        oscillator: r.rsi >= t.rsi_floor && r.rsi <= t.rsi_ceiling,
        gap_within_bounds: finite(s.gap_pct).is_some_and(|g| g.abs() <= t.max_gap_pct),
        extension_within_bounds: s.extension_pct().is_some_and(|e| e <= t.max_extension_pct),
    }
}

fn weighted_score(flags: &ConditionFlags, t: &ThresholdSet) -> f64 {
    let w = &t.weights;
    [
        (flags.trend_cross, w.trend_cross),
        (flags.momentum, w.momentum),
        (flags.relative_volume, w.relative_volume),
        (flags.oscillator, w.oscillator),
        (flags.gap_within_bounds, w.gap),
        (flags.extension_within_bounds, w.extension),
    ]
    .into_iter()
    .filter(|(hit, _)| *hit)
    .map(|(_, weight)| weight)
    .sum()
}

impl SignalEvaluator for RuleEvaluator {
    fn evaluate(&self, snapshot: &IndicatorSnapshot, t: &ThresholdSet) -> CandidateSignal {
        let mut out = CandidateSignal::no_match(snapshot.ticker.clone(), snapshot.as_of_date, t.stage);
        out.strategy = t.strategy.clone();
        out.close = finite(snapshot.close);

        let Some(req) = required(snapshot) else {
            out.score_label = label_for(&self.score_bands, 0.0);
            return out;
        };

        let flags = conditions(snapshot, &req, t);
        let score = weighted_score(&flags, t);
        let signal_count = flags.count();

        out.flags = flags;
        out.signal_count = signal_count;
        out.score = if score.is_finite() { score } else { 0.0 };
        out.matched = score.is_finite() && score >= t.cutoff && signal_count >= t.min_signal_count;
        out.score_label = label_for(&self.score_bands, out.score);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::preset::ScanConfig;
    use crate::domain::regime::Regime;
    use chrono::NaiveDate;

    fn strong_snapshot() -> IndicatorSnapshot {
        IndicatorSnapshot {
            close: Some(10_500.0),
            volume: Some(3_000_000.0),
            trading_value: Some(3.15e10),
            ma_fast: Some(10_200.0),
            ma_slow: Some(10_000.0),
            ma_fast_prev: Some(9_990.0),
            ma_slow_prev: Some(10_000.0),
            rsi: Some(62.0),
            macd_hist: Some(12.5),
            ret_5d: Some(4.0),
            volume_avg_20: Some(1_000_000.0),
            gap_pct: Some(1.2),
            ..IndicatorSnapshot::empty("KRX:005930", NaiveDate::from_ymd_opt(2025, 1, 10).unwrap())
        }
    }

    fn evaluator(cfg: &ScanConfig) -> RuleEvaluator {
        RuleEvaluator::new(cfg.score_bands.clone())
    }

    #[test]
    fn full_setup_matches_at_the_strict_stage() {
        let cfg = ScanConfig::default();
        let t = ThresholdSet::resolve(&cfg, 0, Regime::Bull).unwrap();
        let sig = evaluator(&cfg).evaluate(&strong_snapshot(), &t);

        assert!(sig.matched);
        assert_eq!(sig.signal_count, 6);
        assert_eq!(sig.score, 12.0);
        assert_eq!(sig.score_label, "strong");
        assert_eq!(sig.strategy, "trend_momentum");
        assert_eq!(sig.close, Some(10_500.0));
    }

    #[test]
    fn stale_cross_fails_only_where_a_fresh_cross_is_required() {
        let cfg = ScanConfig::default();
        let mut snap = strong_snapshot();
        snap.ma_fast_prev = Some(10_100.0);

        let strict = ThresholdSet::resolve(&cfg, 0, Regime::Bull).unwrap();
        let standard = ThresholdSet::resolve(&cfg, 1, Regime::Bull).unwrap();
        let ev = evaluator(&cfg);

        let a = ev.evaluate(&snap, &strict);
        assert!(!a.flags.trend_cross);
        assert!(!a.matched, "score {} is below cutoff {}", a.score, strict.cutoff);

        let b = ev.evaluate(&snap, &standard);
        assert!(b.flags.trend_cross);
        assert!(b.matched);
    }

    #[test]
    fn missing_or_nan_required_field_never_matches() {
        let cfg = ScanConfig::default();
        let t = ThresholdSet::resolve(&cfg, 3, Regime::Bull).unwrap();
        let ev = evaluator(&cfg);

        let mut no_rsi = strong_snapshot();
        no_rsi.rsi = None;
        let mut nan_close = strong_snapshot();
        nan_close.close = Some(f64::NAN);
        let mut zero_avg = strong_snapshot();
        zero_avg.volume_avg_20 = Some(0.0);

        for snap in [no_rsi, nan_close, zero_avg] {
            let sig = ev.evaluate(&snap, &t);
            assert!(!sig.matched);
            assert_eq!(sig.score, 0.0);
            assert_eq!(sig.flags, ConditionFlags::default());
        }
    }

    #[test]
    fn bear_regime_demands_more_than_bull() {
        let cfg = ScanConfig::default();
        let ev = evaluator(&cfg);
        let mut snap = strong_snapshot();
        // Volume confirmation fails under bear's scaled multiple (1.5 * 1.2) but passes in bull.
        snap.volume = Some(1_600_000.0);
        snap.gap_pct = None;

        let bull = ev.evaluate(&snap, &ThresholdSet::resolve(&cfg, 1, Regime::Bull).unwrap());
        let bear = ev.evaluate(&snap, &ThresholdSet::resolve(&cfg, 1, Regime::Bear).unwrap());
        assert!(bull.flags.relative_volume);
        assert!(!bear.flags.relative_volume);
        assert!(bull.matched);
        assert!(!bear.matched);
    }

    #[test]
    fn close_stretched_above_the_slow_average_fails_extension() {
        let cfg = ScanConfig::default();
        let t = ThresholdSet::resolve(&cfg, 0, Regime::Bull).unwrap();
        let mut snap = strong_snapshot();
        snap.close = Some(11_200.0);

        assert!(snap.extension_pct().unwrap() > t.max_extension_pct);
        let sig = evaluator(&cfg).evaluate(&snap, &t);
        assert!(!sig.flags.extension_within_bounds);
        assert!(sig.flags.trend_cross);
    }

    #[test]
    fn negative_macd_vetoes_momentum() {
        let cfg = ScanConfig::default();
        let t = ThresholdSet::resolve(&cfg, 1, Regime::Neutral).unwrap();
        let mut snap = strong_snapshot();
        snap.macd_hist = Some(-0.5);
        assert!(!evaluator(&cfg).evaluate(&snap, &t).flags.momentum);
        snap.macd_hist = None;
        assert!(evaluator(&cfg).evaluate(&snap, &t).flags.momentum);
    }
}
