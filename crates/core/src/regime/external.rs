use crate::domain::regime::{EvalMode, ExternalScore};
use crate::ingest::types::ExternalMarketSnapshot;
use crate::regime::local::{bounded, sanitize};
use chrono::NaiveDate;

// Prior-session move (percent) that saturates the momentum sub-score.
const MOMENTUM_SATURATION_PCT: f64 = 2.0;
const TREND_SATURATION: f64 = 0.03;
const NEUTRAL_VOLATILITY_INDEX: f64 = 20.0;
const VOLATILITY_INDEX_BAND: f64 = 10.0;

const WEIGHT_MOMENTUM: f64 = 0.5;
const WEIGHT_TREND: f64 = 0.3;
const WEIGHT_VOLATILITY: f64 = 0.2;

/// Why an external snapshot was not used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalRejection {
    Invalid,
    /// Session is not strictly before the evaluation date.
    NotPrior,
    /// Backtest evaluation cannot verify the session date.
    UndatedInBacktest,
}

impl ExternalRejection {
    pub fn as_str(self) -> &'static str {
        match self {
            ExternalRejection::Invalid => "invalid",
            ExternalRejection::NotPrior => "session not prior to as-of date",
            ExternalRejection::UndatedInBacktest => "undated snapshot in backtest",
        }
    }
}

/// Score the foreign reference market's prior session.
///
/// Returns `Err` with the reason when the snapshot must not be used; callers treat that as a
/// neutral score.
pub fn compute_external_prior_score(
    snapshot: &ExternalMarketSnapshot,
    as_of_date: NaiveDate,
    mode: EvalMode,
) -> Result<ExternalScore, ExternalRejection> {
    if !snapshot.valid {
        return Err(ExternalRejection::Invalid);
    }
    match (snapshot.session_date, mode) {
        (Some(d), _) if d >= as_of_date => return Err(ExternalRejection::NotPrior),
        (None, EvalMode::Backtest) => return Err(ExternalRejection::UndatedInBacktest),
        _ => {}
    }

    let close = snapshot.close.filter(|v| v.is_finite() && *v > 0.0);

    let momentum = match (close, snapshot.prev_close) {
        (Some(c), Some(p)) if p.is_finite() && p > 0.0 => {
            bounded((c / p - 1.0) * 100.0 / MOMENTUM_SATURATION_PCT)
        }
        _ => 0.0,
    };

    let trend = match (close, snapshot.ma20) {
        (Some(c), Some(ma)) if ma.is_finite() && ma > 0.0 => {
            bounded((c / ma - 1.0) / TREND_SATURATION)
        }
        _ => 0.0,
    };

    let volatility = match snapshot.volatility_index {
        Some(v) if v.is_finite() && v > 0.0 => {
            bounded((NEUTRAL_VOLATILITY_INDEX - v) / VOLATILITY_INDEX_BAND)
        }
        _ => 0.0,
    };

    let total = WEIGHT_MOMENTUM * momentum + WEIGHT_TREND * trend + WEIGHT_VOLATILITY * volatility;

    Ok(ExternalScore {
        momentum,
        trend,
        volatility,
        total: sanitize(total),
    })
}
