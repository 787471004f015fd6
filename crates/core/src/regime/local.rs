use crate::domain::regime::LocalScore;
use crate::ingest::types::LocalMarketStats;

const TREND_SHORT_WINDOW: usize = 20;
const TREND_LONG_WINDOW: usize = 60;
const VOLATILITY_WINDOW: usize = 20;
const TRADING_DAYS_PER_YEAR: f64 = 252.0;

// Distance from a moving average that saturates the trend sub-score.
const TREND_SATURATION: f64 = 0.03;
// Annualized volatility mapped to a neutral sub-score, and the band that saturates it.
const NEUTRAL_VOLATILITY: f64 = 0.20;
const VOLATILITY_BAND: f64 = 0.10;

const WEIGHT_TREND: f64 = 0.40;
const WEIGHT_VOLATILITY: f64 = 0.20;
const WEIGHT_BREADTH: f64 = 0.25;
const WEIGHT_INTRADAY: f64 = 0.15;

/// Score the local market from rolling-window statistics.
///
/// Every sub-score is bounded to `[-1, 1]`. A sub-score whose inputs are missing or too short
/// contributes a neutral `0.0` instead of failing the whole score.
pub fn score_local_stats(stats: &LocalMarketStats) -> LocalScore {
    if !stats.valid {
        return LocalScore::default();
    }

    let closes: Vec<f64> = stats
        .index_closes
        .iter()
        .copied()
        .filter(|c| c.is_finite() && *c > 0.0)
        .collect();

    let trend = trend_score(&closes).unwrap_or(0.0);
    let volatility = volatility_score(&closes).unwrap_or(0.0);
    let breadth = breadth_score(stats.advancers, stats.decliners).unwrap_or(0.0);
    let intraday = intraday_score(
        stats.session_open,
        stats.session_high,
        stats.session_low,
        closes.last().copied(),
    )
    .unwrap_or(0.0);

    let total = WEIGHT_TREND * trend
        + WEIGHT_VOLATILITY * volatility
        + WEIGHT_BREADTH * breadth
        + WEIGHT_INTRADAY * intraday;

    LocalScore {
        trend,
        volatility,
        breadth,
        intraday,
        total: sanitize(total),
    }
}

fn trend_score(closes: &[f64]) -> Option<f64> {
    if closes.len() < TREND_SHORT_WINDOW {
        return None;
    }
    let last = *closes.last()?;
    let ma_short = mean(&closes[closes.len() - TREND_SHORT_WINDOW..])?;
    let price_vs_short = bounded((last / ma_short - 1.0) / TREND_SATURATION);

    if closes.len() < TREND_LONG_WINDOW {
        return Some(sanitize(price_vs_short));
    }
    let ma_long = mean(&closes[closes.len() - TREND_LONG_WINDOW..])?;
    let short_vs_long = bounded((ma_short / ma_long - 1.0) / TREND_SATURATION);

    Some(sanitize(0.5 * price_vs_short + 0.5 * short_vs_long))
}

fn volatility_score(closes: &[f64]) -> Option<f64> {
    if closes.len() < VOLATILITY_WINDOW + 1 {
        return None;
    }
    let window = &closes[closes.len() - (VOLATILITY_WINDOW + 1)..];
    let returns: Vec<f64> = window.windows(2).map(|w| (w[1] / w[0]).ln()).collect();
    let mu = mean(&returns)?;
    let var = returns.iter().map(|r| (r - mu).powi(2)).sum::<f64>() / (returns.len() as f64 - 1.0);
    let annualized = var.sqrt() * TRADING_DAYS_PER_YEAR.sqrt();
    if !annualized.is_finite() {
        return None;
    }
    Some(bounded((NEUTRAL_VOLATILITY - annualized) / VOLATILITY_BAND))
}

fn breadth_score(advancers: Option<u32>, decliners: Option<u32>) -> Option<f64> {
    let a = advancers? as f64;
    let d = decliners? as f64;
    if a + d <= 0.0 {
        return None;
    }
    Some(bounded((a - d) / (a + d)))
}

fn intraday_score(
    open: Option<f64>,
    high: Option<f64>,
    low: Option<f64>,
    close: Option<f64>,
) -> Option<f64> {
    let (open, high, low, close) = (open?, high?, low?, close?);
    let range = high - low;
    if !range.is_finite() || range <= 0.0 {
        return None;
    }
    Some(bounded((close - open) / range))
}

fn mean(xs: &[f64]) -> Option<f64> {
    if xs.is_empty() {
        return None;
    }
    Some(xs.iter().sum::<f64>() / xs.len() as f64)
}

pub(crate) fn bounded(x: f64) -> f64 {
    sanitize(x).clamp(-1.0, 1.0)
}

pub(crate) fn sanitize(x: f64) -> f64 {
    if x.is_finite() {
        x
    } else {
        0.0
    }
}
