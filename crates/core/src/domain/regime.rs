use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Categorical market regime, ordered from most to least favourable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Regime {
    Bull,
    Neutral,
    Bear,
    Crash,
}

impl Regime {
    pub const ALL: [Regime; 4] = [Regime::Bull, Regime::Neutral, Regime::Bear, Regime::Crash];

    pub fn as_str(self) -> &'static str {
        match self {
            Regime::Bull => "bull",
            Regime::Neutral => "neutral",
            Regime::Bear => "bear",
            Regime::Crash => "crash",
        }
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Regime {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bull" => Ok(Regime::Bull),
            "neutral" => Ok(Regime::Neutral),
            "bear" => Ok(Regime::Bear),
            "crash" => Ok(Regime::Crash),
            other => anyhow::bail!("unknown regime: {other}"),
        }
    }
}

/// Whether the pipeline runs against the live session or replays a past date.
///
/// Backtest evaluation must not see same-day pre-open data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalMode {
    Live,
    Backtest,
}

impl EvalMode {
    pub fn as_str(self) -> &'static str {
        match self {
            EvalMode::Live => "live",
            EvalMode::Backtest => "backtest",
        }
    }
}

impl FromStr for EvalMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "live" => Ok(EvalMode::Live),
            "backtest" => Ok(EvalMode::Backtest),
            other => anyhow::bail!("unknown eval mode: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreopenRiskLevel {
    Calm,
    Watch,
    Danger,
}

impl PreopenRiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            PreopenRiskLevel::Calm => "calm",
            PreopenRiskLevel::Watch => "watch",
            PreopenRiskLevel::Danger => "danger",
        }
    }
}

/// Local market sub-scores, each bounded to `[-1, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalScore {
    pub trend: f64,
    pub volatility: f64,
    pub breadth: f64,
    pub intraday: f64,
    pub total: f64,
}

/// Prior-session score of the foreign reference market, bounded to `[-1, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExternalScore {
    pub momentum: f64,
    pub trend: f64,
    pub volatility: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PreopenRisk {
    /// `0.0` (no risk) ..= `1.0`.
    pub score: f64,
    pub level: PreopenRiskLevel,
}

impl Default for PreopenRisk {
    fn default() -> Self {
        Self {
            score: 0.0,
            level: PreopenRiskLevel::Calm,
        }
    }
}

/// One composed regime per (date, version). Recomputation overwrites the stored row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeSnapshot {
    pub as_of_date: NaiveDate,
    pub version: String,
    pub mode: EvalMode,
    pub local: LocalScore,
    pub external: ExternalScore,
    pub preopen: PreopenRisk,
    pub final_regime: Regime,
    pub final_score: f64,
    /// Names of the components that fell back to their neutral default.
    pub degraded: Vec<String>,
    pub computed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regime_round_trips_through_text() {
        for r in Regime::ALL {
            assert_eq!(r.as_str().parse::<Regime>().unwrap(), r);
        }
        assert!("sideways".parse::<Regime>().is_err());
    }

    #[test]
    fn regime_serializes_lowercase() {
        let v = serde_json::to_value(Regime::Crash).unwrap();
        assert_eq!(v, serde_json::json!("crash"));
    }
}
