use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Rolling-window statistics of the local benchmark index, plus session breadth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalMarketStats {
    pub valid: bool,
    pub as_of_date: NaiveDate,
    /// Daily closes, oldest first; the last element is the as-of session.
    #[serde(default)]
    pub index_closes: Vec<f64>,
    #[serde(default)]
    pub session_open: Option<f64>,
    #[serde(default)]
    pub session_high: Option<f64>,
    #[serde(default)]
    pub session_low: Option<f64>,
    #[serde(default)]
    pub advancers: Option<u32>,
    #[serde(default)]
    pub decliners: Option<u32>,
}

impl LocalMarketStats {
    pub fn invalid(as_of_date: NaiveDate) -> Self {
        Self {
            valid: false,
            as_of_date,
            index_closes: Vec::new(),
            session_open: None,
            session_high: None,
            session_low: None,
            advancers: None,
            decliners: None,
        }
    }
}

/// Prior session of the foreign reference market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalMarketSnapshot {
    pub valid: bool,
    #[serde(default)]
    pub session_date: Option<NaiveDate>,
    #[serde(default)]
    pub close: Option<f64>,
    #[serde(default)]
    pub prev_close: Option<f64>,
    #[serde(default)]
    pub ma20: Option<f64>,
    /// Implied-volatility index level of the reference market.
    #[serde(default)]
    pub volatility_index: Option<f64>,
}

impl ExternalMarketSnapshot {
    pub fn invalid() -> Self {
        Self {
            valid: false,
            session_date: None,
            close: None,
            prev_close: None,
            ma20: None,
            volatility_index: None,
        }
    }
}

/// Index-futures and FX moves observed before the local open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreopenSnapshot {
    pub valid: bool,
    #[serde(default)]
    pub futures_change_pct: Option<f64>,
    #[serde(default)]
    pub fx_change_pct: Option<f64>,
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
}

impl PreopenSnapshot {
    pub fn invalid() -> Self {
        Self {
            valid: false,
            futures_change_pct: None,
            fx_change_pct: None,
            observed_at: None,
        }
    }
}

/// One listed instrument with the fields the hard filters need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniverseEntry {
    pub ticker: String,
    pub name: String,
    #[serde(default)]
    pub close: Option<f64>,
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub trading_value: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniverseResponse {
    pub as_of_date: NaiveDate,
    pub items: Vec<UniverseEntry>,
}

/// One instrument's daily indicator fields, as loaded into the snapshot table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorRecord {
    pub ticker: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub close: Option<f64>,
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub trading_value: Option<f64>,
    /// Flat numeric fields (`ma_fast`, `rsi`, `macd_hist`, ...).
    #[serde(default)]
    pub fields: std::collections::BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorFile {
    pub as_of_date: NaiveDate,
    pub items: Vec<IndicatorRecord>,
}
