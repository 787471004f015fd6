use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Precomputed technical fields for one instrument on one date.
///
/// Every field is optional: the indicator provider may not have enough history for a given
/// instrument. Non-finite values are treated the same as missing ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub ticker: String,
    pub as_of_date: NaiveDate,
    #[serde(default)]
    pub close: Option<f64>,
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub trading_value: Option<f64>,
    #[serde(default)]
    pub ma_fast: Option<f64>,
    #[serde(default)]
    pub ma_slow: Option<f64>,
    #[serde(default)]
    pub ma_fast_prev: Option<f64>,
    #[serde(default)]
    pub ma_slow_prev: Option<f64>,
    #[serde(default)]
    pub rsi: Option<f64>,
    #[serde(default)]
    pub macd_hist: Option<f64>,
    #[serde(default)]
    pub ret_5d: Option<f64>,
    #[serde(default)]
    pub volume_avg_20: Option<f64>,
    #[serde(default)]
    pub gap_pct: Option<f64>,
}

impl IndicatorSnapshot {
    pub fn empty(ticker: impl Into<String>, as_of_date: NaiveDate) -> Self {
        Self {
            ticker: ticker.into(),
            as_of_date,
            close: None,
            volume: None,
            trading_value: None,
            ma_fast: None,
            ma_slow: None,
            ma_fast_prev: None,
            ma_slow_prev: None,
            rsi: None,
            macd_hist: None,
            ret_5d: None,
            volume_avg_20: None,
            gap_pct: None,
        }
    }

    /// Build a snapshot from the flat numeric field map stored by the indicator collaborator.
    /// Unknown keys are ignored.
    pub fn from_fields(
        ticker: impl Into<String>,
        as_of_date: NaiveDate,
        fields: &BTreeMap<String, f64>,
    ) -> Self {
        let get = |k: &str| fields.get(k).copied().filter(|v| v.is_finite());
        Self {
            close: get("close"),
            volume: get("volume"),
            trading_value: get("trading_value"),
            ma_fast: get("ma_fast"),
            ma_slow: get("ma_slow"),
            ma_fast_prev: get("ma_fast_prev"),
            ma_slow_prev: get("ma_slow_prev"),
            rsi: get("rsi"),
            macd_hist: get("macd_hist"),
            ret_5d: get("ret_5d"),
            volume_avg_20: get("volume_avg_20"),
            gap_pct: get("gap_pct"),
            ..Self::empty(ticker, as_of_date)
        }
    }

    /// Today's volume as a multiple of its 20-day average.
    pub fn relative_volume(&self) -> Option<f64> {
        let volume = finite(self.volume)?;
        let avg = finite(self.volume_avg_20)?;
        if avg <= 0.0 {
            return None;
        }
        Some(volume / avg)
    }

    /// Distance of the close above the slow moving average, in percent.
    pub fn extension_pct(&self) -> Option<f64> {
        let close = finite(self.close)?;
        let ma = finite(self.ma_slow)?;
        if ma <= 0.0 {
            return None;
        }
        Some((close - ma) / ma * 100.0)
    }

    /// Close has fallen below the slow moving average.
    pub fn below_slow_average(&self) -> Option<bool> {
        Some(finite(self.close)? < finite(self.ma_slow)?)
    }
}

pub(crate) fn finite(v: Option<f64>) -> Option<f64> {
    v.filter(|x| x.is_finite())
}

pub fn json_to_field_map(v: serde_json::Value) -> BTreeMap<String, f64> {
    let mut out = BTreeMap::new();
    let serde_json::Value::Object(obj) = v else {
        return out;
    };

    for (k, val) in obj {
        if let Some(n) = val.as_f64() {
            out.insert(k, n);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 10).unwrap()
    }

    #[test]
    fn builds_from_field_map_and_drops_non_finite() {
        let fields = json_to_field_map(json!({
            "close": 110.0,
            "ma_slow": 100.0,
            "rsi": "55",
            "volume": 3000.0,
            "volume_avg_20": 1000.0,
            "unknown": 1.0,
        }));
        let mut fields = fields;
        fields.insert("macd_hist".to_string(), f64::NAN);

        let snap = IndicatorSnapshot::from_fields("KRX:000001", date(), &fields);
        assert_eq!(snap.close, Some(110.0));
        assert_eq!(snap.rsi, None);
        assert_eq!(snap.macd_hist, None);
        assert_eq!(snap.relative_volume(), Some(3.0));
        assert!((snap.extension_pct().unwrap() - 10.0).abs() < 1e-9);
        assert_eq!(snap.below_slow_average(), Some(false));
    }

    #[test]
    fn zero_average_volume_has_no_relative_volume() {
        let mut snap = IndicatorSnapshot::empty("KRX:000001", date());
        snap.volume = Some(100.0);
        snap.volume_avg_20 = Some(0.0);
        assert_eq!(snap.relative_volume(), None);
    }
}
