use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Which sub-conditions an instrument satisfied at one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionFlags {
    pub trend_cross: bool,
    pub momentum: bool,
    pub relative_volume: bool,
    pub oscillator: bool,
    pub gap_within_bounds: bool,
    pub extension_within_bounds: bool,
}

impl ConditionFlags {
    pub fn count(&self) -> u32 {
        [
            self.trend_cross,
            self.momentum,
            self.relative_volume,
            self.oscillator,
            self.gap_within_bounds,
            self.extension_within_bounds,
        ]
        .into_iter()
        .filter(|b| *b)
        .count() as u32
    }
}

/// Result of scoring one instrument at one stage. Never persisted directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSignal {
    pub ticker: String,
    pub as_of_date: NaiveDate,
    pub stage: usize,
    pub matched: bool,
    pub score: f64,
    pub flags: ConditionFlags,
    pub signal_count: u32,
    pub strategy: String,
    pub score_label: String,
    /// Close on the as-of date; becomes the anchor price if the signal is accepted.
    pub close: Option<f64>,
}

impl CandidateSignal {
    pub fn no_match(ticker: impl Into<String>, as_of_date: NaiveDate, stage: usize) -> Self {
        Self {
            ticker: ticker.into(),
            as_of_date,
            stage,
            matched: false,
            score: 0.0,
            flags: ConditionFlags::default(),
            signal_count: 0,
            strategy: String::new(),
            score_label: String::new(),
            close: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_tracks_set_flags() {
        let flags = ConditionFlags {
            trend_cross: true,
            oscillator: true,
            extension_within_bounds: true,
            ..Default::default()
        };
        assert_eq!(flags.count(), 3);
        assert_eq!(ConditionFlags::default().count(), 0);
    }
}
