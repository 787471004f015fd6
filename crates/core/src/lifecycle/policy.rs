use crate::config::env_or;
use crate::domain::indicator::{finite, IndicatorSnapshot};
use crate::domain::recommendation::{ReasonCode, Recommendation, RecommendationStatus};

/// Closure thresholds. Day counts are business days since the anchor date.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LifecyclePolicy {
    pub ttl_days: i64,
    pub min_hold_days: i64,
    /// Loss (percent, positive) at which an open recommendation breaks.
    pub stop_loss_pct: f64,
    /// RSI below this flags weakening momentum.
    pub weak_momentum_rsi: f64,
    /// Business days a BROKEN recommendation stays visible before it is archived.
    pub broken_cooldown_days: i64,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            ttl_days: 20,
            min_hold_days: 3,
            stop_loss_pct: 7.0,
            weak_momentum_rsi: 45.0,
            broken_cooldown_days: 2,
        }
    }
}

impl LifecyclePolicy {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            ttl_days: env_or("LIFECYCLE_TTL_DAYS", d.ttl_days).max(1),
            min_hold_days: env_or("LIFECYCLE_MIN_HOLD_DAYS", d.min_hold_days).max(0),
            stop_loss_pct: env_or("LIFECYCLE_STOP_LOSS_PCT", d.stop_loss_pct).abs(),
            weak_momentum_rsi: env_or("LIFECYCLE_WEAK_MOMENTUM_RSI", d.weak_momentum_rsi),
            broken_cooldown_days: env_or("LIFECYCLE_BROKEN_COOLDOWN_DAYS", d.broken_cooldown_days).max(0),
        }
    }

    /// What the daily review should do with one open recommendation.
    ///
    /// Precedence is BROKEN, then TTL archive, then WEAK_WARNING; at most one is returned.
    pub fn decide(&self, rec: &Recommendation, quote: &IndicatorSnapshot, held_days: i64) -> Decision {
        if !rec.status.is_open() {
            return Decision::Hold;
        }
        let Some(price) = finite(quote.close).filter(|p| *p > 0.0) else {
            return Decision::Hold;
        };
        let ret = rec.return_pct_at(price);

        if held_days >= self.min_hold_days {
            if ret <= -self.stop_loss_pct {
                return Decision::Break {
                    reason: ReasonCode::StopLoss,
                    price,
                };
            }
            if quote.below_slow_average() == Some(true) {
                return Decision::Break {
                    reason: ReasonCode::ThesisBreak,
                    price,
                };
            }
        }

        if held_days >= self.ttl_days {
            return Decision::Expire { price };
        }

        if rec.status == RecommendationStatus::Active {
            let weak_rsi = finite(quote.rsi).is_some_and(|r| r < self.weak_momentum_rsi);
            let negative_macd = finite(quote.macd_hist).is_some_and(|h| h < 0.0);
            if weak_rsi || negative_macd {
                return Decision::Weaken;
            }
        }

        Decision::Hold
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Hold,
    Weaken,
    Break { reason: ReasonCode, price: f64 },
    Expire { price: f64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::recommendation::NewRecommendation;
    use chrono::{NaiveDate, Utc};
    use uuid::Uuid;

    fn rec() -> Recommendation {
        let new = NewRecommendation {
            ticker: "X".to_string(),
            anchor_date: NaiveDate::from_ymd_opt(2025, 1, 2).unwrap(),
            anchor_close: 100.0,
            strategy: "trend_momentum".to_string(),
            stage: Some(0),
            score: 11.0,
            score_label: "strong".to_string(),
            reason_code: ReasonCode::Created,
            reason_text: None,
        };
        Recommendation::open(&new, Uuid::new_v4(), None, Utc::now())
    }

    fn quote(close: f64, ma_slow: f64, rsi: f64, macd: f64) -> IndicatorSnapshot {
        IndicatorSnapshot {
            close: Some(close),
            ma_slow: Some(ma_slow),
            rsi: Some(rsi),
            macd_hist: Some(macd),
            ..IndicatorSnapshot::empty("X", NaiveDate::from_ymd_opt(2025, 1, 20).unwrap())
        }
    }

    #[test]
    fn stop_loss_beats_ttl_and_weakness() {
        let p = LifecyclePolicy::default();
        let d = p.decide(&rec(), &quote(90.0, 85.0, 30.0, -1.0), 25);
        assert_eq!(
            d,
            Decision::Break {
                reason: ReasonCode::StopLoss,
                price: 90.0
            }
        );
    }

    #[test]
    fn no_break_inside_minimum_hold() {
        let p = LifecyclePolicy::default();
        assert_eq!(p.decide(&rec(), &quote(90.0, 95.0, 60.0, 1.0), 2), Decision::Hold);
        assert!(matches!(
            p.decide(&rec(), &quote(98.0, 99.0, 60.0, 1.0), 3),
            Decision::Break {
                reason: ReasonCode::ThesisBreak,
                ..
            }
        ));
    }

    #[test]
    fn ttl_archives_before_weak_warning() {
        let p = LifecyclePolicy::default();
        assert_eq!(
            p.decide(&rec(), &quote(104.0, 100.0, 40.0, 1.0), 20),
            Decision::Expire { price: 104.0 }
        );
        assert_eq!(p.decide(&rec(), &quote(104.0, 100.0, 40.0, 1.0), 5), Decision::Weaken);
    }

    #[test]
    fn weak_warning_is_not_weakened_again() {
        let p = LifecyclePolicy::default();
        let mut r = rec();
        r.status = RecommendationStatus::WeakWarning;
        assert_eq!(p.decide(&r, &quote(104.0, 100.0, 40.0, -1.0), 5), Decision::Hold);
    }

    #[test]
    fn missing_price_holds() {
        let p = LifecyclePolicy::default();
        let mut q = quote(50.0, 100.0, 20.0, -1.0);
        q.close = None;
        assert_eq!(p.decide(&rec(), &q, 30), Decision::Hold);
    }
}
