use anyhow::Context;
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, Utc};
use std::collections::BTreeSet;

const DEFAULT_UTC_OFFSET_HOURS: i32 = 9;

// Runs before this local time resolve to the previous session. Local close is ~15:30; the cutoff
// leaves room for the indicator collaborator to publish end-of-day fields.
const DEFAULT_CLOSE_CUTOFF: (u32, u32) = (16, 0);

/// Trading-day arithmetic for a single exchange: weekends plus configured holidays.
#[derive(Debug, Clone)]
pub struct MarketCalendar {
    offset: FixedOffset,
    close_cutoff: NaiveTime,
    holidays: BTreeSet<NaiveDate>,
}

impl MarketCalendar {
    pub fn new(
        utc_offset_hours: i32,
        close_cutoff: NaiveTime,
        holidays: impl IntoIterator<Item = NaiveDate>,
    ) -> anyhow::Result<Self> {
        let offset = FixedOffset::east_opt(utc_offset_hours * 3600)
            .with_context(|| format!("invalid market UTC offset: {utc_offset_hours}h"))?;
        Ok(Self {
            offset,
            close_cutoff,
            holidays: holidays.into_iter().collect(),
        })
    }

    /// `MARKET_UTC_OFFSET_HOURS`, `MARKET_CLOSE_CUTOFF` (HH:MM) and
    /// `MARKET_HOLIDAYS` (comma separated YYYY-MM-DD) override the defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let offset_hours = crate::config::env_or("MARKET_UTC_OFFSET_HOURS", DEFAULT_UTC_OFFSET_HOURS);

        let close_cutoff = match std::env::var("MARKET_CLOSE_CUTOFF") {
            Ok(s) if !s.trim().is_empty() => NaiveTime::parse_from_str(s.trim(), "%H:%M")
                .with_context(|| format!("MARKET_CLOSE_CUTOFF must be HH:MM (got {s})"))?,
            _ => default_cutoff(),
        };

        let mut holidays = fixed_holidays();
        if let Ok(s) = std::env::var("MARKET_HOLIDAYS") {
            holidays.extend(parse_holiday_list(&s));
        }

        Self::new(offset_hours, close_cutoff, holidays)
    }

    pub fn is_business_day(&self, date: NaiveDate) -> bool {
        !is_weekend(date) && !self.holidays.contains(&date)
    }

    /// Explicit argument wins; otherwise the latest session whose close cutoff has passed.
    pub fn resolve_as_of_date(
        &self,
        as_of_date_arg: Option<&str>,
        now_utc: DateTime<Utc>,
    ) -> anyhow::Result<NaiveDate> {
        if let Some(s) = as_of_date_arg {
            return NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .with_context(|| format!("as-of date must be YYYY-MM-DD (got {s})"));
        }

        let now_local = now_utc.with_timezone(&self.offset);
        let today = now_local.date_naive();
        if now_local.time() < self.close_cutoff || !self.is_business_day(today) {
            return Ok(self.previous_business_day(today));
        }
        Ok(today)
    }

    /// Exchange-local calendar date of an instant.
    pub fn market_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.offset).date_naive()
    }

    pub fn previous_business_day(&self, date: NaiveDate) -> NaiveDate {
        let mut d = date - Duration::days(1);
        while !self.is_business_day(d) {
            d -= Duration::days(1);
        }
        d
    }

    /// Business days in `(from, to]`. Zero when `to <= from`.
    pub fn business_days_between(&self, from: NaiveDate, to: NaiveDate) -> i64 {
        if to <= from {
            return 0;
        }
        from.iter_days()
            .skip(1)
            .take_while(|d| *d <= to)
            .filter(|d| self.is_business_day(*d))
            .count() as i64
    }
}

impl Default for MarketCalendar {
    fn default() -> Self {
        Self {
            offset: FixedOffset::east_opt(DEFAULT_UTC_OFFSET_HOURS * 3600)
                .unwrap_or_else(|| Utc.fix()),
            close_cutoff: default_cutoff(),
            holidays: fixed_holidays(),
        }
    }
}

fn default_cutoff() -> NaiveTime {
    NaiveTime::from_hms_opt(DEFAULT_CLOSE_CUTOFF.0, DEFAULT_CLOSE_CUTOFF.1, 0)
        .unwrap_or(NaiveTime::MIN)
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun)
}

fn fixed_holidays() -> BTreeSet<NaiveDate> {
    // Fixed-date holidays only; lunar and substitute holidays come from MARKET_HOLIDAYS.
    let mut out = BTreeSet::new();
    for y in 2020..=2035 {
        for (m, d) in [(1, 1), (3, 1), (5, 5), (6, 6), (8, 15), (10, 3), (10, 9), (12, 25), (12, 31)] {
            if let Some(date) = NaiveDate::from_ymd_opt(y, m, d) {
                out.insert(date);
            }
        }
    }
    out
}

fn parse_holiday_list(s: &str) -> Vec<NaiveDate> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .filter_map(|p| match NaiveDate::parse_from_str(p, "%Y-%m-%d") {
            Ok(d) => Some(d),
            Err(_) => {
                tracing::warn!(value = p, "ignoring malformed MARKET_HOLIDAYS entry");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn rolls_back_on_weekend() {
        let cal = MarketCalendar::default();
        // 2026-01-03 is Saturday.
        let now = Utc.with_ymd_and_hms(2026, 1, 3, 8, 0, 0).unwrap();
        assert_eq!(cal.resolve_as_of_date(None, now).unwrap(), d(2026, 1, 2));
    }

    #[test]
    fn uses_previous_session_before_cutoff() {
        let cal = MarketCalendar::default();
        // 2026-01-05 06:00 UTC = 15:00 local, before the 16:00 cutoff.
        let now = Utc.with_ymd_and_hms(2026, 1, 5, 6, 0, 0).unwrap();
        assert_eq!(cal.resolve_as_of_date(None, now).unwrap(), d(2026, 1, 2));
    }

    #[test]
    fn uses_same_day_after_cutoff() {
        let cal = MarketCalendar::default();
        let now = Utc.with_ymd_and_hms(2026, 1, 5, 8, 0, 0).unwrap();
        assert_eq!(cal.resolve_as_of_date(None, now).unwrap(), d(2026, 1, 5));
    }

    #[test]
    fn explicit_date_wins_and_is_validated() {
        let cal = MarketCalendar::default();
        let now = Utc.with_ymd_and_hms(2026, 1, 5, 8, 0, 0).unwrap();
        assert_eq!(
            cal.resolve_as_of_date(Some("2025-01-10"), now).unwrap(),
            d(2025, 1, 10)
        );
        assert!(cal.resolve_as_of_date(Some("2025/01/10"), now).is_err());
    }

    #[test]
    fn counts_business_days_excluding_weekends_and_holidays() {
        let cal = MarketCalendar::new(9, default_cutoff(), [d(2025, 1, 8)]).unwrap();
        // Fri 2025-01-03 -> Fri 2025-01-10: Mon..Fri minus the Wednesday holiday.
        assert_eq!(cal.business_days_between(d(2025, 1, 3), d(2025, 1, 10)), 4);
        assert_eq!(cal.business_days_between(d(2025, 1, 10), d(2025, 1, 3)), 0);
        assert_eq!(cal.previous_business_day(d(2025, 1, 9)), d(2025, 1, 7));
        assert_eq!(cal.previous_business_day(d(2025, 1, 6)), d(2025, 1, 3));
    }

    #[test]
    fn parses_holiday_list_and_skips_garbage() {
        let out = parse_holiday_list("2025-01-28, nope ,2025-01-29,");
        assert_eq!(out, vec![d(2025, 1, 28), d(2025, 1, 29)]);
    }
}
