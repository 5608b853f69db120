//! Quota periods.
//!
//! A period is always the UTC calendar month containing an instant. It is
//! keyed by its first day, stored as a date (never a timestamp) so that
//! comparisons cannot drift with the caller's local offset.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Canonical quota period: the first day of a UTC calendar month.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuotaPeriod(NaiveDate);

impl QuotaPeriod {
    /// The period containing `at`.
    pub fn containing(at: DateTime<Utc>) -> Self {
        Self::from_date(at.date_naive())
    }

    /// Truncate any date to the start of its month.
    pub fn from_date(date: NaiveDate) -> Self {
        Self(NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap_or(date))
    }

    /// Interpret a caller-supplied period string.
    ///
    /// Accepts RFC 3339 timestamps (offset converted to UTC first), naive
    /// timestamps and dates (read as UTC), and bare `YYYY-MM`.
    pub fn parse(input: &str) -> DomainResult<Self> {
        let s = input.trim();

        if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
            return Ok(Self::containing(ts.with_timezone(&Utc)));
        }
        if let Ok(ts) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
            return Ok(Self::containing(ts.and_utc()));
        }
        if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return Ok(Self::from_date(date));
        }
        if let Ok(date) = NaiveDate::parse_from_str(&format!("{s}-01"), "%Y-%m-%d") {
            return Ok(Self(date));
        }

        Err(DomainError::invalid_period(format!("unrecognised period '{input}'")))
    }

    pub fn start(&self) -> NaiveDate {
        self.0
    }

    /// First instant of the period.
    pub fn starts_at(&self) -> DateTime<Utc> {
        self.0.and_time(NaiveTime::MIN).and_utc()
    }

    pub fn next(&self) -> Self {
        let (year, month) = if self.0.month() == 12 {
            (self.0.year() + 1, 1)
        } else {
            (self.0.year(), self.0.month() + 1)
        };
        Self(NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(self.0))
    }

    /// Whether `date` is already a canonical period start.
    pub fn is_canonical(date: NaiveDate) -> bool {
        date.day() == 1
    }
}

impl core::fmt::Display for QuotaPeriod {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn local_midnight_ahead_of_utc_stays_in_previous_month() {
        // 2024-04-01 00:30 at +02:00 is still March in UTC.
        let p = QuotaPeriod::parse("2024-04-01T00:30:00+02:00").unwrap();
        assert_eq!(p.start(), date(2024, 3, 1));
    }

    #[test]
    fn local_evening_behind_utc_rolls_into_next_month() {
        let p = QuotaPeriod::parse("2024-03-31T21:00:00-05:00").unwrap();
        assert_eq!(p.start(), date(2024, 4, 1));
    }

    #[test]
    fn dates_and_months_truncate_to_first_day() {
        assert_eq!(QuotaPeriod::parse("2024-02-29").unwrap().start(), date(2024, 2, 1));
        assert_eq!(QuotaPeriod::parse("2024-11").unwrap().start(), date(2024, 11, 1));
        assert_eq!(
            QuotaPeriod::parse("2024-11-15T10:00:00").unwrap().start(),
            date(2024, 11, 1)
        );
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            QuotaPeriod::parse("next tuesday"),
            Err(DomainError::InvalidPeriod(_))
        ));
    }

    #[test]
    fn next_wraps_the_year() {
        let dec = QuotaPeriod::from_date(date(2024, 12, 9));
        assert_eq!(dec.next().start(), date(2025, 1, 1));
        assert_eq!(dec.next().starts_at(), Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
    }

    proptest! {
        #[test]
        fn containing_is_canonical_and_contains_the_instant(secs in 0i64..4_102_444_800i64) {
            let at = Utc.timestamp_opt(secs, 0).unwrap();
            let p = QuotaPeriod::containing(at);
            prop_assert!(QuotaPeriod::is_canonical(p.start()));
            prop_assert!(p.starts_at() <= at);
            prop_assert!(at < p.next().starts_at());
        }
    }
}
