//! Trading calendar
//!
//! Weekends are never trading days. An optional holiday set can be layered
//! on top, and an optional data horizon bounds forward offsets so lookups
//! past the available history return `None` instead of guessing.

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use std::collections::BTreeSet;

/// Weekday calendar with optional exchange holidays and data horizon.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TradingCalendar {
    holidays: BTreeSet<NaiveDate>,
    data_end: Option<NaiveDate>,
}

impl TradingCalendar {
    /// Plain Monday-Friday calendar with no horizon.
    pub fn weekdays() -> Self {
        Self::default()
    }

    pub fn with_holidays<I: IntoIterator<Item = NaiveDate>>(mut self, holidays: I) -> Self {
        self.holidays.extend(holidays);
        self
    }

    /// Bound forward offsets to the last date with available data.
    pub fn bounded_by(mut self, data_end: NaiveDate) -> Self {
        self.data_end = Some(data_end);
        self
    }

    pub fn data_end(&self) -> Option<NaiveDate> {
        self.data_end
    }

    pub fn is_trading_date(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&date)
    }

    /// First trading day strictly after `date`.
    pub fn next_trading_date(&self, date: NaiveDate) -> NaiveDate {
        let mut d = date + Duration::days(1);
        while !self.is_trading_date(d) {
            d += Duration::days(1);
        }
        d
    }

    /// Last trading day strictly before `date`.
    pub fn previous_trading_date(&self, date: NaiveDate) -> NaiveDate {
        let mut d = date - Duration::days(1);
        while !self.is_trading_date(d) {
            d -= Duration::days(1);
        }
        d
    }

    /// The `n`-th trading day after `date` (`date` itself for `n == 0`).
    ///
    /// Returns `None` when the result would fall past the data horizon;
    /// callers treat that as "insufficient future data".
    pub fn offset_trading_date(&self, date: NaiveDate, n: u32) -> Option<NaiveDate> {
        let mut d = date;
        for _ in 0..n {
            d = self.next_trading_date(d);
            if self.data_end.is_some_and(|end| d > end) {
                return None;
            }
        }
        Some(d)
    }

    /// Trading days in `(from, to]`.
    pub fn trading_days_between(&self, from: NaiveDate, to: NaiveDate) -> Vec<NaiveDate> {
        let mut out = Vec::new();
        let mut d = from;
        loop {
            d = self.next_trading_date(d);
            if d > to {
                break;
            }
            out.push(d);
        }
        out
    }
}
