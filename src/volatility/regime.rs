//! Volatility regime percentile
//!
//! Ranks a forecast sigma against the trailing three calendar years of
//! sigma forecasts, falling back to a rolling 20-day realized volatility
//! when the forecast history is too thin.

use super::sample_variance;
use chrono::{Months, NaiveDate};

pub const MIN_REFERENCE: usize = 60;
pub const REALIZED_WINDOW: usize = 20;
const LOOKBACK_MONTHS: u32 = 36;

/// Rolling sample standard deviation of `returns` over `window` days.
pub fn rolling_realized_vol(returns: &[f64], window: usize) -> Vec<f64> {
    if window < 2 {
        return Vec::new();
    }
    returns
        .windows(window)
        .filter_map(|w| sample_variance(w).map(f64::sqrt))
        .collect()
}

/// `rank(reference ≤ forecast) / |reference|`, or `None` when neither the
/// forecast history nor the realized-vol proxy yields 60 points.
///
/// `history` holds `(forecast date, sigma)` pairs; `returns` holds
/// `(date, log return)` pairs from canonical data.
pub fn vol_regime_percentile(
    sigma_forecast: f64,
    as_of: NaiveDate,
    history: &[(NaiveDate, f64)],
    returns: &[(NaiveDate, f64)],
) -> Option<f64> {
    if !sigma_forecast.is_finite() {
        return None;
    }
    let start = as_of.checked_sub_months(Months::new(LOOKBACK_MONTHS))?;
    let in_window = |d: &NaiveDate| *d > start && *d <= as_of;

    let mut reference: Vec<f64> = history
        .iter()
        .filter(|(d, s)| in_window(d) && s.is_finite())
        .map(|(_, s)| *s)
        .collect();

    if reference.len() < MIN_REFERENCE {
        let window_returns: Vec<f64> = returns
            .iter()
            .filter(|(d, r)| in_window(d) && r.is_finite())
            .map(|(_, r)| *r)
            .collect();
        reference = rolling_realized_vol(&window_returns, REALIZED_WINDOW);
    }
    if reference.len() < MIN_REFERENCE {
        return None;
    }

    let below = reference.iter().filter(|s| **s <= sigma_forecast).count();
    Some(below as f64 / reference.len() as f64)
}
