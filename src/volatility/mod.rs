//! Volatility estimators
//!
//! Every estimator is a pure function over an explicit data window that
//! returns a [`SigmaForecast`](crate::models::SigmaForecast) or a typed
//! [`ForecastError`](crate::error::ForecastError):
//! - GBM baseline (MLE drift and volatility with drift shrinkage)
//! - GARCH(1,1) by coarse-grid quasi-maximum likelihood
//! - HAR-RV three-horizon regression
//! - OHLC range estimators (Parkinson, Garman-Klass, Rogers-Satchell, Yang-Zhang)
//!
//! Nothing here caches state between calls.

pub mod critical;
pub mod garch;
pub mod gbm;
pub mod har;
pub mod range;
pub mod regime;

pub use critical::{inverse_normal_cdf, normal_critical, student_t_critical};
pub use garch::{fit_and_forecast_garch, GarchParams, Innovation, OmegaMode};
pub use gbm::{fit_gbm, GbmEstimate};
pub use har::{fit_and_forecast_har, HarParams};
pub use range::{
    compare_range_estimators, fit_and_forecast_range, gap_diagnostic, range_variance,
    Aggregation, RangeParams,
};
pub use regime::{rolling_realized_vol, vol_regime_percentile};

pub(crate) fn mean(xs: &[f64]) -> Option<f64> {
    if xs.is_empty() {
        return None;
    }
    Some(xs.iter().sum::<f64>() / xs.len() as f64)
}

/// Sample variance (denominator `n − 1`).
pub(crate) fn sample_variance(xs: &[f64]) -> Option<f64> {
    if xs.len() < 2 {
        return None;
    }
    let m = mean(xs)?;
    Some(xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() - 1) as f64)
}

/// Population variance (denominator `n`).
pub(crate) fn population_variance(xs: &[f64]) -> Option<f64> {
    let m = mean(xs)?;
    Some(xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / xs.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variance_denominators() {
        let xs = [1.0, 2.0, 3.0, 4.0];
        assert!((sample_variance(&xs).unwrap() - 5.0 / 3.0).abs() < 1e-12);
        assert!((population_variance(&xs).unwrap() - 1.25).abs() < 1e-12);
        assert_eq!(sample_variance(&[1.0]), None);
        assert_eq!(mean(&[]), None);
    }
}
