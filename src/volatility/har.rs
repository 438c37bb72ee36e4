//! HAR-RV: daily / weekly / monthly realized-variance regression.
//!
//! `RV_{t+1} = β0 + βd·RV_t + βw·RV_t^(w) + βm·RV_t^(m)` fitted by OLS.
//! Squared daily log returns stand in for realized variance unless the
//! caller passes an intraday RV series.

use crate::error::{ForecastError, ForecastResult};
use crate::models::{Estimator, HarDiagnostics, SigmaDiagnostics, SigmaForecast};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

const WEEK: usize = 5;
const MONTH: usize = 22;
const MIN_ROWS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HarParams {
    /// Trailing number of RV observations to use; `None` uses everything
    pub window: Option<usize>,
}

impl Default for HarParams {
    fn default() -> Self {
        Self { window: Some(500) }
    }
}

/// Squared returns as a realized-variance proxy, dropping non-finite values.
pub fn rv_proxy(returns: &[f64]) -> Vec<f64> {
    returns
        .iter()
        .filter(|r| r.is_finite())
        .map(|r| r * r)
        .collect()
}

/// `[1, RV_t, RV_t^(w), RV_t^(m)]` for every `t` with a full month behind it.
fn regressors(rv: &[f64]) -> Vec<[f64; 4]> {
    (MONTH - 1..rv.len())
        .map(|t| {
            let weekly = rv[t + 1 - WEEK..=t].iter().sum::<f64>() / WEEK as f64;
            let monthly = rv[t + 1 - MONTH..=t].iter().sum::<f64>() / MONTH as f64;
            [1.0, rv[t], weekly, monthly]
        })
        .collect()
}

/// Ordinary least squares through the normal equations.
///
/// Falls back to the SVD pseudo-inverse when `XᵀX` is singular.
pub fn ols(x: &DMatrix<f64>, y: &DVector<f64>) -> Option<DVector<f64>> {
    let xt = x.transpose();
    let xtx = &xt * x;
    let inv = xtx
        .clone()
        .try_inverse()
        .or_else(|| xtx.pseudo_inverse(1e-18).ok())?;
    Some(inv * (xt * y))
}

/// Fits HAR-RV on a realized-variance series and forecasts one day ahead.
pub fn fit_and_forecast_har_rv(rv: &[f64], params: &HarParams) -> ForecastResult<SigmaForecast> {
    if rv.is_empty() {
        return Err(ForecastError::InsufficientData {
            what: "realized variance proxy",
            required: MONTH + MIN_ROWS,
            available: 0,
        });
    }
    let rv = match params.window {
        Some(w) if w < rv.len() => &rv[rv.len() - w..],
        _ => rv,
    };

    let x_all = regressors(rv);
    // The last regressor row has no next-day target; it is the forecast input.
    let n_rows = x_all.len().saturating_sub(1);
    if n_rows < MIN_ROWS {
        return Err(ForecastError::InsufficientData {
            what: "HAR regression rows",
            required: MIN_ROWS,
            available: n_rows,
        });
    }

    let x = DMatrix::from_fn(n_rows, 4, |i, j| x_all[i][j]);
    let y = DVector::from_fn(n_rows, |i, _| rv[MONTH + i]);
    let beta = ols(&x, &y).ok_or(ForecastError::InvalidForecast {
        what: "HAR normal equations",
        value: f64::NAN,
    })?;

    let fitted = &x * &beta;
    let y_mean = y.mean();
    let ss_tot: f64 = y.iter().map(|v| (v - y_mean).powi(2)).sum();
    let ss_res: f64 = y.iter().zip(fitted.iter()).map(|(a, b)| (a - b).powi(2)).sum();
    let r_squared = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 0.0 };

    let last = x_all[x_all.len() - 1];
    let forecast: f64 = (0..4).map(|j| beta[j] * last[j]).sum();
    if !(forecast.is_finite() && forecast > 0.0) {
        return Err(ForecastError::InvalidForecast {
            what: "HAR-RV",
            value: forecast,
        });
    }

    Ok(SigmaForecast::from_variance(
        Estimator::HarRv,
        forecast,
        SigmaDiagnostics::Har(HarDiagnostics {
            beta0: beta[0],
            beta_d: beta[1],
            beta_w: beta[2],
            beta_m: beta[3],
            r_squared,
            n_obs: n_rows,
        }),
    ))
}

/// HAR-RV on squared daily log returns.
pub fn fit_and_forecast_har(returns: &[f64], params: &HarParams) -> ForecastResult<SigmaForecast> {
    fit_and_forecast_har_rv(&rv_proxy(returns), params)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_regime_returns(low: f64, high: f64, half: usize) -> Vec<f64> {
        (0..2 * half)
            .map(|i| {
                let mag = if i < half { low } else { high };
                if i % 2 == 0 {
                    mag
                } else {
                    -mag
                }
            })
            .collect()
    }

    #[test]
    fn test_ols_recovers_exact_linear_model() {
        let x = DMatrix::from_fn(20, 3, |i, j| match j {
            0 => 1.0,
            1 => i as f64,
            _ => ((i * i) % 7) as f64,
        });
        let y = DVector::from_fn(20, |i, _| 2.0 + 0.5 * x[(i, 1)] - 1.5 * x[(i, 2)]);
        let beta = ols(&x, &y).unwrap();
        assert!((beta[0] - 2.0).abs() < 1e-8);
        assert!((beta[1] - 0.5).abs() < 1e-8);
        assert!((beta[2] + 1.5).abs() < 1e-8);
    }

    #[test]
    fn test_tracks_latest_regime() {
        let returns = two_regime_returns(0.005, 0.02, 150);
        let sf = fit_and_forecast_har(&returns, &HarParams { window: None }).unwrap();
        let rv = rv_proxy(&returns);
        let late = 0.02f64 * 0.02;
        let window_mean = rv.iter().sum::<f64>() / rv.len() as f64;
        assert!(
            (sf.sigma2_1d - late).abs() < (window_mean - late).abs(),
            "forecast {} should sit nearer {} than the window mean {}",
            sf.sigma2_1d,
            late,
            window_mean
        );
        match sf.diagnostics {
            SigmaDiagnostics::Har(d) => {
                assert!(d.n_obs > MIN_ROWS);
                let slope = d.beta_d + d.beta_w + d.beta_m;
                assert!(slope.abs() > 0.1, "regressors dropped: {:?}", d);
            }
            other => panic!("unexpected diagnostics {:?}", other),
        }
    }

    #[test]
    fn test_requires_ten_regression_rows() {
        let returns = vec![0.01; MONTH + 5];
        let err = fit_and_forecast_har(&returns, &HarParams { window: None }).unwrap_err();
        assert!(matches!(
            err,
            ForecastError::InsufficientData {
                what: "HAR regression rows",
                required: 10,
                ..
            }
        ));
    }

    #[test]
    fn test_empty_proxy_is_insufficient() {
        let err = fit_and_forecast_har(&[f64::NAN, f64::NAN], &HarParams::default()).unwrap_err();
        assert!(matches!(
            err,
            ForecastError::InsufficientData {
                what: "realized variance proxy",
                ..
            }
        ));
    }

    #[test]
    fn test_zero_variance_is_invalid_forecast() {
        let returns = vec![0.0; 200];
        let err = fit_and_forecast_har(&returns, &HarParams { window: None }).unwrap_err();
        assert!(matches!(err, ForecastError::InvalidForecast { .. }));
    }
}
