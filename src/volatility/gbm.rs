//! GBM baseline: MLE drift and volatility of log returns.

use super::{mean, population_variance};
use crate::error::{ForecastError, ForecastResult};
use crate::models::{Estimator, SigmaDiagnostics, SigmaForecast};
use serde::{Deserialize, Serialize};

/// One-day GBM estimates over a trailing window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GbmEstimate {
    pub mu_hat: f64,
    pub sigma_hat: f64,
    /// Shrunk drift `λ_drift · μ̂` used for interval centering
    pub mu_used: f64,
    pub lambda_drift: f64,
    pub window_n: usize,
}

impl GbmEstimate {
    /// Log-domain center and scale for an explicit horizon `h_eff`:
    /// `(ln S + μ*·h_eff, σ̂·sqrt(h_eff))`.
    pub fn horizon(&self, spot: f64, h_eff: f64) -> ForecastResult<(f64, f64)> {
        if !(spot.is_finite() && spot > 0.0) {
            return Err(ForecastError::InvalidPrice {
                index: 0,
                value: spot,
            });
        }
        Ok((
            spot.ln() + self.mu_used * h_eff,
            self.sigma_hat * h_eff.max(0.0).sqrt(),
        ))
    }

    pub fn to_sigma_forecast(&self) -> SigmaForecast {
        SigmaForecast {
            source: Estimator::Gbm,
            sigma_1d: self.sigma_hat,
            sigma2_1d: self.sigma_hat * self.sigma_hat,
            diagnostics: SigmaDiagnostics::Gbm {
                mu_hat: self.mu_hat,
                window_n: self.window_n,
            },
        }
    }
}

/// Fits GBM on the trailing `window_n + 1` prices.
///
/// Volatility uses the population variance (denominator `N`), the MLE.
pub fn fit_gbm(prices: &[f64], window_n: usize, lambda_drift: f64) -> ForecastResult<GbmEstimate> {
    if !(0.0..=1.0).contains(&lambda_drift) {
        return Err(ForecastError::InvalidParameter {
            name: "lambda_drift",
            value: lambda_drift,
            reason: "drift shrinkage must lie in [0, 1]",
        });
    }
    if window_n == 0 {
        return Err(ForecastError::InvalidParameter {
            name: "window_n",
            value: 0.0,
            reason: "GBM window must be at least 1",
        });
    }

    let needed = window_n + 1;
    let valid = prices.iter().filter(|p| p.is_finite()).count();
    if prices.len() < needed || valid < needed {
        return Err(ForecastError::InsufficientHistory {
            required: needed,
            available: valid.min(prices.len()),
        });
    }

    let offset = prices.len() - needed;
    let window = &prices[offset..];
    if let Some((i, p)) = window.iter().enumerate().find(|(_, p)| !(**p > 0.0) || !p.is_finite()) {
        return Err(ForecastError::InvalidPrice {
            index: offset + i,
            value: *p,
        });
    }

    let returns: Vec<f64> = window.windows(2).map(|w| (w[1] / w[0]).ln()).collect();
    let mu_hat = mean(&returns).unwrap_or(0.0);
    let sigma_hat = population_variance(&returns).unwrap_or(0.0).sqrt();

    Ok(GbmEstimate {
        mu_hat,
        sigma_hat,
        mu_used: lambda_drift * mu_hat,
        lambda_drift,
        window_n,
    })
}
