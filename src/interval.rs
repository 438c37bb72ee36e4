//! Prediction-interval composer
//!
//! Turns `(S_t, μ*, sigma forecast, c, h)` into log- and price-domain bounds.
//! GARCH forecasts scale to the horizon with the mean-reverting cumulative
//! variance; every other estimator scales as i.i.d. `σ·sqrt(h)`.

use crate::error::{ForecastError, ForecastResult};
use crate::models::SigmaForecast;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy)]
pub struct PiInputs<'a> {
    pub spot: f64,
    pub mu_used: f64,
    pub sigma: &'a SigmaForecast,
    pub critical: f64,
    pub h: u32,
}

/// Composed interval plus the fixed one-day band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PiBounds {
    pub l_h: f64,
    pub u_h: f64,
    pub m_log: f64,
    pub s_scale: f64,
    pub l_1: f64,
    pub u_1: f64,
    pub m_log_1: f64,
    pub s_scale_1: f64,
    /// `10000·(U_1/L_1 − 1)`, independent of the horizon
    pub band_width_bp: f64,
}

/// Cumulative `h`-day variance under GARCH(1,1) mean reversion.
///
/// Degenerates to `σ²_1d·h` when `φ = α + β` is outside `(0, 1)`.
pub fn garch_cumulative_variance(sigma2_1d: f64, omega: f64, alpha: f64, beta: f64, h: u32) -> f64 {
    let phi = alpha + beta;
    let h_f = h as f64;
    if !(phi > 0.0 && phi < 1.0) {
        return sigma2_1d * h_f;
    }
    let uncond = omega / (1.0 - phi);
    h_f * uncond + (sigma2_1d - uncond) * (1.0 - phi.powi(h as i32)) / (1.0 - phi)
}

/// Horizon scale `s_scale` for the estimator family of `sigma`.
pub fn horizon_scale(sigma: &SigmaForecast, h: u32) -> f64 {
    match sigma.garch() {
        Some(g) => garch_cumulative_variance(sigma.sigma2_1d, g.omega, g.alpha, g.beta, h)
            .max(0.0)
            .sqrt(),
        None => sigma.sigma_1d * (h as f64).sqrt(),
    }
}

fn band(m_log: f64, s_scale: f64, c: f64) -> (f64, f64) {
    ((m_log - c * s_scale).exp(), (m_log + c * s_scale).exp())
}

/// Composes the `h`-day interval and the one-day band around `spot`.
pub fn compose_pi(inputs: &PiInputs<'_>) -> ForecastResult<PiBounds> {
    if !(inputs.spot.is_finite() && inputs.spot > 0.0) {
        return Err(ForecastError::InvalidPrice {
            index: 0,
            value: inputs.spot,
        });
    }
    if inputs.h == 0 {
        return Err(ForecastError::InvalidParameter {
            name: "h",
            value: 0.0,
            reason: "horizon must be at least one trading day",
        });
    }
    if !(inputs.critical > 0.0) {
        return Err(ForecastError::InvalidParameter {
            name: "critical",
            value: inputs.critical,
            reason: "critical value must be positive",
        });
    }
    if !(inputs.sigma.sigma_1d.is_finite() && inputs.sigma.sigma_1d >= 0.0) {
        return Err(ForecastError::InvalidVariance {
            what: "sigma forecast",
            value: inputs.sigma.sigma2_1d,
        });
    }

    let ln_s = inputs.spot.ln();
    let m_log = ln_s + inputs.h as f64 * inputs.mu_used;
    let s_scale = horizon_scale(inputs.sigma, inputs.h);
    let (l_h, u_h) = band(m_log, s_scale, inputs.critical);

    let m_log_1 = ln_s + inputs.mu_used;
    let s_scale_1 = horizon_scale(inputs.sigma, 1);
    let (l_1, u_1) = band(m_log_1, s_scale_1, inputs.critical);

    Ok(PiBounds {
        l_h,
        u_h,
        m_log,
        s_scale,
        l_1,
        u_1,
        m_log_1,
        s_scale_1,
        band_width_bp: 10_000.0 * (u_1 / l_1 - 1.0),
    })
}
