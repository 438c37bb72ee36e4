//! GARCH(1,1) by coarse-grid quasi-maximum likelihood
//!
//! `σ²_t = ω + α·ε²_{t−1} + β·σ²_{t−1}` on demeaned log returns. The grid is
//! deterministic (α ∈ {0.01..0.15}, β ∈ {0.85..0.95}, step 0.01) and keeps
//! only candidates with `α + β < 0.999`. Student-t innovations add a
//! degrees-of-freedom grid unless the caller pins `df`.

use super::{mean, population_variance};
use crate::error::{ForecastError, ForecastResult};
use crate::models::{Estimator, GarchDiagnostics, SigmaDiagnostics, SigmaForecast};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::function::gamma::ln_gamma;
use std::f64::consts::PI;
use tracing::warn;

pub const MIN_GARCH_WINDOW: usize = 600;
const MAX_PERSISTENCE: f64 = 0.999;
const NEAR_UNIT_ROOT: f64 = 0.98;
const DF_GRID: [f64; 11] = [3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 10.0, 12.0, 15.0, 20.0, 30.0];

/// Innovation distribution for the likelihood.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dist", rename_all = "snake_case")]
pub enum Innovation {
    Normal,
    /// Standardized Student-t; `df: None` grid-searches degrees of freedom
    StudentT { df: Option<f64> },
}

/// How ω is tied to the sample variance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OmegaMode {
    /// `ω = (1 − α − β)·σ²_uncond`
    VarianceTargeting,
    /// `ω = fraction·σ²_uncond`
    FixedFraction { fraction: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GarchParams {
    pub window: usize,
    pub innovation: Innovation,
    pub omega: OmegaMode,
}

impl Default for GarchParams {
    fn default() -> Self {
        Self {
            window: 1000,
            innovation: Innovation::Normal,
            omega: OmegaMode::VarianceTargeting,
        }
    }
}

fn alpha_grid() -> impl Iterator<Item = f64> {
    (1..=15).map(|i| i as f64 / 100.0)
}

fn beta_grid() -> impl Iterator<Item = f64> {
    (85..=95).map(|i| i as f64 / 100.0)
}

/// Standardized Student-t log-density of `eps` with variance `sigma2`.
pub fn student_t_log_density(eps: f64, sigma2: f64, df: f64) -> f64 {
    let z2 = eps * eps / sigma2;
    ln_gamma((df + 1.0) / 2.0)
        - ln_gamma(df / 2.0)
        - 0.5 * (PI * (df - 2.0)).ln()
        - 0.5 * sigma2.ln()
        - (df + 1.0) / 2.0 * (1.0 + z2 / (df - 2.0)).ln()
}

pub fn normal_log_density(eps: f64, sigma2: f64) -> f64 {
    -0.5 * ((2.0 * PI).ln() + sigma2.ln() + eps * eps / sigma2)
}

/// Output of one pass of the variance recursion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Recursion {
    pub log_likelihood: f64,
    pub last_eps: f64,
    pub last_sigma2: f64,
}

/// Runs the GARCH(1,1) recursion over `eps`, seeded at `sigma2_0`.
pub fn run_recursion(
    eps: &[f64],
    omega: f64,
    alpha: f64,
    beta: f64,
    sigma2_0: f64,
    df: Option<f64>,
) -> Option<Recursion> {
    let mut sigma2 = sigma2_0;
    let mut ll = 0.0;
    for (t, e) in eps.iter().enumerate() {
        if t > 0 {
            sigma2 = omega + alpha * eps[t - 1] * eps[t - 1] + beta * sigma2;
        }
        if !(sigma2.is_finite() && sigma2 > 0.0) {
            return None;
        }
        ll += match df {
            Some(nu) => student_t_log_density(*e, sigma2, nu),
            None => normal_log_density(*e, sigma2),
        };
    }
    ll.is_finite().then(|| Recursion {
        log_likelihood: ll,
        last_eps: *eps.last().unwrap_or(&0.0),
        last_sigma2: sigma2,
    })
}

/// `ω + α·ε²_T + β·σ²_T`.
pub fn one_step_forecast(omega: f64, alpha: f64, beta: f64, last_eps: f64, last_sigma2: f64) -> f64 {
    omega + alpha * last_eps * last_eps + beta * last_sigma2
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    alpha: f64,
    beta: f64,
    df: Option<f64>,
}

/// Fits GARCH(1,1) on the trailing `window` log returns and forecasts
/// tomorrow's variance.
pub fn fit_and_forecast_garch(returns: &[f64], params: &GarchParams) -> ForecastResult<SigmaForecast> {
    if params.window < MIN_GARCH_WINDOW {
        return Err(ForecastError::InsufficientData {
            what: "garch window",
            required: MIN_GARCH_WINDOW,
            available: params.window,
        });
    }
    if returns.len() < params.window {
        return Err(ForecastError::InsufficientData {
            what: "garch returns",
            required: params.window,
            available: returns.len(),
        });
    }
    if let Innovation::StudentT { df: Some(df) } = params.innovation {
        if !(df > 2.0 && df.is_finite()) {
            return Err(ForecastError::InvalidParameter {
                name: "df",
                value: df,
                reason: "Student-t degrees of freedom must exceed 2",
            });
        }
    }
    if let OmegaMode::FixedFraction { fraction } = params.omega {
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(ForecastError::InvalidParameter {
                name: "omega_fraction",
                value: fraction,
                reason: "fixed omega fraction must lie in (0, 1)",
            });
        }
    }

    let window = &returns[returns.len() - params.window..];
    let mu = mean(window).unwrap_or(0.0);
    let eps: Vec<f64> = window.iter().map(|r| r - mu).collect();
    let uncond = population_variance(&eps).unwrap_or(0.0);
    if !(uncond.is_finite() && uncond > 0.0) {
        return Err(ForecastError::InvalidVariance {
            what: "garch sample variance",
            value: uncond,
        });
    }

    let dfs: Vec<Option<f64>> = match params.innovation {
        Innovation::Normal => vec![None],
        Innovation::StudentT { df: Some(df) } => vec![Some(df)],
        Innovation::StudentT { df: None } => DF_GRID.iter().map(|d| Some(*d)).collect(),
    };
    let candidates: Vec<Candidate> = alpha_grid()
        .flat_map(|alpha| beta_grid().map(move |beta| (alpha, beta)))
        .filter(|(a, b)| a + b < MAX_PERSISTENCE)
        .flat_map(|(alpha, beta)| dfs.iter().map(move |df| Candidate { alpha, beta, df: *df }))
        .collect();

    let omega_for = |c: &Candidate| match params.omega {
        OmegaMode::VarianceTargeting => (1.0 - c.alpha - c.beta) * uncond,
        OmegaMode::FixedFraction { fraction } => fraction * uncond,
    };

    // Highest likelihood wins; ties go to the earlier grid point.
    let best = candidates
        .par_iter()
        .enumerate()
        .filter_map(|(idx, c)| {
            run_recursion(&eps, omega_for(c), c.alpha, c.beta, uncond, c.df).map(|rec| (idx, rec))
        })
        .reduce_with(|a, b| {
            if b.1.log_likelihood > a.1.log_likelihood
                || (b.1.log_likelihood == a.1.log_likelihood && b.0 < a.0)
            {
                b
            } else {
                a
            }
        });
    let (idx, rec) = best.ok_or(ForecastError::InvalidVariance {
        what: "garch likelihood grid",
        value: f64::NAN,
    })?;
    let chosen = candidates[idx];
    let omega = omega_for(&chosen);
    let persistence = chosen.alpha + chosen.beta;

    if persistence >= 1.0 {
        return Err(ForecastError::NonStationary {
            alpha: chosen.alpha,
            beta: chosen.beta,
        });
    }
    let near_unit_root = persistence >= NEAR_UNIT_ROOT;
    if near_unit_root {
        warn!(
            alpha = chosen.alpha,
            beta = chosen.beta,
            persistence,
            "GARCH persistence near unit root; shocks decay slowly"
        );
    }

    let sigma2 = one_step_forecast(omega, chosen.alpha, chosen.beta, rec.last_eps, rec.last_sigma2);
    if !(sigma2.is_finite() && sigma2 > 0.0) {
        return Err(ForecastError::InvalidVariance {
            what: "garch one-step forecast",
            value: sigma2,
        });
    }

    let source = match params.innovation {
        Innovation::Normal => Estimator::GarchNormal,
        Innovation::StudentT { .. } => Estimator::GarchStudentT,
    };
    let half_life = (persistence > 0.0).then(|| 0.5f64.ln() / persistence.ln());

    Ok(SigmaForecast::from_variance(
        source,
        sigma2,
        SigmaDiagnostics::Garch(GarchDiagnostics {
            omega,
            alpha: chosen.alpha,
            beta: chosen.beta,
            df: chosen.df,
            log_likelihood: rec.log_likelihood,
            persistence,
            half_life,
            uncond_variance: omega / (1.0 - persistence),
            window: params.window,
            variance_targeting: matches!(params.omega, OmegaMode::VarianceTargeting),
            near_unit_root,
        }),
    ))
}
