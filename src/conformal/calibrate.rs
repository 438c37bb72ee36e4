//! Calibration of conformal parameters from historical pairs.

use super::apply::adjust_interval;
use super::quantile::quantile;
use super::{from_domain, to_domain, DomainView};
use crate::error::{check_coverage, ForecastError, ForecastResult};
use crate::models::{
    ConformalMode, ConformalParams, ConformalState, CoverageStats, Estimator, ResidualDomain,
};
use chrono::NaiveDate;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

pub const MIN_BOOTSTRAP: usize = 5;
const RECENT_WINDOW: usize = 60;

/// One historical base forecast paired with its realized price.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPair {
    pub date_t: NaiveDate,
    pub target_date: NaiveDate,
    pub m_log: f64,
    pub l_h: f64,
    pub u_h: f64,
    pub critical: f64,
    pub realized: f64,
}

impl CalibrationPair {
    fn is_usable(&self) -> bool {
        [self.m_log, self.l_h, self.u_h, self.realized]
            .iter()
            .all(|v| v.is_finite())
            && self.l_h > 0.0
            && self.u_h > 0.0
            && self.realized > 0.0
    }

    fn view(&self, domain: ResidualDomain) -> (DomainView, f64) {
        (
            DomainView::new(domain, self.m_log, self.l_h, self.u_h, self.critical),
            to_domain(domain, self.realized),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    pub mode: ConformalMode,
    pub domain: ResidualDomain,
    pub cal_window: usize,
    pub coverage: f64,
    /// ACI step size
    pub eta: f64,
    /// EnbPI bootstrap resamples
    pub bootstrap_k: usize,
    /// EnbPI resampling seed
    pub seed: u64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            mode: ConformalMode::Icp,
            domain: ResidualDomain::Log,
            cal_window: 250,
            coverage: 0.95,
            eta: 0.01,
            bootstrap_k: 20,
            seed: 42,
        }
    }
}

fn validate(cfg: &CalibrationConfig) -> ForecastResult<()> {
    check_coverage(cfg.coverage)?;
    if cfg.cal_window == 0 {
        return Err(ForecastError::InvalidParameter {
            name: "cal_window",
            value: 0.0,
            reason: "calibration window must be at least 1",
        });
    }
    match cfg.mode {
        ConformalMode::EnbPi if cfg.bootstrap_k < MIN_BOOTSTRAP => {
            Err(ForecastError::InvalidParameter {
                name: "bootstrap_k",
                value: cfg.bootstrap_k as f64,
                reason: "EnbPI needs at least 5 bootstrap resamples",
            })
        }
        ConformalMode::Aci if !(cfg.eta > 0.0 && cfg.eta.is_finite()) => {
            Err(ForecastError::InvalidParameter {
                name: "eta",
                value: cfg.eta,
                reason: "ACI step size must be positive",
            })
        }
        _ => Ok(()),
    }
}

fn icp_q(views: &[(DomainView, f64)], level: f64) -> f64 {
    let scores: Vec<f64> = views.iter().map(|(v, y)| (y - v.point).abs()).collect();
    quantile(&scores, level).unwrap_or(0.0)
}

fn enbpi_params(views: &[(DomainView, f64)], level: f64, k: usize, seed: u64) -> ConformalParams {
    let n = views.len();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut pooled = Vec::new();
    for _ in 0..k {
        let mut in_bag = vec![false; n];
        for _ in 0..n {
            in_bag[rng.gen_range(0..n)] = true;
        }
        pooled.extend(
            views
                .iter()
                .zip(&in_bag)
                .filter(|(_, inside)| !**inside)
                .map(|((v, y), _)| (y - v.point).abs()),
        );
    }
    match quantile(&pooled, level) {
        Some(q_cal) => ConformalParams::EnbPi {
            q_cal,
            resamples: k,
            oob_residuals: pooled.len(),
            fell_back_to_icp: false,
        },
        None => ConformalParams::EnbPi {
            q_cal: icp_q(views, level),
            resamples: k,
            oob_residuals: 0,
            fell_back_to_icp: true,
        },
    }
}

fn aci_theta(views: &[(DomainView, f64)], alpha: f64, eta: f64) -> f64 {
    let mut theta = 0.0;
    for (v, y) in views {
        let (lo, hi) = adjust_interval(v, &ConformalParams::Aci { theta, eta });
        let miss = if *y < lo || *y > hi { 1.0 } else { 0.0 };
        theta += eta * (miss - alpha);
    }
    theta
}

fn coverage_stats(
    views: &[(DomainView, f64)],
    domain: ResidualDomain,
    interval: impl Fn(&DomainView) -> (f64, f64),
) -> CoverageStats {
    let hits: Vec<bool> = views
        .iter()
        .map(|(v, y)| {
            let (lo, hi) = interval(v);
            *y >= lo && *y <= hi
        })
        .collect();
    let n = hits.len();
    if n == 0 {
        return CoverageStats::default();
    }
    let hit_count = hits.iter().filter(|h| **h).count();
    let recent = &hits[n.saturating_sub(RECENT_WINDOW)..];
    let recent_hits = recent.iter().filter(|h| **h).count();
    let avg_width = views
        .iter()
        .map(|(v, _)| {
            let (lo, hi) = interval(v);
            from_domain(domain, hi) - from_domain(domain, lo)
        })
        .sum::<f64>()
        / n as f64;
    CoverageStats {
        n,
        miss_count: n - hit_count,
        hit_rate: hit_count as f64 / n as f64,
        hit_rate_last60: recent_hits as f64 / recent.len() as f64,
        avg_width,
    }
}

/// Calibrates `cfg.mode` on the most recent `cal_window` usable pairs.
///
/// `pairs` must be ordered by forecast date; ACI depends on the order.
pub fn calibrate(
    symbol: &str,
    base_method: Estimator,
    horizon: u32,
    pairs: &[CalibrationPair],
    cfg: &CalibrationConfig,
) -> ForecastResult<ConformalState> {
    validate(cfg)?;
    let usable: Vec<&CalibrationPair> = pairs.iter().filter(|p| p.is_usable()).collect();
    if usable.len() < cfg.cal_window {
        return Err(ForecastError::InsufficientCalibrationData {
            required: cfg.cal_window,
            available: usable.len(),
            filter_hint: None,
        });
    }
    let window = &usable[usable.len() - cfg.cal_window..];
    let views: Vec<(DomainView, f64)> = window.iter().map(|p| p.view(cfg.domain)).collect();

    let alpha = 1.0 - cfg.coverage;
    let level = 1.0 - alpha;
    let params = match cfg.mode {
        ConformalMode::Icp => ConformalParams::Icp {
            q_cal: icp_q(&views, level),
        },
        ConformalMode::IcpScaled => {
            let scores: Vec<f64> = views
                .iter()
                .filter(|(v, _)| v.sigma_pred > 0.0)
                .map(|(v, y)| (y - v.point).abs() / v.sigma_pred)
                .collect();
            ConformalParams::IcpScaled {
                q_cal_scaled: quantile(&scores, level).unwrap_or(0.0),
            }
        }
        ConformalMode::Cqr => {
            let lower: Vec<f64> = views.iter().map(|(v, y)| v.lower - y).collect();
            let upper: Vec<f64> = views.iter().map(|(v, y)| y - v.upper).collect();
            ConformalParams::Cqr {
                delta_l: quantile(&lower, level).unwrap_or(0.0),
                delta_u: quantile(&upper, level).unwrap_or(0.0),
            }
        }
        ConformalMode::EnbPi => enbpi_params(&views, level, cfg.bootstrap_k, cfg.seed),
        ConformalMode::Aci => ConformalParams::Aci {
            theta: aci_theta(&views, alpha, cfg.eta),
            eta: cfg.eta,
        },
    };

    let base_coverage = coverage_stats(&views, cfg.domain, |v| (v.lower, v.upper));
    let calibrated_coverage = coverage_stats(&views, cfg.domain, |v| adjust_interval(v, &params));

    Ok(ConformalState {
        symbol: symbol.to_string(),
        mode: cfg.mode,
        domain: cfg.domain,
        base_method,
        horizon,
        coverage: cfg.coverage,
        cal_window: cfg.cal_window,
        params,
        base_coverage,
        calibrated_coverage,
    })
}
