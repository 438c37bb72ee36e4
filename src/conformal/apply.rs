//! Same-day application of a calibrated conformal state.

use super::{from_domain, DomainView};
use crate::error::{ForecastError, ForecastResult};
use crate::models::{ConformalMeta, ConformalParams, ConformalState, ForecastRecord, Method};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Calibrated `(lower, upper)` in the residual domain of `view`.
pub fn adjust_interval(view: &DomainView, params: &ConformalParams) -> (f64, f64) {
    match *params {
        ConformalParams::Icp { q_cal } | ConformalParams::EnbPi { q_cal, .. } => {
            (view.point - q_cal, view.point + q_cal)
        }
        ConformalParams::IcpScaled { q_cal_scaled } => {
            let half = if view.sigma_pred.is_finite() {
                q_cal_scaled * view.sigma_pred
            } else {
                0.0
            };
            (view.point - half, view.point + half)
        }
        ConformalParams::Cqr { delta_l, delta_u } => (view.lower - delta_l, view.upper + delta_u),
        ConformalParams::Aci { theta, .. } => (
            (view.lower - theta).min(view.point),
            (view.upper + theta).max(view.point),
        ),
    }
}

/// Applies `state` to a base interval and returns price-domain bounds.
pub fn apply_to_bounds(
    state: &ConformalState,
    m_log: f64,
    l_h: f64,
    u_h: f64,
    critical: f64,
) -> ForecastResult<(f64, f64)> {
    if !(l_h > 0.0 && u_h > 0.0 && m_log.is_finite()) {
        return Err(ForecastError::InvalidForecast {
            what: "base interval",
            value: l_h.min(u_h),
        });
    }
    let view = DomainView::new(state.domain, m_log, l_h, u_h, critical);
    let (lo, hi) = adjust_interval(&view, &state.params);
    Ok((from_domain(state.domain, lo), from_domain(state.domain, hi)))
}

/// Builds the conformal record for `base` without touching `base`.
pub fn conformalize_record(
    base: &ForecastRecord,
    state: &ConformalState,
    created_at: DateTime<Utc>,
) -> ForecastResult<ForecastRecord> {
    if base.method.is_conformal() || !base.locked || base.method.base() != state.base_method {
        return Err(ForecastError::NoBaseForecast {
            symbol: base.symbol.clone(),
            method: state.base_method.to_string(),
        });
    }
    let critical = base.critical.value();
    let (l_h, u_h) = apply_to_bounds(state, base.m_log, base.l_h, base.u_h, critical)?;
    let (l_1, u_1) = if base.horizon_trading == 1 {
        (l_h, u_h)
    } else {
        (base.l_1, base.u_1)
    };

    Ok(ForecastRecord {
        id: Uuid::new_v4(),
        method: Method::Conformal {
            mode: state.mode,
            base: state.base_method,
        },
        l_h,
        u_h,
        l_1,
        u_1,
        band_width_bp: (l_1 > 0.0).then(|| 10_000.0 * (u_1 / l_1 - 1.0)),
        conformal: Some(ConformalMeta {
            mode: state.mode,
            domain: state.domain,
            cal_window: state.cal_window,
            base_record_id: base.id,
            base_l_h: base.l_h,
            base_u_h: base.u_h,
            params: state.params.clone(),
        }),
        locked: true,
        active: false,
        created_at,
        ..base.clone()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConformalMode, CoverageStats, Estimator, ResidualDomain};

    fn state(domain: ResidualDomain, params: ConformalParams) -> ConformalState {
        ConformalState {
            symbol: "ABC".to_string(),
            mode: ConformalMode::Icp,
            domain,
            base_method: Estimator::Gbm,
            horizon: 5,
            coverage: 0.95,
            cal_window: 100,
            params,
            base_coverage: CoverageStats::default(),
            calibrated_coverage: CoverageStats::default(),
        }
    }

    #[test]
    fn test_icp_zero_collapses_to_point() {
        let m_log = 100.0f64.ln();
        for domain in [ResidualDomain::Log, ResidualDomain::Price] {
            let s = state(domain, ConformalParams::Icp { q_cal: 0.0 });
            let (l, u) = apply_to_bounds(&s, m_log, 95.0, 105.0, 1.96).unwrap();
            assert!((l - 100.0).abs() < 1e-9, "{:?}: {}", domain, l);
            assert!((u - 100.0).abs() < 1e-9, "{:?}: {}", domain, u);
        }
    }

    #[test]
    fn test_cqr_zero_reproduces_base() {
        let m_log = 100.0f64.ln();
        for domain in [ResidualDomain::Log, ResidualDomain::Price] {
            let s = state(
                domain,
                ConformalParams::Cqr {
                    delta_l: 0.0,
                    delta_u: 0.0,
                },
            );
            let (l, u) = apply_to_bounds(&s, m_log, 95.0, 105.0, 1.96).unwrap();
            assert!((l - 95.0).abs() < 1e-9);
            assert!((u - 105.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_cqr_asymmetric_shift() {
        let s = state(
            ResidualDomain::Price,
            ConformalParams::Cqr {
                delta_l: 1.0,
                delta_u: -2.0,
            },
        );
        let (l, u) = apply_to_bounds(&s, 100.0f64.ln(), 95.0, 105.0, 1.96).unwrap();
        assert!((l - 94.0).abs() < 1e-9);
        assert!((u - 103.0).abs() < 1e-9);
    }

    #[test]
    fn test_scaled_icp_uses_implied_sigma() {
        let s = state(ResidualDomain::Log, ConformalParams::IcpScaled { q_cal_scaled: 1.0 });
        let m_log = 100.0f64.ln();
        let (l, u) = apply_to_bounds(&s, m_log, (m_log - 0.04).exp(), (m_log + 0.04).exp(), 2.0)
            .unwrap();
        assert!((l.ln() - (m_log - 0.02)).abs() < 1e-12);
        assert!((u.ln() - (m_log + 0.02)).abs() < 1e-12);
    }

    #[test]
    fn test_aci_negative_theta_never_crosses_point() {
        let s = state(ResidualDomain::Price, ConformalParams::Aci { theta: -50.0, eta: 0.01 });
        let (l, u) = apply_to_bounds(&s, 100.0f64.ln(), 95.0, 105.0, 1.96).unwrap();
        assert!((l - 100.0).abs() < 1e-9);
        assert!((u - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_price_domain_floor_at_zero() {
        let s = state(ResidualDomain::Price, ConformalParams::Icp { q_cal: 500.0 });
        let (l, _) = apply_to_bounds(&s, 100.0f64.ln(), 95.0, 105.0, 1.96).unwrap();
        assert_eq!(l, 0.0);
    }
}
