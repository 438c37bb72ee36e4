//! Conformal calibration of base prediction intervals
//!
//! Calibration consumes `(base forecast, realized outcome)` pairs for one
//! symbol / base method / horizon / coverage and produces a fresh
//! [`ConformalState`](crate::models::ConformalState). Application takes the
//! latest locked base forecast and emits a new conformal record; the base
//! record is never edited.
//!
//! Supported modes: ICP, scaled ICP, CQR, EnbPI (seeded bootstrap) and ACI.

pub mod apply;
pub mod calibrate;
pub mod quantile;

pub use apply::{adjust_interval, apply_to_bounds, conformalize_record};
pub use calibrate::{calibrate, CalibrationConfig, CalibrationPair};
pub use quantile::quantile;

use crate::models::ResidualDomain;

/// Base interval and outcome expressed in one residual domain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DomainView {
    pub point: f64,
    pub lower: f64,
    pub upper: f64,
    /// Implied one-sigma width: half-width over the critical value
    pub sigma_pred: f64,
}

impl DomainView {
    /// Projects a log-centered price interval into `domain`.
    pub fn new(domain: ResidualDomain, m_log: f64, l: f64, u: f64, critical: f64) -> Self {
        let (point, lower, upper) = match domain {
            ResidualDomain::Log => (m_log, l.ln(), u.ln()),
            ResidualDomain::Price => (m_log.exp(), l, u),
        };
        let sigma_pred = if critical.is_finite() && critical > 0.0 {
            (upper - lower) / (2.0 * critical)
        } else {
            f64::NAN
        };
        Self {
            point,
            lower,
            upper,
            sigma_pred,
        }
    }
}

/// Maps a price into `domain`.
pub fn to_domain(domain: ResidualDomain, price: f64) -> f64 {
    match domain {
        ResidualDomain::Log => price.ln(),
        ResidualDomain::Price => price,
    }
}

/// Maps a domain value back to a price; price-domain bounds floor at zero.
pub fn from_domain(domain: ResidualDomain, value: f64) -> f64 {
    match domain {
        ResidualDomain::Log => value.exp(),
        ResidualDomain::Price => value.max(0.0),
    }
}
