//! Typed failures for the estimator, composer, and calibration layers.
//!
//! Every variant carries the numbers a caller needs to decide whether to
//! retry with relaxed parameters (smaller window, lower coverage, ...).
//! Nothing in the core retries on its own.

/// Errors raised by the forecasting core.
#[derive(Debug, Clone, PartialEq)]
pub enum ForecastError {
    /// Window larger than the data that was supplied.
    InsufficientData {
        what: &'static str,
        required: usize,
        available: usize,
    },
    /// Not enough valid prices for the GBM baseline.
    InsufficientHistory { required: usize, available: usize },
    /// A price used in a return computation was non-positive or non-finite.
    InvalidPrice { index: usize, value: f64 },
    /// A computed variance was non-positive or non-finite.
    InvalidVariance { what: &'static str, value: f64 },
    /// A computed forecast was non-positive or non-finite.
    InvalidForecast { what: &'static str, value: f64 },
    /// GARCH persistence outside the stationarity region.
    NonStationary { alpha: f64, beta: f64 },
    /// Caller-supplied parameter outside its valid range.
    InvalidParameter {
        name: &'static str,
        value: f64,
        reason: &'static str,
    },
    /// No locked base forecast to apply a conformal correction to.
    NoBaseForecast { symbol: String, method: String },
    /// Fewer usable (forecast, outcome) pairs than the calibration window.
    InsufficientCalibrationData {
        required: usize,
        available: usize,
        filter_hint: Option<String>,
    },
    /// Calendar or store lookup that could not be resolved.
    NotFound { what: String },
}

impl std::fmt::Display for ForecastError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsufficientData {
                what,
                required,
                available,
            } => {
                write!(
                    f,
                    "insufficient data for {}: need {}, have {} (short by {})",
                    what,
                    required,
                    available,
                    required.saturating_sub(*available)
                )
            }
            Self::InsufficientHistory {
                required,
                available,
            } => {
                write!(
                    f,
                    "insufficient price history: need {} valid prices, have {}",
                    required, available
                )
            }
            Self::InvalidPrice { index, value } => {
                write!(f, "invalid price at index {}: {}", index, value)
            }
            Self::InvalidVariance { what, value } => {
                write!(f, "invalid variance from {}: {:e}", what, value)
            }
            Self::InvalidForecast { what, value } => {
                write!(f, "invalid forecast from {}: {:e}", what, value)
            }
            Self::NonStationary { alpha, beta } => {
                write!(
                    f,
                    "non-stationary GARCH fit: alpha ({:.4}) + beta ({:.4}) = {:.4} >= 1",
                    alpha,
                    beta,
                    alpha + beta
                )
            }
            Self::InvalidParameter {
                name,
                value,
                reason,
            } => {
                write!(f, "invalid parameter {} = {}: {}", name, value, reason)
            }
            Self::NoBaseForecast { symbol, method } => {
                write!(
                    f,
                    "no locked base forecast for {} with method {}",
                    symbol, method
                )
            }
            Self::InsufficientCalibrationData {
                required,
                available,
                filter_hint,
            } => {
                write!(
                    f,
                    "insufficient calibration data: need {} pairs, have {} (short by {})",
                    required,
                    available,
                    required.saturating_sub(*available)
                )?;
                if let Some(hint) = filter_hint {
                    write!(f, "; {}", hint)?;
                }
                Ok(())
            }
            Self::NotFound { what } => write!(f, "not found: {}", what),
        }
    }
}

impl std::error::Error for ForecastError {}

pub type ForecastResult<T> = Result<T, ForecastError>;

/// Rejects a coverage outside the open unit interval.
pub(crate) fn check_coverage(coverage: f64) -> ForecastResult<()> {
    if coverage.is_finite() && coverage > 0.0 && coverage < 1.0 {
        Ok(())
    } else {
        Err(ForecastError::InvalidParameter {
            name: "coverage",
            value: coverage,
            reason: "must lie strictly between 0 and 1",
        })
    }
}
