//! Volatility forecasting engine
//!
//! Estimates one-day volatility (GBM, GARCH(1,1), HAR-RV, OHLC range
//! estimators), composes horizon prediction intervals, recalibrates them with
//! conformal prediction, and tracks breakout events against the one-day band.
//!
//! Estimators, the composer, calibration and the event machine are pure and
//! synchronous; [`pipeline`] wires them to a [`store::Store`].

pub mod calendar;
pub mod config;
pub mod conformal;
pub mod error;
pub mod events;
pub mod interval;
pub mod models;
pub mod pipeline;
pub mod store;
pub mod volatility;

pub use error::{ForecastError, ForecastResult};
pub use pipeline::{EstimatorChoice, EventTick, ForecastPipeline, ForecastRequest};
