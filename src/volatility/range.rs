//! OHLC range volatility estimators
//!
//! Parkinson, Garman-Klass and Rogers-Satchell produce one variance per day;
//! Yang-Zhang is a window-level combination of overnight, open-to-close and
//! Rogers-Satchell components. The input window carries one extra leading
//! day that only supplies the previous close.

use super::{mean, sample_variance};
use crate::error::{ForecastError, ForecastResult};
use crate::models::{
    CanonicalRow, Estimator, GapDiagnostic, Ohlc, RangeDiagnostics, RangeEstimator,
    SigmaDiagnostics, SigmaForecast,
};
use serde::{Deserialize, Serialize};
use std::f64::consts::LN_2;
use tracing::warn;

/// How per-day variances are collapsed into one number.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Aggregation {
    Mean,
    /// `v_i = (1 − λ)·x_i + λ·v_{i−1}`, seeded with the first observation
    Ewma { lambda: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangeParams {
    pub estimator: RangeEstimator,
    pub window: usize,
    pub aggregation: Aggregation,
}

impl Default for RangeParams {
    fn default() -> Self {
        Self {
            estimator: RangeEstimator::YangZhang,
            window: 22,
            aggregation: Aggregation::Mean,
        }
    }
}

pub fn parkinson(bar: &Ohlc) -> f64 {
    let hl = (bar.high / bar.low).ln();
    hl * hl / (4.0 * LN_2)
}

pub fn garman_klass(bar: &Ohlc) -> f64 {
    let hl = (bar.high / bar.low).ln();
    let co = (bar.close / bar.open).ln();
    0.5 * hl * hl - (2.0 * LN_2 - 1.0) * co * co
}

pub fn rogers_satchell(bar: &Ohlc) -> f64 {
    let u = (bar.high / bar.open).ln();
    let d = (bar.low / bar.open).ln();
    let c = (bar.close / bar.open).ln();
    u * (u - c) + d * (d - c)
}

/// Yang-Zhang weight `k = 0.34 / (1.34 + (N+1)/(N−1))` for `N` days.
pub fn yang_zhang_k(n: usize) -> f64 {
    let n = n as f64;
    0.34 / (1.34 + (n + 1.0) / (n - 1.0))
}

/// Exponentially weighted level of `xs`, seeded with the first value.
pub fn ewma(xs: &[f64], lambda: f64) -> Option<f64> {
    let (first, rest) = xs.split_first()?;
    Some(
        rest.iter()
            .fold(*first, |v, x| (1.0 - lambda) * x + lambda * v),
    )
}

fn aggregate(xs: &[f64], aggregation: Aggregation) -> Option<f64> {
    match aggregation {
        Aggregation::Mean => mean(xs),
        Aggregation::Ewma { lambda } => ewma(xs, lambda),
    }
}

/// A day with its own bar and the previous day's close, when both exist.
#[derive(Debug, Clone, Copy)]
struct DayPair {
    bar: Ohlc,
    prev_close: Option<f64>,
}

fn day_pairs(bars: &[Option<Ohlc>]) -> Vec<DayPair> {
    bars.windows(2)
        .filter_map(|w| {
            let bar = w[1]?;
            Some(DayPair {
                bar,
                prev_close: w[0].map(|p| p.close),
            })
        })
        .collect()
}

/// Aggregated daily variance for `window` days out of `bars`.
///
/// `bars` must hold at least `window + 1` entries; only the trailing
/// `window + 1` are used. Invalid days (`None`) are dropped before
/// aggregation. The result may be zero for a flat series.
pub fn range_variance(
    bars: &[Option<Ohlc>],
    params: &RangeParams,
) -> ForecastResult<(f64, usize, Option<f64>)> {
    validate(params)?;
    let needed = params.window + 1;
    if bars.len() < needed {
        return Err(ForecastError::InsufficientData {
            what: "range window",
            required: needed,
            available: bars.len(),
        });
    }
    let slice = &bars[bars.len() - needed..];
    let days = day_pairs(slice);

    match params.estimator {
        RangeEstimator::Parkinson | RangeEstimator::GarmanKlass | RangeEstimator::RogersSatchell => {
            let f: fn(&Ohlc) -> f64 = match params.estimator {
                RangeEstimator::Parkinson => parkinson,
                RangeEstimator::GarmanKlass => garman_klass,
                _ => rogers_satchell,
            };
            let daily: Vec<f64> = days.iter().map(|d| f(&d.bar)).collect();
            require_days(daily.len(), params.window)?;
            let v = aggregate(&daily, params.aggregation).unwrap_or(0.0);
            Ok((v.max(0.0), daily.len(), None))
        }
        RangeEstimator::YangZhang => {
            let usable: Vec<(Ohlc, f64)> = days
                .iter()
                .filter_map(|d| Some((d.bar, d.prev_close?)))
                .collect();
            require_days(usable.len(), params.window)?;
            let n = usable.len();
            if n < 2 {
                return Err(ForecastError::InsufficientData {
                    what: "yang-zhang window",
                    required: 2,
                    available: n,
                });
            }
            let overnight: Vec<f64> = usable
                .iter()
                .map(|(bar, prev)| (bar.open / prev).ln())
                .collect();
            let open_close: Vec<f64> = usable
                .iter()
                .map(|(bar, _)| (bar.close / bar.open).ln())
                .collect();
            let rs: Vec<f64> = usable.iter().map(|(bar, _)| rogers_satchell(bar)).collect();

            let k = yang_zhang_k(n);
            let var_g = sample_variance(&overnight).unwrap_or(0.0);
            let var_c = sample_variance(&open_close).unwrap_or(0.0);
            let rs_level = aggregate(&rs, params.aggregation).unwrap_or(0.0);
            let v = var_g + k * var_c + (1.0 - k) * rs_level;
            Ok((v.max(0.0), n, Some(k)))
        }
    }
}

fn require_days(have: usize, window: usize) -> ForecastResult<()> {
    if have < window {
        return Err(ForecastError::InsufficientData {
            what: "valid range days",
            required: window,
            available: have,
        });
    }
    Ok(())
}

fn validate(params: &RangeParams) -> ForecastResult<()> {
    if params.window == 0 {
        return Err(ForecastError::InvalidParameter {
            name: "window",
            value: 0.0,
            reason: "range window must be at least 1",
        });
    }
    if let Aggregation::Ewma { lambda } = params.aggregation {
        if !(0.0..1.0).contains(&lambda) {
            return Err(ForecastError::InvalidParameter {
                name: "ewma_lambda",
                value: lambda,
                reason: "decay must lie in [0, 1)",
            });
        }
    }
    Ok(())
}

/// Flags days whose overnight gap exceeds twice the close-to-close
/// standard deviation. Informational only.
pub fn gap_diagnostic(bars: &[Option<Ohlc>]) -> GapDiagnostic {
    let pairs: Vec<(f64, f64)> = day_pairs(bars)
        .iter()
        .filter_map(|d| {
            let prev = d.prev_close?;
            Some(((d.bar.open / prev).ln(), (d.bar.close / prev).ln()))
        })
        .collect();
    let cc: Vec<f64> = pairs.iter().map(|(_, c)| *c).collect();
    let threshold = 2.0 * sample_variance(&cc).unwrap_or(0.0).sqrt();
    let gap_days = if threshold > 0.0 {
        pairs.iter().filter(|(g, _)| g.abs() > threshold).count()
    } else {
        0
    };
    GapDiagnostic {
        gap_days,
        days_checked: pairs.len(),
        threshold,
        prefer_drift_robust: gap_days > 0,
    }
}

/// Fits the chosen range estimator on the trailing window of `rows`.
pub fn fit_and_forecast_range(
    rows: &[CanonicalRow],
    params: &RangeParams,
) -> ForecastResult<SigmaForecast> {
    let bars: Vec<Option<Ohlc>> = rows.iter().map(|r| r.ohlc()).collect();
    let (variance, days_used, k) = range_variance(&bars, params)?;
    if !(variance.is_finite() && variance > 0.0) {
        return Err(ForecastError::InvalidVariance {
            what: "range estimator",
            value: variance,
        });
    }

    let tail = &bars[bars.len() - (params.window + 1)..];
    let gap = gap_diagnostic(tail);
    if gap.prefer_drift_robust && !params.estimator.is_drift_robust() {
        warn!(
            estimator = ?params.estimator,
            gap_days = gap.gap_days,
            "overnight gaps detected; Rogers-Satchell or Yang-Zhang recommended"
        );
    }

    let ewma_lambda = match params.aggregation {
        Aggregation::Ewma { lambda } => Some(lambda),
        Aggregation::Mean => None,
    };
    Ok(SigmaForecast::from_variance(
        Estimator::Range(params.estimator),
        variance,
        SigmaDiagnostics::Range(RangeDiagnostics {
            estimator: params.estimator,
            window: params.window,
            days_used,
            k,
            ewma_lambda,
            gap,
        }),
    ))
}

/// All four estimators on the same window, skipping any that fail.
pub fn compare_range_estimators(
    rows: &[CanonicalRow],
    window: usize,
    aggregation: Aggregation,
) -> Vec<(RangeEstimator, ForecastResult<SigmaForecast>)> {
    RangeEstimator::ALL
        .iter()
        .map(|est| {
            let params = RangeParams {
                estimator: *est,
                window,
                aggregation,
            };
            (*est, fit_and_forecast_range(rows, &params))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wiggly_bars(n: usize, scale: f64) -> Vec<Option<Ohlc>> {
        (0..n)
            .map(|i| {
                let base = scale * (100.0 + (i as f64 * 0.7).sin() * 3.0);
                let open = base * (1.0 + 0.002 * (i as f64 * 1.3).cos());
                let close = base * (1.0 - 0.003 * (i as f64 * 0.9).sin());
                let high = open.max(close) * 1.01;
                let low = open.min(close) * 0.99;
                Some(Ohlc::new(open, high, low, close))
            })
            .collect()
    }

    fn params(estimator: RangeEstimator, window: usize) -> RangeParams {
        RangeParams {
            estimator,
            window,
            aggregation: Aggregation::Mean,
        }
    }

    #[test]
    fn test_flat_series_gives_zero_variance() {
        let bars = vec![Some(Ohlc::new(50.0, 50.0, 50.0, 50.0)); 30];
        for est in RangeEstimator::ALL {
            let (v, _, _) = range_variance(&bars, &params(est, 20)).unwrap();
            assert_eq!(v, 0.0, "{:?} should be exactly zero, got {}", est, v);
        }
    }

    #[test]
    fn test_flat_series_fit_is_invalid_variance() {
        let rows: Vec<CanonicalRow> = (0..30)
            .map(|i| CanonicalRow {
                date: chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
                    + chrono::Duration::days(i),
                open: Some(10.0),
                high: Some(10.0),
                low: Some(10.0),
                close: Some(10.0),
                adj_close: Some(10.0),
                volume: None,
                r: None,
                valid: true,
            })
            .collect();
        let err = fit_and_forecast_range(&rows, &params(RangeEstimator::Parkinson, 20)).unwrap_err();
        assert!(matches!(err, ForecastError::InvalidVariance { .. }));
    }

    #[test]
    fn test_yang_zhang_scale_invariant() {
        let a = wiggly_bars(40, 1.0);
        let b = wiggly_bars(40, 37.5);
        let p = params(RangeEstimator::YangZhang, 30);
        let (va, _, _) = range_variance(&a, &p).unwrap();
        let (vb, _, _) = range_variance(&b, &p).unwrap();
        assert!(va > 0.0);
        assert!((va - vb).abs() < 1e-12 * va.max(1.0), "{} vs {}", va, vb);
    }

    #[test]
    fn test_parkinson_single_day_formula() {
        let bar = Ohlc::new(100.0, 105.0, 95.0, 102.0);
        let expected = (105.0f64 / 95.0).ln().powi(2) / (4.0 * LN_2);
        assert!((parkinson(&bar) - expected).abs() < 1e-15);
    }

    #[test]
    fn test_rogers_satchell_non_negative() {
        for bar in wiggly_bars(50, 1.0).into_iter().flatten() {
            assert!(rogers_satchell(&bar) >= 0.0);
            assert!(garman_klass(&bar) >= 0.0);
        }
    }

    #[test]
    fn test_yang_zhang_uses_actual_window_length() {
        let bars = wiggly_bars(61, 1.0);
        let (_, n, k) = range_variance(&bars, &params(RangeEstimator::YangZhang, 60)).unwrap();
        assert_eq!(n, 60);
        assert_eq!(k, Some(yang_zhang_k(60)));
        assert!(yang_zhang_k(60) != yang_zhang_k(22));
    }

    #[test]
    fn test_invalid_days_dropped_then_insufficient() {
        let mut bars = wiggly_bars(21, 1.0);
        bars[10] = None;
        let err = range_variance(&bars, &params(RangeEstimator::Parkinson, 20)).unwrap_err();
        assert_eq!(
            err,
            ForecastError::InsufficientData {
                what: "valid range days",
                required: 20,
                available: 19
            }
        );
    }

    #[test]
    fn test_ewma_seeded_with_first_observation() {
        assert_eq!(ewma(&[4.0], 0.9), Some(4.0));
        let v = ewma(&[1.0, 3.0], 0.5).unwrap();
        assert!((v - 2.0).abs() < 1e-12);
        assert_eq!(ewma(&[], 0.5), None);
    }

    #[test]
    fn test_ewma_lambda_out_of_range() {
        let bars = wiggly_bars(30, 1.0);
        let p = RangeParams {
            estimator: RangeEstimator::Parkinson,
            window: 20,
            aggregation: Aggregation::Ewma { lambda: 1.0 },
        };
        assert!(matches!(
            range_variance(&bars, &p),
            Err(ForecastError::InvalidParameter { name: "ewma_lambda", .. })
        ));
    }

    #[test]
    fn test_gap_diagnostic_flags_large_overnight_moves() {
        let mut bars = wiggly_bars(30, 1.0);
        if let Some(bar) = bars[20].as_mut() {
            let jump = 1.2;
            bar.open *= jump;
            bar.high *= jump;
            bar.low *= jump;
            bar.close *= jump;
        }
        let gap = gap_diagnostic(&bars);
        assert!(gap.gap_days >= 1);
        assert!(gap.prefer_drift_robust);
    }
}
