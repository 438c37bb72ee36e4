//! Forecast orchestration over a [`Store`]
//!
//! Pulls the windowed inputs from storage, runs the pure estimator /
//! composer / calibration / event code, and writes the results back. This
//! is the only layer that mixes I/O with the numerics.

use crate::calendar::TradingCalendar;
use crate::conformal::{self, CalibrationConfig, CalibrationPair};
use crate::error::{check_coverage, ForecastError};
use crate::events::{self, EventConfig, EventContext, PauseReason, RescanReport, TickOutcome};
use crate::interval::{compose_pi, PiInputs};
use crate::models::{
    log_returns, CanonicalRow, ConformalState, CriticalValue, Estimator, EventRecord,
    ForecastRecord, Method, SigmaForecast,
};
use crate::store::{CanonicalStore, EventStore, ForecastStore, Store, TargetStore};
use crate::volatility::{
    fit_and_forecast_garch, fit_and_forecast_har, fit_and_forecast_range, fit_gbm,
    normal_critical, student_t_critical, vol_regime_percentile, GarchParams, HarParams,
    Innovation, RangeParams,
};
use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const COVERAGE_EPS: f64 = 1e-9;

// ============================================================================
// Requests
// ============================================================================

/// Estimator family plus its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum EstimatorChoice {
    Gbm,
    Garch(GarchParams),
    Har(HarParams),
    Range(RangeParams),
}

impl EstimatorChoice {
    pub fn estimator(&self) -> Estimator {
        match self {
            EstimatorChoice::Gbm => Estimator::Gbm,
            EstimatorChoice::Garch(p) => match p.innovation {
                Innovation::Normal => Estimator::GarchNormal,
                Innovation::StudentT { .. } => Estimator::GarchStudentT,
            },
            EstimatorChoice::Har(_) => Estimator::HarRv,
            EstimatorChoice::Range(p) => Estimator::Range(p.estimator),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastRequest {
    pub estimator: EstimatorChoice,
    /// Overrides the target spec horizon
    pub h: Option<u32>,
    /// Overrides the target spec coverage
    pub coverage: Option<f64>,
    /// GBM window (returns) used for the drift
    pub window_n: usize,
    pub lambda_drift: f64,
}

impl ForecastRequest {
    pub fn new(estimator: EstimatorChoice) -> Self {
        Self {
            estimator,
            h: None,
            coverage: None,
            window_n: 252,
            lambda_drift: 0.0,
        }
    }
}

/// Result of a single-day event tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EventTick {
    /// No open event and no breakout
    Quiet,
    Opened { event: EventRecord },
    Advanced { event: EventRecord, outcome: TickOutcome },
    Paused { reason: PauseReason },
}

// ============================================================================
// Pipeline
// ============================================================================

pub struct ForecastPipeline<S> {
    store: Arc<S>,
    calendar: TradingCalendar,
}

impl<S: Store> ForecastPipeline<S> {
    pub fn new(store: Arc<S>, calendar: TradingCalendar) -> Self {
        Self { store, calendar }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Rows dated on or before `as_of`, in date order.
    async fn rows_until(&self, symbol: &str, as_of: NaiveDate) -> Result<Vec<CanonicalRow>> {
        let mut rows = self
            .store
            .rows(symbol)
            .await
            .with_context(|| format!("load canonical rows for {}", symbol))?;
        rows.retain(|r| r.date <= as_of);
        rows.sort_by_key(|r| r.date);
        Ok(rows)
    }

    /// Builds a locked base forecast for `symbol` as of `as_of`. Nothing is
    /// written; see [`persist`](Self::persist).
    pub async fn forecast(
        &self,
        symbol: &str,
        as_of: NaiveDate,
        request: &ForecastRequest,
    ) -> Result<ForecastRecord> {
        let target = self.store.target(symbol).await?;
        let (h, coverage) = match (request.h, request.coverage, &target) {
            (Some(h), Some(c), _) => (h, c),
            (h, c, Some(spec)) => (h.unwrap_or(spec.h), c.unwrap_or(spec.coverage)),
            _ => {
                return Err(ForecastError::NotFound {
                    what: format!("target spec for {}", symbol),
                }
                .into())
            }
        };
        check_coverage(coverage)?;

        let rows = self.rows_until(symbol, as_of).await?;
        let spot = rows
            .last()
            .filter(|r| r.date == as_of)
            .and_then(|r| r.price())
            .ok_or_else(|| ForecastError::NotFound {
                what: format!("close for {} on {}", symbol, as_of),
            })?;

        // invalid rows drop out so the window spans the last valid prices
        let prices: Vec<f64> = rows.iter().filter_map(CanonicalRow::price).collect();
        let gbm = fit_gbm(&prices, request.window_n, request.lambda_drift)?;
        let returns = log_returns(&rows);

        let sigma: SigmaForecast = match &request.estimator {
            EstimatorChoice::Gbm => gbm.to_sigma_forecast(),
            EstimatorChoice::Garch(p) => fit_and_forecast_garch(&returns, p)?,
            EstimatorChoice::Har(p) => fit_and_forecast_har(&returns, p)?,
            EstimatorChoice::Range(p) => fit_and_forecast_range(&rows, p)?,
        };

        let critical = match sigma.garch().and_then(|g| g.df) {
            Some(df) if sigma.source == Estimator::GarchStudentT => CriticalValue::StudentT {
                value: student_t_critical(df, coverage)?,
                df,
            },
            _ => CriticalValue::Normal {
                value: normal_critical(coverage)?,
            },
        };

        let bounds = compose_pi(&PiInputs {
            spot,
            mu_used: gbm.mu_used,
            sigma: &sigma,
            critical: critical.value(),
            h,
        })?;

        let target_date = self
            .calendar
            .offset_trading_date(as_of, h)
            .ok_or_else(|| ForecastError::NotFound {
                what: format!("trading date {} days after {}", h, as_of),
            })?;

        let method = Method::Base(sigma.source);
        let vol_percentile = self
            .regime_percentile(symbol, method, as_of, sigma.sigma_1d, &rows)
            .await?;

        let record = ForecastRecord {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            date_t: as_of,
            method,
            horizon_trading: h,
            horizon_calendar_days: (target_date - as_of).num_days(),
            target_date,
            coverage,
            spot,
            mu_hat: gbm.mu_hat,
            mu_used: gbm.mu_used,
            sigma_1d: sigma.sigma_1d,
            sigma2_1d: sigma.sigma2_1d,
            l_h: bounds.l_h,
            u_h: bounds.u_h,
            l_1: bounds.l_1,
            u_1: bounds.u_1,
            band_width_bp: Some(bounds.band_width_bp),
            m_log: bounds.m_log,
            s_scale: bounds.s_scale,
            m_log_1: bounds.m_log_1,
            s_scale_1: bounds.s_scale_1,
            critical,
            sigma_diagnostics: Some(sigma.diagnostics.clone()),
            vol_percentile,
            params: serde_json::to_value(request).context("snapshot forecast parameters")?,
            conformal: None,
            locked: true,
            active: false,
            created_at: Utc::now(),
        };

        info!(
            symbol,
            %as_of,
            method = %record.method,
            h,
            sigma_1d = record.sigma_1d,
            l_h = record.l_h,
            u_h = record.u_h,
            "forecast composed"
        );
        Ok(record)
    }

    async fn regime_percentile(
        &self,
        symbol: &str,
        method: Method,
        as_of: NaiveDate,
        sigma_1d: f64,
        rows: &[CanonicalRow],
    ) -> Result<Option<f64>> {
        let history: Vec<(NaiveDate, f64)> = self
            .store
            .forecasts(symbol)
            .await?
            .into_iter()
            .filter(|f| f.method == method && f.date_t < as_of)
            .map(|f| (f.date_t, f.sigma_1d))
            .collect();
        let dated_returns: Vec<(NaiveDate, f64)> = rows
            .windows(2)
            .filter_map(|w| Some((w[1].date, (w[1].price()? / w[0].price()?).ln())))
            .collect();
        Ok(vol_regime_percentile(sigma_1d, as_of, &history, &dated_returns))
    }

    /// Stores `record` and marks it active for its date.
    pub async fn persist(&self, record: &ForecastRecord) -> Result<()> {
        self.store
            .append_forecast(record.clone())
            .await
            .with_context(|| format!("persist {} forecast for {}", record.method, record.symbol))?;
        self.store
            .set_active(&record.symbol, record.date_t, record.method)
            .await?;
        Ok(())
    }

    /// Calibrates `cfg.mode` for `base` forecasts at horizon `h` and
    /// `cfg.coverage`, using only outcomes realized on or before `as_of`.
    pub async fn calibrate_conformal(
        &self,
        symbol: &str,
        base: Estimator,
        h: u32,
        cfg: &CalibrationConfig,
        as_of: NaiveDate,
    ) -> Result<ConformalState> {
        let rows = self.rows_until(symbol, as_of).await?;
        let closes: BTreeMap<NaiveDate, f64> = rows
            .iter()
            .filter_map(|r| Some((r.date, r.price()?)))
            .collect();
        let data_end = closes.keys().next_back().copied().unwrap_or(as_of);
        let bounded = self.calendar.clone().bounded_by(data_end.min(as_of));

        let all = self.store.forecasts(symbol).await?;
        let method = Method::Base(base);
        let matching: Vec<&ForecastRecord> = all
            .iter()
            .filter(|f| {
                f.locked
                    && f.method == method
                    && f.horizon_trading == h
                    && (f.coverage - cfg.coverage).abs() < COVERAGE_EPS
                    && f.date_t < as_of
            })
            .collect();

        let mut pairs: Vec<CalibrationPair> = matching
            .iter()
            .filter_map(|f| {
                let target_date = bounded.offset_trading_date(f.date_t, h)?;
                let realized = *closes.get(&target_date)?;
                Some(CalibrationPair {
                    date_t: f.date_t,
                    target_date,
                    m_log: f.m_log,
                    l_h: f.l_h,
                    u_h: f.u_h,
                    critical: f.critical.value(),
                    realized,
                })
            })
            .collect();
        pairs.sort_by_key(|p| p.date_t);
        debug!(
            symbol,
            candidates = all.len(),
            matching = matching.len(),
            pairs = pairs.len(),
            "calibration pairs assembled"
        );

        let state = match conformal::calibrate(symbol, base, h, &pairs, cfg) {
            Ok(state) => state,
            Err(ForecastError::InsufficientCalibrationData {
                required,
                available,
                ..
            }) => {
                let excluded = all.len() - matching.len();
                let filter_hint = (excluded > 0).then(|| {
                    format!(
                        "{} stored forecasts for {} skipped: need method {}, h={}, coverage={}",
                        excluded, symbol, method, h, cfg.coverage
                    )
                });
                return Err(ForecastError::InsufficientCalibrationData {
                    required,
                    available,
                    filter_hint,
                }
                .into());
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            symbol,
            mode = %state.mode,
            base = %base,
            base_hit_rate = state.base_coverage.hit_rate,
            calibrated_hit_rate = state.calibrated_coverage.hit_rate,
            "conformal state calibrated"
        );
        Ok(state)
    }

    /// Applies `state` to the latest locked base forecast dated `as_of` and
    /// stores the resulting conformal record.
    pub async fn apply_conformal(
        &self,
        symbol: &str,
        state: &ConformalState,
        as_of: NaiveDate,
    ) -> Result<ForecastRecord> {
        let method = Method::Base(state.base_method);
        let base = self
            .store
            .forecasts(symbol)
            .await?
            .into_iter()
            .filter(|f| {
                f.locked
                    && f.method == method
                    && f.date_t == as_of
                    && f.horizon_trading == state.horizon
                    && (f.coverage - state.coverage).abs() < COVERAGE_EPS
            })
            .max_by_key(|f| f.created_at)
            .ok_or_else(|| ForecastError::NoBaseForecast {
                symbol: symbol.to_string(),
                method: method.to_string(),
            })?;

        let record = conformal::conformalize_record(&base, state, Utc::now())?;
        self.store.append_forecast(record.clone()).await?;
        info!(
            symbol,
            method = %record.method,
            l_h = record.l_h,
            u_h = record.u_h,
            base_l_h = base.l_h,
            base_u_h = base.u_h,
            "conformal forecast stored"
        );
        Ok(record)
    }

    /// Runs one event tick for `day`. With no open event this only checks
    /// for a breakout against `method` (or the active forecast).
    pub async fn tick_events(
        &self,
        symbol: &str,
        day: NaiveDate,
        cfg: &EventConfig,
        method: Option<Method>,
    ) -> Result<EventTick> {
        let rows = self.store.rows(symbol).await?;
        let forecasts = self.store.forecasts(symbol).await?;
        let ctx = EventContext::new(&self.calendar, &rows, &forecasts);

        let open = self.store.open_event(symbol).await?;
        let wanted = open.as_ref().map(|e| e.method).or(method);
        let obs = match ctx.observe(day, wanted) {
            Ok(obs) => obs,
            Err(reason) => {
                debug!(symbol, %day, ?reason, "event tick paused");
                return Ok(EventTick::Paused { reason });
            }
        };

        match open {
            Some(mut event) => {
                let outcome = events::tick(&mut event, &obs);
                if let TickOutcome::Paused(reason) = outcome {
                    return Ok(EventTick::Paused { reason });
                }
                self.store.upsert_event(event.clone()).await?;
                if outcome.is_terminal() {
                    info!(symbol, %day, t = ?event.t, outcome = ?outcome, "event closed");
                }
                Ok(EventTick::Advanced { event, outcome })
            }
            None => {
                let processed = self
                    .store
                    .events(symbol)
                    .await?
                    .iter()
                    .any(|e| e.last_tick.is_some_and(|last| last >= day));
                if processed {
                    debug!(symbol, %day, "day already processed by a closed event");
                    return Ok(EventTick::Paused {
                        reason: PauseReason::AlreadyProcessed { day },
                    });
                }
                match events::detect_breakout(symbol, &obs, cfg) {
                    Some(event) => {
                        self.store.upsert_event(event.clone()).await?;
                        info!(
                            symbol,
                            %day,
                            direction = ?event.direction,
                            z_score = event.z_score,
                            "breakout event opened"
                        );
                        Ok(EventTick::Opened { event })
                    }
                    None => Ok(EventTick::Quiet),
                }
            }
        }
    }

    /// Walks `[from, to]`, resuming after the last day already processed,
    /// and stores every event touched.
    pub async fn rescan_events(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
        cfg: &EventConfig,
        method: Option<Method>,
    ) -> Result<RescanReport> {
        let rows = self.store.rows(symbol).await?;
        let forecasts = self.store.forecasts(symbol).await?;
        let ctx = EventContext::new(&self.calendar, &rows, &forecasts);

        let existing = self.store.events(symbol).await?;
        let processed_through = existing.iter().filter_map(|e| e.last_tick).max();
        let start = match processed_through {
            Some(last) if last >= from => {
                warn!(symbol, %from, %last, "rescan overlaps processed days; resuming after last tick");
                last + Duration::days(1)
            }
            _ => from,
        };
        if start > to {
            return Ok(RescanReport::default());
        }

        let open = self.store.open_event(symbol).await?;
        let report = events::rescan(symbol, &ctx, cfg, method, open, start, to);
        for event in &report.events {
            self.store.upsert_event(event.clone()).await?;
        }
        info!(
            symbol,
            %start,
            %to,
            events = report.events.len(),
            paused = report.days_paused,
            "event rescan complete"
        );
        Ok(report)
    }
}
