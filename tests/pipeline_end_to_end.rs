//! End-to-end pipeline tests
//!
//! Synthetic price paths are generated from a seeded ChaCha8 stream so every
//! run sees identical data. Paths start on 2019-01-01 and advance one
//! weekday per row.

use chrono::NaiveDate;
use rand::distributions::Distribution;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use statrs::distribution::Normal;
use std::sync::Arc;
use tempfile::NamedTempFile;

use volcast::calendar::TradingCalendar;
use volcast::conformal::CalibrationConfig;
use volcast::events::EventConfig;
use volcast::models::{
    CanonicalRow, CensorReason, ConformalMode, CriticalValue, Estimator, Method, RangeEstimator,
    StopReason, StopRule, TargetSpec,
};
use volcast::store::{
    CanonicalStore, EventStore, ForecastStore, MemoryStore, SqliteStore, Store, TargetStore,
};
use volcast::volatility::{
    Aggregation, GarchParams, HarParams, Innovation, OmegaMode, RangeParams,
};
use volcast::{EstimatorChoice, EventTick, ForecastPipeline, ForecastRequest};

const SYMBOL: &str = "SYN";

/// GBM path with OHLC bars; `jump_at` multiplies the close of that row (and
/// every later price) by `jump`.
fn synthetic_rows(n: usize, daily_sigma: f64, seed: u64, jump_at: Option<(usize, f64)>) -> Vec<CanonicalRow> {
    let cal = TradingCalendar::weekdays();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let normal = Normal::new(0.0, daily_sigma).unwrap();
    let mut date: NaiveDate = "2019-01-01".parse().unwrap();
    let mut price: f64 = 100.0;
    let mut rows = Vec::with_capacity(n);
    for i in 0..n {
        let open = price * (0.5 * normal.sample(&mut rng)).exp();
        price = open * (0.8 * normal.sample(&mut rng)).exp();
        if let Some((at, jump)) = jump_at {
            if i == at {
                price *= jump;
            }
        }
        rows.push(CanonicalRow {
            date,
            open: Some(open),
            high: Some(open.max(price) * 1.003),
            low: Some(open.min(price) * 0.997),
            close: Some(price),
            adj_close: Some(price),
            volume: Some(1e6),
            r: None,
            valid: true,
        });
        date = cal.next_trading_date(date);
    }
    rows
}

async fn seed<S: Store>(store: &S, rows: Vec<CanonicalRow>, h: u32) {
    store.put_rows(SYMBOL, rows).await.unwrap();
    store
        .put_target(TargetSpec {
            symbol: SYMBOL.to_string(),
            h,
            coverage: 0.95,
            exchange_tz: "America/New_York".to_string(),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_every_estimator_brackets_the_center() {
    let rows = synthetic_rows(1_300, 0.012, 11, None);
    let as_of = rows.last().unwrap().date;
    let store = Arc::new(MemoryStore::new());
    seed(store.as_ref(), rows, 5).await;
    let pipeline = ForecastPipeline::new(store.clone(), TradingCalendar::weekdays());

    let choices = [
        EstimatorChoice::Gbm,
        EstimatorChoice::Garch(GarchParams::default()),
        EstimatorChoice::Garch(GarchParams {
            innovation: Innovation::StudentT { df: None },
            ..GarchParams::default()
        }),
        EstimatorChoice::Garch(GarchParams {
            omega: OmegaMode::FixedFraction { fraction: 0.05 },
            ..GarchParams::default()
        }),
        EstimatorChoice::Har(HarParams::default()),
        EstimatorChoice::Range(RangeParams::default()),
        EstimatorChoice::Range(RangeParams {
            estimator: RangeEstimator::Parkinson,
            window: 30,
            aggregation: Aggregation::Ewma { lambda: 0.94 },
        }),
    ];

    for choice in choices {
        let rec = pipeline
            .forecast(SYMBOL, as_of, &ForecastRequest::new(choice))
            .await
            .unwrap_or_else(|e| panic!("{:?} failed: {:#}", choice, e));
        assert_eq!(rec.method, Method::Base(choice.estimator()));
        assert_eq!(rec.horizon_trading, 5);
        assert!(rec.l_h < rec.m_log.exp() && rec.m_log.exp() < rec.u_h, "{}", rec.method);
        assert!(rec.l_1 < rec.u_1);
        assert!(
            rec.u_h / rec.l_h > rec.u_1 / rec.l_1,
            "{}: the 5-day interval must be wider than the one-day band",
            rec.method
        );
        // 5 trading days from any weekday spans exactly one weekend
        assert_eq!(rec.horizon_calendar_days, 7);
        assert!(rec.sigma_1d > 0.0 && rec.sigma_1d < 0.05, "{}: {}", rec.method, rec.sigma_1d);
        if choice.estimator() == Estimator::GarchStudentT {
            assert!(matches!(rec.critical, CriticalValue::StudentT { .. }));
            // heavy tails never shrink the normal quantile
            assert!(rec.critical.value() >= 1.959);
        } else {
            assert!(matches!(rec.critical, CriticalValue::Normal { .. }));
        }
    }
}

#[tokio::test]
async fn test_garch_window_shortfall_reports_counts() {
    let rows = synthetic_rows(700, 0.01, 3, None);
    let as_of = rows.last().unwrap().date;
    let store = Arc::new(MemoryStore::new());
    seed(store.as_ref(), rows, 1).await;
    let pipeline = ForecastPipeline::new(store, TradingCalendar::weekdays());

    let err = pipeline
        .forecast(
            SYMBOL,
            as_of,
            &ForecastRequest::new(EstimatorChoice::Garch(GarchParams::default())),
        )
        .await
        .unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("1000") && msg.contains("699"), "{}", msg);
}

#[tokio::test]
async fn test_daily_forecasts_drive_event_rescan() {
    let n = 420;
    let rows = synthetic_rows(n, 0.01, 21, Some((n - 60, 1.12)));
    let dates: Vec<NaiveDate> = rows.iter().map(|r| r.date).collect();
    let store = Arc::new(MemoryStore::new());
    seed(store.as_ref(), rows, 1).await;
    let pipeline = ForecastPipeline::new(store.clone(), TradingCalendar::weekdays());

    for date in &dates[n - 100..] {
        let rec = pipeline
            .forecast(SYMBOL, *date, &ForecastRequest::new(EstimatorChoice::Gbm))
            .await
            .unwrap();
        pipeline.persist(&rec).await.unwrap();
    }

    let cfg = EventConfig {
        stop_rule: StopRule::ReEntry { k_inside: 2 },
        t_max: 10,
    };
    let report = pipeline
        .rescan_events(SYMBOL, dates[n - 100], dates[n - 1], &cfg, None)
        .await
        .unwrap();

    assert!(!report.events.is_empty(), "the injected jump must open an event");
    // the jump day is at risk in some event, whether it opened one or
    // landed inside an event that was already running
    assert!(report
        .events
        .iter()
        .any(|e| e.breakout_date <= dates[n - 60] && e.last_tick >= Some(dates[n - 60])));
    // the first rescanned day has no prior-day forecast
    assert!(report.days_paused >= 1);

    for ev in &report.events {
        if ev.event_open {
            // only a breakout on the final row has nothing left to censor
            assert_eq!(ev.breakout_date, dates[n - 1]);
            assert_eq!(ev.at_risk_days, 0);
            continue;
        }
        let t = ev.t.unwrap();
        match (ev.stop_reason, ev.censor_reason) {
            (Some(StopReason::ReEntry), None) => assert_eq!(t, ev.at_risk_days - 2),
            (None, Some(CensorReason::TMax)) => assert_eq!(t, 10),
            (None, Some(CensorReason::EndOfSample)) => assert_eq!(t, ev.at_risk_days),
            other => panic!("unexpected terminal state {:?}", other),
        }
        assert!(ev.max_z_excess >= ev.z_excess);
    }

    let stored = store.events(SYMBOL).await.unwrap();
    assert_eq!(stored.len(), report.events.len());

    // everything has been processed; a second pass is a no-op
    let again = pipeline
        .rescan_events(SYMBOL, dates[n - 100], dates[n - 1], &cfg, None)
        .await
        .unwrap();
    assert!(again.events.is_empty());
}

#[tokio::test]
async fn test_single_day_ticks_follow_sign_flip() {
    let n = 300;
    let rows = synthetic_rows(n, 0.01, 5, Some((n - 3, 1.15)));
    let dates: Vec<NaiveDate> = rows.iter().map(|r| r.date).collect();
    let store = Arc::new(MemoryStore::new());
    seed(store.as_ref(), rows, 1).await;
    let pipeline = ForecastPipeline::new(store.clone(), TradingCalendar::weekdays());
    for date in &dates[n - 5..] {
        let rec = pipeline
            .forecast(SYMBOL, *date, &ForecastRequest::new(EstimatorChoice::Gbm))
            .await
            .unwrap();
        pipeline.persist(&rec).await.unwrap();
    }

    let cfg = EventConfig {
        stop_rule: StopRule::SignFlip,
        t_max: 20,
    };
    let opened = pipeline
        .tick_events(SYMBOL, dates[n - 3], &cfg, None)
        .await
        .unwrap();
    let event = match opened {
        EventTick::Opened { event } => event,
        other => panic!("expected a breakout, got {:?}", other),
    };
    assert_eq!(event.direction.sign(), 1);

    // ticking the breakout day again changes nothing
    let again = pipeline
        .tick_events(SYMBOL, dates[n - 3], &cfg, None)
        .await
        .unwrap();
    assert!(matches!(again, EventTick::Paused { .. }));

    let next = pipeline
        .tick_events(SYMBOL, dates[n - 2], &cfg, None)
        .await
        .unwrap();
    let EventTick::Advanced { event, .. } = next else {
        panic!("expected the open event to advance, got {:?}", next);
    };
    assert_eq!(event.at_risk_days, 1);
    let stored = store.open_event(SYMBOL).await.unwrap();
    assert_eq!(stored.is_some(), event.event_open);
}

#[tokio::test]
async fn test_icp_calibration_and_apply_on_sqlite() {
    let temp = NamedTempFile::new().unwrap();
    let store = Arc::new(SqliteStore::new(temp.path().to_str().unwrap()).unwrap());
    let n = 360;
    let rows = synthetic_rows(n, 0.015, 8, None);
    let dates: Vec<NaiveDate> = rows.iter().map(|r| r.date).collect();
    seed(store.as_ref(), rows, 1).await;
    let pipeline = ForecastPipeline::new(store.clone(), TradingCalendar::weekdays());

    for date in &dates[n - 80..] {
        let rec = pipeline
            .forecast(SYMBOL, *date, &ForecastRequest::new(EstimatorChoice::Gbm))
            .await
            .unwrap();
        pipeline.persist(&rec).await.unwrap();
    }

    let as_of = dates[n - 1];
    let cfg = CalibrationConfig {
        mode: ConformalMode::Icp,
        cal_window: 60,
        coverage: 0.95,
        ..CalibrationConfig::default()
    };
    let state = pipeline
        .calibrate_conformal(SYMBOL, Estimator::Gbm, 1, &cfg, as_of)
        .await
        .unwrap();
    assert_eq!(state.calibrated_coverage.n, 60);
    assert!(
        state.calibrated_coverage.hit_rate >= 0.95 - 1e-9,
        "in-window ICP coverage {}",
        state.calibrated_coverage.hit_rate
    );

    let rec = pipeline.apply_conformal(SYMBOL, &state, as_of).await.unwrap();
    assert!(rec.locked && !rec.active);
    let meta = rec.conformal.as_ref().unwrap();
    let base = store
        .forecast(SYMBOL, as_of, Method::Base(Estimator::Gbm))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(meta.base_record_id, base.id);
    assert_eq!(meta.base_l_h, base.l_h);
    // ICP intervals are symmetric in log space around the base center
    assert!(((rec.u_h.ln() - base.m_log) - (base.m_log - rec.l_h.ln())).abs() < 1e-9);

    // the conformal record is keyed by its own method and cannot be replaced
    assert!(store.append_forecast(rec.clone()).await.is_err());
    let latest = store.latest_forecast(SYMBOL, Some(rec.method)).await.unwrap().unwrap();
    assert_eq!(latest.id, rec.id);
}

#[tokio::test]
async fn test_calibration_needs_enough_realized_pairs() {
    let rows = synthetic_rows(300, 0.01, 2, None);
    let dates: Vec<NaiveDate> = rows.iter().map(|r| r.date).collect();
    let store = Arc::new(MemoryStore::new());
    seed(store.as_ref(), rows, 1).await;
    let pipeline = ForecastPipeline::new(store, TradingCalendar::weekdays());
    for date in &dates[300 - 20..] {
        let rec = pipeline
            .forecast(SYMBOL, *date, &ForecastRequest::new(EstimatorChoice::Gbm))
            .await
            .unwrap();
        pipeline.persist(&rec).await.unwrap();
    }

    let cfg = CalibrationConfig {
        cal_window: 30,
        ..CalibrationConfig::default()
    };
    let err = pipeline
        .calibrate_conformal(SYMBOL, Estimator::Gbm, 1, &cfg, dates[299])
        .await
        .unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("30") && msg.contains("19"), "{}", msg);
}
