//! SQLite store
//!
//! Records are kept as JSON alongside the key columns the queries filter on.
//! One connection guarded by an async mutex; WAL so readers can attach from
//! other processes while the CLI writes.

use super::{locked_conflict, CanonicalStore, EventStore, ForecastStore, TargetStore};
use crate::models::{CanonicalRow, EventRecord, ForecastRecord, Method, TargetSpec};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS canonical_rows (
    symbol TEXT NOT NULL,
    date TEXT NOT NULL,
    row_json TEXT NOT NULL,
    PRIMARY KEY (symbol, date)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS targets (
    symbol TEXT PRIMARY KEY,
    spec_json TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS forecasts (
    id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    date_t TEXT NOT NULL,
    method TEXT NOT NULL,
    created_at TEXT NOT NULL,
    locked INTEGER NOT NULL,
    active INTEGER NOT NULL,
    record_json TEXT NOT NULL,
    UNIQUE (symbol, date_t, method)
);

CREATE INDEX IF NOT EXISTS idx_forecasts_symbol_created
    ON forecasts(symbol, created_at DESC);

CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    breakout_date TEXT NOT NULL,
    event_open INTEGER NOT NULL,
    record_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_symbol_open
    ON events(symbol, event_open, breakout_date);
"#;

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("open forecast db at {}", db_path))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.execute_batch(SCHEMA_SQL)
            .context("create forecast db schema")?;
        info!(db_path, "forecast store ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn decode<T: DeserializeOwned>(json: &str, what: &str) -> Result<T> {
    serde_json::from_str(json).with_context(|| format!("decode stored {}", what))
}

fn decode_all<T: DeserializeOwned>(jsons: Vec<String>, what: &str) -> Result<Vec<T>> {
    jsons.iter().map(|j| decode(j, what)).collect()
}

fn created_key(record: &ForecastRecord) -> String {
    record
        .created_at
        .to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

#[async_trait::async_trait]
impl CanonicalStore for SqliteStore {
    async fn rows(&self, symbol: &str) -> Result<Vec<CanonicalRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT row_json FROM canonical_rows WHERE symbol = ?1 ORDER BY date ASC",
        )?;
        let jsons = stmt
            .query_map([symbol], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        decode_all(jsons, "canonical row")
    }

    async fn put_rows(&self, symbol: &str, rows: Vec<CanonicalRow>) -> Result<usize> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO canonical_rows (symbol, date, row_json) VALUES (?1, ?2, ?3)
                 ON CONFLICT(symbol, date) DO UPDATE SET row_json = excluded.row_json",
            )?;
            for row in &rows {
                let json = serde_json::to_string(row)?;
                stmt.execute(params![symbol, row.date.to_string(), json])?;
            }
        }
        tx.commit().context("commit canonical rows")?;
        debug!(symbol, n = rows.len(), "canonical rows stored");
        Ok(rows.len())
    }
}

#[async_trait::async_trait]
impl TargetStore for SqliteStore {
    async fn target(&self, symbol: &str) -> Result<Option<TargetSpec>> {
        let conn = self.conn.lock().await;
        let json: Option<String> = conn
            .query_row(
                "SELECT spec_json FROM targets WHERE symbol = ?1",
                [symbol],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| decode(&j, "target spec")).transpose()
    }

    async fn put_target(&self, spec: TargetSpec) -> Result<()> {
        let json = serde_json::to_string(&spec)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO targets (symbol, spec_json) VALUES (?1, ?2)
             ON CONFLICT(symbol) DO UPDATE SET spec_json = excluded.spec_json",
            params![spec.symbol, json],
        )?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ForecastStore for SqliteStore {
    async fn forecasts(&self, symbol: &str) -> Result<Vec<ForecastRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT record_json FROM forecasts WHERE symbol = ?1
             ORDER BY date_t ASC, created_at ASC",
        )?;
        let jsons = stmt
            .query_map([symbol], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        decode_all(jsons, "forecast")
    }

    async fn forecast(
        &self,
        symbol: &str,
        date_t: NaiveDate,
        method: Method,
    ) -> Result<Option<ForecastRecord>> {
        let conn = self.conn.lock().await;
        let json: Option<String> = conn
            .query_row(
                "SELECT record_json FROM forecasts
                 WHERE symbol = ?1 AND date_t = ?2 AND method = ?3",
                params![symbol, date_t.to_string(), method.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| decode(&j, "forecast")).transpose()
    }

    async fn latest_forecast(
        &self,
        symbol: &str,
        method: Option<Method>,
    ) -> Result<Option<ForecastRecord>> {
        let conn = self.conn.lock().await;
        let json: Option<String> = match method {
            Some(m) => conn
                .query_row(
                    "SELECT record_json FROM forecasts WHERE symbol = ?1 AND method = ?2
                     ORDER BY created_at DESC, date_t DESC LIMIT 1",
                    params![symbol, m.to_string()],
                    |row| row.get(0),
                )
                .optional()?,
            None => conn
                .query_row(
                    "SELECT record_json FROM forecasts WHERE symbol = ?1
                     ORDER BY created_at DESC, date_t DESC LIMIT 1",
                    [symbol],
                    |row| row.get(0),
                )
                .optional()?,
        };
        json.map(|j| decode(&j, "forecast")).transpose()
    }

    async fn append_forecast(&self, record: ForecastRecord) -> Result<()> {
        let json = serde_json::to_string(&record)?;
        let conn = self.conn.lock().await;
        let existing_locked: Option<bool> = conn
            .query_row(
                "SELECT locked FROM forecasts WHERE symbol = ?1 AND date_t = ?2 AND method = ?3",
                params![record.symbol, record.date_t.to_string(), record.method.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if existing_locked == Some(true) {
            return Err(locked_conflict(&record));
        }
        conn.execute(
            "INSERT INTO forecasts
                (id, symbol, date_t, method, created_at, locked, active, record_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(symbol, date_t, method) DO UPDATE SET
                id = excluded.id,
                created_at = excluded.created_at,
                locked = excluded.locked,
                active = excluded.active,
                record_json = excluded.record_json",
            params![
                record.id.to_string(),
                record.symbol,
                record.date_t.to_string(),
                record.method.to_string(),
                created_key(&record),
                record.locked,
                record.active,
                json,
            ],
        )
        .context("insert forecast")?;
        debug!(symbol = %record.symbol, date_t = %record.date_t, method = %record.method, "forecast stored");
        Ok(())
    }

    async fn set_active(&self, symbol: &str, date_t: NaiveDate, method: Method) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let siblings: Vec<(String, String)> = {
            let mut stmt = tx.prepare_cached(
                "SELECT id, record_json FROM forecasts WHERE symbol = ?1 AND date_t = ?2",
            )?;
            let rows = stmt
                .query_map(params![symbol, date_t.to_string()], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut found = false;
        for (id, json) in siblings {
            let mut record: ForecastRecord = decode(&json, "forecast")?;
            record.active = record.method == method;
            found |= record.active;
            tx.execute(
                "UPDATE forecasts SET active = ?1, record_json = ?2 WHERE id = ?3",
                params![record.active, serde_json::to_string(&record)?, id],
            )?;
        }
        if !found {
            anyhow::bail!("no forecast for {} {} {}", symbol, date_t, method);
        }
        tx.commit().context("commit active flag")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl EventStore for SqliteStore {
    async fn open_event(&self, symbol: &str) -> Result<Option<EventRecord>> {
        let conn = self.conn.lock().await;
        let json: Option<String> = conn
            .query_row(
                "SELECT record_json FROM events WHERE symbol = ?1 AND event_open = 1
                 ORDER BY breakout_date DESC LIMIT 1",
                [symbol],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| decode(&j, "event")).transpose()
    }

    async fn upsert_event(&self, event: EventRecord) -> Result<()> {
        let json = serde_json::to_string(&event)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO events (id, symbol, breakout_date, event_open, record_json)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                event_open = excluded.event_open,
                record_json = excluded.record_json",
            params![
                event.id.to_string(),
                event.symbol,
                event.breakout_date.to_string(),
                event.event_open,
                json,
            ],
        )
        .context("upsert event")?;
        Ok(())
    }

    async fn events(&self, symbol: &str) -> Result<Vec<EventRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT record_json FROM events WHERE symbol = ?1 ORDER BY breakout_date ASC",
        )?;
        let jsons = stmt
            .query_map([symbol], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        decode_all(jsons, "event")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        CriticalValue, Direction, Estimator, StopRule,
    };
    use chrono::{Duration, Utc};
    use tempfile::NamedTempFile;
    use uuid::Uuid;

    fn create_test_store() -> (SqliteStore, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap();
        let store = SqliteStore::new(db_path).unwrap();
        (store, temp_file)
    }

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn record(date_t: NaiveDate, method: Method) -> ForecastRecord {
        ForecastRecord {
            id: Uuid::new_v4(),
            symbol: "ABC".to_string(),
            date_t,
            method,
            horizon_trading: 1,
            horizon_calendar_days: 1,
            target_date: date_t + Duration::days(1),
            coverage: 0.95,
            spot: 100.0,
            mu_hat: 0.0,
            mu_used: 0.0,
            sigma_1d: 0.01,
            sigma2_1d: 1e-4,
            l_h: 98.0,
            u_h: 102.0,
            l_1: 98.0,
            u_1: 102.0,
            band_width_bp: Some(408.0),
            m_log: 100.0f64.ln(),
            s_scale: 0.01,
            m_log_1: 100.0f64.ln(),
            s_scale_1: 0.01,
            critical: CriticalValue::Normal { value: 1.96 },
            sigma_diagnostics: None,
            vol_percentile: Some(0.4),
            params: serde_json::json!({ "window_n": 252 }),
            conformal: None,
            locked: true,
            active: false,
            created_at: Utc::now(),
        }
    }

    fn row(date: NaiveDate, close: f64) -> CanonicalRow {
        CanonicalRow {
            date,
            open: Some(close),
            high: Some(close * 1.01),
            low: Some(close * 0.99),
            close: Some(close),
            adj_close: Some(close),
            volume: None,
            r: None,
            valid: true,
        }
    }

    #[tokio::test]
    async fn test_rows_round_trip_in_date_order() {
        let (store, _temp) = create_test_store();
        let rows = vec![row(d("2024-03-05"), 101.0), row(d("2024-03-04"), 100.0)];
        assert_eq!(store.put_rows("ABC", rows).await.unwrap(), 2);
        // re-import replaces by date
        store.put_rows("ABC", vec![row(d("2024-03-05"), 102.0)]).await.unwrap();

        let got = store.rows("ABC").await.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].date, d("2024-03-04"));
        assert_eq!(got[1].close, Some(102.0));
        assert!(store.rows("XYZ").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_target_upsert() {
        let (store, _temp) = create_test_store();
        assert!(store.target("ABC").await.unwrap().is_none());
        let mut spec = TargetSpec {
            symbol: "ABC".to_string(),
            h: 5,
            coverage: 0.95,
            exchange_tz: "America/New_York".to_string(),
        };
        store.put_target(spec.clone()).await.unwrap();
        spec.h = 10;
        store.put_target(spec.clone()).await.unwrap();
        assert_eq!(store.target("ABC").await.unwrap(), Some(spec));
    }

    #[tokio::test]
    async fn test_floored_price_domain_record_reloads() {
        use crate::conformal::conformalize_record;
        use crate::models::{
            ConformalMode, ConformalParams, ConformalState, CoverageStats, ResidualDomain,
        };

        let (store, _temp) = create_test_store();
        let base = record(d("2024-03-04"), Method::Base(Estimator::Gbm));
        store.append_forecast(base.clone()).await.unwrap();

        let state = ConformalState {
            symbol: "ABC".to_string(),
            mode: ConformalMode::Icp,
            domain: ResidualDomain::Price,
            base_method: Estimator::Gbm,
            horizon: 1,
            coverage: 0.95,
            cal_window: 60,
            params: ConformalParams::Icp { q_cal: 200.0 },
            base_coverage: CoverageStats::default(),
            calibrated_coverage: CoverageStats::default(),
        };
        let rec = conformalize_record(&base, &state, Utc::now()).unwrap();
        assert_eq!(rec.l_1, 0.0);
        assert_eq!(rec.band_width_bp, None);
        store.append_forecast(rec.clone()).await.unwrap();
        store.set_active("ABC", d("2024-03-04"), rec.method).await.unwrap();

        let all = store.forecasts("ABC").await.unwrap();
        assert_eq!(all.len(), 2);
        let got = store
            .forecast("ABC", d("2024-03-04"), rec.method)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.id, rec.id);
        assert!(got.active);
        assert_eq!(got.l_h, 0.0);
        assert_eq!(got.band_width_bp, None);
    }

    #[tokio::test]
    async fn test_forecast_lock_and_active() {
        let (store, _temp) = create_test_store();
        let gbm = Method::Base(Estimator::Gbm);
        let cqr = Method::Conformal {
            mode: crate::models::ConformalMode::Cqr,
            base: Estimator::Gbm,
        };
        let base = record(d("2024-03-04"), gbm);
        store.append_forecast(base.clone()).await.unwrap();
        assert!(
            store.append_forecast(record(d("2024-03-04"), gbm)).await.is_err(),
            "locked record must not be overwritten"
        );
        store.append_forecast(record(d("2024-03-04"), cqr)).await.unwrap();

        store.set_active("ABC", d("2024-03-04"), cqr).await.unwrap();
        let got = store.forecast("ABC", d("2024-03-04"), gbm).await.unwrap().unwrap();
        assert_eq!(got.id, base.id);
        assert!(!got.active);
        assert_eq!(got.l_h, base.l_h);
        assert_eq!(got.params, base.params);
        let active = store.forecast("ABC", d("2024-03-04"), cqr).await.unwrap().unwrap();
        assert!(active.active);

        let latest = store.latest_forecast("ABC", Some(gbm)).await.unwrap().unwrap();
        assert_eq!(latest.id, base.id);
        assert_eq!(store.forecasts("ABC").await.unwrap().len(), 2);
        assert!(store.set_active("ABC", d("2024-03-05"), gbm).await.is_err());
    }

    #[tokio::test]
    async fn test_event_upsert_and_open_lookup() {
        let (store, _temp) = create_test_store();
        let mut event = EventRecord {
            id: Uuid::new_v4(),
            symbol: "ABC".to_string(),
            breakout_date: d("2024-03-05"),
            forecast_date: d("2024-03-04"),
            direction: Direction::Up,
            z_score: 2.5,
            z_excess: 0.54,
            band_width_bp: Some(408.0),
            critical_value: 1.96,
            method: Method::Base(Estimator::Gbm),
            stop_rule: StopRule::ReEntry { k_inside: 2 },
            t_max: 20,
            at_risk_days: 0,
            inband_streak: 0,
            max_z_excess: 0.54,
            last_tick: Some(d("2024-03-05")),
            t: None,
            d_stop: None,
            stop_reason: None,
            censored: false,
            censor_reason: None,
            event_open: true,
        };
        store.upsert_event(event.clone()).await.unwrap();
        assert_eq!(store.open_event("ABC").await.unwrap(), Some(event.clone()));

        event.event_open = false;
        event.t = Some(3);
        store.upsert_event(event.clone()).await.unwrap();
        assert!(store.open_event("ABC").await.unwrap().is_none());
        let all = store.events("ABC").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].t, Some(3));
    }
}
