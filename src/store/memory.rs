//! In-process store behind `parking_lot` locks.

use super::{locked_conflict, CanonicalStore, EventStore, ForecastStore, TargetStore};
use crate::models::{CanonicalRow, EventRecord, ForecastRecord, Method, TargetSpec};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: RwLock<HashMap<String, BTreeMap<NaiveDate, CanonicalRow>>>,
    targets: RwLock<HashMap<String, TargetSpec>>,
    forecasts: RwLock<HashMap<String, Vec<ForecastRecord>>>,
    events: RwLock<HashMap<String, Vec<EventRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CanonicalStore for MemoryStore {
    async fn rows(&self, symbol: &str) -> Result<Vec<CanonicalRow>> {
        Ok(self
            .rows
            .read()
            .get(symbol)
            .map(|by_date| by_date.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn put_rows(&self, symbol: &str, rows: Vec<CanonicalRow>) -> Result<usize> {
        let n = rows.len();
        let mut guard = self.rows.write();
        let by_date = guard.entry(symbol.to_string()).or_default();
        for row in rows {
            by_date.insert(row.date, row);
        }
        Ok(n)
    }
}

#[async_trait::async_trait]
impl TargetStore for MemoryStore {
    async fn target(&self, symbol: &str) -> Result<Option<TargetSpec>> {
        Ok(self.targets.read().get(symbol).cloned())
    }

    async fn put_target(&self, spec: TargetSpec) -> Result<()> {
        self.targets.write().insert(spec.symbol.clone(), spec);
        Ok(())
    }
}

#[async_trait::async_trait]
impl ForecastStore for MemoryStore {
    async fn forecasts(&self, symbol: &str) -> Result<Vec<ForecastRecord>> {
        let mut out = self
            .forecasts
            .read()
            .get(symbol)
            .cloned()
            .unwrap_or_default();
        out.sort_by_key(|f| (f.date_t, f.created_at));
        Ok(out)
    }

    async fn forecast(
        &self,
        symbol: &str,
        date_t: NaiveDate,
        method: Method,
    ) -> Result<Option<ForecastRecord>> {
        Ok(self.forecasts.read().get(symbol).and_then(|all| {
            all.iter()
                .find(|f| f.date_t == date_t && f.method == method)
                .cloned()
        }))
    }

    async fn latest_forecast(
        &self,
        symbol: &str,
        method: Option<Method>,
    ) -> Result<Option<ForecastRecord>> {
        Ok(self.forecasts.read().get(symbol).and_then(|all| {
            all.iter()
                .filter(|f| method.map_or(true, |m| f.method == m))
                .max_by_key(|f| (f.created_at, f.date_t))
                .cloned()
        }))
    }

    async fn append_forecast(&self, record: ForecastRecord) -> Result<()> {
        let mut guard = self.forecasts.write();
        let all = guard.entry(record.symbol.clone()).or_default();
        match all
            .iter_mut()
            .find(|f| f.date_t == record.date_t && f.method == record.method)
        {
            Some(existing) if existing.locked => return Err(locked_conflict(&record)),
            Some(existing) => *existing = record,
            None => all.push(record),
        }
        Ok(())
    }

    async fn set_active(&self, symbol: &str, date_t: NaiveDate, method: Method) -> Result<()> {
        let mut guard = self.forecasts.write();
        let all = guard
            .get_mut(symbol)
            .with_context(|| format!("no forecasts for {}", symbol))?;
        if !all.iter().any(|f| f.date_t == date_t && f.method == method) {
            anyhow::bail!("no forecast for {} {} {}", symbol, date_t, method);
        }
        for f in all.iter_mut().filter(|f| f.date_t == date_t) {
            f.active = f.method == method;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl EventStore for MemoryStore {
    async fn open_event(&self, symbol: &str) -> Result<Option<EventRecord>> {
        Ok(self
            .events
            .read()
            .get(symbol)
            .and_then(|all| all.iter().find(|e| e.event_open).cloned()))
    }

    async fn upsert_event(&self, event: EventRecord) -> Result<()> {
        let mut guard = self.events.write();
        let all = guard.entry(event.symbol.clone()).or_default();
        match all.iter_mut().find(|e| e.id == event.id) {
            Some(existing) => *existing = event,
            None => {
                all.push(event);
                all.sort_by_key(|e| e.breakout_date);
            }
        }
        Ok(())
    }

    async fn events(&self, symbol: &str) -> Result<Vec<EventRecord>> {
        Ok(self.events.read().get(symbol).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CriticalValue, Estimator};
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn record(symbol: &str, date_t: NaiveDate, method: Method) -> ForecastRecord {
        ForecastRecord {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
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
            vol_percentile: None,
            params: serde_json::Value::Null,
            conformal: None,
            locked: true,
            active: false,
            created_at: Utc::now(),
        }
    }

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_locked_record_is_not_overwritten() {
        let store = MemoryStore::new();
        let m = Method::Base(Estimator::Gbm);
        let first = record("ABC", d("2024-03-04"), m);
        let first_id = first.id;
        store.append_forecast(first).await.unwrap();

        let mut second = record("ABC", d("2024-03-04"), m);
        second.l_h = 1.0;
        assert!(store.append_forecast(second).await.is_err());

        let kept = store.forecast("ABC", d("2024-03-04"), m).await.unwrap().unwrap();
        assert_eq!(kept.id, first_id);
        assert_eq!(kept.l_h, 98.0);
    }

    #[tokio::test]
    async fn test_unlocked_record_is_replaced() {
        let store = MemoryStore::new();
        let m = Method::Base(Estimator::HarRv);
        let mut draft = record("ABC", d("2024-03-04"), m);
        draft.locked = false;
        store.append_forecast(draft).await.unwrap();
        let final_rec = record("ABC", d("2024-03-04"), m);
        let id = final_rec.id;
        store.append_forecast(final_rec).await.unwrap();
        assert_eq!(store.forecasts("ABC").await.unwrap().len(), 1);
        assert_eq!(store.forecast("ABC", d("2024-03-04"), m).await.unwrap().unwrap().id, id);
    }

    #[tokio::test]
    async fn test_set_active_is_exclusive_per_date() {
        let store = MemoryStore::new();
        let gbm = Method::Base(Estimator::Gbm);
        let har = Method::Base(Estimator::HarRv);
        store.append_forecast(record("ABC", d("2024-03-04"), gbm)).await.unwrap();
        store.append_forecast(record("ABC", d("2024-03-04"), har)).await.unwrap();

        store.set_active("ABC", d("2024-03-04"), gbm).await.unwrap();
        store.set_active("ABC", d("2024-03-04"), har).await.unwrap();

        let all = store.forecasts("ABC").await.unwrap();
        let active: Vec<_> = all.iter().filter(|f| f.active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].method, har);
        assert!(store.set_active("ABC", d("2024-03-05"), har).await.is_err());
    }

    #[tokio::test]
    async fn test_latest_filters_by_method() {
        let store = MemoryStore::new();
        let gbm = Method::Base(Estimator::Gbm);
        let har = Method::Base(Estimator::HarRv);
        let mut older = record("ABC", d("2024-03-05"), gbm);
        older.created_at = Utc::now() - Duration::hours(1);
        store.append_forecast(older).await.unwrap();
        store.append_forecast(record("ABC", d("2024-03-04"), har)).await.unwrap();

        let latest = store.latest_forecast("ABC", None).await.unwrap().unwrap();
        assert_eq!(latest.method, har);
        let latest_gbm = store.latest_forecast("ABC", Some(gbm)).await.unwrap().unwrap();
        assert_eq!(latest_gbm.date_t, d("2024-03-05"));
        assert!(store.latest_forecast("XYZ", None).await.unwrap().is_none());
    }
}
