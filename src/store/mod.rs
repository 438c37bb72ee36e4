//! Storage contracts consumed by the pipeline
//!
//! The engine never owns persistence; it talks to these traits. Two
//! implementations ship with the crate: an in-process [`MemoryStore`] and a
//! SQLite-backed [`SqliteStore`].

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::models::{CanonicalRow, EventRecord, ForecastRecord, Method, TargetSpec};
use anyhow::Result;
use chrono::NaiveDate;

/// Daily OHLCV series keyed by symbol, ordered by date.
#[async_trait::async_trait]
pub trait CanonicalStore: Send + Sync {
    async fn rows(&self, symbol: &str) -> Result<Vec<CanonicalRow>>;

    /// Inserts or replaces rows by date; returns the number written.
    async fn put_rows(&self, symbol: &str, rows: Vec<CanonicalRow>) -> Result<usize>;
}

#[async_trait::async_trait]
pub trait TargetStore: Send + Sync {
    async fn target(&self, symbol: &str) -> Result<Option<TargetSpec>>;
    async fn put_target(&self, spec: TargetSpec) -> Result<()>;
}

/// Forecast records keyed by `(symbol, date_t, method)`.
#[async_trait::async_trait]
pub trait ForecastStore: Send + Sync {
    /// All records for `symbol`, ordered by `(date_t, created_at)`.
    async fn forecasts(&self, symbol: &str) -> Result<Vec<ForecastRecord>>;

    async fn forecast(
        &self,
        symbol: &str,
        date_t: NaiveDate,
        method: Method,
    ) -> Result<Option<ForecastRecord>>;

    /// Most recently created record, optionally restricted to `method`.
    async fn latest_forecast(
        &self,
        symbol: &str,
        method: Option<Method>,
    ) -> Result<Option<ForecastRecord>>;

    /// Fails if a locked record already holds the same key.
    async fn append_forecast(&self, record: ForecastRecord) -> Result<()>;

    /// Marks one record active for its `(symbol, date_t)` and clears the flag
    /// on its siblings. Estimator outputs are left untouched.
    async fn set_active(&self, symbol: &str, date_t: NaiveDate, method: Method) -> Result<()>;
}

#[async_trait::async_trait]
pub trait EventStore: Send + Sync {
    async fn open_event(&self, symbol: &str) -> Result<Option<EventRecord>>;

    /// Inserts or replaces by event id.
    async fn upsert_event(&self, event: EventRecord) -> Result<()>;

    /// All events for `symbol`, ordered by breakout date.
    async fn events(&self, symbol: &str) -> Result<Vec<EventRecord>>;
}

/// Everything the pipeline needs from one backing store.
pub trait Store: CanonicalStore + TargetStore + ForecastStore + EventStore {}

impl<T> Store for T where T: CanonicalStore + TargetStore + ForecastStore + EventStore {}

pub(crate) fn locked_conflict(record: &ForecastRecord) -> anyhow::Error {
    anyhow::anyhow!(
        "locked forecast already exists for {} {} {}",
        record.symbol,
        record.date_t,
        record.method
    )
}
