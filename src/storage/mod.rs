//! Candle persistence
//!
//! The store is the single source of truth and the only shared resource
//! between the backfill and streaming writers. Correctness of concurrent
//! writes rests on the per-key monotonic-close-time upsert, not on any
//! external locking: `upsert` is atomic per (asset, timeframe, open_time)
//! in every implementation.

mod memory;
mod postgres;

pub use memory::MemoryCandleStore;
pub use postgres::PostgresCandleStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::schema::{Candle, PriceState, SeriesStats, Timeframe};

/// Store errors. These are never swallowed locally: a caller must know
/// when a write did not happen.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid data: {0}")]
    InvalidData(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Idempotent keyed store over (asset, timeframe, open_time).
///
/// Both ingestion paths write through `upsert`; its merge rule is the sole
/// deduplication mechanism in the system.
#[async_trait]
pub trait CandleStore: Send + Sync {
    /// Read candles ascending by open_time, optionally restricted to a
    /// half-open `[start, end)` range and/or a row limit.
    async fn get_candles(
        &self,
        asset: &str,
        timeframe: Timeframe,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
        limit: Option<i64>,
    ) -> StoreResult<Vec<Candle>>;

    /// Stored open times ascending, for gap scanning.
    async fn get_open_times(
        &self,
        asset: &str,
        timeframe: Timeframe,
    ) -> StoreResult<Vec<DateTime<Utc>>>;

    /// Insert-or-merge one candle. Applies the monotonic-close-time rule:
    /// an incoming close_time older than or equal to the stored one is a
    /// no-op. Returns whether the write was applied.
    async fn upsert(&self, candle: &Candle) -> StoreResult<bool>;

    /// Upsert a page of candles. Returns the number of applied writes.
    async fn upsert_batch(&self, candles: &[Candle]) -> StoreResult<usize>;

    /// Retention cleanup: delete rows of one timeframe with open_time
    /// before the cutoff. Returns the number of rows deleted.
    async fn delete_older_than(
        &self,
        timeframe: Timeframe,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<u64>;

    /// Per-series coverage: count, oldest and newest open_time.
    async fn stats(&self) -> StoreResult<Vec<SeriesStats>>;

    /// First candle with open_time at or after `ts` (ascending scan).
    async fn first_candle_at_or_after(
        &self,
        asset: &str,
        timeframe: Timeframe,
        ts: DateTime<Utc>,
    ) -> StoreResult<Option<Candle>>;

    /// Most recent candle of a series.
    async fn latest_candle(&self, asset: &str, timeframe: Timeframe)
        -> StoreResult<Option<Candle>>;

    /// Overwrite the current-price row for an asset wholesale.
    async fn upsert_price(&self, state: &PriceState) -> StoreResult<()>;

    async fn get_price(&self, asset: &str) -> StoreResult<Option<PriceState>>;

    async fn get_all_prices(&self) -> StoreResult<Vec<PriceState>>;
}
