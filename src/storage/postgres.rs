//! Postgres-backed candle store
//!
//! One statement per upsert: the conditional `ON CONFLICT .. DO UPDATE ..
//! WHERE` encodes the monotonic-close-time merge, so concurrent writers
//! for the same key cannot interleave a partial update.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::config::DatabaseSettings;
use crate::schema::{Candle, PriceState, SeriesStats, Timeframe};

use super::{CandleStore, StoreError, StoreResult};

/// Rows per multi-value insert statement
const UPSERT_CHUNK: usize = 500;

pub struct PostgresCandleStore {
    pool: PgPool,
}

impl PostgresCandleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a pool from settings.
    pub async fn from_settings(settings: &DatabaseSettings) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&settings.url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the candles and current_prices relations if absent.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS candles (
                asset                  TEXT        NOT NULL,
                timeframe              TEXT        NOT NULL,
                open_time              TIMESTAMPTZ NOT NULL,
                close_time             TIMESTAMPTZ NOT NULL,
                open                   NUMERIC     NOT NULL,
                high                   NUMERIC     NOT NULL,
                low                    NUMERIC     NOT NULL,
                close                  NUMERIC     NOT NULL,
                volume                 NUMERIC     NOT NULL,
                quote_volume           NUMERIC     NOT NULL,
                trade_count            BIGINT      NOT NULL,
                taker_buy_base_volume  NUMERIC     NOT NULL,
                taker_buy_quote_volume NUMERIC     NOT NULL,
                PRIMARY KEY (asset, timeframe, open_time)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS current_prices (
                asset      TEXT        PRIMARY KEY,
                price      NUMERIC     NOT NULL,
                change_24h NUMERIC     NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn candle_from_row(row: &PgRow) -> StoreResult<Candle> {
        let timeframe: String = row.get("timeframe");
        let timeframe = Timeframe::from_str(&timeframe).map_err(StoreError::InvalidData)?;
        Ok(Candle {
            asset: row.get("asset"),
            timeframe,
            open_time: row.get("open_time"),
            close_time: row.get("close_time"),
            open: row.get("open"),
            high: row.get("high"),
            low: row.get("low"),
            close: row.get("close"),
            volume: row.get("volume"),
            quote_volume: row.get("quote_volume"),
            trade_count: row.get("trade_count"),
            taker_buy_base_volume: row.get("taker_buy_base_volume"),
            taker_buy_quote_volume: row.get("taker_buy_quote_volume"),
        })
    }

    async fn upsert_chunk(&self, candles: &[Candle]) -> StoreResult<usize> {
        let mut query = String::from(
            r#"
            INSERT INTO candles (
                asset, timeframe, open_time, close_time, open, high, low, close,
                volume, quote_volume, trade_count, taker_buy_base_volume, taker_buy_quote_volume
            ) VALUES
            "#,
        );

        let mut param = 1;
        for i in 0..candles.len() {
            if i > 0 {
                query.push_str(", ");
            }
            query.push('(');
            for j in 0..13 {
                if j > 0 {
                    query.push_str(", ");
                }
                query.push_str(&format!("${}", param));
                param += 1;
            }
            query.push(')');
        }

        query.push_str(
            r#"
            ON CONFLICT (asset, timeframe, open_time) DO UPDATE SET
                high = GREATEST(candles.high, EXCLUDED.high),
                low = LEAST(candles.low, EXCLUDED.low),
                close = EXCLUDED.close,
                close_time = EXCLUDED.close_time,
                volume = EXCLUDED.volume,
                quote_volume = EXCLUDED.quote_volume,
                trade_count = EXCLUDED.trade_count,
                taker_buy_base_volume = EXCLUDED.taker_buy_base_volume,
                taker_buy_quote_volume = EXCLUDED.taker_buy_quote_volume
            WHERE EXCLUDED.close_time > candles.close_time
            "#,
        );

        let mut sqlx_query = sqlx::query(&query);
        for c in candles {
            sqlx_query = sqlx_query
                .bind(&c.asset)
                .bind(c.timeframe.as_str())
                .bind(c.open_time)
                .bind(c.close_time)
                .bind(c.open)
                .bind(c.high)
                .bind(c.low)
                .bind(c.close)
                .bind(c.volume)
                .bind(c.quote_volume)
                .bind(c.trade_count)
                .bind(c.taker_buy_base_volume)
                .bind(c.taker_buy_quote_volume);
        }

        let result = sqlx_query.execute(&self.pool).await?;
        Ok(result.rows_affected() as usize)
    }
}

#[async_trait]
impl CandleStore for PostgresCandleStore {
    async fn get_candles(
        &self,
        asset: &str,
        timeframe: Timeframe,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
        limit: Option<i64>,
    ) -> StoreResult<Vec<Candle>> {
        let limit = limit.unwrap_or(100_000);
        let (start, end) = match range {
            Some((s, e)) => (Some(s), Some(e)),
            None => (None, None),
        };

        let rows = sqlx::query(
            r#"
            SELECT asset, timeframe, open_time, close_time, open, high, low, close,
                   volume, quote_volume, trade_count, taker_buy_base_volume, taker_buy_quote_volume
            FROM candles
            WHERE asset = $1 AND timeframe = $2
              AND ($3::timestamptz IS NULL OR open_time >= $3)
              AND ($4::timestamptz IS NULL OR open_time < $4)
            ORDER BY open_time ASC
            LIMIT $5
            "#,
        )
        .bind(asset)
        .bind(timeframe.as_str())
        .bind(start)
        .bind(end)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::candle_from_row).collect()
    }

    async fn get_open_times(
        &self,
        asset: &str,
        timeframe: Timeframe,
    ) -> StoreResult<Vec<DateTime<Utc>>> {
        let rows = sqlx::query(
            r#"
            SELECT open_time
            FROM candles
            WHERE asset = $1 AND timeframe = $2
            ORDER BY open_time ASC
            "#,
        )
        .bind(asset)
        .bind(timeframe.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| row.get("open_time")).collect())
    }

    async fn upsert(&self, candle: &Candle) -> StoreResult<bool> {
        let applied = self.upsert_chunk(std::slice::from_ref(candle)).await?;
        Ok(applied > 0)
    }

    async fn upsert_batch(&self, candles: &[Candle]) -> StoreResult<usize> {
        if candles.is_empty() {
            return Ok(0);
        }

        let mut applied = 0;
        for chunk in candles.chunks(UPSERT_CHUNK) {
            applied += self.upsert_chunk(chunk).await?;
        }

        debug!("upserted {} of {} candles", applied, candles.len());
        Ok(applied)
    }

    async fn delete_older_than(
        &self,
        timeframe: Timeframe,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"DELETE FROM candles WHERE timeframe = $1 AND open_time < $2"#,
        )
        .bind(timeframe.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn stats(&self) -> StoreResult<Vec<SeriesStats>> {
        let rows = sqlx::query(
            r#"
            SELECT asset, timeframe,
                   COUNT(*)::BIGINT AS count,
                   MIN(open_time) AS oldest_open_time,
                   MAX(open_time) AS newest_open_time
            FROM candles
            GROUP BY asset, timeframe
            ORDER BY asset, timeframe
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let timeframe: String = row.get("timeframe");
                let timeframe =
                    Timeframe::from_str(&timeframe).map_err(StoreError::InvalidData)?;
                Ok(SeriesStats {
                    asset: row.get("asset"),
                    timeframe,
                    count: row.get("count"),
                    oldest_open_time: row.get("oldest_open_time"),
                    newest_open_time: row.get("newest_open_time"),
                })
            })
            .collect()
    }

    async fn first_candle_at_or_after(
        &self,
        asset: &str,
        timeframe: Timeframe,
        ts: DateTime<Utc>,
    ) -> StoreResult<Option<Candle>> {
        let row = sqlx::query(
            r#"
            SELECT asset, timeframe, open_time, close_time, open, high, low, close,
                   volume, quote_volume, trade_count, taker_buy_base_volume, taker_buy_quote_volume
            FROM candles
            WHERE asset = $1 AND timeframe = $2 AND open_time >= $3
            ORDER BY open_time ASC
            LIMIT 1
            "#,
        )
        .bind(asset)
        .bind(timeframe.as_str())
        .bind(ts)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::candle_from_row).transpose()
    }

    async fn latest_candle(
        &self,
        asset: &str,
        timeframe: Timeframe,
    ) -> StoreResult<Option<Candle>> {
        let row = sqlx::query(
            r#"
            SELECT asset, timeframe, open_time, close_time, open, high, low, close,
                   volume, quote_volume, trade_count, taker_buy_base_volume, taker_buy_quote_volume
            FROM candles
            WHERE asset = $1 AND timeframe = $2
            ORDER BY open_time DESC
            LIMIT 1
            "#,
        )
        .bind(asset)
        .bind(timeframe.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::candle_from_row).transpose()
    }

    async fn upsert_price(&self, state: &PriceState) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO current_prices (asset, price, change_24h, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (asset) DO UPDATE SET
                price = EXCLUDED.price,
                change_24h = EXCLUDED.change_24h,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&state.asset)
        .bind(state.price)
        .bind(state.change_24h)
        .bind(state.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_price(&self, asset: &str) -> StoreResult<Option<PriceState>> {
        let row = sqlx::query(
            r#"SELECT asset, price, change_24h, updated_at FROM current_prices WHERE asset = $1"#,
        )
        .bind(asset)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| PriceState {
            asset: row.get("asset"),
            price: row.get("price"),
            change_24h: row.get("change_24h"),
            updated_at: row.get("updated_at"),
        }))
    }

    async fn get_all_prices(&self) -> StoreResult<Vec<PriceState>> {
        let rows = sqlx::query(
            r#"SELECT asset, price, change_24h, updated_at FROM current_prices ORDER BY asset"#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| PriceState {
                asset: row.get("asset"),
                price: row.get("price"),
                change_24h: row.get("change_24h"),
                updated_at: row.get("updated_at"),
            })
            .collect())
    }
}
