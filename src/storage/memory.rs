//! In-memory candle store
//!
//! Implements the production trait over per-series ordered maps. Used by
//! tests and offline runs; honors exactly the same merge semantics the
//! Postgres statement encodes, so property tests exercise the real rule.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::schema::{Candle, PriceState, SeriesStats, Timeframe};

use super::{CandleStore, StoreResult};

type SeriesKey = (String, Timeframe);

#[derive(Default)]
pub struct MemoryCandleStore {
    series: RwLock<HashMap<SeriesKey, BTreeMap<DateTime<Utc>, Candle>>>,
    prices: RwLock<HashMap<String, PriceState>>,
}

impl MemoryCandleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CandleStore for MemoryCandleStore {
    async fn get_candles(
        &self,
        asset: &str,
        timeframe: Timeframe,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
        limit: Option<i64>,
    ) -> StoreResult<Vec<Candle>> {
        let series = self.series.read();
        let Some(map) = series.get(&(asset.to_string(), timeframe)) else {
            return Ok(Vec::new());
        };
        let iter: Box<dyn Iterator<Item = &Candle>> = match range {
            Some((start, end)) => Box::new(map.range(start..end).map(|(_, c)| c)),
            None => Box::new(map.values()),
        };
        let candles = match limit {
            Some(n) => iter.take(n.max(0) as usize).cloned().collect(),
            None => iter.cloned().collect(),
        };
        Ok(candles)
    }

    async fn get_open_times(
        &self,
        asset: &str,
        timeframe: Timeframe,
    ) -> StoreResult<Vec<DateTime<Utc>>> {
        let series = self.series.read();
        Ok(series
            .get(&(asset.to_string(), timeframe))
            .map(|map| map.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn upsert(&self, candle: &Candle) -> StoreResult<bool> {
        let mut series = self.series.write();
        let map = series
            .entry((candle.asset.clone(), candle.timeframe))
            .or_default();
        match map.get_mut(&candle.open_time) {
            Some(stored) => Ok(stored.merge_from(candle)),
            None => {
                map.insert(candle.open_time, candle.clone());
                Ok(true)
            }
        }
    }

    async fn upsert_batch(&self, candles: &[Candle]) -> StoreResult<usize> {
        let mut applied = 0;
        for candle in candles {
            if self.upsert(candle).await? {
                applied += 1;
            }
        }
        Ok(applied)
    }

    async fn delete_older_than(
        &self,
        timeframe: Timeframe,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut deleted = 0u64;
        let mut series = self.series.write();
        for ((_, tf), map) in series.iter_mut() {
            if *tf != timeframe {
                continue;
            }
            let keep = map.split_off(&cutoff);
            deleted += map.len() as u64;
            *map = keep;
        }
        Ok(deleted)
    }

    async fn stats(&self) -> StoreResult<Vec<SeriesStats>> {
        let series = self.series.read();
        let mut stats: Vec<SeriesStats> = series
            .iter()
            .map(|((asset, tf), map)| SeriesStats {
                asset: asset.clone(),
                timeframe: *tf,
                count: map.len() as i64,
                oldest_open_time: map.keys().next().copied(),
                newest_open_time: map.keys().next_back().copied(),
            })
            .collect();
        stats.sort_by(|a, b| a.asset.cmp(&b.asset).then(a.timeframe.cmp(&b.timeframe)));
        Ok(stats)
    }

    async fn first_candle_at_or_after(
        &self,
        asset: &str,
        timeframe: Timeframe,
        ts: DateTime<Utc>,
    ) -> StoreResult<Option<Candle>> {
        let series = self.series.read();
        Ok(series
            .get(&(asset.to_string(), timeframe))
            .and_then(|map| map.range(ts..).next().map(|(_, c)| c.clone())))
    }

    async fn latest_candle(
        &self,
        asset: &str,
        timeframe: Timeframe,
    ) -> StoreResult<Option<Candle>> {
        let series = self.series.read();
        Ok(series
            .get(&(asset.to_string(), timeframe))
            .and_then(|map| map.values().next_back().cloned()))
    }

    async fn upsert_price(&self, state: &PriceState) -> StoreResult<()> {
        self.prices.write().insert(state.asset.clone(), state.clone());
        Ok(())
    }

    async fn get_price(&self, asset: &str) -> StoreResult<Option<PriceState>> {
        Ok(self.prices.read().get(asset).cloned())
    }

    async fn get_all_prices(&self) -> StoreResult<Vec<PriceState>> {
        let mut prices: Vec<PriceState> = self.prices.read().values().cloned().collect();
        prices.sort_by(|a, b| a.asset.cmp(&b.asset));
        Ok(prices)
    }
}
