//! Latest price and trailing 24h change per asset
//!
//! Derived entirely from the candle store: the 24h reference point is the
//! first finest-timeframe candle at or after `now - 24h`. States are
//! overwritten wholesale, both in the store and in the in-process cache.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::config::AssetRegistry;
use crate::schema::{IntervalPolicy, PolicyError, PriceState, Timeframe};
use crate::storage::{CandleStore, StoreResult};

pub struct PriceTracker {
    store: Arc<dyn CandleStore>,
    /// Reference lookups always use the finest configured timeframe
    finest: Timeframe,
    states: DashMap<String, PriceState>,
}

impl PriceTracker {
    pub fn new(store: Arc<dyn CandleStore>, policy: &IntervalPolicy) -> Result<Self, PolicyError> {
        Ok(Self { store, finest: policy.finest()?, states: DashMap::new() })
    }

    /// Record a new live price for an asset and recompute its 24h change.
    pub async fn on_new_price(&self, asset: &str, price: Decimal) -> StoreResult<PriceState> {
        self.on_new_price_at(asset, price, Utc::now()).await
    }

    /// Clock-injected variant of [`on_new_price`](Self::on_new_price).
    ///
    /// A missing reference candle and a non-positive reference close both
    /// degrade the change to zero; neither is an error.
    pub async fn on_new_price_at(
        &self,
        asset: &str,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> StoreResult<PriceState> {
        let anchor = now - Duration::hours(24);
        let reference = self.store.first_candle_at_or_after(asset, self.finest, anchor).await?;

        let change_24h = match reference {
            Some(ref c) if c.close > Decimal::ZERO => {
                (price - c.close) / c.close * Decimal::from(100)
            }
            _ => Decimal::ZERO,
        };

        let state = PriceState { asset: asset.to_string(), price, change_24h, updated_at: now };
        self.store.upsert_price(&state).await?;
        self.states.insert(asset.to_string(), state.clone());
        Ok(state)
    }

    /// Periodic refresh independent of live ticks: recompute every asset's
    /// state from its most recent stored candle. Assets with no data yet
    /// are skipped; a store failure for one asset does not stop the rest.
    pub async fn recompute_all(&self, registry: &AssetRegistry) -> usize {
        let mut refreshed = 0;
        for asset in registry.assets() {
            let latest = match self.store.latest_candle(&asset.name, self.finest).await {
                Ok(Some(candle)) => candle,
                Ok(None) => {
                    debug!(asset = %asset.name, "no candles yet, skipping price refresh");
                    continue;
                }
                Err(e) => {
                    warn!(asset = %asset.name, error = %e, "price refresh read failed");
                    continue;
                }
            };

            match self.on_new_price(&asset.name, latest.close).await {
                Ok(_) => refreshed += 1,
                Err(e) => warn!(asset = %asset.name, error = %e, "price refresh write failed"),
            }
        }
        refreshed
    }

    /// Last state computed in this process, if any.
    pub fn cached(&self, asset: &str) -> Option<PriceState> {
        self.states.get(asset).map(|s| s.clone())
    }

    pub fn all_cached(&self) -> Vec<PriceState> {
        self.states.iter().map(|s| s.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Candle, Timeframe, TimeframeEntry};
    use crate::storage::MemoryCandleStore;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn policy() -> IntervalPolicy {
        IntervalPolicy::from_entries(&[
            TimeframeEntry { timeframe: Timeframe::M5, lookback_days: 1 },
            TimeframeEntry { timeframe: Timeframe::H1, lookback_days: 7 },
        ])
    }

    fn candle_at(open_time: DateTime<Utc>, close: Decimal) -> Candle {
        Candle {
            asset: "BTC".to_string(),
            timeframe: Timeframe::M5,
            open_time,
            close_time: open_time + Duration::minutes(5) - Duration::milliseconds(1),
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(1),
            quote_volume: dec!(1),
            trade_count: 1,
            taker_buy_base_volume: dec!(0),
            taker_buy_quote_volume: dec!(0),
        }
    }

    #[tokio::test]
    async fn test_change_against_24h_reference() {
        let store = Arc::new(MemoryCandleStore::new());
        let now = Utc.with_ymd_and_hms(2024, 6, 2, 12, 0, 0).unwrap();
        // reference candle 5 minutes after the anchor, close = 100
        store.upsert(&candle_at(now - Duration::hours(24) + Duration::minutes(5), dec!(100)))
            .await
            .unwrap();

        let tracker = PriceTracker::new(store, &policy()).unwrap();
        let state = tracker.on_new_price_at("BTC", dec!(110), now).await.unwrap();
        assert_eq!(state.change_24h, dec!(10));
        assert_eq!(state.price, dec!(110));
        assert_eq!(tracker.cached("BTC").unwrap().change_24h, dec!(10));
    }

    #[tokio::test]
    async fn test_no_reference_degrades_to_zero() {
        let store = Arc::new(MemoryCandleStore::new());
        let tracker = PriceTracker::new(store, &policy()).unwrap();
        let state = tracker.on_new_price("BTC", dec!(110)).await.unwrap();
        assert_eq!(state.change_24h, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_zero_close_degrades_to_zero() {
        let store = Arc::new(MemoryCandleStore::new());
        let now = Utc.with_ymd_and_hms(2024, 6, 2, 12, 0, 0).unwrap();
        store.upsert(&candle_at(now - Duration::hours(23), dec!(0))).await.unwrap();

        let tracker = PriceTracker::new(store, &policy()).unwrap();
        let state = tracker.on_new_price_at("BTC", dec!(110), now).await.unwrap();
        assert_eq!(state.change_24h, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_recompute_all_uses_latest_close() {
        let store = Arc::new(MemoryCandleStore::new());
        let now = Utc::now();
        store.upsert(&candle_at(now - Duration::hours(23), dec!(100))).await.unwrap();
        store.upsert(&candle_at(now - Duration::minutes(5), dec!(105))).await.unwrap();

        let registry = AssetRegistry::new(vec![
            crate::config::AssetSpec::new("BTC", "BTCUSDT"),
            crate::config::AssetSpec::new("ETH", "ETHUSDT"),
        ]);

        let tracker = PriceTracker::new(store.clone(), &policy()).unwrap();
        // ETH has no candles and is skipped, not an error
        let refreshed = tracker.recompute_all(&registry).await;
        assert_eq!(refreshed, 1);

        let state = store.get_price("BTC").await.unwrap().unwrap();
        assert_eq!(state.price, dec!(105));
        assert_eq!(state.change_24h, dec!(5));
        assert!(store.get_price("ETH").await.unwrap().is_none());
    }
}
