//! Periodic job dispatch
//!
//! Three independent jobs: the hourly backfill pass, the 5-minute price
//! refresh, and the daily retention cleanup on the finest timeframe. A
//! job failure is logged and leaves the other jobs and future runs
//! untouched.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::backfill::BackfillCoordinator;
use crate::config::{AssetRegistry, RetentionSettings, SchedulerSettings};
use crate::price::PriceTracker;
use crate::schema::{IntervalPolicy, PolicyError, Timeframe};
use crate::storage::CandleStore;

use super::cron::{Recurrence, ScheduleSet};

const JOB_BACKFILL: &str = "backfill";
const JOB_PRICE_REFRESH: &str = "price_refresh";
const JOB_RETENTION: &str = "retention_cleanup";

const TICK: Duration = Duration::from_secs(30);

pub struct JobRunner {
    coordinator: Arc<BackfillCoordinator>,
    tracker: Arc<PriceTracker>,
    store: Arc<dyn CandleStore>,
    registry: AssetRegistry,
    /// Retention applies to the finest timeframe only
    finest: Timeframe,
    retention: RetentionSettings,
    schedules: ScheduleSet,
}

impl JobRunner {
    pub fn new(
        coordinator: Arc<BackfillCoordinator>,
        tracker: Arc<PriceTracker>,
        store: Arc<dyn CandleStore>,
        registry: AssetRegistry,
        policy: &IntervalPolicy,
        settings: &SchedulerSettings,
        retention: RetentionSettings,
    ) -> Result<Self, PolicyError> {
        let now = Utc::now();
        let schedules = ScheduleSet::new();
        schedules.add(JOB_BACKFILL, Recurrence::EveryHours(settings.backfill_interval_hours), now);
        schedules.add(
            JOB_PRICE_REFRESH,
            Recurrence::EveryMinutes(settings.price_refresh_minutes),
            now,
        );
        schedules.add(JOB_RETENTION, Recurrence::DailyAtHour(settings.cleanup_hour_utc), now);

        Ok(Self {
            coordinator,
            tracker,
            store,
            registry,
            finest: policy.finest()?,
            retention,
            schedules,
        })
    }

    /// Poll for due jobs until shutdown. Each due job runs on its own
    /// task, so a long backfill pass cannot delay the price refresh or
    /// the retention cleanup; the backfill coordinator's own busy guard
    /// protects against a pass outliving its hour.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut tick = interval(TICK);
        info!("job runner started");

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    Arc::clone(&self).dispatch_due(Utc::now());
                }
                _ = shutdown_rx.recv() => {
                    info!("job runner stopped");
                    return;
                }
            }
        }
    }

    fn dispatch_due(self: Arc<Self>, now: chrono::DateTime<Utc>) {
        for name in self.schedules.due_jobs(now) {
            self.schedules.mark_run(name, now);
            let this = Arc::clone(&self);
            tokio::spawn(async move { this.dispatch(name).await });
        }
    }

    async fn dispatch(&self, name: &'static str) {
        match name {
            JOB_BACKFILL => {
                self.coordinator.fill_all().await;
            }
            JOB_PRICE_REFRESH => {
                let refreshed = self.tracker.recompute_all(&self.registry).await;
                info!(refreshed, "price refresh complete");
            }
            JOB_RETENTION => self.run_retention().await,
            other => warn!(job = other, "unknown job name"),
        }
    }

    async fn run_retention(&self) {
        let cutoff = Utc::now() - ChronoDuration::days(self.retention.days as i64);
        match self.store.delete_older_than(self.finest, cutoff).await {
            Ok(deleted) => {
                info!(timeframe = %self.finest, %cutoff, deleted, "retention cleanup complete");
            }
            Err(e) => error!(error = %e, "retention cleanup failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use chrono::DateTime;
    use rust_decimal_macros::dec;
    use tokio::sync::Semaphore;

    use crate::config::{AssetSpec, BackfillSettings};
    use crate::provider::{HistoricalCandleProvider, ProviderResult};
    use crate::schema::{Candle, TimeframeEntry};
    use crate::storage::MemoryCandleStore;

    /// Provider whose pages never arrive until the gate opens.
    struct GatedProvider {
        gate: Semaphore,
    }

    #[async_trait]
    impl HistoricalCandleProvider for GatedProvider {
        async fn fetch_page(
            &self,
            _asset: &AssetSpec,
            _timeframe: Timeframe,
            _limit: u32,
            _range_start: DateTime<Utc>,
            _range_end: DateTime<Utc>,
        ) -> ProviderResult<Vec<Candle>> {
            let _permit = self.gate.acquire().await;
            Ok(Vec::new())
        }

        async fn server_time(&self) -> ProviderResult<DateTime<Utc>> {
            Ok(Utc::now())
        }
    }

    fn hourly_candle(open_time: DateTime<Utc>) -> Candle {
        Candle {
            asset: "BTC".to_string(),
            timeframe: Timeframe::H1,
            open_time,
            close_time: open_time + ChronoDuration::hours(1) - ChronoDuration::milliseconds(1),
            open: dec!(100),
            high: dec!(110),
            low: dec!(90),
            close: dec!(105),
            volume: dec!(10),
            quote_volume: dec!(1000),
            trade_count: 50,
            taker_buy_base_volume: dec!(5),
            taker_buy_quote_volume: dec!(500),
        }
    }

    #[tokio::test]
    async fn test_slow_backfill_does_not_delay_price_refresh() {
        let store = Arc::new(MemoryCandleStore::new());
        let registry = AssetRegistry::new(vec![AssetSpec::new("BTC", "BTCUSDT")]);
        let policy = IntervalPolicy::from_entries(&[TimeframeEntry {
            timeframe: Timeframe::H1,
            lookback_days: 7,
        }]);

        // a candle old enough to leave a trailing gap (tail must lag now
        // by more than two intervals) so the backfill pass genuinely
        // parks on the gated provider, while still giving the refresh
        // something to read
        store.upsert(&hourly_candle(Utc::now() - ChronoDuration::hours(10))).await.unwrap();

        let provider = Arc::new(GatedProvider { gate: Semaphore::new(0) });
        let coordinator = Arc::new(crate::backfill::BackfillCoordinator::new(
            store.clone(),
            provider,
            policy.clone(),
            registry.clone(),
            BackfillSettings { page_size: 2, page_pause_ms: 0, max_concurrent_pairs: 2 },
        ));
        let tracker = Arc::new(PriceTracker::new(store.clone(), &policy).unwrap());
        let runner = Arc::new(
            JobRunner::new(
                coordinator.clone(),
                tracker,
                store.clone(),
                registry,
                &policy,
                &SchedulerSettings {
                    backfill_interval_hours: 1,
                    price_refresh_minutes: 5,
                    cleanup_hour_utc: 3,
                },
                RetentionSettings { days: 30 },
            )
            .unwrap(),
        );

        // every job is overdue; the backfill pass parks on the gated
        // provider while the price refresh must still land
        Arc::clone(&runner).dispatch_due(Utc::now() + ChronoDuration::hours(2));

        let mut refreshed = false;
        for _ in 0..1000 {
            if store.get_price("BTC").await.unwrap().is_some() && coordinator.is_in_flight() {
                refreshed = true;
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(refreshed, "price refresh blocked behind the backfill pass");
    }
}
