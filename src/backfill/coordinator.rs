//! Gap-driven historical backfill
//!
//! Three layers: `fill_gap` pages one missing range from the provider into
//! the store, `fill_asset` repairs every configured series of one asset,
//! and `fill_all` fans out over all (asset, timeframe) pairs with a
//! concurrency cap. `fill_all` is drop-on-busy: a pass that starts while a
//! previous one is still running does nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::{AssetRegistry, AssetSpec, BackfillSettings};
use crate::gaps::{Gap, GapDetector, ScanError};
use crate::provider::HistoricalCandleProvider;
use crate::schema::{IntervalPolicy, Timeframe};
use crate::storage::{CandleStore, StoreError};

use super::{AssetFillReport, BackfillError, GapFillReport, PairReport};

pub struct BackfillCoordinator {
    store: Arc<dyn CandleStore>,
    provider: Arc<dyn HistoricalCandleProvider>,
    detector: GapDetector,
    policy: IntervalPolicy,
    registry: AssetRegistry,
    settings: BackfillSettings,
    pair_limit: Arc<Semaphore>,
    in_flight: AtomicBool,
}

impl BackfillCoordinator {
    pub fn new(
        store: Arc<dyn CandleStore>,
        provider: Arc<dyn HistoricalCandleProvider>,
        policy: IntervalPolicy,
        registry: AssetRegistry,
        settings: BackfillSettings,
    ) -> Self {
        let pair_limit = Arc::new(Semaphore::new(settings.max_concurrent_pairs.max(1)));
        Self {
            store,
            provider,
            detector: GapDetector::new(policy.clone()),
            policy,
            registry,
            settings,
            pair_limit,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Fill one gap of one series by paging the provider forward from the
    /// gap start until the range is covered or a page comes back empty.
    ///
    /// Store failures abort the fill; provider failures end the fill early
    /// and are carried in the report, since the next scheduled pass will
    /// re-detect whatever remains missing.
    pub async fn fill_gap(
        &self,
        asset: &AssetSpec,
        timeframe: Timeframe,
        gap: &Gap,
    ) -> Result<GapFillReport, BackfillError> {
        let mut report = GapFillReport::default();
        let mut cursor = gap.start;

        debug!(
            asset = %asset.name, %timeframe,
            start = %gap.start, end = %gap.end,
            missing = gap.missing_intervals, "filling gap"
        );

        while cursor <= gap.end {
            let page = match self
                .provider
                .fetch_page(asset, timeframe, self.settings.page_size, cursor, gap.end)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    warn!(asset = %asset.name, %timeframe, error = %e, "page fetch failed");
                    report.errors.push(e.to_string());
                    break;
                }
            };

            let Some(last) = page.last() else {
                break;
            };

            // advance past the last bar before writing so a partial batch
            // failure cannot stall the cursor
            let next_cursor = last.close_time + ChronoDuration::milliseconds(1);
            report.candles_filled += self.store.upsert_batch(&page).await?;
            report.pages_fetched += 1;
            cursor = next_cursor;

            if cursor <= gap.end {
                sleep(Duration::from_millis(self.settings.page_pause_ms)).await;
            }
        }

        Ok(report)
    }

    /// Scan and repair every configured timeframe of one asset, gaps in
    /// chronological order within each series.
    pub async fn fill_asset(&self, asset: &AssetSpec) -> Result<AssetFillReport, BackfillError> {
        let mut report = AssetFillReport { asset: asset.name.clone(), pairs: Vec::new() };

        for timeframe in self.policy.timeframes() {
            report.pairs.push(self.fill_pair(asset, timeframe).await?);
        }
        Ok(report)
    }

    async fn fill_pair(
        &self,
        asset: &AssetSpec,
        timeframe: Timeframe,
    ) -> Result<PairReport, BackfillError> {
        let gaps = self.detector.scan(self.store.as_ref(), &asset.name, timeframe).await?;
        let mut report = PairReport {
            asset: asset.name.clone(),
            timeframe,
            gaps_found: gaps.len(),
            candles_filled: 0,
            errors: Vec::new(),
        };

        for gap in &gaps {
            let gap_report = self.fill_gap(asset, timeframe, gap).await?;
            report.candles_filled += gap_report.candles_filled;
            report.errors.extend(gap_report.errors);
        }

        if report.candles_filled > 0 {
            info!(
                asset = %asset.name, %timeframe,
                gaps = report.gaps_found, filled = report.candles_filled,
                "series backfilled"
            );
        }
        Ok(report)
    }

    /// One full backfill pass over every (asset, timeframe) pair.
    ///
    /// At most `max_concurrent_pairs` pairs run at once. If a previous pass
    /// is still in flight the call is dropped and returns no reports.
    pub async fn fill_all(self: &Arc<Self>) -> Vec<PairReport> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("backfill pass already in flight, skipping");
            return Vec::new();
        }

        let mut handles = Vec::new();
        for asset in self.registry.assets().iter().cloned() {
            for timeframe in self.policy.timeframes() {
                let this = Arc::clone(self);
                let asset = asset.clone();
                handles.push(tokio::spawn(async move {
                    // closed only on shutdown; a closed semaphore means the
                    // pass should produce nothing for this pair
                    let _permit = this.pair_limit.acquire().await.ok()?;
                    let report = match this.fill_pair(&asset, timeframe).await {
                        Ok(report) => report,
                        // a failed pair still shows up in the pass result
                        // so operators can see which series are incomplete
                        Err(e) => {
                            error!(asset = %asset.name, %timeframe, error = %e,
                                "pair backfill failed");
                            PairReport {
                                asset: asset.name.clone(),
                                timeframe,
                                gaps_found: 0,
                                candles_filled: 0,
                                errors: vec![e.to_string()],
                            }
                        }
                    };
                    Some(report)
                }));
            }
        }

        let mut reports = Vec::new();
        for outcome in join_all(handles).await {
            match outcome {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {}
                Err(e) => error!(error = %e, "backfill task panicked"),
            }
        }

        self.in_flight.store(false, Ordering::Release);

        let filled: usize = reports.iter().map(|r| r.candles_filled).sum();
        info!(pairs = reports.len(), filled, "backfill pass complete");
        reports
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

impl From<ScanError> for BackfillError {
    fn from(e: ScanError) -> Self {
        match e {
            ScanError::Store(e) => BackfillError::Store(e),
            ScanError::Policy(e) => BackfillError::Policy(e),
        }
    }
}

impl From<StoreError> for BackfillError {
    fn from(e: StoreError) -> Self {
        BackfillError::Store(e)
    }
}
