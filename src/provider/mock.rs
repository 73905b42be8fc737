//! Scripted provider for backfill tests

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::config::AssetSpec;
use crate::schema::{Candle, Timeframe};

use super::traits::{HistoricalCandleProvider, ProviderError, ProviderResult};

/// A recorded fetch_page call
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub asset: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub limit: u32,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
}

/// Returns pre-scripted pages in order and records every request.
/// Once the script runs out, further calls return empty pages.
#[derive(Default)]
pub struct MockHistoricalProvider {
    pages: Mutex<VecDeque<ProviderResult<Vec<Candle>>>>,
    requests: Mutex<Vec<PageRequest>>,
    server_time: Mutex<Option<DateTime<Utc>>>,
}

impl MockHistoricalProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_page(&self, page: Vec<Candle>) {
        self.pages.lock().push_back(Ok(page));
    }

    pub fn push_error(&self, error: ProviderError) {
        self.pages.lock().push_back(Err(error));
    }

    pub fn set_server_time(&self, time: DateTime<Utc>) {
        *self.server_time.lock() = Some(time);
    }

    pub fn requests(&self) -> Vec<PageRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl HistoricalCandleProvider for MockHistoricalProvider {
    async fn fetch_page(
        &self,
        asset: &AssetSpec,
        timeframe: Timeframe,
        limit: u32,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> ProviderResult<Vec<Candle>> {
        self.requests.lock().push(PageRequest {
            asset: asset.name.clone(),
            symbol: asset.symbol.clone(),
            timeframe,
            limit,
            range_start,
            range_end,
        });

        match self.pages.lock().pop_front() {
            Some(page) => page,
            None => Ok(Vec::new()),
        }
    }

    async fn server_time(&self) -> ProviderResult<DateTime<Utc>> {
        match *self.server_time.lock() {
            Some(time) => Ok(time),
            None => Ok(Utc::now()),
        }
    }
}
