//! Historical provider interface

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::AssetSpec;
use crate::schema::{Candle, Timeframe};

/// Provider error types
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProviderError {
    /// Non-success HTTP status from the historical API
    #[error("upstream error: HTTP {status}: {body}")]
    Upstream { status: u16, body: String },

    /// Payload could not be parsed into well-formed OHLCV rows. One bad
    /// row aborts the whole page; rows are never silently skipped.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("request error: {0}")]
    Request(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Paginated client for the upstream historical-candle API.
///
/// A page is ascending by open_time and at most `limit` rows long. A page
/// may be shorter than requested (range exhausted) or empty (nothing
/// available); an empty page tells the caller to stop paging that range.
#[async_trait]
pub trait HistoricalCandleProvider: Send + Sync {
    async fn fetch_page(
        &self,
        asset: &AssetSpec,
        timeframe: Timeframe,
        limit: u32,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> ProviderResult<Vec<Candle>>;

    /// Upstream clock, for drift checks
    async fn server_time(&self) -> ProviderResult<DateTime<Utc>>;
}
