//! Binance historical klines client
//!
//! Public REST endpoints only (no request signing). A governor quota keeps
//! the process-wide request weight under the exchange's published ceiling
//! regardless of how many backfill pairs are in flight.

use std::num::NonZeroU32;

use chrono::{DateTime, TimeZone, Utc};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;

use async_trait::async_trait;

use crate::config::{AssetSpec, UpstreamSettings};
use crate::schema::{Candle, Timeframe};

use super::traits::{HistoricalCandleProvider, ProviderError, ProviderResult};

const KLINES_ENDPOINT: &str = "/api/v3/klines";
const TIME_ENDPOINT: &str = "/api/v3/time";

/// Raw kline row: a fixed-position JSON array of mixed numbers and
/// decimal strings. The 12th element is an upstream placeholder.
#[derive(Debug, Deserialize)]
struct RawKline(
    i64,     // open time (ms)
    Decimal, // open
    Decimal, // high
    Decimal, // low
    Decimal, // close
    Decimal, // volume
    i64,     // close time (ms)
    Decimal, // quote asset volume
    i64,     // trade count
    Decimal, // taker buy base volume
    Decimal, // taker buy quote volume
    #[serde(default)] serde_json::Value,
);

#[derive(Debug, Deserialize)]
struct ServerTime {
    #[serde(rename = "serverTime")]
    server_time: i64,
}

pub struct BinanceHistoricalProvider {
    client: Client,
    rest_url: String,
    weight_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl BinanceHistoricalProvider {
    pub fn new(settings: &UpstreamSettings) -> ProviderResult<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| {
                ProviderError::Configuration(format!("failed to create HTTP client: {}", e))
            })?;

        let weight = NonZeroU32::new(settings.request_weight_per_minute).ok_or_else(|| {
            ProviderError::Configuration("request_weight_per_minute must be > 0".to_string())
        })?;

        Ok(Self {
            client,
            rest_url: settings.rest_url.clone(),
            weight_limiter: RateLimiter::direct(Quota::per_minute(weight)),
        })
    }

    async fn get_text(&self, url: &str) -> ProviderResult<String> {
        self.weight_limiter.until_ready().await;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Request(format!("failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(ProviderError::Upstream { status: status.as_u16(), body });
        }
        Ok(body)
    }

    fn millis_to_datetime(ms: i64) -> ProviderResult<DateTime<Utc>> {
        Utc.timestamp_millis_opt(ms).single().ok_or_else(|| {
            ProviderError::MalformedResponse(format!("timestamp out of range: {}", ms))
        })
    }

    fn candle_from_raw(
        asset: &AssetSpec,
        timeframe: Timeframe,
        raw: &RawKline,
    ) -> ProviderResult<Candle> {
        let candle = Candle {
            asset: asset.name.clone(),
            timeframe,
            open_time: Self::millis_to_datetime(raw.0)?,
            close_time: Self::millis_to_datetime(raw.6)?,
            open: raw.1,
            high: raw.2,
            low: raw.3,
            close: raw.4,
            volume: raw.5,
            quote_volume: raw.7,
            trade_count: raw.8,
            taker_buy_base_volume: raw.9,
            taker_buy_quote_volume: raw.10,
        };

        if !candle.is_well_formed() {
            return Err(ProviderError::MalformedResponse(format!(
                "ill-formed kline for {} at {}",
                asset.symbol, candle.open_time
            )));
        }
        Ok(candle)
    }
}

#[async_trait]
impl HistoricalCandleProvider for BinanceHistoricalProvider {
    async fn fetch_page(
        &self,
        asset: &AssetSpec,
        timeframe: Timeframe,
        limit: u32,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> ProviderResult<Vec<Candle>> {
        let url = format!(
            "{}{}?symbol={}&interval={}&limit={}&startTime={}&endTime={}",
            self.rest_url,
            KLINES_ENDPOINT,
            asset.symbol,
            timeframe,
            limit,
            range_start.timestamp_millis(),
            range_end.timestamp_millis(),
        );

        debug!(symbol = %asset.symbol, %timeframe, limit, "fetching klines page");

        let body = self.get_text(&url).await?;
        let raw: Vec<RawKline> = serde_json::from_str(&body)
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        let mut candles = raw
            .iter()
            .map(|r| Self::candle_from_raw(asset, timeframe, r))
            .collect::<ProviderResult<Vec<Candle>>>()?;
        candles.sort_by_key(|c| c.open_time);

        Ok(candles)
    }

    async fn server_time(&self) -> ProviderResult<DateTime<Utc>> {
        let url = format!("{}{}", self.rest_url, TIME_ENDPOINT);
        let body = self.get_text(&url).await?;
        let parsed: ServerTime = serde_json::from_str(&body)
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;
        Self::millis_to_datetime(parsed.server_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn asset() -> AssetSpec {
        AssetSpec::new("BTC", "BTCUSDT")
    }

    #[test]
    fn test_parse_kline_row() {
        let body = r#"[
            [1700000000000, "100.0", "110.5", "99.1", "105.2", "12.5",
             1700000299999, "1300.7", 42, "6.1", "640.2", "0"]
        ]"#;
        let raw: Vec<RawKline> = serde_json::from_str(body).unwrap();
        assert_eq!(raw.len(), 1);

        let candle =
            BinanceHistoricalProvider::candle_from_raw(&asset(), Timeframe::M5, &raw[0]).unwrap();
        assert_eq!(candle.asset, "BTC");
        assert_eq!(candle.open, dec!(100.0));
        assert_eq!(candle.high, dec!(110.5));
        assert_eq!(candle.low, dec!(99.1));
        assert_eq!(candle.close, dec!(105.2));
        assert_eq!(candle.trade_count, 42);
        assert!(candle.close_time > candle.open_time);
    }

    #[test]
    fn test_row_missing_fields_is_malformed() {
        let body = r#"[[1700000000000, "100.0", "110.5"]]"#;
        let parsed: Result<Vec<RawKline>, _> = serde_json::from_str(body);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_inconsistent_ohlc_is_malformed() {
        // high below close: structurally invalid, whole page aborts
        let body = r#"[
            [1700000000000, "100.0", "101.0", "99.0", "105.0", "12.5",
             1700000299999, "1300.7", 42, "6.1", "640.2", "0"]
        ]"#;
        let raw: Vec<RawKline> = serde_json::from_str(body).unwrap();
        let result = BinanceHistoricalProvider::candle_from_raw(&asset(), Timeframe::M5, &raw[0]);
        assert!(matches!(result, Err(ProviderError::MalformedResponse(_))));
    }

    #[test]
    fn test_out_of_range_timestamp_is_malformed() {
        assert!(BinanceHistoricalProvider::millis_to_datetime(i64::MAX).is_err());
        assert!(BinanceHistoricalProvider::millis_to_datetime(1700000000000).is_ok());
    }
}
