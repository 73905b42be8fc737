//! Application settings
//!
//! Layered configuration: a default file, a RUN_MODE-specific file, a local
//! override file, then `CANDLE_MANAGER__*` environment variables.

use std::collections::HashMap;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::schema::{IntervalPolicy, Timeframe, TimeframeEntry};

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database: DatabaseSettings,
    #[serde(default)]
    pub upstream: UpstreamSettings,
    /// Tradable assets with their upstream symbol mapping
    #[serde(default = "default_assets")]
    pub assets: Vec<AssetSpec>,
    /// Configured timeframes with bootstrap lookback windows
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<TimeframeEntry>,
    #[serde(default)]
    pub backfill: BackfillSettings,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub retention: RetentionSettings,
}

/// Database connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// PostgreSQL connection URL
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

/// One tracked asset and its upstream exchange symbol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetSpec {
    /// Canonical asset name used as the store key (e.g. "BTC")
    pub name: String,
    /// Upstream symbol (e.g. "BTCUSDT")
    pub symbol: String,
}

impl AssetSpec {
    pub fn new(name: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self { name: name.into(), symbol: symbol.into() }
    }

    /// Combined-stream segment for the kline subscription
    pub fn stream_name(&self, timeframe: Timeframe) -> String {
        format!("{}@kline_{}", self.symbol.to_lowercase(), timeframe)
    }
}

/// Upstream exchange endpoints and limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSettings {
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// Client-side request-weight ceiling, kept under the exchange's
    /// published 1200/min
    #[serde(default = "default_weight_per_minute")]
    pub request_weight_per_minute: u32,
}

fn default_rest_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_ws_url() -> String {
    "wss://stream.binance.com:9443".to_string()
}

fn default_weight_per_minute() -> u32 {
    1100
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            rest_url: default_rest_url(),
            ws_url: default_ws_url(),
            request_weight_per_minute: default_weight_per_minute(),
        }
    }
}

/// Backfill pacing and fan-out settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillSettings {
    /// Maximum rows per historical page request
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Fixed pause between page requests within one gap
    #[serde(default = "default_page_pause_ms")]
    pub page_pause_ms: u64,
    /// Concurrency limit across (asset, timeframe) pairs in one pass
    #[serde(default = "default_max_concurrent_pairs")]
    pub max_concurrent_pairs: usize,
}

fn default_page_size() -> u32 {
    1000
}

fn default_page_pause_ms() -> u64 {
    100
}

fn default_max_concurrent_pairs() -> usize {
    4
}

impl Default for BackfillSettings {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            page_pause_ms: default_page_pause_ms(),
            max_concurrent_pairs: default_max_concurrent_pairs(),
        }
    }
}

/// Live stream settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Delay before each reconnect attempt
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self { reconnect_delay_secs: default_reconnect_delay_secs() }
    }
}

/// Periodic trigger settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_backfill_interval_hours")]
    pub backfill_interval_hours: u32,
    #[serde(default = "default_price_refresh_minutes")]
    pub price_refresh_minutes: u32,
    /// UTC hour of the daily retention cleanup
    #[serde(default = "default_cleanup_hour_utc")]
    pub cleanup_hour_utc: u32,
}

fn default_backfill_interval_hours() -> u32 {
    1
}

fn default_price_refresh_minutes() -> u32 {
    5
}

fn default_cleanup_hour_utc() -> u32 {
    3
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            backfill_interval_hours: default_backfill_interval_hours(),
            price_refresh_minutes: default_price_refresh_minutes(),
            cleanup_hour_utc: default_cleanup_hour_utc(),
        }
    }
}

/// Retention policy for the finest timeframe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionSettings {
    #[serde(default = "default_retention_days")]
    pub days: u32,
}

fn default_retention_days() -> u32 {
    30
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self { days: default_retention_days() }
    }
}

fn default_assets() -> Vec<AssetSpec> {
    vec![AssetSpec::new("BTC", "BTCUSDT"), AssetSpec::new("ETH", "ETHUSDT")]
}

fn default_timeframes() -> Vec<TimeframeEntry> {
    vec![
        TimeframeEntry { timeframe: Timeframe::M5, lookback_days: 1 },
        TimeframeEntry { timeframe: Timeframe::H1, lookback_days: 7 },
        TimeframeEntry { timeframe: Timeframe::D1, lookback_days: 90 },
    ]
}

impl Settings {
    /// Load settings from configuration files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_prefix("CANDLE_MANAGER")
    }

    /// Load settings with a custom environment variable prefix
    pub fn load_with_prefix(env_prefix: &str) -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());
        let config_dir = Self::config_dir();

        let s = Config::builder()
            .add_source(File::with_name(&format!("{}/default", config_dir)).required(false))
            .add_source(File::with_name(&format!("{}/{}", config_dir, run_mode)).required(false))
            .add_source(File::with_name(&format!("{}/local", config_dir)).required(false))
            .add_source(
                Environment::with_prefix(env_prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        s.try_deserialize()
    }

    fn config_dir() -> String {
        std::env::var("CANDLE_MANAGER_CONFIG_DIR").unwrap_or_else(|_| "config".into())
    }

    /// Interval policy built from the configured timeframe table
    pub fn interval_policy(&self) -> IntervalPolicy {
        IntervalPolicy::from_entries(&self.timeframes)
    }

    /// Asset registry with both lookup directions
    pub fn asset_registry(&self) -> AssetRegistry {
        AssetRegistry::new(self.assets.clone())
    }

    /// Default settings (useful for tests and offline runs)
    pub fn default_settings() -> Self {
        Settings {
            database: DatabaseSettings {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "postgresql://localhost/candle_manager".into()),
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
            },
            upstream: UpstreamSettings::default(),
            assets: default_assets(),
            timeframes: default_timeframes(),
            backfill: BackfillSettings::default(),
            stream: StreamSettings::default(),
            scheduler: SchedulerSettings::default(),
            retention: RetentionSettings::default(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::default_settings()
    }
}

/// Configured assets, indexable by canonical name and by upstream symbol
#[derive(Debug, Clone)]
pub struct AssetRegistry {
    assets: Vec<AssetSpec>,
    by_name: HashMap<String, usize>,
    by_symbol: HashMap<String, usize>,
}

impl AssetRegistry {
    pub fn new(assets: Vec<AssetSpec>) -> Self {
        let by_name = assets
            .iter()
            .enumerate()
            .map(|(i, a)| (a.name.clone(), i))
            .collect();
        let by_symbol = assets
            .iter()
            .enumerate()
            .map(|(i, a)| (a.symbol.to_uppercase(), i))
            .collect();
        Self { assets, by_name, by_symbol }
    }

    pub fn assets(&self) -> &[AssetSpec] {
        &self.assets
    }

    pub fn get(&self, name: &str) -> Option<&AssetSpec> {
        self.by_name.get(name).map(|&i| &self.assets[i])
    }

    /// Reverse lookup for inbound stream events; symbols compare
    /// case-insensitively.
    pub fn by_symbol(&self, symbol: &str) -> Option<&AssetSpec> {
        self.by_symbol
            .get(&symbol.to_uppercase())
            .map(|&i| &self.assets[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default_settings();
        assert_eq!(settings.database.max_connections, 10);
        assert_eq!(settings.backfill.page_size, 1000);
        assert_eq!(settings.backfill.page_pause_ms, 100);
        assert_eq!(settings.stream.reconnect_delay_secs, 5);
        assert_eq!(settings.retention.days, 30);
    }

    #[test]
    fn test_interval_policy_from_settings() {
        let settings = Settings::default_settings();
        let policy = settings.interval_policy();
        assert!(policy.contains(Timeframe::M5));
        assert!(policy.contains(Timeframe::H1));
        assert!(policy.contains(Timeframe::D1));
        assert_eq!(policy.finest().unwrap(), Timeframe::M5);
    }

    #[test]
    fn test_asset_registry_lookups() {
        let registry = Settings::default_settings().asset_registry();
        assert_eq!(registry.get("BTC").unwrap().symbol, "BTCUSDT");
        assert_eq!(registry.by_symbol("btcusdt").unwrap().name, "BTC");
        assert!(registry.by_symbol("DOGEUSDT").is_none());
        assert!(registry.get("DOGE").is_none());
    }

    #[test]
    fn test_stream_name() {
        let asset = AssetSpec::new("BTC", "BTCUSDT");
        assert_eq!(asset.stream_name(Timeframe::M5), "btcusdt@kline_5m");
    }
}
