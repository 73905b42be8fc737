//! Upstream market-data providers

pub mod binance;
pub mod mock;
pub mod traits;

pub use binance::BinanceHistoricalProvider;
pub use mock::MockHistoricalProvider;
pub use traits::{HistoricalCandleProvider, ProviderError, ProviderResult};
