//! Candle Manager
//!
//! OHLCV candle ingestion: gap-driven historical backfill over the
//! exchange REST API, live kline streaming over WebSocket, and derived
//! per-asset price state, all written through one idempotent store.

pub mod backfill;
pub mod cli;
pub mod config;
pub mod gaps;
pub mod price;
pub mod provider;
pub mod schema;
pub mod scheduler;
pub mod storage;
pub mod stream;

pub use backfill::BackfillCoordinator;
pub use gaps::{Gap, GapDetector};
pub use price::PriceTracker;
pub use schema::{Candle, IntervalPolicy, PriceState, Timeframe};
pub use storage::{CandleStore, MemoryCandleStore, PostgresCandleStore};
pub use stream::StreamIngestor;
