//! Shared data model: candles, price state, timeframes

mod candle;
mod timeframe;

pub use candle::{Candle, PriceState, SeriesStats};
pub use timeframe::{IntervalPolicy, PolicyError, Timeframe, TimeframeEntry};
