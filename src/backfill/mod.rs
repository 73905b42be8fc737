//! Historical backfill

mod coordinator;

pub use coordinator::BackfillCoordinator;

use thiserror::Error;

use crate::schema::{PolicyError, Timeframe};
use crate::storage::StoreError;

/// Backfill failures that abort a fill. Provider failures do not appear
/// here: they end a gap fill early and travel in the reports instead.
#[derive(Debug, Error)]
pub enum BackfillError {
    #[error("store error during backfill: {0}")]
    Store(#[source] StoreError),

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

/// Outcome of filling a single gap
#[derive(Debug, Default)]
pub struct GapFillReport {
    pub candles_filled: usize,
    pub pages_fetched: usize,
    /// Provider failures encountered, in order
    pub errors: Vec<String>,
}

/// Outcome of one (asset, timeframe) series repair
#[derive(Debug)]
pub struct PairReport {
    pub asset: String,
    pub timeframe: Timeframe,
    pub gaps_found: usize,
    pub candles_filled: usize,
    pub errors: Vec<String>,
}

/// Outcome of repairing all configured series of one asset
#[derive(Debug)]
pub struct AssetFillReport {
    pub asset: String,
    pub pairs: Vec<PairReport>,
}

impl AssetFillReport {
    pub fn candles_filled(&self) -> usize {
        self.pairs.iter().map(|p| p.candles_filled).sum()
    }
}
