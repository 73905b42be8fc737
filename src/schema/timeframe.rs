//! Timeframe identifiers and the interval policy table

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from interval policy lookups
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// The timeframe is not part of the configured set. Callers must only
    /// pass configured timeframes; this is a caller bug, not a runtime
    /// fallback condition.
    #[error("timeframe {0} is not configured")]
    UnknownTimeframe(Timeframe),

    #[error("no timeframes configured")]
    Empty,
}

/// Fixed bar duration, named in the upstream's interval notation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    /// Bar duration. Intrinsic to the identifier, not configurable.
    pub fn duration(&self) -> Duration {
        match self {
            Timeframe::M1 => Duration::minutes(1),
            Timeframe::M5 => Duration::minutes(5),
            Timeframe::M15 => Duration::minutes(15),
            Timeframe::H1 => Duration::hours(1),
            Timeframe::H4 => Duration::hours(4),
            Timeframe::D1 => Duration::days(1),
        }
    }

    /// Upstream interval string (`5m`, `1h`, ...)
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Timeframe::M1),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "1h" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "1d" => Ok(Timeframe::D1),
            other => Err(format!("unsupported timeframe: {}", other)),
        }
    }
}

/// One configured timeframe with its bootstrap lookback window
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeframeEntry {
    pub timeframe: Timeframe,
    /// How far back to reach when a series has no data at all
    pub lookback_days: u32,
}

/// Static mapping from timeframe to duration and bootstrap lookback.
///
/// Built once from configuration; lookups for timeframes outside the
/// configured set fail rather than falling back.
#[derive(Debug, Clone)]
pub struct IntervalPolicy {
    entries: BTreeMap<Timeframe, Duration>,
}

impl IntervalPolicy {
    pub fn from_entries(entries: &[TimeframeEntry]) -> Self {
        let entries = entries
            .iter()
            .map(|e| (e.timeframe, Duration::days(e.lookback_days as i64)))
            .collect();
        Self { entries }
    }

    /// Bar duration for a configured timeframe
    pub fn duration_of(&self, timeframe: Timeframe) -> Result<Duration, PolicyError> {
        if self.entries.contains_key(&timeframe) {
            Ok(timeframe.duration())
        } else {
            Err(PolicyError::UnknownTimeframe(timeframe))
        }
    }

    /// Lookback window used for the bootstrap gap of an empty series
    pub fn bootstrap_window_of(&self, timeframe: Timeframe) -> Result<Duration, PolicyError> {
        self.entries
            .get(&timeframe)
            .copied()
            .ok_or(PolicyError::UnknownTimeframe(timeframe))
    }

    /// All configured timeframes, finest first
    pub fn timeframes(&self) -> Vec<Timeframe> {
        self.entries.keys().copied().collect()
    }

    /// The shortest configured timeframe; drives streaming and retention
    pub fn finest(&self) -> Result<Timeframe, PolicyError> {
        self.entries.keys().next().copied().ok_or(PolicyError::Empty)
    }

    pub fn contains(&self, timeframe: Timeframe) -> bool {
        self.entries.contains_key(&timeframe)
    }
}
