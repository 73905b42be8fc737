//! Gap detection over stored open times
//!
//! Purely derived from store reads; never mutates state. A gap is a time
//! range known to be missing bars for one (asset, timeframe) series.

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::schema::{IntervalPolicy, PolicyError, Timeframe};
use crate::storage::CandleStore;

/// The trailing gap only fires once the series tail lags `now` by more
/// than this many full intervals. Inherited behavior: two intervals, not
/// one, which gives the live stream a margin to deliver the current bar.
const TRAILING_LAG_INTERVALS: i32 = 2;

/// A missing time range for one series. Transient: produced here, consumed
/// once by the backfill coordinator, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gap {
    /// First missing open time
    pub start: DateTime<Utc>,
    /// Last missing open time (bootstrap and trailing gaps end at `now`)
    pub end: DateTime<Utc>,
    /// Number of whole intervals missing in the range
    pub missing_intervals: i64,
}

pub struct GapDetector {
    policy: IntervalPolicy,
}

impl GapDetector {
    pub fn new(policy: IntervalPolicy) -> Self {
        Self { policy }
    }

    /// Read a series' open times from the store and detect its gaps as of
    /// the current wall clock.
    pub async fn scan(
        &self,
        store: &dyn CandleStore,
        asset: &str,
        timeframe: Timeframe,
    ) -> Result<Vec<Gap>, ScanError> {
        let open_times = store.get_open_times(asset, timeframe).await?;
        let gaps = self.detect(&open_times, timeframe, Utc::now())?;
        debug!(asset, %timeframe, gaps = gaps.len(), "gap scan complete");
        Ok(gaps)
    }

    /// Detect gaps in a sorted-ascending open-time sequence.
    ///
    /// Empty input produces one bootstrap gap covering the configured
    /// lookback window. Otherwise consecutive pairs are walked for
    /// interior gaps, and the tail is compared against `now` for a
    /// trailing gap. Output is chronological; empty output means the
    /// series is complete as of `now`.
    pub fn detect(
        &self,
        open_times: &[DateTime<Utc>],
        timeframe: Timeframe,
        now: DateTime<Utc>,
    ) -> Result<Vec<Gap>, PolicyError> {
        let duration = self.policy.duration_of(timeframe)?;
        let mut gaps = Vec::new();

        if open_times.is_empty() {
            let window = self.policy.bootstrap_window_of(timeframe)?;
            gaps.push(Gap {
                start: now - window,
                end: now,
                missing_intervals: whole_intervals(window, duration),
            });
            return Ok(gaps);
        }

        for pair in open_times.windows(2) {
            let (prev, curr) = (pair[0], pair[1]);
            if curr > prev + duration {
                gaps.push(Gap {
                    start: prev + duration,
                    end: curr - duration,
                    missing_intervals: whole_intervals(curr - prev, duration) - 1,
                });
            }
        }

        let last = open_times[open_times.len() - 1];
        if now > last + duration * TRAILING_LAG_INTERVALS {
            gaps.push(Gap {
                start: last + duration,
                end: now,
                missing_intervals: whole_intervals(now - last, duration),
            });
        }

        Ok(gaps)
    }
}

fn whole_intervals(span: Duration, duration: Duration) -> i64 {
    span.num_milliseconds() / duration.num_milliseconds()
}

/// Gap scanning can fail on the store read or on an unconfigured timeframe.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error(transparent)]
    Store(#[from] crate::storage::StoreError),

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TimeframeEntry;
    use chrono::TimeZone;

    fn detector() -> GapDetector {
        GapDetector::new(IntervalPolicy::from_entries(&[
            TimeframeEntry { timeframe: Timeframe::M5, lookback_days: 1 },
            TimeframeEntry { timeframe: Timeframe::H1, lookback_days: 7 },
        ]))
    }

    fn hour(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, h, 0, 0).unwrap()
    }

    #[test]
    fn test_empty_series_yields_bootstrap_gap() {
        let now = hour(12);
        let gaps = detector().detect(&[], Timeframe::H1, now).unwrap();

        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].start, now - Duration::days(7));
        assert_eq!(gaps[0].end, now);
        assert_eq!(gaps[0].missing_intervals, 7 * 24);
    }

    #[test]
    fn test_unknown_timeframe_fails() {
        assert!(matches!(
            detector().detect(&[], Timeframe::D1, hour(12)),
            Err(PolicyError::UnknownTimeframe(Timeframe::D1))
        ));
    }

    #[test]
    fn test_contiguous_recent_series_has_no_gaps() {
        let times: Vec<_> = (0..6).map(hour).collect();
        let gaps = detector().detect(&times, Timeframe::H1, hour(6)).unwrap();
        assert!(gaps.is_empty());
    }

    #[test]
    fn test_interior_gap_single_missing_hour() {
        // Bars at 00,01,02,04,05 — 03:00 missing, now = 06:00.
        let times = vec![hour(0), hour(1), hour(2), hour(4), hour(5)];
        let gaps = detector().detect(&times, Timeframe::H1, hour(6)).unwrap();

        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].start, hour(3));
        assert_eq!(gaps[0].end, hour(3));
        assert_eq!(gaps[0].missing_intervals, 1);
    }

    #[test]
    fn test_trailing_gap_boundary() {
        let times = vec![hour(0), hour(1), hour(2), hour(4), hour(5)];

        // At now = 07:00 the tail lags by exactly two intervals: no gap yet.
        let gaps = detector().detect(&times, Timeframe::H1, hour(7)).unwrap();
        assert_eq!(gaps.len(), 1, "only the interior gap");

        // One minute past the two-interval threshold it must appear.
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 7, 1, 0).unwrap();
        let gaps = detector().detect(&times, Timeframe::H1, now).unwrap();
        assert_eq!(gaps.len(), 2);

        let trailing = &gaps[1];
        assert_eq!(trailing.start, hour(6));
        assert_eq!(trailing.end, now);
        assert_eq!(trailing.missing_intervals, 2);
    }

    #[test]
    fn test_single_point_series_still_gets_trailing_gap() {
        let times = vec![hour(0)];
        let gaps = detector().detect(&times, Timeframe::H1, hour(5)).unwrap();

        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].start, hour(1));
        assert_eq!(gaps[0].end, hour(5));
        assert_eq!(gaps[0].missing_intervals, 5);
    }

    #[test]
    fn test_gaps_are_chronological() {
        let times = vec![hour(0), hour(3), hour(8), hour(9)];
        let gaps = detector().detect(&times, Timeframe::H1, hour(10)).unwrap();

        assert_eq!(gaps.len(), 2);
        assert_eq!(gaps[0].start, hour(1));
        assert_eq!(gaps[0].end, hour(2));
        assert_eq!(gaps[0].missing_intervals, 2);
        assert_eq!(gaps[1].start, hour(4));
        assert_eq!(gaps[1].end, hour(7));
        assert_eq!(gaps[1].missing_intervals, 4);
        assert!(gaps[0].end < gaps[1].start);
    }

    #[tokio::test]
    async fn test_scan_reads_store() {
        use crate::storage::{CandleStore, MemoryCandleStore};

        let store = MemoryCandleStore::new();
        let gaps = detector().scan(&store, "BTC", Timeframe::H1).await.unwrap();
        assert_eq!(gaps.len(), 1, "empty store produces the bootstrap gap");
        assert_eq!(gaps[0].missing_intervals, 7 * 24);
        let _ = store.get_open_times("BTC", Timeframe::H1).await.unwrap();
    }
}
