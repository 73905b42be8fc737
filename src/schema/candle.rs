//! Candle and price-state value types
//!
//! A `Candle` is identified by (asset, timeframe, open_time). Both the
//! backfill path and the streaming path produce this one type; upstream
//! payloads are validated into it at the parse boundary and never passed
//! around in raw form.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::timeframe::Timeframe;

/// One fixed-duration OHLCV bar with trade metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub asset: String,
    pub timeframe: Timeframe,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub quote_volume: Decimal,
    pub trade_count: i64,
    pub taker_buy_base_volume: Decimal,
    pub taker_buy_quote_volume: Decimal,
}

impl Candle {
    /// Check the structural invariants of a parsed bar.
    ///
    /// Rejects: close_time not after open_time, negative prices/volumes,
    /// high below max(open, close), low above min(open, close).
    pub fn is_well_formed(&self) -> bool {
        if self.close_time <= self.open_time {
            return false;
        }
        let zero = Decimal::ZERO;
        if self.open < zero
            || self.high < zero
            || self.low < zero
            || self.close < zero
            || self.volume < zero
            || self.quote_volume < zero
            || self.trade_count < 0
        {
            return false;
        }
        self.high >= self.open.max(self.close) && self.low <= self.open.min(self.close)
    }

    /// Apply an overlapping write for the same key.
    ///
    /// Returns `false` (no-op) unless the incoming close_time is strictly
    /// newer than the stored one, which makes replayed or out-of-order
    /// deliveries from concurrent backfill and stream writers harmless.
    /// On merge: high/low extend monotonically, everything else is taken
    /// from the incoming bar.
    pub fn merge_from(&mut self, incoming: &Candle) -> bool {
        if incoming.close_time <= self.close_time {
            return false;
        }
        self.high = self.high.max(incoming.high);
        self.low = self.low.min(incoming.low);
        self.close = incoming.close;
        self.close_time = incoming.close_time;
        self.volume = incoming.volume;
        self.quote_volume = incoming.quote_volume;
        self.trade_count = incoming.trade_count;
        self.taker_buy_base_volume = incoming.taker_buy_base_volume;
        self.taker_buy_quote_volume = incoming.taker_buy_quote_volume;
        true
    }
}

/// Latest price and trailing 24h change for one asset.
///
/// Overwritten wholesale on every recompute; there is no partial merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceState {
    pub asset: String,
    pub price: Decimal,
    pub change_24h: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Coverage summary for one stored (asset, timeframe) series
#[derive(Debug, Clone, Serialize)]
pub struct SeriesStats {
    pub asset: String,
    pub timeframe: Timeframe,
    pub count: i64,
    pub oldest_open_time: Option<DateTime<Utc>>,
    pub newest_open_time: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn candle(close_time_min: i64, high: Decimal, low: Decimal, close: Decimal) -> Candle {
        let open_time = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        Candle {
            asset: "BTC".to_string(),
            timeframe: Timeframe::M5,
            open_time,
            close_time: open_time + chrono::Duration::minutes(close_time_min),
            open: dec!(100),
            high,
            low,
            close,
            volume: dec!(10),
            quote_volume: dec!(1000),
            trade_count: 42,
            taker_buy_base_volume: dec!(4),
            taker_buy_quote_volume: dec!(400),
        }
    }

    #[test]
    fn test_merge_older_close_time_is_noop() {
        let mut stored = candle(5, dec!(110), dec!(95), dec!(105));
        let before = stored.clone();

        let stale = candle(5, dec!(200), dec!(1), dec!(150));
        assert!(!stored.merge_from(&stale));
        assert_eq!(stored, before);

        let older = candle(3, dec!(200), dec!(1), dec!(150));
        assert!(!stored.merge_from(&older));
        assert_eq!(stored, before);
    }

    #[test]
    fn test_merge_high_is_monotonic_max() {
        let mut stored = candle(3, dec!(100), dec!(95), dec!(99));

        // Newer write with a lower high must not regress the stored high.
        let lower_high = candle(4, dec!(90), dec!(95), dec!(96));
        assert!(stored.merge_from(&lower_high));
        assert_eq!(stored.high, dec!(100));
        assert_eq!(stored.close, dec!(96));

        let higher_high = candle(5, dec!(150), dec!(95), dec!(120));
        assert!(stored.merge_from(&higher_high));
        assert_eq!(stored.high, dec!(150));
    }

    #[test]
    fn test_merge_low_is_monotonic_min() {
        let mut stored = candle(3, dec!(110), dec!(90), dec!(99));

        let higher_low = candle(4, dec!(110), dec!(98), dec!(99));
        assert!(stored.merge_from(&higher_low));
        assert_eq!(stored.low, dec!(90));

        let lower_low = candle(5, dec!(110), dec!(80), dec!(85));
        assert!(stored.merge_from(&lower_low));
        assert_eq!(stored.low, dec!(80));
    }

    #[test]
    fn test_merge_overwrites_trade_metadata() {
        let mut stored = candle(3, dec!(110), dec!(90), dec!(99));
        let mut incoming = candle(4, dec!(110), dec!(90), dec!(101));
        incoming.volume = dec!(25);
        incoming.trade_count = 77;
        incoming.quote_volume = dec!(2500);

        assert!(stored.merge_from(&incoming));
        assert_eq!(stored.volume, dec!(25));
        assert_eq!(stored.trade_count, 77);
        assert_eq!(stored.quote_volume, dec!(2500));
        assert_eq!(stored.close_time, incoming.close_time);
    }

    #[test]
    fn test_sorted_merges_are_order_insensitive_in_result() {
        // Any ascending-close-time application order yields the same bar.
        let writes = vec![
            candle(1, dec!(101), dec!(99), dec!(100)),
            candle(2, dec!(105), dec!(97), dec!(98)),
            candle(3, dec!(103), dec!(96), dec!(102)),
            candle(4, dec!(104), dec!(98), dec!(101)),
        ];

        let mut a = writes[0].clone();
        for w in &writes[1..] {
            a.merge_from(w);
        }

        // Replaying the full ascending sequence over the result is a no-op.
        let mut b = a.clone();
        for w in &writes {
            assert!(!b.merge_from(w));
        }
        assert_eq!(a, b);
        assert_eq!(a.high, dec!(105));
        assert_eq!(a.low, dec!(96));
        assert_eq!(a.close, dec!(101));
    }

    #[test]
    fn test_well_formed() {
        assert!(candle(5, dec!(110), dec!(95), dec!(105)).is_well_formed());

        // high below close
        assert!(!candle(5, dec!(100), dec!(95), dec!(105)).is_well_formed());
        // low above open
        assert!(!candle(5, dec!(110), dec!(101), dec!(105)).is_well_formed());

        // close_time not after open_time
        let mut c = candle(5, dec!(110), dec!(95), dec!(105));
        c.close_time = c.open_time;
        assert!(!c.is_well_formed());

        let mut c = candle(5, dec!(110), dec!(95), dec!(105));
        c.volume = dec!(-1);
        assert!(!c.is_well_formed());
    }
}
