//! Live kline ingestion over the combined WebSocket stream
//!
//! One multiplexed connection covers all configured assets on the finest
//! timeframe. Every inbound kline is upserted through the shared store
//! (open bars included, relying on the monotonic-close-time merge) and
//! forwarded to the price tracker.
//!
//! The connection is an explicit state machine:
//! `Disconnected -> Connecting -> Connected -> Disconnected`, retrying
//! forever with a fixed delay until `disconnect()` moves it to the
//! terminal `Stopped` state.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::{AssetRegistry, StreamSettings};
use crate::price::PriceTracker;
use crate::schema::{Candle, IntervalPolicy, PolicyError, Timeframe};
use crate::storage::CandleStore;

use super::StreamError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal; only `disconnect()` enters it
    Stopped,
}

/// Combined-stream envelope: `{"stream": "btcusdt@kline_5m", "data": {...}}`
#[derive(Debug, Deserialize)]
struct CombinedFrame {
    stream: String,
    data: KlineEvent,
}

#[derive(Debug, Deserialize)]
struct KlineEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "k")]
    kline: KlinePayload,
}

#[derive(Debug, Deserialize)]
struct KlinePayload {
    #[serde(rename = "t")]
    open_time_ms: i64,
    #[serde(rename = "T")]
    close_time_ms: i64,
    #[serde(rename = "i")]
    interval: String,
    #[serde(rename = "o")]
    open: Decimal,
    #[serde(rename = "h")]
    high: Decimal,
    #[serde(rename = "l")]
    low: Decimal,
    #[serde(rename = "c")]
    close: Decimal,
    #[serde(rename = "v")]
    volume: Decimal,
    #[serde(rename = "q")]
    quote_volume: Decimal,
    #[serde(rename = "n")]
    trade_count: i64,
    #[serde(rename = "V")]
    taker_buy_base_volume: Decimal,
    #[serde(rename = "Q")]
    taker_buy_quote_volume: Decimal,
}

pub struct StreamIngestor {
    store: Arc<dyn CandleStore>,
    tracker: Arc<PriceTracker>,
    registry: AssetRegistry,
    /// Only the finest configured timeframe is streamed live
    timeframe: Timeframe,
    ws_url: String,
    settings: StreamSettings,
    state: RwLock<IngestState>,
    shutdown_tx: broadcast::Sender<()>,
}

impl StreamIngestor {
    pub fn new(
        store: Arc<dyn CandleStore>,
        tracker: Arc<PriceTracker>,
        registry: AssetRegistry,
        policy: &IntervalPolicy,
        ws_url: String,
        settings: StreamSettings,
    ) -> Result<Self, PolicyError> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            store,
            tracker,
            registry,
            timeframe: policy.finest()?,
            ws_url,
            settings,
            state: RwLock::new(IngestState::Disconnected),
            shutdown_tx,
        })
    }

    pub fn state(&self) -> IngestState {
        *self.state.read()
    }

    /// Combined-stream URL covering one kline stream per configured asset.
    fn connection_url(&self) -> String {
        let streams: Vec<String> =
            self.registry.assets().iter().map(|a| a.stream_name(self.timeframe)).collect();
        format!("{}/stream?streams={}", self.ws_url, streams.join("/"))
    }

    /// Run until `disconnect()`. Each dropped connection is retried after
    /// a fixed delay, indefinitely; the feed is expected to recover.
    pub async fn run(&self) {
        let delay = std::time::Duration::from_secs(self.settings.reconnect_delay_secs);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            // receiver taken before the state transition: a disconnect()
            // that lands after it is guaranteed to reach this connection
            let connection_rx = self.shutdown_tx.subscribe();
            if !self.enter_connecting() {
                return;
            }

            match self.connect_and_ingest(connection_rx).await {
                Ok(()) => {
                    // clean shutdown via disconnect()
                    *self.state.write() = IngestState::Stopped;
                    info!("stream ingestor stopped");
                    return;
                }
                Err(e) => {
                    *self.state.write() = IngestState::Disconnected;
                    warn!(error = %e, delay_secs = self.settings.reconnect_delay_secs,
                        "stream connection lost, reconnecting");
                }
            }

            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown_rx.recv() => {
                    *self.state.write() = IngestState::Stopped;
                    info!("stream ingestor stopped during reconnect wait");
                    return;
                }
            }
        }
    }

    /// Move into `Connecting` unless the machine has already stopped.
    /// The check and the transition share one lock acquisition, so a
    /// concurrent `disconnect()` is either observed here or ordered
    /// strictly after it.
    fn enter_connecting(&self) -> bool {
        let mut state = self.state.write();
        if *state == IngestState::Stopped {
            return false;
        }
        *state = IngestState::Connecting;
        true
    }

    /// Stop the ingestor. Idempotent: repeat calls and calls before `run`
    /// both leave the state machine in `Stopped`.
    pub fn disconnect(&self) {
        let mut state = self.state.write();
        if *state != IngestState::Stopped {
            *state = IngestState::Stopped;
            // no receiver yet is fine
            let _ = self.shutdown_tx.send(());
            info!("stream ingestor disconnect requested");
        }
    }

    async fn connect_and_ingest(
        &self,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), StreamError> {
        let url = self.connection_url();
        debug!(%url, "connecting to kline stream");

        let (ws_stream, _) =
            connect_async(&url).await.map_err(|e| StreamError::Connection(e.to_string()))?;

        {
            // a disconnect() that fired while dialing wins
            let mut state = self.state.write();
            if *state == IngestState::Stopped {
                return Ok(());
            }
            *state = IngestState::Connected;
        }
        info!(assets = self.registry.assets().len(), timeframe = %self.timeframe,
            "kline stream connected");

        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_frame(&text).await,
                        Some(Ok(Message::Ping(payload))) => {
                            if let Err(e) = write.send(Message::Pong(payload)).await {
                                return Err(StreamError::Connection(e.to_string()));
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            return Err(StreamError::Connection("closed by server".to_string()));
                        }
                        Some(Err(e)) => {
                            return Err(StreamError::Connection(e.to_string()));
                        }
                        None => {
                            return Err(StreamError::Connection("stream ended".to_string()));
                        }
                        _ => {}
                    }
                }
                _ = shutdown_rx.recv() => {
                    if let Err(e) = write.send(Message::Close(None)).await {
                        warn!(error = %e, "failed to send close frame");
                    }
                    return Ok(());
                }
            }
        }
    }

    /// One inbound text frame. Parse failures and unknown symbols are
    /// logged and dropped; store failures are logged and the stream keeps
    /// going, since the next backfill pass repairs anything missed.
    async fn handle_frame(&self, text: &str) {
        let frame: CombinedFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "unparseable stream frame dropped");
                return;
            }
        };

        let candle = match self.candle_from_event(&frame.data) {
            Ok(Some(candle)) => candle,
            Ok(None) => return,
            Err(e) => {
                warn!(stream = %frame.stream, error = %e, "malformed kline dropped");
                return;
            }
        };

        let close = candle.close;
        let asset = candle.asset.clone();

        if let Err(e) = self.store.upsert(&candle).await {
            error!(asset = %asset, error = %e, "live candle upsert failed");
            return;
        }

        if let Err(e) = self.tracker.on_new_price(&asset, close).await {
            error!(asset = %asset, error = %e, "price update failed");
        }
    }

    /// Map a kline event to a Candle, or `None` for events that belong to
    /// no configured asset or an unconfigured interval.
    fn candle_from_event(&self, event: &KlineEvent) -> Result<Option<Candle>, StreamError> {
        let Some(asset) = self.registry.by_symbol(&event.symbol) else {
            debug!(symbol = %event.symbol, "kline for unconfigured symbol dropped");
            return Ok(None);
        };

        let timeframe: Timeframe = match event.kline.interval.parse() {
            Ok(tf) => tf,
            Err(_) => {
                debug!(interval = %event.kline.interval, "kline for unconfigured interval dropped");
                return Ok(None);
            }
        };

        let candle = Candle {
            asset: asset.name.clone(),
            timeframe,
            open_time: millis_to_datetime(event.kline.open_time_ms)?,
            close_time: millis_to_datetime(event.kline.close_time_ms)?,
            open: event.kline.open,
            high: event.kline.high,
            low: event.kline.low,
            close: event.kline.close,
            volume: event.kline.volume,
            quote_volume: event.kline.quote_volume,
            trade_count: event.kline.trade_count,
            taker_buy_base_volume: event.kline.taker_buy_base_volume,
            taker_buy_quote_volume: event.kline.taker_buy_quote_volume,
        };

        if !candle.is_well_formed() {
            return Err(StreamError::Parse(format!(
                "ill-formed kline for {} at {}",
                event.symbol, candle.open_time
            )));
        }
        Ok(Some(candle))
    }
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>, StreamError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StreamError::Parse(format!("timestamp out of range: {}", ms)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AssetSpec;
    use crate::schema::TimeframeEntry;
    use crate::storage::MemoryCandleStore;
    use rust_decimal_macros::dec;

    const FRAME: &str = r#"{
        "stream": "btcusdt@kline_5m",
        "data": {
            "e": "kline", "E": 1700000100000, "s": "BTCUSDT",
            "k": {
                "t": 1700000000000, "T": 1700000299999,
                "s": "BTCUSDT", "i": "5m",
                "f": 1, "L": 2,
                "o": "100.0", "c": "105.0", "h": "110.0", "l": "99.0",
                "v": "12.5", "n": 42, "x": false,
                "q": "1300.0", "V": "6.0", "Q": "640.0", "B": "0"
            }
        }
    }"#;

    fn ingestor(store: Arc<MemoryCandleStore>) -> StreamIngestor {
        let policy = IntervalPolicy::from_entries(&[TimeframeEntry {
            timeframe: Timeframe::M5,
            lookback_days: 1,
        }]);
        let tracker = Arc::new(PriceTracker::new(store.clone(), &policy).unwrap());
        StreamIngestor::new(
            store,
            tracker,
            AssetRegistry::new(vec![
                AssetSpec::new("BTC", "BTCUSDT"),
                AssetSpec::new("ETH", "ETHUSDT"),
            ]),
            &policy,
            "wss://stream.binance.com:9443".to_string(),
            StreamSettings::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_frame_upserts_candle_and_price() {
        let store = Arc::new(MemoryCandleStore::new());
        let ingestor = ingestor(store.clone());

        ingestor.handle_frame(FRAME).await;

        let candles = store.get_candles("BTC", Timeframe::M5, None, None).await.unwrap();
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].close, dec!(105.0));
        assert_eq!(candles[0].trade_count, 42);

        let price = store.get_price("BTC").await.unwrap().unwrap();
        assert_eq!(price.price, dec!(105.0));
    }

    #[tokio::test]
    async fn test_unknown_symbol_dropped() {
        let store = Arc::new(MemoryCandleStore::new());
        let ingestor = ingestor(store.clone());

        let frame = FRAME.replace("BTCUSDT", "DOGEUSDT").replace("btcusdt", "dogeusdt");
        ingestor.handle_frame(&frame).await;

        assert!(store.get_candles("BTC", Timeframe::M5, None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_garbage_frame_dropped() {
        let store = Arc::new(MemoryCandleStore::new());
        let ingestor = ingestor(store.clone());
        ingestor.handle_frame("not json").await;
        ingestor.handle_frame(r#"{"result": null, "id": 1}"#).await;
        assert!(store.get_candles("BTC", Timeframe::M5, None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_bar_update_merges_monotonically() {
        let store = Arc::new(MemoryCandleStore::new());
        let ingestor = ingestor(store.clone());

        ingestor.handle_frame(FRAME).await;
        // same bar, earlier close_time: must be a no-op
        let stale = FRAME
            .replace("\"T\": 1700000299999", "\"T\": 1700000199999")
            .replace("\"c\": \"105.0\"", "\"c\": \"50.0\"");
        ingestor.handle_frame(&stale).await;

        let candles = store.get_candles("BTC", Timeframe::M5, None, None).await.unwrap();
        assert_eq!(candles[0].close, dec!(105.0));
    }

    #[test]
    fn test_connection_url_joins_streams() {
        let store = Arc::new(MemoryCandleStore::new());
        let ingestor = ingestor(store);
        assert_eq!(
            ingestor.connection_url(),
            "wss://stream.binance.com:9443/stream?streams=btcusdt@kline_5m/ethusdt@kline_5m"
        );
    }

    #[test]
    fn test_disconnect_is_idempotent_and_terminal() {
        let store = Arc::new(MemoryCandleStore::new());
        let ingestor = ingestor(store);
        assert_eq!(ingestor.state(), IngestState::Disconnected);
        ingestor.disconnect();
        ingestor.disconnect();
        assert_eq!(ingestor.state(), IngestState::Stopped);
    }

    #[test]
    fn test_stopped_machine_refuses_reconnect_entry() {
        let store = Arc::new(MemoryCandleStore::new());
        let ingestor = ingestor(store);

        // the reconnect loop may enter Connecting while running
        assert!(ingestor.enter_connecting());
        assert_eq!(ingestor.state(), IngestState::Connecting);

        // but never again once disconnect() has stopped the machine
        ingestor.disconnect();
        assert!(!ingestor.enter_connecting());
        assert_eq!(ingestor.state(), IngestState::Stopped);
    }
}
