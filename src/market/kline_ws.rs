//! Public market stream: kline and ticker topics.
//!
//! One WS connection per process. The worker subscribes to every configured
//! symbol, accepts additional subscriptions at runtime over a command
//! channel, reconnects with capped exponential backoff, and resubscribes to
//! the full set after every reconnect. Parsed events flow to the candle
//! workers over an mpsc channel.

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::candle::Candle;
use crate::exchange::types::parse_qty;

const MAINNET_WSS_URL: &str = "wss://stream.bybit.com/v5/public/linear";
const TESTNET_WSS_URL: &str = "wss://stream-testnet.bybit.com/v5/public/linear";

#[derive(Debug, Clone)]
pub enum MarketEvent {
    Kline { candle: Candle, confirm: bool },
    Ticker { symbol: String, last: f64, mark: f64 },
}

#[derive(Debug)]
enum WsCommand {
    Subscribe(String),
}

pub struct PublicFeed {
    cmd_tx: mpsc::Sender<WsCommand>,
}

impl PublicFeed {
    /// Spawn the stream worker and return a handle for runtime
    /// subscriptions. Events arrive on `out` until the process shuts down.
    pub fn spawn(
        testnet: bool,
        symbols: Vec<String>,
        interval: String,
        out: mpsc::Sender<MarketEvent>,
    ) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel::<WsCommand>(64);
        let feed = Arc::new(Self { cmd_tx });

        let url = if testnet { TESTNET_WSS_URL } else { MAINNET_WSS_URL }.to_string();
        tokio::spawn(async move {
            run(url, symbols, interval, out, cmd_rx).await;
        });

        feed
    }

    /// Request a live subscription for one more symbol. Non-blocking; the
    /// worker picks it up on the current connection or the next reconnect.
    pub fn request_subscribe(&self, symbol: &str) {
        if symbol.trim().is_empty() {
            return;
        }
        let _ = self
            .cmd_tx
            .try_send(WsCommand::Subscribe(symbol.trim().to_ascii_uppercase()));
    }
}

async fn run(
    url: String,
    symbols: Vec<String>,
    kline_interval: String,
    out: mpsc::Sender<MarketEvent>,
    mut cmd_rx: mpsc::Receiver<WsCommand>,
) {
    let mut subscribed: HashSet<String> = symbols.into_iter().collect();
    let mut reconnect_delay = Duration::from_secs(1);
    let max_reconnect_delay = Duration::from_secs(30);

    loop {
        match connect_and_stream(&url, &kline_interval, &out, &mut cmd_rx, &mut subscribed).await {
            Ok(()) => {
                reconnect_delay = Duration::from_secs(1);
            }
            Err(e) => {
                // Jitter keeps a fleet of restarts from thundering.
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
                warn!(error = %e, "market stream disconnected; reconnecting");
                sleep(reconnect_delay + jitter).await;
                reconnect_delay = (reconnect_delay * 2).min(max_reconnect_delay);
            }
        }
        if out.is_closed() {
            return;
        }
    }
}

fn topics_for(symbol: &str, kline_interval: &str) -> [String; 2] {
    [
        format!("kline.{}.{}", kline_interval, symbol),
        format!("tickers.{}", symbol),
    ]
}

async fn connect_and_stream(
    url: &str,
    kline_interval: &str,
    out: &mpsc::Sender<MarketEvent>,
    cmd_rx: &mut mpsc::Receiver<WsCommand>,
    subscribed: &mut HashSet<String>,
) -> Result<()> {
    info!(url, "connecting market stream");
    let (ws_stream, _) = connect_async(url).await.context("connect market stream")?;
    let (mut write, mut read) = ws_stream.split();

    let topics: Vec<String> = subscribed
        .iter()
        .flat_map(|s| topics_for(s, kline_interval))
        .collect();
    let sub = serde_json::json!({ "op": "subscribe", "args": topics });
    write
        .send(Message::Text(sub.to_string()))
        .await
        .context("send market subscription")?;
    info!(symbols = ?subscribed, "market stream subscribed");

    let mut ping = interval(Duration::from_secs(20));
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ping.tick() => {
                let msg = serde_json::json!({ "op": "ping" });
                let _ = write.send(Message::Text(msg.to_string())).await;
            }
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    return Ok(());
                };
                match cmd {
                    WsCommand::Subscribe(symbol) => {
                        if subscribed.insert(symbol.clone()) {
                            let msg = serde_json::json!({
                                "op": "subscribe",
                                "args": topics_for(&symbol, kline_interval),
                            });
                            let _ = write.send(Message::Text(msg.to_string())).await;
                            info!(symbol = %symbol, "market stream subscription added");
                        }
                    }
                }
            }
            ws_msg = read.next() => {
                let Some(ws_msg) = ws_msg else {
                    return Err(anyhow!("market stream ended"));
                };
                match ws_msg {
                    Ok(Message::Text(text)) => {
                        for event in parse_market_message(&text, kline_interval) {
                            if out.send(event).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "market stream close frame");
                        return Err(anyhow!("market stream closed"));
                    }
                    Ok(_) => {}
                    Err(e) => return Err(anyhow!("market stream error: {e}")),
                }
            }
        }
    }
}

/// Parse one raw stream message into market events. Non-data frames (acks,
/// pongs) produce nothing.
pub fn parse_market_message(text: &str, interval: &str) -> Vec<MarketEvent> {
    let Ok(json) = serde_json::from_str::<serde_json::Value>(text) else {
        return Vec::new();
    };
    let Some(topic) = json.get("topic").and_then(|v| v.as_str()) else {
        return Vec::new();
    };

    if let Some(rest) = topic.strip_prefix("kline.") {
        let Some((_, symbol)) = rest.split_once('.') else {
            return Vec::new();
        };
        let Some(rows) = json.get("data").and_then(|v| v.as_array()) else {
            return Vec::new();
        };
        return rows
            .iter()
            .filter_map(|row| parse_kline_row(symbol, interval, row))
            .collect();
    }

    if let Some(symbol) = topic.strip_prefix("tickers.") {
        let Some(data) = json.get("data") else {
            return Vec::new();
        };
        let s = |key: &str| data.get(key).and_then(|v| v.as_str()).and_then(parse_qty);
        // Ticker deltas may omit fields; both prices are needed.
        if let (Some(last), Some(mark)) = (s("lastPrice"), s("markPrice")) {
            return vec![MarketEvent::Ticker {
                symbol: symbol.to_string(),
                last,
                mark,
            }];
        }
        return Vec::new();
    }

    Vec::new()
}

fn parse_kline_row(symbol: &str, interval: &str, row: &serde_json::Value) -> Option<MarketEvent> {
    let start = row.get("start").and_then(|v| v.as_i64())?;
    let end = row.get("end").and_then(|v| v.as_i64())?;
    let s = |key: &str| row.get(key).and_then(|v| v.as_str()).and_then(parse_qty);
    let confirm = row.get("confirm").and_then(|v| v.as_bool()).unwrap_or(false);

    Some(MarketEvent::Kline {
        candle: Candle {
            symbol: symbol.to_string(),
            interval: interval.to_string(),
            open_time_ms: start,
            close_time_ms: end,
            open: s("open")?,
            high: s("high")?,
            low: s("low")?,
            close: s("close")?,
            volume: s("volume")?,
        },
        confirm,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kline_message_parses_with_confirm_flag() {
        let text = r#"{
            "topic": "kline.15.BTCUSDT",
            "data": [{
                "start": 1700000000000,
                "end": 1700000900000,
                "open": "42000.0",
                "high": "42100.5",
                "low": "41900.0",
                "close": "42050.0",
                "volume": "123.4",
                "confirm": true
            }]
        }"#;
        let events = parse_market_message(text, "15");
        assert_eq!(events.len(), 1);
        let MarketEvent::Kline { candle, confirm } = &events[0] else {
            panic!("expected kline");
        };
        assert!(confirm);
        assert_eq!(candle.symbol, "BTCUSDT");
        assert_eq!(candle.open_time_ms, 1_700_000_000_000);
        assert_eq!(candle.close, 42050.0);
    }

    #[test]
    fn ticker_message_parses() {
        let text = r#"{
            "topic": "tickers.ETHUSDT",
            "data": { "lastPrice": "2201.5", "markPrice": "2201.9" }
        }"#;
        let events = parse_market_message(text, "15");
        assert_eq!(events.len(), 1);
        let MarketEvent::Ticker { symbol, last, mark } = &events[0] else {
            panic!("expected ticker");
        };
        assert_eq!(symbol, "ETHUSDT");
        assert_eq!(*last, 2201.5);
        assert_eq!(*mark, 2201.9);
    }

    #[test]
    fn partial_ticker_delta_is_skipped() {
        let text = r#"{ "topic": "tickers.ETHUSDT", "data": { "lastPrice": "2201.5" } }"#;
        assert!(parse_market_message(text, "15").is_empty());
    }

    #[test]
    fn non_data_frames_produce_nothing() {
        assert!(parse_market_message(r#"{"op":"pong"}"#, "15").is_empty());
        assert!(parse_market_message(r#"{"success":true,"op":"subscribe"}"#, "15").is_empty());
        assert!(parse_market_message("not json", "15").is_empty());
    }

    #[test]
    fn topics_cover_kline_and_ticker() {
        let topics = topics_for("BTCUSDT", "15");
        assert_eq!(topics[0], "kline.15.BTCUSDT");
        assert_eq!(topics[1], "tickers.BTCUSDT");
    }
}
