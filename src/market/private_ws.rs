//! Private stream: authenticated position / order / wallet topics.
//!
//! Drives the position tracker and the order manager. A lost connection
//! flips the agent into degraded mode (entries rejected, positions polled
//! over REST) until the stream is back.

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::exchange::types::{parse_price, parse_qty};
use crate::execution::order_manager::{OrderStatus, OrderStreamUpdate};
use crate::execution::position_tracker::PositionUpdate;
use crate::models::Side;

const MAINNET_WSS_URL: &str = "wss://stream.bybit.com/v5/private";
const TESTNET_WSS_URL: &str = "wss://stream-testnet.bybit.com/v5/private";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub enum PrivateEvent {
    Connected,
    Disconnected,
    Position(PositionUpdate),
    Order(OrderStreamUpdate),
    /// Wallet equity snapshot (summed USD value).
    Wallet(f64),
}

pub struct PrivateFeed {
    url: String,
    api_key: String,
    api_secret: String,
    out: mpsc::Sender<PrivateEvent>,
}

impl PrivateFeed {
    pub fn spawn(
        testnet: bool,
        api_key: String,
        api_secret: String,
        out: mpsc::Sender<PrivateEvent>,
    ) {
        let feed = Self {
            url: if testnet { TESTNET_WSS_URL } else { MAINNET_WSS_URL }.to_string(),
            api_key,
            api_secret,
            out,
        };
        tokio::spawn(async move {
            feed.run().await;
        });
    }

    async fn run(self) {
        let mut reconnect_delay = Duration::from_secs(1);
        let max_reconnect_delay = Duration::from_secs(30);

        loop {
            match self.connect_and_stream().await {
                Ok(()) => {
                    reconnect_delay = Duration::from_secs(1);
                }
                Err(e) => {
                    warn!(error = %e, "private stream disconnected; reconnecting");
                    let _ = self.out.send(PrivateEvent::Disconnected).await;
                    sleep(reconnect_delay).await;
                    reconnect_delay = (reconnect_delay * 2).min(max_reconnect_delay);
                }
            }
            if self.out.is_closed() {
                return;
            }
        }
    }

    fn auth_args(&self) -> Result<(i64, String)> {
        let expires = chrono::Utc::now().timestamp_millis() + 10_000;
        let message = format!("GET/realtime{}", expires);
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| anyhow!("HMAC key error: {}", e))?;
        mac.update(message.as_bytes());
        Ok((expires, hex::encode(mac.finalize().into_bytes())))
    }

    async fn connect_and_stream(&self) -> Result<()> {
        info!(url = %self.url, "connecting private stream");
        let (ws_stream, _) = connect_async(&self.url)
            .await
            .context("connect private stream")?;
        let (mut write, mut read) = ws_stream.split();

        let (expires, signature) = self.auth_args()?;
        let auth = serde_json::json!({
            "op": "auth",
            "args": [self.api_key, expires, signature],
        });
        write
            .send(Message::Text(auth.to_string()))
            .await
            .context("send auth")?;

        let sub = serde_json::json!({
            "op": "subscribe",
            "args": ["position", "order", "wallet"],
        });
        write
            .send(Message::Text(sub.to_string()))
            .await
            .context("send private subscription")?;

        let _ = self.out.send(PrivateEvent::Connected).await;

        let mut ping = interval(Duration::from_secs(20));
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    let msg = serde_json::json!({ "op": "ping" });
                    let _ = write.send(Message::Text(msg.to_string())).await;
                }
                ws_msg = read.next() => {
                    let Some(ws_msg) = ws_msg else {
                        return Err(anyhow!("private stream ended"));
                    };
                    match ws_msg {
                        Ok(Message::Text(text)) => {
                            for event in parse_private_message(&text) {
                                if self.out.send(event).await.is_err() {
                                    return Ok(());
                                }
                            }
                        }
                        Ok(Message::Ping(payload)) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(frame)) => {
                            debug!(?frame, "private stream close frame");
                            return Err(anyhow!("private stream closed"));
                        }
                        Ok(_) => {}
                        Err(e) => return Err(anyhow!("private stream error: {e}")),
                    }
                }
            }
        }
    }
}

/// Parse one raw private-stream message. Auth/subscription acks produce
/// nothing; a failed auth surfaces as an error event upstream via the
/// connection dropping.
pub fn parse_private_message(text: &str) -> Vec<PrivateEvent> {
    let Ok(json) = serde_json::from_str::<serde_json::Value>(text) else {
        return Vec::new();
    };
    let Some(topic) = json.get("topic").and_then(|v| v.as_str()) else {
        return Vec::new();
    };
    let Some(rows) = json.get("data").and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    match topic {
        "position" => rows.iter().filter_map(parse_position_msg).collect(),
        "order" => rows.iter().filter_map(parse_order_msg).collect(),
        "wallet" => rows.iter().filter_map(parse_wallet_msg).collect(),
        _ => Vec::new(),
    }
}

fn parse_position_msg(row: &serde_json::Value) -> Option<PrivateEvent> {
    let s = |key: &str| row.get(key).and_then(|v| v.as_str()).unwrap_or("");
    let symbol = s("symbol");
    if symbol.is_empty() {
        return None;
    }
    let size = parse_qty(s("size")).unwrap_or(0.0);
    Some(PrivateEvent::Position(PositionUpdate {
        symbol: symbol.to_string(),
        side: Side::parse(s("side")),
        size,
        avg_price: parse_price(s("entryPrice")).or_else(|| parse_price(s("avgPrice"))),
        mark_price: parse_price(s("markPrice")),
        unrealized_pnl: parse_qty(s("unrealisedPnl")),
        realized_pnl: parse_qty(s("curRealisedPnl")),
        leverage: parse_price(s("leverage")),
        liq_price: parse_price(s("liqPrice")),
        stop_loss: parse_price(s("stopLoss")),
        take_profit: parse_price(s("takeProfit")),
    }))
}

fn parse_order_msg(row: &serde_json::Value) -> Option<PrivateEvent> {
    let s = |key: &str| row.get(key).and_then(|v| v.as_str()).unwrap_or("");
    let link_id = s("orderLinkId");
    if link_id.is_empty() {
        return None;
    }
    let status = OrderStatus::from_stream(s("orderStatus"))?;
    Some(PrivateEvent::Order(OrderStreamUpdate {
        link_id: link_id.to_string(),
        status,
        avg_price: parse_price(s("avgPrice")),
        filled_qty: parse_qty(s("cumExecQty")),
    }))
}

fn parse_wallet_msg(row: &serde_json::Value) -> Option<PrivateEvent> {
    let coins = row.get("coin")?.as_array()?;
    let mut total = 0.0;
    for entry in coins {
        let name = entry.get("coin").and_then(|v| v.as_str()).unwrap_or("");
        let field = if matches!(name, "USDT" | "USDC") {
            "equity"
        } else {
            "usdValue"
        };
        if let Some(v) = entry
            .get(field)
            .and_then(|v| v.as_str())
            .and_then(parse_qty)
        {
            total += v;
        }
    }
    Some(PrivateEvent::Wallet(total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_message_parses_open_and_flat() {
        let text = r#"{
            "topic": "position",
            "data": [{
                "symbol": "BTCUSDT",
                "side": "Buy",
                "size": "0.5",
                "entryPrice": "42000",
                "markPrice": "42100",
                "unrealisedPnl": "50",
                "curRealisedPnl": "0",
                "leverage": "5",
                "liqPrice": "35000",
                "stopLoss": "41000",
                "takeProfit": ""
            }]
        }"#;
        let events = parse_private_message(text);
        assert_eq!(events.len(), 1);
        let PrivateEvent::Position(p) = &events[0] else {
            panic!("expected position");
        };
        assert_eq!(p.symbol, "BTCUSDT");
        assert_eq!(p.side, Some(Side::Long));
        assert_eq!(p.size, 0.5);
        assert_eq!(p.stop_loss, Some(41000.0));
        assert_eq!(p.take_profit, None);

        let flat = r#"{
            "topic": "position",
            "data": [{ "symbol": "BTCUSDT", "side": "", "size": "0", "curRealisedPnl": "-11.25" }]
        }"#;
        let events = parse_private_message(flat);
        let PrivateEvent::Position(p) = &events[0] else {
            panic!("expected position");
        };
        assert_eq!(p.size, 0.0);
        assert_eq!(p.realized_pnl, Some(-11.25));
    }

    #[test]
    fn order_message_maps_status() {
        let text = r#"{
            "topic": "order",
            "data": [{
                "orderLinkId": "link-1",
                "orderStatus": "Filled",
                "avgPrice": "42050.5",
                "cumExecQty": "0.5"
            }]
        }"#;
        let events = parse_private_message(text);
        let PrivateEvent::Order(o) = &events[0] else {
            panic!("expected order");
        };
        assert_eq!(o.link_id, "link-1");
        assert_eq!(o.status, OrderStatus::Filled);
        assert_eq!(o.avg_price, Some(42050.5));
        assert_eq!(o.filled_qty, Some(0.5));
    }

    #[test]
    fn wallet_message_sums_usd_value() {
        let text = r#"{
            "topic": "wallet",
            "data": [{
                "coin": [
                    { "coin": "USDT", "equity": "900", "usdValue": "899" },
                    { "coin": "BTC", "equity": "0.01", "usdValue": "420" }
                ]
            }]
        }"#;
        let events = parse_private_message(text);
        let PrivateEvent::Wallet(total) = &events[0] else {
            panic!("expected wallet");
        };
        assert!((total - 1320.0).abs() < 1e-9);
    }

    #[test]
    fn acks_and_unknown_topics_are_ignored() {
        assert!(parse_private_message(r#"{"op":"auth","success":true}"#).is_empty());
        assert!(parse_private_message(r#"{"topic":"greeks","data":[]}"#).is_empty());
    }
}
