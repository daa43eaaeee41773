//! Signed REST client for the perp venue (v5-style API).
//!
//! All numbers cross this boundary as strings and are parsed in
//! `exchange::types`. Every call takes one slot on the shared `CallGate`
//! and runs under an explicit deadline. Reads retry (bounded, with backoff);
//! writes are single-shot — idempotency lives in the order link id.

use anyhow::{anyhow, Context, Result};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use super::throttle::{CallGate, DeadlineExceeded};
use super::types::{
    interval_ms, kline_row_to_candle, parse_price, parse_qty, InstrumentInfo, OpenOrder, OrderAck,
    PlaceOrderRequest, PositionInfo, Ticker,
};
use crate::market::candle::Candle;
use crate::models::Side;

const MAINNET_HOST: &str = "https://api.bybit.com";
const TESTNET_HOST: &str = "https://api-testnet.bybit.com";
const RECV_WINDOW: &str = "5000";
const READ_RETRIES: u32 = 3;

// Venue codes that are success in disguise.
const CODE_OK: i64 = 0;
const CODE_LEVERAGE_NOT_MODIFIED: i64 = 110043;
const CODE_DUPLICATE_LINK_ID: i64 = 110072;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg", default)]
    ret_msg: String,
    #[serde(default)]
    result: serde_json::Value,
}

pub struct RestClient {
    client: Client,
    api_key: String,
    api_secret: String,
    host: String,
    gate: Arc<CallGate>,
    call_timeout: Duration,
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("host", &self.host)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl RestClient {
    pub fn new(
        api_key: String,
        api_secret: String,
        testnet: bool,
        gate: Arc<CallGate>,
        call_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(call_timeout + Duration::from_secs(2))
            .build()
            .context("build exchange http client")?;
        Ok(Self {
            client,
            api_key,
            api_secret,
            host: if testnet { TESTNET_HOST } else { MAINNET_HOST }.to_string(),
            gate,
            call_timeout,
        })
    }

    fn sign(&self, timestamp_ms: i64, payload: &str) -> Result<String> {
        let message = format!("{}{}{}{}", timestamp_ms, self.api_key, RECV_WINDOW, payload);
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| anyhow!("HMAC key error: {}", e))?;
        mac.update(message.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn call(&self, method: &str, path: &str, query: &str, body: Option<String>) -> Result<Envelope> {
        self.gate.acquire().await?;

        let url = if query.is_empty() {
            format!("{}{}", self.host, path)
        } else {
            format!("{}{}?{}", self.host, path, query)
        };

        let timestamp_ms = chrono::Utc::now().timestamp_millis();
        let payload = body.as_deref().unwrap_or(query);
        let signature = self.sign(timestamp_ms, payload)?;

        let mut request = match method {
            "POST" => self
                .client
                .post(&url)
                .header("Content-Type", "application/json")
                .body(body.unwrap_or_default()),
            _ => self.client.get(&url),
        };
        request = request
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp_ms.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", signature);

        let fut = async {
            let response = request.send().await.context("exchange request failed")?;
            let status = response.status();
            let text = response.text().await.context("exchange response read")?;
            if !status.is_success() {
                return Err(anyhow!("exchange http {}: {}", status, text));
            }
            let envelope: Envelope =
                serde_json::from_str(&text).context("exchange envelope parse")?;
            Ok(envelope)
        };

        match timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!(DeadlineExceeded)),
        }
    }

    /// Read path with bounded retry + linear backoff.
    async fn read(&self, path: &str, query: &str) -> Result<serde_json::Value> {
        let mut last_err = None;
        for attempt in 0..READ_RETRIES {
            match self.call("GET", path, query, None).await {
                Ok(env) if env.ret_code == CODE_OK => return Ok(env.result),
                Ok(env) => {
                    return Err(anyhow!("exchange error {}: {}", env.ret_code, env.ret_msg));
                }
                Err(e) => {
                    warn!(path, attempt, error = %e, "exchange read failed");
                    last_err = Some(e);
                    sleep(Duration::from_millis(250 * (attempt as u64 + 1))).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("exchange read failed")))
    }

    /// Write path: single attempt, success codes mapped here.
    async fn write(&self, path: &str, body: serde_json::Value) -> Result<(i64, serde_json::Value)> {
        let body_str = body.to_string();
        let env = self.call("POST", path, "", Some(body_str)).await?;
        match env.ret_code {
            CODE_OK | CODE_LEVERAGE_NOT_MODIFIED | CODE_DUPLICATE_LINK_ID => {
                Ok((env.ret_code, env.result))
            }
            code => Err(anyhow!("exchange error {}: {}", code, env.ret_msg)),
        }
    }

    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let query = format!(
            "category=linear&symbol={}&interval={}&limit={}",
            symbol,
            interval,
            limit.clamp(1, 1000)
        );
        let result = self.read("/v5/market/kline", &query).await?;
        let rows = result
            .get("list")
            .and_then(|v| v.as_array())
            .ok_or_else(|| anyhow!("kline list missing"))?;

        let step = interval_ms(interval);
        let mut candles: Vec<Candle> = rows
            .iter()
            .filter_map(|row| row.as_array())
            .filter_map(|row| kline_row_to_candle(symbol, interval, step, row))
            .collect();
        // Venue returns newest first; the agent wants oldest first.
        candles.sort_by_key(|c| c.open_time_ms);
        Ok(candles)
    }

    pub async fn get_ticker(&self, symbol: &str) -> Result<Ticker> {
        let query = format!("category=linear&symbol={}", symbol);
        let result = self.read("/v5/market/tickers", &query).await?;
        let row = result
            .get("list")
            .and_then(|v| v.as_array())
            .and_then(|l| l.first())
            .ok_or_else(|| anyhow!("ticker missing for {}", symbol))?;

        let f = |key: &str| {
            row.get(key)
                .and_then(|v| v.as_str())
                .and_then(parse_price)
                .ok_or_else(|| anyhow!("ticker field {} missing", key))
        };
        Ok(Ticker {
            last: f("lastPrice")?,
            mark: f("markPrice")?,
            bid: f("bid1Price")?,
            ask: f("ask1Price")?,
        })
    }

    pub async fn get_instrument_info(&self, symbol: &str) -> Result<InstrumentInfo> {
        let query = format!("category=linear&symbol={}", symbol);
        let result = self.read("/v5/market/instruments-info", &query).await?;
        let row = result
            .get("list")
            .and_then(|v| v.as_array())
            .and_then(|l| l.first())
            .ok_or_else(|| anyhow!("instrument info missing for {}", symbol))?;

        let lot = row.get("lotSizeFilter").cloned().unwrap_or_default();
        let price = row.get("priceFilter").cloned().unwrap_or_default();
        let lev = row.get("leverageFilter").cloned().unwrap_or_default();
        let s = |obj: &serde_json::Value, key: &str| {
            obj.get(key)
                .and_then(|v| v.as_str())
                .and_then(parse_qty)
        };
        Ok(InstrumentInfo {
            min_order_qty: s(&lot, "minOrderQty").unwrap_or(0.001),
            qty_step: s(&lot, "qtyStep").unwrap_or(0.001),
            tick_size: s(&price, "tickSize").unwrap_or(0.1),
            max_leverage: s(&lev, "maxLeverage").unwrap_or(100.0),
        })
    }

    /// Sum of USD value across all coins; USDT/USDC equity counts directly.
    pub async fn get_wallet_balance(&self) -> Result<f64> {
        let result = self
            .read("/v5/account/wallet-balance", "accountType=UNIFIED")
            .await?;
        let coins = result
            .get("list")
            .and_then(|v| v.as_array())
            .and_then(|l| l.first())
            .and_then(|acct| acct.get("coin"))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut total = 0.0;
        for entry in &coins {
            let name = entry.get("coin").and_then(|v| v.as_str()).unwrap_or("");
            let field = if matches!(name, "USDT" | "USDC") {
                "equity"
            } else {
                "usdValue"
            };
            if let Some(v) = entry.get(field).and_then(|v| v.as_str()).and_then(parse_qty) {
                total += v;
            }
        }
        Ok(total)
    }

    pub async fn get_positions(&self, symbol: Option<&str>) -> Result<Vec<PositionInfo>> {
        let query = match symbol {
            Some(s) => format!("category=linear&symbol={}", s),
            None => "category=linear&settleCoin=USDT".to_string(),
        };
        let result = self.read("/v5/position/list", &query).await?;
        let rows = result
            .get("list")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::new();
        for row in &rows {
            if let Some(p) = parse_position_row(row) {
                out.push(p);
            }
        }
        Ok(out)
    }

    pub async fn set_leverage(&self, symbol: &str, leverage: f64) -> Result<()> {
        let lev = format!("{}", leverage);
        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "buyLeverage": lev,
            "sellLeverage": lev,
        });
        let (code, _) = self.write("/v5/position/set-leverage", body).await?;
        if code == CODE_LEVERAGE_NOT_MODIFIED {
            debug!(symbol, leverage, "leverage already set");
        }
        Ok(())
    }

    pub async fn place_order(&self, req: &PlaceOrderRequest) -> Result<OrderAck> {
        let mut body = serde_json::json!({
            "category": "linear",
            "symbol": req.symbol,
            "side": req.side,
            "orderType": req.kind.as_str(),
            "qty": format!("{}", req.qty),
            "orderLinkId": req.link_id,
            "positionIdx": 0,
        });
        let obj = body.as_object_mut().expect("body is an object");
        if let Some(price) = req.price {
            obj.insert("price".into(), format!("{}", price).into());
        }
        if let Some(sl) = req.stop_loss {
            obj.insert("stopLoss".into(), format!("{}", sl).into());
        }
        if let Some(tp) = req.take_profit {
            obj.insert("takeProfit".into(), format!("{}", tp).into());
        }
        if req.reduce_only {
            obj.insert("reduceOnly".into(), true.into());
        }

        let (code, result) = self.write("/v5/order/create", body).await?;
        if code == CODE_DUPLICATE_LINK_ID {
            // Same link id already accepted: the earlier submission stands.
            debug!(link_id = %req.link_id, "duplicate link id treated as success");
        }
        let order_id = result
            .get("orderId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(OrderAck {
            order_id,
            link_id: req.link_id.clone(),
        })
    }

    /// `price = None` clears the stop.
    pub async fn set_stop_loss(&self, symbol: &str, price: Option<f64>) -> Result<()> {
        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "stopLoss": price.map(|p| format!("{}", p)).unwrap_or_else(|| "0".to_string()),
            "positionIdx": 0,
        });
        self.write("/v5/position/trading-stop", body).await?;
        Ok(())
    }

    pub async fn set_take_profit(&self, symbol: &str, price: Option<f64>) -> Result<()> {
        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "takeProfit": price.map(|p| format!("{}", p)).unwrap_or_else(|| "0".to_string()),
            "positionIdx": 0,
        });
        self.write("/v5/position/trading-stop", body).await?;
        Ok(())
    }

    pub async fn cancel_order(&self, symbol: &str, link_id: &str) -> Result<()> {
        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "orderLinkId": link_id,
        });
        self.write("/v5/order/cancel", body).await?;
        Ok(())
    }

    pub async fn cancel_all_orders(&self, symbol: &str) -> Result<()> {
        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
        });
        self.write("/v5/order/cancel-all", body).await?;
        Ok(())
    }

    pub async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>> {
        let query = format!("category=linear&symbol={}&openOnly=0", symbol);
        let result = self.read("/v5/order/realtime", &query).await?;
        let rows = result
            .get("list")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::new();
        for row in &rows {
            let s = |key: &str| row.get(key).and_then(|v| v.as_str()).unwrap_or("");
            let Some(qty) = parse_qty(s("qty")) else { continue };
            out.push(OpenOrder {
                order_id: s("orderId").to_string(),
                link_id: s("orderLinkId").to_string(),
                symbol: s("symbol").to_string(),
                side: s("side").to_string(),
                qty,
                price: parse_price(s("price")),
                status: s("orderStatus").to_string(),
            });
        }
        Ok(out)
    }
}

pub(crate) fn parse_position_row(row: &serde_json::Value) -> Option<PositionInfo> {
    let s = |key: &str| row.get(key).and_then(|v| v.as_str()).unwrap_or("");
    let size = parse_qty(s("size"))?;
    if size <= 0.0 {
        return None;
    }
    let side = match s("side") {
        "Buy" => Side::Long,
        "Sell" => Side::Short,
        _ => return None,
    };
    Some(PositionInfo {
        symbol: s("symbol").to_string(),
        side,
        size,
        avg_price: parse_price(s("avgPrice"))?,
        mark_price: parse_price(s("markPrice")),
        unrealised_pnl: parse_qty(s("unrealisedPnl")),
        leverage: parse_price(s("leverage")),
        liq_price: parse_price(s("liqPrice")),
        stop_loss: parse_price(s("stopLoss")),
        take_profit: parse_price(s("takeProfit")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_row_parses_and_skips_flat() {
        let row = serde_json::json!({
            "symbol": "BTCUSDT",
            "side": "Buy",
            "size": "0.5",
            "avgPrice": "42000",
            "markPrice": "42100",
            "unrealisedPnl": "50",
            "leverage": "5",
            "liqPrice": "35000",
            "stopLoss": "41000",
            "takeProfit": "",
        });
        let p = parse_position_row(&row).unwrap();
        assert_eq!(p.side, Side::Long);
        assert_eq!(p.size, 0.5);
        assert_eq!(p.stop_loss, Some(41000.0));
        assert_eq!(p.take_profit, None);

        let flat = serde_json::json!({
            "symbol": "BTCUSDT", "side": "None", "size": "0", "avgPrice": "0",
        });
        assert!(parse_position_row(&flat).is_none());
    }
}
