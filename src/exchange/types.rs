//! Exchange boundary types.
//!
//! The venue's REST/WS payloads carry every number as a string. Parsing
//! happens here, once, at the boundary; the rest of the agent only sees f64
//! and never compares parsed values for equality.

use serde::{Deserialize, Serialize};

use crate::market::candle::Candle;

/// Parse an exchange string number. Empty and "0" sentinel fields map to None.
pub fn parse_price(s: &str) -> Option<f64> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return None;
    }
    let v: f64 = trimmed.parse().ok()?;
    if !v.is_finite() || v == 0.0 {
        return None;
    }
    Some(v)
}

/// Like `parse_price` but zero is a meaningful value (sizes, PnL).
pub fn parse_qty(s: &str) -> Option<f64> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return None;
    }
    let v: f64 = trimmed.parse().ok()?;
    v.is_finite().then_some(v)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Ticker {
    pub last: f64,
    pub mark: f64,
    pub bid: f64,
    pub ask: f64,
}

/// Instrument trading rules used for size/price rounding.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InstrumentInfo {
    pub min_order_qty: f64,
    pub qty_step: f64,
    pub tick_size: f64,
    pub max_leverage: f64,
}

impl InstrumentInfo {
    /// Floor `qty` to the step grid, then lift to the venue minimum.
    pub fn round_qty(&self, qty: f64) -> f64 {
        if !qty.is_finite() || qty <= 0.0 {
            return 0.0;
        }
        let stepped = if self.qty_step > 0.0 {
            (qty / self.qty_step).floor() * self.qty_step
        } else {
            qty
        };
        if stepped < self.min_order_qty {
            self.min_order_qty
        } else {
            stepped
        }
    }

    /// Round a price onto the tick grid (nearest).
    pub fn round_price(&self, price: f64) -> f64 {
        if self.tick_size > 0.0 && price.is_finite() {
            (price / self.tick_size).round() * self.tick_size
        } else {
            price
        }
    }
}

/// Exchange-reported position, parsed. `size > 0` always; flat positions are
/// absent rather than zero-sized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionInfo {
    pub symbol: String,
    /// "Buy" = long, "Sell" = short on the wire.
    pub side: crate::models::Side,
    pub size: f64,
    pub avg_price: f64,
    pub mark_price: Option<f64>,
    pub unrealised_pnl: Option<f64>,
    pub leverage: Option<f64>,
    pub liq_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Market => "Market",
            OrderKind::Limit => "Limit",
        }
    }
}

/// One outbound order. `link_id` is the idempotency key: resubmitting the
/// same link id must not create a second exchange order.
#[derive(Debug, Clone, Serialize)]
pub struct PlaceOrderRequest {
    pub symbol: String,
    /// "Buy" | "Sell"
    pub side: String,
    pub kind: OrderKind,
    pub qty: f64,
    pub price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub reduce_only: bool,
    pub link_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub link_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub link_id: String,
    pub symbol: String,
    pub side: String,
    pub qty: f64,
    pub price: Option<f64>,
    pub status: String,
}

/// Raw kline row: [startTime, open, high, low, close, volume, turnover].
pub fn kline_row_to_candle(
    symbol: &str,
    interval: &str,
    interval_ms: i64,
    row: &[serde_json::Value],
) -> Option<Candle> {
    let s = |i: usize| row.get(i).and_then(|v| v.as_str());
    let open_time_ms: i64 = s(0)?.parse().ok()?;
    let open = parse_qty(s(1)?)?;
    let high = parse_qty(s(2)?)?;
    let low = parse_qty(s(3)?)?;
    let close = parse_qty(s(4)?)?;
    let volume = parse_qty(s(5)?)?;
    Some(Candle {
        symbol: symbol.to_string(),
        interval: interval.to_string(),
        open_time_ms,
        close_time_ms: open_time_ms + interval_ms,
        open,
        high,
        low,
        close,
        volume,
    })
}

/// Candle interval in milliseconds for the venue's interval codes
/// ("1", "5", "15", "60", "240", "D").
pub fn interval_ms(interval: &str) -> i64 {
    match interval {
        "D" => 86_400_000,
        "W" => 7 * 86_400_000,
        _ => interval.parse::<i64>().map(|m| m * 60_000).unwrap_or(60_000),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_parsing_rejects_sentinels() {
        assert_eq!(parse_price(""), None);
        assert_eq!(parse_price("0"), None);
        assert_eq!(parse_price("0.00"), None);
        assert_eq!(parse_price("abc"), None);
        assert_eq!(parse_price("42000.5"), Some(42000.5));
    }

    #[test]
    fn qty_parsing_keeps_zero() {
        assert_eq!(parse_qty("0"), Some(0.0));
        assert_eq!(parse_qty("-12.5"), Some(-12.5));
        assert_eq!(parse_qty(""), None);
    }

    #[test]
    fn qty_rounding_floors_to_step_and_lifts_to_min() {
        let info = InstrumentInfo {
            min_order_qty: 0.001,
            qty_step: 0.001,
            tick_size: 0.1,
            max_leverage: 100.0,
        };
        assert!((info.round_qty(2.5004) - 2.5).abs() < 1e-9);
        assert!((info.round_qty(0.0004) - 0.001).abs() < 1e-12);
        assert_eq!(info.round_qty(0.0), 0.0);
        assert_eq!(info.round_qty(f64::NAN), 0.0);
    }

    #[test]
    fn kline_row_parses() {
        let row: Vec<serde_json::Value> = vec![
            "1700000000000".into(),
            "100.0".into(),
            "101.0".into(),
            "99.0".into(),
            "100.5".into(),
            "1234.5".into(),
            "123450.0".into(),
        ];
        let c = kline_row_to_candle("BTCUSDT", "15", interval_ms("15"), &row).unwrap();
        assert_eq!(c.open_time_ms, 1_700_000_000_000);
        assert_eq!(c.close_time_ms, 1_700_000_000_000 + 900_000);
        assert_eq!(c.close, 100.5);
    }

    #[test]
    fn interval_codes() {
        assert_eq!(interval_ms("15"), 900_000);
        assert_eq!(interval_ms("60"), 3_600_000);
        assert_eq!(interval_ms("D"), 86_400_000);
    }
}
