use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Position / intent direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "LONG",
            Side::Short => "SHORT",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// Exchange order side that opens a position in this direction.
    pub fn order_side(&self) -> &'static str {
        match self {
            Side::Long => "Buy",
            Side::Short => "Sell",
        }
    }

    /// Exchange order side that reduces a position in this direction.
    pub fn close_order_side(&self) -> &'static str {
        match self {
            Side::Long => "Sell",
            Side::Short => "Buy",
        }
    }

    pub fn parse(s: &str) -> Option<Side> {
        match s.to_ascii_uppercase().as_str() {
            "LONG" | "BUY" => Some(Side::Long),
            "SHORT" | "SELL" => Some(Side::Short),
            _ => None,
        }
    }
}

/// Net directional stance the strategy currently endorses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Bias {
    Long,
    Short,
    Neutral,
}

impl Bias {
    pub fn from_side(side: Side) -> Bias {
        match side {
            Side::Long => Bias::Long,
            Side::Short => Bias::Short,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Bias::Long => "LONG",
            Bias::Short => "SHORT",
            Bias::Neutral => "NEUTRAL",
        }
    }
}

/// Outbound UI WebSocket envelope. Every fan-out message is one of these.
#[derive(Debug, Clone, Serialize)]
pub struct WsServerEvent {
    #[serde(rename = "type")]
    pub kind: WsEventKind,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WsEventKind {
    Position,
    Strategy,
    Ticker,
    TrailUpdate,
    CircuitBreaker,
    Watch,
    Trade,
    Pong,
}

impl WsServerEvent {
    pub fn new(kind: WsEventKind, data: serde_json::Value) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub api_secret: String,
    pub testnet: bool,
    pub database_path: String,
    pub port: u16,
    pub symbols: Vec<String>,
    pub interval: String,
    pub max_leverage: f64,
    pub sl_emergency_buffer_pct: f64,
    pub circuit_breaker_threshold_pct: f64,
    pub default_risk_pct: f64,
    pub rate_limit_per_sec: u32,
    pub call_timeout_secs: u64,
    pub candle_buffer_cap: usize,
    pub warmup_candles: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let api_key = std::env::var("EXCHANGE_API_KEY").unwrap_or_default();
        let api_secret = std::env::var("EXCHANGE_API_SECRET").unwrap_or_default();

        let testnet = std::env::var("EXCHANGE_TESTNET")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
            .unwrap_or(true);

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./perpagent.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8090".to_string())
            .parse()
            .unwrap_or(8090);

        let symbols = std::env::var("SYMBOLS")
            .unwrap_or_else(|_| "BTCUSDT,ETHUSDT".to_string())
            .split(',')
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        let interval = std::env::var("TIMEFRAME").unwrap_or_else(|_| "15".to_string());

        let max_leverage = std::env::var("MAX_LEVERAGE")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .unwrap_or(10.0);

        let sl_emergency_buffer_pct = std::env::var("SL_EMERGENCY_BUFFER_PCT")
            .unwrap_or_else(|_| "4".to_string())
            .parse()
            .unwrap_or(4.0);

        let circuit_breaker_threshold_pct = std::env::var("CIRCUIT_BREAKER_THRESHOLD_PCT")
            .unwrap_or_else(|_| "50".to_string())
            .parse()
            .unwrap_or(50.0);

        let default_risk_pct = std::env::var("RISK_PCT_DEFAULT")
            .unwrap_or_else(|_| "1".to_string())
            .parse()
            .unwrap_or(1.0);

        let rate_limit_per_sec = std::env::var("EXCHANGE_RATE_LIMIT_PER_SEC")
            .unwrap_or_else(|_| "8".to_string())
            .parse()
            .unwrap_or(8);

        let call_timeout_secs = std::env::var("EXCHANGE_CALL_TIMEOUT_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .unwrap_or(5);

        let candle_buffer_cap = std::env::var("CANDLE_BUFFER_CAP")
            .unwrap_or_else(|_| "2000".to_string())
            .parse()
            .unwrap_or(2000);

        Ok(Self {
            api_key,
            api_secret,
            testnet,
            database_path,
            port,
            symbols,
            interval,
            max_leverage,
            sl_emergency_buffer_pct,
            circuit_breaker_threshold_pct,
            default_risk_pct,
            rate_limit_per_sec,
            call_timeout_secs,
            candle_buffer_cap,
            warmup_candles: 1500,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_round_trip() {
        assert_eq!(Side::parse("long"), Some(Side::Long));
        assert_eq!(Side::parse("SELL"), Some(Side::Short));
        assert_eq!(Side::parse("flat"), None);
        assert_eq!(Side::Long.opposite(), Side::Short);
        assert_eq!(Side::Short.order_side(), "Sell");
        assert_eq!(Side::Short.close_order_side(), "Buy");
    }
}
