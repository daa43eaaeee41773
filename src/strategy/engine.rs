//! Strategy engine: per-symbol state recomputed on every confirmed candle
//! close. The hard gate (allow-long / allow-short) lives here and is the only
//! non-admin check that can block a trade.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use super::snapshot::{compute, IndicatorParams, StrategySnapshot};
use crate::indicators::structure::StructureBias;
use crate::market::candle::CandleStore;
use crate::models::{Bias, Side};

/// Wide-stop warning threshold: distance from price to the SL reference, in
/// percent. Beyond this, a fixed risk budget buys an outsized notional.
const WIDE_SL_WARNING_PCT: f64 = 5.0;

/// Informational classification of the satisfied gate conditions. The gate
/// alone decides admissibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyTag {
    /// Supertrend plus both moving averages aligned.
    S101,
    /// Supertrend plus one moving average.
    S102,
    /// Supertrend only.
    S103,
}

impl StrategyTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyTag::S101 => "S101",
            StrategyTag::S102 => "S102",
            StrategyTag::S103 => "S103",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyState {
    pub symbol: String,
    pub interval: String,
    pub last_close_at: Option<DateTime<Utc>>,
    pub bias: Bias,
    pub allow_long_entry: bool,
    pub allow_short_entry: bool,
    pub strategy_tag: Option<StrategyTag>,
    pub risk_warning: Option<String>,
    pub snapshot: Option<StrategySnapshot>,
}

impl StrategyState {
    fn unavailable(symbol: &str, interval: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            interval: interval.to_string(),
            last_close_at: None,
            bias: Bias::Neutral,
            allow_long_entry: false,
            allow_short_entry: false,
            strategy_tag: None,
            risk_warning: None,
            snapshot: None,
        }
    }

    pub fn allows(&self, side: Side) -> bool {
        match side {
            Side::Long => self.allow_long_entry,
            Side::Short => self.allow_short_entry,
        }
    }
}

/// Broadcast payload for every recompute.
#[derive(Debug, Clone)]
pub struct StateUpdate {
    pub symbol: String,
    pub state: Arc<StrategyState>,
}

pub struct StrategyEngine {
    store: Arc<CandleStore>,
    params: IndicatorParams,
    interval: String,
    warmup: usize,
    states: RwLock<HashMap<String, Arc<StrategyState>>>,
    update_tx: broadcast::Sender<StateUpdate>,
}

impl StrategyEngine {
    pub fn new(store: Arc<CandleStore>, params: IndicatorParams, interval: String) -> Self {
        let (update_tx, _) = broadcast::channel(256);
        let warmup = params.warmup();
        Self {
            store,
            params,
            interval,
            warmup,
            states: RwLock::new(HashMap::new()),
            update_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateUpdate> {
        self.update_tx.subscribe()
    }

    pub fn state(&self, symbol: &str) -> Option<Arc<StrategyState>> {
        self.states.read().get(symbol).cloned()
    }

    pub fn all_states(&self) -> Vec<Arc<StrategyState>> {
        self.states.read().values().cloned().collect()
    }

    /// Synchronous gate read; never blocks on anything.
    pub fn allows(&self, symbol: &str, side: Side) -> bool {
        self.state(symbol).map_or(false, |s| s.allows(side))
    }

    /// Install a prepared state without touching the candle buffer.
    #[cfg(test)]
    pub fn inject_state(&self, state: StrategyState) {
        self.states
            .write()
            .insert(state.symbol.clone(), Arc::new(state));
    }

    /// Recompute the state for `symbol` from the candle buffer and broadcast.
    pub fn recompute(&self, symbol: &str) -> Arc<StrategyState> {
        let candles = self.store.confirmed(symbol, &self.interval);
        let state = Arc::new(evaluate(symbol, &self.interval, &candles, &self.params, self.warmup));

        self.states
            .write()
            .insert(symbol.to_string(), state.clone());

        debug!(
            symbol,
            bias = state.bias.as_str(),
            allow_long = state.allow_long_entry,
            allow_short = state.allow_short_entry,
            tag = state.strategy_tag.map(|t| t.as_str()).unwrap_or("-"),
            "strategy state recomputed"
        );

        let _ = self.update_tx.send(StateUpdate {
            symbol: symbol.to_string(),
            state: state.clone(),
        });

        state
    }
}

/// Pure evaluation: identical candle input produces an identical state.
pub fn evaluate(
    symbol: &str,
    interval: &str,
    candles: &[crate::market::candle::Candle],
    params: &IndicatorParams,
    warmup: usize,
) -> StrategyState {
    if candles.len() < warmup {
        return StrategyState::unavailable(symbol, interval);
    }

    let Some(snapshot) = compute(candles, params) else {
        return StrategyState::unavailable(symbol, interval);
    };

    // The longest indicator must be defined; NaN or short data degrades to
    // the same safe result as an empty buffer.
    if snapshot.sma200.is_none() || snapshot.ema1000.is_none() {
        return StrategyState::unavailable(symbol, interval);
    }

    let st_dir = snapshot.supertrend_direction;
    let structure = snapshot.structure_bias;
    let price = snapshot.price;
    let sma200 = snapshot.sma200.unwrap_or(f64::NAN);

    // Hard gate: Supertrend direction with structure not opposing.
    let allow_long_entry = st_dir == Side::Long && structure != StructureBias::Bearish;
    let allow_short_entry = st_dir == Side::Short && structure != StructureBias::Bullish;

    // Bias: Supertrend refined by structure and the slow MA.
    let bias = match st_dir {
        Side::Long if structure == StructureBias::Bearish && price < sma200 => Bias::Neutral,
        Side::Long => Bias::Long,
        Side::Short if structure == StructureBias::Bullish && price > sma200 => Bias::Neutral,
        Side::Short => Bias::Short,
    };

    let strategy_tag = if allow_long_entry {
        tag_for(
            snapshot.close_above_sma200 == Some(true),
            snapshot.close_above_ema1000 == Some(true),
        )
    } else if allow_short_entry {
        tag_for(
            snapshot.close_above_sma200 == Some(false),
            snapshot.close_above_ema1000 == Some(false),
        )
    } else {
        None
    };

    let risk_warning = wide_sl_warning(&snapshot);

    let last_close_at = candles
        .last()
        .and_then(|c| DateTime::from_timestamp_millis(c.close_time_ms));

    StrategyState {
        symbol: symbol.to_string(),
        interval: interval.to_string(),
        last_close_at,
        bias,
        allow_long_entry,
        allow_short_entry,
        strategy_tag,
        risk_warning,
        snapshot: Some(snapshot),
    }
}

fn tag_for(ma_slow_aligned: bool, ma_long_aligned: bool) -> Option<StrategyTag> {
    Some(match (ma_slow_aligned, ma_long_aligned) {
        (true, true) => StrategyTag::S101,
        (true, false) | (false, true) => StrategyTag::S102,
        (false, false) => StrategyTag::S103,
    })
}

fn wide_sl_warning(snapshot: &StrategySnapshot) -> Option<String> {
    let sl_ref = snapshot
        .protected_swing_for(snapshot.supertrend_direction)
        .unwrap_or(snapshot.supertrend_value);
    let dist = ((snapshot.price - sl_ref) / snapshot.price * 100.0).abs();
    if dist > WIDE_SL_WARNING_PCT {
        Some(format!(
            "stop reference is {:.1}% away; risk-based sizing will produce a large notional",
            dist
        ))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::candle::Candle;

    fn candle(i: usize, base: f64) -> Candle {
        Candle {
            symbol: "BTCUSDT".to_string(),
            interval: "15".to_string(),
            open_time_ms: 1_700_000_000_000 + i as i64 * 900_000,
            close_time_ms: 1_700_000_000_000 + (i as i64 + 1) * 900_000,
            open: base,
            high: base + 1.5,
            low: base - 1.5,
            close: base + 0.4,
            volume: 1.0,
        }
    }

    fn rising(n: usize) -> Vec<Candle> {
        (0..n).map(|i| candle(i, 100.0 + i as f64 * 0.5)).collect()
    }

    fn falling(n: usize) -> Vec<Candle> {
        (0..n).map(|i| candle(i, 300.0 - i as f64 * 0.5)).collect()
    }

    fn params() -> IndicatorParams {
        IndicatorParams {
            sma_period: 20,
            ema_period: 30,
            ..IndicatorParams::default()
        }
    }

    #[test]
    fn short_buffer_is_safe_neutral() {
        let p = params();
        let state = evaluate("BTCUSDT", "15", &rising(10), &p, p.warmup());
        assert_eq!(state.bias, Bias::Neutral);
        assert!(!state.allow_long_entry);
        assert!(!state.allow_short_entry);
        assert!(state.strategy_tag.is_none());
    }

    #[test]
    fn gates_are_never_both_true() {
        let p = params();
        for candles in [rising(150), falling(150)] {
            let state = evaluate("BTCUSDT", "15", &candles, &p, p.warmup());
            assert!(!(state.allow_long_entry && state.allow_short_entry));
        }
    }

    #[test]
    fn uptrend_allows_long_with_aligned_tag() {
        let p = params();
        let state = evaluate("BTCUSDT", "15", &rising(150), &p, p.warmup());
        assert!(state.allow_long_entry);
        assert!(!state.allow_short_entry);
        assert_eq!(state.bias, Bias::Long);
        // Rising market sits above both MAs.
        assert_eq!(state.strategy_tag, Some(StrategyTag::S101));
    }

    #[test]
    fn downtrend_allows_short() {
        let p = params();
        let state = evaluate("BTCUSDT", "15", &falling(150), &p, p.warmup());
        assert!(state.allow_short_entry);
        assert!(!state.allow_long_entry);
        assert_eq!(state.bias, Bias::Short);
        assert_eq!(state.strategy_tag, Some(StrategyTag::S101));
    }

    #[test]
    fn evaluation_is_pure() {
        let p = params();
        let cs = rising(150);
        let a = evaluate("BTCUSDT", "15", &cs, &p, p.warmup());
        let b = evaluate("BTCUSDT", "15", &cs, &p, p.warmup());
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[tokio::test]
    async fn engine_broadcasts_state_updates() {
        let store = Arc::new(CandleStore::new(500));
        store.seed(rising(150));
        let engine = StrategyEngine::new(store, params(), "15".to_string());
        let mut rx = engine.subscribe();

        let state = engine.recompute("BTCUSDT");
        assert!(state.allow_long_entry);
        assert!(engine.allows("BTCUSDT", Side::Long));
        assert!(!engine.allows("BTCUSDT", Side::Short));

        let update = rx.recv().await.unwrap();
        assert_eq!(update.symbol, "BTCUSDT");
        assert!(update.state.allow_long_entry);
    }
}
