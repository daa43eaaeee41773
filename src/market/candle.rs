//! Per-(symbol, interval) candle buffers.
//!
//! Each buffer holds an ordered run of confirmed candles plus at most one
//! live candle. The live candle is mutable and never feeds decisions that
//! require closure; confirmation appends it and starts a new live candle.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// One OHLCV candle. Immutable once confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub interval: String,
    pub open_time_ms: i64,
    pub close_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Default)]
struct SymbolBuffer {
    confirmed: VecDeque<Candle>,
    live: Option<Candle>,
}

/// Shared store of candle buffers, one per (symbol, interval).
pub struct CandleStore {
    inner: RwLock<HashMap<(String, String), SymbolBuffer>>,
    cap: usize,
}

impl CandleStore {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            cap: cap.max(1),
        }
    }

    /// Seed the confirmed run from a REST backfill. Input must be
    /// oldest-to-newest; candles at or before the newest confirmed open time
    /// are skipped so a backfill never rewinds the buffer.
    pub fn seed(&self, candles: Vec<Candle>) -> usize {
        let mut map = self.inner.write();
        let mut added = 0;
        for c in candles {
            let key = (c.symbol.clone(), c.interval.clone());
            let buf = map.entry(key).or_default();
            let last_open = buf.confirmed.back().map(|x| x.open_time_ms);
            if last_open.map_or(true, |t| c.open_time_ms > t) {
                buf.confirmed.push_back(c);
                added += 1;
            }
        }
        for buf in map.values_mut() {
            while buf.confirmed.len() > self.cap {
                buf.confirmed.pop_front();
            }
        }
        added
    }

    /// Apply a feed candle. Returns the candle that got confirmed by this
    /// update, if any.
    ///
    /// `confirmed` is the feed's own close flag: when set, the incoming
    /// candle is final and is appended directly. Without it, an incoming
    /// candle whose open time advances past the live one confirms the live
    /// candle (feed-agnostic roll-over).
    pub fn apply(&self, candle: Candle, confirmed: bool) -> Option<Candle> {
        let mut map = self.inner.write();
        let key = (candle.symbol.clone(), candle.interval.clone());
        let buf = map.entry(key).or_default();

        // Stale delivery: older than what we already confirmed.
        if let Some(last) = buf.confirmed.back() {
            if candle.open_time_ms <= last.open_time_ms {
                return None;
            }
        }

        if confirmed {
            if buf
                .live
                .as_ref()
                .map_or(false, |l| l.open_time_ms == candle.open_time_ms)
            {
                buf.live = None;
            }
            buf.confirmed.push_back(candle.clone());
            while buf.confirmed.len() > self.cap {
                buf.confirmed.pop_front();
            }
            return Some(candle);
        }

        match &buf.live {
            Some(live) if live.open_time_ms == candle.open_time_ms => {
                buf.live = Some(candle);
                None
            }
            Some(live) if candle.open_time_ms > live.open_time_ms => {
                let rolled = live.clone();
                buf.confirmed.push_back(rolled.clone());
                while buf.confirmed.len() > self.cap {
                    buf.confirmed.pop_front();
                }
                buf.live = Some(candle);
                Some(rolled)
            }
            Some(_) => None, // stale live update
            None => {
                buf.live = Some(candle);
                None
            }
        }
    }

    /// Snapshot of the confirmed run, oldest first.
    pub fn confirmed(&self, symbol: &str, interval: &str) -> Vec<Candle> {
        let map = self.inner.read();
        map.get(&(symbol.to_string(), interval.to_string()))
            .map(|b| b.confirmed.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn confirmed_len(&self, symbol: &str, interval: &str) -> usize {
        let map = self.inner.read();
        map.get(&(symbol.to_string(), interval.to_string()))
            .map(|b| b.confirmed.len())
            .unwrap_or(0)
    }

    pub fn last_confirmed(&self, symbol: &str, interval: &str) -> Option<Candle> {
        let map = self.inner.read();
        map.get(&(symbol.to_string(), interval.to_string()))
            .and_then(|b| b.confirmed.back().cloned())
    }

    pub fn live(&self, symbol: &str, interval: &str) -> Option<Candle> {
        let map = self.inner.read();
        map.get(&(symbol.to_string(), interval.to_string()))
            .and_then(|b| b.live.clone())
    }
}

#[cfg(test)]
pub(crate) fn test_candle(symbol: &str, open_time_ms: i64, close: f64) -> Candle {
    Candle {
        symbol: symbol.to_string(),
        interval: "15".to_string(),
        open_time_ms,
        close_time_ms: open_time_ms + 900_000,
        open: close - 0.5,
        high: close + 1.0,
        low: close - 1.0,
        close,
        volume: 100.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_000_000;
    const STEP: i64 = 900_000;

    #[test]
    fn live_update_does_not_confirm() {
        let store = CandleStore::new(100);
        assert!(store.apply(test_candle("BTCUSDT", T0, 100.0), false).is_none());
        assert!(store.apply(test_candle("BTCUSDT", T0, 101.0), false).is_none());
        assert_eq!(store.confirmed_len("BTCUSDT", "15"), 0);
        assert_eq!(store.live("BTCUSDT", "15").unwrap().close, 101.0);
    }

    #[test]
    fn rollover_confirms_previous_live() {
        let store = CandleStore::new(100);
        store.apply(test_candle("BTCUSDT", T0, 100.0), false);
        let confirmed = store.apply(test_candle("BTCUSDT", T0 + STEP, 102.0), false);
        assert_eq!(confirmed.unwrap().close, 100.0);
        assert_eq!(store.confirmed_len("BTCUSDT", "15"), 1);
        assert_eq!(store.live("BTCUSDT", "15").unwrap().close, 102.0);
    }

    #[test]
    fn explicit_confirm_flag_closes_live() {
        let store = CandleStore::new(100);
        store.apply(test_candle("BTCUSDT", T0, 100.0), false);
        let confirmed = store.apply(test_candle("BTCUSDT", T0, 100.5), true);
        assert_eq!(confirmed.unwrap().close, 100.5);
        assert_eq!(store.confirmed_len("BTCUSDT", "15"), 1);
        assert!(store.live("BTCUSDT", "15").is_none());
    }

    #[test]
    fn stale_candles_are_ignored() {
        let store = CandleStore::new(100);
        store.apply(test_candle("BTCUSDT", T0, 100.0), true);
        assert!(store.apply(test_candle("BTCUSDT", T0, 99.0), true).is_none());
        assert!(store
            .apply(test_candle("BTCUSDT", T0 - STEP, 98.0), false)
            .is_none());
        assert_eq!(store.confirmed_len("BTCUSDT", "15"), 1);
    }

    #[test]
    fn cap_drops_oldest() {
        let store = CandleStore::new(3);
        for i in 0..5 {
            store.apply(test_candle("BTCUSDT", T0 + i * STEP, 100.0 + i as f64), true);
        }
        let confirmed = store.confirmed("BTCUSDT", "15");
        assert_eq!(confirmed.len(), 3);
        assert_eq!(confirmed[0].close, 102.0);
        assert_eq!(confirmed[2].close, 104.0);
    }

    #[test]
    fn seed_skips_overlapping_history() {
        let store = CandleStore::new(100);
        store.apply(test_candle("BTCUSDT", T0, 100.0), true);
        let added = store.seed(vec![
            test_candle("BTCUSDT", T0 - STEP, 99.0),
            test_candle("BTCUSDT", T0, 100.0),
            test_candle("BTCUSDT", T0 + STEP, 101.0),
        ]);
        assert_eq!(added, 1);
        assert_eq!(store.confirmed_len("BTCUSDT", "15"), 2);
    }
}
