//! Market-structure analysis: swing points, break of structure (BOS),
//! change of character (CHoCH), and the protected swing used as the SWING
//! stop-loss reference.
//!
//! A swing high at index `i` is a strict high surrounded by lower highs
//! within `lookback` candles on both sides; it is only confirmed once
//! `lookback` candles have printed after it. Breaks are evaluated on closes,
//! in candle order, so the analysis is a pure function of the sequence.

use serde::{Deserialize, Serialize};

use crate::market::candle::Candle;
use crate::models::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StructureBias {
    Bullish,
    Bearish,
    Neutral,
}

impl StructureBias {
    pub fn as_str(&self) -> &'static str {
        match self {
            StructureBias::Bullish => "BULLISH",
            StructureBias::Bearish => "BEARISH",
            StructureBias::Neutral => "NEUTRAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrendLabel {
    Uptrend,
    Downtrend,
    Ranging,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SwingPoint {
    pub index: usize,
    pub price: f64,
    pub open_time_ms: i64,
}

/// A structure break: BOS continues the trend, CHoCH flags a likely change.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StructureEvent {
    pub direction: Side,
    pub level: f64,
    pub index: usize,
    pub open_time_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructureAnalysis {
    pub bias: Option<StructureBias>,
    pub trend: Option<TrendLabel>,
    pub last_swing_high: Option<SwingPoint>,
    pub last_swing_low: Option<SwingPoint>,
    pub protected_swing_high: Option<f64>,
    pub protected_swing_low: Option<f64>,
    pub last_bos: Option<StructureEvent>,
    pub last_choch: Option<StructureEvent>,
}

impl StructureAnalysis {
    pub fn bias_or_neutral(&self) -> StructureBias {
        self.bias.unwrap_or(StructureBias::Neutral)
    }

    pub fn trend_or_ranging(&self) -> TrendLabel {
        self.trend.unwrap_or(TrendLabel::Ranging)
    }
}

fn is_swing_high(candles: &[Candle], i: usize, lookback: usize) -> bool {
    let h = candles[i].high;
    if !h.is_finite() {
        return false;
    }
    for j in i.saturating_sub(lookback)..=(i + lookback).min(candles.len() - 1) {
        if j != i && candles[j].high >= h {
            return false;
        }
    }
    true
}

fn is_swing_low(candles: &[Candle], i: usize, lookback: usize) -> bool {
    let l = candles[i].low;
    if !l.is_finite() {
        return false;
    }
    for j in i.saturating_sub(lookback)..=(i + lookback).min(candles.len() - 1) {
        if j != i && candles[j].low <= l {
            return false;
        }
    }
    true
}

/// Analyze the confirmed candle run. `lookback` is the fractal half-window,
/// `scan` caps how far back swings are searched (0 = whole slice).
pub fn analyze(candles: &[Candle], lookback: usize, scan: usize) -> StructureAnalysis {
    let n = candles.len();
    if lookback == 0 || n < 2 * lookback + 1 {
        return StructureAnalysis::default();
    }

    let start = if scan > 0 && n > scan { n - scan } else { 0 };

    // Candidate swings, in index order. Index i can only be judged once
    // lookback candles exist on both sides.
    let mut highs: Vec<SwingPoint> = Vec::new();
    let mut lows: Vec<SwingPoint> = Vec::new();
    for i in start.max(lookback)..(n - lookback) {
        if is_swing_high(candles, i, lookback) {
            highs.push(SwingPoint {
                index: i,
                price: candles[i].high,
                open_time_ms: candles[i].open_time_ms,
            });
        }
        if is_swing_low(candles, i, lookback) {
            lows.push(SwingPoint {
                index: i,
                price: candles[i].low,
                open_time_ms: candles[i].open_time_ms,
            });
        }
    }

    // Trend from the last two swing pairs: HH+HL is up, LH+LL is down.
    let trend = match (highs.len() >= 2, lows.len() >= 2) {
        (true, true) => {
            let hh = highs[highs.len() - 1].price > highs[highs.len() - 2].price;
            let hl = lows[lows.len() - 1].price > lows[lows.len() - 2].price;
            let lh = highs[highs.len() - 1].price < highs[highs.len() - 2].price;
            let ll = lows[lows.len() - 1].price < lows[lows.len() - 2].price;
            if hh && hl {
                Some(TrendLabel::Uptrend)
            } else if lh && ll {
                Some(TrendLabel::Downtrend)
            } else {
                Some(TrendLabel::Ranging)
            }
        }
        _ => None,
    };

    // Replay closes against confirmed swing levels to extract the last BOS
    // and CHoCH. A level fires at most once; a new swing re-arms it.
    let mut armed_high: Option<SwingPoint> = None;
    let mut armed_low: Option<SwingPoint> = None;
    let mut hi_iter = highs.iter().peekable();
    let mut lo_iter = lows.iter().peekable();
    let mut dir: Option<Side> = None;
    let mut last_bos: Option<StructureEvent> = None;
    let mut last_choch: Option<StructureEvent> = None;

    for i in start..n {
        // Absorb swings confirmed by candle i.
        while let Some(sp) = hi_iter.peek() {
            if sp.index + lookback <= i {
                armed_high = Some(**sp);
                hi_iter.next();
            } else {
                break;
            }
        }
        while let Some(sp) = lo_iter.peek() {
            if sp.index + lookback <= i {
                armed_low = Some(**sp);
                lo_iter.next();
            } else {
                break;
            }
        }

        let close = candles[i].close;
        if !close.is_finite() {
            continue;
        }

        if let Some(level) = armed_high {
            if close > level.price {
                let ev = StructureEvent {
                    direction: Side::Long,
                    level: level.price,
                    index: i,
                    open_time_ms: candles[i].open_time_ms,
                };
                match dir {
                    Some(Side::Short) => last_choch = Some(ev),
                    _ => last_bos = Some(ev),
                }
                dir = Some(Side::Long);
                armed_high = None;
            }
        }
        if let Some(level) = armed_low {
            if close < level.price {
                let ev = StructureEvent {
                    direction: Side::Short,
                    level: level.price,
                    index: i,
                    open_time_ms: candles[i].open_time_ms,
                };
                match dir {
                    Some(Side::Long) => last_choch = Some(ev),
                    _ => last_bos = Some(ev),
                }
                dir = Some(Side::Short);
                armed_low = None;
            }
        }
    }

    let last_swing_high = highs.last().copied();
    let last_swing_low = lows.last().copied();

    // Protected swing: the extreme the market last traded away from in the
    // trend direction; the SWING stop-loss reference.
    let (protected_swing_high, protected_swing_low) = match trend {
        Some(TrendLabel::Uptrend) => (None, last_swing_low.map(|s| s.price)),
        Some(TrendLabel::Downtrend) => (last_swing_high.map(|s| s.price), None),
        _ => (
            last_swing_high.map(|s| s.price),
            last_swing_low.map(|s| s.price),
        ),
    };

    let bias = trend.map(|t| match t {
        TrendLabel::Uptrend => StructureBias::Bullish,
        TrendLabel::Downtrend => StructureBias::Bearish,
        TrendLabel::Ranging => StructureBias::Neutral,
    });

    StructureAnalysis {
        bias,
        trend,
        last_swing_high,
        last_swing_low,
        protected_swing_high,
        protected_swing_low,
        last_bos,
        last_choch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(i: usize, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            symbol: "BTCUSDT".to_string(),
            interval: "15".to_string(),
            open_time_ms: 1_700_000_000_000 + i as i64 * 900_000,
            close_time_ms: 1_700_000_000_000 + (i as i64 + 1) * 900_000,
            open: close,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    /// Zig-zag up: each leg makes a higher high and a higher low.
    fn stair_up() -> Vec<Candle> {
        let mut cs = Vec::new();
        let mut i = 0;
        for leg in 0..5 {
            let base = 100.0 + leg as f64 * 10.0;
            // push up to a peak
            for k in 0..4 {
                let p = base + k as f64 * 2.0;
                cs.push(candle(i, p + 1.0, p - 1.0, p));
                i += 1;
            }
            // pull back below the peak but hold above the prior leg's low
            for k in 0..3 {
                let p = base + 5.0 - k as f64 * 1.5;
                cs.push(candle(i, p + 1.0, p - 1.0, p));
                i += 1;
            }
        }
        cs
    }

    fn stair_down() -> Vec<Candle> {
        let up = stair_up();
        let top = 220.0;
        up.into_iter()
            .enumerate()
            .map(|(i, c)| candle(i, top - c.low, top - c.high, top - c.close))
            .collect()
    }

    #[test]
    fn short_input_is_empty_analysis() {
        let cs = stair_up();
        let a = analyze(&cs[..4], 2, 0);
        assert!(a.bias.is_none());
        assert!(a.last_swing_high.is_none());
    }

    #[test]
    fn uptrend_is_bullish_with_protected_low() {
        let a = analyze(&stair_up(), 2, 0);
        assert_eq!(a.trend, Some(TrendLabel::Uptrend));
        assert_eq!(a.bias, Some(StructureBias::Bullish));
        assert!(a.protected_swing_low.is_some());
        assert!(a.protected_swing_high.is_none());
        let low = a.protected_swing_low.unwrap();
        let last_close = stair_up().last().unwrap().close;
        assert!(low < last_close);
    }

    #[test]
    fn downtrend_is_bearish_with_protected_high() {
        let a = analyze(&stair_down(), 2, 0);
        assert_eq!(a.trend, Some(TrendLabel::Downtrend));
        assert_eq!(a.bias, Some(StructureBias::Bearish));
        assert!(a.protected_swing_high.is_some());
        assert!(a.protected_swing_low.is_none());
    }

    #[test]
    fn uptrend_emits_long_bos() {
        let a = analyze(&stair_up(), 2, 0);
        let bos = a.last_bos.expect("bos in a stair-step uptrend");
        assert_eq!(bos.direction, Side::Long);
        assert!(bos.level > 0.0);
    }

    #[test]
    fn reversal_emits_choch() {
        let mut cs = stair_up();
        let n0 = cs.len();
        // Collapse below the last pullback low.
        for k in 0..10 {
            let p = 100.0 - k as f64 * 3.0;
            cs.push(candle(n0 + k, p + 1.0, p - 1.0, p));
        }
        let a = analyze(&cs, 2, 0);
        let choch = a.last_choch.expect("collapse should change character");
        assert_eq!(choch.direction, Side::Short);
    }

    #[test]
    fn analysis_is_deterministic() {
        let cs = stair_up();
        let a = analyze(&cs, 2, 0);
        let b = analyze(&cs, 2, 0);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }
}
