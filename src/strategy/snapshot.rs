//! Strategy snapshot: everything the gate and the UI need to know about a
//! symbol at one confirmed candle close. Pure function of the candle run and
//! the indicator parameters.

use serde::{Deserialize, Serialize};

use crate::indicators::structure::{StructureAnalysis, StructureBias, StructureEvent, TrendLabel};
use crate::indicators::{analyze_structure, ema, sma, supertrend_last};
use crate::market::candle::Candle;
use crate::models::Side;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorParams {
    pub supertrend_period: usize,
    pub supertrend_multiplier: f64,
    pub sma_period: usize,
    pub ema_period: usize,
    pub swing_lookback: usize,
    pub structure_scan: usize,
}

impl Default for IndicatorParams {
    fn default() -> Self {
        Self {
            supertrend_period: 10,
            supertrend_multiplier: 3.0,
            sma_period: 200,
            ema_period: 1000,
            swing_lookback: 3,
            structure_scan: 300,
        }
    }
}

impl IndicatorParams {
    /// Candles needed before every indicator in the set is defined.
    pub fn warmup(&self) -> usize {
        self.ema_period
            .max(self.sma_period)
            .max(self.supertrend_period + 1)
            .max(2 * self.swing_lookback + 1)
    }
}

/// Signed percent distance from price down to a level; positive when price
/// is above the level.
fn distance_pct(price: f64, level: f64) -> Option<f64> {
    if price > 0.0 && level.is_finite() {
        Some((price - level) / price * 100.0)
    } else {
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySnapshot {
    pub supertrend_direction: Side,
    pub supertrend_value: f64,
    pub sma200: Option<f64>,
    pub ema1000: Option<f64>,
    pub close_above_sma200: Option<bool>,
    pub close_above_ema1000: Option<bool>,
    pub structure_bias: StructureBias,
    pub trend: TrendLabel,
    pub last_bos: Option<StructureEvent>,
    pub last_choch: Option<StructureEvent>,
    pub protected_swing_high: Option<f64>,
    pub protected_swing_low: Option<f64>,
    pub price: f64,
    pub distance_to_supertrend_pct: Option<f64>,
    pub distance_to_sma200_pct: Option<f64>,
    pub distance_to_ema1000_pct: Option<f64>,
    pub distance_to_protected_swing_pct: Option<f64>,
}

impl StrategySnapshot {
    /// Level the SWING stop rule would use for the given side.
    pub fn protected_swing_for(&self, side: Side) -> Option<f64> {
        match side {
            Side::Long => self.protected_swing_low,
            Side::Short => self.protected_swing_high,
        }
    }
}

/// Compute a snapshot from the confirmed run. `None` when the Supertrend has
/// not warmed up or the last close is unusable; callers must treat that as
/// "not enough data", not as a neutral opinion.
pub fn compute(candles: &[Candle], params: &IndicatorParams) -> Option<StrategySnapshot> {
    let last = candles.last()?;
    let price = last.close;
    if !price.is_finite() || price <= 0.0 {
        return None;
    }

    let st = supertrend_last(candles, params.supertrend_period, params.supertrend_multiplier)?;

    let sma200 = sma(candles, params.sma_period);
    let ema1000 = ema(candles, params.ema_period);

    let structure: StructureAnalysis =
        analyze_structure(candles, params.swing_lookback, params.structure_scan);

    let protected_swing = match st.direction {
        Side::Long => structure.protected_swing_low,
        Side::Short => structure.protected_swing_high,
    };

    Some(StrategySnapshot {
        supertrend_direction: st.direction,
        supertrend_value: st.value,
        sma200,
        ema1000,
        close_above_sma200: sma200.map(|v| price > v),
        close_above_ema1000: ema1000.map(|v| price > v),
        structure_bias: structure.bias_or_neutral(),
        trend: structure.trend_or_ranging(),
        last_bos: structure.last_bos,
        last_choch: structure.last_choch,
        protected_swing_high: structure.protected_swing_high,
        protected_swing_low: structure.protected_swing_low,
        price,
        distance_to_supertrend_pct: distance_pct(price, st.value),
        distance_to_sma200_pct: sma200.and_then(|v| distance_pct(price, v)),
        distance_to_ema1000_pct: ema1000.and_then(|v| distance_pct(price, v)),
        distance_to_protected_swing_pct: protected_swing.and_then(|v| distance_pct(price, v)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rising(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + i as f64 * 0.5;
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
            })
            .collect()
    }

    #[test]
    fn short_buffer_yields_none() {
        let params = IndicatorParams::default();
        assert!(compute(&rising(5), &params).is_none());
    }

    #[test]
    fn snapshot_is_deterministic() {
        let params = IndicatorParams {
            sma_period: 20,
            ema_period: 30,
            ..IndicatorParams::default()
        };
        let cs = rising(120);
        let a = compute(&cs, &params).unwrap();
        let b = compute(&cs, &params).unwrap();
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn rising_market_reads_long_above_mas() {
        let params = IndicatorParams {
            sma_period: 20,
            ema_period: 30,
            ..IndicatorParams::default()
        };
        let snapshot = compute(&rising(120), &params).unwrap();
        assert_eq!(snapshot.supertrend_direction, Side::Long);
        assert_eq!(snapshot.close_above_sma200, Some(true));
        assert_eq!(snapshot.close_above_ema1000, Some(true));
        // Price above the band: positive signed distance.
        assert!(snapshot.distance_to_supertrend_pct.unwrap() > 0.0);
    }

    #[test]
    fn warmup_accounts_for_longest_period() {
        let params = IndicatorParams::default();
        assert_eq!(params.warmup(), 1000);
    }
}
