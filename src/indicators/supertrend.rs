//! ATR-based Supertrend band.
//!
//! The band value alternates between acting as support (below price, LONG)
//! and resistance (above price, SHORT). Output is one direction + value per
//! candle once warmup completes.

use serde::{Deserialize, Serialize};

use crate::market::candle::Candle;
use crate::models::Side;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SupertrendPoint {
    pub direction: Side,
    pub value: f64,
}

/// Wilder-smoothed average true range series. `out[i]` is `None` during
/// warmup (first `period` candles).
pub fn atr(candles: &[Candle], period: usize) -> Vec<Option<f64>> {
    let n = candles.len();
    let mut out = vec![None; n];
    if period == 0 || n <= period {
        return out;
    }

    let tr = |i: usize| -> f64 {
        let c = &candles[i];
        if i == 0 {
            return c.high - c.low;
        }
        let prev_close = candles[i - 1].close;
        (c.high - c.low)
            .max((c.high - prev_close).abs())
            .max((c.low - prev_close).abs())
    };

    // Seed with the arithmetic mean of the first `period` true ranges.
    let mut value = (1..=period).map(tr).sum::<f64>() / period as f64;
    out[period] = Some(value);
    for i in (period + 1)..n {
        value = (value * (period as f64 - 1.0) + tr(i)) / period as f64;
        out[i] = Some(value);
    }
    out
}

/// Supertrend series. `out[i]` is `None` until the ATR warms up.
pub fn supertrend(candles: &[Candle], period: usize, multiplier: f64) -> Vec<Option<SupertrendPoint>> {
    let n = candles.len();
    let mut out = vec![None; n];
    if period == 0 || multiplier <= 0.0 || n <= period {
        return out;
    }

    let atr_series = atr(candles, period);

    let mut prev_upper = f64::NAN;
    let mut prev_lower = f64::NAN;
    let mut prev_dir: Option<Side> = None;

    for i in period..n {
        let Some(atr_v) = atr_series[i] else { continue };
        let c = &candles[i];
        let mid = (c.high + c.low) / 2.0;
        let basic_upper = mid + multiplier * atr_v;
        let basic_lower = mid - multiplier * atr_v;

        let prev_close = candles[i - 1].close;

        // Band ratchet: bands only tighten unless price closed through them.
        let upper = if prev_upper.is_nan() || basic_upper < prev_upper || prev_close > prev_upper {
            basic_upper
        } else {
            prev_upper
        };
        let lower = if prev_lower.is_nan() || basic_lower > prev_lower || prev_close < prev_lower {
            basic_lower
        } else {
            prev_lower
        };

        let direction = match prev_dir {
            None => {
                if c.close >= lower {
                    Side::Long
                } else {
                    Side::Short
                }
            }
            Some(Side::Long) => {
                if c.close < lower {
                    Side::Short
                } else {
                    Side::Long
                }
            }
            Some(Side::Short) => {
                if c.close > upper {
                    Side::Long
                } else {
                    Side::Short
                }
            }
        };

        let value = match direction {
            Side::Long => lower,
            Side::Short => upper,
        };

        if value.is_finite() {
            out[i] = Some(SupertrendPoint { direction, value });
        }

        prev_upper = upper;
        prev_lower = lower;
        prev_dir = Some(direction);
    }

    out
}

/// Latest supertrend point, if warmup is complete.
pub fn supertrend_last(
    candles: &[Candle],
    period: usize,
    multiplier: f64,
) -> Option<SupertrendPoint> {
    supertrend(candles, period, multiplier).last().copied().flatten()
}
