//! Simple and exponential moving averages over confirmed closes.

use crate::market::candle::Candle;

/// Arithmetic mean of the last `period` closes. `None` until enough data.
pub fn sma(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period {
        return None;
    }
    let sum: f64 = candles[candles.len() - period..]
        .iter()
        .map(|c| c.close)
        .sum();
    let value = sum / period as f64;
    value.is_finite().then_some(value)
}

/// SMA-seeded EMA.
///
/// The first `period` closes seed the average, then
/// `ema = close * k + ema * (1 - k)` with `k = 2 / (period + 1)`.
/// Last-value seeding drifts badly for long periods (1000), hence the seed.
pub fn ema(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period {
        return None;
    }
    let k = 2.0 / (period as f64 + 1.0);
    let seed: f64 = candles[..period].iter().map(|c| c.close).sum::<f64>() / period as f64;
    let mut value = seed;
    for c in &candles[period..] {
        value = c.close * k + value * (1.0 - k);
    }
    value.is_finite().then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::candle::Candle;

    fn candles(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                symbol: "BTCUSDT".to_string(),
                interval: "15".to_string(),
                open_time_ms: 1_700_000_000_000 + i as i64 * 900_000,
                close_time_ms: 1_700_000_000_000 + (i as i64 + 1) * 900_000,
                open: close,
                high: close,
                low: close,
                close,
                volume: 1.0,
            })
            .collect()
    }

    #[test]
    fn sma_short_input_is_none() {
        assert_eq!(sma(&candles(&[1.0, 2.0]), 3), None);
        assert_eq!(sma(&candles(&[1.0, 2.0]), 0), None);
    }

    #[test]
    fn sma_uses_trailing_window() {
        let cs = candles(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(sma(&cs, 3), Some(4.0));
        assert_eq!(sma(&cs, 5), Some(3.0));
    }

    #[test]
    fn ema_equals_sma_at_seed_boundary() {
        let cs = candles(&[2.0, 4.0, 6.0]);
        assert_eq!(ema(&cs, 3), Some(4.0));
    }

    #[test]
    fn ema_applies_smoothing_after_seed() {
        // seed = (2+4+6)/3 = 4, k = 0.5, next close 8 -> 8*0.5 + 4*0.5 = 6
        let cs = candles(&[2.0, 4.0, 6.0, 8.0]);
        assert_eq!(ema(&cs, 3), Some(6.0));
    }

    #[test]
    fn ema_converges_toward_constant_series() {
        let cs = candles(&[50.0; 1200]);
        let v = ema(&cs, 1000).unwrap();
        assert!((v - 50.0).abs() < 1e-9);
    }
}
