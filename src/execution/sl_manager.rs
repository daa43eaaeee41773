//! Two-layer stop-loss bookkeeping.
//!
//! Per open trade: the Strategic SL is the decision level, checked only on
//! confirmed candle closes; the Emergency SL is the exchange-preset trigger,
//! buffered beyond the strategic level to absorb wicks. Updates only ever
//! move the stop in the position's favor; a failed exchange call leaves the
//! stored levels untouched so the next close retries.

use anyhow::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::exchange::ExchangeApi;
use crate::models::Side;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SlLevels {
    pub strategic: f64,
    pub emergency: f64,
    pub buffer_pct: f64,
}

#[derive(Debug, Clone)]
struct SlEntry {
    symbol: String,
    side: Side,
    levels: SlLevels,
}

/// Outcome of a strategic-SL update attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SlUpdate {
    /// Candidate would not improve the stop; nothing changed.
    Ignored,
    /// Stop moved; new levels are committed and on the exchange.
    Updated(SlLevels),
}

pub struct SlManager {
    exchange: Arc<dyn ExchangeApi>,
    entries: RwLock<HashMap<String, SlEntry>>,
}

impl SlManager {
    pub fn new(exchange: Arc<dyn ExchangeApi>) -> Self {
        Self {
            exchange,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(
        &self,
        trade_id: &str,
        symbol: &str,
        side: Side,
        strategic: f64,
        emergency: f64,
        buffer_pct: f64,
    ) {
        self.entries.write().insert(
            trade_id.to_string(),
            SlEntry {
                symbol: symbol.to_string(),
                side,
                levels: SlLevels {
                    strategic,
                    emergency,
                    buffer_pct,
                },
            },
        );
    }

    pub fn release(&self, trade_id: &str) {
        self.entries.write().remove(trade_id);
    }

    pub fn levels(&self, trade_id: &str) -> Option<SlLevels> {
        self.entries.read().get(trade_id).map(|e| e.levels)
    }

    /// Close-based strategic check: LONG triggers below the level, SHORT
    /// above. Pure read; the executor owns the resulting close.
    pub fn strategic_triggered(&self, trade_id: &str, close: f64) -> bool {
        let entries = self.entries.read();
        let Some(entry) = entries.get(trade_id) else {
            return false;
        };
        match entry.side {
            Side::Long => close < entry.levels.strategic,
            Side::Short => close > entry.levels.strategic,
        }
    }

    fn emergency_for(side: Side, strategic: f64, buffer_pct: f64) -> f64 {
        match side {
            Side::Long => strategic * (1.0 - buffer_pct / 100.0),
            Side::Short => strategic * (1.0 + buffer_pct / 100.0),
        }
    }

    /// Move the strategic stop to `candidate` if that improves it.
    ///
    /// Wrong-direction candidates are silently ignored and do not touch the
    /// emergency level. On a favorable move the emergency level is recomputed
    /// with the stored buffer and pushed to the exchange in one call; the new
    /// levels commit only after the exchange accepts them.
    pub async fn update_strategic(&self, trade_id: &str, candidate: f64) -> Result<SlUpdate> {
        let staged = {
            let entries = self.entries.read();
            let Some(entry) = entries.get(trade_id) else {
                return Ok(SlUpdate::Ignored);
            };
            let improves = match entry.side {
                Side::Long => candidate > entry.levels.strategic,
                Side::Short => candidate < entry.levels.strategic,
            };
            if !improves || !candidate.is_finite() {
                return Ok(SlUpdate::Ignored);
            }
            let emergency = Self::emergency_for(entry.side, candidate, entry.levels.buffer_pct);
            (
                entry.symbol.clone(),
                SlLevels {
                    strategic: candidate,
                    emergency,
                    buffer_pct: entry.levels.buffer_pct,
                },
            )
        };

        let (symbol, new_levels) = staged;
        if let Err(e) = self
            .exchange
            .set_stop_loss(&symbol, Some(new_levels.emergency))
            .await
        {
            warn!(trade_id, symbol = %symbol, error = %e, "emergency SL move failed; keeping prior levels");
            return Err(e);
        }

        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(trade_id) {
            // Re-check in favor under the write lock; a concurrent update may
            // have moved the stop further already.
            let still_improves = match entry.side {
                Side::Long => new_levels.strategic > entry.levels.strategic,
                Side::Short => new_levels.strategic < entry.levels.strategic,
            };
            if still_improves {
                entry.levels = new_levels;
                return Ok(SlUpdate::Updated(new_levels));
            }
        }
        Ok(SlUpdate::Ignored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::MockExchange;
    use std::sync::atomic::Ordering;

    fn manager() -> (Arc<MockExchange>, SlManager) {
        let exchange = Arc::new(MockExchange::default());
        let manager = SlManager::new(exchange.clone());
        (exchange, manager)
    }

    #[tokio::test]
    async fn favorable_long_update_moves_both_layers() {
        let (exchange, sl) = manager();
        sl.register("t1", "BTCUSDT", Side::Long, 96.0, 92.16, 4.0);

        let result = sl.update_strategic("t1", 97.0).await.unwrap();
        let SlUpdate::Updated(levels) = result else {
            panic!("expected update");
        };
        assert_eq!(levels.strategic, 97.0);
        assert!((levels.emergency - 93.12).abs() < 1e-9);

        let calls = exchange.sl_calls.lock();
        assert_eq!(calls.len(), 1);
        assert!((calls[0].1.unwrap() - 93.12).abs() < 1e-9);
    }

    #[tokio::test]
    async fn wrong_direction_update_is_silently_ignored() {
        let (exchange, sl) = manager();
        sl.register("t1", "BTCUSDT", Side::Long, 96.0, 92.16, 4.0);

        assert_eq!(sl.update_strategic("t1", 95.0).await.unwrap(), SlUpdate::Ignored);
        assert_eq!(sl.levels("t1").unwrap().strategic, 96.0);
        assert!((sl.levels("t1").unwrap().emergency - 92.16).abs() < 1e-9);
        assert!(exchange.sl_calls.lock().is_empty());
    }

    #[tokio::test]
    async fn short_update_moves_down_only() {
        let (_, sl) = manager();
        sl.register("t1", "ETHUSDT", Side::Short, 104.0, 108.16, 4.0);

        assert_eq!(sl.update_strategic("t1", 105.0).await.unwrap(), SlUpdate::Ignored);
        let SlUpdate::Updated(levels) = sl.update_strategic("t1", 102.0).await.unwrap() else {
            panic!("expected update");
        };
        assert_eq!(levels.strategic, 102.0);
        assert!((levels.emergency - 106.08).abs() < 1e-9);
    }

    #[tokio::test]
    async fn exchange_failure_keeps_prior_levels_for_retry() {
        let (exchange, sl) = manager();
        sl.register("t1", "BTCUSDT", Side::Long, 96.0, 92.16, 4.0);
        exchange.fail_sl.store(true, Ordering::SeqCst);

        assert!(sl.update_strategic("t1", 97.0).await.is_err());
        // Prior levels intact: the same candidate improves again next close.
        assert_eq!(sl.levels("t1").unwrap().strategic, 96.0);

        exchange.fail_sl.store(false, Ordering::SeqCst);
        let result = sl.update_strategic("t1", 97.0).await.unwrap();
        assert!(matches!(result, SlUpdate::Updated(_)));
    }

    #[tokio::test]
    async fn strategic_trigger_is_close_based() {
        let (_, sl) = manager();
        sl.register("long", "BTCUSDT", Side::Long, 96.0, 92.16, 4.0);
        sl.register("short", "ETHUSDT", Side::Short, 104.0, 108.16, 4.0);

        assert!(!sl.strategic_triggered("long", 96.0));
        assert!(!sl.strategic_triggered("long", 96.5));
        assert!(sl.strategic_triggered("long", 95.5));

        assert!(!sl.strategic_triggered("short", 104.0));
        assert!(sl.strategic_triggered("short", 104.5));

        assert!(!sl.strategic_triggered("missing", 1.0));
    }

    #[tokio::test]
    async fn user_fixed_price_keeps_zero_buffer_on_updates() {
        let (_, sl) = manager();
        sl.register("t1", "BTCUSDT", Side::Long, 95.0, 95.0, 0.0);
        let SlUpdate::Updated(levels) = sl.update_strategic("t1", 97.0).await.unwrap() else {
            panic!("expected update");
        };
        assert_eq!(levels.strategic, 97.0);
        assert_eq!(levels.emergency, 97.0);
    }

    #[tokio::test]
    async fn release_forgets_the_trade() {
        let (_, sl) = manager();
        sl.register("t1", "BTCUSDT", Side::Long, 96.0, 92.16, 4.0);
        sl.release("t1");
        assert!(sl.levels("t1").is_none());
        assert_eq!(sl.update_strategic("t1", 99.0).await.unwrap(), SlUpdate::Ignored);
    }
}
