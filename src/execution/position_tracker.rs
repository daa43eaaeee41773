//! Mirror of exchange positions.
//!
//! The exchange private feed is the source of truth; this tracker only
//! shadows it and turns raw updates into opened/updated/closed/pnl events.
//! Local state is replaced, never merged, on every update.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::debug;

use crate::exchange::types::PositionInfo;
use crate::models::Side;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedPosition {
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub avg_price: f64,
    pub mark_price: Option<f64>,
    pub unrealized_pnl: Option<f64>,
    pub leverage: Option<f64>,
    pub liq_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

/// One parsed private-feed position message. `size == 0` means flat.
#[derive(Debug, Clone)]
pub struct PositionUpdate {
    pub symbol: String,
    pub side: Option<Side>,
    pub size: f64,
    pub avg_price: Option<f64>,
    pub mark_price: Option<f64>,
    pub unrealized_pnl: Option<f64>,
    /// Realized PnL reported with the closing update.
    pub realized_pnl: Option<f64>,
    pub leverage: Option<f64>,
    pub liq_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

impl From<PositionInfo> for PositionUpdate {
    fn from(info: PositionInfo) -> Self {
        PositionUpdate {
            symbol: info.symbol,
            side: Some(info.side),
            size: info.size,
            avg_price: Some(info.avg_price),
            mark_price: info.mark_price,
            unrealized_pnl: info.unrealised_pnl,
            realized_pnl: None,
            leverage: info.leverage,
            liq_price: info.liq_price,
            stop_loss: info.stop_loss,
            take_profit: info.take_profit,
        }
    }
}

#[derive(Debug, Clone)]
pub enum PositionEvent {
    Opened(TrackedPosition),
    Updated(TrackedPosition),
    Closed {
        last: TrackedPosition,
        realized_pnl: Option<f64>,
    },
    Pnl {
        symbol: String,
        unrealized_pnl: f64,
    },
}

pub struct PositionTracker {
    positions: RwLock<HashMap<String, TrackedPosition>>,
    event_tx: broadcast::Sender<PositionEvent>,
    /// Minimum unrealized-PnL change (USD) worth an event.
    pnl_delta: f64,
}

impl PositionTracker {
    pub fn new(pnl_delta: f64) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            positions: RwLock::new(HashMap::new()),
            event_tx,
            pnl_delta: pnl_delta.max(0.0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PositionEvent> {
        self.event_tx.subscribe()
    }

    pub fn get(&self, symbol: &str) -> Option<TrackedPosition> {
        self.positions.read().get(symbol).cloned()
    }

    pub fn list(&self) -> Vec<TrackedPosition> {
        self.positions.read().values().cloned().collect()
    }

    pub fn has_position(&self, symbol: &str) -> bool {
        self.positions.read().contains_key(symbol)
    }

    /// Apply one private-feed update.
    pub fn apply(&self, update: PositionUpdate) {
        let mut events: Vec<PositionEvent> = Vec::new();
        {
            let mut positions = self.positions.write();
            let previous = positions.get(&update.symbol).cloned();

            if update.size <= 0.0 {
                if let Some(last) = previous {
                    positions.remove(&update.symbol);
                    events.push(PositionEvent::Closed {
                        last,
                        realized_pnl: update.realized_pnl,
                    });
                }
            } else {
                let Some(side) = update.side else {
                    debug!(symbol = %update.symbol, "position update without side; skipping");
                    return;
                };
                let tracked = TrackedPosition {
                    symbol: update.symbol.clone(),
                    side,
                    size: update.size,
                    avg_price: update
                        .avg_price
                        .or(previous.as_ref().map(|p| p.avg_price))
                        .unwrap_or(0.0),
                    mark_price: update.mark_price.or(previous.as_ref().and_then(|p| p.mark_price)),
                    unrealized_pnl: update
                        .unrealized_pnl
                        .or(previous.as_ref().and_then(|p| p.unrealized_pnl)),
                    leverage: update.leverage.or(previous.as_ref().and_then(|p| p.leverage)),
                    liq_price: update.liq_price.or(previous.as_ref().and_then(|p| p.liq_price)),
                    stop_loss: update.stop_loss.or(previous.as_ref().and_then(|p| p.stop_loss)),
                    take_profit: update
                        .take_profit
                        .or(previous.as_ref().and_then(|p| p.take_profit)),
                    updated_at: Utc::now(),
                };

                match &previous {
                    None => events.push(PositionEvent::Opened(tracked.clone())),
                    Some(prev) => {
                        let changed = prev.size != tracked.size
                            || prev.stop_loss != tracked.stop_loss
                            || prev.take_profit != tracked.take_profit;
                        if changed {
                            events.push(PositionEvent::Updated(tracked.clone()));
                        }
                        if let (Some(old), Some(new)) =
                            (prev.unrealized_pnl, tracked.unrealized_pnl)
                        {
                            if (new - old).abs() >= self.pnl_delta && self.pnl_delta > 0.0 {
                                events.push(PositionEvent::Pnl {
                                    symbol: tracked.symbol.clone(),
                                    unrealized_pnl: new,
                                });
                            }
                        }
                    }
                }
                positions.insert(update.symbol.clone(), tracked);
            }
        }

        for event in events {
            let _ = self.event_tx.send(event);
        }
    }

    /// Replace the mirror from a REST snapshot (startup and degraded-mode
    /// polling). Symbols that disappeared close with unknown PnL.
    pub fn refresh(&self, current: Vec<PositionInfo>) {
        let mut seen: HashMap<String, PositionUpdate> = HashMap::new();
        for info in current {
            seen.insert(info.symbol.clone(), PositionUpdate::from(info));
        }

        let tracked_symbols: Vec<String> = self.positions.read().keys().cloned().collect();
        for symbol in tracked_symbols {
            if !seen.contains_key(&symbol) {
                self.apply(PositionUpdate {
                    symbol,
                    side: None,
                    size: 0.0,
                    avg_price: None,
                    mark_price: None,
                    unrealized_pnl: None,
                    realized_pnl: None,
                    leverage: None,
                    liq_price: None,
                    stop_loss: None,
                    take_profit: None,
                });
            }
        }
        for (_, update) in seen {
            self.apply(update);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(symbol: &str, size: f64, upnl: Option<f64>) -> PositionUpdate {
        PositionUpdate {
            symbol: symbol.to_string(),
            side: Some(Side::Long),
            size,
            avg_price: Some(100.0),
            mark_price: Some(100.5),
            unrealized_pnl: upnl,
            realized_pnl: None,
            leverage: Some(5.0),
            liq_price: Some(80.0),
            stop_loss: Some(92.0),
            take_profit: None,
        }
    }

    #[tokio::test]
    async fn open_update_close_sequence() {
        let tracker = PositionTracker::new(1.0);
        let mut rx = tracker.subscribe();

        tracker.apply(update("BTCUSDT", 0.5, Some(0.0)));
        assert!(matches!(rx.recv().await.unwrap(), PositionEvent::Opened(_)));
        assert!(tracker.has_position("BTCUSDT"));

        let mut bigger = update("BTCUSDT", 0.7, Some(0.5));
        bigger.stop_loss = Some(93.0);
        tracker.apply(bigger);
        assert!(matches!(rx.recv().await.unwrap(), PositionEvent::Updated(_)));

        let mut closing = update("BTCUSDT", 0.0, None);
        closing.realized_pnl = Some(12.5);
        tracker.apply(closing);
        match rx.recv().await.unwrap() {
            PositionEvent::Closed { last, realized_pnl } => {
                assert_eq!(last.symbol, "BTCUSDT");
                assert_eq!(realized_pnl, Some(12.5));
            }
            other => panic!("expected Closed, got {:?}", other),
        }
        assert!(!tracker.has_position("BTCUSDT"));
    }

    #[tokio::test]
    async fn pnl_events_are_throttled_by_delta() {
        let tracker = PositionTracker::new(5.0);
        let mut rx = tracker.subscribe();

        tracker.apply(update("BTCUSDT", 0.5, Some(0.0)));
        let _ = rx.recv().await.unwrap(); // Opened

        // +2 USD: below delta, no pnl event (and nothing else changed).
        tracker.apply(update("BTCUSDT", 0.5, Some(2.0)));
        // +8 USD: above delta.
        tracker.apply(update("BTCUSDT", 0.5, Some(8.0)));

        match rx.recv().await.unwrap() {
            PositionEvent::Pnl { unrealized_pnl, .. } => assert_eq!(unrealized_pnl, 8.0),
            other => panic!("expected Pnl, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn flat_update_without_position_is_ignored() {
        let tracker = PositionTracker::new(1.0);
        let mut rx = tracker.subscribe();
        tracker.apply(update("BTCUSDT", 0.0, None));
        tracker.apply(update("ETHUSDT", 1.0, Some(0.0)));
        // First event is the ETH open, not a BTC close.
        match rx.recv().await.unwrap() {
            PositionEvent::Opened(p) => assert_eq!(p.symbol, "ETHUSDT"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn refresh_closes_vanished_positions() {
        let tracker = PositionTracker::new(1.0);
        tracker.apply(update("BTCUSDT", 0.5, Some(0.0)));
        tracker.apply(update("ETHUSDT", 1.0, Some(0.0)));
        let mut rx = tracker.subscribe();

        tracker.refresh(vec![PositionInfo {
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            size: 0.5,
            avg_price: 100.0,
            mark_price: Some(101.0),
            unrealised_pnl: Some(0.5),
            leverage: Some(5.0),
            liq_price: None,
            stop_loss: Some(92.0),
            take_profit: None,
        }]);

        match rx.recv().await.unwrap() {
            PositionEvent::Closed { last, .. } => assert_eq!(last.symbol, "ETHUSDT"),
            other => panic!("expected ETH close, got {:?}", other),
        }
        assert!(tracker.has_position("BTCUSDT"));
        assert!(!tracker.has_position("ETHUSDT"));
    }
}
