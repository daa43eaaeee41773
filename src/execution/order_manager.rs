//! Order bookkeeping: idempotent submission, fill tracking from the private
//! stream, and cancel plumbing.
//!
//! Every order gets a local link id before it leaves the process; the venue
//! treats the link id as the idempotency key, and so does the local map — a
//! duplicate submit returns the prior record without touching the exchange.

use anyhow::Result;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::events::{Event, EventLog, EventType};
use crate::exchange::throttle::DeadlineExceeded;
use crate::exchange::types::{OrderKind, PlaceOrderRequest};
use crate::exchange::ExchangeApi;
use crate::storage::{AgentDb, OrderRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Unknown,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Unknown => "UNKNOWN",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    /// Venue order-status strings from the private stream.
    pub fn from_stream(s: &str) -> Option<Self> {
        match s {
            "New" | "Created" | "Untriggered" => Some(OrderStatus::New),
            "PartiallyFilled" => Some(OrderStatus::PartiallyFilled),
            "Filled" => Some(OrderStatus::Filled),
            "Cancelled" | "Deactivated" | "PartiallyFilledCanceled" => Some(OrderStatus::Cancelled),
            "Rejected" => Some(OrderStatus::Rejected),
            _ => None,
        }
    }
}

/// What the executor wants sent.
#[derive(Debug, Clone)]
pub struct OrderSubmit {
    pub symbol: String,
    /// Exchange order side ("Buy" | "Sell"); already flipped for
    /// reduce-only exits.
    pub order_side: String,
    pub kind: OrderKind,
    pub qty: f64,
    pub price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub reduce_only: bool,
    pub trade_id: Option<String>,
    pub is_entry: bool,
    pub is_exit: bool,
    /// Explicit idempotency key; generated when absent.
    pub link_id: Option<String>,
}

/// Broadcast on every terminal fill.
#[derive(Debug, Clone)]
pub struct OrderFill {
    pub link_id: String,
    pub trade_id: Option<String>,
    pub symbol: String,
    pub avg_price: f64,
    pub qty: f64,
    pub is_entry: bool,
    pub is_exit: bool,
}

/// Parsed private-stream order update.
#[derive(Debug, Clone)]
pub struct OrderStreamUpdate {
    pub link_id: String,
    pub status: OrderStatus,
    pub avg_price: Option<f64>,
    pub filled_qty: Option<f64>,
}

pub struct OrderManager {
    exchange: Arc<dyn ExchangeApi>,
    db: Arc<AgentDb>,
    events: EventLog,
    orders: RwLock<HashMap<String, OrderRecord>>,
    fill_tx: broadcast::Sender<OrderFill>,
}

impl OrderManager {
    pub fn new(exchange: Arc<dyn ExchangeApi>, db: Arc<AgentDb>, events: EventLog) -> Self {
        let (fill_tx, _) = broadcast::channel(256);
        Self {
            exchange,
            db,
            events,
            orders: RwLock::new(HashMap::new()),
            fill_tx,
        }
    }

    pub fn subscribe_fills(&self) -> broadcast::Receiver<OrderFill> {
        self.fill_tx.subscribe()
    }

    pub fn get(&self, link_id: &str) -> Option<OrderRecord> {
        self.orders.read().get(link_id).cloned()
    }

    pub fn open_orders_for_symbol(&self, symbol: &str) -> Vec<OrderRecord> {
        self.orders
            .read()
            .values()
            .filter(|o| {
                o.symbol == symbol
                    && matches!(o.status.as_str(), "NEW" | "PARTIALLY_FILLED" | "UNKNOWN")
            })
            .cloned()
            .collect()
    }

    /// Submit one order. A repeat submit with the same link id is a no-op
    /// returning the prior record.
    pub async fn submit(&self, submit: OrderSubmit) -> Result<OrderRecord> {
        let link_id = submit
            .link_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if let Some(existing) = self.orders.read().get(&link_id) {
            debug!(link_id, "duplicate submit; returning prior order");
            return Ok(existing.clone());
        }

        let request = PlaceOrderRequest {
            symbol: submit.symbol.clone(),
            side: submit.order_side.clone(),
            kind: submit.kind,
            qty: submit.qty,
            price: submit.price,
            stop_loss: submit.stop_loss,
            take_profit: submit.take_profit,
            reduce_only: submit.reduce_only,
            link_id: link_id.clone(),
        };

        let now = Utc::now().timestamp_millis();
        let mut record = OrderRecord {
            local_id: link_id.clone(),
            trade_id: submit.trade_id.clone(),
            symbol: submit.symbol.clone(),
            side: submit.order_side.clone(),
            order_type: submit.kind.as_str().to_string(),
            qty: submit.qty,
            price: submit.price,
            reduce_only: submit.reduce_only,
            is_entry: submit.is_entry,
            is_exit: submit.is_exit,
            is_stop: submit.stop_loss.is_some(),
            status: OrderStatus::New.as_str().to_string(),
            avg_fill_price: None,
            filled_qty: 0.0,
            created_at: now,
            updated_at: now,
        };

        match self.exchange.place_order(&request).await {
            Ok(_ack) => {
                self.orders.write().insert(link_id.clone(), record.clone());
                if let Err(e) = self.db.insert_order(&record).await {
                    warn!(error = %e, "order persist failed");
                }
                self.events
                    .emit(
                        Event::new(
                            EventType::OrderPlaced,
                            format!(
                                "{} {} {} {:.6} @ {}",
                                submit.symbol,
                                submit.order_side,
                                submit.kind.as_str(),
                                submit.qty,
                                submit
                                    .price
                                    .map(|p| p.to_string())
                                    .unwrap_or_else(|| "market".to_string()),
                            ),
                        )
                        .with_symbol(&submit.symbol)
                        .with_payload(serde_json::json!({
                            "linkId": link_id,
                            "reduceOnly": submit.reduce_only,
                            "stopLoss": submit.stop_loss,
                            "takeProfit": submit.take_profit,
                        })),
                    )
                    .await;
                Ok(record)
            }
            Err(e) => {
                if e.downcast_ref::<DeadlineExceeded>().is_some() {
                    // Fate unknown: keep the order and let the private feed
                    // or a realtime poll reconcile it.
                    record.status = OrderStatus::Unknown.as_str().to_string();
                    self.orders.write().insert(link_id.clone(), record.clone());
                    let _ = self.db.insert_order(&record).await;
                    self.events
                        .emit(
                            Event::new(
                                EventType::OrderUnknown,
                                format!("{} order {} timed out; reconciling", submit.symbol, link_id),
                            )
                            .with_symbol(&submit.symbol),
                        )
                        .await;
                }
                Err(e)
            }
        }
    }

    /// Apply one private-stream order update.
    pub async fn handle_stream_update(&self, update: OrderStreamUpdate) {
        let fill = {
            let mut orders = self.orders.write();
            let Some(record) = orders.get_mut(&update.link_id) else {
                debug!(link_id = %update.link_id, "stream update for unknown order");
                return;
            };
            // Terminal states never regress.
            if matches!(record.status.as_str(), "FILLED" | "CANCELLED" | "REJECTED") {
                return;
            }
            record.status = update.status.as_str().to_string();
            if let Some(avg) = update.avg_price {
                record.avg_fill_price = Some(avg);
            }
            if let Some(filled) = update.filled_qty {
                record.filled_qty = filled;
            }
            record.updated_at = Utc::now().timestamp_millis();

            if update.status == OrderStatus::Filled {
                Some(OrderFill {
                    link_id: record.local_id.clone(),
                    trade_id: record.trade_id.clone(),
                    symbol: record.symbol.clone(),
                    avg_price: record.avg_fill_price.unwrap_or(record.price.unwrap_or(0.0)),
                    qty: if record.filled_qty > 0.0 {
                        record.filled_qty
                    } else {
                        record.qty
                    },
                    is_entry: record.is_entry,
                    is_exit: record.is_exit,
                })
            } else {
                None
            }
        };

        if let Some(record) = self.get(&update.link_id) {
            let _ = self
                .db
                .update_order_status(
                    &record.local_id,
                    &record.status,
                    record.avg_fill_price,
                    record.filled_qty,
                    record.updated_at,
                )
                .await;
        }

        match update.status {
            OrderStatus::Filled => {
                if let Some(fill) = fill {
                    self.events
                        .emit(
                            Event::new(
                                EventType::OrderFilled,
                                format!(
                                    "{} order filled at {:.4} (qty {:.6})",
                                    fill.symbol, fill.avg_price, fill.qty
                                ),
                            )
                            .with_symbol(&fill.symbol)
                            .with_payload(serde_json::json!({
                                "linkId": fill.link_id,
                                "tradeId": fill.trade_id,
                                "avgFillPrice": fill.avg_price,
                            })),
                        )
                        .await;
                    let _ = self.fill_tx.send(fill);
                }
            }
            OrderStatus::Cancelled => {
                self.events
                    .emit(
                        Event::new(
                            EventType::OrderCancelled,
                            format!("order {} cancelled", update.link_id),
                        ),
                    )
                    .await;
            }
            _ => {}
        }
    }

    pub async fn cancel(&self, symbol: &str, link_id: &str) -> Result<()> {
        self.exchange.cancel_order(symbol, link_id).await?;
        let mut orders = self.orders.write();
        if let Some(record) = orders.get_mut(link_id) {
            if !matches!(record.status.as_str(), "FILLED" | "REJECTED") {
                record.status = OrderStatus::Cancelled.as_str().to_string();
                record.updated_at = Utc::now().timestamp_millis();
            }
        }
        Ok(())
    }

    pub async fn cancel_all_for_symbol(&self, symbol: &str) -> Result<()> {
        self.exchange.cancel_all_orders(symbol).await?;
        let now = Utc::now().timestamp_millis();
        let mut orders = self.orders.write();
        for record in orders.values_mut() {
            if record.symbol == symbol
                && matches!(record.status.as_str(), "NEW" | "PARTIALLY_FILLED" | "UNKNOWN")
            {
                record.status = OrderStatus::Cancelled.as_str().to_string();
                record.updated_at = now;
            }
        }
        Ok(())
    }
}
