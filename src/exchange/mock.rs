//! In-memory exchange double for core tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use super::types::{
    InstrumentInfo, OpenOrder, OrderAck, PlaceOrderRequest, PositionInfo, Ticker,
};
use super::ExchangeApi;
use crate::market::candle::Candle;

pub struct MockExchange {
    pub balance: Mutex<f64>,
    pub ticker: Mutex<Ticker>,
    pub instrument: InstrumentInfo,
    pub positions: Mutex<Vec<PositionInfo>>,
    pub klines: Mutex<Vec<Candle>>,
    pub placed: Mutex<Vec<PlaceOrderRequest>>,
    pub sl_calls: Mutex<Vec<(String, Option<f64>)>>,
    pub tp_calls: Mutex<Vec<(String, Option<f64>)>>,
    pub leverage_calls: Mutex<Vec<(String, f64)>>,
    pub cancelled: Mutex<Vec<String>>,
    pub fail_place: AtomicBool,
    pub fail_sl: AtomicBool,
}

impl Default for MockExchange {
    fn default() -> Self {
        Self {
            balance: Mutex::new(1000.0),
            ticker: Mutex::new(Ticker {
                last: 100.0,
                mark: 100.0,
                bid: 99.9,
                ask: 100.1,
            }),
            instrument: InstrumentInfo {
                min_order_qty: 0.001,
                qty_step: 0.001,
                tick_size: 0.01,
                max_leverage: 100.0,
            },
            positions: Mutex::new(Vec::new()),
            klines: Mutex::new(Vec::new()),
            placed: Mutex::new(Vec::new()),
            sl_calls: Mutex::new(Vec::new()),
            tp_calls: Mutex::new(Vec::new()),
            leverage_calls: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            fail_place: AtomicBool::new(false),
            fail_sl: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ExchangeApi for MockExchange {
    async fn get_klines(&self, _symbol: &str, _interval: &str, _limit: usize) -> Result<Vec<Candle>> {
        Ok(self.klines.lock().clone())
    }

    async fn get_ticker(&self, _symbol: &str) -> Result<Ticker> {
        Ok(*self.ticker.lock())
    }

    async fn get_instrument_info(&self, _symbol: &str) -> Result<InstrumentInfo> {
        Ok(self.instrument)
    }

    async fn get_wallet_balance(&self) -> Result<f64> {
        Ok(*self.balance.lock())
    }

    async fn get_positions(&self, symbol: Option<&str>) -> Result<Vec<PositionInfo>> {
        let positions = self.positions.lock().clone();
        Ok(match symbol {
            Some(s) => positions.into_iter().filter(|p| p.symbol == s).collect(),
            None => positions,
        })
    }

    async fn set_leverage(&self, symbol: &str, leverage: f64) -> Result<()> {
        self.leverage_calls.lock().push((symbol.to_string(), leverage));
        Ok(())
    }

    async fn place_order(&self, req: &PlaceOrderRequest) -> Result<OrderAck> {
        if self.fail_place.load(Ordering::SeqCst) {
            return Err(anyhow!("order rejected (mock)"));
        }
        // Idempotency: same link id returns the prior ack without recording.
        let mut placed = self.placed.lock();
        if !placed.iter().any(|p| p.link_id == req.link_id) {
            placed.push(req.clone());
        }
        Ok(OrderAck {
            order_id: format!("mock-{}", req.link_id),
            link_id: req.link_id.clone(),
        })
    }

    async fn set_stop_loss(&self, symbol: &str, price: Option<f64>) -> Result<()> {
        if self.fail_sl.load(Ordering::SeqCst) {
            return Err(anyhow!("sl set rejected (mock)"));
        }
        self.sl_calls.lock().push((symbol.to_string(), price));
        Ok(())
    }

    async fn set_take_profit(&self, symbol: &str, price: Option<f64>) -> Result<()> {
        self.tp_calls.lock().push((symbol.to_string(), price));
        Ok(())
    }

    async fn cancel_order(&self, _symbol: &str, link_id: &str) -> Result<()> {
        self.cancelled.lock().push(link_id.to_string());
        Ok(())
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<()> {
        self.cancelled.lock().push(format!("all:{}", symbol));
        Ok(())
    }

    async fn get_open_orders(&self, _symbol: &str) -> Result<Vec<OpenOrder>> {
        Ok(Vec::new())
    }
}
