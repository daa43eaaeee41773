//! Exchange connectivity: signed REST, boundary types, outbound throttle.
//!
//! Components depend on the `ExchangeApi` trait rather than the concrete
//! client so the trading core is testable without a venue.

pub mod rest;
pub mod throttle;
pub mod types;

#[cfg(test)]
pub mod mock;

use anyhow::Result;
use async_trait::async_trait;

use crate::market::candle::Candle;
use types::{InstrumentInfo, OpenOrder, OrderAck, PlaceOrderRequest, PositionInfo, Ticker};

#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn get_klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>>;
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker>;
    async fn get_instrument_info(&self, symbol: &str) -> Result<InstrumentInfo>;
    /// Wallet value summed over all coins by USD value.
    async fn get_wallet_balance(&self) -> Result<f64>;
    async fn get_positions(&self, symbol: Option<&str>) -> Result<Vec<PositionInfo>>;
    /// "Already set" is success.
    async fn set_leverage(&self, symbol: &str, leverage: f64) -> Result<()>;
    /// SL/TP attach atomically with the entry; `link_id` is the idempotency key.
    async fn place_order(&self, req: &PlaceOrderRequest) -> Result<OrderAck>;
    async fn set_stop_loss(&self, symbol: &str, price: Option<f64>) -> Result<()>;
    async fn set_take_profit(&self, symbol: &str, price: Option<f64>) -> Result<()>;
    async fn cancel_order(&self, symbol: &str, link_id: &str) -> Result<()>;
    async fn cancel_all_orders(&self, symbol: &str) -> Result<()>;
    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>>;
}

#[async_trait]
impl ExchangeApi for rest::RestClient {
    async fn get_klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>> {
        rest::RestClient::get_klines(self, symbol, interval, limit).await
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker> {
        rest::RestClient::get_ticker(self, symbol).await
    }

    async fn get_instrument_info(&self, symbol: &str) -> Result<InstrumentInfo> {
        rest::RestClient::get_instrument_info(self, symbol).await
    }

    async fn get_wallet_balance(&self) -> Result<f64> {
        rest::RestClient::get_wallet_balance(self).await
    }

    async fn get_positions(&self, symbol: Option<&str>) -> Result<Vec<PositionInfo>> {
        rest::RestClient::get_positions(self, symbol).await
    }

    async fn set_leverage(&self, symbol: &str, leverage: f64) -> Result<()> {
        rest::RestClient::set_leverage(self, symbol, leverage).await
    }

    async fn place_order(&self, req: &PlaceOrderRequest) -> Result<OrderAck> {
        rest::RestClient::place_order(self, req).await
    }

    async fn set_stop_loss(&self, symbol: &str, price: Option<f64>) -> Result<()> {
        rest::RestClient::set_stop_loss(self, symbol, price).await
    }

    async fn set_take_profit(&self, symbol: &str, price: Option<f64>) -> Result<()> {
        rest::RestClient::set_take_profit(self, symbol, price).await
    }

    async fn cancel_order(&self, symbol: &str, link_id: &str) -> Result<()> {
        rest::RestClient::cancel_order(self, symbol, link_id).await
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<()> {
        rest::RestClient::cancel_all_orders(self, symbol).await
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>> {
        rest::RestClient::get_open_orders(self, symbol).await
    }
}
