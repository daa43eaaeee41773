//! Perpagent backend library.
//!
//! Single-account automated perpetual-futures trading agent: candle-driven
//! strategy state, gated trade execution with a two-layer stop, trailing,
//! revenge-trade lockout, and a daily-loss circuit breaker.

pub mod agent;
pub mod api;
pub mod events;
pub mod exchange;
pub mod execution;
pub mod indicators;
pub mod market;
pub mod models;
pub mod storage;
pub mod strategy;

pub use api::AppState;
pub use models::Config;
