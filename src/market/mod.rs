//! Market data plumbing: candle buffers and the two exchange streams.

pub mod candle;
pub mod kline_ws;
pub mod private_ws;

pub use candle::{Candle, CandleStore};
pub use kline_ws::{MarketEvent, PublicFeed};
pub use private_ws::{PrivateEvent, PrivateFeed};
