//! Execution pipeline: contract building, order/position bookkeeping, the
//! two-layer stop, trailing, and the executor that ties them to the feeds.

pub mod contract;
pub mod executor;
pub mod order_manager;
pub mod position_tracker;
pub mod sl_manager;
pub mod trailing;


pub use contract::{build_contract, BuildContext, TradeContract};
pub use executor::{ActiveTrade, CloseReason, ExecConfig, ExecError, Executor};
pub use order_manager::{OrderFill, OrderManager, OrderStatus, OrderStreamUpdate, OrderSubmit};
pub use position_tracker::{PositionEvent, PositionTracker, PositionUpdate, TrackedPosition};
pub use sl_manager::{SlLevels, SlManager, SlUpdate};
pub use trailing::TrailingManager;
