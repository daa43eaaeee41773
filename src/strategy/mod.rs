pub mod engine;
pub mod snapshot;

pub use engine::{evaluate, StateUpdate, StrategyEngine, StrategyState, StrategyTag};
pub use snapshot::{IndicatorParams, StrategySnapshot};
