//! Pure indicator functions over confirmed candle runs.
//!
//! Nothing here suspends, allocates global state, or reads the clock; every
//! function is a deterministic map from a candle slice to values. Short or
//! NaN-contaminated input degrades to `None`, never to a guess.

pub mod moving_average;
pub mod structure;
pub mod supertrend;

pub use moving_average::{ema, sma};
pub use structure::{analyze as analyze_structure, StructureAnalysis, StructureBias, TrendLabel};
pub use supertrend::{supertrend, supertrend_last, SupertrendPoint};
