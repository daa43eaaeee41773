//! Trailing-stop bookkeeping.
//!
//! On each confirmed close the executor asks for a trail candidate per open
//! trade; the SL manager's in-favor rule guarantees the stop only ratchets.
//! The breakeven helper keeps trailing dormant until price has paid +1R.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::agent::intent::TrailMode;
use crate::models::Side;
use crate::strategy::StrategySnapshot;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailState {
    pub symbol: String,
    pub side: Side,
    pub mode: TrailMode,
    pub active: bool,
    pub entry_price: Option<f64>,
    /// |entry - initial strategic|; the R unit for breakeven arming.
    pub initial_risk: Option<f64>,
}

pub struct TrailingManager {
    trades: RwLock<HashMap<String, TrailState>>,
}

impl TrailingManager {
    pub fn new() -> Self {
        Self {
            trades: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, trade_id: &str, symbol: &str, side: Side, mode: TrailMode, active: bool) {
        self.trades.write().insert(
            trade_id.to_string(),
            TrailState {
                symbol: symbol.to_string(),
                side,
                mode,
                active: active && mode != TrailMode::None,
                entry_price: None,
                initial_risk: None,
            },
        );
    }

    /// Record the fill so the breakeven helper has its R unit.
    pub fn set_entry(&self, trade_id: &str, entry_price: f64, strategic_sl: Option<f64>) {
        let mut trades = self.trades.write();
        if let Some(state) = trades.get_mut(trade_id) {
            state.entry_price = Some(entry_price);
            state.initial_risk = strategic_sl.map(|sl| (entry_price - sl).abs());
        }
    }

    pub fn release(&self, trade_id: &str) {
        self.trades.write().remove(trade_id);
    }

    pub fn state(&self, trade_id: &str) -> Option<TrailState> {
        self.trades.read().get(trade_id).cloned()
    }

    /// User override of the trail mode; switching to NONE deactivates.
    pub fn set_mode(&self, trade_id: &str, mode: TrailMode) -> bool {
        let mut trades = self.trades.write();
        let Some(state) = trades.get_mut(trade_id) else {
            return false;
        };
        state.mode = mode;
        state.active = mode != TrailMode::None;
        true
    }

    /// Drop a trade's trailing to inactive (SL-set failure downgrade).
    pub fn deactivate(&self, trade_id: &str) {
        if let Some(state) = self.trades.write().get_mut(trade_id) {
            state.active = false;
        }
    }

    /// Trail candidate for one trade from a fresh snapshot. `None` when the
    /// trade is not trailing or the reference level is missing.
    pub fn candidate(&self, trade_id: &str, snapshot: &StrategySnapshot) -> Option<f64> {
        let trades = self.trades.read();
        let state = trades.get(trade_id)?;
        if !state.active {
            return None;
        }
        match state.mode {
            TrailMode::None => None,
            TrailMode::Supertrend => Some(snapshot.supertrend_value),
            TrailMode::Structure => match state.side {
                Side::Long => snapshot.protected_swing_low,
                Side::Short => snapshot.protected_swing_high,
            },
        }
    }

    /// Arm a dormant trail once price has reached +1R. Returns true on the
    /// transition, exactly once.
    pub fn maybe_arm_breakeven(&self, trade_id: &str, price: f64) -> bool {
        let mut trades = self.trades.write();
        let Some(state) = trades.get_mut(trade_id) else {
            return false;
        };
        if state.active || state.mode == TrailMode::None {
            return false;
        }
        let (Some(entry), Some(risk)) = (state.entry_price, state.initial_risk) else {
            return false;
        };
        if risk <= 0.0 {
            return false;
        }
        let armed = match state.side {
            Side::Long => price >= entry + risk,
            Side::Short => price <= entry - risk,
        };
        if armed {
            state.active = true;
        }
        armed
    }
}

impl Default for TrailingManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::structure::{StructureBias, TrendLabel};

    fn snapshot(st_value: f64, swing_low: Option<f64>, swing_high: Option<f64>, price: f64) -> StrategySnapshot {
        StrategySnapshot {
            supertrend_direction: Side::Long,
            supertrend_value: st_value,
            sma200: None,
            ema1000: None,
            close_above_sma200: None,
            close_above_ema1000: None,
            structure_bias: StructureBias::Neutral,
            trend: TrendLabel::Ranging,
            last_bos: None,
            last_choch: None,
            protected_swing_high: swing_high,
            protected_swing_low: swing_low,
            price,
            distance_to_supertrend_pct: None,
            distance_to_sma200_pct: None,
            distance_to_ema1000_pct: None,
            distance_to_protected_swing_pct: None,
        }
    }

    #[test]
    fn supertrend_candidate_tracks_band() {
        let tm = TrailingManager::new();
        tm.register("t1", "BTCUSDT", Side::Long, TrailMode::Supertrend, true);
        let c = tm.candidate("t1", &snapshot(97.0, Some(95.0), None, 100.0));
        assert_eq!(c, Some(97.0));
    }

    #[test]
    fn structure_candidate_uses_protected_swing_and_skips_when_missing() {
        let tm = TrailingManager::new();
        tm.register("long", "BTCUSDT", Side::Long, TrailMode::Structure, true);
        tm.register("short", "ETHUSDT", Side::Short, TrailMode::Structure, true);

        let snap = snapshot(97.0, Some(95.0), Some(110.0), 100.0);
        assert_eq!(tm.candidate("long", &snap), Some(95.0));
        assert_eq!(tm.candidate("short", &snap), Some(110.0));

        let missing = snapshot(97.0, None, None, 100.0);
        assert_eq!(tm.candidate("long", &missing), None);
    }

    #[test]
    fn inactive_or_none_mode_yields_no_candidate() {
        let tm = TrailingManager::new();
        tm.register("off", "BTCUSDT", Side::Long, TrailMode::None, true);
        tm.register("dormant", "BTCUSDT", Side::Long, TrailMode::Supertrend, false);
        let snap = snapshot(97.0, Some(95.0), None, 100.0);
        assert_eq!(tm.candidate("off", &snap), None);
        assert_eq!(tm.candidate("dormant", &snap), None);
    }

    #[test]
    fn breakeven_arms_once_at_one_r() {
        let tm = TrailingManager::new();
        tm.register("t1", "BTCUSDT", Side::Long, TrailMode::Supertrend, false);
        tm.set_entry("t1", 100.0, Some(96.0)); // 1R = 4

        assert!(!tm.maybe_arm_breakeven("t1", 103.0));
        assert!(tm.maybe_arm_breakeven("t1", 104.0));
        // Already active: no second transition.
        assert!(!tm.maybe_arm_breakeven("t1", 110.0));
        assert!(tm.state("t1").unwrap().active);
    }

    #[test]
    fn breakeven_for_short_measures_downward() {
        let tm = TrailingManager::new();
        tm.register("s1", "ETHUSDT", Side::Short, TrailMode::Structure, false);
        tm.set_entry("s1", 100.0, Some(104.0)); // 1R = 4
        assert!(!tm.maybe_arm_breakeven("s1", 97.0));
        assert!(tm.maybe_arm_breakeven("s1", 96.0));
    }

    #[test]
    fn set_mode_and_deactivate() {
        let tm = TrailingManager::new();
        tm.register("t1", "BTCUSDT", Side::Long, TrailMode::Supertrend, true);
        assert!(tm.set_mode("t1", TrailMode::None));
        assert!(!tm.state("t1").unwrap().active);

        assert!(tm.set_mode("t1", TrailMode::Structure));
        assert!(tm.state("t1").unwrap().active);

        tm.deactivate("t1");
        assert!(!tm.state("t1").unwrap().active);
        assert!(!tm.set_mode("missing", TrailMode::None));
    }
}
