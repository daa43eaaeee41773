//! Per-symbol trade lifecycle.
//!
//! States: FLAT, IN_LONG, IN_SHORT, EXITING, LOCK_LONG, LOCK_SHORT, plus one
//! process-wide pause flag. Every (state, event) pair has a defined outcome.
//! The lock is the anti-revenge mechanism: a stop-out locks the stopped side
//! until the opposite-direction signal or an admin unlock; it never expires
//! on its own.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

use super::{RejectReason, Rejection};
use crate::models::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeState {
    Flat,
    InLong,
    InShort,
    Exiting,
    LockLong,
    LockShort,
}

impl TradeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeState::Flat => "FLAT",
            TradeState::InLong => "IN_LONG",
            TradeState::InShort => "IN_SHORT",
            TradeState::Exiting => "EXITING",
            TradeState::LockLong => "LOCK_LONG",
            TradeState::LockShort => "LOCK_SHORT",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolState {
    pub state: TradeState,
    pub side: Option<Side>,
    pub entered_at: Option<DateTime<Utc>>,
    pub last_stopped_side: Option<Side>,
}

impl Default for SymbolState {
    fn default() -> Self {
        Self {
            state: TradeState::Flat,
            side: None,
            entered_at: None,
            last_stopped_side: None,
        }
    }
}

pub struct StateMachine {
    states: RwLock<HashMap<String, SymbolState>>,
    paused: AtomicBool,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            paused: AtomicBool::new(false),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("trading paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("trading resumed");
    }

    pub fn snapshot(&self, symbol: &str) -> SymbolState {
        self.states.read().get(symbol).cloned().unwrap_or_default()
    }

    pub fn all(&self) -> HashMap<String, SymbolState> {
        self.states.read().clone()
    }

    /// Read-only admission query. Pause denies everything; IN_* and EXITING
    /// deny all entries; LOCK_X denies side X only.
    pub fn can_enter(&self, symbol: &str, side: Side) -> Result<(), Rejection> {
        if self.is_paused() {
            return Err(Rejection::new(
                RejectReason::Paused,
                "trading is paused",
            ));
        }

        let current = self.snapshot(symbol);
        match current.state {
            TradeState::Flat => Ok(()),
            TradeState::InLong | TradeState::InShort => Err(Rejection::new(
                RejectReason::AlreadyInPosition,
                format!("{} already has an open {} position", symbol, current.state.as_str()),
            )),
            TradeState::Exiting => Err(Rejection::new(
                RejectReason::Exiting,
                format!("{} is exiting; wait for the position-closed event", symbol),
            )),
            TradeState::LockLong if side == Side::Long => Err(Rejection::new(
                RejectReason::StateLock,
                format!("{} long entries are locked after a long stop-out", symbol),
            )
            .with_suggestion("the lock clears on an opposite-direction signal or /agent/unlock")),
            TradeState::LockShort if side == Side::Short => Err(Rejection::new(
                RejectReason::StateLock,
                format!("{} short entries are locked after a short stop-out", symbol),
            )
            .with_suggestion("the lock clears on an opposite-direction signal or /agent/unlock")),
            TradeState::LockLong | TradeState::LockShort => Ok(()),
        }
    }

    /// FLAT or LOCK_* -> IN_side. Entering through an opposite-side lock
    /// clears it implicitly.
    pub fn enter_position(&self, symbol: &str, side: Side) {
        let mut states = self.states.write();
        let entry = states.entry(symbol.to_string()).or_default();
        entry.state = match side {
            Side::Long => TradeState::InLong,
            Side::Short => TradeState::InShort,
        };
        entry.side = Some(side);
        entry.entered_at = Some(Utc::now());
    }

    /// IN_* -> EXITING. No-op elsewhere; the side memory survives so a later
    /// stop-out knows which side to lock.
    pub fn start_exiting(&self, symbol: &str) {
        let mut states = self.states.write();
        let entry = states.entry(symbol.to_string()).or_default();
        if matches!(entry.state, TradeState::InLong | TradeState::InShort) {
            entry.state = TradeState::Exiting;
        }
    }

    /// EXITING or IN_* -> FLAT.
    pub fn exit_clean(&self, symbol: &str) {
        let mut states = self.states.write();
        let entry = states.entry(symbol.to_string()).or_default();
        if matches!(
            entry.state,
            TradeState::InLong | TradeState::InShort | TradeState::Exiting
        ) {
            entry.state = TradeState::Flat;
            entry.side = None;
            entry.entered_at = None;
        }
    }

    /// EXITING or IN_* -> LOCK_{stopped side}; records last-stopped-side.
    pub fn exit_stopped(&self, symbol: &str) {
        let mut states = self.states.write();
        let entry = states.entry(symbol.to_string()).or_default();
        let stopped = match (entry.state, entry.side) {
            (TradeState::InLong, _) => Some(Side::Long),
            (TradeState::InShort, _) => Some(Side::Short),
            (TradeState::Exiting, side) => side,
            _ => None,
        };
        if let Some(side) = stopped {
            entry.state = match side {
                Side::Long => TradeState::LockLong,
                Side::Short => TradeState::LockShort,
            };
            entry.side = None;
            entry.entered_at = None;
            entry.last_stopped_side = Some(side);
            info!(symbol, side = side.as_str(), "stop-out lock set");
        }
    }

    /// LOCK_X -> FLAT iff the signal points the other way. Returns whether
    /// the lock was cleared.
    pub fn clear_lock(&self, symbol: &str, signal_side: Side) -> bool {
        let mut states = self.states.write();
        let entry = states.entry(symbol.to_string()).or_default();
        let locked_side = match entry.state {
            TradeState::LockLong => Some(Side::Long),
            TradeState::LockShort => Some(Side::Short),
            _ => None,
        };
        match locked_side {
            Some(locked) if signal_side != locked => {
                entry.state = TradeState::Flat;
                info!(symbol, "lock cleared by opposite-direction signal");
                true
            }
            _ => false,
        }
    }

    /// Admin escape hatch: any state -> FLAT.
    pub fn force_unlock(&self, symbol: &str) {
        let mut states = self.states.write();
        let entry = states.entry(symbol.to_string()).or_default();
        entry.state = TradeState::Flat;
        entry.side = None;
        entry.entered_at = None;
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYM: &str = "BTCUSDT";

    #[test]
    fn flat_allows_both_sides() {
        let sm = StateMachine::new();
        assert!(sm.can_enter(SYM, Side::Long).is_ok());
        assert!(sm.can_enter(SYM, Side::Short).is_ok());
    }

    #[test]
    fn in_position_denies_same_and_opposite() {
        let sm = StateMachine::new();
        sm.enter_position(SYM, Side::Long);
        let denial = sm.can_enter(SYM, Side::Long).unwrap_err();
        assert_eq!(denial.reason, RejectReason::AlreadyInPosition);
        let denial = sm.can_enter(SYM, Side::Short).unwrap_err();
        assert_eq!(denial.reason, RejectReason::AlreadyInPosition);
    }

    #[test]
    fn exiting_denies_everything_until_closed() {
        let sm = StateMachine::new();
        sm.enter_position(SYM, Side::Short);
        sm.start_exiting(SYM);
        assert_eq!(sm.snapshot(SYM).state, TradeState::Exiting);
        assert_eq!(
            sm.can_enter(SYM, Side::Long).unwrap_err().reason,
            RejectReason::Exiting
        );
        sm.exit_clean(SYM);
        assert_eq!(sm.snapshot(SYM).state, TradeState::Flat);
        assert!(sm.can_enter(SYM, Side::Long).is_ok());
    }

    #[test]
    fn stop_out_locks_stopped_side_only() {
        let sm = StateMachine::new();
        sm.enter_position(SYM, Side::Long);
        sm.exit_stopped(SYM);
        let snap = sm.snapshot(SYM);
        assert_eq!(snap.state, TradeState::LockLong);
        assert_eq!(snap.last_stopped_side, Some(Side::Long));

        assert_eq!(
            sm.can_enter(SYM, Side::Long).unwrap_err().reason,
            RejectReason::StateLock
        );
        assert!(sm.can_enter(SYM, Side::Short).is_ok());
    }

    #[test]
    fn stop_out_through_exiting_remembers_side() {
        let sm = StateMachine::new();
        sm.enter_position(SYM, Side::Short);
        sm.start_exiting(SYM);
        sm.exit_stopped(SYM);
        assert_eq!(sm.snapshot(SYM).state, TradeState::LockShort);
    }

    #[test]
    fn lock_clears_only_on_opposite_signal() {
        let sm = StateMachine::new();
        sm.enter_position(SYM, Side::Long);
        sm.exit_stopped(SYM);

        assert!(!sm.clear_lock(SYM, Side::Long));
        assert_eq!(sm.snapshot(SYM).state, TradeState::LockLong);

        assert!(sm.clear_lock(SYM, Side::Short));
        assert_eq!(sm.snapshot(SYM).state, TradeState::Flat);
    }

    #[test]
    fn force_unlock_always_returns_to_flat() {
        let sm = StateMachine::new();
        sm.enter_position(SYM, Side::Long);
        sm.exit_stopped(SYM);
        sm.force_unlock(SYM);
        assert_eq!(sm.snapshot(SYM).state, TradeState::Flat);
    }

    #[test]
    fn pause_denies_every_entry() {
        let sm = StateMachine::new();
        sm.pause();
        assert_eq!(
            sm.can_enter(SYM, Side::Long).unwrap_err().reason,
            RejectReason::Paused
        );
        assert_eq!(
            sm.can_enter("ETHUSDT", Side::Short).unwrap_err().reason,
            RejectReason::Paused
        );
        sm.resume();
        assert!(sm.can_enter(SYM, Side::Long).is_ok());
    }

    #[test]
    fn entering_through_opposite_lock_clears_it() {
        let sm = StateMachine::new();
        sm.enter_position(SYM, Side::Long);
        sm.exit_stopped(SYM);
        assert!(sm.can_enter(SYM, Side::Short).is_ok());
        sm.enter_position(SYM, Side::Short);
        assert_eq!(sm.snapshot(SYM).state, TradeState::InShort);
    }
}
