//! Agent-side decision components: the per-symbol trade state machine, the
//! daily-loss circuit breaker, user intents, and watch triggers.

pub mod circuit_breaker;
pub mod intent;
pub mod state_machine;
pub mod watch;

use serde::{Deserialize, Serialize};

/// The precise rule that blocked a request. The core never produces
/// presentation strings; the UI renders these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    Paused,
    CircuitBreaker,
    StateLock,
    Exiting,
    StrategyDisallowed,
    AlreadyInPosition,
    NotInPosition,
    InvalidIntent,
    InsufficientBalance,
    SizeBelowMinimum,
    Busy,
    Degraded,
    CommandNotUnderstood,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Paused => "PAUSED",
            RejectReason::CircuitBreaker => "CIRCUIT_BREAKER",
            RejectReason::StateLock => "STATE_LOCK",
            RejectReason::Exiting => "EXITING",
            RejectReason::StrategyDisallowed => "STRATEGY_DISALLOWED",
            RejectReason::AlreadyInPosition => "ALREADY_IN_POSITION",
            RejectReason::NotInPosition => "NOT_IN_POSITION",
            RejectReason::InvalidIntent => "INVALID_INTENT",
            RejectReason::InsufficientBalance => "INSUFFICIENT_BALANCE",
            RejectReason::SizeBelowMinimum => "SIZE_BELOW_MINIMUM",
            RejectReason::Busy => "BUSY",
            RejectReason::Degraded => "DEGRADED",
            RejectReason::CommandNotUnderstood => "COMMAND_NOT_UNDERSTOOD",
        }
    }
}

/// Structured rejection answered to the operator; blocked entries also carry
/// the strategy snapshot so the "why" is visible.
#[derive(Debug, Clone, Serialize)]
pub struct Rejection {
    pub reason: RejectReason,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<crate::strategy::StrategySnapshot>,
}

impl Rejection {
    pub fn new(reason: RejectReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            suggestion: None,
            snapshot: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_snapshot(mut self, snapshot: Option<crate::strategy::StrategySnapshot>) -> Self {
        self.snapshot = snapshot;
        self
    }
}
