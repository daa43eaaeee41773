//! Append-only audit log.
//!
//! Every decision and action in the agent produces exactly one `Event`.
//! Events are persisted, traced, and fanned out to UI WebSocket clients.
//! They are never mutated after emission.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{WsEventKind, WsServerEvent};
use crate::storage::AgentDb;

/// Closed set of audit event tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    // Entry pipeline
    EntryPlaced,
    EntryFilled,
    EntryRejected,
    EntryBlockedDirection,
    EntryBlockedLock,
    EntryBlockedPause,
    EntryBlockedBreaker,
    EntryBlockedInPosition,
    // Exit pipeline
    ExitPlaced,
    ExitFilled,
    PartialExit,
    StrategicSlTriggered,
    TakeProfitSet,
    // Stop-loss management
    EmergencySlSet,
    SlUpdated,
    SlUpdateIgnored,
    SlSetFailed,
    // Trailing
    TrailActivated,
    TrailUpdated,
    TrailDeactivated,
    BreakevenArmed,
    // Positions
    PositionOpened,
    PositionUpdated,
    PositionClosed,
    PnlUpdate,
    // Strategy / state machine
    StateUpdate,
    LockSet,
    LockCleared,
    Paused,
    Resumed,
    RiskWarning,
    // Watches
    WatchCreated,
    WatchTriggered,
    WatchExpired,
    WatchCancelled,
    WatchAutoEntry,
    // Circuit breaker
    CircuitBreakerTripped,
    CircuitBreakerReset,
    CircuitBreakerOverride,
    CircuitBreakerWindowReset,
    // Orders / leverage
    OrderPlaced,
    OrderFilled,
    OrderCancelled,
    OrderUnknown,
    LeverageClamped,
    LeverageSet,
    // Lifecycle / recovery
    TradeRestored,
    TradeClosedUnknownRestart,
    FeedDegraded,
    FeedRecovered,
    CandleBackfill,
    SystemError,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::EntryPlaced => "ENTRY_PLACED",
            EventType::EntryFilled => "ENTRY_FILLED",
            EventType::EntryRejected => "ENTRY_REJECTED",
            EventType::EntryBlockedDirection => "ENTRY_BLOCKED_DIRECTION",
            EventType::EntryBlockedLock => "ENTRY_BLOCKED_LOCK",
            EventType::EntryBlockedPause => "ENTRY_BLOCKED_PAUSE",
            EventType::EntryBlockedBreaker => "ENTRY_BLOCKED_BREAKER",
            EventType::EntryBlockedInPosition => "ENTRY_BLOCKED_IN_POSITION",
            EventType::ExitPlaced => "EXIT_PLACED",
            EventType::ExitFilled => "EXIT_FILLED",
            EventType::PartialExit => "PARTIAL_EXIT",
            EventType::StrategicSlTriggered => "STRATEGIC_SL_TRIGGERED",
            EventType::TakeProfitSet => "TAKE_PROFIT_SET",
            EventType::EmergencySlSet => "EMERGENCY_SL_SET",
            EventType::SlUpdated => "SL_UPDATED",
            EventType::SlUpdateIgnored => "SL_UPDATE_IGNORED",
            EventType::SlSetFailed => "SL_SET_FAILED",
            EventType::TrailActivated => "TRAIL_ACTIVATED",
            EventType::TrailUpdated => "TRAIL_UPDATED",
            EventType::TrailDeactivated => "TRAIL_DEACTIVATED",
            EventType::BreakevenArmed => "BREAKEVEN_ARMED",
            EventType::PositionOpened => "POSITION_OPENED",
            EventType::PositionUpdated => "POSITION_UPDATED",
            EventType::PositionClosed => "POSITION_CLOSED",
            EventType::PnlUpdate => "PNL_UPDATE",
            EventType::StateUpdate => "STATE_UPDATE",
            EventType::LockSet => "LOCK_SET",
            EventType::LockCleared => "LOCK_CLEARED",
            EventType::Paused => "PAUSED",
            EventType::Resumed => "RESUMED",
            EventType::RiskWarning => "RISK_WARNING",
            EventType::WatchCreated => "WATCH_CREATED",
            EventType::WatchTriggered => "WATCH_TRIGGERED",
            EventType::WatchExpired => "WATCH_EXPIRED",
            EventType::WatchCancelled => "WATCH_CANCELLED",
            EventType::WatchAutoEntry => "WATCH_AUTO_ENTRY",
            EventType::CircuitBreakerTripped => "CIRCUIT_BREAKER_TRIPPED",
            EventType::CircuitBreakerReset => "CIRCUIT_BREAKER_RESET",
            EventType::CircuitBreakerOverride => "CIRCUIT_BREAKER_OVERRIDE",
            EventType::CircuitBreakerWindowReset => "CIRCUIT_BREAKER_WINDOW_RESET",
            EventType::OrderPlaced => "ORDER_PLACED",
            EventType::OrderFilled => "ORDER_FILLED",
            EventType::OrderCancelled => "ORDER_CANCELLED",
            EventType::OrderUnknown => "ORDER_UNKNOWN",
            EventType::LeverageClamped => "LEVERAGE_CLAMPED",
            EventType::LeverageSet => "LEVERAGE_SET",
            EventType::TradeRestored => "TRADE_RESTORED",
            EventType::TradeClosedUnknownRestart => "TRADE_CLOSED_UNKNOWN_RESTART",
            EventType::FeedDegraded => "FEED_DEGRADED",
            EventType::FeedRecovered => "FEED_RECOVERED",
            EventType::CandleBackfill => "CANDLE_BACKFILL",
            EventType::SystemError => "SYSTEM_ERROR",
        }
    }

    /// UI fan-out channel this event belongs on, if any.
    fn ws_kind(&self) -> Option<WsEventKind> {
        use EventType::*;
        match self {
            PositionOpened | PositionUpdated | PositionClosed | PnlUpdate => {
                Some(WsEventKind::Position)
            }
            StateUpdate | RiskWarning => Some(WsEventKind::Strategy),
            TrailActivated | TrailUpdated | TrailDeactivated | SlUpdated | BreakevenArmed => {
                Some(WsEventKind::TrailUpdate)
            }
            CircuitBreakerTripped | CircuitBreakerReset | CircuitBreakerOverride
            | CircuitBreakerWindowReset => Some(WsEventKind::CircuitBreaker),
            WatchCreated | WatchTriggered | WatchExpired | WatchCancelled | WatchAutoEntry => {
                Some(WsEventKind::Watch)
            }
            EntryPlaced | EntryFilled | EntryRejected | EntryBlockedDirection
            | EntryBlockedLock | EntryBlockedPause | EntryBlockedBreaker
            | EntryBlockedInPosition | ExitPlaced | ExitFilled | PartialExit
            | StrategicSlTriggered | TakeProfitSet | OrderPlaced | OrderFilled
            | OrderCancelled | TradeRestored | TradeClosedUnknownRestart => {
                Some(WsEventKind::Trade)
            }
            _ => None,
        }
    }
}

/// One audit record. Immutable once emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub symbol: Option<String>,
    pub trade_id: Option<String>,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: EventType, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            symbol: None,
            trade_id: None,
            event_type,
            payload: serde_json::Value::Null,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn with_trade(mut self, trade_id: impl Into<String>) -> Self {
        self.trade_id = Some(trade_id.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Event sink: persists, traces, and fans out. Owns nothing else.
#[derive(Clone)]
pub struct EventLog {
    db: Arc<AgentDb>,
    ui_tx: broadcast::Sender<WsServerEvent>,
}

impl EventLog {
    pub fn new(db: Arc<AgentDb>, ui_tx: broadcast::Sender<WsServerEvent>) -> Self {
        Self { db, ui_tx }
    }

    pub async fn emit(&self, event: Event) {
        info!(
            event = event.event_type.as_str(),
            symbol = event.symbol.as_deref().unwrap_or("-"),
            trade_id = event.trade_id.as_deref().unwrap_or("-"),
            "{}",
            event.message
        );

        if let Err(e) = self.db.insert_event(&event).await {
            warn!(error = %e, "failed to persist event");
        }

        if let Some(kind) = event.event_type.ws_kind() {
            let data = serde_json::to_value(&event).unwrap_or(serde_json::Value::Null);
            // No receivers is fine; fan-out is best-effort.
            let _ = self.ui_tx.send(WsServerEvent::new(kind, data));
        }
    }

    /// Fire-and-forget variant for sync call sites.
    pub fn emit_detached(&self, event: Event) {
        let log = self.clone();
        tokio::spawn(async move {
            log.emit(event).await;
        });
    }
}
