//! Trade executor: the only component that opens, manages, and closes trades.
//!
//! Admission runs in strict order (pause, circuit breaker, state machine,
//! hard gate, in-position), then the contract is built, the entry goes out
//! atomically with its emergency stop, and every later action is driven by
//! feed events — fills from the order stream, closes from the position
//! stream, stop management from confirmed candle closes.

use anyhow::{anyhow, Result};
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use super::contract::{build_contract, BuildContext, ContractStatus, TradeContract};
use super::order_manager::{OrderFill, OrderManager, OrderSubmit};
use super::position_tracker::{PositionEvent, PositionTracker, TrackedPosition};
use super::sl_manager::{SlManager, SlUpdate};
use super::trailing::TrailingManager;
use crate::agent::circuit_breaker::{CircuitBreaker, RecordOutcome};
use crate::agent::intent::{Intent, SymbolConfig, TpRule, TrailMode};
use crate::agent::state_machine::StateMachine;
use crate::agent::{RejectReason, Rejection};
use crate::events::{Event, EventLog, EventType};
use crate::exchange::throttle::BusyError;
use crate::exchange::types::OrderKind;
use crate::exchange::ExchangeApi;
use crate::models::Side;
use crate::storage::{AgentDb, TradeRecord};
use crate::strategy::{StateUpdate, StrategyEngine};

/// Price proximity (percent of mark) for exit-reason inference.
const EXIT_REASON_PROXIMITY_PCT: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    Manual,
    StopLoss,
    TakeProfit,
    Liquidation,
    Invalidation,
    UnknownRestart,
    Unknown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Manual => "MANUAL",
            CloseReason::StopLoss => "STOP_LOSS",
            CloseReason::TakeProfit => "TAKE_PROFIT",
            CloseReason::Liquidation => "LIQUIDATION",
            CloseReason::Invalidation => "INVALIDATION",
            CloseReason::UnknownRestart => "UNKNOWN_RESTART",
            CloseReason::Unknown => "UNKNOWN",
        }
    }
}

/// Either a typed, user-visible rejection or an operational failure.
#[derive(Debug)]
pub enum ExecError {
    Rejected(Rejection),
    Failed(anyhow::Error),
}

impl From<anyhow::Error> for ExecError {
    fn from(e: anyhow::Error) -> Self {
        if e.downcast_ref::<BusyError>().is_some() {
            ExecError::Rejected(Rejection::new(
                RejectReason::Busy,
                "exchange call queue is full; try again",
            ))
        } else {
            ExecError::Failed(e)
        }
    }
}

impl From<Rejection> for ExecError {
    fn from(r: Rejection) -> Self {
        ExecError::Rejected(r)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveTrade {
    pub contract: TradeContract,
    pub entry_link_id: String,
    pub entry_price: Option<f64>,
    pub qty: f64,
    /// Set when this process initiated the close, so the position-closed
    /// event does not have to guess the reason.
    pub pending_close_reason: Option<CloseReason>,
}

#[derive(Debug, Clone)]
pub struct ExecConfig {
    pub interval: String,
    pub max_leverage: f64,
    pub default_risk_pct: f64,
    pub sl_buffer_pct: f64,
    pub breakeven_activation: bool,
}

pub struct Executor {
    exchange: Arc<dyn ExchangeApi>,
    db: Arc<AgentDb>,
    events: EventLog,
    sm: Arc<StateMachine>,
    breaker: Arc<CircuitBreaker>,
    strategy: Arc<StrategyEngine>,
    orders: Arc<OrderManager>,
    positions: Arc<PositionTracker>,
    sl: Arc<SlManager>,
    trailing: Arc<TrailingManager>,
    active: RwLock<HashMap<String, ActiveTrade>>,
    config: ExecConfig,
    degraded: AtomicBool,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: Arc<dyn ExchangeApi>,
        db: Arc<AgentDb>,
        events: EventLog,
        sm: Arc<StateMachine>,
        breaker: Arc<CircuitBreaker>,
        strategy: Arc<StrategyEngine>,
        orders: Arc<OrderManager>,
        positions: Arc<PositionTracker>,
        sl: Arc<SlManager>,
        trailing: Arc<TrailingManager>,
        config: ExecConfig,
    ) -> Self {
        Self {
            exchange,
            db,
            events,
            sm,
            breaker,
            strategy,
            orders,
            positions,
            sl,
            trailing,
            active: RwLock::new(HashMap::new()),
            config,
            degraded: AtomicBool::new(false),
        }
    }

    pub fn active_trades(&self) -> Vec<ActiveTrade> {
        self.active.read().values().cloned().collect()
    }

    pub fn active_trade(&self, symbol: &str) -> Option<ActiveTrade> {
        self.active.read().get(symbol).cloned()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub async fn set_degraded(&self, degraded: bool) {
        let was = self.degraded.swap(degraded, Ordering::SeqCst);
        if was == degraded {
            return;
        }
        let (event_type, message) = if degraded {
            (EventType::FeedDegraded, "private feed lost; rejecting entries and polling positions")
        } else {
            (EventType::FeedRecovered, "private feed restored")
        };
        self.events.emit(Event::new(event_type, message)).await;
    }

    pub async fn pause(&self) {
        self.sm.pause();
        self.events
            .emit(Event::new(EventType::Paused, "trading paused by operator"))
            .await;
    }

    pub async fn resume(&self) {
        self.sm.resume();
        self.events
            .emit(Event::new(EventType::Resumed, "trading resumed by operator"))
            .await;
    }

    // ------------------------------------------------------------------
    // Entry
    // ------------------------------------------------------------------

    /// Run the admission chain and, if it passes, place the entry atomically
    /// with its emergency stop.
    pub async fn enter(&self, intent: &Intent) -> Result<TradeContract, ExecError> {
        let side = intent
            .side()
            .ok_or_else(|| Rejection::new(RejectReason::InvalidIntent, "not an entry intent"))?;
        let symbol = intent
            .symbol
            .clone()
            .ok_or_else(|| Rejection::new(RejectReason::InvalidIntent, "entry without symbol"))?;

        let snapshot = self
            .strategy
            .state(&symbol)
            .and_then(|s| s.snapshot.clone());

        if self.is_degraded() {
            return Err(Rejection::new(
                RejectReason::Degraded,
                "private feed is degraded; entries are disabled",
            )
            .into());
        }

        // 1. Global pause.
        if self.sm.is_paused() {
            self.emit_blocked(EventType::EntryBlockedPause, &symbol, side, "paused")
                .await;
            return Err(Rejection::new(RejectReason::Paused, "trading is paused").into());
        }

        // 2. Circuit breaker.
        if !self.breaker.can_trade(Utc::now()) {
            self.emit_blocked(EventType::EntryBlockedBreaker, &symbol, side, "circuit breaker")
                .await;
            let state = self.breaker.snapshot();
            return Err(Rejection::new(
                RejectReason::CircuitBreaker,
                format!(
                    "daily loss {:.1}% tripped the circuit breaker",
                    state.loss_pct
                ),
            )
            .with_suggestion("wait for the unlock window or use the manual override")
            .into());
        }

        // 3. State machine.
        if let Err(rejection) = self.sm.can_enter(&symbol, side) {
            let event_type = match rejection.reason {
                RejectReason::StateLock => EventType::EntryBlockedLock,
                _ => EventType::EntryBlockedInPosition,
            };
            self.emit_blocked(event_type, &symbol, side, rejection.reason.as_str())
                .await;
            return Err(rejection.with_snapshot(snapshot).into());
        }

        // 4. Hard gate.
        let state = self.strategy.state(&symbol).ok_or_else(|| {
            Rejection::new(
                RejectReason::StrategyDisallowed,
                format!("{} has no strategy state yet", symbol),
            )
        })?;
        if !state.allows(side) {
            self.emit_blocked(
                EventType::EntryBlockedDirection,
                &symbol,
                side,
                "hard gate",
            )
            .await;
            let detail = state
                .snapshot
                .as_ref()
                .map(|s| {
                    format!(
                        "supertrend {} / structure {}",
                        s.supertrend_direction.as_str(),
                        s.structure_bias.as_str()
                    )
                })
                .unwrap_or_else(|| "insufficient data".to_string());
            return Err(Rejection::new(
                RejectReason::StrategyDisallowed,
                format!("{} entry misaligned: {}", side.as_str(), detail),
            )
            .with_snapshot(state.snapshot.clone())
            .into());
        }

        // 5. Already in position (exchange truth, not just local state).
        if self.positions.has_position(&symbol) || self.active.read().contains_key(&symbol) {
            self.emit_blocked(
                EventType::EntryBlockedInPosition,
                &symbol,
                side,
                "already in position",
            )
            .await;
            return Err(Rejection::new(
                RejectReason::AlreadyInPosition,
                format!("{} already has an open position", symbol),
            )
            .into());
        }

        // Per-symbol defaults fill whatever the intent left unset.
        let mut intent = intent.clone();
        if let Ok(Some(json)) = self.db.get_symbol_config(&symbol).await {
            match serde_json::from_str::<SymbolConfig>(&json) {
                Ok(config) => config.apply(&mut intent),
                Err(e) => warn!(symbol = %symbol, error = %e, "unreadable symbol config"),
            }
        }

        // Venue numbers, then the pure build.
        let balance = self.exchange.get_wallet_balance().await?;
        let ticker = self.exchange.get_ticker(&symbol).await?;
        let instrument = self.exchange.get_instrument_info(&symbol).await?;

        let ctx = BuildContext {
            balance,
            mark: ticker.mark,
            instrument,
            max_leverage: self.config.max_leverage,
            default_risk_pct: self.config.default_risk_pct,
            sl_buffer_pct: self.config.sl_buffer_pct,
            breakeven_activation: self.config.breakeven_activation,
        };
        let mut contract = match build_contract(&intent, &state, &ctx) {
            Ok(c) => c,
            Err(rejection) => {
                self.events
                    .emit(
                        Event::new(
                            EventType::EntryRejected,
                            format!("{} entry rejected: {}", symbol, rejection.message),
                        )
                        .with_symbol(&symbol)
                        .with_payload(serde_json::json!({ "reason": rejection.reason.as_str() })),
                    )
                    .await;
                return Err(rejection.into());
            }
        };

        // Leverage is set even when unchanged; the venue answers "already
        // set" and that is success.
        self.exchange
            .set_leverage(&symbol, contract.entry.applied_leverage)
            .await?;
        if contract.entry.leverage_clamped {
            self.events
                .emit(
                    Event::new(
                        EventType::LeverageClamped,
                        format!(
                            "{} leverage clamped {} -> {}",
                            symbol,
                            contract.entry.requested_leverage,
                            contract.entry.applied_leverage
                        ),
                    )
                    .with_symbol(&symbol)
                    .with_trade(&contract.trade_id),
                )
                .await;
        } else {
            self.events
                .emit(
                    Event::new(
                        EventType::LeverageSet,
                        format!("{} leverage {}", symbol, contract.entry.applied_leverage),
                    )
                    .with_symbol(&symbol)
                    .with_trade(&contract.trade_id),
                )
                .await;
        }

        // Single-shot atomic placement: entry + emergency SL (+ TP if
        // already priced) in one request.
        let order = self
            .orders
            .submit(OrderSubmit {
                symbol: symbol.clone(),
                order_side: side.order_side().to_string(),
                kind: contract.entry.kind,
                qty: contract.qty,
                price: contract.entry.limit_price,
                stop_loss: contract.sl.emergency,
                take_profit: contract.tp.price,
                reduce_only: false,
                trade_id: Some(contract.trade_id.clone()),
                is_entry: true,
                is_exit: false,
                link_id: None,
            })
            .await?;

        contract.status = ContractStatus::Executed;

        // Only after the exchange acknowledged: register the strategic stop,
        // flip the state machine, arm trailing, persist.
        if let Some(strategic) = contract.sl.strategic {
            let emergency = contract.sl.emergency.unwrap_or(strategic);
            self.sl.register(
                &contract.trade_id,
                &symbol,
                side,
                strategic,
                emergency,
                contract.sl.buffer_pct,
            );
            self.events
                .emit(
                    Event::new(
                        EventType::EmergencySlSet,
                        format!("{} emergency stop preset at {:.4}", symbol, emergency),
                    )
                    .with_symbol(&symbol)
                    .with_trade(&contract.trade_id),
                )
                .await;
        }
        self.sm.enter_position(&symbol, side);
        if contract.trail.mode != TrailMode::None {
            self.trailing.register(
                &contract.trade_id,
                &symbol,
                side,
                contract.trail.mode,
                contract.trail.active,
            );
            if contract.trail.active {
                self.events
                    .emit(
                        Event::new(
                            EventType::TrailActivated,
                            format!("{} trailing {:?} active", symbol, contract.trail.mode),
                        )
                        .with_symbol(&symbol)
                        .with_trade(&contract.trade_id),
                    )
                    .await;
            }
        }

        let entry_event = Event::new(
            EventType::EntryPlaced,
            format!(
                "{} {} qty {:.6} risk {:.2} USD sl {:?} (emergency {:?})",
                symbol,
                side.as_str(),
                contract.qty,
                contract.entry.risk_amount_usd,
                contract.sl.strategic,
                contract.sl.emergency,
            ),
        )
        .with_symbol(&symbol)
        .with_trade(&contract.trade_id)
        .with_payload(serde_json::json!({
            "tag": contract.strategy_tag.map(|t| t.as_str()),
            "leverage": contract.entry.applied_leverage,
            "linkId": order.local_id,
        }));

        let trade_record = trade_record_for(&contract, None, contract.qty);
        if let Err(e) = self.db.persist_entry(&trade_record, &order, &entry_event).await {
            warn!(error = %e, "entry persist failed");
        }
        self.events.emit(entry_event).await;

        self.active.write().insert(
            symbol.clone(),
            ActiveTrade {
                contract: contract.clone(),
                entry_link_id: order.local_id,
                entry_price: None,
                qty: contract.qty,
                pending_close_reason: None,
            },
        );

        Ok(contract)
    }

    async fn emit_blocked(&self, event_type: EventType, symbol: &str, side: Side, why: &str) {
        self.events
            .emit(
                Event::new(
                    event_type,
                    format!("{} {} entry blocked: {}", symbol, side.as_str(), why),
                )
                .with_symbol(symbol),
            )
            .await;
    }

    // ------------------------------------------------------------------
    // Exit
    // ------------------------------------------------------------------

    /// Reduce-only market close of `percent` of the live position.
    pub async fn close_position(
        &self,
        symbol: &str,
        percent: f64,
        reason: CloseReason,
    ) -> Result<(), ExecError> {
        let percent = percent.clamp(1.0, 100.0);
        let position = match self.positions.get(symbol) {
            Some(p) => p,
            None => {
                // Local mirror may lag; the exchange is the truth.
                let mut fetched = self.exchange.get_positions(Some(symbol)).await?;
                let Some(info) = fetched.pop() else {
                    return Err(Rejection::new(
                        RejectReason::NotInPosition,
                        format!("{} has no open position", symbol),
                    )
                    .into());
                };
                self.positions.apply(info.into());
                self.positions.get(symbol).ok_or_else(|| {
                    ExecError::Failed(anyhow!("position refresh lost {}", symbol))
                })?
            }
        };

        let instrument = self.exchange.get_instrument_info(symbol).await?;
        let qty = instrument.round_qty(position.size * percent / 100.0);
        if qty <= 0.0 {
            return Err(Rejection::new(
                RejectReason::SizeBelowMinimum,
                "close size rounds to zero",
            )
            .into());
        }

        let full_close = percent >= 100.0 || qty >= position.size;
        let trade_id = self.active.read().get(symbol).map(|t| t.contract.trade_id.clone());

        if full_close {
            self.sm.start_exiting(symbol);
            if let Some(trade) = self.active.write().get_mut(symbol) {
                trade.pending_close_reason = Some(reason);
            }
        }

        self.orders
            .submit(OrderSubmit {
                symbol: symbol.to_string(),
                order_side: position.side.close_order_side().to_string(),
                kind: OrderKind::Market,
                qty,
                price: None,
                stop_loss: None,
                take_profit: None,
                reduce_only: true,
                trade_id: trade_id.clone(),
                is_entry: false,
                is_exit: true,
                link_id: None,
            })
            .await?;

        let event_type = if full_close {
            EventType::ExitPlaced
        } else {
            EventType::PartialExit
        };
        let mut event = Event::new(
            event_type,
            format!(
                "{} close {:.0}% ({:.6}) reason {}",
                symbol,
                percent,
                qty,
                reason.as_str()
            ),
        )
        .with_symbol(symbol);
        if let Some(trade_id) = &trade_id {
            event = event.with_trade(trade_id);
        }
        self.events.emit(event).await;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Feed reactors
    // ------------------------------------------------------------------

    /// Entry/exit fills from the order stream drive everything that must not
    /// run on a timer: TP placement, trail seeding, fill bookkeeping.
    pub async fn handle_fill(&self, fill: &OrderFill) {
        if fill.is_entry {
            let contract = {
                let mut active = self.active.write();
                let Some(trade) = active.get_mut(&fill.symbol) else {
                    return;
                };
                if trade.entry_link_id != fill.link_id {
                    return;
                }
                trade.entry_price = Some(fill.avg_price);
                trade.qty = fill.qty;
                trade.contract.clone()
            };

            let _ = self
                .db
                .update_trade_fill(&contract.trade_id, fill.avg_price, fill.qty)
                .await;
            self.trailing
                .set_entry(&contract.trade_id, fill.avg_price, contract.sl.strategic);

            self.events
                .emit(
                    Event::new(
                        EventType::EntryFilled,
                        format!("{} entry filled at {:.4}", fill.symbol, fill.avg_price),
                    )
                    .with_symbol(&fill.symbol)
                    .with_trade(&contract.trade_id),
                )
                .await;

            // Reward-to-risk TP resolves only now, off the actual entry.
            if contract.tp.rule == TpRule::Rr {
                if let (Some(rr), Some(strategic)) = (contract.tp.rr, contract.sl.strategic) {
                    let risk = (fill.avg_price - strategic).abs();
                    let tp_price = match contract.side {
                        Side::Long => fill.avg_price + risk * rr,
                        Side::Short => fill.avg_price - risk * rr,
                    };
                    match self
                        .exchange
                        .set_take_profit(&fill.symbol, Some(tp_price))
                        .await
                    {
                        Ok(()) => {
                            self.events
                                .emit(
                                    Event::new(
                                        EventType::TakeProfitSet,
                                        format!("{} TP {:.4} ({}R)", fill.symbol, tp_price, rr),
                                    )
                                    .with_symbol(&fill.symbol)
                                    .with_trade(&contract.trade_id),
                                )
                                .await;
                        }
                        Err(e) => {
                            warn!(symbol = %fill.symbol, error = %e, "TP set failed");
                        }
                    }
                }
            }
        } else if fill.is_exit {
            let mut event = Event::new(
                EventType::ExitFilled,
                format!("{} exit filled at {:.4}", fill.symbol, fill.avg_price),
            )
            .with_symbol(&fill.symbol);
            if let Some(trade_id) = &fill.trade_id {
                event = event.with_trade(trade_id);
            }
            self.events.emit(event).await;
        }
    }

    /// Confirmed-close reactor: lock clearing, strategic SL, invalidation,
    /// trailing — strictly in that order, per symbol.
    pub async fn handle_state_update(&self, update: &StateUpdate) {
        let symbol = update.symbol.as_str();
        let Some(snapshot) = update.state.snapshot.as_ref() else {
            return;
        };

        // Lock clearing: the opposite-direction signal releases a stop-out
        // lock.
        if self.sm.clear_lock(symbol, snapshot.supertrend_direction) {
            self.events
                .emit(
                    Event::new(
                        EventType::LockCleared,
                        format!(
                            "{} lock cleared by {} signal",
                            symbol,
                            snapshot.supertrend_direction.as_str()
                        ),
                    )
                    .with_symbol(symbol),
                )
                .await;
        }

        let Some(trade) = self.active_trade(symbol) else {
            return;
        };
        if trade.pending_close_reason.is_some() {
            return; // already on its way out
        }
        let trade_id = trade.contract.trade_id.clone();
        let side = trade.contract.side;

        // Strategic SL: close-based, decision layer.
        if self.sl.strategic_triggered(&trade_id, snapshot.price) {
            self.events
                .emit(
                    Event::new(
                        EventType::StrategicSlTriggered,
                        format!(
                            "{} close {:.4} crossed strategic stop",
                            symbol, snapshot.price
                        ),
                    )
                    .with_symbol(symbol)
                    .with_trade(&trade_id),
                )
                .await;
            if let Err(e) = self.close_position(symbol, 100.0, CloseReason::StopLoss).await {
                warn!(symbol, error = ?e, "strategic SL close failed");
            }
            return;
        }

        // Invalidation flags.
        let invalidated = (trade.contract.invalidation.on_supertrend_flip
            && snapshot.supertrend_direction != side)
            || (trade.contract.invalidation.on_bias_flip
                && update.state.bias == crate::models::Bias::from_side(side.opposite()))
            || (trade.contract.invalidation.on_structure_break
                && snapshot
                    .last_choch
                    .map_or(false, |c| c.direction != side));
        if invalidated {
            if let Err(e) = self
                .close_position(symbol, 100.0, CloseReason::Invalidation)
                .await
            {
                warn!(symbol, error = ?e, "invalidation close failed");
            }
            return;
        }

        // Breakeven helper: dormant trails arm at +1R.
        if self.trailing.maybe_arm_breakeven(&trade_id, snapshot.price) {
            self.events
                .emit(
                    Event::new(
                        EventType::BreakevenArmed,
                        format!("{} reached +1R; trailing armed", symbol),
                    )
                    .with_symbol(symbol)
                    .with_trade(&trade_id),
                )
                .await;
        }

        // Trail ratchet. The SL manager ignores non-improving candidates.
        if let Some(candidate) = self.trailing.candidate(&trade_id, snapshot) {
            match self.sl.update_strategic(&trade_id, candidate).await {
                Ok(SlUpdate::Updated(levels)) => {
                    self.events
                        .emit(
                            Event::new(
                                EventType::TrailUpdated,
                                format!(
                                    "{} trail -> strategic {:.4}, emergency {:.4}",
                                    symbol, levels.strategic, levels.emergency
                                ),
                            )
                            .with_symbol(symbol)
                            .with_trade(&trade_id)
                            .with_payload(serde_json::json!({
                                "strategic": levels.strategic,
                                "emergency": levels.emergency,
                            })),
                        )
                        .await;
                }
                Ok(SlUpdate::Ignored) => {}
                Err(first_err) => {
                    // One retry, then downgrade trailing for this trade.
                    match self.sl.update_strategic(&trade_id, candidate).await {
                        Ok(_) => {}
                        Err(e) => {
                            self.trailing.deactivate(&trade_id);
                            self.events
                                .emit(
                                    Event::new(
                                        EventType::SlSetFailed,
                                        format!(
                                            "{} stop move failed twice ({}; {}); trailing off",
                                            symbol, first_err, e
                                        ),
                                    )
                                    .with_symbol(symbol)
                                    .with_trade(&trade_id),
                                )
                                .await;
                            self.events
                                .emit(
                                    Event::new(
                                        EventType::TrailDeactivated,
                                        format!("{} trailing deactivated", symbol),
                                    )
                                    .with_symbol(symbol)
                                    .with_trade(&trade_id),
                                )
                                .await;
                        }
                    }
                }
            }
        }
    }

    /// Position-stream reactor: exchange truth drives the state machine.
    pub async fn handle_position_event(&self, event: &PositionEvent) {
        match event {
            PositionEvent::Opened(p) => {
                self.events
                    .emit(
                        Event::new(
                            EventType::PositionOpened,
                            format!(
                                "{} {} {:.6} @ {:.4}",
                                p.symbol,
                                p.side.as_str(),
                                p.size,
                                p.avg_price
                            ),
                        )
                        .with_symbol(&p.symbol)
                        .with_payload(serde_json::to_value(p).unwrap_or_default()),
                    )
                    .await;
            }
            PositionEvent::Updated(p) => {
                self.events
                    .emit(
                        Event::new(
                            EventType::PositionUpdated,
                            format!("{} position updated (size {:.6})", p.symbol, p.size),
                        )
                        .with_symbol(&p.symbol)
                        .with_payload(serde_json::to_value(p).unwrap_or_default()),
                    )
                    .await;
            }
            PositionEvent::Pnl {
                symbol,
                unrealized_pnl,
            } => {
                self.events
                    .emit(
                        Event::new(
                            EventType::PnlUpdate,
                            format!("{} unrealized PnL {:.2}", symbol, unrealized_pnl),
                        )
                        .with_symbol(symbol)
                        .with_payload(serde_json::json!({ "unrealizedPnl": unrealized_pnl })),
                    )
                    .await;
            }
            PositionEvent::Closed { last, realized_pnl } => {
                self.on_position_closed(last, *realized_pnl).await;
            }
        }
    }

    async fn on_position_closed(&self, last: &TrackedPosition, realized_pnl: Option<f64>) {
        let symbol = last.symbol.as_str();
        let trade = self.active.write().remove(symbol);

        let reason = trade
            .as_ref()
            .and_then(|t| t.pending_close_reason)
            .unwrap_or_else(|| infer_exit_reason(last));

        // Route the state machine: a stop-out locks the stopped direction
        // (per the contract's re-entry policy); anything else is clean.
        let lock = matches!(reason, CloseReason::StopLoss | CloseReason::Liquidation)
            && trade
                .as_ref()
                .map_or(true, |t| t.contract.lock_same_direction_on_stop);
        if lock {
            self.sm.exit_stopped(symbol);
            self.events
                .emit(
                    Event::new(
                        EventType::LockSet,
                        format!("{} locked {} after stop-out", symbol, last.side.as_str()),
                    )
                    .with_symbol(symbol),
                )
                .await;
        } else {
            self.sm.exit_clean(symbol);
        }

        if let Some(trade) = &trade {
            let trade_id = &trade.contract.trade_id;
            self.sl.release(trade_id);
            self.trailing.release(trade_id);
            let _ = self
                .db
                .close_trade(
                    trade_id,
                    Utc::now().timestamp_millis(),
                    reason.as_str(),
                    realized_pnl,
                )
                .await;
        }

        let mut event = Event::new(
            EventType::PositionClosed,
            format!(
                "{} closed ({}) pnl {}",
                symbol,
                reason.as_str(),
                realized_pnl
                    .map(|p| format!("{:.2}", p))
                    .unwrap_or_else(|| "unknown".to_string())
            ),
        )
        .with_symbol(symbol)
        .with_payload(serde_json::json!({
            "reason": reason.as_str(),
            "realizedPnl": realized_pnl,
        }));
        if let Some(trade) = &trade {
            event = event.with_trade(&trade.contract.trade_id);
        }
        self.events.emit(event).await;

        // Feed the circuit breaker; its window seeds from current equity.
        if let Some(pnl) = realized_pnl {
            let equity = self.exchange.get_wallet_balance().await.unwrap_or(0.0);
            match self.breaker.record_pnl(pnl, equity, Utc::now()) {
                RecordOutcome::Tripped => {
                    let state = self.breaker.snapshot();
                    self.events
                        .emit(
                            Event::new(
                                EventType::CircuitBreakerTripped,
                                state
                                    .trip_reason
                                    .clone()
                                    .unwrap_or_else(|| "circuit breaker tripped".to_string()),
                            )
                            .with_payload(serde_json::to_value(&state).unwrap_or_default()),
                        )
                        .await;
                }
                RecordOutcome::WindowReset => {
                    self.events
                        .emit(Event::new(
                            EventType::CircuitBreakerWindowReset,
                            "circuit breaker window rolled over",
                        ))
                        .await;
                }
                RecordOutcome::Recorded => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // User management ops
    // ------------------------------------------------------------------

    /// Operator SL move; the in-favor rule still applies.
    pub async fn move_sl(&self, symbol: &str, price: f64) -> Result<SlUpdate, ExecError> {
        let trade = self.active_trade(symbol).ok_or_else(|| {
            Rejection::new(RejectReason::NotInPosition, format!("{} has no trade", symbol))
        })?;
        let update = self
            .sl
            .update_strategic(&trade.contract.trade_id, price)
            .await?;
        match &update {
            SlUpdate::Updated(levels) => {
                self.events
                    .emit(
                        Event::new(
                            EventType::SlUpdated,
                            format!("{} stop moved to {:.4}", symbol, levels.strategic),
                        )
                        .with_symbol(symbol)
                        .with_trade(&trade.contract.trade_id),
                    )
                    .await;
            }
            SlUpdate::Ignored => {
                self.events
                    .emit(
                        Event::new(
                            EventType::SlUpdateIgnored,
                            format!("{} stop move to {:.4} would worsen; ignored", symbol, price),
                        )
                        .with_symbol(symbol)
                        .with_trade(&trade.contract.trade_id),
                    )
                    .await;
            }
        }
        Ok(update)
    }

    pub async fn set_tp(
        &self,
        symbol: &str,
        price: Option<f64>,
        rr: Option<f64>,
    ) -> Result<f64, ExecError> {
        let trade = self.active_trade(symbol).ok_or_else(|| {
            Rejection::new(RejectReason::NotInPosition, format!("{} has no trade", symbol))
        })?;
        let tp_price = match (price, rr) {
            (Some(p), _) => p,
            (None, Some(rr)) => {
                let entry = trade.entry_price.ok_or_else(|| {
                    Rejection::new(RejectReason::InvalidIntent, "entry not filled yet")
                })?;
                let strategic = self
                    .sl
                    .levels(&trade.contract.trade_id)
                    .map(|l| l.strategic)
                    .or(trade.contract.sl.strategic)
                    .ok_or_else(|| {
                        Rejection::new(RejectReason::InvalidIntent, "no stop to derive R from")
                    })?;
                let risk = (entry - strategic).abs();
                match trade.contract.side {
                    Side::Long => entry + risk * rr,
                    Side::Short => entry - risk * rr,
                }
            }
            (None, None) => {
                return Err(
                    Rejection::new(RejectReason::InvalidIntent, "tp needs a price or an R multiple")
                        .into(),
                )
            }
        };

        self.exchange.set_take_profit(symbol, Some(tp_price)).await?;
        self.events
            .emit(
                Event::new(
                    EventType::TakeProfitSet,
                    format!("{} TP set to {:.4}", symbol, tp_price),
                )
                .with_symbol(symbol)
                .with_trade(&trade.contract.trade_id),
            )
            .await;
        Ok(tp_price)
    }

    pub async fn set_trail(&self, symbol: &str, mode: TrailMode) -> Result<(), ExecError> {
        let trade = self.active_trade(symbol).ok_or_else(|| {
            Rejection::new(RejectReason::NotInPosition, format!("{} has no trade", symbol))
        })?;
        self.trailing.set_mode(&trade.contract.trade_id, mode);
        let (event_type, message) = if mode == TrailMode::None {
            (
                EventType::TrailDeactivated,
                format!("{} trailing off", symbol),
            )
        } else {
            (
                EventType::TrailActivated,
                format!("{} trailing {:?}", symbol, mode),
            )
        };
        self.events
            .emit(
                Event::new(event_type, message)
                    .with_symbol(symbol)
                    .with_trade(&trade.contract.trade_id),
            )
            .await;
        Ok(())
    }

    pub async fn cancel_orders(&self, symbol: &str) -> Result<(), ExecError> {
        self.orders.cancel_all_for_symbol(symbol).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Startup reconciliation
    // ------------------------------------------------------------------

    /// Rehydrate persisted open trades against live exchange positions.
    /// Matching symbol+side restores the contract; anything else closes
    /// with UNKNOWN_RESTART.
    pub async fn startup_resync(&self) -> Result<()> {
        let infos = self.exchange.get_positions(None).await?;
        self.positions.refresh(infos);

        let open_trades = self.db.load_open_trades().await?;
        for record in open_trades {
            let contract: TradeContract = match serde_json::from_str(&record.contract_json) {
                Ok(c) => c,
                Err(e) => {
                    warn!(trade_id = %record.trade_id, error = %e, "unreadable persisted contract");
                    continue;
                }
            };

            let matched = self
                .positions
                .get(&record.symbol)
                .filter(|p| p.side == contract.side);

            if let Some(position) = matched {
                if let Some(strategic) = contract.sl.strategic {
                    self.sl.register(
                        &contract.trade_id,
                        &contract.symbol,
                        contract.side,
                        strategic,
                        contract.sl.emergency.unwrap_or(strategic),
                        contract.sl.buffer_pct,
                    );
                }
                if contract.trail.mode != TrailMode::None {
                    self.trailing.register(
                        &contract.trade_id,
                        &contract.symbol,
                        contract.side,
                        contract.trail.mode,
                        contract.trail.active,
                    );
                    self.trailing.set_entry(
                        &contract.trade_id,
                        record.entry_price.unwrap_or(position.avg_price),
                        contract.sl.strategic,
                    );
                }
                self.sm.enter_position(&contract.symbol, contract.side);
                self.events
                    .emit(
                        Event::new(
                            EventType::TradeRestored,
                            format!("{} trade restored after restart", contract.symbol),
                        )
                        .with_symbol(&contract.symbol)
                        .with_trade(&contract.trade_id),
                    )
                    .await;
                self.active.write().insert(
                    contract.symbol.clone(),
                    ActiveTrade {
                        entry_link_id: String::new(),
                        entry_price: record.entry_price.or(Some(position.avg_price)),
                        qty: record.size.unwrap_or(position.size),
                        contract,
                        pending_close_reason: None,
                    },
                );
            } else {
                let _ = self
                    .db
                    .close_trade(
                        &record.trade_id,
                        Utc::now().timestamp_millis(),
                        CloseReason::UnknownRestart.as_str(),
                        None,
                    )
                    .await;
                self.events
                    .emit(
                        Event::new(
                            EventType::TradeClosedUnknownRestart,
                            format!(
                                "{} persisted trade has no matching position; closed",
                                record.symbol
                            ),
                        )
                        .with_symbol(&record.symbol)
                        .with_trade(&record.trade_id),
                    )
                    .await;
            }
        }

        info!(
            restored = self.active.read().len(),
            "startup reconciliation complete"
        );
        Ok(())
    }
}

/// Closest protective level within the proximity window wins, checked in
/// stop, take-profit, liquidation order.
fn infer_exit_reason(last: &TrackedPosition) -> CloseReason {
    let Some(mark) = last.mark_price else {
        return CloseReason::Unknown;
    };
    let near = |level: Option<f64>| {
        level.map_or(f64::INFINITY, |l| ((mark - l) / mark * 100.0).abs())
    };
    let candidates = [
        (CloseReason::StopLoss, near(last.stop_loss)),
        (CloseReason::TakeProfit, near(last.take_profit)),
        (CloseReason::Liquidation, near(last.liq_price)),
    ];
    candidates
        .into_iter()
        .filter(|(_, d)| *d <= EXIT_REASON_PROXIMITY_PCT)
        .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(r, _)| r)
        .unwrap_or(CloseReason::Unknown)
}

fn trade_record_for(contract: &TradeContract, entry_price: Option<f64>, size: f64) -> TradeRecord {
    TradeRecord {
        trade_id: contract.trade_id.clone(),
        symbol: contract.symbol.clone(),
        side: contract.side.as_str().to_string(),
        status: "EXECUTED".to_string(),
        contract_json: serde_json::to_string(contract).unwrap_or_else(|_| "{}".to_string()),
        entry_price,
        size: Some(size),
        opened_at: contract.created_at.timestamp_millis(),
        closed_at: None,
        exit_reason: None,
        realized_pnl: None,
    }
}
