//! API route handlers.
//!
//! The core returns typed results; these handlers translate them into the
//! JSON the UI expects. Rejections answer with `success: false` and the
//! precise rule that fired, never an HTTP error.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::AppState;
use crate::agent::intent::{
    normalize_symbol, parse_command, Intent, IntentAction, SlRule, SymbolConfig, TpRule, TrailMode,
};
use crate::agent::watch::{WatchMode, WatchPreset, WatchRule, WatchTrigger};
use crate::agent::{RejectReason, Rejection};
use crate::events::{Event, EventType};
use crate::execution::{CloseReason, ExecError};
use crate::models::Side;
use crate::strategy::StrategyState;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub success: bool,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opinion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ChatResponse {
    fn ok(kind: &str, message: impl Into<String>) -> Self {
        Self {
            success: true,
            kind: kind.to_string(),
            message: message.into(),
            opinion: None,
            data: None,
        }
    }

    fn rejected(kind: &str, rejection: &Rejection) -> Self {
        Self {
            success: false,
            kind: kind.to_string(),
            message: rejection.message.clone(),
            opinion: rejection.suggestion.clone(),
            data: serde_json::to_value(rejection).ok(),
        }
    }

    fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

fn exec_error_response(kind: &str, error: ExecError) -> ChatResponse {
    match error {
        ExecError::Rejected(rejection) => ChatResponse::rejected(kind, &rejection),
        ExecError::Failed(e) => {
            warn!(error = %e, "execution failure");
            ChatResponse {
                success: false,
                kind: kind.to_string(),
                message: format!("execution failed: {}", e),
                opinion: None,
                data: None,
            }
        }
    }
}

/// Advisory text built from the strategy state. Informational only; it can
/// never change a decision.
fn opinion_for(state: &StrategyState) -> String {
    match &state.snapshot {
        Some(s) => format!(
            "{}: bias {}, supertrend {} at {:.4}, structure {}, price {:.4}. Long entries {}, short entries {}.{}",
            state.symbol,
            state.bias.as_str(),
            s.supertrend_direction.as_str(),
            s.supertrend_value,
            s.structure_bias.as_str(),
            s.price,
            if state.allow_long_entry { "allowed" } else { "blocked" },
            if state.allow_short_entry { "allowed" } else { "blocked" },
            state
                .risk_warning
                .as_ref()
                .map(|w| format!(" Warning: {}", w))
                .unwrap_or_default(),
        ),
        None => format!("{}: not enough data yet", state.symbol),
    }
}

pub async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Json<ChatResponse> {
    let intent = parse_command(&request.message);
    Json(dispatch_intent(&state, intent).await)
}

async fn dispatch_intent(state: &AppState, intent: Intent) -> ChatResponse {
    let kind = format!("{:?}", intent.action);
    match intent.action {
        IntentAction::EnterLong | IntentAction::EnterShort => {
            match state.executor.enter(&intent).await {
                Ok(contract) => ChatResponse::ok(
                    &kind,
                    format!(
                        "{} {} entry placed (qty {:.6})",
                        contract.symbol,
                        contract.side.as_str(),
                        contract.qty
                    ),
                )
                .with_data(serde_json::to_value(&contract).unwrap_or_default()),
                Err(e) => exec_error_response(&kind, e),
            }
        }
        IntentAction::Close | IntentAction::ClosePartial => {
            let Some(symbol) = intent.symbol.clone() else {
                return ChatResponse::rejected(
                    &kind,
                    &Rejection::new(RejectReason::InvalidIntent, "close needs a symbol"),
                );
            };
            let percent = intent.partial_close_pct.unwrap_or(100.0);
            match state
                .executor
                .close_position(&symbol, percent, CloseReason::Manual)
                .await
            {
                Ok(()) => ChatResponse::ok(&kind, format!("{} closing {:.0}%", symbol, percent)),
                Err(e) => exec_error_response(&kind, e),
            }
        }
        IntentAction::CancelOrder => {
            let Some(symbol) = intent.symbol.clone() else {
                return ChatResponse::rejected(
                    &kind,
                    &Rejection::new(RejectReason::InvalidIntent, "cancel needs a symbol"),
                );
            };
            match state.executor.cancel_orders(&symbol).await {
                Ok(()) => ChatResponse::ok(&kind, format!("{} open orders cancelled", symbol)),
                Err(e) => exec_error_response(&kind, e),
            }
        }
        IntentAction::MoveSl => {
            let (Some(symbol), Some(price)) = (intent.symbol.clone(), intent.sl_price) else {
                return ChatResponse::rejected(
                    &kind,
                    &Rejection::new(RejectReason::InvalidIntent, "move-sl needs symbol and price"),
                );
            };
            match state.executor.move_sl(&symbol, price).await {
                Ok(update) => ChatResponse::ok(&kind, format!("{} stop: {:?}", symbol, update)),
                Err(e) => exec_error_response(&kind, e),
            }
        }
        IntentAction::SetTp => {
            let Some(symbol) = intent.symbol.clone() else {
                return ChatResponse::rejected(
                    &kind,
                    &Rejection::new(RejectReason::InvalidIntent, "tp needs a symbol"),
                );
            };
            match state
                .executor
                .set_tp(&symbol, intent.tp_price, intent.tp_rr)
                .await
            {
                Ok(price) => ChatResponse::ok(&kind, format!("{} TP set to {:.4}", symbol, price)),
                Err(e) => exec_error_response(&kind, e),
            }
        }
        IntentAction::SetTrail => {
            let (Some(symbol), Some(mode)) = (intent.symbol.clone(), intent.trail_mode) else {
                return ChatResponse::rejected(
                    &kind,
                    &Rejection::new(RejectReason::InvalidIntent, "trail needs symbol and mode"),
                );
            };
            match state.executor.set_trail(&symbol, mode).await {
                Ok(()) => ChatResponse::ok(&kind, format!("{} trail mode {:?}", symbol, mode)),
                Err(e) => exec_error_response(&kind, e),
            }
        }
        IntentAction::Pause => {
            state.executor.pause().await;
            ChatResponse::ok(&kind, "trading paused")
        }
        IntentAction::Resume => {
            state.executor.resume().await;
            ChatResponse::ok(&kind, "trading resumed")
        }
        IntentAction::WatchCreate => match watch_from_text(&intent) {
            Ok(rule) => {
                let rule = state.watches.create(rule);
                if let Err(e) = state.db.upsert_watch(&rule.to_record()).await {
                    warn!(error = %e, "watch persist failed");
                }
                state
                    .events
                    .emit(
                        Event::new(
                            EventType::WatchCreated,
                            format!("{} watch {} created", rule.symbol, rule.id),
                        )
                        .with_symbol(&rule.symbol)
                        .with_payload(serde_json::to_value(&rule).unwrap_or_default()),
                    )
                    .await;
                ChatResponse::ok(&kind, format!("watching {} ({})", rule.symbol, rule.id))
                    .with_data(serde_json::to_value(&rule).unwrap_or_default())
            }
            Err(rejection) => ChatResponse::rejected(&kind, &rejection),
        },
        IntentAction::WatchCancel => {
            let Some(id) = intent.watch_id.clone() else {
                return ChatResponse::rejected(
                    &kind,
                    &Rejection::new(RejectReason::InvalidIntent, "unwatch needs an id"),
                );
            };
            match state.watches.cancel(&id) {
                Some(rule) => {
                    let _ = state.db.update_watch_status(&id, "CANCELLED").await;
                    state
                        .events
                        .emit(
                            Event::new(
                                EventType::WatchCancelled,
                                format!("watch {} cancelled", id),
                            )
                            .with_symbol(&rule.symbol),
                        )
                        .await;
                    ChatResponse::ok(&kind, format!("watch {} cancelled", id))
                }
                None => ChatResponse::rejected(
                    &kind,
                    &Rejection::new(RejectReason::InvalidIntent, "no active watch with that id"),
                ),
            }
        }
        IntentAction::Opinion | IntentAction::Info => {
            let Some(symbol) = intent.symbol.clone() else {
                return ChatResponse::rejected(
                    &kind,
                    &Rejection::new(RejectReason::InvalidIntent, "which symbol?"),
                );
            };
            match state.strategy.state(&symbol) {
                Some(s) => {
                    let mut response =
                        ChatResponse::ok(&kind, format!("{} state", symbol))
                            .with_data(serde_json::to_value(&*s).unwrap_or_default());
                    response.opinion = Some(opinion_for(&s));
                    response
                }
                None => ChatResponse::rejected(
                    &kind,
                    &Rejection::new(
                        RejectReason::InvalidIntent,
                        format!("{} is not registered", symbol),
                    ),
                ),
            }
        }
        IntentAction::Unknown => ChatResponse::rejected(
            &kind,
            &Rejection::new(
                RejectReason::CommandNotUnderstood,
                "command not understood",
            )
            .with_suggestion("try: long BTC risk 1 | close BTC | status BTC | pause"),
        ),
    }
}

/// Watch parameters from a text command:
/// `watch <symbol> [long|short] (near <level> <pct> | above <price> | below <price>) [auto] [expires <minutes>]`
fn watch_from_text(intent: &Intent) -> Result<WatchRule, Rejection> {
    let symbol = intent
        .symbol
        .clone()
        .ok_or_else(|| Rejection::new(RejectReason::InvalidIntent, "watch needs a symbol"))?;
    let raw = intent.raw.clone().unwrap_or_default();
    let tokens: Vec<String> = raw
        .split_whitespace()
        .map(|t| t.to_ascii_lowercase())
        .collect();

    let mut side = Side::Long;
    let mut trigger: Option<WatchTrigger> = None;
    let mut threshold_pct: Option<f64> = None;
    let mut target_price: Option<f64> = None;
    let mut mode = WatchMode::NotifyOnly;
    let mut expiry = None;

    let mut i = 2; // skip "watch <symbol>"
    while i < tokens.len() {
        match tokens[i].as_str() {
            "long" => side = Side::Long,
            "short" => side = Side::Short,
            "auto" => mode = WatchMode::AutoEnter,
            "near" => {
                let level = tokens.get(i + 1).map(String::as_str).unwrap_or("");
                trigger = match level {
                    "sma200" | "sma" => Some(WatchTrigger::CloserToSma200),
                    "ema1000" | "ema" => Some(WatchTrigger::CloserToEma1000),
                    "supertrend" | "st" => Some(WatchTrigger::CloserToSupertrend),
                    _ => None,
                };
                threshold_pct = tokens.get(i + 2).and_then(|t| t.parse().ok());
                i += 2;
            }
            "above" => {
                trigger = Some(WatchTrigger::PriceAbove);
                target_price = tokens.get(i + 1).and_then(|t| t.parse().ok());
                side = Side::Long;
                i += 1;
            }
            "below" => {
                trigger = Some(WatchTrigger::PriceBelow);
                target_price = tokens.get(i + 1).and_then(|t| t.parse().ok());
                side = Side::Short;
                i += 1;
            }
            "expires" => {
                if let Some(minutes) = tokens.get(i + 1).and_then(|t| t.parse::<i64>().ok()) {
                    expiry = Some(Utc::now() + ChronoDuration::minutes(minutes));
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    let trigger = trigger.ok_or_else(|| {
        Rejection::new(
            RejectReason::InvalidIntent,
            "watch needs a trigger: near <level> <pct>, above <price>, or below <price>",
        )
    })?;
    match trigger {
        WatchTrigger::PriceAbove | WatchTrigger::PriceBelow if target_price.is_none() => {
            return Err(Rejection::new(
                RejectReason::InvalidIntent,
                "price watch needs a target price",
            ));
        }
        WatchTrigger::CloserToSma200
        | WatchTrigger::CloserToEma1000
        | WatchTrigger::CloserToSupertrend
            if threshold_pct.is_none() =>
        {
            return Err(Rejection::new(
                RejectReason::InvalidIntent,
                "proximity watch needs a threshold percent",
            ));
        }
        _ => {}
    }

    let mut rule = WatchRule::new(symbol, side, trigger, mode);
    rule.threshold_pct = threshold_pct;
    rule.target_price = target_price;
    rule.expiry = expiry;
    Ok(rule)
}

// ----------------------------------------------------------------------
// Status / circuit breaker / admin
// ----------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub paused: bool,
    pub degraded: bool,
    pub circuit_breaker: crate::agent::circuit_breaker::CircuitBreakerState,
    pub symbols: serde_json::Value,
    pub active_trades: usize,
    pub timestamp: String,
}

pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        paused: state.sm.is_paused(),
        degraded: state.executor.is_degraded(),
        circuit_breaker: state.breaker.snapshot(),
        symbols: serde_json::to_value(state.sm.all()).unwrap_or_default(),
        active_trades: state.executor.active_trades().len(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

pub async fn circuit_breaker(
    State(state): State<AppState>,
) -> Json<crate::agent::circuit_breaker::CircuitBreakerState> {
    Json(state.breaker.snapshot())
}

pub async fn circuit_breaker_override(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.breaker.set_override(true);
    state
        .events
        .emit(Event::new(
            EventType::CircuitBreakerOverride,
            "circuit breaker override enabled",
        ))
        .await;
    Json(serde_json::json!({ "success": true }))
}

pub async fn circuit_breaker_reset(State(state): State<AppState>) -> Json<serde_json::Value> {
    let equity = state.exchange.get_wallet_balance().await.unwrap_or(0.0);
    state.breaker.reset(equity, Utc::now());
    state
        .events
        .emit(Event::new(
            EventType::CircuitBreakerReset,
            "circuit breaker reset",
        ))
        .await;
    Json(serde_json::json!({ "success": true }))
}

pub async fn pause(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.executor.pause().await;
    Json(serde_json::json!({ "success": true, "paused": true }))
}

pub async fn resume(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.executor.resume().await;
    Json(serde_json::json!({ "success": true, "paused": false }))
}

pub async fn unlock(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Json<serde_json::Value> {
    let symbol = normalize_symbol(&symbol);
    state.sm.force_unlock(&symbol);
    state
        .events
        .emit(
            Event::new(
                EventType::LockCleared,
                format!("{} unlocked by operator", symbol),
            )
            .with_symbol(&symbol),
        )
        .await;
    Json(serde_json::json!({ "success": true, "symbol": symbol }))
}

// ----------------------------------------------------------------------
// Strategy
// ----------------------------------------------------------------------

pub async fn strategy_state(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<Json<StrategyState>, StatusCode> {
    let symbol = normalize_symbol(&symbol);
    state
        .strategy
        .state(&symbol)
        .map(|s| Json((*s).clone()))
        .ok_or(StatusCode::NOT_FOUND)
}

pub async fn strategy_states(State(state): State<AppState>) -> Json<Vec<StrategyState>> {
    Json(
        state
            .strategy
            .all_states()
            .into_iter()
            .map(|s| (*s).clone())
            .collect(),
    )
}

pub async fn register_symbol(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<Json<StrategyState>, StatusCode> {
    let symbol = normalize_symbol(&symbol);
    state.market_feed.request_subscribe(&symbol);
    let candles = state
        .exchange
        .get_klines(&symbol, &state.config.interval, state.config.warmup_candles)
        .await
        .map_err(|e| {
            warn!(symbol = %symbol, error = %e, "kline backfill failed");
            StatusCode::BAD_GATEWAY
        })?;
    let added = state.store.seed(candles);
    state
        .events
        .emit(
            Event::new(
                EventType::CandleBackfill,
                format!("{} backfilled {} candles", symbol, added),
            )
            .with_symbol(&symbol),
        )
        .await;
    let computed = state.strategy.recompute(&symbol);
    Ok(Json((*computed).clone()))
}

pub async fn recompute_symbol(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Json<StrategyState> {
    let symbol = normalize_symbol(&symbol);
    Json((*state.strategy.recompute(&symbol)).clone())
}

#[derive(Debug, Serialize)]
pub struct DistanceResponse {
    pub symbol: String,
    pub kind: String,
    pub level: Option<f64>,
    pub price: Option<f64>,
    pub distance_pct: Option<f64>,
}

pub async fn distance(
    State(state): State<AppState>,
    Path((symbol, kind)): Path<(String, String)>,
) -> Result<Json<DistanceResponse>, StatusCode> {
    let symbol = normalize_symbol(&symbol);
    let strategy_state = state.strategy.state(&symbol).ok_or(StatusCode::NOT_FOUND)?;
    let snapshot = strategy_state
        .snapshot
        .as_ref()
        .ok_or(StatusCode::NOT_FOUND)?;

    let (level, distance_pct) = match kind.to_ascii_lowercase().as_str() {
        "sma200" => (snapshot.sma200, snapshot.distance_to_sma200_pct),
        "ema1000" => (snapshot.ema1000, snapshot.distance_to_ema1000_pct),
        "supertrend" => (
            Some(snapshot.supertrend_value),
            snapshot.distance_to_supertrend_pct,
        ),
        "swing" => (
            snapshot.protected_swing_for(snapshot.supertrend_direction),
            snapshot.distance_to_protected_swing_pct,
        ),
        _ => return Err(StatusCode::BAD_REQUEST),
    };

    Ok(Json(DistanceResponse {
        symbol,
        kind,
        level,
        price: Some(snapshot.price),
        distance_pct,
    }))
}

// ----------------------------------------------------------------------
// Execution
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct EnterRequest {
    pub symbol: String,
    pub side: String,
    pub risk_pct: Option<f64>,
    pub risk_usd: Option<f64>,
    pub leverage: Option<f64>,
    pub sl_rule: Option<SlRule>,
    pub sl_price: Option<f64>,
    pub tp_rule: Option<TpRule>,
    pub tp_price: Option<f64>,
    pub tp_rr: Option<f64>,
    pub trail_mode: Option<TrailMode>,
    pub limit_price: Option<f64>,
}

pub async fn enter(
    State(state): State<AppState>,
    Json(request): Json<EnterRequest>,
) -> Json<ChatResponse> {
    let Some(side) = Side::parse(&request.side) else {
        return Json(ChatResponse::rejected(
            "ENTER",
            &Rejection::new(RejectReason::InvalidIntent, "side must be LONG or SHORT"),
        ));
    };
    let mut intent = Intent::new(match side {
        Side::Long => IntentAction::EnterLong,
        Side::Short => IntentAction::EnterShort,
    });
    intent.symbol = Some(normalize_symbol(&request.symbol));
    intent.risk_pct = request.risk_pct;
    intent.risk_usd = request.risk_usd;
    intent.leverage = request.leverage;
    intent.sl_rule = request.sl_rule;
    intent.sl_price = request.sl_price;
    intent.tp_rule = request.tp_rule;
    intent.tp_price = request.tp_price;
    intent.tp_rr = request.tp_rr;
    intent.trail_mode = request.trail_mode;
    intent.limit_price = request.limit_price;

    Json(dispatch_intent(&state, intent).await)
}

#[derive(Debug, Deserialize)]
pub struct ExitRequest {
    pub symbol: String,
    pub percent: Option<f64>,
}

pub async fn exit(
    State(state): State<AppState>,
    Json(request): Json<ExitRequest>,
) -> Json<ChatResponse> {
    let symbol = normalize_symbol(&request.symbol);
    let percent = request.percent.unwrap_or(100.0);
    match state
        .executor
        .close_position(&symbol, percent, CloseReason::Manual)
        .await
    {
        Ok(()) => Json(ChatResponse::ok(
            "EXIT",
            format!("{} closing {:.0}%", symbol, percent),
        )),
        Err(e) => Json(exec_error_response("EXIT", e)),
    }
}

pub async fn positions(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(state.positions.list()).unwrap_or_default())
}

#[derive(Debug, Deserialize)]
pub struct TradesQuery {
    pub limit: Option<usize>,
}

pub async fn trades(
    State(state): State<AppState>,
    Query(query): Query<TradesQuery>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let trades = state
        .db
        .list_trades(query.limit.unwrap_or(100))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(serde_json::to_value(trades).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub symbol: Option<String>,
    pub limit: Option<usize>,
}

pub async fn events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let symbol = query.symbol.as_deref().map(normalize_symbol);
    let events = state
        .db
        .list_events(symbol.as_deref(), query.limit.unwrap_or(100))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(serde_json::to_value(events).unwrap_or_default()))
}

// ----------------------------------------------------------------------
// Per-symbol configuration
// ----------------------------------------------------------------------

pub async fn get_symbol_config(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<Json<SymbolConfig>, StatusCode> {
    let symbol = normalize_symbol(&symbol);
    let json = state
        .db
        .get_symbol_config(&symbol)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    match json {
        Some(json) => serde_json::from_str(&json)
            .map(Json)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR),
        None => Ok(Json(SymbolConfig::default())),
    }
}

pub async fn set_symbol_config(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Json(config): Json<SymbolConfig>,
) -> Result<Json<SymbolConfig>, StatusCode> {
    let symbol = normalize_symbol(&symbol);
    let json = serde_json::to_string(&config).map_err(|_| StatusCode::BAD_REQUEST)?;
    state
        .db
        .set_symbol_config(&symbol, &json, Utc::now().timestamp_millis())
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(config))
}

// ----------------------------------------------------------------------
// Watches
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct WatchRequest {
    pub symbol: String,
    pub side: String,
    pub trigger_type: String,
    pub threshold_pct: Option<f64>,
    pub target_price: Option<f64>,
    pub auto_enter: Option<bool>,
    pub expiry_minutes: Option<i64>,
    pub preset: Option<WatchPreset>,
}

pub async fn create_watch(
    State(state): State<AppState>,
    Json(request): Json<WatchRequest>,
) -> Result<Json<WatchRule>, StatusCode> {
    let side = Side::parse(&request.side).ok_or(StatusCode::BAD_REQUEST)?;
    let trigger = WatchTrigger::parse(&request.trigger_type).ok_or(StatusCode::BAD_REQUEST)?;
    let mode = if request.auto_enter.unwrap_or(false) {
        WatchMode::AutoEnter
    } else {
        WatchMode::NotifyOnly
    };

    let mut rule = WatchRule::new(normalize_symbol(&request.symbol), side, trigger, mode);
    rule.threshold_pct = request.threshold_pct;
    rule.target_price = request.target_price;
    rule.expiry = request
        .expiry_minutes
        .map(|m| Utc::now() + ChronoDuration::minutes(m));
    rule.preset = request.preset;

    let rule = state.watches.create(rule);
    state
        .db
        .upsert_watch(&rule.to_record())
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    state
        .events
        .emit(
            Event::new(
                EventType::WatchCreated,
                format!("{} watch {} created", rule.symbol, rule.id),
            )
            .with_symbol(&rule.symbol)
            .with_payload(serde_json::to_value(&rule).unwrap_or_default()),
        )
        .await;
    Ok(Json(rule))
}

pub async fn list_watches(State(state): State<AppState>) -> Json<Vec<WatchRule>> {
    Json(state.watches.list())
}

pub async fn cancel_watch(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let rule = state.watches.cancel(&id).ok_or(StatusCode::NOT_FOUND)?;
    let _ = state.db.update_watch_status(&id, "CANCELLED").await;
    state
        .events
        .emit(
            Event::new(EventType::WatchCancelled, format!("watch {} cancelled", id))
                .with_symbol(&rule.symbol),
        )
        .await;
    Ok(Json(serde_json::json!({ "success": true, "id": id })))
}
