//! HTTP + WebSocket surface for the operator UI.

pub mod routes;

use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::Response,
    routing::{delete, get, post},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio::time::{interval, Duration};
use tower_http::cors::CorsLayer;
use tracing::debug;

use crate::agent::circuit_breaker::CircuitBreaker;
use crate::agent::state_machine::StateMachine;
use crate::agent::watch::WatchManager;
use crate::events::EventLog;
use crate::exchange::ExchangeApi;
use crate::execution::{Executor, PositionTracker};
use crate::market::{CandleStore, PublicFeed};
use crate::models::{Config, WsEventKind, WsServerEvent};
use crate::storage::AgentDb;
use crate::strategy::StrategyEngine;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub db: Arc<AgentDb>,
    pub events: EventLog,
    pub exchange: Arc<dyn ExchangeApi>,
    pub store: Arc<CandleStore>,
    pub sm: Arc<StateMachine>,
    pub breaker: Arc<CircuitBreaker>,
    pub strategy: Arc<StrategyEngine>,
    pub executor: Arc<Executor>,
    pub positions: Arc<PositionTracker>,
    pub watches: Arc<WatchManager>,
    pub market_feed: Arc<PublicFeed>,
    pub ui_tx: broadcast::Sender<WsServerEvent>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/agent/chat", post(routes::chat))
        .route("/agent/status", get(routes::status))
        .route("/agent/circuit-breaker", get(routes::circuit_breaker))
        .route(
            "/agent/circuit-breaker/override",
            post(routes::circuit_breaker_override),
        )
        .route(
            "/agent/circuit-breaker/reset",
            post(routes::circuit_breaker_reset),
        )
        .route("/agent/pause", post(routes::pause))
        .route("/agent/resume", post(routes::resume))
        .route("/agent/unlock/:symbol", post(routes::unlock))
        .route("/agent/watches", get(routes::list_watches))
        .route("/agent/watch", post(routes::create_watch))
        .route("/agent/watch/:id", delete(routes::cancel_watch))
        .route("/agent/distance/:symbol/:kind", get(routes::distance))
        .route("/agent/events", get(routes::events))
        .route(
            "/agent/symbol-config/:symbol",
            get(routes::get_symbol_config).post(routes::set_symbol_config),
        )
        .route("/strategy/state/:symbol", get(routes::strategy_state))
        .route("/strategy/states", get(routes::strategy_states))
        .route("/strategy/register/:symbol", post(routes::register_symbol))
        .route("/strategy/recompute/:symbol", post(routes::recompute_symbol))
        .route("/execution/enter", post(routes::enter))
        .route("/execution/exit", post(routes::exit))
        .route("/execution/positions", get(routes::positions))
        .route("/execution/trades", get(routes::trades))
        .route("/ws", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| ws_client(socket, state))
}

/// Fan out server events; ping every 30 s so half-open clients drop.
async fn ws_client(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let mut rx = state.ui_tx.subscribe();
    let mut ping = interval(Duration::from_secs(30));
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        let Ok(text) = serde_json::to_string(&event) else { continue };
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "ws client lagged; continuing");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) if text.contains("ping") => {
                        let pong = WsServerEvent::new(
                            WsEventKind::Pong,
                            serde_json::Value::Null,
                        );
                        let Ok(text) = serde_json::to_string(&pong) else { continue };
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}
