//! Process entry point: construct every component explicitly, wire them to
//! their collaborators, spawn the feed/reactor workers, and serve the API.

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use perpagent_backend::agent::circuit_breaker::CircuitBreaker;
use perpagent_backend::agent::state_machine::StateMachine;
use perpagent_backend::agent::watch::{WatchManager, WatchRule, WatchStatus};
use perpagent_backend::api::{self, AppState};
use perpagent_backend::events::{Event, EventLog, EventType};
use perpagent_backend::exchange::rest::RestClient;
use perpagent_backend::exchange::throttle::CallGate;
use perpagent_backend::exchange::types::interval_ms;
use perpagent_backend::exchange::ExchangeApi;
use perpagent_backend::execution::{
    ExecConfig, Executor, OrderManager, PositionTracker, SlManager, TrailingManager,
};
use perpagent_backend::market::{
    CandleStore, MarketEvent, PrivateEvent, PrivateFeed, PublicFeed,
};
use perpagent_backend::models::{Config, WsEventKind, WsServerEvent};
use perpagent_backend::storage::AgentDb;
use perpagent_backend::strategy::{IndicatorParams, StrategyEngine};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("load configuration")?;
    init_tracing();

    info!(
        symbols = ?config.symbols,
        interval = %config.interval,
        testnet = config.testnet,
        "perpagent starting"
    );

    let db = Arc::new(AgentDb::new(&config.database_path).context("open database")?);
    info!(path = %config.database_path, "database ready");

    let (ui_tx, _) = broadcast::channel::<WsServerEvent>(1024);
    let events = EventLog::new(db.clone(), ui_tx.clone());

    // Exchange connectivity: one call gate in front of everything.
    let gate = Arc::new(CallGate::new(
        config.rate_limit_per_sec,
        config.rate_limit_per_sec * 4,
    ));
    let exchange: Arc<dyn ExchangeApi> = Arc::new(
        RestClient::new(
            config.api_key.clone(),
            config.api_secret.clone(),
            config.testnet,
            gate,
            Duration::from_secs(config.call_timeout_secs),
        )
        .context("build exchange client")?,
    );

    let store = Arc::new(CandleStore::new(config.candle_buffer_cap));
    let strategy = Arc::new(StrategyEngine::new(
        store.clone(),
        IndicatorParams::default(),
        config.interval.clone(),
    ));

    let start_balance = match exchange.get_wallet_balance().await {
        Ok(balance) => {
            info!(balance, "wallet balance fetched");
            balance
        }
        Err(e) => {
            warn!(error = %e, "wallet balance unavailable at startup");
            0.0
        }
    };

    let sm = Arc::new(StateMachine::new());
    let breaker = Arc::new(CircuitBreaker::new(
        config.circuit_breaker_threshold_pct,
        start_balance,
        Utc::now(),
    ));
    let orders = Arc::new(OrderManager::new(
        exchange.clone(),
        db.clone(),
        events.clone(),
    ));
    let positions = Arc::new(PositionTracker::new(1.0));
    let sl = Arc::new(SlManager::new(exchange.clone()));
    let trailing = Arc::new(TrailingManager::new());

    let executor = Arc::new(Executor::new(
        exchange.clone(),
        db.clone(),
        events.clone(),
        sm.clone(),
        breaker.clone(),
        strategy.clone(),
        orders.clone(),
        positions.clone(),
        sl.clone(),
        trailing.clone(),
        ExecConfig {
            interval: config.interval.clone(),
            max_leverage: config.max_leverage,
            default_risk_pct: config.default_risk_pct,
            sl_buffer_pct: config.sl_emergency_buffer_pct,
            breakeven_activation: false,
        },
    ));

    let watches = Arc::new(WatchManager::new());
    match db.load_watches(true).await {
        Ok(records) => {
            let rules: Vec<WatchRule> = records.iter().filter_map(WatchRule::from_record).collect();
            info!(count = rules.len(), "active watches restored");
            watches.load(rules);
        }
        Err(e) => warn!(error = %e, "watch restore failed"),
    }

    // Candle backfill per symbol, then a first strategy pass.
    for symbol in &config.symbols {
        match exchange
            .get_klines(symbol, &config.interval, config.warmup_candles)
            .await
        {
            Ok(candles) => {
                let added = store.seed(candles);
                events
                    .emit(
                        Event::new(
                            EventType::CandleBackfill,
                            format!("{} backfilled {} candles", symbol, added),
                        )
                        .with_symbol(symbol),
                    )
                    .await;
                strategy.recompute(symbol);
            }
            Err(e) => warn!(symbol = %symbol, error = %e, "kline backfill failed"),
        }
    }

    // Reconcile persisted trades against live positions before accepting
    // any commands.
    if let Err(e) = executor.startup_resync().await {
        warn!(error = %e, "startup reconciliation failed");
    }

    // --- Workers -------------------------------------------------------

    // Market feed -> candle store -> strategy recompute. A detected feed gap
    // backfills over REST before the new candle is applied.
    let (market_tx, mut market_rx) = mpsc::channel::<MarketEvent>(1024);
    let market_feed = PublicFeed::spawn(
        config.testnet,
        config.symbols.clone(),
        config.interval.clone(),
        market_tx,
    );
    {
        let store = store.clone();
        let strategy = strategy.clone();
        let ui_tx = ui_tx.clone();
        let exchange = exchange.clone();
        let events = events.clone();
        let kline_interval = config.interval.clone();
        let step_ms = interval_ms(&config.interval);
        tokio::spawn(async move {
            while let Some(event) = market_rx.recv().await {
                match event {
                    MarketEvent::Kline { candle, confirm } => {
                        let symbol = candle.symbol.clone();

                        let gapped = store
                            .last_confirmed(&symbol, &kline_interval)
                            .map_or(false, |last| {
                                candle.open_time_ms > last.open_time_ms + 2 * step_ms
                            });
                        if gapped {
                            match exchange.get_klines(&symbol, &kline_interval, 200).await {
                                Ok(candles) => {
                                    let added = store.seed(candles);
                                    events
                                        .emit(
                                            Event::new(
                                                EventType::CandleBackfill,
                                                format!(
                                                    "{} feed gap; backfilled {} candles",
                                                    symbol, added
                                                ),
                                            )
                                            .with_symbol(&symbol),
                                        )
                                        .await;
                                }
                                Err(e) => {
                                    warn!(symbol = %symbol, error = %e, "gap backfill failed")
                                }
                            }
                        }

                        if store.apply(candle, confirm).is_some() {
                            strategy.recompute(&symbol);
                        }
                    }
                    MarketEvent::Ticker { symbol, last, mark } => {
                        let _ = ui_tx.send(WsServerEvent::new(
                            WsEventKind::Ticker,
                            serde_json::json!({ "symbol": symbol, "last": last, "mark": mark }),
                        ));
                    }
                }
            }
        });
    }

    // Strategy updates -> executor (locks, strategic SL, trailing) and the
    // watch scanner. One worker keeps per-symbol ordering.
    {
        let mut state_rx = strategy.subscribe();
        let executor = executor.clone();
        let watches = watches.clone();
        let events = events.clone();
        let db = db.clone();
        tokio::spawn(async move {
            loop {
                let update = match state_rx.recv().await {
                    Ok(update) => update,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "state update worker lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };

                events
                    .emit(
                        Event::new(
                            EventType::StateUpdate,
                            format!(
                                "{} state: bias {}, long {}, short {}",
                                update.symbol,
                                update.state.bias.as_str(),
                                update.state.allow_long_entry,
                                update.state.allow_short_entry
                            ),
                        )
                        .with_symbol(&update.symbol)
                        .with_payload(serde_json::to_value(&*update.state).unwrap_or_default()),
                    )
                    .await;

                if let Some(warning) = &update.state.risk_warning {
                    events
                        .emit(
                            Event::new(EventType::RiskWarning, warning.clone())
                                .with_symbol(&update.symbol),
                        )
                        .await;
                }

                executor.handle_state_update(&update).await;

                for fire in watches.evaluate(&update.state) {
                    let _ = db
                        .update_watch_status(&fire.rule.id, WatchStatus::Triggered.as_str())
                        .await;
                    events
                        .emit(
                            Event::new(
                                EventType::WatchTriggered,
                                format!(
                                    "{} watch {} triggered ({})",
                                    fire.rule.symbol,
                                    fire.rule.id,
                                    fire.rule.trigger.as_str()
                                ),
                            )
                            .with_symbol(&fire.rule.symbol)
                            .with_payload(serde_json::to_value(&fire.rule).unwrap_or_default()),
                        )
                        .await;

                    if let Some(intent) = fire.intent {
                        events
                            .emit(
                                Event::new(
                                    EventType::WatchAutoEntry,
                                    format!("{} auto-entry from watch", fire.rule.symbol),
                                )
                                .with_symbol(&fire.rule.symbol),
                            )
                            .await;
                        // Same path as a typed command: every gate applies.
                        if let Err(e) = executor.enter(&intent).await {
                            warn!(symbol = %fire.rule.symbol, error = ?e, "watch auto-entry rejected");
                        }
                    }
                }
            }
        });
    }

    // Private feed -> order manager + position tracker; degraded mode on
    // disconnect.
    let (private_tx, mut private_rx) = mpsc::channel::<PrivateEvent>(1024);
    PrivateFeed::spawn(
        config.testnet,
        config.api_key.clone(),
        config.api_secret.clone(),
        private_tx,
    );
    {
        let orders = orders.clone();
        let positions = positions.clone();
        let executor = executor.clone();
        tokio::spawn(async move {
            while let Some(event) = private_rx.recv().await {
                match event {
                    PrivateEvent::Connected => executor.set_degraded(false).await,
                    PrivateEvent::Disconnected => executor.set_degraded(true).await,
                    PrivateEvent::Position(update) => positions.apply(update),
                    PrivateEvent::Order(update) => orders.handle_stream_update(update).await,
                    PrivateEvent::Wallet(_) => {}
                }
            }
        });
    }

    // Degraded-mode poller: positions over REST every 2 s while the
    // private stream is down.
    {
        let executor = executor.clone();
        let positions = positions.clone();
        let exchange = exchange.clone();
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(2));
            loop {
                tick.tick().await;
                if !executor.is_degraded() {
                    continue;
                }
                match exchange.get_positions(None).await {
                    Ok(infos) => positions.refresh(infos),
                    Err(e) => warn!(error = %e, "degraded position poll failed"),
                }
            }
        });
    }

    // Position events -> executor reactor.
    {
        let mut position_rx = positions.subscribe();
        let executor = executor.clone();
        tokio::spawn(async move {
            loop {
                match position_rx.recv().await {
                    Ok(event) => executor.handle_position_event(&event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "position worker lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    // Order fills -> executor reactor (TP set, trail seeding).
    {
        let mut fill_rx = orders.subscribe_fills();
        let executor = executor.clone();
        tokio::spawn(async move {
            loop {
                match fill_rx.recv().await {
                    Ok(fill) => executor.handle_fill(&fill).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "fill worker lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    // Watch expiry sweeper.
    {
        let watches = watches.clone();
        let events = events.clone();
        let db = db.clone();
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(30));
            loop {
                tick.tick().await;
                for rule in watches.sweep_expired(Utc::now()) {
                    let _ = db
                        .update_watch_status(&rule.id, WatchStatus::Expired.as_str())
                        .await;
                    events
                        .emit(
                            Event::new(
                                EventType::WatchExpired,
                                format!("{} watch {} expired", rule.symbol, rule.id),
                            )
                            .with_symbol(&rule.symbol),
                        )
                        .await;
                }
            }
        });
    }

    // --- HTTP / WS surface --------------------------------------------

    let app_state = AppState {
        config: config.clone(),
        db,
        events,
        exchange,
        store,
        sm,
        breaker,
        strategy,
        executor,
        positions,
        watches,
        market_feed,
        ui_tx,
    };
    let app = api::router(app_state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {}", addr))?;
    info!(addr = %addr, "api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "shutdown signal listener failed");
            }
            info!("shutdown signal received");
        })
        .await
        .context("api server")?;

    info!("perpagent stopped");
    Ok(())
}
