//! Trade contract: the immutable record of everything decided at entry time.
//!
//! Contract assembly is a pure function of the intent, the strategy state,
//! and the venue numbers (balance, mark, instrument rules). Admission gating
//! and I/O live in the executor; this module only validates, sizes, and
//! assembles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::intent::{Intent, SlRule, TpRule, TrailMode};
use crate::agent::{RejectReason, Rejection};
use crate::exchange::types::{InstrumentInfo, OrderKind};
use crate::models::Side;
use crate::strategy::{StrategySnapshot, StrategyState, StrategyTag};

/// Stop distance used when neither a swing nor a supertrend level resolves.
const FALLBACK_SL_PCT: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContractStatus {
    Pending,
    Executed,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySpec {
    pub kind: OrderKind,
    pub risk_pct: Option<f64>,
    /// Resolved risk budget in USD.
    pub risk_amount_usd: f64,
    pub requested_leverage: f64,
    pub applied_leverage: f64,
    pub leverage_clamped: bool,
    pub limit_price: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlSpec {
    pub rule: SlRule,
    /// Strategic (decision-level) stop; `None` only for rule NONE.
    pub strategic: Option<f64>,
    /// Exchange-preset trigger, buffered beyond the strategic level.
    pub emergency: Option<f64>,
    pub buffer_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TpSpec {
    pub rule: TpRule,
    pub price: Option<f64>,
    pub rr: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailSpec {
    pub mode: TrailMode,
    pub active: bool,
}

/// Conditions that invalidate the trade idea ahead of the stop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationSpec {
    pub on_bias_flip: bool,
    pub on_structure_break: bool,
    pub on_supertrend_flip: bool,
}

impl Default for InvalidationSpec {
    fn default() -> Self {
        Self {
            on_bias_flip: false,
            on_structure_break: false,
            on_supertrend_flip: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReasonsSpec {
    pub user_tags: Vec<String>,
    pub note: Option<String>,
    /// Strategy snapshot at entry decision time.
    pub snapshot: Option<StrategySnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeContract {
    pub trade_id: String,
    pub symbol: String,
    pub side: Side,
    pub interval: String,
    pub strategy_tag: Option<StrategyTag>,
    pub entry: EntrySpec,
    pub sl: SlSpec,
    pub tp: TpSpec,
    pub trail: TrailSpec,
    pub invalidation: InvalidationSpec,
    /// Re-entry policy: a stop-out locks the same direction.
    pub lock_same_direction_on_stop: bool,
    pub reasons: ReasonsSpec,
    pub status: ContractStatus,
    pub qty: f64,
    pub created_at: DateTime<Utc>,
}

/// Venue numbers and policy the builder needs alongside the intent.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub balance: f64,
    pub mark: f64,
    pub instrument: InstrumentInfo,
    pub max_leverage: f64,
    pub default_risk_pct: f64,
    pub sl_buffer_pct: f64,
    /// When set, trailing starts inactive and arms at +1R.
    pub breakeven_activation: bool,
}

/// Resolve the strategic stop per the rule chain: explicit price, else the
/// protected swing opposite the side, else the supertrend value, else a
/// fixed fallback distance from mark.
fn resolve_strategic_sl(
    side: Side,
    rule: SlRule,
    user_price: Option<f64>,
    mark: f64,
    snapshot: &StrategySnapshot,
) -> (SlRule, f64) {
    let wrong_side = |price: f64| match side {
        Side::Long => price >= mark,
        Side::Short => price <= mark,
    };
    let fallback = match side {
        Side::Long => mark * (1.0 - FALLBACK_SL_PCT / 100.0),
        Side::Short => mark * (1.0 + FALLBACK_SL_PCT / 100.0),
    };

    if rule == SlRule::Price {
        if let Some(price) = user_price {
            if !wrong_side(price) {
                return (SlRule::Price, price);
            }
        }
    }

    if matches!(rule, SlRule::Swing | SlRule::Price) {
        if let Some(swing) = snapshot.protected_swing_for(side) {
            if !wrong_side(swing) {
                return (SlRule::Swing, swing);
            }
        }
    }

    let st = snapshot.supertrend_value;
    if !wrong_side(st) {
        return (SlRule::Supertrend, st);
    }

    (rule, fallback)
}

fn emergency_for(side: Side, strategic: f64, buffer_pct: f64) -> f64 {
    match side {
        Side::Long => strategic * (1.0 - buffer_pct / 100.0),
        Side::Short => strategic * (1.0 + buffer_pct / 100.0),
    }
}

/// Assemble a contract. Validation failures come back as typed rejections
/// carrying the snapshot so the operator sees why.
pub fn build_contract(
    intent: &Intent,
    state: &StrategyState,
    ctx: &BuildContext,
) -> Result<TradeContract, Rejection> {
    let side = intent.side().ok_or_else(|| {
        Rejection::new(RejectReason::InvalidIntent, "intent is not an entry")
    })?;
    let symbol = intent.symbol.clone().ok_or_else(|| {
        Rejection::new(RejectReason::InvalidIntent, "entry intent has no symbol")
    })?;
    let snapshot = state.snapshot.clone().ok_or_else(|| {
        Rejection::new(
            RejectReason::StrategyDisallowed,
            "no strategy snapshot available for sizing",
        )
    })?;

    if !(ctx.mark.is_finite() && ctx.mark > 0.0) {
        return Err(Rejection::new(
            RejectReason::InvalidIntent,
            "mark price unavailable",
        ));
    }
    if ctx.balance <= 0.0 {
        return Err(Rejection::new(
            RejectReason::InsufficientBalance,
            "wallet balance is zero",
        ));
    }

    // Risk budget: explicit dollars win, else percent of balance.
    let risk_amount_usd = match (intent.risk_usd, intent.risk_pct) {
        (Some(usd), _) => usd,
        (None, Some(pct)) => ctx.balance * pct / 100.0,
        (None, None) => ctx.balance * ctx.default_risk_pct / 100.0,
    };
    if !(risk_amount_usd.is_finite() && risk_amount_usd > 0.0) {
        return Err(Rejection::new(
            RejectReason::InvalidIntent,
            "risk amount resolves to zero",
        ));
    }
    if risk_amount_usd > ctx.balance {
        return Err(Rejection::new(
            RejectReason::InsufficientBalance,
            format!(
                "risk {:.2} USD exceeds available balance {:.2} USD",
                risk_amount_usd, ctx.balance
            ),
        )
        .with_snapshot(Some(snapshot)));
    }

    // Leverage clamp is policy, not an error.
    let requested_leverage = intent.leverage.unwrap_or(1.0).max(1.0);
    let cap = ctx.max_leverage.min(ctx.instrument.max_leverage);
    let applied_leverage = requested_leverage.min(cap);
    let leverage_clamped = applied_leverage < requested_leverage;

    // Stop resolution and two-layer pairing.
    let requested_rule = intent.sl_rule.unwrap_or(SlRule::Swing);
    let sl = if requested_rule == SlRule::None {
        // Sizing still needs a stop distance; the fallback stands in.
        SlSpec {
            rule: SlRule::None,
            strategic: None,
            emergency: None,
            buffer_pct: 0.0,
        }
    } else {
        let (resolved_rule, strategic) =
            resolve_strategic_sl(side, requested_rule, intent.sl_price, ctx.mark, &snapshot);
        let (emergency, buffer_pct) = if resolved_rule == SlRule::Price {
            // User-explicit price: no buffer, both layers collapse.
            (strategic, 0.0)
        } else {
            (
                emergency_for(side, strategic, ctx.sl_buffer_pct),
                ctx.sl_buffer_pct,
            )
        };
        SlSpec {
            rule: resolved_rule,
            strategic: Some(strategic),
            emergency: Some(emergency),
            buffer_pct,
        }
    };

    // Size from risk budget and stop distance.
    let sizing_sl = sl.strategic.unwrap_or_else(|| match side {
        Side::Long => ctx.mark * (1.0 - FALLBACK_SL_PCT / 100.0),
        Side::Short => ctx.mark * (1.0 + FALLBACK_SL_PCT / 100.0),
    });
    let sl_distance = (ctx.mark - sizing_sl).abs() / ctx.mark;
    if !(sl_distance.is_finite() && sl_distance > 0.0) {
        return Err(Rejection::new(
            RejectReason::SizeBelowMinimum,
            "stop distance resolves to zero",
        )
        .with_snapshot(Some(snapshot)));
    }
    let raw_size = (risk_amount_usd / sl_distance) / ctx.mark;
    let qty = ctx.instrument.round_qty(raw_size);
    if qty <= 0.0 {
        return Err(Rejection::new(
            RejectReason::SizeBelowMinimum,
            format!("computed size {:.8} rounds to zero", raw_size),
        )
        .with_snapshot(Some(snapshot)));
    }

    // Take profit.
    let tp = match intent.tp_rule.unwrap_or(TpRule::None) {
        TpRule::None => TpSpec {
            rule: TpRule::None,
            price: None,
            rr: None,
        },
        TpRule::Price => TpSpec {
            rule: TpRule::Price,
            price: intent.tp_price,
            rr: None,
        },
        // Resolved after the fill, off the actual entry price.
        TpRule::Rr => TpSpec {
            rule: TpRule::Rr,
            price: None,
            rr: intent.tp_rr,
        },
        TpRule::Structure => TpSpec {
            rule: TpRule::Structure,
            price: match side {
                Side::Long => snapshot.protected_swing_high,
                Side::Short => snapshot.protected_swing_low,
            },
            rr: None,
        },
    };

    let trail_mode = intent.trail_mode.unwrap_or(TrailMode::None);
    let trail = TrailSpec {
        mode: trail_mode,
        active: trail_mode != TrailMode::None && !ctx.breakeven_activation,
    };

    let entry_kind = if intent.limit_price.is_some() {
        OrderKind::Limit
    } else {
        OrderKind::Market
    };

    Ok(TradeContract {
        trade_id: Uuid::new_v4().to_string(),
        symbol,
        side,
        interval: state.interval.clone(),
        strategy_tag: state.strategy_tag,
        entry: EntrySpec {
            kind: entry_kind,
            risk_pct: intent.risk_pct,
            risk_amount_usd,
            requested_leverage,
            applied_leverage,
            leverage_clamped,
            limit_price: intent.limit_price.map(|p| ctx.instrument.round_price(p)),
        },
        sl,
        tp,
        trail,
        invalidation: InvalidationSpec::default(),
        lock_same_direction_on_stop: true,
        reasons: ReasonsSpec {
            user_tags: Vec::new(),
            note: intent.raw.clone(),
            snapshot: Some(snapshot),
        },
        status: ContractStatus::Pending,
        qty,
        created_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::intent::{parse_command, IntentAction};
    use crate::indicators::structure::{StructureBias, TrendLabel};
    use crate::models::Bias;

    fn snapshot(price: f64, swing_low: f64, st_value: f64) -> StrategySnapshot {
        StrategySnapshot {
            supertrend_direction: Side::Long,
            supertrend_value: st_value,
            sma200: Some(price * 0.95),
            ema1000: Some(price * 0.9),
            close_above_sma200: Some(true),
            close_above_ema1000: Some(true),
            structure_bias: StructureBias::Bullish,
            trend: TrendLabel::Uptrend,
            last_bos: None,
            last_choch: None,
            protected_swing_high: Some(price * 1.05),
            protected_swing_low: Some(swing_low),
            price,
            distance_to_supertrend_pct: None,
            distance_to_sma200_pct: None,
            distance_to_ema1000_pct: None,
            distance_to_protected_swing_pct: None,
        }
    }

    fn state(price: f64, swing_low: f64) -> StrategyState {
        StrategyState {
            symbol: "BTCUSDT".to_string(),
            interval: "15".to_string(),
            last_close_at: Some(Utc::now()),
            bias: Bias::Long,
            allow_long_entry: true,
            allow_short_entry: false,
            strategy_tag: Some(StrategyTag::S101),
            risk_warning: None,
            snapshot: Some(snapshot(price, swing_low, price * 0.97)),
        }
    }

    fn ctx(balance: f64, mark: f64) -> BuildContext {
        BuildContext {
            balance,
            mark,
            instrument: InstrumentInfo {
                min_order_qty: 0.001,
                qty_step: 0.001,
                tick_size: 0.01,
                max_leverage: 100.0,
            },
            max_leverage: 10.0,
            default_risk_pct: 1.0,
            sl_buffer_pct: 4.0,
            breakeven_activation: false,
        }
    }

    fn entry_intent(cmd: &str) -> Intent {
        let intent = parse_command(cmd);
        assert!(matches!(
            intent.action,
            IntentAction::EnterLong | IntentAction::EnterShort
        ));
        intent
    }

    #[test]
    fn happy_long_sizes_from_risk_and_swing_stop() {
        // price 100, swing 96, balance 1000, risk 1% = 10 USD
        // distance = 4% -> size = (10 / 0.04) / 100 = 2.5
        let intent = entry_intent("long btc risk 1 sl swing");
        let contract = build_contract(&intent, &state(100.0, 96.0), &ctx(1000.0, 100.0)).unwrap();

        assert_eq!(contract.side, Side::Long);
        assert_eq!(contract.sl.rule, SlRule::Swing);
        assert_eq!(contract.sl.strategic, Some(96.0));
        let emergency = contract.sl.emergency.unwrap();
        assert!((emergency - 92.16).abs() < 1e-9);
        assert!((contract.qty - 2.5).abs() < 1e-9);
        assert_eq!(contract.status, ContractStatus::Pending);
        assert_eq!(contract.strategy_tag, Some(StrategyTag::S101));
    }

    #[test]
    fn explicit_price_sl_collapses_both_layers() {
        let intent = entry_intent("long btc risk 1 sl 95");
        let contract = build_contract(&intent, &state(100.0, 96.0), &ctx(1000.0, 100.0)).unwrap();
        assert_eq!(contract.sl.rule, SlRule::Price);
        assert_eq!(contract.sl.strategic, Some(95.0));
        assert_eq!(contract.sl.emergency, Some(95.0));
        assert_eq!(contract.sl.buffer_pct, 0.0);
    }

    #[test]
    fn sl_ordering_invariant_holds() {
        let intent = entry_intent("long btc risk 1 sl swing");
        let c = build_contract(&intent, &state(100.0, 96.0), &ctx(1000.0, 100.0)).unwrap();
        let strategic = c.sl.strategic.unwrap();
        let emergency = c.sl.emergency.unwrap();
        // LONG: emergency < strategic < entry.
        assert!(emergency < strategic);
        assert!(strategic < 100.0);
    }

    #[test]
    fn wrong_side_user_price_falls_back_to_swing() {
        // SL above mark for a LONG makes no sense; chain falls to the swing.
        let intent = entry_intent("long btc risk 1 sl 105");
        let contract = build_contract(&intent, &state(100.0, 96.0), &ctx(1000.0, 100.0)).unwrap();
        assert_eq!(contract.sl.rule, SlRule::Swing);
        assert_eq!(contract.sl.strategic, Some(96.0));
    }

    #[test]
    fn leverage_clamped_to_policy_cap() {
        let intent = entry_intent("long btc risk 1 lev 25");
        let contract = build_contract(&intent, &state(100.0, 96.0), &ctx(1000.0, 100.0)).unwrap();
        assert_eq!(contract.entry.requested_leverage, 25.0);
        assert_eq!(contract.entry.applied_leverage, 10.0);
        assert!(contract.entry.leverage_clamped);
    }

    #[test]
    fn dollar_risk_overrides_percent() {
        let intent = entry_intent("long btc risk $20 sl swing");
        let contract = build_contract(&intent, &state(100.0, 96.0), &ctx(1000.0, 100.0)).unwrap();
        assert!((contract.entry.risk_amount_usd - 20.0).abs() < 1e-9);
        assert!((contract.qty - 5.0).abs() < 1e-9);
    }

    #[test]
    fn risk_beyond_balance_rejects() {
        let intent = entry_intent("long btc risk $2000");
        let err = build_contract(&intent, &state(100.0, 96.0), &ctx(1000.0, 100.0)).unwrap_err();
        assert_eq!(err.reason, RejectReason::InsufficientBalance);
        assert!(err.snapshot.is_some());
    }

    #[test]
    fn zero_balance_rejects() {
        let intent = entry_intent("long btc risk 1");
        let err = build_contract(&intent, &state(100.0, 96.0), &ctx(0.0, 100.0)).unwrap_err();
        assert_eq!(err.reason, RejectReason::InsufficientBalance);
    }

    #[test]
    fn tiny_risk_rounds_to_zero_and_rejects() {
        let mut c = ctx(1000.0, 100.0);
        c.instrument.min_order_qty = 0.0;
        c.instrument.qty_step = 1.0;
        let intent = entry_intent("long btc risk $0.1 sl swing");
        // size = (0.1 / 0.04) / 100 = 0.025 -> floors to 0 with step 1.
        let err = build_contract(&intent, &state(100.0, 96.0), &c).unwrap_err();
        assert_eq!(err.reason, RejectReason::SizeBelowMinimum);
    }

    #[test]
    fn rr_take_profit_defers_price_to_fill() {
        let intent = entry_intent("long btc risk 1 tp 3r");
        let contract = build_contract(&intent, &state(100.0, 96.0), &ctx(1000.0, 100.0)).unwrap();
        assert_eq!(contract.tp.rule, TpRule::Rr);
        assert_eq!(contract.tp.rr, Some(3.0));
        assert_eq!(contract.tp.price, None);
    }

    #[test]
    fn limit_price_switches_entry_kind() {
        let intent = entry_intent("long btc risk 1 limit 99.5");
        let contract = build_contract(&intent, &state(100.0, 96.0), &ctx(1000.0, 100.0)).unwrap();
        assert_eq!(contract.entry.kind, OrderKind::Limit);
        assert_eq!(contract.entry.limit_price, Some(99.5));
    }

    #[test]
    fn trail_active_unless_breakeven_activation() {
        let intent = entry_intent("long btc risk 1 trail st");
        let contract = build_contract(&intent, &state(100.0, 96.0), &ctx(1000.0, 100.0)).unwrap();
        assert!(contract.trail.active);

        let mut c = ctx(1000.0, 100.0);
        c.breakeven_activation = true;
        let contract = build_contract(&intent, &state(100.0, 96.0), &c).unwrap();
        assert_eq!(contract.trail.mode, TrailMode::Supertrend);
        assert!(!contract.trail.active);
    }
}
