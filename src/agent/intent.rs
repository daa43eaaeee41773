//! User intents.
//!
//! An `Intent` is the parsed form of an operator command, whether it arrived
//! as structured JSON or as a short text command. Parsing never executes
//! anything; unknown text degrades to `Unknown` and is answered, not acted on.

use serde::{Deserialize, Serialize};

use crate::models::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentAction {
    EnterLong,
    EnterShort,
    Close,
    ClosePartial,
    CancelOrder,
    MoveSl,
    SetTp,
    SetTrail,
    Pause,
    Resume,
    WatchCreate,
    WatchCancel,
    Opinion,
    Info,
    Unknown,
}

/// Stop-loss placement rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlRule {
    Swing,
    Supertrend,
    Price,
    None,
}

/// Take-profit rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TpRule {
    None,
    Rr,
    Price,
    Structure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrailMode {
    Supertrend,
    Structure,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub action: IntentAction,
    pub symbol: Option<String>,
    pub risk_pct: Option<f64>,
    pub risk_usd: Option<f64>,
    pub leverage: Option<f64>,
    pub sl_rule: Option<SlRule>,
    pub sl_price: Option<f64>,
    pub tp_rule: Option<TpRule>,
    pub tp_price: Option<f64>,
    pub tp_rr: Option<f64>,
    pub trail_mode: Option<TrailMode>,
    pub partial_close_pct: Option<f64>,
    pub limit_price: Option<f64>,
    pub watch_id: Option<String>,
    /// Raw text for watch parameters and audit.
    pub raw: Option<String>,
}

impl Intent {
    pub fn new(action: IntentAction) -> Self {
        Self {
            action,
            symbol: None,
            risk_pct: None,
            risk_usd: None,
            leverage: None,
            sl_rule: None,
            sl_price: None,
            tp_rule: None,
            tp_price: None,
            tp_rr: None,
            trail_mode: None,
            partial_close_pct: None,
            limit_price: None,
            watch_id: None,
            raw: None,
        }
    }

    pub fn side(&self) -> Option<Side> {
        match self.action {
            IntentAction::EnterLong => Some(Side::Long),
            IntentAction::EnterShort => Some(Side::Short),
            _ => None,
        }
    }
}

/// Per-symbol entry defaults. Fields fill in whatever the intent left
/// unset; explicit intent values always win.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolConfig {
    pub default_risk_pct: Option<f64>,
    pub default_leverage: Option<f64>,
    pub default_sl_rule: Option<SlRule>,
    pub default_trail_mode: Option<TrailMode>,
}

impl SymbolConfig {
    pub fn apply(&self, intent: &mut Intent) {
        if intent.risk_pct.is_none() && intent.risk_usd.is_none() {
            intent.risk_pct = self.default_risk_pct;
        }
        if intent.leverage.is_none() {
            intent.leverage = self.default_leverage;
        }
        if intent.sl_rule.is_none() {
            intent.sl_rule = self.default_sl_rule;
        }
        if intent.trail_mode.is_none() {
            intent.trail_mode = self.default_trail_mode;
        }
    }
}

/// Normalize a user symbol: uppercase, and bare coin names get the USDT
/// suffix ("btc" -> "BTCUSDT").
pub fn normalize_symbol(raw: &str) -> String {
    let upper = raw.trim().to_ascii_uppercase();
    if upper.ends_with("USDT") || upper.ends_with("USDC") || upper.ends_with("PERP") {
        upper
    } else {
        format!("{}USDT", upper)
    }
}

fn parse_number(token: &str) -> Option<f64> {
    token.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// "$50" / "50$" -> dollars; plain number -> percent.
fn parse_risk(token: &str) -> (Option<f64>, Option<f64>) {
    let t = token.trim();
    if let Some(stripped) = t.strip_prefix('$').or_else(|| t.strip_suffix('$')) {
        return (None, parse_number(stripped));
    }
    let t = t.strip_suffix('%').unwrap_or(t);
    (parse_number(t), None)
}

/// "3r" / "2.5R" -> reward-to-risk multiple.
fn parse_rr(token: &str) -> Option<f64> {
    let t = token.trim();
    let stripped = t.strip_suffix(['r', 'R'])?;
    parse_number(stripped)
}

/// Parse a text command into an Intent. Word-based, case-insensitive.
///
/// Examples: `long btc risk 1 lev 5 sl swing tp 3r trail st`,
/// `close btc 50`, `sl btc 42000`, `watch btc near sma200 0.5 auto`,
/// `pause`, `status btc`.
pub fn parse_command(text: &str) -> Intent {
    let raw = text.trim().to_string();
    let tokens: Vec<String> = raw
        .split_whitespace()
        .map(|t| t.to_ascii_lowercase())
        .collect();

    let mut intent = Intent::new(IntentAction::Unknown);
    intent.raw = Some(raw);
    let Some(head) = tokens.first() else {
        return intent;
    };

    match head.as_str() {
        "pause" | "stop" => {
            intent.action = IntentAction::Pause;
            return intent;
        }
        "resume" | "unpause" => {
            intent.action = IntentAction::Resume;
            return intent;
        }
        _ => {}
    }

    let symbol_at = |i: usize| tokens.get(i).map(|t| normalize_symbol(t));

    match head.as_str() {
        "long" | "buy" | "short" | "sell" => {
            intent.action = if matches!(head.as_str(), "long" | "buy") {
                IntentAction::EnterLong
            } else {
                IntentAction::EnterShort
            };
            intent.symbol = symbol_at(1);
            if intent.symbol.is_none() {
                intent.action = IntentAction::Unknown;
                return intent;
            }

            let mut i = 2;
            while i < tokens.len() {
                match tokens[i].as_str() {
                    "risk" => {
                        if let Some(v) = tokens.get(i + 1) {
                            let (pct, usd) = parse_risk(v);
                            intent.risk_pct = pct;
                            intent.risk_usd = usd;
                            i += 1;
                        }
                    }
                    "lev" | "leverage" | "x" => {
                        if let Some(v) = tokens.get(i + 1).and_then(|t| parse_number(t)) {
                            intent.leverage = Some(v);
                            i += 1;
                        }
                    }
                    "sl" | "stop" => {
                        if let Some(v) = tokens.get(i + 1) {
                            match v.as_str() {
                                "swing" => intent.sl_rule = Some(SlRule::Swing),
                                "st" | "supertrend" => intent.sl_rule = Some(SlRule::Supertrend),
                                "none" => intent.sl_rule = Some(SlRule::None),
                                _ => {
                                    if let Some(price) = parse_number(v) {
                                        intent.sl_rule = Some(SlRule::Price);
                                        intent.sl_price = Some(price);
                                    }
                                }
                            }
                            i += 1;
                        }
                    }
                    "tp" | "target" => {
                        if let Some(v) = tokens.get(i + 1) {
                            if let Some(rr) = parse_rr(v) {
                                intent.tp_rule = Some(TpRule::Rr);
                                intent.tp_rr = Some(rr);
                            } else if v == "structure" {
                                intent.tp_rule = Some(TpRule::Structure);
                            } else if let Some(price) = parse_number(v) {
                                intent.tp_rule = Some(TpRule::Price);
                                intent.tp_price = Some(price);
                            }
                            i += 1;
                        }
                    }
                    "trail" => {
                        if let Some(v) = tokens.get(i + 1) {
                            intent.trail_mode = Some(match v.as_str() {
                                "st" | "supertrend" => TrailMode::Supertrend,
                                "structure" | "swing" => TrailMode::Structure,
                                _ => TrailMode::None,
                            });
                            i += 1;
                        }
                    }
                    "limit" | "@" => {
                        if let Some(price) = tokens.get(i + 1).and_then(|t| parse_number(t)) {
                            intent.limit_price = Some(price);
                            i += 1;
                        }
                    }
                    _ => {}
                }
                i += 1;
            }
        }
        "close" | "exit" => {
            intent.action = IntentAction::Close;
            intent.symbol = symbol_at(1);
            if intent.symbol.is_none() {
                intent.action = IntentAction::Unknown;
                return intent;
            }
            if let Some(pct) = tokens
                .get(2)
                .map(|t| t.strip_suffix('%').unwrap_or(t))
                .and_then(parse_number)
            {
                if pct > 0.0 && pct < 100.0 {
                    intent.action = IntentAction::ClosePartial;
                    intent.partial_close_pct = Some(pct);
                }
            }
        }
        "cancel" => {
            intent.action = IntentAction::CancelOrder;
            intent.symbol = symbol_at(1);
        }
        "sl" | "movesl" => {
            intent.action = IntentAction::MoveSl;
            intent.symbol = symbol_at(1);
            intent.sl_price = tokens.get(2).and_then(|t| parse_number(t));
            if intent.symbol.is_none() || intent.sl_price.is_none() {
                intent.action = IntentAction::Unknown;
            } else {
                intent.sl_rule = Some(SlRule::Price);
            }
        }
        "tp" => {
            intent.action = IntentAction::SetTp;
            intent.symbol = symbol_at(1);
            if let Some(v) = tokens.get(2) {
                if let Some(rr) = parse_rr(v) {
                    intent.tp_rule = Some(TpRule::Rr);
                    intent.tp_rr = Some(rr);
                } else if let Some(price) = parse_number(v) {
                    intent.tp_rule = Some(TpRule::Price);
                    intent.tp_price = Some(price);
                }
            }
            if intent.symbol.is_none() || intent.tp_rule.is_none() {
                intent.action = IntentAction::Unknown;
            }
        }
        "trail" => {
            intent.action = IntentAction::SetTrail;
            intent.symbol = symbol_at(1);
            intent.trail_mode = tokens.get(2).map(|v| match v.as_str() {
                "st" | "supertrend" => TrailMode::Supertrend,
                "structure" | "swing" => TrailMode::Structure,
                _ => TrailMode::None,
            });
            if intent.symbol.is_none() || intent.trail_mode.is_none() {
                intent.action = IntentAction::Unknown;
            }
        }
        "watch" => {
            intent.action = IntentAction::WatchCreate;
            intent.symbol = symbol_at(1);
            if intent.symbol.is_none() {
                intent.action = IntentAction::Unknown;
            }
        }
        "unwatch" => {
            intent.action = IntentAction::WatchCancel;
            intent.watch_id = tokens.get(1).cloned();
            if intent.watch_id.is_none() {
                intent.action = IntentAction::Unknown;
            }
        }
        "opinion" | "advice" => {
            intent.action = IntentAction::Opinion;
            intent.symbol = symbol_at(1);
        }
        "status" | "info" | "state" => {
            intent.action = IntentAction::Info;
            intent.symbol = symbol_at(1);
        }
        _ => {}
    }

    intent
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_normalization() {
        assert_eq!(normalize_symbol("btc"), "BTCUSDT");
        assert_eq!(normalize_symbol("ETHUSDT"), "ETHUSDT");
        assert_eq!(normalize_symbol(" sol "), "SOLUSDT");
    }

    #[test]
    fn full_entry_command() {
        let i = parse_command("long btc risk 1 lev 5 sl swing tp 3r trail st limit 42100");
        assert_eq!(i.action, IntentAction::EnterLong);
        assert_eq!(i.symbol.as_deref(), Some("BTCUSDT"));
        assert_eq!(i.risk_pct, Some(1.0));
        assert_eq!(i.leverage, Some(5.0));
        assert_eq!(i.sl_rule, Some(SlRule::Swing));
        assert_eq!(i.tp_rule, Some(TpRule::Rr));
        assert_eq!(i.tp_rr, Some(3.0));
        assert_eq!(i.trail_mode, Some(TrailMode::Supertrend));
        assert_eq!(i.limit_price, Some(42100.0));
    }

    #[test]
    fn entry_with_price_sl_and_dollar_risk() {
        let i = parse_command("short eth risk $50 sl 2200.5");
        assert_eq!(i.action, IntentAction::EnterShort);
        assert_eq!(i.risk_usd, Some(50.0));
        assert_eq!(i.risk_pct, None);
        assert_eq!(i.sl_rule, Some(SlRule::Price));
        assert_eq!(i.sl_price, Some(2200.5));
    }

    #[test]
    fn close_and_partial_close() {
        let i = parse_command("close btc");
        assert_eq!(i.action, IntentAction::Close);

        let i = parse_command("close btc 50");
        assert_eq!(i.action, IntentAction::ClosePartial);
        assert_eq!(i.partial_close_pct, Some(50.0));

        let i = parse_command("close btc 100");
        assert_eq!(i.action, IntentAction::Close);
    }

    #[test]
    fn move_sl_requires_price() {
        let i = parse_command("sl btc 42000");
        assert_eq!(i.action, IntentAction::MoveSl);
        assert_eq!(i.sl_price, Some(42000.0));

        let i = parse_command("sl btc");
        assert_eq!(i.action, IntentAction::Unknown);
    }

    #[test]
    fn pause_resume_and_gibberish() {
        assert_eq!(parse_command("pause").action, IntentAction::Pause);
        assert_eq!(parse_command("resume").action, IntentAction::Resume);
        assert_eq!(
            parse_command("make me rich").action,
            IntentAction::Unknown
        );
        assert_eq!(parse_command("").action, IntentAction::Unknown);
    }

    #[test]
    fn symbol_config_fills_only_unset_fields() {
        let config = SymbolConfig {
            default_risk_pct: Some(2.0),
            default_leverage: Some(5.0),
            default_sl_rule: Some(SlRule::Supertrend),
            default_trail_mode: Some(TrailMode::Supertrend),
        };

        let mut intent = parse_command("long btc risk 1");
        config.apply(&mut intent);
        // Explicit risk wins; the rest fills in.
        assert_eq!(intent.risk_pct, Some(1.0));
        assert_eq!(intent.leverage, Some(5.0));
        assert_eq!(intent.sl_rule, Some(SlRule::Supertrend));
        assert_eq!(intent.trail_mode, Some(TrailMode::Supertrend));

        // Dollar risk also counts as explicit.
        let mut intent = parse_command("long btc risk $25");
        config.apply(&mut intent);
        assert_eq!(intent.risk_pct, None);
        assert_eq!(intent.risk_usd, Some(25.0));
    }

    #[test]
    fn trail_and_tp_commands() {
        let i = parse_command("trail btc structure");
        assert_eq!(i.action, IntentAction::SetTrail);
        assert_eq!(i.trail_mode, Some(TrailMode::Structure));

        let i = parse_command("tp btc 2.5r");
        assert_eq!(i.action, IntentAction::SetTp);
        assert_eq!(i.tp_rr, Some(2.5));
    }
}
