//! Watch triggers: operator-defined alerts on proximity to a strategy level
//! or on a price threshold, with optional auto-entry.
//!
//! A rule fires at most once. The ACTIVE -> TRIGGERED transition happens
//! under the write lock before any side effect is produced, so a burst of
//! state updates cannot double-fire a rule.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::intent::{Intent, IntentAction, SlRule, TrailMode};
use crate::models::Side;
use crate::storage::WatchRecord;
use crate::strategy::StrategyState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatchTrigger {
    CloserToSma200,
    CloserToEma1000,
    CloserToSupertrend,
    PriceAbove,
    PriceBelow,
}

impl WatchTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchTrigger::CloserToSma200 => "CLOSER_TO_SMA200",
            WatchTrigger::CloserToEma1000 => "CLOSER_TO_EMA1000",
            WatchTrigger::CloserToSupertrend => "CLOSER_TO_SUPERTREND",
            WatchTrigger::PriceAbove => "PRICE_ABOVE",
            WatchTrigger::PriceBelow => "PRICE_BELOW",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CLOSER_TO_SMA200" | "SMA200" => Some(WatchTrigger::CloserToSma200),
            "CLOSER_TO_EMA1000" | "EMA1000" => Some(WatchTrigger::CloserToEma1000),
            "CLOSER_TO_SUPERTREND" | "SUPERTREND" => Some(WatchTrigger::CloserToSupertrend),
            "PRICE_ABOVE" | "ABOVE" => Some(WatchTrigger::PriceAbove),
            "PRICE_BELOW" | "BELOW" => Some(WatchTrigger::PriceBelow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatchMode {
    NotifyOnly,
    AutoEnter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatchStatus {
    Active,
    Triggered,
    Expired,
    Cancelled,
}

impl WatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchStatus::Active => "ACTIVE",
            WatchStatus::Triggered => "TRIGGERED",
            WatchStatus::Expired => "EXPIRED",
            WatchStatus::Cancelled => "CANCELLED",
        }
    }
}

/// Entry parameters applied when an AUTO_ENTER watch fires.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchPreset {
    pub risk_pct: Option<f64>,
    pub sl_rule: Option<SlRule>,
    pub trail_mode: Option<TrailMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchRule {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub trigger: WatchTrigger,
    pub threshold_pct: Option<f64>,
    pub target_price: Option<f64>,
    pub mode: WatchMode,
    pub expiry: Option<DateTime<Utc>>,
    pub status: WatchStatus,
    pub preset: Option<WatchPreset>,
    pub created_at: DateTime<Utc>,
}

impl WatchRule {
    pub fn new(
        symbol: impl Into<String>,
        side: Side,
        trigger: WatchTrigger,
        mode: WatchMode,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            side,
            trigger,
            threshold_pct: None,
            target_price: None,
            mode,
            expiry: None,
            status: WatchStatus::Active,
            preset: None,
            created_at: Utc::now(),
        }
    }

    pub fn to_record(&self) -> WatchRecord {
        WatchRecord {
            id: self.id.clone(),
            symbol: self.symbol.clone(),
            side: self.side.as_str().to_string(),
            trigger_type: self.trigger.as_str().to_string(),
            threshold_pct: self.threshold_pct,
            target_price: self.target_price,
            mode: match self.mode {
                WatchMode::NotifyOnly => "NOTIFY_ONLY".to_string(),
                WatchMode::AutoEnter => "AUTO_ENTER".to_string(),
            },
            expiry_ts: self.expiry.map(|t| t.timestamp_millis()),
            status: self.status.as_str().to_string(),
            preset_json: self
                .preset
                .as_ref()
                .and_then(|p| serde_json::to_string(p).ok()),
            created_at: self.created_at.timestamp_millis(),
        }
    }

    pub fn from_record(rec: &WatchRecord) -> Option<Self> {
        Some(Self {
            id: rec.id.clone(),
            symbol: rec.symbol.clone(),
            side: Side::parse(&rec.side)?,
            trigger: WatchTrigger::parse(&rec.trigger_type)?,
            threshold_pct: rec.threshold_pct,
            target_price: rec.target_price,
            mode: match rec.mode.as_str() {
                "AUTO_ENTER" => WatchMode::AutoEnter,
                _ => WatchMode::NotifyOnly,
            },
            expiry: rec.expiry_ts.and_then(DateTime::from_timestamp_millis),
            status: match rec.status.as_str() {
                "TRIGGERED" => WatchStatus::Triggered,
                "EXPIRED" => WatchStatus::Expired,
                "CANCELLED" => WatchStatus::Cancelled,
                _ => WatchStatus::Active,
            },
            preset: rec
                .preset_json
                .as_deref()
                .and_then(|s| serde_json::from_str(s).ok()),
            created_at: DateTime::from_timestamp_millis(rec.created_at)
                .unwrap_or_else(Utc::now),
        })
    }

    fn condition_met(&self, state: &StrategyState) -> bool {
        let Some(snapshot) = state.snapshot.as_ref() else {
            return false;
        };
        let price = snapshot.price;
        match self.trigger {
            WatchTrigger::PriceAbove => self.target_price.map_or(false, |t| price >= t),
            WatchTrigger::PriceBelow => self.target_price.map_or(false, |t| price <= t),
            WatchTrigger::CloserToSma200
            | WatchTrigger::CloserToEma1000
            | WatchTrigger::CloserToSupertrend => {
                let level = match self.trigger {
                    WatchTrigger::CloserToSma200 => snapshot.sma200,
                    WatchTrigger::CloserToEma1000 => snapshot.ema1000,
                    _ => Some(snapshot.supertrend_value),
                };
                match (level, self.threshold_pct) {
                    (Some(level), Some(threshold)) if price > 0.0 => {
                        ((price - level).abs() / price * 100.0) <= threshold
                    }
                    _ => false,
                }
            }
        }
    }

    /// Synthesized entry intent for AUTO_ENTER rules; runs through the
    /// normal contract-builder path so the hard gate still applies.
    fn auto_entry_intent(&self) -> Intent {
        let mut intent = Intent::new(match self.side {
            Side::Long => IntentAction::EnterLong,
            Side::Short => IntentAction::EnterShort,
        });
        intent.symbol = Some(self.symbol.clone());
        if let Some(preset) = &self.preset {
            intent.risk_pct = preset.risk_pct;
            intent.sl_rule = preset.sl_rule;
            intent.trail_mode = preset.trail_mode;
        }
        intent
    }
}

/// A fired watch plus its synthesized entry intent (AUTO_ENTER only).
#[derive(Debug, Clone)]
pub struct WatchFire {
    pub rule: WatchRule,
    pub intent: Option<Intent>,
}

pub struct WatchManager {
    rules: RwLock<HashMap<String, WatchRule>>,
}

impl WatchManager {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
        }
    }

    pub fn load(&self, rules: Vec<WatchRule>) {
        let mut map = self.rules.write();
        for rule in rules {
            map.insert(rule.id.clone(), rule);
        }
    }

    pub fn create(&self, rule: WatchRule) -> WatchRule {
        self.rules.write().insert(rule.id.clone(), rule.clone());
        rule
    }

    pub fn cancel(&self, id: &str) -> Option<WatchRule> {
        let mut map = self.rules.write();
        let rule = map.get_mut(id)?;
        if rule.status != WatchStatus::Active {
            return None;
        }
        rule.status = WatchStatus::Cancelled;
        Some(rule.clone())
    }

    pub fn get(&self, id: &str) -> Option<WatchRule> {
        self.rules.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<WatchRule> {
        let mut rules: Vec<WatchRule> = self.rules.read().values().cloned().collect();
        rules.sort_by_key(|r| r.created_at);
        rules
    }

    /// Move expired ACTIVE rules to EXPIRED; returns them for persistence
    /// and notification.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<WatchRule> {
        let mut expired = Vec::new();
        let mut map = self.rules.write();
        for rule in map.values_mut() {
            if rule.status == WatchStatus::Active {
                if let Some(expiry) = rule.expiry {
                    if now >= expiry {
                        rule.status = WatchStatus::Expired;
                        expired.push(rule.clone());
                    }
                }
            }
        }
        expired
    }

    /// Evaluate all ACTIVE rules for this symbol against a fresh strategy
    /// state. Status flips to TRIGGERED inside the lock, before the fires
    /// are returned, so each rule fires exactly once.
    pub fn evaluate(&self, state: &StrategyState) -> Vec<WatchFire> {
        let mut fires = Vec::new();
        let mut map = self.rules.write();
        for rule in map.values_mut() {
            if rule.status != WatchStatus::Active || rule.symbol != state.symbol {
                continue;
            }
            if rule.condition_met(state) {
                rule.status = WatchStatus::Triggered;
                let intent = match rule.mode {
                    WatchMode::AutoEnter => Some(rule.auto_entry_intent()),
                    WatchMode::NotifyOnly => None,
                };
                fires.push(WatchFire {
                    rule: rule.clone(),
                    intent,
                });
            }
        }
        fires
    }
}

impl Default for WatchManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Bias;
    use crate::strategy::snapshot::StrategySnapshot;
    use crate::indicators::structure::{StructureBias, TrendLabel};

    fn state_with_price(symbol: &str, price: f64, sma200: f64) -> StrategyState {
        StrategyState {
            symbol: symbol.to_string(),
            interval: "15".to_string(),
            last_close_at: Some(Utc::now()),
            bias: Bias::Long,
            allow_long_entry: true,
            allow_short_entry: false,
            strategy_tag: None,
            risk_warning: None,
            snapshot: Some(StrategySnapshot {
                supertrend_direction: Side::Long,
                supertrend_value: price * 0.97,
                sma200: Some(sma200),
                ema1000: Some(price * 0.9),
                close_above_sma200: Some(price > sma200),
                close_above_ema1000: Some(true),
                structure_bias: StructureBias::Bullish,
                trend: TrendLabel::Uptrend,
                last_bos: None,
                last_choch: None,
                protected_swing_high: None,
                protected_swing_low: Some(price * 0.96),
                price,
                distance_to_supertrend_pct: Some(3.0),
                distance_to_sma200_pct: Some((price - sma200) / price * 100.0),
                distance_to_ema1000_pct: Some(10.0),
                distance_to_protected_swing_pct: Some(4.0),
            }),
        }
    }

    #[test]
    fn proximity_rule_fires_within_threshold() {
        let manager = WatchManager::new();
        let mut rule = WatchRule::new(
            "BTCUSDT",
            Side::Long,
            WatchTrigger::CloserToSma200,
            WatchMode::NotifyOnly,
        );
        rule.threshold_pct = Some(0.5);
        manager.create(rule);

        // 1% away: no fire.
        let fires = manager.evaluate(&state_with_price("BTCUSDT", 100.0, 99.0));
        assert!(fires.is_empty());

        // 0.3% away: fire.
        let fires = manager.evaluate(&state_with_price("BTCUSDT", 100.0, 99.7));
        assert_eq!(fires.len(), 1);
        assert!(fires[0].intent.is_none());
    }

    #[test]
    fn rule_fires_exactly_once() {
        let manager = WatchManager::new();
        let mut rule = WatchRule::new(
            "BTCUSDT",
            Side::Long,
            WatchTrigger::PriceAbove,
            WatchMode::NotifyOnly,
        );
        rule.target_price = Some(100.0);
        let id = manager.create(rule).id;

        let state = state_with_price("BTCUSDT", 101.0, 90.0);
        assert_eq!(manager.evaluate(&state).len(), 1);
        assert_eq!(manager.evaluate(&state).len(), 0);
        assert_eq!(manager.get(&id).unwrap().status, WatchStatus::Triggered);
    }

    #[test]
    fn auto_enter_synthesizes_intent_with_preset() {
        let manager = WatchManager::new();
        let mut rule = WatchRule::new(
            "BTCUSDT",
            Side::Short,
            WatchTrigger::PriceBelow,
            WatchMode::AutoEnter,
        );
        rule.target_price = Some(100.0);
        rule.preset = Some(WatchPreset {
            risk_pct: Some(2.0),
            sl_rule: Some(SlRule::Supertrend),
            trail_mode: Some(TrailMode::Supertrend),
        });
        manager.create(rule);

        let fires = manager.evaluate(&state_with_price("BTCUSDT", 99.0, 90.0));
        assert_eq!(fires.len(), 1);
        let intent = fires[0].intent.as_ref().unwrap();
        assert_eq!(intent.action, IntentAction::EnterShort);
        assert_eq!(intent.risk_pct, Some(2.0));
        assert_eq!(intent.sl_rule, Some(SlRule::Supertrend));
    }

    #[test]
    fn expiry_sweep_and_cancel() {
        let manager = WatchManager::new();
        let mut rule = WatchRule::new(
            "BTCUSDT",
            Side::Long,
            WatchTrigger::PriceAbove,
            WatchMode::NotifyOnly,
        );
        rule.target_price = Some(1_000_000.0);
        rule.expiry = Some(Utc::now() - chrono::Duration::minutes(1));
        let expired_id = manager.create(rule).id;

        let mut rule2 = WatchRule::new(
            "BTCUSDT",
            Side::Long,
            WatchTrigger::PriceAbove,
            WatchMode::NotifyOnly,
        );
        rule2.target_price = Some(1_000_000.0);
        let live_id = manager.create(rule2).id;

        let expired = manager.sweep_expired(Utc::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, expired_id);
        assert_eq!(manager.get(&live_id).unwrap().status, WatchStatus::Active);

        assert!(manager.cancel(&live_id).is_some());
        assert_eq!(manager.get(&live_id).unwrap().status, WatchStatus::Cancelled);
        // Cancelled rules never fire.
        let fires = manager.evaluate(&state_with_price("BTCUSDT", 2_000_000.0, 90.0));
        assert!(fires.is_empty());
    }

    #[test]
    fn record_round_trip() {
        let mut rule = WatchRule::new(
            "ETHUSDT",
            Side::Short,
            WatchTrigger::CloserToSupertrend,
            WatchMode::AutoEnter,
        );
        rule.threshold_pct = Some(0.8);
        rule.preset = Some(WatchPreset {
            risk_pct: Some(1.5),
            sl_rule: Some(SlRule::Swing),
            trail_mode: None,
        });
        let rec = rule.to_record();
        let back = WatchRule::from_record(&rec).unwrap();
        assert_eq!(back.id, rule.id);
        assert_eq!(back.trigger, rule.trigger);
        assert_eq!(back.preset.as_ref().unwrap().risk_pct, Some(1.5));
        assert_eq!(back.status, WatchStatus::Active);
    }
}
