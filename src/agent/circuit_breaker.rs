//! Daily-loss circuit breaker.
//!
//! Rolls a 24 h window keyed off the window start time. Realized losses
//! accumulate against the window's start balance; hitting the threshold
//! trips the breaker for 24 h. Tripped means every entry intent is rejected
//! with CIRCUIT_BREAKER unless the manual override is set.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub daily_start_balance: f64,
    pub daily_start_time: DateTime<Utc>,
    pub total_loss_today: f64,
    pub loss_pct: f64,
    pub threshold_pct: f64,
    pub tripped: bool,
    pub tripped_at: Option<DateTime<Utc>>,
    pub unlock_at: Option<DateTime<Utc>>,
    pub trip_reason: Option<String>,
    pub manual_override: bool,
}

/// Outcome of recording one PnL observation; the recorder worker turns these
/// into audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    WindowReset,
    Tripped,
}

pub struct CircuitBreaker {
    state: Mutex<CircuitBreakerState>,
}

impl CircuitBreaker {
    pub fn new(threshold_pct: f64, start_balance: f64, now: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(CircuitBreakerState {
                daily_start_balance: start_balance.max(0.0),
                daily_start_time: now,
                total_loss_today: 0.0,
                loss_pct: 0.0,
                threshold_pct: threshold_pct.clamp(1.0, 100.0),
                tripped: false,
                tripped_at: None,
                unlock_at: None,
                trip_reason: None,
                manual_override: false,
            }),
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        self.state.lock().clone()
    }

    /// Record a realized PnL against the window. `current_equity` seeds the
    /// next window when this observation rolls it over.
    pub fn record_pnl(&self, pnl: f64, current_equity: f64, now: DateTime<Utc>) -> RecordOutcome {
        let mut s = self.state.lock();

        let mut outcome = RecordOutcome::Recorded;
        if now - s.daily_start_time >= Duration::hours(WINDOW_HOURS) {
            s.daily_start_balance = current_equity.max(0.0);
            s.daily_start_time = now;
            s.total_loss_today = 0.0;
            s.loss_pct = 0.0;
            outcome = RecordOutcome::WindowReset;
            info!(balance = current_equity, "circuit breaker window reset");
        }

        if pnl < 0.0 {
            s.total_loss_today += -pnl;
        }
        s.loss_pct = if s.daily_start_balance > 0.0 {
            s.total_loss_today / s.daily_start_balance * 100.0
        } else {
            0.0
        };

        if !s.tripped && s.loss_pct >= s.threshold_pct {
            s.tripped = true;
            s.tripped_at = Some(now);
            s.unlock_at = Some(now + Duration::hours(WINDOW_HOURS));
            s.trip_reason = Some(format!(
                "daily loss {:.1}% reached threshold {:.1}%",
                s.loss_pct, s.threshold_pct
            ));
            warn!(
                loss_pct = s.loss_pct,
                threshold = s.threshold_pct,
                "circuit breaker tripped"
            );
            return RecordOutcome::Tripped;
        }

        outcome
    }

    /// Gate check. Allowed when not tripped, when the trip aged past its
    /// unlock time (automatic reset), or when the operator set the override.
    pub fn can_trade(&self, now: DateTime<Utc>) -> bool {
        let mut s = self.state.lock();
        if !s.tripped {
            return true;
        }
        if s.manual_override {
            return true;
        }
        if let Some(unlock_at) = s.unlock_at {
            if now >= unlock_at {
                s.tripped = false;
                s.tripped_at = None;
                s.unlock_at = None;
                s.trip_reason = None;
                s.total_loss_today = 0.0;
                s.loss_pct = 0.0;
                s.daily_start_time = now;
                info!("circuit breaker auto-unlocked");
                return true;
            }
        }
        false
    }

    pub fn set_override(&self, on: bool) {
        let mut s = self.state.lock();
        s.manual_override = on;
        if on {
            warn!("circuit breaker manual override enabled");
        }
    }

    /// Clears everything, including the override.
    pub fn reset(&self, current_equity: f64, now: DateTime<Utc>) {
        let mut s = self.state.lock();
        *s = CircuitBreakerState {
            daily_start_balance: current_equity.max(0.0),
            daily_start_time: now,
            total_loss_today: 0.0,
            loss_pct: 0.0,
            threshold_pct: s.threshold_pct,
            tripped: false,
            tripped_at: None,
            unlock_at: None,
            trip_reason: None,
            manual_override: false,
        };
        info!("circuit breaker reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn losses_accumulate_and_trip_at_threshold() {
        let cb = CircuitBreaker::new(50.0, 1000.0, t0());
        assert_eq!(cb.record_pnl(-200.0, 800.0, t0()), RecordOutcome::Recorded);
        assert_eq!(cb.record_pnl(-150.0, 650.0, t0()), RecordOutcome::Recorded);
        // Cumulative loss 510 of 1000 = 51% >= 50%: trip.
        assert_eq!(cb.record_pnl(-160.0, 490.0, t0()), RecordOutcome::Tripped);

        let s = cb.snapshot();
        assert!(s.tripped);
        assert!((s.loss_pct - 51.0).abs() < 1e-9);
        assert_eq!(s.unlock_at, Some(t0() + Duration::hours(24)));
        assert!(!cb.can_trade(t0()));
    }

    #[test]
    fn profits_do_not_reduce_recorded_loss() {
        let cb = CircuitBreaker::new(50.0, 1000.0, t0());
        cb.record_pnl(-300.0, 700.0, t0());
        cb.record_pnl(500.0, 1200.0, t0());
        assert!((cb.snapshot().total_loss_today - 300.0).abs() < 1e-9);
    }

    #[test]
    fn auto_unlock_after_24h() {
        let cb = CircuitBreaker::new(50.0, 1000.0, t0());
        cb.record_pnl(-600.0, 400.0, t0());
        assert!(!cb.can_trade(t0() + Duration::hours(23)));
        assert!(cb.can_trade(t0() + Duration::hours(24)));
        // Auto-unlock also cleared the trip.
        assert!(!cb.snapshot().tripped);
    }

    #[test]
    fn window_rolls_over_with_fresh_balance() {
        let cb = CircuitBreaker::new(50.0, 1000.0, t0());
        cb.record_pnl(-400.0, 600.0, t0());
        let later = t0() + Duration::hours(25);
        assert_eq!(cb.record_pnl(-10.0, 590.0, later), RecordOutcome::WindowReset);
        let s = cb.snapshot();
        assert_eq!(s.daily_start_balance, 590.0);
        assert!((s.total_loss_today - 10.0).abs() < 1e-9);
    }

    #[test]
    fn override_allows_trading_while_tripped() {
        let cb = CircuitBreaker::new(50.0, 1000.0, t0());
        cb.record_pnl(-600.0, 400.0, t0());
        assert!(!cb.can_trade(t0()));
        cb.set_override(true);
        assert!(cb.can_trade(t0()));
        // Reset clears the override too.
        cb.reset(400.0, t0());
        let s = cb.snapshot();
        assert!(!s.manual_override);
        assert!(!s.tripped);
        assert!(cb.can_trade(t0()));
    }
}
