// =============================================================================
// Risk Engine — config-driven caps deriving system_mode
// =============================================================================
//
// Generalizes the teacher's four-breaker `RiskEngine` (daily loss,
// consecutive losses, max drawdown, trade limit) into the seven caps named
// in SPEC_FULL.md §4.9. Keeps the teacher's shape: an ordered list of
// checks in `can_trade`/`can_open_new_trade`, first failure wins, plus the
// same double-checked-locking daily-rollover pattern.
// =============================================================================

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::SystemMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub system_mode: SystemMode,
    pub daily_realized_pnl: f64,
    pub emergency_exit_count_today: i64,
    pub daily_new_trades: u32,
    pub current_date: String,
}

struct Inner {
    daily_realized_pnl: f64,
    emergency_exit_count_today: i64,
    daily_new_trades: u32,
    current_date: String,
    hard_stopped: bool,
}

/// Per-cycle input: the exposure already committed, checked against the
/// configured caps before a new trade is allowed to open.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExposureState {
    pub underlying_risk_dollars: f64,
    pub expiry_cluster_risk_dollars: f64,
    pub open_spreads_global: u32,
    pub open_spreads_for_symbol: u32,
}

pub struct RiskLimits {
    pub daily_max_loss: f64,
    pub daily_max_new_risk: f64,
    pub max_trade_loss_dollars: f64,
    pub underlying_max_risk: f64,
    pub expiry_max_risk: f64,
    pub max_open_spreads_global: u32,
    pub max_open_spreads_per_symbol: u32,
    pub max_new_trades_per_day: u32,
}

pub struct RiskEngine {
    state: RwLock<Inner>,
    limits: RiskLimits,
}

impl RiskEngine {
    pub fn new(limits: RiskLimits) -> Self {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        info!(
            daily_max_loss = limits.daily_max_loss,
            daily_max_new_risk = limits.daily_max_new_risk,
            max_new_trades_per_day = limits.max_new_trades_per_day,
            "RiskEngine initialised"
        );
        Self {
            state: RwLock::new(Inner {
                daily_realized_pnl: 0.0,
                emergency_exit_count_today: 0,
                daily_new_trades: 0,
                current_date: today,
                hard_stopped: false,
            }),
            limits,
        }
    }

    /// Restores counters from a persisted `risk_state` row (§4.9) rather
    /// than always booting cold. `hard_stopped` has no dedicated persisted
    /// column, so it's inferred from the last-saved `system_mode`; a row
    /// whose `current_date` doesn't match today is stale and is rolled
    /// over immediately rather than trusted.
    pub fn from_state(limits: RiskLimits, persisted: Option<crate::store::RiskStateRow>) -> Self {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let inner = match persisted {
            Some(r) if r.current_date == today => {
                info!(date = %today, "RiskEngine restored from persisted risk_state");
                Inner {
                    daily_realized_pnl: r.daily_realized_pnl,
                    emergency_exit_count_today: r.emergency_exit_count_today,
                    daily_new_trades: r.daily_new_trades.max(0) as u32,
                    current_date: r.current_date,
                    hard_stopped: r.system_mode == SystemMode::HardStop.to_string(),
                }
            }
            Some(r) => {
                info!(old_date = %r.current_date, new_date = %today, "persisted risk_state is stale, starting fresh day");
                Inner {
                    daily_realized_pnl: 0.0,
                    emergency_exit_count_today: 0,
                    daily_new_trades: 0,
                    current_date: today,
                    hard_stopped: r.system_mode == SystemMode::HardStop.to_string(),
                }
            }
            None => Inner {
                daily_realized_pnl: 0.0,
                emergency_exit_count_today: 0,
                daily_new_trades: 0,
                current_date: today,
                hard_stopped: false,
            },
        };
        info!(
            daily_max_loss = limits.daily_max_loss,
            daily_max_new_risk = limits.daily_max_new_risk,
            max_new_trades_per_day = limits.max_new_trades_per_day,
            "RiskEngine initialised"
        );
        Self { state: RwLock::new(inner), limits }
    }

    pub fn record_trade_closed(&self, realized_pnl: f64) {
        self.maybe_reset_daily();
        let mut s = self.state.write();
        s.daily_realized_pnl += realized_pnl;
    }

    pub fn record_new_trade(&self) {
        self.maybe_reset_daily();
        let mut s = self.state.write();
        s.daily_new_trades += 1;
    }

    pub fn record_emergency_exit(&self) {
        self.maybe_reset_daily();
        let mut s = self.state.write();
        s.emergency_exit_count_today += 1;
    }

    /// Hard stop: daily realized PnL breached `daily_max_loss` or an
    /// explicit kill was issued. Checked first; nothing else matters once
    /// tripped.
    pub fn system_mode(&self) -> SystemMode {
        self.maybe_reset_daily();
        let s = self.state.read();
        if s.hard_stopped || s.daily_realized_pnl <= self.limits.daily_max_loss {
            SystemMode::HardStop
        } else if s.daily_new_trades >= self.limits.max_new_trades_per_day {
            SystemMode::Cooldown
        } else {
            SystemMode::Normal
        }
    }

    /// Gate applied by the Entry Engine (§4.4 step 2) before a trade may be
    /// opened. Caps are evaluated in order; the first breach is returned.
    pub fn can_open_new_trade(
        &self,
        candidate_max_loss: f64,
        exposure: ExposureState,
    ) -> Result<(), String> {
        self.maybe_reset_daily();
        let mode = self.system_mode();
        if mode != SystemMode::Normal {
            return Err(format!("system_mode is {mode}, not NORMAL"));
        }

        let s = self.state.read();

        if s.daily_new_trades >= self.limits.max_new_trades_per_day {
            return Err(format!(
                "daily new-trade cap reached: {} >= {}",
                s.daily_new_trades, self.limits.max_new_trades_per_day
            ));
        }
        if candidate_max_loss > self.limits.max_trade_loss_dollars {
            return Err(format!(
                "per-trade max loss ${:.2} exceeds cap ${:.2}",
                candidate_max_loss, self.limits.max_trade_loss_dollars
            ));
        }
        if exposure.underlying_risk_dollars + candidate_max_loss > self.limits.underlying_max_risk
        {
            return Err(format!(
                "per-underlying risk ${:.2} would exceed cap ${:.2}",
                exposure.underlying_risk_dollars + candidate_max_loss,
                self.limits.underlying_max_risk
            ));
        }
        if exposure.expiry_cluster_risk_dollars + candidate_max_loss > self.limits.expiry_max_risk
        {
            return Err(format!(
                "per-expiry cluster risk ${:.2} would exceed cap ${:.2}",
                exposure.expiry_cluster_risk_dollars + candidate_max_loss,
                self.limits.expiry_max_risk
            ));
        }
        if exposure.open_spreads_global >= self.limits.max_open_spreads_global {
            return Err(format!(
                "global open-spread count {} >= cap {}",
                exposure.open_spreads_global, self.limits.max_open_spreads_global
            ));
        }
        if exposure.open_spreads_for_symbol >= self.limits.max_open_spreads_per_symbol {
            return Err(format!(
                "per-symbol open-spread count {} >= cap {}",
                exposure.open_spreads_for_symbol, self.limits.max_open_spreads_per_symbol
            ));
        }
        if candidate_max_loss > self.limits.daily_max_new_risk {
            return Err(format!(
                "single trade risk ${candidate_max_loss:.2} exceeds daily new-risk cap \
                 ${:.2}",
                self.limits.daily_max_new_risk
            ));
        }

        Ok(())
    }

    pub fn snapshot(&self) -> RiskSnapshot {
        self.maybe_reset_daily();
        let s = self.state.read();
        RiskSnapshot {
            system_mode: self.system_mode(),
            daily_realized_pnl: s.daily_realized_pnl,
            emergency_exit_count_today: s.emergency_exit_count_today,
            daily_new_trades: s.daily_new_trades,
            current_date: s.current_date.clone(),
        }
    }

    pub fn hard_stop(&self) {
        let mut s = self.state.write();
        s.hard_stopped = true;
        warn!("risk engine hard-stopped — all new trades blocked until manual reset");
    }

    pub fn reset_daily(&self) {
        let mut s = self.state.write();
        let today = Utc::now().format("%Y-%m-%d").to_string();
        Self::do_reset(&mut s, &today);
        info!(date = %today, "daily risk counters reset (manual)");
    }

    fn maybe_reset_daily(&self) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        {
            let s = self.state.read();
            if s.current_date == today {
                return;
            }
        }
        let mut s = self.state.write();
        if s.current_date != today {
            info!(old_date = %s.current_date, new_date = %today, "date rolled — resetting daily risk counters");
            Self::do_reset(&mut s, &today);
        }
    }

    fn do_reset(s: &mut Inner, date: &str) {
        s.daily_realized_pnl = 0.0;
        s.emergency_exit_count_today = 0;
        s.daily_new_trades = 0;
        s.current_date = date.to_string();
    }
}

impl std::fmt::Debug for RiskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskEngine").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> RiskEngine {
        RiskEngine::new(RiskLimits {
            daily_max_loss: -1000.0,
            daily_max_new_risk: 5000.0,
            max_trade_loss_dollars: 500.0,
            underlying_max_risk: 1500.0,
            expiry_max_risk: 3000.0,
            max_open_spreads_global: 10,
            max_open_spreads_per_symbol: 2,
            max_new_trades_per_day: 5,
        })
    }

    #[test]
    fn normal_mode_allows_trade_within_caps() {
        let e = engine();
        assert_eq!(e.system_mode(), SystemMode::Normal);
        assert!(e.can_open_new_trade(300.0, ExposureState::default()).is_ok());
    }

    #[test]
    fn hard_stop_on_daily_loss_breach() {
        let e = engine();
        e.record_trade_closed(-1200.0);
        assert_eq!(e.system_mode(), SystemMode::HardStop);
        assert!(e.can_open_new_trade(100.0, ExposureState::default()).is_err());
    }

    #[test]
    fn per_trade_loss_cap_rejects_oversized_candidate() {
        let e = engine();
        let err = e.can_open_new_trade(600.0, ExposureState::default());
        assert!(err.is_err());
    }

    #[test]
    fn cooldown_after_daily_trade_cap() {
        let e = engine();
        for _ in 0..5 {
            e.record_new_trade();
        }
        assert_eq!(e.system_mode(), SystemMode::Cooldown);
    }
}
