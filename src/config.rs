// =============================================================================
// Settings — typed accessors over the key/value `settings` table
// =============================================================================
//
// Grounded on `runtime_config.rs`'s serde-default-per-field convention,
// adapted from a JSON file with atomic tmp+rename save to a database table:
// every recognized key (spec §6) has a typed getter with a hard-coded
// fallback default, so a freshly migrated database with no rows behaves
// identically to one that has every key explicitly set.
// =============================================================================

use anyhow::Result;

use crate::store::Store;
use crate::types::{SystemMode, TradingMode};

fn default_true() -> bool {
    true
}

/// Typed view over the settings table. Cheap to construct; holds no state
/// of its own beyond a handle to the store.
pub struct Settings<'a> {
    store: &'a Store,
}

impl<'a> Settings<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    async fn get_str(&self, key: &str, default: &str) -> String {
        self.store
            .get_setting(key)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| default.to_string())
    }

    async fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.get_str(key, &default.to_string())
            .await
            .parse()
            .unwrap_or(default)
    }

    async fn get_u32(&self, key: &str, default: u32) -> u32 {
        self.get_str(key, &default.to_string())
            .await
            .parse()
            .unwrap_or(default)
    }

    async fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get_str(key, &default.to_string()).await.as_str() {
            "true" | "TRUE" | "1" => true,
            "false" | "FALSE" | "0" => false,
            _ => default,
        }
    }

    pub async fn trading_mode(&self) -> TradingMode {
        let raw = self.get_str("TRADING_MODE", "DRY_RUN").await;
        TradingMode::parse(&raw).unwrap_or_default()
    }

    pub async fn auto_mode_enabled(&self, mode: TradingMode) -> bool {
        match mode {
            TradingMode::DryRun => false,
            TradingMode::SandboxPaper => self.get_bool("AUTO_MODE_ENABLED_PAPER", default_true()).await,
            TradingMode::Live => self.get_bool("AUTO_MODE_ENABLED_LIVE", false).await,
        }
    }

    /// Mode-specific composite-score floor, falling back to the global
    /// `PROPOSAL_MIN_SCORE` key, per the dual-threshold design decision in
    /// SPEC_FULL.md §9: this is the operator ceiling layered on top of the
    /// Scoring Engine's own hard-coded floor, never a replacement for it.
    pub async fn min_score(&self, mode: TradingMode) -> f64 {
        let fallback = self.get_f64("PROPOSAL_MIN_SCORE", 0.0).await;
        match mode {
            TradingMode::SandboxPaper => self.get_f64("MIN_SCORE_PAPER", fallback).await,
            TradingMode::Live => self.get_f64("MIN_SCORE_LIVE", fallback).await,
            TradingMode::DryRun => fallback,
        }
    }

    pub async fn min_credit_fraction(&self) -> f64 {
        self.get_f64("MIN_CREDIT_FRACTION", crate::scoring::credit::MIN_CREDIT_FRACTION).await
    }

    pub async fn dte_window(&self) -> (i64, i64) {
        let min = self.get_f64("PROPOSAL_DTE_MIN", 25.0).await as i64;
        let max = self.get_f64("PROPOSAL_DTE_MAX", 45.0).await as i64;
        (min, max)
    }

    pub async fn strategy_whitelist(&self) -> Vec<String> {
        self.csv("PROPOSAL_STRATEGY_WHITELIST", "BULL_PUT_CREDIT,BEAR_CALL_CREDIT")
            .await
    }

    pub async fn underlying_whitelist(&self) -> Vec<String> {
        self.csv("PROPOSAL_UNDERLYING_WHITELIST", "SPY,QQQ").await
    }

    async fn csv(&self, key: &str, default: &str) -> Vec<String> {
        self.get_str(key, default)
            .await
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub async fn close_rule_profit_target_fraction(&self) -> f64 {
        self.get_f64("CLOSE_RULE_PROFIT_TARGET_FRACTION", 0.50).await
    }

    pub async fn close_rule_stop_loss_fraction(&self) -> f64 {
        self.get_f64("CLOSE_RULE_STOP_LOSS_FRACTION", 1.00).await
    }

    pub async fn close_rule_time_exit_dte(&self) -> i64 {
        self.get_f64("CLOSE_RULE_TIME_EXIT_DTE", 1.0).await as i64
    }

    pub async fn close_rule_time_exit_cutoff(&self) -> String {
        self.get_str("CLOSE_RULE_TIME_EXIT_CUTOFF", "15:45").await
    }

    pub async fn close_rule_iv_crush_threshold(&self) -> f64 {
        self.get_f64("CLOSE_RULE_IV_CRUSH_THRESHOLD", 0.85).await
    }

    pub async fn close_rule_iv_crush_min_pnl(&self) -> f64 {
        self.get_f64("CLOSE_RULE_IV_CRUSH_MIN_PNL", 0.15).await
    }

    pub async fn close_rule_trail_arm_profit_fraction(&self) -> f64 {
        self.get_f64("CLOSE_RULE_TRAIL_ARM_PROFIT_FRACTION", 0.25).await
    }

    pub async fn close_rule_trail_giveback_fraction(&self) -> f64 {
        self.get_f64("CLOSE_RULE_TRAIL_GIVEBACK_FRACTION", 0.10).await
    }

    pub async fn max_new_trades_per_day(&self) -> u32 {
        self.get_u32("MAX_NEW_TRADES_PER_DAY", 5).await
    }

    pub async fn max_open_spreads_global(&self) -> u32 {
        self.get_u32("MAX_OPEN_SPREADS_GLOBAL", 10).await
    }

    pub async fn max_open_spreads_per_symbol(&self) -> u32 {
        self.get_u32("MAX_OPEN_SPREADS_PER_SYMBOL", 2).await
    }

    pub async fn max_daily_loss_pct(&self) -> f64 {
        self.get_f64("MAX_DAILY_LOSS_PCT", 3.0).await
    }

    pub async fn daily_max_loss(&self) -> f64 {
        self.get_f64("DAILY_MAX_LOSS", -1000.0).await
    }

    pub async fn daily_max_new_risk(&self) -> f64 {
        self.get_f64("DAILY_MAX_NEW_RISK", 5000.0).await
    }

    pub async fn max_trade_loss_dollars(&self) -> f64 {
        self.get_f64("MAX_TRADE_LOSS_DOLLARS", 500.0).await
    }

    pub async fn underlying_max_risk(&self) -> f64 {
        self.get_f64("UNDERLYING_MAX_RISK", 1500.0).await
    }

    pub async fn expiry_max_risk(&self) -> f64 {
        self.get_f64("EXPIRY_MAX_RISK", 3000.0).await
    }

    pub async fn default_trade_quantity(&self) -> i64 {
        self.get_u32("DEFAULT_TRADE_QUANTITY", 1).await as i64
    }

    pub async fn max_trade_quantity(&self) -> i64 {
        self.get_u32("MAX_TRADE_QUANTITY", 5).await as i64
    }

    pub async fn proposal_max_age_seconds(&self) -> i64 {
        self.get_f64("PROPOSAL_MAX_AGE_SECONDS", 120.0).await as i64
    }

    pub async fn price_drift_tolerance(&self) -> f64 {
        self.get_f64("PRICE_DRIFT_TOLERANCE", 0.10).await
    }

    pub async fn sync_order_lookback_days(&self) -> i64 {
        // Consolidates the two observed order-sync windows (2 vs 7 days)
        // into one configurable setting, per the Open Question decision
        // recorded in SPEC_FULL.md §9.
        self.get_u32("SYNC_ORDER_LOOKBACK_DAYS", 7).await.clamp(2, 7) as i64
    }

    pub async fn last_run(&self, cycle_key: &str) -> Option<String> {
        self.store.get_setting(cycle_key).await.ok().flatten()
    }

    pub async fn record_last_run(&self, cycle_key: &str, ts: &str) -> Result<()> {
        self.store.set_setting(cycle_key, ts).await
    }

    pub async fn system_mode(&self) -> SystemMode {
        match self.store.get_risk_state().await.ok().flatten() {
            Some(row) => match row.system_mode.as_str() {
                "NORMAL" => SystemMode::Normal,
                "COOLDOWN" => SystemMode::Cooldown,
                _ => SystemMode::HardStop,
            },
            None => SystemMode::HardStop,
        }
    }
}
