// =============================================================================
// Cycle Schedulers — Trade, Monitor, and Orphan Cleanup loops
// =============================================================================
//
// Grounded on `main.rs`'s spawn-one-task-per-concern pattern: each cycle is
// its own `tokio::spawn`ed `tokio::time::interval` loop, sequential within
// itself (a slow tick simply delays the next one rather than overlapping),
// mirroring the teacher's strategy loop / exit monitor loop / reconciliation
// loop split.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Datelike;
use tracing::{error, info, warn};

use crate::app_state::AppState;
use crate::config::Settings;
use crate::entry::{EntryEngine, EntryOutcome};
use crate::exit::engine::ExitEngine;
use crate::exit::rules::{self, ExitInputs, RuleThresholds};
use crate::lifecycle::LifecycleController;
use crate::notify::NotifyEvent;
use crate::proposal::ProposalEngine;
use crate::risk::ExposureState;
use crate::sync::SyncEngine;
use crate::types::{ExitReason, Strategy};

const TRADE_CYCLE_KEY: &str = "LAST_TRADE_CYCLE";
const MONITOR_CYCLE_KEY: &str = "LAST_MONITOR_CYCLE";
const ORPHAN_CYCLE_KEY: &str = "LAST_ORPHAN_CLEANUP";
const LAST_DAILY_SUMMARY_KEY: &str = "LAST_DAILY_SUMMARY_DAY";

/// Every cycle reads its dependencies from one shared `AppState`, the way
/// the teacher's strategy/exit/reconciliation loops all close over the
/// same `Arc<AppState>` rather than taking individual subsystem handles.
pub struct CycleRunner {
    state: Arc<AppState>,
}

impl CycleRunner {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Spawns all three scheduler loops. Returns their join handles so the
    /// caller can await them on shutdown if desired; in practice `main`
    /// just lets them run until the process exits.
    pub fn spawn_all(self: Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let trade = self.clone();
        let monitor = self.clone();
        let orphan = self.clone();
        let summary = self.clone();
        vec![
            tokio::spawn(async move { trade.run_trade_cycle().await }),
            tokio::spawn(async move { monitor.run_monitor_cycle().await }),
            tokio::spawn(async move { orphan.run_orphan_cleanup().await }),
            tokio::spawn(async move { summary.run_daily_summary_cycle().await }),
        ]
    }

    /// Every minute during market hours: sync, then evaluate and enter
    /// every configured (strategy, symbol) bucket with no outstanding
    /// proposal (§4.7).
    async fn run_trade_cycle(&self) {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let now = chrono::Utc::now();
            if !crate::clock::is_market_hours(now) {
                continue;
            }

            if let Err(e) = SyncEngine::new(self.state.store.clone(), self.state.broker.clone()).run().await {
                error!(error = %e, "trade cycle: sync failed");
                self.state.push_error(format!("trade cycle sync failed: {e}"));
                continue;
            }

            let settings = Settings::new(&self.state.store);
            let mode = settings.trading_mode().await;
            let proposal_engine = ProposalEngine::new(self.state.store.clone(), self.state.broker.clone());
            let entry_engine = EntryEngine::new(self.state.store.clone(), self.state.broker.clone(), self.state.sink.clone());
            let (dte_min, dte_max) = settings.dte_window().await;

            for strategy in whitelisted_strategies(&settings).await {
                for symbol in settings.underlying_whitelist().await {
                    let Some(expiration) = pick_expiration(now, dte_min, dte_max) else { continue };
                    match proposal_engine.evaluate(strategy, &symbol, expiration, mode).await {
                        Ok(Some(proposal_id)) => {
                            let Ok(Some(proposal)) = self.store_proposal(&proposal_id).await else { continue };
                            self.state
                                .notify(NotifyEvent::ProposalCreated {
                                    underlying: symbol.clone(),
                                    strategy: strategy.to_string(),
                                    composite_score: proposal.composite_score,
                                })
                                .await;
                            let exposure = self.compute_exposure(&symbol, &expiration.to_string()).await;
                            match entry_engine.process(&proposal, mode, &self.state.risk, exposure).await {
                                Ok(EntryOutcome::Filled { trade_id }) => {
                                    info!(trade_id, symbol = %symbol, strategy = %strategy, "entry filled");
                                    self.state
                                        .notify(NotifyEvent::EntryFilled {
                                            trade_id,
                                            underlying: symbol.clone(),
                                            entry_price: proposal.credit_target,
                                        })
                                        .await;
                                }
                                Ok(other) => {
                                    info!(symbol = %symbol, strategy = %strategy, outcome = ?other, "entry not filled");
                                }
                                Err(e) => {
                                    warn!(symbol = %symbol, strategy = %strategy, error = %e, "entry processing failed");
                                    self.state.push_error(format!("entry processing failed for {symbol} {strategy}: {e}"));
                                }
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(symbol = %symbol, strategy = %strategy, error = %e, "proposal evaluation failed");
                            self.state.push_error(format!("proposal evaluation failed for {symbol} {strategy}: {e}"));
                        }
                    }
                }
            }

            self.persist_risk_state().await;
            settings.record_last_run(TRADE_CYCLE_KEY, &now.to_rfc3339()).await.ok();
        }
    }

    /// Every minute, market hours or not: resync trade quantities, evaluate
    /// the exit rule ladder for every OPEN trade, and execute any non-normal
    /// verdict (§4.5, §4.6).
    async fn run_monitor_cycle(&self) {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let now = chrono::Utc::now();

            let settings = Settings::new(&self.state.store);
            let thresholds = RuleThresholds {
                time_exit_dte: settings.close_rule_time_exit_dte().await,
                time_exit_cutoff: settings.close_rule_time_exit_cutoff().await,
                stop_loss_fraction: settings.close_rule_stop_loss_fraction().await,
                trail_arm_profit_fraction: settings.close_rule_trail_arm_profit_fraction().await,
                trail_giveback_fraction: settings.close_rule_trail_giveback_fraction().await,
                profit_target_fraction: settings.close_rule_profit_target_fraction().await,
                iv_crush_threshold: settings.close_rule_iv_crush_threshold().await,
                iv_crush_min_pnl: settings.close_rule_iv_crush_min_pnl().await,
            };

            let open_trades = match self.state.store.open_trades().await {
                Ok(t) => t,
                Err(e) => {
                    error!(error = %e, "monitor cycle: failed to load open trades");
                    self.state.push_error(format!("monitor cycle failed to load open trades: {e}"));
                    continue;
                }
            };

            // The portfolio mirror is refreshed by the sync engine, not
            // read live from the broker here — matching §5's "sync
            // precedes decisions" ordering guarantee.
            let mirror = match self.state.store.portfolio_positions().await {
                Ok(p) => p,
                Err(e) => {
                    error!(error = %e, "monitor cycle: failed to load portfolio mirror");
                    self.state.push_error(format!("monitor cycle failed to load portfolio mirror: {e}"));
                    continue;
                }
            };

            let exit_engine = ExitEngine::new(self.state.store.clone(), self.state.broker.clone());
            let lifecycle = LifecycleController::new(self.state.store.clone());

            for trade in &open_trades {
                let Ok(expiration) = trade.expiration.parse::<chrono::NaiveDate>() else {
                    warn!(trade_id = %trade.id, expiration = %trade.expiration, "monitor cycle: unparseable expiration");
                    continue;
                };
                let chain = match self.state.broker.get_option_chain(&trade.underlying, expiration, true).await {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(trade_id = %trade.id, error = %e, "monitor cycle: chain fetch failed");
                        continue;
                    }
                };
                let Some((mark, quote_integrity_ok)) = crate::trade::spread_mark_from_chain(
                    &chain,
                    trade.strategy().option_type(),
                    trade.short_strike,
                    trade.long_strike,
                    trade.strategy().is_credit(),
                ) else {
                    warn!(trade_id = %trade.id, "monitor cycle: strikes no longer present in chain");
                    continue;
                };

                let short_symbol = format!("{}_{}_{}_S", trade.underlying, trade.expiration, trade.short_strike);
                let long_symbol = format!("{}_{}_{}_L", trade.underlying, trade.expiration, trade.long_strike);
                let short_leg = mirror.iter().find(|p| p.broker_symbol == short_symbol);
                let long_leg = mirror.iter().find(|p| p.broker_symbol == long_symbol);

                // §4.10: an invariant failure is terminal and preempts the
                // exit ladder entirely — no exit is attempted against a
                // structure the engine can no longer trust (§8 scenario 5).
                match lifecycle.validate_open_structure(trade, short_leg.zip(long_leg)) {
                    crate::lifecycle::StructureVerdict::Valid => {}
                    crate::lifecycle::StructureVerdict::SkipRetry => {}
                    crate::lifecycle::StructureVerdict::Invalid(reason) => {
                        if let Err(e) = lifecycle.mark_invalid_structure(&trade.id, &reason).await {
                            warn!(trade_id = %trade.id, error = %e, "failed to mark trade INVALID_STRUCTURE");
                        }
                        continue;
                    }
                }

                if let Some(long_leg) = long_leg {
                    let broker_qty = long_leg.quantity.abs().round() as i64;
                    if broker_qty > 0 && broker_qty != trade.quantity {
                        if let Err(e) = lifecycle.resync_quantity(&trade.id, broker_qty).await {
                            warn!(trade_id = %trade.id, error = %e, "failed to resync trade quantity");
                        }
                    }
                }

                let dte = crate::clock::dte(now, parse_expiration(&trade.expiration));
                let pnl_fraction = if trade.entry_price > 0.0 {
                    ((trade.entry_price - mark) / trade.entry_price).max(0.0)
                } else {
                    0.0
                };
                let loss_fraction = if trade.entry_price > 0.0 {
                    ((mark - trade.entry_price) / trade.entry_price).max(0.0)
                } else {
                    0.0
                };

                let inputs = ExitInputs {
                    mark,
                    pnl_fraction,
                    loss_fraction,
                    dte,
                    iv_now: trade.iv_entry,
                    iv_entry: trade.iv_entry,
                    max_seen_profit_fraction: trade.max_seen_profit_fraction,
                    quote_integrity_ok,
                    // A genuine structural invariant failure is handled
                    // above via `mark_invalid_structure` and never reaches
                    // here; this field stays reserved for a future signal
                    // distinct from quote-integrity-driven EMERGENCY.
                    structural_break: false,
                    low_value_floor: 0.05,
                    now,
                };

                let (reason, new_max_seen) = rules::evaluate(&inputs, &thresholds);
                if (new_max_seen - trade.max_seen_profit_fraction).abs() > 1e-9 {
                    let mut updated = trade.clone();
                    updated.max_seen_profit_fraction = new_max_seen;
                    self.state.store.update_trade(&updated).await.ok();
                }

                if matches!(reason, ExitReason::NormalExit) {
                    continue;
                }

                self.state
                    .notify(NotifyEvent::ExitSubmitted { trade_id: trade.id.clone(), reason: reason.to_string() })
                    .await;
                match exit_engine.execute(trade, reason).await {
                    Ok(crate::exit::engine::ExitOutcome::Closed { realized_pnl }) => {
                        info!(trade_id = %trade.id, exit_reason = %reason, "exit executed");
                        self.state
                            .notify(NotifyEvent::ExitFilled { trade_id: trade.id.clone(), realized_pnl })
                            .await;
                    }
                    Ok(crate::exit::engine::ExitOutcome::ExitError(msg)) => {
                        warn!(trade_id = %trade.id, error = %msg, "exit execution failed");
                    }
                    Err(e) => {
                        warn!(trade_id = %trade.id, error = %e, "exit execution failed");
                        self.state.push_error(format!("exit execution failed for trade {}: {e}", trade.id));
                        lifecycle.mark_exit_error(&trade.id, &e.to_string()).await.ok();
                    }
                }
            }

            self.persist_risk_state().await;
            settings.record_last_run(MONITOR_CYCLE_KEY, &now.to_rfc3339()).await.ok();
        }
    }

    /// Snapshots the risk engine into `risk_state` (§4.9) so a restart picks
    /// up where the day left off instead of re-zeroing daily counters.
    async fn persist_risk_state(&self) {
        let snapshot = self.state.risk.snapshot();
        let row = crate::store::RiskStateRow {
            system_mode: snapshot.system_mode.to_string(),
            daily_realized_pnl: snapshot.daily_realized_pnl,
            daily_new_trades: snapshot.daily_new_trades as i64,
            emergency_exit_count_today: snapshot.emergency_exit_count_today,
            current_date: snapshot.current_date,
        };
        if let Err(e) = self.state.store.save_risk_state(&row).await {
            warn!(error = %e, "failed to persist risk state");
        }
    }

    /// Off-hours orphan-order cleanup, on a slower cadence than the two
    /// market-hours cycles; per-order results are logged at debug level
    /// only to avoid flooding logs when the broker carries stale orders
    /// across a weekend.
    async fn run_orphan_cleanup(&self) {
        let mut interval = tokio::time::interval(Duration::from_secs(900));
        loop {
            interval.tick().await;
            let now = chrono::Utc::now();
            if crate::clock::is_market_hours(now) {
                continue;
            }

            match SyncEngine::new(self.state.store.clone(), self.state.broker.clone()).run().await {
                Ok(summary) => {
                    if summary.orphans_cancelled > 0 {
                        info!(cancelled = summary.orphans_cancelled, "orphan cleanup cancelled stale orders");
                    }
                }
                Err(e) => warn!(error = %e, "orphan cleanup sync failed"),
            }

            let settings = Settings::new(&self.state.store);
            settings.record_last_run(ORPHAN_CYCLE_KEY, &now.to_rfc3339()).await.ok();
        }
    }

    /// Once per calendar day, after market close, rolls up every trade
    /// closed that day into `daily_summaries` and fires a `DailySummary`
    /// notification. Checked on a 15-minute cadence; the `settings` guard
    /// on `LAST_DAILY_SUMMARY_DAY` keeps it idempotent across ticks.
    async fn run_daily_summary_cycle(&self) {
        let mut interval = tokio::time::interval(Duration::from_secs(900));
        loop {
            interval.tick().await;
            let now = chrono::Utc::now();
            if crate::clock::is_market_hours(now) {
                continue;
            }

            let today = crate::clock::to_eastern(now).date_naive().to_string();
            let settings = Settings::new(&self.state.store);
            if settings.last_run(LAST_DAILY_SUMMARY_KEY).await.as_deref() == Some(today.as_str()) {
                continue;
            }

            let closed = match self.state.store.trades_by_status("CLOSED").await {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "daily summary cycle: failed to load closed trades");
                    self.state.push_error(format!("daily summary cycle failed to load closed trades: {e}"));
                    continue;
                }
            };
            let closed_today: Vec<_> = closed
                .iter()
                .filter(|t| t.closed_at.map(|c| crate::clock::to_eastern(c).date_naive().to_string()) == Some(today.clone()))
                .collect();

            let opened = match self.state.store.trades_by_status("OPEN").await {
                Ok(t) => t,
                Err(_) => Vec::new(),
            };
            let trades_opened = opened
                .iter()
                .filter(|t| t.opened_at.map(|o| crate::clock::to_eastern(o).date_naive().to_string()) == Some(today.clone()))
                .count() as i64
                + closed_today
                    .iter()
                    .filter(|t| t.opened_at.map(|o| crate::clock::to_eastern(o).date_naive().to_string()) == Some(today.clone()))
                    .count() as i64;

            let realized_pnl: f64 = closed_today.iter().filter_map(|t| t.realized_pnl).sum();
            let wins = closed_today.iter().filter(|t| t.realized_pnl.unwrap_or(0.0) > 0.0).count() as i64;
            let losses = closed_today.iter().filter(|t| t.realized_pnl.unwrap_or(0.0) <= 0.0).count() as i64;

            let row = crate::store::DailySummaryRow {
                trading_day: today.clone(),
                realized_pnl,
                trades_opened,
                trades_closed: closed_today.len() as i64,
                wins,
                losses,
            };
            if let Err(e) = self.state.store.upsert_daily_summary(&row).await {
                warn!(error = %e, "daily summary cycle: failed to persist rollup");
                self.state.push_error(format!("daily summary cycle failed to persist rollup: {e}"));
                continue;
            }

            self.state
                .notify(NotifyEvent::DailySummary {
                    trading_day: today.clone(),
                    realized_pnl,
                    trades_closed: row.trades_closed,
                    wins,
                    losses,
                })
                .await;

            settings.record_last_run(LAST_DAILY_SUMMARY_KEY, &today).await.ok();
        }
    }

    async fn store_proposal(&self, proposal_id: &str) -> anyhow::Result<Option<crate::store::ProposalRow>> {
        let ready = self.state.store.ready_proposals().await?;
        Ok(ready.into_iter().find(|p| p.id == proposal_id))
    }

    async fn compute_exposure(&self, symbol: &str, expiration: &str) -> ExposureState {
        let open_trades = self.state.store.open_trades().await.unwrap_or_default();
        let underlying_risk_dollars = open_trades
            .iter()
            .filter(|t| t.underlying == symbol)
            .map(|t| t.max_loss)
            .sum();
        let expiry_cluster_risk_dollars = open_trades
            .iter()
            .filter(|t| t.expiration == expiration)
            .map(|t| t.max_loss)
            .sum();
        ExposureState {
            underlying_risk_dollars,
            expiry_cluster_risk_dollars,
            open_spreads_global: open_trades.len() as u32,
            open_spreads_for_symbol: open_trades.iter().filter(|t| t.underlying == symbol).count() as u32,
        }
    }
}

async fn whitelisted_strategies(settings: &Settings<'_>) -> Vec<Strategy> {
    settings
        .strategy_whitelist()
        .await
        .iter()
        .filter_map(|s| Strategy::parse(s))
        .collect()
}

/// Picks the nearest Friday expiration inside `[dte_min, dte_max]` calendar
/// days out. Weekly options in this engine always expire on a Friday.
fn pick_expiration(now: chrono::DateTime<chrono::Utc>, dte_min: i64, dte_max: i64) -> Option<chrono::NaiveDate> {
    let today = crate::clock::to_eastern(now).date_naive();
    for offset in dte_min..=dte_max {
        let candidate = today + chrono::Duration::days(offset);
        if candidate.weekday() == chrono::Weekday::Fri {
            return Some(candidate);
        }
    }
    None
}

fn parse_expiration(s: &str) -> chrono::NaiveDate {
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("persisted expiration must be a valid date")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn pick_expiration_finds_a_friday_in_range() {
        let now = chrono::Utc.with_ymd_and_hms(2026, 8, 1, 15, 0, 0).unwrap();
        let exp = pick_expiration(now, 25, 45).unwrap();
        assert_eq!(exp.weekday(), chrono::Weekday::Fri);
        let dte = (exp - now.date_naive()).num_days();
        assert!((25..=45).contains(&dte));
    }
}
