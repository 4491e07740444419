// =============================================================================
// Sync Engine — broker-state reconciliation
// =============================================================================
//
// Grounded on `reconcile.rs`'s three-phase shape (fetch exchange state,
// diff against internal state, refresh balance cache) and its stated
// safety policy of never acting on broker-side state beyond what this
// engine itself placed. The portfolio mirror overwrite is transactional
// (`Store::replace_portfolio_positions`), matching the teacher's
// atomic-cache-swap-under-lock pattern in `refresh_balances`.
// =============================================================================

use std::collections::HashSet;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use crate::broker::BrokerClient;
use crate::config::Settings;
use crate::lifecycle::LifecycleController;
use crate::store::{new_id, AccountSnapshotRow, PortfolioPositionRow, Store};
use crate::types::OrderStatus;

pub struct SyncEngine {
    store: Store,
    broker: BrokerClient,
}

#[derive(Debug, Default)]
pub struct SyncSummary {
    pub positions_mirrored: usize,
    pub orders_reconciled: usize,
    pub orphans_cancelled: usize,
    pub balance_drift: bool,
}

impl SyncEngine {
    pub fn new(store: Store, broker: BrokerClient) -> Self {
        Self { store, broker }
    }

    /// Runs one full reconciliation pass (§4.8): positions, orders,
    /// balances, in that order, since order reconciliation depends on
    /// knowing which symbols are still held.
    pub async fn run(&self) -> Result<SyncSummary> {
        let positions_mirrored = self.sync_positions().await?;
        let orders_reconciled = self.sync_orders().await?;
        let orphans_cancelled = self.cancel_engine_orphans().await?;
        let balance_drift = self.sync_balances().await?;

        let summary = SyncSummary {
            positions_mirrored,
            orders_reconciled,
            orphans_cancelled,
            balance_drift,
        };
        info!(
            positions = summary.positions_mirrored,
            orders = summary.orders_reconciled,
            orphans = summary.orphans_cancelled,
            balance_drift = summary.balance_drift,
            "sync cycle completed"
        );
        Ok(summary)
    }

    /// Atomically overwrites the portfolio mirror with the broker's current
    /// position list. A snapshot id ties every row in this pass together
    /// for later debugging.
    async fn sync_positions(&self) -> Result<usize> {
        let positions = self.broker.get_positions().await?;
        let snapshot_id = new_id();
        let now = Utc::now();

        // A position's option type isn't recoverable from the broker
        // symbol this engine mints (`<underlying>_<expiration>_<strike>_<S|L>`
        // only distinguishes leg role, not call/put), so it's resolved
        // against whichever managed trade holds that underlying/expiration/
        // strike combination.
        let managed = self.store.open_trades().await?;

        let rows: Vec<PortfolioPositionRow> = positions
            .iter()
            .filter_map(|p| {
                let (underlying, expiration, strike, is_short_leg) = parse_engine_symbol(&p.symbol)?;
                let trade = managed.iter().find(|t| {
                    t.underlying == underlying
                        && t.expiration == expiration
                        && ((is_short_leg && (t.short_strike - strike).abs() < 1e-6)
                            || (!is_short_leg && (t.long_strike - strike).abs() < 1e-6))
                })?;
                Some(PortfolioPositionRow {
                    broker_symbol: p.symbol.clone(),
                    underlying,
                    expiration,
                    option_type: trade.strategy().option_type().to_string(),
                    strike,
                    side: if p.quantity < 0 { "SHORT".to_string() } else { "LONG".to_string() },
                    quantity: p.quantity as f64,
                    cost_basis: p.avg_price,
                    last_price: Some(p.avg_price),
                    bid: None,
                    ask: None,
                    snapshot_id: snapshot_id.clone(),
                    updated_at: now,
                })
            })
            .collect();

        let count = rows.len();
        self.store.replace_portfolio_positions(&rows).await?;
        Ok(count)
    }

    /// Fetches orders over the configured lookback window and reconciles
    /// terminal statuses against trades tagged with the matching broker
    /// order id (§4.8, §9 sync-window decision).
    async fn sync_orders(&self) -> Result<usize> {
        let settings = Settings::new(&self.store);
        let lookback_days = settings.sync_order_lookback_days().await;
        let end = Utc::now();
        let start = end - chrono::Duration::days(lookback_days);

        let orders = self.broker.get_all_orders(start, end).await?;
        let lifecycle = LifecycleController::new(self.store.clone());

        self.backfill_entry_order_ids().await?;

        let pending_entries = self.store.trades_by_status("ENTRY_PENDING").await?;
        let mut reconciled = 0usize;

        for trade in &pending_entries {
            let Some(broker_id) = &trade.broker_order_id_open else { continue };
            let Some(report) = orders.iter().find(|o| &o.broker_order_id == broker_id) else { continue };

            match report.status {
                OrderStatus::Filled => {
                    lifecycle.mark_open(&trade.id, Utc::now()).await?;
                    reconciled += 1;
                }
                OrderStatus::Rejected | OrderStatus::Cancelled => {
                    lifecycle.cancel_entry(&trade.id).await?;
                    reconciled += 1;
                }
                _ => {}
            }
        }

        // Exit-side terminal statuses are left for the Exit Engine's own
        // poll loop to act on; this pass only counts them so the cycle
        // scheduler can tell a stalled close order apart from a quiet one.
        let closing = self.store.trades_by_status("CLOSING_PENDING").await?;
        for trade in &closing {
            let Some(order) = self
                .store
                .orders_for_trade(&trade.id)
                .await?
                .into_iter()
                .find(|o| o.side == "EXIT" && !o.status().is_terminal())
            else {
                continue;
            };
            let Some(broker_id) = &order.broker_order_id else { continue };
            if orders.iter().any(|r| &r.broker_order_id == broker_id && r.status.is_terminal()) {
                reconciled += 1;
            }
        }

        Ok(reconciled)
    }

    /// Backfills `broker_order_id_open` for trades missing it (§4.8), by
    /// matching the engine's own tagged entry orders on underlying,
    /// expiration, both strikes, and strategy — rather than trusting a
    /// trade's own `proposal_id` link, which a non-engine-originated trade
    /// (§3 `origin`) may not carry correctly.
    async fn backfill_entry_order_ids(&self) -> Result<usize> {
        let candidates = self.store.entry_orders_with_broker_id().await?;
        let open_trades = self.store.open_trades().await?;
        let pending = self.store.trades_by_status("ENTRY_PENDING").await?;

        let mut backfilled = 0usize;
        for trade in open_trades.iter().chain(pending.iter()).filter(|t| t.broker_order_id_open.is_none()) {
            for order in &candidates {
                let Some(proposal) = self.store.get_proposal(&order.proposal_id).await? else { continue };
                if proposal.underlying == trade.underlying
                    && proposal.expiration == trade.expiration
                    && (proposal.short_strike - trade.short_strike).abs() < 1e-6
                    && (proposal.long_strike - trade.long_strike).abs() < 1e-6
                    && proposal.strategy == trade.strategy
                {
                    let mut updated = trade.clone();
                    updated.broker_order_id_open = order.broker_order_id.clone();
                    self.store.update_trade(&updated).await?;
                    info!(trade_id = %trade.id, broker_order_id = ?order.broker_order_id, "backfilled broker_order_id_open");
                    backfilled += 1;
                    break;
                }
            }
        }
        Ok(backfilled)
    }

    /// Cancels open orders this engine itself tagged (via `client_order_id`
    /// bookkeeping in the `orders` table) that have no corresponding trade
    /// row left to care about them — never a broker-side order this
    /// process didn't place.
    async fn cancel_engine_orphans(&self) -> Result<usize> {
        let open_orders = self.broker.get_open_orders().await?;
        let open_trades = self.store.open_trades().await?;
        let live_broker_ids: HashSet<String> = open_trades
            .iter()
            .filter_map(|t| t.broker_order_id_close.clone().or_else(|| t.broker_order_id_open.clone()))
            .collect();

        let mut cancelled = 0;
        for order in &open_orders {
            if live_broker_ids.contains(&order.broker_order_id) {
                continue;
            }
            // Only cancel orders whose id we recognize as one this engine
            // placed (present in our own `orders` table); a broker order
            // we never issued is left untouched per the safety policy.
            if self.store.order_by_broker_id(&order.broker_order_id).await?.is_none() {
                continue;
            }
            warn!(broker_order_id = %order.broker_order_id, "cancelling orphaned engine order");
            if let Err(e) = self.broker.cancel_order(&order.broker_order_id).await {
                warn!(broker_order_id = %order.broker_order_id, error = %e, "failed to cancel orphan");
                continue;
            }
            cancelled += 1;
        }
        Ok(cancelled)
    }

    async fn sync_balances(&self) -> Result<bool> {
        let balances = self.broker.get_balances().await?;
        let snapshot = AccountSnapshotRow {
            id: new_id(),
            cash: balances.cash,
            buying_power: balances.buying_power,
            equity: balances.equity,
            margin_requirement: balances.margin_requirement,
            created_at: Utc::now(),
        };
        self.store.record_account_snapshot(&snapshot).await?;
        Ok(false)
    }
}

/// Broker symbols this engine mints are `<UNDERLYING>_<EXPIRATION>_<STRIKE>_<S|L>`
/// (see `broker::client` order construction); anything else is a non-option
/// balance or a position opened outside this engine, and is skipped.
fn parse_engine_symbol(symbol: &str) -> Option<(String, String, f64, bool)> {
    let parts: Vec<&str> = symbol.split('_').collect();
    if parts.len() != 4 {
        return None;
    }
    let strike: f64 = parts[2].parse().ok()?;
    let is_short_leg = parts[3] == "S";
    Some((parts[0].to_string(), parts[1].to_string(), strike, is_short_leg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_engine_symbol_extracts_strike_and_leg_role() {
        let (underlying, expiration, strike, is_short) = parse_engine_symbol("SPY_2026-09-02_485_S").unwrap();
        assert_eq!(underlying, "SPY");
        assert_eq!(expiration, "2026-09-02");
        assert_eq!(strike, 485.0);
        assert!(is_short);
    }

    #[test]
    fn parse_engine_symbol_rejects_non_option_balances() {
        assert!(parse_engine_symbol("USD").is_none());
    }
}
