// =============================================================================
// Exit Engine — seven-step exit execution sequence
// =============================================================================
//
// Grounded on the teacher's `exit/monitor.rs` per-tick collect-then-act
// pattern (candidates gathered while reading, acted on after) and
// `execution.rs`'s placed/simulated/blocked result typing.
// =============================================================================

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use crate::broker::{BrokerClient, OrderFillOutcome, SpreadLeg, SpreadOrderRequest};
use crate::lifecycle::LifecycleController;
use crate::store::{new_id, OrderRow, Store, TradeRow};
use crate::trade;
use crate::types::{ExitReason, LegSide, OrderStatus};

const QUANTITY_MISMATCH_MARKERS: &[&str] = &["more shares than your current", "insufficient position"];
const NORMAL_SLIPPAGE: f64 = 0.02;
const RETRY_SLIPPAGE: f64 = 0.03;
const FILL_POLL_BUDGET_SECS: u64 = 20;
const FILL_POLL_INTERVAL_SECS: u64 = 2;

pub struct ExitEngine {
    store: Store,
    broker: BrokerClient,
}

pub enum ExitOutcome {
    Closed { realized_pnl: f64 },
    ExitError(String),
}

impl ExitEngine {
    pub fn new(store: Store, broker: BrokerClient) -> Self {
        Self { store, broker }
    }

    pub async fn execute(&self, trade: &TradeRow, reason: ExitReason) -> Result<ExitOutcome> {
        let lifecycle = LifecycleController::new(self.store.clone());
        lifecycle.mark_closing_pending(&trade.id).await?;

        let short_symbol = format!("{}_{}_{}_S", trade.underlying, trade.expiration, trade.short_strike);
        let long_symbol = format!("{}_{}_{}_L", trade.underlying, trade.expiration, trade.long_strike);

        // Step 1: cancel any open close orders for these two symbols.
        self.cancel_open_close_orders(trade).await?;

        // Step 2: compute available quantities.
        let positions = self.broker.get_positions().await?;
        let short_pos = positions.iter().find(|p| p.symbol == short_symbol);
        let long_pos = positions.iter().find(|p| p.symbol == long_symbol);
        let available = trade::available_quantity(
            short_pos.map(|p| p.quantity).unwrap_or(0),
            long_pos.map(|p| p.quantity).unwrap_or(0),
        );

        if available == 0 {
            return self.close_broker_already_flat(trade).await;
        }

        // Step 3 + 4 + 5: build legs, price, submit.
        let is_emergency = matches!(reason, ExitReason::StructuralBreak);
        let limit_price = if is_emergency {
            trade.max_loss + 0.20
        } else {
            self.estimate_current_mark(trade).await + NORMAL_SLIPPAGE
        };

        let legs = close_legs(trade, &short_symbol, &long_symbol, available);
        let req = SpreadOrderRequest {
            strategy: trade.strategy(),
            is_credit: !trade.strategy().is_credit(), // exits flip the base type
            net_price: limit_price.abs(),
            legs,
            client_order_id: new_id(),
        };

        let submit = self.broker.place_spread_order(&req).await;
        let report = match submit {
            Ok(r) => r,
            Err(e) => {
                let text = e.to_string().to_lowercase();
                if QUANTITY_MISMATCH_MARKERS.iter().any(|m| text.contains(m)) {
                    return self.quantity_mismatch_retry(trade, &short_symbol, &long_symbol).await;
                }
                return self.single_leg_fallback(trade, &short_symbol, &long_symbol, available).await;
            }
        };

        self.record_exit_order(trade, &req.client_order_id, &report.broker_order_id, available)
            .await?;

        // Step 6: poll with a 20-second budget.
        match self.poll_fill(&report.broker_order_id).await {
            Some(fill_price) => {
                let realized_pnl = self.finalize_close(trade, fill_price, reason).await?;
                Ok(ExitOutcome::Closed { realized_pnl })
            }
            None => {
                // Retry once at wider slippage.
                let retry_price = self.estimate_current_mark(trade).await + RETRY_SLIPPAGE;
                let retry_req = SpreadOrderRequest {
                    net_price: retry_price.abs(),
                    client_order_id: new_id(),
                    ..req
                };
                match self.broker.place_spread_order(&retry_req).await {
                    Ok(r) => match self.poll_fill(&r.broker_order_id).await {
                        Some(fill_price) => {
                            let realized_pnl = self.finalize_close(trade, fill_price, reason).await?;
                            Ok(ExitOutcome::Closed { realized_pnl })
                        }
                        None => {
                            lifecycle.mark_exit_error(&trade.id, "retry fill poll timed out").await?;
                            Ok(ExitOutcome::ExitError("retry fill poll timed out".into()))
                        }
                    },
                    Err(e) => {
                        lifecycle.mark_exit_error(&trade.id, &e.to_string()).await?;
                        Ok(ExitOutcome::ExitError(e.to_string()))
                    }
                }
            }
        }
    }

    async fn cancel_open_close_orders(&self, trade: &TradeRow) -> Result<()> {
        let orders = self.store.orders_for_trade(&trade.id).await?;
        for o in orders.into_iter().filter(|o| o.side == "EXIT" && !o.status().is_terminal()) {
            if let Some(broker_id) = &o.broker_order_id {
                if let Err(e) = self.broker.cancel_order(broker_id).await {
                    warn!(trade_id = %trade.id, error = %e, "failed to cancel lingering close order");
                }
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        Ok(())
    }

    async fn close_broker_already_flat(&self, trade: &TradeRow) -> Result<ExitOutcome> {
        let lifecycle = LifecycleController::new(self.store.clone());
        let start = Utc::now() - chrono::Duration::days(7);
        let gain_loss = self.broker.get_gain_loss(start, Utc::now()).await;

        let (exit_price, realized_pnl) = match gain_loss {
            Ok(entries) if !entries.is_empty() => {
                let total: f64 = entries.iter().map(|e| e.realized_pnl).sum();
                (reconstruct_flat_exit_price(trade.entry_price, trade.quantity, total), total)
            }
            _ => (0.0, 0.0),
        };

        lifecycle
            .mark_closed(&trade.id, exit_price, Some(realized_pnl), ExitReason::BrokerAlreadyFlat, Utc::now())
            .await?;
        info!(trade_id = %trade.id, "trade closed: broker already flat");
        Ok(ExitOutcome::Closed { realized_pnl })
    }

    async fn quantity_mismatch_retry(&self, trade: &TradeRow, short_symbol: &str, long_symbol: &str) -> Result<ExitOutcome> {
        let lifecycle = LifecycleController::new(self.store.clone());
        self.cancel_open_close_orders(trade).await?;
        let positions = self.broker.get_positions().await?;
        let short_pos = positions.iter().find(|p| p.symbol == short_symbol);
        let long_pos = positions.iter().find(|p| p.symbol == long_symbol);
        let available = trade::available_quantity(
            short_pos.map(|p| p.quantity).unwrap_or(0),
            long_pos.map(|p| p.quantity).unwrap_or(0),
        );

        if available == 0 {
            return self.close_broker_already_flat(trade).await;
        }

        let legs = close_legs(trade, short_symbol, long_symbol, available);
        let req = SpreadOrderRequest {
            strategy: trade.strategy(),
            is_credit: !trade.strategy().is_credit(),
            net_price: (self.estimate_current_mark(trade).await + RETRY_SLIPPAGE).abs(),
            legs,
            client_order_id: new_id(),
        };

        match self.broker.place_spread_order(&req).await {
            Ok(report) => match self.poll_fill(&report.broker_order_id).await {
                Some(fill_price) => {
                    let realized_pnl = self.finalize_close(trade, fill_price, ExitReason::QuantityMismatch).await?;
                    Ok(ExitOutcome::Closed { realized_pnl })
                }
                None => {
                    lifecycle.mark_exit_error(&trade.id, "quantity-mismatch retry fill timed out").await?;
                    Ok(ExitOutcome::ExitError("quantity-mismatch retry fill timed out".into()))
                }
            },
            Err(_) => {
                lifecycle.mark_exit_error(&trade.id, "quantity-mismatch retry rejected again").await?;
                Ok(ExitOutcome::ExitError("rejected again after fresh-quantities retry".into()))
            }
        }
    }

    async fn single_leg_fallback(&self, trade: &TradeRow, short_symbol: &str, long_symbol: &str, available: i64) -> Result<ExitOutcome> {
        let lifecycle = LifecycleController::new(self.store.clone());
        let short_close = self
            .broker
            .place_single_leg_close_order(short_symbol, LegSide::Short, available as u32, &new_id())
            .await;
        let long_close = self
            .broker
            .place_single_leg_close_order(long_symbol, LegSide::Long, available as u32, &new_id())
            .await;

        match (short_close, long_close) {
            (Ok(s), Ok(l)) => {
                let avg = (s.avg_fill_price.unwrap_or(0.0) + l.avg_fill_price.unwrap_or(0.0)) / 2.0;
                let realized_pnl = self.finalize_close(trade, avg, ExitReason::NormalExit).await?;
                Ok(ExitOutcome::Closed { realized_pnl })
            }
            _ => {
                lifecycle.mark_exit_error(&trade.id, "single-leg fallback failed").await?;
                Ok(ExitOutcome::ExitError("single-leg fallback failed".into()))
            }
        }
    }

    async fn poll_fill(&self, broker_order_id: &str) -> Option<f64> {
        let attempts = FILL_POLL_BUDGET_SECS / FILL_POLL_INTERVAL_SECS;
        for _ in 0..attempts {
            tokio::time::sleep(std::time::Duration::from_secs(FILL_POLL_INTERVAL_SECS)).await;
            if let Ok(OrderFillOutcome::Report(r)) = self.broker.get_order_with_legs(broker_order_id).await {
                if r.status == OrderStatus::Filled {
                    return r.avg_fill_price;
                }
            }
        }
        None
    }

    async fn record_exit_order(&self, trade: &TradeRow, client_order_id: &str, broker_order_id: &str, quantity: i64) -> Result<()> {
        let order = OrderRow {
            id: new_id(),
            proposal_id: trade.proposal_id.clone(),
            trade_id: Some(trade.id.clone()),
            client_order_id: client_order_id.to_string(),
            broker_order_id: Some(broker_order_id.to_string()),
            side: "EXIT".to_string(),
            status: OrderStatus::Placed.to_string(),
            avg_fill_price: None,
            filled_quantity: 0,
            remaining_quantity: quantity,
            snapshot_id: None,
            created_at: Utc::now(),
        };
        self.store.insert_order(&order).await
    }

    async fn finalize_close(&self, trade: &TradeRow, fill_price: f64, reason: ExitReason) -> Result<f64> {
        let lifecycle = LifecycleController::new(self.store.clone());
        let exit_price = crate::broker::normalize_price(fill_price);
        let realized = trade::realized_pnl(trade.strategy(), trade.entry_price, exit_price, trade.quantity);
        lifecycle
            .mark_closed(&trade.id, exit_price, Some(realized), reason, Utc::now())
            .await?;
        Ok(realized)
    }

    /// Fresh chain-derived spread mark: midpoint-of-midpoints across both
    /// legs, signed the same way as the entry credit/debit (§4.6 step 4).
    /// Falls back to the trade's own entry price if the chain can't be read
    /// or no longer carries both strikes, rather than blocking the exit.
    async fn estimate_current_mark(&self, trade: &TradeRow) -> f64 {
        let Ok(expiration) = trade.expiration.parse::<chrono::NaiveDate>() else {
            return trade.entry_price;
        };
        let chain = match self.broker.get_option_chain(&trade.underlying, expiration, true).await {
            Ok(c) => c,
            Err(e) => {
                warn!(trade_id = %trade.id, error = %e, "exit mark: chain fetch failed, falling back to entry price");
                return trade.entry_price;
            }
        };

        trade::spread_mark_from_chain(
            &chain,
            trade.strategy().option_type(),
            trade.short_strike,
            trade.long_strike,
            trade.strategy().is_credit(),
        )
        .map(|(mark, _)| mark)
        .unwrap_or(trade.entry_price)
    }
}

/// Backs out an effective exit price from a broker-reported realized PnL
/// total when the engine discovers a trade already flat on the broker's
/// books (§4.6 step 2, BROKER_ALREADY_FLAT).
fn reconstruct_flat_exit_price(entry_price: f64, quantity: i64, gain_loss_total: f64) -> f64 {
    entry_price - gain_loss_total / quantity as f64 / 100.0
}

/// Debit spreads close with `sell_to_close` on the long leg first; credit
/// spreads close with `buy_to_close` on the short leg first (§4.6 step 3).
fn close_legs(trade: &TradeRow, short_symbol: &str, long_symbol: &str, quantity: i64) -> [SpreadLeg; 2] {
    let qty = quantity as u32;
    if trade.strategy().is_credit() {
        [
            SpreadLeg { symbol: short_symbol.to_string(), side: LegSide::Short, quantity: qty },
            SpreadLeg { symbol: long_symbol.to_string(), side: LegSide::Long, quantity: qty },
        ]
    } else {
        [
            SpreadLeg { symbol: long_symbol.to_string(), side: LegSide::Long, quantity: qty },
            SpreadLeg { symbol: short_symbol.to_string(), side: LegSide::Short, quantity: qty },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_legs_credit_leads_with_short() {
        let trade = sample_trade("BULL_PUT_CREDIT");
        let legs = close_legs(&trade, "S", "L", 1);
        assert_eq!(legs[0].symbol, "S");
    }

    #[test]
    fn close_legs_debit_leads_with_long() {
        let trade = sample_trade("BULL_CALL_DEBIT");
        let legs = close_legs(&trade, "S", "L", 1);
        assert_eq!(legs[0].symbol, "L");
    }

    #[test]
    fn reconstruct_flat_exit_price_matches_total_gain_loss() {
        // Broker reports the position already closed with total realized
        // PnL of +$120 on a 1-lot credit spread entered at 0.85/contract.
        let exit_price = reconstruct_flat_exit_price(0.85, 1, 120.0);
        assert!((exit_price - (0.85 - 1.20)).abs() < 1e-6);
    }

    fn sample_trade(strategy: &str) -> TradeRow {
        TradeRow {
            id: "t1".into(),
            proposal_id: "p1".into(),
            underlying: "SPY".into(),
            expiration: "2026-09-02".into(),
            short_strike: 485.0,
            long_strike: 480.0,
            width: 5.0,
            quantity: 1,
            strategy: strategy.into(),
            entry_price: 0.85,
            exit_price: None,
            max_profit: 85.0,
            max_loss: 415.0,
            realized_pnl: None,
            iv_entry: 0.30,
            max_seen_profit_fraction: 0.0,
            origin: "ENGINE".into(),
            managed: true,
            status: "OPEN".into(),
            exit_reason: None,
            broker_order_id_open: Some("o1".into()),
            broker_order_id_close: None,
            created_at: Utc::now(),
            opened_at: Some(Utc::now()),
            closed_at: None,
        }
    }
}
