// =============================================================================
// Entry Engine — turns a READY proposal into a filled or rejected trade
// =============================================================================
//
// Grounded on the teacher's `execution.rs`: the `ExecutionResult` enum and
// its demo/live dispatch split are generalized here to the six-step
// staleness/risk/drift/structure/submit/poll sequence of §4.4. Dry-run
// mode still logs the decision and never calls the gateway, matching the
// teacher's demo-mode simulation path.
// =============================================================================

use anyhow::Result;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use std::sync::Arc;

use crate::broker::{BrokerClient, OrderFillOutcome, OrderReport, SpreadLeg, SpreadOrderRequest};
use crate::config::Settings;
use crate::lifecycle::LifecycleController;
use crate::notify::{NotificationSink, NotifyEvent};
use crate::risk::{ExposureState, RiskEngine};
use crate::store::{new_id, OrderRow, ProposalRow, Store, TradeRow};
use crate::types::{LegSide, OrderStatus, TradeStatus, TradingMode};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EntryOutcome {
    Filled { trade_id: String },
    Rejected { reason: String },
    Invalidated { reason: String },
    DryRunLogged,
}

pub struct EntryEngine {
    store: Store,
    broker: BrokerClient,
    sink: Arc<dyn NotificationSink>,
}

impl EntryEngine {
    pub fn new(store: Store, broker: BrokerClient, sink: Arc<dyn NotificationSink>) -> Self {
        Self { store, broker, sink }
    }

    pub async fn process(
        &self,
        proposal: &ProposalRow,
        mode: TradingMode,
        risk: &RiskEngine,
        exposure: ExposureState,
    ) -> Result<EntryOutcome> {
        let settings = Settings::new(&self.store);
        let lifecycle = LifecycleController::new(self.store.clone());

        // Step 1: staleness.
        let max_age = settings.proposal_max_age_seconds().await;
        let age = Utc::now() - proposal.created_at;
        if age > Duration::seconds(max_age) {
            self.store
                .update_proposal_status(&proposal.id, "INVALIDATED", "INVALIDATED")
                .await?;
            info!(proposal_id = %proposal.id, age_secs = age.num_seconds(), "proposal invalidated: stale");
            return Ok(EntryOutcome::Invalidated { reason: "stale proposal".into() });
        }

        // Step 2: risk gates.
        let min_score = settings.min_score(mode).await;
        if proposal.composite_score < min_score {
            return self.invalidate(proposal, "below per-mode min_score").await;
        }
        let max_loss = estimate_max_loss(proposal);
        if let Err(reason) = risk.can_open_new_trade(max_loss, exposure) {
            return self.invalidate(proposal, &reason).await;
        }

        // Step 3: fresh re-validation (price drift).
        let tolerate_missing_greeks = matches!(mode, TradingMode::SandboxPaper);
        let expiration: chrono::NaiveDate = proposal.expiration.parse()?;
        let chain = self
            .broker
            .get_option_chain(&proposal.underlying, expiration, tolerate_missing_greeks)
            .await?;

        let short_leg = chain.iter().find(|l| (l.strike - proposal.short_strike).abs() < 1e-6);
        let long_leg = chain.iter().find(|l| (l.strike - proposal.long_strike).abs() < 1e-6);
        let (Some(short_leg), Some(long_leg)) = (short_leg, long_leg) else {
            return self.invalidate(proposal, "strikes no longer present in chain").await;
        };

        let fresh_credit = if proposal.strategy().is_credit() {
            short_leg.bid - long_leg.ask
        } else {
            long_leg.ask - short_leg.bid
        };
        let drift = (fresh_credit - proposal.credit_target).abs() / proposal.credit_target.abs().max(0.01);
        let tolerance = settings.price_drift_tolerance().await;
        if drift > tolerance {
            return self.invalidate(proposal, "price drift exceeds tolerance").await;
        }

        // Step 4: structure check (both legs present, already confirmed above).
        if !crate::trade::strikes_consistent(
            proposal.strategy(),
            proposal.short_strike,
            proposal.long_strike,
            proposal.width,
        ) {
            return self.invalidate(proposal, "strike relationship invalid for strategy/width").await;
        }

        if !mode.places_orders() {
            self.store
                .update_proposal_status(&proposal.id, "CONSUMED", "NOT_ATTEMPTED")
                .await?;
            info!(proposal_id = %proposal.id, "dry run: entry decision logged, no order placed");
            return Ok(EntryOutcome::DryRunLogged);
        }

        // Step 5: order submission.
        let client_order_id = new_id();
        let trade_id = new_id();
        let quantity = proposal.quantity;

        let trade_row = TradeRow {
            id: trade_id.clone(),
            proposal_id: proposal.id.clone(),
            underlying: proposal.underlying.clone(),
            expiration: proposal.expiration.clone(),
            short_strike: proposal.short_strike,
            long_strike: proposal.long_strike,
            width: proposal.width,
            quantity,
            strategy: proposal.strategy.clone(),
            entry_price: crate::trade::normalize_entry_price(fresh_credit),
            exit_price: None,
            max_profit: estimate_max_profit(proposal, fresh_credit),
            max_loss,
            realized_pnl: None,
            iv_entry: short_leg.iv.unwrap_or(0.0),
            max_seen_profit_fraction: 0.0,
            origin: "ENGINE".to_string(),
            managed: true,
            status: TradeStatus::EntryPending.to_string(),
            exit_reason: None,
            broker_order_id_open: None,
            broker_order_id_close: None,
            created_at: Utc::now(),
            opened_at: None,
            closed_at: None,
        };
        self.store.insert_trade(&trade_row).await?;

        let order_row = OrderRow {
            id: new_id(),
            proposal_id: proposal.id.clone(),
            trade_id: Some(trade_id.clone()),
            client_order_id: client_order_id.clone(),
            broker_order_id: None,
            side: "ENTRY".to_string(),
            status: OrderStatus::Pending.to_string(),
            avg_fill_price: None,
            filled_quantity: 0,
            remaining_quantity: quantity,
            snapshot_id: None,
            created_at: Utc::now(),
        };
        self.store.insert_order(&order_row).await?;
        self.store.update_proposal_status(&proposal.id, "CONSUMED", "PENDING").await?;

        let req = SpreadOrderRequest {
            strategy: proposal.strategy(),
            is_credit: proposal.strategy().is_credit(),
            net_price: fresh_credit.abs(),
            legs: [
                SpreadLeg { symbol: short_leg.symbol.clone(), side: LegSide::Short, quantity: quantity as u32 },
                SpreadLeg { symbol: long_leg.symbol.clone(), side: LegSide::Long, quantity: quantity as u32 },
            ],
            client_order_id: client_order_id.clone(),
        };

        let report = match self.broker.place_spread_order(&req).await {
            Ok(r) => r,
            Err(e) => {
                warn!(trade_id = %trade_id, error = %e, "order submission failed");
                lifecycle.cancel_entry(&trade_id).await?;
                return Ok(EntryOutcome::Rejected { reason: e.to_string() });
            }
        };

        let mut order_row = order_row;
        order_row.broker_order_id = Some(report.broker_order_id.clone());
        self.store.update_order(&order_row).await?;

        self.sink
            .notify(NotifyEvent::EntrySubmitted { trade_id: trade_id.clone(), underlying: proposal.underlying.clone() })
            .await;

        // Step 6: fill tracking.
        self.poll_and_finalize(&trade_id, &report, &lifecycle).await
    }

    async fn poll_and_finalize(
        &self,
        trade_id: &str,
        initial: &OrderReport,
        lifecycle: &LifecycleController,
    ) -> Result<EntryOutcome> {
        let mut report = initial.clone();

        // Benign rejection reasons (market closed, after-hours) are soft
        // failures, never hard errors, per §4.4 step 6.
        const BENIGN_REJECTIONS: &[&str] = &["market closed", "after-hours", "outside trading hours"];

        for _ in 0..10 {
            match report.status {
                OrderStatus::Filled => {
                    lifecycle.mark_open(trade_id, Utc::now()).await?;
                    return Ok(EntryOutcome::Filled { trade_id: trade_id.to_string() });
                }
                OrderStatus::Rejected | OrderStatus::Cancelled => {
                    lifecycle.cancel_entry(trade_id).await?;
                    let text = report.rejection_text.clone().unwrap_or_default();
                    let soft = BENIGN_REJECTIONS.iter().any(|b| text.to_lowercase().contains(b));
                    if soft {
                        info!(trade_id, reason = %text, "entry order rejected for a benign reason");
                    } else {
                        warn!(trade_id, reason = %text, "entry order rejected");
                    }
                    return Ok(EntryOutcome::Rejected { reason: text });
                }
                _ => {
                    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                    if let Ok(OrderFillOutcome::Report(r)) =
                        self.broker.get_order_with_legs(&report.broker_order_id).await
                    {
                        report = r;
                    }
                }
            }
        }

        warn!(trade_id, "entry fill poll budget exhausted, leaving ENTRY_PENDING for next cycle");
        Ok(EntryOutcome::Rejected { reason: "fill poll timed out".into() })
    }

    async fn invalidate(&self, proposal: &ProposalRow, reason: &str) -> Result<EntryOutcome> {
        self.store
            .update_proposal_status(&proposal.id, "INVALIDATED", "INVALIDATED")
            .await?;
        info!(proposal_id = %proposal.id, reason, "proposal invalidated");
        Ok(EntryOutcome::Invalidated { reason: reason.to_string() })
    }
}

fn estimate_max_loss(p: &ProposalRow) -> f64 {
    if p.strategy().is_credit() {
        (p.width - p.credit_target) * p.quantity as f64 * 100.0
    } else {
        p.credit_target * p.quantity as f64 * 100.0
    }
}

fn estimate_max_profit(p: &ProposalRow, net_price: f64) -> f64 {
    if p.strategy().is_credit() {
        net_price * p.quantity as f64 * 100.0
    } else {
        (p.width - net_price) * p.quantity as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_max_loss_credit_is_width_minus_credit() {
        let p = sample_proposal(true, 0.85, 5.0, 1);
        assert!((estimate_max_loss(&p) - 415.0).abs() < 1e-6);
    }

    #[test]
    fn estimate_max_loss_debit_is_debit_paid() {
        let p = sample_proposal(false, 1.20, 5.0, 2);
        assert!((estimate_max_loss(&p) - 240.0).abs() < 1e-6);
    }

    fn sample_proposal(credit: bool, price: f64, width: f64, qty: i64) -> ProposalRow {
        ProposalRow {
            id: "p1".into(),
            underlying: "SPY".into(),
            expiration: "2026-09-02".into(),
            short_strike: 485.0,
            long_strike: 480.0,
            width,
            quantity: qty,
            strategy: if credit { "BULL_PUT_CREDIT" } else { "BULL_CALL_DEBIT" }.into(),
            credit_target: price,
            composite_score: 0.80,
            component_scores: "[]".into(),
            kind: "ENTRY".into(),
            linked_trade_id: None,
            client_order_id: None,
            status: "READY".into(),
            outcome: "PENDING".into(),
            created_at: Utc::now(),
        }
    }
}
