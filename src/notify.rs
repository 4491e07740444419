// =============================================================================
// Notification Sink — best-effort, non-blocking event delivery
// =============================================================================
//
// Grounded on the alert severity/category split in the monitoring crates in
// the example pack (info/warning/error tiers, category tags on every event)
// but scoped down to the single write-only channel named for this engine: a
// trading-event feed, not a full alert manager with rate limiting or
// auto-resolve. Delivery never blocks or fails the trading path — a
// `NotificationSink` that can't reach its destination logs and moves on.
// =============================================================================

use async_trait::async_trait;
use tracing::{info, warn};

use crate::store::Store;

/// Severity of a notification, mirroring the tiers operators expect from a
/// chat feed: most events are informational, failures are warnings, nothing
/// in the trading path currently needs to escalate further than that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifySeverity {
    Info,
    Warning,
}

impl NotifySeverity {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARN",
        }
    }
}

/// The trading-lifecycle events this engine emits (§6 Outbound notifications).
#[derive(Debug, Clone)]
pub enum NotifyEvent {
    ProposalCreated { underlying: String, strategy: String, composite_score: f64 },
    EntrySubmitted { trade_id: String, underlying: String },
    EntryFilled { trade_id: String, underlying: String, entry_price: f64 },
    ExitSubmitted { trade_id: String, reason: String },
    ExitFilled { trade_id: String, realized_pnl: f64 },
    DailySummary { trading_day: String, realized_pnl: f64, trades_closed: i64, wins: i64, losses: i64 },
}

impl NotifyEvent {
    fn severity(&self) -> NotifySeverity {
        NotifySeverity::Info
    }

    fn message(&self) -> String {
        match self {
            Self::ProposalCreated { underlying, strategy, composite_score } => {
                format!("proposal created: {underlying} {strategy} score={composite_score:.1}")
            }
            Self::EntrySubmitted { trade_id, underlying } => {
                format!("entry submitted: {trade_id} ({underlying})")
            }
            Self::EntryFilled { trade_id, underlying, entry_price } => {
                format!("entry filled: {trade_id} ({underlying}) @ {entry_price:.2}")
            }
            Self::ExitSubmitted { trade_id, reason } => {
                format!("exit submitted: {trade_id} reason={reason}")
            }
            Self::ExitFilled { trade_id, realized_pnl } => {
                format!("exit filled: {trade_id} pnl={realized_pnl:.2}")
            }
            Self::DailySummary { trading_day, realized_pnl, trades_closed, wins, losses } => {
                format!(
                    "daily summary {trading_day}: pnl={realized_pnl:.2} closed={trades_closed} wins={wins} losses={losses}"
                )
            }
        }
    }
}

/// A destination for trading-lifecycle events. Implementations must not
/// propagate failures into the trading path — `notify` takes `&self` and
/// returns nothing, matching the "best-effort" requirement.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, event: NotifyEvent);
}

/// Logs every event via `tracing` and mirrors it into `system_logs` for
/// later audit. The only concrete sink this crate ships — a chat/webhook
/// backend is an external system out of scope.
pub struct LoggingSink {
    store: Store,
}

impl LoggingSink {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl NotificationSink for LoggingSink {
    async fn notify(&self, event: NotifyEvent) {
        let message = event.message();
        match event.severity() {
            NotifySeverity::Info => info!(target: "notify", "{}", message),
            NotifySeverity::Warning => warn!(target: "notify", "{}", message),
        }

        let log_type = format!("NOTIFY_{}", event.severity().as_str());
        if let Err(e) = self.store.log_system_event(&log_type, &message, None).await {
            warn!(error = %e, "failed to persist notification to system log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_filled_message_includes_price() {
        let event = NotifyEvent::EntryFilled {
            trade_id: "t1".to_string(),
            underlying: "SPY".to_string(),
            entry_price: 1.45,
        };
        assert_eq!(event.message(), "entry filled: t1 (SPY) @ 1.45");
    }

    #[test]
    fn daily_summary_message_includes_counts() {
        let event = NotifyEvent::DailySummary {
            trading_day: "2026-08-01".to_string(),
            realized_pnl: 120.0,
            trades_closed: 3,
            wins: 2,
            losses: 1,
        };
        assert_eq!(
            event.message(),
            "daily summary 2026-08-01: pnl=120.00 closed=3 wins=2 losses=1"
        );
    }
}
