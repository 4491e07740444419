// =============================================================================
// Persistence row types — one struct per table named in the external
// interface contract (trades, proposals, orders, portfolio_positions,
// settings, risk_state, broker_events, system_logs, account_snapshots,
// daily_summaries).
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::types::{
    ExitReason, LegSide, OptionType, OrderSide, OrderStatus, ProposalKind, ProposalStatus,
    Strategy, TradeStatus,
};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TradeRow {
    pub id: String,
    pub proposal_id: String,
    pub underlying: String,
    pub expiration: String,
    pub short_strike: f64,
    pub long_strike: f64,
    pub width: f64,
    pub quantity: i64,
    pub strategy: String,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub max_profit: f64,
    pub max_loss: f64,
    pub realized_pnl: Option<f64>,
    pub iv_entry: f64,
    pub max_seen_profit_fraction: f64,
    pub origin: String,
    pub managed: bool,
    pub status: String,
    pub exit_reason: Option<String>,
    pub broker_order_id_open: Option<String>,
    pub broker_order_id_close: Option<String>,
    pub created_at: DateTime<Utc>,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl TradeRow {
    pub fn strategy(&self) -> Strategy {
        Strategy::parse(&self.strategy).expect("persisted strategy must be valid")
    }

    pub fn status(&self) -> TradeStatus {
        match self.status.as_str() {
            "ENTRY_PENDING" => TradeStatus::EntryPending,
            "OPEN" => TradeStatus::Open,
            "CLOSING_PENDING" => TradeStatus::ClosingPending,
            "CLOSED" => TradeStatus::Closed,
            "CANCELLED" => TradeStatus::Cancelled,
            "CLOSE_FAILED" => TradeStatus::CloseFailed,
            "INVALID_STRUCTURE" => TradeStatus::InvalidStructure,
            "EXIT_ERROR" => TradeStatus::ExitError,
            other => panic!("persisted trade status {other} is not a recognized variant"),
        }
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.exit_reason.as_deref().map(|s| match s {
            "STRUCTURAL_BREAK" => ExitReason::StructuralBreak,
            "TIME_EXIT" => ExitReason::TimeExit,
            "STOP_LOSS" => ExitReason::StopLoss,
            "TRAIL_PROFIT" => ExitReason::TrailProfit,
            "PROFIT_TARGET" => ExitReason::ProfitTarget,
            "IV_CRUSH_EXIT" => ExitReason::IvCrushExit,
            "LOW_VALUE_CLOSE" => ExitReason::LowValueClose,
            "BROKER_ALREADY_FLAT" => ExitReason::BrokerAlreadyFlat,
            "QUANTITY_MISMATCH" => ExitReason::QuantityMismatch,
            "MAX_EXIT_ATTEMPTS" => ExitReason::MaxExitAttempts,
            "MANUAL_CLOSE" => ExitReason::ManualClose,
            "PHANTOM_TRADE" => ExitReason::PhantomTrade,
            "NORMAL_EXIT" => ExitReason::NormalExit,
            _ => ExitReason::Unknown,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProposalRow {
    pub id: String,
    pub underlying: String,
    pub expiration: String,
    pub short_strike: f64,
    pub long_strike: f64,
    pub width: f64,
    pub quantity: i64,
    pub strategy: String,
    pub credit_target: f64,
    pub composite_score: f64,
    pub component_scores: String, // JSON blob
    pub kind: String,
    pub linked_trade_id: Option<String>,
    pub client_order_id: Option<String>,
    pub status: String,
    pub outcome: String,
    pub created_at: DateTime<Utc>,
}

impl ProposalRow {
    pub fn strategy(&self) -> Strategy {
        Strategy::parse(&self.strategy).expect("persisted strategy must be valid")
    }

    pub fn status(&self) -> ProposalStatus {
        match self.status.as_str() {
            "READY" => ProposalStatus::Ready,
            "INVALIDATED" => ProposalStatus::Invalidated,
            "CONSUMED" => ProposalStatus::Consumed,
            other => panic!("persisted proposal status {other} is not a recognized variant"),
        }
    }

    pub fn kind(&self) -> ProposalKind {
        match self.kind.as_str() {
            "ENTRY" => ProposalKind::Entry,
            "EXIT" => ProposalKind::Exit,
            other => panic!("persisted proposal kind {other} is not a recognized variant"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrderRow {
    pub id: String,
    pub proposal_id: String,
    pub trade_id: Option<String>,
    pub client_order_id: String,
    pub broker_order_id: Option<String>,
    pub side: String,
    pub status: String,
    pub avg_fill_price: Option<f64>,
    pub filled_quantity: i64,
    pub remaining_quantity: i64,
    pub snapshot_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OrderRow {
    pub fn side(&self) -> OrderSide {
        match self.side.as_str() {
            "ENTRY" => OrderSide::Entry,
            "EXIT" => OrderSide::Exit,
            other => panic!("persisted order side {other} is not a recognized variant"),
        }
    }

    pub fn status(&self) -> OrderStatus {
        match self.status.as_str() {
            "PENDING" => OrderStatus::Pending,
            "PLACED" => OrderStatus::Placed,
            "PARTIAL" => OrderStatus::Partial,
            "FILLED" => OrderStatus::Filled,
            "CANCELLED" => OrderStatus::Cancelled,
            "REJECTED" => OrderStatus::Rejected,
            other => panic!("persisted order status {other} is not a recognized variant"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PortfolioPositionRow {
    pub broker_symbol: String,
    pub underlying: String,
    pub expiration: String,
    pub option_type: String,
    pub strike: f64,
    pub side: String,
    pub quantity: f64,
    pub cost_basis: f64,
    pub last_price: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub snapshot_id: String,
    pub updated_at: DateTime<Utc>,
}

impl PortfolioPositionRow {
    pub fn option_type(&self) -> OptionType {
        if self.option_type == "CALL" {
            OptionType::Call
        } else {
            OptionType::Put
        }
    }

    pub fn side(&self) -> LegSide {
        if self.side == "SHORT" {
            LegSide::Short
        } else {
            LegSide::Long
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SettingRow {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RiskStateRow {
    pub system_mode: String,
    pub daily_realized_pnl: f64,
    pub daily_new_trades: i64,
    pub emergency_exit_count_today: i64,
    pub current_date: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BrokerEventRow {
    pub id: String,
    pub operation: String,
    pub symbol: Option<String>,
    pub order_id: Option<String>,
    pub status_code: Option<i64>,
    pub ok: bool,
    pub duration_ms: i64,
    pub mode: String,
    pub strategy: Option<String>,
    pub error_text: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SystemLogRow {
    pub id: String,
    pub log_type: String,
    pub message: String,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AccountSnapshotRow {
    pub id: String,
    pub cash: f64,
    pub buying_power: f64,
    pub equity: f64,
    pub margin_requirement: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DailySummaryRow {
    pub trading_day: String,
    pub realized_pnl: f64,
    pub trades_opened: i64,
    pub trades_closed: i64,
    pub wins: i64,
    pub losses: i64,
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
