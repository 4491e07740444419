// =============================================================================
// Shared types used across the spread trading engine
// =============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;

/// Trading mode. Determines whether the engine places real broker orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    DryRun,
    SandboxPaper,
    Live,
}

impl Default for TradingMode {
    fn default() -> Self {
        TradingMode::DryRun
    }
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TradingMode::DryRun => "DRY_RUN",
            TradingMode::SandboxPaper => "SANDBOX_PAPER",
            TradingMode::Live => "LIVE",
        };
        write!(f, "{s}")
    }
}

impl TradingMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DRY_RUN" => Some(TradingMode::DryRun),
            "SANDBOX_PAPER" => Some(TradingMode::SandboxPaper),
            "LIVE" => Some(TradingMode::Live),
            _ => None,
        }
    }

    /// Whether this mode is allowed to place real broker orders at all.
    pub fn places_orders(&self) -> bool {
        !matches!(self, TradingMode::DryRun)
    }
}

/// System-wide trading gate, derived by the risk engine each cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemMode {
    Normal,
    HardStop,
    Cooldown,
}

impl Default for SystemMode {
    fn default() -> Self {
        SystemMode::HardStop
    }
}

impl fmt::Display for SystemMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SystemMode::Normal => "NORMAL",
            SystemMode::HardStop => "HARD_STOP",
            SystemMode::Cooldown => "COOLDOWN",
        };
        write!(f, "{s}")
    }
}

/// The five supported vertical-spread strategies. Strike relationship and
/// option type are both a function of this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    BullPutCredit,
    BearCallCredit,
    BullCallDebit,
    BearPutDebit,
    IronCondor,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Strategy::BullPutCredit => "BULL_PUT_CREDIT",
            Strategy::BearCallCredit => "BEAR_CALL_CREDIT",
            Strategy::BullCallDebit => "BULL_CALL_DEBIT",
            Strategy::BearPutDebit => "BEAR_PUT_DEBIT",
            Strategy::IronCondor => "IRON_CONDOR",
        };
        write!(f, "{s}")
    }
}

impl Strategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BULL_PUT_CREDIT" => Some(Strategy::BullPutCredit),
            "BEAR_CALL_CREDIT" => Some(Strategy::BearCallCredit),
            "BULL_CALL_DEBIT" => Some(Strategy::BullCallDebit),
            "BEAR_PUT_DEBIT" => Some(Strategy::BearPutDebit),
            "IRON_CONDOR" => Some(Strategy::IronCondor),
            _ => None,
        }
    }

    /// CALL for call-strategies, PUT otherwise. An iron condor is modeled as
    /// two independent `Trade` rows (a put-side credit leg pair and a
    /// call-side credit leg pair) sharing the same proposal family, so it
    /// resolves to PUT here and the call side is the companion trade's own
    /// `BearCallCredit`-shaped strikes.
    pub fn option_type(&self) -> OptionType {
        match self {
            Strategy::BearCallCredit | Strategy::BullCallDebit => OptionType::Call,
            Strategy::BullPutCredit | Strategy::BearPutDebit | Strategy::IronCondor => {
                OptionType::Put
            }
        }
    }

    pub fn is_credit(&self) -> bool {
        matches!(
            self,
            Strategy::BullPutCredit | Strategy::BearCallCredit | Strategy::IronCondor
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionType {
    Call,
    Put,
}

impl fmt::Display for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", if *self == OptionType::Call { "CALL" } else { "PUT" })
    }
}

/// Side of a leg within a spread, signed per broker convention (short < 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LegSide {
    Short,
    Long,
}

/// Trade lifecycle status. The Lifecycle Controller is the sole writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    EntryPending,
    Open,
    ClosingPending,
    Closed,
    Cancelled,
    CloseFailed,
    InvalidStructure,
    ExitError,
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TradeStatus::EntryPending => "ENTRY_PENDING",
            TradeStatus::Open => "OPEN",
            TradeStatus::ClosingPending => "CLOSING_PENDING",
            TradeStatus::Closed => "CLOSED",
            TradeStatus::Cancelled => "CANCELLED",
            TradeStatus::CloseFailed => "CLOSE_FAILED",
            TradeStatus::InvalidStructure => "INVALID_STRUCTURE",
            TradeStatus::ExitError => "EXIT_ERROR",
        };
        write!(f, "{s}")
    }
}

impl TradeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TradeStatus::Closed | TradeStatus::Cancelled | TradeStatus::InvalidStructure
        )
    }
}

/// Why a closed/invalidated trade ended up that way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StructuralBreak,
    TimeExit,
    StopLoss,
    TrailProfit,
    ProfitTarget,
    IvCrushExit,
    LowValueClose,
    BrokerAlreadyFlat,
    QuantityMismatch,
    MaxExitAttempts,
    ManualClose,
    PhantomTrade,
    NormalExit,
    Unknown,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::StructuralBreak => "STRUCTURAL_BREAK",
            ExitReason::TimeExit => "TIME_EXIT",
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::TrailProfit => "TRAIL_PROFIT",
            ExitReason::ProfitTarget => "PROFIT_TARGET",
            ExitReason::IvCrushExit => "IV_CRUSH_EXIT",
            ExitReason::LowValueClose => "LOW_VALUE_CLOSE",
            ExitReason::BrokerAlreadyFlat => "BROKER_ALREADY_FLAT",
            ExitReason::QuantityMismatch => "QUANTITY_MISMATCH",
            ExitReason::MaxExitAttempts => "MAX_EXIT_ATTEMPTS",
            ExitReason::ManualClose => "MANUAL_CLOSE",
            ExitReason::PhantomTrade => "PHANTOM_TRADE",
            ExitReason::NormalExit => "NORMAL_EXIT",
            ExitReason::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

/// Proposal lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalStatus {
    Ready,
    Invalidated,
    Consumed,
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProposalStatus::Ready => "READY",
            ProposalStatus::Invalidated => "INVALIDATED",
            ProposalStatus::Consumed => "CONSUMED",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalKind {
    Entry,
    Exit,
}

/// What ultimately happened to a proposal, surfaced to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalOutcome {
    Pending,
    Filled,
    Rejected,
    Invalidated,
    NotAttempted,
}

impl fmt::Display for ProposalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProposalOutcome::Pending => "PENDING",
            ProposalOutcome::Filled => "FILLED",
            ProposalOutcome::Rejected => "REJECTED",
            ProposalOutcome::Invalidated => "INVALIDATED",
            ProposalOutcome::NotAttempted => "NOT_ATTEMPTED",
        };
        write!(f, "{s}")
    }
}

/// Order side relative to the trade it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Entry,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Placed,
    Partial,
    Filled,
    Cancelled,
    Rejected,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Placed => "PLACED",
            OrderStatus::Partial => "PARTIAL",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Rejected => "REJECTED",
        };
        write!(f, "{s}")
    }
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}
