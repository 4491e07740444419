// =============================================================================
// Broker Gateway — stateless wrapper over the broker HTTP API
// =============================================================================

mod audit;
mod client;

pub use audit::AuditCounters;
pub use client::BrokerClient;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{LegSide, OptionType, OrderStatus, Strategy};

/// Typed failure taxonomy at the broker boundary (§7.1). Converted to
/// `anyhow::Error` by every caller above the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("broker request timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("broker returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("broker rejected the request: {0}")]
    Rejected(String),
    #[error("failed to parse broker response: {0}")]
    Parse(String),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl GatewayError {
    /// 5xx and timeouts are retried by the caller; everything else is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Timeout(_))
            || matches!(self, GatewayError::Http { status, .. } if *status >= 500)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub last: f64,
    pub bid: f64,
    pub ask: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainLeg {
    pub symbol: String,
    pub strike: f64,
    pub option_type: OptionType,
    pub bid: f64,
    pub ask: f64,
    pub delta: Option<f64>,
    pub iv: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct SpreadLeg {
    pub symbol: String,
    pub side: LegSide,
    pub quantity: u32,
}

#[derive(Debug, Clone)]
pub struct SpreadOrderRequest {
    pub strategy: Strategy,
    pub is_credit: bool,
    pub net_price: f64,
    pub legs: [SpreadLeg; 2],
    pub client_order_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderReport {
    pub broker_order_id: String,
    pub status: OrderStatus,
    pub filled_quantity: u32,
    pub requested_quantity: u32,
    pub avg_fill_price: Option<f64>,
    pub rejection_text: Option<String>,
}

/// Result of `get_order_with_legs` when the fill is neither zero nor
/// complete. The partial-fill open question (SPEC_FULL.md §9) resolves to
/// surfacing this rather than attempting leg-level reconciliation.
#[derive(Debug, Clone)]
pub enum OrderFillOutcome {
    Report(OrderReport),
    PartialFillUnsupported { filled: u32, requested: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub quantity: i64,
    pub avg_price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balances {
    pub cash: f64,
    pub buying_power: f64,
    pub equity: f64,
    pub margin_requirement: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GainLossEntry {
    pub symbol: String,
    pub realized_pnl: f64,
    pub closed_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyClose {
    pub date: chrono::NaiveDate,
    pub close: f64,
}

/// Normalizes a broker-reported fill price to a positive magnitude.
/// Credit spreads may report avg_fill_price as negative; everywhere else in
/// the engine treats price as an unsigned magnitude (§9 Design Notes).
pub fn normalize_price(raw: f64) -> f64 {
    raw.abs()
}
