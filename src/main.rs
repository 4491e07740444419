// =============================================================================
// Spread Engine — Main Entry Point
// =============================================================================
//
// Boots the persistence layer, broker gateway, and risk engine, then hands
// off to the three cycle schedulers (§4.7). The engine starts in whatever
// `TRADING_MODE` the environment/settings table gives it — there is no
// forced-safe-mode override here the way the teacher forces Demo+Paused,
// since `DRY_RUN` is already the safe default recognized by every
// mode-gated call site.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod app_state;
mod broker;
mod clock;
mod config;
mod cycles;
mod entry;
mod exit;
mod lifecycle;
mod notify;
mod proposal;
mod risk;
mod scoring;
mod store;
mod sync;
mod trade;
mod types;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::broker::BrokerClient;
use crate::config::Settings;
use crate::cycles::CycleRunner;
use crate::notify::LoggingSink;
use crate::risk::{RiskEngine, RiskLimits};
use crate::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("spread engine starting up");

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://spread_engine.db".to_string());
    let store = Store::connect(&database_url).await?;

    let broker_base_url = std::env::var("BROKER_BASE_URL").unwrap_or_else(|_| "https://sandbox.broker.example".to_string());
    let bearer_token = std::env::var("BROKER_BEARER_TOKEN").unwrap_or_default();
    let account_id = std::env::var("BROKER_ACCOUNT_ID").unwrap_or_default();
    let mode = std::env::var("TRADING_MODE").unwrap_or_else(|_| "DRY_RUN".to_string());

    let broker = BrokerClient::new(broker_base_url, bearer_token, account_id, store.clone(), mode.clone());

    info!(trading_mode = %mode, "trading mode configured");

    let settings = Settings::new(&store);
    let limits = RiskLimits {
        daily_max_loss: settings.daily_max_loss().await,
        daily_max_new_risk: settings.daily_max_new_risk().await,
        max_trade_loss_dollars: settings.max_trade_loss_dollars().await,
        underlying_max_risk: settings.underlying_max_risk().await,
        expiry_max_risk: settings.expiry_max_risk().await,
        max_open_spreads_global: settings.max_open_spreads_global().await,
        max_open_spreads_per_symbol: settings.max_open_spreads_per_symbol().await,
        max_new_trades_per_day: settings.max_new_trades_per_day().await,
    };
    let persisted_risk_state = store.get_risk_state().await?;
    let risk = Arc::new(RiskEngine::from_state(limits, persisted_risk_state));

    let sink = Arc::new(LoggingSink::new(store.clone()));
    let state = Arc::new(AppState::new(store, broker, risk, sink));

    let runner = Arc::new(CycleRunner::new(state));
    let handles = runner.spawn_all();

    info!("trade cycle, monitor cycle, orphan cleanup, and daily summary scheduled. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping cycle schedulers");
    for h in handles {
        h.abort();
    }

    info!("spread engine shut down complete");
    Ok(())
}
