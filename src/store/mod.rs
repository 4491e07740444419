// =============================================================================
// Persistence Layer — typed sqlite-backed store
// =============================================================================
//
// Every write the rest of the engine performs against durable state goes
// through this struct. No other module opens a connection or writes SQL.
// Mirrors the teacher's convention of one concrete owner type per concern
// (`RiskEngine`, `PositionManager`) rather than a trait object: there is
// exactly one kind of store this process ever talks to.
// =============================================================================

pub mod models;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::info;

pub use models::*;

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .with_context(|| format!("failed to open sqlite pool at {database_url}"))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run database migrations")?;
        info!(database_url, "persistence layer connected and migrated");
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    // -- settings -------------------------------------------------------

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row: Option<SettingRow> =
            sqlx::query_as("SELECT key, value FROM settings WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|r| r.value))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -- trades -----------------------------------------------------------

    pub async fn insert_trade(&self, t: &TradeRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO trades (id, proposal_id, underlying, expiration, short_strike,
                long_strike, width, quantity, strategy, entry_price, exit_price, max_profit,
                max_loss, realized_pnl, iv_entry, max_seen_profit_fraction, origin, managed,
                status, exit_reason, broker_order_id_open, broker_order_id_close, created_at,
                opened_at, closed_at)
             VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(&t.id)
        .bind(&t.proposal_id)
        .bind(&t.underlying)
        .bind(&t.expiration)
        .bind(t.short_strike)
        .bind(t.long_strike)
        .bind(t.width)
        .bind(t.quantity)
        .bind(&t.strategy)
        .bind(t.entry_price)
        .bind(t.exit_price)
        .bind(t.max_profit)
        .bind(t.max_loss)
        .bind(t.realized_pnl)
        .bind(t.iv_entry)
        .bind(t.max_seen_profit_fraction)
        .bind(&t.origin)
        .bind(t.managed)
        .bind(&t.status)
        .bind(&t.exit_reason)
        .bind(&t.broker_order_id_open)
        .bind(&t.broker_order_id_close)
        .bind(t.created_at)
        .bind(t.opened_at)
        .bind(t.closed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_trade(&self, t: &TradeRow) -> Result<()> {
        sqlx::query(
            "UPDATE trades SET quantity=?, exit_price=?, max_profit=?, max_loss=?,
                realized_pnl=?, max_seen_profit_fraction=?, status=?, exit_reason=?,
                broker_order_id_open=?, broker_order_id_close=?, opened_at=?, closed_at=?
             WHERE id = ?",
        )
        .bind(t.quantity)
        .bind(t.exit_price)
        .bind(t.max_profit)
        .bind(t.max_loss)
        .bind(t.realized_pnl)
        .bind(t.max_seen_profit_fraction)
        .bind(&t.status)
        .bind(&t.exit_reason)
        .bind(&t.broker_order_id_open)
        .bind(&t.broker_order_id_close)
        .bind(t.opened_at)
        .bind(t.closed_at)
        .bind(&t.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_trade(&self, id: &str) -> Result<Option<TradeRow>> {
        let row = sqlx::query_as("SELECT * FROM trades WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn open_trades(&self) -> Result<Vec<TradeRow>> {
        let rows = sqlx::query_as("SELECT * FROM trades WHERE status = 'OPEN'")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn trades_by_status(&self, status: &str) -> Result<Vec<TradeRow>> {
        let rows = sqlx::query_as("SELECT * FROM trades WHERE status = ?")
            .bind(status)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }


    // -- proposals --------------------------------------------------------

    pub async fn insert_proposal(&self, p: &ProposalRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO proposals (id, underlying, expiration, short_strike, long_strike,
                width, quantity, strategy, credit_target, composite_score, component_scores,
                kind, linked_trade_id, client_order_id, status, outcome, created_at)
             VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(&p.id)
        .bind(&p.underlying)
        .bind(&p.expiration)
        .bind(p.short_strike)
        .bind(p.long_strike)
        .bind(p.width)
        .bind(p.quantity)
        .bind(&p.strategy)
        .bind(p.credit_target)
        .bind(p.composite_score)
        .bind(&p.component_scores)
        .bind(&p.kind)
        .bind(&p.linked_trade_id)
        .bind(&p.client_order_id)
        .bind(&p.status)
        .bind(&p.outcome)
        .bind(p.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_proposal_status(&self, id: &str, status: &str, outcome: &str) -> Result<()> {
        sqlx::query("UPDATE proposals SET status = ?, outcome = ? WHERE id = ?")
            .bind(status)
            .bind(outcome)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn ready_proposals(&self) -> Result<Vec<ProposalRow>> {
        let rows = sqlx::query_as("SELECT * FROM proposals WHERE status = 'READY'")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn get_proposal(&self, id: &str) -> Result<Option<ProposalRow>> {
        let row = sqlx::query_as("SELECT * FROM proposals WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn outstanding_proposal(
        &self,
        underlying: &str,
        expiration: &str,
        strategy: &str,
    ) -> Result<Option<ProposalRow>> {
        let row = sqlx::query_as(
            "SELECT * FROM proposals WHERE underlying = ? AND expiration = ? AND strategy = ?
             AND status = 'READY'",
        )
        .bind(underlying)
        .bind(expiration)
        .bind(strategy)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    // -- orders -------------------------------------------------------------

    pub async fn insert_order(&self, o: &OrderRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO orders (id, proposal_id, trade_id, client_order_id, broker_order_id,
                side, status, avg_fill_price, filled_quantity, remaining_quantity, snapshot_id,
                created_at)
             VALUES (?,?,?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(&o.id)
        .bind(&o.proposal_id)
        .bind(&o.trade_id)
        .bind(&o.client_order_id)
        .bind(&o.broker_order_id)
        .bind(&o.side)
        .bind(&o.status)
        .bind(o.avg_fill_price)
        .bind(o.filled_quantity)
        .bind(o.remaining_quantity)
        .bind(&o.snapshot_id)
        .bind(o.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_order(&self, o: &OrderRow) -> Result<()> {
        sqlx::query(
            "UPDATE orders SET broker_order_id=?, status=?, avg_fill_price=?, filled_quantity=?,
                remaining_quantity=? WHERE id = ?",
        )
        .bind(&o.broker_order_id)
        .bind(&o.status)
        .bind(o.avg_fill_price)
        .bind(o.filled_quantity)
        .bind(o.remaining_quantity)
        .bind(&o.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn orders_for_trade(&self, trade_id: &str) -> Result<Vec<OrderRow>> {
        let rows = sqlx::query_as("SELECT * FROM orders WHERE trade_id = ?")
            .bind(trade_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn order_by_broker_id(&self, broker_order_id: &str) -> Result<Option<OrderRow>> {
        let row = sqlx::query_as("SELECT * FROM orders WHERE broker_order_id = ?")
            .bind(broker_order_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Tagged entry orders that reached the broker, for the sync engine's
    /// `broker_order_id_open` backfill (§4.8): joined against `proposals`
    /// in the caller rather than here, matching the store's plain-query
    /// convention over ad hoc multi-table joins.
    pub async fn entry_orders_with_broker_id(&self) -> Result<Vec<OrderRow>> {
        let rows = sqlx::query_as(
            "SELECT * FROM orders WHERE side = 'ENTRY' AND broker_order_id IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn count_orders_for_proposal(&self, proposal_id: &str) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM orders WHERE proposal_id = ?")
            .bind(proposal_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }

    // -- portfolio mirror -----------------------------------------------------

    pub async fn replace_portfolio_positions(&self, rows: &[PortfolioPositionRow]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM portfolio_positions")
            .execute(&mut *tx)
            .await?;
        for r in rows {
            sqlx::query(
                "INSERT INTO portfolio_positions (broker_symbol, underlying, expiration,
                    option_type, strike, side, quantity, cost_basis, last_price, bid, ask,
                    snapshot_id, updated_at)
                 VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?)",
            )
            .bind(&r.broker_symbol)
            .bind(&r.underlying)
            .bind(&r.expiration)
            .bind(&r.option_type)
            .bind(r.strike)
            .bind(&r.side)
            .bind(r.quantity)
            .bind(r.cost_basis)
            .bind(r.last_price)
            .bind(r.bid)
            .bind(r.ask)
            .bind(&r.snapshot_id)
            .bind(r.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn portfolio_positions(&self) -> Result<Vec<PortfolioPositionRow>> {
        let rows = sqlx::query_as("SELECT * FROM portfolio_positions")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    // -- audit / logs ---------------------------------------------------------

    pub async fn record_broker_event(&self, e: &BrokerEventRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO broker_events (id, operation, symbol, order_id, status_code, ok,
                duration_ms, mode, strategy, error_text, created_at)
             VALUES (?,?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(&e.id)
        .bind(&e.operation)
        .bind(&e.symbol)
        .bind(&e.order_id)
        .bind(e.status_code)
        .bind(e.ok)
        .bind(e.duration_ms)
        .bind(&e.mode)
        .bind(&e.strategy)
        .bind(&e.error_text)
        .bind(e.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn log_system_event(&self, log_type: &str, message: &str, details: Option<&str>) -> Result<()> {
        let row = SystemLogRow {
            id: new_id(),
            log_type: log_type.to_string(),
            message: message.to_string(),
            details: details.map(str::to_string),
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO system_logs (id, log_type, message, details, created_at)
             VALUES (?,?,?,?,?)",
        )
        .bind(&row.id)
        .bind(&row.log_type)
        .bind(&row.message)
        .bind(&row.details)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_account_snapshot(&self, s: &AccountSnapshotRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO account_snapshots (id, cash, buying_power, equity, margin_requirement,
                created_at) VALUES (?,?,?,?,?,?)",
        )
        .bind(&s.id)
        .bind(s.cash)
        .bind(s.buying_power)
        .bind(s.equity)
        .bind(s.margin_requirement)
        .bind(s.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_daily_summary(&self, s: &DailySummaryRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO daily_summaries (trading_day, realized_pnl, trades_opened,
                trades_closed, wins, losses) VALUES (?,?,?,?,?,?)
             ON CONFLICT(trading_day) DO UPDATE SET
                realized_pnl = excluded.realized_pnl,
                trades_opened = excluded.trades_opened,
                trades_closed = excluded.trades_closed,
                wins = excluded.wins,
                losses = excluded.losses",
        )
        .bind(&s.trading_day)
        .bind(s.realized_pnl)
        .bind(s.trades_opened)
        .bind(s.trades_closed)
        .bind(s.wins)
        .bind(s.losses)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -- risk state -----------------------------------------------------------

    pub async fn get_risk_state(&self) -> Result<Option<RiskStateRow>> {
        let row = sqlx::query_as("SELECT * FROM risk_state WHERE rowid = 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn save_risk_state(&self, r: &RiskStateRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO risk_state (rowid, system_mode, daily_realized_pnl, daily_new_trades,
                emergency_exit_count_today, current_date) VALUES (1,?,?,?,?,?)
             ON CONFLICT(rowid) DO UPDATE SET
                system_mode = excluded.system_mode,
                daily_realized_pnl = excluded.daily_realized_pnl,
                daily_new_trades = excluded.daily_new_trades,
                emergency_exit_count_today = excluded.emergency_exit_count_today,
                current_date = excluded.current_date",
        )
        .bind(&r.system_mode)
        .bind(r.daily_realized_pnl)
        .bind(r.daily_new_trades)
        .bind(r.emergency_exit_count_today)
        .bind(&r.current_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
