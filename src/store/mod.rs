//! Persistent Store (C1). SQLite via `sqlx`, grounded directly on
//! `original_source/src/core/db.py`: WAL journaling, foreign keys, 5s
//! busy-timeout, normal synchronous mode; idempotent `record_trade`;
//! OPEN/CLOSING/CLOSED position state transitions; the same table set.
//!
//! The base crate carries no DB dependency — `sqlx` is the enrichment
//! crate here (see DESIGN.md).

mod types;

pub use types::{DailyPnl, ExternalPosition, Position, PositionStatus, Trade};

use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool, Transaction};
use std::path::Path;
use std::str::FromStr;

use crate::error::{EngineError, ErrorKind};

pub type DbResult<T> = Result<T, EngineError>;

fn db_err(e: sqlx::Error) -> EngineError {
    EngineError::new(ErrorKind::Fatal, e.to_string())
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if absent) the SQLite file at `database_url` and
    /// applies the same pragmas `db.py::initialize()` sets: WAL, foreign
    /// keys on, 5s busy timeout, NORMAL synchronous.
    pub async fn connect(database_url: &str) -> DbResult<Self> {
        let path = database_url.trim_start_matches("sqlite://");
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| EngineError::new(ErrorKind::ConfigInvalid, e.to_string()))?;
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| EngineError::new(ErrorKind::ConfigInvalid, e.to_string()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        // Single-writer contract: the store is the only writer, so a pool
        // of one connection is sufficient and matches the spec's
        // single-writer-process model.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(db_err)?;

        let store = Self { pool };
        store.create_tables().await?;
        Ok(store)
    }

    async fn create_tables(&self) -> DbResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id TEXT NOT NULL UNIQUE,
                strategy TEXT NOT NULL,
                market_id TEXT NOT NULL,
                token_id TEXT NOT NULL,
                side TEXT NOT NULL,
                price REAL NOT NULL,
                size REAL NOT NULL,
                order_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'SUBMITTED',
                reasoning TEXT,
                fees REAL,
                fill_price REAL,
                fill_size REAL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                metadata TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_trades_strategy ON trades(strategy);
            CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status);
            CREATE INDEX IF NOT EXISTS idx_trades_market_id ON trades(market_id);

            CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                strategy TEXT NOT NULL,
                market_id TEXT NOT NULL,
                token_id TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price REAL NOT NULL,
                size REAL NOT NULL,
                current_price REAL NOT NULL,
                unrealized_pnl REAL NOT NULL DEFAULT 0,
                realized_pnl REAL,
                status TEXT NOT NULL DEFAULT 'OPEN',
                stop_loss_price REAL,
                take_profit_triggered INTEGER NOT NULL DEFAULT 0,
                trailing_stop_price REAL,
                opened_at TEXT NOT NULL,
                closed_at TEXT,
                close_reason TEXT,
                metadata TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status);
            CREATE INDEX IF NOT EXISTS idx_positions_strategy ON positions(strategy);

            CREATE TABLE IF NOT EXISTS daily_pnl (
                date TEXT PRIMARY KEY,
                starting_balance REAL NOT NULL DEFAULT 0,
                ending_balance REAL,
                realized_pnl REAL NOT NULL DEFAULT 0,
                unrealized_pnl REAL NOT NULL DEFAULT 0,
                trade_count INTEGER NOT NULL DEFAULT 0,
                wins INTEGER NOT NULL DEFAULT 0,
                losses INTEGER NOT NULL DEFAULT 0,
                fees_paid REAL NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS strategy_state (
                name TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS external_positions (
                account TEXT NOT NULL,
                market_id TEXT NOT NULL,
                token_id TEXT NOT NULL,
                size REAL NOT NULL,
                avg_cost REAL,
                last_seen_at TEXT NOT NULL,
                PRIMARY KEY (account, market_id, token_id)
            );
            CREATE INDEX IF NOT EXISTS idx_external_positions_account ON external_positions(account);

            CREATE TABLE IF NOT EXISTS bot_metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// BEGIN IMMEDIATE; commits on `tx.commit()`, rolls back on drop
    /// (covers every error exit path without explicit handling).
    pub async fn transaction(&self) -> DbResult<Transaction<'_, sqlx::Sqlite>> {
        self.pool.begin().await.map_err(db_err)
    }

    // --- trades ---------------------------------------------------------

    /// Idempotent on `order_id` (spec §3, §8 invariant 4 / S2).
    pub async fn record_trade(&self, trade: &Trade) -> DbResult<i64> {
        let mut tx = self.transaction().await?;
        let id = Self::record_trade_tx(&mut tx, trade).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(id)
    }

    pub async fn record_trade_tx(tx: &mut Transaction<'_, sqlx::Sqlite>, trade: &Trade) -> DbResult<i64> {
        let now = Utc::now().to_rfc3339();
        let metadata = trade.metadata.to_string();
        let result = sqlx::query(
            r#"INSERT OR IGNORE INTO trades
               (order_id, strategy, market_id, token_id, side, price, size, order_type, status, reasoning, created_at, updated_at, metadata)
               VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?)"#,
        )
        .bind(&trade.order_id)
        .bind(&trade.strategy)
        .bind(&trade.market_id)
        .bind(&trade.token_id)
        .bind(trade.side.as_str())
        .bind(trade.price)
        .bind(trade.size)
        .bind(&trade.order_type)
        .bind(&trade.status)
        .bind(&trade.reasoning)
        .bind(&now)
        .bind(&now)
        .bind(&metadata)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;

        if result.rows_affected() > 0 {
            return Ok(result.last_insert_rowid());
        }

        // order_id already existed: return the existing row id (idempotent).
        let row = sqlx::query("SELECT id FROM trades WHERE order_id = ?")
            .bind(&trade.order_id)
            .fetch_one(&mut **tx)
            .await
            .map_err(db_err)?;
        Ok(row.get::<i64, _>("id"))
    }

    /// Trade history, most recent first (`original_source/src/core/db.py`'s
    /// `get_trades`).
    pub async fn get_trades(&self, strategy: Option<&str>, limit: i64) -> DbResult<Vec<Trade>> {
        let rows = match strategy {
            Some(s) => sqlx::query("SELECT * FROM trades WHERE strategy = ? ORDER BY created_at DESC LIMIT ?")
                .bind(s)
                .bind(limit)
                .fetch_all(&self.pool)
                .await,
            None => sqlx::query("SELECT * FROM trades ORDER BY created_at DESC LIMIT ?")
                .bind(limit)
                .fetch_all(&self.pool)
                .await,
        }
        .map_err(db_err)?;
        rows.iter().map(types::trade_from_row).collect()
    }

    // --- positions --------------------------------------------------------

    pub async fn open_position(&self, position: &Position) -> DbResult<i64> {
        let mut tx = self.transaction().await?;
        let id = Self::open_position_tx(&mut tx, position).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(id)
    }

    /// Used by the order manager to open a position in the same transaction
    /// as the trade that funded it (spec §4.6 step 6).
    pub async fn open_position_tx(tx: &mut Transaction<'_, sqlx::Sqlite>, position: &Position) -> DbResult<i64> {
        let now = Utc::now().to_rfc3339();
        let metadata = position.metadata.to_string();
        let result = sqlx::query(
            r#"INSERT INTO positions
               (strategy, market_id, token_id, side, entry_price, size, current_price,
                unrealized_pnl, status, stop_loss_price, take_profit_triggered, opened_at, metadata)
               VALUES (?,?,?,?,?,?,?,0,'OPEN',?,0,?,?)"#,
        )
        .bind(&position.strategy)
        .bind(&position.market_id)
        .bind(&position.token_id)
        .bind(position.side.as_str())
        .bind(position.entry_price)
        .bind(position.size)
        .bind(position.entry_price)
        .bind(position.stop_loss_price)
        .bind(&now)
        .bind(&metadata)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(result.last_insert_rowid())
    }

    /// OPEN -> CLOSING only (spec §4.1).
    pub async fn set_position_closing(&self, position_id: i64, reason: &str) -> DbResult<()> {
        sqlx::query("UPDATE positions SET status = 'CLOSING', close_reason = ? WHERE id = ? AND status = 'OPEN'")
            .bind(reason)
            .bind(position_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// OPEN or CLOSING -> CLOSED.
    pub async fn close_position(&self, position_id: i64, realized_pnl: f64, reason: &str) -> DbResult<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"UPDATE positions SET status = 'CLOSED', realized_pnl = ?, close_reason = ?, closed_at = ?
               WHERE id = ? AND status IN ('OPEN', 'CLOSING')"#,
        )
        .bind(realized_pnl)
        .bind(reason)
        .bind(&now)
        .bind(position_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn update_position_price(&self, position_id: i64, current_price: f64) -> DbResult<()> {
        let row = sqlx::query("SELECT side, entry_price, size FROM positions WHERE id = ?")
            .bind(position_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        let Some(row) = row else { return Ok(()) };
        let side: String = row.get("side");
        let entry_price: f64 = row.get("entry_price");
        let size: f64 = row.get("size");
        let unrealized = if side == "BUY" {
            (current_price - entry_price) * size
        } else {
            (entry_price - current_price) * size
        };
        sqlx::query("UPDATE positions SET current_price = ?, unrealized_pnl = ? WHERE id = ?")
            .bind(current_price)
            .bind(unrealized)
            .bind(position_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn update_position_trailing_stop(&self, position_id: i64, price: f64) -> DbResult<()> {
        sqlx::query("UPDATE positions SET trailing_stop_price = ? WHERE id = ?")
            .bind(price)
            .bind(position_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn update_position_partial_close(&self, position_id: i64, remaining_shares: f64, tier: i64) -> DbResult<()> {
        sqlx::query("UPDATE positions SET size = ?, take_profit_triggered = ? WHERE id = ?")
            .bind(remaining_shares)
            .bind(tier)
            .bind(position_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn count_open_positions(&self, strategy: Option<&str>) -> DbResult<i64> {
        let row = match strategy {
            Some(s) => sqlx::query("SELECT COUNT(*) AS n FROM positions WHERE status IN ('OPEN','CLOSING') AND strategy = ?")
                .bind(s)
                .fetch_one(&self.pool)
                .await,
            None => sqlx::query("SELECT COUNT(*) AS n FROM positions WHERE status IN ('OPEN','CLOSING')")
                .fetch_one(&self.pool)
                .await,
        }
        .map_err(db_err)?;
        Ok(row.get("n"))
    }

    pub async fn get_open_positions(&self, strategy: Option<&str>) -> DbResult<Vec<Position>> {
        let rows = match strategy {
            Some(s) => sqlx::query("SELECT * FROM positions WHERE status IN ('OPEN','CLOSING') AND strategy = ?")
                .bind(s)
                .fetch_all(&self.pool)
                .await,
            None => sqlx::query("SELECT * FROM positions WHERE status IN ('OPEN','CLOSING')")
                .fetch_all(&self.pool)
                .await,
        }
        .map_err(db_err)?;
        rows.iter().map(types::position_from_row).collect()
    }

    /// Any open position (OPEN or CLOSING) on this market, across all
    /// strategies (spec §4.5 step 7: one market, one live position).
    pub async fn has_live_position_on_market(&self, market_id: &str) -> DbResult<bool> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM positions WHERE status IN ('OPEN','CLOSING') AND market_id = ?")
            .bind(market_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        let n: i64 = row.get("n");
        Ok(n > 0)
    }

    pub async fn get_closed_positions(&self, strategy: Option<&str>) -> DbResult<Vec<Position>> {
        let rows = match strategy {
            Some(s) => sqlx::query("SELECT * FROM positions WHERE status = 'CLOSED' AND strategy = ?")
                .bind(s)
                .fetch_all(&self.pool)
                .await,
            None => sqlx::query("SELECT * FROM positions WHERE status = 'CLOSED'")
                .fetch_all(&self.pool)
                .await,
        }
        .map_err(db_err)?;
        rows.iter().map(types::position_from_row).collect()
    }

    pub async fn get_today_realized_pnl(&self) -> DbResult<f64> {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let row = sqlx::query(
            "SELECT COALESCE(SUM(realized_pnl), 0.0) AS total FROM positions WHERE status = 'CLOSED' AND closed_at >= ?",
        )
        .bind(&today)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.get("total"))
    }

    // --- metadata ---------------------------------------------------------

    pub async fn set_metadata(&self, key: &str, value: &str) -> DbResult<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"INSERT INTO bot_metadata (key, value, updated_at) VALUES (?, ?, ?)
               ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at"#,
        )
        .bind(key)
        .bind(value)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn get_metadata(&self, key: &str) -> DbResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM bot_metadata WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| r.get("value")))
    }

    // --- strategy state -----------------------------------------------------

    pub async fn save_strategy_state(&self, name: &str, state: &Value) -> DbResult<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"INSERT INTO strategy_state (name, state, updated_at) VALUES (?, ?, ?)
               ON CONFLICT(name) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at"#,
        )
        .bind(name)
        .bind(state.to_string())
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn load_strategy_state(&self, name: &str) -> DbResult<Option<Value>> {
        let row = sqlx::query("SELECT state FROM strategy_state WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.and_then(|r| serde_json::from_str(&r.get::<String, _>("state")).ok()))
    }

    // --- external (mirror) positions -----------------------------------------

    pub async fn upsert_external_position(&self, p: &ExternalPosition) -> DbResult<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"INSERT INTO external_positions (account, market_id, token_id, size, avg_cost, last_seen_at)
               VALUES (?,?,?,?,?,?)
               ON CONFLICT(account, market_id, token_id) DO UPDATE SET
                 size = excluded.size, avg_cost = excluded.avg_cost, last_seen_at = excluded.last_seen_at"#,
        )
        .bind(&p.account)
        .bind(&p.market_id)
        .bind(&p.token_id)
        .bind(p.size)
        .bind(p.avg_cost)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn get_external_positions(&self, account: &str) -> DbResult<Vec<ExternalPosition>> {
        let rows = sqlx::query("SELECT * FROM external_positions WHERE account = ?")
            .bind(account)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(types::external_position_from_row).collect())
    }

    pub async fn delete_external_position(&self, account: &str, market_id: &str, token_id: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM external_positions WHERE account = ? AND market_id = ? AND token_id = ?")
            .bind(account)
            .bind(market_id)
            .bind(token_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    // --- daily pnl ----------------------------------------------------------

    pub async fn update_daily_pnl_end_of_day(&self, pnl: &DailyPnl) -> DbResult<()> {
        sqlx::query(
            r#"INSERT INTO daily_pnl (date, starting_balance, ending_balance, realized_pnl, unrealized_pnl, trade_count, wins, losses, fees_paid)
               VALUES (?,?,?,?,?,?,?,?,?)
               ON CONFLICT(date) DO UPDATE SET
                 ending_balance = excluded.ending_balance, realized_pnl = excluded.realized_pnl,
                 unrealized_pnl = excluded.unrealized_pnl, trade_count = excluded.trade_count,
                 wins = excluded.wins, losses = excluded.losses, fees_paid = excluded.fees_paid"#,
        )
        .bind(&pnl.date)
        .bind(pnl.starting_balance)
        .bind(pnl.ending_balance)
        .bind(pnl.realized_pnl)
        .bind(pnl.unrealized_pnl)
        .bind(pnl.trade_count)
        .bind(pnl.wins)
        .bind(pnl.losses)
        .bind(pnl.fees_paid)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::Side;

    async fn memory_store() -> Store {
        Store::connect("sqlite::memory:").await.unwrap()
    }

    fn sample_trade() -> Trade {
        Trade {
            order_id: "ord-1".into(),
            strategy: "s".into(),
            market_id: "m".into(),
            token_id: "t".into(),
            side: Side::Buy,
            price: 0.40,
            size: 25.0,
            order_type: "GTC".into(),
            status: "SUBMITTED".into(),
            reasoning: None,
            metadata: Value::Null,
        }
    }

    // S2 — idempotent trade record.
    #[tokio::test]
    async fn record_trade_is_idempotent() {
        let store = memory_store().await;
        let id1 = store.record_trade(&sample_trade()).await.unwrap();
        let id2 = store.record_trade(&sample_trade()).await.unwrap();
        assert_eq!(id1, id2);

        let row = sqlx::query("SELECT COUNT(*) AS n FROM trades")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        let n: i64 = row.get("n");
        assert_eq!(n, 1);
    }

    #[tokio::test]
    async fn position_lifecycle_transitions() {
        let store = memory_store().await;
        let pos_id = store
            .open_position(&Position {
                id: 0,
                strategy: "s".into(),
                market_id: "m".into(),
                token_id: "t".into(),
                side: Side::Buy,
                entry_price: 0.4,
                size: 100.0,
                current_price: 0.4,
                unrealized_pnl: 0.0,
                realized_pnl: None,
                status: PositionStatus::Open,
                stop_loss_price: None,
                take_profit_triggered: 0,
                trailing_stop_price: None,
                opened_at: String::new(),
                closed_at: None,
                close_reason: None,
                metadata: Value::Null,
            })
            .await
            .unwrap();

        let open = store.get_open_positions(None).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].status, PositionStatus::Open);

        store.set_position_closing(pos_id, "stop_loss").await.unwrap();
        let open = store.get_open_positions(None).await.unwrap();
        assert_eq!(open[0].status, PositionStatus::Closing);

        store.close_position(pos_id, -4.0, "stop_loss").await.unwrap();
        let open = store.get_open_positions(None).await.unwrap();
        assert!(open.is_empty());

        let closed = store.get_closed_positions(None).await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].realized_pnl, Some(-4.0));
    }

    #[tokio::test]
    async fn one_live_position_per_market_query() {
        let store = memory_store().await;
        assert!(!store.has_live_position_on_market("m").await.unwrap());
        store
            .open_position(&Position {
                id: 0,
                strategy: "s".into(),
                market_id: "m".into(),
                token_id: "t".into(),
                side: Side::Buy,
                entry_price: 0.4,
                size: 10.0,
                current_price: 0.4,
                unrealized_pnl: 0.0,
                realized_pnl: None,
                status: PositionStatus::Open,
                stop_loss_price: None,
                take_profit_triggered: 0,
                trailing_stop_price: None,
                opened_at: String::new(),
                closed_at: None,
                close_reason: None,
                metadata: Value::Null,
            })
            .await
            .unwrap();
        assert!(store.has_live_position_on_market("m").await.unwrap());
    }

    #[tokio::test]
    async fn metadata_roundtrip() {
        let store = memory_store().await;
        assert_eq!(store.get_metadata("risk.kill_switch_active").await.unwrap(), None);
        store.set_metadata("risk.kill_switch_active", "1").await.unwrap();
        assert_eq!(
            store.get_metadata("risk.kill_switch_active").await.unwrap(),
            Some("1".to_string())
        );
        store.set_metadata("risk.kill_switch_active", "0").await.unwrap();
        assert_eq!(
            store.get_metadata("risk.kill_switch_active").await.unwrap(),
            Some("0".to_string())
        );
    }
}
