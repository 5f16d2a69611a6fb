use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{db_err, DbResult};
use crate::intent::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
}

impl PositionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PositionStatus::Open => "OPEN",
            PositionStatus::Closing => "CLOSING",
            PositionStatus::Closed => "CLOSED",
        }
    }

    fn parse(s: &str) -> PositionStatus {
        match s {
            "CLOSING" => PositionStatus::Closing,
            "CLOSED" => PositionStatus::Closed,
            _ => PositionStatus::Open,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Trade {
    pub order_id: String,
    pub strategy: String,
    pub market_id: String,
    pub token_id: String,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub order_type: String,
    pub status: String,
    pub reasoning: Option<String>,
    pub metadata: Value,
}

pub fn trade_from_row(row: &SqliteRow) -> DbResult<Trade> {
    let side_str: String = row.try_get("side").map_err(db_err)?;
    let metadata_str: Option<String> = row.try_get("metadata").map_err(db_err)?;
    Ok(Trade {
        order_id: row.try_get("order_id").map_err(db_err)?,
        strategy: row.try_get("strategy").map_err(db_err)?,
        market_id: row.try_get("market_id").map_err(db_err)?,
        token_id: row.try_get("token_id").map_err(db_err)?,
        side: if side_str == "BUY" { Side::Buy } else { Side::Sell },
        price: row.try_get("price").map_err(db_err)?,
        size: row.try_get("size").map_err(db_err)?,
        order_type: row.try_get("order_type").map_err(db_err)?,
        status: row.try_get("status").map_err(db_err)?,
        reasoning: row.try_get("reasoning").map_err(db_err)?,
        metadata: metadata_str
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(Value::Null),
    })
}

#[derive(Debug, Clone)]
pub struct Position {
    pub id: i64,
    pub strategy: String,
    pub market_id: String,
    pub token_id: String,
    pub side: Side,
    pub entry_price: f64,
    pub size: f64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: Option<f64>,
    pub status: PositionStatus,
    pub stop_loss_price: Option<f64>,
    pub take_profit_triggered: i64,
    pub trailing_stop_price: Option<f64>,
    pub opened_at: String,
    pub closed_at: Option<String>,
    pub close_reason: Option<String>,
    pub metadata: Value,
}

pub fn position_from_row(row: &SqliteRow) -> DbResult<Position> {
    let side_str: String = row.try_get("side").map_err(db_err)?;
    let status_str: String = row.try_get("status").map_err(db_err)?;
    let metadata_str: Option<String> = row.try_get("metadata").map_err(db_err)?;
    Ok(Position {
        id: row.try_get("id").map_err(db_err)?,
        strategy: row.try_get("strategy").map_err(db_err)?,
        market_id: row.try_get("market_id").map_err(db_err)?,
        token_id: row.try_get("token_id").map_err(db_err)?,
        side: if side_str == "BUY" { Side::Buy } else { Side::Sell },
        entry_price: row.try_get("entry_price").map_err(db_err)?,
        size: row.try_get("size").map_err(db_err)?,
        current_price: row.try_get("current_price").map_err(db_err)?,
        unrealized_pnl: row.try_get("unrealized_pnl").map_err(db_err)?,
        realized_pnl: row.try_get("realized_pnl").map_err(db_err)?,
        status: PositionStatus::parse(&status_str),
        stop_loss_price: row.try_get("stop_loss_price").map_err(db_err)?,
        take_profit_triggered: row.try_get("take_profit_triggered").map_err(db_err)?,
        trailing_stop_price: row.try_get("trailing_stop_price").map_err(db_err)?,
        opened_at: row.try_get("opened_at").map_err(db_err)?,
        closed_at: row.try_get("closed_at").map_err(db_err)?,
        close_reason: row.try_get("close_reason").map_err(db_err)?,
        metadata: metadata_str
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(Value::Null),
    })
}

#[derive(Debug, Clone)]
pub struct ExternalPosition {
    pub account: String,
    pub market_id: String,
    pub token_id: String,
    pub size: f64,
    pub avg_cost: Option<f64>,
    pub last_seen_at: String,
}

pub fn external_position_from_row(row: &SqliteRow) -> ExternalPosition {
    ExternalPosition {
        account: row.get("account"),
        market_id: row.get("market_id"),
        token_id: row.get("token_id"),
        size: row.get("size"),
        avg_cost: row.get("avg_cost"),
        last_seen_at: row.get("last_seen_at"),
    }
}

#[derive(Debug, Clone)]
pub struct DailyPnl {
    pub date: String,
    pub starting_balance: f64,
    pub ending_balance: Option<f64>,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub trade_count: i64,
    pub wins: i64,
    pub losses: i64,
    pub fees_paid: f64,
}
