//! Shared data model: `Side`, `Discipline`, `Intent`, `IntentMetadata`.
//!
//! Mirrors the shape of `polymarket::types::Side`/`OrderAction` in the base
//! crate, generalized from the coordinator's single pair-trade scope to the
//! full intent/order/position model spec.md §3 describes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Discipline {
    Resting,
    ImmediateOrKill,
    ImmediatePartialOk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Urgency {
    Normal,
    High,
}

/// Known metadata keys per spec §9, plus an untyped tail for anything else.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_exit: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arb_pair_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arb_leg: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arb_rollback_token_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arb_rollback_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arb_rollback_notional: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_question: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yes_token_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_token_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realized_pnl: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl IntentMetadata {
    pub fn is_exit(&self) -> bool {
        self.is_exit.unwrap_or(false)
    }
}

/// A strategy-emitted trading intent, pre-risk-gate (spec §3). Immutable
/// once constructed; the order manager owns it from `submit` onward.
#[derive(Debug, Clone)]
pub struct Intent {
    pub strategy: String,
    pub market_id: String,
    pub token_id: String,
    pub side: Side,
    pub price: f64,
    /// Notional in quote currency. The engine never carries a shares field
    /// on Intent — see DESIGN.md Open Question resolution #1.
    pub notional: f64,
    pub discipline: Discipline,
    pub urgency: Urgency,
    pub reasoning: String,
    pub metadata: IntentMetadata,
}

impl Intent {
    pub fn is_valid(&self) -> bool {
        self.notional > 0.0 && self.price > 0.0 && self.price < 1.0
    }

    pub fn shares(&self) -> f64 {
        self.notional / self.price
    }
}
