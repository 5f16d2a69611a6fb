//! Exchange Adapter (C3): uniform contract for market discovery, order-book
//! reads, order submit/cancel, and external-account position reads.
//!
//! Grounded on the base crate's `Executor` (`polymarket::executor`, wrapping
//! `polymarket_client_sdk::ClobClient` with post-only order placement and
//! open-order tracking) and `gamma_http::GammaClient` (market discovery via
//! the Gamma API). Any operation that could block is `async` here and
//! expected to be backed by `reqwest`/the SDK's own async client, so no
//! caller ever needs to reach for `spawn_blocking` directly.

mod clob;
mod paper;

pub use clob::ClobAdapter;
pub use paper::PaperAdapter;

use async_trait::async_trait;

use crate::intent::{Discipline, Side};

#[derive(Debug, Clone)]
pub struct Market {
    pub market_id: String,
    pub question: String,
    pub yes_token_id: String,
    pub no_token_id: String,
    pub yes_price: Option<f64>,
    pub no_price: Option<f64>,
    pub volume: f64,
    pub liquidity: f64,
    pub active: bool,
    pub closed: bool,
    pub resolved: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MarketFilter {
    pub limit: Option<u32>,
    pub active: Option<bool>,
    pub category: Option<String>,
    pub min_volume: Option<f64>,
    pub min_liquidity: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct OrderResult {
    pub ok: bool,
    pub order_id: Option<String>,
    pub error: Option<String>,
    pub raw: Option<serde_json::Value>,
}

impl OrderResult {
    pub fn success(order_id: impl Into<String>) -> Self {
        Self {
            ok: true,
            order_id: Some(order_id.into()),
            error: None,
            raw: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            order_id: None,
            error: Some(error.into()),
            raw: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderView {
    pub order_id: String,
    pub market_id: String,
    pub token_id: String,
    pub price: f64,
    pub side: Side,
}

#[derive(Debug, Clone)]
pub struct ExternalPositionView {
    pub market_id: String,
    pub token_id: String,
    pub size: f64,
    pub avg_cost: f64,
}

/// Engine-side contract (spec §6). Implementations must never block the
/// calling task; HTTP/signing implementations satisfy this by being `async`
/// over a non-blocking client.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn list_markets(&self, filter: MarketFilter) -> eyre::Result<Vec<Market>>;
    async fn get_market(&self, market_id: &str) -> eyre::Result<Option<Market>>;
    async fn best_bid_ask(&self, token_id: &str) -> eyre::Result<(Option<f64>, Option<f64>)>;
    async fn last_price(&self, token_id: &str) -> eyre::Result<Option<f64>>;

    async fn submit_order(
        &self,
        token_id: &str,
        side: Side,
        price: f64,
        size_shares: f64,
        discipline: Discipline,
        expiration: Option<i64>,
    ) -> eyre::Result<OrderResult>;

    async fn cancel_order(&self, order_id: &str) -> eyre::Result<bool>;
    async fn cancel_all_orders(&self) -> eyre::Result<bool>;
    async fn list_open_orders(&self) -> eyre::Result<Vec<OrderView>>;

    async fn list_external_positions(&self, account_id: &str) -> eyre::Result<Vec<ExternalPositionView>>;
}
