//! In-memory paper-trading adapter, grounded on `original_source`'s
//! `_execute_signal` paper branch and the base crate's `dry_run` handling in
//! `executor.rs::handle_place_bid` (synthesize a fake order id, no network
//! call).

use async_trait::async_trait;
use std::sync::Mutex;
use uuid::Uuid;

use super::{ExchangeAdapter, ExternalPositionView, Market, MarketFilter, OrderResult, OrderView};
use crate::intent::{Discipline, Side};

pub struct PaperAdapter {
    open_orders: Mutex<Vec<OrderView>>,
}

impl Default for PaperAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperAdapter {
    pub fn new() -> Self {
        Self {
            open_orders: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ExchangeAdapter for PaperAdapter {
    async fn list_markets(&self, _filter: MarketFilter) -> eyre::Result<Vec<Market>> {
        Ok(Vec::new())
    }

    async fn get_market(&self, _market_id: &str) -> eyre::Result<Option<Market>> {
        Ok(None)
    }

    async fn best_bid_ask(&self, _token_id: &str) -> eyre::Result<(Option<f64>, Option<f64>)> {
        Ok((None, None))
    }

    async fn last_price(&self, _token_id: &str) -> eyre::Result<Option<f64>> {
        Ok(None)
    }

    async fn submit_order(
        &self,
        token_id: &str,
        side: Side,
        price: f64,
        _size_shares: f64,
        discipline: Discipline,
        _expiration: Option<i64>,
    ) -> eyre::Result<OrderResult> {
        let order_id = format!("paper-{}", &Uuid::new_v4().simple().to_string()[..12]);
        // RESTING paper orders stay "open" until explicitly cancelled so
        // fill-confirmation tests can exercise the not-filled path; IOK/
        // partial-ok orders are treated as immediately filled.
        if matches!(discipline, Discipline::Resting) {
            self.open_orders.lock().unwrap().push(OrderView {
                order_id: order_id.clone(),
                market_id: String::new(),
                token_id: token_id.to_string(),
                price,
                side,
            });
        }
        Ok(OrderResult::success(order_id))
    }

    async fn cancel_order(&self, order_id: &str) -> eyre::Result<bool> {
        let mut orders = self.open_orders.lock().unwrap();
        let before = orders.len();
        orders.retain(|o| o.order_id != order_id);
        Ok(orders.len() < before)
    }

    async fn cancel_all_orders(&self) -> eyre::Result<bool> {
        self.open_orders.lock().unwrap().clear();
        Ok(true)
    }

    async fn list_open_orders(&self) -> eyre::Result<Vec<OrderView>> {
        Ok(self.open_orders.lock().unwrap().clone())
    }

    async fn list_external_positions(&self, _account_id: &str) -> eyre::Result<Vec<ExternalPositionView>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn immediate_or_kill_orders_are_not_tracked_as_open() {
        let adapter = PaperAdapter::new();
        let result = adapter
            .submit_order("tok", Side::Buy, 0.5, 10.0, Discipline::ImmediateOrKill, None)
            .await
            .unwrap();
        assert!(result.ok);
        assert!(adapter.list_open_orders().await.unwrap().is_empty());
    }
}
