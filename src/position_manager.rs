//! Position Manager (C7): evaluates every streaming price update against
//! open positions' stop-loss, trailing-stop, and take-profit-tier rules,
//! and settles positions on market resolution. Grounded closely on
//! `original_source/src/execution/position_manager.py`
//! (`on_price_update`, `_close_position`, `confirm_close`,
//! `release_closing_guard`, `_partial_close`, `check_market_resolution`).

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::PositionConfig;
use crate::intent::{Discipline, Intent, IntentMetadata, Side, Urgency};
use crate::order_manager::OrderManager;
use crate::store::{Position, PositionStatus, Store};

pub struct PositionManager {
    config: PositionConfig,
    store: Store,
    order_manager: Arc<OrderManager>,
    /// Guards against a rapid run of price updates issuing the same exit
    /// twice while the order manager is still working the first one.
    closing: Mutex<HashSet<i64>>,
}

fn gross_pnl(side: Side, entry: f64, exit: f64, shares: f64) -> f64 {
    match side {
        Side::Buy => (exit - entry) * shares,
        Side::Sell => (entry - exit) * shares,
    }
}

fn pnl_pct(side: Side, entry: f64, price: f64) -> f64 {
    if entry == 0.0 {
        return 0.0;
    }
    match side {
        Side::Buy => (price - entry) / entry * 100.0,
        Side::Sell => (entry - price) / entry * 100.0,
    }
}

impl PositionManager {
    pub fn new(config: PositionConfig, store: Store, order_manager: Arc<OrderManager>) -> Self {
        Self {
            config,
            store,
            order_manager,
            closing: Mutex::new(HashSet::new()),
        }
    }

    /// Registered as the streaming client's price callback.
    pub async fn on_price_update(&self, token_id: &str, price: f64, _ts: f64) {
        let positions = match self.store.get_open_positions(None).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "on_price_update_store_read_failed");
                return;
            }
        };

        for position in positions.into_iter().filter(|p| p.token_id == token_id && p.status == PositionStatus::Open) {
            if self.closing.lock().await.contains(&position.id) {
                continue;
            }
            self.evaluate_position(position, price).await;
        }
    }

    async fn evaluate_position(&self, mut position: Position, price: f64) {
        if let Err(e) = self.store.update_position_price(position.id, price).await {
            warn!(error = %e, position_id = position.id, "update_position_price_failed");
        }
        position.current_price = price;

        let pct = pnl_pct(position.side, position.entry_price, price);

        if pct <= -self.config.stop_loss_pct {
            self.exit_position(&position, position.size, price, "stop_loss").await;
            return;
        }

        if let Some(trail) = position.trailing_stop_price {
            let hit = match position.side {
                Side::Buy => price <= trail,
                Side::Sell => price >= trail,
            };
            if hit {
                self.exit_position(&position, position.size, price, "trailing_stop").await;
                return;
            }
        }

        let tier_index = position.take_profit_triggered as usize;
        if let Some(tier) = self.config.take_profit_tiers.get(tier_index) {
            if tier.gain_pct <= pct {
                if tier.sell_pct >= 100.0 {
                    self.exit_position(&position, position.size, price, "take_profit").await;
                    return;
                }

                let sell_shares = position.size * (tier.sell_pct / 100.0);
                self.partial_exit(&position, sell_shares, price, &format!("take_profit_tier_{}", tier_index + 1)).await;

                let next_tier = tier_index as i64 + 1;
                if position.trailing_stop_price.is_none() {
                    let trail = match position.side {
                        Side::Buy => price * (1.0 - self.config.trailing_stop_pct / 100.0),
                        Side::Sell => price * (1.0 + self.config.trailing_stop_pct / 100.0),
                    };
                    if let Err(e) = self.store.update_position_trailing_stop(position.id, trail).await {
                        warn!(error = %e, "trailing_stop_init_failed");
                    }
                }
                if let Err(e) = self.store.update_position_partial_close(position.id, position.size - sell_shares, next_tier).await {
                    warn!(error = %e, "partial_close_record_failed");
                }
                return;
            }
        }

        if let Some(trail) = position.trailing_stop_price {
            if pct > 0.0 {
                let candidate = match position.side {
                    Side::Buy => price * (1.0 - self.config.trailing_stop_pct / 100.0),
                    Side::Sell => price * (1.0 + self.config.trailing_stop_pct / 100.0),
                };
                let raised = match position.side {
                    Side::Buy => candidate.max(trail),
                    Side::Sell => candidate.min(trail),
                };
                if raised != trail {
                    if let Err(e) = self.store.update_position_trailing_stop(position.id, raised).await {
                        warn!(error = %e, "trailing_stop_ratchet_failed");
                    }
                }
            }
        }
    }

    fn estimate_fees(&self, entry: f64, exit: f64, shares: f64) -> f64 {
        shares * entry * self.config.taker_fee_rate + shares * exit * self.config.taker_fee_rate
    }

    async fn partial_exit(&self, position: &Position, shares: f64, price: f64, reason: &str) {
        self.submit_exit(position, shares, price, reason).await;
    }

    async fn exit_position(&self, position: &Position, shares: f64, price: f64, reason: &str) {
        self.closing.lock().await.insert(position.id);
        if let Err(e) = self.store.set_position_closing(position.id, reason).await {
            warn!(error = %e, position_id = position.id, "set_position_closing_failed");
        }
        self.submit_exit(position, shares, price, reason).await;
    }

    async fn submit_exit(&self, position: &Position, shares: f64, price: f64, reason: &str) {
        let gross = gross_pnl(position.side, position.entry_price, price, shares);
        let fees = self.estimate_fees(position.entry_price, price, shares);
        let realized = gross - fees;

        let intent = Intent {
            strategy: position.strategy.clone(),
            market_id: position.market_id.clone(),
            token_id: position.token_id.clone(),
            side: position.side.opposite(),
            price,
            notional: shares * price,
            discipline: Discipline::ImmediateOrKill,
            urgency: Urgency::High,
            reasoning: reason.to_string(),
            metadata: IntentMetadata {
                is_exit: Some(true),
                position_id: Some(position.id),
                realized_pnl: Some(realized),
                ..Default::default()
            },
        };
        info!(position_id = position.id, reason, realized_pnl = realized, "exit_intent_submitted");
        self.order_manager.submit(intent);
    }

    /// The order manager calls this once the exit fill is confirmed.
    pub async fn confirm_close(&self, position_id: i64, realized_pnl: f64, reason: &str) {
        if let Err(e) = self.store.close_position(position_id, realized_pnl, reason).await {
            warn!(error = %e, position_id, "close_position_failed");
        }
        self.closing.lock().await.remove(&position_id);
    }

    /// Releases the in-flight-close guard without closing the position, so
    /// a later price update can retry the exit (spec §4.7: definitive exit
    /// failure after C6's retries).
    pub async fn release_closing_guard(&self, position_id: i64) {
        self.closing.lock().await.remove(&position_id);
    }

    /// Settles every open position on a resolved market at the resolution
    /// price (1.0 for the winning token, 0.0 otherwise).
    pub async fn resolve(&self, market_id: &str, winning_token_id: &str) {
        let positions = match self.store.get_open_positions(None).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, market_id, "resolve_store_read_failed");
                return;
            }
        };

        for position in positions.into_iter().filter(|p| p.market_id == market_id) {
            let won = position.token_id == winning_token_id;
            let resolution_price = match (position.side, won) {
                (Side::Buy, true) | (Side::Sell, false) => 1.0,
                _ => 0.0,
            };

            let gross = gross_pnl(position.side, position.entry_price, resolution_price, position.size);
            let entry_fee = position.size * position.entry_price * self.config.taker_fee_rate;
            let winner_fee = if gross > 0.0 { resolution_price * position.size * self.config.winner_fee_rate } else { 0.0 };
            let realized = gross - entry_fee - winner_fee;

            if let Err(e) = self.store.close_position(position.id, realized, "market_resolved").await {
                warn!(error = %e, position_id = position.id, "resolution_close_failed");
            }
            self.closing.lock().await.remove(&position.id);
            info!(position_id = position.id, realized_pnl = realized, "position_resolved");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::PaperAdapter;
    use crate::config::{OrderManagerConfig, RiskConfig, TakeProfitTier, TradingMode};
    use crate::notifier::LoggingNotifier;
    use crate::rate_limiter::RateLimiter;
    use crate::risk::RiskManager;
    use crate::wallet::PaperWallet;

    fn position_config() -> PositionConfig {
        PositionConfig {
            stop_loss_pct: 15.0,
            trailing_stop_pct: 10.0,
            take_profit_tiers: vec![
                TakeProfitTier { gain_pct: 50.0, sell_pct: 50.0 },
                TakeProfitTier { gain_pct: 100.0, sell_pct: 100.0 },
            ],
            taker_fee_rate: 0.0315,
            winner_fee_rate: 0.02,
        }
    }

    async fn build() -> (PositionManager, Store, i64) {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let risk = Arc::new(
            RiskManager::new(
                RiskConfig {
                    max_open_positions: 10,
                    max_position_pct: 100.0,
                    min_position_size_usd: 1.0,
                    daily_loss_limit_pct: 100.0,
                    min_cash_reserve_pct: 0.0,
                    min_edge_pct: 0.0,
                    strategy_allocation_cap_usd: None,
                },
                store.clone(),
                Arc::new(PaperWallet::new(100_000.0)),
            )
            .await,
        );
        let om = OrderManager::new(
            OrderManagerConfig::default(),
            TradingMode::Paper,
            risk,
            Arc::new(RateLimiter::new(100, 60.0)),
            Arc::new(PaperAdapter::new()),
            store.clone(),
            Arc::new(LoggingNotifier),
        );

        let position_id = store
            .open_position(&Position {
                id: 0,
                strategy: "mirror".to_string(),
                market_id: "m1".to_string(),
                token_id: "tok-a".to_string(),
                side: Side::Buy,
                entry_price: 0.40,
                size: 100.0,
                current_price: 0.40,
                unrealized_pnl: 0.0,
                realized_pnl: None,
                status: PositionStatus::Open,
                stop_loss_price: None,
                take_profit_triggered: 0,
                trailing_stop_price: None,
                opened_at: String::new(),
                closed_at: None,
                close_reason: None,
                metadata: serde_json::json!({}),
            })
            .await
            .unwrap();

        (PositionManager::new(position_config(), store.clone(), om), store, position_id)
    }

    #[tokio::test]
    async fn first_take_profit_tier_partial_exits_and_sets_trailing_stop() {
        let (pm, store, position_id) = build().await;
        pm.on_price_update("tok-a", 0.60, 0.0).await;

        let position = store.get_open_positions(None).await.unwrap().into_iter().find(|p| p.id == position_id).unwrap();
        assert_eq!(position.take_profit_triggered, 1);
        assert!((position.trailing_stop_price.unwrap() - 0.54).abs() < 1e-9);
        assert!((position.size - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn stop_loss_moves_position_to_closing() {
        let (pm, store, position_id) = build().await;
        pm.on_price_update("tok-a", 0.30, 0.0).await;

        let position = store.get_open_positions(None).await.unwrap().into_iter().find(|p| p.id == position_id).unwrap();
        assert_eq!(position.status, PositionStatus::Closing);
    }
}
