//! Risk Manager (C5): the gate every intent passes through before
//! execution. Grounded on `original_source/src/execution/risk_manager.py`'s
//! `RiskManager`, with one deliberate behavioral change: a wallet-balance
//! read failure fails *closed* here (the original swallows the exception
//! and lets the trade through "don't block on RPC issues" — this crate
//! treats an unknown portfolio value as zero, which rejects on the cash
//! reserve check below).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use tracing::{info, warn};

use crate::config::RiskConfig;
use crate::intent::Intent;
use crate::store::Store;
use crate::wallet::Wallet;

const KILL_SWITCH_KEY: &str = "risk.kill_switch_active";

/// Lets the risk manager drain the order queue on kill switch without
/// holding a reference back to the order manager itself (see DESIGN.md:
/// cyclic references between risk and order manager).
#[async_trait::async_trait]
pub trait QueueDrainer: Send + Sync {
    async fn drain_and_cancel_all(&self);
}

pub struct RiskManager {
    config: RiskConfig,
    store: Store,
    wallet: Arc<dyn Wallet>,
    drainer: std::sync::Mutex<Option<Arc<dyn QueueDrainer>>>,
    kill_switch: AtomicBool,
    trading_halted: AtomicBool,
    daily_loss_halt: AtomicBool,
}

impl RiskManager {
    /// Loads the kill switch's last-known state from the store so a crash
    /// mid-halt doesn't silently resume trading.
    pub async fn new(config: RiskConfig, store: Store, wallet: Arc<dyn Wallet>) -> Self {
        let kill_switch = store
            .get_metadata(KILL_SWITCH_KEY)
            .await
            .ok()
            .flatten()
            .map(|v| v == "1")
            .unwrap_or(false);
        Self {
            config,
            store,
            wallet,
            drainer: std::sync::Mutex::new(None),
            kill_switch: AtomicBool::new(kill_switch),
            trading_halted: AtomicBool::new(false),
            daily_loss_halt: AtomicBool::new(false),
        }
    }

    /// Wired in once, after the order manager exists (breaks the
    /// construction-order cycle between the two).
    pub fn set_queue_drainer(&self, drainer: Arc<dyn QueueDrainer>) {
        *self.drainer.lock().unwrap() = Some(drainer);
    }

    pub async fn approve(&self, intent: &Intent) -> (bool, String) {
        if self.kill_switch.load(Ordering::SeqCst) {
            return (false, "Kill switch active".to_string());
        }
        if self.trading_halted.load(Ordering::SeqCst) {
            return (false, "Trading halted".to_string());
        }
        if self.daily_loss_halt.load(Ordering::SeqCst) {
            return (false, "Daily loss limit reached".to_string());
        }

        let portfolio_value = match self.portfolio_value().await {
            Some(v) => v,
            None => {
                warn!("portfolio_value_unknown_failing_closed");
                0.0
            }
        };

        let daily_pnl = match self.store.get_today_realized_pnl().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "daily_pnl_read_failed");
                0.0
            }
        };
        if portfolio_value > 0.0 {
            let daily_loss_pct = (daily_pnl.abs() / portfolio_value) * 100.0;
            if daily_pnl < 0.0 && daily_loss_pct >= self.config.daily_loss_limit_pct {
                self.daily_loss_halt.store(true, Ordering::SeqCst);
                warn!(daily_pnl, limit_pct = self.config.daily_loss_limit_pct, "daily_loss_limit_reached");
                return (
                    false,
                    format!("Daily loss limit: {daily_loss_pct:.1}% >= {}%", self.config.daily_loss_limit_pct),
                );
            }
        }

        let open_count = match self.store.count_open_positions(None).await {
            Ok(n) => n,
            Err(_) => return (false, "Position count unavailable".to_string()),
        };
        if open_count >= self.config.max_open_positions as i64 {
            return (
                false,
                format!("Max open positions reached: {open_count}/{}", self.config.max_open_positions),
            );
        }

        if !intent.metadata.is_exit() {
            match self.store.has_live_position_on_market(&intent.market_id).await {
                Ok(true) => return (false, format!("Market already has a live position: {}", intent.market_id)),
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, "live_position_check_failed_closed");
                    return (false, "Live position check unavailable".to_string());
                }
            }
        }

        if portfolio_value > 0.0 {
            let position_pct = (intent.notional / portfolio_value) * 100.0;
            if position_pct > self.config.max_position_pct {
                return (false, format!("Position size too large: {position_pct:.1}% > {}%", self.config.max_position_pct));
            }
        }

        if intent.notional < self.config.min_position_size_usd {
            return (
                false,
                format!("Position below min size: ${:.2} < ${}", intent.notional, self.config.min_position_size_usd),
            );
        }

        if let Some(cap) = self.config.strategy_allocation_cap_usd {
            if cap > 0.0 {
                let exposure = match self.store.get_open_positions(Some(&intent.strategy)).await {
                    Ok(positions) => positions.iter().map(|p| p.entry_price * p.size).sum::<f64>(),
                    Err(_) => 0.0,
                };
                if exposure + intent.notional > cap {
                    return (
                        false,
                        format!("Strategy allocation exceeded: ${:.0} > ${cap:.0}", exposure + intent.notional),
                    );
                }
            }
        }

        match self.wallet.quote_balance().await {
            Ok(balance) => {
                let balance = balance.to_f64().unwrap_or(0.0);
                let min_reserve = portfolio_value * (self.config.min_cash_reserve_pct / 100.0);
                if balance - intent.notional < min_reserve {
                    return (
                        false,
                        format!("Cash reserve: ${:.0} < ${min_reserve:.0} minimum", balance - intent.notional),
                    );
                }
            }
            Err(e) => {
                warn!(error = %e, "cash_reserve_check_failed_closed");
                return (false, "Wallet balance unavailable".to_string());
            }
        }

        if let Some(edge_pct) = intent.metadata.edge_pct {
            if edge_pct < self.config.min_edge_pct {
                return (false, format!("Edge too low: {edge_pct:.1}% < {}%", self.config.min_edge_pct));
            }
        }

        info!(strategy = %intent.strategy, side = %intent.side.as_str(), notional = intent.notional, "intent_approved");
        (true, "Approved".to_string())
    }

    /// Wallet quote balance + sum(current_or_entry_price * size) over open
    /// positions. `None` if the wallet read fails — callers treat that as
    /// portfolio value 0, i.e. fail-closed.
    async fn portfolio_value(&self) -> Option<f64> {
        let usdc = self.wallet.quote_balance().await.ok()?.to_f64().unwrap_or(0.0);
        let positions = self.store.get_open_positions(None).await.ok()?;
        let position_value: f64 = positions.iter().map(|p| p.current_price * p.size).sum();
        Some(usdc + position_value)
    }

    pub async fn activate_kill_switch(&self) {
        self.kill_switch.store(true, Ordering::SeqCst);
        let _ = self.store.set_metadata(KILL_SWITCH_KEY, "1").await;
        warn!("kill_switch_activated");
        let drainer = self.drainer.lock().unwrap().clone();
        if let Some(drainer) = drainer {
            drainer.drain_and_cancel_all().await;
        }
    }

    pub async fn deactivate_kill_switch(&self) {
        self.kill_switch.store(false, Ordering::SeqCst);
        self.daily_loss_halt.store(false, Ordering::SeqCst);
        let _ = self.store.set_metadata(KILL_SWITCH_KEY, "0").await;
        info!("kill_switch_deactivated");
    }

    pub fn pause_trading(&self) {
        self.trading_halted.store(true, Ordering::SeqCst);
        info!("trading_paused");
    }

    pub fn resume_trading(&self) {
        self.trading_halted.store(false, Ordering::SeqCst);
        self.daily_loss_halt.store(false, Ordering::SeqCst);
        info!("trading_resumed");
    }

    pub fn is_kill_switch_active(&self) -> bool {
        self.kill_switch.load(Ordering::SeqCst)
    }

    pub fn is_trading_halted(&self) -> bool {
        self.kill_switch.load(Ordering::SeqCst) || self.trading_halted.load(Ordering::SeqCst) || self.daily_loss_halt.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::{Discipline, IntentMetadata, Side, Urgency};
    use crate::wallet::PaperWallet;

    fn intent(notional: f64) -> Intent {
        Intent {
            strategy: "test".to_string(),
            market_id: "m1".to_string(),
            token_id: "tok-a".to_string(),
            side: Side::Buy,
            price: 0.50,
            notional,
            discipline: Discipline::Resting,
            urgency: Urgency::Normal,
            reasoning: "unit test".to_string(),
            metadata: IntentMetadata { edge_pct: Some(8.0), ..Default::default() },
        }
    }

    async fn manager(store: Store, quote_balance: f64) -> RiskManager {
        let config = RiskConfig {
            max_position_pct: 15.0,
            min_position_size_usd: 5.0,
            max_open_positions: 10,
            min_edge_pct: 5.0,
            daily_loss_limit_pct: 10.0,
            min_cash_reserve_pct: 10.0,
            strategy_allocation_cap_usd: None,
        };
        RiskManager::new(config, store, Arc::new(PaperWallet::new(quote_balance))).await
    }

    #[tokio::test]
    async fn rejects_position_too_large_relative_to_portfolio() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let risk = manager(store, 500.0).await;
        let (approved, reason) = risk.approve(&intent(100.0)).await;
        assert!(!approved);
        assert!(reason.to_lowercase().contains("position size"), "{reason}");
    }

    #[tokio::test]
    async fn rejects_second_entry_on_a_market_with_a_live_position() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store
            .open_position(&crate::store::Position {
                id: 0,
                strategy: "other".to_string(),
                market_id: "m1".to_string(),
                token_id: "tok-b".to_string(),
                side: Side::Buy,
                entry_price: 0.40,
                size: 10.0,
                current_price: 0.40,
                unrealized_pnl: 0.0,
                realized_pnl: None,
                status: crate::store::PositionStatus::Open,
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

        let risk = manager(store, 5000.0).await;
        let (approved, reason) = risk.approve(&intent(50.0)).await;
        assert!(!approved);
        assert!(reason.contains("already has a live position"), "{reason}");
    }

    #[tokio::test]
    async fn exit_intent_bypasses_the_one_position_per_market_check() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store
            .open_position(&crate::store::Position {
                id: 0,
                strategy: "other".to_string(),
                market_id: "m1".to_string(),
                token_id: "tok-b".to_string(),
                side: Side::Buy,
                entry_price: 0.40,
                size: 10.0,
                current_price: 0.40,
                unrealized_pnl: 0.0,
                realized_pnl: None,
                status: crate::store::PositionStatus::Open,
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

        let risk = manager(store, 5000.0).await;
        let mut exit_intent = intent(50.0);
        exit_intent.metadata.is_exit = Some(true);
        let (approved, reason) = risk.approve(&exit_intent).await;
        assert!(approved, "{reason}");
    }

    #[tokio::test]
    async fn kill_switch_rejects_everything() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let risk = manager(store, 5000.0).await;
        risk.activate_kill_switch().await;
        let (approved, reason) = risk.approve(&intent(50.0)).await;
        assert!(!approved);
        assert_eq!(reason, "Kill switch active");
    }

    struct CountingDrainer {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl QueueDrainer for CountingDrainer {
        async fn drain_and_cancel_all(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn kill_switch_drains_wired_order_manager() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let risk = manager(store, 5000.0).await;
        let drainer = Arc::new(CountingDrainer { calls: std::sync::atomic::AtomicUsize::new(0) });
        risk.set_queue_drainer(drainer.clone());
        risk.activate_kill_switch().await;
        assert_eq!(drainer.calls.load(Ordering::SeqCst), 1);
    }
}
