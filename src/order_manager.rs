//! Order Manager (C6): single bounded intent queue, one worker, everything
//! an intent passes through between a strategy's `evaluate()` and a row in
//! the store. Grounded on `original_source/src/execution/order_manager.py`'s
//! `OrderManager` (`asyncio.Queue` + `_execute_signal`), generalized from its
//! single Signal dataclass to this crate's `Intent`/`IntentMetadata` model.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::adapter::ExchangeAdapter;
use crate::config::{OrderManagerConfig, TradingMode};
use crate::error::EngineError;
use crate::intent::{Discipline, Intent, Side, Urgency};
use crate::notifier::Notifier;
use crate::position_manager::PositionManager;
use crate::rate_limiter::RateLimiter;
use crate::risk::{QueueDrainer, RiskManager};
use crate::store::{Position, Store, Trade};

pub struct OrderManager {
    queue: Mutex<mpsc::Receiver<Intent>>,
    tx: mpsc::Sender<Intent>,
    risk: Arc<RiskManager>,
    rate_limiter: Arc<RateLimiter>,
    adapter: Arc<dyn ExchangeAdapter>,
    store: Store,
    notifier: Arc<dyn Notifier>,
    mode: TradingMode,
    config: OrderManagerConfig,
    draining: AtomicBool,
    /// Wired in once, after the position manager exists (it's constructed
    /// with an `Arc<OrderManager>` already in hand, so this side of the
    /// reference has to arrive post-construction; same shape as
    /// `RiskManager::set_queue_drainer`).
    position_manager: std::sync::Mutex<Option<Arc<PositionManager>>>,
}

impl OrderManager {
    pub fn new(
        config: OrderManagerConfig,
        mode: TradingMode,
        risk: Arc<RiskManager>,
        rate_limiter: Arc<RateLimiter>,
        adapter: Arc<dyn ExchangeAdapter>,
        store: Store,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        Arc::new(Self {
            queue: Mutex::new(rx),
            tx,
            risk,
            rate_limiter,
            adapter,
            store,
            notifier,
            mode,
            config,
            draining: AtomicBool::new(false),
            position_manager: std::sync::Mutex::new(None),
        })
    }

    /// Wired in once, after the position manager exists (breaks the
    /// construction-order cycle between the two).
    pub fn set_position_manager(&self, position_manager: Arc<PositionManager>) {
        *self.position_manager.lock().unwrap() = Some(position_manager);
    }

    /// Non-blocking enqueue; drops and logs on a full queue rather than
    /// ever blocking a strategy's evaluation loop.
    pub fn submit(&self, intent: Intent) {
        if self.tx.try_send(intent).is_err() {
            warn!("order_queue_full_dropping_intent");
        }
    }

    pub async fn run(self: Arc<Self>) {
        loop {
            let intent = {
                let mut rx = self.queue.lock().await;
                rx.recv().await
            };
            let Some(intent) = intent else { return };
            if self.draining.load(Ordering::SeqCst) {
                continue;
            }
            self.execute(intent, 0).await;
        }
    }

    async fn execute(&self, intent: Intent, attempt: u32) {
        let (approved, reason) = self.risk.approve(&intent).await;
        if !approved {
            info!(strategy = %intent.strategy, reason = %reason, "intent_rejected");
            return;
        }

        let shares = intent.shares();
        if shares <= 0.0 {
            warn!(strategy = %intent.strategy, "intent_non_positive_shares_dropped");
            return;
        }

        self.rate_limiter.acquire().await;

        let result = if self.mode.is_paper() {
            uuid::Uuid::new_v4()
                .simple()
                .to_string()
                .get(..12)
                .map(|id| crate::adapter::OrderResult::success(format!("paper-{id}")))
                .unwrap()
        } else {
            match self
                .adapter
                .submit_order(&intent.token_id, intent.side, intent.price, shares, intent.discipline, None)
                .await
            {
                Ok(r) => r,
                Err(e) => crate::adapter::OrderResult::failure(e.to_string()),
            }
        };

        let result = self.confirm_fill(result, &intent).await;

        if result.ok {
            self.rate_limiter.record_success().await;
            self.on_fill(&intent, &result).await;
            return;
        }

        let error_text = result.error.clone().unwrap_or_default();
        if EngineError::looks_throttled(&error_text) {
            self.rate_limiter.record_throttled().await;
        }
        warn!(strategy = %intent.strategy, error = %error_text, "intent_execution_failed");

        if intent.metadata.is_exit() && attempt < self.config.exit_retry_attempts {
            let backoff = 2u64.pow(attempt + 1);
            warn!(attempt, backoff_secs = backoff, "retrying_exit_intent");
            tokio::time::sleep(std::time::Duration::from_secs(backoff)).await;
            Box::pin(self.execute(intent, attempt + 1)).await;
            return;
        }

        if intent.metadata.arb_leg == Some(2) {
            self.rollback_paired_leg(&intent).await;
        }
    }

    /// IMMEDIATE_OR_KILL orders must be filled or gone; a resting exchange
    /// entry after the confirmation delay means the exchange silently
    /// accepted it as a maker order instead, which the spec treats as "not
    /// filled" for IOK discipline.
    async fn confirm_fill(&self, result: crate::adapter::OrderResult, intent: &Intent) -> crate::adapter::OrderResult {
        if !result.ok || intent.discipline != Discipline::ImmediateOrKill {
            return result;
        }
        let Some(order_id) = result.order_id.clone() else { return result };
        tokio::time::sleep(self.config.fill_confirmation_delay).await;
        match self.adapter.list_open_orders().await {
            Ok(open) if open.iter().any(|o| o.order_id == order_id) => crate::adapter::OrderResult::failure("not filled"),
            _ => result,
        }
    }

    async fn on_fill(&self, intent: &Intent, result: &crate::adapter::OrderResult) {
        let order_id = result.order_id.clone().unwrap_or_default();
        let metadata = match serde_json::to_value(&intent.metadata) {
            Ok(v) => v,
            Err(_) => json!({}),
        };

        let trade = Trade {
            order_id: order_id.clone(),
            strategy: intent.strategy.clone(),
            market_id: intent.market_id.clone(),
            token_id: intent.token_id.clone(),
            side: intent.side,
            price: intent.price,
            size: intent.shares(),
            order_type: format!("{:?}", intent.discipline),
            status: "FILLED".to_string(),
            reasoning: Some(intent.reasoning.clone()),
            metadata: metadata.clone(),
        };

        let open_as_position = !intent.metadata.is_exit() && intent.side == Side::Buy;

        let opened_position_id = {
            let tx_result: Result<Option<i64>, EngineError> = async {
                let mut tx = self.store.transaction().await?;
                Store::record_trade_tx(&mut tx, &trade).await?;
                let position_id = if open_as_position {
                    let position = Position {
                        id: 0,
                        strategy: intent.strategy.clone(),
                        market_id: intent.market_id.clone(),
                        token_id: intent.token_id.clone(),
                        side: intent.side,
                        entry_price: intent.price,
                        size: intent.shares(),
                        current_price: intent.price,
                        unrealized_pnl: 0.0,
                        realized_pnl: None,
                        status: crate::store::PositionStatus::Open,
                        stop_loss_price: intent.metadata.stop_loss_price,
                        take_profit_triggered: 0,
                        trailing_stop_price: None,
                        opened_at: String::new(),
                        closed_at: None,
                        close_reason: None,
                        metadata,
                    };
                    Some(Store::open_position_tx(&mut tx, &position).await?)
                } else {
                    None
                };
                tx.commit().await.map_err(|e| EngineError::new(crate::error::ErrorKind::Fatal, e.to_string()))?;
                Ok(position_id)
            }
            .await;
            match tx_result {
                Ok(id) => id,
                Err(e) => {
                    error!(error = %e, "trade_store_write_failed_after_submit");
                    None
                }
            }
        };

        if let Some(position_id) = opened_position_id {
            self.notifier
                .alert_position_opened(&intent.strategy, &intent.market_id, intent.side.as_str(), intent.price, intent.shares())
                .await;
            info!(position_id, "position_opened");
        } else if intent.metadata.is_exit() {
            info!(order_id, "exit_order_filled");
            if let (Some(position_id), Some(realized_pnl)) = (intent.metadata.position_id, intent.metadata.realized_pnl) {
                let position_manager = self.position_manager.lock().unwrap().clone();
                match position_manager {
                    Some(pm) => pm.confirm_close(position_id, realized_pnl, &intent.reasoning).await,
                    None => warn!(position_id, "exit_filled_but_no_position_manager_wired"),
                }
            } else {
                warn!(order_id, "exit_fill_missing_position_metadata");
            }
        }
    }

    async fn rollback_paired_leg(&self, intent: &Intent) {
        let meta = &intent.metadata;
        let (Some(token_id), Some(price), Some(notional)) =
            (meta.arb_rollback_token_id.clone(), meta.arb_rollback_price, meta.arb_rollback_notional)
        else {
            error!(pair_id = ?meta.arb_pair_id, "paired_order_rollback_missing_fields");
            return;
        };

        warn!(pair_id = ?meta.arb_pair_id, %token_id, "paired_order_rollback_triggered");
        let rollback = Intent {
            strategy: intent.strategy.clone(),
            market_id: intent.market_id.clone(),
            token_id,
            side: Side::Sell,
            price,
            notional,
            discipline: Discipline::ImmediateOrKill,
            urgency: Urgency::High,
            reasoning: "paired-order rollback".to_string(),
            metadata: Default::default(),
        };
        // Bypasses the queue: this must run now, not wait behind other
        // pending intents.
        Box::pin(self.execute(rollback, self.config.exit_retry_attempts)).await;
    }
}

#[async_trait::async_trait]
impl QueueDrainer for OrderManager {
    async fn drain_and_cancel_all(&self) {
        self.draining.store(true, Ordering::SeqCst);
        {
            let mut rx = self.queue.lock().await;
            while rx.try_recv().is_ok() {}
        }
        if let Err(e) = self.adapter.cancel_all_orders().await {
            error!(error = %e, "cancel_all_orders_failed_during_drain");
        }
        self.draining.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::PaperAdapter;
    use crate::intent::IntentMetadata;
    use crate::notifier::LoggingNotifier;
    use crate::wallet::PaperWallet;

    fn intent(strategy: &str, notional: f64) -> Intent {
        Intent {
            strategy: strategy.to_string(),
            market_id: "m1".to_string(),
            token_id: "tok-a".to_string(),
            side: Side::Buy,
            price: 0.5,
            notional,
            discipline: Discipline::Resting,
            urgency: Urgency::Normal,
            reasoning: "test".to_string(),
            metadata: IntentMetadata { edge_pct: Some(10.0), ..Default::default() },
        }
    }

    async fn build() -> Arc<OrderManager> {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let risk_config = crate::config::RiskConfig {
            max_open_positions: 10,
            max_position_pct: 50.0,
            min_position_size_usd: 1.0,
            daily_loss_limit_pct: 50.0,
            min_cash_reserve_pct: 0.0,
            min_edge_pct: 0.0,
            strategy_allocation_cap_usd: None,
        };
        let risk = Arc::new(RiskManager::new(risk_config, store.clone(), Arc::new(PaperWallet::new(10_000.0))).await);
        let rate_limiter = Arc::new(RateLimiter::new(100, 60.0));
        let adapter = Arc::new(PaperAdapter::new());
        let notifier = Arc::new(LoggingNotifier);
        OrderManager::new(OrderManagerConfig::default(), TradingMode::Paper, risk, rate_limiter, adapter, store, notifier)
    }

    #[tokio::test]
    async fn fill_opens_a_position_in_paper_mode() {
        let om = build().await;
        om.execute(intent("mirror", 50.0), 0).await;
        let open = om.store.get_open_positions(None).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].strategy, "mirror");
    }

    #[tokio::test]
    async fn kill_switch_drain_empties_queue() {
        let om = build().await;
        om.submit(intent("mirror", 10.0));
        om.submit(intent("mirror", 10.0));
        om.drain_and_cancel_all().await;
        let mut rx = om.queue.lock().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn exit_fill_confirms_close_on_wired_position_manager() {
        let om = build().await;
        let position_config = crate::config::PositionConfig {
            stop_loss_pct: 15.0,
            trailing_stop_pct: 10.0,
            take_profit_tiers: Vec::new(),
            taker_fee_rate: 0.0,
            winner_fee_rate: 0.0,
        };
        let pm = Arc::new(crate::position_manager::PositionManager::new(position_config, om.store.clone(), om.clone()));
        om.set_position_manager(pm);

        let position_id = om
            .store
            .open_position(&Position {
                id: 0,
                strategy: "mirror".to_string(),
                market_id: "m1".to_string(),
                token_id: "tok-a".to_string(),
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
        om.store.set_position_closing(position_id, "stop_loss").await.unwrap();

        let mut exit = intent("mirror", 40.0);
        exit.side = Side::Sell;
        exit.metadata.is_exit = Some(true);
        exit.metadata.position_id = Some(position_id);
        exit.metadata.realized_pnl = Some(-1.5);

        om.execute(exit, 0).await;

        let closed = om.store.get_closed_positions(None).await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].id, position_id);
        assert!((closed[0].realized_pnl.unwrap() + 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rollback_paired_leg_submits_a_compensating_sell() {
        let om = build().await;
        let mut primary = intent("arb", 30.0);
        primary.metadata.arb_pair_id = Some("pair-1".to_string());
        primary.metadata.arb_leg = Some(2);
        primary.metadata.arb_rollback_token_id = Some("tok-rollback".to_string());
        primary.metadata.arb_rollback_price = Some(0.55);
        primary.metadata.arb_rollback_notional = Some(22.0);

        om.rollback_paired_leg(&primary).await;

        let trades = om.store.get_trades(Some("arb"), 10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].token_id, "tok-rollback");
        assert_eq!(trades[0].side, Side::Sell);
        assert!((trades[0].price - 0.55).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rollback_paired_leg_is_a_noop_without_rollback_fields() {
        let om = build().await;
        let mut primary = intent("arb", 30.0);
        primary.metadata.arb_pair_id = Some("pair-1".to_string());
        primary.metadata.arb_leg = Some(2);

        om.rollback_paired_leg(&primary).await;

        let trades = om.store.get_trades(Some("arb"), 10).await.unwrap();
        assert!(trades.is_empty());
    }
}
