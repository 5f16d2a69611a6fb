//! Orchestrator (C9): wires every component together, owns their task
//! handles, and drives startup/shutdown. Grounded on the base crate's
//! `polymarket_v2.rs::main` actor-spawning idiom (`Vec<JoinHandle<()>>`,
//! one task per component) generalized to this crate's component set.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::adapter::ExchangeAdapter;
use crate::config::EngineConfig;
use crate::notifier::Notifier;
use crate::order_manager::OrderManager;
use crate::position_manager::PositionManager;
use crate::risk::RiskManager;
use crate::store::Store;
use crate::streaming::StreamingClient;
use crate::strategy::StrategyRunner;
use crate::wallet::Wallet;

pub struct Engine {
    store: Store,
    adapter: Arc<dyn ExchangeAdapter>,
    wallet: Arc<dyn Wallet>,
    risk: Arc<RiskManager>,
    order_manager: Arc<OrderManager>,
    position_manager: Arc<PositionManager>,
    streaming: Arc<StreamingClient>,
    notifier: Arc<dyn Notifier>,
    strategies: std::sync::Mutex<Vec<Arc<StrategyRunner>>>,
    shutdown: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    trading_mode: crate::config::TradingMode,
}

impl Engine {
    pub async fn bootstrap(
        config: EngineConfig,
        adapter: Arc<dyn ExchangeAdapter>,
        wallet: Arc<dyn Wallet>,
        notifier: Arc<dyn Notifier>,
    ) -> eyre::Result<Arc<Self>> {
        let store = Store::connect(&config.database_url).await?;

        let risk = Arc::new(RiskManager::new(config.risk.clone(), store.clone(), wallet.clone()).await);
        let rate_limiter = Arc::new(crate::rate_limiter::RateLimiter::from_config(&config.rate_limiter));

        let order_manager = OrderManager::new(
            config.order_manager.clone(),
            config.trading_mode,
            risk.clone(),
            rate_limiter,
            adapter.clone(),
            store.clone(),
            notifier.clone(),
        );
        risk.set_queue_drainer(order_manager.clone());

        let streaming = Arc::new(StreamingClient::new(config.streaming.clone()));
        let position_manager = Arc::new(PositionManager::new(config.position.clone(), store.clone(), order_manager.clone()));
        order_manager.set_position_manager(position_manager.clone());

        let (shutdown, _) = watch::channel(false);

        let engine = Arc::new(Self {
            store,
            adapter,
            wallet,
            risk,
            order_manager,
            position_manager,
            streaming,
            notifier,
            strategies: std::sync::Mutex::new(Vec::new()),
            shutdown,
            tasks: std::sync::Mutex::new(Vec::new()),
            trading_mode: config.trading_mode,
        });

        Ok(engine)
    }

    pub fn register_strategy(&self, runner: Arc<StrategyRunner>) {
        self.strategies.lock().unwrap().push(runner);
    }

    pub fn store(&self) -> Store {
        self.store.clone()
    }

    pub fn adapter(&self) -> Arc<dyn ExchangeAdapter> {
        self.adapter.clone()
    }

    pub fn wallet(&self) -> Arc<dyn Wallet> {
        self.wallet.clone()
    }

    pub fn order_manager(&self) -> Arc<OrderManager> {
        self.order_manager.clone()
    }

    pub fn streaming(&self) -> Arc<StreamingClient> {
        self.streaming.clone()
    }

    pub async fn start(self: &Arc<Self>) -> eyre::Result<()> {
        info!("engine_starting");

        let existing_open = self.store.get_open_positions(None).await?;
        let tokens: Vec<String> = existing_open.iter().map(|p| p.token_id.clone()).collect();

        let position_manager = self.position_manager.clone();
        self.streaming
            .register_callback(Arc::new(move |token_id: String, price: f64, ts: f64| {
                let pm = position_manager.clone();
                tokio::spawn(async move { pm.on_price_update(&token_id, price, ts).await });
            }))
            .await;

        if !tokens.is_empty() {
            self.streaming.subscribe(tokens).await;
        }

        let mut tasks = self.tasks.lock().unwrap();

        let streaming = self.streaming.clone();
        tasks.push(tokio::spawn(async move { streaming.run().await }));

        let order_manager = self.order_manager.clone();
        tasks.push(tokio::spawn(async move { order_manager.run().await }));

        let strategies = self.strategies.lock().unwrap().clone();
        for runner in strategies {
            tasks.push(tokio::spawn(async move { runner.start().await }));
        }

        tasks.push(self.spawn_pnl_snapshot_loop());
        tasks.push(self.spawn_health_check_loop());
        tasks.push(self.spawn_daily_summary_loop());
        tasks.push(self.spawn_resolution_poll_loop());

        drop(tasks);

        info!("engine_started");
        Ok(())
    }

    fn spawn_pnl_snapshot_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5 * 60));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => return,
                }
                if let Err(e) = this.snapshot_pnl().await {
                    warn!(error = %e, "pnl_snapshot_failed");
                }
            }
        })
    }

    fn spawn_health_check_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => return,
                }
                let open = this.store.get_open_positions(None).await.map(|p| p.len()).unwrap_or(0);
                info!(open_positions = open, kill_switch = this.risk.is_kill_switch_active(), "health_check");
            }
        })
    }

    fn spawn_daily_summary_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                let sleep_for = seconds_until_next_utc_midnight();
                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {}
                    _ = shutdown_rx.changed() => return,
                }
                match this.store.get_today_realized_pnl().await {
                    Ok(pnl) => {
                        this.notifier
                            .alert_system("Daily summary", &format!("Realized P&L: {pnl:.2}"), crate::notifier::Level::Info)
                            .await;
                    }
                    Err(e) => warn!(error = %e, "daily_summary_pnl_read_failed"),
                }
            }
        })
    }

    fn spawn_resolution_poll_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5 * 60));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => return,
                }
                let open = match this.store.get_open_positions(None).await {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "resolution_poll_store_read_failed");
                        continue;
                    }
                };
                let mut markets_checked = std::collections::HashSet::new();
                for position in open {
                    if !markets_checked.insert(position.market_id.clone()) {
                        continue;
                    }
                    match this.adapter.get_market(&position.market_id).await {
                        Ok(Some(market)) if market.resolved => {
                            let winning_token = if market.yes_price == Some(1.0) { &market.yes_token_id } else { &market.no_token_id };
                            this.position_manager.resolve(&position.market_id, winning_token).await;
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, market_id = position.market_id, "resolution_check_failed"),
                    }
                }
            }
        })
    }

    async fn snapshot_pnl(&self) -> eyre::Result<()> {
        let realized = self.store.get_today_realized_pnl().await?;
        let open = self.store.get_open_positions(None).await?;
        let unrealized: f64 = open.iter().map(|p| p.unrealized_pnl).sum();
        let balance = self.wallet.quote_balance().await.ok();
        info!(realized_pnl = realized, unrealized_pnl = unrealized, balance = ?balance, "pnl_snapshot");
        Ok(())
    }

    pub async fn status(&self) -> serde_json::Value {
        let open = self.store.get_open_positions(None).await.unwrap_or_default();
        let realized = self.store.get_today_realized_pnl().await.unwrap_or(0.0);
        json!({
            "trading_mode": if self.trading_mode.is_paper() { "paper" } else { "live" },
            "kill_switch": self.risk.is_kill_switch_active(),
            "trading_halted": self.risk.is_trading_halted(),
            "open_positions": open.len(),
            "daily_realized_pnl": realized,
        })
    }

    pub async fn kill(&self) {
        self.risk.activate_kill_switch().await;
    }

    pub async fn shutdown(&self) {
        info!("engine_shutting_down");
        let strategies = self.strategies.lock().unwrap().clone();
        for runner in &strategies {
            runner.stop().await;
        }
        if !self.trading_mode.is_paper() {
            if let Err(e) = self.adapter.cancel_all_orders().await {
                error!(error = %e, "cancel_all_orders_on_shutdown_failed");
            }
        }
        let _ = self.shutdown.send(true);
        self.streaming.stop();
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        if let Err(e) = self.snapshot_pnl().await {
            warn!(error = %e, "final_pnl_snapshot_failed");
        }
        info!("engine_shut_down");
    }
}

fn seconds_until_next_utc_midnight() -> Duration {
    use chrono::{Timelike, Utc};
    let now = Utc::now();
    let seconds_since_midnight = now.num_seconds_from_midnight() as u64;
    let remaining = 24 * 60 * 60 - seconds_since_midnight;
    Duration::from_secs(remaining.max(1))
}
