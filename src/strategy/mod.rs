//! Strategy Runtime (C8): the base contract every strategy implements.
//! Grounded on `original_source/src/strategies/base.py`'s `BaseStrategy`
//! (`start`/`stop`/`pause`/`resume`, `_evaluation_loop`, `emit_signal`,
//! `get_state`/`set_state`), generalized to Rust's trait-object idiom in
//! place of Python's abstract base class.

pub mod mirror;
pub mod stubs;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::intent::Intent;
use crate::order_manager::OrderManager;
use crate::store::Store;

/// A strategy never touches the exchange adapter or the store's
/// order/position tables directly — it only returns intents, which flow
/// through the risk-gated order manager.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    /// Called once, after persisted state has been loaded, before the
    /// evaluation loop starts.
    async fn initialize(&self) {}

    /// One evaluation pass; returns the intents to submit this cycle.
    async fn evaluate(&self) -> Vec<Intent>;

    /// Optional direct hook into price updates, for strategies that react
    /// to ticks rather than only polling on `eval_interval`.
    async fn on_price_update(&self, _token_id: &str, _price: f64) {}

    /// Called once on stop, after the loop has been cancelled and state
    /// saved.
    async fn shutdown(&self) {}

    /// Opaque persisted state, round-tripped through `Store::save_strategy_state`
    /// / `load_strategy_state` by the runner below.
    async fn get_state(&self) -> Value {
        Value::Null
    }

    async fn set_state(&self, _state: Value) {}
}

/// Drives a `Strategy`'s lifecycle: load state, run the evaluation loop on
/// its interval, submit intents through the order manager, save state on
/// stop. One `StrategyRunner` per configured strategy.
pub struct StrategyRunner {
    strategy: Arc<dyn Strategy>,
    store: Store,
    order_manager: Arc<OrderManager>,
    eval_interval: std::time::Duration,
    paused: Arc<AtomicBool>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StrategyRunner {
    pub fn new(strategy: Arc<dyn Strategy>, store: Store, order_manager: Arc<OrderManager>, eval_interval: std::time::Duration) -> Self {
        Self {
            strategy,
            store,
            order_manager,
            eval_interval,
            paused: Arc::new(AtomicBool::new(false)),
            handle: std::sync::Mutex::new(None),
        }
    }

    pub async fn start(self: &Arc<Self>) {
        if let Ok(Some(state)) = self.store.load_strategy_state(self.strategy.name()).await {
            self.strategy.set_state(state).await;
        }
        self.strategy.initialize().await;

        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.eval_interval);
            loop {
                ticker.tick().await;
                if this.paused.load(Ordering::SeqCst) {
                    continue;
                }
                let intents = this.strategy.evaluate().await;
                for intent in intents {
                    this.order_manager.submit(intent);
                }
            }
        });
        *self.handle.lock().unwrap() = Some(handle);
        info!(strategy = self.strategy.name(), "strategy_started");
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
        let state = self.strategy.get_state().await;
        if let Err(e) = self.store.save_strategy_state(self.strategy.name(), &state).await {
            warn!(error = %e, strategy = self.strategy.name(), "strategy_state_save_failed");
        }
        self.strategy.shutdown().await;
        info!(strategy = self.strategy.name(), "strategy_stopped");
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }
}
