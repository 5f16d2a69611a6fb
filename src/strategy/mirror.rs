//! Mirror strategy (C8.1): diff-tracks a set of external wallets' positions
//! and emits intents that follow their entries, exits, and size changes.
//! Grounded on `original_source/src/strategies/copy_trader.py`'s
//! `CopyTrader` (sizing methods, conviction/slippage filters,
//! `_calculate_trade_size`, `_persist_whale_positions`,
//! `get_wallet_performance`).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::adapter::ExchangeAdapter;
use crate::intent::{Discipline, Intent, IntentMetadata, Side, Urgency};
use crate::store::{ExternalPosition, Store};
use crate::streaming::StreamingClient;
use crate::strategy::Strategy;
use crate::wallet::Wallet;

/// Intent increases/reductions below `prev.size * 1.10`/`prev.size * 0.70`
/// are noise, not a deliberate re-allocation by the source wallet (spec
/// §4.8.1 steps 3-4).
const SIGNIFICANT_INCREASE: f64 = 1.10;
const SIGNIFICANT_REDUCTION: f64 = 0.70;
const MIN_EXIT_NOTIONAL_FLOOR: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingMethod {
    Fixed,
    PortfolioPct,
    SourcePct,
}

#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub accounts: Vec<String>,
    pub sizing: SizingMethod,
    pub fixed_notional: f64,
    pub portfolio_pct: f64,
    pub source_pct: f64,
    pub min_source_notional: f64,
    pub max_slippage_pct: f64,
    pub min_position_size_usd: f64,
    pub per_account_allocation_cap_usd: f64,
    pub discipline: Discipline,
    pub taker_fee_rate: f64,
    pub winner_fee_rate: f64,
}

#[derive(Debug, Clone, Copy)]
struct TrackedPosition {
    size: f64,
    avg_cost: f64,
}

pub struct MirrorStrategy {
    config: MirrorConfig,
    store: Store,
    adapter: Arc<dyn ExchangeAdapter>,
    wallet: Arc<dyn Wallet>,
    streaming: Arc<StreamingClient>,
    cache: Mutex<HashMap<String, HashMap<(String, String), TrackedPosition>>>,
}

impl MirrorStrategy {
    pub fn new(config: MirrorConfig, store: Store, adapter: Arc<dyn ExchangeAdapter>, wallet: Arc<dyn Wallet>, streaming: Arc<StreamingClient>) -> Self {
        Self {
            config,
            store,
            adapter,
            wallet,
            streaming,
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn live_price(&self, token_id: &str) -> Option<f64> {
        if let Some(p) = self.streaming.latest_price(token_id).await {
            return Some(p);
        }
        self.adapter.last_price(token_id).await.ok().flatten()
    }

    async fn account_exposure(&self, account: &str) -> f64 {
        match self.store.get_open_positions(Some("mirror")).await {
            Ok(positions) => positions
                .into_iter()
                .filter(|p| p.metadata.get("source_account").and_then(Value::as_str) == Some(account))
                .map(|p| p.entry_price * p.size)
                .sum(),
            Err(_) => 0.0,
        }
    }

    async fn desired_notional(&self, source_current_value: f64) -> f64 {
        let portfolio_value = self.wallet.quote_balance().await.ok().and_then(|d| d.to_f64()).unwrap_or(0.0);
        match self.config.sizing {
            SizingMethod::Fixed => self.config.fixed_notional,
            SizingMethod::PortfolioPct => portfolio_value * (self.config.portfolio_pct / 100.0),
            SizingMethod::SourcePct => source_current_value * (self.config.source_pct / 100.0),
        }
    }

    async fn poll_account(&self, account: &str) -> Vec<Intent> {
        let mut intents = Vec::new();

        let live = match self.adapter.list_external_positions(account).await {
            Ok(v) => v,
            Err(e) => {
                warn!(account, error = %e, "mirror_external_position_fetch_failed");
                return intents;
            }
        };

        let mut current: HashMap<(String, String), TrackedPosition> = HashMap::new();
        for p in live.iter().filter(|p| p.size > 0.0) {
            current.insert((p.market_id.clone(), p.token_id.clone()), TrackedPosition { size: p.size, avg_cost: p.avg_cost });
        }

        let prev = {
            let mut cache = self.cache.lock().await;
            cache.entry(account.to_string()).or_default().clone()
        };

        // --- exits / reductions ---
        for ((market_id, token_id), prev_pos) in prev.iter() {
            let reduction_pct = match current.get(&(market_id.clone(), token_id.clone())) {
                None => 100.0,
                Some(cur) if cur.size < prev_pos.size * SIGNIFICANT_REDUCTION => (prev_pos.size - cur.size) / prev_pos.size * 100.0,
                _ => continue,
            };

            let our_position = match self.store.get_open_positions(Some("mirror")).await {
                Ok(positions) => positions.into_iter().find(|p| {
                    p.token_id == *token_id && p.metadata.get("source_account").and_then(Value::as_str) == Some(account)
                }),
                Err(_) => None,
            };
            let Some(our_position) = our_position else { continue };

            let Some(exit_price) = self.live_price(token_id).await else { continue };
            let exit_notional = our_position.entry_price * our_position.size * (reduction_pct / 100.0);
            if exit_notional < MIN_EXIT_NOTIONAL_FLOOR {
                continue;
            }

            intents.push(Intent {
                strategy: "mirror".to_string(),
                market_id: market_id.clone(),
                token_id: token_id.clone(),
                side: Side::Sell,
                price: exit_price,
                notional: exit_notional,
                discipline: self.config.discipline,
                urgency: Urgency::Normal,
                reasoning: "source exit/reduction".to_string(),
                metadata: IntentMetadata {
                    is_exit: Some(true),
                    position_id: Some(our_position.id),
                    source_account: Some(account.to_string()),
                    ..Default::default()
                },
            });
        }

        // --- entries / increases ---
        let mut account_exposure = self.account_exposure(account).await;
        for ((market_id, token_id), cur) in current.iter() {
            if let Some(prev_pos) = prev.get(&(market_id.clone(), token_id.clone())) {
                if cur.size <= prev_pos.size * SIGNIFICANT_INCREASE {
                    continue;
                }
            }

            let Some(live_price) = self.live_price(token_id).await else { continue };
            let source_current_value = cur.size * live_price;
            if source_current_value < self.config.min_source_notional {
                continue;
            }
            if cur.avg_cost > 0.0 {
                let slippage_pct = (live_price - cur.avg_cost) / cur.avg_cost * 100.0;
                if slippage_pct > self.config.max_slippage_pct {
                    continue;
                }
            }

            let mut notional = self.desired_notional(source_current_value).await;
            if notional < self.config.min_position_size_usd {
                continue;
            }
            let remaining_cap = (self.config.per_account_allocation_cap_usd - account_exposure).max(0.0);
            if remaining_cap < self.config.min_position_size_usd {
                continue;
            }
            notional = notional.min(remaining_cap);

            let winner_fee_pct = self.config.winner_fee_rate * 100.0;
            let taker_fee_pct = self.config.taker_fee_rate * 100.0;
            let edge_pct = (10.0 - (winner_fee_pct + taker_fee_pct)).max(0.0);

            let market = self.adapter.get_market(market_id).await.ok().flatten();
            let (yes_token_id, no_token_id, market_question) = match market {
                Some(m) => (Some(m.yes_token_id), Some(m.no_token_id), Some(m.question)),
                None => (None, None, None),
            };

            intents.push(Intent {
                strategy: "mirror".to_string(),
                market_id: market_id.clone(),
                token_id: token_id.clone(),
                side: Side::Buy,
                price: live_price,
                notional,
                discipline: self.config.discipline,
                urgency: Urgency::Normal,
                reasoning: "source entry/increase".to_string(),
                metadata: IntentMetadata {
                    source_account: Some(account.to_string()),
                    edge_pct: Some(edge_pct),
                    yes_token_id,
                    no_token_id,
                    market_question,
                    extra: json!({
                        "source_avg_cost": cur.avg_cost,
                        "source_current_value": source_current_value,
                        "slippage_pct": if cur.avg_cost > 0.0 { (live_price - cur.avg_cost) / cur.avg_cost * 100.0 } else { 0.0 },
                    })
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
                    ..Default::default()
                },
            });
            account_exposure += notional;
        }

        // --- persist + subscribe ---
        {
            let mut cache = self.cache.lock().await;
            let slot = cache.entry(account.to_string()).or_default();
            for key in prev.keys() {
                if !current.contains_key(key) {
                    let _ = self.store.delete_external_position(account, &key.0, &key.1).await;
                }
            }
            for ((market_id, token_id), pos) in current.iter() {
                let _ = self
                    .store
                    .upsert_external_position(&ExternalPosition {
                        account: account.to_string(),
                        market_id: market_id.clone(),
                        token_id: token_id.clone(),
                        size: pos.size,
                        avg_cost: Some(pos.avg_cost),
                        last_seen_at: Utc::now().to_rfc3339(),
                    })
                    .await;
                if !self.streaming.is_subscribed(token_id).await {
                    self.streaming.subscribe(vec![token_id.clone()]).await;
                }
            }
            *slot = current;
        }

        intents
    }

    /// Trade stats over this account's closed mirror positions, for
    /// operator/status reporting (spec §4.8.1; grounded on
    /// `copy_trader.py::get_wallet_performance`).
    pub async fn wallet_performance(&self, account: &str) -> Value {
        let closed = self.store.get_closed_positions(Some("mirror")).await.unwrap_or_default();
        let matching: Vec<_> = closed
            .into_iter()
            .filter(|p| p.metadata.get("source_account").and_then(Value::as_str) == Some(account))
            .collect();

        let trade_count = matching.len();
        let wins = matching.iter().filter(|p| p.realized_pnl.unwrap_or(0.0) > 0.0).count();
        let losses = matching.iter().filter(|p| p.realized_pnl.unwrap_or(0.0) <= 0.0).count();
        let total_pnl: f64 = matching.iter().filter_map(|p| p.realized_pnl).sum();
        let win_rate = if trade_count > 0 { wins as f64 / trade_count as f64 * 100.0 } else { 0.0 };

        json!({
            "account": account,
            "trade_count": trade_count,
            "wins": wins,
            "losses": losses,
            "win_rate": win_rate,
            "total_pnl": total_pnl,
            "current_exposure": self.account_exposure(account).await,
        })
    }
}

#[async_trait]
impl Strategy for MirrorStrategy {
    fn name(&self) -> &str {
        "mirror"
    }

    async fn evaluate(&self) -> Vec<Intent> {
        let mut intents = Vec::new();
        for account in self.config.accounts.clone() {
            intents.extend(self.poll_account(&account).await);
        }
        info!(count = intents.len(), "mirror_evaluate_cycle");
        intents
    }

    async fn get_state(&self) -> Value {
        let cache = self.cache.lock().await;
        let serializable: HashMap<String, Vec<Value>> = cache
            .iter()
            .map(|(account, positions)| {
                let entries = positions
                    .iter()
                    .map(|((market_id, token_id), pos)| json!({"market_id": market_id, "token_id": token_id, "size": pos.size, "avg_cost": pos.avg_cost}))
                    .collect();
                (account.clone(), entries)
            })
            .collect();
        json!(serializable)
    }

    async fn set_state(&self, state: Value) {
        let Some(obj) = state.as_object() else { return };
        let mut cache = self.cache.lock().await;
        for (account, entries) in obj {
            let Some(entries) = entries.as_array() else { continue };
            let mut positions = HashMap::new();
            for entry in entries {
                let (Some(market_id), Some(token_id), Some(size), Some(avg_cost)) = (
                    entry.get("market_id").and_then(Value::as_str),
                    entry.get("token_id").and_then(Value::as_str),
                    entry.get("size").and_then(Value::as_f64),
                    entry.get("avg_cost").and_then(Value::as_f64),
                ) else {
                    continue;
                };
                positions.insert((market_id.to_string(), token_id.to_string()), TrackedPosition { size, avg_cost });
            }
            cache.insert(account.clone(), positions);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{ExternalPositionView, MarketFilter, OrderResult, OrderView};
    use crate::config::StreamingConfig;
    use crate::store::{Position, PositionStatus};
    use crate::wallet::PaperWallet;

    /// Adapter test double: a fixed set of external positions and last
    /// prices, nothing else implemented since `poll_account` never calls
    /// the order-placement surface.
    struct MockAdapter {
        external: Vec<ExternalPositionView>,
        prices: HashMap<String, f64>,
    }

    #[async_trait]
    impl ExchangeAdapter for MockAdapter {
        async fn list_markets(&self, _filter: MarketFilter) -> eyre::Result<Vec<crate::adapter::Market>> {
            Ok(Vec::new())
        }
        async fn get_market(&self, _market_id: &str) -> eyre::Result<Option<crate::adapter::Market>> {
            Ok(None)
        }
        async fn best_bid_ask(&self, _token_id: &str) -> eyre::Result<(Option<f64>, Option<f64>)> {
            Ok((None, None))
        }
        async fn last_price(&self, token_id: &str) -> eyre::Result<Option<f64>> {
            Ok(self.prices.get(token_id).copied())
        }
        async fn submit_order(
            &self,
            _token_id: &str,
            _side: Side,
            _price: f64,
            _size_shares: f64,
            _discipline: Discipline,
            _expiration: Option<i64>,
        ) -> eyre::Result<OrderResult> {
            unimplemented!("mirror's poll_account never submits orders directly")
        }
        async fn cancel_order(&self, _order_id: &str) -> eyre::Result<bool> {
            Ok(true)
        }
        async fn cancel_all_orders(&self) -> eyre::Result<bool> {
            Ok(true)
        }
        async fn list_open_orders(&self) -> eyre::Result<Vec<OrderView>> {
            Ok(Vec::new())
        }
        async fn list_external_positions(&self, _account_id: &str) -> eyre::Result<Vec<ExternalPositionView>> {
            Ok(self.external.clone())
        }
    }

    fn mirror_config() -> MirrorConfig {
        MirrorConfig {
            accounts: vec!["0xSource".to_string()],
            sizing: SizingMethod::Fixed,
            fixed_notional: 25.0,
            portfolio_pct: 0.0,
            source_pct: 0.0,
            min_source_notional: 1.0,
            max_slippage_pct: 50.0,
            min_position_size_usd: 1.0,
            per_account_allocation_cap_usd: 1000.0,
            discipline: Discipline::Resting,
            taker_fee_rate: 0.03,
            winner_fee_rate: 0.02,
        }
    }

    async fn strategy(adapter: MockAdapter) -> (MirrorStrategy, Store) {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let streaming = Arc::new(StreamingClient::new(StreamingConfig {
            ws_url: "ws://unused".to_string(),
            auth_key: None,
            initial_reconnect_delay: std::time::Duration::from_secs(1),
            max_reconnect_delay: std::time::Duration::from_secs(60),
            stale: std::time::Duration::from_secs(30),
            heartbeat_check: std::time::Duration::from_secs(10),
            force_reconnect: std::time::Duration::from_secs(60),
        }));
        let wallet = Arc::new(PaperWallet::new(10_000.0));
        (MirrorStrategy::new(mirror_config(), store.clone(), Arc::new(adapter), wallet, streaming), store)
    }

    #[tokio::test]
    async fn full_exit_closes_our_mirrored_position() {
        let (mirror, store) = strategy(MockAdapter { external: Vec::new(), prices: HashMap::from([("tok-a".to_string(), 0.45)]) }).await;

        mirror
            .set_state(json!({
                "0xSource": [{"market_id": "m1", "token_id": "tok-a", "size": 100.0, "avg_cost": 0.40}],
            }))
            .await;

        let position_id = store
            .open_position(&Position {
                id: 0,
                strategy: "mirror".to_string(),
                market_id: "m1".to_string(),
                token_id: "tok-a".to_string(),
                side: Side::Buy,
                entry_price: 0.40,
                size: 25.0,
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
                metadata: json!({"source_account": "0xSource"}),
            })
            .await
            .unwrap();

        let intents = mirror.poll_account("0xSource").await;

        assert_eq!(intents.len(), 1);
        let exit = &intents[0];
        assert_eq!(exit.side, Side::Sell);
        assert!(exit.metadata.is_exit());
        assert_eq!(exit.metadata.position_id, Some(position_id));
        assert!((exit.notional - 25.0 * 0.40).abs() < 1e-9);
    }

    #[tokio::test]
    async fn partial_reduction_below_threshold_exits_the_reduced_fraction() {
        let (mirror, store) = strategy(MockAdapter {
            external: vec![ExternalPositionView { market_id: "m1".to_string(), token_id: "tok-a".to_string(), size: 20.0, avg_cost: 0.40 }],
            prices: HashMap::from([("tok-a".to_string(), 0.45)]),
        })
        .await;

        mirror
            .set_state(json!({
                "0xSource": [{"market_id": "m1", "token_id": "tok-a", "size": 100.0, "avg_cost": 0.40}],
            }))
            .await;

        store
            .open_position(&Position {
                id: 0,
                strategy: "mirror".to_string(),
                market_id: "m1".to_string(),
                token_id: "tok-a".to_string(),
                side: Side::Buy,
                entry_price: 0.40,
                size: 25.0,
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
                metadata: json!({"source_account": "0xSource"}),
            })
            .await
            .unwrap();

        // Source cut their 100-share position to 20 (an 80% reduction, well
        // past the 30% significance threshold).
        let intents = mirror.poll_account("0xSource").await;

        assert_eq!(intents.len(), 1);
        let exit = &intents[0];
        assert_eq!(exit.side, Side::Sell);
        assert!((exit.notional - (0.40 * 25.0 * 0.80)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn minor_reduction_under_threshold_is_ignored() {
        let (mirror, _store) = strategy(MockAdapter {
            external: vec![ExternalPositionView { market_id: "m1".to_string(), token_id: "tok-a".to_string(), size: 80.0, avg_cost: 0.40 }],
            prices: HashMap::from([("tok-a".to_string(), 0.45)]),
        })
        .await;

        mirror
            .set_state(json!({
                "0xSource": [{"market_id": "m1", "token_id": "tok-a", "size": 100.0, "avg_cost": 0.40}],
            }))
            .await;

        let intents = mirror.poll_account("0xSource").await;
        assert!(intents.is_empty());
    }
}
