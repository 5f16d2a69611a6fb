//! Live `ExchangeAdapter` backed by the Polymarket CLOB REST API and the
//! Gamma market-discovery API. Grounded on `polymarket::executor::Executor`
//! (`init_clob_client`, `place_post_only_order`, `cancel_order`,
//! `cancel_all_orders`) for order plumbing and on `gamma_http::GammaClient`
//! for market discovery, reworked from that crate's single-market
//! YES/NO-pair scope to the generic by-token-id contract this crate's
//! `ExchangeAdapter` trait requires.
//!
//! Wire-format and signing internals are intentionally thin here — the
//! spec scopes exchange plumbing to this adapter interface, not to a
//! from-scratch CLOB client, so this leans on `polymarket-client-sdk` for
//! signing/order construction exactly as the base crate does.

use alloy_signer_local::PrivateKeySigner;
use async_trait::async_trait;
use polymarket_client_sdk::auth::state::Authenticated;
use polymarket_client_sdk::clob::{Client as ClobClient, Config as ClobConfig};
use rust_decimal::prelude::FromPrimitive;
use tokio::sync::Mutex;
use tracing::warn;

use super::{ExchangeAdapter, ExternalPositionView, Market, MarketFilter, OrderResult, OrderView};
use crate::intent::{Discipline, Side};

type AuthClient = ClobClient<Authenticated<polymarket_client_sdk::auth::Normal>>;

const GAMMA_API_BASE: &str = "https://gamma-api.polymarket.com";

#[derive(Debug, serde::Deserialize)]
struct GammaMarket {
    #[serde(rename = "conditionId")]
    condition_id: String,
    question: Option<String>,
    #[serde(rename = "clobTokenIds")]
    clob_token_ids: String,
    #[serde(rename = "outcomePrices")]
    outcome_prices: Option<String>,
    volume: Option<String>,
    liquidity: Option<String>,
    active: Option<bool>,
    closed: Option<bool>,
    #[serde(default)]
    resolved: bool,
}

impl GammaMarket {
    fn into_market(self) -> eyre::Result<Market> {
        let token_ids: Vec<String> = serde_json::from_str(&self.clob_token_ids)?;
        if token_ids.len() < 2 {
            eyre::bail!("market {} has fewer than 2 clob token ids", self.condition_id);
        }
        let prices: Vec<f64> = self
            .outcome_prices
            .as_deref()
            .and_then(|p| serde_json::from_str::<Vec<String>>(p).ok())
            .map(|v| v.into_iter().filter_map(|s| s.parse().ok()).collect())
            .unwrap_or_default();

        Ok(Market {
            market_id: self.condition_id,
            question: self.question.unwrap_or_default(),
            yes_token_id: token_ids[0].clone(),
            no_token_id: token_ids[1].clone(),
            yes_price: prices.first().copied(),
            no_price: prices.get(1).copied(),
            volume: self.volume.and_then(|v| v.parse().ok()).unwrap_or(0.0),
            liquidity: self.liquidity.and_then(|v| v.parse().ok()).unwrap_or(0.0),
            active: self.active.unwrap_or(false),
            closed: self.closed.unwrap_or(false),
            resolved: self.resolved,
        })
    }
}

pub struct ClobAdapter {
    gamma_http: reqwest::Client,
    client: AuthClient,
    signer: PrivateKeySigner,
    /// Tracked purely so `list_open_orders` can answer without a round trip
    /// when the exchange's own open-orders endpoint is unavailable; refreshed
    /// from the exchange on every cancel-all.
    open_orders: Mutex<Vec<OrderView>>,
}

impl ClobAdapter {
    /// Authenticates against the CLOB with the given signer, mirroring
    /// `executor.rs::init_clob_client`.
    pub async fn connect(rest_url: &str, private_key: &str) -> eyre::Result<Self> {
        let signer: PrivateKeySigner = private_key.parse().map_err(|e| eyre::eyre!("invalid private key: {e}"))?;
        let client = ClobClient::new(rest_url, ClobConfig::default()).map_err(|e| eyre::eyre!("clob client init failed: {e}"))?;
        let client = client
            .authentication_builder(&signer)
            .authenticate()
            .await
            .map_err(|e| eyre::eyre!("clob authentication failed: {e}"))?;

        Ok(Self {
            gamma_http: reqwest::Client::new(),
            client,
            signer,
            open_orders: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ExchangeAdapter for ClobAdapter {
    async fn list_markets(&self, filter: MarketFilter) -> eyre::Result<Vec<Market>> {
        let mut url = format!("{GAMMA_API_BASE}/markets?limit={}", filter.limit.unwrap_or(100));
        if let Some(active) = filter.active {
            url.push_str(&format!("&active={active}"));
        }
        if let Some(category) = &filter.category {
            url.push_str(&format!("&tag={category}"));
        }

        let resp = self.gamma_http.get(&url).send().await?;
        if !resp.status().is_success() {
            eyre::bail!("gamma /markets returned {}", resp.status());
        }
        let raw: Vec<GammaMarket> = resp.json().await?;

        let mut markets = Vec::new();
        for m in raw {
            match m.into_market() {
                Ok(market) => {
                    if filter.min_volume.is_some_and(|min| market.volume < min) {
                        continue;
                    }
                    if filter.min_liquidity.is_some_and(|min| market.liquidity < min) {
                        continue;
                    }
                    markets.push(market);
                }
                Err(e) => warn!(error = %e, "gamma_market_skipped"),
            }
        }
        Ok(markets)
    }

    async fn get_market(&self, market_id: &str) -> eyre::Result<Option<Market>> {
        let url = format!("{GAMMA_API_BASE}/markets?condition_ids={market_id}");
        let resp = self.gamma_http.get(&url).send().await?;
        if !resp.status().is_success() {
            eyre::bail!("gamma /markets lookup returned {}", resp.status());
        }
        let raw: Vec<GammaMarket> = resp.json().await?;
        Ok(raw.into_iter().next().and_then(|m| m.into_market().ok()))
    }

    async fn best_bid_ask(&self, token_id: &str) -> eyre::Result<(Option<f64>, Option<f64>)> {
        let book = self
            .client
            .get_order_book(token_id)
            .await
            .map_err(|e| eyre::eyre!("order book fetch failed: {e}"))?;
        let best_bid = book.bids.first().and_then(|l| l.price.to_string().parse().ok());
        let best_ask = book.asks.first().and_then(|l| l.price.to_string().parse().ok());
        Ok((best_bid, best_ask))
    }

    async fn last_price(&self, token_id: &str) -> eyre::Result<Option<f64>> {
        let (bid, ask) = self.best_bid_ask(token_id).await?;
        Ok(match (bid, ask) {
            (Some(b), Some(a)) => Some((b + a) / 2.0),
            (Some(b), None) => Some(b),
            (None, Some(a)) => Some(a),
            (None, None) => None,
        })
    }

    async fn submit_order(
        &self,
        token_id: &str,
        side: Side,
        price: f64,
        size_shares: f64,
        discipline: Discipline,
        _expiration: Option<i64>,
    ) -> eyre::Result<OrderResult> {
        use polymarket_client_sdk::clob::types::{OrderStatusType, Side as SdkSide};

        let price_rounded = (price * 1000.0).round() / 1000.0;
        let size_rounded = (size_shares * 1_000_000.0).round() / 1_000_000.0;
        let price_decimal = rust_decimal::Decimal::from_f64(price_rounded).ok_or_else(|| eyre::eyre!("invalid price"))?;
        let size_decimal = rust_decimal::Decimal::from_f64(size_rounded).ok_or_else(|| eyre::eyre!("invalid size"))?;
        let token_id_uint = alloy_primitives::U256::from_str_radix(token_id, 10).map_err(|_| eyre::eyre!("invalid token_id"))?;
        let sdk_side = match side {
            Side::Buy => SdkSide::Buy,
            Side::Sell => SdkSide::Sell,
        };

        let order = self
            .client
            .limit_order()
            .token_id(token_id_uint)
            .size(size_decimal)
            .price(price_decimal)
            .side(sdk_side)
            .post_only(matches!(discipline, Discipline::Resting))
            .build()
            .await
            .map_err(|e| eyre::eyre!("order build failed: {e}"))?;

        let signed = self.client.sign(&self.signer, order).await.map_err(|e| eyre::eyre!("order sign failed: {e}"))?;
        let response = self.client.post_order(signed).await.map_err(|e| eyre::eyre!("order post failed: {e}"))?;

        if !response.success || !matches!(response.status, OrderStatusType::Live | OrderStatusType::Matched) {
            return Ok(OrderResult::failure(response.error_msg.unwrap_or_else(|| "order rejected".to_string())));
        }

        if matches!(discipline, Discipline::Resting) {
            self.open_orders.lock().await.push(OrderView {
                order_id: response.order_id.clone(),
                market_id: String::new(),
                token_id: token_id.to_string(),
                price,
                side,
            });
        }

        Ok(OrderResult::success(response.order_id))
    }

    async fn cancel_order(&self, order_id: &str) -> eyre::Result<bool> {
        match self.client.cancel_order(order_id).await {
            Ok(_) => {
                self.open_orders.lock().await.retain(|o| o.order_id != order_id);
                Ok(true)
            }
            Err(e) => {
                warn!(error = %e, order_id, "cancel_order_failed");
                Ok(false)
            }
        }
    }

    async fn cancel_all_orders(&self) -> eyre::Result<bool> {
        match self.client.cancel_all_orders().await {
            Ok(_) => {
                self.open_orders.lock().await.clear();
                Ok(true)
            }
            Err(e) => {
                warn!(error = %e, "cancel_all_orders_failed_falling_back_to_per_order");
                let ids: Vec<String> = self.open_orders.lock().await.iter().map(|o| o.order_id.clone()).collect();
                let mut all_ok = true;
                for id in ids {
                    all_ok &= self.cancel_order(&id).await.unwrap_or(false);
                }
                Ok(all_ok)
            }
        }
    }

    async fn list_open_orders(&self) -> eyre::Result<Vec<OrderView>> {
        Ok(self.open_orders.lock().await.clone())
    }

    async fn list_external_positions(&self, account_id: &str) -> eyre::Result<Vec<ExternalPositionView>> {
        let url = format!("https://data-api.polymarket.com/positions?user={account_id}");
        let resp = self.gamma_http.get(&url).send().await?;
        if !resp.status().is_success() {
            eyre::bail!("data-api /positions returned {}", resp.status());
        }
        #[derive(serde::Deserialize)]
        struct RawPosition {
            #[serde(rename = "conditionId")]
            condition_id: String,
            asset: String,
            size: f64,
            #[serde(rename = "avgPrice")]
            avg_price: f64,
        }
        let raw: Vec<RawPosition> = resp.json().await?;
        Ok(raw
            .into_iter()
            .map(|p| ExternalPositionView {
                market_id: p.condition_id,
                token_id: p.asset,
                size: p.size,
                avg_cost: p.avg_price,
            })
            .collect())
    }
}
