//! Interface-only stubs for the two non-core strategies named in spec
//! §4.8.2. Their detailed behavior (scan cadence, order-book depth
//! thresholds, resting-order reconciliation) is out of scope; these types
//! exist so the `Strategy` trait surface they'd implement is documented
//! somewhere concrete rather than only in prose.

use async_trait::async_trait;

use crate::intent::Intent;
use crate::strategy::Strategy;

/// Scans active binary markets for `ask(Yes) + ask(No) < 1 - total_fees`
/// and emits paired IMMEDIATE_OR_KILL legs with `arb_leg`/rollback
/// metadata on the second leg (see `OrderManager::rollback_paired_leg`).
pub struct ParityArbitrageScanner;

#[async_trait]
impl Strategy for ParityArbitrageScanner {
    fn name(&self) -> &str {
        "parity_arbitrage"
    }

    async fn evaluate(&self) -> Vec<Intent> {
        unimplemented!("parity-arbitrage scanning is out of scope")
    }
}

/// Places resting BUY intents 70-90% below mid on high-volume markets,
/// reconciling open orders against the exchange's order list each cycle
/// under a max-active-bids cap and a one-bid-per-market rule.
pub struct DeepDiscountRestingOrders;

#[async_trait]
impl Strategy for DeepDiscountRestingOrders {
    fn name(&self) -> &str {
        "deep_discount_resting"
    }

    async fn evaluate(&self) -> Vec<Intent> {
        unimplemented!("deep-discount resting-order strategy is out of scope")
    }
}
