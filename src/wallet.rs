//! Wallet (read-only contract): balance reads only. Signing and on-chain
//! transaction construction live behind the exchange adapter's
//! `submit_order`, not here — this module exists only so the risk manager
//! has something to ask "how much quote currency do we have".
//!
//! Grounded on the base crate's signer wiring in `polymarket/executor.rs`
//! (`alloy_signer_local::LocalSigner`) for the live implementation's key
//! handling, and on `rust_decimal` (already a base crate dependency) for the
//! 6-decimal fixed-point balance representation the spec calls for.

use async_trait::async_trait;
use rust_decimal::Decimal;

#[async_trait]
pub trait Wallet: Send + Sync {
    async fn quote_balance(&self) -> eyre::Result<Decimal>;
    async fn gas_balance(&self) -> eyre::Result<Decimal>;
}

/// Paper-mode wallet: a configurable, fixed quote balance with no on-chain
/// reads. Gas balance is irrelevant in paper mode; reported as zero.
pub struct PaperWallet {
    quote_balance: Decimal,
}

impl PaperWallet {
    pub fn new(starting_balance: f64) -> Self {
        Self {
            quote_balance: Decimal::from_f64_retain(starting_balance).unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Wallet for PaperWallet {
    async fn quote_balance(&self) -> eyre::Result<Decimal> {
        Ok(self.quote_balance)
    }

    async fn gas_balance(&self) -> eyre::Result<Decimal> {
        Ok(Decimal::ZERO)
    }
}

/// Live on-chain wallet: reads USDC.e balance and native gas balance for the
/// funder address via an RPC provider. The signer itself is owned by the
/// exchange adapter; this struct only needs the address to read balances.
pub struct LiveWallet {
    rpc_url: String,
    funder_address: alloy_primitives::Address,
    usdc_contract: alloy_primitives::Address,
    http: reqwest::Client,
}

impl LiveWallet {
    pub fn new(rpc_url: String, funder_address: alloy_primitives::Address, usdc_contract: alloy_primitives::Address) -> Self {
        Self {
            rpc_url,
            funder_address,
            usdc_contract,
            http: reqwest::Client::new(),
        }
    }

    async fn eth_call_balance_of(&self, contract: alloy_primitives::Address) -> eyre::Result<Decimal> {
        // `balanceOf(address)` selector 0x70a08231, left-padded address arg.
        let mut data = vec![0x70, 0xa0, 0x82, 0x31];
        data.extend_from_slice(&[0u8; 12]);
        data.extend_from_slice(self.funder_address.as_slice());
        let call = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_call",
            "params": [{ "to": format!("{contract:#x}"), "data": format!("0x{}", hex::encode(&data)) }, "latest"],
        });
        let resp: serde_json::Value = self.http.post(&self.rpc_url).json(&call).send().await?.json().await?;
        let hex_result = resp
            .get("result")
            .and_then(|v| v.as_str())
            .ok_or_else(|| eyre::eyre!("eth_call balanceOf: missing result"))?;
        let raw = u128::from_str_radix(hex_result.trim_start_matches("0x"), 16).unwrap_or(0);
        Ok(Decimal::from(raw) / Decimal::from(1_000_000u64))
    }
}

#[async_trait]
impl Wallet for LiveWallet {
    async fn quote_balance(&self) -> eyre::Result<Decimal> {
        self.eth_call_balance_of(self.usdc_contract).await
    }

    async fn gas_balance(&self) -> eyre::Result<Decimal> {
        let call = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_getBalance",
            "params": [format!("{:#x}", self.funder_address), "latest"],
        });
        let resp: serde_json::Value = self.http.post(&self.rpc_url).json(&call).send().await?.json().await?;
        let hex_result = resp
            .get("result")
            .and_then(|v| v.as_str())
            .ok_or_else(|| eyre::eyre!("eth_getBalance: missing result"))?;
        let wei = u128::from_str_radix(hex_result.trim_start_matches("0x"), 16).unwrap_or(0);
        Ok(Decimal::from(wei) / Decimal::from(1_000_000_000_000_000_000u128))
    }
}
