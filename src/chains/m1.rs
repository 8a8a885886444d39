//! M1 daemon client. The M1 node speaks the Bitcoin Core JSON-RPC dialect;
//! sats on M1 map 1:1 to sats on BTC, so amounts go through unchanged. Only
//! the address network parameters differ, and those live in the HTLC codec.

use anyhow::Result;

use super::btc::{MempoolFunding, OutpointSpend, ScanUtxo, UtxoChainRpc};
use super::ChainHealth;

#[derive(Debug, Clone)]
pub struct M1Rpc {
    inner: UtxoChainRpc,
}

impl M1Rpc {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            inner: UtxoChainRpc::new(url, "m1")?,
        })
    }

    pub fn health(&self) -> ChainHealth {
        self.inner.health()
    }

    /// The raw client; the shared UTXO watcher scan runs against it.
    pub fn inner(&self) -> &UtxoChainRpc {
        &self.inner
    }

    pub async fn block_count(&self) -> Result<u64> {
        self.inner.block_count().await
    }

    pub async fn send_raw_transaction(&self, tx_hex: &str) -> Result<String> {
        self.inner.send_raw_transaction(tx_hex).await
    }

    pub async fn send_to_address(&self, address: &str, amount_sats: u64) -> Result<String> {
        self.inner.send_to_address(address, amount_sats).await
    }

    pub async fn new_address(&self) -> Result<String> {
        self.inner.new_address().await
    }

    pub async fn wallet_balance_sats(&self) -> Result<u64> {
        self.inner.wallet_balance_sats().await
    }

    pub async fn estimate_fee_rate_sat_vb(&self, target_blocks: u32) -> Result<u64> {
        self.inner.estimate_fee_rate_sat_vb(target_blocks).await
    }

    pub async fn scan_address_utxos(&self, address: &str) -> Result<Vec<ScanUtxo>> {
        self.inner.scan_address_utxos(address).await
    }

    pub async fn scan_mempool_funding(
        &self,
        address: &str,
        min_amount_sats: u64,
    ) -> Result<Option<MempoolFunding>> {
        self.inner.scan_mempool_funding(address, min_amount_sats).await
    }

    pub async fn find_outpoint_spend(
        &self,
        txid: &str,
        vout: u32,
        scan_depth: u64,
    ) -> Result<Option<OutpointSpend>> {
        self.inner.find_outpoint_spend(txid, vout, scan_depth).await
    }

    pub async fn tx_confirmations(&self, txid: &str) -> Result<Option<u64>> {
        self.inner.tx_confirmations(txid).await
    }
}
