//! EVM JSON-RPC client (`eth_*` command set). Transactions are submitted
//! through a node-managed account; key handling stays in the daemon, as it
//! does for the UTXO chains.

use anyhow::{Context as _, Result};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ChainHealth, JsonRpcClient};
use crate::swap::{hash32_from_hex, Hash32};

/// One decoded `eth_getLogs` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct LogEntry {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(rename = "blockNumber")]
    pub block_number: Option<String>,
    #[serde(rename = "transactionHash")]
    pub transaction_hash: Option<String>,
    #[serde(default)]
    pub removed: bool,
}

impl LogEntry {
    pub fn block_number_u64(&self) -> Option<u64> {
        parse_quantity(self.block_number.as_deref()?)
    }

    pub fn topics_decoded(&self) -> Result<Vec<Hash32>> {
        self.topics
            .iter()
            .map(|t| hash32_from_hex(t).map_err(|e| anyhow::anyhow!("{e}")))
            .collect()
    }

    pub fn data_decoded(&self) -> Result<Vec<u8>> {
        hex::decode(self.data.trim_start_matches("0x")).context("decode log data")
    }
}

fn parse_quantity(s: &str) -> Option<u64> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16).ok()
}

fn quantity(v: u64) -> String {
    format!("0x{v:x}")
}

#[derive(Debug, Clone)]
pub struct EvmRpc {
    rpc: JsonRpcClient,
    /// Node-managed account used as `from` for submitted transactions.
    sender: String,
}

impl EvmRpc {
    pub fn new(url: impl Into<String>, sender: impl Into<String>) -> Result<Self> {
        Ok(Self {
            rpc: JsonRpcClient::new(url, "evm")?,
            sender: sender.into(),
        })
    }

    pub fn health(&self) -> ChainHealth {
        self.rpc.health()
    }

    pub async fn block_number(&self) -> Result<u64> {
        let hex: String = self.rpc.call("eth_blockNumber", json!([])).await?;
        parse_quantity(&hex).context("parse eth_blockNumber")
    }

    /// Timestamp of the latest block, the clock the EVM timelocks run on.
    pub async fn latest_block_timestamp(&self) -> Result<u64> {
        let block: Value = self
            .rpc
            .call("eth_getBlockByNumber", json!(["latest", false]))
            .await?;
        let ts = block
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(parse_quantity)
            .context("block has no timestamp")?;
        Ok(ts)
    }

    pub async fn get_logs(
        &self,
        address: &str,
        topic0: Option<&Hash32>,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LogEntry>> {
        let mut filter = json!({
            "address": address,
            "fromBlock": quantity(from_block),
            "toBlock": quantity(to_block),
        });
        if let Some(topic) = topic0 {
            filter["topics"] = json!([format!("0x{}", hex::encode(topic))]);
        }
        self.rpc.call("eth_getLogs", json!([filter])).await
    }

    /// Read-only contract call; returns the raw return data.
    pub async fn call_contract(&self, to: &str, data: &[u8]) -> Result<Vec<u8>> {
        let hex_out: String = self
            .rpc
            .call(
                "eth_call",
                json!([{ "to": to, "data": format!("0x{}", hex::encode(data)) }, "latest"]),
            )
            .await?;
        hex::decode(hex_out.trim_start_matches("0x")).context("decode eth_call output")
    }

    /// Submit a state-changing call through the node account. Returns the
    /// transaction hash.
    pub async fn send_contract_tx(&self, to: &str, data: &[u8]) -> Result<String> {
        self.rpc
            .call(
                "eth_sendTransaction",
                json!([{
                    "from": self.sender,
                    "to": to,
                    "data": format!("0x{}", hex::encode(data)),
                }]),
            )
            .await
    }

    pub async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<Value>> {
        let v: Value = self
            .rpc
            .call("eth_getTransactionReceipt", json!([tx_hash]))
            .await?;
        Ok(if v.is_null() { None } else { Some(v) })
    }

    /// Confirmations of a transaction, 0 while pending, `None` when the
    /// node no longer knows it.
    pub async fn tx_confirmations(&self, tx_hash: &str) -> Result<Option<u64>> {
        let Some(receipt) = self.transaction_receipt(tx_hash).await? else {
            return Ok(None);
        };
        let Some(mined) = receipt
            .get("blockNumber")
            .and_then(Value::as_str)
            .and_then(parse_quantity)
        else {
            return Ok(Some(0));
        };
        let tip = self.block_number().await?;
        Ok(Some(tip.saturating_sub(mined) + 1))
    }

    /// ERC-20 `balanceOf(sender)` in the token's atomic units.
    pub async fn token_balance(&self, token: &str) -> Result<u64> {
        // balanceOf(address) selector 0x70a08231.
        let mut data = vec![0x70, 0xa0, 0x82, 0x31];
        let addr = self.sender.trim_start_matches("0x");
        let addr_bytes = hex::decode(addr).context("decode sender address")?;
        anyhow::ensure!(addr_bytes.len() == 20, "sender address must be 20 bytes");
        data.extend_from_slice(&[0u8; 12]);
        data.extend_from_slice(&addr_bytes);

        let out = self.call_contract(token, &data).await?;
        anyhow::ensure!(out.len() >= 32, "balanceOf returned short word");
        anyhow::ensure!(
            out[..24].iter().all(|b| *b == 0),
            "token balance exceeds u64"
        );
        Ok(u64::from_be_bytes(out[24..32].try_into().expect("8 bytes")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantities_round_trip() {
        assert_eq!(parse_quantity("0x10"), Some(16));
        assert_eq!(parse_quantity(&quantity(84532)), Some(84532));
        assert_eq!(parse_quantity("nonsense"), None);
    }

    #[test]
    fn log_entry_decodes_fields() {
        let log = LogEntry {
            address: "0xcc".into(),
            topics: vec![format!("0x{}", "11".repeat(32))],
            data: format!("0x{}", "22".repeat(32)),
            block_number: Some("0x1a".into()),
            transaction_hash: Some("0xabc".into()),
            removed: false,
        };
        assert_eq!(log.block_number_u64(), Some(26));
        assert_eq!(log.topics_decoded().unwrap()[0], [0x11; 32]);
        assert_eq!(log.data_decoded().unwrap(), vec![0x22; 32]);
    }
}
