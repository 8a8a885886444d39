//! Bitcoin Core style JSON-RPC client. Also the wire protocol of the M1
//! daemon, which speaks the same command set.

use anyhow::{Context as _, Result};
use serde_json::{json, Value};

use super::{ChainHealth, JsonRpcClient};

/// One unspent output found by `scantxoutset`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanUtxo {
    pub txid: String,
    pub vout: u32,
    pub amount_sats: u64,
    pub height: u64,
    pub confirmations: u64,
}

/// Funding candidate seen in the mempool, with the 0-conf safety facts.
#[derive(Debug, Clone, PartialEq)]
pub struct MempoolFunding {
    pub txid: String,
    pub vout: u32,
    pub amount_sats: u64,
    pub rbf_signaled: bool,
    pub fee_rate_sat_vb: Option<u64>,
}

/// A spend of a watched outpoint, with its witness for classification.
#[derive(Debug, Clone, PartialEq)]
pub struct OutpointSpend {
    pub txid: String,
    pub witness: Vec<Vec<u8>>,
    pub confirmations: u64,
}

#[derive(Debug, Clone)]
pub struct UtxoChainRpc {
    rpc: JsonRpcClient,
}

impl UtxoChainRpc {
    pub fn new(url: impl Into<String>, chain: &'static str) -> Result<Self> {
        Ok(Self {
            rpc: JsonRpcClient::new(url, chain)?,
        })
    }

    pub fn health(&self) -> ChainHealth {
        self.rpc.health()
    }

    pub async fn block_count(&self) -> Result<u64> {
        self.rpc.call("getblockcount", json!([])).await
    }

    pub async fn block_hash(&self, height: u64) -> Result<String> {
        self.rpc.call("getblockhash", json!([height])).await
    }

    /// Full block with decoded transactions (verbosity 2).
    pub async fn block_full(&self, hash: &str) -> Result<Value> {
        self.rpc.call("getblock", json!([hash, 2])).await
    }

    pub async fn raw_mempool(&self) -> Result<Vec<String>> {
        self.rpc.call("getrawmempool", json!([])).await
    }

    pub async fn raw_transaction(&self, txid: &str) -> Result<Value> {
        self.rpc.call("getrawtransaction", json!([txid, true])).await
    }

    pub async fn send_raw_transaction(&self, tx_hex: &str) -> Result<String> {
        self.rpc.call("sendrawtransaction", json!([tx_hex])).await
    }

    /// Fund an address from the daemon wallet. Returns the funding txid.
    pub async fn send_to_address(&self, address: &str, amount_sats: u64) -> Result<String> {
        let amount_btc = format!("{:.8}", amount_sats as f64 / 100_000_000.0);
        self.rpc
            .call("sendtoaddress", json!([address, amount_btc]))
            .await
    }

    /// Fresh receive address from the daemon wallet.
    pub async fn new_address(&self) -> Result<String> {
        self.rpc.call("getnewaddress", json!([])).await
    }

    pub async fn wallet_balance_sats(&self) -> Result<u64> {
        let btc: f64 = self.rpc.call("getbalance", json!([])).await?;
        Ok((btc * 100_000_000.0).round() as u64)
    }

    pub async fn estimate_fee_rate_sat_vb(&self, target_blocks: u32) -> Result<u64> {
        let resp: Value = self
            .rpc
            .call("estimatesmartfee", json!([target_blocks]))
            .await?;
        let btc_per_kvb = resp
            .get("feerate")
            .and_then(Value::as_f64)
            .unwrap_or(0.000_01);
        Ok(((btc_per_kvb * 100_000_000.0) / 1_000.0).ceil().max(1.0) as u64)
    }

    /// Confirmed unspent outputs paying `address`.
    pub async fn scan_address_utxos(&self, address: &str) -> Result<Vec<ScanUtxo>> {
        let resp: Value = self
            .rpc
            .call(
                "scantxoutset",
                json!(["start", [format!("addr({address})")]]),
            )
            .await?;

        if !resp.get("success").and_then(Value::as_bool).unwrap_or(false) {
            anyhow::bail!("scantxoutset did not complete");
        }
        let tip = resp.get("height").and_then(Value::as_u64).unwrap_or(0);

        let mut out = Vec::new();
        for utxo in resp
            .get("unspents")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
        {
            let txid = utxo
                .get("txid")
                .and_then(Value::as_str)
                .context("scan utxo has no txid")?
                .to_string();
            let vout = utxo.get("vout").and_then(Value::as_u64).unwrap_or(0) as u32;
            let amount_sats = btc_value_to_sats(utxo.get("amount"))?;
            let height = utxo.get("height").and_then(Value::as_u64).unwrap_or(0);
            let confirmations = if height > 0 && tip >= height {
                tip - height + 1
            } else {
                0
            };
            out.push(ScanUtxo {
                txid,
                vout,
                amount_sats,
                height,
                confirmations,
            });
        }
        Ok(out)
    }

    /// Scan the mempool for an unconfirmed funding of `address`, carrying
    /// the RBF and fee-rate facts the 0-conf gate needs. Fails closed: if
    /// the mempool entry cannot be read, the fee rate stays `None`.
    pub async fn scan_mempool_funding(
        &self,
        address: &str,
        min_amount_sats: u64,
    ) -> Result<Option<MempoolFunding>> {
        let txids = self.raw_mempool().await?;
        for txid in txids {
            let Ok(tx) = self.raw_transaction(&txid).await else {
                continue;
            };
            let Some(vout) = find_vout_to_address(&tx, address, min_amount_sats) else {
                continue;
            };

            let rbf_signaled = tx
                .get("vin")
                .and_then(Value::as_array)
                .is_some_and(|vins| {
                    vins.iter().any(|vin| {
                        vin.get("sequence").and_then(Value::as_u64).unwrap_or(u64::MAX)
                            < 0xFFFF_FFFE
                    })
                });

            let fee_rate_sat_vb = self.mempool_fee_rate(&txid).await;
            let amount_sats = btc_value_to_sats(
                tx.get("vout")
                    .and_then(Value::as_array)
                    .and_then(|v| v.get(vout as usize))
                    .and_then(|v| v.get("value")),
            )?;

            return Ok(Some(MempoolFunding {
                txid,
                vout,
                amount_sats,
                rbf_signaled,
                fee_rate_sat_vb,
            }));
        }
        Ok(None)
    }

    async fn mempool_fee_rate(&self, txid: &str) -> Option<u64> {
        let entry: Value = self.rpc.call("getmempoolentry", json!([txid])).await.ok()?;
        let fee_btc = entry.get("fees")?.get("base")?.as_f64()?;
        let vsize = entry.get("vsize")?.as_u64()?;
        if vsize == 0 {
            return None;
        }
        Some(((fee_btc * 100_000_000.0) as u64) / vsize)
    }

    /// Find the transaction spending `txid:vout`, searching `scan_depth`
    /// recent blocks and then the mempool.
    pub async fn find_outpoint_spend(
        &self,
        txid: &str,
        vout: u32,
        scan_depth: u64,
    ) -> Result<Option<OutpointSpend>> {
        let tip = self.block_count().await?;
        let floor = tip.saturating_sub(scan_depth);

        let mut height = tip;
        while height > floor {
            let hash = self.block_hash(height).await?;
            let block = self.block_full(&hash).await?;
            for tx in block.get("tx").and_then(Value::as_array).into_iter().flatten() {
                if let Some(witness) = spend_witness_of(tx, txid, vout) {
                    return Ok(Some(OutpointSpend {
                        txid: tx
                            .get("txid")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        witness,
                        confirmations: tip - height + 1,
                    }));
                }
            }
            height -= 1;
        }

        for mempool_txid in self.raw_mempool().await? {
            let Ok(tx) = self.raw_transaction(&mempool_txid).await else {
                continue;
            };
            if let Some(witness) = spend_witness_of(&tx, txid, vout) {
                return Ok(Some(OutpointSpend {
                    txid: mempool_txid,
                    witness,
                    confirmations: 0,
                }));
            }
        }

        Ok(None)
    }

    /// Confirmations of `txid`, or `None` when the daemon no longer knows
    /// the transaction (dropped by a reorg).
    pub async fn tx_confirmations(&self, txid: &str) -> Result<Option<u64>> {
        match self.raw_transaction(txid).await {
            Ok(tx) => Ok(Some(
                tx.get("confirmations").and_then(Value::as_u64).unwrap_or(0),
            )),
            Err(_) => Ok(None),
        }
    }
}

fn btc_value_to_sats(value: Option<&Value>) -> Result<u64> {
    let btc = value.and_then(Value::as_f64).context("missing btc amount")?;
    Ok((btc * 100_000_000.0).round() as u64)
}

fn find_vout_to_address(tx: &Value, address: &str, min_amount_sats: u64) -> Option<u32> {
    for vout in tx.get("vout")?.as_array()? {
        let spk = vout.get("scriptPubKey")?;
        let addr = spk
            .get("address")
            .and_then(Value::as_str)
            .or_else(|| spk.get("addresses")?.as_array()?.first()?.as_str())
            .unwrap_or_default();
        if addr != address {
            continue;
        }
        let sats = btc_value_to_sats(vout.get("value")).ok()?;
        if sats >= min_amount_sats {
            return vout.get("n").and_then(Value::as_u64).map(|n| n as u32);
        }
    }
    None
}

fn spend_witness_of(tx: &Value, txid: &str, vout: u32) -> Option<Vec<Vec<u8>>> {
    for vin in tx.get("vin")?.as_array()? {
        let spends = vin.get("txid").and_then(Value::as_str) == Some(txid)
            && vin.get("vout").and_then(Value::as_u64) == Some(vout as u64);
        if !spends {
            continue;
        }
        let items: Vec<String> = vin
            .get("txinwitness")
            .and_then(|w| serde_json::from_value(w.clone()).ok())
            .unwrap_or_default();
        return items.iter().map(|w| hex::decode(w).ok()).collect();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn vout_lookup_matches_address_and_amount() {
        let tx = json!({
            "vout": [
                { "n": 0, "value": 0.0005, "scriptPubKey": { "address": "tb1qother" } },
                { "n": 1, "value": 0.001, "scriptPubKey": { "address": "tb1qhtlc" } },
            ]
        });
        assert_eq!(find_vout_to_address(&tx, "tb1qhtlc", 100_000), Some(1));
        assert_eq!(find_vout_to_address(&tx, "tb1qhtlc", 100_001), None);
        assert_eq!(find_vout_to_address(&tx, "tb1qmissing", 1), None);
    }

    #[test]
    fn spend_witness_extraction() {
        let tx = json!({
            "vin": [{
                "txid": "aa".repeat(32),
                "vout": 3,
                "txinwitness": ["3044", "01", ""],
            }]
        });
        let witness = spend_witness_of(&tx, &"aa".repeat(32), 3).unwrap();
        assert_eq!(witness, vec![vec![0x30, 0x44], vec![0x01], vec![]]);
        assert!(spend_witness_of(&tx, &"bb".repeat(32), 3).is_none());
    }
}
