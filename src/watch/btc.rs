//! BTC watcher loop, and the UTXO-chain scan logic shared with the M1
//! watcher (the two chains speak the same daemon dialect).

use std::sync::Arc;

use anyhow::{Context as _, Result};

use crate::chains::btc::UtxoChainRpc;
use crate::swap::engine::{Engine, EvidenceKind, SwapEvent};
use crate::swap::{Chain, Swap, TxEvidence};
use crate::htlc::script3s::{classify_witness, SpendKind};

use super::{reorg_depth, UtxoInterest, BTC_POLL, DEGRADED_POLL};

pub async fn run(engine: Arc<Engine>) {
    let rpc = engine.ctx().btc.clone();
    loop {
        if let Err(err) = scan_chain(&engine, &rpc, Chain::Btc).await {
            tracing::warn!(error = %err, "btc watcher pass failed");
        }
        let poll = if rpc.health().is_degraded() {
            DEGRADED_POLL
        } else {
            BTC_POLL
        };
        tokio::time::sleep(poll).await;
    }
}

/// One scan pass over every registered interest on a UTXO chain.
pub(super) async fn scan_chain(
    engine: &Arc<Engine>,
    rpc: &UtxoChainRpc,
    chain: Chain,
) -> Result<()> {
    let tip = rpc.block_count().await.context("read chain tip")?;

    for interest in engine.ctx().watch.utxo_interests(chain) {
        if let Err(err) = scan_interest(engine, rpc, chain, tip, &interest).await {
            tracing::warn!(
                swap_id = %interest.swap_id,
                chain = %chain,
                error = %err,
                "interest scan failed"
            );
        }
    }
    Ok(())
}

async fn scan_interest(
    engine: &Arc<Engine>,
    rpc: &UtxoChainRpc,
    chain: Chain,
    tip: u64,
    interest: &UtxoInterest,
) -> Result<()> {
    let swap_id = &interest.swap_id;

    if interest.outpoint.is_none() && !interest.address.is_empty() {
        look_for_funding(engine, rpc, chain, interest).await?;
    }

    if let Some((fund_txid, vout)) = &interest.outpoint {
        track_funding_depth(engine, rpc, chain, swap_id, fund_txid).await?;
        look_for_spend(engine, rpc, chain, interest, fund_txid, *vout).await?;
    }

    // Timelock expiry: only meaningful once the leg is funded and still
    // unresolved; the engine re-checks against the swap record anyway.
    if interest.timelock_height > 0 && tip >= interest.timelock_height {
        deliver(engine, swap_id, SwapEvent::TimelockExpired { chain }).await;
    }

    // Drop settled interests once their evidence is past the reorg window.
    if let Ok(swap) = engine.get_swap(swap_id) {
        if swap.state.is_terminal() && evidence_beyond_reorg_window(&swap, chain) {
            engine.ctx().watch.unregister(chain, swap_id);
        }
    }
    Ok(())
}

async fn look_for_funding(
    engine: &Arc<Engine>,
    rpc: &UtxoChainRpc,
    chain: Chain,
    interest: &UtxoInterest,
) -> Result<()> {
    let utxos = rpc
        .scan_address_utxos(&interest.address)
        .await
        .context("scan htlc address")?;
    if let Some(utxo) = utxos
        .iter()
        .find(|u| u.amount_sats >= interest.expected_amount)
    {
        deliver(
            engine,
            &interest.swap_id,
            SwapEvent::FundingSeen {
                chain,
                txid: utxo.txid.clone(),
                vout: utxo.vout,
                amount: utxo.amount_sats,
                confirmations: utxo.confirmations as u32,
                rbf_safe: true,
            },
        )
        .await;
        return Ok(());
    }

    if interest.accept_zero_conf {
        if let Some(funding) = rpc
            .scan_mempool_funding(&interest.address, interest.expected_amount)
            .await
            .context("scan mempool for funding")?
        {
            // Fail-closed 0-conf gate: non-RBF and a readable, adequate
            // fee rate are both required.
            let min_rate = engine.ctx().cfg.zero_conf_min_fee_rate;
            let rbf_safe = !funding.rbf_signaled
                && funding.fee_rate_sat_vb.is_some_and(|r| r >= min_rate);
            deliver(
                engine,
                &interest.swap_id,
                SwapEvent::FundingSeen {
                    chain,
                    txid: funding.txid,
                    vout: funding.vout,
                    amount: funding.amount_sats,
                    confirmations: 0,
                    rbf_safe,
                },
            )
            .await;
        }
    }
    Ok(())
}

async fn track_funding_depth(
    engine: &Arc<Engine>,
    rpc: &UtxoChainRpc,
    chain: Chain,
    swap_id: &str,
    fund_txid: &str,
) -> Result<()> {
    match rpc.tx_confirmations(fund_txid).await? {
        Some(confs) => {
            deliver(
                engine,
                swap_id,
                SwapEvent::Confirmations {
                    chain,
                    kind: EvidenceKind::Fund,
                    txid: fund_txid.to_string(),
                    confirmations: confs as u32,
                },
            )
            .await;
        }
        None => {
            deliver(
                engine,
                swap_id,
                SwapEvent::Reorged {
                    chain,
                    kind: EvidenceKind::Fund,
                    txid: fund_txid.to_string(),
                },
            )
            .await;
        }
    }
    Ok(())
}

async fn look_for_spend(
    engine: &Arc<Engine>,
    rpc: &UtxoChainRpc,
    chain: Chain,
    interest: &UtxoInterest,
    fund_txid: &str,
    vout: u32,
) -> Result<()> {
    // Watch claim/refund evidence the engine already recorded: deepen it,
    // or report a rollback when the daemon no longer knows the tx.
    if let Ok(swap) = engine.get_swap(&interest.swap_id) {
        let leg = swap.leg(chain);
        for (kind, evidence) in [
            (EvidenceKind::Claim, &leg.claimed),
            (EvidenceKind::Refund, &leg.refunded),
        ] {
            let Some(evidence) = evidence else { continue };
            match rpc.tx_confirmations(&evidence.txid).await? {
                Some(confs) if confs as u32 > evidence.confirmations => {
                    deliver(
                        engine,
                        &interest.swap_id,
                        SwapEvent::Confirmations {
                            chain,
                            kind,
                            txid: evidence.txid.clone(),
                            confirmations: confs as u32,
                        },
                    )
                    .await;
                }
                Some(_) => {}
                None => {
                    deliver(
                        engine,
                        &interest.swap_id,
                        SwapEvent::Reorged {
                            chain,
                            kind,
                            txid: evidence.txid.clone(),
                        },
                    )
                    .await;
                }
            }
        }
        if leg.claimed.is_some() || leg.refunded.is_some() {
            return Ok(());
        }
    }

    let depth = reorg_depth(chain).max(6);
    let Some(spend) = rpc
        .find_outpoint_spend(fund_txid, vout, depth)
        .await
        .context("search for outpoint spend")?
    else {
        return Ok(());
    };

    let script_raw = hex::decode(&interest.redeem_script_hex)
        .context("decode interest redeem script")?;
    let script = bitcoin::ScriptBuf::from_bytes(script_raw);

    match classify_witness(&spend.witness, &script) {
        Some(SpendKind::Claim { s_user, s_lp1, s_lp2 }) => {
            deliver(
                engine,
                &interest.swap_id,
                SwapEvent::ClaimSeen {
                    chain,
                    txid: spend.txid,
                    s_user,
                    s_lp1,
                    s_lp2,
                    confirmations: spend.confirmations as u32,
                },
            )
            .await;
        }
        Some(SpendKind::Refund) => {
            deliver(
                engine,
                &interest.swap_id,
                SwapEvent::RefundSeen {
                    chain,
                    txid: spend.txid,
                    confirmations: spend.confirmations as u32,
                },
            )
            .await;
        }
        None => {
            tracing::warn!(
                swap_id = %interest.swap_id,
                txid = %spend.txid,
                "watched outpoint spent by a foreign witness"
            );
        }
    }
    Ok(())
}

fn evidence_beyond_reorg_window(swap: &Swap, chain: Chain) -> bool {
    let window = reorg_depth(chain) as u32;
    let deep = |e: &Option<TxEvidence>| e.as_ref().is_none_or(|e| e.confirmations > window);
    let leg = swap.leg(chain);
    deep(&leg.claimed) && deep(&leg.refunded) && deep(&leg.funded)
}

async fn deliver(engine: &Arc<Engine>, swap_id: &str, event: SwapEvent) {
    if let Err(err) = engine.handle_event(swap_id, event).await {
        tracing::debug!(swap_id, error = %err, "watcher event not applied");
    }
}
