//! EVM watcher loop: scans HTLC3S contract logs at >= 1 block depth,
//! matches HTLCCreated events to swaps by hashlocks, extracts the three
//! preimages from HTLCClaimed events and tie-breaks against contract
//! storage before forwarding anything to the engine.

use std::sync::Arc;

use anyhow::{Context as _, Result};

use crate::htlc::evm3s;
use crate::swap::engine::{Engine, EvidenceKind, SwapEvent};
use crate::swap::Chain;

use super::{reorg_depth, EvmInterest, DEGRADED_POLL, EVM_POLL};

pub async fn run(engine: Arc<Engine>) {
    let rpc = engine.ctx().evm.clone();
    loop {
        if let Err(err) = scan_once(&engine).await {
            tracing::warn!(error = %err, "evm watcher pass failed");
        }
        let poll = if rpc.health().is_degraded() {
            DEGRADED_POLL
        } else {
            EVM_POLL
        };
        tokio::time::sleep(poll).await;
    }
}

async fn scan_once(engine: &Arc<Engine>) -> Result<()> {
    let rpc = &engine.ctx().evm;
    let tip = rpc.block_number().await.context("read evm tip")?;
    // Events are consumed at >= 1 block depth only.
    let to_block = tip.saturating_sub(1);
    let from_block = to_block.saturating_sub(reorg_depth(Chain::Evm));
    let chain_now = rpc
        .latest_block_timestamp()
        .await
        .context("read evm clock")?;

    for interest in engine.ctx().watch.evm_interests() {
        if let Err(err) =
            scan_interest(engine, tip, from_block, to_block, chain_now, &interest).await
        {
            tracing::warn!(
                swap_id = %interest.swap_id,
                error = %err,
                "evm interest scan failed"
            );
        }
    }
    Ok(())
}

async fn scan_interest(
    engine: &Arc<Engine>,
    tip: u64,
    from_block: u64,
    to_block: u64,
    chain_now: u64,
    interest: &EvmInterest,
) -> Result<()> {
    let rpc = &engine.ctx().evm;
    let swap_id = &interest.swap_id;

    let logs = rpc
        .get_logs(&interest.contract, None, from_block, to_block)
        .await
        .context("fetch htlc contract logs")?;

    for log in &logs {
        let topics = match log.topics_decoded() {
            Ok(t) if !t.is_empty() => t,
            _ => continue,
        };
        let confirmations = log
            .block_number_u64()
            .map(|mined| (tip.saturating_sub(mined) + 1) as u32)
            .unwrap_or(0);
        let tx_hash = log.transaction_hash.clone().unwrap_or_default();

        if topics[0] == evm3s::created_event_topic() && interest.htlc_id.is_none() {
            let data = log.data_decoded()?;
            let Ok(created) = evm3s::decode_created_event(&topics, &data) else {
                continue;
            };
            // Match ours by reading the hashlocks out of contract storage.
            let storage = read_storage(engine, &interest.contract, &created.htlc_id).await?;
            if storage.as_ref().is_some_and(|s| s.hashlocks == interest.hashlocks) {
                engine.ctx().watch.set_evm_id(swap_id, created.htlc_id);
                deliver(
                    engine,
                    swap_id,
                    SwapEvent::EvmHtlcCreated {
                        htlc_id: created.htlc_id,
                        tx_hash: tx_hash.clone(),
                        confirmations,
                    },
                )
                .await;
            }
        } else if topics[0] == evm3s::claimed_event_topic() {
            let data = log.data_decoded()?;
            let Ok(claimed) = evm3s::decode_claimed_event(&topics, &data) else {
                continue;
            };
            if interest.htlc_id != Some(claimed.htlc_id) {
                continue;
            }
            // Storage read as the tie-break for the event.
            let storage = read_storage(engine, &interest.contract, &claimed.htlc_id).await?;
            if !storage.as_ref().is_some_and(|s| s.claimed) {
                tracing::warn!(
                    swap_id,
                    "HTLCClaimed event without claimed storage; skipping"
                );
                continue;
            }
            deliver(
                engine,
                swap_id,
                SwapEvent::ClaimSeen {
                    chain: Chain::Evm,
                    txid: tx_hash.clone(),
                    s_user: claimed.s_user,
                    s_lp1: claimed.s_lp1,
                    s_lp2: claimed.s_lp2,
                    confirmations,
                },
            )
            .await;
        } else if topics[0] == evm3s::refunded_event_topic() {
            let Ok(refunded_id) = evm3s::decode_refunded_event(&topics) else {
                continue;
            };
            if interest.htlc_id != Some(refunded_id) {
                continue;
            }
            deliver(
                engine,
                swap_id,
                SwapEvent::RefundSeen {
                    chain: Chain::Evm,
                    txid: tx_hash.clone(),
                    confirmations,
                },
            )
            .await;
        }
    }

    // Reorg detection on recorded evidence: a receipt the node no longer
    // returns means the tx fell out of the canonical chain.
    if let Ok(swap) = engine.get_swap(swap_id) {
        let leg = swap.leg(Chain::Evm);
        for (kind, evidence) in [
            (EvidenceKind::Fund, &leg.funded),
            (EvidenceKind::Claim, &leg.claimed),
            (EvidenceKind::Refund, &leg.refunded),
        ] {
            let Some(evidence) = evidence else { continue };
            if evidence.confirmations == 0 || evidence.txid.is_empty() {
                continue;
            }
            match rpc.tx_confirmations(&evidence.txid).await? {
                Some(confs) if confs as u32 > evidence.confirmations => {
                    deliver(
                        engine,
                        swap_id,
                        SwapEvent::Confirmations {
                            chain: Chain::Evm,
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
                        swap_id,
                        SwapEvent::Reorged {
                            chain: Chain::Evm,
                            kind,
                            txid: evidence.txid.clone(),
                        },
                    )
                    .await;
                }
            }
        }

        if swap.state.is_terminal() {
            let window = reorg_depth(Chain::Evm) as u32;
            let deep = |e: &Option<crate::swap::TxEvidence>| {
                e.as_ref().is_none_or(|e| e.confirmations > window)
            };
            if deep(&leg.funded) && deep(&leg.claimed) && deep(&leg.refunded) {
                engine.ctx().watch.unregister(Chain::Evm, swap_id);
            }
        }
    }

    // Timelock expiry runs on the chain clock, not the wall clock.
    if interest.timelock_unix > 0 && chain_now >= interest.timelock_unix {
        deliver(engine, swap_id, SwapEvent::TimelockExpired { chain: Chain::Evm }).await;
    }
    Ok(())
}

async fn read_storage(
    engine: &Arc<Engine>,
    contract: &str,
    htlc_id: &crate::swap::Hash32,
) -> Result<Option<evm3s::HtlcStorage>> {
    let out = engine
        .ctx()
        .evm
        .call_contract(contract, &evm3s::encode_get_htlc(htlc_id))
        .await
        .context("getHTLC call")?;
    if out.is_empty() {
        return Ok(None);
    }
    let storage = evm3s::decode_htlc_storage(&out).context("decode getHTLC output")?;
    Ok(storage.exists().then_some(storage))
}

async fn deliver(engine: &Arc<Engine>, swap_id: &str, event: SwapEvent) {
    if let Err(err) = engine.handle_event(swap_id, event).await {
        tracing::debug!(swap_id, error = %err, "watcher event not applied");
    }
}
