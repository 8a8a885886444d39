//! The swap engine: sole mutator of swap state.
//!
//! Event handling is split into three phases. Decide: under the per-swap
//! lock, the pure [`transition`] function maps (swap, event) to state steps
//! plus intended chain actions. Commit: still under the lock, [`apply`]
//! records the steps and the snapshot is persisted. Perform: chain RPC and
//! peer HTTP run with no swap lock held; their results come back in as
//! ordinary events or as a short re-locked commit that is discarded when
//! the state moved underneath it.
//!
//! Lock scopes are leaf-only: the store mutex, a chain broadcast mutex and
//! a per-swap lock are never held at the same time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use bitcoin::Network;

use crate::chains::btc::UtxoChainRpc;
use crate::chains::evm::EvmRpc;
use crate::chains::m1::M1Rpc;
use crate::config::{LpConfig, BTC_BLOCK_SECS, M1_BLOCK_SECS};
use crate::error::{EngineError, EngineResult};
use crate::htlc::evm3s::{self, CreateCall};
use crate::htlc::script3s::{self, Htlc3sFunding, Htlc3sSpec};
use crate::keys::LpKeys;
use crate::notify::{M1LockedNotice, PeerNotifier, SecretsNotice};
use crate::swap::store::JsonStore;
use crate::swap::{
    Asset, Chain, Direction, Hash32, Hashlocks, LpRole, Reservation, RoutingMode, Secrets, Swap,
    SwapState, TxEvidence,
};
use crate::watch::{EvmInterest, UtxoInterest, WatchTable};

use super::inventory::Inventory;

/// Vsize estimates for fee computation of HTLC spends.
const CLAIM_VSIZE: u64 = 330;
const REFUND_VSIZE: u64 = 180;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceKind {
    Fund,
    Claim,
    Refund,
}

/// Events the engine serializes per swap.
#[derive(Debug, Clone)]
pub enum SwapEvent {
    /// A funding output paying a watched HTLC address.
    FundingSeen {
        chain: Chain,
        txid: String,
        vout: u32,
        amount: u64,
        confirmations: u32,
        /// Mempool funding passed the non-RBF / fee-floor gate.
        rbf_safe: bool,
    },
    /// Known evidence deepened (or surfaced confirmed).
    Confirmations {
        chain: Chain,
        kind: EvidenceKind,
        txid: String,
        confirmations: u32,
    },
    /// A watched HTLC was spent through the claim branch; preimages attached.
    ClaimSeen {
        chain: Chain,
        txid: String,
        s_user: Hash32,
        s_lp1: Hash32,
        s_lp2: Hash32,
        confirmations: u32,
    },
    /// A watched HTLC was spent through the refund branch.
    RefundSeen {
        chain: Chain,
        txid: String,
        confirmations: u32,
    },
    /// HTLCCreated matched our hashlocks on the EVM chain.
    EvmHtlcCreated {
        htlc_id: Hash32,
        tx_hash: String,
        confirmations: u32,
    },
    /// The leg's timelock passed without resolution.
    TimelockExpired { chain: Chain },
    /// Previously observed evidence is no longer canonical.
    Reorged {
        chain: Chain,
        kind: EvidenceKind,
        txid: String,
    },
    /// Peer LP announced its M1 HTLC (we are LP_OUT).
    PeerM1Locked {
        outpoint: String,
        amount_sats: u64,
        expiry_height: u64,
        redeem_script_hex: String,
    },
    /// Peer LP handed back the revealed preimages (we are LP_IN).
    PeerSecrets {
        s_user: Hash32,
        s_lp1: Hash32,
        s_lp2: Hash32,
        claim_txid: String,
    },
    /// Periodic tick: plan expiry, parked-peer retry.
    Tick,
    /// Operator force-fail; only valid before any on-chain funding.
    ForceFail,
}

/// On-chain / outbound work the engine performs after committing a decide
/// phase. Reservations and watch registration are synchronous side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Reserve { asset: Asset, amount: u64 },
    /// Publish the LP's M1 HTLC.
    LockM1,
    /// Publish the EVM HTLC paying the user.
    LockUsdc,
    /// Publish the BTC HTLC paying the user (reverse direction).
    LockBtc,
    /// Sweep a leg with the known preimages.
    Claim(Chain),
    /// Broadcast the refund branch of a leg.
    Refund(Chain),
    NotifyPeerM1Locked,
    NotifyPeerSecrets,
    /// Persist the LP preimages (allowed once the publishing HTLC confirmed).
    DiscloseLpSecrets,
    UnwatchAll,
    ReleaseReservations,
}

/// Leg parameters learned during a transition (peer announcements).
#[derive(Debug, Clone)]
pub struct LegSetup {
    pub chain: Chain,
    pub amount: u64,
    pub timelock: u64,
    pub address: String,
    pub script_or_id: String,
}

#[derive(Debug, Clone)]
pub struct EvidenceUpdate {
    pub chain: Chain,
    pub kind: EvidenceKind,
    pub txid: String,
    pub confirmations: u32,
    pub outpoint: Option<String>,
    /// Clear instead of set (reorg rollback).
    pub clear: bool,
}

/// Outcome of the pure decide phase.
#[derive(Debug, Default)]
pub struct Transition {
    pub steps: Vec<(SwapState, String)>,
    pub notes: Vec<String>,
    pub actions: Vec<Action>,
    pub evidence: Vec<EvidenceUpdate>,
    /// Verified preimages to absorb.
    pub secrets: Option<(Hash32, Hash32, Hash32)>,
    pub evm_htlc_id: Option<Hash32>,
    pub leg_setup: Vec<LegSetup>,
    /// New parked-from marker when stepping into `peer_unreachable`.
    pub parked_from: Option<SwapState>,
}

impl Transition {
    fn step(&mut self, state: SwapState, note: impl Into<String>) {
        self.steps.push((state, note.into()));
    }

    fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    fn act(&mut self, action: Action) {
        if !self.actions.contains(&action) {
            self.actions.push(action);
        }
    }

    fn set_evidence(
        &mut self,
        chain: Chain,
        kind: EvidenceKind,
        txid: &str,
        confirmations: u32,
        outpoint: Option<String>,
    ) {
        self.evidence.push(EvidenceUpdate {
            chain,
            kind,
            txid: txid.to_string(),
            confirmations,
            outpoint,
            clear: false,
        });
    }

    fn clear_evidence(&mut self, chain: Chain, kind: EvidenceKind, txid: &str) {
        self.evidence.push(EvidenceUpdate {
            chain,
            kind,
            txid: txid.to_string(),
            confirmations: 0,
            outpoint: None,
            clear: true,
        });
    }

    pub fn is_noop(&self) -> bool {
        self.steps.is_empty()
            && self.notes.is_empty()
            && self.actions.is_empty()
            && self.evidence.is_empty()
            && self.secrets.is_none()
            && self.evm_htlc_id.is_none()
            && self.leg_setup.is_empty()
    }
}

/// Chains whose legs this LP funds and therefore owns the refund branch on.
pub fn lp_funded_chains(swap: &Swap) -> &'static [Chain] {
    match (&swap.routing, swap.direction) {
        (RoutingMode::SingleLp, Direction::Forward) => &[Chain::M1, Chain::Evm],
        (RoutingMode::SingleLp, Direction::Reverse) => &[Chain::M1, Chain::Btc],
        (RoutingMode::PerLeg { role: LpRole::LpIn, .. }, _) => &[Chain::M1],
        (RoutingMode::PerLeg { role: LpRole::LpOut, .. }, _) => &[Chain::Evm],
    }
}

/// The user-funded upstream chain the LP sweeps last.
pub fn upstream_chain(swap: &Swap) -> Chain {
    match (&swap.routing, swap.direction) {
        (RoutingMode::SingleLp, Direction::Forward) => Chain::Btc,
        (RoutingMode::SingleLp, Direction::Reverse) => Chain::Evm,
        (RoutingMode::PerLeg { role: LpRole::LpIn, .. }, _) => Chain::Btc,
        // LP_OUT's upstream is the peer's M1 HTLC.
        (RoutingMode::PerLeg { role: LpRole::LpOut, .. }, _) => Chain::M1,
    }
}

fn lp_role(swap: &Swap) -> Option<LpRole> {
    match &swap.routing {
        RoutingMode::PerLeg { role, .. } => Some(*role),
        RoutingMode::SingleLp => None,
    }
}

fn verify_secrets(
    locks: &Hashlocks,
    s_user: Hash32,
    s_lp1: Hash32,
    s_lp2: Hash32,
) -> EngineResult<(Hash32, Hash32, Hash32)> {
    let mut probe = Secrets::default();
    probe.absorb_verified(locks, s_user, s_lp1, s_lp2)?;
    Ok((s_user, s_lp1, s_lp2))
}

/// Pure decide phase: map one event onto state steps and intended actions.
///
/// Idempotent by construction: replaying an event against the state it
/// already produced yields a no-op transition.
pub fn transition(
    swap: &Swap,
    event: &SwapEvent,
    cfg: &LpConfig,
    now: u64,
) -> EngineResult<Transition> {
    use SwapState as S;

    let mut t = Transition::default();

    if swap.state.is_terminal() {
        // Only a reorg that orphans settlement evidence may reopen a
        // terminal swap (late-reorg recovery); everything else is a no-op.
        if let SwapEvent::Reorged { chain, kind: EvidenceKind::Claim, txid } = event {
            if swap.state == S::Completed
                && swap.leg(*chain).claimed.as_ref().is_some_and(|e| &e.txid == txid)
            {
                rollback_claim(swap, *chain, txid, &mut t);
            }
        }
        return Ok(t);
    }

    match event {
        SwapEvent::ForceFail => {
            if !swap.state.is_prefunding() || swap.any_leg_funded() {
                return Err(EngineError::BadState {
                    swap_id: swap.swap_id.clone(),
                    state: swap.state.to_string(),
                    operation: "force-fail",
                });
            }
            t.step(S::Failed, "operator force-fail");
            t.act(Action::UnwatchAll);
            t.act(Action::ReleaseReservations);
        }

        SwapEvent::Tick => {
            let unfunded_plan = swap.state.is_prefunding() && !swap.any_leg_funded();
            if unfunded_plan && now.saturating_sub(swap.created_at) >= cfg.plan_expiry_secs {
                t.step(S::Failed, "plan expired before user commitment");
                t.act(Action::UnwatchAll);
                t.act(Action::ReleaseReservations);
            } else if swap.state == S::PeerUnreachable {
                // Keep retrying the parked notify on the tick cadence.
                match swap.parked_from {
                    Some(S::M1LockedForLpOut) => t.act(Action::NotifyPeerM1Locked),
                    Some(S::M1ClaimedFromLpIn) => t.act(Action::NotifyPeerSecrets),
                    _ => {}
                }
            }
        }

        SwapEvent::FundingSeen { chain, txid, vout, amount, confirmations, rbf_safe } => {
            funding_seen(swap, cfg, &mut t, *chain, txid, *vout, *amount, *confirmations, *rbf_safe)?;
        }

        SwapEvent::Confirmations { chain, kind, txid, confirmations } => {
            confirmations_deepened(swap, cfg, &mut t, *chain, *kind, txid, *confirmations);
        }

        SwapEvent::ClaimSeen { chain, txid, s_user, s_lp1, s_lp2, confirmations } => {
            claim_seen(swap, cfg, &mut t, *chain, txid, *s_user, *s_lp1, *s_lp2, *confirmations)?;
        }

        SwapEvent::RefundSeen { chain, txid, confirmations } => {
            refund_seen(swap, &mut t, *chain, txid, *confirmations);
        }

        SwapEvent::EvmHtlcCreated { htlc_id, tx_hash, confirmations } => {
            evm_created(swap, cfg, &mut t, *htlc_id, tx_hash, *confirmations);
        }

        SwapEvent::TimelockExpired { chain } => {
            timelock_expired(swap, cfg, &mut t, *chain);
        }

        SwapEvent::Reorged { chain, kind, txid } => {
            reorged(swap, &mut t, *chain, *kind, txid);
        }

        SwapEvent::PeerM1Locked { outpoint, amount_sats, expiry_height, redeem_script_hex } => {
            if lp_role(swap) != Some(LpRole::LpOut) {
                return Err(EngineError::BadState {
                    swap_id: swap.swap_id.clone(),
                    state: swap.state.to_string(),
                    operation: "peer m1-locked notice",
                });
            }
            if swap.m1_leg.outpoint.is_none() {
                let (txid, vout) = outpoint
                    .split_once(':')
                    .and_then(|(txid, vout)| Some((txid.to_string(), vout.parse::<u32>().ok()?)))
                    .ok_or_else(|| {
                        EngineError::invariant(format!("malformed m1 outpoint {outpoint}"))
                    })?;

                // The announced script must bind the swap's own hashlocks
                // and the announced expiry, or the handoff is rejected.
                let raw = hex::decode(redeem_script_hex)
                    .map_err(|e| EngineError::invariant(format!("peer m1 script hex: {e}")))?;
                let spec = Htlc3sSpec::parse_redeem_script(bitcoin::Script::from_bytes(&raw))
                    .map_err(|e| EngineError::invariant(format!("peer m1 script: {e:#}")))?;
                if spec.hashlocks != swap.hashlocks {
                    return Err(EngineError::invariant(
                        "peer m1 script hashlocks do not match the swap",
                    ));
                }
                if spec.timelock_height as u64 != *expiry_height {
                    return Err(EngineError::invariant(
                        "peer m1 script timelock does not match the announced expiry",
                    ));
                }
                let network: Network = cfg
                    .chains
                    .m1_network
                    .parse()
                    .map_err(|_| EngineError::invariant("bad m1 network in config"))?;
                let address = spec.p2wsh_address(network).to_string();

                t.leg_setup.push(LegSetup {
                    chain: Chain::M1,
                    amount: *amount_sats,
                    timelock: *expiry_height,
                    address,
                    script_or_id: redeem_script_hex.clone(),
                });
                t.set_evidence(Chain::M1, EvidenceKind::Fund, &txid, 0, Some(format!("{txid}:{vout}")));
                t.note(format!(
                    "peer announced m1 htlc {outpoint} ({amount_sats} sats, expiry {expiry_height})"
                ));
            }
        }

        SwapEvent::PeerSecrets { s_user, s_lp1, s_lp2, claim_txid } => {
            if lp_role(swap) != Some(LpRole::LpIn) {
                return Err(EngineError::BadState {
                    swap_id: swap.swap_id.clone(),
                    state: swap.state.to_string(),
                    operation: "peer secrets notice",
                });
            }
            if !swap.secrets.complete() {
                t.secrets = Some(verify_secrets(&swap.hashlocks, *s_user, *s_lp1, *s_lp2)?);
                t.note(format!("peer handed back preimages (claim {claim_txid})"));
                if cfg.auto_claim {
                    t.act(Action::Claim(Chain::Btc));
                }
            }
        }
    }

    Ok(t)
}

#[allow(clippy::too_many_arguments)]
fn funding_seen(
    swap: &Swap,
    cfg: &LpConfig,
    t: &mut Transition,
    chain: Chain,
    txid: &str,
    vout: u32,
    amount: u64,
    confirmations: u32,
    rbf_safe: bool,
) -> EngineResult<()> {
    use SwapState as S;
    let outpoint = Some(format!("{txid}:{vout}"));

    match (swap.state, chain) {
        // User deposit on the forward upstream leg.
        (S::AwaitingBtc | S::BtcFundingSeen, Chain::Btc) => {
            if amount < swap.from_amount {
                t.note(format!(
                    "ignoring btc funding {txid}: {amount} sats below expected {}",
                    swap.from_amount
                ));
                return Ok(());
            }
            if confirmations == 0 && !rbf_safe {
                t.note(format!("ignoring unsafe 0-conf btc funding {txid}"));
                return Ok(());
            }

            t.set_evidence(Chain::Btc, EvidenceKind::Fund, txid, confirmations, outpoint);
            if amount != swap.btc_leg.amount {
                // Overfunded deposit: track the real output value so the
                // eventual sweep signs against the right amount.
                t.leg_setup.push(LegSetup {
                    chain: Chain::Btc,
                    amount,
                    timelock: swap.btc_leg.timelock,
                    address: swap.btc_leg.address.clone(),
                    script_or_id: swap.btc_leg.script_or_id.clone(),
                });
            }
            if swap.state == S::AwaitingBtc {
                t.step(S::BtcFundingSeen, format!("btc deposit seen in {txid}"));
            }
            let required = cfg.btc_confirmations_for(amount);
            if confirmations >= required {
                advance_to_btc_funded(swap, t);
            }
        }

        // The LP's own M1 lock confirming.
        (S::BtcFunded, Chain::M1) | (S::UsdcFunded, Chain::M1) => {
            t.set_evidence(Chain::M1, EvidenceKind::Fund, txid, confirmations, outpoint);
            if confirmations >= 1 {
                match (lp_role(swap), swap.direction) {
                    (Some(LpRole::LpIn), _) => {
                        t.step(S::M1LockedForLpOut, format!("m1 htlc confirmed in {txid}"));
                        t.act(Action::NotifyPeerM1Locked);
                    }
                    (None, Direction::Forward) => {
                        t.step(S::M1Locked, format!("m1 htlc confirmed in {txid}"));
                        t.act(Action::LockUsdc);
                    }
                    (None, Direction::Reverse) => {
                        t.step(S::M1Locked, format!("m1 htlc confirmed in {txid}"));
                        t.act(Action::LockBtc);
                    }
                    (Some(LpRole::LpOut), _) => {}
                }
            }
        }

        // Peer's M1 HTLC confirming (we are LP_OUT).
        (S::Init, Chain::M1) if lp_role(swap) == Some(LpRole::LpOut) => {
            t.set_evidence(Chain::M1, EvidenceKind::Fund, txid, confirmations, outpoint);
            if confirmations >= 1 {
                t.step(S::M1LockedSeen, format!("peer m1 htlc confirmed in {txid}"));
                t.act(Action::Reserve { asset: Asset::Usdc, amount: swap.to_amount });
                t.act(Action::LockUsdc);
            }
        }

        // The LP's own BTC lock confirming (reverse direction).
        (S::M1Locked, Chain::Btc) if swap.direction == Direction::Reverse => {
            t.set_evidence(Chain::Btc, EvidenceKind::Fund, txid, confirmations, outpoint);
            if confirmations >= 1 {
                t.step(S::BtcLocked, format!("btc htlc confirmed in {txid}"));
                // The user can only claim once it holds all three preimages.
                t.act(Action::DiscloseLpSecrets);
            }
        }

        _ => {
            // Deepening of already-known funding arrives as Confirmations;
            // anything else here is a duplicate or foreign observation.
            if swap.leg(chain).funded.as_ref().is_some_and(|e| e.txid == txid) {
                confirmations_deepened(swap, cfg, t, chain, EvidenceKind::Fund, txid, confirmations);
            }
        }
    }
    Ok(())
}

fn advance_to_btc_funded(swap: &Swap, t: &mut Transition) {
    use SwapState as S;
    t.step(S::BtcFunded, "btc deposit reached required confirmations");
    match lp_role(swap) {
        Some(LpRole::LpIn) => {
            t.act(Action::Reserve { asset: Asset::M1, amount: swap.from_amount });
        }
        None => {
            t.act(Action::Reserve { asset: Asset::M1, amount: swap.from_amount });
            t.act(Action::Reserve { asset: Asset::Usdc, amount: swap.to_amount });
        }
        Some(LpRole::LpOut) => {}
    }
    t.act(Action::LockM1);
}

fn confirmations_deepened(
    swap: &Swap,
    cfg: &LpConfig,
    t: &mut Transition,
    chain: Chain,
    kind: EvidenceKind,
    txid: &str,
    confirmations: u32,
) {
    use SwapState as S;

    let leg = swap.leg(chain);
    let existing = match kind {
        EvidenceKind::Fund => &leg.funded,
        EvidenceKind::Claim => &leg.claimed,
        EvidenceKind::Refund => &leg.refunded,
    };
    let Some(existing) = existing else {
        return;
    };
    if existing.txid != txid || confirmations <= existing.confirmations {
        return;
    }

    t.set_evidence(chain, kind, txid, confirmations, None);

    match (swap.state, chain, kind) {
        (S::BtcFundingSeen, Chain::Btc, EvidenceKind::Fund)
            if confirmations >= cfg.btc_confirmations_for(swap.from_amount) =>
        {
            advance_to_btc_funded(swap, t);
        }
        (S::UsdcFundingSeen, Chain::Evm, EvidenceKind::Fund) if confirmations >= 1 => {
            advance_to_usdc_funded(swap, t);
        }
        (S::BtcClaimed, Chain::Btc, EvidenceKind::Claim) if confirmations >= 1 => {
            complete(t, "btc sweep confirmed");
        }
        (S::UsdcClaimed, Chain::Evm, EvidenceKind::Claim) if confirmations >= 1 => {
            complete(t, "usdc sweep confirmed");
        }
        (_, _, EvidenceKind::Refund) if confirmations >= 1 && lp_legs_resolved_after(swap, chain) => {
            refunded_terminal(t);
        }
        _ => {}
    }
}

/// Would marking `chain`'s refund as settled resolve the last open LP leg?
fn lp_legs_resolved_after(swap: &Swap, chain: Chain) -> bool {
    lp_funded_chains(swap).iter().all(|c| {
        let leg = swap.leg(*c);
        *c == chain || leg.funded.is_none() || leg.claimed.is_some() || leg.refunded.is_some()
    })
}

fn advance_to_usdc_funded(swap: &Swap, t: &mut Transition) {
    use SwapState as S;
    t.step(S::UsdcFunded, "usdc htlc reached required confirmations");
    t.act(Action::Reserve { asset: Asset::M1, amount: swap.to_amount });
    t.act(Action::Reserve { asset: Asset::Btc, amount: swap.to_amount });
    t.act(Action::LockM1);
}

// Settlement terminals keep their watch registrations: the watchers hold
// on until the evidence is deeper than the chain's reorg window, so a late
// rollback (or a late peer claim after an assumed refund) is still seen.
fn complete(t: &mut Transition, note: &str) {
    t.step(SwapState::Completed, note.to_string());
    t.act(Action::ReleaseReservations);
}

fn refunded_terminal(t: &mut Transition) {
    t.step(SwapState::Refunded, "all lp legs refunded");
    t.act(Action::ReleaseReservations);
}

#[allow(clippy::too_many_arguments)]
fn claim_seen(
    swap: &Swap,
    cfg: &LpConfig,
    t: &mut Transition,
    chain: Chain,
    txid: &str,
    s_user: Hash32,
    s_lp1: Hash32,
    s_lp2: Hash32,
    confirmations: u32,
) -> EngineResult<()> {
    use SwapState as S;

    let leg = swap.leg(chain);

    // Duplicate delivery of evidence we already hold.
    if leg.claimed.as_ref().is_some_and(|e| e.txid == txid && confirmations <= e.confirmations) {
        return Ok(());
    }

    // Conflict tie-break: a confirmed claim dominates an unconfirmed
    // refund; a confirmed refund on the same leg wins against an
    // unconfirmed claim sighting.
    if let Some(refund) = &leg.refunded {
        if refund.confirmations > 0 && confirmations == 0 {
            t.note(format!(
                "ignoring unconfirmed claim {txid}: refund {} already confirmed",
                refund.txid
            ));
            return Ok(());
        }
        if confirmations > 0 {
            t.clear_evidence(chain, EvidenceKind::Refund, &refund.txid);
            t.note(format!(
                "late claim {txid} supersedes refund {} on {chain}",
                refund.txid
            ));
        }
    }

    if !swap.secrets.complete() {
        t.secrets = Some(verify_secrets(&swap.hashlocks, s_user, s_lp1, s_lp2)?);
    }
    t.set_evidence(chain, EvidenceKind::Claim, txid, confirmations, None);

    match (swap.state, chain) {
        // Forward: the user claimed USDC, revealing all three preimages.
        (S::UsdcLocked, Chain::Evm) => {
            t.step(S::UsdcClaimedByUser, format!("user claimed usdc in {txid}"));
            if cfg.auto_claim {
                t.act(Action::Claim(Chain::M1));
            }
        }
        // Our M1 claim settled: single-LP continues to the BTC sweep,
        // LP_OUT instead hands the preimages back to its peer.
        (S::UsdcClaimedByUser, Chain::M1) => {
            if confirmations >= 1 {
                match lp_role(swap) {
                    Some(LpRole::LpOut) => {
                        t.step(
                            S::M1ClaimedFromLpIn,
                            format!("peer m1 htlc swept in {txid}"),
                        );
                        t.act(Action::NotifyPeerSecrets);
                    }
                    _ => {
                        t.step(S::M1SelfClaimed, format!("m1 self-claim confirmed in {txid}"));
                        if cfg.auto_claim {
                            t.act(Action::Claim(Chain::Btc));
                        }
                    }
                }
            }
        }
        // Forward: the final BTC sweep.
        (S::M1SelfClaimed, Chain::Btc) => {
            t.step(S::BtcClaimed, format!("btc sweep broadcast in {txid}"));
            if confirmations >= 1 {
                complete(t, "btc sweep confirmed");
            }
        }
        (S::BtcClaimed, Chain::Btc) if confirmations >= 1 => {
            complete(t, "btc sweep confirmed");
        }

        // Reverse: the user claimed the BTC HTLC, revealing the preimages.
        (S::BtcLocked, Chain::Btc) => {
            t.step(S::BtcClaimedByUser, format!("user claimed btc in {txid}"));
            if cfg.auto_claim {
                t.act(Action::Claim(Chain::M1));
            }
        }
        // Reverse: our M1 self-claim settled; sweep the user's USDC last.
        (S::BtcClaimedByUser, Chain::M1) => {
            if confirmations >= 1 {
                t.step(S::M1SelfClaimed, format!("m1 self-claim confirmed in {txid}"));
                if cfg.auto_claim {
                    t.act(Action::Claim(Chain::Evm));
                }
            }
        }
        (S::M1SelfClaimed, Chain::Evm) if swap.direction == Direction::Reverse => {
            t.step(S::UsdcClaimed, format!("usdc sweep in {txid}"));
            if confirmations >= 1 {
                complete(t, "usdc sweep confirmed");
            }
        }
        (S::UsdcClaimed, Chain::Evm) if confirmations >= 1 => {
            complete(t, "usdc sweep confirmed");
        }

        // Per-leg LP_IN: the peer swept our M1, revealing the preimages.
        (S::M1LockedForLpOut | S::PeerUnreachable, Chain::M1)
            if lp_role(swap) == Some(LpRole::LpIn) =>
        {
            t.note(format!("peer claimed m1 in {txid}"));
            if cfg.auto_claim {
                t.act(Action::Claim(Chain::Btc));
            }
        }
        (S::M1LockedForLpOut | S::PeerUnreachable, Chain::Btc)
            if lp_role(swap) == Some(LpRole::LpIn) =>
        {
            t.step(S::BtcClaimed, format!("btc sweep broadcast in {txid}"));
            if confirmations >= 1 {
                complete(t, "btc sweep confirmed");
            }
        }

        // Per-leg LP_OUT parked on an unreachable peer: the on-chain sweep
        // still settles; the tick keeps retrying the hand-back.
        (S::PeerUnreachable, Chain::M1) if lp_role(swap) == Some(LpRole::LpOut) => {
            if confirmations >= 1 {
                t.note(format!("peer m1 htlc swept in {txid} while parked"));
                t.act(Action::NotifyPeerSecrets);
            }
        }

        _ => {
            // Late observation (e.g. catch-up after a refund was assumed):
            // with the preimages in hand, sweep whatever upstream leg is
            // still open.
            let upstream = upstream_chain(swap);
            let upstream_leg = swap.leg(upstream);
            if upstream_leg.funded.is_some()
                && upstream_leg.claimed.is_none()
                && upstream_leg.refunded.is_none()
                && cfg.auto_claim
            {
                t.note(format!("late claim on {chain}; attempting upstream {upstream} sweep"));
                t.act(Action::Claim(upstream));
            }
        }
    }
    Ok(())
}

fn refund_seen(swap: &Swap, t: &mut Transition, chain: Chain, txid: &str, confirmations: u32) {
    let leg = swap.leg(chain);

    if leg.refunded.as_ref().is_some_and(|e| e.txid == txid && confirmations <= e.confirmations) {
        return;
    }
    // A confirmed claim on the leg makes a refund sighting stale.
    if leg.claimed.as_ref().is_some_and(|e| e.confirmations > 0) {
        t.note(format!("ignoring refund {txid} on {chain}: claim already confirmed"));
        return;
    }

    t.set_evidence(chain, EvidenceKind::Refund, txid, confirmations, None);
    if confirmations >= 1 && lp_legs_resolved_after(swap, chain) {
        refunded_terminal(t);
    }
}

fn evm_created(
    swap: &Swap,
    cfg: &LpConfig,
    t: &mut Transition,
    htlc_id: Hash32,
    tx_hash: &str,
    confirmations: u32,
) {
    use SwapState as S;

    if swap.evm_leg.funded.as_ref().is_some_and(|e| e.txid == tx_hash) {
        confirmations_deepened(swap, cfg, t, Chain::Evm, EvidenceKind::Fund, tx_hash, confirmations);
        return;
    }

    t.set_evidence(Chain::Evm, EvidenceKind::Fund, tx_hash, confirmations, None);
    t.evm_htlc_id = Some(htlc_id);

    match swap.state {
        // Our own USDC lock (forward single-LP, or LP_OUT).
        S::M1Locked if swap.direction == Direction::Forward => {
            if confirmations >= 1 {
                t.step(S::UsdcLocked, format!("usdc htlc created in {tx_hash}"));
                // User needs the LP preimages to exercise the claim.
                t.act(Action::DiscloseLpSecrets);
            }
        }
        S::M1LockedSeen if lp_role(swap) == Some(LpRole::LpOut) => {
            if confirmations >= 1 {
                t.step(S::UsdcLocked, format!("usdc htlc created in {tx_hash}"));
                t.act(Action::DiscloseLpSecrets);
            }
        }
        // The user's USDC lock (reverse direction).
        S::AwaitingUsdc => {
            t.step(S::UsdcFundingSeen, format!("usdc htlc seen in {tx_hash}"));
            if confirmations >= 1 {
                advance_to_usdc_funded(swap, t);
            }
        }
        S::UsdcFundingSeen if confirmations >= 1 => {
            advance_to_usdc_funded(swap, t);
        }
        _ => {}
    }
}

fn timelock_expired(swap: &Swap, cfg: &LpConfig, t: &mut Transition, chain: Chain) {
    use SwapState as S;

    // Nothing funded anywhere: the plan just dies.
    if swap.state.is_prefunding() && !swap.any_leg_funded() {
        t.step(S::Failed, format!("{chain} timelock expired with no funding"));
        t.act(Action::UnwatchAll);
        t.act(Action::ReleaseReservations);
        return;
    }

    let leg = swap.leg(chain);
    if leg.funded.is_none() || leg.claimed.is_some() || leg.refunded.is_some() {
        return;
    }

    if !lp_funded_chains(swap).contains(&chain) {
        // The user owns this refund branch; note it and keep watching.
        t.note(format!("{chain} timelock expired; refund branch is user-controlled"));
        return;
    }

    // Claim-over-refund: never broadcast a refund once the downstream
    // preimages are known; sweep instead.
    if swap.secrets.complete() {
        let upstream = upstream_chain(swap);
        let upstream_leg = swap.leg(upstream);
        if upstream_leg.funded.is_some() && upstream_leg.claimed.is_none() {
            t.note(format!(
                "{chain} timelock expired but preimages known; preferring upstream sweep"
            ));
            if cfg.auto_claim {
                t.act(Action::Claim(upstream));
            }
            return;
        }
    }

    if cfg.auto_refund {
        t.note(format!("{chain} timelock expired; broadcasting refund"));
        t.act(Action::Refund(chain));
    } else {
        t.note(format!("{chain} timelock expired; auto-refund disabled"));
    }
}

fn reorged(swap: &Swap, t: &mut Transition, chain: Chain, kind: EvidenceKind, txid: &str) {
    use SwapState as S;

    let leg = swap.leg(chain);
    let matches = match kind {
        EvidenceKind::Fund => leg.funded.as_ref().is_some_and(|e| e.txid == txid),
        EvidenceKind::Claim => leg.claimed.as_ref().is_some_and(|e| e.txid == txid),
        EvidenceKind::Refund => leg.refunded.as_ref().is_some_and(|e| e.txid == txid),
    };
    if !matches {
        return;
    }

    t.clear_evidence(chain, kind, txid);

    match kind {
        EvidenceKind::Fund => match (swap.state, chain) {
            (S::BtcFundingSeen | S::BtcFunded, Chain::Btc) => {
                t.step(S::AwaitingBtc, format!("reorg orphaned btc funding {txid}"));
            }
            (S::UsdcFundingSeen | S::UsdcFunded, Chain::Evm) => {
                t.step(S::AwaitingUsdc, format!("reorg orphaned usdc funding {txid}"));
            }
            _ => t.note(format!("reorg orphaned {chain} funding {txid}")),
        },
        EvidenceKind::Claim => rollback_claim(swap, chain, txid, t),
        EvidenceKind::Refund => {
            t.note(format!("reorg orphaned {chain} refund {txid}"));
        }
    }
}

/// Roll a leg whose claim was orphaned back to `funded` and retry the
/// sweep; the preimages survive in the swap record.
fn rollback_claim(swap: &Swap, chain: Chain, txid: &str, t: &mut Transition) {
    use SwapState as S;

    let note = format!("reorg orphaned {chain} claim {txid}; rolling back and re-claiming");
    match (chain, swap.direction) {
        (Chain::Btc, Direction::Forward) => {
            t.step(S::M1SelfClaimed, note);
            t.act(Action::Claim(Chain::Btc));
        }
        (Chain::M1, Direction::Forward) => {
            t.step(S::UsdcClaimedByUser, note);
            t.act(Action::Claim(Chain::M1));
        }
        (Chain::Evm, Direction::Reverse) => {
            t.step(S::M1SelfClaimed, note);
            t.act(Action::Claim(Chain::Evm));
        }
        (Chain::M1, Direction::Reverse) => {
            t.step(S::BtcClaimedByUser, note);
            t.act(Action::Claim(Chain::M1));
        }
        _ => {
            t.note(note);
            t.act(Action::Claim(chain));
        }
    }
}

/// Commit phase: fold a decide result into the swap record.
pub fn apply(swap: &mut Swap, t: &Transition, now: u64) {
    for update in &t.evidence {
        let leg = swap.leg_mut(update.chain);
        let slot = match update.kind {
            EvidenceKind::Fund => &mut leg.funded,
            EvidenceKind::Claim => &mut leg.claimed,
            EvidenceKind::Refund => &mut leg.refunded,
        };
        if update.clear {
            if slot.as_ref().is_some_and(|e| e.txid == update.txid) {
                *slot = None;
            }
            continue;
        }
        match slot {
            Some(existing) if existing.txid == update.txid => {
                existing.confirmations = existing.confirmations.max(update.confirmations);
            }
            _ => {
                *slot = Some(TxEvidence {
                    txid: update.txid.clone(),
                    confirmations: update.confirmations,
                });
            }
        }
        if let Some(outpoint) = &update.outpoint {
            leg.outpoint = Some(outpoint.clone());
        }
    }

    if let Some((s_user, s_lp1, s_lp2)) = t.secrets {
        // Already verified in the decide phase.
        swap.secrets.s_user = Some(s_user);
        swap.secrets.s_lp1 = Some(s_lp1);
        swap.secrets.s_lp2 = Some(s_lp2);
    }

    if let Some(id) = t.evm_htlc_id {
        swap.evm_leg.script_or_id = hex::encode(id);
    }

    for setup in &t.leg_setup {
        let leg = swap.leg_mut(setup.chain);
        leg.amount = setup.amount;
        leg.timelock = setup.timelock;
        leg.address = setup.address.clone();
        leg.script_or_id = setup.script_or_id.clone();
    }

    for note in &t.notes {
        swap.push_note(note.clone(), now);
    }
    for (state, note) in &t.steps {
        swap.push_state(*state, note.clone(), now);
        if *state == SwapState::PeerUnreachable {
            swap.parked_from = t.parked_from;
        } else {
            swap.parked_from = None;
        }
    }
}

/// Request to create a swap.
#[derive(Debug, Clone)]
pub struct InitRequest {
    pub direction: Direction,
    pub routing: RoutingMode,
    pub from_amount: u64,
    pub h_user: Hash32,
    /// Supplied in per-leg mode when the peer LP minted the hashlock;
    /// minted locally otherwise.
    pub h_lp1: Option<Hash32>,
    pub h_lp2: Option<Hash32>,
    /// User's compressed pubkey for the BTC-leg branch it controls.
    /// Required for every flow that carries a BTC leg facing the user.
    pub user_pubkey: Option<[u8; 33]>,
    pub user_refund_address: String,
    pub user_payout_address: String,
}

/// Everything the process shares: config, store, inventory, chain clients,
/// watch table, peer notifier and key material. Constructed once at
/// startup and passed by handle (spec-wide state, no hidden singletons).
pub struct AppContext {
    pub cfg: LpConfig,
    pub store: Mutex<JsonStore>,
    pub inventory: Inventory,
    pub watch: WatchTable,
    pub notifier: PeerNotifier,
    pub keys: LpKeys,
    pub btc: UtxoChainRpc,
    pub m1: M1Rpc,
    pub evm: EvmRpc,
    /// Single-writer broadcast gates per chain wallet.
    pub btc_wallet_gate: tokio::sync::Mutex<()>,
    pub m1_wallet_gate: tokio::sync::Mutex<()>,
    pub evm_wallet_gate: tokio::sync::Mutex<()>,
    pub btc_network: Network,
    pub m1_network: Network,
}

pub struct Engine {
    ctx: Arc<AppContext>,
    /// Per-swap event serialization.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// LP preimages held in memory until their publishing HTLC confirms
    /// (secret containment: nothing unconfirmed reaches disk).
    pending_lp_secrets: Mutex<HashMap<String, (Option<Hash32>, Option<Hash32>)>>,
}

impl Engine {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            ctx,
            locks: Mutex::new(HashMap::new()),
            pending_lp_secrets: Mutex::new(HashMap::new()),
        }
    }

    pub fn ctx(&self) -> &AppContext {
        &self.ctx
    }

    fn swap_lock(&self, swap_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock table poisoned");
        locks
            .entry(swap_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn now() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Create a swap. No on-chain action happens here: the response is a
    /// plan (deposit descriptors); the LP locks only after the user's
    /// on-chain commitment confirms.
    pub async fn init_swap(&self, req: InitRequest) -> EngineResult<Swap> {
        let cfg = &self.ctx.cfg;
        let now = Self::now();

        let (from_asset, to_asset) = match req.direction {
            Direction::Forward => (Asset::Btc, Asset::Usdc),
            Direction::Reverse => (Asset::Usdc, Asset::Btc),
        };
        let pair = cfg.pair(from_asset, to_asset).ok_or_else(|| {
            EngineError::invariant(format!("pair {from_asset:?}->{to_asset:?} not enabled"))
        })?;
        let to_amount = pair.quote(req.from_amount).ok_or_else(|| {
            EngineError::invariant(format!(
                "amount {} outside pair bounds",
                req.from_amount
            ))
        })?;

        // Mint only the hashlocks this LP's role owns; per-leg peers
        // supply theirs through init-leg.
        let (s_lp1, h_lp1) = match req.h_lp1 {
            Some(h) => (None, h),
            None => {
                let (s, h) = crate::swap::generate_secret();
                (Some(s), h)
            }
        };
        let (s_lp2, h_lp2) = match req.h_lp2 {
            Some(h) => (None, h),
            None => {
                let (s, h) = crate::swap::generate_secret();
                (Some(s), h)
            }
        };
        let hashlocks = Hashlocks { h_user: req.h_user, h_lp1, h_lp2 };
        hashlocks.validate()?;

        let mut swap = Swap {
            swap_id: Swap::new_id(),
            direction: req.direction,
            routing: req.routing.clone(),
            from_asset,
            to_asset,
            from_amount: req.from_amount,
            to_amount,
            hashlocks,
            secrets: Secrets::default(),
            btc_leg: Default::default(),
            m1_leg: Default::default(),
            evm_leg: Default::default(),
            state: SwapState::Init,
            parked_from: None,
            user_refund_address: req.user_refund_address,
            user_payout_address: req.user_payout_address,
            user_pubkey: req.user_pubkey.map(hex::encode).unwrap_or_default(),
            timeline: Vec::new(),
            reservations: Vec::new(),
            created_at: now,
            updated_at: now,
            terminal_at: None,
        };
        swap.push_note("swap created", now);

        match (&req.routing, req.direction) {
            (RoutingMode::PerLeg { role: LpRole::LpOut, .. }, _) => {
                // LP_OUT waits for the peer's M1 announcement; the EVM leg
                // derives once that confirms.
                swap.evm_leg.address = cfg.chains.htlc3s_contract.clone();
                swap.evm_leg.amount = to_amount;
            }
            (_, Direction::Forward) => {
                let user_pubkey = req
                    .user_pubkey
                    .ok_or_else(|| EngineError::invariant("forward swap needs user_pubkey"))?;
                self.derive_btc_deposit_leg(&mut swap, user_pubkey).await?;
                swap.push_state(SwapState::AwaitingBtc, "awaiting user btc deposit", now);
            }
            (_, Direction::Reverse) => {
                if req.user_pubkey.is_none() {
                    return Err(EngineError::invariant("reverse swap needs user_pubkey"));
                }
                self.derive_evm_deposit_leg(&mut swap).await?;
                swap.push_state(SwapState::AwaitingUsdc, "awaiting user usdc lock", now);
            }
        }

        self.hold_lp_secrets(&swap.swap_id, s_lp1, s_lp2);
        self.persist(&swap)?;
        self.register_watches(&swap);
        tracing::info!(swap_id = %swap.swap_id, direction = ?swap.direction, "swap initialized");
        Ok(swap)
    }

    /// User deposit HTLC on BTC: LP claims with the preimages, the user
    /// owns the refund branch.
    async fn derive_btc_deposit_leg(
        &self,
        swap: &mut Swap,
        user_pubkey: [u8; 33],
    ) -> EngineResult<()> {
        let tip = self
            .ctx
            .btc
            .block_count()
            .await
            .map_err(|e| EngineError::transient("btc", e))?;
        let timelock = tip + self.ctx.cfg.timelocks.btc_delta_blocks as u64;

        let spec = Htlc3sSpec {
            hashlocks: swap.hashlocks,
            recipient_pubkey: self.ctx.keys.btc_pubkey,
            refund_pubkey: user_pubkey,
            timelock_height: timelock as u32,
        };
        swap.btc_leg.amount = swap.from_amount;
        swap.btc_leg.timelock = timelock;
        swap.btc_leg.address = spec.p2wsh_address(self.ctx.btc_network).to_string();
        swap.btc_leg.script_or_id = hex::encode(spec.redeem_script().as_bytes());
        Ok(())
    }

    /// User deposit HTLC on the EVM chain (reverse direction): the user
    /// calls `create` with these parameters; the LP is the recipient.
    async fn derive_evm_deposit_leg(&self, swap: &mut Swap) -> EngineResult<()> {
        let now_chain = self
            .ctx
            .evm
            .latest_block_timestamp()
            .await
            .map_err(|e| EngineError::transient("evm", e))?;
        swap.evm_leg.amount = swap.from_amount;
        swap.evm_leg.timelock = now_chain + self.ctx.cfg.timelocks.rev_evm_delta_secs;
        swap.evm_leg.address = self.ctx.cfg.chains.htlc3s_contract.clone();
        Ok(())
    }

    fn hold_lp_secrets(&self, swap_id: &str, s_lp1: Option<Hash32>, s_lp2: Option<Hash32>) {
        if s_lp1.is_none() && s_lp2.is_none() {
            return;
        }
        self.pending_lp_secrets
            .lock()
            .expect("secrets table poisoned")
            .insert(swap_id.to_string(), (s_lp1, s_lp2));
    }

    fn persist(&self, swap: &Swap) -> EngineResult<()> {
        self.ctx
            .store
            .lock()
            .expect("store mutex poisoned")
            .persist(swap)
            .map_err(|e| EngineError::PermanentChain {
                chain: "store",
                message: format!("{e:#}"),
            })
    }

    fn load(&self, swap_id: &str) -> EngineResult<Swap> {
        self.ctx
            .store
            .lock()
            .expect("store mutex poisoned")
            .get(swap_id)
            .ok_or_else(|| EngineError::UnknownSwap(swap_id.to_string()))
    }

    pub fn get_swap(&self, swap_id: &str) -> EngineResult<Swap> {
        self.load(swap_id)
    }

    pub fn list_swaps(&self, state: Option<SwapState>, limit: usize) -> Vec<Swap> {
        self.ctx
            .store
            .lock()
            .expect("store mutex poisoned")
            .list(state, limit)
    }

    /// Serialize and handle one event for one swap.
    pub async fn handle_event(&self, swap_id: &str, event: SwapEvent) -> EngineResult<()> {
        let lock = self.swap_lock(swap_id);
        let actions = {
            let _guard = lock.lock().await;

            let mut swap = self.load(swap_id)?;
            let t = transition(&swap, &event, &self.ctx.cfg, Self::now())?;
            if t.is_noop() {
                return Ok(());
            }
            apply(&mut swap, &t, Self::now());
            self.run_sync_actions(&mut swap, &t.actions);
            self.persist(&swap)?;
            self.register_watches(&swap);
            t.actions
        };

        // Perform phase: chain RPC / peer HTTP without the swap lock.
        for action in actions {
            if let Err(err) = self.perform(swap_id, &action).await {
                tracing::warn!(swap_id, ?action, error = %err, "action failed");
                self.record_action_failure(swap_id, &action, &err).await;
            }
        }
        Ok(())
    }

    /// Reservation, release and watch bookkeeping: synchronous, no RPC.
    fn run_sync_actions(&self, swap: &mut Swap, actions: &[Action]) {
        for action in actions {
            match action {
                Action::Reserve { asset, amount } => {
                    match self.ctx.inventory.reserve(*asset, *amount, &swap.swap_id) {
                        Ok(()) => {
                            swap.reservations.push(Reservation { asset: *asset, amount: *amount });
                        }
                        Err(err) => {
                            swap.push_note(
                                format!("inventory reservation failed: {err}"),
                                Self::now(),
                            );
                            tracing::error!(
                                swap_id = %swap.swap_id,
                                asset = ?asset,
                                amount,
                                error = %err,
                                "reservation failed; operator attention required"
                            );
                        }
                    }
                }
                Action::ReleaseReservations => {
                    self.ctx.inventory.release(&swap.swap_id);
                    swap.reservations.clear();
                }
                Action::UnwatchAll => {
                    self.ctx.watch.unregister_all(&swap.swap_id);
                }
                Action::DiscloseLpSecrets => {
                    let pending = self
                        .pending_lp_secrets
                        .lock()
                        .expect("secrets table poisoned")
                        .remove(&swap.swap_id);
                    if let Some((s_lp1, s_lp2)) = pending {
                        if s_lp1.is_some() {
                            swap.secrets.s_lp1 = s_lp1;
                        }
                        if s_lp2.is_some() {
                            swap.secrets.s_lp2 = s_lp2;
                        }
                        swap.push_note("lp preimages disclosed", Self::now());
                    }
                }
                _ => {}
            }
        }
    }

    async fn perform(&self, swap_id: &str, action: &Action) -> Result<()> {
        match action {
            Action::LockM1 => self.perform_lock_m1(swap_id).await,
            Action::LockUsdc => self.perform_lock_usdc(swap_id).await,
            Action::LockBtc => self.perform_lock_btc(swap_id).await,
            Action::Claim(chain) => self.perform_claim(swap_id, *chain).await,
            Action::Refund(chain) => self.perform_refund(swap_id, *chain).await,
            Action::NotifyPeerM1Locked => self.perform_notify_m1_locked(swap_id).await,
            Action::NotifyPeerSecrets => self.perform_notify_secrets(swap_id).await,
            // Synchronous bookkeeping already ran in the commit phase.
            Action::Reserve { .. }
            | Action::ReleaseReservations
            | Action::UnwatchAll
            | Action::DiscloseLpSecrets => Ok(()),
        }
    }

    async fn record_action_failure(&self, swap_id: &str, action: &Action, err: &anyhow::Error) {
        let lock = self.swap_lock(swap_id);
        let _guard = lock.lock().await;
        if let Ok(mut swap) = self.load(swap_id) {
            if !swap.state.is_terminal() {
                swap.push_note(format!("action {action:?} failed: {err:#}"), Self::now());
                let _ = self.persist(&swap);
            }
        }
    }

    /// Shared pattern for the three lock actions: derive the descriptor
    /// from a snapshot, broadcast under the chain wallet gate, then
    /// re-lock and commit only if the state did not move.
    async fn perform_lock_m1(&self, swap_id: &str) -> Result<()> {
        let swap = self.load(swap_id)?;
        let expected_state = swap.state;

        let m1_amount = match swap.direction {
            Direction::Forward => swap.from_amount,
            Direction::Reverse => swap.to_amount,
        };

        let tip = self.ctx.m1.block_count().await?;
        let timelock = tip + self.ctx.cfg.timelocks.m1_delta_blocks as u64;
        self.check_cascade_below_upstream(&swap, Chain::M1, (timelock - tip) * M1_BLOCK_SECS)?;

        let spec = Htlc3sSpec {
            hashlocks: swap.hashlocks,
            recipient_pubkey: self.ctx.keys.m1_pubkey,
            refund_pubkey: self.ctx.keys.m1_pubkey,
            timelock_height: timelock as u32,
        };
        let address = spec.p2wsh_address(self.ctx.m1_network).to_string();

        let txid = {
            let _gate = self.ctx.m1_wallet_gate.lock().await;
            self.ctx.m1.send_to_address(&address, m1_amount).await?
        };

        self.commit_lock(swap_id, expected_state, Chain::M1, move |swap| {
            swap.m1_leg.amount = m1_amount;
            swap.m1_leg.timelock = timelock;
            swap.m1_leg.address = address.clone();
            swap.m1_leg.script_or_id = hex::encode(spec.redeem_script().as_bytes());
            format!("m1 htlc funding broadcast in {txid}")
        })
        .await
    }

    async fn perform_lock_btc(&self, swap_id: &str) -> Result<()> {
        let swap = self.load(swap_id)?;
        let expected_state = swap.state;

        let user_pubkey =
            parse_pubkey(&swap.user_pubkey).context("reverse swap needs the user's btc pubkey")?;

        let tip = self.ctx.btc.block_count().await?;
        let timelock = tip + self.ctx.cfg.timelocks.rev_btc_delta_blocks as u64;
        self.check_cascade_below_upstream(&swap, Chain::Btc, (timelock - tip) * BTC_BLOCK_SECS)?;

        let spec = Htlc3sSpec {
            hashlocks: swap.hashlocks,
            recipient_pubkey: user_pubkey,
            refund_pubkey: self.ctx.keys.btc_pubkey,
            timelock_height: timelock as u32,
        };
        let address = spec.p2wsh_address(self.ctx.btc_network).to_string();
        let amount = swap.to_amount;

        let txid = {
            let _gate = self.ctx.btc_wallet_gate.lock().await;
            self.ctx.btc.send_to_address(&address, amount).await?
        };

        self.commit_lock(swap_id, expected_state, Chain::Btc, move |swap| {
            swap.btc_leg.amount = amount;
            swap.btc_leg.timelock = timelock;
            swap.btc_leg.address = address.clone();
            swap.btc_leg.script_or_id = hex::encode(spec.redeem_script().as_bytes());
            format!("btc htlc funding broadcast in {txid}")
        })
        .await
    }

    async fn perform_lock_usdc(&self, swap_id: &str) -> Result<()> {
        let swap = self.load(swap_id)?;
        let expected_state = swap.state;

        let recipient = evm3s::parse_evm_address(&swap.user_payout_address)
            .context("user payout address is not an EVM address")?;
        let token = evm3s::parse_evm_address(&self.ctx.cfg.chains.usdc_contract)?;
        let contract_addr = self.ctx.cfg.chains.htlc3s_contract.clone();

        let now_chain = self.ctx.evm.latest_block_timestamp().await?;
        let timelock = now_chain + self.ctx.cfg.timelocks.evm_delta_secs;
        self.check_cascade_below_upstream(&swap, Chain::Evm, timelock - now_chain)?;

        let create = CreateCall {
            recipient,
            token,
            amount: swap.to_amount,
            hashlocks: swap.hashlocks,
            timelock,
        };
        let data = evm3s::encode_create(&create);

        let tx_hash = {
            let _gate = self.ctx.evm_wallet_gate.lock().await;
            self.ctx.evm.send_contract_tx(&contract_addr, &data).await?
        };

        let amount = swap.to_amount;
        self.commit_lock(swap_id, expected_state, Chain::Evm, move |swap| {
            swap.evm_leg.amount = amount;
            swap.evm_leg.timelock = timelock;
            swap.evm_leg.address = contract_addr.clone();
            format!("usdc htlc create submitted in {tx_hash}")
        })
        .await
    }

    /// Validate the safety gap between the leg about to be locked and its
    /// upstream neighbour before committing funds. Horizons are compared
    /// in seconds using each chain's block-time estimate.
    fn check_cascade_below_upstream(
        &self,
        swap: &Swap,
        downstream: Chain,
        downstream_horizon_secs: u64,
    ) -> Result<()> {
        let policy = &self.ctx.cfg.timelocks;
        let order: Vec<(Chain, u64)> = match (swap.direction, downstream) {
            (Direction::Forward, Chain::M1) => vec![
                (Chain::Btc, policy.btc_delta_blocks as u64 * BTC_BLOCK_SECS),
                (Chain::M1, downstream_horizon_secs),
            ],
            (Direction::Forward, Chain::Evm) => vec![
                (Chain::M1, policy.m1_delta_blocks as u64 * M1_BLOCK_SECS),
                (Chain::Evm, downstream_horizon_secs),
            ],
            (Direction::Reverse, Chain::M1) => vec![
                (Chain::Evm, policy.rev_evm_delta_secs),
                (Chain::M1, downstream_horizon_secs),
            ],
            (Direction::Reverse, Chain::Btc) => vec![
                (Chain::M1, policy.m1_delta_blocks as u64 * M1_BLOCK_SECS),
                (Chain::Btc, downstream_horizon_secs),
            ],
            _ => return Ok(()),
        };
        policy.validate_cascade(&order).map_err(|msg| {
            anyhow::anyhow!("refusing to lock {downstream} leg: {msg}")
        })
    }

    async fn commit_lock<F>(
        &self,
        swap_id: &str,
        expected_state: SwapState,
        chain: Chain,
        mut fill: F,
    ) -> Result<()>
    where
        F: FnMut(&mut Swap) -> String,
    {
        let lock = self.swap_lock(swap_id);
        let _guard = lock.lock().await;

        let mut swap = self.load(swap_id)?;
        if swap.state != expected_state {
            tracing::warn!(
                swap_id,
                expected = %expected_state,
                actual = %swap.state,
                "state moved during lock broadcast; discarding intent"
            );
            swap.push_note(
                format!("discarded {chain} lock intent: state moved to {}", swap.state),
                Self::now(),
            );
            self.persist(&swap)?;
            return Ok(());
        }

        let note = fill(&mut swap);
        swap.push_note(note, Self::now());
        self.persist(&swap)?;
        self.register_watches(&swap);
        Ok(())
    }

    async fn perform_claim(&self, swap_id: &str, chain: Chain) -> Result<()> {
        let swap = self.load(swap_id)?;
        let secrets = swap.secrets;
        let (Some(s_user), Some(s_lp1), Some(s_lp2)) =
            (secrets.s_user, secrets.s_lp1, secrets.s_lp2)
        else {
            anyhow::bail!("claim on {chain} needs all three preimages");
        };

        match chain {
            Chain::Evm => {
                let id = crate::swap::hash32_from_hex(&swap.evm_leg.script_or_id)
                    .map_err(|e| anyhow::anyhow!("evm leg has no htlc id: {e}"))?;
                let data = evm3s::encode_claim(&evm3s::ClaimCall {
                    htlc_id: id,
                    s_user,
                    s_lp1,
                    s_lp2,
                });
                let tx_hash = {
                    let _gate = self.ctx.evm_wallet_gate.lock().await;
                    self.ctx
                        .evm
                        .send_contract_tx(&self.ctx.cfg.chains.htlc3s_contract, &data)
                        .await?
                };
                self.note_broadcast(swap_id, format!("evm claim submitted in {tx_hash}"))
                    .await
            }
            Chain::Btc | Chain::M1 => {
                let leg = swap.leg(chain);
                let funding = utxo_funding(leg).context("leg has no funding outpoint")?;
                let spec = parse_leg_spec(leg)?;
                let key = self
                    .ctx
                    .keys
                    .key_for(chain)
                    .context("no key for chain")?;

                let (payout, fee_rate, network) = match chain {
                    Chain::Btc => (
                        self.ctx.btc.new_address().await?,
                        self.ctx.btc.estimate_fee_rate_sat_vb(6).await.unwrap_or(2),
                        self.ctx.btc_network,
                    ),
                    _ => (
                        self.ctx.m1.new_address().await?,
                        self.ctx.m1.estimate_fee_rate_sat_vb(6).await.unwrap_or(2),
                        self.ctx.m1_network,
                    ),
                };
                let payout: bitcoin::Address = payout
                    .parse::<bitcoin::Address<_>>()
                    .context("parse payout address")?
                    .require_network(network)
                    .context("payout address network mismatch")?;

                let tx = script3s::claim_tx(
                    &spec,
                    &funding,
                    &payout,
                    key,
                    s_user,
                    s_lp1,
                    s_lp2,
                    fee_rate * CLAIM_VSIZE,
                )?;
                let tx_hex = hex::encode(bitcoin::consensus::serialize(&tx));

                let txid = match chain {
                    Chain::Btc => {
                        let _gate = self.ctx.btc_wallet_gate.lock().await;
                        self.ctx.btc.send_raw_transaction(&tx_hex).await?
                    }
                    _ => {
                        let _gate = self.ctx.m1_wallet_gate.lock().await;
                        self.ctx.m1.send_raw_transaction(&tx_hex).await?
                    }
                };
                self.note_broadcast(swap_id, format!("{chain} claim broadcast in {txid}"))
                    .await
            }
        }
    }

    async fn perform_refund(&self, swap_id: &str, chain: Chain) -> Result<()> {
        let swap = self.load(swap_id)?;

        match chain {
            Chain::Evm => {
                let id = crate::swap::hash32_from_hex(&swap.evm_leg.script_or_id)
                    .map_err(|e| anyhow::anyhow!("evm leg has no htlc id: {e}"))?;
                let data = evm3s::encode_refund(&id);
                let tx_hash = {
                    let _gate = self.ctx.evm_wallet_gate.lock().await;
                    self.ctx
                        .evm
                        .send_contract_tx(&self.ctx.cfg.chains.htlc3s_contract, &data)
                        .await?
                };
                self.note_broadcast(swap_id, format!("evm refund submitted in {tx_hash}"))
                    .await
            }
            Chain::Btc | Chain::M1 => {
                let leg = swap.leg(chain);
                let funding = utxo_funding(leg).context("leg has no funding outpoint")?;
                let spec = parse_leg_spec(leg)?;
                let key = self.ctx.keys.key_for(chain).ok_or_else(|| {
                    anyhow::anyhow!("refund key material missing for {chain}")
                })?;

                let (refund_to, fee_rate, network) = match chain {
                    Chain::Btc => (
                        self.ctx.btc.new_address().await?,
                        self.ctx.btc.estimate_fee_rate_sat_vb(6).await.unwrap_or(2),
                        self.ctx.btc_network,
                    ),
                    _ => (
                        self.ctx.m1.new_address().await?,
                        self.ctx.m1.estimate_fee_rate_sat_vb(6).await.unwrap_or(2),
                        self.ctx.m1_network,
                    ),
                };
                let refund_to: bitcoin::Address = refund_to
                    .parse::<bitcoin::Address<_>>()
                    .context("parse refund address")?
                    .require_network(network)
                    .context("refund address network mismatch")?;

                let tx = script3s::refund_tx(&spec, &funding, &refund_to, key, fee_rate * REFUND_VSIZE)?;
                let tx_hex = hex::encode(bitcoin::consensus::serialize(&tx));

                let txid = match chain {
                    Chain::Btc => {
                        let _gate = self.ctx.btc_wallet_gate.lock().await;
                        self.ctx.btc.send_raw_transaction(&tx_hex).await?
                    }
                    _ => {
                        let _gate = self.ctx.m1_wallet_gate.lock().await;
                        self.ctx.m1.send_raw_transaction(&tx_hex).await?
                    }
                };
                self.note_broadcast(swap_id, format!("{chain} refund broadcast in {txid}"))
                    .await
            }
        }
    }

    async fn note_broadcast(&self, swap_id: &str, note: String) -> Result<()> {
        let lock = self.swap_lock(swap_id);
        let _guard = lock.lock().await;
        let mut swap = self.load(swap_id)?;
        if !swap.state.is_terminal() {
            swap.push_note(note, Self::now());
            self.persist(&swap)?;
        }
        Ok(())
    }

    async fn perform_notify_m1_locked(&self, swap_id: &str) -> Result<()> {
        let swap = self.load(swap_id)?;
        let RoutingMode::PerLeg { peer_url, .. } = &swap.routing else {
            anyhow::bail!("peer notify on a single-lp swap");
        };
        let outpoint = swap
            .m1_leg
            .outpoint
            .clone()
            .context("m1 leg has no outpoint to announce")?;
        let notice = M1LockedNotice {
            outpoint,
            amount_sats: swap.m1_leg.amount,
            expiry_height: swap.m1_leg.timelock,
            redeem_script_hex: swap.m1_leg.script_or_id.clone(),
        };

        match self.ctx.notifier.m1_locked(peer_url, swap_id, &notice).await {
            Ok(()) => {
                self.note_broadcast(swap_id, "peer acknowledged m1-locked".into())
                    .await
            }
            Err(err) => self.park_peer_unreachable(swap_id, err).await,
        }
    }

    async fn perform_notify_secrets(&self, swap_id: &str) -> Result<()> {
        let swap = self.load(swap_id)?;
        let RoutingMode::PerLeg { peer_url, .. } = &swap.routing else {
            anyhow::bail!("peer notify on a single-lp swap");
        };
        let (Some(s_user), Some(s_lp1), Some(s_lp2)) = (
            swap.secrets.s_user,
            swap.secrets.s_lp1,
            swap.secrets.s_lp2,
        ) else {
            anyhow::bail!("secrets notify without complete preimages");
        };
        let claim_txid = swap
            .m1_leg
            .claimed
            .as_ref()
            .map(|e| e.txid.clone())
            .unwrap_or_default();
        let notice = SecretsNotice::from_secrets(&claim_txid, &s_user, &s_lp1, &s_lp2);

        match self.ctx.notifier.btc_claimed(peer_url, swap_id, &notice).await {
            Ok(()) => {
                let lock = self.swap_lock(swap_id);
                let _guard = lock.lock().await;
                let mut swap = self.load(swap_id)?;
                if matches!(
                    swap.state,
                    SwapState::M1ClaimedFromLpIn | SwapState::PeerUnreachable
                ) {
                    swap.push_state(SwapState::Completed, "peer received preimages", Self::now());
                    self.ctx.inventory.release(&swap.swap_id);
                    swap.reservations.clear();
                    self.ctx.watch.unregister_all(&swap.swap_id);
                    self.persist(&swap)?;
                }
                Ok(())
            }
            Err(err) => self.park_peer_unreachable(swap_id, err).await,
        }
    }

    async fn park_peer_unreachable(&self, swap_id: &str, err: EngineError) -> Result<()> {
        let lock = self.swap_lock(swap_id);
        let _guard = lock.lock().await;
        let mut swap = self.load(swap_id)?;
        if !swap.state.is_terminal() && swap.state != SwapState::PeerUnreachable {
            let parked_from = swap.state;
            swap.push_state(SwapState::PeerUnreachable, format!("{err}"), Self::now());
            swap.parked_from = Some(parked_from);
            self.persist(&swap)?;
            tracing::warn!(swap_id, error = %err, "swap parked peer_unreachable");
        }
        Ok(())
    }

    /// Re-register chain-watch interests derived from the swap's legs.
    /// Settled swaps stay registered until their evidence clears the reorg
    /// window; the watchers drop them. Failed swaps never funded anything.
    pub fn register_watches(&self, swap: &Swap) {
        if swap.state == SwapState::Failed {
            self.ctx.watch.unregister_all(&swap.swap_id);
            return;
        }

        if !swap.btc_leg.address.is_empty() {
            self.ctx.watch.register_utxo(
                Chain::Btc,
                UtxoInterest {
                    swap_id: swap.swap_id.clone(),
                    address: swap.btc_leg.address.clone(),
                    redeem_script_hex: swap.btc_leg.script_or_id.clone(),
                    expected_amount: swap.btc_leg.amount,
                    required_confs: self.ctx.cfg.btc_confirmations_for(swap.btc_leg.amount),
                    outpoint: parse_outpoint(&swap.btc_leg.outpoint),
                    timelock_height: swap.btc_leg.timelock,
                    accept_zero_conf: true,
                },
            );
        }
        if !swap.m1_leg.address.is_empty() || swap.m1_leg.outpoint.is_some() {
            self.ctx.watch.register_utxo(
                Chain::M1,
                UtxoInterest {
                    swap_id: swap.swap_id.clone(),
                    address: swap.m1_leg.address.clone(),
                    redeem_script_hex: swap.m1_leg.script_or_id.clone(),
                    expected_amount: swap.m1_leg.amount,
                    required_confs: 1,
                    outpoint: parse_outpoint(&swap.m1_leg.outpoint),
                    timelock_height: swap.m1_leg.timelock,
                    accept_zero_conf: false,
                },
            );
        }
        if !swap.evm_leg.address.is_empty() {
            let htlc_id = crate::swap::hash32_from_hex(&swap.evm_leg.script_or_id).ok();
            self.ctx.watch.register_evm(EvmInterest {
                swap_id: swap.swap_id.clone(),
                contract: swap.evm_leg.address.clone(),
                hashlocks: swap.hashlocks,
                htlc_id,
                timelock_unix: swap.evm_leg.timelock,
            });
        }
    }

    /// Startup resume scan: restore inventory and watch registrations for
    /// every non-terminal swap; the watchers re-derive each leg's on-chain
    /// status before new events flow.
    pub fn resume(&self) -> Result<()> {
        let swaps = self
            .ctx
            .store
            .lock()
            .expect("store mutex poisoned")
            .resume_candidates();

        let mut restored = Vec::new();
        for swap in &swaps {
            for r in &swap.reservations {
                restored.push((swap.swap_id.clone(), r.asset, r.amount));
            }
            self.register_watches(swap);
        }
        self.ctx.inventory.restore(&restored);

        tracing::info!(count = swaps.len(), "resume scan registered non-terminal swaps");
        Ok(())
    }

    /// Periodic tick across all non-terminal swaps.
    pub async fn tick_all(&self) {
        let swaps = self
            .ctx
            .store
            .lock()
            .expect("store mutex poisoned")
            .resume_candidates();
        for swap in swaps {
            if let Err(err) = self.handle_event(&swap.swap_id, SwapEvent::Tick).await {
                tracing::warn!(swap_id = %swap.swap_id, error = %err, "tick failed");
            }
        }
    }

    pub async fn force_fail(&self, swap_id: &str) -> EngineResult<Swap> {
        self.handle_event(swap_id, SwapEvent::ForceFail).await?;
        self.load(swap_id)
    }

    pub fn archive_terminal(&self, max_age_hours: u64) -> Result<usize> {
        self.ctx
            .store
            .lock()
            .expect("store mutex poisoned")
            .archive_terminal(max_age_hours * 3600, Self::now())
    }

    /// Refresh wallet balances into the inventory when stale.
    pub async fn refresh_balances(&self) {
        if !self.ctx.inventory.needs_refresh() {
            return;
        }
        let mut balances = Vec::new();
        match self.ctx.btc.wallet_balance_sats().await {
            Ok(v) => balances.push((Asset::Btc, v)),
            Err(err) => tracing::warn!(error = %err, "btc balance refresh failed"),
        }
        match self.ctx.m1.wallet_balance_sats().await {
            Ok(v) => balances.push((Asset::M1, v)),
            Err(err) => tracing::warn!(error = %err, "m1 balance refresh failed"),
        }
        match self
            .ctx
            .evm
            .token_balance(&self.ctx.cfg.chains.usdc_contract)
            .await
        {
            Ok(v) => balances.push((Asset::Usdc, v)),
            Err(err) => tracing::warn!(error = %err, "usdc balance refresh failed"),
        }
        if !balances.is_empty() {
            self.ctx.inventory.set_balances(&balances);
        }
    }
}

fn parse_outpoint(outpoint: &Option<String>) -> Option<(String, u32)> {
    let (txid, vout) = outpoint.as_ref()?.split_once(':')?;
    Some((txid.to_string(), vout.parse().ok()?))
}

fn utxo_funding(leg: &crate::swap::Leg) -> Option<Htlc3sFunding> {
    let (txid, vout) = parse_outpoint(&leg.outpoint)?;
    Some(Htlc3sFunding {
        txid: txid.parse().ok()?,
        vout,
        amount_sats: leg.amount,
    })
}

fn parse_leg_spec(leg: &crate::swap::Leg) -> Result<Htlc3sSpec> {
    let raw = hex::decode(&leg.script_or_id).context("decode leg redeem script")?;
    Htlc3sSpec::parse_redeem_script(bitcoin::Script::from_bytes(&raw))
}

fn parse_pubkey(s: &str) -> Result<[u8; 33]> {
    let bytes = hex::decode(s).context("decode pubkey hex")?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("pubkey must be 33 bytes"))
}
