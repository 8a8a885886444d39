//! State-machine scenarios driven through the engine's pure decide/commit
//! core (`transition` + `apply`), with scripted chain events and no I/O.

use flowswap_lp::config::{ChainEndpoints, LpConfig, PairConfig, TimelockPolicy};
use flowswap_lp::error::EngineError;
use flowswap_lp::htlc::script3s::Htlc3sSpec;
use flowswap_lp::swap::engine::{
    apply, lp_funded_chains, transition, Action, EvidenceKind, SwapEvent, Transition,
};
use flowswap_lp::swap::{
    generate_secret, Asset, Chain, Direction, Hash32, Hashlocks, Leg, LpRole, RoutingMode,
    Secrets, Swap, SwapState, TxEvidence,
};

fn test_config() -> LpConfig {
    LpConfig {
        lp_id: "lp-test".into(),
        lp_name: "test".into(),
        port: 0,
        db_path: "unused.json".into(),
        key_dir: "unused".into(),
        chains: ChainEndpoints {
            btc_rpc_url: String::new(),
            m1_rpc_url: String::new(),
            evm_rpc_url: String::new(),
            btc_network: "signet".into(),
            m1_network: "regtest".into(),
            htlc3s_contract: "0x2493eaaaba6b129962c8967aaee6bf11d0277756".into(),
            usdc_contract: "0x036cbd53842c5426634e7929541ec2318f3dcf7e".into(),
        },
        pairs: vec![PairConfig {
            from: Asset::Btc,
            to: Asset::Usdc,
            enabled: true,
            rate_num: 650,
            rate_den: 1,
            spread_bps: 50,
            protocol_fee: 0,
            min_from_amount: 1_000,
            max_from_amount: 100_000_000,
        }],
        btc_confirmation_tiers: vec![
            flowswap_lp::config::ConfirmationTier { max_sats: 1_000_000, confirmations: 1 },
            flowswap_lp::config::ConfirmationTier { max_sats: 10_000_000, confirmations: 2 },
            flowswap_lp::config::ConfirmationTier { max_sats: 50_000_000, confirmations: 3 },
            flowswap_lp::config::ConfirmationTier { max_sats: u64::MAX, confirmations: 6 },
        ],
        timelocks: TimelockPolicy::default(),
        plan_expiry_secs: 900,
        archive_grace_hours: 24,
        zero_conf_min_fee_rate: 1,
        auto_claim: true,
        auto_refund: true,
        balance_refresh_secs: 60,
    }
}

struct Fixture {
    s_user: Hash32,
    s_lp1: Hash32,
    s_lp2: Hash32,
    swap: Swap,
    cfg: LpConfig,
    clock: u64,
}

impl Fixture {
    fn forward() -> Self {
        Self::new(Direction::Forward, RoutingMode::SingleLp)
    }

    fn new(direction: Direction, routing: RoutingMode) -> Self {
        let (s_user, h_user) = generate_secret();
        let (s_lp1, h_lp1) = generate_secret();
        let (s_lp2, h_lp2) = generate_secret();
        let hashlocks = Hashlocks { h_user, h_lp1, h_lp2 };

        let initial = match (&routing, direction) {
            (RoutingMode::PerLeg { role: LpRole::LpOut, .. }, _) => SwapState::Init,
            (_, Direction::Forward) => SwapState::AwaitingBtc,
            (_, Direction::Reverse) => SwapState::AwaitingUsdc,
        };

        let swap = Swap {
            swap_id: Swap::new_id(),
            direction,
            routing,
            from_asset: Asset::Btc,
            to_asset: Asset::Usdc,
            from_amount: 100_000,
            to_amount: 64_675_000,
            hashlocks,
            secrets: Secrets::default(),
            btc_leg: Leg {
                amount: 100_000,
                timelock: 265_288,
                address: "tb1q-btc-htlc".into(),
                script_or_id: "63a820".into(),
                ..Default::default()
            },
            m1_leg: Leg::default(),
            evm_leg: Leg::default(),
            state: initial,
            parked_from: None,
            user_refund_address: "tb1q-user-refund".into(),
            user_payout_address: "0x00aa00aa00aa00aa00aa00aa00aa00aa00aa00aa".into(),
            user_pubkey: "02".repeat(33),
            timeline: vec![],
            reservations: vec![],
            created_at: 1_000,
            updated_at: 1_000,
            terminal_at: None,
        };

        Self {
            s_user,
            s_lp1,
            s_lp2,
            swap,
            cfg: test_config(),
            clock: 1_000,
        }
    }

    /// Decide + commit one event, asserting the decide phase succeeds.
    fn drive(&mut self, event: SwapEvent) -> Transition {
        self.clock += 10;
        let t = transition(&self.swap, &event, &self.cfg, self.clock)
            .unwrap_or_else(|e| panic!("transition failed on {event:?}: {e}"));
        apply(&mut self.swap, &t, self.clock);
        t
    }

    fn drive_err(&mut self, event: SwapEvent) -> EngineError {
        transition(&self.swap, &event, &self.cfg, self.clock)
            .err()
            .expect("transition should be refused")
    }

    /// Simulate the perform/commit of a lock broadcast filling leg fields.
    fn fill_m1_leg(&mut self) {
        self.swap.m1_leg.amount = self.swap.from_amount;
        self.swap.m1_leg.timelock = 10_000;
        self.swap.m1_leg.address = "m1-htlc-address".into();
        self.swap.m1_leg.script_or_id = "63a820".into();
    }

    fn fill_evm_leg(&mut self) {
        self.swap.evm_leg.amount = self.swap.to_amount;
        self.swap.evm_leg.timelock = 1_900_000_000;
        self.swap.evm_leg.address = self.cfg.chains.htlc3s_contract.clone();
    }

    fn claim_event(&self, chain: Chain, txid: &str, confirmations: u32) -> SwapEvent {
        SwapEvent::ClaimSeen {
            chain,
            txid: txid.into(),
            s_user: self.s_user,
            s_lp1: self.s_lp1,
            s_lp2: self.s_lp2,
            confirmations,
        }
    }
}

fn funding(chain: Chain, txid: &str, confirmations: u32) -> SwapEvent {
    SwapEvent::FundingSeen {
        chain,
        txid: txid.into(),
        vout: 0,
        amount: 100_000,
        confirmations,
        rbf_safe: true,
    }
}

// Scenario: forward happy path, BTC deposit through to completion.
#[test]
fn forward_happy_path_reaches_completed() {
    let mut fx = Fixture::forward();

    // Deposit seen in the mempool, then confirmed to the tier requirement.
    fx.drive(funding(Chain::Btc, "t1", 0));
    assert_eq!(fx.swap.state, SwapState::BtcFundingSeen);

    let t = fx.drive(SwapEvent::Confirmations {
        chain: Chain::Btc,
        kind: EvidenceKind::Fund,
        txid: "t1".into(),
        confirmations: 1,
    });
    assert_eq!(fx.swap.state, SwapState::BtcFunded);
    assert!(t.actions.contains(&Action::LockM1));
    assert!(t.actions.contains(&Action::Reserve { asset: Asset::M1, amount: 100_000 }));
    assert!(t.actions.contains(&Action::Reserve { asset: Asset::Usdc, amount: 64_675_000 }));

    // LP locks M1; the watcher reports the confirmed funding.
    fx.fill_m1_leg();
    let t = fx.drive(funding(Chain::M1, "t2", 1));
    assert_eq!(fx.swap.state, SwapState::M1Locked);
    assert!(t.actions.contains(&Action::LockUsdc));

    // LP locks USDC; HTLCCreated lands one block deep.
    fx.fill_evm_leg();
    let t = fx.drive(SwapEvent::EvmHtlcCreated {
        htlc_id: [0xc1; 32],
        tx_hash: "0xcreate".into(),
        confirmations: 1,
    });
    assert_eq!(fx.swap.state, SwapState::UsdcLocked);
    assert!(t.actions.contains(&Action::DiscloseLpSecrets));
    assert_eq!(fx.swap.evm_leg.script_or_id, hex::encode([0xc1; 32]));

    // User claims USDC, revealing all three preimages.
    let t = fx.drive(fx.claim_event(Chain::Evm, "0xclaim", 1));
    assert_eq!(fx.swap.state, SwapState::UsdcClaimedByUser);
    assert!(fx.swap.secrets.complete());
    assert!(t.actions.contains(&Action::Claim(Chain::M1)));

    // LP sweeps M1, then BTC.
    let t = fx.drive(fx.claim_event(Chain::M1, "t3", 1));
    assert_eq!(fx.swap.state, SwapState::M1SelfClaimed);
    assert!(t.actions.contains(&Action::Claim(Chain::Btc)));

    fx.drive(fx.claim_event(Chain::Btc, "t4", 0));
    assert_eq!(fx.swap.state, SwapState::BtcClaimed);

    let t = fx.drive(SwapEvent::Confirmations {
        chain: Chain::Btc,
        kind: EvidenceKind::Claim,
        txid: "t4".into(),
        confirmations: 1,
    });
    assert_eq!(fx.swap.state, SwapState::Completed);
    assert!(t.actions.contains(&Action::ReleaseReservations));
    assert_eq!(fx.swap.to_amount, 64_675_000);
    assert!(fx.swap.terminal_at.is_some());
}

// Replaying any event after it took effect must be a no-op (at-least-once
// delivery tolerance).
#[test]
fn replayed_events_are_noops() {
    let mut fx = Fixture::forward();

    let script = [
        funding(Chain::Btc, "t1", 1),
        funding(Chain::M1, "t2", 1),
        SwapEvent::EvmHtlcCreated {
            htlc_id: [0xc1; 32],
            tx_hash: "0xcreate".into(),
            confirmations: 1,
        },
        fx.claim_event(Chain::Evm, "0xclaim", 1),
        fx.claim_event(Chain::M1, "t3", 1),
        fx.claim_event(Chain::Btc, "t4", 1),
    ];

    for event in script {
        match event {
            SwapEvent::FundingSeen { chain: Chain::M1, .. } => fx.fill_m1_leg(),
            SwapEvent::EvmHtlcCreated { .. } => fx.fill_evm_leg(),
            _ => {}
        }
        fx.drive(event.clone());
        let before = fx.swap.clone();
        let replay = transition(&fx.swap, &event, &fx.cfg, fx.clock).unwrap();
        assert!(replay.steps.is_empty(), "replay produced steps: {replay:?}");
        apply(&mut fx.swap, &replay, fx.clock);
        assert_eq!(fx.swap.state, before.state);
        assert_eq!(fx.swap.timeline, before.timeline);
    }
    assert_eq!(fx.swap.state, SwapState::Completed);
}

// Scenario: user abandons after init; the plan expires unfunded.
#[test]
fn unfunded_plan_expires_on_tick() {
    let mut fx = Fixture::forward();
    fx.clock = 1_000 + 890; // drive() adds 10 before evaluating
    let t = fx.drive(SwapEvent::Tick);
    assert_eq!(fx.swap.state, SwapState::Failed);
    assert!(t.actions.contains(&Action::ReleaseReservations));
    assert!(fx.swap.reservations.is_empty());
}

#[test]
fn force_fail_only_before_funding() {
    let mut fx = Fixture::forward();
    // Funding seen: operator force-fail must be refused.
    fx.drive(funding(Chain::Btc, "t1", 0));
    let err = fx.drive_err(SwapEvent::ForceFail);
    assert!(matches!(err, EngineError::BadState { .. }));

    // A fresh plan can be force-failed.
    let mut fx = Fixture::forward();
    fx.drive(SwapEvent::ForceFail);
    assert_eq!(fx.swap.state, SwapState::Failed);
}

// Scenario: LP funded both legs but the user never claims; both LP legs
// refund after their timelocks and the swap ends refunded.
#[test]
fn lp_refund_path_after_user_walks_away() {
    let mut fx = Fixture::forward();
    fx.drive(funding(Chain::Btc, "t1", 1));
    fx.fill_m1_leg();
    fx.drive(funding(Chain::M1, "t2", 1));
    fx.fill_evm_leg();
    fx.drive(SwapEvent::EvmHtlcCreated {
        htlc_id: [0xc1; 32],
        tx_hash: "0xcreate".into(),
        confirmations: 1,
    });
    assert_eq!(fx.swap.state, SwapState::UsdcLocked);

    let t = fx.drive(SwapEvent::TimelockExpired { chain: Chain::Evm });
    assert!(t.actions.contains(&Action::Refund(Chain::Evm)));

    fx.drive(SwapEvent::RefundSeen {
        chain: Chain::Evm,
        txid: "0xrefund".into(),
        confirmations: 1,
    });
    assert_eq!(fx.swap.state, SwapState::UsdcLocked); // M1 still open

    let t = fx.drive(SwapEvent::TimelockExpired { chain: Chain::M1 });
    assert!(t.actions.contains(&Action::Refund(Chain::M1)));

    fx.drive(SwapEvent::RefundSeen {
        chain: Chain::M1,
        txid: "t5".into(),
        confirmations: 1,
    });
    assert_eq!(fx.swap.state, SwapState::Refunded);
    // The BTC deposit is the user's to refund; the LP never touches it.
    assert!(fx.swap.btc_leg.refunded.is_none());
}

// Claim-over-refund: once the preimages are known, an expired LP leg is
// never refunded; the upstream sweep is preferred.
#[test]
fn expired_leg_prefers_claim_when_secrets_known() {
    let mut fx = Fixture::forward();
    fx.drive(funding(Chain::Btc, "t1", 1));
    fx.fill_m1_leg();
    fx.drive(funding(Chain::M1, "t2", 1));
    fx.fill_evm_leg();
    fx.drive(SwapEvent::EvmHtlcCreated {
        htlc_id: [0xc1; 32],
        tx_hash: "0xcreate".into(),
        confirmations: 1,
    });
    fx.drive(fx.claim_event(Chain::Evm, "0xclaim", 1));
    assert!(fx.swap.secrets.complete());

    let t = fx.drive(SwapEvent::TimelockExpired { chain: Chain::M1 });
    assert!(!t.actions.contains(&Action::Refund(Chain::M1)));
    assert!(t.actions.contains(&Action::Claim(Chain::Btc)));
}

// Tie-break: a confirmed late claim supersedes an unconfirmed refund
// sighting and triggers the upstream sweep.
#[test]
fn confirmed_claim_dominates_unconfirmed_refund() {
    let mut fx = Fixture::forward();
    fx.drive(funding(Chain::Btc, "t1", 1));
    fx.fill_m1_leg();
    fx.drive(funding(Chain::M1, "t2", 1));
    fx.fill_evm_leg();
    fx.drive(SwapEvent::EvmHtlcCreated {
        htlc_id: [0xc1; 32],
        tx_hash: "0xcreate".into(),
        confirmations: 1,
    });

    // A refund broadcast was seen in the mempool but never confirmed.
    fx.drive(SwapEvent::RefundSeen {
        chain: Chain::M1,
        txid: "refund-tx".into(),
        confirmations: 0,
    });
    assert!(fx.swap.m1_leg.refunded.is_some());

    // Catch-up: a confirmed claim of the same leg surfaces.
    let t = fx.drive(fx.claim_event(Chain::M1, "claim-tx", 2));
    assert!(fx.swap.m1_leg.refunded.is_none());
    assert_eq!(fx.swap.m1_leg.claimed.as_ref().unwrap().txid, "claim-tx");
    assert!(fx.swap.secrets.complete());
    assert!(t.actions.contains(&Action::Claim(Chain::Btc)));

    // And the mirror image: an unconfirmed claim loses to a confirmed
    // refund already recorded.
    let mut fx2 = Fixture::forward();
    fx2.drive(funding(Chain::Btc, "t1", 1));
    fx2.fill_m1_leg();
    fx2.drive(funding(Chain::M1, "t2", 1));
    fx2.swap.m1_leg.refunded = Some(TxEvidence { txid: "refund-tx".into(), confirmations: 3 });
    let t = fx2.drive(fx2.claim_event(Chain::M1, "claim-tx", 0));
    assert!(t.steps.is_empty());
    assert!(fx2.swap.m1_leg.claimed.is_none());
}

// Scenario: a reorg orphans the BTC sweep after completion; the engine
// rolls back, re-claims and completes again.
#[test]
fn late_reorg_rolls_back_and_recovers() {
    let mut fx = Fixture::forward();
    fx.drive(funding(Chain::Btc, "t1", 1));
    fx.fill_m1_leg();
    fx.drive(funding(Chain::M1, "t2", 1));
    fx.fill_evm_leg();
    fx.drive(SwapEvent::EvmHtlcCreated {
        htlc_id: [0xc1; 32],
        tx_hash: "0xcreate".into(),
        confirmations: 1,
    });
    fx.drive(fx.claim_event(Chain::Evm, "0xclaim", 1));
    fx.drive(fx.claim_event(Chain::M1, "t3", 1));
    fx.drive(fx.claim_event(Chain::Btc, "t4", 1));
    assert_eq!(fx.swap.state, SwapState::Completed);

    let t = fx.drive(SwapEvent::Reorged {
        chain: Chain::Btc,
        kind: EvidenceKind::Claim,
        txid: "t4".into(),
    });
    assert_eq!(fx.swap.state, SwapState::M1SelfClaimed);
    assert!(fx.swap.btc_leg.claimed.is_none());
    assert!(t.actions.contains(&Action::Claim(Chain::Btc)));

    fx.drive(fx.claim_event(Chain::Btc, "t4-again", 1));
    assert_eq!(fx.swap.state, SwapState::Completed);

    // The audit trail keeps both the rollback and the re-claim.
    let notes: Vec<&str> = fx.swap.timeline.iter().map(|e| e.note.as_str()).collect();
    assert!(notes.iter().any(|n| n.contains("reorg orphaned btc claim")));
    assert_eq!(
        fx.swap.timeline.iter().filter(|e| e.state == SwapState::Completed).count(),
        2
    );
}

// Everything except a settlement reorg must leave a terminal state alone.
#[test]
fn terminal_states_absorb_ordinary_events() {
    let mut fx = Fixture::forward();
    fx.drive(SwapEvent::ForceFail);
    assert_eq!(fx.swap.state, SwapState::Failed);

    for event in [
        funding(Chain::Btc, "t9", 3),
        fx.claim_event(Chain::Evm, "0xlate", 5),
        SwapEvent::TimelockExpired { chain: Chain::M1 },
        SwapEvent::Tick,
    ] {
        let t = transition(&fx.swap, &event, &fx.cfg, fx.clock).unwrap();
        assert!(t.is_noop(), "terminal swap reacted to {event:?}");
    }
}

// Per-leg LP_OUT: M1 handoff in, USDC out, preimage hand-back.
#[test]
fn per_leg_lp_out_flow() {
    let mut fx = Fixture::new(
        Direction::Forward,
        RoutingMode::PerLeg { role: LpRole::LpOut, peer_url: "http://lp-in".into() },
    );
    fx.swap.btc_leg = Leg::default(); // LP_OUT has no BTC leg
    fx.swap.evm_leg.address = fx.cfg.chains.htlc3s_contract.clone();
    fx.swap.evm_leg.amount = fx.swap.to_amount;

    // Peer announces its M1 HTLC; the script must bind our hashlocks.
    let spec = Htlc3sSpec {
        hashlocks: fx.swap.hashlocks,
        recipient_pubkey: [0x02; 33],
        refund_pubkey: [0x03; 33],
        timelock_height: 20_000,
    };
    let script_hex = hex::encode(spec.redeem_script().as_bytes());
    fx.drive(SwapEvent::PeerM1Locked {
        outpoint: "m1fund:1".into(),
        amount_sats: 100_000,
        expiry_height: 20_000,
        redeem_script_hex: script_hex,
    });
    assert_eq!(fx.swap.m1_leg.outpoint.as_deref(), Some("m1fund:1"));
    assert_eq!(fx.swap.m1_leg.timelock, 20_000);

    // Watcher confirms the peer's funding; we reserve USDC and lock it.
    let t = fx.drive(funding(Chain::M1, "m1fund", 1));
    assert_eq!(fx.swap.state, SwapState::M1LockedSeen);
    assert!(t.actions.contains(&Action::Reserve { asset: Asset::Usdc, amount: fx.swap.to_amount }));
    assert!(t.actions.contains(&Action::LockUsdc));

    fx.drive(SwapEvent::EvmHtlcCreated {
        htlc_id: [0xd2; 32],
        tx_hash: "0xcreate".into(),
        confirmations: 1,
    });
    assert_eq!(fx.swap.state, SwapState::UsdcLocked);

    // User claims USDC; we sweep the peer's M1 and hand the secrets back.
    let t = fx.drive(fx.claim_event(Chain::Evm, "0xclaim", 1));
    assert_eq!(fx.swap.state, SwapState::UsdcClaimedByUser);
    assert!(t.actions.contains(&Action::Claim(Chain::M1)));

    let t = fx.drive(fx.claim_event(Chain::M1, "m1sweep", 1));
    assert_eq!(fx.swap.state, SwapState::M1ClaimedFromLpIn);
    assert!(t.actions.contains(&Action::NotifyPeerSecrets));
}

// Scenario: peer outage parks the swap; ticks keep retrying the notify.
#[test]
fn parked_peer_retries_on_tick() {
    let mut fx = Fixture::new(
        Direction::Forward,
        RoutingMode::PerLeg { role: LpRole::LpOut, peer_url: "http://lp-in".into() },
    );
    fx.swap.state = SwapState::PeerUnreachable;
    fx.swap.parked_from = Some(SwapState::M1ClaimedFromLpIn);

    let t = fx.drive(SwapEvent::Tick);
    assert!(t.actions.contains(&Action::NotifyPeerSecrets));
    assert_eq!(fx.swap.state, SwapState::PeerUnreachable);
}

// Per-leg LP_IN: secrets can also arrive through the peer callback.
#[test]
fn lp_in_accepts_peer_secrets_and_sweeps() {
    let mut fx = Fixture::new(
        Direction::Forward,
        RoutingMode::PerLeg { role: LpRole::LpIn, peer_url: "http://lp-out".into() },
    );
    fx.drive(funding(Chain::Btc, "t1", 1));
    fx.fill_m1_leg();
    let t = fx.drive(funding(Chain::M1, "t2", 1));
    assert_eq!(fx.swap.state, SwapState::M1LockedForLpOut);
    assert!(t.actions.contains(&Action::NotifyPeerM1Locked));

    let (s_user, s_lp1, s_lp2) = (fx.s_user, fx.s_lp1, fx.s_lp2);
    let t = fx.drive(SwapEvent::PeerSecrets {
        s_user,
        s_lp1,
        s_lp2,
        claim_txid: "m1sweep".into(),
    });
    assert!(fx.swap.secrets.complete());
    assert!(t.actions.contains(&Action::Claim(Chain::Btc)));

    fx.drive(fx.claim_event(Chain::Btc, "t4", 1));
    assert_eq!(fx.swap.state, SwapState::Completed);
}

// Preimages that do not match the hashlocks are rejected outright.
#[test]
fn mismatched_preimages_are_an_invariant_violation() {
    let mut fx = Fixture::new(
        Direction::Forward,
        RoutingMode::PerLeg { role: LpRole::LpIn, peer_url: "http://lp-out".into() },
    );
    fx.drive(funding(Chain::Btc, "t1", 1));
    fx.fill_m1_leg();
    fx.drive(funding(Chain::M1, "t2", 1));

    let err = fx.drive_err(SwapEvent::PeerSecrets {
        s_user: [0xff; 32],
        s_lp1: fx.s_lp1,
        s_lp2: fx.s_lp2,
        claim_txid: "bogus".into(),
    });
    assert!(matches!(err, EngineError::InvariantViolation(_)));
    assert!(!fx.swap.secrets.complete());
}

// Unsafe 0-conf deposits (RBF-signaled or underpaying) are ignored until
// they confirm.
#[test]
fn unsafe_zero_conf_funding_is_ignored() {
    let mut fx = Fixture::forward();
    let t = fx.drive(SwapEvent::FundingSeen {
        chain: Chain::Btc,
        txid: "rbf-tx".into(),
        vout: 0,
        amount: 100_000,
        confirmations: 0,
        rbf_safe: false,
    });
    assert_eq!(fx.swap.state, SwapState::AwaitingBtc);
    assert!(t.steps.is_empty());

    let t = fx.drive(SwapEvent::FundingSeen {
        chain: Chain::Btc,
        txid: "small-tx".into(),
        vout: 0,
        amount: 50_000,
        confirmations: 1,
        rbf_safe: true,
    });
    assert_eq!(fx.swap.state, SwapState::AwaitingBtc);
    assert!(t.steps.is_empty());
}

// Confirmation tiers: a large deposit needs more depth before the LP locks.
#[test]
fn large_deposit_waits_for_deeper_confirmation() {
    let mut fx = Fixture::forward();
    fx.swap.from_amount = 20_000_000; // 0.2 BTC -> 3 confirmations
    fx.swap.btc_leg.amount = 20_000_000;

    fx.drive(SwapEvent::FundingSeen {
        chain: Chain::Btc,
        txid: "t1".into(),
        vout: 0,
        amount: 20_000_000,
        confirmations: 2,
        rbf_safe: true,
    });
    assert_eq!(fx.swap.state, SwapState::BtcFundingSeen);

    fx.drive(SwapEvent::Confirmations {
        chain: Chain::Btc,
        kind: EvidenceKind::Fund,
        txid: "t1".into(),
        confirmations: 3,
    });
    assert_eq!(fx.swap.state, SwapState::BtcFunded);
}

// Reverse direction mirror: USDC in, BTC out.
#[test]
fn reverse_flow_reaches_completed() {
    let mut fx = Fixture::new(Direction::Reverse, RoutingMode::SingleLp);
    fx.swap.from_asset = Asset::Usdc;
    fx.swap.to_asset = Asset::Btc;
    fx.swap.from_amount = 65_000_000;
    fx.swap.to_amount = 99_000;
    fx.swap.btc_leg = Leg::default();
    fx.swap.evm_leg.address = fx.cfg.chains.htlc3s_contract.clone();
    fx.swap.evm_leg.amount = 65_000_000;

    let t = fx.drive(SwapEvent::EvmHtlcCreated {
        htlc_id: [0xe1; 32],
        tx_hash: "0xuserlock".into(),
        confirmations: 1,
    });
    assert_eq!(fx.swap.state, SwapState::UsdcFunded);
    assert!(t.actions.contains(&Action::LockM1));
    assert!(t.actions.contains(&Action::Reserve { asset: Asset::Btc, amount: 99_000 }));

    fx.fill_m1_leg();
    let t = fx.drive(funding(Chain::M1, "m1lock", 1));
    assert_eq!(fx.swap.state, SwapState::M1Locked);
    assert!(t.actions.contains(&Action::LockBtc));

    fx.swap.btc_leg.amount = 99_000;
    fx.swap.btc_leg.timelock = 270_000;
    fx.swap.btc_leg.address = "tb1q-payout-htlc".into();
    fx.swap.btc_leg.script_or_id = "63a820".into();
    let t = fx.drive(SwapEvent::FundingSeen {
        chain: Chain::Btc,
        txid: "btclock".into(),
        vout: 0,
        amount: 99_000,
        confirmations: 1,
        rbf_safe: true,
    });
    assert_eq!(fx.swap.state, SwapState::BtcLocked);
    assert!(t.actions.contains(&Action::DiscloseLpSecrets));

    // User claims BTC, revealing the preimages; LP sweeps M1 then USDC.
    let t = fx.drive(fx.claim_event(Chain::Btc, "userclaim", 1));
    assert_eq!(fx.swap.state, SwapState::BtcClaimedByUser);
    assert!(t.actions.contains(&Action::Claim(Chain::M1)));

    let t = fx.drive(fx.claim_event(Chain::M1, "m1sweep", 1));
    assert_eq!(fx.swap.state, SwapState::M1SelfClaimed);
    assert!(t.actions.contains(&Action::Claim(Chain::Evm)));

    fx.drive(fx.claim_event(Chain::Evm, "0xsweep", 1));
    assert_eq!(fx.swap.state, SwapState::Completed);
}

// Reservation bookkeeping matches the LP-funded legs per routing mode.
#[test]
fn lp_funded_legs_by_routing() {
    let forward = Fixture::forward().swap;
    assert_eq!(lp_funded_chains(&forward), &[Chain::M1, Chain::Evm]);

    let lp_in = Fixture::new(
        Direction::Forward,
        RoutingMode::PerLeg { role: LpRole::LpIn, peer_url: "p".into() },
    )
    .swap;
    assert_eq!(lp_funded_chains(&lp_in), &[Chain::M1]);

    let lp_out = Fixture::new(
        Direction::Forward,
        RoutingMode::PerLeg { role: LpRole::LpOut, peer_url: "p".into() },
    )
    .swap;
    assert_eq!(lp_funded_chains(&lp_out), &[Chain::Evm]);
}

// A reorg that orphans the deposit before the LP locked anything rolls
// the swap back to awaiting.
#[test]
fn orphaned_deposit_rolls_back_to_awaiting() {
    let mut fx = Fixture::forward();
    fx.drive(funding(Chain::Btc, "t1", 1));
    assert_eq!(fx.swap.state, SwapState::BtcFunded);

    fx.drive(SwapEvent::Reorged {
        chain: Chain::Btc,
        kind: EvidenceKind::Fund,
        txid: "t1".into(),
    });
    assert_eq!(fx.swap.state, SwapState::AwaitingBtc);
    assert!(fx.swap.btc_leg.funded.is_none());
}
