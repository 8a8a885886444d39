use anyhow::{Context as _, Result};

use flowswap_lp::swap::store::JsonStore;
use flowswap_lp::swap::{
    Asset, Direction, Hashlocks, Leg, Reservation, RoutingMode, Secrets, Swap, SwapState,
    TxEvidence,
};

fn sample_swap(swap_id: &str, state: SwapState) -> Swap {
    Swap {
        swap_id: swap_id.to_string(),
        direction: Direction::Forward,
        routing: RoutingMode::SingleLp,
        from_asset: Asset::Btc,
        to_asset: Asset::Usdc,
        from_amount: 100_000,
        to_amount: 64_674_000,
        hashlocks: Hashlocks {
            h_user: [0x11; 32],
            h_lp1: [0x22; 32],
            h_lp2: [0x33; 32],
        },
        secrets: Secrets::default(),
        btc_leg: Leg {
            amount: 100_000,
            timelock: 265_000,
            address: format!("tb1q-htlc-{swap_id}"),
            script_or_id: "63a820".into(),
            outpoint: Some("aa:0".into()),
            funded: Some(TxEvidence { txid: "aa".into(), confirmations: 2 }),
            claimed: None,
            refunded: None,
        },
        m1_leg: Leg::default(),
        evm_leg: Leg::default(),
        state,
        parked_from: None,
        user_refund_address: "tb1q-refund".into(),
        user_payout_address: "0xabc".into(),
        user_pubkey: "02".repeat(33),
        timeline: vec![],
        reservations: vec![Reservation { asset: Asset::M1, amount: 100_000 }],
        created_at: 1_000,
        updated_at: 1_000,
        terminal_at: state.is_terminal().then_some(2_000),
    }
}

#[test]
fn store_persist_get_update_list() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let path = dir.path().join("flowswap.json");

    let mut store = JsonStore::open(path.clone(), "lp1").context("open store")?;

    let a = sample_swap("fs_a", SwapState::BtcFunded);
    store.persist(&a).context("persist fs_a")?;

    let got = store.get("fs_a").context("fs_a missing")?;
    assert_eq!(got, a);

    let mut updated = a.clone();
    updated.push_state(SwapState::M1Locked, "m1 htlc confirmed", 1_500);
    store.persist(&updated).context("persist update")?;
    let got = store.get("fs_a").context("fs_a missing after update")?;
    assert_eq!(got.state, SwapState::M1Locked);
    assert_eq!(got.timeline.len(), 1);

    let b = sample_swap("fs_b", SwapState::AwaitingBtc);
    store.persist(&b).context("persist fs_b")?;

    let all = store.list(None, 100);
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].swap_id, "fs_a");
    assert_eq!(all[1].swap_id, "fs_b");

    let filtered = store.list(Some(SwapState::AwaitingBtc), 100);
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].swap_id, "fs_b");

    assert!(store.get("fs_missing").is_none());
    Ok(())
}

#[test]
fn store_reload_is_byte_identical() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let path = dir.path().join("flowswap.json");

    let mut store = JsonStore::open(path.clone(), "lp1").context("open store")?;
    store.persist(&sample_swap("fs_b", SwapState::AwaitingBtc))?;
    store.persist(&sample_swap("fs_a", SwapState::Completed))?;
    drop(store);

    let first = std::fs::read(&path).context("read snapshot")?;

    // Reload and rewrite: the snapshot must not churn.
    let mut store = JsonStore::open(path.clone(), "lp1").context("reopen store")?;
    store.persist(&sample_swap("fs_a", SwapState::Completed))?;
    let second = std::fs::read(&path).context("read snapshot again")?;

    assert_eq!(first, second);
    Ok(())
}

#[test]
fn store_rejects_foreign_lp() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let path = dir.path().join("flowswap.json");

    let mut store = JsonStore::open(path.clone(), "lp1")?;
    store.persist(&sample_swap("fs_a", SwapState::AwaitingBtc))?;
    drop(store);

    assert!(JsonStore::open(path, "lp2").is_err());
    Ok(())
}

#[test]
fn resume_candidates_are_the_non_terminal_swaps() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mut store = JsonStore::open(dir.path().join("flowswap.json"), "lp1")?;

    store.persist(&sample_swap("fs_live", SwapState::UsdcLocked))?;
    store.persist(&sample_swap("fs_done", SwapState::Completed))?;
    store.persist(&sample_swap("fs_dead", SwapState::Failed))?;

    let resume = store.resume_candidates();
    assert_eq!(resume.len(), 1);
    assert_eq!(resume[0].swap_id, "fs_live");
    Ok(())
}

#[test]
fn archive_moves_aged_terminal_swaps() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let path = dir.path().join("flowswap.json");
    let mut store = JsonStore::open(path.clone(), "lp1")?;

    store.persist(&sample_swap("fs_old", SwapState::Completed))?; // terminal_at 2_000
    store.persist(&sample_swap("fs_live", SwapState::M1Locked))?;

    // Not old enough yet.
    assert_eq!(store.archive_terminal(86_400, 10_000)?, 0);
    // 24h later it is.
    assert_eq!(store.archive_terminal(86_400, 2_000 + 86_400)?, 1);
    assert!(store.get("fs_old").is_none());
    assert!(store.get("fs_live").is_some());

    let archive_path = dir.path().join("flowswap.json.archive.json");
    let raw = std::fs::read(archive_path).context("read archive")?;
    let doc: serde_json::Value = serde_json::from_slice(&raw)?;
    assert!(doc["swaps"]["fs_old"].is_object());
    assert_eq!(doc["lp_id"], "lp1");
    Ok(())
}
