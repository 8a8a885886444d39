use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser as _;

use flowswap_lp::chains::btc::UtxoChainRpc;
use flowswap_lp::chains::evm::EvmRpc;
use flowswap_lp::chains::m1::M1Rpc;
use flowswap_lp::config::LpConfig;
use flowswap_lp::keys::LpKeys;
use flowswap_lp::swap::engine::{AppContext, Engine};
use flowswap_lp::swap::inventory::Inventory;
use flowswap_lp::swap::store::JsonStore;
use flowswap_lp::watch;
use flowswap_lp::watch::WatchTable;
use flowswap_lp::notify::PeerNotifier;

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);
const TICK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, clap::Parser)]
struct Args {
    /// Path to the LP config JSON.
    #[arg(long, default_value = "flowswap-lp.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    flowswap_lp::logging::init().ok();

    let args = Args::parse();

    let raw = std::fs::read(&args.config)
        .with_context(|| format!("read config {}", args.config.display()))?;
    let mut cfg: LpConfig =
        serde_json::from_slice(&raw).context("parse config")?;
    cfg.apply_env();

    let keys = LpKeys::load(&cfg.key_dir).context("load lp keys")?;
    tracing::info!(lp_id = %cfg.lp_id, keys = ?keys, "lp identity loaded");

    let store = JsonStore::open(cfg.db_path.clone(), &cfg.lp_id).context("open swap store")?;
    tracing::info!(path = %store.path().display(), "swap store ready");

    let btc = UtxoChainRpc::new(cfg.chains.btc_rpc_url.clone(), "btc")
        .context("create btc client")?;
    let m1 = M1Rpc::new(cfg.chains.m1_rpc_url.clone()).context("create m1 client")?;
    let evm = EvmRpc::new(cfg.chains.evm_rpc_url.clone(), keys.evm_sender.clone())
        .context("create evm client")?;

    let btc_network = cfg
        .chains
        .btc_network
        .parse()
        .context("parse btc_network")?;
    let m1_network = cfg.chains.m1_network.parse().context("parse m1_network")?;

    let inventory = Inventory::new(Duration::from_secs(cfg.balance_refresh_secs));
    let port = cfg.port;
    let archive_grace_hours = cfg.archive_grace_hours;

    let ctx = Arc::new(AppContext {
        cfg,
        store: std::sync::Mutex::new(store),
        inventory,
        watch: WatchTable::new(),
        notifier: PeerNotifier::new().context("create peer notifier")?,
        keys,
        btc,
        m1,
        evm,
        btc_wallet_gate: tokio::sync::Mutex::new(()),
        m1_wallet_gate: tokio::sync::Mutex::new(()),
        evm_wallet_gate: tokio::sync::Mutex::new(()),
        btc_network,
        m1_network,
    });

    let engine = Arc::new(Engine::new(ctx));

    // Resume scan before any watcher runs: restore reservations and watch
    // registrations; the watchers then re-derive each leg's status.
    engine.resume().context("resume non-terminal swaps")?;
    engine.refresh_balances().await;

    let watchers = [
        tokio::spawn(watch::btc::run(engine.clone())),
        tokio::spawn(watch::m1::run(engine.clone())),
        tokio::spawn(watch::evm::run(engine.clone())),
    ];

    let ticker = tokio::spawn({
        let engine = engine.clone();
        async move {
            loop {
                tokio::time::sleep(TICK_INTERVAL).await;
                engine.refresh_balances().await;
                engine.tick_all().await;
                if let Err(err) = engine.archive_terminal(archive_grace_hours) {
                    tracing::warn!(error = %err, "terminal archive pass failed");
                }
            }
        }
    });

    let server = tokio::spawn(flowswap_lp::api::serve(engine.clone(), port));

    tokio::signal::ctrl_c().await.context("wait for shutdown signal")?;
    tracing::info!("shutdown requested; draining");

    // Bounded drain: let in-flight swap events settle, then stop the
    // loops. The store is write-through, so state is already durable.
    let drain = tokio::time::timeout(SHUTDOWN_DRAIN, engine.tick_all());
    let _ = drain.await;

    for watcher in watchers {
        watcher.abort();
    }
    ticker.abort();
    server.abort();

    tracing::info!("flowswap lp stopped");
    Ok(())
}
