//! M1 watcher loop. The M1 daemon speaks the same dialect as Bitcoin
//! Core, so the scan logic is shared with the BTC watcher; only the poll
//! cadence and the reorg window differ.

use std::sync::Arc;

use crate::swap::engine::Engine;
use crate::swap::Chain;

use super::{DEGRADED_POLL, M1_POLL};

pub async fn run(engine: Arc<Engine>) {
    let rpc = engine.ctx().m1.clone();
    loop {
        if let Err(err) = super::btc::scan_chain(&engine, rpc.inner(), Chain::M1).await {
            tracing::warn!(error = %err, "m1 watcher pass failed");
        }
        let poll = if rpc.health().is_degraded() {
            DEGRADED_POLL
        } else {
            M1_POLL
        };
        tokio::time::sleep(poll).await;
    }
}
