//! Thin command interfaces to the three chain daemons. Pure I/O: no swap
//! logic lives here. Each client tracks a degraded flag that the watchers
//! use to back off polling when the daemon stops answering.

pub mod btc;
pub mod evm;
pub mod m1;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use rand::Rng as _;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

pub const RPC_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(60);
const RETRY_ATTEMPTS: u32 = 4;

/// Shared health flag; set while the daemon fails to answer.
#[derive(Debug, Default, Clone)]
pub struct ChainHealth(Arc<AtomicBool>);

impl ChainHealth {
    pub fn is_degraded(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn set_degraded(&self, degraded: bool) {
        self.0.store(degraded, Ordering::Relaxed);
    }
}

/// JSON-RPC 2.0 transport with timeout, retry with jitter and health
/// tracking.
#[derive(Debug, Clone)]
pub struct JsonRpcClient {
    http: reqwest::Client,
    url: String,
    chain: &'static str,
    health: ChainHealth,
}

impl JsonRpcClient {
    pub fn new(url: impl Into<String>, chain: &'static str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .user_agent("flowswap-lp")
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            url: url.into(),
            chain,
            health: ChainHealth::default(),
        })
    }

    pub fn health(&self) -> ChainHealth {
        self.health.clone()
    }

    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let mut delay = RETRY_BASE;
        let mut last_err = None;

        for attempt in 0..RETRY_ATTEMPTS {
            if attempt > 0 {
                let jitter_ms: u64 = rand::thread_rng().gen_range(0..250);
                tokio::time::sleep(delay + Duration::from_millis(jitter_ms)).await;
                delay = (delay * 2).min(RETRY_CAP);
            }

            match self.call_once(method, params.clone()).await {
                Ok(v) => {
                    self.health.set_degraded(false);
                    return Ok(v);
                }
                Err(err) => {
                    tracing::debug!(
                        chain = self.chain,
                        method,
                        attempt,
                        error = %err,
                        "rpc call failed"
                    );
                    last_err = Some(err);
                }
            }
        }

        self.health.set_degraded(true);
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("rpc retry budget exhausted")))
            .with_context(|| format!("{} rpc {method} failed after retries", self.chain))
    }

    async fn call_once<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let resp: Value = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("post {method}"))?
            .error_for_status()
            .with_context(|| format!("{method} http status"))?
            .json()
            .await
            .with_context(|| format!("decode {method} response"))?;

        if let Some(err) = resp.get("error").filter(|e| !e.is_null()) {
            anyhow::bail!("{method} rpc error: {err}");
        }
        let result = resp
            .get("result")
            .cloned()
            .with_context(|| format!("{method} response has no result"))?;
        serde_json::from_value(result).with_context(|| format!("decode {method} result"))
    }
}
