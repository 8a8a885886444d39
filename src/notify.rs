//! Outbound callbacks to the cooperating peer LP in per-leg mode.
//!
//! Two calls exist: the M1 handoff announcement after LP_IN's HTLC
//! confirms, and the preimage hand-back after LP_OUT sweeps. Delivery
//! retries with exponential backoff; once the budget is spent the engine
//! parks the swap in `peer_unreachable`, and on-chain events remain
//! authoritative.

use std::time::Duration;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::swap::Hash32;

pub const NOTIFY_ATTEMPTS: u32 = 10;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Backoff before retry `attempt` (0-based): 1s doubling, capped at 60s.
pub fn backoff_for_attempt(attempt: u32) -> Duration {
    let secs = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_secs(secs)
        .max(BACKOFF_BASE)
        .min(BACKOFF_CAP)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct M1LockedNotice {
    pub outpoint: String,
    pub amount_sats: u64,
    pub expiry_height: u64,
    /// The HTLC redeem script, so the receiving LP can verify the
    /// hashlocks and derive the claim witness.
    pub redeem_script_hex: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsNotice {
    pub claim_txid: String,
    pub s_user: String,
    pub s_lp1: String,
    pub s_lp2: String,
}

impl SecretsNotice {
    pub fn from_secrets(claim_txid: &str, s_user: &Hash32, s_lp1: &Hash32, s_lp2: &Hash32) -> Self {
        Self {
            claim_txid: claim_txid.to_string(),
            s_user: hex::encode(s_user),
            s_lp1: hex::encode(s_lp1),
            s_lp2: hex::encode(s_lp2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerNotifier {
    http: reqwest::Client,
}

impl PeerNotifier {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("flowswap-lp")
            .build()
            .context("build notify http client")?;
        Ok(Self { http })
    }

    pub async fn m1_locked(
        &self,
        peer_url: &str,
        swap_id: &str,
        notice: &M1LockedNotice,
    ) -> Result<(), EngineError> {
        let url = format!("{}/api/flowswap/{swap_id}/m1-locked", peer_url.trim_end_matches('/'));
        self.post_with_backoff(&url, notice).await
    }

    pub async fn btc_claimed(
        &self,
        peer_url: &str,
        swap_id: &str,
        notice: &SecretsNotice,
    ) -> Result<(), EngineError> {
        let url = format!("{}/api/flowswap/{swap_id}/btc-claimed", peer_url.trim_end_matches('/'));
        self.post_with_backoff(&url, notice).await
    }

    async fn post_with_backoff<B: Serialize>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<(), EngineError> {
        for attempt in 0..NOTIFY_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(backoff_for_attempt(attempt - 1)).await;
            }

            match self.post_once(url, body).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(url, attempt, error = %err, "peer notify failed");
                }
            }
        }

        Err(EngineError::PeerUnreachable {
            url: url.to_string(),
            attempts: NOTIFY_ATTEMPTS,
        })
    }

    async fn post_once<B: Serialize>(&self, url: &str, body: &B) -> Result<()> {
        let resp = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("post {url}"))?;
        let status = resp.status();
        anyhow::ensure!(status.is_success(), "peer answered {status}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_for_attempt(0), Duration::from_secs(1));
        assert_eq!(backoff_for_attempt(1), Duration::from_secs(2));
        assert_eq!(backoff_for_attempt(5), Duration::from_secs(32));
        assert_eq!(backoff_for_attempt(6), Duration::from_secs(60));
        assert_eq!(backoff_for_attempt(31), Duration::from_secs(60));
    }

    #[test]
    fn secrets_notice_hex_encodes() {
        let notice = SecretsNotice::from_secrets("txid", &[0xab; 32], &[0xcd; 32], &[0xef; 32]);
        assert_eq!(notice.s_user, "ab".repeat(32));
        assert_eq!(notice.s_lp1, "cd".repeat(32));
        assert_eq!(notice.s_lp2, "ef".repeat(32));
    }
}
