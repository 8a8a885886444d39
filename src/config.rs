//! LP configuration: pair table, confirmation tiers, timelock policy.
//!
//! The engine reads the config at transition time and never mutates it;
//! updates replace the whole `Arc` atomically.

use serde::{Deserialize, Serialize};

use crate::swap::{Asset, Chain};

/// One tradeable pair with its integer-rate quote parameters.
///
/// `rate_num / rate_den` converts one atomic unit of `from` into atomic
/// units of `to`; the spread is taken in basis points. All quote math is
/// integer only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairConfig {
    pub from: Asset,
    pub to: Asset,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub rate_num: u64,
    pub rate_den: u64,
    /// Spread in basis points applied to the quoted output.
    pub spread_bps: u64,
    /// Flat protocol fee in atomic units of `to`.
    #[serde(default)]
    pub protocol_fee: u64,
    pub min_from_amount: u64,
    pub max_from_amount: u64,
}

impl PairConfig {
    /// `to_amount = floor(from_amount * rate * (1 - spread)) - protocol_fee`.
    pub fn quote(&self, from_amount: u64) -> Option<u64> {
        if !self.enabled
            || from_amount < self.min_from_amount
            || from_amount > self.max_from_amount
        {
            return None;
        }
        let gross = (from_amount as u128)
            .checked_mul(self.rate_num as u128)?
            .checked_mul(10_000u128.checked_sub(self.spread_bps as u128)?)?
            / (self.rate_den as u128 * 10_000);
        let net = gross.checked_sub(self.protocol_fee as u128)?;
        u64::try_from(net).ok().filter(|n| *n > 0)
    }
}

/// BTC confirmation tier: deposits up to `max_sats` need `confirmations`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConfirmationTier {
    pub max_sats: u64,
    pub confirmations: u32,
}

fn default_btc_tiers() -> Vec<ConfirmationTier> {
    vec![
        ConfirmationTier { max_sats: 1_000_000, confirmations: 1 },
        ConfirmationTier { max_sats: 10_000_000, confirmations: 2 },
        ConfirmationTier { max_sats: 50_000_000, confirmations: 3 },
        ConfirmationTier { max_sats: u64::MAX, confirmations: 6 },
    ]
}

/// Absolute timelock horizons handed to new HTLCs, per chain, expressed in
/// the chain's native unit (blocks for BTC/M1, seconds for EVM).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimelockPolicy {
    /// Forward (BTC -> USDC) horizons: BTC leg is upstream and longest.
    pub btc_delta_blocks: u32,
    pub m1_delta_blocks: u32,
    pub evm_delta_secs: u64,
    /// Reverse (USDC -> BTC) horizons: EVM leg is upstream and longest.
    pub rev_evm_delta_secs: u64,
    pub rev_btc_delta_blocks: u32,
    /// Minimum gap between adjacent legs, denominated on the upstream chain.
    pub btc_margin_blocks: u32,
    pub m1_margin_blocks: u32,
    pub evm_margin_secs: u64,
}

impl Default for TimelockPolicy {
    fn default() -> Self {
        Self {
            btc_delta_blocks: 288,
            m1_delta_blocks: 1440,
            evm_delta_secs: 43_200,
            rev_evm_delta_secs: 172_800,
            rev_btc_delta_blocks: 24,
            btc_margin_blocks: 144,
            m1_margin_blocks: 144,
            evm_margin_secs: 3_600,
        }
    }
}

/// Seconds per block used when comparing timelocks across chains.
pub const BTC_BLOCK_SECS: u64 = 600;
pub const M1_BLOCK_SECS: u64 = 60;

impl TimelockPolicy {
    pub fn margin_secs(&self, upstream: Chain) -> u64 {
        match upstream {
            Chain::Btc => self.btc_margin_blocks as u64 * BTC_BLOCK_SECS,
            Chain::M1 => self.m1_margin_blocks as u64 * M1_BLOCK_SECS,
            Chain::Evm => self.evm_margin_secs,
        }
    }

    /// Validate that leg horizons (in seconds from now) strictly decrease
    /// along the payment direction with at least the upstream margin.
    pub fn validate_cascade(&self, order: &[(Chain, u64)]) -> Result<(), String> {
        for pair in order.windows(2) {
            let (up_chain, up_secs) = pair[0];
            let (down_chain, down_secs) = pair[1];
            let margin = self.margin_secs(up_chain);
            if up_secs < down_secs + margin {
                return Err(format!(
                    "timelock cascade violated: {up_chain} horizon {up_secs}s must exceed \
                     {down_chain} horizon {down_secs}s by at least {margin}s"
                ));
            }
        }
        Ok(())
    }
}

/// Endpoints and chain parameters for the three daemons.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainEndpoints {
    pub btc_rpc_url: String,
    pub m1_rpc_url: String,
    pub evm_rpc_url: String,
    /// bitcoin | testnet | signet | regtest
    #[serde(default = "default_btc_network")]
    pub btc_network: String,
    #[serde(default = "default_m1_network")]
    pub m1_network: String,
    /// HTLC3S contract address on the EVM chain.
    pub htlc3s_contract: String,
    /// USDC token contract address.
    pub usdc_contract: String,
}

fn default_btc_network() -> String {
    "signet".into()
}
fn default_m1_network() -> String {
    "regtest".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LpConfig {
    pub lp_id: String,
    #[serde(default)]
    pub lp_name: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub db_path: std::path::PathBuf,
    /// Key directory, expected mode 700 with 600 files.
    pub key_dir: std::path::PathBuf,

    pub chains: ChainEndpoints,

    #[serde(default)]
    pub pairs: Vec<PairConfig>,
    #[serde(default = "default_btc_tiers")]
    pub btc_confirmation_tiers: Vec<ConfirmationTier>,
    #[serde(default)]
    pub timelocks: TimelockPolicy,

    /// Plan expiry: an unfunded swap is failed this many seconds after init.
    #[serde(default = "default_plan_expiry")]
    pub plan_expiry_secs: u64,
    /// Terminal swaps older than this many hours are archived.
    #[serde(default = "default_archive_grace")]
    pub archive_grace_hours: u64,
    /// Minimum mempool fee rate (sat/vB) accepted for 0-conf funding.
    #[serde(default = "default_min_fee_rate")]
    pub zero_conf_min_fee_rate: u64,

    #[serde(default = "default_true")]
    pub auto_claim: bool,
    #[serde(default = "default_true")]
    pub auto_refund: bool,

    /// Wallet balance refresh cadence, seconds.
    #[serde(default = "default_balance_refresh")]
    pub balance_refresh_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_port() -> u16 {
    8734
}
fn default_plan_expiry() -> u64 {
    900
}
fn default_archive_grace() -> u64 {
    24
}
fn default_min_fee_rate() -> u64 {
    1
}
fn default_balance_refresh() -> u64 {
    60
}

impl LpConfig {
    pub fn pair(&self, from: Asset, to: Asset) -> Option<&PairConfig> {
        self.pairs
            .iter()
            .find(|p| p.enabled && p.from == from && p.to == to)
    }

    /// Confirmations required for a BTC deposit of `amount_sats`.
    pub fn btc_confirmations_for(&self, amount_sats: u64) -> u32 {
        self.btc_confirmation_tiers
            .iter()
            .find(|t| amount_sats <= t.max_sats)
            .map(|t| t.confirmations)
            .unwrap_or(6)
    }

    /// Apply `LP_ID`, `LP_NAME`, `PORT` and `LP_FLOWSWAP_DB` overrides.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("LP_ID") {
            self.lp_id = v;
        }
        if let Ok(v) = std::env::var("LP_NAME") {
            self.lp_name = v;
        }
        if let Ok(v) = std::env::var("PORT") {
            if let Ok(p) = v.parse() {
                self.port = p;
            }
        }
        if let Ok(v) = std::env::var("LP_FLOWSWAP_DB") {
            self.db_path = v.into();
        }
    }
}
