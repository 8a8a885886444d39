pub mod engine;
pub mod inventory;
pub mod store;

use rand::RngCore as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Asset {
    Btc,
    M1,
    Usdc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Chain {
    Btc,
    M1,
    Evm,
}

impl Chain {
    pub fn name(self) -> &'static str {
        match self {
            Chain::Btc => "btc",
            Chain::M1 => "m1",
            Chain::Evm => "evm",
        }
    }
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// BTC -> USDC.
    Forward,
    /// USDC -> BTC.
    Reverse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum RoutingMode {
    SingleLp,
    PerLeg { role: LpRole, peer_url: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LpRole {
    LpIn,
    LpOut,
}

/// Swap lifecycle states. Terminal states never transition further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapState {
    Init,
    // Forward (BTC -> USDC).
    AwaitingBtc,
    BtcFundingSeen,
    BtcFunded,
    M1Locked,
    UsdcLocked,
    UsdcClaimedByUser,
    M1SelfClaimed,
    BtcClaimed,
    // Reverse (USDC -> BTC), mirrored.
    AwaitingUsdc,
    UsdcFundingSeen,
    UsdcFunded,
    BtcLocked,
    BtcClaimedByUser,
    UsdcClaimed,
    // Per-leg routing.
    M1LockedForLpOut,
    M1LockedSeen,
    M1ClaimedFromLpIn,
    /// Peer notify retry budget exhausted; non-terminal, operator-visible.
    PeerUnreachable,
    // Terminal.
    Completed,
    Refunded,
    Failed,
}

impl SwapState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SwapState::Completed | SwapState::Refunded | SwapState::Failed)
    }

    /// States in which no leg has on-chain funding yet. `force_fail` is
    /// only accepted here.
    pub fn is_prefunding(self) -> bool {
        matches!(
            self,
            SwapState::Init | SwapState::AwaitingBtc | SwapState::AwaitingUsdc
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SwapState::Init => "init",
            SwapState::AwaitingBtc => "awaiting_btc",
            SwapState::BtcFundingSeen => "btc_funding_seen",
            SwapState::BtcFunded => "btc_funded",
            SwapState::M1Locked => "m1_locked",
            SwapState::UsdcLocked => "usdc_locked",
            SwapState::UsdcClaimedByUser => "usdc_claimed_by_user",
            SwapState::M1SelfClaimed => "m1_self_claimed",
            SwapState::BtcClaimed => "btc_claimed",
            SwapState::AwaitingUsdc => "awaiting_usdc",
            SwapState::UsdcFundingSeen => "usdc_funding_seen",
            SwapState::UsdcFunded => "usdc_funded",
            SwapState::BtcLocked => "btc_locked",
            SwapState::BtcClaimedByUser => "btc_claimed_by_user",
            SwapState::UsdcClaimed => "usdc_claimed",
            SwapState::M1LockedForLpOut => "m1_locked_for_lp_out",
            SwapState::M1LockedSeen => "m1_locked_seen",
            SwapState::M1ClaimedFromLpIn => "m1_claimed_from_lp_in",
            SwapState::PeerUnreachable => "peer_unreachable",
            SwapState::Completed => "completed",
            SwapState::Refunded => "refunded",
            SwapState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SwapState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 32-byte value carried as lowercase hex in JSON.
pub type Hash32 = [u8; 32];

pub fn sha256(data: &[u8]) -> Hash32 {
    let mut h = Sha256::new();
    h.update(data);
    h.finalize().into()
}

/// Generate a random 32-byte secret and its SHA-256 hashlock.
pub fn generate_secret() -> (Hash32, Hash32) {
    let mut secret = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut secret);
    (secret, sha256(&secret))
}

pub fn hash32_from_hex(s: &str) -> EngineResult<Hash32> {
    let s = s.trim_start_matches("0x");
    let bytes =
        hex::decode(s).map_err(|e| EngineError::invariant(format!("invalid hex hash: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| EngineError::invariant("hash must be 32 bytes"))
}

mod hex32 {
    use serde::{Deserialize as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &super::Hash32, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<super::Hash32, D::Error> {
        let s = String::deserialize(d)?;
        super::hash32_from_hex(&s).map_err(serde::de::Error::custom)
    }
}

mod hex32_opt {
    use serde::{Deserialize as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        v: &Option<super::Hash32>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match v {
            Some(h) => s.serialize_some(&hex::encode(h)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<super::Hash32>, D::Error> {
        let s: Option<String> = Option::deserialize(d)?;
        s.map(|s| super::hash32_from_hex(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// The three hashlocks of a FlowSwap 3S swap: all present, all distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hashlocks {
    #[serde(with = "hex32")]
    pub h_user: Hash32,
    #[serde(with = "hex32")]
    pub h_lp1: Hash32,
    #[serde(with = "hex32")]
    pub h_lp2: Hash32,
}

impl Hashlocks {
    pub fn validate(&self) -> EngineResult<()> {
        if self.h_user == self.h_lp1 || self.h_user == self.h_lp2 || self.h_lp1 == self.h_lp2 {
            return Err(EngineError::invariant("hashlocks must be pairwise distinct"));
        }
        Ok(())
    }
}

/// Revealed preimages, filled in as chain events surface them. A preimage
/// is only stored after it verified against its hashlock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secrets {
    #[serde(with = "hex32_opt", default, skip_serializing_if = "Option::is_none")]
    pub s_user: Option<Hash32>,
    #[serde(with = "hex32_opt", default, skip_serializing_if = "Option::is_none")]
    pub s_lp1: Option<Hash32>,
    #[serde(with = "hex32_opt", default, skip_serializing_if = "Option::is_none")]
    pub s_lp2: Option<Hash32>,
}

impl Secrets {
    pub fn complete(&self) -> bool {
        self.s_user.is_some() && self.s_lp1.is_some() && self.s_lp2.is_some()
    }

    /// Verify each candidate against the hashlocks and absorb them all.
    /// Errors without storing anything if any candidate fails its hashlock.
    pub fn absorb_verified(
        &mut self,
        locks: &Hashlocks,
        s_user: Hash32,
        s_lp1: Hash32,
        s_lp2: Hash32,
    ) -> EngineResult<()> {
        for (name, secret, lock) in [
            ("s_user", s_user, locks.h_user),
            ("s_lp1", s_lp1, locks.h_lp1),
            ("s_lp2", s_lp2, locks.h_lp2),
        ] {
            if sha256(&secret) != lock {
                return Err(EngineError::invariant(format!(
                    "{name} does not match its hashlock"
                )));
            }
        }
        self.s_user = Some(s_user);
        self.s_lp1 = Some(s_lp1);
        self.s_lp2 = Some(s_lp2);
        Ok(())
    }
}

/// On-chain evidence for one leg transition: txid plus the deepest
/// confirmation count observed for it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxEvidence {
    pub txid: String,
    pub confirmations: u32,
}

/// One HTLC leg. BTC and M1 legs use block-height timelocks and script
/// outpoints; the EVM leg uses a unix-timestamp timelock and a contract id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leg {
    pub amount: u64,
    /// Absolute block height (BTC/M1) or unix seconds (EVM).
    pub timelock: u64,
    /// P2WSH address for BTC/M1; HTLC contract address for EVM.
    pub address: String,
    /// Redeem script hex for BTC/M1; bytes32 HTLC id hex for EVM.
    pub script_or_id: String,
    /// `txid:vout` of the funding output (BTC/M1 only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funded: Option<TxEvidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed: Option<TxEvidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refunded: Option<TxEvidence>,
}

impl Leg {
    pub fn is_funded(&self) -> bool {
        self.funded.as_ref().is_some_and(|e| e.confirmations > 0)
    }
}

/// An inventory claim held by a swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub asset: Asset,
    pub amount: u64,
}

/// One audit-trail entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub at: u64,
    pub state: SwapState,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Swap {
    pub swap_id: String,
    pub direction: Direction,
    pub routing: RoutingMode,
    pub from_asset: Asset,
    pub to_asset: Asset,
    pub from_amount: u64,
    pub to_amount: u64,

    pub hashlocks: Hashlocks,
    #[serde(default)]
    pub secrets: Secrets,

    #[serde(default)]
    pub btc_leg: Leg,
    #[serde(default)]
    pub m1_leg: Leg,
    #[serde(default)]
    pub evm_leg: Leg,

    pub state: SwapState,
    /// State the swap was in before parking in `peer_unreachable`; local
    /// progress resumes from here once the peer answers again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parked_from: Option<SwapState>,

    pub user_refund_address: String,
    pub user_payout_address: String,
    /// User's compressed pubkey (hex) for the BTC-leg branch it controls.
    #[serde(default)]
    pub user_pubkey: String,

    #[serde(default)]
    pub timeline: Vec<TimelineEvent>,
    #[serde(default)]
    pub reservations: Vec<Reservation>,

    pub created_at: u64,
    pub updated_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_at: Option<u64>,
}

impl Swap {
    pub fn new_id() -> String {
        let mut raw = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut raw);
        format!("fs_{}", hex::encode(raw))
    }

    pub fn leg(&self, chain: Chain) -> &Leg {
        match chain {
            Chain::Btc => &self.btc_leg,
            Chain::M1 => &self.m1_leg,
            Chain::Evm => &self.evm_leg,
        }
    }

    pub fn leg_mut(&mut self, chain: Chain) -> &mut Leg {
        match chain {
            Chain::Btc => &mut self.btc_leg,
            Chain::M1 => &mut self.m1_leg,
            Chain::Evm => &mut self.evm_leg,
        }
    }

    /// True if any leg has an on-chain funding tx recorded.
    pub fn any_leg_funded(&self) -> bool {
        [&self.btc_leg, &self.m1_leg, &self.evm_leg]
            .iter()
            .any(|l| l.funded.is_some())
    }

    /// Record a transition with its audit note. Entering a terminal state
    /// stamps `terminal_at` once.
    pub fn push_state(&mut self, state: SwapState, note: impl Into<String>, now: u64) {
        self.state = state;
        self.updated_at = now;
        if state.is_terminal() && self.terminal_at.is_none() {
            self.terminal_at = Some(now);
        }
        self.timeline.push(TimelineEvent {
            at: now,
            state,
            note: note.into(),
        });
    }

    /// Audit note without a state change.
    pub fn push_note(&mut self, note: impl Into<String>, now: u64) {
        self.updated_at = now;
        self.timeline.push(TimelineEvent {
            at: now,
            state: self.state,
            note: note.into(),
        });
    }
}
