//! Chain watchers: one long-running loop per chain, filtering by the
//! interests the engine registers. Watchers map raw chain observations to
//! engine events and never touch swap state themselves.
//!
//! Interests hold the swap id only; the swap record itself always comes
//! back out of the store, so a stale interest can never resurrect a swap.

pub mod btc;
pub mod evm;
pub mod m1;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::swap::{Chain, Hash32, Hashlocks};

/// Poll cadence per chain.
pub const BTC_POLL: Duration = Duration::from_secs(10);
pub const M1_POLL: Duration = Duration::from_secs(10);
pub const EVM_POLL: Duration = Duration::from_secs(5);
/// Backoff cadence while a chain is degraded.
pub const DEGRADED_POLL: Duration = Duration::from_secs(60);

/// Startup re-scan window per chain, in blocks.
pub fn reorg_depth(chain: Chain) -> u64 {
    match chain {
        Chain::Btc => 12,
        Chain::M1 => 24,
        Chain::Evm => 32,
    }
}

/// What a UTXO-chain watcher tracks for one swap leg.
#[derive(Debug, Clone)]
pub struct UtxoInterest {
    pub swap_id: String,
    pub address: String,
    pub redeem_script_hex: String,
    pub expected_amount: u64,
    pub required_confs: u32,
    /// Set once the funding output is known; spend watching starts then.
    pub outpoint: Option<(String, u32)>,
    pub timelock_height: u64,
    /// Accept 0-conf mempool fundings (subject to the RBF/fee gate).
    pub accept_zero_conf: bool,
}

/// What the EVM watcher tracks for one swap leg.
#[derive(Debug, Clone)]
pub struct EvmInterest {
    pub swap_id: String,
    pub contract: String,
    pub hashlocks: Hashlocks,
    /// Set once HTLCCreated matched; claim/refund watching starts then.
    pub htlc_id: Option<Hash32>,
    pub timelock_unix: u64,
}

#[derive(Debug, Default)]
struct Interests {
    btc: HashMap<String, UtxoInterest>,
    m1: HashMap<String, UtxoInterest>,
    evm: HashMap<String, EvmInterest>,
}

/// Shared registration table between the engine and the three watchers.
#[derive(Debug, Default)]
pub struct WatchTable {
    interests: Mutex<Interests>,
}

impl WatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_utxo(&self, chain: Chain, interest: UtxoInterest) {
        let mut interests = self.interests.lock().expect("watch table poisoned");
        let map = match chain {
            Chain::Btc => &mut interests.btc,
            Chain::M1 => &mut interests.m1,
            Chain::Evm => return,
        };
        map.insert(interest.swap_id.clone(), interest);
    }

    pub fn register_evm(&self, interest: EvmInterest) {
        let mut interests = self.interests.lock().expect("watch table poisoned");
        interests.evm.insert(interest.swap_id.clone(), interest);
    }

    pub fn set_outpoint(&self, chain: Chain, swap_id: &str, txid: String, vout: u32) {
        let mut interests = self.interests.lock().expect("watch table poisoned");
        let map = match chain {
            Chain::Btc => &mut interests.btc,
            Chain::M1 => &mut interests.m1,
            Chain::Evm => return,
        };
        if let Some(interest) = map.get_mut(swap_id) {
            interest.outpoint = Some((txid, vout));
        }
    }

    pub fn set_evm_id(&self, swap_id: &str, htlc_id: Hash32) {
        let mut interests = self.interests.lock().expect("watch table poisoned");
        if let Some(interest) = interests.evm.get_mut(swap_id) {
            interest.htlc_id = Some(htlc_id);
        }
    }

    pub fn unregister(&self, chain: Chain, swap_id: &str) {
        let mut interests = self.interests.lock().expect("watch table poisoned");
        match chain {
            Chain::Btc => interests.btc.remove(swap_id),
            Chain::M1 => interests.m1.remove(swap_id),
            Chain::Evm => {
                interests.evm.remove(swap_id);
                None
            }
        };
    }

    pub fn unregister_all(&self, swap_id: &str) {
        let mut interests = self.interests.lock().expect("watch table poisoned");
        interests.btc.remove(swap_id);
        interests.m1.remove(swap_id);
        interests.evm.remove(swap_id);
    }

    pub fn utxo_interests(&self, chain: Chain) -> Vec<UtxoInterest> {
        let interests = self.interests.lock().expect("watch table poisoned");
        let map = match chain {
            Chain::Btc => &interests.btc,
            Chain::M1 => &interests.m1,
            Chain::Evm => return Vec::new(),
        };
        map.values().cloned().collect()
    }

    pub fn evm_interests(&self) -> Vec<EvmInterest> {
        let interests = self.interests.lock().expect("watch table poisoned");
        interests.evm.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(swap_id: &str) -> UtxoInterest {
        UtxoInterest {
            swap_id: swap_id.to_string(),
            address: "tb1qhtlc".into(),
            redeem_script_hex: "51".into(),
            expected_amount: 100_000,
            required_confs: 1,
            outpoint: None,
            timelock_height: 300_000,
            accept_zero_conf: true,
        }
    }

    #[test]
    fn registration_lifecycle() {
        let table = WatchTable::new();
        table.register_utxo(Chain::Btc, sample("fs_a"));
        table.register_utxo(Chain::M1, sample("fs_a"));
        assert_eq!(table.utxo_interests(Chain::Btc).len(), 1);

        table.set_outpoint(Chain::Btc, "fs_a", "txid".into(), 1);
        assert_eq!(
            table.utxo_interests(Chain::Btc)[0].outpoint,
            Some(("txid".to_string(), 1))
        );

        table.unregister_all("fs_a");
        assert!(table.utxo_interests(Chain::Btc).is_empty());
        assert!(table.utxo_interests(Chain::M1).is_empty());
    }
}
