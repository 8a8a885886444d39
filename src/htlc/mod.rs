//! HTLC construction and parsing for the three chains.
//!
//! `script3s` covers the UTXO chains (BTC and M1 share the script template;
//! only network parameters differ), `evm3s` covers the contract ABI. The
//! engine works with [`HtlcDescriptor`] and dispatches by variant.

pub mod evm3s;
pub mod script3s;

use bitcoin::Network;

use crate::swap::{Chain, Hashlocks};

use evm3s::{CreateCall, EvmAddress};
use script3s::Htlc3sSpec;

/// A chain-tagged HTLC with everything needed to derive its address and
/// build fund/claim/refund transactions for it.
#[derive(Debug, Clone)]
pub enum HtlcDescriptor {
    Btc { spec: Htlc3sSpec, network: Network, amount_sats: u64 },
    M1 { spec: Htlc3sSpec, network: Network, amount_sats: u64 },
    Evm { contract: EvmAddress, create: CreateCall },
}

impl HtlcDescriptor {
    pub fn chain(&self) -> Chain {
        match self {
            HtlcDescriptor::Btc { .. } => Chain::Btc,
            HtlcDescriptor::M1 { .. } => Chain::M1,
            HtlcDescriptor::Evm { .. } => Chain::Evm,
        }
    }

    /// Deposit address (BTC/M1) or contract address (EVM).
    pub fn address(&self) -> String {
        match self {
            HtlcDescriptor::Btc { spec, network, .. } | HtlcDescriptor::M1 { spec, network, .. } => {
                spec.p2wsh_address(*network).to_string()
            }
            HtlcDescriptor::Evm { contract, .. } => evm3s::format_evm_address(contract),
        }
    }

    /// Redeem script hex (BTC/M1) or `create` calldata hex (EVM): the
    /// payload a counterparty needs to reproduce the lock.
    pub fn lock_payload_hex(&self) -> String {
        match self {
            HtlcDescriptor::Btc { spec, .. } | HtlcDescriptor::M1 { spec, .. } => {
                hex::encode(spec.redeem_script().as_bytes())
            }
            HtlcDescriptor::Evm { create, .. } => hex::encode(evm3s::encode_create(create)),
        }
    }

    pub fn hashlocks(&self) -> &Hashlocks {
        match self {
            HtlcDescriptor::Btc { spec, .. } | HtlcDescriptor::M1 { spec, .. } => {
                &spec.hashlocks
            }
            HtlcDescriptor::Evm { create, .. } => &create.hashlocks,
        }
    }

    /// Absolute timelock in the chain's native unit.
    pub fn timelock(&self) -> u64 {
        match self {
            HtlcDescriptor::Btc { spec, .. } | HtlcDescriptor::M1 { spec, .. } => {
                spec.timelock_height as u64
            }
            HtlcDescriptor::Evm { create, .. } => create.timelock,
        }
    }

    pub fn amount(&self) -> u64 {
        match self {
            HtlcDescriptor::Btc { amount_sats, .. } | HtlcDescriptor::M1 { amount_sats, .. } => {
                *amount_sats
            }
            HtlcDescriptor::Evm { create, .. } => create.amount,
        }
    }
}
