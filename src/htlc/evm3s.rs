//! ABI codec for the HTLC3S contract on the EVM chain.
//!
//! The contract holds three hashlocks per HTLC and verifies preimages with
//! SHA-256 (not keccak) so the same preimages satisfy the BTC/M1 scripts.
//! `claim` is permissionless: anyone may submit the preimages, the funds
//! always go to the recipient fixed at creation.
//!
//! Methods:
//!   create(address recipient, address token, uint256 amount,
//!          bytes32 H_user, bytes32 H_lp1, bytes32 H_lp2, uint256 timelock)
//!       -> bytes32 htlcId
//!   claim(bytes32 htlcId, bytes32 S_user, bytes32 S_lp1, bytes32 S_lp2)
//!   refund(bytes32 htlcId)
//!   getHTLC(bytes32 htlcId) -> (sender, recipient, token, amount,
//!          H_user, H_lp1, H_lp2, timelock, claimed, refunded)
//!
//! Events:
//!   HTLCCreated(bytes32 indexed htlcId, address indexed sender,
//!               address indexed recipient, uint256 amount, uint256 timelock)
//!   HTLCClaimed(bytes32 indexed htlcId, bytes32 S_user, bytes32 S_lp1,
//!               bytes32 S_lp2)
//!   HTLCRefunded(bytes32 indexed htlcId)

use anyhow::{Context as _, Result};
use sha3::{Digest as _, Keccak256};

use crate::swap::{Hash32, Hashlocks};

pub type EvmAddress = [u8; 20];

const WORD: usize = 32;

fn keccak256(data: &[u8]) -> Hash32 {
    let mut h = Keccak256::new();
    h.update(data);
    h.finalize().into()
}

/// 4-byte function selector for a canonical signature.
fn selector(signature: &str) -> [u8; 4] {
    let digest = keccak256(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

pub fn create_selector() -> [u8; 4] {
    selector("create(address,address,uint256,bytes32,bytes32,bytes32,uint256)")
}

pub fn claim_selector() -> [u8; 4] {
    selector("claim(bytes32,bytes32,bytes32,bytes32)")
}

pub fn refund_selector() -> [u8; 4] {
    selector("refund(bytes32)")
}

pub fn get_htlc_selector() -> [u8; 4] {
    selector("getHTLC(bytes32)")
}

pub fn created_event_topic() -> Hash32 {
    keccak256(b"HTLCCreated(bytes32,address,address,uint256,uint256)")
}

pub fn claimed_event_topic() -> Hash32 {
    keccak256(b"HTLCClaimed(bytes32,bytes32,bytes32,bytes32)")
}

pub fn refunded_event_topic() -> Hash32 {
    keccak256(b"HTLCRefunded(bytes32)")
}

fn address_word(addr: &EvmAddress) -> [u8; WORD] {
    let mut w = [0u8; WORD];
    w[12..].copy_from_slice(addr);
    w
}

fn u64_word(v: u64) -> [u8; WORD] {
    let mut w = [0u8; WORD];
    w[24..].copy_from_slice(&v.to_be_bytes());
    w
}

fn word_at(data: &[u8], index: usize) -> Result<[u8; WORD]> {
    let start = index * WORD;
    let end = start + WORD;
    anyhow::ensure!(data.len() >= end, "calldata truncated at word {index}");
    let mut w = [0u8; WORD];
    w.copy_from_slice(&data[start..end]);
    Ok(w)
}

fn address_from_word(w: &[u8; WORD]) -> Result<EvmAddress> {
    anyhow::ensure!(w[..12].iter().all(|b| *b == 0), "address word has high bytes set");
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&w[12..]);
    Ok(addr)
}

fn u64_from_word(w: &[u8; WORD]) -> Result<u64> {
    anyhow::ensure!(
        w[..24].iter().all(|b| *b == 0),
        "uint256 value exceeds u64 range"
    );
    Ok(u64::from_be_bytes(w[24..].try_into().expect("8 bytes")))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateCall {
    pub recipient: EvmAddress,
    pub token: EvmAddress,
    pub amount: u64,
    pub hashlocks: Hashlocks,
    pub timelock: u64,
}

pub fn encode_create(call: &CreateCall) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 7 * WORD);
    data.extend_from_slice(&create_selector());
    data.extend_from_slice(&address_word(&call.recipient));
    data.extend_from_slice(&address_word(&call.token));
    data.extend_from_slice(&u64_word(call.amount));
    data.extend_from_slice(&call.hashlocks.h_user);
    data.extend_from_slice(&call.hashlocks.h_lp1);
    data.extend_from_slice(&call.hashlocks.h_lp2);
    data.extend_from_slice(&u64_word(call.timelock));
    data
}

pub fn decode_create(data: &[u8]) -> Result<CreateCall> {
    anyhow::ensure!(data.len() >= 4, "calldata shorter than a selector");
    anyhow::ensure!(data[..4] == create_selector(), "not a create() call");
    let args = &data[4..];
    anyhow::ensure!(args.len() == 7 * WORD, "create() takes exactly 7 words");

    Ok(CreateCall {
        recipient: address_from_word(&word_at(args, 0)?)?,
        token: address_from_word(&word_at(args, 1)?)?,
        amount: u64_from_word(&word_at(args, 2)?)?,
        hashlocks: Hashlocks {
            h_user: word_at(args, 3)?,
            h_lp1: word_at(args, 4)?,
            h_lp2: word_at(args, 5)?,
        },
        timelock: u64_from_word(&word_at(args, 6)?)?,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimCall {
    pub htlc_id: Hash32,
    pub s_user: Hash32,
    pub s_lp1: Hash32,
    pub s_lp2: Hash32,
}

pub fn encode_claim(call: &ClaimCall) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 4 * WORD);
    data.extend_from_slice(&claim_selector());
    data.extend_from_slice(&call.htlc_id);
    data.extend_from_slice(&call.s_user);
    data.extend_from_slice(&call.s_lp1);
    data.extend_from_slice(&call.s_lp2);
    data
}

pub fn decode_claim(data: &[u8]) -> Result<ClaimCall> {
    anyhow::ensure!(data.len() >= 4, "calldata shorter than a selector");
    anyhow::ensure!(data[..4] == claim_selector(), "not a claim() call");
    let args = &data[4..];
    anyhow::ensure!(args.len() == 4 * WORD, "claim() takes exactly 4 words");

    Ok(ClaimCall {
        htlc_id: word_at(args, 0)?,
        s_user: word_at(args, 1)?,
        s_lp1: word_at(args, 2)?,
        s_lp2: word_at(args, 3)?,
    })
}

pub fn encode_refund(htlc_id: &Hash32) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + WORD);
    data.extend_from_slice(&refund_selector());
    data.extend_from_slice(htlc_id);
    data
}

pub fn encode_get_htlc(htlc_id: &Hash32) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + WORD);
    data.extend_from_slice(&get_htlc_selector());
    data.extend_from_slice(htlc_id);
    data
}

/// Contract-side HTLC storage, as returned by `getHTLC`. Used as the
/// tie-break when events and storage disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtlcStorage {
    pub sender: EvmAddress,
    pub recipient: EvmAddress,
    pub token: EvmAddress,
    pub amount: u64,
    pub hashlocks: Hashlocks,
    pub timelock: u64,
    pub claimed: bool,
    pub refunded: bool,
}

impl HtlcStorage {
    /// Zero sender means the id was never created.
    pub fn exists(&self) -> bool {
        self.sender != [0u8; 20]
    }
}

pub fn decode_htlc_storage(output: &[u8]) -> Result<HtlcStorage> {
    anyhow::ensure!(output.len() == 10 * WORD, "getHTLC returns exactly 10 words");

    let bool_at = |i: usize| -> Result<bool> {
        let w = word_at(output, i)?;
        match u64_from_word(&w)? {
            0 => Ok(false),
            1 => Ok(true),
            other => anyhow::bail!("bool word holds {other}"),
        }
    };

    Ok(HtlcStorage {
        sender: address_from_word(&word_at(output, 0)?)?,
        recipient: address_from_word(&word_at(output, 1)?)?,
        token: address_from_word(&word_at(output, 2)?)?,
        amount: u64_from_word(&word_at(output, 3)?)?,
        hashlocks: Hashlocks {
            h_user: word_at(output, 4)?,
            h_lp1: word_at(output, 5)?,
            h_lp2: word_at(output, 6)?,
        },
        timelock: u64_from_word(&word_at(output, 7)?)?,
        claimed: bool_at(8)?,
        refunded: bool_at(9)?,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedEvent {
    pub htlc_id: Hash32,
    pub sender: EvmAddress,
    pub recipient: EvmAddress,
    pub amount: u64,
    pub timelock: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedEvent {
    pub htlc_id: Hash32,
    pub s_user: Hash32,
    pub s_lp1: Hash32,
    pub s_lp2: Hash32,
}

/// Decode an `HTLCCreated` log: id/sender/recipient indexed, amount and
/// timelock in the data section.
pub fn decode_created_event(topics: &[Hash32], data: &[u8]) -> Result<CreatedEvent> {
    anyhow::ensure!(topics.len() == 4, "HTLCCreated carries 4 topics");
    anyhow::ensure!(topics[0] == created_event_topic(), "topic0 mismatch");
    anyhow::ensure!(data.len() == 2 * WORD, "HTLCCreated data is 2 words");

    Ok(CreatedEvent {
        htlc_id: topics[1],
        sender: address_from_word(&topics[2])?,
        recipient: address_from_word(&topics[3])?,
        amount: u64_from_word(&word_at(data, 0)?)?,
        timelock: u64_from_word(&word_at(data, 1)?)?,
    })
}

/// Decode an `HTLCClaimed` log: the three preimages travel in the data
/// section, id is the only indexed field.
pub fn decode_claimed_event(topics: &[Hash32], data: &[u8]) -> Result<ClaimedEvent> {
    anyhow::ensure!(topics.len() == 2, "HTLCClaimed carries 2 topics");
    anyhow::ensure!(topics[0] == claimed_event_topic(), "topic0 mismatch");
    anyhow::ensure!(data.len() == 3 * WORD, "HTLCClaimed data is 3 words");

    Ok(ClaimedEvent {
        htlc_id: topics[1],
        s_user: word_at(data, 0)?,
        s_lp1: word_at(data, 1)?,
        s_lp2: word_at(data, 2)?,
    })
}

/// Decode an `HTLCRefunded` log; returns the refunded id.
pub fn decode_refunded_event(topics: &[Hash32]) -> Result<Hash32> {
    anyhow::ensure!(topics.len() == 2, "HTLCRefunded carries 2 topics");
    anyhow::ensure!(topics[0] == refunded_event_topic(), "topic0 mismatch");
    Ok(topics[1])
}

pub fn parse_evm_address(s: &str) -> Result<EvmAddress> {
    let s = s.trim_start_matches("0x");
    let bytes = hex::decode(s).context("decode EVM address hex")?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("EVM address must be 20 bytes"))
}

pub fn format_evm_address(addr: &EvmAddress) -> String {
    format!("0x{}", hex::encode(addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap::generate_secret;

    fn sample_locks() -> Hashlocks {
        let (_, h_user) = generate_secret();
        let (_, h_lp1) = generate_secret();
        let (_, h_lp2) = generate_secret();
        Hashlocks { h_user, h_lp1, h_lp2 }
    }

    #[test]
    fn create_calldata_round_trips() {
        let call = CreateCall {
            recipient: [0xaa; 20],
            token: [0xbb; 20],
            amount: 64_674_000,
            hashlocks: sample_locks(),
            timelock: 1_900_000_000,
        };
        let data = encode_create(&call);
        assert_eq!(data.len(), 4 + 7 * 32);
        assert_eq!(decode_create(&data).unwrap(), call);
    }

    #[test]
    fn claim_calldata_round_trips() {
        let (s_user, _) = generate_secret();
        let (s_lp1, _) = generate_secret();
        let (s_lp2, _) = generate_secret();
        let call = ClaimCall {
            htlc_id: [0xc1; 32],
            s_user,
            s_lp1,
            s_lp2,
        };
        let data = encode_claim(&call);
        assert_eq!(decode_claim(&data).unwrap(), call);
    }

    #[test]
    fn decode_rejects_wrong_selector() {
        let call = ClaimCall {
            htlc_id: [1; 32],
            s_user: [2; 32],
            s_lp1: [3; 32],
            s_lp2: [4; 32],
        };
        let data = encode_claim(&call);
        assert!(decode_create(&data).is_err());
    }

    #[test]
    fn claimed_event_round_trips() {
        let (s_user, _) = generate_secret();
        let (s_lp1, _) = generate_secret();
        let (s_lp2, _) = generate_secret();

        let topics = vec![claimed_event_topic(), [0xc1; 32]];
        let mut data = Vec::new();
        data.extend_from_slice(&s_user);
        data.extend_from_slice(&s_lp1);
        data.extend_from_slice(&s_lp2);

        let ev = decode_claimed_event(&topics, &data).unwrap();
        assert_eq!(ev.htlc_id, [0xc1; 32]);
        assert_eq!((ev.s_user, ev.s_lp1, ev.s_lp2), (s_user, s_lp1, s_lp2));
    }

    #[test]
    fn storage_tuple_round_trips() {
        let storage = HtlcStorage {
            sender: [0x01; 20],
            recipient: [0x02; 20],
            token: [0x03; 20],
            amount: 1_000_000,
            hashlocks: sample_locks(),
            timelock: 1_800_000_000,
            claimed: true,
            refunded: false,
        };

        let mut output = Vec::new();
        output.extend_from_slice(&address_word(&storage.sender));
        output.extend_from_slice(&address_word(&storage.recipient));
        output.extend_from_slice(&address_word(&storage.token));
        output.extend_from_slice(&u64_word(storage.amount));
        output.extend_from_slice(&storage.hashlocks.h_user);
        output.extend_from_slice(&storage.hashlocks.h_lp1);
        output.extend_from_slice(&storage.hashlocks.h_lp2);
        output.extend_from_slice(&u64_word(storage.timelock));
        output.extend_from_slice(&u64_word(1));
        output.extend_from_slice(&u64_word(0));

        assert_eq!(decode_htlc_storage(&output).unwrap(), storage);
        assert!(storage.exists());
    }

    #[test]
    fn evm_address_parses_with_and_without_prefix() {
        let addr = parse_evm_address("0x036CbD53842c5426634e7929541eC2318f3dCF7e").unwrap();
        assert_eq!(format_evm_address(&addr), "0x036cbd53842c5426634e7929541ec2318f3dcf7e");
        assert!(parse_evm_address("0x1234").is_err());
    }
}
