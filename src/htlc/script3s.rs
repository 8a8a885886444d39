//! Three-secret HTLC script codec for the UTXO chains (BTC and M1).
//!
//! Redeem script:
//!
//! ```text
//! OP_IF
//!     OP_SHA256 <H_user> OP_EQUALVERIFY
//!     OP_SHA256 <H_lp1>  OP_EQUALVERIFY
//!     OP_SHA256 <H_lp2>  OP_EQUALVERIFY
//!     <recipient_pubkey> OP_CHECKSIG
//! OP_ELSE
//!     <timelock> OP_CLTV OP_DROP
//!     <refund_pubkey> OP_CHECKSIG
//! OP_ENDIF
//! ```
//!
//! Claim witness, bottom of stack first:
//! `[sig, S_lp2, S_lp1, S_user, 0x01, script]`; refund witness is
//! `[sig, <empty>, script]`. Hashing is single SHA-256 throughout so the
//! preimages stay valid on the EVM side.

use anyhow::{Context as _, Result};
use bitcoin::absolute::LockTime;
use bitcoin::opcodes::all as op;
use bitcoin::script::{Builder, Instruction, Script, ScriptBuf};
use bitcoin::secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::hashes::Hash as _;
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, Network, OutPoint, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};

use crate::swap::{sha256, Hash32, Hashlocks};

/// Parameters of a 3-secret HTLC on a UTXO chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Htlc3sSpec {
    pub hashlocks: Hashlocks,
    /// Compressed pubkey that may claim with the three preimages.
    pub recipient_pubkey: [u8; 33],
    /// Compressed pubkey that may refund after the timelock.
    pub refund_pubkey: [u8; 33],
    /// Absolute block height for the refund branch.
    pub timelock_height: u32,
}

impl Htlc3sSpec {
    pub fn redeem_script(&self) -> ScriptBuf {
        Builder::new()
            .push_opcode(op::OP_IF)
            .push_opcode(op::OP_SHA256)
            .push_slice(self.hashlocks.h_user)
            .push_opcode(op::OP_EQUALVERIFY)
            .push_opcode(op::OP_SHA256)
            .push_slice(self.hashlocks.h_lp1)
            .push_opcode(op::OP_EQUALVERIFY)
            .push_opcode(op::OP_SHA256)
            .push_slice(self.hashlocks.h_lp2)
            .push_opcode(op::OP_EQUALVERIFY)
            .push_slice(self.recipient_pubkey)
            .push_opcode(op::OP_CHECKSIG)
            .push_opcode(op::OP_ELSE)
            .push_int(self.timelock_height as i64)
            .push_opcode(op::OP_CLTV)
            .push_opcode(op::OP_DROP)
            .push_slice(self.refund_pubkey)
            .push_opcode(op::OP_CHECKSIG)
            .push_opcode(op::OP_ENDIF)
            .into_script()
    }

    pub fn p2wsh_address(&self, network: Network) -> Address {
        Address::p2wsh(&self.redeem_script(), network)
    }

    /// Parse a redeem script back into its parameters. Rejects anything
    /// that is not byte-exact against the template above.
    pub fn parse_redeem_script(script: &Script) -> Result<Self> {
        let mut iter = script.instructions();

        expect_op(next(&mut iter)?, op::OP_IF)?;

        expect_op(next(&mut iter)?, op::OP_SHA256)?;
        let h_user: Hash32 = expect_push(next(&mut iter)?)?;
        expect_op(next(&mut iter)?, op::OP_EQUALVERIFY)?;

        expect_op(next(&mut iter)?, op::OP_SHA256)?;
        let h_lp1: Hash32 = expect_push(next(&mut iter)?)?;
        expect_op(next(&mut iter)?, op::OP_EQUALVERIFY)?;

        expect_op(next(&mut iter)?, op::OP_SHA256)?;
        let h_lp2: Hash32 = expect_push(next(&mut iter)?)?;
        expect_op(next(&mut iter)?, op::OP_EQUALVERIFY)?;

        let recipient_pubkey: [u8; 33] = expect_push(next(&mut iter)?)?;
        expect_op(next(&mut iter)?, op::OP_CHECKSIG)?;

        expect_op(next(&mut iter)?, op::OP_ELSE)?;
        let timelock = parse_script_num(next(&mut iter)?)?;
        anyhow::ensure!(
            (0..=u32::MAX as i64).contains(&timelock),
            "timelock out of range: {timelock}"
        );
        expect_op(next(&mut iter)?, op::OP_CLTV)?;
        expect_op(next(&mut iter)?, op::OP_DROP)?;

        let refund_pubkey: [u8; 33] = expect_push(next(&mut iter)?)?;
        expect_op(next(&mut iter)?, op::OP_CHECKSIG)?;
        expect_op(next(&mut iter)?, op::OP_ENDIF)?;

        anyhow::ensure!(iter.next().is_none(), "trailing instructions in redeem script");

        Ok(Self {
            hashlocks: Hashlocks { h_user, h_lp1, h_lp2 },
            recipient_pubkey,
            refund_pubkey,
            timelock_height: timelock as u32,
        })
    }
}

fn next<'a>(
    iter: &mut impl Iterator<Item = std::result::Result<Instruction<'a>, bitcoin::script::Error>>,
) -> Result<Instruction<'a>> {
    iter.next()
        .transpose()
        .map_err(|e| anyhow::anyhow!("decode script instruction: {e}"))?
        .context("unexpected end of redeem script")
}

fn expect_op(actual: Instruction<'_>, expected: bitcoin::Opcode) -> Result<()> {
    match actual {
        Instruction::Op(o) if o == expected => Ok(()),
        other => anyhow::bail!("expected {expected:?}, got {other:?}"),
    }
}

fn expect_push<const N: usize>(actual: Instruction<'_>) -> Result<[u8; N]> {
    match actual {
        Instruction::PushBytes(bytes) if bytes.len() == N => {
            let mut out = [0u8; N];
            out.copy_from_slice(bytes.as_bytes());
            Ok(out)
        }
        other => anyhow::bail!("expected {N}-byte push, got {other:?}"),
    }
}

fn parse_script_num(actual: Instruction<'_>) -> Result<i64> {
    match actual {
        Instruction::PushBytes(bytes) => decode_script_num(bytes.as_bytes()),
        Instruction::Op(o) => {
            let code = o.to_u8();
            let one = op::OP_PUSHNUM_1.to_u8();
            let sixteen = op::OP_PUSHNUM_16.to_u8();
            if (one..=sixteen).contains(&code) {
                return Ok((code - one + 1) as i64);
            }
            anyhow::bail!("expected script number, got {o:?}");
        }
    }
}

fn decode_script_num(bytes: &[u8]) -> Result<i64> {
    if bytes.is_empty() {
        return Ok(0);
    }
    anyhow::ensure!(bytes.len() <= 8, "script number too large: {} bytes", bytes.len());

    let mut magnitude = bytes.to_vec();
    let negative = magnitude.last().is_some_and(|b| (b & 0x80) != 0);
    if let Some(last) = magnitude.last_mut() {
        *last &= 0x7f;
    }
    let mut value: i64 = 0;
    for (i, b) in magnitude.iter().enumerate() {
        value |= (*b as i64) << (8 * i);
    }
    Ok(if negative { -value } else { value })
}

/// How a spend of a watched HTLC outpoint resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpendKind {
    /// Claim path: the three preimages, in protocol order.
    Claim {
        s_user: Hash32,
        s_lp1: Hash32,
        s_lp2: Hash32,
    },
    Refund,
}

/// Classify a spend witness against a known redeem script.
///
/// Returns `None` for witnesses that spend some other script or are
/// malformed; the watcher treats those as foreign spends.
pub fn classify_witness(witness: &[Vec<u8>], redeem_script: &Script) -> Option<SpendKind> {
    let script = witness.last()?;
    if script.as_slice() != redeem_script.as_bytes() {
        return None;
    }

    match witness.len() {
        // [sig, S_lp2, S_lp1, S_user, 0x01, script]
        6 if witness[4].as_slice() == [0x01] => {
            let s_lp2: Hash32 = witness[1].as_slice().try_into().ok()?;
            let s_lp1: Hash32 = witness[2].as_slice().try_into().ok()?;
            let s_user: Hash32 = witness[3].as_slice().try_into().ok()?;
            Some(SpendKind::Claim { s_user, s_lp1, s_lp2 })
        }
        // [sig, <empty>, script]
        3 if witness[1].is_empty() => Some(SpendKind::Refund),
        _ => None,
    }
}

/// Verify extracted preimages against the script's hashlocks.
pub fn verify_claim_secrets(
    locks: &Hashlocks,
    s_user: &Hash32,
    s_lp1: &Hash32,
    s_lp2: &Hash32,
) -> bool {
    sha256(s_user) == locks.h_user && sha256(s_lp1) == locks.h_lp1 && sha256(s_lp2) == locks.h_lp2
}

/// The funding output an HTLC spend consumes.
#[derive(Debug, Clone)]
pub struct Htlc3sFunding {
    pub txid: Txid,
    pub vout: u32,
    pub amount_sats: u64,
}

/// Build and sign the claim transaction sweeping the HTLC with the three
/// preimages. Single input, single output to `payout` minus `fee_sats`.
pub fn claim_tx(
    spec: &Htlc3sSpec,
    funding: &Htlc3sFunding,
    payout: &Address,
    claim_key: &SecretKey,
    s_user: Hash32,
    s_lp1: Hash32,
    s_lp2: Hash32,
    fee_sats: u64,
) -> Result<Transaction> {
    anyhow::ensure!(
        verify_claim_secrets(&spec.hashlocks, &s_user, &s_lp1, &s_lp2),
        "preimages do not match the script hashlocks"
    );

    let redeem_script = spec.redeem_script();
    let mut tx = spend_skeleton(funding, payout, fee_sats, Sequence::MAX, LockTime::ZERO)?;

    let secp = Secp256k1::new();
    check_signer_is(&secp, claim_key, &spec.recipient_pubkey)
        .context("claim key does not match recipient pubkey")?;
    let sig = segwit_v0_sign(&secp, &tx, &redeem_script, funding.amount_sats, claim_key)
        .context("sign claim input")?;

    let selector = [0x01u8];
    tx.input[0].witness = Witness::from_slice(&[
        sig.as_slice(),
        s_lp2.as_slice(),
        s_lp1.as_slice(),
        s_user.as_slice(),
        selector.as_slice(),
        redeem_script.as_bytes(),
    ]);
    Ok(tx)
}

/// Build and sign the refund transaction for an expired HTLC.
pub fn refund_tx(
    spec: &Htlc3sSpec,
    funding: &Htlc3sFunding,
    refund_to: &Address,
    refund_key: &SecretKey,
    fee_sats: u64,
) -> Result<Transaction> {
    let redeem_script = spec.redeem_script();
    let lock_time = LockTime::from_height(spec.timelock_height)
        .context("timelock height is not a valid locktime")?;
    let mut tx = spend_skeleton(
        funding,
        refund_to,
        fee_sats,
        Sequence::ENABLE_LOCKTIME_NO_RBF,
        lock_time,
    )?;

    let secp = Secp256k1::new();
    check_signer_is(&secp, refund_key, &spec.refund_pubkey)
        .context("refund key does not match refund pubkey")?;
    let sig = segwit_v0_sign(&secp, &tx, &redeem_script, funding.amount_sats, refund_key)
        .context("sign refund input")?;

    let empty: [u8; 0] = [];
    tx.input[0].witness =
        Witness::from_slice(&[sig.as_slice(), empty.as_slice(), redeem_script.as_bytes()]);
    Ok(tx)
}

const DUST_SATS: u64 = 546;

fn spend_skeleton(
    funding: &Htlc3sFunding,
    destination: &Address,
    fee_sats: u64,
    sequence: Sequence,
    lock_time: LockTime,
) -> Result<Transaction> {
    let out_value = funding
        .amount_sats
        .checked_sub(fee_sats)
        .context("fee exceeds HTLC value")?;
    anyhow::ensure!(out_value > DUST_SATS, "spend output {out_value} sats is below dust");

    Ok(Transaction {
        version: Version::TWO,
        lock_time,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: funding.txid,
                vout: funding.vout,
            },
            script_sig: ScriptBuf::new(),
            sequence,
            witness: Witness::default(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(out_value),
            script_pubkey: destination.script_pubkey(),
        }],
    })
}

fn segwit_v0_sign(
    secp: &Secp256k1<All>,
    tx: &Transaction,
    witness_script: &Script,
    value_sats: u64,
    key: &SecretKey,
) -> Result<Vec<u8>> {
    let mut cache = SighashCache::new(tx);
    let sighash = cache
        .p2wsh_signature_hash(
            0,
            witness_script,
            Amount::from_sat(value_sats),
            EcdsaSighashType::All,
        )
        .context("compute p2wsh sighash")?;

    let msg = Message::from_digest(sighash.to_byte_array().into());
    let sig = secp.sign_ecdsa(&msg, key);
    let mut bytes = sig.serialize_der().to_vec();
    bytes.push(EcdsaSighashType::All.to_u32() as u8);
    Ok(bytes)
}

fn check_signer_is(secp: &Secp256k1<All>, key: &SecretKey, expected: &[u8; 33]) -> Result<()> {
    let pubkey = PublicKey::from_secret_key(secp, key).serialize();
    anyhow::ensure!(&pubkey == expected, "signing key mismatch");
    Ok(())
}

/// Hex-decode a `txinwitness` array as delivered by the chain daemon.
pub fn witness_from_hex(items: &[String]) -> Result<Vec<Vec<u8>>> {
    items
        .iter()
        .map(|w| hex::decode(w).with_context(|| format!("decode witness item {w:?}")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap::generate_secret;

    fn sample_spec() -> (Htlc3sSpec, [Hash32; 3]) {
        let (s_user, h_user) = generate_secret();
        let (s_lp1, h_lp1) = generate_secret();
        let (s_lp2, h_lp2) = generate_secret();
        let spec = Htlc3sSpec {
            hashlocks: Hashlocks { h_user, h_lp1, h_lp2 },
            recipient_pubkey: [0x02; 33],
            refund_pubkey: [0x03; 33],
            timelock_height: 265_432,
        };
        (spec, [s_user, s_lp1, s_lp2])
    }

    #[test]
    fn redeem_script_round_trips() {
        let (spec, _) = sample_spec();
        let script = spec.redeem_script();
        let parsed = Htlc3sSpec::parse_redeem_script(&script).unwrap();
        assert_eq!(parsed, spec);
    }

    #[test]
    fn parse_rejects_foreign_script() {
        let foreign = Builder::new()
            .push_opcode(op::OP_DUP)
            .push_opcode(op::OP_HASH160)
            .push_slice([0u8; 20])
            .push_opcode(op::OP_EQUALVERIFY)
            .push_opcode(op::OP_CHECKSIG)
            .into_script();
        assert!(Htlc3sSpec::parse_redeem_script(&foreign).is_err());
    }

    #[test]
    fn claim_witness_classifies_and_extracts() {
        let (spec, [s_user, s_lp1, s_lp2]) = sample_spec();
        let script = spec.redeem_script();
        let witness = vec![
            vec![0x30, 0x44, 0x01], // placeholder signature
            s_lp2.to_vec(),
            s_lp1.to_vec(),
            s_user.to_vec(),
            vec![0x01],
            script.to_bytes(),
        ];

        match classify_witness(&witness, &script) {
            Some(SpendKind::Claim { s_user: u, s_lp1: l1, s_lp2: l2 }) => {
                assert!(verify_claim_secrets(&spec.hashlocks, &u, &l1, &l2));
            }
            other => panic!("expected claim, got {other:?}"),
        }
    }

    #[test]
    fn refund_witness_classifies() {
        let (spec, _) = sample_spec();
        let script = spec.redeem_script();
        let witness = vec![vec![0x30, 0x44], vec![], script.to_bytes()];
        assert_eq!(classify_witness(&witness, &script), Some(SpendKind::Refund));
    }

    #[test]
    fn witness_for_other_script_is_foreign() {
        let (spec, _) = sample_spec();
        let (other, _) = sample_spec();
        let witness = vec![vec![0x30], vec![], other.redeem_script().to_bytes()];
        assert_eq!(classify_witness(&witness, &spec.redeem_script()), None);
    }

    #[test]
    fn short_or_misshapen_witness_is_foreign() {
        let (spec, _) = sample_spec();
        let script = spec.redeem_script();
        assert_eq!(classify_witness(&[], &script), None);
        // Claim shape but 31-byte secret.
        let witness = vec![
            vec![0x30],
            vec![0u8; 31],
            vec![0u8; 32],
            vec![0u8; 32],
            vec![0x01],
            script.to_bytes(),
        ];
        assert_eq!(classify_witness(&witness, &script), None);
    }

    #[test]
    fn claim_tx_carries_secrets_in_witness() {
        let (spec, [s_user, s_lp1, s_lp2]) = sample_spec();
        let secp = Secp256k1::new();
        let key = SecretKey::from_slice(&[0x11; 32]).unwrap();
        let spec = Htlc3sSpec {
            recipient_pubkey: PublicKey::from_secret_key(&secp, &key).serialize(),
            ..spec
        };

        let funding = Htlc3sFunding {
            txid: "1111111111111111111111111111111111111111111111111111111111111111"
                .parse()
                .unwrap(),
            vout: 0,
            amount_sats: 100_000,
        };
        let payout = Address::p2wsh(
            Script::from_bytes(&[0x51]),
            Network::Regtest,
        );

        let tx = claim_tx(
            &spec, &funding, &payout, &key, s_user, s_lp1, s_lp2, 1_000,
        )
        .unwrap();

        assert_eq!(tx.output[0].value, Amount::from_sat(99_000));
        let witness: Vec<Vec<u8>> = tx.input[0].witness.iter().map(|w| w.to_vec()).collect();
        match classify_witness(&witness, &spec.redeem_script()) {
            Some(SpendKind::Claim { s_user: u, .. }) => assert_eq!(u, s_user),
            other => panic!("expected claim witness, got {other:?}"),
        }
    }

    #[test]
    fn refund_tx_sets_locktime() {
        let (spec, _) = sample_spec();
        let secp = Secp256k1::new();
        let key = SecretKey::from_slice(&[0x22; 32]).unwrap();
        let spec = Htlc3sSpec {
            refund_pubkey: PublicKey::from_secret_key(&secp, &key).serialize(),
            ..spec
        };

        let funding = Htlc3sFunding {
            txid: "2222222222222222222222222222222222222222222222222222222222222222"
                .parse()
                .unwrap(),
            vout: 1,
            amount_sats: 50_000,
        };
        let refund_to = Address::p2wsh(Script::from_bytes(&[0x51]), Network::Regtest);

        let tx = refund_tx(&spec, &funding, &refund_to, &key, 500).unwrap();
        assert_eq!(tx.lock_time, LockTime::from_height(spec.timelock_height).unwrap());
        assert_eq!(tx.input[0].sequence, Sequence::ENABLE_LOCKTIME_NO_RBF);
        let witness: Vec<Vec<u8>> = tx.input[0].witness.iter().map(|w| w.to_vec()).collect();
        assert_eq!(classify_witness(&witness, &spec.redeem_script()), Some(SpendKind::Refund));
    }

    #[test]
    fn fee_floor_is_enforced() {
        let (spec, [s_user, s_lp1, s_lp2]) = sample_spec();
        let key = SecretKey::from_slice(&[0x11; 32]).unwrap();
        let funding = Htlc3sFunding {
            txid: "1111111111111111111111111111111111111111111111111111111111111111"
                .parse()
                .unwrap(),
            vout: 0,
            amount_sats: 1_000,
        };
        let payout = Address::p2wsh(Script::from_bytes(&[0x51]), Network::Regtest);
        assert!(claim_tx(&spec, &funding, &payout, &key, s_user, s_lp1, s_lp2, 900).is_err());
    }
}
