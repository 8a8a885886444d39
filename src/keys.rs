//! LP key material. Key file formats stay deliberately minimal: one hex
//! secret key per UTXO chain plus the EVM sender account address. The key
//! directory must be mode 700 and its files 600.

use std::fs;
use std::path::Path;

use anyhow::{Context as _, Result};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};

#[derive(Clone)]
pub struct LpKeys {
    pub btc_key: SecretKey,
    pub btc_pubkey: [u8; 33],
    pub m1_key: SecretKey,
    pub m1_pubkey: [u8; 33],
    /// Node-managed account used to submit EVM transactions.
    pub evm_sender: String,
}

impl std::fmt::Debug for LpKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LpKeys")
            .field("btc_pubkey", &hex::encode(self.btc_pubkey))
            .field("m1_pubkey", &hex::encode(self.m1_pubkey))
            .field("evm_sender", &self.evm_sender)
            .finish_non_exhaustive()
    }
}

impl LpKeys {
    pub fn load(dir: &Path) -> Result<Self> {
        check_mode(dir, 0o700).with_context(|| format!("key dir {}", dir.display()))?;

        let secp = Secp256k1::new();
        let btc_key = read_secret_key(&dir.join("btc.key"))?;
        let m1_key = read_secret_key(&dir.join("m1.key"))?;

        let evm_path = dir.join("evm.addr");
        let evm_sender = fs::read_to_string(&evm_path)
            .with_context(|| format!("read {}", evm_path.display()))?
            .trim()
            .to_string();
        anyhow::ensure!(
            evm_sender.starts_with("0x") && evm_sender.len() == 42,
            "evm.addr must hold a 0x-prefixed 20-byte address"
        );

        Ok(Self {
            btc_pubkey: PublicKey::from_secret_key(&secp, &btc_key).serialize(),
            m1_pubkey: PublicKey::from_secret_key(&secp, &m1_key).serialize(),
            btc_key,
            m1_key,
            evm_sender,
        })
    }

    pub fn key_for(&self, chain: crate::swap::Chain) -> Option<&SecretKey> {
        match chain {
            crate::swap::Chain::Btc => Some(&self.btc_key),
            crate::swap::Chain::M1 => Some(&self.m1_key),
            crate::swap::Chain::Evm => None,
        }
    }

    pub fn pubkey_for(&self, chain: crate::swap::Chain) -> Option<[u8; 33]> {
        match chain {
            crate::swap::Chain::Btc => Some(self.btc_pubkey),
            crate::swap::Chain::M1 => Some(self.m1_pubkey),
            crate::swap::Chain::Evm => None,
        }
    }
}

fn read_secret_key(path: &Path) -> Result<SecretKey> {
    check_mode(path, 0o600).with_context(|| format!("key file {}", path.display()))?;
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read {}", path.display()))?;
    let bytes = hex::decode(raw.trim())
        .with_context(|| format!("decode hex in {}", path.display()))?;
    SecretKey::from_slice(&bytes)
        .with_context(|| format!("invalid secret key in {}", path.display()))
}

#[cfg(unix)]
fn check_mode(path: &Path, wanted: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt as _;
    let mode = fs::metadata(path)
        .with_context(|| format!("stat {}", path.display()))?
        .permissions()
        .mode()
        & 0o777;
    anyhow::ensure!(
        mode & !wanted == 0,
        "{} has mode {mode:o}, expected at most {wanted:o}",
        path.display()
    );
    Ok(())
}

#[cfg(not(unix))]
fn check_mode(_path: &Path, _wanted: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn load_rejects_loose_permissions_and_accepts_tight_ones() {
        use std::os::unix::fs::PermissionsExt as _;

        let dir = tempfile::tempdir().unwrap();
        let key_dir = dir.path().join("keys");
        fs::create_dir(&key_dir).unwrap();
        fs::set_permissions(&key_dir, fs::Permissions::from_mode(0o700)).unwrap();

        let write_key = |name: &str, contents: &str, mode: u32| {
            let path = key_dir.join(name);
            fs::write(&path, contents).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        };

        write_key("btc.key", &"11".repeat(32), 0o600);
        write_key("m1.key", &"22".repeat(32), 0o600);
        write_key("evm.addr", "0x036cbd53842c5426634e7929541ec2318f3dcf7e", 0o600);

        let keys = LpKeys::load(&key_dir).unwrap();
        assert_eq!(keys.btc_pubkey.len(), 33);
        assert_ne!(keys.btc_pubkey, keys.m1_pubkey);

        write_key("btc.key", &"11".repeat(32), 0o644);
        assert!(LpKeys::load(&key_dir).is_err());
    }
}
