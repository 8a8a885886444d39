//! Durable swap store: one JSON document per LP, flushed write-through on
//! every state transition under the global store mutex.
//!
//! Write policy is write-temp + fsync + rename, so a crash mid-flush leaves
//! the previous snapshot intact. Swaps live in a `BTreeMap`, which keeps the
//! serialized key order stable: serialize -> load -> serialize is
//! byte-identical.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

use super::{Swap, SwapState};

/// Snapshot schema version, bumped on incompatible layout changes.
const STORE_VERSION: u32 = 1;

/// Archive files rotate once they hold this many swaps.
const ARCHIVE_ROTATE_AT: usize = 500;

#[derive(Debug, Serialize, Deserialize)]
struct StoreDoc {
    lp_id: String,
    version: u32,
    swaps: BTreeMap<String, Swap>,
}

#[derive(Debug)]
pub struct JsonStore {
    path: PathBuf,
    doc: StoreDoc,
}

impl JsonStore {
    /// Open or create the snapshot at `path`, owned by `lp_id`.
    pub fn open(path: PathBuf, lp_id: &str) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("create store dir {}", dir.display()))?;
            }
        }

        let doc = if path.exists() {
            let raw = fs::read(&path)
                .with_context(|| format!("read store {}", path.display()))?;
            let doc: StoreDoc = serde_json::from_slice(&raw)
                .with_context(|| format!("parse store {}", path.display()))?;
            anyhow::ensure!(
                doc.version <= STORE_VERSION,
                "store {} has version {} newer than supported {}",
                path.display(),
                doc.version,
                STORE_VERSION
            );
            anyhow::ensure!(
                doc.lp_id == lp_id,
                "store {} belongs to lp {}, not {}",
                path.display(),
                doc.lp_id,
                lp_id
            );
            doc
        } else {
            StoreDoc {
                lp_id: lp_id.to_string(),
                version: STORE_VERSION,
                swaps: BTreeMap::new(),
            }
        };

        Ok(Self { path, doc })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lp_id(&self) -> &str {
        &self.doc.lp_id
    }

    pub fn get(&self, swap_id: &str) -> Option<Swap> {
        self.doc.swaps.get(swap_id).cloned()
    }

    pub fn contains(&self, swap_id: &str) -> bool {
        self.doc.swaps.contains_key(swap_id)
    }

    /// Insert or replace a swap and flush the snapshot.
    pub fn persist(&mut self, swap: &Swap) -> Result<()> {
        self.doc.swaps.insert(swap.swap_id.clone(), swap.clone());
        self.flush()
            .with_context(|| format!("flush after persisting {}", swap.swap_id))
    }

    pub fn list(&self, state: Option<SwapState>, limit: usize) -> Vec<Swap> {
        self.doc
            .swaps
            .values()
            .filter(|s| state.is_none_or(|wanted| s.state == wanted))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Non-terminal swaps to hand back to the engine for a resume scan.
    pub fn resume_candidates(&self) -> Vec<Swap> {
        self.doc
            .swaps
            .values()
            .filter(|s| !s.state.is_terminal())
            .cloned()
            .collect()
    }

    /// Move terminal swaps older than `max_age_secs` into the rotating
    /// archive. Returns how many were moved.
    pub fn archive_terminal(&mut self, max_age_secs: u64, now: u64) -> Result<usize> {
        let eligible: Vec<String> = self
            .doc
            .swaps
            .values()
            .filter(|s| {
                s.state.is_terminal()
                    && s.terminal_at
                        .is_some_and(|t| now.saturating_sub(t) >= max_age_secs)
            })
            .map(|s| s.swap_id.clone())
            .collect();

        if eligible.is_empty() {
            return Ok(0);
        }

        let mut archive = self.load_archive()?;
        for swap_id in &eligible {
            if let Some(swap) = self.doc.swaps.remove(swap_id) {
                archive.swaps.insert(swap_id.clone(), swap);
            }
        }
        self.save_archive(&archive)?;
        self.flush().context("flush after archiving")?;

        tracing::info!(count = eligible.len(), "archived terminal swaps");
        Ok(eligible.len())
    }

    fn archive_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "flowswap.json".to_string());
        name.push_str(".archive.json");
        self.path.with_file_name(name)
    }

    fn load_archive(&self) -> Result<StoreDoc> {
        let path = self.archive_path();
        if !path.exists() {
            return Ok(StoreDoc {
                lp_id: self.doc.lp_id.clone(),
                version: STORE_VERSION,
                swaps: BTreeMap::new(),
            });
        }
        let raw = fs::read(&path)
            .with_context(|| format!("read archive {}", path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("parse archive {}", path.display()))
    }

    fn save_archive(&self, archive: &StoreDoc) -> Result<()> {
        let path = self.archive_path();
        if archive.swaps.len() >= ARCHIVE_ROTATE_AT {
            // Rotate the full archive aside before starting a fresh one.
            let mut n = 1;
            let rotated = loop {
                let candidate = path.with_extension(format!("json.{n}"));
                if !candidate.exists() {
                    break candidate;
                }
                n += 1;
            };
            atomic_write(&path, archive).context("write full archive before rotation")?;
            fs::rename(&path, &rotated)
                .with_context(|| format!("rotate archive to {}", rotated.display()))?;
            let empty = StoreDoc {
                lp_id: archive.lp_id.clone(),
                version: STORE_VERSION,
                swaps: BTreeMap::new(),
            };
            return atomic_write(&path, &empty).context("start fresh archive");
        }
        atomic_write(&path, archive).context("write archive")
    }

    fn flush(&self) -> Result<()> {
        atomic_write(&self.path, &self.doc)
    }
}

fn atomic_write(path: &Path, doc: &StoreDoc) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let raw = serde_json::to_vec_pretty(doc).context("serialize store")?;
    {
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("create {}", tmp.display()))?;
        file.write_all(&raw)
            .with_context(|| format!("write {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("fsync {}", tmp.display()))?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} into place", tmp.display()))?;
    Ok(())
}
