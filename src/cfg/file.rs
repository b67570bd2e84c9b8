//! Simple file-backed Cfg provider
//!
//! Persists the entire keyspace as one JSON document under the node's data
//! directory (`<dataDir>/<baseName>.cfg`). Suitable for single-node
//! deployments and development; clustered deployments use an external
//! provider behind the same Cfg trait.

use super::{Cfg, CfgEvent, CfgMem};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::info;

/// A Cfg that mirrors a CfgMem to a single JSON file after every mutation.
pub struct CfgFile {
    path: PathBuf,
    mem: CfgMem,
    save_lock: Mutex<()>,
}

impl CfgFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mem: CfgMem::new(),
            save_lock: Mutex::new(()),
        }
    }

    /// The conventional cfg path for a node: `<dataDir>/<baseName>.cfg`.
    pub fn cfg_path(data_dir: &Path, base_name: &str) -> PathBuf {
        data_dir.join(format!("{base_name}.cfg"))
    }

    /// Loads previously persisted state, replacing any in-memory entries and
    /// firing change events for every loaded key.
    pub fn load(&self) -> Result<()> {
        let buf = std::fs::read(&self.path)?;
        let entries: HashMap<String, serde_json::Value> = serde_json::from_slice(&buf)?;
        let decoded = entries
            .into_iter()
            .map(|(k, v)| {
                let bytes = match v {
                    serde_json::Value::String(s) => s.into_bytes(),
                    other => other.to_string().into_bytes(),
                };
                (k, bytes)
            })
            .collect();
        self.mem.load_snapshot(decoded);
        info!(path = %self.path.display(), "cfg: loaded");
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let _guard = self.save_lock.lock();
        let snapshot = self.mem.snapshot();
        let entries: HashMap<String, serde_json::Value> = snapshot
            .into_iter()
            .map(|(k, v)| {
                (
                    k,
                    serde_json::Value::String(String::from_utf8_lossy(&v).into_owned()),
                )
            })
            .collect();
        let buf = serde_json::to_vec_pretty(&entries)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, buf)?;
        Ok(())
    }
}

#[async_trait]
impl Cfg for CfgFile {
    async fn get(&self, key: &str, cas: u64) -> Result<Option<(Vec<u8>, u64)>> {
        self.mem.get(key, cas).await
    }

    async fn set(&self, key: &str, val: &[u8], cas: u64) -> Result<u64> {
        let new_cas = self.mem.set(key, val, cas).await?;
        self.save()?;
        Ok(new_cas)
    }

    async fn del(&self, key: &str, cas: u64) -> Result<()> {
        self.mem.del(key, cas).await?;
        self.save()?;
        Ok(())
    }

    fn subscribe(&self, key: &str, sender: mpsc::Sender<CfgEvent>) -> Result<()> {
        self.mem.subscribe(key, sender)
    }
}
