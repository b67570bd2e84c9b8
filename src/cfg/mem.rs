//! In-memory Cfg provider for development, testing, and single-node use

use super::{Cfg, CfgEvent, CAS_ANY, CAS_FORCE};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone)]
struct CfgMemEntry {
    val: Vec<u8>,
    cas: u64,
}

/// An in-memory Cfg with a single process-wide cas counter.
///
/// Multiple Manager instances can share one CfgMem to simulate a cluster of
/// nodes inside a single test process.
pub struct CfgMem {
    inner: Mutex<CfgMemInner>,
    subscriptions: Mutex<HashMap<String, Vec<mpsc::Sender<CfgEvent>>>>,
}

struct CfgMemInner {
    entries: HashMap<String, CfgMemEntry>,
    next_cas: u64,
}

impl CfgMem {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CfgMemInner {
                entries: HashMap::new(),
                next_cas: 1,
            }),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Re-fires a change event for every stored key, as if each had just
    /// been written. Used after bulk-loading state from elsewhere.
    pub fn refresh(&self) {
        let keys: Vec<String> = {
            let inner = self.inner.lock();
            inner.entries.keys().cloned().collect()
        };
        for key in keys {
            self.fire_event(&key);
        }
    }

    /// Snapshot of every key and value, for persistence by wrapping
    /// providers.
    pub(crate) fn snapshot(&self) -> HashMap<String, Vec<u8>> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.val.clone()))
            .collect()
    }

    /// Replaces the whole keyspace, resetting cas numbering past the loaded
    /// entries.
    pub(crate) fn load_snapshot(&self, entries: HashMap<String, Vec<u8>>) {
        {
            let mut inner = self.inner.lock();
            inner.entries.clear();
            let mut cas = 0;
            for (key, val) in entries {
                cas += 1;
                inner.entries.insert(key, CfgMemEntry { val, cas });
            }
            inner.next_cas = cas + 1;
        }
        self.refresh();
    }

    fn fire_event(&self, key: &str) {
        let mut subs = self.subscriptions.lock();
        if let Some(senders) = subs.get_mut(key) {
            // Best-effort delivery; drop events for full or closed channels.
            senders.retain(|tx| match tx.try_send(CfgEvent { key: key.to_string() }) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
    }
}

impl Default for CfgMem {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Cfg for CfgMem {
    async fn get(&self, key: &str, cas: u64) -> Result<Option<(Vec<u8>, u64)>> {
        let inner = self.inner.lock();
        match inner.entries.get(key) {
            None => Ok(None),
            Some(entry) => {
                if cas != CAS_ANY && cas != entry.cas {
                    return Err(Error::CasMismatch {
                        expected: cas,
                        actual: entry.cas,
                    });
                }
                Ok(Some((entry.val.clone(), entry.cas)))
            }
        }
    }

    async fn set(&self, key: &str, val: &[u8], cas: u64) -> Result<u64> {
        let new_cas = {
            let mut inner = self.inner.lock();
            match inner.entries.get(key) {
                Some(entry) => {
                    // An existing key demands a matching cas; CAS_ANY is
                    // create-only and CAS_FORCE overrides.
                    if cas != CAS_FORCE && cas != entry.cas {
                        return Err(Error::CasMismatch {
                            expected: cas,
                            actual: entry.cas,
                        });
                    }
                }
                None => {
                    if cas != CAS_ANY && cas != CAS_FORCE {
                        return Err(Error::CasMismatch {
                            expected: cas,
                            actual: 0,
                        });
                    }
                }
            }
            let new_cas = inner.next_cas;
            inner.next_cas += 1;
            inner.entries.insert(
                key.to_string(),
                CfgMemEntry {
                    val: val.to_vec(),
                    cas: new_cas,
                },
            );
            new_cas
        };
        debug!(key, cas = new_cas, "cfg: set");
        self.fire_event(key);
        Ok(new_cas)
    }

    async fn del(&self, key: &str, cas: u64) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if let Some(entry) = inner.entries.get(key) {
                if cas != CAS_ANY && cas != CAS_FORCE && cas != entry.cas {
                    return Err(Error::CasMismatch {
                        expected: cas,
                        actual: entry.cas,
                    });
                }
                inner.entries.remove(key);
            }
        }
        self.fire_event(key);
        Ok(())
    }

    fn subscribe(&self, key: &str, sender: mpsc::Sender<CfgEvent>) -> Result<()> {
        let mut subs = self.subscriptions.lock();
        subs.entry(key.to_string()).or_default().push(sender);
        Ok(())
    }
}
